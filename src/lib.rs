// Course chat client library
// Reliable message delivery plus the identity resolution cascade

pub mod api;
pub mod auth;
pub mod config;
pub mod conversations;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod models;
pub mod retry;
pub mod transport;

pub use auth::{CredentialProvider, StaticCredentials};
pub use config::EngineConfig;
pub use engine::{ChatEngine, ChatEngineBuilder};
pub use error::{ChatError, Result};
pub use events::{EngineEvent, EventBus, MessageErrorEvent, MessageSentEvent};
pub use identity::{IdentityResolver, ResolutionStrategy};
pub use models::*;
pub use transport::ConnectionState;
