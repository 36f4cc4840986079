// Engine configuration
// Defaults match the course backend; a JSON file and environment variables can override them

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::identity::ResolutionStrategy;

pub const DEFAULT_API_BASE: &str = "https://mazengad6-001-site1.rtempurl.com/api/Chat";
pub const DEFAULT_USER_API_BASE: &str = "https://mazengad6-001-site1.rtempurl.com/api";

/// Claim fields searched for a course -> instructor mapping, in order.
pub const DEFAULT_CLAIM_FIELDS: [&str; 6] = [
    "courses",
    "enrollments",
    "courseInstructors",
    "instructors",
    "courseData",
    "userCourses",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_base: String,
    pub user_api_base: String,
    /// WebSocket endpoint. `None` runs the request/response-only variant.
    pub stream_url: Option<String>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub resolution_order: Vec<ResolutionStrategy>,
    pub claim_fields: Vec<String>,
    /// `None` keeps identity cache entries for the whole session.
    pub identity_cache_ttl_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            user_api_base: DEFAULT_USER_API_BASE.to_string(),
            stream_url: None,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_jitter_ms: 250,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
            resolution_order: ResolutionStrategy::token_first(),
            claim_fields: DEFAULT_CLAIM_FIELDS.iter().map(|f| f.to_string()).collect(),
            identity_cache_ttl_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
        let config: EngineConfig = serde_json::from_str(&contents)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded engine configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Apply `COURSECHAT_*` environment overrides on top of this config.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(base) = env::var("COURSECHAT_API_BASE") {
            debug!("COURSECHAT_API_BASE override: {}", base);
            self.api_base = base;
        }
        if let Ok(base) = env::var("COURSECHAT_USER_API_BASE") {
            debug!("COURSECHAT_USER_API_BASE override: {}", base);
            self.user_api_base = base;
        }
        if let Ok(url) = env::var("COURSECHAT_STREAM_URL") {
            self.stream_url = if url.trim().is_empty() { None } else { Some(url) };
        }
        if let Ok(retries) = env::var("COURSECHAT_MAX_RETRIES") {
            self.max_retries = retries
                .parse()
                .map_err(|_| ChatError::Config(format!("COURSECHAT_MAX_RETRIES: {}", retries)))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base.trim().is_empty() {
            return Err(ChatError::Config("api_base is empty".into()));
        }
        if self.user_api_base.trim().is_empty() {
            return Err(ChatError::Config("user_api_base is empty".into()));
        }
        if self.connect_timeout_ms == 0 || self.ack_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ChatError::Config("timeouts must be non-zero".into()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ChatError::Config(
                "retry_base_delay_ms exceeds retry_max_delay_ms".into(),
            ));
        }
        if let Some(url) = &self.stream_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ChatError::Config(format!(
                    "stream_url must use ws:// or wss://, got {}",
                    url
                )));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn identity_cache_ttl(&self) -> Option<Duration> {
        self.identity_cache_ttl_secs.map(Duration::from_secs)
    }
}
