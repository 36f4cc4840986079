// Identity resolution
// Turns a numeric id, a display name or a token claim into a canonical user id

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;

use crate::auth::{decode_claims, CredentialProvider};
use crate::conversations::ConversationSource;
use crate::error::{ChatError, Result};
use crate::models::{Conversation, CourseDetails, DirectoryUser, ResolvedUser};

pub mod cache;
pub mod claims;

pub use cache::IdentityCache;
pub use claims::{ClaimExtractor, ClaimInspector, ClaimRule};

const INSTRUCTOR_ROLE: &str = "Instructor";

/// Name-keyed user lookups offered by the backend.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Every user the caller may see.
    async fn list_users(&self) -> Result<Vec<DirectoryUser>>;

    async fn lookup_user(&self, name: &str, role: Option<&str>) -> Result<Option<DirectoryUser>>;

    async fn course_details(&self, course_id: i64) -> Result<CourseDetails>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    TokenClaim,
    DirectNumeric,
    Directory,
    LookupEndpoint,
    ConversationHistory,
    CourseInstructor,
}

impl ResolutionStrategy {
    /// The token's course mapping wins over anything looked up by name.
    pub fn token_first() -> Vec<Self> {
        vec![
            Self::TokenClaim,
            Self::DirectNumeric,
            Self::Directory,
            Self::LookupEndpoint,
            Self::ConversationHistory,
            Self::CourseInstructor,
        ]
    }

    /// Name lookups win; the token claim is only consulted once they come up empty.
    pub fn directory_first() -> Vec<Self> {
        vec![
            Self::DirectNumeric,
            Self::Directory,
            Self::LookupEndpoint,
            Self::ConversationHistory,
            Self::TokenClaim,
            Self::CourseInstructor,
        ]
    }
}

pub fn is_numeric_id(identifier: &str) -> bool {
    !identifier.is_empty() && identifier.chars().all(|c| c.is_ascii_digit())
}

pub struct IdentityResolver {
    order: Vec<ResolutionStrategy>,
    claims: ClaimInspector,
    credentials: Arc<dyn CredentialProvider>,
    directory: Arc<dyn UserDirectory>,
    conversations: Arc<dyn ConversationSource>,
    cache: TokioMutex<IdentityCache>,
    courses: TokioMutex<HashMap<i64, CourseDetails>>,
}

impl IdentityResolver {
    pub fn new(
        order: Vec<ResolutionStrategy>,
        claims: ClaimInspector,
        cache_ttl: Option<Duration>,
        credentials: Arc<dyn CredentialProvider>,
        directory: Arc<dyn UserDirectory>,
        conversations: Arc<dyn ConversationSource>,
    ) -> Self {
        Self {
            order,
            claims,
            credentials,
            directory,
            conversations,
            cache: TokioMutex::new(IdentityCache::new(cache_ttl)),
            courses: TokioMutex::new(HashMap::new()),
        }
    }

    pub fn order(&self) -> &[ResolutionStrategy] {
        &self.order
    }

    pub async fn cached(&self, identifier: &str) -> Option<ResolvedUser> {
        self.cache.lock().await.get(identifier.trim())
    }

    /// Learn users from a loaded conversation list.
    pub async fn seed_from_conversations(&self, conversations: &[Conversation]) {
        let mut cache = self.cache.lock().await;
        for conv in conversations {
            if conv.other_user_id.is_empty() || conv.other_user_name.is_empty() {
                continue;
            }
            let mut user = ResolvedUser::new(conv.other_user_id.clone(), conv.other_user_name.clone());
            user.avatar = conv.avatar.clone();
            cache.seed(&user);
        }
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
        self.courses.lock().await.clear();
    }

    pub async fn resolve(&self, identifier: &str, course_id: Option<i64>) -> Result<ResolvedUser> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(ChatError::Validation("receiver is required".into()));
        }
        debug!("Resolving user \"{}\" (course {:?})", identifier, course_id);

        if let Some(user) = self.cache.lock().await.get(identifier) {
            debug!("Cache hit for \"{}\" -> {}", identifier, user.id);
            return Ok(user);
        }

        for strategy in &self.order {
            if let Some(user) = self.attempt(*strategy, identifier, course_id).await {
                info!("Resolved \"{}\" to {} via {:?}", identifier, user.id, strategy);
                self.cache.lock().await.insert(identifier, &user);
                return Ok(user);
            }
        }

        warn!("Could not resolve user \"{}\"", identifier);
        Err(ChatError::UnresolvedIdentity {
            identifier: identifier.to_string(),
            course_id,
        })
    }

    async fn attempt(
        &self,
        strategy: ResolutionStrategy,
        identifier: &str,
        course_id: Option<i64>,
    ) -> Option<ResolvedUser> {
        match strategy {
            ResolutionStrategy::TokenClaim => self.from_token_claim(identifier, course_id?),
            ResolutionStrategy::DirectNumeric => Self::direct_numeric(identifier),
            ResolutionStrategy::Directory => self.from_directory(identifier).await,
            ResolutionStrategy::LookupEndpoint => self.from_lookup(identifier, None).await,
            ResolutionStrategy::ConversationHistory => self.from_conversations(identifier).await,
            ResolutionStrategy::CourseInstructor => {
                self.from_course_instructor(identifier, course_id?).await
            }
        }
    }

    fn from_token_claim(&self, identifier: &str, course_id: i64) -> Option<ResolvedUser> {
        let token = self.credentials.token()?;
        let claims = decode_claims(&token)?;
        let id = self.claims.instructor_for_course(&claims, course_id)?;
        Some(ResolvedUser::new(id, identifier))
    }

    fn direct_numeric(identifier: &str) -> Option<ResolvedUser> {
        if is_numeric_id(identifier) {
            Some(ResolvedUser::new(identifier, format!("User {}", identifier)))
        } else {
            None
        }
    }

    async fn from_directory(&self, name: &str) -> Option<ResolvedUser> {
        let users = match self.directory.list_users().await {
            Ok(users) => users,
            Err(e) => {
                warn!("Directory lookup failed: {}", e);
                return None;
            }
        };
        let found = match_directory_user(&users, name);
        if found.is_none() {
            debug!("No user matching \"{}\" among {} directory users", name, users.len());
        }
        found.and_then(|u| u.clone().into_resolved(name))
    }

    async fn from_lookup(&self, name: &str, role: Option<&str>) -> Option<ResolvedUser> {
        match self.directory.lookup_user(name, role).await {
            Ok(Some(user)) => user.into_resolved(name),
            Ok(None) => {
                debug!("Lookup endpoint has no user \"{}\"", name);
                None
            }
            Err(e) => {
                warn!("User lookup endpoint failed: {}", e);
                None
            }
        }
    }

    async fn from_conversations(&self, name: &str) -> Option<ResolvedUser> {
        let conversations = match self.conversations.load_conversations(false).await {
            Ok(conversations) => conversations,
            Err(e) => {
                warn!("Could not search conversations: {}", e);
                return None;
            }
        };
        let needle = name.to_lowercase();
        conversations
            .iter()
            .find(|c| !c.other_user_name.is_empty() && c.other_user_name.to_lowercase() == needle)
            .map(|c| {
                let mut user = ResolvedUser::new(c.other_user_id.clone(), c.other_user_name.clone());
                user.avatar = c.avatar.clone();
                user
            })
    }

    async fn course(&self, course_id: i64) -> Option<CourseDetails> {
        if let Some(course) = self.courses.lock().await.get(&course_id) {
            return Some(course.clone());
        }
        match self.directory.course_details(course_id).await {
            Ok(course) => {
                self.courses.lock().await.insert(course_id, course.clone());
                Some(course)
            }
            Err(e) => {
                warn!("Could not fetch course {}: {}", course_id, e);
                None
            }
        }
    }

    async fn from_course_instructor(&self, identifier: &str, course_id: i64) -> Option<ResolvedUser> {
        let course = self.course(course_id).await?;

        if let Some(id) = course.instructor_id() {
            let name = course
                .instructor_name()
                .unwrap_or_else(|| identifier.to_string());
            return Some(ResolvedUser::new(id, name));
        }

        let name = course.instructor_name()?;
        debug!("Course {} names instructor \"{}\", resolving by name", course_id, name);
        let user = match self.from_directory(&name).await {
            Some(user) => user,
            None => match self.from_lookup(&name, Some(INSTRUCTOR_ROLE)).await {
                Some(user) => user,
                None => self.from_conversations(&name).await?,
            },
        };
        self.cache.lock().await.insert(&name, &user);
        Some(user)
    }
}

fn lowered(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// Exact case-insensitive match on full name, username or display name, then
/// containment in either direction.
pub fn match_directory_user<'a>(users: &'a [DirectoryUser], name: &str) -> Option<&'a DirectoryUser> {
    let needle = name.trim().to_lowercase();
    let names = |u: &DirectoryUser| -> Vec<String> {
        [&u.full_name, &u.user_name, &u.name]
            .into_iter()
            .filter_map(lowered)
            .collect()
    };

    users
        .iter()
        .find(|u| names(*u).iter().any(|n| *n == needle))
        .or_else(|| {
            users.iter().find(|u| {
                names(*u)
                    .iter()
                    .any(|n| n.contains(&needle) || needle.contains(n.as_str()))
            })
        })
}
