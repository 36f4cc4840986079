// Identity cache, keyed by every identifier that resolved to a user

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::ResolvedUser;

#[derive(Debug)]
pub struct IdentityCache {
    entries: HashMap<String, (ResolvedUser, Instant)>,
    ttl: Option<Duration>,
}

impl IdentityCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<ResolvedUser> {
        let expired = match (self.entries.get(key), self.ttl) {
            (None, _) => return None,
            (Some((_, stored_at)), Some(ttl)) => stored_at.elapsed() >= ttl,
            (Some(_), None) => false,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|(user, _)| user.clone())
    }

    /// Store `user` under `query` and under its canonical id.
    pub fn insert(&mut self, query: &str, user: &ResolvedUser) {
        let now = Instant::now();
        self.entries
            .insert(query.to_string(), (user.clone(), now));
        if user.id != query {
            self.entries.insert(user.id.clone(), (user.clone(), now));
        }
    }

    /// Store only under the canonical id, for users learned as a side effect.
    pub fn seed(&mut self, user: &ResolvedUser) {
        self.entries
            .insert(user.id.clone(), (user.clone(), Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
