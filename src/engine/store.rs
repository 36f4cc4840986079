// Message store and in-flight set
// A message is in flight exactly while it is pending or retrying

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::models::{Message, MessageStatus};
use crate::retry::{BackoffPolicy, RetryDecision};

/// Result of recording a failed send attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Retrying { message: Message, delay: Duration },
    Failed { message: Message },
}

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: HashMap<String, Message>,
    in_flight: HashSet<String>,
    /// Submission order; `created_at` is wall-clock and can go backwards
    sequence: HashMap<String, u64>,
    next_sequence: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pending(&mut self, message: Message) -> Result<()> {
        if self.messages.contains_key(&message.id) {
            return Err(ChatError::Validation(format!(
                "message id {} already used",
                message.id
            )));
        }
        if message.status != MessageStatus::Pending {
            return Err(ChatError::Validation("new messages start as pending".into()));
        }
        self.in_flight.insert(message.id.clone());
        self.sequence.insert(message.id.clone(), self.next_sequence);
        self.next_sequence += 1;
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.contains(id)
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.in_flight.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.messages.values().cloned().collect();
        messages.sort_by_key(|m| self.sequence.get(&m.id).copied().unwrap_or(u64::MAX));
        messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.in_flight.clear();
        self.sequence.clear();
    }

    fn transition(&mut self, id: &str, next: MessageStatus) -> Option<&mut Message> {
        let message = self.messages.get_mut(id)?;
        if !message.status.can_transition_to(next) {
            debug!(
                "Ignoring {:?} -> {:?} for message {}",
                message.status, next, id
            );
            return None;
        }
        message.status = next;
        if next.is_in_flight() {
            self.in_flight.insert(id.to_string());
        } else {
            self.in_flight.remove(id);
        }
        Some(message)
    }

    /// Record the server acknowledgment. `None` if the message is unknown or already terminal.
    pub fn mark_sent(&mut self, id: &str, server_timestamp: i64) -> Option<Message> {
        let message = self.transition(id, MessageStatus::Sent)?;
        message.server_timestamp = Some(server_timestamp);
        message.last_error = None;
        info!("Message {} acknowledged at {}", id, server_timestamp);
        Some(message.clone())
    }

    /// Apply the retry policy to a failed attempt of a pending message.
    pub fn record_failure(
        &mut self,
        id: &str,
        error: &ChatError,
        policy: &BackoffPolicy,
    ) -> Option<FailureOutcome> {
        let current = self.messages.get(id)?;
        if current.status != MessageStatus::Pending {
            debug!("Failure for message {} in state {:?} ignored", id, current.status);
            return None;
        }

        match policy.decide(current.retry_count, error) {
            RetryDecision::Retry { attempt, delay } => {
                let message = self.transition(id, MessageStatus::Retrying)?;
                message.retry_count = attempt;
                message.last_error = Some(error.to_string());
                info!(
                    "Message {} failed ({}), retry {}/{} in {:?}",
                    id, error, attempt, policy.max_attempts, delay
                );
                Some(FailureOutcome::Retrying {
                    message: message.clone(),
                    delay,
                })
            }
            RetryDecision::GiveUp => {
                let message = self.transition(id, MessageStatus::Failed)?;
                message.last_error = Some(error.to_string());
                warn!(
                    "Message {} failed permanently after {} retries: {}",
                    id, message.retry_count, error
                );
                Some(FailureOutcome::Failed {
                    message: message.clone(),
                })
            }
        }
    }

    /// A backoff timer fired. Only a message still in `retrying` goes back to `pending`.
    pub fn begin_retry(&mut self, id: &str) -> Option<Message> {
        match self.messages.get(id).map(|m| m.status) {
            Some(MessageStatus::Retrying) => self
                .transition(id, MessageStatus::Pending)
                .map(|m| m.clone()),
            Some(status) => {
                debug!("Stale retry timer for message {} ({:?}), ignoring", id, status);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: max,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
        }
    }

    fn store_with(id: &str) -> MessageStore {
        let mut store = MessageStore::new();
        store
            .insert_pending(Message::new(id.into(), "42".into(), 7, "hi".into()))
            .unwrap();
        store
    }

    fn assert_invariant(store: &MessageStore, id: &str) {
        let status = store.get(id).unwrap().status;
        assert_eq!(store.is_in_flight(id), status.is_in_flight(), "status {:?}", status);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut store = store_with("m1");
        let dup = Message::new("m1".into(), "43".into(), 7, "again".into());
        assert!(matches!(store.insert_pending(dup), Err(ChatError::Validation(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ack_makes_message_terminal() {
        let mut store = store_with("m1");
        let sent = store.mark_sent("m1", 1000).unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.server_timestamp, Some(1000));
        assert_invariant(&store, "m1");

        // Terminal states never move again
        assert!(store.mark_sent("m1", 2000).is_none());
        assert!(store.begin_retry("m1").is_none());
        assert!(store
            .record_failure("m1", &ChatError::Transport("late".into()), &policy(3))
            .is_none());
        assert_eq!(store.get("m1").unwrap().server_timestamp, Some(1000));
    }

    #[test]
    fn test_retry_budget() {
        let mut store = store_with("m1");
        let p = policy(3);
        let err = ChatError::from_status(500, "boom");

        for attempt in 1..=3 {
            match store.record_failure("m1", &err, &p).unwrap() {
                FailureOutcome::Retrying { message, .. } => {
                    assert_eq!(message.retry_count, attempt);
                    assert_eq!(message.status, MessageStatus::Retrying);
                }
                other => panic!("Expected retry, got {:?}", other),
            }
            assert_invariant(&store, "m1");
            assert!(store.begin_retry("m1").is_some());
            assert_invariant(&store, "m1");
        }

        match store.record_failure("m1", &err, &p).unwrap() {
            FailureOutcome::Failed { message } => {
                assert_eq!(message.retry_count, 3);
                assert_eq!(message.last_error.as_deref(), Some("Server error HTTP 500: boom"));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert!(!store.is_in_flight("m1"));
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let mut store = store_with("m1");
        let outcome = store
            .record_failure("m1", &ChatError::from_status(400, "bad"), &policy(3))
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Failed { message } if message.retry_count == 0));
    }

    #[test]
    fn test_all_keeps_submission_order() {
        let mut store = MessageStore::new();
        for (id, created_at) in [("m3", 300), ("m1", 900), ("m2", 100)] {
            let mut message = Message::new(id.into(), "42".into(), 7, "hi".into());
            // Clock stepped back between submissions
            message.created_at = created_at;
            store.insert_pending(message).unwrap();
        }
        let ids: Vec<String> = store.all().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m3", "m1", "m2"]);
    }

    #[test]
    fn test_stale_timer_is_noop() {
        let mut store = store_with("m1");
        // Still pending, nothing scheduled
        assert!(store.begin_retry("m1").is_none());
        assert_eq!(store.get("m1").unwrap().status, MessageStatus::Pending);
        assert!(store.begin_retry("unknown").is_none());
    }
}
