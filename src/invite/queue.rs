// Simple FIFO queue of pending battle invitations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::identity::AgentProfile;
use crate::metrics;

/// A validated invitation waiting for a worker.
#[derive(Debug, Clone)]
pub struct InviteRequest {
    pub id: Uuid,
    /// Profile the temporary challenger is minted from.
    pub profile: AgentProfile,
    /// Showdown username to challenge (already trimmed).
    pub target: String,
    pub format: String,
    pub queued_at: DateTime<Utc>,
}

impl InviteRequest {
    pub fn new(profile: AgentProfile, target: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile,
            target: target.into(),
            format: format.into(),
            queued_at: Utc::now(),
        }
    }
}

/// Thread-safe FIFO invite queue.
#[derive(Debug, Clone, Default)]
pub struct InviteQueue {
    inner: Arc<Mutex<VecDeque<InviteRequest>>>,
}

impl InviteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<InviteRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an invite to the back of the queue.
    pub fn enqueue(&self, request: InviteRequest) {
        let mut queue = self.lock();
        queue.push_back(request);
        metrics::INVITE_QUEUE_DEPTH.set(queue.len() as i64);
    }

    /// Put an invite back at the front, ahead of everything queued after it.
    pub fn requeue_front(&self, request: InviteRequest) {
        let mut queue = self.lock();
        queue.push_front(request);
        metrics::INVITE_QUEUE_DEPTH.set(queue.len() as i64);
    }

    /// Remove and return the oldest invite.
    pub fn dequeue(&self) -> Option<InviteRequest> {
        let mut queue = self.lock();
        let result = queue.pop_front();
        metrics::INVITE_QUEUE_DEPTH.set(queue.len() as i64);
        result
    }

    pub fn peek(&self) -> Option<InviteRequest> {
        self.lock().front().cloned()
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::identity::AgentKind;

    fn request(target: &str) -> InviteRequest {
        InviteRequest::new(
            AgentProfile::new("RandAgent", AgentKind::Random),
            target,
            "gen9randombattle",
        )
    }

    #[test]
    fn test_queue_enqueue_dequeue() {
        let queue = InviteQueue::new();

        assert!(queue.is_empty());
        assert_eq!(queue.depth(), 0);
        assert!(queue.dequeue().is_none());

        queue.enqueue(request("ash"));
        queue.enqueue(request("misty"));
        assert_eq!(queue.depth(), 2);

        // FIFO: first dequeue should be ash
        assert_eq!(queue.dequeue().unwrap().target, "ash");
        assert_eq!(queue.dequeue().unwrap().target, "misty");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_peek() {
        let queue = InviteQueue::new();
        assert!(queue.peek().is_none());

        queue.enqueue(request("brock"));
        let peeked = queue.peek().unwrap();
        assert_eq!(peeked.target, "brock");
        assert_eq!(queue.depth(), 1); // Still there

        assert_eq!(queue.dequeue().unwrap().id, peeked.id);
    }

    #[test]
    fn test_requeue_front_jumps_the_line() {
        let queue = InviteQueue::new();
        queue.enqueue(request("ash"));
        queue.enqueue(request("misty"));

        let first = queue.dequeue().unwrap();
        queue.requeue_front(first);
        assert_eq!(queue.dequeue().unwrap().target, "ash");
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(request("ash").id, request("ash").id);
    }
}
