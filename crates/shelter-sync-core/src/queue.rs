//! ============================================================================
//! Action Queue - bounded FIFO of offline driver actions
//! ============================================================================

use chrono::Utc;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::types::{ActionId, NewAction, PendingAction, SyncError};

/// Default bound on queued actions
pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// Strictly FIFO queue of pending actions. No reordering, no coalescing.
#[derive(Debug, Clone)]
pub struct ActionQueue {
    actions: VecDeque<PendingAction>,
    next_id: u64,
    capacity: usize,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            actions: VecDeque::new(),
            next_id: 1,
            capacity,
        }
    }

    /// Rebuild a queue from journaled actions, keeping their ids
    pub fn restore(actions: Vec<PendingAction>, next_id: u64, capacity: usize) -> Self {
        let mut actions: VecDeque<PendingAction> = actions.into_iter().collect();
        actions.make_contiguous().sort_by_key(|a| a.id);
        let floor = actions.back().map(|a| a.id.0 + 1).unwrap_or(1);
        Self {
            actions,
            next_id: next_id.max(floor),
            capacity,
        }
    }

    /// Append an action to the tail and assign its id
    pub fn enqueue(&mut self, action: NewAction, version: Option<u64>) -> Result<ActionId, SyncError> {
        if self.actions.len() >= self.capacity {
            warn!(
                "Queue full ({} actions), rejecting {}",
                self.capacity, action.kind
            );
            return Err(SyncError::QueueFull {
                capacity: self.capacity,
            });
        }

        let id = ActionId(self.next_id);
        self.next_id += 1;

        debug!("Enqueued {} {} (target: {:?})", action.kind, id, action.target_id);
        self.actions.push_back(PendingAction {
            id,
            kind: action.kind,
            target_id: action.target_id,
            payload: action.payload,
            enqueued_at: Utc::now(),
            version,
        });
        Ok(id)
    }

    pub fn peek_front(&self) -> Option<&PendingAction> {
        self.actions.front()
    }

    /// Remove exactly the head action
    pub fn remove_front(&mut self) -> Result<PendingAction, SyncError> {
        self.actions.pop_front().ok_or(SyncError::EmptyQueue)
    }

    /// Remove a queued action that has not been sent yet
    pub fn discard(&mut self, id: ActionId) -> Result<PendingAction, SyncError> {
        let index = self
            .actions
            .iter()
            .position(|a| a.id == id)
            .ok_or(SyncError::UnknownAction(id))?;
        self.actions
            .remove(index)
            .ok_or(SyncError::UnknownAction(id))
    }

    /// Read-only snapshot in enqueue order
    pub fn list(&self) -> Vec<PendingAction> {
        self.actions.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;

    fn status(target: &str, status: &str) -> NewAction {
        NewAction::update_status(target, status)
    }

    #[test]
    fn test_list_preserves_enqueue_order() {
        let mut queue = ActionQueue::new();
        let targets = ["req-1", "req-2", "req-1", "req-3", "req-1"];
        let ids: Vec<ActionId> = targets
            .iter()
            .map(|t| queue.enqueue(status(t, "En Route"), None).unwrap())
            .collect();

        let listed = queue.list();
        assert_eq!(listed.len(), 5);
        assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), ids);
        assert_eq!(
            listed.iter().map(|a| a.target_id.clone().unwrap()).collect::<Vec<_>>(),
            targets.iter().map(|t| t.to_string()).collect::<Vec<_>>()
        );
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        // Snapshot does not drain
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_queue_full_rejects_and_keeps_existing() {
        let mut queue = ActionQueue::with_capacity(2);
        queue.enqueue(status("req-1", "Rescued"), None).unwrap();
        queue.enqueue(status("req-2", "Rescued"), None).unwrap();

        let err = queue.enqueue(status("req-3", "Rescued"), None).unwrap_err();
        assert_eq!(err, SyncError::QueueFull { capacity: 2 });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_front_on_empty_queue() {
        let mut queue = ActionQueue::new();
        assert!(queue.peek_front().is_none());
        assert_eq!(queue.remove_front().unwrap_err(), SyncError::EmptyQueue);
    }

    #[test]
    fn test_remove_front_takes_head_only() {
        let mut queue = ActionQueue::new();
        let first = queue.enqueue(status("req-1", "En Route"), Some(1)).unwrap();
        let second = queue
            .enqueue(NewAction::update_availability("driver-7", false), Some(1))
            .unwrap();

        assert_eq!(queue.peek_front().unwrap().id, first);
        let removed = queue.remove_front().unwrap();
        assert_eq!(removed.id, first);
        assert_eq!(removed.version, Some(1));
        assert_eq!(queue.peek_front().unwrap().id, second);
        assert_eq!(queue.peek_front().unwrap().kind, ActionKind::UpdateAvailability);
    }

    #[test]
    fn test_discard_middle_action() {
        let mut queue = ActionQueue::new();
        let a = queue.enqueue(status("req-1", "A"), None).unwrap();
        let b = queue.enqueue(status("req-2", "B"), None).unwrap();
        let c = queue.enqueue(status("req-3", "C"), None).unwrap();

        assert_eq!(queue.discard(b).unwrap().id, b);
        assert_eq!(queue.list().iter().map(|x| x.id).collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(queue.discard(b).unwrap_err(), SyncError::UnknownAction(b));
    }

    #[test]
    fn test_restore_continues_numbering() {
        let mut original = ActionQueue::new();
        original.enqueue(status("req-1", "A"), None).unwrap();
        original.enqueue(status("req-2", "B"), None).unwrap();
        original.remove_front().unwrap();

        let mut restored = ActionQueue::restore(original.list(), 1, 10);
        let id = restored.enqueue(status("req-3", "C"), None).unwrap();
        assert_eq!(id, ActionId(3));
        assert_eq!(restored.len(), 2);
    }
}
