//! ============================================================================
//! Ledger - the per-session queue/store pair
//! ============================================================================
//! Owns the ActionQueue and the OptimisticStateStore together so a user action
//! is applied and queued in one critical section, and the coordinator never
//! observes a half-applied state. Optionally mirrors itself into the journal.
//! ============================================================================

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::db::{LedgerSnapshot, QueueJournal};
use crate::queue::ActionQueue;
use crate::store::{EntityState, OptimisticStateStore};
use crate::types::{ActionId, NewAction, PendingAction, SyncError};

/// Id of the head action awaiting a response, 0 when none.
/// Lives outside the ledger lock so a cancelled drain can release it.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlightMarker(Arc<AtomicU64>);

impl InFlightMarker {
    fn set(&self, id: ActionId) {
        self.0.store(id.0, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    fn get(&self) -> Option<ActionId> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            id => Some(ActionId(id)),
        }
    }
}

pub struct Ledger {
    pub(crate) queue: ActionQueue,
    pub(crate) store: OptimisticStateStore,
    /// Head action currently awaiting a network response
    in_flight: InFlightMarker,
    /// Consecutive retryable failures of the head action
    retry_attempt: u32,
    journal: Option<QueueJournal>,
}

impl Ledger {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ActionQueue::with_capacity(capacity),
            store: OptimisticStateStore::new(),
            in_flight: InFlightMarker::default(),
            retry_attempt: 0,
            journal: None,
        }
    }

    /// Rebuild the ledger from a journal and keep mirroring into it
    pub fn restore(journal: QueueJournal, capacity: usize) -> Result<Self> {
        let snapshot = journal.load()?;
        info!(
            "Restored {} pending actions and {} entities from {}",
            snapshot.actions.len(),
            snapshot.entities.len(),
            journal.path().display()
        );

        Ok(Self {
            queue: ActionQueue::restore(snapshot.actions, snapshot.next_action_id, capacity),
            store: OptimisticStateStore::restore(snapshot.entities),
            in_flight: InFlightMarker::default(),
            retry_attempt: 0,
            journal: Some(journal),
        })
    }

    /// Apply a user action optimistically and queue it, atomically
    pub fn submit<F>(&mut self, action: NewAction, baseline: F) -> Result<ActionId, SyncError>
    where
        F: FnOnce() -> EntityState,
    {
        // Reject before touching the store so a full queue leaves no trace
        if self.queue.len() >= self.queue.capacity() {
            return Err(SyncError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }

        let version = action
            .target_id
            .as_deref()
            .map(|target| self.store.apply_optimistic(target, action.payload.clone(), baseline));
        let id = self.queue.enqueue(action, version)?;
        self.persist();
        Ok(id)
    }

    /// Drop a queued action that has not been sent, undoing its mutation
    pub fn discard(&mut self, id: ActionId) -> Result<PendingAction, SyncError> {
        if self.in_flight.get() == Some(id) {
            return Err(SyncError::ActionInFlight(id));
        }

        let action = self.queue.discard(id)?;
        if let (Some(target), Some(version)) = (action.target_id.as_deref(), action.version) {
            if let Err(e) = self.store.forget(target, version) {
                debug!("Nothing to forget for {}: {}", action.describe(), e);
            }
        }
        info!("Discarded {}", action.describe());
        self.persist();
        Ok(action)
    }

    /// Mark the head action as in flight and return a copy of it
    pub(crate) fn begin_send(&mut self) -> Option<PendingAction> {
        let head = self.queue.peek_front()?.clone();
        self.in_flight.set(head.id);
        Some(head)
    }

    /// Remove the head after the server settled it (success or terminal)
    pub(crate) fn complete_head(&mut self, id: ActionId) -> Result<PendingAction, SyncError> {
        self.in_flight.clear();
        match self.queue.peek_front() {
            Some(head) if head.id == id => {}
            Some(head) => {
                error!("Head moved during send: expected {}, found {}", id, head.id);
                return Err(SyncError::UnknownAction(id));
            }
            None => return Err(SyncError::EmptyQueue),
        }
        let removed = self.queue.remove_front()?;
        self.retry_attempt = 0;
        self.persist();
        Ok(removed)
    }

    /// Head stays queued after a retryable failure; returns the attempt number
    pub(crate) fn defer_head(&mut self) -> u32 {
        self.in_flight.clear();
        let attempt = self.retry_attempt;
        self.retry_attempt = self.retry_attempt.saturating_add(1);
        attempt
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn store(&self) -> &OptimisticStateStore {
        &self.store
    }

    pub fn in_flight(&self) -> Option<ActionId> {
        self.in_flight.get()
    }

    pub(crate) fn in_flight_marker(&self) -> InFlightMarker {
        self.in_flight.clone()
    }

    pub fn track(&mut self, entity_id: &str, fetched: EntityState) {
        self.store.track(entity_id, fetched);
        self.persist();
    }

    pub fn clear_conflict(&mut self, entity_id: &str) -> bool {
        let cleared = self.store.clear_conflict(entity_id);
        if cleared {
            self.persist();
        }
        cleared
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut entities: Vec<_> = self.store.entities().cloned().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        LedgerSnapshot {
            next_action_id: self.queue.next_id(),
            actions: self.queue.list(),
            entities,
        }
    }

    /// Mirror into the journal; in-memory state stays authoritative on failure
    pub(crate) fn persist(&self) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.write_snapshot(&self.snapshot()) {
                error!("Failed to write queue journal: {}", e);
            }
        }
    }
}
