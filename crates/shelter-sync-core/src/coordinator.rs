//! ============================================================================
//! Sync Coordinator - drains the offline queue against the shelter API
//! ============================================================================
//! State machine: Idle -> Draining -> Idle, or Draining -> Blocked when the
//! head action hits a retryable failure.
//!
//! - Success: commit the returned entity, remove the action, continue
//! - Retryable (network, timeout, 5xx): keep the action, back off, stop
//! - Terminal (4xx, rejected envelope): roll back, discard, notify, continue
//!
//! Only one drain runs at a time; `sync_now` and the event loop share the
//! same guard. The ledger lock is never held across a network call.
//! ============================================================================

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::ledger::{InFlightMarker, Ledger};
use crate::notify::NotificationSink;
use crate::remote::{ApiRequest, RemoteApi, RemoteFailure};
use crate::retry::{delay_for, RetryConfig};
use crate::types::{ActionId, ApiResponse, PendingAction, ResponseStatus, SyncNotice, SyncState};

pub type SharedLedger = Arc<Mutex<Ledger>>;

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// Queue emptied (or was already empty)
    Drained,
    /// Head action failed retryably and waits for backoff
    Blocked { action_id: ActionId, retry_in: Duration },
    /// Another drain was running; nothing was done
    AlreadyDraining,
}

/// What a single drain pass did
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub committed: Vec<ActionId>,
    pub discarded: Vec<ActionId>,
    pub outcome: DrainOutcome,
}

impl DrainReport {
    fn new() -> Self {
        Self {
            committed: Vec::new(),
            discarded: Vec::new(),
            outcome: DrainOutcome::Drained,
        }
    }

    fn already_draining() -> Self {
        Self {
            outcome: DrainOutcome::AlreadyDraining,
            ..Self::new()
        }
    }
}

pub struct SyncCoordinator {
    ledger: SharedLedger,
    api: Arc<dyn RemoteApi>,
    sink: Arc<dyn NotificationSink>,
    retry: RetryConfig,
    request_timeout: Duration,
    state: watch::Sender<SyncState>,
    /// When the blocked head may be retried; set by whichever drain blocked
    retry_deadline: StdMutex<Option<Instant>>,
    wake: Notify,
}

/// Releases the drain claim and the in-flight head when a drain future is
/// dropped before it finishes.
struct DrainGuard<'a> {
    coordinator: &'a SyncCoordinator,
    in_flight: Option<InFlightMarker>,
    armed: bool,
}

impl<'a> DrainGuard<'a> {
    fn new(coordinator: &'a SyncCoordinator) -> Self {
        Self {
            coordinator,
            in_flight: None,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(marker) = &self.in_flight {
            marker.clear();
        }
        self.coordinator.state.send_if_modified(|state| {
            if state.is_draining() {
                *state = SyncState::Idle;
                true
            } else {
                false
            }
        });
        warn!("Drain cancelled; head action stays queued");
        self.coordinator.request_sync();
    }
}

impl SyncCoordinator {
    pub fn new(
        ledger: SharedLedger,
        api: Arc<dyn RemoteApi>,
        sink: Arc<dyn NotificationSink>,
        retry: RetryConfig,
        request_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            ledger,
            api,
            sink,
            retry,
            request_timeout,
            state,
            retry_deadline: StdMutex::new(None),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Pending backoff deadline for the blocked head, if any
    pub fn retry_deadline(&self) -> Option<Instant> {
        *self.retry_deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_retry_deadline(&self, deadline: Option<Instant>) {
        *self.retry_deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Ask the event loop for a drain attempt (used when online)
    pub fn request_sync(&self) {
        self.wake.notify_one();
    }

    /// Force a drain now, even if the last known connectivity is stale
    pub async fn sync_now(&self) -> DrainReport {
        info!("Manual sync requested");
        self.drain().await
    }

    /// Claim the drain guard; false if a drain is already running
    fn begin_drain(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_draining() {
                false
            } else {
                *state = SyncState::Draining;
                true
            }
        })
    }

    /// Send queued actions in FIFO order until empty or blocked
    pub async fn drain(&self) -> DrainReport {
        if !self.begin_drain() {
            debug!("Drain already running, ignoring trigger");
            return DrainReport::already_draining();
        }
        let mut guard = DrainGuard::new(self);

        let mut report = DrainReport::new();
        loop {
            let action = {
                let mut ledger = self.ledger.lock().await;
                guard.in_flight.get_or_insert_with(|| ledger.in_flight_marker());
                match ledger.begin_send() {
                    Some(action) => action,
                    None => break,
                }
            };

            debug!("Sending {}", action.describe());
            let result = self.send(&action).await;

            let mut ledger = self.ledger.lock().await;
            match result {
                Ok(response) => {
                    self.apply_success(&mut ledger, &action, response);
                    if let Err(e) = ledger.complete_head(action.id) {
                        error!("Cannot remove confirmed {}: {}", action.describe(), e);
                        break;
                    }
                    report.committed.push(action.id);
                }
                Err(failure) if failure.kind().is_terminal() => {
                    self.apply_terminal(&mut ledger, &action, &failure);
                    if let Err(e) = ledger.complete_head(action.id) {
                        error!("Cannot remove rejected {}: {}", action.describe(), e);
                        break;
                    }
                    report.discarded.push(action.id);
                }
                Err(failure) => {
                    let attempt = ledger.defer_head();
                    let retry_in = delay_for(failure.kind(), attempt, &self.retry);
                    warn!(
                        "{} failed ({:?}, attempt {}): {}; retrying in {:?}",
                        action.describe(),
                        failure.kind(),
                        attempt + 1,
                        failure,
                        retry_in
                    );
                    guard.disarm();
                    self.set_retry_deadline(Some(Instant::now() + retry_in));
                    self.state.send_replace(SyncState::Blocked {
                        action_id: action.id,
                        attempt: attempt + 1,
                        retry_in_ms: retry_in.as_millis() as u64,
                        reason: failure.to_string(),
                    });
                    report.outcome = DrainOutcome::Blocked {
                        action_id: action.id,
                        retry_in,
                    };
                    return report;
                }
            }
        }

        guard.disarm();
        self.set_retry_deadline(None);
        self.state.send_replace(SyncState::Idle);
        if !report.committed.is_empty() || !report.discarded.is_empty() {
            info!(
                "Drain finished: {} committed, {} discarded",
                report.committed.len(),
                report.discarded.len()
            );
        }
        report
    }

    /// One network call for one action, bounded by the request timeout
    async fn send(&self, action: &PendingAction) -> Result<ApiResponse, RemoteFailure> {
        let request = ApiRequest::for_action(action)
            .map_err(|e| RemoteFailure::InvalidRequest(e.to_string()))?;

        let response = timeout(self.request_timeout, self.api.send(&request))
            .await
            .map_err(|_| RemoteFailure::Timeout(self.request_timeout))??;

        match response.status {
            ResponseStatus::Success => Ok(response),
            ResponseStatus::Error => Err(RemoteFailure::Rejected(
                response
                    .message
                    .unwrap_or_else(|| format!("{} rejected", request)),
            )),
        }
    }

    fn apply_success(&self, ledger: &mut Ledger, action: &PendingAction, response: ApiResponse) {
        let (Some(target), Some(version)) = (action.target_id.as_deref(), action.version) else {
            return;
        };

        match response.data {
            Some(server_state) => {
                let outcome = ledger.store.commit(target, server_state, version);
                debug!("Committed {}: {:?}", action.describe(), outcome);
            }
            None => match ledger.store.confirm(target, version) {
                Ok(outcome) => debug!("Confirmed {}: {:?}", action.describe(), outcome),
                Err(e) => warn!("Could not confirm {}: {}", action.describe(), e),
            },
        }
    }

    fn apply_terminal(&self, ledger: &mut Ledger, action: &PendingAction, failure: &RemoteFailure) {
        warn!("{} rejected: {}", action.describe(), failure);

        if let (Some(target), Some(version)) = (action.target_id.as_deref(), action.version) {
            if let Err(e) = ledger.store.rollback(target, version) {
                warn!("Rollback of {} skipped: {}", action.describe(), e);
            }
        }

        self.sink.notify(SyncNotice {
            action_id: action.id,
            kind: action.kind,
            entity: action.target_id.clone(),
            message: failure.to_string(),
        });
    }

    /// Event loop: drains on reconnect, on `request_sync`, and when a backoff
    /// timer expires. The timer follows `retry_deadline`, so a blocked
    /// `sync_now` is retried too. Runs until `shutdown` resolves or the
    /// connectivity sender is dropped.
    pub async fn run<S>(self: Arc<Self>, mut online: watch::Receiver<bool>, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut state = self.state.subscribe();
        info!("Sync loop started");

        loop {
            let retry_at = self.retry_deadline();
            tokio::select! {
                _ = &mut shutdown => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Reconnect drains only when no backoff timer is pending
                    if !*online.borrow_and_update() || retry_at.is_some() {
                        continue;
                    }
                    self.drain().await;
                }
                _ = self.wake.notified() => {
                    if !*online.borrow() {
                        debug!("Offline, sync request deferred until reconnect");
                        continue;
                    }
                    // A blocked head keeps its backoff; new work waits behind it
                    if retry_at.is_some() {
                        continue;
                    }
                    self.drain().await;
                }
                // Re-read the deadline after any drain, including `sync_now`
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.set_retry_deadline(None);
                    if !*online.borrow() {
                        debug!("Offline, retry deferred until reconnect");
                        continue;
                    }
                    self.drain().await;
                }
            }
        }

        info!("Sync loop stopped");
    }
}
