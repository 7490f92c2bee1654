//! ============================================================================
//! Sync Session - the handle the dashboard talks to
//! ============================================================================
//! Wires the connectivity monitor, the ledger and the coordinator together:
//! - `submit` applies a driver action optimistically and queues it
//! - `set_online` feeds runtime network events
//! - `spawn` starts the background loop that drains on reconnect
//! ============================================================================

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::{DrainReport, SharedLedger, SyncCoordinator};
use crate::db::QueueJournal;
use crate::ledger::Ledger;
use crate::notify::NotificationSink;
use crate::remote::RemoteApi;
use crate::store::{EntityState, TrackedEntity};
use crate::types::{ActionId, NewAction, PendingAction, SyncError, SyncStatus};

pub struct SyncSession {
    ledger: SharedLedger,
    connectivity: Arc<ConnectivityMonitor>,
    coordinator: Arc<SyncCoordinator>,
}

impl SyncSession {
    /// In-memory session; pending actions are lost when it is dropped
    pub fn new(
        config: &SyncConfig,
        api: Arc<dyn RemoteApi>,
        sink: Arc<dyn NotificationSink>,
        initially_online: bool,
    ) -> Self {
        Self::with_ledger(
            Ledger::new(config.queue_capacity),
            config,
            api,
            sink,
            initially_online,
        )
    }

    /// Session backed by the queue journal at `config.db_path`
    pub fn open(
        config: &SyncConfig,
        api: Arc<dyn RemoteApi>,
        sink: Arc<dyn NotificationSink>,
        initially_online: bool,
    ) -> anyhow::Result<Self> {
        let journal = QueueJournal::open(config.db_path.as_deref())?;
        let ledger = Ledger::restore(journal, config.queue_capacity)?;
        Ok(Self::with_ledger(ledger, config, api, sink, initially_online))
    }

    pub fn with_ledger(
        ledger: Ledger,
        config: &SyncConfig,
        api: Arc<dyn RemoteApi>,
        sink: Arc<dyn NotificationSink>,
        initially_online: bool,
    ) -> Self {
        let ledger = Arc::new(Mutex::new(ledger));
        let coordinator = Arc::new(SyncCoordinator::new(
            ledger.clone(),
            api,
            sink,
            config.retry.clone(),
            config.request_timeout,
        ));

        Self {
            ledger,
            connectivity: Arc::new(ConnectivityMonitor::new(initially_online)),
            coordinator,
        }
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Feed a runtime online/offline event
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    /// Apply a driver action locally and queue it for the server.
    /// `baseline` seeds an entity the session has not seen yet.
    pub async fn submit<F>(&self, action: NewAction, baseline: F) -> Result<ActionId, SyncError>
    where
        F: FnOnce() -> EntityState + Send,
    {
        let id = self.ledger.lock().await.submit(action, baseline)?;
        if self.is_online() {
            self.coordinator.request_sync();
        }
        Ok(id)
    }

    /// Record a freshly fetched entity
    pub async fn track(&self, entity_id: &str, fetched: EntityState) {
        self.ledger.lock().await.track(entity_id, fetched);
    }

    pub async fn entity(&self, entity_id: &str) -> Option<TrackedEntity> {
        self.ledger.lock().await.store().get(entity_id).cloned()
    }

    /// What the UI should render for an entity
    pub async fn speculative(&self, entity_id: &str) -> Option<EntityState> {
        self.ledger.lock().await.store().speculative(entity_id).cloned()
    }

    pub async fn list(&self) -> Vec<PendingAction> {
        self.ledger.lock().await.queue().list()
    }

    pub async fn pending_count(&self) -> usize {
        self.ledger.lock().await.queue().len()
    }

    pub async fn discard(&self, id: ActionId) -> Result<PendingAction, SyncError> {
        self.ledger.lock().await.discard(id)
    }

    pub async fn clear_conflict(&self, entity_id: &str) -> bool {
        self.ledger.lock().await.clear_conflict(entity_id)
    }

    pub async fn status(&self) -> SyncStatus {
        let ledger = self.ledger.lock().await;
        SyncStatus {
            online: self.is_online(),
            state: self.coordinator.state(),
            pending: ledger.queue().len(),
            conflicted: ledger.store().conflicted(),
        }
    }

    /// Drain immediately regardless of the last known connectivity
    pub async fn sync_now(&self) -> DrainReport {
        self.coordinator.sync_now().await
    }

    /// Start the background sync loop; it stops when `shutdown` resolves
    pub fn spawn<S>(&self, shutdown: S) -> JoinHandle<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        info!("Starting sync loop ({:?})", self.connectivity.current());
        let online = self.connectivity.subscribe();
        tokio::spawn(self.coordinator.clone().run(online, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::scripted::{ScriptedApi, Step};
    use crate::remote::RemoteFailure;
    use crate::retry::RetryConfig;
    use crate::types::{ApiResponse, SyncNotice, SyncState};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    fn test_config(capacity: usize) -> SyncConfig {
        SyncConfig {
            queue_capacity: capacity,
            retry: RetryConfig {
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn session(
        capacity: usize,
        online: bool,
    ) -> (SyncSession, Arc<ScriptedApi>, mpsc::UnboundedReceiver<SyncNotice>) {
        let api = Arc::new(ScriptedApi::new());
        let (tx, rx) = mpsc::unbounded_channel::<SyncNotice>();
        let session = SyncSession::new(&test_config(capacity), api.clone(), Arc::new(tx), online);
        (session, api, rx)
    }

    async fn wait_until_drained(session: &SyncSession) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.pending_count().await > 0 || session.coordinator().state().is_draining() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queue did not drain");
    }

    #[tokio::test]
    async fn test_offline_submit_shows_speculative_state() {
        let (session, api, _rx) = session(500, false);
        session.track("req-42", json!({ "id": "req-42", "status": "Pending" })).await;

        session
            .submit(NewAction::update_status("req-42", "Rescued"), Value::default)
            .await
            .unwrap();

        assert_eq!(session.speculative("req-42").await.unwrap()["status"], "Rescued");
        let status = session.status().await;
        assert!(!status.online);
        assert_eq!(status.pending, 1);
        assert_eq!(status.state, SyncState::Idle);
        assert!(api.paths().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue() {
        let (session, api, _rx) = session(500, false);
        api.on(
            "/driver/tasks/req-42/status",
            Step::Respond(ApiResponse::success(Some(json!({ "id": "req-42", "status": "Rescued" })))),
        );
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = session.spawn(async {
            stop_rx.await.ok();
        });

        session
            .submit(NewAction::update_status("req-42", "Rescued"), || {
                json!({ "id": "req-42", "status": "Pending" })
            })
            .await
            .unwrap();
        session
            .submit(NewAction::update_availability("driver-7", false), Value::default)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(api.paths().is_empty());

        assert!(session.set_online(true));
        wait_until_drained(&session).await;

        assert_eq!(
            api.paths(),
            vec!["/driver/tasks/req-42/status".to_string(), "/driver/availability".to_string()]
        );
        let entity = session.entity("req-42").await.unwrap();
        assert_eq!(entity.committed["status"], "Rescued");
        assert!(!entity.has_pending());

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_online_submit_is_sent_promptly() {
        let (session, api, _rx) = session(500, true);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = session.spawn(async {
            stop_rx.await.ok();
        });

        session
            .submit(NewAction::update_location("driver-7", 52.37, 4.89), Value::default)
            .await
            .unwrap();
        wait_until_drained(&session).await;

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, "/driver/location");
        assert_eq!(calls[0].body["location"]["lat"], 52.37);

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_is_reported() {
        let (session, _api, _rx) = session(2, false);
        for i in 0..2 {
            session
                .submit(NewAction::update_status(format!("req-{}", i), "Rescued"), Value::default)
                .await
                .unwrap();
        }

        let err = session
            .submit(NewAction::update_status("req-9", "Rescued"), Value::default)
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::QueueFull { capacity: 2 });
        assert!(session.entity("req-9").await.is_none());
        assert_eq!(session.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_manual_sync_while_offline_and_conflict_dismissal() {
        let (session, api, mut rx) = session(500, false);
        api.on(
            "/driver/tasks/req-42/photo",
            Step::Fail(RemoteFailure::Status {
                status: 413,
                message: "photo too large".into(),
            }),
        );
        session.track("req-42", json!({ "id": "req-42" })).await;
        session
            .submit(NewAction::upload_photo("req-42", "IMG_0042.jpg"), Value::default)
            .await
            .unwrap();

        let report = session.sync_now().await;
        assert_eq!(report.discarded.len(), 1);

        let status = session.status().await;
        assert_eq!(status.pending, 0);
        assert_eq!(status.conflicted, vec!["req-42".to_string()]);
        assert_eq!(session.speculative("req-42").await.unwrap(), json!({ "id": "req-42" }));
        assert!(rx.try_recv().unwrap().message.contains("photo too large"));

        assert!(session.clear_conflict("req-42").await);
        assert!(!session.clear_conflict("req-42").await);
        assert!(session.status().await.conflicted.is_empty());
    }

    #[tokio::test]
    async fn test_discard_pending_action() {
        let (session, api, _rx) = session(500, false);
        session.track("driver-7", json!({ "available": true })).await;
        let id = session
            .submit(NewAction::update_availability("driver-7", false), Value::default)
            .await
            .unwrap();

        let removed = session.discard(id).await.unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(session.speculative("driver-7").await.unwrap(), json!({ "available": true }));
        assert_eq!(session.discard(id).await.unwrap_err(), SyncError::UnknownAction(id));

        session.sync_now().await;
        assert!(api.paths().is_empty());
    }

    #[tokio::test]
    async fn test_journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            db_path: Some(dir.path().join("sync.redb")),
            ..test_config(500)
        };
        let api = Arc::new(ScriptedApi::new());
        let (tx, _rx) = mpsc::unbounded_channel::<SyncNotice>();
        let sink: Arc<dyn NotificationSink> = Arc::new(tx);

        let first_id = {
            let session = SyncSession::open(&config, api.clone(), sink.clone(), false).unwrap();
            session
                .submit(NewAction::update_status("req-42", "Rescued"), || json!({ "status": "Pending" }))
                .await
                .unwrap()
        };

        let session = SyncSession::open(&config, api.clone(), sink, false).unwrap();
        let pending = session.list().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first_id);
        assert_eq!(session.speculative("req-42").await.unwrap()["status"], "Rescued");

        let next = session
            .submit(NewAction::update_status("req-7", "En Route"), Value::default)
            .await
            .unwrap();
        assert!(next > first_id);

        session.sync_now().await;
        assert_eq!(session.pending_count().await, 0);
        assert_eq!(api.paths().len(), 2);
    }
}
