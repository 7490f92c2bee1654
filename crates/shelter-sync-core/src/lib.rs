//! ============================================================================
//! SHELTER-SYNC-CORE: Offline action queue for the driver dashboard
//! ============================================================================
//! Lets drivers keep working through dead zones:
//! - Connectivity monitoring with debounced online/offline transitions
//! - Optimistic entity state (JSON merge patches) with commit and rollback
//! - FIFO action queue drained against the shelter REST API on reconnect
//! - Exponential backoff for transient failures, rollback + notice for rejects
//! - Optional redb journal so pending actions survive a restart
//! ============================================================================

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod db;
pub mod ledger;
pub mod notify;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod session;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use coordinator::{DrainOutcome, DrainReport, SyncCoordinator};
pub use db::{JournalStats, LedgerSnapshot, QueueJournal};
pub use ledger::Ledger;
pub use notify::{LogSink, NotificationSink};
pub use queue::ActionQueue;
pub use remote::{ApiRequest, HttpRemoteApi, RemoteApi, RemoteFailure};
pub use retry::{FailureKind, RetryConfig};
pub use session::SyncSession;
pub use store::{CommitOutcome, EntityState, OptimisticStateStore, TrackedEntity};
