//! ============================================================================
//! Notification Sink - user-visible sync errors
//! ============================================================================
//! The coordinator pushes one `SyncNotice` per discarded action. The dashboard
//! renders them as dismissible toasts; the CLI prints them.
//! ============================================================================

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::SyncNotice;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: SyncNotice);
}

/// Forward notices to an async consumer
impl NotificationSink for mpsc::UnboundedSender<SyncNotice> {
    fn notify(&self, notice: SyncNotice) {
        if self.send(notice).is_err() {
            debug!("Notice dropped: receiver closed");
        }
    }
}

/// Sink that only logs; used when no UI is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notice: SyncNotice) {
        warn!("{}", notice);
    }
}
