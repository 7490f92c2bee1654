//! ============================================================================
//! Journal Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::store::TrackedEntity;
use crate::types::PendingAction;

/// Everything needed to rebuild a ledger after a restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Next action id to hand out, so ids never repeat across restarts
    pub next_action_id: u64,
    /// Pending actions in FIFO order
    pub actions: Vec<PendingAction>,
    pub entities: Vec<TrackedEntity>,
}

/// Journal statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalStats {
    pub pending_actions: usize,
    pub tracked_entities: usize,
    pub conflicted_entities: usize,
    /// Pending actions per kind, keyed by wire name
    pub pending_by_kind: HashMap<String, usize>,
}
