//! ============================================================================
//! Core Types for Shelter Sync
//! ============================================================================
//! Defines the queued driver actions, the sync state surfaced to the UI and the
//! error taxonomy. Everything here serializes to JSON so the dashboard and the
//! journal can share it.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of an entity shared with the backend (e.g. "req-42")
pub type EntityId = String;

/// Sequence number assigned to a pending action at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mutating operations a driver can perform from the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Move a rescue task to a new status ("En Route", "Rescued", ...)
    UpdateStatus,
    /// Attach a photo reference to a rescue task
    UploadPhoto,
    /// Toggle the driver's availability
    UpdateAvailability,
    /// Report the driver's current coordinates
    UpdateLocation,
}

impl ActionKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "UPDATE_STATUS" => Some(Self::UpdateStatus),
            "UPLOAD_PHOTO" => Some(Self::UploadPhoto),
            "UPDATE_AVAILABILITY" => Some(Self::UpdateAvailability),
            "UPDATE_LOCATION" => Some(Self::UpdateLocation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateStatus => "UPDATE_STATUS",
            Self::UploadPhoto => "UPLOAD_PHOTO",
            Self::UpdateAvailability => "UPDATE_AVAILABILITY",
            Self::UpdateLocation => "UPDATE_LOCATION",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user action before it has been assigned a queue position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    pub kind: ActionKind,
    pub target_id: Option<EntityId>,
    /// Operation payload; also applied to the target as a merge patch
    pub payload: serde_json::Value,
}

impl NewAction {
    pub fn new(kind: ActionKind, target_id: Option<EntityId>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            target_id,
            payload,
        }
    }

    /// Mark a rescue task with a new status
    pub fn update_status(task_id: impl Into<EntityId>, status: &str) -> Self {
        Self::new(
            ActionKind::UpdateStatus,
            Some(task_id.into()),
            serde_json::json!({ "status": status }),
        )
    }

    /// Attach an already-stored photo to a rescue task
    pub fn upload_photo(task_id: impl Into<EntityId>, photo_ref: &str) -> Self {
        Self::new(
            ActionKind::UploadPhoto,
            Some(task_id.into()),
            serde_json::json!({ "photo": photo_ref }),
        )
    }

    pub fn update_availability(driver_id: impl Into<EntityId>, available: bool) -> Self {
        Self::new(
            ActionKind::UpdateAvailability,
            Some(driver_id.into()),
            serde_json::json!({ "available": available }),
        )
    }

    pub fn update_location(driver_id: impl Into<EntityId>, lat: f64, lng: f64) -> Self {
        Self::new(
            ActionKind::UpdateLocation,
            Some(driver_id.into()),
            serde_json::json!({ "location": { "lat": lat, "lng": lng } }),
        )
    }
}

/// A mutating operation waiting to be applied on the server.
/// Never mutated once queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub target_id: Option<EntityId>,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Local entity revision produced by the optimistic apply for this action
    pub version: Option<u64>,
}

impl PendingAction {
    /// Short label for notices and logs, e.g. "UPDATE_STATUS #3 on req-42"
    pub fn describe(&self) -> String {
        match &self.target_id {
            Some(target) => format!("{} {} on {}", self.kind, self.id, target),
            None => format!("{} {}", self.kind, self.id),
        }
    }
}

/// Envelope returned by every shelter API endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiResponse {
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self {
            status: ResponseStatus::Success,
            data,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Coordinator state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Draining,
    /// The head action hit a retryable failure and is waiting for backoff
    Blocked {
        action_id: ActionId,
        attempt: u32,
        retry_in_ms: u64,
        reason: String,
    },
}

impl SyncState {
    pub fn is_draining(&self) -> bool {
        matches!(self, SyncState::Draining)
    }

    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            SyncState::Blocked { retry_in_ms, .. } => Some(Duration::from_millis(*retry_in_ms)),
            _ => None,
        }
    }
}

/// Snapshot for the "N actions pending sync" indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    pub state: SyncState,
    pub pending: usize,
    pub conflicted: Vec<EntityId>,
}

/// User-visible message pushed to the notification sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncNotice {
    pub action_id: ActionId,
    pub kind: ActionKind,
    pub entity: Option<EntityId>,
    pub message: String,
}

impl fmt::Display for SyncNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(
                f,
                "Discarded {} for {}: {}",
                self.kind, entity, self.message
            ),
            None => write!(f, "Discarded {} {}: {}", self.kind, self.action_id, self.message),
        }
    }
}

/// Error types for the sync core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Too many offline changes ({capacity} pending), please reconnect")]
    QueueFull { capacity: usize },

    #[error("Action queue is empty")]
    EmptyQueue,

    #[error("Action not found in queue: {0}")]
    UnknownAction(ActionId),

    #[error("Action {0} is already being sent and cannot be discarded")]
    ActionInFlight(ActionId),

    #[error("Entity not tracked: {0}")]
    UnknownEntity(EntityId),

    #[error("No pending mutation v{version} for entity {entity}")]
    UnknownMutation { entity: EntityId, version: u64 },

    #[error("{0} requires a target entity")]
    MissingTarget(ActionKind),

    #[error("Invalid target entity id: '{0}'")]
    InvalidTarget(EntityId),

    #[error("Journal error: {0}")]
    Journal(String),
}
