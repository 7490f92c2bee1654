//! ============================================================================
//! Remote Module - the shelter REST API as seen by the sync core
//! ============================================================================
//! Each action kind maps to exactly one HTTP call through a static route table.
//! The coordinator only talks to the `RemoteApi` trait, so tests can script
//! responses and the CLI plugs in the reqwest-backed `HttpRemoteApi`.
//!
//! ## Routes
//! - UPDATE_STATUS       -> PUT  /driver/tasks/{target}/status
//! - UPLOAD_PHOTO        -> POST /driver/tasks/{target}/photo
//! - UPDATE_AVAILABILITY -> PUT  /driver/availability
//! - UPDATE_LOCATION     -> PUT  /driver/location
//! ============================================================================

mod http;

#[cfg(test)]
pub(crate) mod scripted;

pub use http::HttpRemoteApi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::retry::{classify_error, classify_status, FailureKind};
use crate::types::{ActionKind, ApiResponse, PendingAction, SyncError};

/// Placeholder replaced by the action's target id
const TARGET_PLACEHOLDER: &str = "{target}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Put,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Put => f.write_str("PUT"),
            HttpMethod::Post => f.write_str("POST"),
        }
    }
}

/// One row of the action route table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub kind: ActionKind,
    pub method: HttpMethod,
    pub path: &'static str,
}

impl Route {
    pub fn needs_target(&self) -> bool {
        self.path.contains(TARGET_PLACEHOLDER)
    }
}

pub const ROUTES: [Route; 4] = [
    Route {
        kind: ActionKind::UpdateStatus,
        method: HttpMethod::Put,
        path: "/driver/tasks/{target}/status",
    },
    Route {
        kind: ActionKind::UploadPhoto,
        method: HttpMethod::Post,
        path: "/driver/tasks/{target}/photo",
    },
    Route {
        kind: ActionKind::UpdateAvailability,
        method: HttpMethod::Put,
        path: "/driver/availability",
    },
    Route {
        kind: ActionKind::UpdateLocation,
        method: HttpMethod::Put,
        path: "/driver/location",
    },
];

pub fn route_for(kind: ActionKind) -> &'static Route {
    match kind {
        ActionKind::UpdateStatus => &ROUTES[0],
        ActionKind::UploadPhoto => &ROUTES[1],
        ActionKind::UpdateAvailability => &ROUTES[2],
        ActionKind::UpdateLocation => &ROUTES[3],
    }
}

/// Network equivalent of a pending action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: serde_json::Value,
    /// Same value on every attempt of one action, so the server can drop replays
    pub idempotency_key: String,
}

impl ApiRequest {
    pub fn for_action(action: &PendingAction) -> Result<Self, SyncError> {
        let route = route_for(action.kind);
        let path = if route.needs_target() {
            let target = action
                .target_id
                .as_deref()
                .ok_or(SyncError::MissingTarget(action.kind))?;
            route
                .path
                .replace(TARGET_PLACEHOLDER, &encode_segment(target)?)
        } else {
            route.path.to_string()
        };

        Ok(Self {
            method: route.method,
            path,
            body: action.payload.clone(),
            idempotency_key: idempotency_key(action),
        })
    }
}

/// Percent-encode a target id as a single path segment.
/// Dot segments are rejected since URL normalization would collapse them.
fn encode_segment(target: &str) -> Result<String, SyncError> {
    if matches!(target, "" | "." | "..") {
        return Err(SyncError::InvalidTarget(target.to_string()));
    }
    Ok(urlencoding::encode(target).into_owned())
}

/// Enqueue time plus queue id; stable across retries and journal restores
pub fn idempotency_key(action: &PendingAction) -> String {
    format!(
        "shelter-sync-{}-{}",
        action.enqueued_at.timestamp_millis(),
        action.id.0
    )
}

impl fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Why a drained action did not reach a successful response
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteFailure {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    Malformed(String),

    #[error("Cannot build request: {0}")]
    InvalidRequest(String),
}

impl RemoteFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteFailure::Transport(message) => classify_error(message),
            RemoteFailure::Timeout(_) => FailureKind::Retryable,
            RemoteFailure::Status { status, .. } => classify_status(*status),
            RemoteFailure::Rejected(_)
            | RemoteFailure::Malformed(_)
            | RemoteFailure::InvalidRequest(_) => FailureKind::Terminal,
        }
    }
}

/// Remote side of the sync: one call per drained action
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, RemoteFailure>;
}
