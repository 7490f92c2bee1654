//! ============================================================================
//! Connectivity Monitor - online/offline transitions
//! ============================================================================
//! Tracks the runtime-reported network state and notifies listeners once per
//! real transition. Repeated events for the same state are debounced.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }
}

impl From<bool> for ConnectivityState {
    fn from(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

type Listener = Box<dyn Fn(ConnectivityState) + Send + Sync>;

/// Connectivity monitor fed by runtime online/offline events
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    listeners: Mutex<Vec<Listener>>,
}

impl ConnectivityMonitor {
    /// Create a monitor seeded with the runtime's current connectivity
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        debug!(
            "ConnectivityMonitor starting {:?}",
            ConnectivityState::from(initially_online)
        );
        Self {
            state,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn current(&self) -> ConnectivityState {
        ConnectivityState::from(self.is_online())
    }

    /// Report a runtime network event.
    /// Returns true only when the event changed the state.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if !changed {
            debug!("Ignoring duplicate {:?} event", ConnectivityState::from(online));
            return false;
        }

        let state = ConnectivityState::from(online);
        if online {
            info!("Network: ONLINE");
        } else {
            warn!("Network: OFFLINE");
        }

        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(state);
        }
        true
    }

    /// Register a callback fired exactly once per transition
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Async view of the online flag; `changed()` resolves on transitions only
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
