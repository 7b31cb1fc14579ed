//! Network connectivity observation.

use serde::Serialize;
use tokio::sync::watch;

use crate::state::ConnectionQuality;

/// Device connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub connected: bool,
    pub quality: ConnectionQuality,
}

impl NetworkState {
    pub fn online() -> Self {
        Self {
            connected: true,
            quality: ConnectionQuality::Unknown,
        }
    }

    pub fn offline() -> Self {
        Self {
            connected: false,
            quality: ConnectionQuality::Unknown,
        }
    }
}

/// Source of connectivity state.
pub trait NetworkObserver: Send + Sync + 'static {
    fn current(&self) -> NetworkState;

    /// Receiver that sees every later state change.
    fn subscribe(&self) -> watch::Receiver<NetworkState>;
}

/// [`NetworkObserver`] whose state is pushed in by the platform layer.
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkState>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new state. Repeating the current state wakes nobody.
    pub fn set(&self, state: NetworkState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::info!(
                connected = state.connected,
                quality = %state.quality,
                "Network state changed"
            );
        }
    }

    pub fn set_connected(&self, connected: bool) {
        let quality = self.tx.borrow().quality;
        self.set(NetworkState { connected, quality });
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkState::online())
    }
}

impl NetworkObserver for NetworkMonitor {
    fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}
