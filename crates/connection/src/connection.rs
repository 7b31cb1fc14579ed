//! Connection resilience for a remote shell session.
//!
//! [`ResilienceController`] supervises one logical session: it connects through
//! a [`Transport`], classifies failures into [`ConnectionError`]s, retries on a
//! timer when the failure allows it, checks health and reacts to network
//! changes reported by a [`NetworkObserver`].

mod controller;
pub mod error;
mod health;
pub mod network;
pub mod retry;
pub mod state;
pub mod transport;

pub use controller::{ConnectionEvent, ControllerConfig, ControllerError, ResilienceController};
pub use error::{classify, classify_error, ConnectionError, ErrorClass, ErrorKind, RetryStrategy};
pub use health::{quality_for_latency, HealthPolicy};
pub use network::{NetworkMonitor, NetworkObserver, NetworkState};
pub use retry::{backoff_delay, RetryDecision, RetryPolicy};
pub use state::{ConnectionQuality, ConnectionState, ConnectionStatus, HealthMetrics, SessionId};
pub use transport::{ExecChannel, ExecControl, ExecEvent, Transport, TransportHandle};
