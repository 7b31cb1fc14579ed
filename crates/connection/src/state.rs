//! Connection state snapshots.
//!
//! A [`ConnectionState`] is never mutated in place by callers. The controller
//! derives the next snapshot from the current one with the transition methods
//! below and publishes it wholesale.

use serde::Serialize;
use settings::Profile;
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::error::ConnectionError;

/// Identifier of a live transport session. Only present while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
    Retrying,
}

impl ConnectionStatus {
    /// A connection attempt is underway or scheduled.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Retrying | ConnectionStatus::Reconnecting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
    #[default]
    Unknown,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Critical => "critical",
            ConnectionQuality::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Result of the most recent health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub latency_ms: Option<u64>,
    pub quality: ConnectionQuality,
    pub consecutive_failures: u32,
    pub is_healthy: bool,
    pub last_checked_at: Option<SystemTime>,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            latency_ms: None,
            quality: ConnectionQuality::Unknown,
            consecutive_failures: 0,
            is_healthy: true,
            last_checked_at: None,
        }
    }
}

/// Snapshot of one logical session's connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    status: ConnectionStatus,
    profile: Option<Profile>,
    session_id: Option<SessionId>,
    error: Option<ConnectionError>,
    retry_count: u32,
    max_retries: u32,
    next_retry_at: Option<SystemTime>,
    is_auto_retrying: bool,
    health: HealthMetrics,
    progress: f32,
}

impl ConnectionState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            profile: None,
            session_id: None,
            error: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            is_auto_retrying: false,
            health: HealthMetrics::default(),
            progress: 0.0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn next_retry_at(&self) -> Option<SystemTime> {
        self.next_retry_at
    }

    pub fn is_auto_retrying(&self) -> bool {
        self.is_auto_retrying
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }

    /// Progress of the current attempt in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// A manual retry is offered when the last failure can be retried, no
    /// automatic retry is running and no attempt is in flight.
    pub fn can_retry(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.is_retryable())
            && !self.is_auto_retrying
            && !self.status.is_busy()
    }

    // Transitions. Each returns the next snapshot and keeps the invariants:
    // `session_id` is set iff connected, and connected implies retry_count == 0.

    /// Start an attempt against `profile`. Retries bump the retry counter.
    pub fn connecting(self, profile: Profile, is_retry: bool, auto: bool) -> Self {
        let retry_count = if is_retry {
            self.retry_count.saturating_add(1)
        } else {
            0
        };
        Self {
            status: ConnectionStatus::Connecting,
            profile: Some(profile),
            session_id: None,
            retry_count,
            next_retry_at: None,
            is_auto_retrying: is_retry && auto,
            progress: 0.1,
            ..self
        }
    }

    pub fn with_progress(self, progress: f32) -> Self {
        Self {
            progress: progress.clamp(0.0, 1.0),
            ..self
        }
    }

    pub fn connected(self, session_id: SessionId) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            session_id: Some(session_id),
            error: None,
            retry_count: 0,
            next_retry_at: None,
            is_auto_retrying: false,
            health: HealthMetrics::default(),
            progress: 1.0,
            ..self
        }
    }

    /// Record a classified failure. Auto-retrying stays set only while a
    /// retry is scheduled, so this clears it.
    pub fn failed(self, error: ConnectionError) -> Self {
        Self {
            status: ConnectionStatus::Error,
            session_id: None,
            error: Some(error),
            next_retry_at: None,
            is_auto_retrying: false,
            progress: 0.0,
            ..self
        }
    }

    /// A retry timer is armed and will fire at `at`. The error is kept for display.
    pub fn retrying(self, at: SystemTime) -> Self {
        Self {
            status: ConnectionStatus::Retrying,
            session_id: None,
            next_retry_at: Some(at),
            is_auto_retrying: true,
            progress: 0.0,
            ..self
        }
    }

    /// Manual reconnect in progress: the old session is being torn down.
    pub fn reconnecting(self) -> Self {
        Self {
            status: ConnectionStatus::Reconnecting,
            session_id: None,
            next_retry_at: None,
            is_auto_retrying: false,
            progress: 0.0,
            ..self
        }
    }

    /// Back to idle. The profile is kept so a later retry knows the target.
    pub fn disconnected(self) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            session_id: None,
            error: None,
            retry_count: 0,
            next_retry_at: None,
            is_auto_retrying: false,
            health: HealthMetrics::default(),
            progress: 0.0,
            ..self
        }
    }

    pub fn with_health(self, health: HealthMetrics) -> Self {
        Self { health, ..self }
    }

    /// Drop the stored error. Leaves an error state as disconnected.
    pub fn without_error(self) -> Self {
        let status = if self.status == ConnectionStatus::Error {
            ConnectionStatus::Disconnected
        } else {
            self.status
        };
        Self {
            status,
            error: None,
            ..self
        }
    }

    /// Human-readable status line.
    pub fn status_text(&self) -> String {
        let target = self
            .profile
            .as_ref()
            .map(|p| p.display_name().to_string())
            .unwrap_or_else(|| "server".to_string());

        match self.status {
            ConnectionStatus::Disconnected => "Disconnected".to_string(),
            ConnectionStatus::Connecting if self.retry_count > 0 => format!(
                "Reconnecting to {} (attempt {} of {})...",
                target, self.retry_count, self.max_retries
            ),
            ConnectionStatus::Connecting => format!("Connecting to {}...", target),
            ConnectionStatus::Connected => match self.health.quality {
                ConnectionQuality::Unknown => format!("Connected to {}", target),
                quality => format!("Connected to {} ({} connection)", target, quality),
            },
            ConnectionStatus::Error => self
                .error
                .as_ref()
                .map(|e| e.user_message().to_string())
                .unwrap_or_else(|| "Connection error".to_string()),
            ConnectionStatus::Reconnecting => format!("Reconnecting to {}...", target),
            ConnectionStatus::Retrying => {
                let remaining = self
                    .next_retry_at
                    .and_then(|at| at.duration_since(SystemTime::now()).ok())
                    .unwrap_or(Duration::ZERO);
                format!(
                    "Retrying in {}s (attempt {} of {})",
                    remaining.as_secs_f64().ceil() as u64,
                    self.retry_count + 1,
                    self.max_retries
                )
            }
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(settings::constants::retry::MAX_ATTEMPTS)
    }
}
