//! Health check bookkeeping.

use settings::constants::health;
use settings::ConnectionSettings;
use std::time::{Duration, SystemTime};

use crate::state::{ConnectionQuality, HealthMetrics};

/// Bucket a round-trip time.
pub fn quality_for_latency(latency: Duration) -> ConnectionQuality {
    match latency.as_millis() as u64 {
        ms if ms < health::EXCELLENT_MAX_MS => ConnectionQuality::Excellent,
        ms if ms < health::GOOD_MAX_MS => ConnectionQuality::Good,
        ms if ms < health::FAIR_MAX_MS => ConnectionQuality::Fair,
        ms if ms < health::POOR_MAX_MS => ConnectionQuality::Poor,
        _ => ConnectionQuality::Critical,
    }
}

impl HealthMetrics {
    /// Metrics after a successful check or command.
    pub fn record_success(&self, latency: Duration) -> Self {
        Self {
            latency_ms: Some(latency.as_millis() as u64),
            quality: quality_for_latency(latency),
            consecutive_failures: 0,
            is_healthy: true,
            last_checked_at: Some(SystemTime::now()),
        }
    }

    /// Metrics after a failed check or command. The last latency is kept.
    pub fn record_failure(&self) -> Self {
        Self {
            latency_ms: self.latency_ms,
            quality: ConnectionQuality::Critical,
            consecutive_failures: self.consecutive_failures.saturating_add(1),
            is_healthy: false,
            last_checked_at: Some(SystemTime::now()),
        }
    }
}

/// Check cadence and the proactive reconnect threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures that trigger a reconnect. `None` disables it.
    pub degraded_reconnect_after: Option<u32>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: health::CHECK_INTERVAL,
            timeout: health::CHECK_TIMEOUT,
            degraded_reconnect_after: None,
        }
    }
}

impl HealthPolicy {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            interval: settings.health_check_interval(),
            timeout: settings.health_check_timeout(),
            degraded_reconnect_after: settings.degraded_reconnect_after,
        }
    }

    pub fn should_reconnect(&self, metrics: &HealthMetrics) -> bool {
        self.degraded_reconnect_after
            .is_some_and(|threshold| metrics.consecutive_failures >= threshold)
    }
}
