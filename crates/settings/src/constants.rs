//! Centralized configuration constants for roamssh.
//!
//! Compile-time defaults for the connection core, organized by component.
//! Most of these can be overridden from `config.toml`.

/// Connection retry policy.
pub mod retry {
    use std::time::Duration;

    /// Automatic retries attempted before the user has to step in.
    pub const MAX_ATTEMPTS: u32 = 3;
    /// Upper bound for the exponential backoff multiplier (base x 4).
    pub const MAX_BACKOFF_MULTIPLIER: u32 = 4;
    /// Time allowed for opening the transport.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    /// Pause between tearing down and reopening on reconnect/retry.
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);
    /// Delay used by wait-for-network errors once connectivity is back.
    pub const NETWORK_RESTORED_DELAY: Duration = Duration::from_secs(2);

    // Base delays per failure type
    pub const NETWORK_UNREACHABLE_BASE: Duration = Duration::from_secs(5);
    pub const HOST_UNREACHABLE_BASE: Duration = Duration::from_secs(10);
    pub const TIMEOUT_BASE: Duration = Duration::from_secs(5);
    pub const PORT_CLOSED_BASE: Duration = Duration::from_secs(15);
    pub const RESOURCE_BASE: Duration = Duration::from_secs(5);
}

/// Connection health monitoring.
pub mod health {
    use std::time::Duration;

    /// Interval between keepalive checks.
    pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);
    /// A check slower than this counts as a failure.
    pub const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

    /// Latency ceilings (ms) for each quality bucket.
    pub const EXCELLENT_MAX_MS: u64 = 50;
    pub const GOOD_MAX_MS: u64 = 150;
    pub const FAIR_MAX_MS: u64 = 300;
    pub const POOR_MAX_MS: u64 = 1000;
}

/// Command block limits.
pub mod blocks {
    /// Default per-block output cap (1 MiB).
    pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
    /// Smallest output cap accepted from the config file.
    pub const MIN_OUTPUT_BYTES: usize = 4 * 1024;
    /// Finished blocks kept for display; older ones are evicted.
    pub const MAX_FINISHED_BLOCKS: usize = 200;
}

/// Event fan-out.
pub mod events {
    /// Capacity of each broadcast channel. Slow subscribers lag rather than
    /// block the session.
    pub const CHANNEL_CAPACITY: usize = 256;
}

/// SSH defaults.
pub mod ssh {
    pub const DEFAULT_PORT: u16 = 22;
}

/// Settings file validation limits.
pub mod settings {
    /// Maximum settings file size in bytes (64 KB).
    /// Settings files should be tiny; anything larger is suspicious.
    pub const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Maximum length for string fields (profile names, command names).
    pub const MAX_STRING_LENGTH: usize = 256;
}
