//! TOML config file support.
//!
//! Config location: `~/.config/roamssh/config.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;

/// A saved SSH destination.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Profile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub identity_file: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: constants::ssh::DEFAULT_PORT,
            username: None,
            identity_file: None,
        }
    }
}

/// Why a profile cannot be used to connect.
///
/// The messages are phrased so the connection error classifier maps them to
/// the client error class.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("invalid config: host is empty")]
    EmptyHost,
    #[error("invalid port: {0}")]
    InvalidPort(u16),
    #[error("missing credentials: username is required")]
    MissingUsername,
}

impl Profile {
    /// Profile for `user@host:port`.
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            username: Some(username.into()),
            ..Self::default()
        }
    }

    /// Check the fields a transport needs before any network work happens.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.host.trim().is_empty() {
            return Err(ProfileError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ProfileError::InvalidPort(self.port));
        }
        match self.username.as_deref().map(str::trim) {
            Some(user) if !user.is_empty() => Ok(()),
            _ => Err(ProfileError::MissingUsername),
        }
    }

    /// `user@host:port`, or `host:port` without a username.
    pub fn destination(&self) -> String {
        match self.username.as_deref() {
            Some(user) => format!("{}@{}:{}", user, self.host, self.port),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// Name to show in status text; falls back to the host.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }
}

/// Connection resilience policy values.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConnectionSettings {
    /// Automatic retries before the user has to retry manually.
    pub max_retry_attempts: u32,
    /// Seconds allowed for opening the transport.
    pub connect_timeout_secs: u64,
    /// Pause between disconnect and connect on reconnect/retry.
    pub reconnect_delay_ms: u64,
    /// Delay for wait-for-network errors once connectivity is back.
    pub network_restored_delay_secs: u64,
    /// Seconds between keepalive checks.
    pub health_check_interval_secs: u64,
    /// Seconds before a keepalive check counts as failed.
    pub health_check_timeout_secs: u64,
    /// Consecutive failed checks that trigger a proactive reconnect.
    /// Unset disables proactive reconnects.
    pub degraded_reconnect_after: Option<u32>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: constants::retry::MAX_ATTEMPTS,
            connect_timeout_secs: constants::retry::CONNECT_TIMEOUT.as_secs(),
            reconnect_delay_ms: constants::retry::RECONNECT_DELAY.as_millis() as u64,
            network_restored_delay_secs: constants::retry::NETWORK_RESTORED_DELAY.as_secs(),
            health_check_interval_secs: constants::health::CHECK_INTERVAL.as_secs(),
            health_check_timeout_secs: constants::health::CHECK_TIMEOUT.as_secs(),
            degraded_reconnect_after: None,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn network_restored_delay(&self) -> Duration {
        Duration::from_secs(self.network_restored_delay_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

/// Extra program names appended to the built-in command allow-lists.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct CommandSettings {
    pub one_shot: Vec<String>,
    pub continuous: Vec<String>,
    pub interactive: Vec<String>,
}

/// Command block limits.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlockSettings {
    /// Per-block output cap in bytes; older output is dropped past it.
    pub max_output_bytes: usize,
    /// Finished blocks kept around. The oldest go first.
    pub max_finished_blocks: usize,
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            max_output_bytes: constants::blocks::MAX_OUTPUT_BYTES,
            max_finished_blocks: constants::blocks::MAX_FINISHED_BLOCKS,
        }
    }
}

/// User-facing config parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub connection: ConnectionSettings,
    pub commands: CommandSettings,
    pub blocks: BlockSettings,
    /// Saved destinations.
    pub profiles: Vec<Profile>,
    /// Name of the profile used when none is requested explicitly.
    pub default_profile: Option<String>,
}

impl Config {
    /// Pick a profile by name, falling back to `default-profile`, then to the
    /// first profile in the file.
    pub fn resolve_profile(&self, name: Option<&str>) -> Option<&Profile> {
        if let Some(name) = name {
            return self.profiles.iter().find(|p| p.name == name);
        }

        if let Some(default_name) = &self.default_profile {
            if let Some(profile) = self.profiles.iter().find(|p| p.name == *default_name) {
                return Some(profile);
            }
            tracing::warn!("default-profile '{}' not found", default_name);
        }

        self.profiles.first()
    }

    /// Clamp values that would make the core misbehave and drop unusable
    /// command names.
    pub fn sanitized(mut self) -> Self {
        let min_output = constants::blocks::MIN_OUTPUT_BYTES;
        if self.blocks.max_output_bytes < min_output {
            tracing::warn!(
                "max-output-bytes {} below minimum, using {}",
                self.blocks.max_output_bytes,
                min_output
            );
            self.blocks.max_output_bytes = min_output;
        }

        if self.blocks.max_finished_blocks == 0 {
            tracing::warn!("max-finished-blocks must be positive, using 1");
            self.blocks.max_finished_blocks = 1;
        }

        if self.connection.health_check_interval_secs == 0 {
            tracing::warn!("health-check-interval-secs must be positive, using default");
            self.connection.health_check_interval_secs =
                constants::health::CHECK_INTERVAL.as_secs();
        }

        // A check has to give up before the next one is due
        let interval = self.connection.health_check_interval_secs;
        let timeout = self.connection.health_check_timeout_secs;
        if timeout == 0 || timeout >= interval {
            let clamped = constants::health::CHECK_TIMEOUT
                .as_secs()
                .min(interval.saturating_sub(1))
                .max(1);
            tracing::warn!(
                "health-check-timeout-secs {} must be positive and below the interval ({}s), using {}",
                timeout,
                interval,
                clamped
            );
            self.connection.health_check_timeout_secs = clamped;
        }

        if self.connection.degraded_reconnect_after == Some(0) {
            self.connection.degraded_reconnect_after = None;
        }

        for list in [
            &mut self.commands.one_shot,
            &mut self.commands.continuous,
            &mut self.commands.interactive,
        ] {
            list.retain(|name| {
                let usable = !name.is_empty()
                    && name.len() <= constants::settings::MAX_STRING_LENGTH
                    && !name.chars().any(char::is_whitespace);
                if !usable {
                    tracing::warn!("Ignoring command name {:?} in config", name);
                }
                usable
            });
        }

        self
    }
}

/// Default config file content with comments (generated on first launch).
const DEFAULT_CONFIG: &str = r#"# roamssh configuration

[connection]
# Automatic reconnect attempts before you have to retry by hand
max-retry-attempts = 3

# Seconds allowed for opening a connection
connect-timeout-secs = 15

# Pause between dropping and reopening a connection (milliseconds)
reconnect-delay-ms = 500

# Delay before retrying once the network comes back (seconds)
network-restored-delay-secs = 2

# Keepalive check interval and timeout (seconds)
health-check-interval-secs = 30
health-check-timeout-secs = 10

# Reconnect proactively after this many failed keepalive checks
# degraded-reconnect-after = 3

[commands]
# Extra programs for each command class (appended to the built-in lists)
# one-shot = ["kubectx"]
# continuous = ["stern"]
# interactive = ["k9s"]

[blocks]
# Output kept per command block (bytes)
max-output-bytes = 1048576

# Finished blocks kept in the history
max-finished-blocks = 200

# default-profile = "home"
#
# [[profiles]]
# name = "home"
# host = "192.168.1.10"
# port = 22
# username = "pi"
# identity-file = "~/.ssh/id_ed25519"
"#;

/// Return the config file path.
pub fn config_path() -> PathBuf {
    roamssh_paths::config_file()
}

/// Write the commented default config if no file exists yet.
///
/// `None` means the file could not be created.
pub fn ensure_config_file() -> Option<PathBuf> {
    let path = config_path();
    if !path.exists() {
        let parent = path.parent()?;
        std::fs::create_dir_all(parent).ok()?;
        std::fs::write(&path, DEFAULT_CONFIG).ok()?;
        tracing::info!("Created default config at {:?}", path);
    }
    Some(path)
}

/// Load and parse the config file. Returns default on any error.
pub fn load_config() -> Config {
    load_config_from(&config_path())
}

/// Load and parse a config file at `path`. Returns default on any error.
pub fn load_config_from(path: &Path) -> Config {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read config: {}", e);
            }
            return Config::default();
        }
    };

    if content.len() > constants::settings::MAX_FILE_SIZE as usize {
        tracing::warn!(
            "Config file too large ({} bytes), using defaults",
            content.len()
        );
        return Config::default();
    }

    match toml::from_str::<Config>(&content) {
        Ok(cfg) => cfg.sanitized(),
        Err(e) => {
            tracing::warn!("Failed to parse config.toml: {}", e);
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = Config::default();
        assert_eq!(cfg.connection.max_retry_attempts, 3);
        assert_eq!(cfg.connection.connect_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.connection.reconnect_delay(), Duration::from_millis(500));
        assert!(cfg.connection.degraded_reconnect_after.is_none());
        assert_eq!(cfg.blocks.max_output_bytes, 1024 * 1024);
        assert!(cfg.profiles.is_empty());
    }

    #[test]
    fn empty_string_parses_to_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn parses_connection_table() {
        let toml_str = r#"
[connection]
max-retry-attempts = 5
connect-timeout-secs = 30
degraded-reconnect-after = 2
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.connection.max_retry_attempts, 5);
        assert_eq!(cfg.connection.connect_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.connection.degraded_reconnect_after, Some(2));
        // Untouched keys keep their defaults
        assert_eq!(cfg.connection.health_check_interval_secs, 30);
    }

    #[test]
    fn parses_command_lists() {
        let toml_str = r#"
[commands]
continuous = ["stern"]
interactive = ["k9s", "lazygit"]
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert!(cfg.commands.one_shot.is_empty());
        assert_eq!(cfg.commands.continuous, vec!["stern"]);
        assert_eq!(cfg.commands.interactive, vec!["k9s", "lazygit"]);
    }

    #[test]
    fn ignores_unknown_keys() {
        let toml_str = r#"
log-format = "json"
[connection]
unknown-key = "whatever"
"#;
        let result: Result<Config, _> = toml::from_str(toml_str);
        assert!(result.is_ok());
    }

    #[test]
    fn default_config_template_is_valid_toml() {
        let cfg: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(cfg.connection, ConnectionSettings::default());
        assert_eq!(cfg.blocks, BlockSettings::default());
    }

    #[test]
    fn parses_profiles_from_toml() {
        let toml_str = r#"
default-profile = "pi"

[[profiles]]
name = "pi"
host = "192.168.1.10"
username = "pi"

[[profiles]]
name = "prod"
host = "prod.example.com"
port = 2222
username = "deploy"
identity-file = "~/.ssh/deploy"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.profiles.len(), 2);
        assert_eq!(cfg.profiles[0].port, 22);
        assert_eq!(cfg.profiles[1].port, 2222);
        assert_eq!(cfg.profiles[1].identity_file.as_deref(), Some("~/.ssh/deploy"));
        assert_eq!(cfg.resolve_profile(None).unwrap().name, "pi");
        assert_eq!(cfg.resolve_profile(Some("prod")).unwrap().name, "prod");
        assert!(cfg.resolve_profile(Some("missing")).is_none());
    }

    #[test]
    fn resolve_profile_falls_back_to_first() {
        let cfg = Config {
            profiles: vec![Profile::new("a", "a.example", "me")],
            default_profile: Some("nonexistent".to_string()),
            ..Config::default()
        };
        assert_eq!(cfg.resolve_profile(None).unwrap().name, "a");
    }

    #[test]
    fn resolve_profile_returns_none_when_no_profiles() {
        assert!(Config::default().resolve_profile(None).is_none());
    }

    #[test]
    fn profile_validation() {
        assert_eq!(Profile::new("ok", "host", "me").validate(), Ok(()));

        let empty_host = Profile::new("x", "  ", "me");
        assert_eq!(empty_host.validate(), Err(ProfileError::EmptyHost));

        let bad_port = Profile {
            port: 0,
            ..Profile::new("x", "host", "me")
        };
        assert_eq!(bad_port.validate(), Err(ProfileError::InvalidPort(0)));

        let no_user = Profile {
            username: None,
            ..Profile::new("x", "host", "me")
        };
        assert_eq!(no_user.validate(), Err(ProfileError::MissingUsername));
    }

    #[test]
    fn profile_destination_and_display_name() {
        let profile = Profile::new("", "example.com", "alice");
        assert_eq!(profile.destination(), "alice@example.com:22");
        assert_eq!(profile.display_name(), "example.com");
    }

    #[test]
    fn sanitized_clamps_and_filters() {
        let cfg = Config {
            blocks: BlockSettings {
                max_output_bytes: 10,
                max_finished_blocks: 0,
            },
            connection: ConnectionSettings {
                health_check_interval_secs: 0,
                degraded_reconnect_after: Some(0),
                ..ConnectionSettings::default()
            },
            commands: CommandSettings {
                continuous: vec!["stern".into(), "".into(), "two words".into()],
                ..CommandSettings::default()
            },
            ..Config::default()
        }
        .sanitized();

        assert_eq!(
            cfg.blocks.max_output_bytes,
            constants::blocks::MIN_OUTPUT_BYTES
        );
        assert_eq!(cfg.blocks.max_finished_blocks, 1);
        assert_eq!(cfg.connection.health_check_interval_secs, 30);
        assert!(cfg.connection.degraded_reconnect_after.is_none());
        assert_eq!(cfg.commands.continuous, vec!["stern"]);
    }

    fn health_timeout(interval: u64, timeout: u64) -> u64 {
        Config {
            connection: ConnectionSettings {
                health_check_interval_secs: interval,
                health_check_timeout_secs: timeout,
                ..ConnectionSettings::default()
            },
            ..Config::default()
        }
        .sanitized()
        .connection
        .health_check_timeout_secs
    }

    #[test]
    fn sanitized_keeps_health_timeout_below_interval() {
        // Valid values pass through
        assert_eq!(health_timeout(30, 10), 10);
        assert_eq!(health_timeout(30, 29), 29);

        // Zero and values at or past the interval fall back to the default
        assert_eq!(health_timeout(30, 0), 10);
        assert_eq!(health_timeout(30, 30), 10);
        assert_eq!(health_timeout(30, 45), 10);

        // Short intervals cap the fallback below themselves
        assert_eq!(health_timeout(5, 9), 4);
        assert_eq!(health_timeout(1, 0), 1);
    }

    #[test]
    fn load_config_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[connection]\nmax-retry-attempts = 7\n").unwrap();

        let cfg = load_config_from(&path);
        assert_eq!(cfg.connection.max_retry_attempts, 7);
    }

    #[test]
    fn load_config_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("nope.toml"));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn load_config_from_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let padding = "#".repeat(constants::settings::MAX_FILE_SIZE as usize + 1);
        std::fs::write(&path, format!("[connection]\nmax-retry-attempts = 9\n{}", padding))
            .unwrap();

        let cfg = load_config_from(&path);
        assert_eq!(cfg.connection.max_retry_attempts, 3);
    }

    #[test]
    fn load_config_from_invalid_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[connection\nmax-retry-attempts = ").unwrap();

        assert_eq!(load_config_from(&path), Config::default());
    }
}
