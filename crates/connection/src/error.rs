//! Connection failure taxonomy and classification.
//!
//! Raw failures (transport errors, I/O errors, profile validation) are turned
//! into a [`ConnectionError`] exactly once, at the controller boundary. Only the
//! classified form is stored in state or published in events.

use serde::Serialize;
use settings::constants::retry;
use std::time::Duration;

/// Every failure type the controller distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    // Network
    NetworkUnreachable,
    HostUnreachable,
    ConnectionTimeout,
    PortClosed,
    // Authentication
    AuthenticationFailed,
    InvalidCredentials,
    KeyAuthenticationFailed,
    InvalidKey,
    PermissionDenied,
    PassphraseRequired,
    // Server
    ServerRefused,
    ProtocolError,
    ServiceUnavailable,
    HostKeyVerificationFailed,
    // Client
    InvalidConfiguration,
    MissingCredentials,
    // Local resources
    ResourceUnavailable,
    Cancelled,
    Unknown,
}

/// Coarse grouping of [`ErrorKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    Network,
    Authentication,
    Server,
    Client,
    Resource,
    Cancelled,
    Unknown,
}

/// How a failure should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryStrategy {
    NoRetry,
    FixedDelay,
    ExponentialBackoff,
    WaitForNetwork,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 19] = [
        ErrorKind::NetworkUnreachable,
        ErrorKind::HostUnreachable,
        ErrorKind::ConnectionTimeout,
        ErrorKind::PortClosed,
        ErrorKind::AuthenticationFailed,
        ErrorKind::InvalidCredentials,
        ErrorKind::KeyAuthenticationFailed,
        ErrorKind::InvalidKey,
        ErrorKind::PermissionDenied,
        ErrorKind::PassphraseRequired,
        ErrorKind::ServerRefused,
        ErrorKind::ProtocolError,
        ErrorKind::ServiceUnavailable,
        ErrorKind::HostKeyVerificationFailed,
        ErrorKind::InvalidConfiguration,
        ErrorKind::MissingCredentials,
        ErrorKind::ResourceUnavailable,
        ErrorKind::Cancelled,
        ErrorKind::Unknown,
    ];

    pub fn class(self) -> ErrorClass {
        use ErrorKind::*;
        match self {
            NetworkUnreachable | HostUnreachable | ConnectionTimeout | PortClosed => {
                ErrorClass::Network
            }
            AuthenticationFailed
            | InvalidCredentials
            | KeyAuthenticationFailed
            | InvalidKey
            | PermissionDenied
            | PassphraseRequired => ErrorClass::Authentication,
            ServerRefused | ProtocolError | ServiceUnavailable | HostKeyVerificationFailed => {
                ErrorClass::Server
            }
            InvalidConfiguration | MissingCredentials => ErrorClass::Client,
            ResourceUnavailable => ErrorClass::Resource,
            Cancelled => ErrorClass::Cancelled,
            Unknown => ErrorClass::Unknown,
        }
    }

    /// Whether a retry (manual or automatic) can possibly help.
    pub fn is_retryable(self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Network | ErrorClass::Resource | ErrorClass::Unknown
        )
    }

    /// Whether the controller may schedule a retry on its own.
    pub fn should_auto_retry(self) -> bool {
        self.class() == ErrorClass::Network
    }

    pub fn retry_strategy(self) -> RetryStrategy {
        match self {
            ErrorKind::NetworkUnreachable => RetryStrategy::WaitForNetwork,
            ErrorKind::HostUnreachable | ErrorKind::ConnectionTimeout | ErrorKind::PortClosed => {
                RetryStrategy::ExponentialBackoff
            }
            ErrorKind::ResourceUnavailable => RetryStrategy::FixedDelay,
            _ => RetryStrategy::NoRetry,
        }
    }

    /// Base delay before the first retry.
    pub fn retry_after(self) -> Option<Duration> {
        match self {
            ErrorKind::NetworkUnreachable => Some(retry::NETWORK_UNREACHABLE_BASE),
            ErrorKind::HostUnreachable => Some(retry::HOST_UNREACHABLE_BASE),
            ErrorKind::ConnectionTimeout => Some(retry::TIMEOUT_BASE),
            ErrorKind::PortClosed => Some(retry::PORT_CLOSED_BASE),
            ErrorKind::ResourceUnavailable => Some(retry::RESOURCE_BASE),
            _ => None,
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::NetworkUnreachable => "No network connection",
            ErrorKind::HostUnreachable => "Cannot reach the server",
            ErrorKind::ConnectionTimeout => "Connection timed out",
            ErrorKind::PortClosed => "The server refused the connection on this port",
            ErrorKind::AuthenticationFailed => "Authentication failed",
            ErrorKind::InvalidCredentials => "Incorrect username or password",
            ErrorKind::KeyAuthenticationFailed => "The server rejected your SSH key",
            ErrorKind::InvalidKey => "The SSH key is invalid or unsupported",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::PassphraseRequired => "The SSH key needs a passphrase",
            ErrorKind::ServerRefused => "The server closed the connection",
            ErrorKind::ProtocolError => "SSH protocol error",
            ErrorKind::ServiceUnavailable => "The SSH service is unavailable",
            ErrorKind::HostKeyVerificationFailed => "Host key verification failed",
            ErrorKind::InvalidConfiguration => "The connection settings are invalid",
            ErrorKind::MissingCredentials => "Credentials are missing",
            ErrorKind::ResourceUnavailable => "The device is out of resources",
            ErrorKind::Cancelled => "Connection cancelled",
            ErrorKind::Unknown => "Connection failed",
        }
    }

    pub fn suggested_actions(self) -> &'static [&'static str] {
        match self {
            ErrorKind::NetworkUnreachable => &[
                "Check Wi-Fi or mobile data",
                "The connection will resume when the network returns",
            ],
            ErrorKind::HostUnreachable => &[
                "Check the host name or IP address",
                "Make sure the server is online",
            ],
            ErrorKind::ConnectionTimeout => &[
                "Check your network connection",
                "The server may be overloaded or behind a firewall",
            ],
            ErrorKind::PortClosed => &[
                "Check the port number",
                "Make sure the SSH server is running",
            ],
            ErrorKind::AuthenticationFailed | ErrorKind::InvalidCredentials => {
                &["Check your username and password"]
            }
            ErrorKind::KeyAuthenticationFailed => &[
                "Make sure the public key is in authorized_keys on the server",
                "Check that the right key is selected",
            ],
            ErrorKind::InvalidKey => &["Re-import the key in OpenSSH or PEM format"],
            ErrorKind::PermissionDenied => &["Check the account's permissions on the server"],
            ErrorKind::PassphraseRequired => &["Enter the passphrase for this key"],
            ErrorKind::ServerRefused | ErrorKind::ServiceUnavailable => {
                &["Try again later", "Contact the server administrator"]
            }
            ErrorKind::ProtocolError => &["Update the SSH server or check its configuration"],
            ErrorKind::HostKeyVerificationFailed => &[
                "Verify the server's fingerprint",
                "Remove the old host key if the server was reinstalled",
            ],
            ErrorKind::InvalidConfiguration => &["Check the host and port in the profile"],
            ErrorKind::MissingCredentials => &["Add a username and key or password"],
            ErrorKind::ResourceUnavailable => &["Close other sessions or apps and retry"],
            ErrorKind::Cancelled => &[],
            ErrorKind::Unknown => &["Retry the connection"],
        }
    }
}

/// A classified connection failure. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{user_message}")]
pub struct ConnectionError {
    kind: ErrorKind,
    user_message: String,
    detail: String,
    suggested_actions: Vec<String>,
    retryable: bool,
    auto_retry: bool,
    retry_after_secs: Option<u64>,
    retry_strategy: RetryStrategy,
}

impl ConnectionError {
    /// Build the error for `kind`; `detail` keeps the raw failure text.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let retryable = kind.is_retryable();
        Self {
            kind,
            user_message: kind.user_message().to_string(),
            detail: detail.into(),
            suggested_actions: kind
                .suggested_actions()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retryable,
            auto_retry: retryable && kind.should_auto_retry(),
            retry_after_secs: kind.retry_after().map(|d| d.as_secs()),
            retry_strategy: kind.retry_strategy(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn suggested_actions(&self) -> &[String] {
        &self.suggested_actions
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn should_auto_retry(&self) -> bool {
        self.auto_retry
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_secs.map(Duration::from_secs)
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        self.retry_strategy
    }
}

/// Substring table in precedence order. First match wins.
const PATTERNS: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::NetworkUnreachable,
        &[
            "network is unreachable",
            "network unreachable",
            "network is down",
            "no internet",
            "not connected to the internet",
            "enetunreach",
        ],
    ),
    (
        ErrorKind::HostUnreachable,
        &[
            "host is unreachable",
            "host unreachable",
            "no route to host",
            "could not resolve",
            "name or service not known",
            "nodename nor servname",
            "failed to lookup address",
            "host not found",
            "ehostunreach",
        ],
    ),
    (
        ErrorKind::ConnectionTimeout,
        &["timed out", "timeout", "etimedout"],
    ),
    (
        ErrorKind::PortClosed,
        &["connection refused", "econnrefused", "port closed"],
    ),
    (
        ErrorKind::AuthenticationFailed,
        &["authentication failed", "auth failed", "authentication error"],
    ),
    (
        ErrorKind::InvalidCredentials,
        &[
            "invalid credentials",
            "wrong password",
            "incorrect password",
            "invalid password",
            "bad password",
        ],
    ),
    (
        ErrorKind::KeyAuthenticationFailed,
        &[
            "publickey",
            "public key authentication",
            "key authentication failed",
        ],
    ),
    (
        ErrorKind::InvalidKey,
        &[
            "invalid key",
            "invalid private key",
            "unsupported key",
            "bad key",
            "key format",
        ],
    ),
    (
        ErrorKind::PermissionDenied,
        &["permission denied", "access denied", "eacces"],
    ),
    (ErrorKind::PassphraseRequired, &["passphrase"]),
    (
        ErrorKind::ServerRefused,
        &[
            "connection reset",
            "server refused",
            "refused by server",
            "closed by remote",
            "connection closed by",
        ],
    ),
    (
        ErrorKind::ProtocolError,
        &[
            "protocol error",
            "protocol mismatch",
            "key exchange",
            "handshake failed",
            "invalid packet",
            "no matching",
        ],
    ),
    (
        ErrorKind::ServiceUnavailable,
        &[
            "service unavailable",
            "too many connections",
            "max sessions",
            "server busy",
        ],
    ),
    (
        ErrorKind::HostKeyVerificationFailed,
        &[
            "host key verification",
            "host key mismatch",
            "unknown host key",
            "remote host identification has changed",
        ],
    ),
    (
        ErrorKind::InvalidConfiguration,
        &[
            "invalid config",
            "invalid port",
            "invalid host",
            "malformed",
        ],
    ),
    (
        ErrorKind::MissingCredentials,
        &[
            "missing credentials",
            "no credentials",
            "username is required",
            "no identity",
        ],
    ),
    (
        ErrorKind::ResourceUnavailable,
        &[
            "too many open files",
            "out of memory",
            "cannot allocate memory",
            "no space left",
            "resource temporarily unavailable",
            "resource unavailable",
            "emfile",
        ],
    ),
    (
        ErrorKind::Cancelled,
        &["cancelled", "canceled", "aborted by user", "operation aborted"],
    ),
];

/// Classify raw failure text. Total: anything unrecognised is `Unknown`.
pub fn classify(text: &str) -> ConnectionError {
    let lower = text.to_lowercase();
    let kind = PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown);
    ConnectionError::new(kind, text)
}

/// Classify an error chain.
///
/// An already classified error is returned as is. A typed I/O error anywhere in
/// the chain is mapped by its [`std::io::ErrorKind`]; otherwise the rendered
/// chain goes through [`classify`].
pub fn classify_error(error: &anyhow::Error) -> ConnectionError {
    let detail = format!("{:#}", error);

    for cause in error.chain() {
        if let Some(classified) = cause.downcast_ref::<ConnectionError>() {
            return classified.clone();
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(kind) = io_error_kind(io.kind()) {
                return ConnectionError::new(kind, detail);
            }
        }
    }

    classify(&detail)
}

fn io_error_kind(kind: std::io::ErrorKind) -> Option<ErrorKind> {
    use std::io::ErrorKind as Io;
    match kind {
        Io::ConnectionRefused => Some(ErrorKind::PortClosed),
        Io::TimedOut => Some(ErrorKind::ConnectionTimeout),
        Io::ConnectionReset | Io::ConnectionAborted => Some(ErrorKind::ServerRefused),
        Io::NotConnected | Io::AddrNotAvailable => Some(ErrorKind::NetworkUnreachable),
        Io::PermissionDenied => Some(ErrorKind::PermissionDenied),
        Io::OutOfMemory => Some(ErrorKind::ResourceUnavailable),
        Io::Interrupted => Some(ErrorKind::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    // ==================== Classification Tests ====================

    #[test_case("connect: Network is unreachable (os error 101)", ErrorKind::NetworkUnreachable ; "network unreachable")]
    #[test_case("No route to host", ErrorKind::HostUnreachable ; "no route")]
    #[test_case("failed to lookup address information: Name or service not known", ErrorKind::HostUnreachable ; "dns failure")]
    #[test_case("Connection timed out", ErrorKind::ConnectionTimeout ; "timed out")]
    #[test_case("handshake timeout", ErrorKind::ConnectionTimeout ; "timeout")]
    #[test_case("Connection refused (os error 111)", ErrorKind::PortClosed ; "refused")]
    #[test_case("Authentication failed for user", ErrorKind::AuthenticationFailed ; "auth failed")]
    #[test_case("Wrong password", ErrorKind::InvalidCredentials ; "wrong password")]
    #[test_case("Permission denied (publickey)", ErrorKind::KeyAuthenticationFailed ; "publickey wins over permission denied")]
    #[test_case("Invalid key format", ErrorKind::InvalidKey ; "invalid key")]
    #[test_case("permission denied", ErrorKind::PermissionDenied ; "permission denied")]
    #[test_case("key is encrypted, passphrase required", ErrorKind::PassphraseRequired ; "passphrase")]
    #[test_case("Connection reset by peer", ErrorKind::ServerRefused ; "reset")]
    #[test_case("Protocol mismatch.", ErrorKind::ProtocolError ; "protocol")]
    #[test_case("Too many connections", ErrorKind::ServiceUnavailable ; "busy")]
    #[test_case("Host key verification failed.", ErrorKind::HostKeyVerificationFailed ; "host key")]
    #[test_case("unknown host key for example.com", ErrorKind::HostKeyVerificationFailed ; "unknown host key")]
    #[test_case("invalid config: host is empty", ErrorKind::InvalidConfiguration ; "invalid config")]
    #[test_case("missing credentials: username is required", ErrorKind::MissingCredentials ; "missing credentials")]
    #[test_case("Too many open files", ErrorKind::ResourceUnavailable ; "fd exhaustion")]
    #[test_case("No space left on device", ErrorKind::ResourceUnavailable ; "disk full")]
    #[test_case("operation cancelled", ErrorKind::Cancelled ; "cancelled")]
    #[test_case("something odd happened", ErrorKind::Unknown ; "unknown")]
    #[test_case("", ErrorKind::Unknown ; "empty")]
    fn classifies_text(text: &str, expected: ErrorKind) {
        assert_eq!(classify(text).kind(), expected);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify("NO ROUTE TO HOST").kind(), ErrorKind::HostUnreachable);
    }

    #[test]
    fn network_patterns_take_precedence() {
        // Both a timeout and an auth failure: the network class is checked first
        let err = classify("authentication failed: timed out waiting for banner");
        assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    }

    #[test]
    fn keeps_raw_detail() {
        let err = classify("No route to host (os error 113)");
        assert_eq!(err.detail(), "No route to host (os error 113)");
        assert_eq!(err.user_message(), "Cannot reach the server");
        assert_eq!(err.to_string(), "Cannot reach the server");
    }

    #[test]
    fn io_error_kind_is_used_before_text() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "os says no");
        let err = anyhow::Error::new(io).context("Failed to open transport");
        assert_eq!(classify_error(&err).kind(), ErrorKind::PortClosed);
    }

    #[test]
    fn unmapped_io_kind_falls_back_to_text() {
        let io = std::io::Error::other("no route to host");
        let err = anyhow::Error::new(io);
        assert_eq!(classify_error(&err).kind(), ErrorKind::HostUnreachable);
    }

    #[test]
    fn context_chain_is_searched() {
        let result: anyhow::Result<()> =
            Err(anyhow::anyhow!("Connection timed out")).context("Failed to connect");
        let err = result.unwrap_err();
        let classified = classify_error(&err);
        assert_eq!(classified.kind(), ErrorKind::ConnectionTimeout);
        assert!(classified.detail().contains("Failed to connect"));
    }

    #[test]
    fn classified_error_passes_through() {
        let original = ConnectionError::new(ErrorKind::PassphraseRequired, "need it");
        let err = anyhow::Error::new(original.clone()).context("wrapped");
        assert_eq!(classify_error(&err), original);
    }

    // ==================== Retry Table Tests ====================

    #[test_case(ErrorKind::NetworkUnreachable, true, true, RetryStrategy::WaitForNetwork, Some(5))]
    #[test_case(ErrorKind::HostUnreachable, true, true, RetryStrategy::ExponentialBackoff, Some(10))]
    #[test_case(ErrorKind::ConnectionTimeout, true, true, RetryStrategy::ExponentialBackoff, Some(5))]
    #[test_case(ErrorKind::PortClosed, true, true, RetryStrategy::ExponentialBackoff, Some(15))]
    #[test_case(ErrorKind::AuthenticationFailed, false, false, RetryStrategy::NoRetry, None)]
    #[test_case(ErrorKind::HostKeyVerificationFailed, false, false, RetryStrategy::NoRetry, None)]
    #[test_case(ErrorKind::InvalidConfiguration, false, false, RetryStrategy::NoRetry, None)]
    #[test_case(ErrorKind::ResourceUnavailable, true, false, RetryStrategy::FixedDelay, Some(5))]
    #[test_case(ErrorKind::Unknown, true, false, RetryStrategy::NoRetry, None)]
    #[test_case(ErrorKind::Cancelled, false, false, RetryStrategy::NoRetry, None)]
    fn retry_table(
        kind: ErrorKind,
        retryable: bool,
        auto: bool,
        strategy: RetryStrategy,
        after_secs: Option<u64>,
    ) {
        let err = ConnectionError::new(kind, "");
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.should_auto_retry(), auto);
        assert_eq!(err.retry_strategy(), strategy);
        assert_eq!(err.retry_after(), after_secs.map(Duration::from_secs));
    }

    #[test]
    fn every_kind_has_a_user_message() {
        for kind in ErrorKind::ALL {
            assert!(!kind.user_message().is_empty(), "{:?}", kind);
        }
    }

    #[test]
    fn serializes_camel_case() {
        let err = ConnectionError::new(ErrorKind::PortClosed, "refused");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "portClosed");
        assert_eq!(json["retryStrategy"], "exponentialBackoff");
        assert_eq!(json["retryAfterSecs"], 15);
    }

    // ==================== Property Tests ====================

    proptest! {
        #[test]
        fn auto_retry_implies_retryable(idx in 0usize..ErrorKind::ALL.len()) {
            let err = ConnectionError::new(ErrorKind::ALL[idx], "");
            prop_assert!(!err.should_auto_retry() || err.is_retryable());
        }

        #[test]
        fn classify_is_total(text in ".*") {
            let err = classify(&text);
            prop_assert!(!err.should_auto_retry() || err.is_retryable());
            prop_assert_eq!(err.detail(), text.as_str());
        }

        #[test]
        fn no_retry_strategy_has_no_delay(idx in 0usize..ErrorKind::ALL.len()) {
            let kind = ErrorKind::ALL[idx];
            if kind.retry_strategy() == RetryStrategy::NoRetry {
                prop_assert!(kind.retry_after().is_none());
            } else {
                prop_assert!(kind.retry_after().is_some());
            }
        }
    }
}
