//! Shared utilities for roamssh.

/// Panic in debug builds, log error with backtrace in release.
///
/// Use for "this shouldn't happen" invariants that must not take down a
/// live session in production.
#[macro_export]
macro_rules! debug_panic {
    ( $($fmt_arg:tt)* ) => {
        if cfg!(debug_assertions) {
            panic!( $($fmt_arg)* );
        } else {
            let backtrace = std::backtrace::Backtrace::capture();
            tracing::error!("{}\n{:?}", format_args!($($fmt_arg)*), backtrace);
        }
    };
}

/// Logging helpers for best-effort results.
///
/// Teardown paths (closing a transport, signalling a process that may already
/// be gone) must not fail the caller, but the failure is still worth a line in
/// the log.
pub trait ResultExt<T> {
    /// Log the error at `warn` level and discard it.
    fn log_err(self) -> Option<T>;

    /// Log the error at `debug` level with a short description and discard it.
    fn log_debug(self, what: &str) -> Option<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                tracing::warn!(
                    file = caller.file(),
                    line = caller.line(),
                    "{}",
                    error
                );
                None
            }
        }
    }

    fn log_debug(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::debug!("{}: {}", what, error);
                None
            }
        }
    }
}
