//! Where roamssh keeps its files.
//!
//! Each directory is resolved once and cached. `ROAMSSH_CONFIG_DIR` and
//! `ROAMSSH_DATA_DIR` relocate the config and data trees; tests can do the
//! same with the `set_*` functions as long as they run before first access.

use std::path::PathBuf;
use std::sync::OnceLock;

const APP_DIR_NAME: &str = "roamssh";

static CONFIG_DIR: OnceLock<PathBuf> = OnceLock::new();
static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();
static LOGS_DIR: OnceLock<PathBuf> = OnceLock::new();

/// `$var` if set and non-empty, else `<base>/roamssh`, else `./roamssh`.
fn resolve(var: &str, base: Option<PathBuf>) -> PathBuf {
    match std::env::var_os(var) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR_NAME),
    }
}

/// Holds `config.toml`.
pub fn config_dir() -> &'static PathBuf {
    CONFIG_DIR.get_or_init(|| resolve("ROAMSSH_CONFIG_DIR", dirs::config_dir()))
}

pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(|| resolve("ROAMSSH_DATA_DIR", dirs::data_dir()))
}

/// `~/Library/Logs/roamssh` on macOS, `<data-dir>/logs` elsewhere.
pub fn logs_dir() -> &'static PathBuf {
    LOGS_DIR.get_or_init(|| {
        if cfg!(target_os = "macos") {
            if let Some(home) = dirs::home_dir() {
                return home.join("Library/Logs").join(APP_DIR_NAME);
            }
        }
        data_dir().join("logs")
    })
}

/// Has no effect once [`config_dir`] has been read.
pub fn set_config_dir(path: PathBuf) {
    let _ = CONFIG_DIR.set(path);
}

/// Has no effect once [`data_dir`] has been read.
pub fn set_data_dir(path: PathBuf) {
    let _ = DATA_DIR.set(path);
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Create every app directory that does not exist yet.
pub fn ensure_dirs() -> std::io::Result<()> {
    [config_dir(), data_dir(), logs_dir()]
        .into_iter()
        .try_for_each(std::fs::create_dir_all)
}
