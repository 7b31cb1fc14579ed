//! roamssh - a resilient SSH session core
//!
//! Headless driver: reads command lines from stdin and runs them as blocks
//! on a session. Lines starting with `:` control the session itself.

use anyhow::{Context, Result};
use blocks::{Block, BlockEvent, BlockId, BlockStatus, FocusTarget};
use connection::{ConnectionEvent, NetworkMonitor};
use once_cell::sync::Lazy;
use session::{Session, SessionDeps, SessionError};
use settings::{Config, Profile};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use terminal::{LocalTransport, NativePtySpawner};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Application startup time for performance monitoring
static STARTUP_TIME: Lazy<Instant> = Lazy::new(Instant::now);

const HELP: &str = "\
:connect [profile]  connect (default profile if none given)
:disconnect         drop the connection
:retry              retry after a failure
:reconnect          drop and connect again
:blocks             list blocks
:focus N            send input lines to block N
:main               send input lines to the shell prompt again
:stop N             terminate block N
:state              print the connection state as JSON
:quit               exit";

/// Initialize required directories.
fn init_paths() -> Result<()> {
    roamssh_paths::ensure_dirs().with_context(|| {
        format!(
            "Failed to create app directories under {:?}",
            roamssh_paths::config_dir()
        )
    })?;
    debug!(
        "Initialized paths - config: {:?}, data: {:?}",
        roamssh_paths::config_dir(),
        roamssh_paths::data_dir()
    );
    Ok(())
}

/// Check if debug mode is enabled via environment variable.
fn is_debug_mode() -> bool {
    std::env::var("ROAMSSH_DEBUG").is_ok()
}

/// Initialize the logging system.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // In debug mode, enable trace logging for our crates
    let default_filter = if is_debug_mode() {
        "roamssh=trace,session=trace,connection=trace,blocks=trace,terminal=debug,info"
    } else {
        "roamssh=info,warn"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();

    if is_debug_mode() {
        info!(
            "roamssh v{} starting up (DEBUG MODE ENABLED)",
            env!("CARGO_PKG_VERSION")
        );
        info!("Set RUST_LOG for custom log levels, e.g. RUST_LOG=connection=trace");
    } else {
        info!("roamssh v{} starting up", env!("CARGO_PKG_VERSION"));
    }
}

/// The profile to use when the config file has none.
fn local_profile() -> Profile {
    let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
    Profile::new("local", "localhost", user)
}

fn pick_profile(config: &Config, name: Option<&str>) -> Option<Profile> {
    match config.resolve_profile(name) {
        Some(profile) => Some(profile.clone()),
        None if name.is_none() => Some(local_profile()),
        None => None,
    }
}

fn describe(index: usize, block: &Block) -> String {
    let duration = block
        .duration()
        .map(|d| format!("{:.1}s", d.as_secs_f32()))
        .unwrap_or_default();
    format!(
        "{:>3}  {}  {:<10} {:<12} {:>6}  {}",
        index,
        block.id(),
        format!("{:?}", block.status()).to_lowercase(),
        format!("{:?}", block.class()).to_lowercase(),
        duration,
        block.command()
    )
}

fn block_at(session: &Session, arg: Option<&str>) -> Option<BlockId> {
    let index: usize = arg?.parse().ok()?;
    session.blocks().get(index).map(|b| b.id())
}

/// Print connection events as they arrive.
async fn print_connection_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::StatusChanged(state)) => {
                eprintln!("[connection] {}", state.status_text());
            }
            Ok(ConnectionEvent::Error(error)) => {
                eprintln!("[error] {} ({})", error.user_message(), error.detail());
                for action in error.suggested_actions() {
                    eprintln!("        - {}", action);
                }
            }
            Ok(ConnectionEvent::Closed { session_id }) => {
                eprintln!("[connection] session {} closed", session_id);
            }
            Ok(ConnectionEvent::NetworkChanged(network)) => {
                let online = if network.connected { "online" } else { "offline" };
                eprintln!("[network] {}", online);
            }
            Ok(ConnectionEvent::HealthUpdate(_)) | Ok(ConnectionEvent::DataReceived { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Stream block output to stdout and report status changes.
async fn print_block_events(mut events: broadcast::Receiver<BlockEvent>) {
    let mut stdout = std::io::stdout();
    loop {
        match events.recv().await {
            Ok(BlockEvent::Output { data, .. }) => {
                let _ = stdout.write_all(&data);
                let _ = stdout.flush();
            }
            Ok(BlockEvent::StatusChanged { id, status }) if status != BlockStatus::Running => {
                eprintln!("[block {}] {:?}", id, status);
            }
            Ok(BlockEvent::FocusChanged(FocusTarget::Block(id))) => {
                eprintln!("[focus] block {}", id);
            }
            Ok(BlockEvent::FocusChanged(FocusTarget::MainInput)) => {
                eprintln!("[focus] main input");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Block output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn report(result: Result<(), SessionError>) {
    if let Err(e) = result {
        eprintln!("[error] {}", e);
    }
}

/// Handle one `:` command. Returns false on `:quit`.
async fn meta_command(session: &Session, config: &Config, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();

    match command {
        ":connect" => match pick_profile(config, arg) {
            Some(profile) => report(session.connect(profile).await),
            None => eprintln!("[error] no profile named {:?}", arg.unwrap_or_default()),
        },
        ":disconnect" => session.disconnect().await,
        ":retry" => report(session.retry().await),
        ":reconnect" => report(session.reconnect().await),
        ":blocks" => {
            for (index, block) in session.blocks().iter().enumerate() {
                eprintln!("{}", describe(index, block));
            }
        }
        ":focus" => match block_at(session, arg) {
            Some(id) => {
                if let Err(e) = session.focus_block(id) {
                    eprintln!("[error] {}", e);
                }
            }
            None => eprintln!("[error] usage: :focus N (see :blocks)"),
        },
        ":main" => session.focus_main_input(),
        ":stop" => match block_at(session, arg) {
            Some(id) => report(session.terminate_block(id).await),
            None => eprintln!("[error] usage: :stop N (see :blocks)"),
        },
        ":state" => match serde_json::to_string_pretty(&session.state()) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => error!("Failed to serialize state: {}", e),
        },
        ":quit" | ":q" => return false,
        _ => eprintln!("{}", HELP),
    }
    true
}

async fn run(config: Config) -> Result<()> {
    let network = Arc::new(NetworkMonitor::default());
    let session = Session::new(
        SessionDeps {
            transport: Arc::new(LocalTransport::default()),
            network,
            spawner: Arc::new(NativePtySpawner::default()),
        },
        &config,
    );

    tokio::spawn(print_connection_events(session.subscribe()));
    tokio::spawn(print_block_events(session.subscribe_blocks()));

    if let Some(profile) = pick_profile(&config, None) {
        report(session.connect(profile).await);
    }
    info!("Session ready in {:?}", STARTUP_TIME.elapsed());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let trimmed = line.trim();
        if trimmed.starts_with(':') {
            if !meta_command(&session, &config, trimmed).await {
                break;
            }
            continue;
        }

        if let FocusTarget::Block(_) = session.focused() {
            let mut input = line.into_bytes();
            input.push(b'\n');
            if let Err(e) = session.send_input(&input).await {
                eprintln!("[error] {}", e);
            }
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }
        if let Err(e) = session.dispatch(trimmed).await {
            eprintln!("[error] {}", e);
        }
    }

    session.dispose().await;
    Ok(())
}

fn main() {
    let _ = *STARTUP_TIME;

    init_logging();

    if let Err(e) = init_paths() {
        error!("Failed to initialize paths: {}", e);
    }

    if settings::ensure_config_file().is_none() {
        warn!("Could not create config file at {:?}", settings::config_path());
    }
    let config = settings::load_config();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("{:#}", e);
        std::process::exit(1);
    }
    info!("Exited after {:?}", STARTUP_TIME.elapsed());
}
