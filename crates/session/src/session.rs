//! One connected terminal session.
//!
//! [`Session`] wires a [`ResilienceController`], an [`ActiveBlockManager`] and
//! an [`InteractiveSessionController`] together. Commands typed at the main
//! input go through [`Session::dispatch`], which classifies them and runs them
//! either as remote exec channels or on a pty.

use anyhow::anyhow;
use async_trait::async_trait;
use blocks::{
    ActiveBlockManager, Block, BlockError, BlockEvent, BlockExecution, BlockId, CommandClass,
    CommandClassifier, FocusError, FocusTarget, InputRoute, InteractiveError, InteractiveSession,
    InteractiveSessionController, PtySize, PtySpawner,
};
use connection::{
    ConnectionEvent, ConnectionState, ControllerConfig, ControllerError, ExecControl, ExecEvent,
    NetworkObserver, ResilienceController, SessionId, Transport,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use settings::{Config, Profile};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use util::ResultExt;

/// Failure reason recorded on exec blocks whose transport session went away.
pub const CONNECTION_LOST: &str = "connection lost";

const STREAM_ENDED: &str = "command stream ended without exit status";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("nothing to run")]
    EmptyCommand,
    #[error("session disposed")]
    Disposed,
    #[error(transparent)]
    Connection(#[from] ControllerError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Interactive(#[from] InteractiveError),
}

/// Everything a session is built from.
pub struct SessionDeps {
    pub transport: Arc<dyn Transport>,
    pub network: Arc<dyn NetworkObserver>,
    pub spawner: Arc<dyn PtySpawner>,
}

/// A terminal session facade. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    controller: ResilienceController,
    blocks: Arc<ActiveBlockManager>,
    interactive: Arc<InteractiveSessionController>,
    classifier: CommandClassifier,
    /// Output pumps of exec blocks, by block.
    pumps: Mutex<FxHashMap<BlockId, JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Session {
    /// Build a session from the user's config.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(deps: SessionDeps, config: &Config) -> Self {
        let controller = ResilienceController::new(
            deps.transport,
            deps.network,
            ControllerConfig::from_settings(&config.connection),
        );
        let blocks = Arc::new(ActiveBlockManager::with_settings(&config.blocks));
        let interactive = InteractiveSessionController::new(deps.spawner, blocks.clone());
        let classifier = CommandClassifier::from_settings(&config.commands);
        Self::from_parts(controller, blocks, interactive, classifier)
    }

    pub fn from_parts(
        controller: ResilienceController,
        blocks: Arc<ActiveBlockManager>,
        interactive: Arc<InteractiveSessionController>,
        classifier: CommandClassifier,
    ) -> Self {
        let events = controller.subscribe();
        let inner = Arc::new(Inner {
            controller,
            blocks,
            interactive,
            classifier,
            pumps: Mutex::new(FxHashMap::default()),
            watcher: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        let watcher = tokio::spawn(watch_connection(Arc::downgrade(&inner), events));
        *inner.watcher.lock() = Some(watcher);
        Self { inner }
    }

    // ---- Connection ----

    pub async fn connect(&self, profile: Profile) -> Result<(), SessionError> {
        self.inner.ensure_alive()?;
        self.inner.controller.connect(profile).await?;
        Ok(())
    }

    /// Drop the connection. Running exec blocks of the session fail.
    pub async fn disconnect(&self) {
        let session = self.inner.controller.session_id();
        self.inner.controller.disconnect().await;
        if let Some(session) = session {
            self.inner.fail_session_blocks(session);
        }
    }

    pub async fn retry(&self) -> Result<(), SessionError> {
        self.inner.ensure_alive()?;
        self.inner.controller.retry().await?;
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.inner.ensure_alive()?;
        self.inner.controller.reconnect().await?;
        Ok(())
    }

    pub fn clear_error(&self) {
        self.inner.controller.clear_error();
    }

    // ---- Commands ----

    /// Classify `command`, register its block and start it.
    ///
    /// One-shot and continuous commands need a live connection and run as
    /// remote exec channels. Interactive commands get a pty of their own.
    pub async fn dispatch(&self, command: &str) -> Result<BlockId, SessionError> {
        self.inner.ensure_alive()?;
        let command = command.trim();
        if command.is_empty() {
            return Err(SessionError::EmptyCommand);
        }

        let class = self.inner.classifier.classify(command);
        let session = self.inner.controller.session_id();
        match class {
            CommandClass::Interactive => {
                let id = self.inner.blocks.create_block(command, class, session);
                self.inner.interactive.start(id).await?;
                Ok(id)
            }
            CommandClass::OneShot | CommandClass::Continuous => {
                if session.is_none() {
                    return Err(ControllerError::NotConnected.into());
                }
                let id = self.inner.blocks.create_block(command, class, session);
                self.inner.run_exec(id, command).await?;
                Ok(id)
            }
        }
    }

    /// Stop a running block. Interactive blocks also take their pty down.
    pub async fn terminate_block(&self, id: BlockId) -> Result<(), SessionError> {
        if let Some(session) = self.inner.interactive.session_for_block(id) {
            if !session.status.is_terminal() {
                self.inner.interactive.cancel(session.id).await?;
                return Ok(());
            }
        }
        self.inner.blocks.terminate_block(id).await?;
        Ok(())
    }

    pub fn focus_block(&self, id: BlockId) -> Result<(), FocusError> {
        self.inner.blocks.focus_block(id)
    }

    pub fn focus_main_input(&self) {
        self.inner.blocks.focus_main_input();
    }

    /// Keystrokes from the user. They go to the focused block, or to the
    /// session shell when the main input has focus.
    pub async fn send_input(&self, data: &[u8]) -> Result<InputRoute, SessionError> {
        let route = self.inner.blocks.send_input(data).await?;
        if let InputRoute::MainInput(bytes) = &route {
            self.inner.controller.send_data(bytes).await?;
        }
        Ok(route)
    }

    /// Resize every live interactive session.
    pub async fn resize(&self, size: PtySize) {
        for session in self.inner.interactive.sessions() {
            if session.status.is_terminal() {
                continue;
            }
            self.inner
                .interactive
                .resize(session.id, size)
                .await
                .log_debug("resize interactive session");
        }
    }

    // ---- Queries ----

    pub fn state(&self) -> ConnectionState {
        self.inner.controller.state()
    }

    pub fn status_text(&self) -> String {
        self.inner.controller.status_text()
    }

    pub fn can_retry(&self) -> bool {
        self.inner.controller.can_retry()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.controller.session_id()
    }

    pub fn active_blocks(&self) -> Vec<BlockId> {
        self.inner.blocks.active_blocks()
    }

    pub fn focused(&self) -> FocusTarget {
        self.inner.blocks.focused()
    }

    pub fn block(&self, id: BlockId) -> Option<Block> {
        self.inner.blocks.block(id)
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.blocks.blocks()
    }

    pub fn output(&self, id: BlockId) -> Option<Vec<u8>> {
        self.inner.blocks.output(id)
    }

    pub fn interactive_sessions(&self) -> Vec<InteractiveSession> {
        self.inner.interactive.sessions()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.controller.subscribe()
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent> {
        self.inner.blocks.subscribe()
    }

    pub fn controller(&self) -> &ResilienceController {
        &self.inner.controller
    }

    pub fn block_manager(&self) -> &Arc<ActiveBlockManager> {
        &self.inner.blocks
    }

    /// Pause, resume and per-session state live here.
    pub fn interactive(&self) -> &Arc<InteractiveSessionController> {
        &self.inner.interactive
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Disconnect, end interactive sessions and stop all background work.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }

        let session = self.inner.controller.session_id();
        self.inner.controller.dispose().await;
        if let Some(session) = session {
            self.inner.fail_session_blocks(session);
        }
        self.inner.interactive.cancel_all().await;

        for (_, pump) in self.inner.pumps.lock().drain() {
            pump.abort();
        }
        tracing::debug!("Session disposed");
    }
}

impl Inner {
    fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(SessionError::Disposed)
        } else {
            Ok(())
        }
    }

    async fn run_exec(self: &Arc<Self>, id: BlockId, command: &str) -> Result<(), SessionError> {
        let channel = match self.controller.send_command(command).await {
            Ok(channel) => channel,
            Err(e) => {
                self.blocks.fail(id, &e.to_string()).log_err();
                return Err(e.into());
            }
        };

        self.blocks
            .activate(id, Arc::new(ExecExecution(channel.control)))?;

        let pump = tokio::spawn(pump_exec(Arc::downgrade(self), id, channel.events));
        let mut pumps = self.pumps.lock();
        pumps.retain(|_, task| !task.is_finished());
        pumps.insert(id, pump);
        Ok(())
    }

    fn fail_session_blocks(&self, session: SessionId) {
        let failed = self.blocks.fail_session_blocks(session, CONNECTION_LOST);
        if !failed.is_empty() {
            tracing::info!(%session, count = failed.len(), "Failed blocks of closed session");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
        for (_, pump) in self.pumps.get_mut().drain() {
            pump.abort();
        }
    }
}

/// Adapts a remote exec channel to the block manager's execution seam.
struct ExecExecution(Arc<dyn ExecControl>);

#[async_trait]
impl BlockExecution for ExecExecution {
    async fn interrupt(&self) -> anyhow::Result<()> {
        self.0.interrupt().await
    }

    async fn write_input(&self, data: &[u8]) -> anyhow::Result<()> {
        self.0
            .write(data)
            .await
            .map_err(|e| anyhow!("write to remote command: {:#}", e))
    }
}

/// Copy exec output into the block until the command exits.
async fn pump_exec(
    inner: Weak<Inner>,
    id: BlockId,
    mut events: mpsc::UnboundedReceiver<ExecEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            ExecEvent::Output(data) => inner.blocks.append_output(id, &data),
            ExecEvent::Exit(code) => {
                // A terminated block is already cancelled
                if inner.blocks.is_active(id) {
                    inner.blocks.finish(id, code).log_err();
                }
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        if inner.blocks.is_active(id) {
            tracing::warn!(block_id = %id, "Exec stream ended without an exit status");
            inner.blocks.fail(id, STREAM_ENDED).log_err();
        }
    }
}

/// Fail exec blocks whenever their transport session closes.
async fn watch_connection(inner: Weak<Inner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    let mut current: Option<SessionId> = None;
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::StatusChanged(state)) => {
                if let Some(session) = state.session_id() {
                    current = Some(session);
                }
            }
            Ok(ConnectionEvent::Closed { session_id }) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.fail_session_blocks(session_id);
                if current == Some(session_id) {
                    current = None;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Connection watcher lagged");
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                // A Closed event may have been among the skipped ones
                let live = inner.controller.session_id();
                if let Some(session) = current.filter(|s| live != Some(*s)) {
                    inner.fail_session_blocks(session);
                }
                current = live;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
