//! Interactive (pty) sessions bound to blocks.

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use util::ResultExt;
use uuid::Uuid;

use crate::active::{ActiveBlockManager, BlockError, BlockExecution};
use crate::block::{BlockId, BlockStatus};
use crate::classify::{interactive_kind, CommandClass, InteractiveKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// The process exited; always the last event.
    Exited(i32),
}

/// Control side of a spawned pty.
#[async_trait]
pub trait PtyHandle: Send + Sync {
    /// Raw bytes, no line buffering.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Deliver an interrupt (Ctrl+C) to the foreground process.
    async fn interrupt(&self) -> Result<()>;

    async fn resize(&self, size: PtySize) -> Result<()>;

    /// Force the process down.
    async fn kill(&self) -> Result<()>;
}

pub struct PtyProcess {
    pub handle: Arc<dyn PtyHandle>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

/// Starts pty-backed processes.
#[async_trait]
pub trait PtySpawner: Send + Sync {
    async fn spawn_pty(&self, command: &str, size: PtySize) -> Result<PtyProcess>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InteractiveSessionId(Uuid);

impl InteractiveSessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InteractiveSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractiveStatus {
    Starting,
    Active,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl InteractiveStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InteractiveStatus::Completed | InteractiveStatus::Cancelled | InteractiveStatus::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveSession {
    pub id: InteractiveSessionId,
    pub block_id: BlockId,
    pub kind: InteractiveKind,
    pub status: InteractiveStatus,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    /// Opaque per-program state kept for the UI (cursor, scroll, ...).
    pub state: serde_json::Value,
}

impl InteractiveSession {
    /// `(ended_at or now) - started_at`.
    pub fn duration(&self) -> Duration {
        self.ended_at
            .unwrap_or_else(SystemTime::now)
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InteractiveError {
    #[error("interactive session {0} not found")]
    NotFound(InteractiveSessionId),
    #[error("block {0} not found")]
    BlockNotFound(BlockId),
    #[error("block {0} is not an interactive command")]
    NotInteractive(BlockId),
    #[error("block {0} was already dispatched")]
    AlreadyStarted(BlockId),
    #[error("session {id} is {status:?}")]
    InvalidState {
        id: InteractiveSessionId,
        status: InteractiveStatus,
    },
    #[error("failed to start pty: {0:#}")]
    Spawn(anyhow::Error),
    #[error("pty i/o failed: {0:#}")]
    Io(anyhow::Error),
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Adapts a pty handle to the block execution seam.
struct PtyExecution(Arc<dyn PtyHandle>);

#[async_trait]
impl BlockExecution for PtyExecution {
    async fn interrupt(&self) -> Result<()> {
        self.0.interrupt().await
    }

    async fn write_input(&self, data: &[u8]) -> Result<()> {
        self.0.write(data).await
    }
}

struct Entry {
    session: InteractiveSession,
    handle: Option<Arc<dyn PtyHandle>>,
    pump: Option<JoinHandle<()>>,
}

/// Runs interactive blocks on ptys, 1:1 block to session.
pub struct InteractiveSessionController {
    spawner: Arc<dyn PtySpawner>,
    blocks: Arc<ActiveBlockManager>,
    sessions: RwLock<IndexMap<InteractiveSessionId, Entry>>,
    size: RwLock<PtySize>,
}

impl InteractiveSessionController {
    pub fn new(spawner: Arc<dyn PtySpawner>, blocks: Arc<ActiveBlockManager>) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            blocks,
            sessions: RwLock::new(IndexMap::new()),
            size: RwLock::new(PtySize::default()),
        })
    }

    /// Spawn a pty for a pending interactive block and start pumping its
    /// output into the block.
    pub async fn start(
        self: &Arc<Self>,
        block_id: BlockId,
    ) -> Result<InteractiveSessionId, InteractiveError> {
        let block = self
            .blocks
            .block(block_id)
            .ok_or(InteractiveError::BlockNotFound(block_id))?;
        if block.class() != CommandClass::Interactive {
            return Err(InteractiveError::NotInteractive(block_id));
        }

        let id = InteractiveSessionId::new();
        {
            // Claim the block under one lock so concurrent starts cannot both pass
            let mut sessions = self.sessions.write();
            let claimed = sessions.values().any(|e| e.session.block_id == block_id);
            if claimed || block.status() != BlockStatus::Pending {
                return Err(InteractiveError::AlreadyStarted(block_id));
            }
            sessions.insert(
                id,
                Entry {
                    session: InteractiveSession {
                        id,
                        block_id,
                        kind: interactive_kind(block.command()),
                        status: InteractiveStatus::Starting,
                        started_at: SystemTime::now(),
                        ended_at: None,
                        state: serde_json::Value::Null,
                    },
                    handle: None,
                    pump: None,
                },
            );
        }

        let size = *self.size.read();
        let process = match self.spawner.spawn_pty(block.command(), size).await {
            Ok(process) => process,
            Err(e) => {
                tracing::warn!(block_id = %block_id, "Failed to spawn pty: {:#}", e);
                self.set_terminal(id, InteractiveStatus::Error);
                self.blocks.fail(block_id, &format!("{:#}", e)).log_err();
                return Err(InteractiveError::Spawn(e));
            }
        };

        if let Err(e) = self
            .blocks
            .activate(block_id, Arc::new(PtyExecution(process.handle.clone())))
        {
            process.handle.kill().await.log_err();
            self.set_terminal(id, InteractiveStatus::Error);
            return Err(e.into());
        }

        let pump = tokio::spawn(pump_events(Arc::downgrade(self), id, block_id, process.events));
        {
            let mut sessions = self.sessions.write();
            if let Some(entry) = sessions.get_mut(&id) {
                entry.pump = Some(pump);
                if !entry.session.status.is_terminal() {
                    entry.handle = Some(process.handle);
                    entry.session.status = InteractiveStatus::Active;
                }
            }
        }
        tracing::info!(block_id = %block_id, session = %id, "Interactive session active");
        Ok(id)
    }

    /// The app went to the background; output keeps accumulating.
    pub fn pause(&self, id: InteractiveSessionId) -> Result<(), InteractiveError> {
        self.move_status(id, InteractiveStatus::Active, InteractiveStatus::Paused)
    }

    pub fn resume(&self, id: InteractiveSessionId) -> Result<(), InteractiveError> {
        self.move_status(id, InteractiveStatus::Paused, InteractiveStatus::Active)
    }

    fn move_status(
        &self,
        id: InteractiveSessionId,
        from: InteractiveStatus,
        to: InteractiveStatus,
    ) -> Result<(), InteractiveError> {
        let mut sessions = self.sessions.write();
        let entry = sessions.get_mut(&id).ok_or(InteractiveError::NotFound(id))?;
        if entry.session.status != from {
            return Err(InteractiveError::InvalidState {
                id,
                status: entry.session.status,
            });
        }
        entry.session.status = to;
        Ok(())
    }

    /// End the session on user request and cancel its block.
    pub async fn cancel(&self, id: InteractiveSessionId) -> Result<(), InteractiveError> {
        let (block_id, handle) = {
            let sessions = self.sessions.read();
            let entry = sessions.get(&id).ok_or(InteractiveError::NotFound(id))?;
            if entry.session.status.is_terminal() {
                return Err(InteractiveError::InvalidState {
                    id,
                    status: entry.session.status,
                });
            }
            (entry.session.block_id, entry.handle.clone())
        };

        self.set_terminal(id, InteractiveStatus::Cancelled);
        if self.blocks.is_active(block_id) {
            match self.blocks.terminate_block(block_id).await {
                Ok(()) => {}
                Err(e) => tracing::debug!(block_id = %block_id, "Terminate on cancel: {}", e),
            }
        }
        if let Some(handle) = handle {
            handle.kill().await.log_debug("kill pty");
        }
        tracing::info!(session = %id, "Interactive session cancelled");
        Ok(())
    }

    /// Raw keystrokes to the pty.
    pub async fn write(&self, id: InteractiveSessionId, data: &[u8]) -> Result<(), InteractiveError> {
        let handle = self.live_handle(id)?;
        handle.write(data).await.map_err(InteractiveError::Io)
    }

    /// Resize one session, and use `size` for later spawns.
    pub async fn resize(
        &self,
        id: InteractiveSessionId,
        size: PtySize,
    ) -> Result<(), InteractiveError> {
        *self.size.write() = size;
        let handle = self.live_handle(id)?;
        handle.resize(size).await.map_err(InteractiveError::Io)
    }

    pub fn set_state(
        &self,
        id: InteractiveSessionId,
        state: serde_json::Value,
    ) -> Result<(), InteractiveError> {
        let mut sessions = self.sessions.write();
        let entry = sessions.get_mut(&id).ok_or(InteractiveError::NotFound(id))?;
        entry.session.state = state;
        Ok(())
    }

    pub fn session(&self, id: InteractiveSessionId) -> Option<InteractiveSession> {
        self.sessions.read().get(&id).map(|e| e.session.clone())
    }

    pub fn session_for_block(&self, block_id: BlockId) -> Option<InteractiveSession> {
        self.sessions
            .read()
            .values()
            .find(|e| e.session.block_id == block_id)
            .map(|e| e.session.clone())
    }

    pub fn sessions(&self) -> Vec<InteractiveSession> {
        self.sessions
            .read()
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    pub fn duration(&self, id: InteractiveSessionId) -> Option<Duration> {
        self.session(id).map(|s| s.duration())
    }

    /// Cancel every live session.
    pub async fn cancel_all(&self) {
        let live: Vec<InteractiveSessionId> = self
            .sessions
            .read()
            .values()
            .filter(|e| !e.session.status.is_terminal())
            .map(|e| e.session.id)
            .collect();
        for id in live {
            self.cancel(id).await.log_debug("cancel interactive session");
        }
    }

    fn live_handle(&self, id: InteractiveSessionId) -> Result<Arc<dyn PtyHandle>, InteractiveError> {
        let sessions = self.sessions.read();
        let entry = sessions.get(&id).ok_or(InteractiveError::NotFound(id))?;
        if entry.session.status.is_terminal() {
            return Err(InteractiveError::InvalidState {
                id,
                status: entry.session.status,
            });
        }
        entry.handle.clone().ok_or(InteractiveError::InvalidState {
            id,
            status: entry.session.status,
        })
    }

    /// Move to a terminal status once. Returns false if already terminal.
    ///
    /// Ended sessions are kept as long as the block manager keeps finished
    /// blocks; past that cap the ones that ended first are dropped.
    fn set_terminal(&self, id: InteractiveSessionId, status: InteractiveStatus) -> bool {
        let mut sessions = self.sessions.write();
        let Some(entry) = sessions.get_mut(&id) else {
            return false;
        };
        if entry.session.status.is_terminal() {
            return false;
        }
        entry.session.status = status;
        entry.session.ended_at = Some(SystemTime::now());
        entry.handle = None;

        let mut ended: Vec<(SystemTime, InteractiveSessionId)> = sessions
            .values()
            .filter_map(|e| e.session.ended_at.map(|at| (at, e.session.id)))
            .collect();
        let excess = ended.len().saturating_sub(self.blocks.max_finished_blocks());
        if excess > 0 {
            ended.sort_by_key(|(at, _)| *at);
            for (_, old) in ended.into_iter().take(excess) {
                sessions.shift_remove(&old);
            }
        }
        true
    }

    /// The pty process exited on its own (or after cancel).
    fn on_exit(&self, id: InteractiveSessionId, block_id: BlockId, code: i32) {
        // A block terminated through the focus manager shows up as cancelled
        let cancelled = self
            .blocks
            .block(block_id)
            .is_some_and(|b| b.status() == BlockStatus::Cancelled);
        let status = match (cancelled, code) {
            (true, _) => InteractiveStatus::Cancelled,
            (false, 0) => InteractiveStatus::Completed,
            (false, _) => InteractiveStatus::Error,
        };

        if self.set_terminal(id, status) {
            tracing::info!(session = %id, code, ?status, "Interactive session ended");
        }
        if self.blocks.is_active(block_id) {
            self.blocks.finish(block_id, code).log_err();
        }
    }
}

impl Drop for InteractiveSessionController {
    fn drop(&mut self) {
        for entry in self.sessions.get_mut().values_mut() {
            if let Some(pump) = entry.pump.take() {
                pump.abort();
            }
        }
    }
}

async fn pump_events(
    controller: std::sync::Weak<InteractiveSessionController>,
    id: InteractiveSessionId,
    block_id: BlockId,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
) {
    let mut exit_code = None;
    while let Some(event) = events.recv().await {
        let Some(controller) = controller.upgrade() else {
            return;
        };
        match event {
            PtyEvent::Output(data) => controller.blocks.append_output(block_id, &data),
            PtyEvent::Exited(code) => {
                exit_code = Some(code);
                break;
            }
        }
    }

    let Some(controller) = controller.upgrade() else {
        return;
    };
    match exit_code {
        Some(code) => controller.on_exit(id, block_id, code),
        None => {
            // Stream closed without an exit status
            controller.set_terminal(id, InteractiveStatus::Error);
            if controller.blocks.is_active(block_id) {
                controller.blocks.fail(block_id, "pty closed").log_err();
            }
        }
    }
}
