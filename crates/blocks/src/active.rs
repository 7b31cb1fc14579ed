//! Active block tracking and input focus.
//!
//! [`ActiveBlockManager`] is the only writer of the running-block set and the
//! focus pointer. At most one target holds focus: the main input line or a
//! single running block that accepts input.

use async_trait::async_trait;
use connection::SessionId;
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use settings::{constants, BlockSettings};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;

use crate::block::{Block, BlockId, BlockStatus, TransitionError};
use crate::classify::CommandClass;

/// The running side of a block: whatever executes the command.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockExecution: Send + Sync {
    /// Cooperative interrupt (logical Ctrl+C).
    async fn interrupt(&self) -> anyhow::Result<()>;

    /// Forward raw keystrokes.
    async fn write_input(&self, data: &[u8]) -> anyhow::Result<()>;
}

/// Who receives keystrokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase", tag = "target", content = "id")]
pub enum FocusTarget {
    #[default]
    MainInput,
    Block(BlockId),
}

/// Where [`ActiveBlockManager::send_input`] delivered the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRoute {
    Block(BlockId),
    /// No block holds focus; the caller owns the bytes.
    MainInput(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    Activated {
        id: BlockId,
        session: Option<SessionId>,
    },
    Deactivated {
        id: BlockId,
    },
    Terminated {
        id: BlockId,
    },
    /// Dropped from the history to stay under the retention cap.
    Evicted {
        id: BlockId,
    },
    StatusChanged {
        id: BlockId,
        status: BlockStatus,
    },
    FocusChanged(FocusTarget),
    Output {
        id: BlockId,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FocusError {
    #[error("block {0} not found")]
    NotFound(BlockId),
    #[error("block {0} is not running")]
    NotRunning(BlockId),
    #[error("block {0} does not accept input")]
    NoInput(BlockId),
}

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("block {0} not found")]
    NotFound(BlockId),
    #[error("block {0} is not running")]
    NotRunning(BlockId),
    #[error("interrupt failed: {0:#}")]
    Interrupt(anyhow::Error),
    #[error("input failed: {0:#}")]
    Input(anyhow::Error),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Default)]
struct ManagerState {
    blocks: IndexMap<BlockId, Block>,
    active: IndexSet<BlockId>,
    executions: FxHashMap<BlockId, Arc<dyn BlockExecution>>,
    focus: FocusTarget,
    sessions: FxHashMap<SessionId, IndexSet<BlockId>>,
    block_sessions: FxHashMap<BlockId, SessionId>,
}

impl ManagerState {
    /// Remove `id` from the running set. Returns the focus change, if any.
    fn deactivate(&mut self, id: BlockId) -> Option<FocusTarget> {
        self.active.shift_remove(&id);
        self.executions.remove(&id);
        if self.focus == FocusTarget::Block(id) {
            self.focus = FocusTarget::MainInput;
            return Some(FocusTarget::MainInput);
        }
        None
    }

    /// Drop the longest-finished blocks past `keep`. Pending and running
    /// blocks are never evicted.
    fn evict_finished(&mut self, keep: usize) -> Vec<BlockId> {
        let mut finished: Vec<(SystemTime, BlockId)> = self
            .blocks
            .values()
            .filter(|b| b.status().is_terminal())
            .map(|b| (b.finished_at().unwrap_or_else(|| b.created_at()), b.id()))
            .collect();
        let excess = finished.len().saturating_sub(keep);
        if excess == 0 {
            return Vec::new();
        }
        finished.sort_by_key(|(at, _)| *at);

        let evicted: Vec<BlockId> = finished.into_iter().take(excess).map(|(_, id)| id).collect();
        for id in &evicted {
            self.blocks.shift_remove(id);
            if let Some(session) = self.block_sessions.remove(id) {
                if let Some(ids) = self.sessions.get_mut(&session) {
                    ids.shift_remove(id);
                    if ids.is_empty() {
                        self.sessions.remove(&session);
                    }
                }
            }
        }
        evicted
    }

    fn can_accept_input(&self, id: BlockId) -> Result<(), FocusError> {
        let block = self.blocks.get(&id).ok_or(FocusError::NotFound(id))?;
        if block.status() != BlockStatus::Running || !self.active.contains(&id) {
            return Err(FocusError::NotRunning(id));
        }
        match block.class() {
            CommandClass::Continuous | CommandClass::Interactive => Ok(()),
            CommandClass::OneShot => Err(FocusError::NoInput(id)),
        }
    }
}

/// Tracks blocks, the running set and focus.
///
/// Finished blocks stay queryable until more than `max_finished_blocks` of
/// them pile up; then the ones that finished first are evicted.
pub struct ActiveBlockManager {
    state: RwLock<ManagerState>,
    events: broadcast::Sender<BlockEvent>,
    max_output_bytes: usize,
    max_finished_blocks: usize,
}

impl Default for ActiveBlockManager {
    fn default() -> Self {
        Self::with_settings(&BlockSettings::default())
    }
}

impl ActiveBlockManager {
    pub fn new(max_output_bytes: usize, max_finished_blocks: usize) -> Self {
        let (events, _) = broadcast::channel(constants::events::CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ManagerState::default()),
            events,
            max_output_bytes,
            max_finished_blocks: max_finished_blocks.max(1),
        }
    }

    pub fn with_settings(settings: &BlockSettings) -> Self {
        Self::new(settings.max_output_bytes, settings.max_finished_blocks)
    }

    pub fn max_finished_blocks(&self) -> usize {
        self.max_finished_blocks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlockEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BlockEvent) {
        let _ = self.events.send(event);
    }

    // ---- Registration ----

    /// Create a pending block, optionally bound to a transport session.
    pub fn create_block(
        &self,
        command: &str,
        class: CommandClass,
        session: Option<SessionId>,
    ) -> BlockId {
        let block = Block::new(command, class, self.max_output_bytes);
        let id = block.id();
        let mut state = self.state.write();
        state.blocks.insert(id, block);
        if let Some(session) = session {
            state.sessions.entry(session).or_default().insert(id);
            state.block_sessions.insert(id, session);
        }
        tracing::debug!(block_id = %id, ?class, "Created block for {:?}", command);
        id
    }

    /// Mark a pending block running and attach its execution.
    pub fn activate(
        &self,
        id: BlockId,
        execution: Arc<dyn BlockExecution>,
    ) -> Result<(), BlockError> {
        let session = {
            let mut state = self.state.write();
            let block = state.blocks.get_mut(&id).ok_or(BlockError::NotFound(id))?;
            block.start()?;
            state.active.insert(id);
            state.executions.insert(id, execution);
            state.block_sessions.get(&id).copied()
        };
        tracing::info!(block_id = %id, "Block running");
        self.emit(BlockEvent::StatusChanged {
            id,
            status: BlockStatus::Running,
        });
        self.emit(BlockEvent::Activated { id, session });
        Ok(())
    }

    /// Record output of a running block. Output that arrives after the block
    /// finished (a late chunk after Ctrl+C) is dropped.
    pub fn append_output(&self, id: BlockId, data: &[u8]) {
        {
            let mut state = self.state.write();
            match state.blocks.get_mut(&id) {
                Some(block) if block.status() == BlockStatus::Running => block.append_output(data),
                Some(block) => {
                    tracing::trace!(block_id = %id, status = ?block.status(), "Dropping late output");
                    return;
                }
                None => return,
            }
        }
        self.emit(BlockEvent::Output {
            id,
            data: data.to_vec(),
        });
    }

    /// Record the process exit of a running block.
    pub fn finish(&self, id: BlockId, exit_code: i32) -> Result<BlockStatus, BlockError> {
        self.end(id, |block| block.complete(exit_code))
    }

    /// Fail a block that never got an exit status.
    pub fn fail(&self, id: BlockId, reason: &str) -> Result<BlockStatus, BlockError> {
        self.end(id, |block| block.fail(reason))
    }

    fn end(
        &self,
        id: BlockId,
        f: impl FnOnce(&mut Block) -> Result<(), TransitionError>,
    ) -> Result<BlockStatus, BlockError> {
        let (status, focus_change, was_active, evicted) = {
            let mut state = self.state.write();
            let block = state.blocks.get_mut(&id).ok_or(BlockError::NotFound(id))?;
            f(block)?;
            let status = block.status();
            let was_active = state.active.contains(&id);
            let focus_change = state.deactivate(id);
            let evicted = state.evict_finished(self.max_finished_blocks);
            (status, focus_change, was_active, evicted)
        };
        tracing::info!(block_id = %id, ?status, "Block finished");
        self.emit(BlockEvent::StatusChanged { id, status });
        if was_active {
            self.emit(BlockEvent::Deactivated { id });
        }
        if let Some(focus) = focus_change {
            self.emit(BlockEvent::FocusChanged(focus));
        }
        self.emit_evicted(evicted);
        Ok(status)
    }

    fn emit_evicted(&self, evicted: Vec<BlockId>) {
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted finished blocks");
        }
        for id in evicted {
            self.emit(BlockEvent::Evicted { id });
        }
    }

    /// Interrupt a running block and mark it cancelled once the interrupt is
    /// delivered. The connection is left alone.
    pub async fn terminate_block(&self, id: BlockId) -> Result<(), BlockError> {
        let execution = {
            let state = self.state.read();
            let block = state.blocks.get(&id).ok_or(BlockError::NotFound(id))?;
            if block.status() != BlockStatus::Running {
                return Err(BlockError::NotRunning(id));
            }
            state
                .executions
                .get(&id)
                .cloned()
                .ok_or(BlockError::NotRunning(id))?
        };

        execution.interrupt().await.map_err(BlockError::Interrupt)?;

        let (focus_change, evicted) = {
            let mut state = self.state.write();
            let Some(block) = state.blocks.get_mut(&id) else {
                return Err(BlockError::NotFound(id));
            };
            if let Err(e) = block.cancel() {
                // Exited on its own while the interrupt was in flight
                tracing::debug!(block_id = %id, "Terminate raced with exit: {}", e);
                return Ok(());
            }
            let focus_change = state.deactivate(id);
            (focus_change, state.evict_finished(self.max_finished_blocks))
        };

        tracing::info!(block_id = %id, "Block terminated");
        self.emit(BlockEvent::StatusChanged {
            id,
            status: BlockStatus::Cancelled,
        });
        self.emit(BlockEvent::Deactivated { id });
        self.emit(BlockEvent::Terminated { id });
        if let Some(focus) = focus_change {
            self.emit(BlockEvent::FocusChanged(focus));
        }
        self.emit_evicted(evicted);
        Ok(())
    }

    /// Fail every running exec block bound to `session`. Interactive blocks
    /// run on their own pty and are left running.
    pub fn fail_session_blocks(&self, session: SessionId, reason: &str) -> Vec<BlockId> {
        let running: Vec<BlockId> = {
            let state = self.state.read();
            state
                .sessions
                .get(&session)
                .map(|ids| {
                    ids.iter()
                        .copied()
                        .filter(|id| {
                            state.active.contains(id)
                                && state
                                    .blocks
                                    .get(id)
                                    .is_some_and(|b| b.class() != CommandClass::Interactive)
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        running
            .into_iter()
            .filter(|id| self.fail(*id, reason).is_ok())
            .collect()
    }

    // ---- Focus ----

    /// Running, and classified continuous or interactive.
    pub fn can_accept_input(&self, id: BlockId) -> bool {
        self.state.read().can_accept_input(id).is_ok()
    }

    /// Give `id` the input focus. On failure focus is unchanged.
    pub fn focus_block(&self, id: BlockId) -> Result<(), FocusError> {
        let changed = {
            let mut state = self.state.write();
            state.can_accept_input(id)?;
            let target = FocusTarget::Block(id);
            let changed = state.focus != target;
            state.focus = target;
            changed
        };
        if changed {
            tracing::debug!(block_id = %id, "Focus moved to block");
            self.emit(BlockEvent::FocusChanged(FocusTarget::Block(id)));
        }
        Ok(())
    }

    pub fn focus_main_input(&self) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.focus != FocusTarget::MainInput;
            state.focus = FocusTarget::MainInput;
            changed
        };
        if changed {
            self.emit(BlockEvent::FocusChanged(FocusTarget::MainInput));
        }
    }

    pub fn focused(&self) -> FocusTarget {
        self.state.read().focus
    }

    /// Route keystrokes to the focused block, or hand them back.
    pub async fn send_input(&self, data: &[u8]) -> Result<InputRoute, BlockError> {
        let target = {
            let state = self.state.read();
            match state.focus {
                FocusTarget::Block(id) => state.executions.get(&id).cloned().map(|e| (id, e)),
                FocusTarget::MainInput => None,
            }
        };

        match target {
            Some((id, execution)) => {
                execution.write_input(data).await.map_err(BlockError::Input)?;
                Ok(InputRoute::Block(id))
            }
            None => Ok(InputRoute::MainInput(data.to_vec())),
        }
    }

    // ---- Queries ----

    pub fn block(&self, id: BlockId) -> Option<Block> {
        self.state.read().blocks.get(&id).cloned()
    }

    /// All blocks in creation order.
    pub fn blocks(&self) -> Vec<Block> {
        self.state.read().blocks.values().cloned().collect()
    }

    /// Running block ids in activation order.
    pub fn active_blocks(&self) -> Vec<BlockId> {
        self.state.read().active.iter().copied().collect()
    }

    pub fn is_active(&self, id: BlockId) -> bool {
        self.state.read().active.contains(&id)
    }

    pub fn output(&self, id: BlockId) -> Option<Vec<u8>> {
        self.state.read().blocks.get(&id).map(|b| b.output().bytes())
    }

    pub fn session_blocks(&self, session: SessionId) -> Vec<BlockId> {
        self.state
            .read()
            .sessions
            .get(&session)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn session_of(&self, id: BlockId) -> Option<SessionId> {
        self.state.read().block_sessions.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn running(manager: &ActiveBlockManager, command: &str, class: CommandClass) -> BlockId {
        let id = manager.create_block(command, class, None);
        let mut exec = MockBlockExecution::new();
        exec.expect_interrupt().returning(|| Ok(()));
        exec.expect_write_input().returning(|_| Ok(()));
        manager.activate(id, Arc::new(exec)).unwrap();
        id
    }

    fn drain(rx: &mut broadcast::Receiver<BlockEvent>) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ==================== Focus Tests ====================

    #[test]
    fn focus_requires_running_continuous_or_interactive() {
        let manager = ActiveBlockManager::default();
        let top = running(&manager, "top", CommandClass::Continuous);
        let ls = running(&manager, "ls", CommandClass::OneShot);
        let pending = manager.create_block("vim", CommandClass::Interactive, None);

        assert_eq!(manager.focus_block(ls), Err(FocusError::NoInput(ls)));
        assert_eq!(manager.focus_block(pending), Err(FocusError::NotRunning(pending)));
        assert_eq!(manager.focused(), FocusTarget::MainInput);

        manager.focus_block(top).unwrap();
        assert_eq!(manager.focused(), FocusTarget::Block(top));
    }

    #[test]
    fn focus_unknown_block_fails() {
        let manager = ActiveBlockManager::default();
        let id = BlockId::new();
        assert_eq!(manager.focus_block(id), Err(FocusError::NotFound(id)));
    }

    #[test]
    fn failed_focus_keeps_previous_holder() {
        let manager = ActiveBlockManager::default();
        let top = running(&manager, "top", CommandClass::Continuous);
        let ls = running(&manager, "ls", CommandClass::OneShot);

        manager.focus_block(top).unwrap();
        assert!(manager.focus_block(ls).is_err());
        assert_eq!(manager.focused(), FocusTarget::Block(top));
    }

    #[test]
    fn focus_moves_atomically_between_blocks() {
        let manager = ActiveBlockManager::default();
        let a = running(&manager, "top", CommandClass::Continuous);
        let b = running(&manager, "vim", CommandClass::Interactive);
        let mut rx = manager.subscribe();

        manager.focus_block(a).unwrap();
        manager.focus_block(b).unwrap();
        manager.focus_main_input();
        manager.focus_main_input();

        assert_eq!(
            drain(&mut rx),
            vec![
                BlockEvent::FocusChanged(FocusTarget::Block(a)),
                BlockEvent::FocusChanged(FocusTarget::Block(b)),
                BlockEvent::FocusChanged(FocusTarget::MainInput),
            ]
        );
    }

    #[test]
    fn finishing_focused_block_returns_focus() {
        let manager = ActiveBlockManager::default();
        let id = running(&manager, "tail -f log", CommandClass::Continuous);
        manager.focus_block(id).unwrap();

        manager.finish(id, 0).unwrap();
        assert_eq!(manager.focused(), FocusTarget::MainInput);
        assert!(!manager.can_accept_input(id));
    }

    // ==================== Lifecycle Tests ====================

    #[test]
    fn activation_and_finish_update_active_set() {
        let manager = ActiveBlockManager::default();
        let mut rx = manager.subscribe();
        let id = running(&manager, "ls -la", CommandClass::OneShot);
        assert_eq!(manager.active_blocks(), vec![id]);

        manager.append_output(id, b"total 0\n");
        assert_eq!(manager.finish(id, 0).unwrap(), BlockStatus::Completed);
        assert!(manager.active_blocks().is_empty());
        assert_eq!(manager.output(id).unwrap(), b"total 0\n".to_vec());

        assert_eq!(
            drain(&mut rx),
            vec![
                BlockEvent::StatusChanged {
                    id,
                    status: BlockStatus::Running
                },
                BlockEvent::Activated { id, session: None },
                BlockEvent::Output {
                    id,
                    data: b"total 0\n".to_vec()
                },
                BlockEvent::StatusChanged {
                    id,
                    status: BlockStatus::Completed
                },
                BlockEvent::Deactivated { id },
            ]
        );
    }

    #[test]
    fn finish_twice_is_rejected() {
        let manager = ActiveBlockManager::default();
        let id = running(&manager, "ls", CommandClass::OneShot);
        manager.finish(id, 0).unwrap();
        assert!(matches!(
            manager.finish(id, 1),
            Err(BlockError::Transition(TransitionError::Finished { .. }))
        ));
        assert_eq!(manager.block(id).unwrap().status(), BlockStatus::Completed);
    }

    // ==================== Terminate Tests ====================

    #[tokio::test]
    async fn terminate_interrupts_then_cancels() {
        let manager = ActiveBlockManager::default();
        let id = manager.create_block("top", CommandClass::Continuous, None);
        let mut exec = MockBlockExecution::new();
        exec.expect_interrupt().times(1).returning(|| Ok(()));
        manager.activate(id, Arc::new(exec)).unwrap();
        manager.focus_block(id).unwrap();
        let mut rx = manager.subscribe();

        manager.terminate_block(id).await.unwrap();

        let block = manager.block(id).unwrap();
        assert_eq!(block.status(), BlockStatus::Cancelled);
        assert!(!block.affordances().stop);
        assert!(manager.active_blocks().is_empty());
        assert_eq!(manager.focused(), FocusTarget::MainInput);
        assert!(drain(&mut rx).contains(&BlockEvent::Terminated { id }));
    }

    #[tokio::test]
    async fn failed_interrupt_leaves_block_running() {
        let manager = ActiveBlockManager::default();
        let id = manager.create_block("top", CommandClass::Continuous, None);
        let mut exec = MockBlockExecution::new();
        exec.expect_interrupt()
            .returning(|| Err(anyhow::anyhow!("channel closed")));
        manager.activate(id, Arc::new(exec)).unwrap();

        assert!(matches!(
            manager.terminate_block(id).await,
            Err(BlockError::Interrupt(_))
        ));
        assert_eq!(manager.block(id).unwrap().status(), BlockStatus::Running);
    }

    #[tokio::test]
    async fn terminate_requires_running_block() {
        let manager = ActiveBlockManager::default();
        let pending = manager.create_block("top", CommandClass::Continuous, None);
        assert!(matches!(
            manager.terminate_block(pending).await,
            Err(BlockError::NotRunning(_))
        ));
        assert!(matches!(
            manager.terminate_block(BlockId::new()).await,
            Err(BlockError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn output_after_terminate_is_dropped() {
        let manager = ActiveBlockManager::default();
        let id = running(&manager, "ping 10.0.0.1", CommandClass::Continuous);
        manager.append_output(id, b"64 bytes from 10.0.0.1\n");

        manager.terminate_block(id).await.unwrap();
        let mut rx = manager.subscribe();
        manager.append_output(id, b"^C\n--- 10.0.0.1 ping statistics ---\n");

        assert_eq!(manager.output(id).unwrap(), b"64 bytes from 10.0.0.1\n".to_vec());
        assert!(drain(&mut rx).is_empty());
    }

    // ==================== Retention Tests ====================

    #[test]
    fn oldest_finished_blocks_are_evicted() {
        let manager = ActiveBlockManager::new(constants::blocks::MAX_OUTPUT_BYTES, 2);
        let session = SessionId::new();
        let watcher = manager.create_block("top", CommandClass::Continuous, Some(session));
        manager
            .activate(watcher, Arc::new(MockBlockExecution::new()))
            .unwrap();

        let mut finished = Vec::new();
        for command in ["ls", "pwd", "uname -a"] {
            let id = manager.create_block(command, CommandClass::OneShot, Some(session));
            manager
                .activate(id, Arc::new(MockBlockExecution::new()))
                .unwrap();
            manager.append_output(id, command.as_bytes());
            finished.push(id);
        }

        let mut rx = manager.subscribe();
        for id in &finished {
            manager.finish(*id, 0).unwrap();
        }

        let first = finished[0];
        assert!(manager.block(first).is_none());
        assert!(manager.output(first).is_none());
        assert_eq!(manager.session_of(first), None);
        assert!(drain(&mut rx).contains(&BlockEvent::Evicted { id: first }));

        // The running block is older than all of them and stays
        let ids: Vec<BlockId> = manager.blocks().iter().map(|b| b.id()).collect();
        assert_eq!(ids, vec![watcher, finished[1], finished[2]]);
        assert_eq!(
            manager.session_blocks(session),
            vec![watcher, finished[1], finished[2]]
        );
        assert_eq!(manager.active_blocks(), vec![watcher]);
    }

    #[tokio::test]
    async fn terminated_blocks_count_toward_retention() {
        let manager = ActiveBlockManager::new(constants::blocks::MAX_OUTPUT_BYTES, 1);
        let first = running(&manager, "top", CommandClass::Continuous);
        let second = running(&manager, "watch df", CommandClass::Continuous);

        manager.terminate_block(first).await.unwrap();
        manager.terminate_block(second).await.unwrap();

        assert!(manager.block(first).is_none());
        assert_eq!(
            manager.block(second).unwrap().status(),
            BlockStatus::Cancelled
        );
    }

    // ==================== Input Routing Tests ====================

    #[tokio::test]
    async fn input_goes_to_focused_block() {
        let manager = ActiveBlockManager::default();
        let id = manager.create_block("vim", CommandClass::Interactive, None);
        let mut exec = MockBlockExecution::new();
        exec.expect_write_input()
            .withf(|data| data.to_vec() == b":wq\r".to_vec())
            .times(1)
            .returning(|_| Ok(()));
        manager.activate(id, Arc::new(exec)).unwrap();
        manager.focus_block(id).unwrap();

        let route = manager.send_input(b":wq\r").await.unwrap();
        assert_eq!(route, InputRoute::Block(id));
    }

    #[tokio::test]
    async fn input_without_focus_is_main_input() {
        let manager = ActiveBlockManager::default();
        let route = manager.send_input(b"ls\n").await.unwrap();
        assert_eq!(route, InputRoute::MainInput(b"ls\n".to_vec()));
    }

    // ==================== Session Tests ====================

    #[test]
    fn session_blocks_fail_together() {
        let manager = ActiveBlockManager::default();
        let session = SessionId::new();
        let other = SessionId::new();

        let tail = manager.create_block("tail -f log", CommandClass::Continuous, Some(session));
        let vim = manager.create_block("vim", CommandClass::Interactive, Some(session));
        let elsewhere = manager.create_block("top", CommandClass::Continuous, Some(other));
        for id in [tail, vim, elsewhere] {
            manager
                .activate(id, Arc::new(MockBlockExecution::new()))
                .unwrap();
        }

        let failed = manager.fail_session_blocks(session, "connection lost");
        assert_eq!(failed, vec![tail]);
        assert_eq!(manager.block(tail).unwrap().status(), BlockStatus::Failed);
        assert_eq!(manager.block(vim).unwrap().status(), BlockStatus::Running);
        assert_eq!(manager.block(elsewhere).unwrap().status(), BlockStatus::Running);
        assert_eq!(manager.session_blocks(session), vec![tail, vim]);
        assert_eq!(manager.session_of(elsewhere), Some(other));
    }
}
