//! Command blocks and their lifecycle.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::classify::CommandClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockId(Uuid);

impl BlockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for logs and prompts
        let id = self.0.simple().to_string();
        f.write_str(&id[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BlockStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BlockStatus::Completed | BlockStatus::Failed | BlockStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("block {id} already finished as {status:?}")]
    Finished { id: BlockId, status: BlockStatus },
    #[error("block {id} cannot go from {from:?} to {to:?}")]
    Invalid {
        id: BlockId,
        from: BlockStatus,
        to: BlockStatus,
    },
}

/// Controls a block offers, derived only from its class and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Affordances {
    pub stop: bool,
    pub focus: bool,
    pub raw_input: bool,
}

impl Affordances {
    pub fn for_block(class: CommandClass, status: BlockStatus) -> Self {
        let running = status == BlockStatus::Running;
        match class {
            CommandClass::OneShot => Self::default(),
            CommandClass::Continuous => Self {
                stop: running,
                focus: running,
                raw_input: false,
            },
            CommandClass::Interactive => Self {
                stop: running,
                focus: running,
                raw_input: running,
            },
        }
    }
}

/// Output kept for a block, capped at a byte limit. Oldest bytes go first.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    limit: usize,
    dropped: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let was_truncated = self.dropped > 0;
        self.data.extend(bytes);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.drain(..excess);
            self.dropped += excess;
            if !was_truncated {
                tracing::debug!(
                    "Block output over {}, dropping oldest bytes",
                    human_bytes::human_bytes(self.limit as f64)
                );
            }
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes discarded because of the limit.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// One command and everything it produced.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    command: String,
    class: CommandClass,
    status: BlockStatus,
    output: OutputBuffer,
    created_at: SystemTime,
    started_at: Option<SystemTime>,
    finished_at: Option<SystemTime>,
    exit_code: Option<i32>,
    failure: Option<String>,
}

impl Block {
    pub fn new(command: impl Into<String>, class: CommandClass, output_limit: usize) -> Self {
        Self {
            id: BlockId::new(),
            command: command.into(),
            class,
            status: BlockStatus::Pending,
            output: OutputBuffer::new(output_limit),
            created_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure: None,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn class(&self) -> CommandClass {
        self.class
    }

    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<SystemTime> {
        self.finished_at
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Why the block failed, when it failed without an exit code.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn affordances(&self) -> Affordances {
        Affordances::for_block(self.class, self.status)
    }

    /// Time spent running so far, or in total once finished.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(SystemTime::now);
        Some(end.duration_since(started).unwrap_or_default())
    }

    pub fn append_output(&mut self, bytes: &[u8]) {
        self.output.push(bytes);
    }

    /// Pending -> running.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(BlockStatus::Running)?;
        self.started_at = Some(SystemTime::now());
        Ok(())
    }

    /// Running -> completed on exit 0, failed otherwise.
    pub fn complete(&mut self, exit_code: i32) -> Result<(), TransitionError> {
        let next = if exit_code == 0 {
            BlockStatus::Completed
        } else {
            BlockStatus::Failed
        };
        self.transition(next)?;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(SystemTime::now());
        Ok(())
    }

    /// Failure without an exit status (transport loss, spawn error).
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(BlockStatus::Failed)?;
        self.failure = Some(reason.into());
        self.finished_at = Some(SystemTime::now());
        Ok(())
    }

    /// Running -> cancelled. Only user termination gets here.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(BlockStatus::Cancelled)?;
        self.finished_at = Some(SystemTime::now());
        Ok(())
    }

    fn transition(&mut self, to: BlockStatus) -> Result<(), TransitionError> {
        let from = self.status;
        if from.is_terminal() {
            return Err(TransitionError::Finished {
                id: self.id,
                status: from,
            });
        }
        let allowed = match (from, to) {
            (BlockStatus::Pending, BlockStatus::Running) => true,
            // Dispatch itself can fail before anything runs
            (BlockStatus::Pending, BlockStatus::Failed) => true,
            (BlockStatus::Running, next) => next.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(TransitionError::Invalid { id: self.id, from, to });
        }
        tracing::debug!(block_id = %self.id, ?from, ?to, "Block status changed");
        self.status = to;
        Ok(())
    }
}
