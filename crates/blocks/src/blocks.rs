//! Command blocks: classification, lifecycle, focus and interactive sessions.

pub mod active;
pub mod block;
pub mod classify;
pub mod interactive;

pub use active::{
    ActiveBlockManager, BlockError, BlockEvent, BlockExecution, FocusError, FocusTarget, InputRoute,
};
pub use block::{Affordances, Block, BlockId, BlockStatus, OutputBuffer, TransitionError};
pub use classify::{interactive_kind, program_name, CommandClass, CommandClassifier, InteractiveKind};
pub use interactive::{
    InteractiveError, InteractiveSession, InteractiveSessionController, InteractiveSessionId,
    InteractiveStatus, PtyEvent, PtyHandle, PtyProcess, PtySize, PtySpawner,
};
