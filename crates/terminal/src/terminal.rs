//! Local process plumbing.
//!
//! Native pseudo-terminals for interactive blocks, and a loopback
//! [`connection::Transport`] that runs commands on this machine.

mod local;
mod pty;

pub use local::LocalTransport;
pub use pty::{NativePty, NativePtySpawner};
