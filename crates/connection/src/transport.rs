//! The raw SSH transport seam.

use anyhow::Result;
use async_trait::async_trait;
use settings::Profile;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opaque handle for an open transport session, issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

/// Output of a command started with [`Transport::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Output(Vec<u8>),
    /// The remote process exited. Always the last event when present; a
    /// stream that ends without it means the transport failed mid-command.
    Exit(i32),
}

/// Input side of a running command.
#[async_trait]
pub trait ExecControl: Send + Sync {
    /// Cooperative interrupt (the remote side sees Ctrl+C).
    async fn interrupt(&self) -> Result<()>;

    /// Forward raw input bytes to the command.
    async fn write(&self, data: &[u8]) -> Result<()>;
}

/// A running remote command.
pub struct ExecChannel {
    pub control: Arc<dyn ExecControl>,
    pub events: mpsc::UnboundedReceiver<ExecEvent>,
}

/// Byte-level SSH transport.
///
/// Implementations own the actual network session; the controller only sees
/// handles. Errors are returned raw and classified by the caller.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, profile: &Profile) -> Result<TransportHandle>;

    async fn close(&self, handle: TransportHandle) -> Result<()>;

    async fn send(&self, handle: TransportHandle, data: &[u8]) -> Result<()>;

    /// Bytes arriving on the session's shell. The stream ends when the
    /// session is gone.
    async fn read_stream(&self, handle: TransportHandle) -> Result<mpsc::Receiver<Vec<u8>>>;

    async fn exec(&self, handle: TransportHandle, command: &str) -> Result<ExecChannel>;

    /// Cheap round trip used by the health loop.
    async fn keepalive(&self, handle: TransportHandle) -> Result<()>;
}
