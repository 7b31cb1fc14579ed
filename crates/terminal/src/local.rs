//! A loopback transport that runs commands on this machine.
//!
//! Useful for trying the resilience and block machinery without a remote
//! host: `open` only accepts local addresses, the session shell echoes what
//! is sent to it, and `exec` runs the command on a local pty.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use blocks::{PtyEvent, PtyHandle, PtySize, PtySpawner};
use connection::{ExecChannel, ExecControl, ExecEvent, Transport, TransportHandle};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use settings::Profile;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::pty::NativePtySpawner;

const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Queue depth of a session's read stream.
const READ_BUFFER: usize = 64;

pub struct LocalTransport {
    spawner: NativePtySpawner,
    sessions: Mutex<FxHashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_handle: AtomicU64,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(NativePtySpawner::default())
    }
}

impl LocalTransport {
    pub fn new(spawner: NativePtySpawner) -> Self {
        Self {
            spawner,
            sessions: Mutex::new(FxHashMap::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn sender(&self, handle: TransportHandle) -> Result<mpsc::Sender<Vec<u8>>> {
        self.sessions
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| anyhow!("connection closed by remote host"))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open(&self, profile: &Profile) -> Result<TransportHandle> {
        let host = profile.host.trim();
        if !LOCAL_HOSTS.contains(&host) {
            bail!("could not resolve hostname {}: local transport only serves localhost", host);
        }

        // The stream is created on read_stream; until then nothing is buffered
        let (tx, _) = mpsc::channel(READ_BUFFER);
        let handle = TransportHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.sessions.lock().insert(handle.0, tx);
        tracing::debug!(handle = handle.0, "Local session opened for {}", profile.destination());
        Ok(handle)
    }

    async fn close(&self, handle: TransportHandle) -> Result<()> {
        if self.sessions.lock().remove(&handle.0).is_some() {
            tracing::debug!(handle = handle.0, "Local session closed");
        }
        Ok(())
    }

    async fn send(&self, handle: TransportHandle, data: &[u8]) -> Result<()> {
        let tx = self.sender(handle)?;
        tx.send(data.to_vec())
            .await
            .map_err(|_| anyhow!("broken pipe: session stream closed"))
    }

    async fn read_stream(&self, handle: TransportHandle) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(READ_BUFFER);
        let mut sessions = self.sessions.lock();
        let slot = sessions
            .get_mut(&handle.0)
            .ok_or_else(|| anyhow!("connection closed by remote host"))?;
        *slot = tx;
        Ok(rx)
    }

    async fn exec(&self, handle: TransportHandle, command: &str) -> Result<ExecChannel> {
        self.sender(handle)?;
        let process = self
            .spawner
            .spawn_pty(command, PtySize::default())
            .await
            .context("exec failed")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut pty_events = process.events;
        tokio::spawn(async move {
            while let Some(event) = pty_events.recv().await {
                let event = match event {
                    PtyEvent::Output(data) => ExecEvent::Output(data),
                    PtyEvent::Exited(code) => ExecEvent::Exit(code),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(ExecChannel {
            control: Arc::new(PtyControl(process.handle)),
            events: rx,
        })
    }

    async fn keepalive(&self, handle: TransportHandle) -> Result<()> {
        let tx = self.sender(handle)?;
        if tx.is_closed() {
            bail!("connection reset by peer");
        }
        Ok(())
    }
}

struct PtyControl(Arc<dyn PtyHandle>);

#[async_trait]
impl ExecControl for PtyControl {
    async fn interrupt(&self) -> Result<()> {
        self.0.interrupt().await
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.0.write(data).await
    }
}
