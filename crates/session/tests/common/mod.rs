//! Shared test utilities for session integration tests.
//!
//! Fakes for the three collaborators a [`session::Session`] consumes: a
//! scripted transport, a manually driven network monitor and a pty spawner
//! whose processes are controlled by the test.

// Not every test file uses every helper
#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use blocks::{PtyEvent, PtyHandle, PtyProcess, PtySize, PtySpawner};
use connection::{
    ExecChannel, ExecControl, ExecEvent, NetworkMonitor, Transport, TransportHandle,
};
use parking_lot::Mutex;
use session::{Session, SessionDeps};
use settings::{Config, Profile};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use tempfile::{tempdir, TempDir};

/// Default timeout for async test operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Let spawned tasks run to their next await point.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub fn profile() -> Profile {
    Profile::new("pi", "192.168.1.10", "pi")
}

// ============================================================================
// Scripted Transport
// ============================================================================

/// A remote command started through [`ScriptedTransport::exec`].
pub struct RemoteCommand {
    pub command: String,
    pub control: Arc<RecordingExec>,
    events: Mutex<Option<mpsc::UnboundedSender<ExecEvent>>>,
}

impl RemoteCommand {
    pub fn output(&self, data: &str) {
        if let Some(tx) = self.events.lock().as_ref() {
            tx.send(ExecEvent::Output(data.as_bytes().to_vec())).ok();
        }
    }

    pub fn exit(&self, code: i32) {
        if let Some(tx) = self.events.lock().take() {
            tx.send(ExecEvent::Exit(code)).ok();
        }
    }

    /// End the channel without an exit status.
    pub fn hang_up(&self) {
        self.events.lock().take();
    }
}

/// Exec control that records what the session sends to it.
#[derive(Default)]
pub struct RecordingExec {
    pub interrupts: AtomicUsize,
    pub input: Mutex<Vec<u8>>,
}

#[async_trait]
impl ExecControl for RecordingExec {
    async fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.input.lock().extend_from_slice(data);
        Ok(())
    }
}

/// Transport whose `open` results are scripted in order; once the script
/// runs out every open succeeds. Exec'd commands stay running until the test
/// drives them.
#[derive(Default)]
pub struct ScriptedTransport {
    opens: Mutex<VecDeque<String>>,
    pub open_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub keepalive_ok: AtomicBool,
    pub exec_fails: AtomicBool,
    pub sent: Mutex<Vec<u8>>,
    streams: Mutex<Vec<mpsc::Sender<Vec<u8>>>>,
    commands: Mutex<Vec<Arc<RemoteCommand>>>,
    next_handle: AtomicU64,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Self::with_failures(&[])
    }

    pub fn with_failures(failures: &[&str]) -> Arc<Self> {
        let transport = Self {
            keepalive_ok: AtomicBool::new(true),
            ..Self::default()
        };
        transport
            .opens
            .lock()
            .extend(failures.iter().map(|f| f.to_string()));
        Arc::new(transport)
    }

    /// Simulate the remote end going away.
    pub fn drop_streams(&self) {
        self.streams.lock().clear();
    }

    pub fn commands(&self) -> Vec<Arc<RemoteCommand>> {
        self.commands.lock().clone()
    }

    pub fn last_command(&self) -> Option<Arc<RemoteCommand>> {
        self.commands.lock().last().cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _profile: &Profile) -> Result<TransportHandle> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.opens.lock().pop_front() {
            return Err(anyhow!(failure));
        }
        Ok(TransportHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn close(&self, _handle: TransportHandle) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, _handle: TransportHandle, data: &[u8]) -> Result<()> {
        self.sent.lock().extend_from_slice(data);
        Ok(())
    }

    async fn read_stream(&self, _handle: TransportHandle) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().push(tx);
        Ok(rx)
    }

    async fn exec(&self, _handle: TransportHandle, command: &str) -> Result<ExecChannel> {
        if self.exec_fails.load(Ordering::SeqCst) {
            bail!("channel open failed: connection reset by peer");
        }
        let (tx, events) = mpsc::unbounded_channel();
        let control = Arc::new(RecordingExec::default());
        self.commands.lock().push(Arc::new(RemoteCommand {
            command: command.to_string(),
            control: control.clone(),
            events: Mutex::new(Some(tx)),
        }));
        Ok(ExecChannel { control, events })
    }

    async fn keepalive(&self, _handle: TransportHandle) -> Result<()> {
        if self.keepalive_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("keepalive: no response"))
        }
    }
}

// ============================================================================
// Fake Pty
// ============================================================================

/// Pty double: records input and lets the test drive output and exit.
#[derive(Default)]
pub struct FakePty {
    pub command: String,
    pub written: Mutex<Vec<u8>>,
    pub interrupts: AtomicUsize,
    pub killed: AtomicBool,
    pub size: Mutex<Option<PtySize>>,
    events: Mutex<Option<mpsc::UnboundedSender<PtyEvent>>>,
}

impl FakePty {
    pub fn output(&self, data: &str) {
        self.emit(PtyEvent::Output(data.as_bytes().to_vec()));
    }

    pub fn exit(&self, code: i32) {
        self.emit(PtyEvent::Exited(code));
        self.events.lock().take();
    }

    fn emit(&self, event: PtyEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            tx.send(event).ok();
        }
    }
}

#[async_trait]
impl PtyHandle for FakePty {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.written.lock().extend_from_slice(data);
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resize(&self, size: PtySize) -> Result<()> {
        *self.size.lock() = Some(size);
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit(130);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSpawner {
    spawned: Mutex<Vec<Arc<FakePty>>>,
    pub fail: AtomicBool,
}

impl FakeSpawner {
    pub fn last(&self) -> Option<Arc<FakePty>> {
        self.spawned.lock().last().cloned()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }
}

#[async_trait]
impl PtySpawner for FakeSpawner {
    async fn spawn_pty(&self, command: &str, size: PtySize) -> Result<PtyProcess> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("openpty: out of pty devices");
        }
        let (tx, events) = mpsc::unbounded_channel();
        let pty = Arc::new(FakePty {
            command: command.to_string(),
            size: Mutex::new(Some(size)),
            events: Mutex::new(Some(tx)),
            ..FakePty::default()
        });
        self.spawned.lock().push(pty.clone());
        Ok(PtyProcess { handle: pty, events })
    }
}

// ============================================================================
// Test Harness
// ============================================================================

/// A session over fakes, with handles to drive each fake.
pub struct Harness {
    pub session: Session,
    pub transport: Arc<ScriptedTransport>,
    pub network: Arc<NetworkMonitor>,
    pub spawner: Arc<FakeSpawner>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_transport(ScriptedTransport::new(), Config::default())
    }

    pub fn with_transport(transport: Arc<ScriptedTransport>, config: Config) -> Self {
        let network = Arc::new(NetworkMonitor::default());
        let spawner = Arc::new(FakeSpawner::default());
        let session = Session::new(
            SessionDeps {
                transport: transport.clone(),
                network: network.clone(),
                spawner: spawner.clone(),
            },
            &config,
        );
        Self {
            session,
            transport,
            network,
            spawner,
        }
    }

    /// A harness already connected to [`profile`].
    pub async fn connected() -> Self {
        let harness = Self::new();
        harness
            .session
            .connect(profile())
            .await
            .expect("connect over the scripted transport");
        harness
    }
}
