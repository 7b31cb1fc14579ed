//! PTY process management.

use anyhow::{Context, Result};
use async_trait::async_trait;
use blocks::{PtyEvent, PtyHandle, PtyProcess, PtySize, PtySpawner};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtyPair};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How long to wait for trailing output once the child has been reaped.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// End-of-text, what the terminal sends for Ctrl+C.
const ETX: u8 = 0x03;

/// Spawns commands on local pseudo-terminals.
///
/// Each command runs through `$SHELL -c` (falling back to `/bin/sh`) so
/// pipelines and globs behave the way they do at a prompt.
#[derive(Debug, Clone)]
pub struct NativePtySpawner {
    shell: String,
}

impl Default for NativePtySpawner {
    fn default() -> Self {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        Self { shell }
    }
}

impl NativePtySpawner {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn spawn(&self, command: &str, size: PtySize) -> Result<PtyProcess> {
        let pty_system = native_pty_system();

        let PtyPair { master, slave } = pty_system
            .openpty(pty_size(size))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.args(["-c", command]);
        cmd.env("TERM", "xterm-256color");
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let mut child = slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {:?}", command))?;
        // Only the child keeps the slave open, so the reader sees EOF on exit
        drop(slave);

        let writer = master.take_writer().context("Failed to get PTY writer")?;
        let mut reader = master
            .try_clone_reader()
            .context("Failed to get PTY reader")?;
        let killer = child.clone_killer();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));

        // Read PTY output until EOF
        let output_tx = events_tx.clone();
        let reader_thread = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            break; // Channel closed
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Reap the child, then report the exit after the output drains
        let exited_flag = exited.clone();
        let pid = child.process_id();
        thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    tracing::debug!("Wait for child process: {}", e);
                    -1
                }
            };
            exited_flag.store(true, Ordering::SeqCst);
            // A background grandchild can hold the pty open past the exit,
            // so give the reader a short window and then stop waiting on it
            let drain_until = Instant::now() + EXIT_DRAIN_GRACE;
            while !reader_thread.is_finished() && Instant::now() < drain_until {
                thread::sleep(Duration::from_millis(10));
            }
            if reader_thread.is_finished() {
                if reader_thread.join().is_err() {
                    tracing::debug!("PTY reader thread panicked");
                }
            } else {
                tracing::debug!(?pid, "PTY still held open after exit, detaching reader");
            }
            tracing::debug!(?pid, code, "PTY child exited");
            let _ = events_tx.send(PtyEvent::Exited(code));
        });

        let handle = NativePty {
            master: Mutex::new(master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            exited,
        };

        Ok(PtyProcess {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

#[async_trait]
impl PtySpawner for NativePtySpawner {
    async fn spawn_pty(&self, command: &str, size: PtySize) -> Result<PtyProcess> {
        let process = self.spawn(command, size)?;
        tracing::debug!(rows = size.rows, cols = size.cols, "Spawned {:?} on a pty", command);
        Ok(process)
    }
}

/// A running pty child. Killed on drop if it is still alive.
pub struct NativePty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
}

impl NativePty {
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data).context("Failed to write to PTY")?;
        writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }
}

#[async_trait]
impl PtyHandle for NativePty {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_all(data)
    }

    async fn interrupt(&self) -> Result<()> {
        self.write_all(&[ETX])
    }

    async fn resize(&self, size: PtySize) -> Result<()> {
        self.master
            .lock()
            .resize(pty_size(size))
            .context("Failed to resize PTY")
    }

    async fn kill(&self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.killer.lock().kill().context("Failed to kill PTY child")
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if self.has_exited() {
            return;
        }
        // ESRCH (no such process) is expected if it exited meanwhile
        if let Err(e) = self.killer.lock().kill() {
            tracing::debug!("Kill child process: {}", e);
        }
        tracing::debug!("PTY handle dropped, child process killed");
    }
}

fn pty_size(size: PtySize) -> portable_pty::PtySize {
    portable_pty::PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
