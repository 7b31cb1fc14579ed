//! Connection resilience controller.
//!
//! Owns one logical session's [`ConnectionState`]: connects through a
//! [`Transport`], classifies failures, schedules automatic retries, runs the
//! health loop and watches network connectivity. All background work is held
//! as task handles and aborted on disconnect or dispose.

use parking_lot::Mutex;
use settings::{ConnectionSettings, Profile};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use util::ResultExt;

use crate::error::{classify, classify_error, ConnectionError, ErrorKind};
use crate::health::HealthPolicy;
use crate::network::{NetworkObserver, NetworkState};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::{ConnectionState, ConnectionStatus, HealthMetrics, SessionId};
use crate::transport::{ExecChannel, Transport, TransportHandle};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Tunables for one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    pub health: HealthPolicy,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

impl ControllerConfig {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            retry: RetryPolicy::from_settings(settings),
            health: HealthPolicy::from_settings(settings),
            connect_timeout: settings.connect_timeout(),
            reconnect_delay: settings.reconnect_delay(),
        }
    }
}

/// Published on the controller's event channel.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionState),
    Error(ConnectionError),
    /// The transport session ended (disconnect or loss).
    Closed { session_id: SessionId },
    DataReceived { session_id: SessionId, data: Vec<u8> },
    HealthUpdate(HealthMetrics),
    NetworkChanged(NetworkState),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("not connected")]
    NotConnected,
    #[error("no profile to connect to")]
    NoProfile,
    #[error("nothing to retry")]
    NothingToRetry,
    #[error("controller disposed")]
    Disposed,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Per-session connection supervisor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResilienceController {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    network: Arc<dyn NetworkObserver>,
    config: ControllerConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    handle: Mutex<Option<TransportHandle>>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    network_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connection attempts.
    connect_lock: tokio::sync::Mutex<()>,
    /// Bumped on teardown; an attempt that started under an older epoch
    /// discards its result.
    epoch: AtomicU64,
    disposed: AtomicBool,
}

impl ResilienceController {
    /// Create a controller and start watching the network.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        network: Arc<dyn NetworkObserver>,
        config: ControllerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::new(config.retry.max_attempts));
        let (events, _) = broadcast::channel(settings::constants::events::CHANNEL_CAPACITY);
        let network_rx = network.subscribe();

        let inner = Arc::new(Inner {
            transport,
            network,
            config,
            state,
            events,
            handle: Mutex::new(None),
            retry_timer: Mutex::new(None),
            health_task: Mutex::new(None),
            reader_task: Mutex::new(None),
            network_task: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        });

        let task = tokio::spawn(watch_network(Arc::downgrade(&inner), network_rx));
        *inner.network_task.lock() = Some(task);

        Self { inner }
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner.snapshot()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.borrow().status()
    }

    pub fn status_text(&self) -> String {
        self.inner.state.borrow().status_text()
    }

    pub fn progress(&self) -> f32 {
        self.inner.state.borrow().progress()
    }

    pub fn can_retry(&self) -> bool {
        self.inner.state.borrow().can_retry()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.state.borrow().session_id()
    }

    /// Connect to `profile`.
    ///
    /// A no-op while another attempt is underway or scheduled. Fails fast
    /// with `NetworkUnreachable` when the device is offline.
    pub async fn connect(&self, profile: Profile) -> Result<(), ControllerError> {
        self.inner.ensure_alive()?;
        let observed = self.status();
        if observed.is_busy() {
            tracing::info!(status = ?observed, "Connect ignored, attempt already in progress");
            return Ok(());
        }

        let _guard = self.inner.connect_lock.lock().await;
        self.inner.ensure_alive()?;
        let status = self.status();
        if status.is_busy() || (status == ConnectionStatus::Connected && observed != status) {
            tracing::info!(?status, "Connect ignored, another attempt got there first");
            return Ok(());
        }
        if status == ConnectionStatus::Connected {
            tracing::info!("Replacing the current session");
            self.inner.teardown().await;
        }
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.attempt_locked(profile, false, false, epoch).await?;
        Ok(())
    }

    /// Drop the connection and cancel all background work. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.teardown().await;
        self.inner.update(|s| s.disconnected());
    }

    /// Tear down and connect again to the last profile.
    pub async fn reconnect(&self) -> Result<(), ControllerError> {
        self.inner.ensure_alive()?;
        self.inner.reconnect().await
    }

    /// Manual retry after a retryable failure. Refused while an attempt is
    /// underway or scheduled.
    pub async fn retry(&self) -> Result<(), ControllerError> {
        self.inner.ensure_alive()?;
        let status = self.status();
        if status.is_busy() {
            tracing::info!(?status, "Retry ignored, attempt already in progress");
            return Err(ControllerError::NothingToRetry);
        }
        if !self.can_retry() {
            return Err(ControllerError::NothingToRetry);
        }
        self.inner.reconnect().await
    }

    /// Run `command` on the remote host.
    pub async fn send_command(&self, command: &str) -> Result<ExecChannel, ControllerError> {
        let handle = self.inner.connected_handle()?;
        let started = Instant::now();
        match self.inner.transport.exec(handle, command).await {
            Ok(channel) => {
                self.inner.record_health(|h| h.record_success(started.elapsed()));
                Ok(channel)
            }
            Err(e) => {
                let error = classify_error(&e);
                tracing::warn!(kind = ?error.kind(), "Command dispatch failed: {:#}", e);
                self.inner.record_health(|h| h.record_failure());
                Err(error.into())
            }
        }
    }

    /// Write raw bytes to the session's shell.
    pub async fn send_data(&self, data: &[u8]) -> Result<(), ControllerError> {
        let handle = self.inner.connected_handle()?;
        let started = Instant::now();
        match self.inner.transport.send(handle, data).await {
            Ok(()) => {
                self.inner.record_health(|h| h.record_success(started.elapsed()));
                Ok(())
            }
            Err(e) => {
                let error = classify_error(&e);
                tracing::warn!(kind = ?error.kind(), "Send failed: {:#}", e);
                self.inner.record_health(|h| h.record_failure());
                Err(error.into())
            }
        }
    }

    /// Forget the last error. A scheduled retry is cancelled.
    pub fn clear_error(&self) {
        self.inner.cancel_retry_timer();
        self.inner.update(|s| {
            if s.status() == ConnectionStatus::Retrying {
                s.disconnected()
            } else {
                s.without_error()
            }
        });
    }

    /// Final teardown: stops the network watcher and disconnects. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        abort_task(&self.inner.network_task);
        self.disconnect().await;
        tracing::debug!("Connection controller disposed");
    }
}

impl Inner {
    fn snapshot(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn ensure_alive(&self) -> Result<(), ControllerError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(ControllerError::Disposed)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Replace the state with `f(current)` and publish it if it changed.
    fn update(&self, f: impl FnOnce(ConnectionState) -> ConnectionState) {
        let mut published = None;
        self.state.send_if_modified(|state| {
            let next = f(state.clone());
            if next == *state {
                return false;
            }
            if next.status() != state.status() {
                tracing::debug!(from = ?state.status(), to = ?next.status(), "Connection status changed");
            }
            *state = next.clone();
            published = Some(next);
            true
        });
        if let Some(next) = published {
            self.emit(ConnectionEvent::StatusChanged(next));
        }
    }

    fn connected_handle(&self) -> Result<TransportHandle, ControllerError> {
        if self.state.borrow().status() != ConnectionStatus::Connected {
            return Err(ControllerError::NotConnected);
        }
        (*self.handle.lock()).ok_or(ControllerError::NotConnected)
    }

    fn record_health(&self, f: impl FnOnce(&HealthMetrics) -> HealthMetrics) {
        let mut metrics = None;
        self.update(|s| {
            if s.status() != ConnectionStatus::Connected {
                return s;
            }
            let next = f(s.health());
            metrics = Some(next.clone());
            s.with_health(next)
        });
        if let Some(metrics) = metrics {
            self.emit(ConnectionEvent::HealthUpdate(metrics));
        }
    }

    /// One connection attempt. `epoch` is the teardown generation the caller
    /// observed; a teardown in the meantime cancels the attempt.
    async fn attempt(
        self: &Arc<Self>,
        profile: Profile,
        is_retry: bool,
        auto: bool,
        epoch: u64,
    ) -> Result<(), ConnectionError> {
        let _guard = self.connect_lock.lock().await;
        self.attempt_locked(profile, is_retry, auto, epoch).await
    }

    /// [`Inner::attempt`] for callers already holding `connect_lock`.
    async fn attempt_locked(
        self: &Arc<Self>,
        profile: Profile,
        is_retry: bool,
        auto: bool,
        epoch: u64,
    ) -> Result<(), ConnectionError> {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(ConnectionError::new(
                ErrorKind::Cancelled,
                "connection attempt cancelled",
            ));
        }

        self.update(|s| s.connecting(profile.clone(), is_retry, auto));
        let attempt = self.state.borrow().retry_count();
        tracing::info!(
            attempt,
            auto,
            "Connecting to {}",
            profile.destination()
        );

        if !self.network.current().connected {
            let error = ConnectionError::new(ErrorKind::NetworkUnreachable, "network offline");
            self.fail(error.clone());
            return Err(error);
        }

        if let Err(e) = profile.validate() {
            let error = classify(&e.to_string());
            self.fail(error.clone());
            return Err(error);
        }
        self.update(|s| s.with_progress(0.3));

        let timeout = self.config.connect_timeout;
        let opened = match tokio::time::timeout(timeout, self.transport.open(&profile)).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(classify_error(&e.context("Failed to open transport"))),
            Err(_) => Err(ConnectionError::new(
                ErrorKind::ConnectionTimeout,
                format!("connect timed out after {}s", timeout.as_secs()),
            )),
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            if let Ok(handle) = opened {
                self.transport.close(handle).await.log_err();
            }
            tracing::debug!("Discarding connection attempt after teardown");
            return Err(ConnectionError::new(
                ErrorKind::Cancelled,
                "connection attempt cancelled",
            ));
        }

        match opened {
            Ok(handle) => {
                let session_id = SessionId::new();
                *self.handle.lock() = Some(handle);
                self.update(|s| s.connected(session_id));
                tracing::info!(%session_id, "Connected to {}", profile.destination());
                self.start_reader(handle, session_id, epoch).await;
                self.start_health(handle, session_id);
                Ok(())
            }
            Err(error) => {
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    /// Enter the error state and schedule a retry when the policy allows.
    fn fail(self: &Arc<Self>, error: ConnectionError) {
        tracing::warn!(
            kind = ?error.kind(),
            retryable = error.is_retryable(),
            "Connection failed: {}",
            error.detail()
        );
        self.update(|s| s.failed(error.clone()));
        self.emit(ConnectionEvent::Error(error.clone()));
        self.maybe_schedule_retry(&error);
    }

    fn maybe_schedule_retry(self: &Arc<Self>, error: &ConnectionError) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let retry_count = self.state.borrow().retry_count();
        let online = self.network.current().connected;

        let mut timer = self.retry_timer.lock();
        let pending = timer.as_ref().is_some_and(|t| !t.is_finished());
        match self.config.retry.decide(error, retry_count, online, pending) {
            RetryDecision::Skip(reason) => {
                tracing::debug!(attempt = retry_count, "Not scheduling retry: {}", reason);
            }
            RetryDecision::Schedule(delay) => {
                tracing::info!(
                    attempt = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling retry"
                );
                self.update(|s| s.retrying(SystemTime::now() + delay));
                *timer = Some(tokio::spawn(retry_after(Arc::downgrade(self), delay)));
            }
        }
    }

    fn cancel_retry_timer(&self) {
        abort_task(&self.retry_timer);
    }

    async fn start_reader(self: &Arc<Self>, handle: TransportHandle, session_id: SessionId, epoch: u64) {
        match self.transport.read_stream(handle).await {
            Ok(rx) => {
                let task = tokio::spawn(forward_reads(Arc::downgrade(self), rx, session_id, epoch));
                *self.reader_task.lock() = Some(task);
            }
            Err(e) => {
                tracing::warn!(%session_id, "No read stream for session: {:#}", e);
            }
        }
    }

    fn start_health(self: &Arc<Self>, handle: TransportHandle, session_id: SessionId) {
        let task = tokio::spawn(health_loop(Arc::downgrade(self), handle, session_id));
        *self.health_task.lock() = Some(task);
    }

    /// Cancel timers and tasks, then close the transport. Safe to repeat.
    async fn teardown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel_retry_timer();
        abort_task(&self.health_task);
        abort_task(&self.reader_task);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.transport.close(handle).await.log_err();
            let session_id = self.state.borrow().session_id();
            if let Some(session_id) = session_id {
                tracing::info!(%session_id, "Disconnected");
                self.emit(ConnectionEvent::Closed { session_id });
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Result<(), ControllerError> {
        let profile = self
            .state
            .borrow()
            .profile()
            .cloned()
            .ok_or(ControllerError::NoProfile)?;

        self.teardown().await;
        self.update(|s| s.disconnected().reconnecting());
        let epoch = self.epoch.load(Ordering::SeqCst);

        tokio::time::sleep(self.config.reconnect_delay).await;
        self.attempt(profile, true, false, epoch).await?;
        Ok(())
    }

    /// The session stream ended while we believed we were connected.
    async fn connection_lost(self: &Arc<Self>, session_id: SessionId, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch
            || self.state.borrow().session_id() != Some(session_id)
        {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        abort_task(&self.health_task);
        // Called from the reader task itself; drop its handle without aborting
        self.reader_task.lock().take();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.transport.close(handle).await.log_debug("close after loss");
        }
        self.emit(ConnectionEvent::Closed { session_id });

        let kind = if self.network.current().connected {
            ErrorKind::HostUnreachable
        } else {
            ErrorKind::NetworkUnreachable
        };
        tracing::warn!(%session_id, "Session stream closed unexpectedly");
        self.fail(ConnectionError::new(kind, "connection lost"));
    }

    fn on_network_restored(self: &Arc<Self>) {
        let state = self.snapshot();
        if state.status() != ConnectionStatus::Error {
            return;
        }
        if let Some(error) = state.error().filter(|e| e.should_auto_retry()) {
            tracing::info!("Network restored, retrying connection");
            self.maybe_schedule_retry(error);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for slot in [
            &self.retry_timer,
            &self.health_task,
            &self.reader_task,
            &self.network_task,
        ] {
            abort_task(slot);
        }
    }
}

fn abort_task(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(task) = slot.lock().take() {
        task.abort();
    }
}

fn retry_after(inner: Weak<Inner>, delay: Duration) -> BoxFuture {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        // This task is the pending timer; free the slot so a failure can
        // schedule the next one.
        inner.retry_timer.lock().take();

        let (status, profile) = {
            let state = inner.state.borrow();
            (state.status(), state.profile().cloned())
        };
        let Some(profile) = profile else {
            return;
        };
        if status != ConnectionStatus::Retrying {
            return;
        }
        let epoch = inner.epoch.load(Ordering::SeqCst);
        if let Err(e) = inner.attempt(profile, true, true, epoch).await {
            tracing::debug!(kind = ?e.kind(), "Retry attempt failed");
        }
    })
}

fn forward_reads(
    inner: Weak<Inner>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    session_id: SessionId,
    epoch: u64,
) -> BoxFuture {
    Box::pin(async move {
        while let Some(data) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.emit(ConnectionEvent::DataReceived { session_id, data });
        }
        if let Some(inner) = inner.upgrade() {
            inner.connection_lost(session_id, epoch).await;
        }
    })
}

fn health_loop(inner: Weak<Inner>, handle: TransportHandle, session_id: SessionId) -> BoxFuture {
    Box::pin(async move {
        let Some(interval) = inner.upgrade().map(|i| i.config.health.interval) else {
            return;
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };

            let started = Instant::now();
            let check =
                tokio::time::timeout(inner.config.health.timeout, inner.transport.keepalive(handle))
                    .await;
            match check {
                Ok(Ok(())) => inner.record_health(|h| h.record_success(started.elapsed())),
                Ok(Err(e)) => {
                    tracing::debug!(%session_id, "Keepalive failed: {:#}", e);
                    inner.record_health(|h| h.record_failure());
                }
                Err(_) => {
                    tracing::debug!(%session_id, "Keepalive timed out");
                    inner.record_health(|h| h.record_failure());
                }
            }

            let health = inner.state.borrow().health().clone();
            if inner.config.health.should_reconnect(&health) {
                tracing::warn!(
                    %session_id,
                    failures = health.consecutive_failures,
                    "Connection degraded, reconnecting"
                );
                tokio::spawn(proactive_reconnect(Arc::downgrade(&inner)));
                return;
            }
        }
    })
}

fn proactive_reconnect(inner: Weak<Inner>) -> BoxFuture {
    Box::pin(async move {
        if let Some(inner) = inner.upgrade() {
            inner.reconnect().await.log_err();
        }
    })
}

fn watch_network(inner: Weak<Inner>, mut rx: watch::Receiver<NetworkState>) -> BoxFuture {
    Box::pin(async move {
        let mut was_connected = rx.borrow_and_update().connected;
        while rx.changed().await.is_ok() {
            let network = *rx.borrow_and_update();
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.emit(ConnectionEvent::NetworkChanged(network));
            if network.connected && !was_connected {
                inner.on_network_restored();
            }
            was_connected = network.connected;
        }
    })
}
