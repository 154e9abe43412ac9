//! Live device connection.
//!
//! One [`ConnectionManager`] owns at most one TCP connection. While connected it
//! runs a reader task, a heartbeat timer and a quality timer. When the peer goes
//! away it reconnects with linear backoff (`retry_interval_ms × attempt`) until
//! `max_retries` attempts have failed.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                                         -> Reconnecting -> Connecting
//! ```

pub mod diagnostics;
mod quality;

pub use diagnostics::{check_network_configuration, DiagnosticResult, Severity};
pub use quality::{stability_score, ConnectionQuality};

use crate::config::{ConnectionConfig, ConnectionConfigUpdate};
use crate::error::{LinkError, Result};
use crate::events::{DisconnectReason, EventBus, NetworkEvent, NetworkEventKind};
use crate::protocol::{network_config_request, WifiSettings};
use chrono::Utc;
use quality::QualityTracker;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Payload of one heartbeat probe
const HEARTBEAT: [u8; 1] = [0x00];

/// Pause between teardown and connect in `force_reconnect`
pub const FORCE_RECONNECT_SETTLE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct LiveConnection {
    host: String,
    port: u16,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    /// Cancelled on teardown; stops the reader and fails in-flight sends
    token: CancellationToken,
    /// Child of `token`; replaced when timer intervals change
    timers: CancellationToken,
    generation: u64,
}

struct Inner {
    config: RwLock<ConnectionConfig>,
    state: Mutex<ConnectionState>,
    live: Mutex<Option<LiveConnection>>,
    tracker: Mutex<QualityTracker>,
    events: Arc<EventBus>,
    /// Serializes connect and teardown
    lifecycle: tokio::sync::Mutex<()>,
    reconnect: Mutex<Option<CancellationToken>>,
    /// Cancelled by `disconnect()` to abort a `connect()` still in progress
    connecting: Mutex<Option<CancellationToken>>,
    reconnect_attempts: AtomicU32,
    next_generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Disable Nagle and turn on TCP keep-alive.
fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)
}

impl Inner {
    fn config(&self) -> ConnectionConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            tracing::debug!("Connection state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(token) = lock(&self.reconnect).take() {
            token.cancel();
        }
    }

    /// Register a new connect attempt, aborting any earlier one.
    fn begin_connect(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.connecting).replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn cancel_connect(&self) {
        if let Some(token) = lock(&self.connecting).take() {
            token.cancel();
        }
    }

    /// Open a new connection. The caller holds `lifecycle` and has torn down
    /// any previous connection. Fails with [`LinkError::ConnectionClosed`]
    /// once `cancel` fires.
    async fn establish_locked(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(self.connect_cancelled(host, port));
        }
        self.set_state(ConnectionState::Connecting);
        let config = self.config();
        tracing::info!("Connecting to {}:{}", host, port);

        let connected = tokio::select! {
            _ = cancel.cancelled() => return Err(self.connect_cancelled(host, port)),
            connected = timeout(
                Duration::from_millis(config.connection_timeout_ms),
                TcpStream::connect((host, port)),
            ) => connected,
        };
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(self.connect_failed(LinkError::ConnectionFailed {
                    host: host.to_string(),
                    port,
                    reason: e.to_string(),
                }));
            }
            Err(_) => {
                return Err(self.connect_failed(LinkError::ConnectTimeout {
                    host: host.to_string(),
                    port,
                    ms: config.connection_timeout_ms,
                }));
            }
        };

        if cancel.is_cancelled() {
            return Err(self.connect_cancelled(host, port));
        }

        if config.enable_optimization {
            if let Err(e) = tune_socket(&stream) {
                tracing::warn!("Failed to tune socket for {}:{}: {}", host, port, e);
            }
        }

        let (reader, writer) = stream.into_split();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let timers = token.child_token();
        *lock(&self.live) = Some(LiveConnection {
            host: host.to_string(),
            port,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            token: token.clone(),
            timers: timers.clone(),
            generation,
        });
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        self.spawn_reader(reader, generation, token, config.buffer_size);
        self.spawn_timers(timers, &config);

        tracing::info!("Connected to {}:{}", host, port);
        self.events.publish(
            NetworkEventKind::Connected {
                host: host.to_string(),
                port,
            },
            None,
        );
        Ok(())
    }

    fn connect_failed(&self, error: LinkError) -> LinkError {
        tracing::warn!("{}", error);
        self.set_state(ConnectionState::Disconnected);
        self.events.publish(
            NetworkEventKind::Error {
                operation: "connect".to_string(),
            },
            Some(error.to_string()),
        );
        error
    }

    fn connect_cancelled(&self, host: &str, port: u16) -> LinkError {
        tracing::info!("Connect to {}:{} cancelled", host, port);
        self.set_state(ConnectionState::Disconnected);
        LinkError::ConnectionClosed
    }

    /// Close the live connection, if any. Returns false when already closed.
    fn teardown(&self, reason: DisconnectReason) -> bool {
        let Some(live) = lock(&self.live).take() else {
            self.set_state(ConnectionState::Disconnected);
            return false;
        };
        live.token.cancel();
        self.set_state(ConnectionState::Disconnected);

        tracing::info!("Disconnected from {}:{} ({:?})", live.host, live.port, reason);
        self.events.publish(
            NetworkEventKind::Disconnected {
                host: live.host,
                port: live.port,
                reason,
            },
            None,
        );
        true
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut reader: OwnedReadHalf,
        generation: u64,
        token: CancellationToken,
        buffer_size: usize,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size.max(1)];
            let reason = loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => break "closed by peer".to_string(),
                        Ok(n) => tracing::trace!("Received {} bytes", n),
                        Err(e) => break e.to_string(),
                    },
                }
            };
            drop(reader);
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost(generation, &reason);
            }
        });
    }

    fn spawn_timers(self: &Arc<Self>, timers: CancellationToken, config: &ConnectionConfig) {
        let heartbeat = Duration::from_millis(config.heartbeat_interval_ms.max(1));
        let quality = Duration::from_millis(config.quality_check_interval_ms.max(1));

        spawn_ticker(Arc::downgrade(self), timers.clone(), heartbeat, |inner| async move {
            inner.heartbeat().await;
        });
        spawn_ticker(Arc::downgrade(self), timers, quality, |inner| async move {
            inner.check_quality();
        });
    }

    async fn heartbeat(&self) -> bool {
        match self.send_data(&HEARTBEAT).await {
            Ok(()) => {
                lock(&self.tracker).record_heartbeat(true);
                true
            }
            Err(e) => {
                tracing::warn!("Heartbeat failed: {}", e);
                lock(&self.tracker).record_heartbeat(false);
                self.events.publish(
                    NetworkEventKind::Error {
                        operation: "heartbeat".to_string(),
                    },
                    Some(e.to_string()),
                );
                false
            }
        }
    }

    fn check_quality(&self) {
        let quality = lock(&self.tracker).recompute(Utc::now());
        tracing::debug!(
            "Link quality: {:.1}ms avg, stability {:.0}",
            quality.avg_response_time_ms,
            quality.stability_score
        );
        self.events
            .publish(NetworkEventKind::QualityChanged(quality), None);
    }

    async fn send_data(&self, data: &[u8]) -> Result<()> {
        let (writer, token) = match lock(&self.live).as_ref() {
            Some(live) => (live.writer.clone(), live.token.clone()),
            None => return Err(LinkError::NotConnected),
        };
        let timeout_ms = self.config().connection_timeout_ms;

        let started = Instant::now();
        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(data).await?;
            writer.flush().await
        };
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(LinkError::ConnectionClosed),
            written = timeout(Duration::from_millis(timeout_ms), write) => match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(LinkError::SendFailed { reason: e.to_string() }),
                Err(_) => Err(LinkError::SendTimeout { ms: timeout_ms }),
            },
        };

        if outcome.is_ok() {
            lock(&self.tracker).record_response(started.elapsed(), data.len());
        }
        outcome
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let lost = {
            let mut live = lock(&self.live);
            match live.as_ref() {
                Some(current) if current.generation == generation => live.take(),
                _ => None,
            }
        };
        let Some(lost) = lost else { return };
        lost.token.cancel();

        tracing::warn!("Connection to {}:{} lost: {}", lost.host, lost.port, reason);
        lock(&self.tracker).record_disconnection();
        self.set_state(ConnectionState::Disconnected);
        self.events.publish(
            NetworkEventKind::Disconnected {
                host: lost.host.clone(),
                port: lost.port,
                reason: DisconnectReason::ConnectionLost,
            },
            Some(reason.to_string()),
        );

        if self.config().auto_reconnect {
            self.start_reconnect(lost.host, lost.port);
        }
    }

    fn start_reconnect(self: &Arc<Self>, host: String, port: u16) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.reconnect).replace(token.clone()) {
            previous.cancel();
        }
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else { return };
                let config = inner.config();
                let attempts = inner.reconnect_attempts.load(Ordering::SeqCst);
                if !config.auto_reconnect || attempts >= config.max_retries {
                    tracing::warn!(
                        "Giving up on {}:{} after {} reconnect attempts",
                        host,
                        port,
                        attempts
                    );
                    return;
                }

                let attempt = attempts + 1;
                inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
                lock(&inner.tracker).record_retry();
                let delay_ms = config.retry_interval_ms.saturating_mul(u64::from(attempt));
                inner.set_state(ConnectionState::Reconnecting);
                tracing::info!(
                    "Reconnecting to {}:{} in {}ms (attempt {}/{})",
                    host,
                    port,
                    delay_ms,
                    attempt,
                    config.max_retries
                );
                inner.events.publish(
                    NetworkEventKind::Reconnecting {
                        host: host.clone(),
                        port,
                        attempt,
                        delay_ms,
                    },
                    None,
                );
                drop(inner);

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }

                let Some(inner) = weak.upgrade() else { return };
                let reconnect = async {
                    let _lifecycle = inner.lifecycle.lock().await;
                    if token.is_cancelled() {
                        return Err(LinkError::ConnectionClosed);
                    }
                    inner.establish_locked(&host, port, &token).await
                };
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    result = reconnect => result,
                };
                match result {
                    Ok(()) => return,
                    Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
                }
            }
        });
    }
}

/// Run `tick` every `period` until `token` is cancelled or the manager is dropped.
fn spawn_ticker<F, Fut>(weak: Weak<Inner>, token: CancellationToken, period: Duration, tick: F)
where
    F: Fn(Arc<Inner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    tick(inner).await;
                }
            }
        }
    });
}

/// Owns the connection to one analyzer.
///
/// Dropping the manager closes the connection and stops every background task.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("endpoint", &self.current_endpoint())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                state: Mutex::new(ConnectionState::Disconnected),
                live: Mutex::new(None),
                tracker: Mutex::new(QualityTracker::new()),
                events,
                lifecycle: tokio::sync::Mutex::new(()),
                reconnect: Mutex::new(None),
                connecting: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Connect to `host:port`, closing any existing connection first.
    ///
    /// A `disconnect()` (or a newer `connect()`) issued while this call is
    /// still connecting aborts it with [`LinkError::ConnectionClosed`].
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        if host.trim().is_empty() || port == 0 {
            return Err(LinkError::InvalidAddress(format!("{}:{}", host, port)));
        }
        self.inner.cancel_reconnect();
        let cancel = self.inner.begin_connect();
        let _lifecycle = tokio::select! {
            _ = cancel.cancelled() => return Err(LinkError::ConnectionClosed),
            guard = self.inner.lifecycle.lock() => guard,
        };
        self.inner.teardown(DisconnectReason::Requested);
        self.inner.establish_locked(host, port, &cancel).await
    }

    /// Close the connection. Safe to call repeatedly; only the first call
    /// emits a `disconnected` event. Never triggers a reconnect. A connect
    /// still in progress is aborted rather than waited out.
    pub async fn disconnect(&self) {
        self.inner.cancel_reconnect();
        self.inner.cancel_connect();
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.teardown(DisconnectReason::Requested);
    }

    /// Tear down, wait [`FORCE_RECONNECT_SETTLE_MS`], then connect again.
    pub async fn force_reconnect(&self, host: &str, port: u16) -> Result<()> {
        tracing::info!("Forcing reconnect to {}:{}", host, port);
        self.disconnect().await;
        tokio::time::sleep(Duration::from_millis(FORCE_RECONNECT_SETTLE_MS)).await;
        self.connect(host, port).await
    }

    /// Write `data` and wait for the flush. Fails with
    /// [`LinkError::NotConnected`] when there is no live connection.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.inner.send_data(data).await
    }

    /// Send a WiFi provisioning command over the live connection.
    pub async fn provision_wifi(&self, settings: &WifiSettings) -> Result<()> {
        tracing::info!("Sending WiFi provisioning for SSID {:?}", settings.ssid);
        self.send_data(&network_config_request(settings)).await
    }

    /// One heartbeat probe, as the heartbeat timer sends it.
    pub async fn send_heartbeat(&self) -> bool {
        self.inner.heartbeat().await
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.live).is_some()
    }

    pub fn current_endpoint(&self) -> Option<(String, u16)> {
        lock(&self.inner.live)
            .as_ref()
            .map(|live| (live.host.clone(), live.port))
    }

    /// Snapshot of the link statistics
    pub fn get_connection_quality(&self) -> ConnectionQuality {
        lock(&self.inner.tracker).snapshot()
    }

    pub fn get_configuration(&self) -> ConnectionConfig {
        self.inner.config()
    }

    /// Apply a partial update. Changed timer intervals take effect immediately
    /// on a live connection.
    pub fn set_configuration(&self, update: &ConnectionConfigUpdate) {
        let restart = self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(update);
        if !restart {
            return;
        }

        let timers = {
            let mut live = lock(&self.inner.live);
            let Some(live) = live.as_mut() else { return };
            live.timers.cancel();
            live.timers = live.token.child_token();
            live.timers.clone()
        };
        tracing::debug!("Restarting connection timers with new intervals");
        self.inner.spawn_timers(timers, &self.inner.config());
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn get_network_events(&self, limit: usize) -> Vec<NetworkEvent> {
        self.inner.events.get_events(limit)
    }

    pub async fn run_diagnostics(&self, host: &str, port: u32) -> Vec<DiagnosticResult> {
        diagnostics::run_diagnostics(self, host, port).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.cancel_reconnect();
        self.inner.cancel_connect();
        if let Some(live) = lock(&self.inner.live).take() {
            live.token.cancel();
        }
    }
}
