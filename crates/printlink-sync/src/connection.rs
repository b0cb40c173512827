//! # Connection
//!
//! One supervised control-plane session per printer, with versioned
//! reconnects.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Connection States                                  │
//! │                                                                         │
//! │  ┌────────────┐    dial     ┌────────────┐   connected   ┌──────────┐  │
//! │  │Disconnected│ ──────────► │ Connecting │ ────────────► │  Online  │  │
//! │  └────────────┘             └─────┬──────┘               └────┬─────┘  │
//! │        ▲                          │                           │        │
//! │        │      dial error /        │         watchdog /        │        │
//! │        │      handshake timeout   │         transport error   │        │
//! │        │                          ▼                           ▼        │
//! │        │                    ┌───────────────────────────────────┐      │
//! │        └─── backoff ─────── │ fault: version += 1, emit Lost    │      │
//! │                             └───────────────────────────────────┘      │
//! │                                                                         │
//! │  stop() or close code 4000-4999 from any state ──► Closing (terminal)  │
//! │                                                                         │
//! │  ONLINE TASKS (one select loop)                                        │
//! │  ──────────────────────────────                                        │
//! │  • forward outbound envelopes tagged with the live version             │
//! │  • read and dispatch inbound frames, reset the watchdog on each        │
//! │  • send transport pings at `ping_interval`                             │
//! │  • fault when no inbound traffic arrives within `watchdog_timeout`     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Versioning
//! `version` starts at 1 and increases on every fault. Callers tag each
//! outbound envelope with the version they observed; the loop drops
//! anything tagged with an older one, so a message built for a dead
//! transport never reaches its successor.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use printlink_core::PrinterConfig;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Envelope, ServerMessage, REJECTION_CLOSE_CODES};

// =============================================================================
// Connection State
// =============================================================================

/// Observable state of the connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting out a backoff, or not started yet.
    Disconnected,

    /// Dialing or waiting for the `connected` handshake.
    Connecting,

    /// Handshake done; outbound traffic flows.
    Online,

    /// Stopped. Terminal.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Online => write!(f, "online"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

// =============================================================================
// Connection Configuration
// =============================================================================

/// Configuration for one connection loop.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Control-plane base URL; credentials are appended as query parameters.
    pub url: String,

    pub connect_timeout: Duration,

    /// Time allowed between transport open and the `connected` message.
    pub handshake_timeout: Duration,

    /// Fault after this long without any inbound frame.
    pub watchdog_timeout: Duration,

    pub ping_interval: Duration,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// Random extra delay as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            url: "wss://ws.printlink.io/0/p".to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            watchdog_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// What the printer presents when it dials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub identity: Option<u64>,
    pub token: Option<String>,
}

impl Credentials {
    pub fn from_config(config: &PrinterConfig) -> Self {
        Credentials {
            identity: config.identity(),
            token: config.token.clone(),
        }
    }
}

/// Builds the dial URL.
///
/// Missing parts are sent as `0`, which asks the server for a fresh
/// credential.
pub fn build_url(base: &str, credentials: &Credentials) -> SyncResult<Url> {
    let mut url = Url::parse(base)?;
    let identity = credentials
        .identity
        .map(|id| id.to_string())
        .unwrap_or_else(|| "0".to_string());
    let token = credentials.token.as_deref().unwrap_or("0");

    url.query_pairs_mut()
        .append_pair("id", &identity)
        .append_pair("token", token);
    Ok(url)
}

// =============================================================================
// Transport Seam
// =============================================================================

/// Close frame details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// True for application codes that mean "registration refused".
    pub fn is_rejection(&self) -> bool {
        REJECTION_CLOSE_CODES.contains(&self.code)
    }
}

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseInfo>),
}

/// An open, bidirectional message transport.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> SyncResult<()>;

    /// Next inbound frame. `None` once the peer is gone.
    async fn recv(&mut self) -> Option<SyncResult<Frame>>;

    async fn close(&mut self) -> SyncResult<()>;
}

/// Opens transports.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &Url) -> SyncResult<Box<dyn Transport>>;
}

/// Dials the control-plane over WebSocket (ws:// or wss://).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &Url) -> SyncResult<Box<dyn Transport>> {
        let (stream, response) = connect_async(url.as_str()).await?;
        debug!(status = ?response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsTransport { stream }))
    }
}

/// [`Transport`] over a tungstenite stream.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> SyncResult<()> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Ping(data) => WsMessage::Ping(data.into()),
            Frame::Pong(data) => WsMessage::Pong(data.into()),
            Frame::Close(info) => WsMessage::Close(info.map(|i| CloseFrame {
                code: CloseCode::from(i.code),
                reason: i.reason.into(),
            })),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<SyncResult<Frame>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => Frame::Text(text.to_string()),
                Ok(WsMessage::Ping(data)) => Frame::Ping(data.to_vec()),
                Ok(WsMessage::Pong(data)) => Frame::Pong(data.to_vec()),
                Ok(WsMessage::Close(frame)) => Frame::Close(frame.map(|f| CloseInfo {
                    code: u16::from(f.code),
                    reason: f.reason.to_string(),
                })),
                Ok(WsMessage::Binary(_)) => {
                    warn!("Ignoring unexpected binary frame");
                    continue;
                }
                Ok(WsMessage::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) -> SyncResult<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Reconnect Backoff
// =============================================================================

/// Capped exponential reconnect delays with additive jitter.
///
/// The base delay doubles per attempt up to `max`; jitter adds up to
/// `jitter * base` on top, and the sum is capped at `max` again.
pub struct ReconnectBackoff {
    inner: ExponentialBackoff,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        let mut inner = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        };
        inner.reset();

        ReconnectBackoff {
            inner,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.initial_backoff, config.max_backoff, config.jitter)
    }

    /// Next delay before jitter.
    pub fn next_base(&mut self) -> Duration {
        self.attempt += 1;
        let base = self.inner.next_backoff().unwrap_or(self.max);
        // Whole milliseconds; the underlying randomizer can add a nanosecond.
        Duration::from_millis(base.as_millis() as u64).min(self.max)
    }

    /// Next delay including jitter, never above the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base();
        let extra = if self.jitter > 0.0 {
            base.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter))
        } else {
            Duration::ZERO
        };
        (base + extra).min(self.max)
    }

    /// Consecutive faults since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.inner.reset();
        self.attempt = 0;
    }
}

// =============================================================================
// Events & Handle
// =============================================================================

/// What the connection loop reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Handshake finished on this version.
    Established { version: u64 },

    /// The transport of `version` faulted. A new version is being dialed.
    Lost { version: u64, reason: String },

    /// One inbound message, in arrival order.
    Message { version: u64, message: ServerMessage },

    /// The server refused the registration. The loop has stopped.
    Rejected {
        version: u64,
        code: u16,
        reason: String,
    },
}

#[derive(Debug)]
struct Outbound {
    version: u64,
    envelope: Envelope,
}

/// Handle to a running connection loop.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outgoing_tx: mpsc::Sender<Outbound>,
    state_rx: watch::Receiver<ConnectionState>,
    version_rx: watch::Receiver<u64>,
    credentials_tx: Arc<watch::Sender<Credentials>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ConnectionHandle {
    /// Queues an envelope for the transport of `version`.
    ///
    /// Fails without queueing when `version` is no longer live or the
    /// connection is not online.
    pub fn send(&self, envelope: Envelope, version: u64) -> SyncResult<()> {
        let current = self.version();
        if version != current {
            return Err(SyncError::StaleVersion {
                tagged: version,
                current,
            });
        }
        if !self.is_online() {
            return Err(SyncError::NotOnline);
        }

        self.outgoing_tx
            .try_send(Outbound { version, envelope })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SyncError::ChannelError("outbound queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => SyncError::ShuttingDown,
            })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn version(&self) -> u64 {
        *self.version_rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectionState::Online
    }

    /// Credentials used from the next dial on.
    pub fn set_credentials(&self, credentials: Credentials) {
        self.credentials_tx.send_replace(credentials);
    }

    /// Asks the loop to stop without waiting for it.
    pub fn request_shutdown(&self) {
        // A full queue means a stop is already pending.
        let _ = self.shutdown_tx.try_send(());
    }

    /// Stops the loop and waits until it has closed the transport.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        self.closed().await;
    }

    /// Resolves once the loop reached [`ConnectionState::Closing`].
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|state| *state == ConnectionState::Closing)
            .await;
    }
}

// =============================================================================
// Connection Loop
// =============================================================================

enum Exit {
    Fault(SyncError),
    Rejected(CloseInfo),
    Shutdown,
}

/// The connection loop task.
pub struct Connection {
    config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    version: u64,
    backoff: ReconnectBackoff,
    state_tx: watch::Sender<ConnectionState>,
    version_tx: watch::Sender<u64>,
    credentials_rx: watch::Receiver<Credentials>,
    outgoing_rx: mpsc::Receiver<Outbound>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Connection {
    /// Spawns the loop. It starts dialing at once with version 1.
    pub fn spawn(
        config: ConnectionConfig,
        credentials: Credentials,
        dialer: Arc<dyn Dialer>,
    ) -> (ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (version_tx, version_rx) = watch::channel(1u64);
        let (credentials_tx, credentials_rx) = watch::channel(credentials);

        let connection = Connection {
            backoff: ReconnectBackoff::from_config(&config),
            config,
            dialer,
            version: 1,
            state_tx,
            version_tx,
            credentials_rx,
            outgoing_rx,
            events_tx,
            shutdown_rx,
        };

        tokio::spawn(connection.run());

        let handle = ConnectionHandle {
            outgoing_tx,
            state_rx,
            version_rx,
            credentials_tx: Arc::new(credentials_tx),
            shutdown_tx,
        };

        (handle, events_rx)
    }

    async fn run(mut self) {
        info!(url = %self.config.url, "Connection starting");

        loop {
            self.set_state(ConnectionState::Connecting);
            let mut established = false;

            let exit = match self.connect().await {
                Ok((mut transport, connected)) => {
                    self.set_state(ConnectionState::Online);
                    self.backoff.reset();
                    established = true;
                    info!(version = self.version, "Connection online");

                    let version = self.version;
                    let exit = if !self.emit(ConnectionEvent::Established { version }).await
                        || !self
                            .emit(ConnectionEvent::Message {
                                version,
                                message: connected,
                            })
                            .await
                    {
                        Exit::Shutdown
                    } else {
                        self.serve(transport.as_mut()).await
                    };

                    if let Err(e) = transport.close().await {
                        debug!(error = %e, "Transport close failed");
                    }
                    exit
                }
                Err(exit) => exit,
            };

            match exit {
                Exit::Shutdown => break,
                Exit::Rejected(info) => {
                    let rejection = SyncError::Rejected {
                        code: info.code,
                        reason: info.reason.clone(),
                    };
                    warn!(version = self.version, error = %rejection, "Registration rejected");
                    let version = self.version;
                    self.emit(ConnectionEvent::Rejected {
                        version,
                        code: info.code,
                        reason: info.reason,
                    })
                    .await;
                    break;
                }
                Exit::Fault(error) => {
                    let lost = self.version;
                    self.version += 1;
                    self.version_tx.send_replace(self.version);
                    self.set_state(ConnectionState::Disconnected);

                    if established {
                        info!(version = lost, error = %error, "Connection lost");
                        let event = ConnectionEvent::Lost {
                            version: lost,
                            reason: error.to_string(),
                        };
                        if !self.emit(event).await {
                            break;
                        }
                    } else {
                        debug!(version = lost, error = %error, "Connect attempt failed");
                    }

                    let delay = self.backoff.next_delay();
                    debug!(
                        ?delay,
                        attempt = self.backoff.attempt(),
                        version = self.version,
                        "Waiting before reconnect"
                    );

                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown_rx.recv() => {
                            info!("Shutdown during backoff");
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Closing);
        info!(version = self.version, "Connection stopped");
    }

    /// Dials and waits for the `connected` handshake message.
    async fn connect(&mut self) -> Result<(Box<dyn Transport>, ServerMessage), Exit> {
        let credentials = self.credentials_rx.borrow().clone();
        let url = build_url(&self.config.url, &credentials).map_err(Exit::Fault)?;
        let connect_timeout = self.config.connect_timeout;

        let dialed = tokio::select! {
            result = timeout(connect_timeout, self.dialer.dial(&url)) => result,
            _ = self.shutdown_rx.recv() => return Err(Exit::Shutdown),
        };
        let mut transport = match dialed {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(Exit::Fault(e)),
            Err(_) => {
                return Err(Exit::Fault(SyncError::Timeout {
                    stage: "connect",
                    after_ms: connect_timeout.as_millis() as u64,
                }))
            }
        };

        let handshake_timeout = self.config.handshake_timeout;
        let deadline = sleep(handshake_timeout);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    let _ = transport.close().await;
                    return Err(Exit::Shutdown);
                }
                _ = &mut deadline => {
                    let _ = transport.close().await;
                    return Err(Exit::Fault(SyncError::Timeout {
                        stage: "handshake",
                        after_ms: handshake_timeout.as_millis() as u64,
                    }));
                }
                frame = transport.recv() => frame,
            };

            match frame {
                None => return Err(Exit::Fault(SyncError::Disconnected)),
                Some(Err(e)) => return Err(Exit::Fault(e)),
                Some(Ok(Frame::Text(text))) => match ServerMessage::parse(&text) {
                    Ok(message @ ServerMessage::Connected { .. }) => {
                        return Ok((transport, message));
                    }
                    Ok(message) => {
                        debug!(kind = message.type_name(), "Received message during handshake");
                        let version = self.version;
                        if !self.emit(ConnectionEvent::Message { version, message }).await {
                            return Err(Exit::Shutdown);
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed message"),
                },
                Some(Ok(Frame::Ping(data))) => {
                    if let Err(e) = transport.send(Frame::Pong(data)).await {
                        return Err(Exit::Fault(e));
                    }
                }
                Some(Ok(Frame::Pong(_))) => {}
                Some(Ok(Frame::Close(info))) => return Err(classify_close(info)),
            }
        }
    }

    /// Runs the online select loop until a fault, rejection or stop.
    async fn serve(&mut self, transport: &mut dyn Transport) -> Exit {
        let watchdog_timeout = self.config.watchdog_timeout;
        let watchdog = sleep(watchdog_timeout);
        tokio::pin!(watchdog);

        let ping_interval = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(version = self.version, "Shutdown signal received, closing connection");
                    return Exit::Shutdown;
                }

                Some(out) = self.outgoing_rx.recv() => {
                    if out.version != self.version {
                        debug!(
                            tagged = out.version,
                            current = self.version,
                            kind = %out.envelope.kind,
                            "Dropping stale message"
                        );
                        continue;
                    }
                    let text = match out.envelope.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(kind = %out.envelope.kind, error = %e, "Failed to encode message");
                            continue;
                        }
                    };
                    debug!(kind = %out.envelope.kind, version = self.version, "Sending message");
                    if let Err(e) = transport.send(Frame::Text(text)).await {
                        return Exit::Fault(e);
                    }
                }

                frame = transport.recv() => {
                    watchdog.as_mut().reset(Instant::now() + watchdog_timeout);

                    match frame {
                        None => return Exit::Fault(SyncError::Disconnected),
                        Some(Err(e)) => return Exit::Fault(e),
                        Some(Ok(Frame::Text(text))) => match ServerMessage::parse(&text) {
                            Ok(message) => {
                                debug!(kind = message.type_name(), "Received message");
                                let version = self.version;
                                if !self.emit(ConnectionEvent::Message { version, message }).await {
                                    return Exit::Shutdown;
                                }
                            }
                            Err(e) => warn!(error = %e, "Dropping malformed message"),
                        },
                        Some(Ok(Frame::Ping(data))) => {
                            if let Err(e) = transport.send(Frame::Pong(data)).await {
                                return Exit::Fault(e);
                            }
                        }
                        Some(Ok(Frame::Pong(_))) => {}
                        Some(Ok(Frame::Close(info))) => return classify_close(info),
                    }
                }

                _ = &mut watchdog => {
                    warn!(version = self.version, "Watchdog expired");
                    return Exit::Fault(SyncError::WatchdogExpired(watchdog_timeout.as_secs()));
                }

                _ = ping.tick() => {
                    if let Err(e) = transport.send(Frame::Ping(Vec::new())).await {
                        return Exit::Fault(e);
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, version = self.version, "Connection state");
        }
    }

    /// Returns false once the owner stopped listening.
    async fn emit(&self, event: ConnectionEvent) -> bool {
        self.events_tx.send(event).await.is_ok()
    }
}

fn classify_close(info: Option<CloseInfo>) -> Exit {
    match info {
        Some(info) if info.is_rejection() => Exit::Rejected(info),
        Some(info) => {
            info!(code = info.code, reason = %info.reason, "Received close frame");
            Exit::Fault(SyncError::Disconnected)
        }
        None => Exit::Fault(SyncError::Disconnected),
    }
}

// =============================================================================
// In-memory Transport (tests and demos)
// =============================================================================

/// An in-memory [`Dialer`] and its server side.
///
/// ```text
///   Connection ──dial──► MockDialer ──MockPeer──► MockServer::accept()
///        ▲                                              │
///        └────────── Frame (unbounded mpsc) ────────────┘
/// ```
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Creates a connected dialer/server pair.
    pub fn pair() -> (Arc<MockDialer>, MockServer) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicUsize::new(0));
        let dials = Arc::new(Mutex::new(Vec::new()));

        let dialer = MockDialer {
            peers_tx,
            refuse: refuse.clone(),
            dials: dials.clone(),
        };
        let server = MockServer {
            peers_rx,
            refuse,
            dials,
        };
        (Arc::new(dialer), server)
    }

    pub struct MockDialer {
        peers_tx: mpsc::UnboundedSender<MockPeer>,
        refuse: Arc<AtomicUsize>,
        dials: Arc<Mutex<Vec<Url>>>,
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self, url: &Url) -> SyncResult<Box<dyn Transport>> {
            if let Ok(mut dials) = self.dials.lock() {
                dials.push(url.clone());
            }

            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(SyncError::ConnectionFailed("connection refused".into()));
            }

            let (to_client, from_server) = mpsc::unbounded_channel();
            let (to_server, from_client) = mpsc::unbounded_channel();
            let peer = MockPeer {
                url: url.clone(),
                to_client,
                from_client,
            };
            self.peers_tx
                .send(peer)
                .map_err(|_| SyncError::ConnectionFailed("server gone".into()))?;

            Ok(Box::new(MockTransport {
                incoming: from_server,
                outgoing: to_server,
            }))
        }
    }

    struct MockTransport {
        incoming: mpsc::UnboundedReceiver<Frame>,
        outgoing: mpsc::UnboundedSender<Frame>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, frame: Frame) -> SyncResult<()> {
            self.outgoing
                .send(frame)
                .map_err(|_| SyncError::Disconnected)
        }

        async fn recv(&mut self) -> Option<SyncResult<Frame>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) -> SyncResult<()> {
            self.incoming.close();
            Ok(())
        }
    }

    /// Server side of the in-memory transport.
    pub struct MockServer {
        peers_rx: mpsc::UnboundedReceiver<MockPeer>,
        refuse: Arc<AtomicUsize>,
        dials: Arc<Mutex<Vec<Url>>>,
    }

    impl MockServer {
        /// Next dialed transport.
        pub async fn accept(&mut self) -> Option<MockPeer> {
            self.peers_rx.recv().await
        }

        /// Makes the next `n` dials fail.
        pub fn refuse_next(&self, n: usize) {
            self.refuse.store(n, Ordering::SeqCst);
        }

        /// Every URL dialed so far, refused ones included.
        pub fn dialed(&self) -> Vec<Url> {
            self.dials.lock().map(|d| d.clone()).unwrap_or_default()
        }
    }

    /// One accepted in-memory transport, seen from the server.
    pub struct MockPeer {
        url: Url,
        to_client: mpsc::UnboundedSender<Frame>,
        from_client: mpsc::UnboundedReceiver<Frame>,
    }

    impl MockPeer {
        pub fn url(&self) -> &Url {
            &self.url
        }

        /// Value of a query parameter of the dialed URL.
        pub fn query(&self, key: &str) -> Option<String> {
            self.url
                .query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        }

        pub fn send_frame(&self, frame: Frame) -> bool {
            self.to_client.send(frame).is_ok()
        }

        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.send_frame(Frame::Text(text.into()))
        }

        pub fn send_message(&self, message: &ServerMessage) -> bool {
            match message.to_json() {
                Ok(text) => self.send_text(text),
                Err(_) => false,
            }
        }

        /// A `connected` handshake with no setup state.
        pub fn accept_registration(&self) -> bool {
            self.send_message(&ServerMessage::Connected {
                in_setup: false,
                short_id: None,
                name: None,
                intervals: None,
            })
        }

        pub fn close(&self, code: u16, reason: &str) -> bool {
            self.send_frame(Frame::Close(Some(CloseInfo {
                code,
                reason: reason.to_string(),
            })))
        }

        pub async fn recv_frame(&mut self) -> Option<Frame> {
            self.from_client.recv().await
        }

        /// Next text envelope from the client, skipping transport pings.
        pub async fn recv_envelope(&mut self) -> Option<Envelope> {
            loop {
                match self.from_client.recv().await? {
                    Frame::Text(text) => return Envelope::from_json(&text).ok(),
                    Frame::Ping(_) | Frame::Pong(_) => continue,
                    Frame::Close(_) => return None,
                }
            }
        }

        /// Text envelopes already sent by the client, without waiting.
        pub fn drain_envelopes(&mut self) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Ok(frame) = self.from_client.try_recv() {
                if let Frame::Text(text) = frame {
                    if let Ok(envelope) = Envelope::from_json(&text) {
                        out.push(envelope);
                    }
                }
            }
            out
        }

        /// True once the client dropped its end.
        pub fn is_closed(&self) -> bool {
            self.to_client.is_closed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{pair, MockServer};
    use super::*;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://control.test/0/p".into(),
            watchdog_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            jitter: 0.0,
            ..Default::default()
        }
    }

    fn spawn(
        config: ConnectionConfig,
        credentials: Credentials,
    ) -> (ConnectionHandle, mpsc::Receiver<ConnectionEvent>, MockServer) {
        let (dialer, server) = pair();
        let (handle, events) = Connection::spawn(config, credentials, dialer);
        (handle, events, server)
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Online.to_string(), "online");
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }

    #[test]
    fn test_build_url() {
        let url = build_url("wss://ws.printlink.io/0/p", &Credentials::default()).unwrap();
        assert_eq!(url.as_str(), "wss://ws.printlink.io/0/p?id=0&token=0");

        let credentials = Credentials {
            identity: Some(42),
            token: Some("s3cret".into()),
        };
        let url = build_url("wss://ws.printlink.io/0/p", &credentials).unwrap();
        assert_eq!(url.query(), Some("id=42&token=s3cret"));

        assert!(build_url("not a url", &credentials).unwrap_err().is_config_error());
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(500), Duration::from_secs(4), 0.0);

        let bases: Vec<Duration> = (0..6).map(|_| backoff.next_base()).collect();
        assert_eq!(bases[0], Duration::from_millis(500));
        assert_eq!(bases[1], Duration::from_secs(1));
        assert!(bases.windows(2).all(|w| w[0] <= w[1]));
        assert!(bases.iter().all(|d| *d <= Duration::from_secs(4)));
        assert_eq!(backoff.attempt(), 6);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_base(), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(3), 1.0);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn test_handshake_goes_online() {
        tokio::time::pause();
        let (handle, mut events, mut server) = spawn(test_config(), Credentials::default());
        assert_eq!(handle.version(), 1);

        let peer = server.accept().await.unwrap();
        assert_eq!(peer.query("id").as_deref(), Some("0"));
        assert!(peer.accept_registration());

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Established { version: 1 }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Message {
                version: 1,
                message: ServerMessage::Connected { .. }
            }
        ));
        assert!(handle.is_online());

        handle.shutdown().await;
        assert_eq!(handle.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_messages_before_handshake_are_forwarded() {
        tokio::time::pause();
        let (handle, mut events, mut server) = spawn(test_config(), Credentials::default());
        let peer = server.accept().await.unwrap();

        peer.send_message(&ServerMessage::NewToken {
            token: "fresh".into(),
            short_id: Some("9ZZM".into()),
        });
        peer.accept_registration();

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Message {
                message: ServerMessage::NewToken { .. },
                ..
            }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Established { version: 1 }
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_watchdog_fault_bumps_version_and_waits_backoff() {
        tokio::time::pause();
        let (handle, mut events, mut server) = spawn(test_config(), Credentials::default());

        let mut first = server.accept().await.unwrap();
        first.accept_registration();
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Established { version: 1 }
        );
        events.recv().await.unwrap();
        let online_at = Instant::now();

        // No inbound traffic from here on; client pings do not feed the watchdog.
        let lost = events.recv().await.unwrap();
        assert!(matches!(lost, ConnectionEvent::Lost { version: 1, .. }));
        let waited = online_at.elapsed();
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
        assert_eq!(handle.version(), 2);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(matches!(first.recv_frame().await, Some(Frame::Ping(_))));

        // backoff(attempt = 1) is the initial interval.
        let second = server.accept().await.unwrap();
        let waited = online_at.elapsed();
        assert!(waited >= Duration::from_secs(31) && waited < Duration::from_secs(32));
        second.accept_registration();
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Established { version: 2 }
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_traffic_feeds_watchdog() {
        tokio::time::pause();
        let (handle, mut events, mut server) = spawn(test_config(), Credentials::default());
        let peer = server.accept().await.unwrap();
        peer.accept_registration();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            peer.send_message(&ServerMessage::Pong);
            let event = events.recv().await.unwrap();
            assert!(matches!(
                event,
                ConnectionEvent::Message {
                    message: ServerMessage::Pong,
                    ..
                }
            ));
        }

        assert_eq!(handle.version(), 1);
        assert!(handle.is_online());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_messages_never_reach_new_transport() {
        tokio::time::pause();
        let (handle, mut events, mut server) = spawn(test_config(), Credentials::default());

        let mut first = server.accept().await.unwrap();
        first.accept_registration();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        handle.send(Envelope::bare("state_change"), 1).unwrap();
        assert_eq!(first.recv_envelope().await.unwrap().kind, "state_change");

        drop(first);
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Lost { version: 1, .. }
        ));

        let err = handle.send(Envelope::bare("temps"), 1).unwrap_err();
        assert!(matches!(err, SyncError::StaleVersion { tagged: 1, current: 2 }));

        let mut second = server.accept().await.unwrap();
        second.accept_registration();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        handle.send(Envelope::bare("firmware"), 2).unwrap();
        assert_eq!(second.recv_envelope().await.unwrap().kind, "firmware");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_timeout_is_a_fault() {
        tokio::time::pause();
        let (handle, mut events, mut server) = spawn(test_config(), Credentials::default());

        let _silent = server.accept().await.unwrap();
        let retry = server.accept().await.unwrap();
        assert_eq!(handle.version(), 2);

        retry.accept_registration();
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Established { version: 2 }
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejection_close_code_is_terminal() {
        tokio::time::pause();
        let (handle, mut events, mut server) = spawn(test_config(), Credentials::default());
        let peer = server.accept().await.unwrap();
        peer.accept_registration();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        peer.close(4003, "token revoked");
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Rejected {
                version: 1,
                code: 4003,
                reason: "token revoked".into()
            }
        );
        handle.closed().await;
        assert_eq!(handle.state(), ConnectionState::Closing);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        tokio::time::pause();
        let mut config = test_config();
        config.initial_backoff = Duration::from_secs(60);
        config.max_backoff = Duration::from_secs(60);
        let (handle, _events, server) = spawn(config, Credentials::default());
        server.refuse_next(1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        let started = Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(server.dialed().len(), 1);
    }

    #[tokio::test]
    async fn test_credentials_apply_to_next_dial() {
        tokio::time::pause();
        let (handle, mut events, mut server) = spawn(test_config(), Credentials::default());
        let first = server.accept().await.unwrap();
        first.accept_registration();
        events.recv().await.unwrap();

        handle.set_credentials(Credentials {
            identity: None,
            token: Some("fresh".into()),
        });
        drop(first);

        let second = server.accept().await.unwrap();
        assert_eq!(second.query("token").as_deref(), Some("fresh"));
        handle.shutdown().await;
    }
}
