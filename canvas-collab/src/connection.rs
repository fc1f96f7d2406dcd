//! Client transport lifecycle and reconnection state machine.
//!
//! ```text
//! disconnected ──connect()──▶ connecting ──ok──▶ connected
//!                                 │                 │
//!                               error             close
//!                                 ▼                 ▼
//!                               error          disconnected
//!                                 └──── backoff ────┘
//!                                        │
//!                                        ▼
//!                                    connecting
//! ```
//!
//! `disconnect()` moves to `disconnected` with `by_request` set, which
//! suppresses reconnects until `connect()` is called again.
//!
//! Each `connect()` starts a new generation. The lifecycle task of an older
//! generation is aborted, and any transition it still attempts is ignored.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::metrics::{TrafficCounters, TrafficSnapshot};
use crate::model::now_millis;
use crate::observer::{Observers, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Snapshot delivered to `on_connection_state_change` subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub last_connected: Option<u64>,
    pub error: Option<String>,
    /// Set by an explicit `disconnect()`; no reconnect is scheduled.
    pub by_request: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            last_connected: None,
            error: None,
            by_request: false,
        }
    }
}

/// Transport-level failure. Never crosses the mutation API; it is reported
/// through the connection state.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Connect(String),
    NotConnected,
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Connection failed: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    pub fn for_testing() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            jitter: Duration::from_millis(5),
        }
    }

    /// `min(base * 2^retry, max)`, without jitter.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff plus uniform jitter in `[0, jitter)`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter_ms)
        };
        self.backoff(retry_count) + Duration::from_millis(jitter)
    }
}

/// A live bidirectional byte channel produced by a [`Connector`].
///
/// The link is closed when `incoming` yields `None`.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Link {
    /// Two in-memory links wired to each other.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Link {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Opens transport links.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// Binary WebSocket transport.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();

            // Writer task: forward outgoing channel to WebSocket
            tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: binary frames into the incoming channel
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if in_tx.send(data.into()).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
            });

            log::info!("WebSocket connected to {url}");
            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// Protocol hooks driven by the connection lifecycle.
///
/// Frames returned from `on_open` and `on_message` are sent on the current
/// link, in order.
pub trait LinkHandler: Send + Sync + 'static {
    fn on_open(&self) -> Vec<Vec<u8>>;
    fn on_message(&self, frame: &[u8]) -> Vec<Vec<u8>>;
    /// The link went away, by close, error or explicit teardown.
    fn on_close(&self) {}
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    connector: Arc<dyn Connector>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    policy: ReconnectPolicy,
    handler: Arc<dyn LinkHandler>,
    inner: Mutex<Inner>,
    observers: Observers<ConnectionState>,
    traffic: TrafficCounters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutate state if `generation` is still current, then notify outside
    /// the lock.
    fn transition<F>(&self, generation: u64, f: F) -> Option<ConnectionState>
    where
        F: FnOnce(&mut Inner),
    {
        let snapshot = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return None;
            }
            f(&mut inner);
            inner.state.clone()
        };
        self.observers.notify(&snapshot);
        Some(snapshot)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let len = frame.len();
        {
            let inner = self.lock();
            if inner.state.status != ConnectionStatus::Connected {
                return Err(TransportError::NotConnected);
            }
            let tx = inner.outgoing.as_ref().ok_or(TransportError::NotConnected)?;
            tx.send(frame).map_err(|_| TransportError::Closed)?;
        }
        self.traffic.record_sent(len);
        Ok(())
    }

    fn send_all(&self, frames: Vec<Vec<u8>>) {
        for frame in frames {
            if let Err(e) = self.send(frame) {
                log::debug!("Dropping outgoing frame: {e}");
                break;
            }
        }
    }

    async fn pump(&self, generation: u64, mut incoming: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(frame) = incoming.recv().await {
            if !self.is_current(generation) {
                return;
            }
            self.traffic.record_received(frame.len());
            let replies = self.handler.on_message(&frame);
            self.send_all(replies);
        }
    }
}

/// Lifecycle task for one generation: connect, pump, back off, repeat.
async fn run(shared: Arc<Shared>, generation: u64) {
    loop {
        let connector = shared.lock().connector.clone();
        let mut attempt = 0;

        match connector.connect().await {
            Ok(Link { outgoing, incoming }) => {
                let connected = shared.transition(generation, |inner| {
                    inner.outgoing = Some(outgoing);
                    inner.state.status = ConnectionStatus::Connected;
                    inner.state.retry_count = 0;
                    inner.state.last_connected = Some(now_millis());
                    inner.state.error = None;
                });
                if connected.is_none() {
                    return;
                }
                log::info!("Connection established");

                shared.send_all(shared.handler.on_open());
                shared.pump(generation, incoming).await;

                let lost = shared.transition(generation, |inner| {
                    inner.outgoing = None;
                    attempt = inner.state.retry_count;
                    inner.state.retry_count += 1;
                    inner.state.status = ConnectionStatus::Disconnected;
                });
                if lost.is_none() {
                    return;
                }
                log::warn!("Connection lost");
                shared.handler.on_close();
            }
            Err(e) => {
                log::warn!("Connect attempt failed: {e}");
                let failed = shared.transition(generation, |inner| {
                    attempt = inner.state.retry_count;
                    inner.state.retry_count += 1;
                    inner.state.status = ConnectionStatus::Error;
                    inner.state.error = Some(e.to_string());
                });
                if failed.is_none() {
                    return;
                }
            }
        }

        let delay = shared.policy.delay(attempt);
        log::debug!("Reconnecting in {delay:?} (attempt {})", attempt + 1);
        tokio::time::sleep(delay).await;

        let resumed = shared.transition(generation, |inner| {
            inner.state.status = ConnectionStatus::Connecting;
        });
        if resumed.is_none() {
            return;
        }
    }
}

/// Owns the transport for one client.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        handler: Arc<dyn LinkHandler>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                policy,
                handler,
                inner: Mutex::new(Inner {
                    state: ConnectionState::default(),
                    generation: 0,
                    connector,
                    outgoing: None,
                    task: None,
                }),
                observers: Observers::new(),
                traffic: TrafficCounters::new(),
            }),
        }
    }

    /// Tear down any existing link and start connecting.
    ///
    /// Idempotent. Must be called within a Tokio runtime.
    pub fn connect(&self) {
        self.restart(None);
    }

    /// Like [`connect`](Self::connect), switching to another connector.
    pub fn connect_with(&self, connector: Arc<dyn Connector>) {
        self.restart(Some(connector));
    }

    fn restart(&self, connector: Option<Arc<dyn Connector>>) {
        let (generation, had_link, snapshot) = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            if let Some(connector) = connector {
                inner.connector = connector;
            }
            let had_link = inner.outgoing.take().is_some();
            inner.state.status = ConnectionStatus::Connecting;
            inner.state.error = None;
            inner.state.by_request = false;
            (inner.generation, had_link, inner.state.clone())
        };

        if had_link {
            self.shared.handler.on_close();
        }
        self.shared.observers.notify(&snapshot);

        let task = tokio::spawn(run(self.shared.clone(), generation));
        let mut inner = self.shared.lock();
        if inner.generation == generation {
            inner.task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Close the link, cancel any pending reconnect and suppress future ones.
    pub fn disconnect(&self) {
        let (had_link, snapshot) = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            let had_link = inner.outgoing.take().is_some();
            inner.state.status = ConnectionStatus::Disconnected;
            inner.state.error = None;
            inner.state.by_request = true;
            (had_link, inner.state.clone())
        };

        log::info!("Disconnected by request");
        if had_link {
            self.shared.handler.on_close();
        }
        self.shared.observers.notify(&snapshot);
    }

    /// Send one frame on the current link.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.shared.send(frame)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().status == ConnectionStatus::Connected
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        self.shared.traffic.snapshot()
    }

    pub fn on_connection_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.observers.subscribe(callback)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        inner.outgoing = None;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
    }
}
