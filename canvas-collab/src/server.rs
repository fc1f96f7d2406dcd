//! WebSocket sync server with path-addressed rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<prefix>/<room>
//!            ├── Room (name) ── Document ── BroadcastGroup
//! Client B ──┘                    │
//!                                 ├── DocumentRegistry
//!                                 │       └── DeltaStore (RocksDB, optional)
//!                                 │
//!                      ┌──────────┼───────────┐
//!                      ▼          ▼           ▼
//!                   Client A   Client B    Client C
//! ```
//!
//! Per connection: the client opens with `SyncStep1`; the server answers with
//! the missing diff (`SyncStep2`) and its own `SyncStep1`, which the client
//! answers in turn. After that, deltas are merged into the room document and
//! relayed to every other peer; awareness frames are relayed and cached in
//! memory for late joiners; a closing connection produces `PeerLeft`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Frame, PeerInfo};
use crate::document::OriginId;
use crate::protocol::{MessageType, SyncMessage};
use crate::registry::{DocumentRegistry, Room};
use crate::storage::{DeltaStore, DocumentStore, StoreConfig, StoreError};

/// Peer id the server stamps on its own envelopes.
pub const SERVER_PEER_ID: Uuid = Uuid::nil();

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path segment preceding the room name
    pub path_prefix: String,
    /// Room used when the request path names none
    pub default_room: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// Delta log storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            path_prefix: "/".to_string(),
            default_room: "default".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory rooms.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            heartbeat_interval_secs: 0,
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Undecodable envelopes and deltas that failed to merge
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_messages: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self, active_rooms: usize) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            rejected_messages: self.rejected_messages.load(Ordering::Relaxed),
            active_rooms,
        }
    }
}

/// Derive the room name from a request path.
///
/// The first segment after `prefix` names the room. Returns `None` when the
/// path does not start with the prefix or names no room.
pub fn room_from_path(path: &str, prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?;
    if !prefix.ends_with('/') && !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    let segment = rest.trim_start_matches('/').split('/').next()?;
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server, opening the RocksDB log store when `storage_path` is
    /// set. With storage this must run inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let registry = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                DocumentRegistry::with_store(Arc::new(store), config.broadcast_capacity)
            }
            None => DocumentRegistry::in_memory(config.broadcast_capacity),
        };
        Ok(Self::with_registry(config, registry))
    }

    /// Create a server over any delta store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DeltaStore>) -> Self {
        let registry = DocumentRegistry::with_store(store, config.broadcast_capacity);
        Self::with_registry(config, registry)
    }

    fn with_registry(config: ServerConfig, registry: DocumentRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = Self::handle_connection(stream, addr, &registry, &stats, &config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: &DocumentRegistry,
        stats: &AtomicServerStats,
        config: &ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().path().to_string();
                Ok(resp)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let room_name = room_from_path(&path, &config.path_prefix)
            .unwrap_or_else(|| config.default_room.clone());
        let room = registry.get_document(&room_name).await;
        log::info!("WebSocket connection from {addr} joined room {room_name:?}");

        let mut session = Session::new(room.clone(), addr);

        let mut heartbeat = (config.heartbeat_interval_secs > 0).then(|| {
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs))
        });

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                            match session.handle_frame(bytes).await {
                                Ok(replies) => {
                                    for reply in replies {
                                        ws_sender.send(Message::Binary(reply.into())).await?;
                                    }
                                }
                                Err(reason) => {
                                    stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Dropped message from {addr}: {reason}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = async {
                    match session.frames.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not subscribed until the peer identifies itself.
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(Frame { from, bytes }) => {
                            if Some(from) == session.peer_id {
                                continue;
                            }
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            room.broadcast().record_dropped(n);
                            log::warn!("Peer {:?} in room {room_name:?} lagged by {n} messages", session.peer_id);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = async {
                    match heartbeat.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        session.close().await;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.snapshot(self.registry.room_count().await)
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Per-connection protocol state.
struct Session {
    room: Arc<Room>,
    addr: SocketAddr,
    /// Distinguishes this connection from other connections of the same peer.
    connection_id: Uuid,
    peer_id: Option<Uuid>,
    frames: Option<tokio::sync::broadcast::Receiver<Frame>>,
}

impl Session {
    fn new(room: Arc<Room>, addr: SocketAddr) -> Self {
        Self {
            room,
            addr,
            connection_id: Uuid::new_v4(),
            peer_id: None,
            frames: None,
        }
    }

    fn peer_info(&self, peer_id: Uuid) -> PeerInfo {
        PeerInfo::new(peer_id, Some(self.addr)).with_connection(self.connection_id)
    }

    /// Process one inbound envelope. Returns frames for this connection only.
    async fn handle_frame(&mut self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, String> {
        let msg = SyncMessage::decode(&bytes).map_err(|e| e.to_string())?;
        self.identify(msg.peer_id).await;

        let room = self.room.name().to_string();
        match msg.msg_type {
            MessageType::SyncStep1 => {
                // Subscribed already, so anything committed after this diff
                // arrives through the broadcast group.
                let (diff, state_vector) = {
                    let doc = self.room.lock_document();
                    let diff = doc.encode_diff(&msg.payload).map_err(|e| e.to_string())?;
                    (diff, doc.encode_state_vector())
                };
                let mut replies = vec![
                    SyncMessage::sync_step2(SERVER_PEER_ID, &room, diff),
                    SyncMessage::sync_step1(SERVER_PEER_ID, &room, state_vector),
                ]
                .iter()
                .map(SyncMessage::encode)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;

                replies.extend(
                    self.room
                        .presence_snapshot(msg.peer_id)
                        .into_iter()
                        .map(|frame| frame.to_vec()),
                );
                Ok(replies)
            }

            MessageType::SyncStep2 | MessageType::Delta => {
                let changed = self
                    .room
                    .lock_document()
                    .apply_update(&msg.payload, OriginId::from(msg.peer_id))
                    .map_err(|e| e.to_string())?;
                log::trace!(
                    "{:?} from {} merged into {room:?} (changed: {changed})",
                    msg.msg_type,
                    msg.peer_id
                );

                let relay = if msg.msg_type == MessageType::Delta {
                    bytes
                } else {
                    SyncMessage::delta(msg.peer_id, &room, msg.clock, msg.payload)
                        .encode()
                        .map_err(|e| e.to_string())?
                };
                self.room.broadcast().broadcast_raw(msg.peer_id, Arc::new(relay));
                Ok(Vec::new())
            }

            MessageType::Awareness => {
                match msg.awareness_message() {
                    Ok(awareness) => log::trace!(
                        "Presence from {} in room {room:?}",
                        awareness.user_id()
                    ),
                    Err(e) => return Err(format!("bad awareness payload: {e}")),
                }
                let frame = Arc::new(bytes);
                self.room
                    .remember_presence(msg.peer_id, self.connection_id, frame.clone());
                self.room.broadcast().broadcast_raw(msg.peer_id, frame);
                Ok(Vec::new())
            }

            MessageType::Ping => {
                let pong = SyncMessage::pong(SERVER_PEER_ID, &msg);
                Ok(vec![pong.encode().map_err(|e| e.to_string())?])
            }

            MessageType::Pong | MessageType::PeerLeft => {
                log::debug!("Ignoring {:?} from {}", msg.msg_type, self.addr);
                Ok(Vec::new())
            }
        }
    }

    /// Join the broadcast group the first time the peer's id is seen.
    async fn identify(&mut self, peer_id: Uuid) {
        if self.peer_id.is_some() {
            return;
        }
        self.peer_id = Some(peer_id);
        let rx = self
            .room
            .broadcast()
            .add_peer(self.peer_info(peer_id))
            .await;
        self.frames = Some(rx);
        log::info!("Peer {peer_id} ({}) identified in room {:?}", self.addr, self.room.name());
    }

    async fn close(self) {
        let Some(peer_id) = self.peer_id else {
            return;
        };
        let broadcast = self.room.broadcast();
        self.room.forget_presence(&peer_id, self.connection_id);
        if broadcast.remove_peer(&self.peer_info(peer_id)).await.is_none() {
            log::info!(
                "Stale connection of peer {peer_id} closed in room {:?}; newer connection kept",
                self.room.name()
            );
            return;
        }

        let leave = SyncMessage::peer_left(peer_id, self.room.name());
        if let Err(e) = broadcast.broadcast(&leave) {
            log::warn!("Could not announce departure of {peer_id}: {e}");
        }
        log::info!("Peer {peer_id} left room {:?}", self.room.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.path_prefix, "/");
        assert_eq!(config.default_room, "default");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_room_from_path() {
        assert_eq!(room_from_path("/board", "/"), Some("board".into()));
        assert_eq!(room_from_path("/board/extra", "/"), Some("board".into()));
        assert_eq!(room_from_path("/", "/"), None);
        assert_eq!(room_from_path("", "/"), None);

        assert_eq!(room_from_path("/rooms/board", "/rooms"), Some("board".into()));
        assert_eq!(room_from_path("/rooms/board", "/rooms/"), Some("board".into()));
        assert_eq!(room_from_path("/rooms", "/rooms"), None);
        assert_eq!(room_from_path("/roomsx/board", "/rooms"), None);
        assert_eq!(room_from_path("/other/board", "/rooms"), None);
    }

    #[test]
    fn test_server_creation_in_memory() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(!server.registry().has_store());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.registry().has_store());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_session_handshake_and_relay() {
        use crate::document::Document;
        use crate::model::{Point, Shape, ShapeKind, Size};

        let registry = DocumentRegistry::in_memory(16);
        let room = registry.get_document("board").await;
        room.lock_document()
            .add_shape(Shape::new(
                "existing",
                ShapeKind::Circle,
                Point::new(0.0, 0.0),
                Size::new(5.0, 5.0),
            ))
            .unwrap();

        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut session = Session::new(room.clone(), addr);
        let observer_id = Uuid::new_v4();
        let mut observer = room
            .broadcast()
            .add_peer(PeerInfo::new(observer_id, None))
            .await;

        let mut client = Document::new(OriginId::generate());
        let peer = client.origin().as_uuid();
        let hello = SyncMessage::sync_step1(peer, "board", client.encode_state_vector());
        let replies = session.handle_frame(hello.encode().unwrap()).await.unwrap();
        assert_eq!(replies.len(), 2);
        assert!(session.peer_id == Some(peer));

        let step2 = SyncMessage::decode(&replies[0]).unwrap();
        assert_eq!(step2.msg_type, MessageType::SyncStep2);
        client.apply_update(&step2.payload, OriginId::unknown()).unwrap();
        assert!(client.get_shape("existing").is_some());

        let server_step1 = SyncMessage::decode(&replies[1]).unwrap();
        assert_eq!(server_step1.msg_type, MessageType::SyncStep1);

        // A malformed delta is rejected and nothing is relayed.
        let junk = SyncMessage::delta(peer, "board", 1, vec![0xFF, 0x00, 0x13]);
        assert!(session.handle_frame(junk.encode().unwrap()).await.is_err());
        assert!(observer.try_recv().is_err());

        // A valid delta is merged and relayed.
        let (tx, rx) = std::sync::mpsc::channel();
        let _sub = client.on_update(move |e| {
            let _ = tx.send(e.delta.clone());
        });
        client
            .add_shape(Shape::new(
                "fresh",
                ShapeKind::Rectangle,
                Point::new(1.0, 1.0),
                Size::new(2.0, 2.0),
            ))
            .unwrap();
        let delta = rx.recv().unwrap();
        let msg = SyncMessage::delta(peer, "board", 2, delta.to_vec());
        assert!(session.handle_frame(msg.encode().unwrap()).await.unwrap().is_empty());
        assert!(room.lock_document().get_shape("fresh").is_some());

        let relayed = observer.try_recv().unwrap();
        assert_eq!(relayed.from, peer);
        assert_eq!(SyncMessage::decode(&relayed.bytes).unwrap(), msg);

        // Ping is answered on this connection only.
        let ping = SyncMessage::ping(peer, "board", 42);
        let replies = session.handle_frame(ping.encode().unwrap()).await.unwrap();
        let pong = SyncMessage::decode(&replies[0]).unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.clock, 42);

        session.close().await;
        let left = observer.try_recv().unwrap();
        let left = SyncMessage::decode(&left.bytes).unwrap();
        assert_eq!(left.msg_type, MessageType::PeerLeft);
        assert_eq!(left.peer_id, peer);
        assert!(!room.broadcast().has_peer(&peer).await);
    }

    #[tokio::test]
    async fn test_stale_session_close_keeps_reconnected_peer() {
        use crate::presence::{AwarenessMessage, PresenceRecord, UserProfile};

        let registry = DocumentRegistry::in_memory(16);
        let room = registry.get_document("board").await;
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut observer = room
            .broadcast()
            .add_peer(PeerInfo::new(Uuid::new_v4(), None))
            .await;

        // The same client, before and after a reconnect.
        let peer = Uuid::new_v4();
        let mut old = Session::new(room.clone(), addr);
        let mut new = Session::new(room.clone(), addr);
        let state = AwarenessMessage::State {
            record: PresenceRecord::new(&UserProfile::new("alice", "Alice")),
            clock: 1,
        };
        let hello = SyncMessage::awareness(peer, "board", 1, &state)
            .unwrap()
            .encode()
            .unwrap();
        old.handle_frame(hello.clone()).await.unwrap();
        new.handle_frame(hello.clone()).await.unwrap();
        while observer.try_recv().is_ok() {}

        old.close().await;

        assert!(room.broadcast().has_peer(&peer).await);
        assert_eq!(room.broadcast().peer_count().await, 2);
        assert_eq!(room.presence_snapshot(Uuid::nil()), vec![Arc::new(hello)]);
        assert!(observer.try_recv().is_err());

        new.close().await;
        assert!(!room.broadcast().has_peer(&peer).await);
        assert!(room.presence_snapshot(Uuid::nil()).is_empty());
        let left = SyncMessage::decode(&observer.try_recv().unwrap().bytes).unwrap();
        assert_eq!(left.msg_type, MessageType::PeerLeft);
    }
}
