//! Client-side façade: the only entry point a UI layer calls.
//!
//! Wires one replicated [`Document`] to a [`PresenceChannel`], an
//! [`UpdateBatcher`] and a [`ConnectionManager`]:
//!
//! ```text
//!  UI ──► SyncClient ──► Document ── on_update(local) ──► ConnectionManager ──► server
//!            │    └────► UpdateBatcher ──(timers)──► Document
//!            └─────────► PresenceChannel ──► Awareness frames
//!
//!  server ──► ConnectionManager ──► ProtocolHandler ──► Document / PresenceChannel
//! ```
//!
//! Local deltas produced while offline are not queued separately: on every
//! (re)connect both sides exchange state vectors and send each other what
//! the other is missing.
//!
//! Observers run synchronously while the client holds the relevant lock, so
//! a callback must not call back into the same `SyncClient`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::batching::{BatchConfig, Priority, QueueStatus, UpdateBatcher};
use crate::connection::{
    ConnectionManager, ConnectionState, Connector, LinkHandler, ReconnectPolicy,
    WebSocketConnector,
};
use crate::document::{Document, MetaEvent, Operation, OriginId, RecordsEvent};
use crate::metrics::{as_millis_f64, LatencyTracker, MetricsSnapshot};
use crate::model::{now_millis, Group, GroupPatch, Shape, ShapePatch, ValidationError};
use crate::observer::Subscription;
use crate::presence::{
    AwarenessMessage, PresenceChannel, PresenceConfig, PresenceEvent, PresencePatch,
    PresenceRecord, UserProfile,
};
use crate::protocol::{MessageType, SyncMessage};
use crate::undo::{StackSizes, UndoConfig};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL; the room name is appended as the last path segment
    pub server_url: String,
    pub room: String,
    /// Announced on every connect when set
    pub user: Option<UserProfile>,
    pub reconnect: ReconnectPolicy,
    pub batch: BatchConfig,
    pub presence: PresenceConfig,
    pub undo: UndoConfig,
    /// Ping and presence eviction period
    pub heartbeat_interval: Duration,
    /// Round-trip samples kept for the rolling average
    pub latency_samples: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room: room.into(),
            user: None,
            reconnect: ReconnectPolicy::default(),
            batch: BatchConfig::default(),
            presence: PresenceConfig::default(),
            undo: UndoConfig::default(),
            heartbeat_interval: Duration::from_secs(10),
            latency_samples: 20,
        }
    }

    /// Short timers throughout.
    pub fn for_testing(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            reconnect: ReconnectPolicy::for_testing(),
            presence: PresenceConfig::for_testing(),
            heartbeat_interval: Duration::from_millis(50),
            ..Self::new(server_url, room)
        }
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    /// Full WebSocket URL for the room.
    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room)
    }
}

/// State shared between the façade and the protocol handler.
struct ClientCore {
    room: String,
    peer_id: Uuid,
    document: Arc<Mutex<Document>>,
    presence: Mutex<PresenceChannel>,
    clock: AtomicU64,
    /// Wall-clock millis of the last awareness frame we produced.
    announced_at: AtomicU64,
    round_trip: Mutex<LatencyTracker>,
}

impl ClientCore {
    fn lock_document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_presence(&self) -> MutexGuard<'_, PresenceChannel> {
        self.presence.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn encode(&self, msg: SyncMessage) -> Option<Vec<u8>> {
        match msg.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", msg.msg_type);
                None
            }
        }
    }

    fn awareness_frame(&self, message: &AwarenessMessage) -> Option<Vec<u8>> {
        self.announced_at.store(now_millis(), Ordering::Relaxed);
        match SyncMessage::awareness(self.peer_id, &self.room, self.next_clock(), message) {
            Ok(msg) => self.encode(msg),
            Err(e) => {
                log::error!("Failed to encode awareness: {e}");
                None
            }
        }
    }

    fn delta_frame(&self, delta: &[u8]) -> Option<Vec<u8>> {
        self.encode(SyncMessage::delta(
            self.peer_id,
            &self.room,
            self.next_clock(),
            delta.to_vec(),
        ))
    }

    fn ping_frame(&self) -> Option<Vec<u8>> {
        self.encode(SyncMessage::ping(self.peer_id, &self.room, now_millis()))
    }

    /// Frames sent first on every new link: our state vector, then our
    /// presence.
    fn handshake(&self) -> Vec<Vec<u8>> {
        let state_vector = self.lock_document().encode_state_vector();
        let mut frames: Vec<Vec<u8>> = self
            .encode(SyncMessage::sync_step1(self.peer_id, &self.room, state_vector))
            .into_iter()
            .collect();
        let announce = self.lock_presence().local_message();
        if let Some(frame) = announce.and_then(|m| self.awareness_frame(&m)) {
            frames.push(frame);
        }
        frames
    }

    fn handle_frame(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        let msg = match SyncMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return Vec::new();
            }
        };

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = self.lock_document().encode_diff(&msg.payload);
                match diff {
                    Ok(diff) => self
                        .encode(SyncMessage::sync_step2(self.peer_id, &self.room, diff))
                        .into_iter()
                        .collect(),
                    Err(e) => {
                        log::warn!("Bad state vector from {}: {e}", msg.peer_id);
                        Vec::new()
                    }
                }
            }
            MessageType::SyncStep2 | MessageType::Delta => {
                let merged = self
                    .lock_document()
                    .apply_update(&msg.payload, OriginId::from(msg.peer_id));
                if let Err(e) = merged {
                    log::warn!("Dropping {:?} from {}: {e}", msg.msg_type, msg.peer_id);
                }
                Vec::new()
            }
            MessageType::Awareness => {
                match msg.awareness_message() {
                    Ok(awareness) => {
                        self.lock_presence().apply_remote(msg.peer_id, awareness);
                    }
                    Err(e) => log::warn!("Dropping awareness from {}: {e}", msg.peer_id),
                }
                Vec::new()
            }
            MessageType::PeerLeft => {
                let removed = self.lock_presence().handle_peer_left(msg.peer_id);
                log::debug!("Peer {} left, {} participant(s) removed", msg.peer_id, removed.len());
                Vec::new()
            }
            MessageType::Ping => self
                .encode(SyncMessage::pong(self.peer_id, &msg))
                .into_iter()
                .collect(),
            MessageType::Pong => {
                let rtt = Duration::from_millis(now_millis().saturating_sub(msg.clock));
                self.round_trip
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .record(rtt);
                log::trace!("Round trip {rtt:?}");
                Vec::new()
            }
        }
    }
}

/// Adapts the client core to the connection lifecycle.
struct ProtocolHandler {
    core: Arc<ClientCore>,
}

impl LinkHandler for ProtocolHandler {
    fn on_open(&self) -> Vec<Vec<u8>> {
        self.core.handshake()
    }

    fn on_message(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        self.core.handle_frame(frame)
    }

    fn on_close(&self) {
        let removed = self.core.lock_presence().clear_remote();
        if !removed.is_empty() {
            log::debug!("Link closed, cleared {} remote participant(s)", removed.len());
        }
    }
}

/// Collaborative canvas client for one room.
pub struct SyncClient {
    config: ClientConfig,
    core: Arc<ClientCore>,
    batcher: UpdateBatcher,
    connection: Arc<ConnectionManager>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    _forward: Subscription,
}

impl SyncClient {
    /// Client speaking WebSocket to `config.url()`.
    pub fn new(config: ClientConfig) -> Self {
        let connector = Arc::new(WebSocketConnector::new(config.url()));
        Self::with_connector(config, connector)
    }

    /// Client over any transport.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let origin = OriginId::generate();
        let document = Arc::new(Mutex::new(Document::with_undo_config(origin, config.undo.clone())));

        let mut presence = PresenceChannel::new(config.presence.clone());
        if let Some(user) = &config.user {
            // Announced by the handshake.
            let _ = presence.set_local_user(user);
        }

        let core = Arc::new(ClientCore {
            room: config.room.clone(),
            peer_id: origin.as_uuid(),
            document: document.clone(),
            presence: Mutex::new(presence),
            clock: AtomicU64::new(0),
            announced_at: AtomicU64::new(0),
            round_trip: Mutex::new(LatencyTracker::new(config.latency_samples)),
        });

        let connection = Arc::new(ConnectionManager::new(
            connector,
            config.reconnect.clone(),
            Arc::new(ProtocolHandler { core: core.clone() }),
        ));

        // Weak so the document's observer never keeps the transport alive.
        let sink: Weak<ConnectionManager> = Arc::downgrade(&connection);
        let frames = Arc::downgrade(&core);
        let forward = document
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_update(move |event| {
                if !event.local {
                    return;
                }
                let (Some(connection), Some(core)) = (sink.upgrade(), frames.upgrade()) else {
                    return;
                };
                if !connection.is_connected() {
                    // Delivered by the next handshake.
                    return;
                }
                if let Some(frame) = core.delta_frame(&event.delta) {
                    if let Err(e) = connection.send(frame) {
                        log::debug!("Delta not sent, left to the next handshake: {e}");
                    }
                }
            });

        let batcher = UpdateBatcher::new(&document, config.batch.clone());

        Self {
            config,
            core,
            batcher,
            connection,
            heartbeat: Mutex::new(None),
            _forward: forward,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.core.peer_id
    }

    pub fn room(&self) -> &str {
        &self.core.room
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The replicated document. Observers registered on it must not call
    /// back into this client.
    pub fn document(&self) -> &Arc<Mutex<Document>> {
        &self.core.document
    }

    // ─── Connection ───────────────────────────────────────────────────

    /// Start connecting, with automatic reconnect. Must be called within a
    /// Tokio runtime.
    pub fn connect(&self) {
        self.connection.connect();

        let mut heartbeat = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner());
        if heartbeat.is_none() {
            *heartbeat = Some(spawn_heartbeat(
                Arc::downgrade(&self.core),
                Arc::downgrade(&self.connection),
                self.config.heartbeat_interval,
                self.config.presence.timeout / 2,
            ));
        }
    }

    /// Announce departure, close the link and suppress reconnects.
    pub fn disconnect(&self) {
        let leave = self.core.lock_presence().leave_message();
        if let Some(frame) = leave.and_then(|m| self.core.awareness_frame(&m)) {
            let _ = self.connection.send(frame);
        }
        self.stop_heartbeat();
        self.connection.disconnect();
    }

    fn stop_heartbeat(&self) {
        let task = self
            .heartbeat
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn on_connection_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.connection.on_connection_state_change(callback)
    }

    // ─── Mutations ────────────────────────────────────────────────────

    pub fn add_shape(&self, shape: Shape) -> Result<(), ValidationError> {
        self.core.lock_document().add_shape(shape)
    }

    pub fn update_shape(&self, id: &str, patch: ShapePatch) -> Result<bool, ValidationError> {
        self.core.lock_document().update_shape(id, patch)
    }

    pub fn delete_shape(&self, id: &str) -> bool {
        self.core.lock_document().delete_shape(id)
    }

    pub fn add_group(&self, group: Group) -> Result<(), ValidationError> {
        self.core.lock_document().add_group(group)
    }

    pub fn update_group(&self, id: &str, patch: GroupPatch) -> Result<bool, ValidationError> {
        self.core.lock_document().update_group(id, patch)
    }

    pub fn delete_group(&self, id: &str) -> bool {
        self.core.lock_document().delete_group(id)
    }

    /// Apply several operations as one transaction.
    pub fn batch_update(&self, ops: Vec<Operation>) -> Result<(), ValidationError> {
        self.core.lock_document().batch_update(ops)
    }

    /// Queue an operation for coalesced application.
    pub fn enqueue(&self, op: Operation, priority: Priority) -> Result<(), ValidationError> {
        self.batcher.enqueue(op, priority)
    }

    /// Apply every queued operation now.
    pub fn flush(&self) -> usize {
        self.batcher.flush()
    }

    pub fn cleanup_groups(&self) -> usize {
        self.core.lock_document().cleanup_groups()
    }

    pub fn undo(&self) -> bool {
        self.core.lock_document().undo()
    }

    pub fn redo(&self) -> bool {
        self.core.lock_document().redo()
    }

    pub fn can_undo(&self) -> bool {
        self.core.lock_document().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.core.lock_document().can_redo()
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn get_shape(&self, id: &str) -> Option<Shape> {
        self.core.lock_document().get_shape(id)
    }

    pub fn get_all_shapes(&self) -> Vec<Shape> {
        self.core.lock_document().get_all_shapes()
    }

    pub fn get_group(&self, id: &str) -> Option<Group> {
        self.core.lock_document().get_group(id)
    }

    pub fn get_all_groups(&self) -> Vec<Group> {
        self.core.lock_document().get_all_groups()
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Set (or rename) the local participant and broadcast it.
    pub fn set_local_user(&self, profile: UserProfile) {
        let message = self.core.lock_presence().set_local_user(&profile);
        self.send_awareness(&message);
    }

    /// Patch the local cursor/selection/activity. Returns `false` when no
    /// local user is set.
    pub fn update_local_presence(&self, patch: PresencePatch) -> bool {
        let message = self.core.lock_presence().update_local_presence(patch);
        match message {
            Some(message) => {
                self.send_awareness(&message);
                true
            }
            None => false,
        }
    }

    fn send_awareness(&self, message: &AwarenessMessage) {
        if !self.connection.is_connected() {
            return;
        }
        if let Some(frame) = self.core.awareness_frame(message) {
            if let Err(e) = self.connection.send(frame) {
                log::debug!("Awareness not sent: {e}");
            }
        }
    }

    pub fn get_connected_users(&self) -> Vec<PresenceRecord> {
        self.core.lock_presence().get_connected_users()
    }

    /// Drop remote participants silent for longer than the presence timeout.
    pub fn evict_stale_presence(&self) -> Vec<String> {
        self.core.lock_presence().evict_stale(now_millis())
    }

    // ─── Observers ────────────────────────────────────────────────────

    pub fn on_shapes_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RecordsEvent) + Send + Sync + 'static,
    {
        self.core.lock_document().on_shapes_change(callback)
    }

    pub fn on_groups_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RecordsEvent) + Send + Sync + 'static,
    {
        self.core.lock_document().on_groups_change(callback)
    }

    pub fn on_meta_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MetaEvent) + Send + Sync + 'static,
    {
        self.core.lock_document().on_meta_change(callback)
    }

    pub fn on_stack_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StackSizes) + Send + Sync + 'static,
    {
        self.core.lock_document().on_stack_change(callback)
    }

    pub fn on_presence_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.core.lock_presence().on_presence_change(callback)
    }

    // ─── Monitoring ───────────────────────────────────────────────────

    pub fn queue_status(&self) -> QueueStatus {
        self.batcher.queue_status()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let round_trip_ms = self
            .core
            .round_trip
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .average()
            .map(as_millis_f64);
        MetricsSnapshot {
            traffic: self.connection.traffic(),
            average_latency_ms: self.batcher.average_latency().map(as_millis_f64),
            round_trip_ms,
            quality: self.batcher.quality(),
            recommended_batch_size: self.batcher.recommended_batch_size(),
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop_heartbeat();
        self.batcher.cancel_timers();
    }
}

/// Periodic ping and presence eviction. Exits once the client is gone.
fn spawn_heartbeat(
    core: Weak<ClientCore>,
    connection: Weak<ConnectionManager>,
    every: Duration,
    renew_after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            let (Some(core), Some(connection)) = (core.upgrade(), connection.upgrade()) else {
                break;
            };
            let now = now_millis();
            core.lock_presence().evict_stale(now);
            if !connection.is_connected() {
                continue;
            }
            if let Some(ping) = core.ping_frame() {
                let _ = connection.send(ping);
            }
            // Peers evict silent participants, so keep our entry fresh.
            let last = core.announced_at.load(Ordering::Relaxed);
            if now.saturating_sub(last) >= as_millis(renew_after) {
                let renewal = core.lock_presence().local_message();
                if let Some(frame) = renewal.and_then(|m| core.awareness_frame(&m)) {
                    let _ = connection.send(frame);
                }
            }
        }
    })
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
