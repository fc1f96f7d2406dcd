//! Server-side room registry.
//!
//! Maps each room name to exactly one [`Document`], created lazily on first
//! access and hydrated by replaying the room's delta log. Every delta the
//! document commits afterwards is queued to a single persistence worker that
//! appends in arrival order.
//!
//! ```text
//! get_document(room) ─► hydrate (load + replay) ─► Room { Document, BroadcastGroup }
//!                                                       │ on_update
//!                                                       ▼
//!                                           mpsc ─► persistence worker ─► DeltaStore
//! ```
//!
//! In-memory state is authoritative. A room whose log cannot be read or
//! written is marked degraded and continues in memory only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, OnceCell, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::document::{Document, OriginId};
use crate::observer::Subscription;
use crate::storage::{DeltaStore, StoreError};

/// Monitoring view of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomStats {
    pub room: String,
    pub shape_count: usize,
    pub group_count: usize,
    pub has_metadata: bool,
    /// Best-effort: counts registered connections, which may lag socket liveness.
    pub connections: usize,
    /// Persistence failed; the room is in-memory only.
    pub degraded: bool,
}

/// One live room: its document and fan-out group.
pub struct Room {
    name: String,
    document: Arc<Mutex<Document>>,
    broadcast: Arc<BroadcastGroup>,
    degraded: Arc<AtomicBool>,
    persistence: Mutex<Option<Subscription>>,
    /// Latest awareness frame per connected peer, with the owning
    /// connection. Memory only.
    presence: Mutex<HashMap<Uuid, (Uuid, Arc<Vec<u8>>)>>,
}

impl Room {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &Arc<Mutex<Document>> {
        &self.document
    }

    /// Lock the document. Never hold the guard across an `.await`.
    pub fn lock_document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Remember a peer's latest awareness frame for late joiners, tagged
    /// with the connection that sent it.
    pub fn remember_presence(&self, peer: Uuid, connection: Uuid, frame: Arc<Vec<u8>>) {
        self.presence_frames_mut().insert(peer, (connection, frame));
    }

    /// Drop the peer's cached frame if `connection` still owns it.
    pub fn forget_presence(&self, peer: &Uuid, connection: Uuid) -> bool {
        let mut frames = self.presence_frames_mut();
        match frames.get(peer) {
            Some((owner, _)) if *owner == connection => frames.remove(peer).is_some(),
            _ => false,
        }
    }

    /// Awareness frames of every peer except `exclude`.
    pub fn presence_snapshot(&self, exclude: Uuid) -> Vec<Arc<Vec<u8>>> {
        self.presence_frames_mut()
            .iter()
            .filter(|(peer, _)| **peer != exclude)
            .map(|(_, (_, frame))| frame.clone())
            .collect()
    }

    fn presence_frames_mut(&self) -> MutexGuard<'_, HashMap<Uuid, (Uuid, Arc<Vec<u8>>)>> {
        self.presence.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn detach(&self) {
        let subscription = self
            .persistence
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }
}

enum PersistJob {
    Append {
        room: String,
        delta: Arc<Vec<u8>>,
        degraded: Arc<AtomicBool>,
    },
    /// Answered once every earlier job is done.
    Barrier(oneshot::Sender<()>),
}

/// Slot for one room. Filled once hydration finishes.
type RoomCell = Arc<OnceCell<Arc<Room>>>;

/// Room name → document, with optional durable logs.
pub struct DocumentRegistry {
    rooms: RwLock<HashMap<String, RoomCell>>,
    store: Option<Arc<dyn DeltaStore>>,
    persist_tx: Option<mpsc::UnboundedSender<PersistJob>>,
    worker: Option<JoinHandle<()>>,
    broadcast_capacity: usize,
}

impl DocumentRegistry {
    /// Registry without durable storage.
    pub fn in_memory(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store: None,
            persist_tx: None,
            worker: None,
            broadcast_capacity,
        }
    }

    /// Registry backed by `store`. Spawns the persistence worker, so this
    /// must be called from within a tokio runtime.
    pub fn with_store(store: Arc<dyn DeltaStore>, broadcast_capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(persistence_worker(store.clone(), rx));
        Self {
            rooms: RwLock::new(HashMap::new()),
            store: Some(store),
            persist_tx: Some(tx),
            worker: Some(worker),
            broadcast_capacity,
        }
    }

    /// Get the room's document, creating and hydrating it on first access.
    ///
    /// Concurrent callers for the same room wait for one hydration. The room
    /// map is only locked to find or insert the room's slot, so other rooms
    /// stay reachable while a slow log loads.
    pub async fn get_document(&self, room: &str) -> Arc<Room> {
        let cell = self.room_cell(room).await;
        let live = cell
            .get_or_init(|| async move {
                let created = Arc::new(self.create_room(room).await);
                log::info!(
                    "Room {room:?} created ({} shapes{})",
                    created.lock_document().shape_count(),
                    if created.is_degraded() { ", degraded" } else { "" }
                );
                created
            })
            .await;
        live.clone()
    }

    async fn room_cell(&self, room: &str) -> RoomCell {
        if let Some(cell) = self.rooms.read().await.get(room) {
            return cell.clone();
        }
        self.rooms
            .write()
            .await
            .entry(room.to_string())
            .or_default()
            .clone()
    }

    /// The room if it is in memory and done hydrating.
    async fn live_room(&self, room: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room)?.get().cloned()
    }

    async fn create_room(&self, room: &str) -> Room {
        let mut document = Document::new(OriginId::generate());
        let degraded = Arc::new(AtomicBool::new(false));

        if let Some(store) = &self.store {
            match load_log(store.clone(), room).await {
                Ok(deltas) => hydrate(&mut document, room, &deltas),
                Err(e) => {
                    log::error!("Hydration of room {room:?} failed, starting empty: {e}");
                    degraded.store(true, Ordering::Relaxed);
                }
            }
        }

        // Subscribed after hydration so replayed deltas are not appended again.
        let persistence = self.persist_tx.as_ref().map(|tx| {
            let tx = tx.clone();
            let room = room.to_string();
            let degraded = degraded.clone();
            document.on_update(move |event| {
                let job = PersistJob::Append {
                    room: room.clone(),
                    delta: event.delta.clone(),
                    degraded: degraded.clone(),
                };
                if tx.send(job).is_err() {
                    log::warn!("Persistence worker gone, delta for {room:?} not stored");
                }
            })
        });

        Room {
            name: room.to_string(),
            document: Arc::new(Mutex::new(document)),
            broadcast: Arc::new(BroadcastGroup::new(room, self.broadcast_capacity)),
            degraded,
            persistence: Mutex::new(persistence),
            presence: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the in-memory room and its listeners. Persisted history is kept.
    /// A room still hydrating is left alone.
    pub async fn remove_document(&self, room: &str) -> bool {
        let removed = {
            let mut rooms = self.rooms.write().await;
            let Some(live) = rooms.get(room).and_then(|cell| cell.get().cloned()) else {
                return false;
            };
            rooms.remove(room);
            live
        };
        removed.detach();
        log::info!("Room {room:?} removed");
        true
    }

    /// Names of the rooms currently in memory, sorted.
    pub async fn get_all_rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .rooms
            .read()
            .await
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn get_room_stats(&self, room: &str) -> Option<RoomStats> {
        let room = self.live_room(room).await?;
        let (shape_count, group_count, has_metadata) = {
            let doc = room.lock_document();
            (doc.shape_count(), doc.group_count(), doc.metadata().is_some())
        };
        Some(RoomStats {
            room: room.name.clone(),
            shape_count,
            group_count,
            has_metadata,
            connections: room.broadcast.peer_count().await,
            degraded: room.is_degraded(),
        })
    }

    pub async fn room_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Rooms with a durable log, whether or not they are in memory.
    pub fn persisted_rooms(&self) -> Result<Vec<String>, StoreError> {
        match &self.store {
            Some(store) => store.rooms(),
            None => Ok(Vec::new()),
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Wait until every delta queued so far has been handled by the worker.
    pub async fn flush_persistence(&self) {
        let Some(tx) = &self.persist_tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(PersistJob::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Detach every room, drain queued appends and stop the worker.
    pub async fn shutdown(mut self) {
        for (_, cell) in self.rooms.write().await.drain() {
            if let Some(room) = cell.get() {
                room.detach();
            }
        }
        self.persist_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

async fn load_log(store: Arc<dyn DeltaStore>, room: &str) -> Result<Vec<Vec<u8>>, StoreError> {
    let room = room.to_string();
    tokio::task::spawn_blocking(move || store.load(&room))
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?
}

/// Replay a log strictly in append order. A delta that fails to merge is
/// skipped; the document is left as it was before that delta.
fn hydrate(document: &mut Document, room: &str, deltas: &[Vec<u8>]) {
    let mut skipped = 0usize;
    for (seq, delta) in deltas.iter().enumerate() {
        if let Err(e) = document.apply_update(delta, OriginId::unknown()) {
            log::warn!("Skipping delta {seq} of room {room:?}: {e}");
            skipped += 1;
        }
    }
    if !deltas.is_empty() {
        log::info!(
            "Hydrated room {room:?} from {} deltas ({skipped} skipped)",
            deltas.len()
        );
    }
}

async fn persistence_worker(store: Arc<dyn DeltaStore>, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Append {
                room,
                delta,
                degraded,
            } => {
                if degraded.load(Ordering::Relaxed) {
                    continue;
                }
                let store = store.clone();
                let target = room.clone();
                let result =
                    tokio::task::spawn_blocking(move || store.append(&target, &delta)).await;
                match result {
                    Ok(Ok(seq)) => log::trace!("Appended delta {seq} to room {room:?}"),
                    Ok(Err(e)) => {
                        log::error!("Persistence failed for room {room:?}, now in-memory only: {e}");
                        degraded.store(true, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::error!("Persistence task for room {room:?} failed: {e}");
                        degraded.store(true, Ordering::Relaxed);
                    }
                }
            }
            PersistJob::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Persistence worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Point, Shape, ShapeKind, ShapePatch, Size};
    use crate::storage::MemoryStore;

    fn rect(id: &str, x: f64) -> Shape {
        Shape::new(id, ShapeKind::Rectangle, Point::new(x, 0.0), Size::new(10.0, 10.0))
    }

    /// Store whose appends always fail.
    struct ReadOnlyStore;

    impl DeltaStore for ReadOnlyStore {
        fn append(&self, _room: &str, _delta: &[u8]) -> Result<u64, StoreError> {
            Err(StoreError::DatabaseError("read-only".into()))
        }
        fn load(&self, _room: &str) -> Result<Vec<Vec<u8>>, StoreError> {
            Ok(Vec::new())
        }
        fn rooms(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Store whose log can never be read.
    struct UnreadableStore;

    impl DeltaStore for UnreadableStore {
        fn append(&self, _room: &str, _delta: &[u8]) -> Result<u64, StoreError> {
            Ok(0)
        }
        fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, StoreError> {
            Err(StoreError::Corrupt {
                room: room.to_string(),
                seq: 0,
            })
        }
        fn rooms(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Store whose log for `slow` loads only once the gate opens.
    struct GatedStore {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        loads: std::sync::atomic::AtomicUsize,
    }

    impl DeltaStore for GatedStore {
        fn append(&self, _room: &str, _delta: &[u8]) -> Result<u64, StoreError> {
            Ok(0)
        }
        fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, StoreError> {
            if room == "slow" {
                self.loads.fetch_add(1, Ordering::SeqCst);
                let _ = self.gate.lock().unwrap().recv();
            }
            Ok(Vec::new())
        }
        fn rooms(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_one_document_per_room() {
        let registry = DocumentRegistry::in_memory(16);
        let a = registry.get_document("board").await;
        let b = registry.get_document("board").await;
        let other = registry.get_document("other").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.get_all_rooms().await, vec!["board", "other"]);
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_deltas_persist_and_hydrate() {
        let store = Arc::new(MemoryStore::new());

        {
            let registry = DocumentRegistry::with_store(store.clone(), 16);
            let room = registry.get_document("board").await;
            {
                let mut doc = room.lock_document();
                doc.add_shape(rect("s1", 1.0)).unwrap();
                doc.add_shape(rect("s2", 2.0)).unwrap();
                doc.update_shape("s1", ShapePatch::position(5.0, 5.0)).unwrap();
            }
            registry.flush_persistence().await;
        }
        assert_eq!(store.len("board"), 3);

        let registry = DocumentRegistry::with_store(store.clone(), 16);
        let room = registry.get_document("board").await;
        let doc = room.lock_document();
        assert_eq!(doc.shape_count(), 2);
        assert_eq!(doc.get_shape("s1").unwrap().position, Point::new(5.0, 5.0));
        assert!(!room.is_degraded());
        drop(doc);

        // Replay does not append the log to itself.
        registry.flush_persistence().await;
        assert_eq!(store.len("board"), 3);
    }

    #[tokio::test]
    async fn test_remote_merges_are_persisted() {
        let store = Arc::new(MemoryStore::new());
        let registry = DocumentRegistry::with_store(store.clone(), 16);
        let room = registry.get_document("board").await;

        let mut client = Document::new(OriginId::generate());
        let (tx, rx) = std::sync::mpsc::channel();
        let _sub = client.on_update(move |e| {
            let _ = tx.send(e.delta.clone());
        });
        client.add_shape(rect("s1", 1.0)).unwrap();
        let delta = rx.recv().unwrap();

        room.lock_document()
            .apply_update(&delta, client.origin())
            .unwrap();
        registry.flush_persistence().await;

        assert_eq!(store.load("board").unwrap(), vec![delta.to_vec()]);
    }

    #[tokio::test]
    async fn test_redelivered_delta_is_not_appended_again() {
        let store = Arc::new(MemoryStore::new());
        let registry = DocumentRegistry::with_store(store.clone(), 16);
        let room = registry.get_document("board").await;

        let mut client = Document::new(OriginId::generate());
        let (tx, rx) = std::sync::mpsc::channel();
        let _sub = client.on_update(move |e| {
            let _ = tx.send(e.delta.clone());
        });
        client.add_shape(rect("s1", 1.0)).unwrap();
        let delta = rx.recv().unwrap();

        room.lock_document()
            .apply_update(&delta, client.origin())
            .unwrap();
        // A reconnecting client resends what the room already holds.
        room.lock_document()
            .apply_update(&delta, client.origin())
            .unwrap();
        room.lock_document()
            .apply_update(&client.encode_state_as_update(), client.origin())
            .unwrap();
        registry.flush_persistence().await;

        assert_eq!(store.len("board"), 1);
    }

    #[tokio::test]
    async fn test_slow_hydration_does_not_block_other_rooms() {
        let (release, gate) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            gate: Mutex::new(gate),
            loads: std::sync::atomic::AtomicUsize::new(0),
        });
        let registry = Arc::new(DocumentRegistry::with_store(store.clone(), 16));

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.get_document("slow").await }
        });
        while store.loads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let registry = registry.clone();
            async move { registry.get_document("slow").await }
        });

        let fast = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            registry.get_document("fast"),
        )
        .await
        .expect("room hydration blocked by another room");
        assert_eq!(fast.name(), "fast");
        assert_eq!(registry.get_all_rooms().await, vec!["fast"]);
        assert_eq!(registry.room_count().await, 1);
        assert!(registry.get_room_stats("slow").await.is_none());
        assert!(!registry.remove_document("slow").await);

        release.send(()).unwrap();
        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get_all_rooms().await, vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn test_unreadable_log_starts_empty() {
        let registry = DocumentRegistry::with_store(Arc::new(UnreadableStore), 16);
        let room = registry.get_document("broken").await;

        assert!(room.is_degraded());
        assert_eq!(room.lock_document().shape_count(), 0);

        // Still usable in memory.
        room.lock_document().add_shape(rect("s1", 0.0)).unwrap();
        let stats = registry.get_room_stats("broken").await.unwrap();
        assert_eq!(stats.shape_count, 1);
        assert!(stats.degraded);
    }

    #[tokio::test]
    async fn test_malformed_logged_delta_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let mut source = Document::new(OriginId::generate());
        let (tx, rx) = std::sync::mpsc::channel();
        let _sub = source.on_update(move |e| {
            let _ = tx.send(e.delta.clone());
        });
        source.add_shape(rect("s1", 1.0)).unwrap();

        store.append("board", &[0xFF, 0x00, 0x13]).unwrap();
        store.append("board", &rx.recv().unwrap()).unwrap();

        let registry = DocumentRegistry::with_store(store, 16);
        let room = registry.get_document("board").await;
        assert!(room.lock_document().get_shape("s1").is_some());
        assert!(!room.is_degraded());
    }

    #[tokio::test]
    async fn test_failed_append_degrades_only_that_room() {
        let registry = DocumentRegistry::with_store(Arc::new(ReadOnlyStore), 16);
        let room = registry.get_document("board").await;
        room.lock_document().add_shape(rect("s1", 0.0)).unwrap();
        registry.flush_persistence().await;

        assert!(room.is_degraded());
        assert_eq!(room.lock_document().shape_count(), 1);

        let untouched = registry.get_document("quiet").await;
        assert!(!untouched.is_degraded());
    }

    #[tokio::test]
    async fn test_remove_document_keeps_history() {
        let store = Arc::new(MemoryStore::new());
        let registry = DocumentRegistry::with_store(store.clone(), 16);

        let room = registry.get_document("board").await;
        room.lock_document().add_shape(rect("s1", 0.0)).unwrap();
        registry.flush_persistence().await;

        assert!(registry.remove_document("board").await);
        assert!(!registry.remove_document("board").await);
        assert!(registry.get_all_rooms().await.is_empty());

        // Writes to the detached instance no longer reach the log.
        room.lock_document().add_shape(rect("s2", 0.0)).unwrap();
        registry.flush_persistence().await;
        assert_eq!(store.len("board"), 1);

        let rehydrated = registry.get_document("board").await;
        assert!(!Arc::ptr_eq(&room, &rehydrated));
        assert_eq!(rehydrated.lock_document().shape_count(), 1);
        assert_eq!(registry.persisted_rooms().unwrap(), vec!["board"]);
    }

    #[tokio::test]
    async fn test_room_stats() {
        let registry = DocumentRegistry::in_memory(16);
        assert!(registry.get_room_stats("none").await.is_none());

        let room = registry.get_document("board").await;
        let empty = registry.get_room_stats("board").await.unwrap();
        assert_eq!(empty.shape_count, 0);
        assert!(!empty.has_metadata);
        assert_eq!(empty.connections, 0);

        room.lock_document().add_shape(rect("s1", 0.0)).unwrap();
        let _rx = room
            .broadcast()
            .add_peer(crate::broadcast::PeerInfo::new(Uuid::new_v4(), None))
            .await;

        let stats = registry.get_room_stats("board").await.unwrap();
        assert_eq!(stats.shape_count, 1);
        assert!(stats.has_metadata);
        assert_eq!(stats.connections, 1);
        assert!(!registry.has_store());
        assert!(registry.persisted_rooms().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presence_cache_excludes_requester() {
        let registry = DocumentRegistry::in_memory(16);
        let room = registry.get_document("board").await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (alice_conn, bob_conn) = (Uuid::new_v4(), Uuid::new_v4());

        room.remember_presence(alice, alice_conn, Arc::new(vec![1]));
        room.remember_presence(alice, alice_conn, Arc::new(vec![2]));
        room.remember_presence(bob, bob_conn, Arc::new(vec![3]));

        assert_eq!(room.presence_snapshot(bob), vec![Arc::new(vec![2])]);
        assert!(room.forget_presence(&alice, alice_conn));
        assert!(room.presence_snapshot(bob).is_empty());
        assert!(!room.forget_presence(&alice, alice_conn));
    }

    #[tokio::test]
    async fn test_presence_cache_kept_for_newer_connection() {
        let registry = DocumentRegistry::in_memory(16);
        let room = registry.get_document("board").await;
        let alice = Uuid::new_v4();
        let (old_conn, new_conn) = (Uuid::new_v4(), Uuid::new_v4());

        room.remember_presence(alice, old_conn, Arc::new(vec![1]));
        room.remember_presence(alice, new_conn, Arc::new(vec![2]));

        assert!(!room.forget_presence(&alice, old_conn));
        assert_eq!(room.presence_snapshot(Uuid::nil()), vec![Arc::new(vec![2])]);
    }
}
