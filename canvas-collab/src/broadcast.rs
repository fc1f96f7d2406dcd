//! Per-room fan-out to N-1 peers with backpressure.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each peer
//! gets an independent receiver that buffers up to `capacity` frames; a peer
//! that falls further behind loses the oldest frames and is reported as lagged.
//! Lost deltas are recovered by the next sync handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::model::now_millis;
use crate::protocol::{ProtocolError, SyncMessage};

/// Pre-encoded message plus the peer that produced it, so receivers can skip
/// their own frames without decoding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// A connection registered in a room.
///
/// A client keeps its `peer_id` across reconnects; `connection_id` tells
/// its successive connections apart.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub connection_id: Uuid,
    pub addr: Option<SocketAddr>,
    /// Milliseconds since the epoch
    pub joined_at: u64,
}

impl PeerInfo {
    pub fn new(peer_id: Uuid, addr: Option<SocketAddr>) -> Self {
        Self {
            peer_id,
            connection_id: Uuid::new_v4(),
            addr,
            joined_at: now_millis(),
        }
    }

    pub fn with_connection(mut self, connection_id: Uuid) -> Self {
        self.connection_id = connection_id;
        self
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, lock-free on the hot path. Read via `stats()`.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    room: String,
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames can be buffered per peer before a
    /// lagging peer starts dropping.
    pub fn new(room: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            room: room.into(),
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer. Returns its receiver. A newer connection of the same
    /// peer replaces the older registration.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        let rx = self.sender.subscribe();
        if let Some(previous) = peers.insert(info.peer_id, info) {
            log::debug!(
                "Peer {} re-registered in room {:?}, connection {} superseded",
                previous.peer_id,
                self.room,
                previous.connection_id
            );
        }
        rx
    }

    /// Unregister `info`'s connection. A registration that belongs to a
    /// newer connection of the same peer is left alone.
    pub async fn remove_peer(&self, info: &PeerInfo) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        match peers.get(&info.peer_id) {
            Some(current) if current.connection_id == info.connection_id => {
                peers.remove(&info.peer_id)
            }
            _ => None,
        }
    }

    /// Encode and fan out a message. Returns the number of receivers,
    /// including the sender's own; filtering is the receiver's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(msg.peer_id, Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes. Fully lock-free.
    pub fn broadcast_raw(&self, from: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Frame { from, bytes }).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
