//! # canvas-collab: Real-time collaboration engine for a shared shape canvas
//!
//! Every participant holds a replica of the canvas (shapes, groups, document
//! metadata) as a CRDT document; replicas exchange deltas through a relay
//! server that keeps one authoritative document per room and an append-only
//! delta log for durability.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer       │
//! │ (per user)  │   bincode frames   │ (relay)          │
//! └──────┬──────┘                    └────────┬─────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌──────────────────┐
//! │ Document    │                    │ DocumentRegistry │
//! │ + undo      │                    │ room → Document  │
//! │ + presence  │                    └────────┬─────────┘
//! │ + batching  │                             │
//! └─────────────┘                    ┌────────┴─────────┐
//!                                    │ BroadcastGroup   │ fan-out
//!                                    │ DeltaStore       │ RocksDB log
//!                                    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Shape/Group/Metadata records and partial patches
//! - [`document`]: Replicated document over `yrs`, with undo/redo
//! - [`undo`]: Origin-scoped undo/redo stacks
//! - [`presence`]: Ephemeral cursor/selection awareness
//! - [`connection`]: Transport lifecycle and reconnect backoff
//! - [`batching`]: Priority tiers that coalesce bursts of mutations
//! - [`metrics`]: Latency, quality bands, traffic counters
//! - [`protocol`]: Binary wire envelope
//! - [`client`]: The façade a UI layer talks to
//! - [`broadcast`]: Per-room fan-out with backpressure
//! - [`registry`]: Lazily hydrated room documents
//! - [`storage`]: Durable per-room delta logs
//! - [`server`]: WebSocket relay server

pub mod batching;
pub mod broadcast;
pub mod client;
pub mod connection;
pub mod document;
pub mod metrics;
pub mod model;
pub mod observer;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;
pub mod undo;

// Re-exports for convenience
pub use batching::{BatchConfig, Priority, QueueStatus, UpdateBatcher};
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, PeerInfo};
pub use client::{ClientConfig, SyncClient};
pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, Connector, Link, LinkHandler,
    ReconnectPolicy, TransportError, WebSocketConnector,
};
pub use document::{
    Document, DocumentTxn, MergeError, MetaEvent, Operation, OriginId, RecordChanges,
    RecordsEvent, UpdateEvent,
};
pub use metrics::{ConnectionQuality, LatencyTracker, MetricsSnapshot, TrafficSnapshot};
pub use model::{
    Bounds, Group, GroupPatch, Metadata, Point, Shape, ShapeKind, ShapePatch, Size, Style,
    ValidationError,
};
pub use observer::{Observers, Subscription};
pub use presence::{
    AwarenessMessage, PresenceChannel, PresenceConfig, PresenceEvent, PresencePatch,
    PresenceRecord, UserProfile,
};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use registry::{DocumentRegistry, Room, RoomStats};
pub use server::{room_from_path, ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DeltaStore, DocumentStore, MemoryStore, RoomMetadata, StoreConfig, StoreError,
};
pub use undo::{Change, EntryKey, StackSizes, UndoConfig, UndoManager};
