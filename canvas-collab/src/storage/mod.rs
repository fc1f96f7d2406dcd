//! Durable per-room delta logs.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   committed deltas   ┌──────────────────┐
//! │ DocumentRegistry │ ───────────────────► │ DeltaStore       │
//! │ (in-memory rooms)│   (append, in order) │ RocksDB / memory │
//! └────────┬─────────┘                      └────────┬─────────┘
//!          │ first access                            │
//!          ▼                                         ▼
//! ┌──────────────────┐   full replay        ┌──────────────────────────────┐
//! │ Document         │ ◄─────────────────── │ CF "deltas":   lz4 deltas    │
//! │ (hydrated)       │                      │ CF "metadata": per-room info │
//! └──────────────────┘                      └──────────────────────────────┘
//! ```
//!
//! A log is append-only; hydration replays it strictly in append order.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentStore, RoomMetadata, StoreConfig};

/// Persistence adapter used by the room registry.
pub trait DeltaStore: Send + Sync + 'static {
    /// Append one delta to the room's log. Returns its sequence number.
    fn append(&self, room: &str, delta: &[u8]) -> Result<u64, StoreError>;

    /// Every delta of the room, in append order. Unknown rooms yield an
    /// empty log.
    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Rooms that have a persisted log.
    fn rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Room name cannot be used as a key
    InvalidRoom(String),
    SerializationError(String),
    DeserializationError(String),
    /// A stored delta failed to decompress
    Corrupt { room: String, seq: u64 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::InvalidRoom(room) => write!(f, "Invalid room name: {room:?}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Corrupt { room, seq } => {
                write!(f, "Corrupt delta {seq} in room {room:?}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
