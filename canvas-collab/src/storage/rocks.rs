//! RocksDB-backed delta log store.
//!
//! Column families:
//! - `deltas`  : CRDT deltas (LZ4 compressed, keyed by room + sequence)
//! - `metadata`: Per-room bookkeeping (bincode: next sequence, counts, sizes)
//!
//! Delta key layout: `room_len (u16 BE) | room bytes | seq (u64 BE)`. The
//! length prefix keeps one room's key range from overlapping another whose
//! name it prefixes, and big-endian sequences make iteration order equal
//! append order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use super::{DeltaStore, StoreError};

/// Column family names.
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DELTAS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-chosen directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Per-room bookkeeping stored next to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room: String,
    /// Sequence number the next append receives
    pub next_seq: u64,
    /// Uncompressed bytes appended so far
    pub total_bytes: u64,
    /// Compressed bytes appended so far
    pub compressed_bytes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last append timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room: &str) -> Self {
        let now = now_secs();
        Self {
            room: room.to_string(),
            next_seq: 0,
            total_bytes: 0,
            compressed_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of deltas in the room's log.
    pub fn delta_count(&self) -> u64 {
        self.next_seq
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed delta log store.
///
/// Each append writes the compressed delta and the updated room metadata in
/// one atomic batch, so a crash never leaves a sequence gap.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of room metadata across appends.
    append_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Delta store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            append_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DELTAS => {
                // Many small appends, range-scanned per room on hydration.
                // Values are already LZ4 framed.
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Bookkeeping for a room, `None` if it was never appended to.
    pub fn metadata(&self, room: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, room.as_bytes())? {
            Some(bytes) => Ok(Some(RoomMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Remove a room's log and metadata.
    pub fn delete_room(&self, room: &str) -> Result<u64, StoreError> {
        let _guard = self.append_lock.lock().unwrap_or_else(|p| p.into_inner());
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let prefix = room_prefix(room)?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;

        let iter = self
            .db
            .iterator_cf(cf_deltas, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf_deltas, &key);
            count += 1;
        }
        batch.delete_cf(cf_meta, room.as_bytes());

        self.write(batch)?;
        log::debug!("Deleted {count} deltas for room {room:?}");
        Ok(count)
    }

    /// Force a flush of the memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl DeltaStore for DocumentStore {
    fn append(&self, room: &str, delta: &[u8]) -> Result<u64, StoreError> {
        let _guard = self.append_lock.lock().unwrap_or_else(|p| p.into_inner());
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .metadata(room)?
            .unwrap_or_else(|| RoomMetadata::new(room));
        let seq = meta.next_seq;

        let compressed = lz4_flex::compress_prepend_size(delta);
        meta.next_seq += 1;
        meta.total_bytes += delta.len() as u64;
        meta.compressed_bytes += compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_deltas, delta_key(room, seq)?, &compressed);
        batch.put_cf(cf_meta, room.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(seq)
    }

    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = room_prefix(room)?;

        let mut deltas = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }

            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[prefix.len()..]);
            let seq = u64::from_be_bytes(seq_buf);

            let delta = lz4_flex::decompress_size_prepended(&value).map_err(|_| {
                StoreError::Corrupt {
                    room: room.to_string(),
                    seq,
                }
            })?;
            deltas.push(delta);
        }

        Ok(deltas)
    }

    fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            match std::str::from_utf8(&key) {
                Ok(room) => rooms.push(room.to_string()),
                Err(_) => log::warn!("Skipping non-UTF-8 room key in metadata"),
            }
        }

        Ok(rooms)
    }
}

/// Length-prefixed room component of a delta key.
fn room_prefix(room: &str) -> Result<Vec<u8>, StoreError> {
    let len = u16::try_from(room.len()).map_err(|_| StoreError::InvalidRoom(room.to_string()))?;
    let mut key = Vec::with_capacity(2 + room.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(room.as_bytes());
    Ok(key)
}

fn delta_key(room: &str, seq: u64) -> Result<Vec<u8>, StoreError> {
    let mut key = room_prefix(room)?;
    key.extend_from_slice(&seq.to_be_bytes());
    Ok(key)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
