//! In-process delta store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{DeltaStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, room: &str) -> usize {
        self.lock().get(room).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Vec<u8>>>> {
        self.logs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl DeltaStore for MemoryStore {
    fn append(&self, room: &str, delta: &[u8]) -> Result<u64, StoreError> {
        let mut logs = self.lock();
        let log = logs.entry(room.to_string()).or_default();
        log.push(delta.to_vec());
        Ok(log.len() as u64 - 1)
    }

    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.lock().get(room).cloned().unwrap_or_default())
    }

    fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let mut rooms: Vec<String> = self.lock().keys().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }
}
