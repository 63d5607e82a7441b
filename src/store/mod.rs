//! Durable storage for document snapshots and room metadata.
//!
//! One embedded ordered key-value store, two keyspaces:
//!
//! - `doc:<name>`  → raw CRDT snapshot bytes
//! - `room:<id>`   → JSON-encoded room metadata
//!
//! The [`Persistence`] trait is threaded through construction of the engines
//! and the registry so tests can swap in [`MemStore`]; production uses
//! [`RocksStore`]. A missing key is a normal condition, never an error.

mod rocks;

pub use rocks::{RocksConfig, RocksStore};

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::registry::Room;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Storage contract shared by the RocksDB store and the in-memory test store.
///
/// All operations are short and synchronous; callers never hold an engine
/// lock across them. `close` is idempotent and called exactly once from the
/// shutdown path.
pub trait Persistence: Send + Sync {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn persist_doc(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn load_all_rooms(&self) -> Result<Vec<Room>, StoreError>;
    fn save_room(&self, room: &Room) -> Result<(), StoreError>;
    fn delete_room(&self, id: &str) -> Result<(), StoreError>;
    fn close(&self) -> Result<(), StoreError>;
}

/// In-memory implementation with the identical contract, for tests.
#[derive(Default)]
pub struct MemStore {
    docs: Mutex<HashMap<String, Vec<u8>>>,
    rooms: Mutex<HashMap<String, Room>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemStore {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.docs.lock().unwrap().get(name).cloned())
    }

    fn persist_doc(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.docs
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load_all_rooms(&self) -> Result<Vec<Room>, StoreError> {
        Ok(self.rooms.lock().unwrap().values().cloned().collect())
    }

    fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        self.rooms
            .lock()
            .unwrap()
            .insert(room.id.clone(), room.clone());
        Ok(())
    }

    fn delete_room(&self, id: &str) -> Result<(), StoreError> {
        self.rooms.lock().unwrap().remove(id);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
