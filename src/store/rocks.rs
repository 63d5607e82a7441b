//! RocksDB-backed persistence.
//!
//! A single ordered keyspace holds both document snapshots (`doc:<name>`)
//! and room metadata (`room:<id>`); rooms are enumerated at startup with a
//! prefix scan. Values are LZ4-compressed at the block level, so the stored
//! snapshot stays the raw CRDT update from the caller's point of view.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rocksdb::{
    BlockBasedOptions, Cache, DBCompressionType, DBWithThreadMode, Direction, IteratorMode,
    Options, SingleThreaded,
};
use tracing::warn;

use super::{Persistence, StoreError};
use crate::registry::Room;

const DOC_PREFIX: &[u8] = b"doc:";
const ROOM_PREFIX: &[u8] = b"room:";

/// RocksDB tuning. Defaults fit a single-node relay; tests shrink the cache.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: f64,
    /// Max open files for RocksDB
    pub max_open_files: i32,
    /// Write buffer size
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/yjs-docs"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    closed: AtomicBool,
}

impl RocksStore {
    /// Open (or create) the store at `path` with default tuning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(RocksConfig {
            path: path.into(),
            ..RocksConfig::default()
        })
    }

    pub fn open_with(config: RocksConfig) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_keep_log_file_num(5);
        opts.increase_parallelism(num_cpus());
        opts.set_write_buffer_size(config.write_buffer_size);
        // LZ4: fast decompression, good enough ratio on CRDT bytes.
        opts.set_compression_type(DBCompressionType::Lz4);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        let db = DBWithThreadMode::<SingleThreaded>::open(&opts, &config.path)?;

        Ok(Self {
            db,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    fn doc_key(name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(DOC_PREFIX.len() + name.len());
        key.extend_from_slice(DOC_PREFIX);
        key.extend_from_slice(name.as_bytes());
        key
    }

    fn room_key(id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(ROOM_PREFIX.len() + id.len());
        key.extend_from_slice(ROOM_PREFIX);
        key.extend_from_slice(id.as_bytes());
        key
    }
}

impl Persistence for RocksStore {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(Self::doc_key(name))?)
    }

    fn persist_doc(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.db.put(Self::doc_key(name), bytes)?;
        Ok(())
    }

    fn load_all_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(ROOM_PREFIX, Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(ROOM_PREFIX) {
                break;
            }
            match serde_json::from_slice::<Room>(&value) {
                Ok(room) => rooms.push(room),
                // One corrupt record should not take the registry down.
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "skipping unreadable room record"
                ),
            }
        }

        Ok(rooms)
    }

    fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        let value = serde_json::to_vec(room)?;
        self.db.put(Self::room_key(&room.id), value)?;
        Ok(())
    }

    fn delete_room(&self, id: &str) -> Result<(), StoreError> {
        self.db.delete(Self::room_key(id))?;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.db
                .flush()
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Room;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open_with(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_doc_roundtrip() {
        let (_dir, store) = open_temp();

        assert!(store.load_doc("room1:notes.md").unwrap().is_none());

        store.persist_doc("room1:notes.md", b"crdt bytes").unwrap();
        assert_eq!(
            store.load_doc("room1:notes.md").unwrap().unwrap(),
            b"crdt bytes"
        );
    }

    #[test]
    fn test_doc_overwrite() {
        let (_dir, store) = open_temp();
        store.persist_doc("d", b"v1").unwrap();
        store.persist_doc("d", b"v2").unwrap();
        assert_eq!(store.load_doc("d").unwrap().unwrap(), b"v2");
    }

    #[test]
    fn test_room_roundtrip() {
        let (_dir, store) = open_temp();

        let room = Room::generate("demo".to_string(), Some("host-1".to_string()));
        store.save_room(&room).unwrap();

        let loaded = store.load_all_rooms().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, room.id);
        assert_eq!(loaded[0].token, room.token);
        assert_eq!(loaded[0].host_user_id.as_deref(), Some("host-1"));

        store.delete_room(&room.id).unwrap();
        assert!(store.load_all_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_keyspaces_do_not_collide() {
        let (_dir, store) = open_temp();

        let room = Room::generate("demo".to_string(), None);
        store.save_room(&room).unwrap();
        store.persist_doc(&format!("{}:x", room.id), b"doc").unwrap();

        // Room scan sees only rooms.
        assert_eq!(store.load_all_rooms().unwrap().len(), 1);
        // Doc load sees only the doc.
        assert!(store
            .load_doc(&format!("{}:x", room.id))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let room_id;

        {
            let store = RocksStore::open_with(RocksConfig::for_testing(&path)).unwrap();
            let room = Room::generate("persisted".to_string(), None);
            room_id = room.id.clone();
            store.save_room(&room).unwrap();
            store.persist_doc("a:b", b"snapshot").unwrap();
            store.close().unwrap();
        }

        let store = RocksStore::open_with(RocksConfig::for_testing(&path)).unwrap();
        let rooms = store.load_all_rooms().unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, room_id);
        assert_eq!(store.load_doc("a:b").unwrap().unwrap(), b"snapshot");
    }

    #[test]
    fn test_close_idempotent() {
        let (_dir, store) = open_temp();
        store.close().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_large_snapshot() {
        let (_dir, store) = open_temp();
        let data = vec![42u8; 1_000_000];
        store.persist_doc("big", &data).unwrap();
        let loaded = store.load_doc("big").unwrap().unwrap();
        assert_eq!(loaded.len(), 1_000_000);
        assert_eq!(loaded[999_999], 42);
    }
}
