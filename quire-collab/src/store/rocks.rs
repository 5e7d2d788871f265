//! RocksDB-backed [`RemoteStore`], used by the relay for durable documents.
//!
//! Column families:
//! - `documents`: Snapshot records (state LZ4 compressed, keyed by doc_id)
//! - `collaborators`: Presence records (keyed by doc_id:user_id)
//! - `history`: Immutable history entries (keyed by doc_id:version BE)
//! - `counters`: Next history version per document (keyed by doc_id)
//!
//! Keys share a 16-byte doc_id prefix so per-document listings are a single
//! forward scan.
//!
//! Every database call runs on tokio's blocking pool; with `sync_writes` a
//! write waits for fsync there instead of on a runtime worker.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use super::{
    CreateOutcome, RemoteStore, RoomManager, ServerClock, SnapshotRecord, StoreError,
};
use crate::history::HistoryEntry;
use crate::presence::{PresenceEvent, PresenceRecord};

const CF_DOCUMENTS: &str = "documents";
const CF_COLLABORATORS: &str = "collaborators";
const CF_HISTORY: &str = "history";
const CF_COUNTERS: &str = "counters";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_COLLABORATORS, CF_HISTORY, CF_COUNTERS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, snapshots are the only copy)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Notifications buffered per watcher
    pub channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
            channel_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            channel_capacity: 64,
        }
    }
}

/// On-disk form of a [`SnapshotRecord`]: the decoded CRDT state, compressed.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    updated_at: DateTime<Utc>,
    state: Vec<u8>,
}

impl StoredSnapshot {
    fn from_record(record: &SnapshotRecord) -> Result<Self, StoreError> {
        let raw = STANDARD
            .decode(&record.content)
            .map_err(|e| StoreError::SerializationError(format!("snapshot is not base64: {e}")))?;
        Ok(Self {
            updated_at: record.updated_at,
            state: lz4_flex::compress_prepend_size(&raw),
        })
    }

    fn into_record(self) -> Result<SnapshotRecord, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(&self.state)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        Ok(SnapshotRecord {
            content: STANDARD.encode(raw),
            updated_at: self.updated_at,
        })
    }
}

struct RocksInner {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences (create-if-absent, counters).
    write_lock: Mutex<()>,
    rooms: RoomManager,
    clock: ServerClock,
}

/// Durable store handle. Cheap to clone.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<RocksInner>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(RocksInner {
                db,
                rooms: RoomManager::new(config.channel_capacity),
                config,
                write_lock: Mutex::new(()),
                clock: ServerClock::default(),
            }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Already LZ4 compressed at the record level
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_COLLABORATORS | CF_HISTORY => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_COUNTERS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.inner.rooms
    }

    /// All documents that have a snapshot.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut doc_ids = Vec::new();
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
            doc_ids.push(Uuid::from_bytes(bytes));
        }
        Ok(doc_ids)
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.inner
            .db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.inner.config.sync_writes);
        opts
    }

    fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key, value);
        self.inner.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn read_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.inner.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => decode::<StoredSnapshot>(&bytes)?.into_record().map(Some),
            None => Ok(None),
        }
    }

    fn write_snapshot(&self, doc_id: Uuid, content: String) -> Result<SnapshotRecord, StoreError> {
        let record = SnapshotRecord {
            content,
            updated_at: self.inner.clock.now(),
        };
        let stored = encode(&StoredSnapshot::from_record(&record)?)?;
        self.put(CF_DOCUMENTS, doc_id.as_bytes(), &stored)?;
        Ok(record)
    }

    /// Every value under a doc_id prefix, in key order.
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        doc_id: Uuid,
    ) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = doc_id.as_bytes();
        let iter = self
            .inner
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    async fn publish_snapshot(&self, doc_id: Uuid, record: SnapshotRecord) {
        self.inner.rooms.publish_snapshot(doc_id, record).await;
    }

    async fn publish_presence(&self, doc_id: Uuid, event: PresenceEvent) {
        self.inner.rooms.publish_presence(doc_id, event).await;
    }

    /// Run RocksDB work on the blocking pool. Writes may fsync.
    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| StoreError::DatabaseError(format!("blocking task failed: {e}")))?
    }

    fn remove_presence_record(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_COLLABORATORS)?;
        let key = compound_key(doc_id, user_id.as_bytes());
        if self.inner.db.get_cf(cf, &key)?.is_none() {
            return Ok(false);
        }
        self.inner.db.delete_cf_opt(cf, &key, &self.write_options())?;
        Ok(true)
    }

    fn increment_counter(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let cf = self.cf(CF_COUNTERS)?;
        let current = match self.inner.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::DeserializationError(format!("bad counter for {doc_id}"))
                })?;
                u64::from_be_bytes(buf)
            }
            None => 0,
        };
        let next = current + 1;
        self.put(CF_COUNTERS, doc_id.as_bytes(), &next.to_be_bytes())?;
        Ok(next)
    }

    fn insert_history(&self, doc_id: Uuid, entry: &HistoryEntry) -> Result<(), StoreError> {
        let cf = self.cf(CF_HISTORY)?;
        let key = compound_key(doc_id, &entry.version.to_be_bytes());
        if self.inner.db.get_cf(cf, &key)?.is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "documents/{doc_id}/history/{}",
                entry.version
            )));
        }
        self.put(CF_HISTORY, &key, &encode(entry)?)
    }
}

#[async_trait]
impl RemoteStore for RocksStore {
    async fn get_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        self.blocking(move |store| store.read_snapshot(doc_id)).await
    }

    async fn create_snapshot_if_absent(
        &self,
        doc_id: Uuid,
        content: String,
    ) -> Result<CreateOutcome, StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        let outcome = self
            .blocking(move |store| match store.read_snapshot(doc_id)? {
                Some(existing) => Ok(CreateOutcome::AlreadyExists(existing)),
                None => store.write_snapshot(doc_id, content).map(CreateOutcome::Created),
            })
            .await?;
        if let CreateOutcome::Created(record) = &outcome {
            self.publish_snapshot(doc_id, record.clone()).await;
        }
        Ok(outcome)
    }

    async fn put_snapshot(
        &self,
        doc_id: Uuid,
        content: String,
    ) -> Result<SnapshotRecord, StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        let record = self
            .blocking(move |store| store.write_snapshot(doc_id, content))
            .await?;
        self.publish_snapshot(doc_id, record.clone()).await;
        Ok(record)
    }

    async fn watch_snapshot(
        &self,
        doc_id: Uuid,
    ) -> Result<broadcast::Receiver<SnapshotRecord>, StoreError> {
        Ok(self.inner.rooms.get_or_create(doc_id).await.watch_snapshots())
    }

    async fn upsert_presence(
        &self,
        doc_id: Uuid,
        record: PresenceRecord,
    ) -> Result<(), StoreError> {
        let value = encode(&record)?;
        let key = compound_key(doc_id, record.user_id.as_bytes());
        self.blocking(move |store| store.put(CF_COLLABORATORS, &key, &value))
            .await?;
        self.publish_presence(doc_id, PresenceEvent::Upserted(record)).await;
        Ok(())
    }

    async fn remove_presence(&self, doc_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        let removed = self
            .blocking(move |store| store.remove_presence_record(doc_id, user_id))
            .await?;
        if removed {
            self.publish_presence(doc_id, PresenceEvent::Removed { user_id }).await;
        }
        Ok(())
    }

    async fn list_presence(&self, doc_id: Uuid) -> Result<Vec<PresenceRecord>, StoreError> {
        self.blocking(move |store| store.scan_prefix(CF_COLLABORATORS, doc_id))
            .await
    }

    async fn watch_presence(
        &self,
        doc_id: Uuid,
    ) -> Result<broadcast::Receiver<PresenceEvent>, StoreError> {
        Ok(self.inner.rooms.get_or_create(doc_id).await.watch_presence())
    }

    async fn next_version(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        self.blocking(move |store| store.increment_counter(doc_id)).await
    }

    async fn append_history(&self, doc_id: Uuid, entry: HistoryEntry) -> Result<(), StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        self.blocking(move |store| store.insert_history(doc_id, &entry))
            .await
    }

    async fn list_history(&self, doc_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut entries: Vec<HistoryEntry> = self
            .blocking(move |store| store.scan_prefix(CF_HISTORY, doc_id))
            .await?;
        entries.reverse();
        Ok(entries)
    }

    fn send_cleanup_beacon(&self, doc_id: Uuid, user_id: Uuid) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.clone();
        handle.spawn(async move {
            if let Err(e) = store.remove_presence(doc_id, user_id).await {
                log::debug!("Cleanup beacon for {user_id} dropped: {e}");
            }
        });
    }
}

/// doc_id (16 bytes) followed by a per-record suffix.
fn compound_key(doc_id: Uuid, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + suffix.len());
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(suffix);
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChangeType;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn presence(user_id: Uuid, name: &str) -> PresenceRecord {
        PresenceRecord {
            user_id,
            name: name.to_string(),
            color: "#cc3366".to_string(),
            cursor: None,
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_through_compression() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        let content = STANDARD.encode(vec![7u8; 4096]);

        let written = store.put_snapshot(doc, content.clone()).await.unwrap();
        let read = store.get_snapshot(doc).await.unwrap().unwrap();
        assert_eq!(read, written);
        assert_eq!(read.content, content);
    }

    #[tokio::test]
    async fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        assert!(store.get_snapshot(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_non_base64_content() {
        let (_dir, store) = open_temp();
        let result = store.put_snapshot(Uuid::new_v4(), "not base64!".into()).await;
        assert!(matches!(result, Err(StoreError::SerializationError(_))));
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        let first = store.create_snapshot_if_absent(doc, "AQI=".into()).await.unwrap();
        let second = store.create_snapshot_if_absent(doc, "AwQ=".into()).await.unwrap();
        let CreateOutcome::Created(record) = first else {
            panic!("expected Created");
        };
        assert_eq!(second, CreateOutcome::AlreadyExists(record));
    }

    #[tokio::test]
    async fn test_snapshot_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.put_snapshot(doc, "AQID".into()).await.unwrap();
            store.next_version(doc).await.unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get_snapshot(doc).await.unwrap().unwrap().content, "AQID");
        assert_eq!(store.list_documents().unwrap(), vec![doc]);
        assert_eq!(store.next_version(doc).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_presence_prefix_isolation() {
        let (_dir, store) = open_temp();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        store.upsert_presence(doc_a, presence(Uuid::new_v4(), "Alice")).await.unwrap();
        store.upsert_presence(doc_a, presence(Uuid::new_v4(), "Bob")).await.unwrap();
        store.upsert_presence(doc_b, presence(Uuid::new_v4(), "Carol")).await.unwrap();

        assert_eq!(store.list_presence(doc_a).await.unwrap().len(), 2);
        assert_eq!(store.list_presence(doc_b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_presence_remove_notifies_once() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();
        store.upsert_presence(doc, presence(alice, "Alice")).await.unwrap();
        let mut rx = store.watch_presence(doc).await.unwrap();

        store.remove_presence(doc, alice).await.unwrap();
        store.remove_presence(doc, alice).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), PresenceEvent::Removed { user_id: alice });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_history_newest_first_and_immutable() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        for _ in 0..3 {
            let version = store.next_version(doc).await.unwrap();
            let entry = HistoryEntry {
                version,
                timestamp: Utc::now(),
                author_id: Uuid::new_v4(),
                author_name: "Alice".into(),
                change_type: ChangeType::Revised,
                diff_summary: "Modified content (length unchanged)".into(),
            };
            store.append_history(doc, entry).await.unwrap();
        }

        let versions: Vec<u64> = store
            .list_history(doc)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![3, 2, 1]);

        let mut dup = store.list_history(doc).await.unwrap().remove(0);
        dup.diff_summary = "rewritten".into();
        assert!(matches!(
            store.append_history(doc, dup).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_database_work_runs_off_runtime_thread() {
        let (_dir, store) = open_temp();
        let runtime_thread = std::thread::current().id();
        let worker = store
            .blocking(|_| Ok(std::thread::current().id()))
            .await
            .unwrap();
        assert_ne!(worker, runtime_thread);
    }

    #[tokio::test]
    async fn test_concurrent_writers_share_counter() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.next_version(doc).await.unwrap() }));
        }
        let mut versions = Vec::new();
        for h in handles {
            versions.push(h.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<u64>>());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
        assert_eq!(config.path, PathBuf::from("quire_data"));
    }
}
