//! RocksDB-backed content store.
//!
//! Column families:
//! - `blobs`   : change set bytes (LZ4 compressed), keyed by ChangeId
//! - `metadata`: per-blob metadata (bincode: sizes, stored_at)
//!
//! Blobs are immutable: a key is written at most once, and a repeated
//! `put` of the same content only touches the bloom filter.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::ContentStore;
use crate::config::BlobStoreConfig;
use crate::error::StoreError;
use crate::protocol::ChangeId;

/// Column family names.
const CF_BLOBS: &str = "blobs";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_BLOBS, CF_METADATA];

/// Metadata stored alongside each blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    /// Uncompressed size in bytes
    pub size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Write timestamp (seconds since epoch)
    pub stored_at: u64,
}

impl BlobMetadata {
    fn new(size: usize, compressed_size: usize) -> Self {
        Self {
            size: size as u64,
            compressed_size: compressed_size as u64,
            stored_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Blob store statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobStats {
    pub blob_count: u64,
    pub stored_bytes: u64,
    pub compressed_bytes: u64,
}

/// RocksDB-backed content store.
pub struct BlobStore {
    /// RocksDB instance (single-threaded mode: concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: BlobStoreConfig,
    blob_count: AtomicU64,
    stored_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

impl BlobStore {
    /// Open the blob store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: BlobStoreConfig) -> Result<Self, StoreError> {
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

        let store = Self {
            db,
            config,
            blob_count: AtomicU64::new(0),
            stored_bytes: AtomicU64::new(0),
            compressed_bytes: AtomicU64::new(0),
        };
        store.recover_stats()?;
        log::info!(
            "Opened blob store at {} ({} blobs)",
            store.config.path.display(),
            store.blob_count.load(Ordering::Relaxed)
        );
        Ok(store)
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &BlobStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        // Point lookups only: every read is by content address
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        match name {
            CF_BLOBS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Rebuild counters from the metadata column family.
    fn recover_stats(&self) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let (mut count, mut stored, mut compressed) = (0u64, 0u64, 0u64);
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta = BlobMetadata::decode(&value)?;
            count += 1;
            stored += meta.size;
            compressed += meta.compressed_size;
        }
        self.blob_count.store(count, Ordering::Relaxed);
        self.stored_bytes.store(stored, Ordering::Relaxed);
        self.compressed_bytes.store(compressed, Ordering::Relaxed);
        Ok(())
    }

    /// Store a blob, returning its content address.
    pub fn put_blob(&self, bytes: &[u8]) -> Result<ChangeId, StoreError> {
        let id = ChangeId::of(bytes);
        let cf_blobs = self.cf(CF_BLOBS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = id.as_str().as_bytes();

        if self.db.get_pinned_cf(&cf_meta, key)?.is_some() {
            log::trace!("Blob {} already stored", id.short());
            return Ok(id);
        }

        let compressed = lz4_flex::compress_prepend_size(bytes);
        let meta = BlobMetadata::new(bytes.len(), compressed.len());

        // Atomic batch write: blob + metadata
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_blobs, key, &compressed);
        batch.put_cf(&cf_meta, key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        self.blob_count.fetch_add(1, Ordering::Relaxed);
        self.stored_bytes.fetch_add(meta.size, Ordering::Relaxed);
        self.compressed_bytes
            .fetch_add(meta.compressed_size, Ordering::Relaxed);
        log::debug!(
            "Stored blob {} ({} -> {} bytes)",
            id.short(),
            meta.size,
            meta.compressed_size
        );
        Ok(id)
    }

    /// Load a blob, verifying it still hashes to `id`.
    pub fn get_blob(&self, id: &ChangeId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        let compressed = match self.db.get_cf(&cf, id.as_str().as_bytes())? {
            Some(compressed) => compressed,
            None => return Ok(None),
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        if ChangeId::of(&bytes) != *id {
            return Err(StoreError::Corrupted(id.to_string()));
        }
        Ok(Some(bytes))
    }

    pub fn contains_blob(&self, id: &ChangeId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_pinned_cf(&cf, id.as_str().as_bytes())?.is_some())
    }

    pub fn metadata(&self, id: &ChangeId) -> Result<Option<BlobMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(BlobMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> BlobStats {
        BlobStats {
            blob_count: self.blob_count.load(Ordering::Relaxed),
            stored_bytes: self.stored_bytes.load(Ordering::Relaxed),
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl ContentStore for BlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ChangeId, StoreError> {
        self.put_blob(&bytes)
    }

    async fn get(&self, id: &ChangeId) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_blob(id)
    }

    async fn contains(&self, id: &ChangeId) -> Result<bool, StoreError> {
        self.contains_blob(id)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
