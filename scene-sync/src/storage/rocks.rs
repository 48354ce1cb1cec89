//! RocksDB-backed scene store.
//!
//! Column families:
//! - `scenes`  : one element set per session (JSON, LZ4 compressed)
//! - `metadata`: per-session bookkeeping (bincode)
//!
//! Keys are the session identifier's UTF-8 bytes. A save writes both
//! families in one batch.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{SceneStore, StoreError};
use crate::element::ElementSet;

const CF_SCENES: &str = "scenes";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SCENES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every save (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scene_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, synchronous writes.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub session_id: String,
    /// Saves since the session was first persisted
    pub save_count: u64,
    pub element_count: u64,
    /// Uncompressed JSON size in bytes
    pub scene_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl SceneMetadata {
    fn new(session_id: &str) -> Self {
        let now = unix_now();
        Self {
            session_id: session_id.to_string(),
            save_count: 0,
            element_count: 0,
            scene_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
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

/// RocksDB scene store.
pub struct RocksSceneStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSceneStore {
    /// Open (or create) the store at `config.path`.
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
        log::info!("Scene store opened at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are already LZ4 frames.
            CF_SCENES => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Metadata for `session_id`, if it was ever saved.
    pub fn load_metadata(&self, session_id: &str) -> Result<Option<SceneMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(bytes) => Ok(Some(SceneMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every session with a stored scene.
    pub fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            sessions.push(id);
        }
        Ok(sessions)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SCENES)?, session_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, session_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl SceneStore for RocksSceneStore {
    fn load_elements(&self, session_id: &str) -> Result<ElementSet, StoreError> {
        let cf = self.cf(CF_SCENES)?;
        let Some(compressed) = self.db.get_cf(cf, session_id.as_bytes())? else {
            return Ok(ElementSet::new());
        };
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn save_elements(&self, session_id: &str, elements: &ElementSet) -> Result<(), StoreError> {
        let cf_scenes = self.cf(CF_SCENES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json =
            serde_json::to_vec(elements).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = self
            .load_metadata(session_id)?
            .unwrap_or_else(|| SceneMetadata::new(session_id));
        meta.save_count += 1;
        meta.element_count = elements.len() as u64;
        meta.scene_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_scenes, session_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, session_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved session {session_id}: {} elements, {} -> {} bytes",
            meta.element_count,
            meta.scene_size,
            meta.compressed_size
        );
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
