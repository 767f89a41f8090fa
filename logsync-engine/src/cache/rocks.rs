//! RocksDB-backed cache for desktop clients.
//!
//! One column family, `sources`, keyed by the UTF-8 cache key. Values are
//! the JSON envelope, LZ4-compressed with a size prefix.

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};

use super::backend::{CacheBackend, CacheError};

const CF_SOURCES: &str = "sources";

/// On-disk store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logsync_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);

        let mut cf_opts = Options::default();
        cf_opts.set_block_based_table_factory(&block_opts);
        // values are already LZ4 framed
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(config.write_buffer_size);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_SOURCES, cf_opts)],
        )
        .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        log::debug!("Opened cache store at {}", config.path.display());
        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), CacheError> {
        self.db.flush().map_err(db_err)
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(CF_SOURCES)
            .ok_or_else(|| CacheError::Unavailable(format!("Column family '{CF_SOURCES}' not found")))
    }
}

impl CacheBackend for RocksBackend {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let cf = self.cf()?;
        let Some(compressed) = self.db.get_cf(cf, key.as_bytes()).map_err(db_err)? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| CacheError::Corrupt(e.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let cf = self.cf()?;
        let compressed = lz4_flex::compress_prepend_size(value.as_bytes());
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, key.as_bytes(), compressed, &write_opts)
            .map_err(db_err)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let cf = self.cf()?;
        self.db.delete_cf(cf, key.as_bytes()).map_err(db_err)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(db_err)?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            match std::str::from_utf8(&key) {
                Ok(k) => keys.push(k.to_string()),
                Err(_) => log::warn!("Skipping non-UTF-8 cache key under {prefix}"),
            }
        }
        Ok(keys)
    }
}

fn db_err(e: rocksdb::Error) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RocksBackend {
        RocksBackend::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(store.get("missing").unwrap(), None);

        store.set("logsync:self:me", r#"{"version":1}"#).unwrap();
        assert_eq!(store.get("logsync:self:me").unwrap().as_deref(), Some(r#"{"version":1}"#));

        store.remove("logsync:self:me").unwrap();
        assert_eq!(store.get("logsync:self:me").unwrap(), None);
    }

    #[test]
    fn test_prefix_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for key in ["logsync:friend:b", "logsync:friend:a", "logsync:group:g", "logsync:self:me"] {
            store.set(key, "{}").unwrap();
        }
        assert_eq!(
            store.keys_with_prefix("logsync:friend:").unwrap(),
            vec!["logsync:friend:a".to_string(), "logsync:friend:b".to_string()]
        );
        assert!(store.keys_with_prefix("other:").unwrap().is_empty());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            store.set("k", &"x".repeat(10_000)).unwrap();
            store.sync().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.get("k").unwrap().map(|v| v.len()), Some(10_000));
    }
}
