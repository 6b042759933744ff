use std::sync::Arc;

use crate::cache::CacheContext;

/// Configuration for a chunk store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Memtable flush threshold in bytes (default: 128 MiB).
    pub memtable_size_bytes: u64,

    /// Table count that triggers conjoin compaction (default: 256).
    pub max_tables: usize,

    /// Memtables holding more chunks than this are flushed before the
    /// manifest update lock is taken, so long flushes do not serialize
    /// against other committers (default: 8).
    pub preflush_chunk_count: usize,

    /// Shared table index cache budget in bytes (default: 8 MiB).
    pub index_cache_bytes: usize,

    /// Shared manifest cache budget in bytes (default: 8 MiB).
    pub manifest_cache_bytes: usize,

    /// Capacity of the shared file-descriptor cache (default: 256).
    pub fd_cache_entries: usize,

    /// Coalescing window for filesystem reads (default: 4 KiB).
    pub fs_block_size: u64,

    /// Coalescing window for object-store range reads (default: 512 KiB).
    pub object_block_size: u64,

    /// Target part size for multipart object uploads (default: 8 MiB).
    pub object_part_size: usize,

    /// Provider lower bound on part size (default: 5 MiB).
    pub object_min_part_size: usize,

    /// Provider upper bound on part size (default: 64 MiB).
    pub object_max_part_size: usize,

    /// Bound on in-flight object-store range fetches (default: 32).
    pub concurrent_reads: usize,

    /// Tables at or under this size are read through a whole-file memory
    /// map; larger tables are read through pooled descriptors
    /// (default: 256 MiB).
    pub mmap_table_bytes: u64,

    /// Shared caches. When unset the process-wide default context is used.
    pub caches: Option<Arc<CacheContext>>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memtable_size_bytes: 128 * 1024 * 1024,
            max_tables: 256,
            preflush_chunk_count: 8,
            index_cache_bytes: 8 * 1024 * 1024,
            manifest_cache_bytes: 8 * 1024 * 1024,
            fd_cache_entries: 256,
            fs_block_size: 4096,
            object_block_size: 512 * 1024,
            object_part_size: 8 * 1024 * 1024,
            object_min_part_size: 5 * 1024 * 1024,
            object_max_part_size: 64 * 1024 * 1024,
            concurrent_reads: 32,
            mmap_table_bytes: 256 * 1024 * 1024,
            caches: None,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memtable flush threshold.
    pub fn memtable_size_bytes(mut self, bytes: u64) -> Self {
        self.memtable_size_bytes = bytes;
        self
    }

    /// Set the conjoin trigger.
    pub fn max_tables(mut self, count: usize) -> Self {
        self.max_tables = count;
        self
    }

    /// Set the pre-flush chunk count.
    pub fn preflush_chunk_count(mut self, count: usize) -> Self {
        self.preflush_chunk_count = count;
        self
    }

    /// Set the index cache budget.
    pub fn index_cache_bytes(mut self, bytes: usize) -> Self {
        self.index_cache_bytes = bytes;
        self
    }

    /// Set the fd cache capacity.
    pub fn fd_cache_entries(mut self, entries: usize) -> Self {
        self.fd_cache_entries = entries;
        self
    }

    /// Set the filesystem read coalescing window.
    pub fn fs_block_size(mut self, bytes: u64) -> Self {
        self.fs_block_size = bytes;
        self
    }

    /// Set the object-store read coalescing window.
    pub fn object_block_size(mut self, bytes: u64) -> Self {
        self.object_block_size = bytes;
        self
    }

    /// Set the multipart upload part size.
    pub fn object_part_size(mut self, bytes: usize) -> Self {
        self.object_part_size = bytes;
        self
    }

    /// Set the object-store read concurrency bound.
    pub fn concurrent_reads(mut self, permits: usize) -> Self {
        self.concurrent_reads = permits;
        self
    }

    /// Set the whole-file mapping size limit.
    pub fn mmap_table_bytes(mut self, bytes: u64) -> Self {
        self.mmap_table_bytes = bytes;
        self
    }

    /// Inject an explicit cache context instead of the process default.
    pub fn caches(mut self, caches: Arc<CacheContext>) -> Self {
        self.caches = Some(caches);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.memtable_size_bytes, 128 * 1024 * 1024);
        assert_eq!(config.max_tables, 256);
        assert_eq!(config.preflush_chunk_count, 8);
        assert_eq!(config.index_cache_bytes, 8 * 1024 * 1024);
        assert_eq!(config.fd_cache_entries, 256);
        assert_eq!(config.concurrent_reads, 32);
        assert!(config.caches.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new()
            .memtable_size_bytes(1024)
            .max_tables(4)
            .preflush_chunk_count(2)
            .fs_block_size(64)
            .concurrent_reads(8);

        assert_eq!(config.memtable_size_bytes, 1024);
        assert_eq!(config.max_tables, 4);
        assert_eq!(config.preflush_chunk_count, 2);
        assert_eq!(config.fs_block_size, 64);
        assert_eq!(config.concurrent_reads, 8);
    }
}
