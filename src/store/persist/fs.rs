//! Local filesystem persister.
//!
//! Tables live one file per table in the store directory, named by their
//! base32 address. New tables are written to a temp file and renamed into
//! place; since names are content-derived, a table that already exists
//! needs no rewrite. Small tables are read through whole-file memory maps;
//! tables above the configured limit are read with positioned reads through
//! descriptors pooled in the shared fd cache. Parsed indexes land in the
//! shared index cache either way.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use memmap2::Mmap;

use super::{merge_tables, TablePersister};
use crate::cache::CacheContext;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::errcorrupt;
use crate::hash::Addr;
use crate::store::manifest::TableSpec;
use crate::store::memtable::Memtable;
use crate::store::table::index::FOOTER_SIZE;
use crate::store::table::{index_and_footer_len, FinishedTable, TableData, TableIndex, TableReader, TableWriter};

pub struct FsPersister {
    dir: PathBuf,
    block_size: u64,
    mmap_limit: u64,
    caches: Arc<CacheContext>,
}

impl FsPersister {
    pub fn new(dir: impl Into<PathBuf>, config: &StoreConfig, caches: Arc<CacheContext>) -> Self {
        Self {
            dir: dir.into(),
            block_size: config.fs_block_size,
            mmap_limit: config.mmap_table_bytes,
            caches,
        }
    }

    fn table_path(&self, spec: &TableSpec) -> PathBuf {
        self.dir.join(spec.addr.to_string())
    }

    async fn write_table(&self, table: FinishedTable) -> Result<Arc<TableReader>> {
        let spec = TableSpec { addr: table.addr, chunk_count: table.chunk_count };
        let path = self.table_path(&spec);

        if !path.exists() {
            let tmp = self.dir.join(format!(".{}-{}.tmp", table.addr, std::process::id()));
            let mut file = OpenOptions::new().create(true).truncate(true).write(true).open(&tmp)?;
            file.write_all(&table.data)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, &path)?;
        }

        // The index was just framed in memory; parse it once here so open
        // hits the cache.
        if self.caches.index(&spec.addr).is_none() {
            let index = Arc::new(TableIndex::parse(&table.data)?);
            self.caches.put_index(spec.addr, index);
        }

        self.open(spec).await
    }
}

#[async_trait]
impl TablePersister for FsPersister {
    async fn persist(&self, memtable: &Memtable) -> Result<Arc<TableReader>> {
        let mut writer = TableWriter::new();
        memtable.write_to(&mut writer);
        self.write_table(writer.finish()?).await
    }

    async fn conjoin_all(&self, sources: &[Arc<TableReader>]) -> Result<Arc<TableReader>> {
        let writer = merge_tables(sources).await?;
        self.write_table(writer.finish()?).await
    }

    async fn open(&self, spec: TableSpec) -> Result<Arc<TableReader>> {
        let path = self.table_path(&spec);
        let file = File::open(&path)?;
        let size = file.metadata()?.len();

        let cached = self.caches.index(&spec.addr);
        let (index, map) = match cached {
            Some(index) => (index, None),
            None => {
                let map = unsafe { Mmap::map(&file)? };
                let index = Arc::new(TableIndex::parse(&map)?);
                let tail = index_and_footer_len(index.chunk_count());
                let region = &map[map.len() - tail..map.len() - FOOTER_SIZE];
                if Addr::of(region) != spec.addr {
                    return errcorrupt!("table file {} does not hash to its name", spec.addr);
                }
                self.caches.put_index(spec.addr, index.clone());
                (index, Some(map))
            }
        };

        if index.chunk_count() != spec.chunk_count {
            return errcorrupt!(
                "table {} holds {} chunks but manifest claims {}",
                spec.addr,
                index.chunk_count(),
                spec.chunk_count
            );
        }

        let data = if size <= self.mmap_limit {
            let map = match map {
                Some(map) => map,
                None => unsafe { Mmap::map(&file)? },
            };
            TableData::Mapped(Arc::new(map))
        } else {
            let pooled = match self.caches.fd(&path) {
                Some(pooled) => pooled,
                None => {
                    let pooled = Arc::new(file);
                    self.caches.put_fd(path.clone(), pooled.clone());
                    pooled
                }
            };
            TableData::File(pooled)
        };

        Ok(Arc::new(TableReader::new(spec.addr, index, data, self.block_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Addr;
    use crate::tmpfs::TempDir;
    use bytes::Bytes;

    fn persister(dir: &TempDir, config: StoreConfig) -> FsPersister {
        let caches = CacheContext::new(1024 * 1024, 1024 * 1024, 16);
        FsPersister::new(dir.path(), &config, caches)
    }

    fn filled_memtable(n: usize) -> Memtable {
        let mt = Memtable::new(1 << 20);
        for i in 0..n {
            let data = Bytes::from(format!("fs persister chunk {i}"));
            assert!(mt.add_chunk(Addr::of(&data), data));
        }
        mt
    }

    #[tokio::test]
    async fn test_persist_and_reopen() {
        let dir = TempDir::new().unwrap();
        let p = persister(&dir, StoreConfig::default());
        let mt = filled_memtable(25);

        let reader = p.persist(&mt).await.unwrap();
        assert_eq!(reader.chunk_count(), 25);

        // The table file carries the reader's name.
        let path = dir.path().join(reader.addr().to_string());
        assert!(path.exists());

        let spec = TableSpec { addr: reader.addr(), chunk_count: 25 };
        let reopened = p.open(spec).await.unwrap();
        for chunk in mt.extract() {
            let read = reopened.get(&chunk.addr()).await.unwrap().expect("chunk missing");
            assert_eq!(&read, chunk.data());
        }
    }

    #[tokio::test]
    async fn test_large_tables_use_pooled_descriptors() {
        let dir = TempDir::new().unwrap();
        // Everything is "large" with a zero mapping limit.
        let p = persister(&dir, StoreConfig::default().mmap_table_bytes(0));
        let mt = filled_memtable(10);

        let reader = p.persist(&mt).await.unwrap();
        for chunk in mt.extract() {
            let read = reader.get(&chunk.addr()).await.unwrap().expect("chunk missing");
            assert_eq!(&read, chunk.data());
        }
    }

    #[tokio::test]
    async fn test_starved_index_cache_changes_nothing() {
        let dir = TempDir::new().unwrap();
        // A 1-byte budget caches no index at all; every open re-parses.
        let caches = CacheContext::new(1, 1024 * 1024, 16);
        let p = FsPersister::new(dir.path(), &StoreConfig::default(), caches);
        let mt = filled_memtable(25);

        let reader = p.persist(&mt).await.unwrap();
        let spec = TableSpec { addr: reader.addr(), chunk_count: 25 };
        let reopened = p.open(spec).await.unwrap();
        for chunk in mt.extract() {
            let read = reopened.get(&chunk.addr()).await.unwrap().expect("chunk missing");
            assert_eq!(&read, chunk.data());
        }
    }

    #[tokio::test]
    async fn test_open_detects_wrong_chunk_count() {
        let dir = TempDir::new().unwrap();
        let p = persister(&dir, StoreConfig::default());
        let mt = filled_memtable(5);
        let reader = p.persist(&mt).await.unwrap();

        let spec = TableSpec { addr: reader.addr(), chunk_count: 6 };
        assert!(matches!(
            p.open(spec).await,
            Err(crate::error::Error::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_table_is_io_error() {
        let dir = TempDir::new().unwrap();
        let p = persister(&dir, StoreConfig::default());
        let spec = TableSpec { addr: Addr::of(b"no such table"), chunk_count: 1 };
        assert!(matches!(p.open(spec).await, Err(crate::error::Error::IO(_))));
    }

    #[tokio::test]
    async fn test_conjoin_all_dedups_first_wins() {
        let dir = TempDir::new().unwrap();
        let p = persister(&dir, StoreConfig::default());

        let shared = Bytes::from_static(b"chunk in both tables");
        let only_a = Bytes::from_static(b"chunk only in a");
        let only_b = Bytes::from_static(b"chunk only in b");

        let mt_a = Memtable::new(1 << 20);
        mt_a.add_chunk(Addr::of(&shared), shared.clone());
        mt_a.add_chunk(Addr::of(&only_a), only_a.clone());
        let a = p.persist(&mt_a).await.unwrap();

        let mt_b = Memtable::new(1 << 20);
        mt_b.add_chunk(Addr::of(&shared), shared.clone());
        mt_b.add_chunk(Addr::of(&only_b), only_b.clone());
        let b = p.persist(&mt_b).await.unwrap();

        let merged = p.conjoin_all(&[a, b]).await.unwrap();
        assert_eq!(merged.chunk_count(), 3);
        for data in [&shared, &only_a, &only_b] {
            let read = merged.get(&Addr::of(data)).await.unwrap().expect("chunk missing");
            assert_eq!(&read, data);
        }
    }
}
