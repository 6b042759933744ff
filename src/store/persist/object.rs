//! Object-store persister.
//!
//! Tables are objects named by their base32 address under the store prefix.
//! Uploads above the part threshold go through multipart puts; reads fetch
//! the index tail with one ranged GET at open and chunk payloads with
//! coalesced ranged GETs bounded by the shared read semaphore.

use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

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

pub struct ObjectPersister {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    block_size: u64,
    part_size: usize,
    reads: Arc<Semaphore>,
    caches: Arc<CacheContext>,
}

impl ObjectPersister {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: ObjectPath,
        config: &StoreConfig,
        caches: Arc<CacheContext>,
    ) -> Self {
        let part_size = config
            .object_part_size
            .clamp(config.object_min_part_size, config.object_max_part_size);
        Self {
            store,
            prefix,
            block_size: config.object_block_size,
            part_size,
            reads: Arc::new(Semaphore::new(config.concurrent_reads)),
            caches,
        }
    }

    fn table_path(&self, addr: &Addr) -> ObjectPath {
        self.prefix.child(addr.to_string())
    }

    async fn write_table(&self, table: FinishedTable) -> Result<Arc<TableReader>> {
        let spec = TableSpec { addr: table.addr, chunk_count: table.chunk_count };
        let path = self.table_path(&spec.addr);

        if table.data.len() > self.part_size {
            let (_id, mut upload) = self.store.put_multipart(&path).await?;
            for part in table.data.chunks(self.part_size) {
                upload.write_all(part).await?;
            }
            upload.shutdown().await?;
        } else {
            self.store.put(&path, table.data.clone()).await?;
        }

        if self.caches.index(&spec.addr).is_none() {
            let index = Arc::new(TableIndex::parse(&table.data)?);
            self.caches.put_index(spec.addr, index);
        }

        self.open(spec).await
    }
}

#[async_trait]
impl TablePersister for ObjectPersister {
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
        let path = self.table_path(&spec.addr);

        let index = match self.caches.index(&spec.addr) {
            Some(index) => index,
            None => {
                let meta = self.store.head(&path).await?;
                let tail = index_and_footer_len(spec.chunk_count);
                if meta.size < tail {
                    return errcorrupt!(
                        "table {} is {} bytes, too small for its index",
                        spec.addr,
                        meta.size
                    );
                }
                let buf = self.store.get_range(&path, meta.size - tail..meta.size).await?;
                let index = Arc::new(TableIndex::parse(&buf)?);
                let region = &buf[..tail - FOOTER_SIZE];
                if Addr::of(region) != spec.addr {
                    return errcorrupt!("table object {} does not hash to its name", spec.addr);
                }
                self.caches.put_index(spec.addr, index.clone());
                index
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

        let data = TableData::Object {
            store: self.store.clone(),
            path,
            reads: self.reads.clone(),
        };
        Ok(Arc::new(TableReader::new(spec.addr, index, data, self.block_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_store::memory::InMemory;

    fn persister(config: StoreConfig) -> ObjectPersister {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let caches = CacheContext::new(1024 * 1024, 1024 * 1024, 16);
        ObjectPersister::new(store, ObjectPath::from("db"), &config, caches)
    }

    fn filled_memtable(n: usize) -> Memtable {
        let mt = Memtable::new(1 << 24);
        for i in 0..n {
            let data = Bytes::from(format!("object persister chunk {i}"));
            assert!(mt.add_chunk(Addr::of(&data), data));
        }
        mt
    }

    #[tokio::test]
    async fn test_persist_and_reopen() {
        let p = persister(StoreConfig::default());
        let mt = filled_memtable(25);

        let reader = p.persist(&mt).await.unwrap();
        assert_eq!(reader.chunk_count(), 25);

        let spec = TableSpec { addr: reader.addr(), chunk_count: 25 };
        let reopened = p.open(spec).await.unwrap();
        for chunk in mt.extract() {
            let read = reopened.get(&chunk.addr()).await.unwrap().expect("chunk missing");
            assert_eq!(&read, chunk.data());
        }
    }

    #[tokio::test]
    async fn test_multipart_upload_roundtrip() {
        // Force the multipart path with the smallest permitted parts.
        let config = StoreConfig::default()
            .object_part_size(5 * 1024 * 1024)
            .memtable_size_bytes(1 << 24);
        let p = persister(config);

        let mt = Memtable::new(1 << 24);
        let mut addrs = Vec::new();
        for i in 0..3 {
            // Three ~3 MiB chunks make an ~9 MiB table, above one part.
            let data = Bytes::from(vec![i as u8; 3 * 1024 * 1024]);
            let addr = Addr::of(&data);
            assert!(mt.add_chunk(addr, data));
            addrs.push(addr);
        }

        let reader = p.persist(&mt).await.unwrap();
        assert_eq!(reader.chunk_count(), 3);
        for addr in &addrs {
            let read = reader.get(addr).await.unwrap().expect("chunk missing");
            assert_eq!(read.len(), 3 * 1024 * 1024);
        }
    }

    #[tokio::test]
    async fn test_open_missing_table_is_io_error() {
        let p = persister(StoreConfig::default());
        let spec = TableSpec { addr: Addr::of(b"no such table"), chunk_count: 1 };
        assert!(matches!(p.open(spec).await, Err(crate::error::Error::IO(_))));
    }

    #[tokio::test]
    async fn test_conjoin_all_merges() {
        let p = persister(StoreConfig::default());

        let a = p.persist(&filled_memtable(10)).await.unwrap();
        let mt = Memtable::new(1 << 20);
        let extra = Bytes::from_static(b"extra chunk");
        mt.add_chunk(Addr::of(&extra), extra.clone());
        let b = p.persist(&mt).await.unwrap();

        let merged = p.conjoin_all(&[a.clone(), b]).await.unwrap();
        assert_eq!(merged.chunk_count(), 11);
        let read = merged.get(&Addr::of(&extra)).await.unwrap().expect("chunk missing");
        assert_eq!(&read, &extra);
    }
}
