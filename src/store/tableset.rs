//! The ordered collection of table readers behind one store.
//!
//! `novel` holds tables created locally (persisted memtables, conjoin
//! output) that the manifest does not name yet, most recent first.
//! `upstream` mirrors the manifest's spec list in manifest order. Reads
//! search novel before upstream, so locally written chunks win. Sets are
//! immutable values: every mutation returns a new set sharing readers with
//! the old one, which is what lets in-flight queries keep a stable snapshot
//! while the store swaps state underneath them.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::manifest::TableSpec;
use super::persist::TablePersister;
use super::table::{ChunkLocation, GetRecord, HasRecord, TableReader};
use crate::chunk::Chunk;
use crate::error::Result;
use crate::hash::Addr;

#[derive(Clone, Default)]
pub struct TableSet {
    novel: Vec<Arc<TableReader>>,
    upstream: Vec<Arc<TableReader>>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new set with `reader` at the front of novel.
    pub fn prepend(&self, reader: Arc<TableReader>) -> TableSet {
        let mut novel = Vec::with_capacity(self.novel.len() + 1);
        novel.push(reader);
        novel.extend(self.novel.iter().cloned());
        TableSet { novel, upstream: self.upstream.clone() }
    }

    /// A new set whose upstream reflects `specs` exactly, reusing already
    /// open readers by address and opening the rest through the persister.
    /// Novel tables that `specs` names migrate to upstream; the rest stay
    /// novel.
    pub async fn rebase(
        &self,
        specs: &[TableSpec],
        persister: &dyn TablePersister,
    ) -> Result<TableSet> {
        let mut existing: HashMap<Addr, Arc<TableReader>> = HashMap::new();
        for reader in self.novel.iter().chain(self.upstream.iter()) {
            existing.insert(reader.addr(), reader.clone());
        }

        let mut upstream = Vec::with_capacity(specs.len());
        for spec in specs {
            match existing.get(&spec.addr) {
                Some(reader) => upstream.push(reader.clone()),
                None => upstream.push(persister.open(*spec).await?),
            }
        }

        let novel = self
            .novel
            .iter()
            .filter(|reader| !specs.iter().any(|s| s.addr == reader.addr()))
            .cloned()
            .collect();

        Ok(TableSet { novel, upstream })
    }

    /// A new set with all novel tables moved to the front of upstream,
    /// preserving read priority. Applied after a successful commit.
    pub fn flatten(&self) -> TableSet {
        let mut upstream = Vec::with_capacity(self.novel.len() + self.upstream.len());
        upstream.extend(self.novel.iter().cloned());
        upstream.extend(self.upstream.iter().cloned());
        TableSet { novel: Vec::new(), upstream }
    }

    /// Snapshot of every table in read-priority order, the spec list a
    /// commit publishes.
    pub fn to_specs(&self) -> Vec<TableSpec> {
        self.iter_priority()
            .map(|reader| TableSpec { addr: reader.addr(), chunk_count: reader.chunk_count() })
            .collect()
    }

    pub fn novel_count(&self) -> usize {
        self.novel.len()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstream.len()
    }

    pub fn total_tables(&self) -> usize {
        self.novel.len() + self.upstream.len()
    }

    /// Summed chunk counts. Chunks stored in several tables count once per
    /// table; conjoin is what brings this back down.
    pub fn count(&self) -> u64 {
        self.iter_priority().map(|r| r.chunk_count() as u64).sum()
    }

    /// Summed on-disk size of all tables.
    pub fn physical_len(&self) -> u64 {
        self.iter_priority().map(|r| r.physical_len()).sum()
    }

    pub fn has(&self, addr: &Addr) -> bool {
        self.iter_priority().any(|r| r.has(addr))
    }

    /// Marks records any table holds. Returns true while records remain
    /// unresolved.
    pub fn has_many(&self, reqs: &mut [HasRecord]) -> bool {
        let mut remaining = true;
        for reader in self.iter_priority() {
            remaining = reader.has_many(reqs);
            if !remaining {
                break;
            }
        }
        remaining
    }

    pub async fn get(&self, addr: &Addr) -> Result<Option<Bytes>> {
        for reader in self.iter_priority() {
            if let Some(data) = reader.get(addr).await? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// Delivers requested chunks from novel then upstream tables. Returns
    /// true while records remain unresolved.
    pub async fn get_many(
        &self,
        reqs: &mut [GetRecord],
        sink: &mpsc::Sender<Chunk>,
    ) -> Result<bool> {
        let mut remaining = true;
        for reader in self.iter_priority() {
            remaining = reader.get_many(reqs, sink).await?;
            if !remaining {
                break;
            }
        }
        Ok(remaining)
    }

    /// Plans a batched get without reading: physical reads needed, whether
    /// the batch spans more than one table, and whether any request is
    /// satisfied by no table at all.
    pub fn calc_reads(&self, reqs: &mut [GetRecord], block_size: u64) -> (usize, bool, bool) {
        let mut reads = 0;
        let mut tables_hit = 0;
        for reader in self.iter_priority() {
            let table_reads = reader.calc_reads(reqs, block_size);
            if table_reads > 0 {
                tables_hit += 1;
                reads += table_reads;
            }
            if reqs.iter().all(|r| r.found) {
                break;
            }
        }
        let remaining = reqs.iter().any(|r| !r.found);
        (reads, tables_hit > 1, remaining)
    }

    /// Maps each resolvable request to the table holding it and the byte
    /// range of its payload there, without reading anything. Upstream
    /// tables are searched first so replication points at published
    /// tables wherever possible.
    pub fn chunk_locations(
        &self,
        reqs: &mut [GetRecord],
    ) -> HashMap<Addr, HashMap<Addr, ChunkLocation>> {
        let mut by_table = HashMap::new();
        for reader in self.upstream.iter().chain(self.novel.iter()) {
            let located = reader.locations(reqs);
            if !located.is_empty() {
                by_table.insert(reader.addr(), located.into_iter().collect());
            }
            if reqs.iter().all(|r| r.found) {
                break;
            }
        }
        by_table
    }

    /// Readers in read-priority order: novel (newest first), then upstream
    /// in manifest order.
    pub fn iter_priority(&self) -> impl Iterator<Item = &Arc<TableReader>> {
        self.novel.iter().chain(self.upstream.iter())
    }

    /// Readers oldest first, the order extraction replays chunks in.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = &Arc<TableReader>> {
        self.upstream.iter().rev().chain(self.novel.iter().rev())
    }
}
