//! Backends that materialize memtables into tables and open tables for
//! reading.

pub mod fs;
pub mod object;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

pub use fs::FsPersister;
pub use object::ObjectPersister;

use super::manifest::TableSpec;
use super::memtable::Memtable;
use super::table::{TableReader, TableWriter};
use crate::error::Result;
use crate::hash::Addr;

/// One storage backend's table lifecycle: persisting a memtable, merging
/// tables during conjoin, and opening tables named by the manifest.
#[async_trait]
pub trait TablePersister: Send + Sync {
    /// Writes the memtable's contents as one immutable table and returns a
    /// reader for it.
    async fn persist(&self, memtable: &Memtable) -> Result<Arc<TableReader>>;

    /// Merges the sources, in read-priority order with first occurrence
    /// winning, into one new table.
    async fn conjoin_all(&self, sources: &[Arc<TableReader>]) -> Result<Arc<TableReader>>;

    /// Opens an existing table.
    async fn open(&self, spec: TableSpec) -> Result<Arc<TableReader>>;
}

// Streams `sources` into a writer, skipping addresses already emitted.
pub(crate) async fn merge_tables(sources: &[Arc<TableReader>]) -> Result<TableWriter> {
    let mut writer = TableWriter::new();
    let mut seen: HashSet<Addr> = HashSet::new();
    for reader in sources {
        for pos in 0..reader.chunk_count() as usize {
            let addr = reader.index().addr_at(pos);
            if !seen.insert(addr) {
                continue;
            }
            let chunk = reader.chunk_at(pos).await?;
            writer.add(addr, chunk.data());
        }
    }
    Ok(writer)
}
