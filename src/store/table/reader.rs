//! Reading chunks out of one immutable table.
//!
//! A reader pairs a parsed [`TableIndex`] with one of three data sources: a
//! whole-file memory map, a pooled file descriptor read with positioned
//! reads, or an object-store location fetched with ranged GETs. Batched
//! lookups are planned against the index first and physically adjacent (or
//! nearly adjacent, within `block_size`) chunks are fetched with a single
//! read; on the object backend that means one ranged GET per block.
//!
//! Every payload that leaves a reader is verified against the address that
//! requested it; a mismatch is corruption of the affected table.

use std::fs::File;
use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::sync::{mpsc, Semaphore};

use super::index::TableIndex;
use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::errcorrupt;
use crate::hash::Addr;

/// One address in a batched get, sorted by prefix. `found` is set once some
/// source in the read path has delivered the chunk.
#[derive(Debug, Clone)]
pub struct GetRecord {
    pub addr: Addr,
    pub prefix: u64,
    pub found: bool,
}

/// One address in a batched existence check.
#[derive(Debug, Clone)]
pub struct HasRecord {
    pub addr: Addr,
    pub prefix: u64,
    pub has: bool,
}

/// Deduplicates and prefix-sorts addresses for a batched get.
pub fn to_get_records(addrs: &[Addr]) -> Vec<GetRecord> {
    let mut sorted: Vec<Addr> = addrs.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
        .into_iter()
        .map(|addr| GetRecord { addr, prefix: addr.prefix(), found: false })
        .collect()
}

/// Deduplicates and prefix-sorts addresses for a batched has.
pub fn to_has_records(addrs: &[Addr]) -> Vec<HasRecord> {
    let mut sorted: Vec<Addr> = addrs.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
        .into_iter()
        .map(|addr| HasRecord { addr, prefix: addr.prefix(), has: false })
        .collect()
}

/// Physical position of one chunk's payload inside a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    pub offset: u64,
    pub length: u32,
}

/// Where a table's bytes live.
pub enum TableData {
    /// Whole file mapped into memory.
    Mapped(Arc<Mmap>),
    /// Positioned reads through a pooled descriptor.
    File(Arc<File>),
    /// Ranged GETs against an object store, bounded by the shared read
    /// semaphore.
    Object {
        store: Arc<dyn ObjectStore>,
        path: ObjectPath,
        reads: Arc<Semaphore>,
    },
}

/// A shareable handle to one immutable table. Clones share the index and
/// data source, so a table set hands the same reader to overlapping queries
/// and rebases cheaply.
#[derive(Clone)]
pub struct TableReader {
    addr: Addr,
    index: Arc<TableIndex>,
    data: Arc<TableData>,
    block_size: u64,
}

// A physically contiguous read covering one or more chunks.
struct PlannedRead {
    offset: u64,
    len: usize,
    chunks: Vec<PlannedChunk>,
}

struct PlannedChunk {
    addr: Addr,
    offset: u64,
    len: u32,
}

impl TableReader {
    pub fn new(addr: Addr, index: Arc<TableIndex>, data: TableData, block_size: u64) -> Self {
        Self { addr, index, data: Arc::new(data), block_size }
    }

    /// The table's name.
    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn chunk_count(&self) -> u32 {
        self.index.chunk_count()
    }

    /// On-disk size of the table.
    pub fn physical_len(&self) -> u64 {
        self.index.table_len()
    }

    pub fn index(&self) -> &Arc<TableIndex> {
        &self.index
    }

    /// Index-only membership check; no payload read.
    pub fn has(&self, addr: &Addr) -> bool {
        self.index.ordinal_of(addr).is_some()
    }

    /// Marks records this table holds. Returns true while any record is
    /// still unresolved.
    pub fn has_many(&self, reqs: &mut [HasRecord]) -> bool {
        let mut remaining = false;
        for req in reqs.iter_mut() {
            if !req.has && self.index.ordinal_of(&req.addr).is_some() {
                req.has = true;
            }
            remaining |= !req.has;
        }
        remaining
    }

    /// Reads a single chunk, verifying the payload against its address.
    pub async fn get(&self, addr: &Addr) -> Result<Option<Bytes>> {
        let Some(ordinal) = self.index.ordinal_of(addr) else {
            return Ok(None);
        };
        let offset = self.index.offset_at(ordinal);
        let len = self.index.length_at(ordinal) as usize;
        let data = self.read_range(offset, len).await?;
        self.verify(addr, &data)?;
        Ok(Some(data))
    }

    /// Delivers every requested chunk this table holds into `sink`, fetching
    /// near-adjacent chunks with single coalesced reads. Returns true while
    /// any record is still unresolved. A dropped receiver cancels the batch.
    pub async fn get_many(
        &self,
        reqs: &mut [GetRecord],
        sink: &mpsc::Sender<Chunk>,
    ) -> Result<bool> {
        let plans = self.plan_reads(reqs, self.block_size);
        for plan in plans {
            let buf = self.read_range(plan.offset, plan.len).await?;
            for chunk in &plan.chunks {
                let rel = (chunk.offset - plan.offset) as usize;
                let data = buf.slice(rel..rel + chunk.len as usize);
                self.verify(&chunk.addr, &data)?;
                if sink.send(Chunk::with_addr(chunk.addr, data)).await.is_err() {
                    return Ok(remaining(reqs));
                }
            }
        }
        Ok(remaining(reqs))
    }

    /// Plans the batch without reading, marking records this table holds.
    /// Returns the number of physical reads a `get_many` would issue.
    pub fn calc_reads(&self, reqs: &mut [GetRecord], block_size: u64) -> usize {
        self.plan_reads(reqs, block_size).len()
    }

    /// Resolves the payload ranges of records this table holds, marking
    /// them found. Index-only; no payload is read. Replication layers use
    /// the ranges to fetch table data directly.
    pub fn locations(&self, reqs: &mut [GetRecord]) -> Vec<(Addr, ChunkLocation)> {
        let mut found = Vec::new();
        for req in reqs.iter_mut() {
            if req.found {
                continue;
            }
            if let Some(ordinal) = self.index.ordinal_of(&req.addr) {
                req.found = true;
                found.push((
                    req.addr,
                    ChunkLocation {
                        offset: self.index.offset_at(ordinal),
                        length: self.index.length_at(ordinal),
                    },
                ));
            }
        }
        found
    }

    /// Reads the chunk at a sorted index position. Used by conjoin merges
    /// and extraction, where the whole table is streamed.
    pub async fn chunk_at(&self, pos: usize) -> Result<Chunk> {
        let addr = self.index.addr_at(pos);
        let ordinal = self.index.ordinal_at(pos);
        let offset = self.index.offset_at(ordinal);
        let len = self.index.length_at(ordinal) as usize;
        let data = self.read_range(offset, len).await?;
        self.verify(&addr, &data)?;
        Ok(Chunk::with_addr(addr, data))
    }

    fn plan_reads(&self, reqs: &mut [GetRecord], block_size: u64) -> Vec<PlannedRead> {
        let mut found = Vec::new();
        for req in reqs.iter_mut() {
            if req.found {
                continue;
            }
            if let Some(ordinal) = self.index.ordinal_of(&req.addr) {
                req.found = true;
                found.push(PlannedChunk {
                    addr: req.addr,
                    offset: self.index.offset_at(ordinal),
                    len: self.index.length_at(ordinal),
                });
            }
        }
        found.sort_by_key(|c| c.offset);

        let mut plans: Vec<PlannedRead> = Vec::new();
        for chunk in found {
            if let Some(last) = plans.last_mut() {
                let end = last.offset + last.len as u64;
                if chunk.offset <= end + block_size {
                    last.len = (chunk.offset + chunk.len as u64 - last.offset) as usize;
                    last.chunks.push(chunk);
                    continue;
                }
            }
            plans.push(PlannedRead {
                offset: chunk.offset,
                len: chunk.len as usize,
                chunks: vec![chunk],
            });
        }
        plans
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes> {
        match &*self.data {
            TableData::Mapped(map) => {
                let start = offset as usize;
                let end = start + len;
                if end > map.len() {
                    return errcorrupt!("read past end of mapped table {}", self.addr);
                }
                Ok(Bytes::copy_from_slice(&map[start..end]))
            }
            TableData::File(file) => {
                let mut buf = vec![0u8; len];
                read_at(file, &mut buf, offset)?;
                Ok(buf.into())
            }
            TableData::Object { store, path, reads } => {
                let _permit = reads.acquire().await.map_err(|e| Error::IO(e.to_string()))?;
                let start = offset as usize;
                Ok(store.get_range(path, start..start + len).await?)
            }
        }
    }

    fn verify(&self, addr: &Addr, data: &[u8]) -> Result<()> {
        if Addr::of(data) != *addr {
            return errcorrupt!("chunk {addr} in table {} fails hash verification", self.addr);
        }
        Ok(())
    }
}

fn remaining(reqs: &[GetRecord]) -> bool {
    reqs.iter().any(|r| !r.found)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    let mut offset = offset;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        pos += n;
        offset += n as u64;
    }
    Ok(())
}
