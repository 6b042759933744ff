//! Table construction.

use bytes::Bytes;
use byteorder::{BigEndian, WriteBytesExt};

use super::index::TABLE_MAGIC;
use crate::error::Result;
use crate::errcorrupt;
use crate::hash::Addr;

/// Accumulates chunks and emits one immutable table: payloads in insertion
/// order, a `(prefix, suffix)`-sorted index, and the footer. The table's
/// address is the hash of the index region, so identical contents written in
/// the same order produce the same name on every backend.
pub struct TableWriter {
    payload: Vec<u8>,
    records: Vec<(Addr, u32)>,
}

/// A finished table: its name, chunk count, and complete file bytes, ready
/// for a persister to write wherever the backend keeps tables.
pub struct FinishedTable {
    pub addr: Addr,
    pub chunk_count: u32,
    pub data: Bytes,
}

impl TableWriter {
    pub fn new() -> Self {
        Self { payload: Vec::new(), records: Vec::new() }
    }

    /// Appends one chunk. Callers are responsible for deduplication; a
    /// repeated address is rejected at finish.
    pub fn add(&mut self, addr: Addr, data: &[u8]) {
        self.payload.extend_from_slice(data);
        self.records.push((addr, data.len() as u32));
    }

    pub fn chunk_count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Sorts the index, frames the file, and names the table.
    pub fn finish(self) -> Result<FinishedTable> {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        order.sort_by_key(|&i| self.records[i].0);

        for pair in order.windows(2) {
            if self.records[pair[0]].0 == self.records[pair[1]].0 {
                return errcorrupt!("duplicate address {} in table", self.records[pair[0]].0);
            }
        }

        let mut index = Vec::with_capacity(self.records.len() * super::index::RECORD_SIZE);
        for &ordinal in &order {
            let (addr, length) = self.records[ordinal];
            index.write_u64::<BigEndian>(addr.prefix())?;
            index.write_u32::<BigEndian>(ordinal as u32)?;
            index.write_u32::<BigEndian>(length)?;
            index.extend_from_slice(addr.suffix());
        }

        let addr = Addr::of(&index);
        let chunk_count = self.records.len() as u32;

        let mut data = self.payload;
        let total = data.len() as u64;
        data.extend_from_slice(&index);
        data.write_u32::<BigEndian>(chunk_count)?;
        data.write_u64::<BigEndian>(total)?;
        data.write_u64::<BigEndian>(TABLE_MAGIC)?;

        Ok(FinishedTable { addr, chunk_count, data: data.into() })
    }
}

impl Default for TableWriter {
    fn default() -> Self {
        Self::new()
    }
}
