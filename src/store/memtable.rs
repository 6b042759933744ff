//! In-memory chunk buffer.
//!
//! Writes land here first and stay until the buffer reaches its byte budget,
//! at which point the store persists the whole collection as one immutable
//! table. A concurrent skip map keyed by address keeps the contents readable
//! without blocking and already in index order for the flush; insertion
//! order is tracked separately because extraction replays chunks oldest
//! first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use super::table::{GetRecord, HasRecord, TableWriter};
use crate::chunk::Chunk;
use crate::hash::{Addr, ADDR_LEN};

/// A size-bounded, append-only chunk collection. Chunks are never updated or
/// removed; a duplicate add is a no-op.
pub struct Memtable {
    chunks: SkipMap<Addr, Bytes>,
    order: Mutex<Vec<Addr>>,
    size: AtomicU64,
    budget: u64,
}

impl Memtable {
    pub fn new(budget: u64) -> Self {
        Self {
            chunks: SkipMap::new(),
            order: Mutex::new(Vec::new()),
            size: AtomicU64::new(0),
            budget,
        }
    }

    /// Adds a chunk, returning false when the addition would exceed the byte
    /// budget. Re-adding a held address succeeds without growing the buffer.
    /// The first chunk is always accepted so that a payload larger than the
    /// budget can still pass through the store.
    pub fn add_chunk(&self, addr: Addr, data: Bytes) -> bool {
        if self.chunks.contains_key(&addr) {
            return true;
        }

        let entry_size = (ADDR_LEN + data.len()) as u64;
        if !self.chunks.is_empty() && self.size.load(Ordering::SeqCst) + entry_size > self.budget {
            return false;
        }

        self.chunks.insert(addr, data);
        self.order.lock().unwrap().push(addr);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
        true
    }

    pub fn get(&self, addr: &Addr) -> Option<Bytes> {
        self.chunks.get(addr).map(|entry| entry.value().clone())
    }

    pub fn has(&self, addr: &Addr) -> bool {
        self.chunks.contains_key(addr)
    }

    /// Resolves what this buffer holds, returning the found chunks for the
    /// caller to deliver once it has released the store state lock.
    pub fn get_many(&self, reqs: &mut [GetRecord]) -> Vec<Chunk> {
        let mut found = Vec::new();
        for req in reqs.iter_mut() {
            if req.found {
                continue;
            }
            if let Some(entry) = self.chunks.get(&req.addr) {
                req.found = true;
                found.push(Chunk::with_addr(req.addr, entry.value().clone()));
            }
        }
        found
    }

    /// Marks records this buffer holds. Returns true while any record is
    /// still unresolved.
    pub fn has_many(&self, reqs: &mut [HasRecord]) -> bool {
        let mut remaining = false;
        for req in reqs.iter_mut() {
            if !req.has && self.chunks.contains_key(&req.addr) {
                req.has = true;
            }
            remaining |= !req.has;
        }
        remaining
    }

    pub fn count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Buffered bytes, counting payloads plus one address per chunk.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Writes the contents into a table writer in address order.
    pub fn write_to(&self, writer: &mut TableWriter) {
        for entry in self.chunks.iter() {
            writer.add(*entry.key(), entry.value());
        }
    }

    /// All chunks in insertion order, for extraction and conjoin.
    pub fn extract(&self) -> Vec<Chunk> {
        let order = self.order.lock().unwrap();
        order
            .iter()
            .filter_map(|addr| self.chunks.get(addr))
            .map(|entry| Chunk::with_addr(*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::table::{to_get_records, to_has_records, TableIndex};

    fn chunk(text: &str) -> (Addr, Bytes) {
        let data = Bytes::from(text.as_bytes().to_vec());
        (Addr::of(&data), data)
    }

    #[test]
    fn test_add_and_get() {
        let mt = Memtable::new(1024);
        let (addr, data) = chunk("hello");

        assert!(mt.add_chunk(addr, data.clone()));
        assert_eq!(mt.get(&addr), Some(data));
        assert!(mt.has(&addr));
        assert_eq!(mt.count(), 1);

        let (other, _) = chunk("other");
        assert_eq!(mt.get(&other), None);
        assert!(!mt.has(&other));
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let mt = Memtable::new(1024);
        let (addr, data) = chunk("hello");

        assert!(mt.add_chunk(addr, data.clone()));
        let size = mt.size();
        assert!(mt.add_chunk(addr, data));
        assert_eq!(mt.size(), size);
        assert_eq!(mt.count(), 1);
        assert_eq!(mt.extract().len(), 1);
    }

    #[test]
    fn test_budget_rejects_overflow() {
        let mt = Memtable::new(64);
        let (a, data_a) = chunk("first chunk payload");
        assert!(mt.add_chunk(a, data_a));

        let (b, data_b) = chunk("second chunk payload that will not fit in the budget");
        assert!(!mt.add_chunk(b, data_b));
        assert_eq!(mt.count(), 1);
    }

    #[test]
    fn test_oversized_first_chunk_accepted() {
        let mt = Memtable::new(8);
        let (addr, data) = chunk("larger than the whole budget");
        assert!(mt.add_chunk(addr, data));
        assert_eq!(mt.count(), 1);
    }

    #[test]
    fn test_get_many_marks_found() {
        let mt = Memtable::new(1024);
        let (a, data_a) = chunk("aaa");
        let (b, data_b) = chunk("bbb");
        mt.add_chunk(a, data_a);
        mt.add_chunk(b, data_b);

        let (missing, _) = chunk("zzz");
        let mut reqs = to_get_records(&[a, b, missing]);
        let found = mt.get_many(&mut reqs);
        assert_eq!(found.len(), 2);
        assert_eq!(reqs.iter().filter(|r| r.found).count(), 2);
        assert!(reqs.iter().any(|r| r.addr == missing && !r.found));
    }

    #[test]
    fn test_has_many_reports_remaining() {
        let mt = Memtable::new(1024);
        let (a, data_a) = chunk("aaa");
        mt.add_chunk(a, data_a);

        let (missing, _) = chunk("zzz");
        let mut reqs = to_has_records(&[a, missing]);
        assert!(mt.has_many(&mut reqs));
        assert!(reqs.iter().any(|r| r.addr == a && r.has));

        let mut reqs = to_has_records(&[a]);
        assert!(!mt.has_many(&mut reqs));
    }

    #[test]
    fn test_extract_preserves_insertion_order() {
        let mt = Memtable::new(1024);
        let items: Vec<_> = ["m", "a", "z", "b"].iter().map(|s| chunk(s)).collect();
        for (addr, data) in &items {
            mt.add_chunk(*addr, data.clone());
        }

        let extracted = mt.extract();
        let addrs: Vec<Addr> = extracted.iter().map(|c| c.addr()).collect();
        let expected: Vec<Addr> = items.iter().map(|(a, _)| *a).collect();
        assert_eq!(addrs, expected);
    }

    #[test]
    fn test_write_to_produces_sorted_table() {
        let mt = Memtable::new(1024);
        for text in ["zebra", "apple", "mango"] {
            let (addr, data) = chunk(text);
            mt.add_chunk(addr, data);
        }

        let mut writer = TableWriter::new();
        mt.write_to(&mut writer);
        let table = writer.finish().unwrap();
        assert_eq!(table.chunk_count, 3);

        let index = TableIndex::parse(&table.data).unwrap();
        for text in ["zebra", "apple", "mango"] {
            assert!(index.ordinal_of(&Addr::of(text.as_bytes())).is_some());
        }
    }
}
