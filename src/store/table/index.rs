//! Parsed table index.
//!
//! An immutable table file consists of three sections: length-framed chunk
//! payloads in insertion order, a sorted index, and a fixed-size footer.
//!
//! ```text
//! +--------------------------+
//! | chunk payload 0          |
//! +--------------------------+
//! | ...                      |
//! +--------------------------+
//! | chunk payload N-1        |
//! +--------------------------+
//! | index: N records of      |
//! |   prefix   (u64)         |
//! |   ordinal  (u32)         |
//! |   length   (u32)         |
//! |   suffix   ([u8; 12])    |
//! | sorted by (prefix,suffix)|
//! +--------------------------+
//! | footer:                  |
//! |   chunk_count  (u32)     |
//! |   total_bytes  (u64)     |
//! |   magic        (u64)     |
//! +--------------------------+
//! ```
//!
//! All integers are big-endian. A record's `ordinal` is the position of its
//! payload in the data section; payload offsets are not stored and are
//! reconstructed here as cumulative sums of lengths in ordinal order. The
//! table's address is the hash of the index region exactly as written, which
//! makes table names deterministic across backends.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::Result;
use crate::errcorrupt;
use crate::hash::{Addr, ADDR_LEN, PREFIX_LEN, SUFFIX_LEN};

/// Size of one index record on disk.
pub const RECORD_SIZE: usize = PREFIX_LEN + 4 + 4 + SUFFIX_LEN;
/// Size of the footer on disk.
pub const FOOTER_SIZE: usize = 4 + 8 + 8;
/// Sentinel closing every table file.
pub const TABLE_MAGIC: u64 = 0xffb5_d8c2_2463_ee50;

/// Byte length of the index and footer for a table of `chunk_count` chunks.
pub fn index_and_footer_len(chunk_count: u32) -> usize {
    chunk_count as usize * RECORD_SIZE + FOOTER_SIZE
}

/// The decoded, validated index of one immutable table. Lookup is a binary
/// search over prefixes followed by a linear scan of the (few) records
/// sharing the sought prefix.
#[derive(Debug)]
pub struct TableIndex {
    // Sorted record order.
    prefixes: Vec<u64>,
    ordinals: Vec<u32>,
    suffixes: Vec<u8>,
    // Ordinal order.
    lengths: Vec<u32>,
    offsets: Vec<u64>,
    uncompressed_total: u64,
}

impl TableIndex {
    /// Parses and validates an index from the tail of `buf`. The slice must
    /// end with the footer; any leading payload bytes are ignored, so both a
    /// whole-file mapping and a fetched index+footer tail work.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return errcorrupt!("table too small for footer: {} bytes", buf.len());
        }

        let mut footer = Cursor::new(&buf[buf.len() - FOOTER_SIZE..]);
        let chunk_count = footer.read_u32::<BigEndian>()?;
        let uncompressed_total = footer.read_u64::<BigEndian>()?;
        let magic = footer.read_u64::<BigEndian>()?;

        if magic != TABLE_MAGIC {
            return errcorrupt!("bad table magic {magic:#018x}");
        }

        let index_len = chunk_count as usize * RECORD_SIZE;
        if buf.len() < FOOTER_SIZE + index_len {
            return errcorrupt!(
                "table of {} chunks needs {} index bytes, only {} present",
                chunk_count,
                index_len,
                buf.len() - FOOTER_SIZE
            );
        }

        let region = &buf[buf.len() - FOOTER_SIZE - index_len..buf.len() - FOOTER_SIZE];
        let mut cursor = Cursor::new(region);

        let count = chunk_count as usize;
        let mut prefixes = Vec::with_capacity(count);
        let mut ordinals = Vec::with_capacity(count);
        let mut suffixes = vec![0u8; count * SUFFIX_LEN];
        let mut lengths = vec![0u32; count];
        let mut ordinal_seen = vec![false; count];

        for i in 0..count {
            let prefix = cursor.read_u64::<BigEndian>()?;
            let ordinal = cursor.read_u32::<BigEndian>()?;
            let length = cursor.read_u32::<BigEndian>()?;
            let suffix = &mut suffixes[i * SUFFIX_LEN..(i + 1) * SUFFIX_LEN];
            cursor.read_exact(suffix)?;

            if ordinal >= chunk_count {
                return errcorrupt!("index ordinal {ordinal} out of range for {chunk_count} chunks");
            }
            if ordinal_seen[ordinal as usize] {
                return errcorrupt!("index ordinal {ordinal} appears twice");
            }
            ordinal_seen[ordinal as usize] = true;
            lengths[ordinal as usize] = length;

            if i > 0 {
                let prev_prefix = prefixes[i - 1];
                let prev_suffix = &suffixes[(i - 1) * SUFFIX_LEN..i * SUFFIX_LEN];
                let suffix = &suffixes[i * SUFFIX_LEN..(i + 1) * SUFFIX_LEN];
                if (prefix, suffix) <= (prev_prefix, prev_suffix) {
                    return errcorrupt!("index records out of order at position {i}");
                }
            }

            prefixes.push(prefix);
            ordinals.push(ordinal);
        }

        let mut offsets = Vec::with_capacity(count);
        let mut offset = 0u64;
        for &length in &lengths {
            offsets.push(offset);
            offset += length as u64;
        }
        if offset != uncompressed_total {
            return errcorrupt!(
                "chunk lengths sum to {offset} but footer claims {uncompressed_total}"
            );
        }

        Ok(Self { prefixes, ordinals, suffixes, lengths, offsets, uncompressed_total })
    }

    pub fn chunk_count(&self) -> u32 {
        self.prefixes.len() as u32
    }

    /// Looks up the payload ordinal of an address, or None if the table does
    /// not hold it.
    pub fn ordinal_of(&self, addr: &Addr) -> Option<u32> {
        let prefix = addr.prefix();
        let mut i = self.prefixes.partition_point(|p| *p < prefix);
        while i < self.prefixes.len() && self.prefixes[i] == prefix {
            if self.suffix_at(i) == addr.suffix() {
                return Some(self.ordinals[i]);
            }
            i += 1;
        }
        None
    }

    pub fn length_at(&self, ordinal: u32) -> u32 {
        self.lengths[ordinal as usize]
    }

    pub fn offset_at(&self, ordinal: u32) -> u64 {
        self.offsets[ordinal as usize]
    }

    /// Reconstructs the full address of the record at a sorted position.
    pub fn addr_at(&self, pos: usize) -> Addr {
        let mut bytes = [0u8; ADDR_LEN];
        bytes[..PREFIX_LEN].copy_from_slice(&self.prefixes[pos].to_be_bytes());
        bytes[PREFIX_LEN..].copy_from_slice(self.suffix_at(pos));
        Addr::new(bytes)
    }

    /// The payload ordinal of the record at a sorted position.
    pub fn ordinal_at(&self, pos: usize) -> u32 {
        self.ordinals[pos]
    }

    /// Total payload bytes, from the footer.
    pub fn payload_len(&self) -> u64 {
        self.uncompressed_total
    }

    /// Total on-disk size of the table this index describes.
    pub fn table_len(&self) -> u64 {
        self.uncompressed_total + index_and_footer_len(self.chunk_count()) as u64
    }

    /// Approximate resident size, used as the cost in the shared index cache.
    pub fn mem_size(&self) -> usize {
        self.prefixes.len() * (8 + 4 + SUFFIX_LEN + 4 + 8) + std::mem::size_of::<Self>()
    }

    fn suffix_at(&self, pos: usize) -> &[u8] {
        &self.suffixes[pos * SUFFIX_LEN..(pos + 1) * SUFFIX_LEN]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    // Hand-encodes an index+footer region from (addr, ordinal, length)
    // records already in sorted order.
    fn encode(records: &[(Addr, u32, u32)], total: u64, magic: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        for (addr, ordinal, length) in records {
            buf.write_u64::<BigEndian>(addr.prefix()).unwrap();
            buf.write_u32::<BigEndian>(*ordinal).unwrap();
            buf.write_u32::<BigEndian>(*length).unwrap();
            buf.write_all(addr.suffix()).unwrap();
        }
        buf.write_u32::<BigEndian>(records.len() as u32).unwrap();
        buf.write_u64::<BigEndian>(total).unwrap();
        buf.write_u64::<BigEndian>(magic).unwrap();
        buf
    }

    fn sorted_addrs(n: usize) -> Vec<Addr> {
        let mut addrs: Vec<Addr> = (0..n).map(|i| Addr::of(&[i as u8])).collect();
        addrs.sort();
        addrs
    }

    #[test]
    fn test_parse_and_lookup() {
        let addrs = sorted_addrs(3);
        // Payloads of 10, 20, 30 bytes laid down in reverse of sorted order.
        let records = vec![
            (addrs[0], 2u32, 10u32),
            (addrs[1], 1, 20),
            (addrs[2], 0, 30),
        ];
        let buf = encode(&records, 60, TABLE_MAGIC);
        let index = TableIndex::parse(&buf).unwrap();

        assert_eq!(index.chunk_count(), 3);
        assert_eq!(index.payload_len(), 60);

        assert_eq!(index.ordinal_of(&addrs[0]), Some(2));
        assert_eq!(index.ordinal_of(&addrs[1]), Some(1));
        assert_eq!(index.ordinal_of(&addrs[2]), Some(0));
        assert_eq!(index.ordinal_of(&Addr::of(b"absent")), None);

        // Ordinal 0 was written first: offset 0, length 30.
        assert_eq!(index.offset_at(0), 0);
        assert_eq!(index.length_at(0), 30);
        assert_eq!(index.offset_at(1), 30);
        assert_eq!(index.length_at(1), 20);
        assert_eq!(index.offset_at(2), 50);
        assert_eq!(index.length_at(2), 10);

        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(index.addr_at(i), *addr);
        }
    }

    #[test]
    fn test_parse_ignores_leading_payload() {
        let addrs = sorted_addrs(1);
        let tail = encode(&[(addrs[0], 0, 4)], 4, TABLE_MAGIC);
        let mut buf = b"data".to_vec();
        buf.extend_from_slice(&tail);
        let index = TableIndex::parse(&buf).unwrap();
        assert_eq!(index.chunk_count(), 1);
        assert_eq!(index.table_len(), 4 + index_and_footer_len(1) as u64);
    }

    #[test]
    fn test_bad_magic() {
        let addrs = sorted_addrs(1);
        let buf = encode(&[(addrs[0], 0, 4)], 4, 0xdead_beef);
        assert!(matches!(TableIndex::parse(&buf), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_unsorted_records_rejected() {
        let addrs = sorted_addrs(2);
        let records = vec![(addrs[1], 0u32, 4u32), (addrs[0], 1, 4)];
        let buf = encode(&records, 8, TABLE_MAGIC);
        assert!(matches!(TableIndex::parse(&buf), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let addrs = sorted_addrs(1);
        let records = vec![(addrs[0], 0u32, 4u32), (addrs[0], 1, 4)];
        let buf = encode(&records, 8, TABLE_MAGIC);
        assert!(matches!(TableIndex::parse(&buf), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_duplicate_ordinal_rejected() {
        let addrs = sorted_addrs(2);
        let records = vec![(addrs[0], 0u32, 4u32), (addrs[1], 0, 4)];
        let buf = encode(&records, 8, TABLE_MAGIC);
        assert!(matches!(TableIndex::parse(&buf), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_length_sum_mismatch_rejected() {
        let addrs = sorted_addrs(1);
        let buf = encode(&[(addrs[0], 0, 4)], 5, TABLE_MAGIC);
        assert!(matches!(TableIndex::parse(&buf), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_truncated_index_rejected() {
        let addrs = sorted_addrs(2);
        let records = vec![(addrs[0], 0u32, 4u32), (addrs[1], 1, 4)];
        let buf = encode(&records, 8, TABLE_MAGIC);
        // Drop the leading record bytes so the footer claims more records
        // than the slice holds.
        assert!(matches!(
            TableIndex::parse(&buf[RECORD_SIZE..]),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_shared_prefix_linear_scan() {
        // Two addresses sharing a prefix but differing in suffix.
        let mut a = [7u8; ADDR_LEN];
        let mut b = [7u8; ADDR_LEN];
        a[ADDR_LEN - 1] = 1;
        b[ADDR_LEN - 1] = 2;
        let (a, b) = (Addr::new(a), Addr::new(b));

        let records = vec![(a, 0u32, 3u32), (b, 1, 5)];
        let buf = encode(&records, 8, TABLE_MAGIC);
        let index = TableIndex::parse(&buf).unwrap();
        assert_eq!(index.ordinal_of(&a), Some(0));
        assert_eq!(index.ordinal_of(&b), Some(1));

        let mut c = [7u8; ADDR_LEN];
        c[ADDR_LEN - 1] = 3;
        assert_eq!(index.ordinal_of(&Addr::new(c)), None);
    }
}
