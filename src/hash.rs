//! Content addresses.
//!
//! Every chunk is named by the 20-byte hash of its payload. The first 8
//! bytes, read big-endian, form the "prefix" used as the primary sort key in
//! table indexes; the remaining 12 bytes are the "suffix" tiebreaker. Sorting
//! addresses bytewise is therefore identical to sorting by `(prefix, suffix)`.

use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::errcorrupt;

/// Size of an address in bytes.
pub const ADDR_LEN: usize = 20;
/// Size of the big-endian ordering prefix.
pub const PREFIX_LEN: usize = 8;
/// Size of the suffix tiebreaker.
pub const SUFFIX_LEN: usize = ADDR_LEN - PREFIX_LEN;
/// Length of the base32 text form: 20 bytes is exactly 32 5-bit groups.
pub const ENCODED_LEN: usize = 32;

const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// A 20-byte content address. Ordering and equality are plain byte
/// comparisons, which coincide with `(prefix, suffix)` order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Addr([u8; ADDR_LEN]);

impl Addr {
    /// The all-zero address, used as the root of an empty dataset and as the
    /// compare-and-swap token for a manifest that has never been written.
    pub const ZERO: Addr = Addr([0; ADDR_LEN]);

    pub const fn new(bytes: [u8; ADDR_LEN]) -> Self {
        Addr(bytes)
    }

    /// Computes the content address of a payload.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; ADDR_LEN];
        bytes.copy_from_slice(&digest);
        Addr(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDR_LEN {
            return errcorrupt!("address must be {ADDR_LEN} bytes, got {}", bytes.len());
        }
        let mut out = [0u8; ADDR_LEN];
        out.copy_from_slice(bytes);
        Ok(Addr(out))
    }

    /// The top 8 bytes as a big-endian integer, the primary index sort key.
    pub fn prefix(&self) -> u64 {
        let mut buf = [0u8; PREFIX_LEN];
        buf.copy_from_slice(&self.0[..PREFIX_LEN]);
        u64::from_be_bytes(buf)
    }

    /// The trailing 12 bytes.
    pub fn suffix(&self) -> &[u8] {
        &self.0[PREFIX_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8; ADDR_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Addr::ZERO
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::with_capacity(ENCODED_LEN);
        let mut acc: u32 = 0;
        let mut bits = 0;
        for &b in &self.0 {
            acc = (acc << 8) | b as u32;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                text.push(ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
            }
        }
        f.write_str(&text)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({self})")
    }
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != ENCODED_LEN {
            return errcorrupt!("address text must be {ENCODED_LEN} chars, got {}", s.len());
        }
        let mut out = [0u8; ADDR_LEN];
        let mut acc: u32 = 0;
        let mut bits = 0;
        let mut pos = 0;
        for c in s.bytes() {
            let value = match c {
                b'0'..=b'9' => c - b'0',
                b'a'..=b'v' => c - b'a' + 10,
                _ => return errcorrupt!("invalid base32 character {:?} in address", c as char),
            };
            acc = (acc << 5) | value as u32;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                out[pos] = ((acc >> bits) & 0xff) as u8;
                pos += 1;
            }
        }
        Ok(Addr(out))
    }
}
