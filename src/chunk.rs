use bytes::Bytes;

use crate::hash::Addr;

/// An immutable blob paired with its content address. Once constructed the
/// pair never changes; cloning is cheap because the payload is refcounted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    addr: Addr,
    data: Bytes,
}

impl Chunk {
    /// Hashes the payload and pairs it with its address.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let addr = Addr::of(&data);
        Chunk { addr, data }
    }

    /// Pairs an already-known address with its payload. The caller vouches
    /// that the address is the hash of the data; table readers use this after
    /// verifying delivered bytes.
    pub fn with_addr(addr: Addr, data: impl Into<Bytes>) -> Self {
        Chunk { addr, data: data.into() }
    }

    /// The distinguished empty chunk: zero bytes with its defined address.
    pub fn empty() -> Self {
        Chunk::new(Bytes::new())
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
