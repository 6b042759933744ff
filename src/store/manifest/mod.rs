//! The manifest: the durable record naming the live tables and the current
//! root.
//!
//! A manifest holds `(version, lock, root, specs)` where `specs` is the
//! ordered list of `(table address, chunk count)` pairs, most recent first.
//! The `lock` is a hash derived from the root and the spec list and acts as
//! an opaque compare-and-swap token: an update replaces the record only when
//! the caller presents the lock it last observed. Each backend provides the
//! same semantics with its own machinery:
//!
//! - filesystem: temp file plus rename, serialized by an advisory lock file
//! - object store: conditional put on the ETag observed at the last fetch
//! - memory: a mutex-guarded slot, for tests
//!
//! The textual encoding is a single line:
//!
//! ```text
//! version|lock|root|addr_0 count_0 addr_1 count_1 ...
//! ```

pub mod file;
pub mod manager;
pub mod memory;
pub mod object;

use std::collections::HashSet;

use async_trait::async_trait;
use itertools::Itertools;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::errcorrupt;
use crate::hash::{Addr, ADDR_LEN};

pub use file::FileManifest;
pub use manager::ManifestManager;
pub use memory::MemoryManifest;
pub use object::ObjectManifest;

/// On-disk format version. A manifest carrying any other version is
/// unusable by this build.
pub const STORAGE_VERSION: &str = "1";

/// Names one table in the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub addr: Addr,
    pub chunk_count: u32,
}

/// One decoded manifest state.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestContents {
    pub version: String,
    pub lock: Addr,
    pub root: Addr,
    pub specs: Vec<TableSpec>,
}

/// Derives the CAS token for a `(root, specs)` pair.
pub fn generate_lock(root: &Addr, specs: &[TableSpec]) -> Addr {
    let mut hasher = Sha1::new();
    hasher.update(root.as_bytes());
    for spec in specs {
        hasher.update(spec.addr.as_bytes());
        hasher.update(spec.chunk_count.to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; ADDR_LEN];
    bytes.copy_from_slice(&digest);
    Addr::new(bytes)
}

impl ManifestContents {
    /// The state of a store that has never been committed: zero root, no
    /// tables, and the zero lock a first CAS must present.
    pub fn empty() -> Self {
        Self {
            version: STORAGE_VERSION.to_string(),
            lock: Addr::ZERO,
            root: Addr::ZERO,
            specs: Vec::new(),
        }
    }

    /// Builds contents for the current version with the derived lock.
    pub fn new(root: Addr, specs: Vec<TableSpec>) -> Self {
        let lock = generate_lock(&root, &specs);
        Self { version: STORAGE_VERSION.to_string(), lock, root, specs }
    }

    pub fn encode(&self) -> String {
        let specs = self
            .specs
            .iter()
            .map(|spec| format!("{} {}", spec.addr, spec.chunk_count))
            .join(" ");
        format!("{}|{}|{}|{}", self.version, self.lock, self.root, specs)
    }

    /// Parses and validates one encoded manifest. The version must match
    /// this build, the lock must re-derive from the root and specs, and no
    /// table may be named twice.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim_end_matches('\n');
        let mut parts = text.splitn(4, '|');
        let (version, lock, root, specs) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(v), Some(l), Some(r), Some(s)) => (v, l, r, s),
                _ => return errcorrupt!("manifest record has fewer than 4 fields"),
            };

        if version != STORAGE_VERSION {
            return Err(Error::VersionMismatch {
                expected: STORAGE_VERSION.to_string(),
                actual: version.to_string(),
            });
        }

        let lock: Addr = lock.parse()?;
        let root: Addr = root.parse()?;

        let fields: Vec<&str> = specs.split_whitespace().collect();
        if fields.len() % 2 != 0 {
            return errcorrupt!("manifest specs must be (address, count) pairs");
        }
        let mut parsed = Vec::with_capacity(fields.len() / 2);
        let mut seen = HashSet::new();
        for pair in fields.chunks(2) {
            let addr: Addr = pair[0].parse()?;
            let chunk_count: u32 = pair[1]
                .parse()
                .map_err(|_| Error::Corruption(format!("bad chunk count {:?}", pair[1])))?;
            if !seen.insert(addr) {
                return errcorrupt!("table {addr} named twice in manifest");
            }
            parsed.push(TableSpec { addr, chunk_count });
        }

        if lock != generate_lock(&root, &parsed) {
            return errcorrupt!("manifest lock does not derive from root and specs");
        }

        Ok(Self { version: version.to_string(), lock, root, specs: parsed })
    }

    /// Rough resident size, the cost used by the shared manifest cache.
    pub fn approx_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.specs.len() * std::mem::size_of::<TableSpec>()
    }
}

/// One durable manifest record with optimistic concurrency.
#[async_trait]
pub trait ManifestBackend: Send + Sync {
    /// A stable identity for the store this manifest belongs to, keying the
    /// process-wide manifest cache and update locks.
    fn name(&self) -> &str;

    /// Reads the current state, or None if the record was never written.
    async fn fetch(&self) -> Result<Option<ManifestContents>>;

    /// Atomically replaces the record iff the stored lock equals
    /// `last_lock` (the zero address stands for "never written"). Returns
    /// the contents that are durable after the call: the new contents on
    /// success, the competing state otherwise.
    async fn update(
        &self,
        last_lock: Addr,
        new_contents: ManifestContents,
    ) -> Result<ManifestContents>;
}
