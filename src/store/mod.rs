//! The content-addressed chunk store engine.
//!
//! ```text
//! ┌───────────┐ full ┌───────────┐ commit ┌───────────────┐
//! │ memtable  │─────►│  novel    │───────►│   upstream    │
//! │ (buffer)  │      │  tables   │  (CAS) │ (manifest'd)  │
//! └───────────┘      └───────────┘        └───────────────┘
//! ```
//!
//! Submodules, leaves first: immutable `table`s (index/reader/writer), the
//! `memtable` write buffer, the `tableset` read path, the durable
//! `manifest` and its manager, `conjoin` compaction, the `persist` backends
//! that tie tables to a filesystem or object store, and the `store` façade
//! over all of it.

pub mod conjoin;
pub mod manifest;
pub mod memtable;
pub mod persist;
pub mod store;
pub mod table;
pub mod tableset;

pub use manifest::{ManifestContents, TableSpec, STORAGE_VERSION};
pub use store::ChunkStore;
