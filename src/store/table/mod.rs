//! Immutable chunk tables: the on-disk/object format, its index, and the
//! reader and writer halves.

pub mod index;
pub mod reader;
pub mod writer;

pub use index::{index_and_footer_len, TableIndex};
pub use reader::{
    to_get_records, to_has_records, ChunkLocation, GetRecord, HasRecord, TableData, TableReader,
};
pub use writer::{FinishedTable, TableWriter};
