// split-core/src/split/mod.rs

//! Partitioned, record-aligned reading of file sets.
//!
//! A split is one worker's view of a dataset: the file set is treated as a
//! single byte stream, cut into `world_size` near-equal ranges, and each
//! range is widened or narrowed so it starts and ends on record boundaries.
//! Records are then served in order from reusable chunks.
//!
//! # Example
//!
//! ```no_run
//! use split_core::split::InputSplit;
//!
//! let mut split = split_core::create("/data/train;/data/extra.txt", 1, 4, "text").unwrap();
//! while let Some(record) = split.next_record().unwrap() {
//!     println!("{}", String::from_utf8_lossy(record));
//! }
//! ```

mod cached;
mod chunk;
mod format;
mod indexed;
mod reader;
mod sharding;
mod single;
mod stream;
mod threaded;

pub use cached::CachedSplit;
pub use chunk::Chunk;
pub use format::RecordFormat;
pub use indexed::{IndexEntry, IndexedCursor, RecordIndex};
pub use reader::SplitReader;
pub use sharding::{FileSet, Partition};
pub use single::SingleThreadedSplit;
pub use stream::StreamSplit;
pub use threaded::ThreadedSplit;

use crate::error::Result;

/// One worker's stream of records.
///
/// Slices returned by [`next_record`](Self::next_record) and
/// [`next_chunk`](Self::next_chunk) borrow the split's internal buffer and
/// stay valid until the next call that takes `&mut self`.
pub trait InputSplit: Send {
    /// Returns the next record, or `None` at the end of the partition.
    fn next_record(&mut self) -> Result<Option<&[u8]>>;

    /// Returns the unread remainder of the current chunk, or the next whole
    /// chunk. Chunks always end on a record boundary.
    fn next_chunk(&mut self) -> Result<Option<&[u8]>>;

    /// Rewinds to the first record of the partition.
    fn before_first(&mut self) -> Result<()>;

    /// Switches to partition `rank` of `world_size` and rewinds.
    fn reset_partition(&mut self, rank: u32, world_size: u32) -> Result<()>;

    /// Raises the chunk size to at least `bytes`.
    fn hint_chunk_size(&mut self, bytes: usize);

    /// Total bytes in the underlying file set.
    fn total_size(&self) -> u64;
}

/// Pulls one record out of `chunk`, loading more through `load` as needed.
/// Returns the record's range within `chunk.data`.
pub(crate) fn next_record_range<F>(
    format: RecordFormat,
    chunk: &mut Chunk,
    mut load: F,
) -> Result<Option<std::ops::Range<usize>>>
where
    F: FnMut(&mut Chunk) -> Result<bool>,
{
    loop {
        if let Some(range) = format.extract_next_record(chunk)? {
            return Ok(Some(range));
        }
        if !load(chunk)? {
            return Ok(None);
        }
    }
}
