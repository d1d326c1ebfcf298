// split-core/src/split/indexed.rs

//! Record-granular partitioning through a side index.
//!
//! The index is a text file of whitespace-separated `key offset` pairs, one
//! pair per RecordIO record, where `offset` is the record's position in the
//! concatenated file set. Workers receive contiguous runs of records rather
//! than byte ranges, and may visit their records in a seeded random order.

use std::io::Read;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::sharding::Partition;
use crate::error::{Result, SplitError};
use crate::storage::{FileSystem, Uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: u64,
    pub offset: u64,
    /// Bytes up to the next record start, padding included.
    pub length: u64,
}

/// Index entries sorted by offset.
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    entries: Vec<IndexEntry>,
    total_size: u64,
}

impl RecordIndex {
    /// Parses index text for a file set of `total_size` bytes.
    pub fn parse(text: &str, total_size: u64) -> Result<Self> {
        let mut tokens = text.split_whitespace();
        let mut pairs = Vec::new();
        while let Some(key) = tokens.next() {
            let Some(offset) = tokens.next() else {
                return Err(SplitError::format(format!(
                    "index entry '{key}' has no offset"
                )));
            };
            let key = parse_number(key, "key")?;
            let offset = parse_number(offset, "offset")?;
            if offset >= total_size {
                return Err(SplitError::format(format!(
                    "index offset {offset} is past the end of {total_size} bytes of data"
                )));
            }
            if offset % 4 != 0 {
                return Err(SplitError::format(format!(
                    "index offset {offset} is not 4-byte aligned"
                )));
            }
            pairs.push((key, offset));
        }
        pairs.sort_by_key(|&(_, offset)| offset);
        if let Some(pair) = pairs.windows(2).find(|w| w[0].1 == w[1].1) {
            return Err(SplitError::format(format!(
                "index lists offset {} more than once",
                pair[0].1
            )));
        }

        let entries = pairs
            .iter()
            .enumerate()
            .map(|(i, &(key, offset))| {
                let next = pairs.get(i + 1).map_or(total_size, |&(_, o)| o);
                IndexEntry {
                    key,
                    offset,
                    length: next - offset,
                }
            })
            .collect();
        Ok(Self {
            entries,
            total_size,
        })
    }

    /// Reads and parses the index at `uri`.
    pub fn load(fs: &dyn FileSystem, uri: &Uri, total_size: u64) -> Result<Self> {
        let mut text = String::new();
        fs.open_at(uri, 0)?
            .read_to_string(&mut text)
            .map_err(|e| {
                SplitError::storage_with_source(uri.local_path(), "failed to read index file", e)
            })?;
        let index = Self::parse(&text, total_size)?;
        debug!(index = %uri, records = index.len(), "loaded record index");
        Ok(index)
    }

    /// Entries sorted by offset.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start offset of record `i`, or the end of the data for `i == len()`.
    fn offset_of(&self, i: usize) -> u64 {
        self.entries.get(i).map_or(self.total_size, |e| e.offset)
    }
}

fn parse_number(token: &str, what: &str) -> Result<u64> {
    token
        .parse()
        .map_err(|_| SplitError::format(format!("invalid index {what} '{token}'")))
}

/// Walks one worker's share of an index in batches.
#[derive(Debug)]
pub struct IndexedCursor {
    index: RecordIndex,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    index_begin: usize,
    index_end: usize,
    /// Next position in the partition, or in `permutation` when shuffling.
    current: usize,
    permutation: Vec<usize>,
}

impl IndexedCursor {
    /// A cursor over `index` yielding `batch_size` records at a time (at
    /// least one). Call [`reset_partition`](Self::reset_partition) and
    /// [`before_first`](Self::before_first) before the first batch.
    pub fn new(index: RecordIndex, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            index,
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            index_begin: 0,
            index_end: 0,
            current: 0,
            permutation: Vec::new(),
        }
    }

    /// Assigns records `[ceil(n / world) * rank, ..)` to this worker and
    /// returns the byte range they cover.
    pub fn reset_partition(&mut self, rank: u32, world_size: u32) -> Result<Partition> {
        SplitError::check_partition(rank, world_size)?;
        let n = self.index.len();
        let step = n.div_ceil(world_size as usize);
        self.index_begin = (step * rank as usize).min(n);
        self.index_end = (step * (rank as usize + 1)).min(n);
        Ok(Partition {
            begin: self.index.offset_of(self.index_begin),
            end: self.index.offset_of(self.index_end),
        })
    }

    /// Restarts the partition. When shuffling, a fresh permutation is drawn
    /// from the cursor's generator, so each pass has a new but reproducible
    /// order.
    pub fn before_first(&mut self) {
        if self.shuffle {
            self.permutation = (self.index_begin..self.index_end).collect();
            self.permutation.shuffle(&mut self.rng);
            self.current = 0;
        } else {
            self.current = self.index_begin;
        }
    }

    /// The `(offset, length)` byte ranges of the next batch of records.
    ///
    /// Sequential batches are returned as a single contiguous range. An empty
    /// result means the partition is exhausted.
    pub fn next_batch(&mut self) -> Vec<(u64, u64)> {
        let entries = self.index.entries();
        if self.shuffle {
            let stop = (self.current + self.batch_size).min(self.permutation.len());
            let batch = self.permutation[self.current..stop]
                .iter()
                .map(|&i| (entries[i].offset, entries[i].length))
                .collect();
            self.current = stop;
            batch
        } else {
            if self.current >= self.index_end {
                return Vec::new();
            }
            let stop = (self.current + self.batch_size).min(self.index_end);
            let begin = self.index.offset_of(self.current);
            let end = self.index.offset_of(stop);
            self.current = stop;
            vec![(begin, end - begin)]
        }
    }

    /// Records per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of records in the current partition.
    pub fn partition_len(&self) -> usize {
        self.index_end - self.index_begin
    }
}
