// split-core/src/split/single.rs

use super::chunk::Chunk;
use super::reader::SplitReader;
use super::{next_record_range, InputSplit};
use crate::error::Result;

/// A split that loads chunks on the calling thread.
pub struct SingleThreadedSplit {
    reader: SplitReader,
    chunk: Chunk,
}

impl SingleThreadedSplit {
    /// Reads the partition `reader` is positioned on.
    pub fn new(reader: SplitReader) -> Self {
        Self {
            reader,
            chunk: Chunk::default(),
        }
    }

    /// The underlying reader, for its partition and file set.
    pub fn reader(&self) -> &SplitReader {
        &self.reader
    }
}

impl InputSplit for SingleThreadedSplit {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        let reader = &mut self.reader;
        let format = reader.format();
        match next_record_range(format, &mut self.chunk, |chunk| reader.load_chunk(chunk))? {
            Some(range) => Ok(Some(&self.chunk.data[range])),
            None => Ok(None),
        }
    }

    fn next_chunk(&mut self) -> Result<Option<&[u8]>> {
        loop {
            if let Some(range) = self.chunk.take_all() {
                return Ok(Some(&self.chunk.data[range]));
            }
            if !self.reader.load_chunk(&mut self.chunk)? {
                return Ok(None);
            }
        }
    }

    fn before_first(&mut self) -> Result<()> {
        self.chunk.clear();
        self.reader.before_first()
    }

    fn reset_partition(&mut self, rank: u32, world_size: u32) -> Result<()> {
        self.chunk.clear();
        self.reader.reset_partition(rank, world_size)
    }

    fn hint_chunk_size(&mut self, bytes: usize) {
        self.reader.hint_chunk_size(bytes);
    }

    fn total_size(&self) -> u64 {
        self.reader.total_size()
    }
}
