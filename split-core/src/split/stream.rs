// split-core/src/split/stream.rs

use std::io::{self, Read};

use super::chunk::{read_chunk_with, Chunk, ChunkSource};
use super::format::RecordFormat;
use super::{next_record_range, InputSplit};
use crate::error::{Result, SplitError};

/// The byte source of a [`StreamSplit`], with its carried-over partial line.
struct LineSource {
    input: Box<dyn Read + Send>,
    overflow: Vec<u8>,
    bytes_read: u64,
}

impl LineSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.input.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(SplitError::storage_with_source(
                        "stdin",
                        "failed to read input stream",
                        e,
                    ))
                }
            }
        }
        self.bytes_read += filled as u64;
        Ok(filled)
    }
}

impl ChunkSource for LineSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut overflow = std::mem::take(&mut self.overflow);
        let result = read_chunk_with(RecordFormat::Line, &mut overflow, buf, |out| self.read(out));
        self.overflow = overflow;
        result
    }
}

/// A single-pass line split over a non-seekable stream such as stdin.
///
/// The stream cannot be partitioned or replayed: only partition 0 of 1 is
/// accepted and [`before_first`](InputSplit::before_first) fails.
pub struct StreamSplit {
    source: LineSource,
    chunk: Chunk,
    chunk_size: usize,
}

impl StreamSplit {
    /// Reads lines from `input` in loads of about `chunk_size` bytes.
    pub fn new(input: Box<dyn Read + Send>, chunk_size: usize) -> Self {
        Self {
            source: LineSource {
                input,
                overflow: Vec::new(),
                bytes_read: 0,
            },
            chunk: Chunk::default(),
            chunk_size: chunk_size.max(8),
        }
    }

    /// A split over this process's standard input.
    pub fn stdin(chunk_size: usize) -> Self {
        Self::new(Box::new(io::stdin()), chunk_size)
    }
}

impl InputSplit for StreamSplit {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        let source = &mut self.source;
        let chunk_size = self.chunk_size;
        match next_record_range(RecordFormat::Line, &mut self.chunk, |chunk| {
            chunk.load(&mut *source, chunk_size)
        })? {
            Some(range) => Ok(Some(&self.chunk.data[range])),
            None => Ok(None),
        }
    }

    fn next_chunk(&mut self) -> Result<Option<&[u8]>> {
        loop {
            if let Some(range) = self.chunk.take_all() {
                return Ok(Some(&self.chunk.data[range]));
            }
            if !self.chunk.load(&mut self.source, self.chunk_size)? {
                return Ok(None);
            }
        }
    }

    fn before_first(&mut self) -> Result<()> {
        Err(SplitError::config("before_first is not supported on a stream split"))
    }

    fn reset_partition(&mut self, rank: u32, world_size: u32) -> Result<()> {
        SplitError::check_partition(rank, world_size)?;
        if rank != 0 || world_size != 1 {
            return Err(SplitError::config(
                "a stream split can only be read as partition 0 of 1",
            ));
        }
        Ok(())
    }

    fn hint_chunk_size(&mut self, bytes: usize) {
        self.chunk_size = self.chunk_size.max(bytes);
    }

    /// Bytes consumed from the stream so far; the full size is unknown.
    fn total_size(&self) -> u64 {
        self.source.bytes_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn split(text: &'static str) -> StreamSplit {
        StreamSplit::new(Box::new(Cursor::new(text.as_bytes())), 8)
    }

    #[test]
    fn test_reads_lines_once() {
        let mut split = split("first line\nsecond\n\nthird without newline");
        let mut records = Vec::new();
        while let Some(record) = split.next_record().unwrap() {
            records.push(String::from_utf8(record.to_vec()).unwrap());
        }
        assert_eq!(records, vec!["first line", "second", "third without newline"]);
        assert_eq!(split.total_size(), 40);
        assert!(matches!(split.before_first(), Err(SplitError::Config { .. })));
    }

    #[test]
    fn test_only_single_partition() {
        let mut split = split("a\n");
        assert!(split.reset_partition(0, 1).is_ok());
        assert!(matches!(split.reset_partition(1, 2), Err(SplitError::Config { .. })));
        assert!(matches!(
            split.reset_partition(1, 1),
            Err(SplitError::InvalidPartition { .. })
        ));
    }

    #[test]
    fn test_chunks() {
        let mut split = split("ab\ncd\nef\n");
        split.hint_chunk_size(64);
        assert_eq!(split.next_chunk().unwrap(), Some(&b"ab\ncd\nef\n"[..]));
        assert_eq!(split.next_chunk().unwrap(), None);
    }
}
