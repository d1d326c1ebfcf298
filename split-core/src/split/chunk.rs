// split-core/src/split/chunk.rs

use std::ops::Range;

use super::format::RecordFormat;
use crate::error::Result;

/// A reusable byte window holding whole records.
///
/// The buffer keeps one spare byte past its capacity so a text chunk can be
/// closed with a terminator without reallocating. Valid, unread bytes live in
/// `data[begin..end]`.
#[derive(Debug, Default, Clone)]
pub struct Chunk {
    pub(crate) data: Vec<u8>,
    pub(crate) begin: usize,
    pub(crate) end: usize,
}

impl Chunk {
    /// An empty chunk that can hold `capacity` bytes per load.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity + 1],
            begin: 0,
            end: 0,
        }
    }

    /// Largest number of bytes a single load may place in the chunk.
    pub fn capacity(&self) -> usize {
        self.data.len().saturating_sub(1)
    }

    /// The unread bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.begin..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub(crate) fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    /// Consumes every unread byte at once.
    pub(crate) fn take_all(&mut self) -> Option<Range<usize>> {
        if self.is_empty() {
            return None;
        }
        let range = self.begin..self.end;
        self.begin = self.end;
        Some(range)
    }

    /// Makes sure the buffer can hold `capacity` bytes plus the spare byte.
    pub(crate) fn reserve(&mut self, capacity: usize) {
        if self.data.len() < capacity + 1 {
            self.data.resize(capacity + 1, 0);
        }
    }

    /// Refills the chunk with the next record-aligned window from `source`.
    ///
    /// The buffer doubles until at least one whole record fits. Returns
    /// `Ok(false)` once the source is exhausted.
    pub(crate) fn load<S>(&mut self, source: &mut S, chunk_size: usize) -> Result<bool>
    where
        S: ChunkSource + ?Sized,
    {
        self.reserve(round_up(chunk_size.max(8), 4));
        loop {
            let capacity = self.capacity();
            match source.read_chunk(&mut self.data)? {
                None => {
                    self.clear();
                    return Ok(false);
                }
                Some(0) => {
                    self.data.resize(capacity * 2 + 1, 0);
                    tracing::debug!(capacity = capacity * 2, "grew chunk buffer to fit a record");
                }
                Some(size) => {
                    self.begin = 0;
                    self.end = size;
                    return Ok(true);
                }
            }
        }
    }
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Anything that can fill a buffer with whole records.
pub(crate) trait ChunkSource {
    /// Fills `buf[..buf.len() - 1]` with whole records, keeping the last
    /// byte spare.
    ///
    /// Returns `None` at the end of input and `Some(0)` when the buffer is
    /// too small for the next record.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
}

/// Shared chunk-filling logic for every byte source.
///
/// Bytes after the last complete record are carried over in `overflow` and
/// placed at the front of the next chunk.
pub(crate) fn read_chunk_with<F>(
    format: RecordFormat,
    overflow: &mut Vec<u8>,
    buf: &mut [u8],
    mut read: F,
) -> Result<Option<usize>>
where
    F: FnMut(&mut [u8]) -> Result<usize>,
{
    let max_size = buf.len().saturating_sub(1);
    if max_size <= overflow.len() {
        return Ok(Some(0));
    }
    let olen = overflow.len();
    buf[..olen].copy_from_slice(overflow);
    overflow.clear();

    let mut nread = olen + read(&mut buf[olen..max_size])?;
    if nread == 0 {
        return Ok(None);
    }
    if format.is_text() {
        if nread == olen {
            // Input ended inside a line: close it with the spare byte.
            buf[nread] = b'\n';
            nread += 1;
        }
    } else if nread != max_size {
        return Ok(Some(nread));
    }

    let cut = format.find_last_record_begin(&buf[..nread]);
    overflow.extend_from_slice(&buf[cut..nread]);
    Ok(Some(cut))
}
