// split-core/src/recordio.rs

//! RecordIO: self-delimited binary records.
//!
//! Every physical frame is laid out as:
//! ```text
//! +----------------+------------------------+------------------------+
//! | magic (u32 LE) | flag<<29 | len (u32 LE) | payload, zero-padded   |
//! +----------------+------------------------+ to a multiple of 4     |
//!                                           +------------------------+
//! ```
//!
//! A payload that contains the magic word at a 4-byte aligned position is
//! split at that word into several frames: flag 1 for the first, 2 for the
//! middle ones and 3 for the last. The colliding word itself is dropped from
//! the stream and re-inserted by the reader between consecutive frames, so
//! the magic word only ever appears in the stream as a frame header. A record
//! that needed no split is a single frame with flag 0.

use std::io::{Read, Write};

use crate::error::{Result, SplitError};

/// Magic word that starts every frame.
pub const RECORDIO_MAGIC: u32 = 0xced7_230a;

/// Exclusive upper bound on the payload length of a single record.
pub const MAX_RECORD_LEN: usize = 1 << 29;

/// Size of a frame header in bytes.
pub const HEADER_LEN: usize = 8;

const MAGIC_BYTES: [u8; 4] = RECORDIO_MAGIC.to_le_bytes();
const LENGTH_MASK: u32 = (1 << 29) - 1;

/// Packs a continuation flag and a payload length into a header word.
pub fn encode_lrec(flag: u32, length: u32) -> u32 {
    (flag << 29) | (length & LENGTH_MASK)
}

/// The continuation flag of a header word.
pub fn decode_flag(lrec: u32) -> u32 {
    (lrec >> 29) & 7
}

/// The payload length of a header word.
pub fn decode_length(lrec: u32) -> u32 {
    lrec & LENGTH_MASK
}

/// Rounds `len` up to the next multiple of 4.
pub fn upper_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Reads a little-endian word at `pos`, if four bytes are available there.
pub(crate) fn word_at(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Writes records to any byte sink.
pub struct RecordIoWriter<W: Write> {
    inner: W,
    bytes_written: u64,
    except_counter: u64,
}

impl<W: Write> RecordIoWriter<W> {
    /// Writes records to `inner`, which is expected to start empty or at a
    /// record boundary.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
            except_counter: 0,
        }
    }

    /// Appends one record.
    ///
    /// # Errors
    ///
    /// Returns a format error if the payload is `MAX_RECORD_LEN` bytes or
    /// longer, or a storage error if the sink fails.
    pub fn write_record(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() >= MAX_RECORD_LEN {
            return Err(SplitError::format(format!(
                "record of {} bytes exceeds the RecordIO limit of {} bytes",
                payload.len(),
                MAX_RECORD_LEN - 1
            )));
        }

        let lower_align = payload.len() & !3;
        let mut dptr = 0;
        for i in (0..lower_align).step_by(4) {
            if payload[i..i + 4] == MAGIC_BYTES {
                let flag = if dptr == 0 { 1 } else { 2 };
                self.write_frame(flag, &payload[dptr..i])?;
                dptr = i + 4;
                self.except_counter += 1;
            }
        }
        let flag = if dptr != 0 { 3 } else { 0 };
        self.write_frame(flag, &payload[dptr..])
    }

    fn write_frame(&mut self, flag: u32, data: &[u8]) -> Result<()> {
        // data.len() < MAX_RECORD_LEN was checked by the caller.
        let lrec = encode_lrec(flag, data.len() as u32);
        let padding = upper_align(data.len()) - data.len();
        self.put(&MAGIC_BYTES)?;
        self.put(&lrec.to_le_bytes())?;
        self.put(data)?;
        self.put(&[0u8; 3][..padding])
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .map_err(|e| SplitError::storage_with_source("<recordio>", "failed to write record", e))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Total bytes written so far. The offset at which the next record starts.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of magic collisions that forced a record to be split.
    pub fn except_counter(&self) -> u64 {
        self.except_counter
    }

    /// Flushes the sink.
    pub fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .map_err(|e| SplitError::storage_with_source("<recordio>", "failed to flush", e))
    }

    /// Unwraps the sink without flushing it.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads records from any byte source.
pub struct RecordIoReader<R: Read> {
    inner: R,
}

impl<R: Read> RecordIoReader<R> {
    /// Reads records from `inner`, starting at its current position.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next record into `out`, replacing its contents.
    ///
    /// Returns `Ok(false)` on a clean end of stream (at a frame boundary).
    ///
    /// # Errors
    ///
    /// Returns a format error on a bad magic word, a truncated frame or an
    /// out-of-order continuation flag.
    pub fn read_record(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        out.clear();
        let mut continuing = false;
        loop {
            let mut header = [0u8; HEADER_LEN];
            let got = self.read_full(&mut header)?;
            if got == 0 && !continuing {
                return Ok(false);
            }
            if got != HEADER_LEN {
                return Err(SplitError::format("truncated RecordIO frame header"));
            }
            let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if magic != RECORDIO_MAGIC {
                return Err(SplitError::format(format!(
                    "invalid RecordIO magic {magic:#010x}"
                )));
            }
            let lrec = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let flag = decode_flag(lrec);
            check_flag_order(flag, continuing)?;

            let len = decode_length(lrec) as usize;
            let start = out.len();
            out.resize(start + upper_align(len), 0);
            if self.read_full(&mut out[start..])? != upper_align(len) {
                return Err(SplitError::format("truncated RecordIO frame payload"));
            }
            out.truncate(start + len);

            if flag == 0 || flag == 3 {
                return Ok(true);
            }
            out.extend_from_slice(&MAGIC_BYTES);
            continuing = true;
        }
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(SplitError::storage_with_source(
                        "<recordio>",
                        "failed to read record",
                        e,
                    ))
                }
            }
        }
        Ok(filled)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Validates a frame flag against whether a split record is in progress.
pub(crate) fn check_flag_order(flag: u32, continuing: bool) -> Result<()> {
    let ok = match flag {
        0 | 1 => !continuing,
        2 | 3 => continuing,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(SplitError::format(format!(
            "unexpected RecordIO continuation flag {flag}"
        )))
    }
}

/// Encodes a single payload into its framed byte representation.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    let mut writer = RecordIoWriter::new(Vec::with_capacity(upper_align(payload.len()) + HEADER_LEN));
    writer.write_record(payload)?;
    Ok(writer.into_inner())
}

/// Decodes every record in a framed byte buffer.
pub fn decode(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut reader = RecordIoReader::new(bytes);
    let mut records = Vec::new();
    let mut record = Vec::new();
    while reader.read_record(&mut record)? {
        records.push(std::mem::take(&mut record));
    }
    Ok(records)
}
