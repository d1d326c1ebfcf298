// split-core/src/split/format.rs

//! Record boundary strategies.
//!
//! Each format knows three things about its byte stream: how to move from an
//! arbitrary offset to the next record start, where the last record in a
//! window begins, and how to cut one record out of a chunk.

use std::fmt;
use std::io::Read;
use std::ops::Range;
use std::str::FromStr;

use super::chunk::Chunk;
use crate::error::{Result, SplitError};
use crate::recordio::{
    check_flag_order, decode_flag, decode_length, upper_align, word_at, HEADER_LEN,
    RECORDIO_MAGIC,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordFormat {
    /// Newline-terminated text. `\n` and `\r` both end a line.
    Line,
    /// RecordIO frames, located by scanning for the magic word.
    RecordIo,
    /// RecordIO frames located through a side index file.
    IndexedRecordIo,
}

impl RecordFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Line => "text",
            Self::RecordIo => "recordio",
            Self::IndexedRecordIo => "indexed_recordio",
        }
    }

    /// Every file in the set must have a size that is a multiple of this.
    pub fn align_bytes(self) -> u64 {
        match self {
            Self::Line => 1,
            Self::RecordIo | Self::IndexedRecordIo => 4,
        }
    }

    pub fn is_text(self) -> bool {
        self == Self::Line
    }

    /// Bytes before an offset that must be inspected to realign it.
    ///
    /// A line starts right after a terminator, so the byte before the offset
    /// decides whether the offset is already aligned.
    pub(crate) fn lookbehind(self) -> u64 {
        match self {
            Self::Line => 1,
            Self::RecordIo | Self::IndexedRecordIo => 0,
        }
    }

    /// Reads forward until the next record start and returns the number of
    /// bytes skipped. Hitting the end of the stream returns everything read.
    pub fn seek_record_begin<R: Read + ?Sized>(self, stream: &mut R) -> Result<u64> {
        match self {
            Self::Line => seek_line_begin(stream),
            Self::RecordIo | Self::IndexedRecordIo => seek_recordio_begin(stream),
        }
    }

    /// Offset within `buf` where the last record starting in it begins, or 0.
    pub fn find_last_record_begin(self, buf: &[u8]) -> usize {
        match self {
            Self::Line => {
                let mut p = buf.len();
                while p > 1 {
                    p -= 1;
                    if is_eol(buf[p]) {
                        return p + 1;
                    }
                }
                0
            }
            Self::RecordIo | Self::IndexedRecordIo => {
                if buf.len() < HEADER_LEN {
                    return 0;
                }
                let mut p = (buf.len() - HEADER_LEN) & !3;
                while p > 0 {
                    if word_at(buf, p) == Some(RECORDIO_MAGIC) {
                        let flag = word_at(buf, p + 4).map(decode_flag);
                        if matches!(flag, Some(0) | Some(1)) {
                            return p;
                        }
                    }
                    p -= 4;
                }
                0
            }
        }
    }

    /// Cuts the next record out of `chunk` and returns its range in
    /// `chunk.data`.
    ///
    /// Records are extracted in place: a RecordIO record spanning several
    /// frames is compacted inside the chunk buffer.
    pub fn extract_next_record(self, chunk: &mut Chunk) -> Result<Option<Range<usize>>> {
        match self {
            Self::Line => Ok(extract_line(chunk)),
            Self::RecordIo | Self::IndexedRecordIo => extract_recordio(chunk),
        }
    }
}

impl FromStr for RecordFormat {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "line" => Ok(Self::Line),
            "recordio" => Ok(Self::RecordIo),
            "indexed_recordio" | "indexed-recordio" => Ok(Self::IndexedRecordIo),
            _ => Err(SplitError::config(format!(
                "unknown format '{s}', expected 'text', 'recordio' or 'indexed_recordio'"
            ))),
        }
    }
}

impl fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn is_eol(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

fn read_into<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(SplitError::storage_with_source(
                    "<stream>",
                    "failed to read while seeking a record boundary",
                    e,
                ))
            }
        }
    }
    Ok(filled)
}

fn seek_line_begin<R: Read + ?Sized>(stream: &mut R) -> Result<u64> {
    let mut byte = [0u8; 1];
    let mut nstep = 0;
    // Up to and including the first terminator.
    loop {
        if read_into(stream, &mut byte)? == 0 {
            return Ok(nstep);
        }
        nstep += 1;
        if is_eol(byte[0]) {
            break;
        }
    }
    // Further terminators; the first byte of the next line is not counted.
    loop {
        if read_into(stream, &mut byte)? == 0 || !is_eol(byte[0]) {
            return Ok(nstep);
        }
        nstep += 1;
    }
}

fn seek_recordio_begin<R: Read + ?Sized>(stream: &mut R) -> Result<u64> {
    let mut word = [0u8; 4];
    let mut nstep = 0;
    loop {
        let got = read_into(stream, &mut word)?;
        if got == 0 {
            return Ok(nstep);
        }
        if got != 4 {
            return Err(SplitError::format("RecordIO stream is not 4-byte aligned"));
        }
        nstep += 4;
        if u32::from_le_bytes(word) == RECORDIO_MAGIC {
            if read_into(stream, &mut word)? != 4 {
                return Err(SplitError::format("truncated RecordIO frame header"));
            }
            nstep += 4;
            let flag = decode_flag(u32::from_le_bytes(word));
            if flag == 0 || flag == 1 {
                return Ok(nstep - HEADER_LEN as u64);
            }
        }
    }
}

fn extract_line(chunk: &mut Chunk) -> Option<Range<usize>> {
    let data = &chunk.data[..chunk.end];
    let mut start = chunk.begin;
    while start < chunk.end && is_eol(data[start]) {
        start += 1;
    }
    if start == chunk.end {
        chunk.begin = chunk.end;
        return None;
    }
    let mut stop = start;
    while stop < chunk.end && !is_eol(data[stop]) {
        stop += 1;
    }
    let mut next = stop;
    while next < chunk.end && is_eol(data[next]) {
        next += 1;
    }
    chunk.begin = next;
    Some(start..stop)
}

struct FrameHeader {
    flag: u32,
    len: usize,
}

fn frame_header(chunk: &Chunk, pos: usize) -> Result<FrameHeader> {
    if pos + HEADER_LEN > chunk.end {
        return Err(SplitError::format("truncated RecordIO frame header"));
    }
    if word_at(&chunk.data, pos) != Some(RECORDIO_MAGIC) {
        return Err(SplitError::format("invalid RecordIO magic inside chunk"));
    }
    let lrec = word_at(&chunk.data, pos + 4).unwrap_or_default();
    let header = FrameHeader {
        flag: decode_flag(lrec),
        len: decode_length(lrec) as usize,
    };
    if pos + HEADER_LEN + upper_align(header.len) > chunk.end {
        return Err(SplitError::format("truncated RecordIO frame payload"));
    }
    Ok(header)
}

fn extract_recordio(chunk: &mut Chunk) -> Result<Option<Range<usize>>> {
    if chunk.is_empty() {
        return Ok(None);
    }
    if chunk.begin % 4 != 0 || chunk.end % 4 != 0 {
        return Err(SplitError::format("RecordIO chunk is not 4-byte aligned"));
    }

    let header = frame_header(chunk, chunk.begin)?;
    check_flag_order(header.flag, false)?;
    let start = chunk.begin + HEADER_LEN;
    let mut size = header.len;
    chunk.begin = start + upper_align(header.len);
    if header.flag == 0 {
        return Ok(Some(start..start + size));
    }

    // A split record: join the continuation frames behind the first payload,
    // putting back the magic word each split removed.
    let mut flag = header.flag;
    while flag != 3 {
        let next = frame_header(chunk, chunk.begin)?;
        check_flag_order(next.flag, true)?;
        let payload = chunk.begin + HEADER_LEN;
        let magic_at = start + size;
        chunk.data[magic_at..magic_at + 4].copy_from_slice(&RECORDIO_MAGIC.to_le_bytes());
        size += 4;
        chunk
            .data
            .copy_within(payload..payload + next.len, start + size);
        size += next.len;
        chunk.begin = payload + upper_align(next.len);
        flag = next.flag;
    }
    Ok(Some(start..start + size))
}
