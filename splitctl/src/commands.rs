//! Subcommand implementations.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use split_core::{InputSplit, RecordIoReader, RecordIoWriter, Result, SplitError};

/// What a pass over a split produced.
#[derive(Debug)]
pub struct CountStats {
    pub items: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Reads a split to the end, counting records or chunks.
pub fn count(split: &mut dyn InputSplit, chunks: bool) -> Result<CountStats> {
    let start = Instant::now();
    let mut items = 0;
    let mut bytes = 0;
    loop {
        let next = if chunks {
            split.next_chunk()?
        } else {
            split.next_record()?
        };
        let Some(item) = next else { break };
        items += 1;
        bytes += item.len() as u64;
    }
    Ok(CountStats {
        items,
        bytes,
        elapsed: start.elapsed(),
    })
}

#[derive(Debug)]
pub struct PackStats {
    pub records: u64,
    pub bytes: u64,
    pub magic_splits: u64,
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| SplitError::storage_with_source(path, "failed to create file", e))
}

/// Packs every line of `input` (terminators stripped) into a RecordIO file,
/// optionally writing a `key\toffset` index alongside.
pub fn pack(input: &Path, output: &Path, index: Option<&Path>) -> Result<PackStats> {
    let reader = File::open(input)
        .map(BufReader::new)
        .map_err(|e| SplitError::storage_with_source(input, "failed to open input", e))?;
    let mut writer = RecordIoWriter::new(create(output)?);
    let mut index_writer = index.map(create).transpose()?;

    let mut records = 0u64;
    for line in reader.split(b'\n') {
        let mut line =
            line.map_err(|e| SplitError::storage_with_source(input, "failed to read input", e))?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if let (Some(w), Some(path)) = (index_writer.as_mut(), index) {
            writeln!(w, "{records}\t{}", writer.bytes_written()).map_err(|e| {
                SplitError::storage_with_source(path, "failed to write index", e)
            })?;
        }
        writer.write_record(&line)?;
        records += 1;
    }

    writer.flush()?;
    if let (Some(mut w), Some(path)) = (index_writer, index) {
        w.flush()
            .map_err(|e| SplitError::storage_with_source(path, "failed to write index", e))?;
    }
    Ok(PackStats {
        records,
        bytes: writer.bytes_written(),
        magic_splits: writer.except_counter(),
    })
}

/// Writes every record of a RecordIO file to `out`, one per line.
pub fn unpack(input: &Path, out: &mut dyn Write) -> Result<u64> {
    let file = File::open(input)
        .map_err(|e| SplitError::storage_with_source(input, "failed to open input", e))?;
    let mut reader = RecordIoReader::new(BufReader::new(file));
    let mut record = Vec::new();
    let mut records = 0;
    while reader.read_record(&mut record)? {
        out.write_all(&record)
            .and_then(|()| out.write_all(b"\n"))
            .map_err(|e| SplitError::storage_with_source("<stdout>", "failed to write", e))?;
        records += 1;
    }
    Ok(records)
}
