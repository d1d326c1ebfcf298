// split-core/src/split/reader.rs

use std::io::Read;
use std::sync::Arc;

use tracing::{debug, trace};

use super::chunk::{read_chunk_with, Chunk, ChunkSource};
use super::format::RecordFormat;
use super::indexed::IndexedCursor;
use super::sharding::{FileSet, Partition};
use crate::error::{Result, SplitError};
use crate::storage::{FileSystem, ReadStream};

/// Reads one worker's partition of a file set as record-aligned chunks.
///
/// The reader walks the virtual concatenation of every file in the set,
/// opening each file in turn. For text, the end of every file acts as a line
/// terminator so the last line of one file is never glued to the first line
/// of the next.
pub struct SplitReader {
    fs: Arc<dyn FileSystem>,
    files: FileSet,
    format: RecordFormat,
    /// Realigned range of the current partition.
    partition: Partition,
    /// Global offset of the next byte `stream` yields.
    offset_curr: u64,
    /// Index of the file `stream` reads from.
    file_ptr: usize,
    stream: Option<Box<dyn ReadStream>>,
    /// Partial record carried to the front of the next chunk.
    overflow: Vec<u8>,
    chunk_size: usize,
    indexed: Option<IndexedCursor>,
}

impl SplitReader {
    /// Creates a reader positioned on partition `rank` of `world_size`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a file size is not a multiple of the
    /// format's alignment, and partition or storage errors from realignment.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        files: FileSet,
        format: RecordFormat,
        chunk_size: usize,
        rank: u32,
        world_size: u32,
    ) -> Result<Self> {
        Self::build(fs, files, format, chunk_size, None, rank, world_size)
    }

    /// Creates a reader that locates records through `cursor`'s index.
    pub fn new_indexed(
        fs: Arc<dyn FileSystem>,
        files: FileSet,
        cursor: IndexedCursor,
        chunk_size: usize,
        rank: u32,
        world_size: u32,
    ) -> Result<Self> {
        let format = RecordFormat::IndexedRecordIo;
        Self::build(fs, files, format, chunk_size, Some(cursor), rank, world_size)
    }

    fn build(
        fs: Arc<dyn FileSystem>,
        files: FileSet,
        format: RecordFormat,
        chunk_size: usize,
        indexed: Option<IndexedCursor>,
        rank: u32,
        world_size: u32,
    ) -> Result<Self> {
        files.check_alignment(format.align_bytes())?;
        let mut reader = Self {
            fs,
            files,
            format,
            partition: Partition::default(),
            offset_curr: 0,
            file_ptr: 0,
            stream: None,
            overflow: Vec::new(),
            chunk_size: chunk_size.max(8),
            indexed,
        };
        reader.reset_partition(rank, world_size)?;
        Ok(reader)
    }

    /// Moves the reader to partition `rank` of `world_size` and rewinds it.
    ///
    /// Both ends of the nominal byte range are moved forward to the next
    /// record start with the same rule, so the end of rank `k` is exactly the
    /// begin of rank `k + 1`: a record straddling the nominal cut belongs to
    /// the worker in whose range it starts.
    pub fn reset_partition(&mut self, rank: u32, world_size: u32) -> Result<()> {
        let partition = match self.indexed.as_mut() {
            Some(cursor) => cursor.reset_partition(rank, world_size)?,
            None => {
                let total = self.files.total_size();
                let nominal =
                    Partition::compute(total, rank, world_size, self.format.align_bytes())?;
                if nominal.is_empty() {
                    nominal
                } else {
                    Partition {
                        begin: self.align_offset(nominal.begin)?,
                        end: self.align_offset(nominal.end)?,
                    }
                }
            }
        };
        debug!(
            rank,
            world_size,
            begin = partition.begin,
            end = partition.end,
            format = %self.format,
            "reset partition"
        );
        self.partition = partition;
        self.before_first()
    }

    /// Rewinds to the start of the current partition.
    pub fn before_first(&mut self) -> Result<()> {
        self.overflow.clear();
        self.stream = None;
        self.offset_curr = self.partition.begin;
        if let Some(cursor) = self.indexed.as_mut() {
            cursor.before_first();
        }
        if self.partition.is_empty() {
            return Ok(());
        }
        self.file_ptr = self.files.file_index_at(self.partition.begin);
        let within = self.partition.begin - self.files.offsets()[self.file_ptr];
        self.stream = Some(self.open(self.file_ptr, within)?);
        Ok(())
    }

    /// Moves `offset` forward to the nearest record start.
    ///
    /// File starts and the end of the set are always record starts. An offset
    /// that already sits on a record start is returned unchanged.
    pub fn align_offset(&self, offset: u64) -> Result<u64> {
        let total = self.files.total_size();
        if offset >= total {
            return Ok(total);
        }
        let index = self.files.file_index_at(offset);
        let file_start = self.files.offsets()[index];
        if offset == file_start {
            return Ok(offset);
        }
        let from = offset - self.format.lookbehind().min(offset - file_start);
        let mut stream = self.open(index, from - file_start)?;
        let skipped = self.format.seek_record_begin(&mut stream)?;
        Ok((from + skipped).min(self.files.offsets()[index + 1]))
    }

    /// Refills `chunk` with the next record-aligned window of the partition.
    /// Returns `Ok(false)` once the partition is exhausted.
    pub fn load_chunk(&mut self, chunk: &mut Chunk) -> Result<bool> {
        if self.indexed.is_some() {
            return self.load_indexed_batch(chunk);
        }
        let chunk_size = self.chunk_size;
        chunk.load(self, chunk_size)
    }

    fn load_indexed_batch(&mut self, chunk: &mut Chunk) -> Result<bool> {
        let ranges = match self.indexed.as_mut() {
            Some(cursor) => cursor.next_batch(),
            None => Vec::new(),
        };
        if ranges.is_empty() {
            chunk.clear();
            return Ok(false);
        }
        let total: usize = ranges.iter().map(|&(_, len)| len as usize).sum();
        chunk.reserve(total);
        let mut pos = 0;
        for (offset, len) in ranges {
            let len = len as usize;
            self.read_exact_at(offset, &mut chunk.data[pos..pos + len])?;
            pos += len;
        }
        chunk.begin = 0;
        chunk.end = total;
        Ok(true)
    }

    /// Reads up to `buf.len()` bytes of the partition, crossing file
    /// boundaries as needed.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.offset_curr >= self.partition.end {
            return Ok(0);
        }
        let size = (buf.len() as u64).min(self.partition.end - self.offset_curr) as usize;
        let mut filled = 0;
        while filled < size {
            let n = self.read_stream(&mut buf[filled..size])?;
            filled += n;
            self.offset_curr += n as u64;
            if filled == size {
                break;
            }
            if n == 0 {
                if self.format.is_text() {
                    buf[filled] = b'\n';
                    filled += 1;
                }
                if !self.next_file()? {
                    break;
                }
            }
        }
        Ok(filled)
    }

    /// Reads exactly `buf.len()` bytes starting at global `offset`.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.stream.is_none() || self.offset_curr != offset {
            self.file_ptr = self.files.file_index_at(offset);
            let within = offset - self.files.offsets()[self.file_ptr];
            self.stream = Some(self.open(self.file_ptr, within)?);
            self.offset_curr = offset;
        }
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_stream(&mut buf[filled..])?;
            filled += n;
            self.offset_curr += n as u64;
            if n == 0 && !self.next_file()? {
                return Err(SplitError::format(format!(
                    "record at offset {offset} runs past the end of the data"
                )));
            }
        }
        Ok(())
    }

    fn read_stream(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        loop {
            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let path = self.files.files()[self.file_ptr].path.local_path();
                    return Err(SplitError::storage_with_source(path, "failed to read file", e));
                }
            }
        }
    }

    /// Switches to the next file once the current one is exhausted. Returns
    /// `false` when there is no next file.
    fn next_file(&mut self) -> Result<bool> {
        let expected_end = self.files.offsets()[self.file_ptr + 1];
        if self.offset_curr != expected_end {
            let path = self.files.files()[self.file_ptr].path.local_path();
            return Err(SplitError::storage(
                path,
                format!(
                    "file ended at offset {} but was listed to end at {}",
                    self.offset_curr, expected_end
                ),
            ));
        }
        self.stream = None;
        if self.file_ptr + 1 >= self.files.len() {
            return Ok(false);
        }
        self.file_ptr += 1;
        trace!(file = %self.files.files()[self.file_ptr].path, "switching to next file");
        self.stream = Some(self.open(self.file_ptr, 0)?);
        Ok(true)
    }

    fn open(&self, index: usize, offset: u64) -> Result<Box<dyn ReadStream>> {
        self.fs.open_at(&self.files.files()[index].path, offset)
    }

    /// The current record-aligned byte range.
    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn total_size(&self) -> u64 {
        self.files.total_size()
    }

    /// Bytes requested per load; chunks may grow past it to fit a record.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Raises the chunk size to at least `bytes`; never lowers it.
    pub fn hint_chunk_size(&mut self, bytes: usize) {
        self.chunk_size = self.chunk_size.max(bytes);
    }
}

impl ChunkSource for SplitReader {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let format = self.format;
        let mut overflow = std::mem::take(&mut self.overflow);
        let result = read_chunk_with(format, &mut overflow, buf, |out| self.read(out));
        self.overflow = overflow;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recordio::RecordIoWriter;
    use crate::storage::{MemoryFileSystem, Uri};

    fn memory(files: &[(&str, &[u8])]) -> (Arc<dyn FileSystem>, FileSet) {
        let fs = MemoryFileSystem::new();
        for (name, data) in files {
            fs.insert(name, data.to_vec());
        }
        let paths: Vec<Uri> = files.iter().map(|(name, _)| Uri::parse(name)).collect();
        let set = FileSet::expand(&fs, &paths, false).unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(fs);
        (fs, set)
    }

    fn read_records(reader: &mut SplitReader) -> Vec<Vec<u8>> {
        let mut chunk = Chunk::default();
        let mut out = Vec::new();
        while reader.load_chunk(&mut chunk).unwrap() {
            while let Some(range) = reader.format().extract_next_record(&mut chunk).unwrap() {
                out.push(chunk.data[range].to_vec());
            }
        }
        out
    }

    fn lines(text: &str) -> Vec<Vec<u8>> {
        text.lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.as_bytes().to_vec())
            .collect()
    }

    /// 700 + 300 bytes of numbered lines of varying width.
    fn two_file_dataset() -> (String, String) {
        let mut first = String::new();
        let mut i = 0;
        while first.len() < 670 {
            first.push_str(&format!("line-{i}-{}\n", "x".repeat(i % 13)));
            i += 1;
        }
        first.push_str(&"y".repeat(699 - first.len()));
        first.push('\n');
        let mut second = String::new();
        while second.len() < 290 {
            second.push_str(&format!("tail-{i}\n"));
            i += 1;
        }
        second.push_str(&"z".repeat(300 - second.len()));
        (first, second)
    }

    #[test]
    fn test_two_files_three_ranks() {
        let (first, second) = two_file_dataset();
        assert_eq!((first.len(), second.len()), (700, 300));
        let (fs, set) = memory(&[("/d/a.txt", first.as_bytes()), ("/d/b.txt", second.as_bytes())]);

        let mut expected = lines(&first);
        expected.extend(lines(&second));

        let mut all = Vec::new();
        let mut previous_end = 0;
        for rank in 0..3 {
            let mut reader =
                SplitReader::new(fs.clone(), set.clone(), RecordFormat::Line, 64, rank, 3).unwrap();
            let partition = reader.partition();
            let nominal_end = Partition::compute(1000, rank, 3, 1).unwrap().end;
            assert_eq!(partition.begin, previous_end);
            assert!(partition.end >= nominal_end);
            previous_end = partition.end;
            all.extend(read_records(&mut reader));
        }
        assert_eq!(previous_end, 1000);
        assert_eq!(all, expected);
    }

    #[test]
    fn test_union_of_ranks_matches_single_read() {
        let (first, second) = two_file_dataset();
        let (fs, set) = memory(&[("/d/a.txt", first.as_bytes()), ("/d/b.txt", second.as_bytes())]);
        let mut single =
            SplitReader::new(fs.clone(), set.clone(), RecordFormat::Line, 32, 0, 1).unwrap();
        let expected = read_records(&mut single);

        for world_size in 1..=12 {
            let mut all = Vec::new();
            for rank in 0..world_size {
                let mut reader = SplitReader::new(
                    fs.clone(),
                    set.clone(),
                    RecordFormat::Line,
                    32,
                    rank,
                    world_size,
                )
                .unwrap();
                all.extend(read_records(&mut reader));
            }
            assert_eq!(all, expected, "world size {world_size}");
        }
    }

    #[test]
    fn test_align_offset_is_idempotent() {
        let (fs, set) = memory(&[("/a.txt", &b"ab\ncd\n\nef\n"[..]), ("/b.txt", &b"gh\n"[..])]);
        let reader = SplitReader::new(fs, set, RecordFormat::Line, 16, 0, 1).unwrap();

        assert_eq!(reader.align_offset(0).unwrap(), 0);
        assert_eq!(reader.align_offset(1).unwrap(), 3);
        assert_eq!(reader.align_offset(3).unwrap(), 3);
        // Blank line is skipped along with the terminator run.
        assert_eq!(reader.align_offset(5).unwrap(), 7);
        assert_eq!(reader.align_offset(7).unwrap(), 7);
        // File starts are record starts.
        assert_eq!(reader.align_offset(9).unwrap(), 10);
        assert_eq!(reader.align_offset(10).unwrap(), 10);
        assert_eq!(reader.align_offset(11).unwrap(), 13);
        assert_eq!(reader.align_offset(99).unwrap(), 13);
    }

    #[test]
    fn test_files_without_trailing_newline() {
        let (fs, set) = memory(&[
            ("/a.txt", &b"one\ntwo"[..]),
            ("/b.txt", &b"three"[..]),
            ("/c.txt", &b"four\n"[..]),
        ]);
        let mut reader = SplitReader::new(fs, set, RecordFormat::Line, 8, 0, 1).unwrap();
        assert_eq!(read_records(&mut reader), lines("one\ntwo\nthree\nfour\n"));
    }

    #[test]
    fn test_before_first_replays_partition() {
        let (first, second) = two_file_dataset();
        let (fs, set) = memory(&[("/d/a.txt", first.as_bytes()), ("/d/b.txt", second.as_bytes())]);
        let mut reader = SplitReader::new(fs, set, RecordFormat::Line, 50, 1, 2).unwrap();

        let first_pass = read_records(&mut reader);
        assert!(!first_pass.is_empty());
        reader.before_first().unwrap();
        assert_eq!(read_records(&mut reader), first_pass);
    }

    #[test]
    fn test_more_ranks_than_records() {
        let (fs, set) = memory(&[("/a.txt", &b"a\nb\n"[..])]);
        let mut seen = Vec::new();
        for rank in 0..8 {
            let mut reader = SplitReader::new(fs.clone(), set.clone(), RecordFormat::Line, 8, rank, 8)
                .unwrap();
            seen.extend(read_records(&mut reader));
        }
        assert_eq!(seen, lines("a\nb\n"));
    }

    fn recordio_file(records: &[Vec<u8>]) -> Vec<u8> {
        let mut writer = RecordIoWriter::new(Vec::new());
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn test_recordio_partitions_cover_all_records() {
        let magic = crate::recordio::RECORDIO_MAGIC.to_le_bytes();
        let records: Vec<Vec<u8>> = (0..60u32)
            .map(|i| {
                let mut r = format!("record-{i}-").into_bytes();
                r.resize(4 + (i as usize * 7) % 29, b'.');
                if i % 5 == 0 {
                    r.truncate(4);
                    r.extend_from_slice(&magic);
                    r.extend_from_slice(b"after-magic");
                }
                r
            })
            .collect();
        let a = recordio_file(&records[..35]);
        let b = recordio_file(&records[35..]);
        let (fs, set) = memory(&[("/a.rec", a.as_slice()), ("/b.rec", b.as_slice())]);

        for world_size in [1, 2, 3, 5, 16] {
            let mut all = Vec::new();
            for rank in 0..world_size {
                let mut reader = SplitReader::new(
                    fs.clone(),
                    set.clone(),
                    RecordFormat::RecordIo,
                    24,
                    rank,
                    world_size,
                )
                .unwrap();
                all.extend(read_records(&mut reader));
            }
            assert_eq!(all, records, "world size {world_size}");
        }
    }

    #[test]
    fn test_recordio_rejects_misaligned_file() {
        let (fs, set) = memory(&[("/a.rec", &b"abcde"[..])]);
        let result = SplitReader::new(fs, set, RecordFormat::RecordIo, 64, 0, 1);
        assert!(matches!(result, Err(SplitError::Config { .. })));
    }

    #[test]
    fn test_invalid_rank() {
        let (fs, set) = memory(&[("/a.txt", &b"a\n"[..])]);
        let result = SplitReader::new(fs, set, RecordFormat::Line, 8, 1, 1);
        assert!(matches!(result, Err(SplitError::InvalidPartition { .. })));
    }

    #[test]
    fn test_hint_chunk_size_only_grows() {
        let (fs, set) = memory(&[("/a.txt", &b"a\n"[..])]);
        let mut reader = SplitReader::new(fs, set, RecordFormat::Line, 1024, 0, 1).unwrap();
        reader.hint_chunk_size(64);
        assert_eq!(reader.chunk_size(), 1024);
        reader.hint_chunk_size(4096);
        assert_eq!(reader.chunk_size(), 4096);
    }
}
