// split-core/src/split/threaded.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::chunk::Chunk;
use super::format::RecordFormat;
use super::reader::SplitReader;
use super::{next_record_range, InputSplit};
use crate::error::{Result, SplitError};
use crate::threaded_iter::{Producer, ThreadedIter};

/// Loads chunks from a [`SplitReader`] on the prefetch thread.
struct ChunkProducer {
    reader: SplitReader,
    chunk_size: Arc<AtomicUsize>,
    // Partition to switch to on the next rewind instead of replaying the
    // current one.
    pending_partition: Arc<Mutex<Option<(u32, u32)>>>,
}

impl Producer<Chunk> for ChunkProducer {
    fn next(&mut self, cell: &mut Option<Chunk>) -> Result<bool> {
        self.reader
            .hint_chunk_size(self.chunk_size.load(Ordering::Relaxed));
        let chunk = cell.get_or_insert_with(Chunk::default);
        self.reader.load_chunk(chunk)
    }

    fn before_first(&mut self) -> Result<()> {
        let pending = self
            .pending_partition
            .lock()
            .map_err(|_| SplitError::pipeline("partition lock poisoned"))?
            .take();
        match pending {
            Some((rank, world_size)) => self.reader.reset_partition(rank, world_size),
            None => self.reader.before_first(),
        }
    }
}

/// A split whose chunks are loaded ahead of the consumer on a background
/// thread.
pub struct ThreadedSplit {
    iter: ThreadedIter<Chunk>,
    format: RecordFormat,
    total_size: u64,
    chunk_size: Arc<AtomicUsize>,
    pending_partition: Arc<Mutex<Option<(u32, u32)>>>,
    current: Option<Chunk>,
}

impl ThreadedSplit {
    /// Moves `reader` onto a prefetch thread that keeps up to `capacity`
    /// chunks queued.
    pub fn new(reader: SplitReader, capacity: usize) -> Result<Self> {
        let format = reader.format();
        let total_size = reader.total_size();
        let chunk_size = Arc::new(AtomicUsize::new(reader.chunk_size()));
        let pending_partition = Arc::new(Mutex::new(None));
        let producer = ChunkProducer {
            reader,
            chunk_size: Arc::clone(&chunk_size),
            pending_partition: Arc::clone(&pending_partition),
        };
        Self::with_producer(
            producer,
            format,
            total_size,
            chunk_size,
            pending_partition,
            capacity,
        )
    }

    /// Runs an arbitrary chunk producer behind the split interface.
    pub(crate) fn with_producer<P>(
        producer: P,
        format: RecordFormat,
        total_size: u64,
        chunk_size: Arc<AtomicUsize>,
        pending_partition: Arc<Mutex<Option<(u32, u32)>>>,
        capacity: usize,
    ) -> Result<Self>
    where
        P: Producer<Chunk> + 'static,
    {
        Ok(Self {
            iter: ThreadedIter::new(producer, capacity)?,
            format,
            total_size,
            chunk_size,
            pending_partition,
            current: None,
        })
    }

    /// Recycles the current chunk and takes the next one off the queue.
    fn advance(&mut self) -> Result<bool> {
        if let Some(chunk) = self.current.take() {
            self.iter.recycle(chunk);
        }
        self.current = self.iter.next()?;
        Ok(self.current.is_some())
    }

    fn rewind(&mut self) -> Result<()> {
        if let Some(chunk) = self.current.take() {
            self.iter.recycle(chunk);
        }
        self.iter.before_first()
    }
}

impl InputSplit for ThreadedSplit {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        loop {
            if let Some(chunk) = self.current.as_mut() {
                if let Some(range) = next_record_range(self.format, chunk, |_| Ok(false))? {
                    return Ok(self.current.as_ref().map(|c| &c.data[range]));
                }
            }
            if !self.advance()? {
                return Ok(None);
            }
        }
    }

    fn next_chunk(&mut self) -> Result<Option<&[u8]>> {
        loop {
            if let Some(range) = self.current.as_mut().and_then(Chunk::take_all) {
                return Ok(self.current.as_ref().map(|c| &c.data[range]));
            }
            if !self.advance()? {
                return Ok(None);
            }
        }
    }

    fn before_first(&mut self) -> Result<()> {
        self.rewind()
    }

    fn reset_partition(&mut self, rank: u32, world_size: u32) -> Result<()> {
        SplitError::check_partition(rank, world_size)?;
        *self
            .pending_partition
            .lock()
            .map_err(|_| SplitError::pipeline("partition lock poisoned"))? =
            Some((rank, world_size));
        self.rewind()
    }

    fn hint_chunk_size(&mut self, bytes: usize) {
        self.chunk_size.fetch_max(bytes, Ordering::Relaxed);
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::{FileSet, SingleThreadedSplit};
    use crate::storage::{FileInfo, FileSystem, MemoryFileSystem, ReadStream, Uri};
    use std::io::{self, Read};

    /// Serves files from memory but fails every read past `fail_after` bytes
    /// into a file.
    struct FlakyFileSystem {
        inner: MemoryFileSystem,
        fail_after: u64,
    }

    struct FlakyStream {
        inner: Box<dyn ReadStream>,
        remaining: u64,
    }

    impl Read for FlakyStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
            }
            let len = buf.len().min(self.remaining as usize);
            let n = self.inner.read(&mut buf[..len])?;
            self.remaining -= n as u64;
            Ok(n)
        }
    }

    impl FileSystem for FlakyFileSystem {
        fn stat(&self, path: &Uri) -> Result<FileInfo> {
            self.inner.stat(path)
        }

        fn list(&self, dir: &Uri) -> Result<Vec<FileInfo>> {
            self.inner.list(dir)
        }

        fn open_at(&self, path: &Uri, offset: u64) -> Result<Box<dyn ReadStream>> {
            Ok(Box::new(FlakyStream {
                inner: self.inner.open_at(path, offset)?,
                remaining: self.fail_after.saturating_sub(offset),
            }))
        }
    }

    fn reader(files: &[(&str, String)], chunk_size: usize, rank: u32, world: u32) -> SplitReader {
        let fs = MemoryFileSystem::new();
        for (name, text) in files {
            fs.insert(name, text.as_str());
        }
        let set = FileSet::expand(&fs, &[Uri::parse("/d")], false).unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(fs);
        SplitReader::new(fs, set, RecordFormat::Line, chunk_size, rank, world).unwrap()
    }

    fn dataset() -> Vec<(&'static str, String)> {
        let a: String = (0..200).map(|i| format!("a-{i}\n")).collect();
        let b: String = (0..150).map(|i| format!("b-{i}\n")).collect();
        vec![("/d/a.txt", a), ("/d/b.txt", b)]
    }

    fn drain(split: &mut dyn InputSplit) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(record) = split.next_record().unwrap() {
            out.push(record.to_vec());
        }
        out
    }

    #[test]
    fn test_matches_single_threaded() {
        for world_size in [1, 3] {
            for rank in 0..world_size {
                let files = dataset();
                let mut single = SingleThreadedSplit::new(reader(&files, 64, rank, world_size));
                let mut threaded =
                    ThreadedSplit::new(reader(&files, 64, rank, world_size), 2).unwrap();
                assert_eq!(drain(&mut threaded), drain(&mut single));
            }
        }
    }

    #[test]
    fn test_rewind_mid_pass_across_file_boundary() {
        let files = dataset();
        let mut split = ThreadedSplit::new(reader(&files, 48, 0, 1), 3).unwrap();
        let full = drain(&mut split);
        assert_eq!(full.len(), 350);

        split.before_first().unwrap();
        for expected in full.iter().take(230) {
            assert_eq!(split.next_record().unwrap(), Some(expected.as_slice()));
        }
        split.before_first().unwrap();
        assert_eq!(drain(&mut split), full);
    }

    #[test]
    fn test_reset_partition_on_prefetch_thread() {
        let files = dataset();
        let mut expected = Vec::new();
        for rank in 0..2 {
            let mut single = SingleThreadedSplit::new(reader(&files, 64, rank, 2));
            expected.push(drain(&mut single));
        }

        let mut split = ThreadedSplit::new(reader(&files, 64, 0, 2), 2).unwrap();
        assert_eq!(drain(&mut split), expected[0]);
        split.reset_partition(1, 2).unwrap();
        assert_eq!(drain(&mut split), expected[1]);
        split.before_first().unwrap();
        assert_eq!(drain(&mut split), expected[1]);

        assert!(matches!(
            split.reset_partition(2, 2),
            Err(SplitError::InvalidPartition { .. })
        ));
    }

    #[test]
    fn test_storage_fault_reaches_caller_once() {
        let files = dataset();
        let inner = MemoryFileSystem::new();
        for (name, text) in &files {
            inner.insert(name, text.as_str());
        }
        let set = FileSet::expand(&inner, &[Uri::parse("/d")], false).unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(FlakyFileSystem {
            inner,
            fail_after: 100,
        });
        let reader = SplitReader::new(fs, set, RecordFormat::Line, 32, 0, 1).unwrap();
        let mut split = ThreadedSplit::new(reader, 2).unwrap();

        let mut records = Vec::new();
        let fault = loop {
            match split.next_record() {
                Ok(Some(record)) => records.push(record.to_vec()),
                Ok(None) => panic!("stream ended without a fault"),
                Err(e) => break e,
            }
        };
        assert!(matches!(fault, SplitError::Storage { .. }));
        // Only whole records read before the fault were delivered, in order.
        assert!(records.len() < 200);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record, format!("a-{i}").as_bytes());
        }

        assert_eq!(split.next_record().unwrap(), None);
        assert_eq!(split.next_chunk().unwrap(), None);
        assert!(split.before_first().is_err());
    }

    #[test]
    fn test_chunks_and_hint() {
        let files = dataset();
        let mut split = ThreadedSplit::new(reader(&files, 16, 0, 1), 2).unwrap();
        split.hint_chunk_size(1 << 20);
        split.before_first().unwrap();

        let mut joined = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = split.next_chunk().unwrap() {
            joined.extend_from_slice(chunk);
            chunks += 1;
        }
        // The end of a text file always reads as a line terminator.
        let expected = format!("{}\n{}", files[0].1, files[1].1);
        assert_eq!(joined, expected.as_bytes());
        assert_eq!(chunks, 1);
        assert_eq!(split.total_size(), expected.len() as u64 - 1);
    }
}
