// split-core/src/split/cached.rs

//! A split that keeps a local copy of its partition.
//!
//! The first pass reads the real split and appends every chunk to a cache
//! file as it goes. Every later pass streams chunks back from that file, so
//! remote or expensive sources are read only once per worker.
//!
//! Cache frame layout, repeated once per chunk:
//!
//! ```text
//! [length: u64 LE][xxhash64 of bytes: u64 LE][bytes ...]
//! ```

use std::fs::File;
use std::hash::Hasher;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use twox_hash::XxHash64;

use super::chunk::Chunk;
use super::format::RecordFormat;
use super::reader::SplitReader;
use super::threaded::ThreadedSplit;
use super::InputSplit;
use crate::error::{Result, SplitError};
use crate::threaded_iter::Producer;

const FRAME_HEADER_LEN: usize = 16;

fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

/// First pass: reads the partition and tees each chunk into a temporary
/// sibling of the cache file, which is renamed into place once the partition
/// has been written completely.
struct CacheWriter {
    reader: SplitReader,
    // None once the cache has been committed.
    writer: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    path: PathBuf,
    chunk_size: Arc<AtomicUsize>,
}

impl CacheWriter {
    fn create(reader: SplitReader, path: &Path, chunk_size: Arc<AtomicUsize>) -> Result<Self> {
        let tmp_path = temp_path(path);
        let file = File::create(&tmp_path).map_err(|e| {
            SplitError::storage_with_source(&tmp_path, "failed to create cache file", e)
        })?;
        Ok(Self {
            reader,
            writer: Some(BufWriter::new(file)),
            tmp_path,
            path: path.to_path_buf(),
            chunk_size,
        })
    }

    fn write_frame(writer: &mut BufWriter<File>, bytes: &[u8]) -> io::Result<()> {
        writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
        writer.write_all(&checksum(bytes).to_le_bytes())?;
        writer.write_all(bytes)
    }

    /// Flushes the temporary file and moves it to the cache path.
    fn commit(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush().map_err(|e| {
            SplitError::storage_with_source(&self.tmp_path, "failed to flush cache file", e)
        })?;
        drop(writer);
        std::fs::rename(&self.tmp_path, &self.path).map_err(|e| {
            SplitError::storage_with_source(&self.path, "failed to move cache file into place", e)
        })?;
        debug!(cache = %self.path.display(), "finished writing cache");
        Ok(())
    }
}

impl Producer<Chunk> for CacheWriter {
    fn next(&mut self, cell: &mut Option<Chunk>) -> Result<bool> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(false);
        };
        self.reader
            .hint_chunk_size(self.chunk_size.load(Ordering::Relaxed));
        let chunk = cell.get_or_insert_with(Chunk::default);
        if !self.reader.load_chunk(chunk)? {
            self.commit()?;
            return Ok(false);
        }
        Self::write_frame(writer, chunk.as_bytes()).map_err(|e| {
            SplitError::storage_with_source(&self.tmp_path, "failed to write cache file", e)
        })?;
        Ok(true)
    }
}

impl Drop for CacheWriter {
    // A pass that stopped early must not leave a cache that looks complete.
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            drop(writer);
            if let Err(e) = std::fs::remove_file(&self.tmp_path) {
                warn!(
                    cache = %self.tmp_path.display(),
                    error = %e,
                    "failed to remove partial cache"
                );
            } else {
                debug!(cache = %self.path.display(), "discarded partial cache");
            }
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Later passes: replays chunks from the cache file.
struct CacheReader {
    file: BufReader<File>,
    path: PathBuf,
}

impl CacheReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            SplitError::storage_with_source(path, "failed to open cache file", e)
        })?;
        Ok(Self {
            file: BufReader::new(file),
            path: path.to_path_buf(),
        })
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(SplitError::storage_with_source(
                        &self.path,
                        "failed to read cache file",
                        e,
                    ))
                }
            }
        }
        Ok(filled)
    }
}

impl Producer<Chunk> for CacheReader {
    fn next(&mut self, cell: &mut Option<Chunk>) -> Result<bool> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.read_full(&mut header)? {
            0 => return Ok(false),
            FRAME_HEADER_LEN => {}
            _ => return Err(SplitError::format("truncated cache frame header")),
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&header[..8]);
        let len = usize::try_from(u64::from_le_bytes(word))
            .map_err(|_| SplitError::format("cache frame length does not fit in memory"))?;
        word.copy_from_slice(&header[8..]);
        let expected = u64::from_le_bytes(word);

        let chunk = cell.get_or_insert_with(Chunk::default);
        chunk.reserve(len);
        if self.read_full(&mut chunk.data[..len])? != len {
            return Err(SplitError::format("truncated cache frame"));
        }
        let actual = checksum(&chunk.data[..len]);
        if actual != expected {
            return Err(SplitError::format(format!(
                "cache checksum mismatch in '{}': expected {expected:#018x}, got {actual:#018x}",
                self.path.display()
            )));
        }
        chunk.begin = 0;
        chunk.end = len;
        Ok(true)
    }

    fn before_first(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).map_err(|e| {
            SplitError::storage_with_source(&self.path, "failed to rewind cache file", e)
        })?;
        Ok(())
    }
}

/// A split that reads its source once and then replays a local cache file.
pub struct CachedSplit {
    inner: ThreadedSplit,
    format: RecordFormat,
    total_size: u64,
    path: PathBuf,
    capacity: usize,
    // Still on the first pass, writing the cache.
    writing: bool,
}

impl CachedSplit {
    /// Creates a cached split backed by `path`.
    ///
    /// If `path` already exists it is trusted as a complete cache and `reader`
    /// is not used. Otherwise the first pass fills `{path}.tmp`, which only
    /// becomes `path` once the whole partition has been written; a split
    /// dropped or faulted before that leaves no cache behind.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the cache file cannot be created or opened.
    pub fn new(reader: SplitReader, path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        let format = reader.format();
        let total_size = reader.total_size();
        let writing = !path.exists();

        let inner = if writing {
            let chunk_size = Arc::new(AtomicUsize::new(reader.chunk_size()));
            let producer = CacheWriter::create(reader, &path, Arc::clone(&chunk_size))?;
            debug!(cache = %path.display(), "writing cache on first pass");
            ThreadedSplit::with_producer(
                producer,
                format,
                total_size,
                chunk_size,
                Arc::new(Mutex::new(None)),
                capacity,
            )?
        } else {
            debug!(cache = %path.display(), "reading existing cache");
            Self::replay(&path, format, total_size, capacity)?
        };

        Ok(Self {
            inner,
            format,
            total_size,
            path,
            capacity,
            writing,
        })
    }

    fn replay(
        path: &Path,
        format: RecordFormat,
        total_size: u64,
        capacity: usize,
    ) -> Result<ThreadedSplit> {
        ThreadedSplit::with_producer(
            CacheReader::open(path)?,
            format,
            total_size,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(Mutex::new(None)),
            capacity,
        )
    }

    /// Where the completed cache lives.
    pub fn cache_path(&self) -> &Path {
        &self.path
    }
}

impl InputSplit for CachedSplit {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        self.inner.next_record()
    }

    fn next_chunk(&mut self) -> Result<Option<&[u8]>> {
        self.inner.next_chunk()
    }

    /// Finishes the first pass if it is still running, then replays the
    /// cache from the start.
    fn before_first(&mut self) -> Result<()> {
        if !self.writing {
            return self.inner.before_first();
        }
        while self.inner.next_chunk()?.is_some() {}
        // Dropping the old pipeline joins the writer thread.
        self.inner = Self::replay(&self.path, self.format, self.total_size, self.capacity)?;
        self.writing = false;
        debug!(cache = %self.path.display(), "switched to reading cache");
        Ok(())
    }

    fn reset_partition(&mut self, _rank: u32, _world_size: u32) -> Result<()> {
        Err(SplitError::config(
            "reset_partition is not supported on a cached split",
        ))
    }

    fn hint_chunk_size(&mut self, bytes: usize) {
        self.inner.hint_chunk_size(bytes);
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }
}
