// split-core/src/storage/local.rs

//! Local filesystem backend.
//!
//! Small files are read through a buffered handle; files above the configured
//! threshold are memory-mapped and served straight from the mapping.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};

use memmap2::Mmap;

use super::traits::{FileInfo, FileKind, FileSystem, ReadStream};
use super::uri::Uri;
use crate::config::StorageConfig;
use crate::error::{Result, SplitError};

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    /// Buffer size for buffered reads.
    buffer_size: usize,
    /// Whether to use memory-mapped I/O.
    use_mmap: bool,
    /// File size threshold above which to use mmap.
    mmap_threshold: u64,
}

impl LocalFileSystem {
    /// A backend using the buffer and mmap settings of `config`.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            buffer_size: config.buffer_size.max(1),
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        }
    }
}

impl Default for LocalFileSystem {
    fn default() -> Self {
        Self::new(&StorageConfig::default())
    }
}

fn info_from_metadata(path: Uri, meta: &fs::Metadata) -> FileInfo {
    if meta.is_dir() {
        FileInfo { path, size: 0, kind: FileKind::Directory }
    } else {
        FileInfo { path, size: meta.len(), kind: FileKind::File }
    }
}

impl FileSystem for LocalFileSystem {
    fn stat(&self, path: &Uri) -> Result<FileInfo> {
        let local = path.local_path();
        let meta = fs::metadata(&local)
            .map_err(|e| SplitError::storage_with_source(&local, "failed to read metadata", e))?;
        Ok(info_from_metadata(path.clone(), &meta))
    }

    fn list(&self, dir: &Uri) -> Result<Vec<FileInfo>> {
        let local = dir.local_path();
        if !local.is_dir() {
            return Err(SplitError::storage(&local, "path is not a directory"));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&local)
            .map_err(|e| SplitError::storage_with_source(&local, "failed to read directory", e))?
        {
            let entry = entry.map_err(|e| {
                SplitError::storage_with_source(&local, "failed to read directory entry", e)
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                return Err(SplitError::storage(
                    &local,
                    format!("directory entry {file_name:?} is not valid UTF-8"),
                ));
            };
            // Follows symlinks, unlike DirEntry::metadata.
            let meta = fs::metadata(entry.path()).map_err(|e| {
                SplitError::storage_with_source(entry.path(), "failed to read metadata", e)
            })?;
            entries.push(info_from_metadata(dir.join(name), &meta));
        }

        entries.sort_by(|a, b| a.path.name.cmp(&b.path.name));
        Ok(entries)
    }

    fn open_at(&self, path: &Uri, offset: u64) -> Result<Box<dyn ReadStream>> {
        let local = path.local_path();
        let mut file = File::open(&local)
            .map_err(|e| SplitError::storage_with_source(&local, "failed to open file", e))?;
        let size = file
            .metadata()
            .map_err(|e| SplitError::storage_with_source(&local, "failed to read file metadata", e))?
            .len();

        if self.use_mmap && size > 0 && size >= self.mmap_threshold {
            // SAFETY: The file is opened read-only and the mapping is owned by
            // the stream for its whole lifetime.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                SplitError::storage_with_source(&local, "failed to memory-map file", e)
            })?;
            let pos = usize::try_from(offset.min(size)).unwrap_or(usize::MAX);
            return Ok(Box::new(MmapStream { mmap, pos }));
        }

        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).map_err(|e| {
                SplitError::storage_with_source(&local, format!("failed to seek to {offset}"), e)
            })?;
        }
        Ok(Box::new(BufReader::with_capacity(self.buffer_size, file)))
    }
}

/// Memory-mapped file stream.
struct MmapStream {
    mmap: Mmap,
    pos: usize,
}

impl Read for MmapStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.mmap.get(self.pos..).unwrap_or_default();
        let to_read = buf.len().min(remaining.len());
        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.pos += to_read;
        Ok(to_read)
    }
}
