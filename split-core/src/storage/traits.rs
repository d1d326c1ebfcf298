// split-core/src/storage/traits.rs

//! The storage capability consumed by input splits.
//!
//! A backend only has to answer three questions: how large is a path, what
//! is inside a directory, and give me the bytes of a file starting at an
//! offset. Everything else (partitioning, record framing, prefetch) is built
//! on top of these operations.

use std::io::Read;

use super::uri::Uri;
use crate::error::Result;

/// Whether a listed entry is a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Metadata about a stored path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: Uri,
    /// Size in bytes. Zero for directories.
    pub size: u64,
    pub kind: FileKind,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// A forward-only byte stream opened by a backend.
pub trait ReadStream: Read + Send {}

impl<T: Read + Send> ReadStream for T {}

/// The core storage backend trait.
///
/// # Object Safety
///
/// This trait is object-safe and is shared as `Arc<dyn FileSystem>`; a
/// backend lives as long as the last split that reads from it.
pub trait FileSystem: Send + Sync {
    /// Retrieves metadata for a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or cannot be inspected.
    fn stat(&self, path: &Uri) -> Result<FileInfo>;

    /// Lists the direct children of a directory, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not a directory or listing fails.
    fn list(&self, dir: &Uri) -> Result<Vec<FileInfo>>;

    /// Opens a file for reading, positioned at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or positioned.
    fn open_at(&self, path: &Uri, offset: u64) -> Result<Box<dyn ReadStream>>;
}
