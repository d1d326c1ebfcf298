// split-core/src/storage/memory.rs

//! In-memory storage backend.
//!
//! Files are keyed by the path component of their [`Uri`]; directories exist
//! implicitly whenever some file lives below them. Useful for tests and for
//! embedding small datasets without touching disk.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, RwLock};

use super::traits::{FileInfo, FileKind, FileSystem, ReadStream};
use super::uri::Uri;
use crate::error::{Result, SplitError};

#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: RwLock<BTreeMap<String, Arc<[u8]>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` at `path`, replacing any previous contents.
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        let key = Uri::parse(path).name;
        let data: Vec<u8> = data.into();
        let data: Arc<[u8]> = data.into();
        if let Ok(mut files) = self.files.write() {
            files.insert(key, data);
        }
    }

    fn dir_prefix(name: &str) -> String {
        format!("{}/", name.trim_end_matches('/'))
    }

    fn poisoned(path: &Uri) -> SplitError {
        SplitError::storage(path.to_string(), "memory filesystem lock poisoned")
    }
}

impl FileSystem for MemoryFileSystem {
    fn stat(&self, path: &Uri) -> Result<FileInfo> {
        let files = self.files.read().map_err(|_| Self::poisoned(path))?;
        if let Some(data) = files.get(&path.name) {
            return Ok(FileInfo {
                path: path.clone(),
                size: data.len() as u64,
                kind: FileKind::File,
            });
        }
        let prefix = Self::dir_prefix(&path.name);
        if files.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(FileInfo {
                path: path.clone(),
                size: 0,
                kind: FileKind::Directory,
            });
        }
        Err(SplitError::storage(path.to_string(), "no such file or directory"))
    }

    fn list(&self, dir: &Uri) -> Result<Vec<FileInfo>> {
        let files = self.files.read().map_err(|_| Self::poisoned(dir))?;
        let prefix = Self::dir_prefix(&dir.name);

        let mut children: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (key, data) in files.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((sub, _)) => {
                    children.entry(sub.to_string()).or_insert_with(|| FileInfo {
                        path: dir.join(sub),
                        size: 0,
                        kind: FileKind::Directory,
                    });
                }
                None => {
                    children.insert(
                        rest.to_string(),
                        FileInfo {
                            path: dir.join(rest),
                            size: data.len() as u64,
                            kind: FileKind::File,
                        },
                    );
                }
            }
        }

        if children.is_empty() {
            return Err(SplitError::storage(dir.to_string(), "path is not a directory"));
        }
        Ok(children.into_values().collect())
    }

    fn open_at(&self, path: &Uri, offset: u64) -> Result<Box<dyn ReadStream>> {
        let files = self.files.read().map_err(|_| Self::poisoned(path))?;
        let data = files
            .get(&path.name)
            .cloned()
            .ok_or_else(|| SplitError::storage(path.to_string(), "no such file"))?;
        let mut cursor = Cursor::new(data);
        cursor.set_position(offset);
        Ok(Box::new(cursor))
    }
}
