// split-core/src/split/sharding.rs

use tracing::{debug, trace};

use crate::error::{Result, SplitError};
use crate::storage::{FileInfo, FileSystem, Uri};

/// An ordered list of files read as one virtual concatenation.
///
/// `offsets[i]` is the position of file `i` in the concatenation and
/// `offsets[len]` is the total size.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    files: Vec<FileInfo>,
    offsets: Vec<u64>,
}

impl FileSet {
    /// Builds a file set from already-resolved files, dropping empty ones.
    pub fn from_files(files: Vec<FileInfo>) -> Self {
        let files: Vec<FileInfo> = files
            .into_iter()
            .filter(|f| !f.is_dir() && f.size != 0)
            .collect();
        let mut offsets = Vec::with_capacity(files.len() + 1);
        let mut total = 0u64;
        offsets.push(0);
        for file in &files {
            total += file.size;
            offsets.push(total);
        }
        Self { files, offsets }
    }

    /// Resolves `paths` against `fs`, expanding directories.
    ///
    /// Sub-directories are walked depth-first in sorted order when `recurse`
    /// is set and skipped otherwise.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the paths match no file at all, and
    /// storage errors from `fs`.
    pub fn expand(fs: &dyn FileSystem, paths: &[Uri], recurse: bool) -> Result<Self> {
        let mut found = Vec::new();
        for path in paths {
            let info = fs.stat(path)?;
            if info.is_dir() {
                collect_dir(fs, &info.path, recurse, &mut found)?;
            } else {
                found.push(info);
            }
        }
        if found.is_empty() {
            let names: Vec<String> = paths.iter().map(ToString::to_string).collect();
            return Err(SplitError::config(format!(
                "cannot find any files matching '{}'",
                names.join(";")
            )));
        }
        let set = Self::from_files(found);
        debug!(files = set.len(), total = set.total_size(), "resolved file set");
        Ok(set)
    }

    /// Checks every file size against the format's alignment.
    pub fn check_alignment(&self, align_bytes: u64) -> Result<()> {
        for file in &self.files {
            if file.size % align_bytes != 0 {
                return Err(SplitError::config(format!(
                    "file '{}' of {} bytes is not aligned to {} bytes",
                    file.path, file.size, align_bytes
                )));
            }
        }
        Ok(())
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    /// Start offset of every file in the concatenated set, followed by the
    /// total size.
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Index of the file holding byte `offset`. Offsets at or past the end
    /// map to `len()`.
    pub fn file_index_at(&self, offset: u64) -> usize {
        // First offset strictly greater than `offset`, minus one.
        self.offsets.partition_point(|&o| o <= offset).saturating_sub(1)
    }
}

fn collect_dir(
    fs: &dyn FileSystem,
    dir: &Uri,
    recurse: bool,
    out: &mut Vec<FileInfo>,
) -> Result<()> {
    for entry in fs.list(dir)? {
        if entry.is_dir() {
            if recurse {
                trace!(dir = %entry.path, "descending into directory");
                collect_dir(fs, &entry.path, recurse, out)?;
            }
        } else {
            out.push(entry);
        }
    }
    Ok(())
}

/// The `[begin, end)` byte range of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Partition {
    pub begin: u64,
    pub end: u64,
}

impl Partition {
    /// Nominal range of `rank` among `world_size` workers over `total` bytes,
    /// before record realignment.
    ///
    /// The step is `ceil(total / world_size)` rounded up to `align_bytes`;
    /// trailing ranks may receive empty ranges.
    pub fn compute(total: u64, rank: u32, world_size: u32, align_bytes: u64) -> Result<Self> {
        SplitError::check_partition(rank, world_size)?;
        let align = align_bytes.max(1);
        let step = total.div_ceil(u64::from(world_size)).div_ceil(align) * align;
        Ok(Self {
            begin: (step * u64::from(rank)).min(total),
            end: (step * (u64::from(rank) + 1)).min(total),
        })
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
}
