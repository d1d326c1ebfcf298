// split-core/src/lib.rs

//! Split Core - distributed input splitting
//!
//! This crate partitions a set of files among the workers of a distributed
//! job and serves each worker its share as whole records. It provides
//! storage backends, record-aligned partitioning for text and RecordIO data,
//! a background prefetch pipeline, and the RecordIO codec.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::SplitConfig;
pub use error::{Result, SplitError};
pub use storage::{FileInfo, FileSystem, LocalFileSystem, MemoryFileSystem, Uri, UriSpec};

pub mod recordio;
pub use recordio::{RecordIoReader, RecordIoWriter, RECORDIO_MAGIC};

pub mod threaded_iter;
pub use threaded_iter::{Producer, Recycler, ThreadedIter};

pub mod split;
pub use split::{InputSplit, Partition, RecordFormat};

pub mod runtime;
pub use runtime::{create, Runtime, SplitOptions};
