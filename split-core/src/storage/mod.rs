// split-core/src/storage/mod.rs

//! Storage abstraction for input splits.
//!
//! Splits read through the [`FileSystem`] trait, so the same partitioning and
//! record framing works over the local disk, an in-memory store, or any
//! backend registered with a [`Runtime`](crate::Runtime) under its scheme.
//!
//! # Example
//!
//! ```no_run
//! use split_core::storage::{FileSystem, LocalFileSystem, Uri};
//! use std::io::Read;
//!
//! let fs = LocalFileSystem::default();
//! let uri = Uri::parse("/data/train.txt");
//! let size = fs.stat(&uri).unwrap().size;
//!
//! let mut stream = fs.open_at(&uri, size / 2).unwrap();
//! let mut tail = Vec::new();
//! stream.read_to_end(&mut tail).unwrap();
//! ```

mod local;
mod memory;
mod traits;
mod uri;

pub use local::LocalFileSystem;
pub use memory::MemoryFileSystem;
pub use traits::{FileInfo, FileKind, FileSystem, ReadStream};
pub use uri::{split_paths, Uri, UriSpec};
