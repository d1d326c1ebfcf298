// split-core/src/runtime.rs

//! Split construction and storage backend registry.
//!
//! The `Runtime` owns the configuration and the set of storage backends, and
//! turns a dataset uri into a ready-to-read [`InputSplit`].
//!
//! # Example
//!
//! ```no_run
//! use split_core::{InputSplit, Runtime};
//!
//! let runtime = Runtime::new().unwrap();
//!
//! // Rank 2 of 8 over every file in a directory plus one extra file.
//! let mut split = runtime
//!     .create_split("/data/train;/data/extra.txt", 2, 8, "text")
//!     .unwrap();
//! while let Some(line) = split.next_record().unwrap() {
//!     // Parse line
//! }
//!
//! // Byte ranges of every rank, after record realignment.
//! let partitions = runtime.partitions("/data/train", 8, "text").unwrap();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SplitConfig;
use crate::error::{Result, SplitError};
use crate::split::{
    CachedSplit, FileSet, IndexedCursor, InputSplit, Partition, RecordFormat, RecordIndex,
    SingleThreadedSplit, SplitReader, StreamSplit, ThreadedSplit,
};
use crate::storage::{split_paths, FileSystem, LocalFileSystem, Uri, UriSpec};

/// Uri naming the process's standard input.
pub const STDIN_URI: &str = "stdin";

/// Per-split settings, seeded from [`SplitConfig`] and overridable through
/// `?key=value` uri arguments.
#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub format: RecordFormat,
    /// Side index, required for indexed RecordIO.
    pub index_uri: Option<String>,
    pub threaded: bool,
    pub chunk_size: usize,
    pub prefetch_capacity: usize,
    pub recurse_directories: bool,
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl SplitOptions {
    /// Options for `format` with every other setting taken from `config`.
    pub fn from_config(config: &SplitConfig, format: RecordFormat) -> Self {
        Self {
            format,
            index_uri: None,
            threaded: config.split.threaded,
            chunk_size: config.split.chunk_size,
            prefetch_capacity: config.split.prefetch_capacity,
            recurse_directories: config.split.recurse_directories,
            batch_size: config.indexed.batch_size,
            shuffle: config.indexed.shuffle,
            seed: config.indexed.seed,
        }
    }

    /// Applies `?key=value` arguments from a dataset uri.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a known key has an invalid value.
    pub fn apply_args(&mut self, args: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in args {
            match key.as_str() {
                "format" => self.format = value.parse()?,
                "index" | "index_uri" => self.index_uri = Some(value.clone()),
                "threaded" => self.threaded = parse_flag(key, value)?,
                "chunk_size" => self.chunk_size = parse_arg(key, value)?,
                "prefetch_capacity" => self.prefetch_capacity = parse_arg(key, value)?,
                "recurse" | "recurse_directories" => {
                    self.recurse_directories = parse_flag(key, value)?
                }
                "batch_size" => self.batch_size = parse_arg(key, value)?,
                "shuffle" => self.shuffle = parse_flag(key, value)?,
                "seed" => self.seed = parse_arg(key, value)?,
                _ => warn!(key = %key, "ignoring unknown uri argument"),
            }
        }
        Ok(())
    }
}

fn parse_arg<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| SplitError::config(format!("invalid value '{value}' for uri argument '{key}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => parse_arg(key, value),
    }
}

/// Builds input splits over registered storage backends.
pub struct Runtime {
    config: SplitConfig,
    backends: HashMap<String, Arc<dyn FileSystem>>,
}

impl Runtime {
    /// Creates a runtime with default configuration and the local backend.
    pub fn new() -> Result<Self> {
        Self::from_config(SplitConfig::default())
    }

    /// Creates a runtime from a TOML configuration file, with `SPLIT_*`
    /// environment overrides applied after loading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = SplitConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config)
    }

    /// Creates a runtime from a configuration.
    ///
    /// Bare paths and `file://` uris resolve to a [`LocalFileSystem`] built
    /// from `config.storage`.
    pub fn from_config(config: SplitConfig) -> Result<Self> {
        config.validate()?;
        let local: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(&config.storage));
        let mut backends = HashMap::new();
        backends.insert(String::new(), Arc::clone(&local));
        backends.insert("file".to_string(), local);
        Ok(Self { config, backends })
    }

    /// Serves uris with `scheme://` from `fs`, replacing any previous backend.
    pub fn register_backend(&mut self, scheme: impl Into<String>, fs: Arc<dyn FileSystem>) {
        let scheme = scheme.into();
        debug!(scheme = %scheme, "registered storage backend");
        self.backends.insert(scheme, fs);
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// The backend serving `uri`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unregistered scheme.
    pub fn backend(&self, uri: &Uri) -> Result<Arc<dyn FileSystem>> {
        self.backends.get(uri.scheme()).cloned().ok_or_else(|| {
            SplitError::config(format!(
                "unknown filesystem protocol '{}' in '{uri}'",
                uri.protocol
            ))
        })
    }

    /// Creates partition `rank` of `world_size` over `uri` in the format named
    /// by `format_hint`, with settings from the runtime's configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown format, plus everything
    /// [`create_split_with`](Self::create_split_with) can return.
    pub fn create_split(
        &self,
        uri: &str,
        rank: u32,
        world_size: u32,
        format_hint: &str,
    ) -> Result<Box<dyn InputSplit>> {
        let format = format_hint.parse()?;
        let options = SplitOptions::from_config(&self.config, format);
        self.create_split_with(uri, rank, world_size, options)
    }

    /// Creates a split with explicit options.
    ///
    /// `uri` may list several paths separated by `;` or `,`, carry
    /// `?key=value` arguments that override `options`, and end in `#cachefile`
    /// to cache the partition locally after the first pass. The uri `stdin`
    /// reads standard input as text.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for malformed uris, unknown schemes or
    /// formats, and a missing index; partition errors for an invalid rank; and
    /// storage errors from resolving the file set.
    pub fn create_split_with(
        &self,
        uri: &str,
        rank: u32,
        world_size: u32,
        mut options: SplitOptions,
    ) -> Result<Box<dyn InputSplit>> {
        SplitError::check_partition(rank, world_size)?;
        if uri == STDIN_URI {
            return self.stdin_split(rank, world_size, &options);
        }

        let spec = UriSpec::parse(uri, rank, world_size)?;
        options.apply_args(&spec.args)?;
        let reader = self.build_reader(&spec, &options, rank, world_size)?;
        debug!(
            uri,
            rank,
            world_size,
            format = %options.format,
            threaded = options.threaded,
            cached = spec.cache_file.is_some(),
            "created split"
        );

        if let Some(cache_file) = spec.cache_file {
            return Ok(Box::new(CachedSplit::new(
                reader,
                cache_file,
                options.prefetch_capacity,
            )?));
        }
        if options.threaded {
            Ok(Box::new(ThreadedSplit::new(
                reader,
                options.prefetch_capacity,
            )?))
        } else {
            Ok(Box::new(SingleThreadedSplit::new(reader)))
        }
    }

    /// Realigned byte ranges of every rank in a `world_size`-way split.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`create_split_with`](Self::create_split_with),
    /// and a partition error if `world_size` is 0.
    pub fn partitions(
        &self,
        uri: &str,
        world_size: u32,
        format_hint: &str,
    ) -> Result<Vec<Partition>> {
        SplitError::check_partition(0, world_size)?;
        let format = format_hint.parse()?;
        let mut options = SplitOptions::from_config(&self.config, format);
        let spec = UriSpec::parse(uri, 0, world_size)?;
        options.apply_args(&spec.args)?;

        let mut reader = self.build_reader(&spec, &options, 0, world_size)?;
        let mut partitions = vec![reader.partition()];
        for rank in 1..world_size {
            reader.reset_partition(rank, world_size)?;
            partitions.push(reader.partition());
        }
        Ok(partitions)
    }

    fn stdin_split(
        &self,
        rank: u32,
        world_size: u32,
        options: &SplitOptions,
    ) -> Result<Box<dyn InputSplit>> {
        if options.format != RecordFormat::Line {
            return Err(SplitError::config("stdin can only be read as text"));
        }
        let mut split = StreamSplit::stdin(options.chunk_size);
        split.reset_partition(rank, world_size)?;
        Ok(Box::new(split))
    }

    fn build_reader(
        &self,
        spec: &UriSpec,
        options: &SplitOptions,
        rank: u32,
        world_size: u32,
    ) -> Result<SplitReader> {
        let paths = spec.paths();
        let fs = self.backend_for_all(&paths)?;
        let files = FileSet::expand(fs.as_ref(), &paths, options.recurse_directories)?;

        if options.format != RecordFormat::IndexedRecordIo {
            return SplitReader::new(
                fs,
                files,
                options.format,
                options.chunk_size,
                rank,
                world_size,
            );
        }

        let index_uri = options.index_uri.as_deref().ok_or_else(|| {
            SplitError::config("indexed_recordio needs an index file (uri argument 'index')")
        })?;
        let index_paths = split_paths(index_uri);
        let [index_path] = index_paths.as_slice() else {
            return Err(SplitError::config(format!(
                "indexed_recordio takes exactly one index file, got '{index_uri}'"
            )));
        };
        let index_fs = self.backend(index_path)?;
        let index = RecordIndex::load(index_fs.as_ref(), index_path, files.total_size())?;
        let cursor = IndexedCursor::new(index, options.batch_size, options.shuffle, options.seed);
        SplitReader::new_indexed(fs, files, cursor, options.chunk_size, rank, world_size)
    }

    /// The single backend serving every path of a file set.
    fn backend_for_all(&self, paths: &[Uri]) -> Result<Arc<dyn FileSystem>> {
        let Some(first) = paths.first() else {
            return Err(SplitError::config("dataset uri names no paths"));
        };
        if let Some(other) = paths.iter().find(|p| p.scheme() != first.scheme()) {
            return Err(SplitError::config(format!(
                "all paths of a dataset must use one protocol, got '{first}' and '{other}'"
            )));
        }
        self.backend(first)
    }
}

/// Creates a split with the default configuration over the local
/// filesystem.
pub fn create(
    uri: &str,
    rank: u32,
    world_size: u32,
    format_hint: &str,
) -> Result<Box<dyn InputSplit>> {
    Runtime::new()?.create_split(uri, rank, world_size, format_hint)
}
