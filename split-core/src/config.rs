// split-core/src/config.rs

//! Configuration management for input splits.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, SplitError};

// Top-level split configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub storage: StorageConfig,
    pub split: ReaderConfig,
    pub indexed: IndexedConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Buffer size in bytes for stream reads.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O for local files.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

/// Chunking and prefetch options shared by every split.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Initial chunk capacity in bytes. Grows when a single record does not fit.
    pub chunk_size: usize,
    /// Number of chunks the background producer may queue ahead of the consumer.
    pub prefetch_capacity: usize,
    /// Whether to read chunks on a background thread.
    pub threaded: bool,
    /// Whether directories in a file set are walked recursively.
    pub recurse_directories: bool,
}

/// Options for indexed RecordIO splits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexedConfig {
    /// Records per chunk.
    pub batch_size: usize,
    /// Whether records are visited in a seeded random order.
    pub shuffle: bool,
    /// Seed for the shuffle permutation.
    pub seed: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024, // 8 MB
            prefetch_capacity: 8,
            threaded: true,
            recurse_directories: false,
        }
    }
}

impl Default for IndexedConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            shuffle: false,
            seed: 0,
        }
    }
}

impl FromStr for SplitConfig {
    type Err = SplitError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| SplitError::config_with_source("failed to parse TOML config", e))
    }
}

fn env_parse<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(v) = val.parse() {
            *slot = v;
        }
    }
}

impl SplitConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SplitError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `SPLIT_`. For example:
    // - `SPLIT_STORAGE_BUFFER_SIZE` overrides `storage.buffer_size`
    // - `SPLIT_CHUNK_SIZE` overrides `split.chunk_size`
    // - `SPLIT_INDEXED_SHUFFLE` overrides `indexed.shuffle`
    //
    // Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        env_parse("SPLIT_STORAGE_BUFFER_SIZE", &mut self.storage.buffer_size);
        env_parse("SPLIT_STORAGE_USE_MMAP", &mut self.storage.use_mmap);
        env_parse("SPLIT_STORAGE_MMAP_THRESHOLD", &mut self.storage.mmap_threshold);

        // Split overrides
        env_parse("SPLIT_CHUNK_SIZE", &mut self.split.chunk_size);
        env_parse("SPLIT_PREFETCH_CAPACITY", &mut self.split.prefetch_capacity);
        env_parse("SPLIT_THREADED", &mut self.split.threaded);
        env_parse("SPLIT_RECURSE_DIRECTORIES", &mut self.split.recurse_directories);

        // Indexed overrides
        env_parse("SPLIT_INDEXED_BATCH_SIZE", &mut self.indexed.batch_size);
        env_parse("SPLIT_INDEXED_SHUFFLE", &mut self.indexed.shuffle);
        env_parse("SPLIT_INDEXED_SEED", &mut self.indexed.seed);

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(SplitError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }
        if self.split.chunk_size < 8 {
            return Err(SplitError::config(
                "split.chunk_size must be at least 8 bytes",
            ));
        }
        if self.split.prefetch_capacity == 0 {
            return Err(SplitError::config(
                "split.prefetch_capacity must be greater than 0",
            ));
        }
        if self.indexed.batch_size == 0 {
            return Err(SplitError::config(
                "indexed.batch_size must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SplitConfig::default();

        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert!(config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 1024 * 1024);

        assert_eq!(config.split.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.split.prefetch_capacity, 8);
        assert!(config.split.threaded);
        assert!(!config.split.recurse_directories);

        assert_eq!(config.indexed.batch_size, 256);
        assert!(!config.indexed.shuffle);
        assert_eq!(config.indexed.seed, 0);
    }

    #[test]
    fn test_default_validates() {
        assert!(SplitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: SplitConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [split]
            chunk_size = 4096
            threaded = false
        "#;
        let config: SplitConfig = toml.parse().unwrap();

        assert_eq!(config.split.chunk_size, 4096);
        assert!(!config.split.threaded);
        // Other fields keep their defaults
        assert_eq!(config.split.prefetch_capacity, 8);
        assert_eq!(config.indexed.batch_size, 256);
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [storage]
            buffer_size = 131072
            use_mmap = false
            mmap_threshold = 2097152

            [split]
            chunk_size = 65536
            prefetch_capacity = 2
            threaded = false
            recurse_directories = true

            [indexed]
            batch_size = 32
            shuffle = true
            seed = 42
        "#;
        let config: SplitConfig = toml.parse().unwrap();

        assert_eq!(config.storage.buffer_size, 131072);
        assert!(!config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 2097152);

        assert_eq!(config.split.chunk_size, 65536);
        assert_eq!(config.split.prefetch_capacity, 2);
        assert!(!config.split.threaded);
        assert!(config.split.recurse_directories);

        assert_eq!(config.indexed.batch_size, 32);
        assert!(config.indexed.shuffle);
        assert_eq!(config.indexed.seed, 42);
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<SplitConfig, _> = "invalid = [".parse();
        assert!(matches!(result, Err(SplitError::Config { .. })));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [indexed]
            seed = 7
            "#
        )
        .unwrap();

        let config = SplitConfig::from_file(file.path()).unwrap();
        assert_eq!(config.indexed.seed, 7);
    }

    #[test]
    fn test_from_file_not_found() {
        let result = SplitConfig::from_file("/nonexistent/split.toml");
        assert!(matches!(result, Err(SplitError::Storage { .. })));
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[split]\nprefetch_capacity = 0").unwrap();
        assert!(SplitConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_invalid_values() {
        let mut config = SplitConfig::default();
        config.storage.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = SplitConfig::default();
        config.split.chunk_size = 4;
        assert!(config.validate().is_err());

        let mut config = SplitConfig::default();
        config.split.prefetch_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = SplitConfig::default();
        config.indexed.batch_size = 0;
        assert!(config.validate().is_err());
    }

    fn clear_split_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("SPLIT_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Env vars are process-global, so every override case lives in one test.
    #[test]
    fn test_env_overrides() {
        clear_split_env_vars();

        std::env::set_var("SPLIT_STORAGE_BUFFER_SIZE", "32768");
        std::env::set_var("SPLIT_CHUNK_SIZE", "1024");
        std::env::set_var("SPLIT_THREADED", "false");
        std::env::set_var("SPLIT_INDEXED_SHUFFLE", "true");
        std::env::set_var("SPLIT_INDEXED_SEED", "12345");

        let config = SplitConfig::default().with_env_overrides();

        assert_eq!(config.storage.buffer_size, 32768);
        assert_eq!(config.split.chunk_size, 1024);
        assert!(!config.split.threaded);
        assert!(config.indexed.shuffle);
        assert_eq!(config.indexed.seed, 12345);

        clear_split_env_vars();

        // Invalid values are ignored
        std::env::set_var("SPLIT_PREFETCH_CAPACITY", "lots");
        let config = SplitConfig::default().with_env_overrides();
        assert_eq!(config.split.prefetch_capacity, 8);

        clear_split_env_vars();
    }
}
