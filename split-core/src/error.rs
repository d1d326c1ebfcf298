// split-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SplitError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Format error: {message}")]
    Format {
        message: String,
    },

    #[error("Rank {rank} out of range (world size: {world_size})")]
    InvalidPartition {
        rank: u32,
        world_size: u32,
    },

    #[error("Pipeline error: {message}")]
    Pipeline {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, SplitError>;

// Convenience constructors
impl SplitError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub fn invalid_partition(rank: u32, world_size: u32) -> Self {
        Self::InvalidPartition { rank, world_size }
    }

    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    /// Checks `rank < world_size` and `world_size > 0`.
    pub fn check_partition(rank: u32, world_size: u32) -> Result<()> {
        if world_size == 0 || rank >= world_size {
            return Err(Self::invalid_partition(rank, world_size));
        }
        Ok(())
    }
}
