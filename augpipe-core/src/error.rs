// augpipe-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrefetchError {

    #[error("Allocation of {bytes} bytes failed on '{backend}' backend: {message}")]
    Allocation {
        backend: String,
        bytes: usize,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Device '{device}' error: {message}")]
    Device {
        device: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Metadata error: {message}")]
    Metadata {
        message: String,
    },

    #[error("Producer error: {message}")]
    Producer {
        message: String,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

pub type Result<T> = std::result::Result<T, PrefetchError>;

// Convenience constructors
impl PrefetchError {

    pub fn allocation(
        backend: impl Into<String>,
        bytes: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::Allocation {
            backend: backend.into(),
            bytes,
            message: message.into(),
            source: None,
        }
    }

    pub fn allocation_with_source(
        backend: impl Into<String>,
        bytes: usize,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Allocation {
            backend: backend.into(),
            bytes,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            message: message.into(),
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

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }

    pub fn producer(message: impl Into<String>) -> Self {
        Self::Producer {
            message: message.into(),
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

    /// Returns true if this error came from a failed allocation.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::Allocation { .. })
    }
}
