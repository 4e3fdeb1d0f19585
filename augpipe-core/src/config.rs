// augpipe-core/src/config.rs

//! Configuration management for the prefetch ring.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{PrefetchError, Result};
use crate::memory::{DEFAULT_ALIGNMENT, MAX_ALIGNMENT};

// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub buffer: BufferConfig,
    pub metadata: MetadataConfig,
}

/// Memory backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pageable host memory only.
    #[default]
    Host,
    /// Page-aligned host mappings suitable for direct transfer.
    Pinned,
    /// Device sub-buffers plus a pinned host master buffer per slot.
    Device,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Host => "host",
            BackendKind::Pinned => "pinned",
            BackendKind::Device => "device",
        }
    }

    /// Whether slots carry device sub-buffers.
    pub fn requires_device(&self) -> bool {
        matches!(self, BackendKind::Device)
    }
}

impl FromStr for BackendKind {
    type Err = PrefetchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "host" => Ok(BackendKind::Host),
            "pinned" => Ok(BackendKind::Pinned),
            "device" => Ok(BackendKind::Device),
            other => Err(PrefetchError::config(format!(
                "unknown memory backend '{}' (expected host, pinned or device)",
                other
            ))),
        }
    }
}

// Ring buffer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of slots kept in flight (prefetch queue depth).
    pub depth: usize,
    /// Memory backend: "host", "pinned" or "device".
    pub backend: BackendKind,
    /// Device ordinal used when the backend is "device".
    pub device_id: u32,
    // Byte size of each sub-buffer. A single entry is replicated to
    // `sub_buffer_count` entries.
    pub sub_buffer_sizes: Vec<usize>,
    // Number of sub-buffers per slot.
    pub sub_buffer_count: usize,
    // Alignment boundary every allocation is rounded up to.
    pub alignment: usize,
}

// Metadata channel configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Whether the metadata channel is allocated at all.
    pub enabled: bool,
    // Initial packed-label capacity per slot, in bytes.
    pub labels_capacity: usize,
    // Initial packed-box capacity per slot, in bytes.
    pub boxes_capacity: usize,
    // Initial packed-mask capacity per slot, in bytes.
    pub masks_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            depth: 3,
            backend: BackendKind::Host,
            device_id: 0,
            sub_buffer_sizes: vec![1024 * 1024], // 1 MiB
            sub_buffer_count: 1,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            labels_capacity: 1024,
            boxes_capacity: 16 * 1024,
            masks_capacity: 0,
        }
    }
}

impl BufferConfig {
    /// Returns one size per sub-buffer, replicating a single configured
    /// size across `sub_buffer_count`.
    ///
    /// # Errors
    ///
    /// Returns an error if the list length disagrees with the count.
    pub fn resolved_sub_buffer_sizes(&self) -> Result<Vec<usize>> {
        if self.sub_buffer_sizes.len() == 1 && self.sub_buffer_count > 1 {
            return Ok(vec![self.sub_buffer_sizes[0]; self.sub_buffer_count]);
        }
        if self.sub_buffer_sizes.len() != self.sub_buffer_count {
            return Err(PrefetchError::config(format!(
                "buffer.sub_buffer_sizes has {} entries but buffer.sub_buffer_count is {}",
                self.sub_buffer_sizes.len(),
                self.sub_buffer_count
            )));
        }
        Ok(self.sub_buffer_sizes.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(PrefetchError::config("buffer.depth must be greater than 0"));
        }
        if self.sub_buffer_count == 0 {
            return Err(PrefetchError::config(
                "buffer.sub_buffer_count must be greater than 0",
            ));
        }
        let sizes = self.resolved_sub_buffer_sizes()?;
        if sizes.iter().any(|&s| s == 0) {
            return Err(PrefetchError::config(
                "buffer.sub_buffer_sizes entries must be greater than 0",
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(PrefetchError::config(
                "buffer.alignment must be a power of two",
            ));
        }
        if self.alignment > MAX_ALIGNMENT {
            return Err(PrefetchError::config(format!(
                "buffer.alignment must be at most {} bytes",
                MAX_ALIGNMENT
            )));
        }
        Ok(())
    }
}

impl MetadataConfig {
    /// Initial capacities in field order (labels, boxes, masks).
    pub fn field_capacities(&self) -> [usize; 3] {
        [self.labels_capacity, self.boxes_capacity, self.masks_capacity]
    }
}

impl FromStr for PipelineConfig {
    type Err = PrefetchError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| PrefetchError::config_with_source("failed to parse TOML config", e))
    }
}

impl PipelineConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PrefetchError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `AUG_`:
    // - `AUG_BUFFER_DEPTH` overrides `buffer.depth`
    // - `AUG_BUFFER_BACKEND` overrides `buffer.backend` ("host", "pinned", "device")
    // - `AUG_BUFFER_SUB_BUFFER_SIZES` overrides `buffer.sub_buffer_sizes` (comma separated)
    // - `AUG_METADATA_ENABLED` overrides `metadata.enabled`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Buffer overrides
        if let Ok(val) = std::env::var("AUG_BUFFER_DEPTH") {
            if let Ok(v) = val.parse() {
                self.buffer.depth = v;
            }
        }
        if let Ok(val) = std::env::var("AUG_BUFFER_BACKEND") {
            if let Ok(v) = val.parse() {
                self.buffer.backend = v;
            }
        }
        if let Ok(val) = std::env::var("AUG_BUFFER_DEVICE_ID") {
            if let Ok(v) = val.parse() {
                self.buffer.device_id = v;
            }
        }
        if let Ok(val) = std::env::var("AUG_BUFFER_SUB_BUFFER_SIZES") {
            let parsed: std::result::Result<Vec<usize>, _> =
                val.split(',').map(|s| s.trim().parse()).collect();
            if let Ok(v) = parsed {
                self.buffer.sub_buffer_sizes = v;
            }
        }
        if let Ok(val) = std::env::var("AUG_BUFFER_SUB_BUFFER_COUNT") {
            if let Ok(v) = val.parse() {
                self.buffer.sub_buffer_count = v;
            }
        }
        if let Ok(val) = std::env::var("AUG_BUFFER_ALIGNMENT") {
            if let Ok(v) = val.parse() {
                self.buffer.alignment = v;
            }
        }

        // Metadata overrides
        if let Ok(val) = std::env::var("AUG_METADATA_ENABLED") {
            if let Ok(v) = val.parse() {
                self.metadata.enabled = v;
            }
        }
        if let Ok(val) = std::env::var("AUG_METADATA_LABELS_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.metadata.labels_capacity = v;
            }
        }
        if let Ok(val) = std::env::var("AUG_METADATA_BOXES_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.metadata.boxes_capacity = v;
            }
        }
        if let Ok(val) = std::env::var("AUG_METADATA_MASKS_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.metadata.masks_capacity = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        self.buffer.validate()
    }
}
