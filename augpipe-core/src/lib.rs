// augpipe-core/src/lib.rs

//! Augmentation Pipeline - Prefetch Ring Core
//!
//! This crate provides the bounded slot ring that sits between a data
//! augmentation pipeline and a training loop, including memory backends
//! for host and device slot buffers, the metadata channel that carries
//! labels and boxes alongside each batch, and a background prefetcher.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{BackendKind, BufferConfig, MetadataConfig, PipelineConfig};
pub use error::{PrefetchError, Result};

pub mod memory;
pub use memory::{
    align_up, DeviceBuffer, DeviceContext, DeviceMemory, DevicePtr, EmulatedDevice, HostBuffer,
    HostMemory, MemoryBackend, DEFAULT_ALIGNMENT,
};

pub mod metadata;
pub use metadata::{
    AnnotationBatch, BoundingBox, MetadataChannel, MetadataField, MetadataRecord,
    SampleAnnotation,
};

pub mod ring;
pub use ring::{ReadSlot, RingBuffer, RingStats, RunState, SlotState, WaitStatus, WriteSlot};

pub mod prefetch;
pub use prefetch::{AsyncBatchReader, BatchProducer, ProducedBatch, Prefetcher};
