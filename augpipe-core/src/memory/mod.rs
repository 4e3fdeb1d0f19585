// augpipe-core/src/memory/mod.rs

//! Memory backends for ring slots.
//!
//! A slot owns one host master buffer and zero or more device sub-buffers.
//! Which of those exist, and how they are allocated, freed and copied, is
//! decided once at ring initialization by a [`MemoryBackend`]:
//!
//! - [`HostMemory`] allocates aligned pageable heap memory, or page-aligned
//!   anonymous mappings when configured as `pinned`.
//! - [`DeviceMemory`] allocates device sub-buffers through a
//!   [`DeviceContext`] and a pinned host master buffer for staging.
//!
//! Every allocation is rounded up to the configured alignment boundary.

mod device;
mod host;
mod traits;

pub use device::{DeviceBuffer, DeviceContext, DeviceMemory, DevicePtr, EmulatedDevice};
pub use host::{HostBuffer, HostMemory};
pub use traits::MemoryBackend;

use std::sync::Arc;

use crate::config::{BackendKind, BufferConfig};
use crate::error::{PrefetchError, Result};

/// Default alignment boundary for every slot allocation.
pub const DEFAULT_ALIGNMENT: usize = 256;

/// Largest supported alignment (one page).
pub const MAX_ALIGNMENT: usize = 4096;

/// Rounds `size` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub fn align_up(size: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (size + alignment - 1) & !(alignment - 1)
}

/// Builds the memory backend selected by `config`.
///
/// # Errors
///
/// Returns a configuration error if the device backend is selected without a
/// device context, or if the context is bound to a different device ordinal.
pub fn create_backend(
    config: &BufferConfig,
    device: Option<Arc<dyn DeviceContext>>,
) -> Result<Arc<dyn MemoryBackend>> {
    match config.backend {
        BackendKind::Host => Ok(Arc::new(HostMemory::new(config.alignment))),
        BackendKind::Pinned => Ok(Arc::new(HostMemory::pinned(config.alignment))),
        BackendKind::Device => {
            let device = device.ok_or_else(|| {
                PrefetchError::config("buffer.backend is 'device' but no device context was given")
            })?;
            if device.device_id() != config.device_id {
                return Err(PrefetchError::config(format!(
                    "device context '{}' is bound to device {} but buffer.device_id is {}",
                    device.name(),
                    device.device_id(),
                    config.device_id
                )));
            }
            Ok(Arc::new(DeviceMemory::new(device, config.alignment)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(1000, 64), 1024);
    }

    #[test]
    fn test_create_backend_host() {
        let backend = create_backend(&BufferConfig::default(), None).unwrap();
        assert_eq!(backend.kind(), BackendKind::Host);
    }

    #[test]
    fn test_create_backend_device_requires_context() {
        let config = BufferConfig {
            backend: BackendKind::Device,
            ..Default::default()
        };
        let result = create_backend(&config, None);
        assert!(matches!(result, Err(PrefetchError::Config { .. })));
    }

    #[test]
    fn test_create_backend_device_id_mismatch() {
        let config = BufferConfig {
            backend: BackendKind::Device,
            device_id: 2,
            ..Default::default()
        };
        let device: Arc<dyn DeviceContext> = Arc::new(EmulatedDevice::new(0));
        let err = create_backend(&config, Some(device)).unwrap_err();
        assert!(err.to_string().contains("device 0"));
    }

    #[test]
    fn test_create_backend_device() {
        let config = BufferConfig {
            backend: BackendKind::Device,
            device_id: 1,
            ..Default::default()
        };
        let device: Arc<dyn DeviceContext> = Arc::new(EmulatedDevice::new(1));
        let backend = create_backend(&config, Some(device)).unwrap();
        assert_eq!(backend.kind(), BackendKind::Device);
        assert_eq!(backend.alignment(), DEFAULT_ALIGNMENT);
    }
}
