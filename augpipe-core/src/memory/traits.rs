// augpipe-core/src/memory/traits.rs

//! The memory backend capability chosen at ring initialization.

use std::fmt;

use super::device::DeviceBuffer;
use super::host::HostBuffer;
use crate::config::BackendKind;
use crate::error::Result;

/// Allocation, release and transfer of slot memory.
///
/// One implementation serves every slot of a ring; the ring never branches on
/// the backend type beyond asking [`BackendKind::requires_device`] whether
/// device sub-buffers should be allocated.
///
/// # Object Safety
///
/// This trait is object-safe and is held as `Arc<dyn MemoryBackend>`.
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Alignment every allocation is rounded up to.
    fn alignment(&self) -> usize;

    /// Allocates a zeroed host buffer of at least `bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the memory cannot be obtained.
    fn allocate_host(&self, bytes: usize) -> Result<HostBuffer>;

    /// Allocates a device region of at least `bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the device is out of memory or the
    /// backend has no device.
    fn allocate_device(&self, bytes: usize) -> Result<DeviceBuffer>;

    /// Frees a device region previously returned by `allocate_device`.
    ///
    /// # Errors
    ///
    /// Returns a device error if the device rejects the free.
    fn free_device(&self, buffer: DeviceBuffer) -> Result<()>;

    /// Copies the first `dst.len()` bytes of `src` into host memory.
    fn copy_to_host(&self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<()>;

    /// Copies `src` into the start of the device region `dst`.
    fn copy_to_device(&self, src: &[u8], dst: &DeviceBuffer) -> Result<()>;
}
