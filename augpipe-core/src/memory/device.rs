// augpipe-core/src/memory/device.rs

//! Device-resident slot memory.
//!
//! The ring never talks to a GPU runtime directly. It consumes a
//! [`DeviceContext`], which hides whichever device/stream backend is active
//! behind opaque [`DevicePtr`] handles. [`EmulatedDevice`] is a host-backed
//! context for running the device path without hardware.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::align_up;
use super::host::{allocate_pinned, AlignedBytes, HostBuffer};
use super::traits::MemoryBackend;
use crate::config::BackendKind;
use crate::error::{PrefetchError, Result};

/// Opaque handle to a device region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    addr: u64,
    len: usize,
}

impl DevicePtr {
    pub fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }

    /// Device address, meaningful only to the context that issued it.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Handle to the active device and its allocator.
pub trait DeviceContext: Send + Sync + fmt::Debug {
    /// Human-readable name used in errors and logs.
    fn name(&self) -> &str;

    /// Device ordinal.
    fn device_id(&self) -> u32;

    /// Allocates `bytes` bytes with the given alignment.
    fn alloc(&self, bytes: usize, alignment: usize) -> Result<DevicePtr>;

    /// Frees a region returned by `alloc`.
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copies `dst.len()` bytes from the start of `src` to host memory.
    fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()>;

    /// Copies `src` to the start of `dst`.
    fn copy_from_host(&self, src: &[u8], dst: DevicePtr) -> Result<()>;
}

/// A device sub-buffer owned by one slot.
///
/// Deliberately not `Clone`: the slot that owns it is the only party that
/// may hand it back to the backend.
#[derive(Debug)]
pub struct DeviceBuffer {
    ptr: DevicePtr,
    size: usize,
}

impl DeviceBuffer {
    /// The device handle to pass to kernels.
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Requested size in bytes (the region itself may be larger).
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Backend with device sub-buffers and a pinned host master buffer.
#[derive(Debug, Clone)]
pub struct DeviceMemory {
    device: Arc<dyn DeviceContext>,
    alignment: usize,
}

impl DeviceMemory {
    pub fn new(device: Arc<dyn DeviceContext>, alignment: usize) -> Self {
        Self { device, alignment }
    }

    pub fn device(&self) -> &Arc<dyn DeviceContext> {
        &self.device
    }
}

impl MemoryBackend for DeviceMemory {
    fn kind(&self) -> BackendKind {
        BackendKind::Device
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn allocate_host(&self, bytes: usize) -> Result<HostBuffer> {
        allocate_pinned(bytes, self.alignment, self.device.name())
    }

    fn allocate_device(&self, bytes: usize) -> Result<DeviceBuffer> {
        let ptr = self.device.alloc(align_up(bytes, self.alignment), self.alignment)?;
        Ok(DeviceBuffer { ptr, size: bytes })
    }

    fn free_device(&self, buffer: DeviceBuffer) -> Result<()> {
        self.device.free(buffer.ptr)
    }

    fn copy_to_host(&self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<()> {
        self.device.copy_to_host(src.ptr, dst)
    }

    fn copy_to_device(&self, src: &[u8], dst: &DeviceBuffer) -> Result<()> {
        self.device.copy_from_host(src, dst.ptr)
    }
}

const EMULATED_BASE_ADDR: u64 = 0x7f00_0000_0000;

struct EmulatedState {
    next_addr: u64,
    regions: HashMap<u64, AlignedBytes>,
    live_bytes: usize,
    total_allocs: u64,
}

/// Host-backed stand-in for a device, with optional capacity limit.
pub struct EmulatedDevice {
    name: String,
    device_id: u32,
    capacity: Option<usize>,
    state: Mutex<EmulatedState>,
}

impl EmulatedDevice {
    /// An emulated device with unlimited memory.
    pub fn new(device_id: u32) -> Self {
        Self {
            name: format!("emulated:{}", device_id),
            device_id,
            capacity: None,
            state: Mutex::new(EmulatedState {
                next_addr: EMULATED_BASE_ADDR,
                regions: HashMap::new(),
                live_bytes: 0,
                total_allocs: 0,
            }),
        }
    }

    /// An emulated device that refuses allocations past `bytes` live bytes.
    pub fn with_capacity(device_id: u32, bytes: usize) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::new(device_id)
        }
    }

    /// Number of regions currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.lock().regions.len()
    }

    /// Bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.lock().live_bytes
    }

    /// Total successful allocations over the device's lifetime.
    pub fn total_allocations(&self) -> u64 {
        self.lock().total_allocs
    }

    fn lock(&self) -> MutexGuard<'_, EmulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("device_id", &self.device_id)
            .field("capacity", &self.capacity)
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

impl DeviceContext for EmulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn alloc(&self, bytes: usize, alignment: usize) -> Result<DevicePtr> {
        let mut state = self.lock();
        if let Some(capacity) = self.capacity {
            if state.live_bytes + bytes > capacity {
                return Err(PrefetchError::allocation(
                    self.name.as_str(),
                    bytes,
                    format!(
                        "out of device memory ({} of {} bytes in use)",
                        state.live_bytes, capacity
                    ),
                ));
            }
        }
        let region = AlignedBytes::zeroed(bytes, alignment).ok_or_else(|| {
            PrefetchError::allocation(self.name.as_str(), bytes, "host allocator returned null")
        })?;

        let addr = state.next_addr;
        state.next_addr += align_up(bytes.max(1), alignment) as u64;
        state.regions.insert(addr, region);
        state.live_bytes += bytes;
        state.total_allocs += 1;
        Ok(DevicePtr::new(addr, bytes))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.lock();
        match state.regions.remove(&ptr.addr) {
            Some(_) => {
                state.live_bytes -= ptr.len;
                Ok(())
            }
            None => Err(PrefetchError::device(
                self.name.as_str(),
                format!("free of unknown region {:#x}", ptr.addr),
            )),
        }
    }

    fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        let state = self.lock();
        let region = state.regions.get(&src.addr).ok_or_else(|| {
            PrefetchError::device(
                self.name.as_str(),
                format!("read of unknown region {:#x}", src.addr),
            )
        })?;
        if dst.len() > region.as_slice().len() {
            return Err(PrefetchError::device(
                self.name.as_str(),
                format!("copy of {} bytes exceeds region of {} bytes", dst.len(), src.len),
            ));
        }
        dst.copy_from_slice(&region.as_slice()[..dst.len()]);
        Ok(())
    }

    fn copy_from_host(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        let mut state = self.lock();
        let region = state.regions.get_mut(&dst.addr).ok_or_else(|| {
            PrefetchError::device(
                self.name.as_str(),
                format!("write to unknown region {:#x}", dst.addr),
            )
        })?;
        if src.len() > region.as_slice().len() {
            return Err(PrefetchError::device(
                self.name.as_str(),
                format!("copy of {} bytes exceeds region of {} bytes", src.len(), dst.len),
            ));
        }
        region.as_mut_slice()[..src.len()].copy_from_slice(src);
        Ok(())
    }
}
