// augpipe-core/src/memory/host.rs

//! Host-resident slot memory.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use memmap2::MmapMut;

use super::align_up;
use super::device::DeviceBuffer;
use super::traits::MemoryBackend;
use crate::config::BackendKind;
use crate::error::{PrefetchError, Result};

/// A zeroed heap allocation with a caller-chosen alignment.
pub(crate) struct AlignedBytes {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: AlignedBytes uniquely owns its allocation; access goes through
// `&self`/`&mut self` like a `Box<[u8]>`.
unsafe impl Send for AlignedBytes {}
unsafe impl Sync for AlignedBytes {}

impl AlignedBytes {
    /// Allocates `len` zeroed bytes aligned to `alignment`, or `None` if the
    /// allocator refuses.
    pub(crate) fn zeroed(len: usize, alignment: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len.max(1), alignment).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, len, layout })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `len` initialized (zeroed) bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for `len` bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBytes {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

enum HostStorage {
    Heap(AlignedBytes),
    Pinned(MmapMut),
}

/// The host master buffer of one slot.
pub struct HostBuffer {
    storage: HostStorage,
}

impl HostBuffer {
    /// Returns the buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            HostStorage::Heap(bytes) => bytes.as_slice(),
            HostStorage::Pinned(map) => &map[..],
        }
    }

    /// Returns the buffer contents for writing.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            HostStorage::Heap(bytes) => bytes.as_mut_slice(),
            HostStorage::Pinned(map) => &mut map[..],
        }
    }

    /// Start address of the allocation; stable for the buffer's lifetime.
    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    /// Capacity in bytes, already rounded up to the backend alignment.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this buffer is a page-aligned mapping rather than heap memory.
    pub fn is_pinned(&self) -> bool {
        matches!(self.storage, HostStorage::Pinned(_))
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.len())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

pub(crate) fn allocate_heap(bytes: usize, alignment: usize, backend: &str) -> Result<HostBuffer> {
    let size = align_up(bytes, alignment);
    let storage = AlignedBytes::zeroed(size, alignment)
        .ok_or_else(|| PrefetchError::allocation(backend, size, "host allocator returned null"))?;
    Ok(HostBuffer {
        storage: HostStorage::Heap(storage),
    })
}

pub(crate) fn allocate_pinned(bytes: usize, alignment: usize, backend: &str) -> Result<HostBuffer> {
    let size = align_up(bytes, alignment).max(alignment);
    let map = MmapMut::map_anon(size).map_err(|e| {
        PrefetchError::allocation_with_source(backend, size, "anonymous mapping failed", e)
    })?;
    Ok(HostBuffer {
        storage: HostStorage::Pinned(map),
    })
}

/// Host-only backend: slots have a host master buffer and no device regions.
#[derive(Debug, Clone)]
pub struct HostMemory {
    alignment: usize,
    pinned: bool,
}

impl HostMemory {
    /// Pageable heap memory.
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment,
            pinned: false,
        }
    }

    /// Page-aligned anonymous mappings.
    pub fn pinned(alignment: usize) -> Self {
        Self {
            alignment,
            pinned: true,
        }
    }
}

impl MemoryBackend for HostMemory {
    fn kind(&self) -> BackendKind {
        if self.pinned {
            BackendKind::Pinned
        } else {
            BackendKind::Host
        }
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn allocate_host(&self, bytes: usize) -> Result<HostBuffer> {
        if self.pinned {
            allocate_pinned(bytes, self.alignment, self.kind().as_str())
        } else {
            allocate_heap(bytes, self.alignment, self.kind().as_str())
        }
    }

    fn allocate_device(&self, bytes: usize) -> Result<DeviceBuffer> {
        Err(PrefetchError::allocation(
            self.kind().as_str(),
            bytes,
            "backend has no device",
        ))
    }

    fn free_device(&self, _buffer: DeviceBuffer) -> Result<()> {
        Err(PrefetchError::device(self.kind().as_str(), "backend has no device"))
    }

    fn copy_to_host(&self, _src: &DeviceBuffer, _dst: &mut [u8]) -> Result<()> {
        Err(PrefetchError::device(self.kind().as_str(), "backend has no device"))
    }

    fn copy_to_device(&self, _src: &[u8], _dst: &DeviceBuffer) -> Result<()> {
        Err(PrefetchError::device(self.kind().as_str(), "backend has no device"))
    }
}
