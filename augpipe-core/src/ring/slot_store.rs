// augpipe-core/src/ring/slot_store.rs

//! Fixed set of slot buffers addressed by `(slot, sub_buffer)`.
//!
//! Each slot owns one host master buffer, partitioned into aligned
//! sub-buffer regions, and one device region per sub-buffer when the backend
//! has a device. The store performs no coordination of its own: the sync
//! core decides which slot the producer or consumer may touch. Each slot sits
//! in a `Mutex` that is only ever `try_lock`ed, so a slot handed out twice is
//! caught as a protocol violation instead of aliasing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{debug, warn};

use super::sync::SyncCore;
use crate::error::Result;
use crate::memory::{align_up, DeviceBuffer, DevicePtr, HostBuffer, MemoryBackend};
use crate::metadata::MetadataChannel;

/// Offsets of the sub-buffer regions inside a slot's host master buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
}

impl SlotLayout {
    pub fn new(sub_buffer_sizes: &[usize], alignment: usize) -> Self {
        let mut offsets = Vec::with_capacity(sub_buffer_sizes.len());
        let mut total = 0;
        for &size in sub_buffer_sizes {
            offsets.push(total);
            total += align_up(size, alignment);
        }
        Self {
            sizes: sub_buffer_sizes.to_vec(),
            offsets,
            total,
        }
    }

    /// Requested size of each sub-buffer.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Offset of each sub-buffer within the host master buffer.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Host master buffer size, the sum of aligned sub-buffer sizes.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn sub_buffer_count(&self) -> usize {
        self.sizes.len()
    }

    fn range(&self, sub: usize) -> std::ops::Range<usize> {
        self.offsets[sub]..self.offsets[sub] + self.sizes[sub]
    }
}

#[derive(Debug)]
pub(crate) struct Slot {
    host: HostBuffer,
    device: Vec<DeviceBuffer>,
}

fn free_all(backend: &dyn MemoryBackend, buffers: Vec<DeviceBuffer>) -> Result<()> {
    let mut first_err = None;
    for buffer in buffers {
        if let Err(e) = backend.free_device(buffer) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[derive(Debug)]
pub(crate) struct SlotStore {
    backend: Arc<dyn MemoryBackend>,
    layout: SlotLayout,
    slots: Vec<Mutex<Slot>>,
    released: AtomicBool,
}

impl SlotStore {
    /// Allocates `depth` slots. On failure, device regions already obtained
    /// are freed before the error is returned.
    pub(crate) fn allocate(
        depth: usize,
        backend: Arc<dyn MemoryBackend>,
        sub_buffer_sizes: &[usize],
    ) -> Result<Self> {
        let layout = SlotLayout::new(sub_buffer_sizes, backend.alignment());
        let mut slots: Vec<Mutex<Slot>> = Vec::with_capacity(depth);

        for _ in 0..depth {
            match Self::allocate_slot(backend.as_ref(), &layout) {
                Ok(slot) => slots.push(Mutex::new(slot)),
                Err(e) => {
                    for slot in slots {
                        let slot = slot.into_inner().unwrap_or_else(PoisonError::into_inner);
                        let _ = free_all(backend.as_ref(), slot.device);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            backend,
            layout,
            slots,
            released: AtomicBool::new(false),
        })
    }

    fn allocate_slot(backend: &dyn MemoryBackend, layout: &SlotLayout) -> Result<Slot> {
        let mut device = Vec::new();
        if backend.kind().requires_device() {
            for &size in layout.sizes() {
                match backend.allocate_device(size) {
                    Ok(buffer) => device.push(buffer),
                    Err(e) => {
                        let _ = free_all(backend, device);
                        return Err(e);
                    }
                }
            }
        }
        match backend.allocate_host(layout.total()) {
            Ok(host) => Ok(Slot { host, device }),
            Err(e) => {
                let _ = free_all(backend, device);
                Err(e)
            }
        }
    }

    pub(crate) fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub(crate) fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Takes ownership of slot `idx`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already owned by a live handle.
    pub(crate) fn take(&self, idx: usize) -> MutexGuard<'_, Slot> {
        match self.slots[idx].try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                panic!("protocol violation: slot {} is already held by another handle", idx)
            }
        }
    }

    /// Frees every device region. Later calls are no-ops.
    ///
    /// Returns the number of regions handed back to the backend.
    pub(crate) fn release_device(&self) -> Result<usize> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let mut freed = 0;
        let mut first_err = None;
        for idx in 0..self.slots.len() {
            let buffers = std::mem::take(&mut self.take(idx).device);
            freed += buffers.len();
            if let Err(e) = free_all(self.backend.as_ref(), buffers) {
                warn!(slot = idx, error = %e, "failed to free device sub-buffers");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(freed), Err)
    }
}

/// Producer handle to the slot at the write position.
///
/// Dropping the handle does not publish the slot. Publishing and
/// abandoning both consume the handle, so the slot cannot be touched once
/// the consumer may see it.
pub struct WriteSlot<'a> {
    index: usize,
    slot: MutexGuard<'a, Slot>,
    store: &'a SlotStore,
    sync: &'a SyncCore,
    metadata: Option<&'a MetadataChannel>,
}

impl<'a> WriteSlot<'a> {
    pub(crate) fn new(
        index: usize,
        store: &'a SlotStore,
        sync: &'a SyncCore,
        metadata: Option<&'a MetadataChannel>,
    ) -> Self {
        Self {
            index,
            slot: store.take(index),
            store,
            sync,
            metadata,
        }
    }

    pub(crate) fn belongs_to(&self, sync: &SyncCore) -> bool {
        std::ptr::eq(self.sync, sync)
    }

    /// Ring position of this slot.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sub_buffer_count(&self) -> usize {
        self.store.layout.sub_buffer_count()
    }

    /// The whole host master buffer.
    pub fn host(&self) -> &HostBuffer {
        &self.slot.host
    }

    pub fn host_mut(&mut self) -> &mut HostBuffer {
        &mut self.slot.host
    }

    /// Host region of sub-buffer `sub`.
    pub fn sub_buffer(&self, sub: usize) -> &[u8] {
        let range = self.store.layout.range(sub);
        &self.slot.host.as_slice()[range]
    }

    pub fn sub_buffer_mut(&mut self, sub: usize) -> &mut [u8] {
        let range = self.store.layout.range(sub);
        &mut self.slot.host.as_mut_slice()[range]
    }

    /// Device region of sub-buffer `sub`, if the backend has a device.
    pub fn device(&self, sub: usize) -> Option<&DeviceBuffer> {
        self.slot.device.get(sub)
    }

    /// Device handles of every sub-buffer, in order.
    pub fn device_ptrs(&self) -> Vec<DevicePtr> {
        self.slot.device.iter().map(DeviceBuffer::ptr).collect()
    }

    /// Copies host sub-buffer `sub` to its device region.
    ///
    /// Host-only backends have nothing to upload and return `Ok`.
    pub fn upload(&self, sub: usize) -> Result<()> {
        match self.slot.device.get(sub) {
            Some(device) => {
                let range = self.store.layout.range(sub);
                self.store
                    .backend
                    .copy_to_device(&self.slot.host.as_slice()[range], device)
            }
            None => Ok(()),
        }
    }

    /// Drops the handle and publishes the slot to the consumer.
    ///
    /// Returns false if the ring was stopped and the slot was discarded.
    pub fn commit(self) -> bool {
        let (sync, metadata) = (self.sync, self.metadata);
        drop(self);
        let committed = sync.commit();
        if committed {
            if let Some(metadata) = metadata {
                metadata.seal();
            }
        }
        committed
    }

    /// Drops the handle and returns the slot to Empty without publishing it.
    ///
    /// A metadata record attached for this slot and not yet matched by a
    /// commit is withdrawn, so later records stay paired with their slots.
    pub fn abandon(self) {
        let (sync, metadata) = (self.sync, self.metadata);
        drop(self);
        sync.abandon_write();
        if let Some(record) = metadata.and_then(MetadataChannel::retract_unsealed) {
            debug!(sequence = record.sequence, "withdrew metadata of abandoned slot");
        }
    }
}

/// Consumer handle to the slot at the read position.
pub struct ReadSlot<'a> {
    index: usize,
    slot: MutexGuard<'a, Slot>,
    store: &'a SlotStore,
    sync: &'a SyncCore,
}

impl<'a> ReadSlot<'a> {
    pub(crate) fn new(index: usize, store: &'a SlotStore, sync: &'a SyncCore) -> Self {
        Self {
            index,
            slot: store.take(index),
            store,
            sync,
        }
    }

    pub(crate) fn belongs_to(&self, sync: &SyncCore) -> bool {
        std::ptr::eq(self.sync, sync)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sub_buffer_count(&self) -> usize {
        self.store.layout.sub_buffer_count()
    }

    pub fn host(&self) -> &HostBuffer {
        &self.slot.host
    }

    pub fn sub_buffer(&self, sub: usize) -> &[u8] {
        let range = self.store.layout.range(sub);
        &self.slot.host.as_slice()[range]
    }

    pub fn device(&self, sub: usize) -> Option<&DeviceBuffer> {
        self.slot.device.get(sub)
    }

    pub fn device_ptrs(&self) -> Vec<DevicePtr> {
        self.slot.device.iter().map(DeviceBuffer::ptr).collect()
    }

    /// Copies device sub-buffer `sub` into its host region.
    ///
    /// Host-only backends already hold the data and return `Ok`.
    pub fn download(&mut self, sub: usize) -> Result<()> {
        let range = self.store.layout.range(sub);
        let Slot { host, device } = &mut *self.slot;
        match device.get(sub) {
            Some(device) => self
                .store
                .backend
                .copy_to_host(device, &mut host.as_mut_slice()[range]),
            None => Ok(()),
        }
    }

    /// Copies every device sub-buffer into the host master buffer.
    pub fn download_all(&mut self) -> Result<()> {
        for sub in 0..self.sub_buffer_count() {
            self.download(sub)?;
        }
        Ok(())
    }

    /// Drops the handle and returns the slot to the producer.
    pub fn release(self) {
        let sync = self.sync;
        drop(self);
        sync.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DeviceMemory, EmulatedDevice, HostMemory};

    #[test]
    fn test_layout_offsets_are_aligned() {
        let layout = SlotLayout::new(&[100, 300, 256], 256);
        assert_eq!(layout.offsets(), &[0, 256, 768]);
        assert_eq!(layout.total(), 1024);
        assert_eq!(layout.sub_buffer_count(), 3);
    }

    #[test]
    fn test_host_store_has_no_device_regions() {
        let backend: Arc<dyn MemoryBackend> = Arc::new(HostMemory::new(256));
        let store = SlotStore::allocate(2, backend, &[64, 64]).unwrap();

        let slot = store.take(0);
        assert_eq!(slot.host.len(), 512);
        assert!(slot.device.is_empty());
    }

    #[test]
    fn test_device_store_allocates_per_sub_buffer() {
        let device = Arc::new(EmulatedDevice::new(0));
        let backend: Arc<dyn MemoryBackend> = Arc::new(DeviceMemory::new(device.clone(), 256));
        let store = SlotStore::allocate(3, backend, &[100, 200]).unwrap();

        assert_eq!(device.live_allocations(), 6);
        assert_eq!(store.release_device().unwrap(), 6);
        assert_eq!(device.live_allocations(), 0);
        // Idempotent
        assert_eq!(store.release_device().unwrap(), 0);
    }

    #[test]
    fn test_failed_allocation_frees_partial_slots() {
        // Room for exactly two slots of 2 x 256 bytes
        let device = Arc::new(EmulatedDevice::with_capacity(0, 1024));
        let backend: Arc<dyn MemoryBackend> = Arc::new(DeviceMemory::new(device.clone(), 256));

        let err = SlotStore::allocate(3, backend, &[256, 256]).unwrap_err();
        assert!(err.is_allocation());
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.total_allocations(), 4);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_double_take_panics() {
        let backend: Arc<dyn MemoryBackend> = Arc::new(HostMemory::new(64));
        let store = SlotStore::allocate(1, backend, &[64]).unwrap();
        let _first = store.take(0);
        let _second = store.take(0);
    }
}
