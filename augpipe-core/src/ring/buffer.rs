// augpipe-core/src/ring/buffer.rs

//! The prefetching ring buffer.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use augpipe_core::memory::HostMemory;
//! use augpipe_core::metadata::AnnotationBatch;
//! use augpipe_core::RingBuffer;
//!
//! let mut ring = RingBuffer::new(2);
//! ring.init(Arc::new(HostMemory::new(256)), &[1024]).unwrap();
//! ring.init_metadata([64, 256, 0]);
//!
//! // Producer
//! assert!(ring.block_if_full().is_ready());
//! let mut slot = ring.acquire_write_slot();
//! slot.sub_buffer_mut(0)[0] = 42;
//! ring.attach(vec!["img-0".into()], AnnotationBatch::new()).unwrap();
//! assert!(ring.commit(slot));
//!
//! // Consumer
//! assert!(ring.block_if_empty().is_ready());
//! let slot = ring.acquire_read_slot();
//! assert_eq!(slot.sub_buffer(0)[0], 42);
//! assert_eq!(ring.peek_current().unwrap().sample_names, vec!["img-0"]);
//! ring.release(slot);
//! ring.consume();
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::slot_store::{ReadSlot, SlotLayout, SlotStore, WriteSlot};
use super::sync::{RingStats, RunState, SlotState, SyncCore, WaitStatus};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::memory::{create_backend, DeviceContext, MemoryBackend};
use crate::metadata::{AnnotationBatch, MetadataChannel, MetadataField, MetadataRecord};

/// A bounded ring of preallocated slots between one producer and one
/// consumer.
///
/// Construction fixes only the depth. [`init`](Self::init) performs the
/// one-time slot allocation and must precede any slot access;
/// [`init_metadata`](Self::init_metadata) does the same for the metadata
/// channel. Share the initialized ring between the two threads with `Arc`.
#[derive(Debug)]
pub struct RingBuffer {
    depth: usize,
    sync: SyncCore,
    store: Option<SlotStore>,
    metadata: Option<MetadataChannel>,
}

impl RingBuffer {
    /// Creates an unallocated ring of `depth` slots.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is zero.
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "ring depth must be greater than 0");
        Self {
            depth,
            sync: SyncCore::new(depth),
            store: None,
            metadata: None,
        }
    }

    /// Creates and initializes a ring from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any slot
    /// allocation fails.
    pub fn from_config(
        config: &PipelineConfig,
        device: Option<Arc<dyn DeviceContext>>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = create_backend(&config.buffer, device)?;
        let sizes = config.buffer.resolved_sub_buffer_sizes()?;

        let mut ring = Self::new(config.buffer.depth);
        ring.init(backend, &sizes)?;
        if config.metadata.enabled {
            ring.init_metadata(config.metadata.field_capacities());
        }
        Ok(ring)
    }

    /// Binds the ring to `backend` and allocates every slot: one host master
    /// buffer per slot plus, for device backends, one device region per
    /// sub-buffer. Sizes are rounded up to the backend alignment.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if any allocation fails; nothing stays
    /// allocated in that case.
    ///
    /// # Panics
    ///
    /// Panics if called twice or with no sub-buffers.
    pub fn init(
        &mut self,
        backend: Arc<dyn MemoryBackend>,
        sub_buffer_sizes: &[usize],
    ) -> Result<()> {
        assert!(self.store.is_none(), "protocol violation: ring initialized twice");
        assert!(!sub_buffer_sizes.is_empty(), "a slot needs at least one sub-buffer");

        let kind = backend.kind();
        let store = SlotStore::allocate(self.depth, backend, sub_buffer_sizes)?;
        info!(
            depth = self.depth,
            backend = kind.as_str(),
            sub_buffers = sub_buffer_sizes.len(),
            host_bytes_per_slot = store.layout().total(),
            "ring buffer initialized"
        );
        self.store = Some(store);
        Ok(())
    }

    /// Allocates the metadata channel with initial field capacities
    /// (labels, boxes, masks) in bytes.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn init_metadata(&mut self, field_capacities: [usize; 3]) {
        assert!(
            self.metadata.is_none(),
            "protocol violation: metadata initialized twice"
        );
        self.metadata = Some(MetadataChannel::new(self.depth, field_capacities));
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_some()
    }

    /// The backend chosen at init.
    pub fn backend(&self) -> Option<&Arc<dyn MemoryBackend>> {
        self.store.as_ref().map(SlotStore::backend)
    }

    /// Sub-buffer layout of every slot.
    pub fn layout(&self) -> Option<&SlotLayout> {
        self.store.as_ref().map(SlotStore::layout)
    }

    fn store(&self) -> &SlotStore {
        let store = self
            .store
            .as_ref()
            .unwrap_or_else(|| panic!("protocol violation: ring used before init"));
        assert!(
            !store.is_released(),
            "protocol violation: ring used after release_memory"
        );
        store
    }

    /// The metadata channel.
    ///
    /// # Panics
    ///
    /// Panics if [`init_metadata`](Self::init_metadata) was not called.
    pub fn metadata(&self) -> &MetadataChannel {
        self.metadata
            .as_ref()
            .unwrap_or_else(|| panic!("protocol violation: metadata used before init_metadata"))
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    // ---- Producer side ----

    /// Parks the producer while the ring is full.
    pub fn block_if_full(&self) -> WaitStatus {
        self.sync.block_if_full()
    }

    /// Like [`block_if_full`](Self::block_if_full), giving up after `timeout`.
    pub fn block_if_full_timeout(&self, timeout: Duration) -> WaitStatus {
        self.sync.block_if_full_timeout(timeout)
    }

    /// Hands the producer the slot at the write position.
    ///
    /// # Panics
    ///
    /// Panics if the ring is full, uninitialized, or the slot is already held.
    pub fn acquire_write_slot(&self) -> WriteSlot<'_> {
        let store = self.store();
        let idx = self.sync.begin_write();
        WriteSlot::new(idx, store, &self.sync, self.metadata.as_ref())
    }

    /// Publishes `slot`, which must come from this ring. Same as
    /// [`WriteSlot::commit`].
    ///
    /// Returns false if the ring was stopped and the slot was discarded.
    pub fn commit(&self, slot: WriteSlot<'_>) -> bool {
        assert!(
            slot.belongs_to(&self.sync),
            "protocol violation: commit of a slot from another ring"
        );
        slot.commit()
    }

    /// Returns an acquired write slot without publishing it. A record
    /// already attached for it is withdrawn. Same as [`WriteSlot::abandon`].
    pub fn abandon_write(&self, slot: WriteSlot<'_>) {
        assert!(
            slot.belongs_to(&self.sync),
            "protocol violation: abandon of a slot from another ring"
        );
        slot.abandon();
    }

    /// Abandons the write slot left behind by a producer that unwound while
    /// holding it, along with any record attached for it.
    pub(crate) fn abandon_orphaned_write(&self) {
        if self.sync.abandon_write_if_writing() {
            let withdrawn = self
                .metadata
                .as_ref()
                .and_then(MetadataChannel::retract_unsealed)
                .is_some();
            debug!(withdrawn, "abandoned write slot of unwound producer");
        }
    }

    /// Appends the metadata record paired with the current write slot.
    pub fn attach(&self, names: Vec<String>, annotations: AnnotationBatch) -> Result<u64> {
        self.metadata().attach(names, annotations)
    }

    /// Declares end of stream. Committed slots are still delivered.
    pub fn finish(&self) {
        let previous = self.sync.set_run_state(RunState::Draining);
        info!(?previous, level = self.level(), "producer finished, ring draining");
    }

    // ---- Consumer side ----

    /// Parks the consumer while the ring is empty.
    pub fn block_if_empty(&self) -> WaitStatus {
        self.sync.block_if_empty()
    }

    pub fn block_if_empty_timeout(&self, timeout: Duration) -> WaitStatus {
        self.sync.block_if_empty_timeout(timeout)
    }

    /// Hands the consumer the slot at the read position.
    ///
    /// # Panics
    ///
    /// Panics if the ring is empty, uninitialized, or the slot is already held.
    pub fn acquire_read_slot(&self) -> ReadSlot<'_> {
        let store = self.store();
        let idx = self.sync.begin_read();
        ReadSlot::new(idx, store, &self.sync)
    }

    /// Returns `slot`, which must come from this ring, to the producer.
    /// Same as [`ReadSlot::release`].
    pub fn release(&self, slot: ReadSlot<'_>) {
        assert!(
            slot.belongs_to(&self.sync),
            "protocol violation: release of a slot from another ring"
        );
        slot.release();
    }

    /// The metadata record paired with the slot at the read position.
    pub fn peek_current(&self) -> Option<Arc<MetadataRecord>> {
        self.metadata().peek_current()
    }

    /// Pops the metadata record paired with the slot just released.
    pub fn consume(&self) -> Arc<MetadataRecord> {
        self.metadata().consume()
    }

    pub fn grow_field(&self, field: MetadataField, new_size: usize) -> Result<()> {
        self.metadata().grow_field(field, new_size)
    }

    // ---- Either side ----

    /// Wakes a producer parked in `block_if_full` without changing the level.
    pub fn cancel_producer_wait(&self) {
        debug!("cancelling producer wait");
        self.sync.cancel();
    }

    /// Wakes a consumer parked in `block_if_empty` without changing the level.
    pub fn cancel_consumer_wait(&self) {
        debug!("cancelling consumer wait");
        self.sync.cancel();
    }

    /// Abandons the ring: every wait returns `Stopped` and committed slots
    /// are not delivered.
    pub fn stop(&self) {
        let previous = self.sync.set_run_state(RunState::Stopped);
        if previous != RunState::Stopped {
            info!(?previous, level = self.level(), "ring stopped");
        }
    }

    pub fn run_state(&self) -> RunState {
        self.sync.run_state()
    }

    /// Number of committed, unreleased slots.
    pub fn level(&self) -> usize {
        self.sync.level()
    }

    pub fn is_empty(&self) -> bool {
        self.level() == 0
    }

    pub fn is_full(&self) -> bool {
        self.level() == self.depth
    }

    /// Current `(write_ptr, read_ptr)`. The read position trails the write
    /// position by `level` slots, mod depth.
    pub fn positions(&self) -> (usize, usize) {
        self.sync.pointers()
    }

    /// Whether a wait cancellation is pending. Cleared by `reset`.
    pub fn is_cancelled(&self) -> bool {
        self.sync.is_cancelled()
    }

    pub fn slot_state(&self, idx: usize) -> SlotState {
        self.sync.slot_state(idx)
    }

    pub fn stats(&self) -> RingStats {
        self.sync.stats()
    }

    // ---- Lifecycle ----

    /// Rewinds pointers and level between epochs, clears cancellation and
    /// returns to `Running`. Slot allocations are kept, so each position maps
    /// to the same buffers as before. Pending metadata is dropped.
    pub fn reset(&self) {
        let discarded = self.sync.reset();
        if let Some(metadata) = &self.metadata {
            metadata.reset();
        }
        debug!(discarded, "ring buffer reset");
    }

    /// Frees every device allocation. Idempotent; also run on drop.
    ///
    /// # Errors
    ///
    /// Returns the first device error; remaining regions are still freed.
    pub fn release_memory(&self) -> Result<()> {
        if let Some(store) = &self.store {
            let freed = store.release_device()?;
            if freed > 0 {
                debug!(freed, "released device sub-buffers");
            }
        }
        Ok(())
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release_memory() {
            warn!(error = %e, "device memory release failed during teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    use crate::config::{BackendKind, BufferConfig, MetadataConfig};
    use crate::error::PrefetchError;
    use crate::memory::{EmulatedDevice, HostMemory};
    use crate::metadata::SampleAnnotation;

    fn host_ring(depth: usize) -> RingBuffer {
        let mut ring = RingBuffer::new(depth);
        ring.init(Arc::new(HostMemory::new(256)), &[64]).unwrap();
        ring.init_metadata([16, 16, 0]);
        ring
    }

    /// Writes `tag` into the first byte of the next slot and commits it.
    fn produce(ring: &RingBuffer, tag: u8) {
        assert!(ring.block_if_full().is_ready());
        let mut slot = ring.acquire_write_slot();
        slot.sub_buffer_mut(0)[0] = tag;
        ring.attach(vec![format!("sample-{}", tag)], AnnotationBatch::new())
            .unwrap();
        assert!(slot.commit());
    }

    /// Reads the tag of the next slot and releases it with its metadata.
    fn consume(ring: &RingBuffer) -> (u8, String) {
        assert!(ring.block_if_empty().is_ready());
        let slot = ring.acquire_read_slot();
        let tag = slot.sub_buffer(0)[0];
        let name = ring.peek_current().unwrap().sample_names[0].clone();
        slot.release();
        ring.consume();
        (tag, name)
    }

    #[test]
    fn test_end_to_end_fifo() {
        let ring = host_ring(3);
        produce(&ring, b'A');
        produce(&ring, b'B');
        produce(&ring, b'C');
        assert!(ring.is_full());
        assert_eq!(ring.positions(), (0, 0));

        assert_eq!(consume(&ring).0, b'A');
        assert!(!ring.is_full());
        assert_eq!(ring.level(), 2);

        // Does not block: one slot is free again
        assert_eq!(
            ring.block_if_full_timeout(Duration::from_millis(1)),
            WaitStatus::Ready
        );
        produce(&ring, b'D');
        assert_eq!(ring.positions(), (1, 1));
        assert_eq!(ring.slot_state(0), SlotState::Full);

        let order: Vec<u8> = (0..3).map(|_| consume(&ring).0).collect();
        assert_eq!(order, vec![b'B', b'C', b'D']);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_metadata_stays_paired_with_slots() {
        let ring = host_ring(2);
        for round in 0..7u8 {
            produce(&ring, round);
            let (tag, name) = consume(&ring);
            assert_eq!(tag, round);
            assert_eq!(name, format!("sample-{}", round));
        }
        assert_eq!(ring.metadata().counts(), (7, 7));
    }

    #[test]
    fn test_reset_keeps_allocations() {
        let ring = host_ring(1);

        assert!(ring.block_if_full().is_ready());
        let slot = ring.acquire_write_slot();
        let first = slot.host().as_ptr();
        ring.attach(vec!["a".into()], AnnotationBatch::new()).unwrap();
        slot.commit();
        consume(&ring);

        ring.reset();
        assert_eq!(ring.level(), 0);

        let slot = ring.acquire_write_slot();
        assert_eq!(slot.host().as_ptr(), first);
        ring.attach(vec!["b".into()], AnnotationBatch::new()).unwrap();
        slot.commit();
        assert_eq!(consume(&ring).1, "b");
    }

    #[test]
    fn test_reset_discards_pending_batches() {
        let ring = host_ring(3);
        produce(&ring, 1);
        produce(&ring, 2);
        ring.cancel_consumer_wait();
        assert!(ring.is_cancelled());

        ring.reset();
        assert!(!ring.is_cancelled());
        assert!(ring.is_empty());
        assert!(ring.metadata().is_empty());
        assert_eq!(ring.run_state(), RunState::Running);
        assert_eq!(
            ring.block_if_empty_timeout(Duration::from_millis(5)),
            WaitStatus::TimedOut
        );
    }

    #[test]
    fn test_blocked_consumer_proceeds_after_commit() {
        let ring = Arc::new(host_ring(2));
        let consumer = {
            let ring = ring.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let status = ring.block_if_empty();
                (status, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());
        produce(&ring, 9);

        let (status, waited) = consumer.join().unwrap();
        assert_eq!(status, WaitStatus::Ready);
        assert!(waited < Duration::from_secs(5));
        assert_eq!(consume(&ring).0, 9);
    }

    #[test]
    fn test_cancel_consumer_wait_returns_without_data() {
        let ring = Arc::new(host_ring(2));
        let consumer = {
            let ring = ring.clone();
            thread::spawn(move || ring.block_if_empty())
        };

        thread::sleep(Duration::from_millis(50));
        ring.cancel_consumer_wait();

        assert_eq!(consumer.join().unwrap(), WaitStatus::Cancelled);
        assert_eq!(ring.level(), 0);
    }

    #[test]
    fn test_cancel_producer_wait_returns_while_full() {
        let ring = Arc::new(host_ring(1));
        produce(&ring, 1);

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || ring.block_if_full())
        };

        thread::sleep(Duration::from_millis(50));
        ring.cancel_producer_wait();

        assert_eq!(producer.join().unwrap(), WaitStatus::Cancelled);
        assert!(ring.is_full());
    }

    #[test]
    fn test_threaded_producer_consumer() {
        let ring = Arc::new(host_ring(3));
        let total = 200u32;

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..total {
                    assert!(ring.block_if_full().is_ready());
                    let mut slot = ring.acquire_write_slot();
                    slot.sub_buffer_mut(0)[..4].copy_from_slice(&i.to_le_bytes());
                    ring.attach(vec![i.to_string()], AnnotationBatch::new()).unwrap();
                    slot.commit();
                    assert!(ring.level() <= 3);
                }
                ring.finish();
            })
        };

        let mut seen = Vec::new();
        loop {
            match ring.block_if_empty() {
                WaitStatus::Ready => {}
                WaitStatus::EndOfStream => break,
                other => panic!("unexpected wait status {:?}", other),
            }
            let slot = ring.acquire_read_slot();
            let bytes = &slot.sub_buffer(0)[..4];
            let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let record = ring.peek_current().unwrap();
            assert_eq!(record.sample_names[0], value.to_string());
            slot.release();
            ring.consume();
            seen.push(value);
        }
        producer.join().unwrap();

        assert_eq!(seen, (0..total).collect::<Vec<_>>());
        let stats = ring.stats();
        assert_eq!(stats.commits, total as u64);
        assert_eq!(stats.releases, total as u64);
        assert_eq!(stats.state, RunState::Draining);
    }

    #[test]
    fn test_device_ring_round_trip_and_release() {
        let device = Arc::new(EmulatedDevice::new(0));
        let config = PipelineConfig {
            buffer: BufferConfig {
                depth: 2,
                backend: BackendKind::Device,
                sub_buffer_sizes: vec![100, 40],
                sub_buffer_count: 2,
                ..Default::default()
            },
            metadata: MetadataConfig::default(),
        };
        let device_context: Arc<dyn DeviceContext> = device.clone();
        let ring = RingBuffer::from_config(&config, Some(device_context)).unwrap();
        assert_eq!(device.live_allocations(), 4);

        let mut slot = ring.acquire_write_slot();
        assert_eq!(slot.device_ptrs().len(), 2);
        slot.sub_buffer_mut(1)[..3].copy_from_slice(b"xyz");
        slot.upload(1).unwrap();
        // Clear the host copy so the download below has to fetch it
        slot.sub_buffer_mut(1)[..3].copy_from_slice(b"\0\0\0");
        let batch = AnnotationBatch::from_samples(vec![SampleAnnotation {
            labels: vec![3],
            ..Default::default()
        }]);
        ring.attach(vec!["dev".into()], batch).unwrap();
        slot.commit();

        let mut slot = ring.acquire_read_slot();
        slot.download_all().unwrap();
        assert_eq!(&slot.sub_buffer(1)[..3], b"xyz");
        assert_eq!(slot.sub_buffer(0).len(), 100);
        assert_eq!(ring.metadata().with_current_fields(|f| f.labels()), Some(vec![3]));
        slot.release();
        ring.consume();

        ring.release_memory().unwrap();
        assert_eq!(device.live_allocations(), 0);
        drop(ring);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn test_drop_releases_device_memory() {
        let device = Arc::new(EmulatedDevice::new(0));
        {
            let mut ring = RingBuffer::new(3);
            let backend = Arc::new(crate::memory::DeviceMemory::new(device.clone(), 256));
            ring.init(backend, &[512]).unwrap();
            assert_eq!(device.live_allocations(), 3);
        }
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn test_init_allocation_failure_is_reported() {
        let device = Arc::new(EmulatedDevice::with_capacity(0, 1000));
        let mut ring = RingBuffer::new(4);
        let backend = Arc::new(crate::memory::DeviceMemory::new(device.clone(), 256));

        let err = ring.init(backend, &[512]).unwrap_err();
        assert!(matches!(err, PrefetchError::Allocation { .. }));
        assert!(!ring.is_initialized());
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn test_init_twice_panics() {
        let mut ring = host_ring(1);
        let _ = ring.init(Arc::new(HostMemory::new(256)), &[64]);
    }

    #[test]
    #[should_panic(expected = "before init")]
    fn test_acquire_before_init_panics() {
        let ring = RingBuffer::new(2);
        let _ = ring.acquire_write_slot();
    }

    #[test]
    #[should_panic(expected = "from another ring")]
    fn test_release_of_foreign_slot_panics() {
        let a = host_ring(2);
        let b = host_ring(2);
        produce(&a, 1);
        produce(&b, 1);
        let slot = a.acquire_read_slot();
        b.release(slot);
    }

    #[test]
    fn test_ring_commit_and_release_consume_handles() {
        let ring = Arc::new(host_ring(2));
        let consumer = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut tags = Vec::new();
                for _ in 0..20 {
                    assert!(ring.block_if_empty().is_ready());
                    // Acquiring straight after the wakeup must not find the
                    // slot still held by the producer
                    let slot = ring.acquire_read_slot();
                    tags.push(slot.sub_buffer(0)[0]);
                    ring.release(slot);
                    ring.consume();
                }
                tags
            })
        };

        for tag in 0..20u8 {
            assert!(ring.block_if_full().is_ready());
            let mut slot = ring.acquire_write_slot();
            slot.sub_buffer_mut(0)[0] = tag;
            ring.attach(vec![tag.to_string()], AnnotationBatch::new()).unwrap();
            assert!(ring.commit(slot));
            // Give the consumer time to wake while this thread still runs
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(consumer.join().unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(ring.stats().releases, 20);
    }

    #[test]
    fn test_abandon_after_attach_keeps_metadata_paired() {
        let ring = host_ring(2);
        produce(&ring, 1);

        // Attached, then the batch is dropped before commit
        let slot = ring.acquire_write_slot();
        ring.attach(vec!["dropped".into()], AnnotationBatch::new()).unwrap();
        ring.abandon_write(slot);
        assert_eq!(ring.metadata().len(), 1);
        assert_eq!(ring.slot_state(1), SlotState::Empty);

        produce(&ring, 2);
        assert_eq!(consume(&ring), (1, "sample-1".to_string()));
        assert_eq!(consume(&ring), (2, "sample-2".to_string()));
        assert!(ring.metadata().is_empty());
    }

    #[test]
    fn test_abandon_keeps_record_of_committed_slot() {
        let ring = host_ring(2);
        // Record attached only after its slot was committed
        let mut slot = ring.acquire_write_slot();
        slot.sub_buffer_mut(0)[0] = 7;
        assert!(ring.commit(slot));
        ring.attach(vec!["late".into()], AnnotationBatch::new()).unwrap();

        let slot = ring.acquire_write_slot();
        ring.abandon_write(slot);

        assert_eq!(ring.metadata().len(), 1);
        assert_eq!(consume(&ring), (7, "late".to_string()));
    }

    #[test]
    fn test_orphaned_write_slot_is_abandoned() {
        let ring = host_ring(2);
        produce(&ring, 1);
        {
            let _slot = ring.acquire_write_slot();
            ring.attach(vec!["lost".into()], AnnotationBatch::new()).unwrap();
        }
        ring.finish();
        ring.abandon_orphaned_write();

        assert_eq!(ring.slot_state(1), SlotState::Empty);
        assert_eq!(ring.metadata().len(), 1);
        // Nothing in flight any more
        ring.abandon_orphaned_write();
        assert_eq!(consume(&ring).1, "sample-1");

        ring.reset();
        produce(&ring, 2);
        assert_eq!(consume(&ring).0, 2);
    }

    #[test]
    fn test_stop_abandons_in_flight_slots() {
        let ring = host_ring(2);
        produce(&ring, 1);
        ring.stop();

        assert_eq!(ring.block_if_empty(), WaitStatus::Stopped);
        assert_eq!(ring.block_if_full(), WaitStatus::Stopped);
        assert_eq!(ring.level(), 1);

        ring.reset();
        assert_eq!(ring.run_state(), RunState::Running);
        produce(&ring, 2);
        assert_eq!(consume(&ring).0, 2);
    }

    #[test]
    fn test_independent_rings_do_not_interact() {
        let a = host_ring(1);
        let b = host_ring(1);
        produce(&a, 1);
        assert!(a.is_full());
        assert!(b.is_empty());
        a.stop();
        assert_eq!(b.run_state(), RunState::Running);
    }
}
