// augpipe-core/src/metadata.rs

//! Per-batch side information carried in lock-step with ring slots.
//!
//! Every committed slot has exactly one [`MetadataRecord`]: the sample
//! identifiers of the batch and its annotations (labels, boxes, mask
//! polygons), whose sizes vary per sample. Records travel through a FIFO
//! guarded by its own lock, separate from the slot lock, so metadata work
//! never waits behind device staging. Pairing with slots relies on order
//! alone: one producer attaches in commit order, one consumer consumes in
//! release order.
//!
//! Besides the record itself, `attach` packs the annotations into per-slot
//! host field buffers so the consumer can hand contiguous label/box/mask
//! tensors to the training loop. Field buffers grow on demand through
//! [`MetadataChannel::grow_field`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{PrefetchError, Result};

/// Identifies one packed field of a slot's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    /// Little-endian `i32` per label.
    Labels,
    /// Four little-endian `f32` (`l, t, r, b`) per box.
    Boxes,
    /// Little-endian `f32` polygon coordinates.
    Masks,
}

impl MetadataField {
    pub const ALL: [MetadataField; 3] = [
        MetadataField::Labels,
        MetadataField::Boxes,
        MetadataField::Masks,
    ];

    fn index(self) -> usize {
        match self {
            MetadataField::Labels => 0,
            MetadataField::Boxes => 1,
            MetadataField::Masks => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataField::Labels => "labels",
            MetadataField::Boxes => "boxes",
            MetadataField::Masks => "masks",
        }
    }
}

/// An axis-aligned box in `l, t, r, b` form.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub l: f32,
    pub t: f32,
    pub r: f32,
    pub b: f32,
}

impl BoundingBox {
    pub fn new(l: f32, t: f32, r: f32, b: f32) -> Self {
        Self { l, t, r, b }
    }
}

/// Annotations of a single sample.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleAnnotation {
    pub labels: Vec<i32>,
    pub boxes: Vec<BoundingBox>,
    pub mask: Vec<f32>,
}

/// Per-sample element counts of an [`AnnotationBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnotationDims {
    pub labels: Vec<usize>,
    pub boxes: Vec<usize>,
    pub mask_coords: Vec<usize>,
}

/// Annotations of every sample in a batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnnotationBatch {
    pub samples: Vec<SampleAnnotation>,
}

impl AnnotationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_samples(samples: Vec<SampleAnnotation>) -> Self {
        Self { samples }
    }

    pub fn push(&mut self, sample: SampleAnnotation) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dims(&self) -> AnnotationDims {
        AnnotationDims {
            labels: self.samples.iter().map(|s| s.labels.len()).collect(),
            boxes: self.samples.iter().map(|s| s.boxes.len()).collect(),
            mask_coords: self.samples.iter().map(|s| s.mask.len()).collect(),
        }
    }

    /// Bytes needed to pack `field` for the whole batch.
    pub fn packed_len(&self, field: MetadataField) -> usize {
        self.samples
            .iter()
            .map(|s| match field {
                MetadataField::Labels => s.labels.len() * 4,
                MetadataField::Boxes => s.boxes.len() * 16,
                MetadataField::Masks => s.mask.len() * 4,
            })
            .sum()
    }

    fn pack_into(&self, field: MetadataField, out: &mut [u8]) {
        let mut at = 0;
        let mut put = |bytes: [u8; 4]| {
            out[at..at + 4].copy_from_slice(&bytes);
            at += 4;
        };
        for sample in &self.samples {
            match field {
                MetadataField::Labels => sample.labels.iter().for_each(|v| put(v.to_le_bytes())),
                MetadataField::Boxes => sample.boxes.iter().for_each(|b| {
                    for v in [b.l, b.t, b.r, b.b] {
                        put(v.to_le_bytes());
                    }
                }),
                MetadataField::Masks => sample.mask.iter().for_each(|v| put(v.to_le_bytes())),
            }
        }
    }
}

/// One batch's non-pixel payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    /// Position of this record in attach order, starting at 0 after init or reset.
    pub sequence: u64,
    pub sample_names: Vec<String>,
    pub annotations: AnnotationBatch,
    pub dims: AnnotationDims,
}

/// Packed field bytes of the record at the head of the channel.
#[derive(Debug, Clone, Copy)]
pub struct PackedFields<'a> {
    slices: [&'a [u8]; 3],
}

impl<'a> PackedFields<'a> {
    pub fn get(&self, field: MetadataField) -> &'a [u8] {
        self.slices[field.index()]
    }

    pub fn labels(&self) -> Vec<i32> {
        self.get(MetadataField::Labels)
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn boxes(&self) -> Vec<BoundingBox> {
        let coords: Vec<f32> = f32s(self.get(MetadataField::Boxes));
        coords
            .chunks_exact(4)
            .map(|c| BoundingBox::new(c[0], c[1], c[2], c[3]))
            .collect()
    }

    pub fn mask_coords(&self) -> Vec<f32> {
        f32s(self.get(MetadataField::Masks))
    }
}

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[derive(Debug)]
struct FieldBuffer {
    data: Vec<u8>,
    used: usize,
}

impl FieldBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            used: 0,
        }
    }
}

#[derive(Debug)]
struct ChannelState {
    fifo: VecDeque<Arc<MetadataRecord>>,
    // fields[slot][field]
    fields: Vec<[FieldBuffer; 3]>,
    capacities: [usize; 3],
    write_idx: usize,
    read_idx: usize,
    attached: u64,
    // Records whose slot has been committed. Records past this count belong
    // to the slot currently being written.
    sealed: u64,
    consumed: u64,
}

/// Independently locked FIFO of metadata records, one per committed slot.
#[derive(Debug)]
pub struct MetadataChannel {
    depth: usize,
    // One record beyond depth: the consumer releases its slot before it
    // consumes the paired record, so the producer may attach in between.
    records: usize,
    state: Mutex<ChannelState>,
}

impl MetadataChannel {
    /// Allocates field buffers for `depth` slots with the given initial
    /// capacities (labels, boxes, masks).
    pub fn new(depth: usize, capacities: [usize; 3]) -> Self {
        let records = depth + 1;
        let fields = (0..records)
            .map(|_| capacities.map(FieldBuffer::with_capacity))
            .collect();
        debug!(depth, ?capacities, "allocated metadata field buffers");

        Self {
            depth,
            records,
            state: Mutex::new(ChannelState {
                fifo: VecDeque::with_capacity(records),
                fields,
                capacities,
                write_idx: 0,
                read_idx: 0,
                attached: 0,
                sealed: 0,
                consumed: 0,
            }),
        }
    }

    /// Appends the record for the slot most recently acquired for writing
    /// and packs its annotations into that slot's field buffers.
    ///
    /// Returns the record's sequence number.
    ///
    /// # Errors
    ///
    /// Returns a metadata error if `names` and `annotations` disagree on the
    /// batch size. Annotations may be empty for unlabelled batches.
    ///
    /// # Panics
    ///
    /// Panics if more than `depth + 1` records would be pending, which means the
    /// producer attached without a matching slot.
    pub fn attach(&self, names: Vec<String>, annotations: AnnotationBatch) -> Result<u64> {
        if !annotations.is_empty() && annotations.len() != names.len() {
            return Err(PrefetchError::metadata(format!(
                "batch has {} sample names but {} annotations",
                names.len(),
                annotations.len()
            )));
        }

        let mut state = self.lock();
        assert!(
            state.fifo.len() < self.records,
            "protocol violation: attach with {} records already pending (depth {})",
            state.fifo.len(),
            self.depth
        );

        for field in MetadataField::ALL {
            let needed = annotations.packed_len(field);
            if needed > state.capacities[field.index()] {
                Self::grow_locked(&mut state, field, needed.next_power_of_two());
            }
            let slot = state.write_idx;
            let buffer = &mut state.fields[slot][field.index()];
            annotations.pack_into(field, &mut buffer.data[..needed]);
            buffer.used = needed;
        }

        let sequence = state.attached;
        let dims = annotations.dims();
        state.fifo.push_back(Arc::new(MetadataRecord {
            sequence,
            sample_names: names,
            annotations,
            dims,
        }));
        state.write_idx = (state.write_idx + 1) % self.records;
        state.attached += 1;
        Ok(sequence)
    }

    /// Marks one more record as belonging to a committed slot.
    pub(crate) fn seal(&self) {
        self.lock().sealed += 1;
    }

    /// Withdraws the newest record if its slot was never committed.
    ///
    /// A record attached after its slot's commit is already sealed and
    /// stays in place.
    pub(crate) fn retract_unsealed(&self) -> Option<Arc<MetadataRecord>> {
        let mut state = self.lock();
        if state.attached <= state.sealed {
            return None;
        }
        let record = state.fifo.pop_back()?;
        state.write_idx = (state.write_idx + self.records - 1) % self.records;
        state.attached -= 1;
        let slot = state.write_idx;
        state.fields[slot].iter_mut().for_each(|f| f.used = 0);
        Some(record)
    }

    /// Returns the record paired with the slot at the ring's read position.
    pub fn peek_current(&self) -> Option<Arc<MetadataRecord>> {
        self.lock().fifo.front().cloned()
    }

    /// Runs `f` over the packed field bytes of the head record.
    pub fn with_current_fields<R>(&self, f: impl FnOnce(&PackedFields<'_>) -> R) -> Option<R> {
        let state = self.lock();
        if state.fifo.is_empty() {
            return None;
        }
        let slot = &state.fields[state.read_idx];
        let packed = PackedFields {
            slices: [
                &slot[0].data[..slot[0].used],
                &slot[1].data[..slot[1].used],
                &slot[2].data[..slot[2].used],
            ],
        };
        Some(f(&packed))
    }

    /// Pops the head record.
    ///
    /// # Panics
    ///
    /// Panics if no record is pending.
    pub fn consume(&self) -> Arc<MetadataRecord> {
        let mut state = self.lock();
        let record = state
            .fifo
            .pop_front()
            .unwrap_or_else(|| panic!("protocol violation: consume on empty metadata channel"));
        state.read_idx = (state.read_idx + 1) % self.records;
        state.consumed += 1;
        record
    }

    /// Grows a field's per-slot buffers to `new_size` bytes.
    ///
    /// Growing to the current capacity is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a metadata error if `new_size` is smaller than the current
    /// capacity; packed data of pending records would not fit.
    pub fn grow_field(&self, field: MetadataField, new_size: usize) -> Result<()> {
        let mut state = self.lock();
        let current = state.capacities[field.index()];
        if new_size < current {
            return Err(PrefetchError::metadata(format!(
                "cannot shrink {} field from {} to {} bytes",
                field.as_str(),
                current,
                new_size
            )));
        }
        if new_size > current {
            Self::grow_locked(&mut state, field, new_size);
        }
        Ok(())
    }

    fn grow_locked(state: &mut ChannelState, field: MetadataField, new_size: usize) {
        for slot in state.fields.iter_mut() {
            slot[field.index()].data.resize(new_size, 0);
        }
        debug!(
            field = field.as_str(),
            from = state.capacities[field.index()],
            to = new_size,
            "grew metadata field"
        );
        state.capacities[field.index()] = new_size;
    }

    /// Current per-slot capacity of `field` in bytes.
    pub fn field_capacity(&self, field: MetadataField) -> usize {
        self.lock().capacities[field.index()]
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (attached, consumed) totals since init or the last reset.
    pub fn counts(&self) -> (u64, u64) {
        let state = self.lock();
        (state.attached, state.consumed)
    }

    /// Drops pending records and rewinds, keeping field allocations.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.fifo.clear();
        state.write_idx = 0;
        state.read_idx = 0;
        state.attached = 0;
        state.sealed = 0;
        state.consumed = 0;
        for slot in state.fields.iter_mut() {
            slot.iter_mut().for_each(|f| f.used = 0);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}-{}", prefix, i)).collect()
    }

    fn labelled(labels: &[i32]) -> AnnotationBatch {
        AnnotationBatch::from_samples(
            labels
                .iter()
                .map(|&l| SampleAnnotation {
                    labels: vec![l],
                    ..Default::default()
                })
                .collect(),
        )
    }

    #[test]
    fn test_fifo_order() {
        let channel = MetadataChannel::new(3, [64, 64, 0]);
        channel.attach(names("a", 2), labelled(&[1, 2])).unwrap();
        channel.attach(names("b", 2), labelled(&[3, 4])).unwrap();

        let head = channel.peek_current().unwrap();
        assert_eq!(head.sequence, 0);
        assert_eq!(head.sample_names, vec!["a-0", "a-1"]);

        assert_eq!(channel.consume().sample_names[0], "a-0");
        assert_eq!(channel.consume().sample_names[0], "b-0");
        assert!(channel.is_empty());
        assert_eq!(channel.counts(), (2, 2));
    }

    #[test]
    fn test_packed_fields_follow_read_position() {
        let channel = MetadataChannel::new(2, [64, 64, 64]);
        channel.attach(names("a", 2), labelled(&[7, 8])).unwrap();

        let boxes = AnnotationBatch::from_samples(vec![SampleAnnotation {
            labels: vec![5],
            boxes: vec![BoundingBox::new(0.0, 0.5, 1.0, 1.5)],
            mask: vec![0.25, 0.75],
        }]);
        channel.attach(names("b", 1), boxes).unwrap();

        let labels = channel.with_current_fields(|f| f.labels()).unwrap();
        assert_eq!(labels, vec![7, 8]);
        channel.consume();

        channel
            .with_current_fields(|f| {
                assert_eq!(f.labels(), vec![5]);
                assert_eq!(f.boxes(), vec![BoundingBox::new(0.0, 0.5, 1.0, 1.5)]);
                assert_eq!(f.mask_coords(), vec![0.25, 0.75]);
            })
            .unwrap();
    }

    #[test]
    fn test_attach_grows_field_on_demand() {
        let channel = MetadataChannel::new(2, [4, 16, 0]);
        let many_boxes = AnnotationBatch::from_samples(vec![SampleAnnotation {
            labels: vec![1],
            boxes: vec![BoundingBox::default(); 5],
            mask: vec![],
        }]);

        channel.attach(names("x", 1), many_boxes).unwrap();
        // 5 boxes * 16 bytes = 80, rounded to the next power of two
        assert_eq!(channel.field_capacity(MetadataField::Boxes), 128);
        assert_eq!(channel.field_capacity(MetadataField::Labels), 4);

        let dims = channel.peek_current().unwrap().dims.clone();
        assert_eq!(dims.boxes, vec![5]);
        assert_eq!(channel.with_current_fields(|f| f.boxes().len()), Some(5));
    }

    #[test]
    fn test_grow_field_explicit() {
        let channel = MetadataChannel::new(1, [16, 16, 16]);
        channel.grow_field(MetadataField::Masks, 1024).unwrap();
        assert_eq!(channel.field_capacity(MetadataField::Masks), 1024);

        // Same size is a no-op, smaller is rejected
        channel.grow_field(MetadataField::Masks, 1024).unwrap();
        let err = channel.grow_field(MetadataField::Masks, 8).unwrap_err();
        assert!(err.to_string().contains("cannot shrink"));
    }

    #[test]
    fn test_attach_rejects_mismatched_batch() {
        let channel = MetadataChannel::new(2, [16, 16, 16]);
        let result = channel.attach(names("a", 3), labelled(&[1]));
        assert!(matches!(result, Err(PrefetchError::Metadata { .. })));
        assert!(channel.is_empty());

        // Unlabelled batches carry names only
        channel.attach(names("a", 3), AnnotationBatch::new()).unwrap();
        assert_eq!(channel.len(), 1);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_attach_beyond_depth_panics() {
        let channel = MetadataChannel::new(1, [16, 16, 16]);
        channel.attach(names("a", 1), labelled(&[1])).unwrap();
        // Released but not yet consumed
        channel.attach(names("b", 1), labelled(&[2])).unwrap();
        let _ = channel.attach(names("c", 1), labelled(&[3]));
    }

    #[test]
    fn test_retract_withdraws_only_uncommitted_record() {
        let channel = MetadataChannel::new(2, [16, 16, 16]);
        channel.attach(names("a", 1), labelled(&[1])).unwrap();
        channel.seal();

        // Attached for a slot that is then abandoned
        channel.attach(names("b", 1), labelled(&[2])).unwrap();
        let withdrawn = channel.retract_unsealed().unwrap();
        assert_eq!(withdrawn.sample_names, vec!["b-0"]);
        assert_eq!(channel.len(), 1);
        assert_eq!(channel.counts(), (1, 0));

        // Nothing unsealed left
        assert!(channel.retract_unsealed().is_none());

        // The next attach reuses the withdrawn sequence and field buffers
        let seq = channel.attach(names("c", 1), labelled(&[3])).unwrap();
        assert_eq!(seq, 1);
        channel.seal();

        assert_eq!(channel.with_current_fields(|f| f.labels()), Some(vec![1]));
        assert_eq!(channel.consume().sample_names, vec!["a-0"]);
        assert_eq!(channel.with_current_fields(|f| f.labels()), Some(vec![3]));
        assert_eq!(channel.consume().sample_names, vec!["c-0"]);
    }

    #[test]
    fn test_retract_keeps_record_attached_after_commit() {
        let channel = MetadataChannel::new(2, [16, 16, 16]);
        // Commit first, then attach
        channel.seal();
        channel.attach(names("a", 1), labelled(&[1])).unwrap();

        assert!(channel.retract_unsealed().is_none());
        assert_eq!(channel.len(), 1);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_consume_empty_panics() {
        let channel = MetadataChannel::new(1, [16, 16, 16]);
        channel.consume();
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let channel = MetadataChannel::new(2, [16, 16, 16]);
        channel.grow_field(MetadataField::Labels, 256).unwrap();
        channel.attach(names("a", 1), labelled(&[1])).unwrap();

        channel.reset();
        assert!(channel.is_empty());
        assert_eq!(channel.counts(), (0, 0));
        assert_eq!(channel.field_capacity(MetadataField::Labels), 256);

        let seq = channel.attach(names("b", 1), labelled(&[2])).unwrap();
        assert_eq!(seq, 0);
    }
}
