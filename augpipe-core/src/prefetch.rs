// augpipe-core/src/prefetch.rs

//! Background producer driving a [`RingBuffer`].
//!
//! [`Prefetcher`] runs a [`BatchProducer`] on its own thread, so the
//! training loop can work on one slot while the next batches are decoded
//! and augmented into the others. The thread follows the producer contract
//! (`block_if_full`, acquire, fill, attach, commit) and the consumer side
//! follows the matching contract in [`Prefetcher::next_batch`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{PrefetchError, Result};
use crate::metadata::{AnnotationBatch, MetadataRecord};
use crate::ring::{ReadSlot, RingBuffer, WaitStatus, WriteSlot};

/// Payload description returned by a producer for one filled slot.
#[derive(Debug, Clone, Default)]
pub struct ProducedBatch {
    /// Per-sample identifiers, in batch order.
    pub names: Vec<String>,
    /// Per-sample labels, boxes and masks. May be empty.
    pub annotations: AnnotationBatch,
}

impl ProducedBatch {
    pub fn new(names: Vec<String>, annotations: AnnotationBatch) -> Self {
        Self { names, annotations }
    }
}

/// Decode/augmentation stage that fills ring slots.
pub trait BatchProducer: Send {
    /// Fills `slot` with the next batch.
    ///
    /// Returns `Ok(None)` at end of stream; the slot is then returned
    /// unpublished. Retries for upstream failures belong here: a returned
    /// error ends the stream.
    fn fill(&mut self, slot: &mut WriteSlot<'_>) -> Result<Option<ProducedBatch>>;
}

impl<F> BatchProducer for F
where
    F: FnMut(&mut WriteSlot<'_>) -> Result<Option<ProducedBatch>> + Send,
{
    fn fill(&mut self, slot: &mut WriteSlot<'_>) -> Result<Option<ProducedBatch>> {
        self(slot)
    }
}

/// Owns the producer thread for one ring and hands batches to the consumer.
pub struct Prefetcher {
    ring: Arc<RingBuffer>,
    errors: Receiver<PrefetchError>,
    produced: Arc<AtomicU64>,
    producer_thread: Option<JoinHandle<()>>,
    exhausted: bool,
}

impl Prefetcher {
    /// Starts `producer` on a background thread.
    ///
    /// The ring must already be initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<P>(ring: Arc<RingBuffer>, producer: P) -> Result<Self>
    where
        P: BatchProducer + 'static,
    {
        assert!(
            ring.is_initialized(),
            "protocol violation: prefetcher started on an uninitialized ring"
        );
        let (sender, errors) = channel::unbounded();
        let produced = Arc::new(AtomicU64::new(0));

        let thread_ring = ring.clone();
        let thread_produced = produced.clone();
        let producer_thread = thread::Builder::new()
            .name("augpipe-producer".to_string())
            .spawn(move || {
                let mut producer = producer;
                let guard = ExitGuard {
                    ring: &thread_ring,
                    errors: &sender,
                };
                run_producer(&thread_ring, &mut producer, &sender, &thread_produced);
                drop(guard);
            })
            .map_err(|e| {
                PrefetchError::producer(format!("failed to spawn producer thread: {}", e))
            })?;

        Ok(Self {
            ring,
            errors,
            produced,
            producer_thread: Some(producer_thread),
            exhausted: false,
        })
    }

    /// Waits for the next batch and runs `f` over its slot and metadata.
    ///
    /// The slot is released and its metadata consumed once `f` returns.
    /// `f` receives no record when the ring carries no metadata channel.
    ///
    /// Returns `Ok(None)` at end of stream, after a stop, or when a
    /// consumer-wait cancellation woke the call before a batch arrived.
    ///
    /// # Errors
    ///
    /// Returns [`PrefetchError::Producer`] once every batch committed before
    /// a producer failure has been delivered.
    pub fn next_batch<R, F>(&mut self, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut ReadSlot<'_>, Option<&MetadataRecord>) -> R,
    {
        if self.exhausted {
            return Ok(None);
        }
        let status = self.ring.block_if_empty();
        self.visit(status, f)
    }

    fn visit<R, F>(&mut self, status: WaitStatus, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut ReadSlot<'_>, Option<&MetadataRecord>) -> R,
    {
        match status {
            WaitStatus::Ready => {}
            WaitStatus::Cancelled | WaitStatus::TimedOut => return Ok(None),
            WaitStatus::EndOfStream | WaitStatus::Stopped => {
                self.exhausted = true;
                return match self.errors.try_recv() {
                    Ok(e) => Err(e),
                    Err(_) => Ok(None),
                };
            }
        }

        let mut slot = self.ring.acquire_read_slot();
        let record = if self.ring.has_metadata() {
            self.ring.peek_current()
        } else {
            None
        };
        let out = f(&mut slot, record.as_deref());
        slot.release();
        if record.is_some() {
            self.ring.consume();
        }
        Ok(Some(out))
    }

    /// The ring this prefetcher drives.
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Batches committed by the producer so far.
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Stops the ring if the producer is still running and joins its thread.
    ///
    /// Batches still in the ring are abandoned.
    pub fn stop(&mut self) {
        if let Some(thread) = self.producer_thread.take() {
            if !thread.is_finished() {
                self.ring.stop();
            }
            if thread.join().is_err() {
                warn!("producer thread panicked");
            }
            self.exhausted = true;
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Ends the stream if the producer thread unwinds, so a consumer parked in
/// `block_if_empty` is not left waiting for batches that will never come.
/// A slot the producer held while unwinding is returned to Empty, which
/// keeps the ring resettable for the next epoch.
struct ExitGuard<'a> {
    ring: &'a RingBuffer,
    errors: &'a Sender<PrefetchError>,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let _ = self
                .errors
                .send(PrefetchError::producer("producer thread panicked"));
            self.ring.abandon_orphaned_write();
            self.ring.finish();
        }
    }
}

fn run_producer<P: BatchProducer>(
    ring: &RingBuffer,
    producer: &mut P,
    errors: &Sender<PrefetchError>,
    produced: &AtomicU64,
) {
    loop {
        let status = ring.block_if_full();
        if !status.is_ready() {
            debug!(?status, "producer wait ended");
            return;
        }

        let mut slot = ring.acquire_write_slot();
        let batch = match producer.fill(&mut slot) {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                slot.abandon();
                debug!(
                    produced = produced.load(Ordering::Relaxed),
                    "producer reached end of stream"
                );
                ring.finish();
                return;
            }
            Err(e) => {
                slot.abandon();
                fail(ring, errors, e);
                return;
            }
        };

        if ring.has_metadata() {
            if let Err(e) = ring.attach(batch.names, batch.annotations) {
                slot.abandon();
                fail(ring, errors, e);
                return;
            }
        }
        if !slot.commit() {
            debug!("ring stopped while filling, batch discarded");
            return;
        }
        produced.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reports a producer failure to the consumer and ends the stream.
fn fail(ring: &RingBuffer, errors: &Sender<PrefetchError>, error: PrefetchError) {
    warn!(error = %error, "producer failed, ending stream");
    let error = match error {
        e @ PrefetchError::Producer { .. } => e,
        other => PrefetchError::producer(other.to_string()),
    };
    // The error is queued before the ring drains so the consumer sees it at
    // end of stream.
    let _ = errors.send(error);
    ring.finish();
}

/// Async adapter over a [`Prefetcher`].
///
/// The blocking wait for the next batch runs on tokio's blocking pool; the
/// visitor then runs on the calling task.
pub struct AsyncBatchReader {
    inner: Prefetcher,
}

impl AsyncBatchReader {
    pub fn new(inner: Prefetcher) -> Self {
        Self { inner }
    }

    /// Async counterpart of [`Prefetcher::next_batch`].
    ///
    /// Must be called from within a tokio runtime.
    pub async fn next_batch<R, F>(&mut self, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut ReadSlot<'_>, Option<&MetadataRecord>) -> R,
    {
        if self.inner.exhausted {
            return Ok(None);
        }
        let ring = self.inner.ring.clone();
        let status = tokio::task::spawn_blocking(move || ring.block_if_empty())
            .await
            .map_err(|e| PrefetchError::producer(format!("consumer wait task failed: {}", e)))?;
        self.inner.visit(status, f)
    }

    pub fn prefetcher(&self) -> &Prefetcher {
        &self.inner
    }

    pub fn into_inner(self) -> Prefetcher {
        self.inner
    }
}
