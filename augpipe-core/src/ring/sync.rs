// augpipe-core/src/ring/sync.rs

//! Bounded blocking between one producer and one consumer.
//!
//! All slot bookkeeping (`write_ptr`, `read_ptr`, `level`, per-slot states,
//! the cancellation flag and the run state) lives behind one mutex. The
//! producer parks on `not_full`, the consumer on `not_empty`. Every wait
//! predicate, including the cancellation flag, is evaluated under that mutex,
//! so a `commit`/`release` racing a cancel cannot lose a wakeup.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle position of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    /// Owned by the producer, not yet visible to the consumer.
    Writing,
    /// Committed and visible to the consumer.
    Full,
    /// Owned by the consumer.
    Reading,
}

/// Whether the ring accepts and delivers batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Running,
    /// The producer reached end of stream. Committed slots are still
    /// delivered; once they are gone the consumer sees end of stream.
    Draining,
    /// Abandoned. Every wait returns immediately and committed slots are
    /// never delivered.
    Stopped,
}

/// Outcome of a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The caller may acquire its slot.
    Ready,
    /// A cancel woke the caller before its condition held.
    Cancelled,
    /// The producer finished and every committed slot has been consumed.
    EndOfStream,
    /// The ring was stopped.
    Stopped,
    /// The timeout elapsed before the condition held.
    TimedOut,
}

impl WaitStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitStatus::Ready)
    }
}

/// Point-in-time counters of a ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingStats {
    pub depth: usize,
    pub level: usize,
    pub commits: u64,
    pub releases: u64,
    /// Times the producer found the ring full and had to park.
    pub producer_waits: u64,
    /// Times the consumer found the ring empty and had to park.
    pub consumer_waits: u64,
    pub state: RunState,
}

#[derive(Debug)]
struct RingState {
    write_ptr: usize,
    read_ptr: usize,
    level: usize,
    slots: Vec<SlotState>,
    cancelled: bool,
    run: RunState,
    commits: u64,
    releases: u64,
    producer_waits: u64,
    consumer_waits: u64,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Producer,
    Consumer,
}

#[derive(Debug)]
pub(crate) struct SyncCore {
    depth: usize,
    state: Mutex<RingState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl SyncCore {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            depth,
            state: Mutex::new(RingState {
                write_ptr: 0,
                read_ptr: 0,
                level: 0,
                slots: vec![SlotState::Empty; depth],
                cancelled: false,
                run: RunState::Running,
                commits: 0,
                releases: 0,
                producer_waits: 0,
                consumer_waits: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the slot at `write_ptr` as Writing and returns its index.
    pub(crate) fn begin_write(&self) -> usize {
        let mut state = self.lock();
        // Stopped is tolerated: a stop may land between the wait and the
        // acquire, and commit discards the slot.
        assert!(
            state.run != RunState::Draining,
            "protocol violation: acquire_write_slot after finish"
        );
        assert!(
            state.level < self.depth,
            "protocol violation: acquire_write_slot on a full ring"
        );
        let idx = state.write_ptr;
        match state.slots[idx] {
            SlotState::Empty => state.slots[idx] = SlotState::Writing,
            // Re-acquiring the slot being written is idempotent.
            SlotState::Writing => {}
            other => panic!("protocol violation: write slot {} is {:?}", idx, other),
        }
        idx
    }

    /// Marks the slot at `read_ptr` as Reading and returns its index.
    pub(crate) fn begin_read(&self) -> usize {
        let mut state = self.lock();
        assert!(
            state.level > 0,
            "protocol violation: acquire_read_slot on an empty ring"
        );
        let idx = state.read_ptr;
        match state.slots[idx] {
            SlotState::Full => state.slots[idx] = SlotState::Reading,
            SlotState::Reading => {}
            other => panic!("protocol violation: read slot {} is {:?}", idx, other),
        }
        idx
    }

    /// Producer-side push.
    ///
    /// Returns false if the ring was stopped while the slot was being
    /// written; the slot is then returned to Empty and never delivered.
    pub(crate) fn commit(&self) -> bool {
        let mut state = self.lock();
        let idx = state.write_ptr;
        assert!(
            state.slots[idx] == SlotState::Writing,
            "protocol violation: commit of slot {} in state {:?}",
            idx,
            state.slots[idx]
        );
        if state.run == RunState::Stopped {
            state.slots[idx] = SlotState::Empty;
            return false;
        }
        assert!(
            state.run == RunState::Running,
            "protocol violation: commit while {:?}",
            state.run
        );
        state.slots[idx] = SlotState::Full;
        state.write_ptr = (state.write_ptr + 1) % self.depth;
        state.level += 1;
        state.commits += 1;
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Returns the slot being written to Empty without publishing it.
    pub(crate) fn abandon_write(&self) {
        let mut state = self.lock();
        let idx = state.write_ptr;
        assert!(
            state.slots[idx] == SlotState::Writing,
            "protocol violation: abandon of slot {} in state {:?}",
            idx,
            state.slots[idx]
        );
        state.slots[idx] = SlotState::Empty;
    }

    /// Returns the slot at `write_ptr` to Empty if it is still Writing.
    ///
    /// Used when the producer unwinds with a slot in hand. Returns whether a
    /// slot was abandoned.
    pub(crate) fn abandon_write_if_writing(&self) -> bool {
        let mut state = self.lock();
        let idx = state.write_ptr;
        if state.slots[idx] != SlotState::Writing {
            return false;
        }
        state.slots[idx] = SlotState::Empty;
        true
    }

    /// Consumer-side pop.
    pub(crate) fn release(&self) -> usize {
        let mut state = self.lock();
        let idx = state.read_ptr;
        assert!(
            state.slots[idx] == SlotState::Reading,
            "protocol violation: release of slot {} in state {:?}",
            idx,
            state.slots[idx]
        );
        state.slots[idx] = SlotState::Empty;
        state.read_ptr = (state.read_ptr + 1) % self.depth;
        state.level -= 1;
        state.releases += 1;
        drop(state);
        self.not_full.notify_one();
        idx
    }

    fn evaluate(&self, state: &RingState, side: Side) -> Option<WaitStatus> {
        if state.run == RunState::Stopped {
            return Some(WaitStatus::Stopped);
        }
        match side {
            Side::Producer => {
                if state.run == RunState::Draining {
                    return Some(WaitStatus::Stopped);
                }
                if state.level < self.depth {
                    return Some(WaitStatus::Ready);
                }
            }
            Side::Consumer => {
                if state.level > 0 {
                    return Some(WaitStatus::Ready);
                }
                if state.run == RunState::Draining {
                    return Some(WaitStatus::EndOfStream);
                }
            }
        }
        if state.cancelled {
            return Some(WaitStatus::Cancelled);
        }
        None
    }

    fn wait(&self, side: Side, timeout: Option<Duration>) -> WaitStatus {
        let condvar = match side {
            Side::Producer => &self.not_full,
            Side::Consumer => &self.not_empty,
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.lock();
        if let Some(status) = self.evaluate(&state, side) {
            return status;
        }
        match side {
            Side::Producer => state.producer_waits += 1,
            Side::Consumer => state.consumer_waits += 1,
        }

        loop {
            state = match deadline {
                None => condvar.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitStatus::TimedOut;
                    }
                    condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
            if let Some(status) = self.evaluate(&state, side) {
                return status;
            }
        }
    }

    pub(crate) fn block_if_full(&self) -> WaitStatus {
        self.wait(Side::Producer, None)
    }

    pub(crate) fn block_if_empty(&self) -> WaitStatus {
        self.wait(Side::Consumer, None)
    }

    pub(crate) fn block_if_full_timeout(&self, timeout: Duration) -> WaitStatus {
        self.wait(Side::Producer, Some(timeout))
    }

    pub(crate) fn block_if_empty_timeout(&self, timeout: Duration) -> WaitStatus {
        self.wait(Side::Consumer, Some(timeout))
    }

    /// Sets the shared cancellation flag and wakes every waiter.
    pub(crate) fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        drop(state);
        self.notify_all();
    }

    pub(crate) fn set_run_state(&self, run: RunState) -> RunState {
        let mut state = self.lock();
        let previous = state.run;
        // Stopped is terminal until reset.
        if previous != RunState::Stopped {
            state.run = run;
        }
        drop(state);
        self.notify_all();
        previous
    }

    fn notify_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Rewinds pointers and level and returns to Running.
    ///
    /// Returns the number of committed slots that were discarded.
    pub(crate) fn reset(&self) -> usize {
        let mut state = self.lock();
        // A stopped ring may be reset with slots still marked in flight.
        assert!(
            state.run == RunState::Stopped
                || !state
                    .slots
                    .iter()
                    .any(|s| matches!(s, SlotState::Writing | SlotState::Reading)),
            "protocol violation: reset while a slot is being written or read"
        );
        let discarded = state.level;
        state.write_ptr = 0;
        state.read_ptr = 0;
        state.level = 0;
        state.slots.iter_mut().for_each(|s| *s = SlotState::Empty);
        state.cancelled = false;
        state.run = RunState::Running;
        drop(state);
        self.notify_all();
        discarded
    }

    pub(crate) fn level(&self) -> usize {
        self.lock().level
    }

    pub(crate) fn run_state(&self) -> RunState {
        self.lock().run
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub(crate) fn slot_state(&self, idx: usize) -> SlotState {
        self.lock().slots[idx]
    }

    pub(crate) fn pointers(&self) -> (usize, usize) {
        let state = self.lock();
        (state.write_ptr, state.read_ptr)
    }

    pub(crate) fn stats(&self) -> RingStats {
        let state = self.lock();
        RingStats {
            depth: self.depth,
            level: state.level,
            commits: state.commits,
            releases: state.releases,
            producer_waits: state.producer_waits,
            consumer_waits: state.consumer_waits,
            state: state.run,
        }
    }
}
