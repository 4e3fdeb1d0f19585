// augpipe-core/src/ring/mod.rs

//! Bounded slot ring between an augmentation producer and a training
//! consumer.
//!
//! The producer fills slot N+1 while the consumer trains on slot N. A slot
//! moves through `Empty -> Writing -> Full -> Reading -> Empty`; only the
//! producer touches `Writing` slots and only the consumer touches `Reading`
//! slots. At most `depth` slots are committed and unreleased at once.
//!
//! Misusing the protocol (acquiring a write slot on a full ring, releasing
//! without a read, initializing twice) is a programming error and panics
//! with a `protocol violation:` message. Allocation failures are returned
//! as errors.

mod buffer;
mod slot_store;
mod sync;

pub use buffer::RingBuffer;
pub use slot_store::{ReadSlot, SlotLayout, WriteSlot};
pub use sync::{RingStats, RunState, SlotState, WaitStatus};
