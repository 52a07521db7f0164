//! Chase-Lev work-stealing deque of task handles in a [`SharedRegion`].
//!
//! The owner pushes and pops at `bottom` (LIFO); any thread may steal at
//! `top` (FIFO). Only a CAS on `top` arbitrates between a thief and the owner
//! taking the last element, so every pushed handle is claimed exactly once.
//!
//! Word layout at `base_offset`:
//!
//! ```text
//! [top, bottom, slot_0 .. slot_{C-1}]
//! ```
//!
//! Indices are free-running `u32` counters; their difference, read as a
//! signed value, is the size. The `bottom` word doubles as the futex word
//! an idle thief sleeps on until the owner pushes.

use crate::atomics::{AtomicBackend, AtomicWordOps, WAKE_ALL, WaitResult};
use crate::error::QueueError;
use crate::region::SharedRegion;
use std::time::Duration;

const TOP: usize = 0;
const BOTTOM: usize = 1;
const HEADER_WORDS: usize = 2;

/// Work-stealing deque over shared memory.
///
/// `push` and `pop` must only be called by the single owning context.
pub struct WorkStealingDeque {
    ops: AtomicWordOps,
    capacity: u32,
    mask: u32,
}

impl WorkStealingDeque {
    /// Bytes needed for a deque of `capacity` handles
    pub const fn required_bytes(capacity: u32) -> usize {
        (HEADER_WORDS + capacity as usize) * 4
    }

    /// Lays out an empty deque at `base_offset`.
    pub fn new(region: &SharedRegion, base_offset: usize, capacity: u32) -> Result<Self, QueueError> {
        let deque = Self::attach(region, base_offset, capacity)?;
        deque.ops.store(TOP, 0);
        deque.ops.store(BOTTOM, 0);
        Ok(deque)
    }

    /// Binds to a deque that another context already laid out.
    pub fn attach(region: &SharedRegion, base_offset: usize, capacity: u32) -> Result<Self, QueueError> {
        Self::attach_with_backend(region, base_offset, capacity, AtomicBackend::Native)
    }

    /// Binds to a deque with an explicit atomics backend.
    pub fn attach_with_backend(
        region: &SharedRegion,
        base_offset: usize,
        capacity: u32,
        backend: AtomicBackend,
    ) -> Result<Self, QueueError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QueueError::CapacityNotPowerOfTwo { capacity });
        }
        let required = Self::required_bytes(capacity);
        let available = region.byte_length().saturating_sub(base_offset);
        if required > available {
            return Err(QueueError::RegionTooSmall {
                required,
                offset: base_offset,
                available,
            });
        }
        let view = region.word_view(base_offset, Some(required / 4))?;
        Ok(Self {
            ops: AtomicWordOps::with_backend(view, backend)?,
            capacity,
            mask: capacity - 1,
        })
    }

    #[inline]
    fn slot(&self, index: u32) -> usize {
        HEADER_WORDS + (index & self.mask) as usize
    }

    /// Pushes a handle at the bottom. Owner only.
    ///
    /// Returns `false` when the deque is full.
    pub fn push(&self, handle: u32) -> bool {
        let bottom = self.ops.load(BOTTOM);
        let top = self.ops.load(TOP);
        if bottom.wrapping_sub(top) as i32 >= self.capacity as i32 {
            return false;
        }
        self.ops.store(self.slot(bottom), handle);
        self.ops.store(BOTTOM, bottom.wrapping_add(1));
        true
    }

    /// Pops the most recently pushed handle. Owner only.
    pub fn pop(&self) -> Option<u32> {
        let bottom = self.ops.load(BOTTOM).wrapping_sub(1);
        self.ops.store(BOTTOM, bottom);
        let top = self.ops.load(TOP);
        let size = bottom.wrapping_sub(top) as i32;

        if size < 0 {
            self.ops.store(BOTTOM, top);
            return None;
        }

        let handle = self.ops.load(self.slot(bottom));
        if size > 0 {
            return Some(handle);
        }

        // Last element: race thieves for it through `top`
        let won = self.ops.compare_exchange_succeeded(TOP, top, top.wrapping_add(1));
        self.ops.store(BOTTOM, top.wrapping_add(1));
        won.then_some(handle)
    }

    /// Takes the oldest handle. Safe from any thread.
    ///
    /// Makes a single claim attempt; `None` means empty or a lost race, and
    /// callers decide whether to retry.
    pub fn steal(&self) -> Option<u32> {
        let top = self.ops.load(TOP);
        let bottom = self.ops.load(BOTTOM);
        if bottom.wrapping_sub(top) as i32 <= 0 {
            return None;
        }
        let handle = self.ops.load(self.slot(top));
        self.ops
            .compare_exchange_succeeded(TOP, top, top.wrapping_add(1))
            .then_some(handle)
    }

    /// Snapshot of the number of queued handles
    pub fn len(&self) -> usize {
        let bottom = self.ops.load(BOTTOM);
        let top = self.ops.load(TOP);
        (bottom.wrapping_sub(top) as i32).clamp(0, self.capacity as i32) as usize
    }

    /// Snapshot emptiness check
    pub fn is_empty(&self) -> bool {
        let bottom = self.ops.load(BOTTOM);
        let top = self.ops.load(TOP);
        bottom.wrapping_sub(top) as i32 <= 0
    }

    /// Number of handle slots
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current `bottom` value, the expected value for [`wait_for_work`].
    ///
    /// [`wait_for_work`]: Self::wait_for_work
    pub fn bottom_snapshot(&self) -> u32 {
        self.ops.load(BOTTOM)
    }

    /// Sleeps until `bottom` moves away from `observed` or `timeout` elapses.
    pub fn wait_for_work(&self, observed: u32, timeout: Duration) -> WaitResult {
        self.ops.wait(BOTTOM, observed, Some(timeout))
    }

    /// Wakes every thread sleeping in [`wait_for_work`](Self::wait_for_work).
    pub fn notify_work(&self) -> u32 {
        self.ops.notify(BOTTOM, WAKE_ALL)
    }
}
