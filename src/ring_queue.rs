//! Bounded multi-producer multi-consumer ring queue of `u32` values living in
//! a [`SharedRegion`].
//!
//! Every slot carries a sequence word next to its value. A producer may write
//! slot `pos & mask` only once its sequence equals `pos`; a consumer may read
//! it only once the sequence equals `pos + 1`. Reserving a position (CAS on
//! `tail`/`head`) and publishing it (sequence store) are separate steps, so
//! no reader ever observes a reserved but unwritten slot.
//!
//! Word layout at `base_offset`:
//!
//! ```text
//! [head, tail, publish, sleepers, seq_0 .. seq_{C-1}, value_0 .. value_{C-1}]
//! ```
//!
//! `head` and `tail` are free-running counters (wrapping at 2^32), so all `C`
//! slots are usable: empty is `tail == head`, full is `tail - head == C`.
//! `publish` is bumped after each value becomes visible and is the futex word
//! blocking consumers sleep on; `sleepers` lets producers skip the notify
//! when nobody is waiting.

use crate::atomics::{AtomicBackend, AtomicWordOps};
use crate::error::QueueError;
use crate::region::SharedRegion;
use crossbeam::utils::Backoff;
use std::time::{Duration, Instant};

const HEAD: usize = 0;
const TAIL: usize = 1;
const PUBLISH: usize = 2;
const SLEEPERS: usize = 3;
const HEADER_WORDS: usize = 4;

/// Bounded MPMC queue over shared memory
pub struct BoundedRingQueue {
    ops: AtomicWordOps,
    capacity: u32,
    mask: u32,
}

impl BoundedRingQueue {
    /// Bytes needed for a queue of `capacity` slots
    pub const fn required_bytes(capacity: u32) -> usize {
        (HEADER_WORDS + 2 * capacity as usize) * 4
    }

    /// Lays out and initializes a queue at `base_offset`.
    pub fn new(region: &SharedRegion, base_offset: usize, capacity: u32) -> Result<Self, QueueError> {
        let queue = Self::attach(region, base_offset, capacity)?;
        queue.ops.store(HEAD, 0);
        queue.ops.store(TAIL, 0);
        queue.ops.store(PUBLISH, 0);
        queue.ops.store(SLEEPERS, 0);
        for slot in 0..capacity {
            queue.ops.store(queue.seq_index(slot), slot);
        }
        Ok(queue)
    }

    /// Binds to a queue that another context already initialized.
    pub fn attach(region: &SharedRegion, base_offset: usize, capacity: u32) -> Result<Self, QueueError> {
        Self::attach_with_backend(region, base_offset, capacity, AtomicBackend::Native)
    }

    /// Binds to an initialized queue with an explicit atomics backend.
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
    fn seq_index(&self, slot: u32) -> usize {
        HEADER_WORDS + slot as usize
    }

    #[inline]
    fn value_index(&self, slot: u32) -> usize {
        HEADER_WORDS + self.capacity as usize + slot as usize
    }

    /// Attempts to append `value`; returns `false` when the queue is full.
    pub fn try_enqueue(&self, value: u32) -> bool {
        let mut pos = self.ops.load(TAIL);
        loop {
            let slot = pos & self.mask;
            let seq = self.ops.load(self.seq_index(slot));
            let diff = seq.wrapping_sub(pos) as i32;

            if diff == 0 {
                if self.ops.compare_exchange_succeeded(TAIL, pos, pos.wrapping_add(1)) {
                    self.ops.store(self.value_index(slot), value);
                    self.ops.store(self.seq_index(slot), pos.wrapping_add(1));
                    self.ops.increment(PUBLISH);
                    if self.ops.load(SLEEPERS) > 0 {
                        self.ops.notify(PUBLISH, 1);
                    }
                    return true;
                }
                pos = self.ops.load(TAIL);
            } else if diff < 0 {
                // Slot still holds an unconsumed value from the previous lap
                return false;
            } else {
                pos = self.ops.load(TAIL);
            }
        }
    }

    /// Appends `value`, spinning while the queue is full.
    pub fn enqueue(&self, value: u32) {
        let backoff = Backoff::new();
        while !self.try_enqueue(value) {
            backoff.spin();
        }
    }

    /// Attempts to remove the oldest value; `None` when the queue is empty.
    pub fn try_dequeue(&self) -> Option<u32> {
        let mut pos = self.ops.load(HEAD);
        loop {
            let slot = pos & self.mask;
            let seq = self.ops.load(self.seq_index(slot));
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i32;

            if diff == 0 {
                if self.ops.compare_exchange_succeeded(HEAD, pos, pos.wrapping_add(1)) {
                    let value = self.ops.load(self.value_index(slot));
                    self.ops
                        .store(self.seq_index(slot), pos.wrapping_add(self.capacity));
                    return Some(value);
                }
                pos = self.ops.load(HEAD);
            } else if diff < 0 {
                return None;
            } else {
                pos = self.ops.load(HEAD);
            }
        }
    }

    /// Removes the oldest value, sleeping while the queue is empty.
    ///
    /// `None` waits indefinitely; otherwise returns `None` once `timeout`
    /// elapses with nothing to take.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<u32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let epoch = self.ops.load(PUBLISH);
            if let Some(value) = self.try_dequeue() {
                return Some(value);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            self.ops.increment(SLEEPERS);
            self.ops.wait(PUBLISH, epoch, remaining);
            self.ops.decrement(SLEEPERS);
        }
    }

    /// Snapshot of the number of queued values
    pub fn len(&self) -> usize {
        let tail = self.ops.load(TAIL);
        let head = self.ops.load(HEAD);
        (tail.wrapping_sub(head) as i32).clamp(0, self.capacity as i32) as usize
    }

    /// Snapshot emptiness check
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot fullness check
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity as usize
    }

    /// Number of slots
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
