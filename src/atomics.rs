//! Atomic read-modify-write and futex-style wait/notify over a [`WordView`].
//!
//! All operations are sequentially consistent. Two backends are available:
//! `Native` maps every RMW onto the hardware instruction, `CompareExchangeLoop`
//! builds each RMW from a load followed by a compare-exchange retry loop.
//! Both produce identical observable results.
//!
//! Waiting parks the thread in `parking_lot_core`'s global queue, keyed by the
//! word's memory address, so every handle to the same memory (including ones
//! rebuilt on a worker from a transferable handle) sees the same waiters.

use crate::error::RegionError;
use crate::region::{SharedRegion, WordView};
use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN, ParkResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Wake every waiter on the address
pub const WAKE_ALL: u32 = u32::MAX;

/// Outcome of [`AtomicWordOps::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a notify
    Ok,
    /// Timeout elapsed first
    TimedOut,
    /// The word did not hold the expected value, no sleep happened
    NotEqual,
}

/// RMW implementation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicBackend {
    /// Hardware RMW instructions
    #[default]
    Native,
    /// Load + compare-exchange retry loop
    CompareExchangeLoop,
}

/// Atomic operations over the words of one view.
///
/// Indices are word offsets within the view.
///
/// # Panics
///
/// Every operation panics when `index` is outside the view, like slice
/// indexing.
pub struct AtomicWordOps {
    view: WordView,
    backend: AtomicBackend,
}

impl AtomicWordOps {
    /// Binds native atomics to a view.
    pub fn new(view: WordView) -> Result<Self, RegionError> {
        Self::with_backend(view, AtomicBackend::Native)
    }

    /// Binds a view with an explicit backend.
    pub fn with_backend(view: WordView, backend: AtomicBackend) -> Result<Self, RegionError> {
        if !SharedRegion::is_shared_memory_supported() {
            return Err(RegionError::Unsupported("32-bit atomics are not available"));
        }
        Ok(Self { view, backend })
    }

    /// Active backend
    pub fn backend(&self) -> AtomicBackend {
        self.backend
    }

    /// Number of addressable words
    pub fn len(&self) -> usize {
        self.view.len()
    }

    /// Whether the view has no words
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicU32 {
        &self.view.as_slice()[index]
    }

    /// Builds an RMW from load + CAS; returns the previous value.
    #[inline]
    fn update(&self, index: usize, f: impl Fn(u32) -> u32) -> u32 {
        let word = self.word(index);
        let mut current = word.load(Ordering::SeqCst);
        loop {
            match word.compare_exchange_weak(current, f(current), Ordering::SeqCst, Ordering::SeqCst) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reads word `index`
    #[inline]
    pub fn load(&self, index: usize) -> u32 {
        self.word(index).load(Ordering::SeqCst)
    }

    /// Writes `value` to word `index`. Waiters are not woken; follow with
    /// [`notify`](Self::notify) for that.
    #[inline]
    pub fn store(&self, index: usize, value: u32) {
        self.word(index).store(value, Ordering::SeqCst);
    }

    /// Stores `value`, returning the previous value
    pub fn exchange(&self, index: usize, value: u32) -> u32 {
        match self.backend {
            AtomicBackend::Native => self.word(index).swap(value, Ordering::SeqCst),
            AtomicBackend::CompareExchangeLoop => self.update(index, |_| value),
        }
    }

    /// Replaces the word with `replacement` if it equals `expected`.
    ///
    /// Returns the value observed before the operation, whether or not the
    /// swap happened.
    pub fn compare_exchange(&self, index: usize, expected: u32, replacement: u32) -> u32 {
        match self
            .word(index)
            .compare_exchange(expected, replacement, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Like [`compare_exchange`](Self::compare_exchange) but reports success.
    #[inline]
    pub fn compare_exchange_succeeded(&self, index: usize, expected: u32, replacement: u32) -> bool {
        self.word(index)
            .compare_exchange(expected, replacement, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Wrapping add, returns the previous value
    pub fn fetch_add(&self, index: usize, value: u32) -> u32 {
        match self.backend {
            AtomicBackend::Native => self.word(index).fetch_add(value, Ordering::SeqCst),
            AtomicBackend::CompareExchangeLoop => self.update(index, |v| v.wrapping_add(value)),
        }
    }

    /// Wrapping subtract, returns the previous value
    pub fn fetch_sub(&self, index: usize, value: u32) -> u32 {
        match self.backend {
            AtomicBackend::Native => self.word(index).fetch_sub(value, Ordering::SeqCst),
            AtomicBackend::CompareExchangeLoop => self.update(index, |v| v.wrapping_sub(value)),
        }
    }

    /// Bitwise and, returns the previous value
    pub fn fetch_and(&self, index: usize, value: u32) -> u32 {
        match self.backend {
            AtomicBackend::Native => self.word(index).fetch_and(value, Ordering::SeqCst),
            AtomicBackend::CompareExchangeLoop => self.update(index, |v| v & value),
        }
    }

    /// Bitwise or, returns the previous value
    pub fn fetch_or(&self, index: usize, value: u32) -> u32 {
        match self.backend {
            AtomicBackend::Native => self.word(index).fetch_or(value, Ordering::SeqCst),
            AtomicBackend::CompareExchangeLoop => self.update(index, |v| v | value),
        }
    }

    /// Bitwise xor, returns the previous value
    pub fn fetch_xor(&self, index: usize, value: u32) -> u32 {
        match self.backend {
            AtomicBackend::Native => self.word(index).fetch_xor(value, Ordering::SeqCst),
            AtomicBackend::CompareExchangeLoop => self.update(index, |v| v ^ value),
        }
    }

    /// Adds one, returns the new value
    pub fn increment(&self, index: usize) -> u32 {
        self.fetch_add(index, 1).wrapping_add(1)
    }

    /// Subtracts one, returns the new value
    pub fn decrement(&self, index: usize) -> u32 {
        self.fetch_sub(index, 1).wrapping_sub(1)
    }

    /// Sleeps while word `index` equals `expected`.
    ///
    /// Returns [`WaitResult::NotEqual`] without sleeping when the word already
    /// differs, [`WaitResult::Ok`] when woken by [`notify`](Self::notify) and
    /// [`WaitResult::TimedOut`] when `timeout` elapses first. `None` waits
    /// indefinitely.
    pub fn wait(&self, index: usize, expected: u32, timeout: Option<Duration>) -> WaitResult {
        let word = self.word(index);
        let deadline = timeout.map(|t| Instant::now() + t);
        // SAFETY: the key is the address of a region word, which no lock uses
        // as its parking key. The validation closure only loads the word and
        // the timeout callback does nothing.
        let parked = unsafe {
            parking_lot_core::park(
                wait_key(word),
                || word.load(Ordering::SeqCst) == expected,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };
        match parked {
            ParkResult::Unparked(_) => WaitResult::Ok,
            ParkResult::Invalid => WaitResult::NotEqual,
            ParkResult::TimedOut => WaitResult::TimedOut,
        }
    }

    /// Wakes up to `count` waiters on word `index` in arrival order.
    ///
    /// Returns the number woken. Pass [`WAKE_ALL`] to wake everyone.
    pub fn notify(&self, index: usize, count: u32) -> u32 {
        let key = wait_key(self.word(index));
        if count == WAKE_ALL {
            // SAFETY: same key as `wait`
            let woken = unsafe { parking_lot_core::unpark_all(key, DEFAULT_UNPARK_TOKEN) };
            return u32::try_from(woken).unwrap_or(u32::MAX);
        }
        let mut woken = 0;
        while woken < count {
            // SAFETY: same key as `wait`
            let result = unsafe { parking_lot_core::unpark_one(key, |_| DEFAULT_UNPARK_TOKEN) };
            woken += result.unparked_threads as u32;
            if !result.have_more_threads {
                break;
            }
        }
        woken
    }
}

/// Parking key of a word: its address, shared by every view of the memory.
fn wait_key(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}
