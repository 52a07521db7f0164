//! Fixed-size shared memory region with typed atomic views.
//!
//! A [`SharedRegion`] owns a zero-initialized, 8-byte aligned buffer that can
//! be handed to worker threads without copying. Byte, 32-bit word and 64-bit
//! float views alias the same bytes; every element access is atomic, so views
//! may be used from any number of threads at once.
//!
//! Each layout built on top of a region (ring queue, deque) addresses its
//! words through a single view type, so no byte is accessed with two
//! different atomic widths concurrently.

use crate::error::RegionError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct RegionInner {
    id: u64,
    byte_length: usize,
    storage: Box<[AtomicU64]>,
}

impl RegionInner {
    fn base_ptr(&self) -> *const u8 {
        self.storage.as_ptr().cast::<u8>()
    }
}

/// A fixed-length byte region shareable across worker threads.
///
/// Regions are never resized. Cloning is explicit: [`transferable`] shares the
/// same memory, [`deep_copy`] produces independent bytes.
///
/// [`transferable`]: SharedRegion::transferable
/// [`deep_copy`]: SharedRegion::deep_copy
pub struct SharedRegion {
    inner: Arc<RegionInner>,
}

/// A sendable handle to an existing region's memory.
///
/// This is what crosses into a worker context inside the `initialize`
/// message; the worker rebuilds a [`SharedRegion`] with
/// [`SharedRegion::from_transferable`].
#[derive(Clone)]
pub struct TransferableRegion {
    inner: Arc<RegionInner>,
}

impl TransferableRegion {
    /// Length of the underlying region in bytes
    pub fn byte_length(&self) -> usize {
        self.inner.byte_length
    }
}

impl fmt::Debug for TransferableRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferableRegion")
            .field("id", &self.inner.id)
            .field("byte_length", &self.inner.byte_length)
            .finish()
    }
}

impl SharedRegion {
    /// Allocates a zeroed region of `byte_length` bytes.
    ///
    /// Fails with [`RegionError::Unsupported`] when the environment cannot
    /// provide shared atomics, and with [`RegionError::ZeroLength`] for an
    /// empty region.
    pub fn new(byte_length: usize) -> Result<Self, RegionError> {
        if !Self::is_shared_memory_supported() {
            return Err(RegionError::Unsupported("32/64-bit atomics are not available"));
        }
        if !Self::is_isolation_granted() {
            return Err(RegionError::Unsupported("cross-thread memory sharing is not granted"));
        }
        if byte_length == 0 {
            return Err(RegionError::ZeroLength);
        }

        let words = byte_length.div_ceil(8);
        let storage: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();

        Ok(Self {
            inner: Arc::new(RegionInner {
                id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
                byte_length,
                storage,
            }),
        })
    }

    /// Rebuilds a region around memory received from another context.
    pub fn from_transferable(handle: TransferableRegion) -> Self {
        Self { inner: handle.inner }
    }

    /// Whether the target provides the atomics the region relies on.
    pub fn is_shared_memory_supported() -> bool {
        cfg!(target_has_atomic = "32") && cfg!(target_has_atomic = "64")
    }

    /// Whether memory may actually be shared between threads.
    ///
    /// Native targets always share their address space. On wasm this needs a
    /// threads-enabled build (shared linear memory).
    pub fn is_isolation_granted() -> bool {
        if cfg!(target_arch = "wasm32") {
            cfg!(target_feature = "atomics")
        } else {
            true
        }
    }

    /// Region length in bytes
    pub fn byte_length(&self) -> usize {
        self.inner.byte_length
    }

    /// Process-unique identifier, used in logs
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns a handle to the same memory, suitable for handing to a worker.
    pub fn transferable(&self) -> TransferableRegion {
        TransferableRegion {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns a new region holding a snapshot of this region's bytes.
    pub fn deep_copy(&self) -> Result<Self, RegionError> {
        let copy = Self::new(self.inner.byte_length)?;
        for (dst, src) in copy.inner.storage.iter().zip(self.inner.storage.iter()) {
            dst.store(src.load(Ordering::SeqCst), Ordering::Relaxed);
        }
        Ok(copy)
    }

    /// Whether two regions share the same memory
    pub fn same_memory(&self, other: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Byte view over `[offset, offset + length)`; `None` runs to the end.
    pub fn byte_view(&self, offset: usize, length: Option<usize>) -> Result<ByteView, RegionError> {
        let length = self.resolve(offset, length, 1)?;
        Ok(ByteView {
            inner: Arc::clone(&self.inner),
            offset,
            length,
        })
    }

    /// 32-bit word view starting at byte `offset` with `length` words.
    ///
    /// `offset` must be 4-byte aligned.
    pub fn word_view(&self, offset: usize, length: Option<usize>) -> Result<WordView, RegionError> {
        let length = self.resolve(offset, length, 4)?;
        Ok(WordView {
            inner: Arc::clone(&self.inner),
            offset,
            length,
        })
    }

    /// 64-bit float view starting at byte `offset` with `length` elements.
    ///
    /// `offset` must be 8-byte aligned.
    pub fn double_view(&self, offset: usize, length: Option<usize>) -> Result<DoubleView, RegionError> {
        let length = self.resolve(offset, length, 8)?;
        Ok(DoubleView {
            inner: Arc::clone(&self.inner),
            offset,
            length,
        })
    }

    /// Validates a view request and returns its element count.
    fn resolve(&self, offset: usize, length: Option<usize>, element: usize) -> Result<usize, RegionError> {
        if offset % element != 0 {
            return Err(RegionError::Misaligned {
                offset,
                alignment: element,
            });
        }
        let region_length = self.inner.byte_length;
        if offset > region_length {
            return Err(RegionError::OutOfBounds {
                offset,
                length: length.unwrap_or(0) * element,
                region_length,
            });
        }
        let length = length.unwrap_or((region_length - offset) / element);
        let bytes = length.checked_mul(element).ok_or(RegionError::OutOfBounds {
            offset,
            length: usize::MAX,
            region_length,
        })?;
        if offset + bytes > region_length {
            return Err(RegionError::OutOfBounds {
                offset,
                length: bytes,
                region_length,
            });
        }
        Ok(length)
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("id", &self.inner.id)
            .field("byte_length", &self.inner.byte_length)
            .finish()
    }
}

impl fmt::Debug for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteView")
            .field("region", &self.inner.id)
            .field("offset", &self.offset)
            .field("len", &self.length)
            .finish()
    }
}

impl fmt::Debug for WordView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WordView")
            .field("region", &self.inner.id)
            .field("offset", &self.offset)
            .field("len", &self.length)
            .finish()
    }
}

impl fmt::Debug for DoubleView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoubleView")
            .field("region", &self.inner.id)
            .field("offset", &self.offset)
            .field("len", &self.length)
            .finish()
    }
}

/// Atomic byte view into a region
pub struct ByteView {
    inner: Arc<RegionInner>,
    offset: usize,
    length: usize,
}

impl ByteView {
    /// The viewed bytes
    pub fn as_slice(&self) -> &[AtomicU8] {
        // SAFETY: `resolve` keeps the view inside the allocation, AtomicU8 has
        // the layout of u8, and the Arc keeps the storage alive for `&self`.
        unsafe {
            std::slice::from_raw_parts(
                self.inner.base_ptr().add(self.offset).cast::<AtomicU8>(),
                self.length,
            )
        }
    }

    /// Number of bytes in the view
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Reads one byte
    pub fn get(&self, index: usize) -> u8 {
        self.as_slice()[index].load(Ordering::SeqCst)
    }

    /// Writes one byte
    pub fn set(&self, index: usize, value: u8) {
        self.as_slice()[index].store(value, Ordering::SeqCst);
    }

    /// Copies `bytes` into the view starting at `index`
    pub fn write_from(&self, index: usize, bytes: &[u8]) {
        for (slot, byte) in self.as_slice()[index..index + bytes.len()].iter().zip(bytes) {
            slot.store(*byte, Ordering::SeqCst);
        }
    }

    /// Snapshot of the viewed bytes
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().iter().map(|b| b.load(Ordering::SeqCst)).collect()
    }
}

/// Atomic 32-bit word view into a region
pub struct WordView {
    inner: Arc<RegionInner>,
    offset: usize,
    length: usize,
}

impl WordView {
    /// The viewed words
    pub fn as_slice(&self) -> &[AtomicU32] {
        // SAFETY: the offset is 4-byte aligned within 8-byte aligned storage,
        // `resolve` keeps the view inside the allocation, and AtomicU32 has
        // the layout of u32.
        unsafe {
            std::slice::from_raw_parts(
                self.inner.base_ptr().add(self.offset).cast::<AtomicU32>(),
                self.length,
            )
        }
    }

    /// Number of words in the view
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Byte offset of the view within its region
    pub fn byte_offset(&self) -> usize {
        self.offset
    }
}

/// Atomic f64 view into a region
pub struct DoubleView {
    inner: Arc<RegionInner>,
    offset: usize,
    length: usize,
}

impl DoubleView {
    fn cells(&self) -> &[AtomicU64] {
        // SAFETY: the offset is 8-byte aligned (a whole storage word) and
        // `resolve` keeps the view inside the allocation.
        unsafe {
            std::slice::from_raw_parts(
                self.inner.base_ptr().add(self.offset).cast::<AtomicU64>(),
                self.length,
            )
        }
    }

    /// Number of elements in the view
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Reads element `index`
    pub fn get(&self, index: usize) -> f64 {
        f64::from_bits(self.cells()[index].load(Ordering::SeqCst))
    }

    /// Writes element `index`
    pub fn set(&self, index: usize, value: f64) {
        self.cells()[index].store(value.to_bits(), Ordering::SeqCst);
    }
}
