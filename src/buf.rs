//! Byte arrays and scatter/gather marshalling.
//!
//! Two lifetimes are kept apart here. A [`GatherList`] is the scratch vector
//! of `(base, len)` pairs describing memory to one engine call; it is built
//! right before the call and dropped right after it returns. The [`Bytes`]
//! it points into are managed objects that the submitting request keeps
//! alive until its completion fires.
//!
//! Bytes are stored as `AtomicU8` so the loop thread, pool workers and the
//! owner can touch the same array without a data race.

use crate::error::Errno;
use crate::heap::{Heap, Managed};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Fixed-size byte array shared across the boundary
pub struct ByteBuf {
    bytes: Box<[AtomicU8]>,
}

/// Managed byte array
pub type Bytes = Managed<ByteBuf>;

impl ByteBuf {
    fn zeroed(len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the array is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copy of the whole array
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    /// Copy of `len` bytes starting at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, Errno> {
        let range = self.range(offset, len)?;
        Ok(range.iter().map(|b| b.load(Ordering::Relaxed)).collect())
    }

    /// Overwrite bytes starting at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), Errno> {
        let range = self.range(offset, data.len())?;
        for (dst, src) in range.iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
        Ok(())
    }

    fn range(&self, offset: usize, len: usize) -> Result<&[AtomicU8], Errno> {
        let end = offset.checked_add(len).ok_or(Errno::InvalidArgument)?;
        self.bytes.get(offset..end).ok_or(Errno::InvalidArgument)
    }

    fn base(&self) -> *const AtomicU8 {
        self.bytes.as_ptr()
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf").field("len", &self.len()).finish()
    }
}

impl Heap {
    /// Allocate a zeroed managed byte array
    pub fn bytes(&self, len: usize) -> Bytes {
        self.allocate_tracked("bytes", ByteBuf::zeroed(len), |_| {})
    }

    /// Allocate a managed byte array holding a copy of `data`
    pub fn bytes_from(&self, data: &[u8]) -> Bytes {
        let buf = ByteBuf {
            bytes: data.iter().map(|b| AtomicU8::new(*b)).collect(),
        };
        self.allocate_tracked("bytes", buf, |_| {})
    }
}

/// A `(byte array, offset, length)` triple
#[derive(Debug, Clone)]
pub struct BufRef {
    /// The byte array
    pub bytes: Bytes,
    /// Start of the region
    pub offset: usize,
    /// Length of the region
    pub len: usize,
}

impl BufRef {
    /// Region covering the whole array
    pub fn whole(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self {
            bytes,
            offset: 0,
            len,
        }
    }

    /// Sub-region of an array
    pub fn new(bytes: Bytes, offset: usize, len: usize) -> Self {
        Self { bytes, offset, len }
    }

    /// Copy of the region's contents
    pub fn to_vec(&self) -> Result<Vec<u8>, Errno> {
        self.bytes.read(self.offset, self.len)
    }

    fn iovec(&self) -> Result<IoVec, Errno> {
        self.bytes.range(self.offset, self.len)?;
        // SAFETY: offset + len was just checked against the array bounds.
        let base = unsafe { self.bytes.base().add(self.offset) };
        Ok(IoVec {
            base,
            len: self.len,
        })
    }
}

/// One `(base, len)` entry of a gather vector.
///
/// An `IoVec` does not keep its memory alive. The engine entry points that
/// dereference one are `unsafe` and leave that to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    base: *const AtomicU8,
    len: usize,
}

// SAFETY: an IoVec only describes memory; it is dereferenced by the engine
// while the owning request keeps the byte array alive, and every access goes
// through `AtomicU8`.
unsafe impl Send for IoVec {}
unsafe impl Sync for IoVec {}

impl IoVec {
    /// Zero-length entry
    pub const EMPTY: IoVec = IoVec {
        base: std::ptr::null(),
        len: 0,
    };

    /// Value written over every entry of a gather list when it is torn down
    pub const POISON: IoVec = IoVec {
        base: std::ptr::null(),
        len: usize::MAX,
    };

    /// Length described
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the entry describes no memory
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this entry is the teardown sentinel
    pub fn is_poisoned(&self) -> bool {
        *self == Self::POISON
    }

    /// Offset of this entry's base inside `bytes`, if it points into it
    pub fn offset_in(&self, bytes: &ByteBuf) -> Option<usize> {
        let start = bytes.base() as usize;
        let base = self.base as usize;
        let end = start + bytes.len();
        (base >= start && base + self.len <= end && !self.base.is_null()).then(|| base - start)
    }

    /// View the described memory.
    ///
    /// # Safety
    ///
    /// The byte array this entry was built from must still be alive for the
    /// returned lifetime.
    pub(crate) unsafe fn as_slice<'a>(&self) -> &'a [AtomicU8] {
        if self.base.is_null() || self.len == 0 || self.is_poisoned() {
            return &[];
        }
        // SAFETY: caller guarantees the backing array outlives 'a.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }
}

/// Gather everything `iov` describes into one vector.
///
/// # Safety
///
/// Every entry's backing array must be alive.
pub(crate) unsafe fn gather(iov: &[IoVec]) -> Vec<u8> {
    let mut out = Vec::with_capacity(iov.iter().map(|v| v.len).sum());
    for entry in iov {
        // SAFETY: forwarded from the caller.
        let slice = unsafe { entry.as_slice() };
        out.extend(slice.iter().map(|b| b.load(Ordering::Relaxed)));
    }
    out
}

/// Scatter `data` across `iov` in order, returning bytes written.
///
/// # Safety
///
/// Every entry's backing array must be alive.
pub(crate) unsafe fn scatter(iov: &[IoVec], data: &[u8]) -> usize {
    let mut written = 0;
    for entry in iov {
        // SAFETY: forwarded from the caller.
        let slice = unsafe { entry.as_slice() };
        for dst in slice {
            let Some(src) = data.get(written) else {
                return written;
            };
            dst.store(*src, Ordering::Relaxed);
            written += 1;
        }
    }
    written
}

/// Scratch gather vector for one engine call
pub struct GatherList {
    entries: Vec<IoVec>,
}

impl GatherList {
    /// Describe `bufs`; fails with `InvalidArgument` if a region is out of bounds
    pub fn build(bufs: &[BufRef]) -> Result<Self, Errno> {
        let entries = bufs.iter().map(BufRef::iovec).collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// The entries
    pub fn as_slice(&self) -> &[IoVec] {
        &self.entries
    }

    /// Total bytes described
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|v| v.len).sum()
    }

    /// Overwrite every entry with [`IoVec::POISON`]
    pub fn poison(&mut self) {
        for entry in &mut self.entries {
            *entry = IoVec::POISON;
        }
    }
}

impl Drop for GatherList {
    fn drop(&mut self) {
        self.poison();
    }
}

impl fmt::Debug for GatherList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatherList")
            .field("entries", &self.entries.len())
            .field("total_len", &self.total_len())
            .finish()
    }
}
