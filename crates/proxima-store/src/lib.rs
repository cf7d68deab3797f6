#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! Flat vector arena.
//!
//! One slot per internal id, `stride` bytes apart, where `stride` is the
//! payload size rounded up to a cache line so per-vector loads stay aligned.
//! The arena is either owned memory (mutable building) or a window into a
//! read-only memory mapping (serving a snapshot in place).
//!
//! Concurrency contract: slot `id` is written exactly once, by the single
//! inserter that reserved `id`, before that id becomes reachable from the
//! graph. Readers only touch slots that are already published. Growth and
//! replacement happen only under the index's exclusive maintenance lock.

use memmap2::Mmap;
use proxima_core::{Error, Result};
use std::cell::UnsafeCell;
use std::io::Write;
use std::sync::Arc;

/// Slot alignment boundary.
pub const CACHE_LINE: usize = 64;

/// Rounds a payload size up to the cache-line stride used between slots.
#[inline]
pub const fn stride_for(payload: usize) -> usize {
    (payload + CACHE_LINE - 1) & !(CACHE_LINE - 1)
}

/// Owned backing memory. `u64` cells keep the base 8-byte aligned for every
/// element kind; zero-initialized so slot padding is deterministic in
/// snapshots.
struct Arena {
    words: Box<[UnsafeCell<u64>]>,
}

// Safety: cross-thread access follows the slot-exclusivity contract above;
// no two threads ever touch the same slot concurrently with a write.
unsafe impl Sync for Arena {}
unsafe impl Send for Arena {}

impl Arena {
    fn zeroed(bytes: usize) -> Self {
        let words = (0..bytes / 8).map(|_| UnsafeCell::new(0u64)).collect();
        Self { words }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.words.as_ptr()).cast()
    }

    #[inline]
    fn len(&self) -> usize {
        self.words.len() * 8
    }
}

enum Buffer {
    Owned(Arena),
    Mapped { map: Arc<Mmap>, offset: usize },
}

/// The vector arena: `capacity · stride` bytes indexed by internal id.
pub struct VectorStore {
    buffer: Buffer,
    payload: usize,
    stride: usize,
    capacity: usize,
}

impl VectorStore {
    /// Empty owned store; call [`reserve`](Self::reserve) before writing.
    pub fn new(payload: usize) -> Self {
        Self {
            buffer: Buffer::Owned(Arena::zeroed(0)),
            payload,
            stride: stride_for(payload),
            capacity: 0,
        }
    }

    /// Read-only store serving slots straight out of a mapping. `offset`
    /// must be cache-line aligned and the window must hold `capacity` slots.
    pub fn mapped(map: Arc<Mmap>, offset: usize, payload: usize, capacity: usize) -> Result<Self> {
        let stride = stride_for(payload);
        if offset % CACHE_LINE != 0 {
            return Err(Error::IncompatibleFile(format!(
                "vector arena offset {offset} is not {CACHE_LINE}-byte aligned"
            )));
        }
        let end = offset
            .checked_add(capacity.checked_mul(stride).ok_or_else(|| {
                Error::IncompatibleFile("vector arena size overflows".into())
            })?)
            .ok_or_else(|| Error::IncompatibleFile("vector arena size overflows".into()))?;
        if end > map.len() {
            return Err(Error::IncompatibleFile(format!(
                "mapping holds {} bytes, vector arena needs {end}",
                map.len()
            )));
        }
        Ok(Self {
            buffer: Buffer::Mapped { map, offset },
            payload,
            stride,
            capacity,
        })
    }

    #[inline]
    pub fn payload(&self) -> usize {
        self.payload
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        matches!(self.buffer, Buffer::Mapped { .. })
    }

    /// Grows the arena to `capacity` slots, preserving existing contents.
    /// Requires exclusive access (the caller's maintenance lock).
    pub fn reserve(&mut self, capacity: usize) -> Result<()> {
        match &mut self.buffer {
            Buffer::Mapped { .. } => Err(Error::Immutable),
            Buffer::Owned(arena) => {
                if capacity <= self.capacity {
                    return Ok(());
                }
                let next = Arena::zeroed(capacity * self.stride);
                // Safety: exclusive access; both regions are distinct live
                // allocations of at least `capacity * stride` / old length.
                unsafe {
                    std::ptr::copy_nonoverlapping(arena.base(), next.base(), arena.len());
                }
                *arena = next;
                self.capacity = capacity;
                Ok(())
            }
        }
    }

    /// Payload bytes of slot `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the reserved capacity.
    #[inline]
    pub fn get(&self, id: u32) -> &[u8] {
        let at = id as usize;
        assert!(at < self.capacity, "vector slot {at} out of bounds");
        let start = at * self.stride;
        match &self.buffer {
            Buffer::Owned(arena) => {
                // Safety: in bounds by the assert; the slot's bytes are only
                // ever mutated by its exclusive inserter before publication.
                unsafe { std::slice::from_raw_parts(arena.base().add(start), self.payload) }
            }
            Buffer::Mapped { map, offset } => &map[offset + start..offset + start + self.payload],
        }
    }

    /// Copies `bytes` into slot `id`. Caller contract: this thread is the
    /// exclusive inserter of `id` and the id is not yet published.
    pub fn write(&self, id: u32, bytes: &[u8]) -> Result<()> {
        let at = id as usize;
        if at >= self.capacity {
            return Err(Error::OutOfCapacity { size: at, capacity: self.capacity });
        }
        if bytes.len() != self.payload {
            return Err(Error::InvalidArgument(format!(
                "payload is {} bytes, slot holds {}",
                bytes.len(),
                self.payload
            )));
        }
        match &self.buffer {
            Buffer::Mapped { .. } => Err(Error::Immutable),
            Buffer::Owned(arena) => {
                // Safety: in bounds; exclusivity per the contract above.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        arena.base().add(at * self.stride),
                        bytes.len(),
                    );
                }
                Ok(())
            }
        }
    }

    /// Streams the first `size` slots (full strides, padding included) into a
    /// writer. Requires exclusive access.
    pub fn copy_out(&self, size: usize, out: &mut impl Write) -> std::io::Result<()> {
        debug_assert!(size <= self.capacity);
        let len = size * self.stride;
        let bytes = match &self.buffer {
            Buffer::Owned(arena) => {
                // Safety: exclusive access during snapshotting; `len` is
                // within the allocation.
                unsafe { std::slice::from_raw_parts(arena.base(), len) }
            }
            Buffer::Mapped { map, offset } => &map[*offset..offset + len],
        };
        out.write_all(bytes)
    }

    /// Fills the first `size` slots from a reader (full strides). Requires
    /// exclusive access to a freshly reserved owned arena.
    pub fn fill_from(&mut self, size: usize, input: &mut impl std::io::Read) -> Result<()> {
        match &mut self.buffer {
            Buffer::Mapped { .. } => Err(Error::Immutable),
            Buffer::Owned(arena) => {
                let len = size * self.stride;
                if len > arena.len() {
                    return Err(Error::OutOfCapacity { size, capacity: self.capacity });
                }
                // Safety: exclusive `&mut self` access; `len` is in bounds.
                let dst = unsafe { std::slice::from_raw_parts_mut(arena.base(), len) };
                input.read_exact(dst)?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("payload", &self.payload)
            .field("stride", &self.stride)
            .field("capacity", &self.capacity)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write as _};

    #[test]
    fn stride_rounds_to_cache_line() {
        assert_eq!(stride_for(1), 64);
        assert_eq!(stride_for(64), 64);
        assert_eq!(stride_for(65), 128);
        assert_eq!(stride_for(12), 64);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut store = VectorStore::new(12);
        store.reserve(4).unwrap();
        assert_eq!(store.capacity(), 4);

        let payload = [7u8; 12];
        store.write(2, &payload).unwrap();
        assert_eq!(store.get(2), &payload);
        assert_eq!(store.get(0), &[0u8; 12]);
    }

    #[test]
    fn reserve_preserves_contents_and_is_idempotent() {
        let mut store = VectorStore::new(8);
        store.reserve(2).unwrap();
        store.write(1, &[9u8; 8]).unwrap();

        store.reserve(16).unwrap();
        assert_eq!(store.get(1), &[9u8; 8]);

        store.reserve(4).unwrap();
        assert_eq!(store.capacity(), 16);
    }

    #[test]
    fn write_rejects_out_of_bounds_and_bad_lengths() {
        let mut store = VectorStore::new(8);
        store.reserve(1).unwrap();
        assert!(matches!(
            store.write(1, &[0u8; 8]),
            Err(Error::OutOfCapacity { .. })
        ));
        assert!(matches!(
            store.write(0, &[0u8; 4]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn mapped_store_serves_slots_readonly() {
        let mut store = VectorStore::new(8);
        store.reserve(3).unwrap();
        for id in 0..3u32 {
            store.write(id, &[id as u8 + 1; 8]).unwrap();
        }

        let mut file = tempfile::tempfile().unwrap();
        store.copy_out(3, &mut file).unwrap();
        file.flush().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let map = Arc::new(unsafe { Mmap::map(&file).unwrap() });
        let mapped = VectorStore::mapped(map, 0, 8, 3).unwrap();
        for id in 0..3u32 {
            assert_eq!(mapped.get(id), &[id as u8 + 1; 8]);
        }
        assert!(mapped.write(0, &[0u8; 8]).is_err());
    }

    #[test]
    fn mapped_store_rejects_short_files() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        let map = Arc::new(unsafe { Mmap::map(&file).unwrap() });
        assert!(matches!(
            VectorStore::mapped(map, 0, 8, 2),
            Err(Error::IncompatibleFile(_))
        ));
    }
}
