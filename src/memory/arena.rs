use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::error::AllocError;
use super::{align_up, AllocHeader, Memory, MemoryHook, HEADER_SIZE, MAX_ALIGN};

/// A linear allocator over one fixed, zero-filled buffer.
///
/// Allocations bump a cursor forward and are never reclaimed individually; `free` is a
/// no-op and the whole buffer is released when the arena is dropped. Requests that do not
/// fit return `None`, the buffer never grows.
///
/// Each payload is preceded by an [`AllocHeader`] holding its size, which is how `realloc`
/// recognises the most recent allocation and grows it in place. The cursor is advanced
/// with compare-and-swap so the arena can be shared behind a [`Memory`] handle, but it is
/// meant to be filled by one writer at a time.
///
/// # Memory Layout
/// ```text
/// | slack | header | payload | slack | header | payload | ... | free space |
/// ^ buf                                               head ^              ^ end
/// ```
#[derive(Debug)]
pub struct Arena {
    /// Start of the backing buffer
    buf: NonNull<u8>,

    /// Size of the backing buffer in bytes
    capacity: usize,

    /// Offset of the bump cursor from `buf`
    head: AtomicUsize
}

// The buffer is exclusively owned and the cursor is only moved atomically
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an arena backed by `capacity` zeroed bytes
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(capacity.max(1), MAX_ALIGN)
            .map_err(|_| AllocError { size: capacity })?;

        let buf = unsafe { alloc::alloc_zeroed(layout) };
        let buf = NonNull::new(buf)
            .ok_or(AllocError { size: capacity })?;

        debug!(capacity, "created arena");

        Ok(Self {
            buf,
            capacity,
            head: AtomicUsize::new(0)
        })
    }

    /// Wrap the arena in a memory handle so containers can allocate from it
    pub fn into_memory(self) -> Memory {
        Memory::new(self)
    }

    /// Total size of the backing buffer
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed so far, including headers and alignment slack
    #[inline]
    pub fn used(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    /// Bytes left before the end of the buffer
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used()
    }

    /// Upper bound on the arena bytes one allocation of `size` bytes at `alignment` consumes.
    /// Summing this over a batch of requests gives a capacity that fits all of them.
    pub fn footprint(size: usize, alignment: usize) -> usize {
        let alignment = alignment.max(MAX_ALIGN);

        HEADER_SIZE + size + alignment - 1
    }

    /// Check if `ptr` points into the backing buffer
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let start = self.buf.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;

        addr >= start && addr < start + self.capacity
    }

    /// Reserve a header plus `size` bytes at the next `alignment` boundary
    fn bump(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if size == 0 || !alignment.is_power_of_two() {
            return None;
        }

        let alignment = alignment.max(MAX_ALIGN);
        let base = self.buf.as_ptr() as usize;
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let payload = align_up(base.checked_add(head + HEADER_SIZE)?, alignment)? - base;
            let end = payload.checked_add(size)?;

            if end > self.capacity {
                trace!(size, alignment, remaining = self.capacity - head, "arena capacity exhausted");
                return None;
            }

            match self.head.compare_exchange_weak(head, end, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    unsafe {
                        let ptr = NonNull::new_unchecked(self.buf.as_ptr().add(payload));
                        AllocHeader { size, align: alignment }.write(ptr);

                        return Some(ptr);
                    }
                },
                Err(current) => {
                    head = current;
                }
            }
        }
    }
}

impl MemoryHook for Arena {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.bump(size, MAX_ALIGN)
    }

    unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.malloc(size)
        };

        debug_assert!(self.owns(ptr));

        let header = AllocHeader::read(ptr);
        if header.size >= size {
            return Some(ptr);
        }

        // The most recent allocation can simply claim the space after it
        let offset = ptr.as_ptr().offset_from(self.buf.as_ptr()) as usize;
        let old_end = offset + header.size;

        if self.head.load(Ordering::Acquire) == old_end {
            let new_end = offset.checked_add(size)?;
            if new_end > self.capacity {
                trace!(size, remaining = self.capacity - old_end, "arena capacity exhausted");
                return None;
            }

            let extended = self.head
                .compare_exchange(old_end, new_end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();

            if extended {
                AllocHeader { size, align: header.align }.write(ptr);
                return Some(ptr);
            }
        }

        let fresh = self.bump(size, header.align)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), header.size);

        Some(fresh)
    }

    fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.malloc(total)?;

        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, total);
        }

        Some(ptr)
    }

    unsafe fn free(&self, _ptr: NonNull<u8>) {}

    fn aligned_malloc(&self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
        self.bump(size, alignment)
    }

    unsafe fn aligned_free(&self, _ptr: NonNull<u8>) {}
}

impl Drop for Arena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity.max(1), MAX_ALIGN);

        if let Ok(layout) = layout {
            unsafe {
                alloc::dealloc(self.buf.as_ptr(), layout);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::slice;

    use super::*;

    #[test]
    fn zero_sized_malloc() {
        let arena = Arena::new(256).unwrap();

        assert!(arena.malloc(0).is_none());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn allocations_fit_within_footprint() {
        let sizes = [3usize, 16, 40, 1, 100, 64];
        let capacity = sizes.iter()
            .map(|size| Arena::footprint(*size, MAX_ALIGN))
            .sum();

        let arena = Arena::new(capacity).unwrap();
        let mut spans = Vec::new();

        for size in sizes.iter() {
            let ptr = arena.malloc(*size).expect("allocation should fit");
            assert_eq!(ptr.as_ptr() as usize % MAX_ALIGN, 0);

            spans.push((ptr.as_ptr() as usize, *size));
        }

        // Spans are handed out in increasing order and never overlap
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }

        assert!(arena.used() <= arena.capacity());
    }

    #[test]
    fn exhaustion_leaves_cursor_untouched() {
        let arena = Arena::new(128).unwrap();

        let first = arena.malloc(64);
        assert!(first.is_some());

        let used = arena.used();
        assert!(arena.malloc(128).is_none());
        assert_eq!(arena.used(), used);

        // Smaller requests still succeed afterwards
        assert!(arena.malloc(8).is_some());
    }

    #[test]
    fn realloc_grows_last_allocation_in_place() {
        let arena = Arena::new(1024).unwrap();

        unsafe {
            let ptr = arena.malloc(16).unwrap();
            ptr::write_bytes(ptr.as_ptr(), 0xAB, 16);

            let grown = arena.realloc(Some(ptr), 64).unwrap();
            assert_eq!(grown, ptr);
            assert_eq!(arena.used(), ptr.as_ptr().offset_from(arena.buf.as_ptr()) as usize + 64);

            // Requests that are already covered return the same pointer
            assert_eq!(arena.realloc(Some(grown), 32), Some(grown));

            let bytes = slice::from_raw_parts(grown.as_ptr(), 16);
            assert!(bytes.iter().all(|b| *b == 0xAB));
        }
    }

    #[test]
    fn realloc_moves_older_allocation() {
        let arena = Arena::new(1024).unwrap();

        unsafe {
            let first = arena.malloc(8).unwrap();
            ptr::copy_nonoverlapping([1u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), first.as_ptr(), 8);

            let _second = arena.malloc(8).unwrap();

            let moved = arena.realloc(Some(first), 32).unwrap();
            assert_ne!(moved, first);
            assert_eq!(slice::from_raw_parts(moved.as_ptr(), 8), &[1, 2, 3, 4, 5, 6, 7, 8]);
        }
    }

    #[test]
    fn realloc_past_capacity_fails() {
        let arena = Arena::new(64).unwrap();

        unsafe {
            let ptr = arena.malloc(16).unwrap();
            let used = arena.used();

            assert!(arena.realloc(Some(ptr), 4096).is_none());
            assert_eq!(arena.used(), used);
            assert!(arena.realloc(Some(ptr), 0).is_none());
        }
    }

    #[test]
    fn aligned_malloc_alignment() {
        let arena = Arena::new(Arena::footprint(100, 64) + Arena::footprint(8192, 32)).unwrap();

        let a = arena.aligned_malloc(64, 100).unwrap();
        assert_eq!(a.as_ptr() as usize % 64, 0);

        let b = arena.aligned_malloc(32, 8192).unwrap();
        assert_eq!(b.as_ptr() as usize % 32, 0);
        assert!(a.as_ptr() as usize + 100 <= b.as_ptr() as usize);

        // Header sits at the same place for aligned and unaligned requests
        let header = unsafe { AllocHeader::read(b) };
        assert_eq!(header, AllocHeader { size: 8192, align: 32 });
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let arena = Arena::new(512).unwrap();

        let ptr = arena.calloc(16, 4).unwrap();
        let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|b| *b == 0));

        assert!(arena.calloc(usize::MAX, 2).is_none());
    }

    #[test]
    fn free_is_a_no_op() {
        let arena = Arena::new(256).unwrap();
        let ptr = arena.malloc(32).unwrap();
        let used = arena.used();

        unsafe {
            arena.free(ptr);
        }

        assert_eq!(arena.used(), used);
    }
}
