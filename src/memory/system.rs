use std::alloc::{self, Layout};
use std::ptr::NonNull;

use tracing::trace;

use super::{align_up, AllocHeader, MemoryHook, HEADER_SIZE, MAX_ALIGN};

/// The default memory hook, backed by the platform allocator.
///
/// The platform allocator needs the size and alignment of a block to release it, so each
/// block carries an [`AllocHeader`] in front of the payload. Aligned and unaligned requests
/// share one layout: the payload starts at the first `alignment` boundary past the header.
#[derive(Clone, Copy, Debug, Default)]
pub struct System;

impl System {
    /// Compute the block layout and the payload offset within it
    fn layout(size: usize, align: usize) -> Option<(Layout, usize)> {
        if !align.is_power_of_two() {
            return None;
        }

        let align = align.max(MAX_ALIGN);
        let offset = align_up(HEADER_SIZE, align)?;
        let layout = Layout::from_size_align(offset.checked_add(size)?, align).ok()?;

        Some((layout, offset))
    }

    fn allocate(size: usize, align: usize, zeroed: bool) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let (layout, offset) = Self::layout(size, align)?;

        let base = unsafe {
            if zeroed {
                alloc::alloc_zeroed(layout)
            }
            else {
                alloc::alloc(layout)
            }
        };

        let base = match NonNull::new(base) {
            Some(base) => base,
            None => {
                trace!(size, align, "system allocation failed");
                return None;
            }
        };

        unsafe {
            let payload = NonNull::new_unchecked(base.as_ptr().add(offset));
            AllocHeader { size, align: layout.align() }.write(payload);

            Some(payload)
        }
    }
}

impl MemoryHook for System {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        Self::allocate(size, MAX_ALIGN, false)
    }

    unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.malloc(size)
        };

        if size == 0 {
            return None;
        }

        let header = AllocHeader::read(ptr);
        let (layout, offset) = Self::layout(header.size, header.align)?;
        let new_size = offset.checked_add(size)?;

        // The block keeps its alignment, only the tail grows or shrinks
        Layout::from_size_align(new_size, layout.align()).ok()?;

        let base = ptr.as_ptr().sub(offset);
        let base = NonNull::new(alloc::realloc(base, layout, new_size))?;
        let payload = NonNull::new_unchecked(base.as_ptr().add(offset));

        AllocHeader { size, align: header.align }.write(payload);

        Some(payload)
    }

    fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        Self::allocate(count.checked_mul(size)?, MAX_ALIGN, true)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let header = AllocHeader::read(ptr);

        if let Some((layout, offset)) = Self::layout(header.size, header.align) {
            alloc::dealloc(ptr.as_ptr().sub(offset), layout);
        }
    }

    fn aligned_malloc(&self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
        Self::allocate(size, alignment, false)
    }

    unsafe fn aligned_free(&self, ptr: NonNull<u8>) {
        self.free(ptr)
    }
}
