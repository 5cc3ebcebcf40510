use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;

use bytemuck::Zeroable;

use crate::error::AllocError;
use super::{Memory, MAX_ALIGN};

/// A growable buffer whose storage comes from a [`Memory`] handle.
///
/// This is the only way the crate allocates container payloads and directory arrays.
/// Unlike `Vec`, every operation that may allocate reports failure instead of aborting,
/// and the buffer is left unchanged when it does.
pub struct MemVec<T> {
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,

    /// Set when the storage came from `aligned_malloc`
    alignment: Option<usize>,
    memory: Memory,
    _marker: PhantomData<T>
}

unsafe impl<T: Send> Send for MemVec<T> {}
unsafe impl<T: Sync> Sync for MemVec<T> {}

impl<T> MemVec<T> {
    /// Create an empty buffer. Does not allocate
    pub fn new_in(memory: Memory) -> Self {
        debug_assert!(mem::size_of::<T>() != 0);
        debug_assert!(mem::align_of::<T>() <= MAX_ALIGN);

        Self {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
            alignment: None,
            memory,
            _marker: PhantomData
        }
    }

    /// Create an empty buffer with room for `capacity` elements
    pub fn with_capacity_in(capacity: usize, memory: Memory) -> Result<Self, AllocError> {
        let mut buf = Self::new_in(memory);
        buf.grow_to(capacity)?;

        Ok(buf)
    }

    /// Create an empty buffer with room for `capacity` elements whose storage is aligned to
    /// `alignment`. The alignment is kept if the buffer later grows.
    pub fn with_capacity_aligned_in(capacity: usize, alignment: usize, memory: Memory) -> Result<Self, AllocError> {
        let mut buf = Self::new_in(memory);
        buf.alignment = Some(alignment);
        buf.grow_to(capacity)?;

        Ok(buf)
    }

    /// The memory handle the storage is allocated from
    #[inline]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Make room for at least `additional` more elements, growing geometrically
    pub fn reserve(&mut self, additional: usize) -> Result<(), AllocError> {
        let required = self.len.checked_add(additional)
            .ok_or(AllocError::overflow())?;

        if required <= self.capacity {
            return Ok(());
        }

        let capacity = required.max(self.capacity * 2).max(4);
        self.grow_to(capacity)
    }

    /// Make room for exactly `additional` more elements
    pub fn reserve_exact(&mut self, additional: usize) -> Result<(), AllocError> {
        let required = self.len.checked_add(additional)
            .ok_or(AllocError::overflow())?;

        if required <= self.capacity {
            return Ok(());
        }

        self.grow_to(required)
    }

    /// Reduce the capacity to `capacity`, or to the length if that is larger
    pub fn shrink_to(&mut self, capacity: usize) -> Result<(), AllocError> {
        let capacity = capacity.max(self.len);
        if capacity >= self.capacity {
            return Ok(());
        }

        if capacity == 0 {
            self.release();
            return Ok(());
        }

        self.reallocate(capacity)
    }

    /// Reduce the capacity to the length
    pub fn shrink_to_fit(&mut self) -> Result<(), AllocError> {
        self.shrink_to(self.len)
    }

    /// Append a value, growing the buffer if needed
    pub fn push(&mut self, value: T) -> Result<(), AllocError> {
        self.reserve(1)?;

        unsafe {
            ptr::write(self.ptr.as_ptr().add(self.len), value);
        }

        self.len += 1;

        Ok(())
    }

    /// Remove and return the last value
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        self.len -= 1;

        unsafe { Some(ptr::read(self.ptr.as_ptr().add(self.len))) }
    }

    /// Insert a value at `index`, shifting everything after it one slot to the right
    ///
    /// # Panics
    /// If `index > len`
    pub fn insert(&mut self, index: usize, value: T) -> Result<(), AllocError> {
        assert!(index <= self.len, "insertion index {} out of bounds for length {}", index, self.len);

        self.reserve(1)?;

        unsafe {
            let p = self.ptr.as_ptr().add(index);
            ptr::copy(p, p.add(1), self.len - index);
            ptr::write(p, value);
        }

        self.len += 1;

        Ok(())
    }

    /// Remove the value at `index`, shifting everything after it one slot to the left
    ///
    /// # Panics
    /// If `index >= len`
    pub fn remove(&mut self, index: usize) -> T {
        assert!(index < self.len, "removal index {} out of bounds for length {}", index, self.len);

        unsafe {
            let p = self.ptr.as_ptr().add(index);
            let value = ptr::read(p);
            ptr::copy(p.add(1), p, self.len - index - 1);

            self.len -= 1;

            value
        }
    }

    /// Drop every value in `[start, end)` and close the gap
    ///
    /// # Panics
    /// If the range is out of bounds
    pub fn remove_range(&mut self, start: usize, end: usize) {
        assert!(start <= end && end <= self.len, "range {}..{} out of bounds for length {}", start, end, self.len);

        let len = self.len;

        unsafe {
            // Leak rather than double drop should a destructor panic
            self.len = start;

            let gap = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr().add(start), end - start);
            ptr::drop_in_place(gap);

            ptr::copy(self.ptr.as_ptr().add(end), self.ptr.as_ptr().add(start), len - end);
        }

        self.len = len - (end - start);
    }

    /// Move the values in `[start, end)` onto the end of `dest` and close the gap.
    /// Nothing moves if `dest` cannot make room for them.
    ///
    /// # Panics
    /// If the range is out of bounds
    pub fn move_range_to(&mut self, start: usize, end: usize, dest: &mut MemVec<T>) -> Result<(), AllocError> {
        assert!(start <= end && end <= self.len, "range {}..{} out of bounds for length {}", start, end, self.len);

        let count = end - start;
        dest.reserve(count)?;

        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(start),
                dest.ptr.as_ptr().add(dest.len),
                count
            );
            dest.len += count;

            ptr::copy(self.ptr.as_ptr().add(end), self.ptr.as_ptr().add(start), self.len - end);
        }

        self.len -= count;

        Ok(())
    }

    /// Drop every value past `len`
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }

        unsafe {
            let tail = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr().add(len), self.len - len);
            self.len = len;

            ptr::drop_in_place(tail);
        }
    }

    /// Drop every value, keeping the capacity
    #[inline]
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Change the capacity to `capacity`, which must be at least the length
    fn grow_to(&mut self, capacity: usize) -> Result<(), AllocError> {
        if capacity <= self.capacity {
            return Ok(());
        }

        self.reallocate(capacity)
    }

    fn reallocate(&mut self, capacity: usize) -> Result<(), AllocError> {
        debug_assert!(capacity >= self.len && capacity > 0);

        let bytes = capacity.checked_mul(mem::size_of::<T>())
            .ok_or(AllocError::overflow())?;

        let ptr = match self.alignment {
            Some(alignment) => {
                let fresh = self.memory.aligned_malloc(alignment, bytes)
                    .ok_or(AllocError { size: bytes })?;

                unsafe {
                    ptr::copy_nonoverlapping(self.ptr.as_ptr(), fresh.as_ptr() as *mut T, self.len);

                    if self.capacity > 0 {
                        self.memory.aligned_free(self.ptr.cast());
                    }
                }

                fresh
            },
            None => {
                let old = if self.capacity > 0 { Some(self.ptr.cast()) } else { None };

                unsafe { self.memory.realloc(old, bytes) }
                    .ok_or(AllocError { size: bytes })?
            }
        };

        self.ptr = ptr.cast();
        self.capacity = capacity;

        Ok(())
    }

    /// Drop every value and hand the storage back to the memory hook
    fn release(&mut self) {
        self.clear();

        if self.capacity > 0 {
            unsafe {
                match self.alignment {
                    Some(_) => self.memory.aligned_free(self.ptr.cast()),
                    None => self.memory.free(self.ptr.cast())
                }
            }
        }

        self.ptr = NonNull::dangling();
        self.capacity = 0;
    }
}

impl<T: Copy> MemVec<T> {
    /// Append every value in `values`
    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<(), AllocError> {
        self.reserve(values.len())?;

        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), self.ptr.as_ptr().add(self.len), values.len());
        }

        self.len += values.len();

        Ok(())
    }

    /// Copy the buffer into storage from `memory`, keeping its alignment
    pub fn try_clone_in(&self, memory: Memory) -> Result<Self, AllocError> {
        let mut copy = Self::new_in(memory);
        copy.alignment = self.alignment;

        if self.len > 0 {
            copy.grow_to(self.len)?;
            copy.extend_from_slice(self)?;
        }

        Ok(copy)
    }
}

impl<T: Zeroable> MemVec<T> {
    /// Create a buffer of `len` zeroed values
    pub fn zeroed_in(len: usize, memory: Memory) -> Result<Self, AllocError> {
        let mut buf = Self::new_in(memory);
        if len == 0 {
            return Ok(buf);
        }

        let ptr = buf.memory.calloc(len, mem::size_of::<T>())
            .ok_or(AllocError { size: len.saturating_mul(mem::size_of::<T>()) })?;

        buf.ptr = ptr.cast();
        buf.len = len;
        buf.capacity = len;

        Ok(buf)
    }

    /// Create a buffer of `len` zeroed values whose storage is aligned to `alignment`
    pub fn zeroed_aligned_in(len: usize, alignment: usize, memory: Memory) -> Result<Self, AllocError> {
        let mut buf = Self::with_capacity_aligned_in(len, alignment, memory)?;

        unsafe {
            ptr::write_bytes(buf.ptr.as_ptr(), 0, len);
        }

        buf.len = len;

        Ok(buf)
    }
}

impl<T> Drop for MemVec<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> Deref for MemVec<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for MemVec<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: fmt::Debug> fmt::Debug for MemVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.iter())
            .finish()
    }
}
