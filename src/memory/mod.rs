//! Allocation primitives used by every other part of the crate
//!
//! All container payloads and directory arrays are allocated through a [`Memory`] handle, a
//! shared reference to some [`MemoryHook`]. A process-wide hook can be installed with
//! [`init_memory_hook`]; directories created with `new` pick up whatever hook is installed
//! at that moment, while `new_in` style constructors take an explicit handle instead.
//!
//! Every allocation remembers the handle it came from, so replacing the global hook never
//! causes memory to be released through the wrong allocator.

mod arena;
mod mem_vec;
mod system;

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

pub use self::arena::Arena;
pub use self::mem_vec::MemVec;
pub use self::system::System;

/// Alignment of every payload returned by `malloc`, `realloc` and `calloc`
pub const MAX_ALIGN: usize = 16;

/// The six allocation primitives a hook must provide. `&self` plays the role of the opaque
/// context pointer handed to every call.
///
/// None of the primitives signal out of memory other than by returning `None`.
pub trait MemoryHook: Send + Sync {
    /// Allocate `size` bytes aligned to [`MAX_ALIGN`]
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Grow or shrink an allocation, preserving its contents up to the smaller of the two sizes.
    /// A `None` pointer behaves like `malloc`. On failure the original allocation is untouched.
    ///
    /// # Safety
    /// `ptr` must have been returned by `malloc`, `realloc` or `calloc` of this same hook
    /// and not freed since
    unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>>;

    /// Allocate `count * size` zeroed bytes
    fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.malloc(total)?;

        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, total);
        }

        Some(ptr)
    }

    /// Release an allocation made by `malloc`, `realloc` or `calloc`
    ///
    /// # Safety
    /// `ptr` must have been returned by this hook and not freed since
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Allocate `size` bytes aligned to `alignment`, which must be a power of two
    fn aligned_malloc(&self, alignment: usize, size: usize) -> Option<NonNull<u8>>;

    /// Release an allocation made by `aligned_malloc`
    ///
    /// # Safety
    /// `ptr` must have been returned by `aligned_malloc` of this hook and not freed since
    unsafe fn aligned_free(&self, ptr: NonNull<u8>);
}

/// Per-allocation record kept immediately before every payload handed out by
/// [`System`] and [`Arena`]
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocHeader {
    /// Usable bytes in the payload
    pub size: usize,

    /// Alignment the payload was placed at
    pub align: usize
}

pub(crate) const HEADER_SIZE: usize = mem::size_of::<AllocHeader>();

impl AllocHeader {
    /// # Safety
    /// `payload` must be preceded by a header written with `write`
    #[inline]
    pub unsafe fn read(payload: NonNull<u8>) -> Self {
        ptr::read_unaligned(payload.as_ptr().sub(HEADER_SIZE) as *const AllocHeader)
    }

    /// # Safety
    /// The `HEADER_SIZE` bytes before `payload` must be writable
    #[inline]
    pub unsafe fn write(self, payload: NonNull<u8>) {
        ptr::write_unaligned(payload.as_ptr().sub(HEADER_SIZE) as *mut AllocHeader, self);
    }
}

/// Round `value` up to the next multiple of `align`, a power of two
#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());

    value.checked_add(align - 1)
        .map(|v| v & !(align - 1))
}

/// A shared handle to a memory hook
#[derive(Clone)]
pub struct Memory {
    hook: Arc<dyn MemoryHook>
}

impl Memory {
    /// Wrap a hook in a new handle
    pub fn new<H: MemoryHook + 'static>(hook: H) -> Self {
        Self {
            hook: Arc::new(hook)
        }
    }

    /// Wrap an already shared hook
    pub fn from_arc(hook: Arc<dyn MemoryHook>) -> Self {
        Self {
            hook
        }
    }

    /// The default hook backed by the platform allocator
    pub fn system() -> Self {
        static SYSTEM: OnceLock<Memory> = OnceLock::new();

        SYSTEM.get_or_init(|| Memory::new(System))
            .clone()
    }

    /// The hook currently installed process wide
    pub fn global() -> Self {
        GLOBAL_HOOK.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(Memory::system)
    }

    /// Check if two handles refer to the same hook instance
    pub fn ptr_eq(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.hook, &other.hook)
    }

    #[inline]
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.hook.malloc(size)
    }

    /// # Safety
    /// See [`MemoryHook::realloc`]
    #[inline]
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.hook.realloc(ptr, size)
    }

    #[inline]
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.hook.calloc(count, size)
    }

    /// # Safety
    /// See [`MemoryHook::free`]
    #[inline]
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.hook.free(ptr)
    }

    #[inline]
    pub fn aligned_malloc(&self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
        self.hook.aligned_malloc(alignment, size)
    }

    /// # Safety
    /// See [`MemoryHook::aligned_free`]
    #[inline]
    pub unsafe fn aligned_free(&self, ptr: NonNull<u8>) {
        self.hook.aligned_free(ptr)
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::global()
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Memory")
            .field("hook", &Arc::as_ptr(&self.hook))
            .finish()
    }
}

static GLOBAL_HOOK: RwLock<Option<Memory>> = RwLock::new(None);

/// Replace the process-wide memory hook.
///
/// Allocations already made keep releasing through the hook that produced them. Install
/// the hook before other threads start allocating through [`Memory::global`].
pub fn init_memory_hook(memory: Memory) {
    debug!(hook = ?memory, "installing global memory hook");

    *GLOBAL_HOOK.write().unwrap_or_else(PoisonError::into_inner) = Some(memory);
}

/// Restore the platform allocator as the process-wide hook
pub fn reset_memory_hook() {
    debug!("restoring system memory hook");

    *GLOBAL_HOOK.write().unwrap_or_else(PoisonError::into_inner) = None;
}

/// Allocate through the global hook
pub fn malloc(size: usize) -> Option<NonNull<u8>> {
    Memory::global().malloc(size)
}

/// Reallocate through the global hook
///
/// # Safety
/// `ptr` must come from the currently installed hook, see [`MemoryHook::realloc`]
pub unsafe fn realloc(ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    Memory::global().realloc(ptr, size)
}

/// Allocate zeroed memory through the global hook
pub fn calloc(count: usize, size: usize) -> Option<NonNull<u8>> {
    Memory::global().calloc(count, size)
}

/// Free through the global hook
///
/// # Safety
/// `ptr` must come from the currently installed hook, see [`MemoryHook::free`]
pub unsafe fn free(ptr: NonNull<u8>) {
    Memory::global().free(ptr)
}

/// Allocate aligned memory through the global hook
pub fn aligned_malloc(alignment: usize, size: usize) -> Option<NonNull<u8>> {
    Memory::global().aligned_malloc(alignment, size)
}

/// Free aligned memory through the global hook
///
/// # Safety
/// `ptr` must come from the currently installed hook, see [`MemoryHook::aligned_free`]
pub unsafe fn aligned_free(ptr: NonNull<u8>) {
    Memory::global().aligned_free(ptr)
}
