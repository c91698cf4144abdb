//! Everything related to memory.

use crate::platform;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

/// Owner of a zero-filled, page-aligned, physically contiguous allocation.
///
/// Dropping it runs `T`'s destructor in place and returns the block to the
/// host, so nested owners (permission maps, page tables) are released with it.
#[repr(transparent)]
pub struct AllocatedMemory<T>(NonNull<T>);

impl<T> AllocatedMemory<T> {
    /// Allocates `bytes` of contiguous physical memory.
    ///
    /// The memory is zero-filled, which must be a valid initial state of `T`.
    pub fn alloc_contiguous(bytes: usize) -> Option<Self> {
        log::trace!("Allocating {} bytes of contiguous physical memory", bytes);

        Some(Self(platform::alloc_contiguous(bytes)?.cast()))
    }

    pub fn as_ptr(&self) -> *mut T {
        self.0.as_ptr()
    }

    /// Physical address of the allocation.
    pub fn pa(&self) -> u64 {
        physical_address(self.0.as_ptr() as _)
    }
}

impl<T> Deref for AllocatedMemory<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { self.0.as_ref() }
    }
}

impl<T> DerefMut for AllocatedMemory<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.0.as_mut() }
    }
}

impl<T> Drop for AllocatedMemory<T> {
    fn drop(&mut self) {
        log::trace!("Freeing contiguous physical memory");

        unsafe {
            core::ptr::drop_in_place(self.0.as_ptr());
            platform::free_contiguous(self.0.as_ptr() as _);
        }
    }
}

pub fn physical_address(ptr: *const ()) -> u64 {
    platform::virt_to_phys(ptr)
}
