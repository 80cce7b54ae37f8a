/// Global heap: the region allocator behind a spin lock.
///
/// `LockedHeap` is what the kernel context allocates module images and
/// cache buffers from, and on a freestanding target it also backs the
/// `alloc` crate through `GlobalAlloc`, so both draw from the same regions.
///
/// Never allocate through `alloc` while holding the guard returned by
/// `lock()`: on the freestanding target that re-enters the same lock.
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use spin::{Mutex, MutexGuard};

use super::region::{HeapStats, RegionHeap, MM_ALIGN};
use crate::error::Result;

pub struct LockedHeap {
    inner: Mutex<RegionHeap>,
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl LockedHeap {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RegionHeap::new()),
        }
    }

    /// # Safety
    /// See [`RegionHeap::init_region`].
    pub unsafe fn init_region(&self, addr: usize, size: usize) {
        unsafe { self.inner.lock().init_region(addr, size) }
    }

    pub fn lock(&self) -> MutexGuard<'_, RegionHeap> {
        self.inner.lock()
    }

    pub fn memalign(&self, align: usize, size: usize) -> Result<NonNull<u8>> {
        self.inner.lock().memalign(align, size)
    }

    /// # Safety
    /// See [`RegionHeap::free`].
    pub unsafe fn free(&self, ptr: *mut u8) {
        unsafe { self.inner.lock().free(ptr) }
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.inner.lock().memalign(layout.align(), layout.size()) {
            Ok(p) => p.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.inner.lock().free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MM_ALIGN {
            // A moved block must keep the caller's alignment.
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            let fresh = unsafe { self.alloc(new_layout) };
            if !fresh.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
            }
            return fresh;
        }
        match unsafe { self.inner.lock().realloc(ptr, new_size) } {
            Ok(p) => p,
            Err(_) => ptr::null_mut(),
        }
    }
}

/// Heap backing `alloc` on the freestanding target.
#[cfg(target_os = "none")]
#[global_allocator]
pub static HEAP: LockedHeap = LockedHeap::new();
