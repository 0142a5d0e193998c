//! Process-wide allocation counters backing the `heap` and `allocs` profiles.
//!
//! The counters only move once the host installs the allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: diagnosis::CountingAllocator = diagnosis::CountingAllocator;
//! ```

use serde::{Deserialize, Serialize};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

static ALLOC_BYTES: AtomicU64 = AtomicU64::new(0);
static ALLOC_COUNT: AtomicU64 = AtomicU64::new(0);
static DEALLOC_BYTES: AtomicU64 = AtomicU64::new(0);
static DEALLOC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Global allocator that counts every allocation before delegating to [`System`].
pub struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        track_alloc(layout.size());
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        track_alloc(layout.size());
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        track_dealloc(layout.size());
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        track_dealloc(layout.size());
        track_alloc(new_size);
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[inline]
fn track_alloc(size: usize) {
    ALLOC_BYTES.fetch_add(size as u64, Ordering::Relaxed);
    ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn track_dealloc(size: usize) {
    DEALLOC_BYTES.fetch_add(size as u64, Ordering::Relaxed);
    DEALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of the cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    pub alloc_bytes: u64,
    pub alloc_count: u64,
    pub dealloc_bytes: u64,
    pub dealloc_count: u64,
}

impl AllocStats {
    pub fn current() -> Self {
        Self {
            alloc_bytes: ALLOC_BYTES.load(Ordering::Relaxed),
            alloc_count: ALLOC_COUNT.load(Ordering::Relaxed),
            dealloc_bytes: DEALLOC_BYTES.load(Ordering::Relaxed),
            dealloc_count: DEALLOC_COUNT.load(Ordering::Relaxed),
        }
    }

    /// False until the first allocation goes through [`CountingAllocator`].
    pub fn allocator_installed(&self) -> bool {
        self.alloc_count > 0
    }

    pub fn live_bytes(&self) -> u64 {
        self.alloc_bytes.saturating_sub(self.dealloc_bytes)
    }

    pub fn live_objects(&self) -> u64 {
        self.alloc_count.saturating_sub(self.dealloc_count)
    }
}
