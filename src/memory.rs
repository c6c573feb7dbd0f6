//! Allocation accounting.
//!
//! `CountingAllocator` wraps the system allocator and keeps running totals
//! that the resource monitor reads at round boundaries. The binary installs it
//! as the global allocator; the library only ever sees it through the
//! `MemoryProbe` trait so tests can substitute fixed numbers.

use serde::{Deserialize, Serialize};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub peak_bytes: u64,
    pub current_bytes: u64,
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub current_blocks: u64,
}

/// Read access to allocator counters.
pub trait MemoryProbe: Send + Sync {
    fn stats(&self) -> MemoryStats;
}

impl<T: MemoryProbe + ?Sized> MemoryProbe for &'static T {
    fn stats(&self) -> MemoryStats {
        (**self).stats()
    }
}

/// Probe for processes that do not track allocations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemoryProbe;

impl MemoryProbe for NoMemoryProbe {
    fn stats(&self) -> MemoryStats {
        MemoryStats::default()
    }
}

/// Global allocator that counts bytes and blocks.
pub struct CountingAllocator {
    current_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    alloc_count: AtomicU64,
    dealloc_count: AtomicU64,
    current_blocks: AtomicU64,
}

impl CountingAllocator {
    pub const fn new() -> Self {
        Self {
            current_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            current_blocks: AtomicU64::new(0),
        }
    }

    fn record_alloc(&self, size: u64) {
        let current = self.current_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.current_blocks.fetch_add(1, Ordering::Relaxed);
        self.peak_bytes.fetch_max(current, Ordering::Relaxed);
    }

    fn record_dealloc(&self, size: u64) {
        self.current_bytes.fetch_sub(size, Ordering::Relaxed);
        self.dealloc_count.fetch_add(1, Ordering::Relaxed);
        self.current_blocks.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for CountingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            self.record_alloc(layout.size() as u64);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            self.record_alloc(layout.size() as u64);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        self.record_dealloc(layout.size() as u64);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            let old_size = layout.size() as u64;
            let new_size = new_size as u64;
            if new_size >= old_size {
                let grown = new_size - old_size;
                let current = self.current_bytes.fetch_add(grown, Ordering::Relaxed) + grown;
                self.peak_bytes.fetch_max(current, Ordering::Relaxed);
            } else {
                self.current_bytes
                    .fetch_sub(old_size - new_size, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}

impl MemoryProbe for CountingAllocator {
    fn stats(&self) -> MemoryStats {
        MemoryStats {
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            dealloc_count: self.dealloc_count.load(Ordering::Relaxed),
            current_blocks: self.current_blocks.load(Ordering::Relaxed),
        }
    }
}
