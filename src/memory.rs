//! Process memory accounting.
//!
//! A thin counting wrapper around the system allocator keeps a running total
//! of live heap bytes in an atomic, so the reactor and the background
//! workers can both account allocations without coordination. The binary
//! installs [`CountingAllocator`] as the global allocator; `used_memory`
//! reads the counter.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    sync::atomic::{AtomicUsize, Ordering},
};

static USED: AtomicUsize = AtomicUsize::new(0);

/// Live heap bytes allocated through [`CountingAllocator`].
pub fn used_memory() -> usize {
    USED.load(Ordering::Relaxed)
}

/// System allocator with byte-level accounting.
pub struct CountingAllocator;

#[allow(unsafe_code)]
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            USED.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            USED.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        USED.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            USED.fetch_add(new_size, Ordering::Relaxed);
            USED.fetch_sub(layout.size(), Ordering::Relaxed);
        }
        new_ptr
    }
}

/// Render a byte count the way the `info` command reports it.
pub fn human_bytes(bytes: usize) -> String {
    const UNITS: &[(usize, &str)] = &[
        (1 << 30, "G"),
        (1 << 20, "M"),
        (1 << 10, "K"),
    ];
    for &(scale, suffix) in UNITS {
        if bytes >= scale {
            return format!("{:.2}{suffix}", bytes as f64 / scale as f64);
        }
    }
    format!("{bytes}B")
}

#[cfg(test)]
mod tests {
    use super::human_bytes;

    #[test]
    fn human_readable_sizes() {
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.00K");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00M");
        assert_eq!(human_bytes(1 << 30), "1.00G");
    }
}
