//! Process memory sampling.
//!
//! The orchestration loop never reads memory directly; it asks a
//! [`MemoryProbe`]. [`ProcessMemoryProbe`] is the production probe:
//!
//! - system memory in use: resident set size of this process
//! - cumulative allocations: bytes ever handed out by [`CountingAllocator`]
//!
//! The cumulative figure is only meaningful when the binary installs the
//! counting allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: memsoak_core::memory::CountingAllocator = memsoak_core::memory::CountingAllocator;
//! ```

use chrono::{DateTime, Utc};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

/// One memory reading. Compared against the ceiling, logged, then dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub taken_at: DateTime<Utc>,
    /// Memory currently held from the system, in bytes.
    pub system_memory_in_use: u64,
    /// Total bytes allocated since process start, in bytes.
    pub cumulative_allocated: u64,
}

impl MemorySample {
    pub fn new(system_memory_in_use: u64, cumulative_allocated: u64) -> Self {
        Self {
            taken_at: Utc::now(),
            system_memory_in_use,
            cumulative_allocated,
        }
    }
}

/// Source of memory readings.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;
}

static TOTAL_ALLOCATED: AtomicU64 = AtomicU64::new(0);

/// System allocator wrapper that counts every byte allocated.
pub struct CountingAllocator;

impl CountingAllocator {
    /// Bytes allocated since start. Zero if this allocator is not installed.
    pub fn total_allocated() -> u64 {
        TOTAL_ALLOCATED.load(Ordering::Relaxed)
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        TOTAL_ALLOCATED.fetch_add(layout.size() as u64, Ordering::Relaxed);
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        TOTAL_ALLOCATED.fetch_add(layout.size() as u64, Ordering::Relaxed);
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Growth counts as a fresh allocation of the extra bytes.
        if new_size > layout.size() {
            TOTAL_ALLOCATED.fetch_add((new_size - layout.size()) as u64, Ordering::Relaxed);
        }
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

/// Probe for the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> MemorySample {
        MemorySample::new(resident_bytes(), CountingAllocator::total_allocated())
    }
}

#[cfg(target_os = "linux")]
fn resident_bytes() -> u64 {
    // statm: size resident shared text lib data dt, all in pages
    let resident_pages = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| statm.split_whitespace().nth(1)?.parse::<u64>().ok());

    match resident_pages {
        Some(pages) => pages * page_size(),
        None => max_rss_bytes(),
    }
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> u64 {
    max_rss_bytes()
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

/// Peak resident set size from getrusage.
fn max_rss_bytes() -> u64 {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: usage points to writable memory sized for rusage
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return 0;
    }
    // SAFETY: getrusage succeeded and filled the struct
    let max_rss = unsafe { usage.assume_init() }.ru_maxrss.max(0) as u64;

    // macOS reports bytes, everyone else kilobytes
    if cfg!(target_os = "macos") {
        max_rss
    } else {
        max_rss * 1024
    }
}

/// Human-readable byte count: `512B`, `1.5K`, `11.0M`, ...
pub fn format_byte_count(bytes: u64) -> String {
    const UNITS: [char; 7] = ['K', 'M', 'G', 'T', 'P', 'E', 'Z'];

    if bytes < 1024 {
        return format!("{}B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", value, UNITS[unit])
}
