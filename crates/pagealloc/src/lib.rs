#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Page Allocation
//!
//! Page-granular virtual memory reservations on top of a pluggable [`PageAllocator`]. It
//! provides:
//!
//! - Reserving, freeing, shrinking and re-protecting page ranges, with a bounded retry that
//!   signals critical memory pressure between attempts.
//! - [`VirtualMemory`], an owning handle over a single reservation.
//! - Process-wide registration of the embedder's allocator, pressure handler and root region
//!   observer through [`Platform`].
//! - A built-in `mmap` allocator on unix hosts, and a software-emulated allocator for testing.

mod address;
mod os;
mod page_allocator;
mod paged;
mod platform;
mod pressure;
mod root_region;
mod virtual_memory;

pub use address::VirtualAddress;
pub use page_allocator::{PageAllocator, Permission};
pub use paged::{
    AllocError, allocate_page, allocate_pages, free_pages, release_pages, set_permissions,
};
pub use platform::{Platform, platform_page_allocator};
pub use pressure::{
    ALLOCATION_TRIES, MemoryPressureHandler, on_critical_memory_pressure, retry_under_pressure,
};
pub use root_region::RootRegionObserver;
pub use virtual_memory::{VirtualMemory, aligned_alloc_virtual_memory, alloc_virtual_memory};

#[cfg(unix)]
pub use os::OsPageAllocator;
#[cfg(any(test, feature = "software-emulation"))]
pub use os::EmulatedPageAllocator;

/// Allocation granularity of the platform page allocator.
pub fn allocate_page_size() -> usize {
    platform_page_allocator().allocate_page_size()
}

/// Commit granularity of the platform page allocator.
pub fn commit_page_size() -> usize {
    platform_page_allocator().commit_page_size()
}

/// Seeds the platform page allocator's random hint generator.
///
/// A seed of zero leaves the generator untouched on the built-in allocator.
pub fn set_random_mmap_seed(seed: i64) {
    platform_page_allocator().set_random_mmap_seed(seed);
}

/// Returns a random, page-aligned hint from the platform page allocator.
pub fn random_mmap_addr() -> VirtualAddress {
    platform_page_allocator().random_mmap_addr()
}
