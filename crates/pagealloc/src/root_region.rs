//! Leak detector root region notifications.
//!
//! Pages handed out by the platform allocator are invisible to a leak detector that only scans
//! the heap, so objects referenced solely from them would be reported as leaked. A
//! [`RootRegionObserver`] is told about every such range instead. Only the platform allocator is
//! reported: other allocators are usually carved out of platform pages already, and reporting them
//! would register the same memory twice.

use crate::page_allocator::same_allocator;
use crate::{PageAllocator, Platform, VirtualAddress, platform_page_allocator};

/// Receives root region registrations. Both methods default to doing nothing.
pub trait RootRegionObserver: Sync {
    /// `[address, address + size)` is now owned by this crate.
    fn register_root_region(&self, address: VirtualAddress, size: usize) {
        let _ = (address, size);
    }

    /// `[address, address + size)` is no longer owned by this crate.
    fn unregister_root_region(&self, address: VirtualAddress, size: usize) {
        let _ = (address, size);
    }
}

/// Returns the observer that should hear about ranges owned by `allocator`, if any.
fn observer_for(allocator: &dyn PageAllocator) -> Option<&'static dyn RootRegionObserver> {
    let observer = Platform::current().root_region_observer()?;
    same_allocator(allocator, platform_page_allocator()).then_some(observer)
}

pub(crate) fn register(allocator: &dyn PageAllocator, address: VirtualAddress, size: usize) {
    if let Some(observer) = observer_for(allocator) {
        observer.register_root_region(address, size);
    }
}

pub(crate) fn unregister(allocator: &dyn PageAllocator, address: VirtualAddress, size: usize) {
    if let Some(observer) = observer_for(allocator) {
        observer.unregister_root_region(address, size);
    }
}

/// Replaces the registration of `[address, address + old_size)` with
/// `[address, address + new_size)`.
pub(crate) fn resize(
    allocator: &dyn PageAllocator,
    address: VirtualAddress,
    old_size: usize,
    new_size: usize,
) {
    if let Some(observer) = observer_for(allocator) {
        observer.unregister_root_region(address, old_size);
        observer.register_root_region(address, new_size);
    }
}
