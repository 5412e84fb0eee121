//! Software-emulated page allocator for testing and development.
//!
//! Nothing is mapped: the allocator hands out addresses from a private range and tracks the
//! state of every commit page in a map. Granularities are configurable so that the
//! allocate/commit split of platforms like Windows can be exercised on any host, and failures can
//! be injected to drive the pressure retry and error paths.
//!
//! Keep reservations small; every commit page costs a map entry. Freed address space is never
//! handed out again and every free is remembered for [`EmulatedPageAllocator::freed_ranges`], so
//! an instance is meant to live for a single test.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::BTreeMap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::{PageAllocator, Permission, VirtualAddress};

/// First address handed out by the emulated allocator.
const ADDRESS_SPACE_BASE: usize = 0x1000_0000;

/// Size of the emulated address space.
const ADDRESS_SPACE_SIZE: usize = 0x4000_0000;

struct EmulatedState {
    /// Next free address for bump allocation.
    next: usize,
    /// Permission of every reserved commit page, keyed by page address.
    pages: BTreeMap<usize, Permission>,
    rng: SmallRng,
    /// Every successful free, in order. Never trimmed.
    freed: Vec<(VirtualAddress, usize)>,
    failing_allocations: usize,
    fail_frees: bool,
    fail_releases: bool,
}

/// A page allocator that emulates address space reservations in software.
pub struct EmulatedPageAllocator {
    allocate_page_size: usize,
    commit_page_size: usize,
    state: spin::Mutex<EmulatedState>,
    allocate_calls: AtomicUsize,
    free_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl EmulatedPageAllocator {
    /// Creates an emulated allocator with the given granularities.
    ///
    /// # Panics
    ///
    /// Panics if either size is not a power of two or the commit page size exceeds the allocate
    /// page size.
    pub fn new(allocate_page_size: usize, commit_page_size: usize) -> Self {
        assert!(
            allocate_page_size.is_power_of_two() && commit_page_size.is_power_of_two(),
            "page sizes must be powers of two"
        );
        assert!(
            commit_page_size <= allocate_page_size,
            "commit page size must not exceed allocate page size"
        );

        Self {
            allocate_page_size,
            commit_page_size,
            state: spin::Mutex::new(EmulatedState {
                next: ADDRESS_SPACE_BASE,
                pages: BTreeMap::new(),
                rng: SmallRng::seed_from_u64(0),
                freed: Vec::new(),
                failing_allocations: 0,
                fail_frees: false,
                fail_releases: false,
            }),
            allocate_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` calls to [`PageAllocator::allocate_pages`] fail.
    pub fn fail_next_allocations(&self, count: usize) {
        self.state.lock().failing_allocations = count;
    }

    /// Makes [`PageAllocator::free_pages`] fail while `fail` is set.
    pub fn fail_frees(&self, fail: bool) {
        self.state.lock().fail_frees = fail;
    }

    /// Makes [`PageAllocator::release_pages`] fail while `fail` is set.
    pub fn fail_releases(&self, fail: bool) {
        self.state.lock().fail_releases = fail;
    }

    /// Number of allocation attempts, including failed ones.
    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::Relaxed)
    }

    /// Number of free attempts, including failed ones.
    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::Relaxed)
    }

    /// Number of release attempts, including failed ones.
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::Relaxed)
    }

    /// Ranges passed to successful [`PageAllocator::free_pages`] calls, oldest first.
    pub fn freed_ranges(&self) -> Vec<(VirtualAddress, usize)> {
        self.state.lock().freed.clone()
    }

    /// Total bytes currently reserved.
    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().pages.len() * self.commit_page_size
    }

    /// Returns the permission of the commit page containing `address`, or `None` if it is not
    /// reserved.
    pub fn permission_at(&self, address: VirtualAddress) -> Option<Permission> {
        let page = address.align_down(self.commit_page_size).as_usize();
        self.state.lock().pages.get(&page).copied()
    }

    /// Iterates over the commit page addresses of `[start, start + size)`.
    fn commit_pages(&self, start: usize, size: usize) -> impl Iterator<Item = usize> {
        (start..start + size).step_by(self.commit_page_size)
    }

    fn is_commit_aligned(&self, value: usize) -> bool {
        value & (self.commit_page_size - 1) == 0
    }
}

impl EmulatedState {
    fn range_is_free(&self, start: usize, size: usize) -> bool {
        self.pages.range(start..start + size).next().is_none()
    }
}

impl PageAllocator for EmulatedPageAllocator {
    fn allocate_page_size(&self) -> usize {
        self.allocate_page_size
    }

    fn commit_page_size(&self) -> usize {
        self.commit_page_size
    }

    fn set_random_mmap_seed(&self, seed: i64) {
        self.state.lock().rng = SmallRng::seed_from_u64(seed as u64);
    }

    fn random_mmap_addr(&self) -> VirtualAddress {
        let offset = self.state.lock().rng.gen_range(0..ADDRESS_SPACE_SIZE);
        VirtualAddress::new(ADDRESS_SPACE_BASE + offset).align_down(self.allocate_page_size)
    }

    fn allocate_pages(
        &self,
        hint: VirtualAddress,
        size: usize,
        alignment: usize,
        permission: Permission,
    ) -> Option<VirtualAddress> {
        self.allocate_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        if state.failing_allocations > 0 {
            state.failing_allocations -= 1;
            return None;
        }
        if size == 0
            || size > ADDRESS_SPACE_SIZE
            || !alignment.is_power_of_two()
            || alignment > ADDRESS_SPACE_SIZE
        {
            return None;
        }

        let hint = hint.as_usize();
        let limit = ADDRESS_SPACE_BASE + ADDRESS_SPACE_SIZE;
        let base = if hint >= ADDRESS_SPACE_BASE
            && hint & (alignment - 1) == 0
            && hint.checked_add(size).is_some_and(|end| end <= limit)
            && state.range_is_free(hint, size)
        {
            hint
        } else {
            let mut candidate = VirtualAddress::new(state.next).align_up(alignment).as_usize();
            // Skip over anything placed at a hint.
            while let Some((&taken, _)) =
                state.pages.range(candidate..candidate + size).next_back()
            {
                candidate = VirtualAddress::new(taken + self.commit_page_size)
                    .align_up(alignment)
                    .as_usize();
            }
            if candidate + size > limit {
                return None;
            }
            state.next = candidate + size;
            candidate
        };

        for page in self.commit_pages(base, size) {
            state.pages.insert(page, permission);
        }
        Some(VirtualAddress::new(base))
    }

    fn free_pages(&self, address: VirtualAddress, size: usize) -> bool {
        self.free_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        // Trailing pages may already be gone after a release, but the base must still be live.
        let start = address.as_usize();
        if state.fail_frees || !state.pages.contains_key(&start) {
            return false;
        }

        for page in self.commit_pages(start, size) {
            state.pages.remove(&page);
        }
        state.freed.push((address, size));
        true
    }

    fn release_pages(&self, address: VirtualAddress, size: usize, new_size: usize) -> bool {
        self.release_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        let start = address.as_usize();
        if state.fail_releases
            || new_size >= size
            || !self.is_commit_aligned(new_size)
            || !state.pages.contains_key(&start)
        {
            return false;
        }

        for page in self.commit_pages(start + new_size, size - new_size) {
            state.pages.remove(&page);
        }
        true
    }

    fn set_permissions(
        &self,
        address: VirtualAddress,
        size: usize,
        permission: Permission,
    ) -> bool {
        let mut state = self.state.lock();

        let start = address.as_usize();
        if !self.is_commit_aligned(start) || !self.is_commit_aligned(size) {
            return false;
        }
        if !self
            .commit_pages(start, size)
            .all(|page| state.pages.contains_key(&page))
        {
            return false;
        }

        for page in self.commit_pages(start, size) {
            state.pages.insert(page, permission);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let allocator = EmulatedPageAllocator::new(0x1000, 0x1000);
        let a = allocator
            .allocate_pages(VirtualAddress::NULL, 0x3000, 0x1000, Permission::NoAccess)
            .unwrap();
        let b = allocator
            .allocate_pages(VirtualAddress::NULL, 0x1000, 0x10000, Permission::NoAccess)
            .unwrap();

        assert!(b.is_aligned(0x10000));
        assert!(b.as_usize() >= a.as_usize() + 0x3000);
        assert_eq!(allocator.reserved_bytes(), 0x4000);
    }

    #[test]
    fn free_hint_is_honoured() {
        let allocator = EmulatedPageAllocator::new(0x1000, 0x1000);
        let hint = VirtualAddress::new(ADDRESS_SPACE_BASE + 0x100000);
        let address = allocator
            .allocate_pages(hint, 0x2000, 0x1000, Permission::ReadWrite)
            .unwrap();
        assert_eq!(address, hint);

        let second = allocator
            .allocate_pages(hint, 0x1000, 0x1000, Permission::ReadWrite)
            .unwrap();
        assert_ne!(second, hint);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let allocator = EmulatedPageAllocator::new(0x1000, 0x1000);
        allocator.fail_next_allocations(2);

        for _ in 0..2 {
            assert!(
                allocator
                    .allocate_pages(VirtualAddress::NULL, 0x1000, 0x1000, Permission::NoAccess)
                    .is_none()
            );
        }
        assert!(
            allocator
                .allocate_pages(VirtualAddress::NULL, 0x1000, 0x1000, Permission::NoAccess)
                .is_some()
        );
        assert_eq!(allocator.allocate_calls(), 3);
    }

    #[test]
    fn release_then_free_rounded_range() {
        let allocator = EmulatedPageAllocator::new(0x10000, 0x1000);
        let address = allocator
            .allocate_pages(VirtualAddress::NULL, 0x10000, 0x10000, Permission::NoAccess)
            .unwrap();

        assert!(allocator.release_pages(address, 0x10000, 0x1000));
        assert_eq!(allocator.reserved_bytes(), 0x1000);

        assert!(allocator.free_pages(address, 0x10000));
        assert_eq!(allocator.reserved_bytes(), 0);
    }

    #[test]
    fn release_requires_commit_alignment() {
        let allocator = EmulatedPageAllocator::new(0x10000, 0x1000);
        let address = allocator
            .allocate_pages(VirtualAddress::NULL, 0x10000, 0x10000, Permission::NoAccess)
            .unwrap();
        assert!(!allocator.release_pages(address, 0x10000, 0x800));
    }

    #[test]
    fn oversized_requests_fail() {
        let allocator = EmulatedPageAllocator::new(0x1000, 0x1000);
        let hint = VirtualAddress::new(ADDRESS_SPACE_BASE);
        let huge = usize::MAX & !0xfff;

        assert!(allocator.allocate_pages(hint, huge, 0x1000, Permission::NoAccess).is_none());
        assert_eq!(allocator.reserved_bytes(), 0);

        // A hint at the top of the address space is ignored rather than wrapped.
        let address = allocator
            .allocate_pages(VirtualAddress::new(huge), 0x1000, 0x1000, Permission::NoAccess)
            .unwrap();
        assert_eq!(address, hint);
    }

    #[test]
    fn free_of_unknown_range_fails() {
        let allocator = EmulatedPageAllocator::new(0x1000, 0x1000);
        assert!(!allocator.free_pages(VirtualAddress::new(ADDRESS_SPACE_BASE), 0x1000));
    }

    #[test]
    fn random_addresses_follow_seed() {
        let a = EmulatedPageAllocator::new(0x10000, 0x1000);
        let b = EmulatedPageAllocator::new(0x10000, 0x1000);
        a.set_random_mmap_seed(42);
        b.set_random_mmap_seed(42);

        for _ in 0..8 {
            let address = a.random_mmap_addr();
            assert_eq!(address, b.random_mmap_addr());
            assert!(address.is_aligned(0x10000));
            assert!(address.as_usize() >= ADDRESS_SPACE_BASE);
            assert!(address.as_usize() < ADDRESS_SPACE_BASE + ADDRESS_SPACE_SIZE);
        }
    }

    #[test]
    #[should_panic(expected = "commit page size must not exceed allocate page size")]
    fn rejects_inverted_granularity() {
        EmulatedPageAllocator::new(0x1000, 0x10000);
    }
}
