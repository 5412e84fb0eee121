//! Built-in page allocator for unix hosts, backed by `mmap`.

use core::ffi::c_void;

use libc::c_int;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::address::round_up;
use crate::{PageAllocator, Permission, VirtualAddress};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_NORESERVE: c_int = libc::MAP_NORESERVE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_NORESERVE: c_int = 0;

/// Mask applied to random hints so they land in the usable part of the address space.
#[cfg(target_pointer_width = "64")]
const RANDOM_ADDRESS_MASK: usize = 0x3FFF_FFFF_F000;
#[cfg(target_pointer_width = "32")]
const RANDOM_ADDRESS_MASK: usize = 0x3FFF_F000;

/// Added to masked random hints; keeps 32-bit hints clear of the executable and heap.
#[cfg(target_pointer_width = "64")]
const RANDOM_ADDRESS_OFFSET: usize = 0;
#[cfg(target_pointer_width = "32")]
const RANDOM_ADDRESS_OFFSET: usize = 0x2000_0000;

/// Page allocator that maps anonymous memory directly from the operating system.
///
/// Both granularities are the system page size.
pub struct OsPageAllocator {
    page_size: spin::Once<usize>,
    rng: spin::Mutex<Option<SmallRng>>,
}

impl OsPageAllocator {
    /// Creates a new OS page allocator.
    pub const fn new() -> Self {
        Self {
            page_size: spin::Once::new(),
            rng: spin::Mutex::new(None),
        }
    }

    fn page_size(&self) -> usize {
        *self.page_size.call_once(|| {
            // SAFETY: sysconf has no memory safety preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            assert!(raw > 0, "sysconf(_SC_PAGESIZE) failed");
            raw as usize
        })
    }

    /// Seed for the hint generator when the embedder never provided one.
    fn entropy(&self) -> u64 {
        // SAFETY: timespec is plain old data.
        let mut now: libc::timespec = unsafe { core::mem::zeroed() };
        // SAFETY: `now` is a valid, writable timespec.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() } as u64;

        (now.tv_sec as u64).rotate_left(32)
            ^ now.tv_nsec as u64
            ^ pid.rotate_left(48)
            ^ self as *const Self as u64
    }
}

impl Default for OsPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn protection(permission: Permission) -> c_int {
    let mut prot = libc::PROT_NONE;
    if permission.is_readable() {
        prot |= libc::PROT_READ;
    }
    if permission.is_writable() {
        prot |= libc::PROT_WRITE;
    }
    if permission.is_executable() {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Unmaps `[address, address + size)`.
fn unmap(address: usize, size: usize) -> bool {
    // SAFETY: callers only pass ranges this allocator mapped and no longer hands out.
    unsafe { libc::munmap(address as *mut c_void, size) == 0 }
}

impl PageAllocator for OsPageAllocator {
    fn allocate_page_size(&self) -> usize {
        self.page_size()
    }

    fn commit_page_size(&self) -> usize {
        self.page_size()
    }

    fn set_random_mmap_seed(&self, seed: i64) {
        if seed != 0 {
            *self.rng.lock() = Some(SmallRng::seed_from_u64(seed as u64));
        }
    }

    fn random_mmap_addr(&self) -> VirtualAddress {
        let raw: u64 = {
            let mut rng = self.rng.lock();
            rng.get_or_insert_with(|| SmallRng::seed_from_u64(self.entropy()))
                .r#gen()
        };
        let address = (raw as usize & RANDOM_ADDRESS_MASK) + RANDOM_ADDRESS_OFFSET;
        VirtualAddress::new(address).align_down(self.page_size())
    }

    fn allocate_pages(
        &self,
        hint: VirtualAddress,
        size: usize,
        alignment: usize,
        permission: Permission,
    ) -> Option<VirtualAddress> {
        let page_size = self.page_size();
        let alignment = alignment.max(page_size);
        // Over-reserve so an aligned range of `size` bytes fits, then trim the excess.
        let request = size.checked_add(alignment - page_size)?;

        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        if permission == Permission::NoAccess {
            flags |= MAP_NORESERVE;
        }

        // SAFETY: anonymous mapping without MAP_FIXED; the hint is advisory only.
        let mapped = unsafe {
            libc::mmap(
                hint.as_mut_ptr::<c_void>(),
                request,
                protection(permission),
                flags,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return None;
        }

        let base = mapped as usize;
        let aligned = round_up(base, alignment);
        let prefix = aligned - base;
        let suffix = request - prefix - size;
        if prefix > 0 {
            unmap(base, prefix);
        }
        if suffix > 0 {
            unmap(aligned + size, suffix);
        }

        Some(VirtualAddress::new(aligned))
    }

    fn free_pages(&self, address: VirtualAddress, size: usize) -> bool {
        unmap(address.as_usize(), size)
    }

    fn release_pages(&self, address: VirtualAddress, size: usize, new_size: usize) -> bool {
        unmap((address + new_size).as_usize(), size - new_size)
    }

    fn set_permissions(
        &self,
        address: VirtualAddress,
        size: usize,
        permission: Permission,
    ) -> bool {
        // SAFETY: the range belongs to a reservation owned by the caller.
        let result =
            unsafe { libc::mprotect(address.as_mut_ptr::<c_void>(), size, protection(permission)) };
        if result != 0 {
            return false;
        }

        if permission == Permission::NoAccess {
            // Discard the contents. Failure only costs memory.
            // SAFETY: same range as above, now inaccessible.
            unsafe { libc::madvise(address.as_mut_ptr::<c_void>(), size, libc::MADV_DONTNEED) };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr;

    #[test]
    fn page_size_is_sane() {
        let allocator = OsPageAllocator::new();
        let page_size = allocator.allocate_page_size();
        assert!(page_size.is_power_of_two());
        assert!(page_size >= 4096);
        assert_eq!(allocator.commit_page_size(), page_size);
    }

    #[test]
    fn protection_flags() {
        assert_eq!(protection(Permission::NoAccess), libc::PROT_NONE);
        assert_eq!(protection(Permission::Read), libc::PROT_READ);
        assert_eq!(
            protection(Permission::ReadWrite),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(
            protection(Permission::ReadExecute),
            libc::PROT_READ | libc::PROT_EXEC
        );
        assert_eq!(
            protection(Permission::ReadWriteExecute),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        );
    }

    #[test]
    fn reserve_write_release_free() {
        let allocator = OsPageAllocator::new();
        let page_size = allocator.allocate_page_size();
        let address = allocator
            .allocate_pages(VirtualAddress::NULL, 4 * page_size, page_size, Permission::ReadWrite)
            .unwrap();

        // SAFETY: the four pages were just mapped read-write.
        unsafe {
            ptr::write_bytes(address.as_mut_ptr::<u8>(), 0xa5, 4 * page_size);
            assert_eq!(*address.as_ptr::<u8>().add(4 * page_size - 1), 0xa5);
        }

        assert!(allocator.release_pages(address, 4 * page_size, page_size));
        // SAFETY: the first page is still mapped.
        unsafe { assert_eq!(*address.as_ptr::<u8>(), 0xa5) };

        assert!(allocator.free_pages(address, page_size));
    }

    #[test]
    fn large_alignment_is_honoured() {
        let allocator = OsPageAllocator::new();
        let page_size = allocator.allocate_page_size();
        let alignment = 0x20_0000;
        let address = allocator
            .allocate_pages(VirtualAddress::NULL, page_size, alignment, Permission::NoAccess)
            .unwrap();

        assert!(address.is_aligned(alignment));
        assert!(allocator.free_pages(address, page_size));
    }

    #[test]
    fn permissions_can_be_changed() {
        let allocator = OsPageAllocator::new();
        let page_size = allocator.allocate_page_size();
        let address = allocator
            .allocate_pages(VirtualAddress::NULL, page_size, page_size, Permission::NoAccess)
            .unwrap();

        assert!(allocator.set_permissions(address, page_size, Permission::ReadWrite));
        // SAFETY: the page is now read-write.
        unsafe {
            address.as_mut_ptr::<u64>().write(0x1234);
            assert_eq!(address.as_ptr::<u64>().read(), 0x1234);
        }
        assert!(allocator.set_permissions(address, page_size, Permission::NoAccess));
        assert!(allocator.free_pages(address, page_size));
    }

    #[test]
    fn seeded_hints_are_reproducible() {
        let a = OsPageAllocator::new();
        let b = OsPageAllocator::new();
        a.set_random_mmap_seed(7);
        b.set_random_mmap_seed(7);

        for _ in 0..4 {
            let hint = a.random_mmap_addr();
            assert_eq!(hint, b.random_mmap_addr());
            assert!(hint.is_aligned(a.allocate_page_size()));
        }
    }
}
