//! Owning handles over virtual memory reservations.
//!
//! A [`VirtualMemory`] is either empty or owns exactly one reserved range. Ownership moves with
//! the value (or explicitly via [`VirtualMemory::take_control`] and [`VirtualMemory::take`]); the
//! range is freed when the owning handle is freed or dropped.
//!
//! A handle may be stored inside the memory it describes. Every operation that frees or shrinks
//! the range therefore updates the handle first and never reads it after the underlying page
//! allocator call.

use core::fmt;

use crate::address::checked_round_up;
use crate::paged::{self, AllocError};
use crate::{PageAllocator, Permission, VirtualAddress};

/// A reservation of virtual address space.
pub struct VirtualMemory<'a> {
    allocator: Option<&'a dyn PageAllocator>,
    address: VirtualAddress,
    size: usize,
}

impl<'a> VirtualMemory<'a> {
    /// Creates an empty handle.
    pub const fn empty() -> Self {
        Self {
            allocator: None,
            address: VirtualAddress::NULL,
            size: 0,
        }
    }

    /// Reserves at least `size` bytes aligned to `alignment`, preferably at `hint`.
    ///
    /// `size` and `alignment` are rounded up to the allocator's page size and the hint is aligned
    /// down to the alignment. The pages are reserved inaccessible. If nothing could be reserved,
    /// the returned handle is empty.
    pub fn new(
        allocator: &'a dyn PageAllocator,
        size: usize,
        hint: VirtualAddress,
        alignment: usize,
    ) -> Self {
        let page_size = allocator.allocate_page_size();
        let (Some(alignment), Some(size)) = (
            checked_round_up(alignment.max(page_size), page_size),
            checked_round_up(size, page_size),
        ) else {
            log::debug!(
                "reservation of {:#x} bytes aligned to {:#x} overflows the address space",
                size,
                alignment
            );
            return Self::empty();
        };
        if size == 0 {
            return Self::empty();
        }

        let hint = hint.align_down(alignment);
        match paged::allocate_pages(allocator, hint, size, alignment, Permission::NoAccess) {
            Ok(address) => Self {
                allocator: Some(allocator),
                address,
                size,
            },
            Err(err) => {
                log::debug!("reservation of {:#x} bytes failed: {}", size, err);
                Self::empty()
            }
        }
    }

    /// Reserves at least `size` bytes aligned to the allocator's page size.
    pub fn with_size(allocator: &'a dyn PageAllocator, size: usize, hint: VirtualAddress) -> Self {
        Self::new(allocator, size, hint, allocator.allocate_page_size())
    }

    /// Returns true if this handle owns a reservation.
    #[inline]
    pub fn is_reserved(&self) -> bool {
        !self.address.is_null()
    }

    /// Start of the reservation, or null if empty.
    #[inline]
    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    /// End (exclusive) of the reservation, or null if empty.
    #[inline]
    pub fn end(&self) -> VirtualAddress {
        self.address + self.size
    }

    /// Size of the reservation in bytes, or zero if empty.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The allocator that owns the reservation.
    #[inline]
    pub fn page_allocator(&self) -> Option<&'a dyn PageAllocator> {
        self.allocator
    }

    /// Returns true if `[address, address + size)` lies within the reservation.
    pub fn in_vm(&self, address: VirtualAddress, size: usize) -> bool {
        self.is_reserved()
            && address >= self.address
            && address
                .as_usize()
                .checked_add(size)
                .is_some_and(|end| end <= self.end().as_usize())
    }

    /// Forgets the reservation without freeing it.
    pub fn reset(&mut self) {
        self.allocator = None;
        self.address = VirtualAddress::NULL;
        self.size = 0;
    }

    /// Resets the handle and returns what it owned.
    fn take_parts(&mut self) -> Option<(&'a dyn PageAllocator, VirtualAddress, usize)> {
        let allocator = self.allocator?;
        let parts = (allocator, self.address, self.size);
        self.reset();
        Some(parts)
    }

    /// Changes the permissions of `[address, address + size)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not within the reservation.
    pub fn set_permissions(
        &mut self,
        address: VirtualAddress,
        size: usize,
        permission: Permission,
    ) -> Result<(), AllocError> {
        assert!(
            self.in_vm(address, size),
            "permission change of {:#x} bytes at {} is outside {:?}",
            size,
            address,
            self
        );
        let Some(allocator) = self.allocator else {
            unreachable!("in_vm holds only for reserved handles");
        };

        let result = paged::set_permissions(allocator, address, size, permission);
        debug_assert!(result.is_ok(), "permission change failed: {:?}", result);
        result
    }

    /// Releases everything from `free_start` to the end of the reservation.
    ///
    /// Returns the number of bytes released. The handle keeps the leading part.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty, `free_start` is not strictly inside the reservation and
    /// above its start, or the page allocator fails to release the tail.
    pub fn release(&mut self, free_start: VirtualAddress) -> usize {
        let Some(allocator) = self.allocator else {
            panic!("release of an empty reservation");
        };
        debug_assert!(
            free_start.is_aligned(allocator.commit_page_size()),
            "release start {} is not commit page aligned",
            free_start
        );

        let address = self.address;
        let old_size = self.size;
        assert!(
            address < free_start && free_start < address + old_size,
            "release start {} is not inside {:?}",
            free_start,
            self
        );

        let free_size = (address + old_size) - free_start;
        let new_size = old_size - free_size;
        // The handle may live in the released tail; it is not touched after this point.
        self.size = new_size;

        if let Err(err) = paged::release_pages(allocator, address, old_size, new_size) {
            panic!(
                "failed to release {:#x} bytes at {}: {}",
                free_size, free_start, err
            );
        }
        free_size
    }

    /// Frees the reservation, leaving the handle empty.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty or the page allocator fails to free the range.
    pub fn free(&mut self) {
        // The handle may live inside the range; it is reset before the range goes away.
        let Some((allocator, address, size)) = self.take_parts() else {
            panic!("free of an empty reservation");
        };

        // A tail release may have left the size at commit granularity only.
        let size = paged::round_to_allocate_page(allocator, size);
        if let Err(err) = paged::free_pages(allocator, address, size) {
            panic!("failed to free {:#x} bytes at {}: {}", size, address, err);
        }
    }

    /// Moves the reservation owned by `from` into this handle, leaving `from` empty.
    ///
    /// # Panics
    ///
    /// Panics if this handle already owns a reservation.
    pub fn take_control(&mut self, from: &mut VirtualMemory<'a>) {
        assert!(
            !self.is_reserved(),
            "cannot take control into a reserved handle {:?}",
            self
        );
        debug_assert!(from.is_reserved(), "taking control of an empty handle");

        if let Some((allocator, address, size)) = from.take_parts() {
            self.allocator = Some(allocator);
            self.address = address;
            self.size = size;
        }
    }

    /// Returns the reservation as a new handle, leaving this one empty.
    pub fn take(&mut self) -> VirtualMemory<'a> {
        core::mem::replace(self, Self::empty())
    }
}

impl Default for VirtualMemory<'_> {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for VirtualMemory<'_> {
    fn drop(&mut self) {
        if self.is_reserved() {
            self.free();
        }
    }
}

impl fmt::Debug for VirtualMemory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reserved() {
            write!(
                f,
                "VirtualMemory({}..{}, {:#x} bytes)",
                self.address,
                self.end(),
                self.size
            )
        } else {
            f.write_str("VirtualMemory(empty)")
        }
    }
}

/// Reserves `size` bytes at page alignment, returning the handle only if the reservation succeeded.
pub fn alloc_virtual_memory<'a>(
    allocator: &'a dyn PageAllocator,
    size: usize,
    hint: VirtualAddress,
) -> Option<VirtualMemory<'a>> {
    let vm = VirtualMemory::with_size(allocator, size, hint);
    vm.is_reserved().then_some(vm)
}

/// Reserves `size` bytes aligned to `alignment`, returning the handle only if the reservation
/// succeeded.
pub fn aligned_alloc_virtual_memory<'a>(
    allocator: &'a dyn PageAllocator,
    size: usize,
    alignment: usize,
    hint: VirtualAddress,
) -> Option<VirtualMemory<'a>> {
    let vm = VirtualMemory::new(allocator, size, hint, alignment);
    vm.is_reserved().then_some(vm)
}
