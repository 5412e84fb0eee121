//! Page-granular allocation functions.
//!
//! These validate their preconditions and then delegate to a [`PageAllocator`]. Reservations go
//! through the pressure retry policy; frees, releases and permission changes are attempted once.
//! Precondition violations are programming errors and panic.

use core::fmt;

use crate::address::round_up;
use crate::pressure::retry_under_pressure;
use crate::{PageAllocator, Permission, VirtualAddress, root_region};

/// Errors reported by the page-granular allocation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No address space could be reserved, even after relieving memory pressure.
    OutOfMemory,
    /// The page allocator refused to free the range.
    FreeFailed,
    /// The page allocator refused to release the tail of the range.
    ReleaseFailed,
    /// The page allocator refused to change the permissions of the range.
    PermissionChangeFailed,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => f.write_str("out of virtual address space"),
            AllocError::FreeFailed => f.write_str("failed to free pages"),
            AllocError::ReleaseFailed => f.write_str("failed to release pages"),
            AllocError::PermissionChangeFailed => f.write_str("failed to change page permissions"),
        }
    }
}

impl core::error::Error for AllocError {}

/// Reserves `size` bytes aligned to `alignment`, preferably at `hint`.
///
/// The allocation is retried under memory pressure; the pressure handler is asked for the
/// worst-case amount of address space needed to satisfy the alignment.
///
/// # Panics
///
/// Panics if `hint` is not aligned to `alignment` or `size` is not a multiple of the allocator's
/// page size.
pub fn allocate_pages(
    allocator: &dyn PageAllocator,
    hint: VirtualAddress,
    size: usize,
    alignment: usize,
    permission: Permission,
) -> Result<VirtualAddress, AllocError> {
    let page_size = allocator.allocate_page_size();
    assert!(
        hint.is_aligned(alignment),
        "allocation hint {} is not aligned to {:#x}",
        hint,
        alignment
    );
    assert!(
        size & (page_size - 1) == 0,
        "allocation size {:#x} is not a multiple of the page size {:#x}",
        size,
        page_size
    );

    let Some(request_size) = size.checked_add(alignment) else {
        log::debug!(
            "allocation of {:#x} bytes aligned to {:#x} overflows the address space",
            size,
            alignment
        );
        return Err(AllocError::OutOfMemory);
    };
    let request_size = request_size.saturating_sub(page_size);
    let address = retry_under_pressure(request_size, || {
        allocator.allocate_pages(hint, size, alignment, permission)
    })
    .ok_or(AllocError::OutOfMemory)?;

    log::trace!(
        "reserved {:#x} bytes at {} ({:?})",
        size,
        address,
        permission
    );
    root_region::register(allocator, address, size);
    Ok(address)
}

/// Frees a range previously obtained from [`allocate_pages`].
///
/// The caller must not touch `address` afterwards.
///
/// # Panics
///
/// Panics if `size` is not a multiple of the allocator's page size.
pub fn free_pages(
    allocator: &dyn PageAllocator,
    address: VirtualAddress,
    size: usize,
) -> Result<(), AllocError> {
    let page_size = allocator.allocate_page_size();
    assert!(
        size & (page_size - 1) == 0,
        "free size {:#x} is not a multiple of the page size {:#x}",
        size,
        page_size
    );

    if !allocator.free_pages(address, size) {
        log::error!("failed to free {:#x} bytes at {}", size, address);
        return Err(AllocError::FreeFailed);
    }

    log::trace!("freed {:#x} bytes at {}", size, address);
    root_region::unregister(allocator, address, size);
    Ok(())
}

/// Shrinks the reservation at `address` from `size` to `new_size` bytes, releasing the tail.
///
/// # Panics
///
/// Panics if `new_size` is not smaller than `size`.
pub fn release_pages(
    allocator: &dyn PageAllocator,
    address: VirtualAddress,
    size: usize,
    new_size: usize,
) -> Result<(), AllocError> {
    assert!(
        new_size < size,
        "release must shrink the range ({:#x} -> {:#x})",
        size,
        new_size
    );

    if !allocator.release_pages(address, size, new_size) {
        log::error!(
            "failed to release {:#x} bytes at {}",
            size - new_size,
            address + new_size
        );
        return Err(AllocError::ReleaseFailed);
    }

    log::trace!(
        "released {:#x} bytes at {}, {:#x} bytes remain",
        size - new_size,
        address + new_size,
        new_size
    );
    root_region::resize(allocator, address, size, new_size);
    Ok(())
}

/// Changes the permissions of `[address, address + size)`.
pub fn set_permissions(
    allocator: &dyn PageAllocator,
    address: VirtualAddress,
    size: usize,
    permission: Permission,
) -> Result<(), AllocError> {
    if allocator.set_permissions(address, size, permission) {
        Ok(())
    } else {
        log::error!(
            "failed to set {:?} on {:#x} bytes at {}",
            permission,
            size,
            address
        );
        Err(AllocError::PermissionChangeFailed)
    }
}

/// Reserves a single read-write page, preferably at `hint`.
///
/// Returns the page address and the number of bytes allocated, which is the allocator's
/// allocate page size.
pub fn allocate_page(
    allocator: &dyn PageAllocator,
    hint: VirtualAddress,
) -> Result<(VirtualAddress, usize), AllocError> {
    let page_size = allocator.allocate_page_size();
    let address = allocate_pages(allocator, hint, page_size, page_size, Permission::ReadWrite)?;
    Ok((address, page_size))
}

/// Rounds `size` up to the allocator's allocate page size.
pub(crate) fn round_to_allocate_page(allocator: &dyn PageAllocator, size: usize) -> usize {
    round_up(size, allocator.allocate_page_size())
}
