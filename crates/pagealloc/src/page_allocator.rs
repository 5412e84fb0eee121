//! The page allocator capability consumed by this crate.
//!
//! A [`PageAllocator`] is supplied by the embedder (or falls back to the built-in OS allocator)
//! and is only ever borrowed. Implementations must be safe to call from several threads at once;
//! apart from their granularity constants they are treated as stateless.

use crate::VirtualAddress;

/// Access permissions for a range of pages.
///
/// Platforms may support only a subset; an unsupported permission makes the corresponding
/// primitive operation fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Pages are reserved but cannot be accessed.
    NoAccess,
    /// Pages can be read.
    Read,
    /// Pages can be read and written.
    ReadWrite,
    /// Pages can be read and executed.
    ReadExecute,
    /// Pages can be read, written, and executed.
    ReadWriteExecute,
}

impl Permission {
    /// Returns true if this permission allows reads.
    pub const fn is_readable(self) -> bool {
        !matches!(self, Permission::NoAccess)
    }

    /// Returns true if this permission allows writes.
    pub const fn is_writable(self) -> bool {
        matches!(self, Permission::ReadWrite | Permission::ReadWriteExecute)
    }

    /// Returns true if this permission allows execution.
    pub const fn is_executable(self) -> bool {
        matches!(
            self,
            Permission::ReadExecute | Permission::ReadWriteExecute
        )
    }
}

/// A page-granular allocator of virtual address space.
///
/// # Contract
///
/// - [`allocate_page_size`](Self::allocate_page_size) and
///   [`commit_page_size`](Self::commit_page_size) are powers of two, the commit granularity is
///   no larger than the allocate granularity, and neither changes for the lifetime of the
///   allocator.
/// - [`allocate_pages`](Self::allocate_pages) returns a range aligned to `alignment` whose size
///   is exactly `size`, or `None` if the address space could not be obtained. The hint is a
///   preference only.
/// - [`release_pages`](Self::release_pages) unmaps the trailing `size - new_size` bytes,
///   leaving the leading `new_size` bytes untouched.
pub trait PageAllocator: Sync {
    /// Granularity of allocations (address and size) in bytes.
    fn allocate_page_size(&self) -> usize;

    /// Granularity of commit, permission, and release operations in bytes.
    fn commit_page_size(&self) -> usize;

    /// Seeds the generator used by [`random_mmap_addr`](Self::random_mmap_addr).
    fn set_random_mmap_seed(&self, seed: i64);

    /// Returns a randomized, allocate-aligned address suitable as an allocation hint.
    fn random_mmap_addr(&self) -> VirtualAddress;

    /// Reserves `size` bytes aligned to `alignment`, preferably at `hint`.
    fn allocate_pages(
        &self,
        hint: VirtualAddress,
        size: usize,
        alignment: usize,
        permission: Permission,
    ) -> Option<VirtualAddress>;

    /// Frees a range previously returned by [`allocate_pages`](Self::allocate_pages).
    fn free_pages(&self, address: VirtualAddress, size: usize) -> bool;

    /// Shrinks a reservation of `size` bytes at `address` down to `new_size` bytes.
    fn release_pages(&self, address: VirtualAddress, size: usize, new_size: usize) -> bool;

    /// Changes the access permissions of a range of pages.
    fn set_permissions(&self, address: VirtualAddress, size: usize, permission: Permission)
    -> bool;
}

/// Returns true if `a` and `b` are the same allocator instance.
pub(crate) fn same_allocator(a: &dyn PageAllocator, b: &dyn PageAllocator) -> bool {
    core::ptr::addr_eq(a as *const dyn PageAllocator, b as *const dyn PageAllocator)
}
