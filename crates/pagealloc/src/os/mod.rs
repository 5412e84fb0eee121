//! Concrete page allocators.
//!
//! The OS allocator is the built-in fallback for the platform page allocator on unix hosts. The
//! software-emulated allocator is available to tests, or to downstream crates via the
//! `software-emulation` feature.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::OsPageAllocator;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::EmulatedPageAllocator;
