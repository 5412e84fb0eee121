//! Process-wide platform registration.
//!
//! The embedder describes its environment with a [`Platform`]: which page allocator to use for
//! process-wide allocations, who to notify under memory pressure, and who wants to hear about
//! root regions for leak detection. Everything is optional; missing pieces fall back to built-in
//! defaults or no-ops.

use crate::{MemoryPressureHandler, PageAllocator, RootRegionObserver};

/// Embedder-supplied collaborators.
#[derive(Clone, Copy, Default)]
pub struct Platform {
    page_allocator: Option<&'static dyn PageAllocator>,
    pressure_handler: Option<&'static dyn MemoryPressureHandler>,
    root_region_observer: Option<&'static dyn RootRegionObserver>,
}

impl Platform {
    /// Creates a platform with no collaborators.
    pub const fn new() -> Self {
        Self {
            page_allocator: None,
            pressure_handler: None,
            root_region_observer: None,
        }
    }

    /// Uses `allocator` as the platform page allocator.
    pub const fn with_page_allocator(mut self, allocator: &'static dyn PageAllocator) -> Self {
        self.page_allocator = Some(allocator);
        self
    }

    /// Sends memory pressure notifications to `handler`.
    pub const fn with_pressure_handler(
        mut self,
        handler: &'static dyn MemoryPressureHandler,
    ) -> Self {
        self.pressure_handler = Some(handler);
        self
    }

    /// Reports platform allocator root regions to `observer`.
    pub const fn with_root_region_observer(
        mut self,
        observer: &'static dyn RootRegionObserver,
    ) -> Self {
        self.root_region_observer = Some(observer);
        self
    }

    /// Returns the embedder's page allocator, if one was supplied.
    pub fn page_allocator(&self) -> Option<&'static dyn PageAllocator> {
        self.page_allocator
    }

    /// Returns the memory pressure handler, if one was supplied.
    pub fn pressure_handler(&self) -> Option<&'static dyn MemoryPressureHandler> {
        self.pressure_handler
    }

    /// Returns the root region observer, if one was supplied.
    pub fn root_region_observer(&self) -> Option<&'static dyn RootRegionObserver> {
        self.root_region_observer
    }

    /// Installs the process-wide platform.
    ///
    /// This function must be called at most once, before the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if a platform has already been installed, or if the default platform was sealed by
    /// an earlier call to [`Platform::current`].
    pub fn set_current(platform: Platform) {
        assert!(
            with_platform(|cell| try_install(cell, platform)),
            "platform already set"
        );
        log::debug!(
            "platform installed (page allocator: {}, pressure handler: {}, \
             root region observer: {})",
            platform.page_allocator.is_some(),
            platform.pressure_handler.is_some(),
            platform.root_region_observer.is_some()
        );
    }

    /// Returns the current platform.
    ///
    /// If no platform has been installed yet, an empty platform is installed and returned.
    pub fn current() -> Platform {
        with_platform(|cell| *cell.call_once(Platform::new))
    }
}

/// Returns the page allocator used for process-wide allocations.
///
/// Resolved once: the embedder's allocator if the current [`Platform`] has one, otherwise the
/// built-in OS allocator.
///
/// # Panics
///
/// Panics if no allocator was registered and the target has no built-in allocator.
pub fn platform_page_allocator() -> &'static dyn PageAllocator {
    with_page_allocator(|cell| {
        *cell.call_once(|| match Platform::current().page_allocator() {
            Some(allocator) => allocator,
            None => {
                log::debug!("no embedder page allocator, using built-in default");
                default_page_allocator()
            }
        })
    })
}

/// Stores `platform` in `cell` unless it is already initialized. Returns true if it was stored.
fn try_install(cell: &spin::Once<Platform>, platform: Platform) -> bool {
    let mut installed = false;
    cell.call_once(|| {
        installed = true;
        platform
    });
    installed
}

#[cfg(unix)]
fn default_page_allocator() -> &'static dyn PageAllocator {
    static DEFAULT: crate::OsPageAllocator = crate::OsPageAllocator::new();
    &DEFAULT
}

#[cfg(not(unix))]
fn default_page_allocator() -> &'static dyn PageAllocator {
    panic!("no page allocator registered and no built-in allocator for this target")
}

/// Global platform and resolved page allocator.
///
/// In test/software-emulation mode these are thread-local so that each test can install its own
/// platform.
#[cfg(not(any(test, feature = "software-emulation")))]
static PLATFORM: spin::Once<Platform> = spin::Once::new();

#[cfg(not(any(test, feature = "software-emulation")))]
static PAGE_ALLOCATOR: spin::Once<&'static dyn PageAllocator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static PLATFORM: spin::Once<Platform> = const { spin::Once::new() };
    static PAGE_ALLOCATOR: spin::Once<&'static dyn PageAllocator> = const { spin::Once::new() };
}

#[cfg(not(any(test, feature = "software-emulation")))]
fn with_platform<R>(f: impl FnOnce(&spin::Once<Platform>) -> R) -> R {
    f(&PLATFORM)
}

#[cfg(any(test, feature = "software-emulation"))]
fn with_platform<R>(f: impl FnOnce(&spin::Once<Platform>) -> R) -> R {
    PLATFORM.with(f)
}

#[cfg(not(any(test, feature = "software-emulation")))]
fn with_page_allocator<R>(f: impl FnOnce(&spin::Once<&'static dyn PageAllocator>) -> R) -> R {
    f(&PAGE_ALLOCATOR)
}

#[cfg(any(test, feature = "software-emulation"))]
fn with_page_allocator<R>(f: impl FnOnce(&spin::Once<&'static dyn PageAllocator>) -> R) -> R {
    PAGE_ALLOCATOR.with(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmulatedPageAllocator;
    use crate::page_allocator::same_allocator;

    #[test]
    fn current_defaults_to_empty_platform() {
        let platform = Platform::current();
        assert!(platform.page_allocator().is_none());
        assert!(platform.pressure_handler().is_none());
        assert!(platform.root_region_observer().is_none());
    }

    #[test]
    fn embedder_allocator_is_used() {
        let allocator: &'static EmulatedPageAllocator =
            Box::leak(Box::new(EmulatedPageAllocator::new(4096, 4096)));
        Platform::set_current(Platform::new().with_page_allocator(allocator));

        assert!(same_allocator(platform_page_allocator(), allocator));
        assert_eq!(platform_page_allocator().allocate_page_size(), 4096);
    }

    #[test]
    #[should_panic(expected = "platform already set")]
    fn second_installation_panics() {
        Platform::set_current(Platform::new());
        Platform::set_current(Platform::new());
    }

    #[test]
    #[should_panic(expected = "platform already set")]
    fn installation_after_first_use_panics() {
        let _ = Platform::current();
        Platform::set_current(Platform::new());
    }

    #[test]
    fn racing_installations_store_exactly_one() {
        let cell = spin::Once::new();
        let results: Vec<(&'static EmulatedPageAllocator, bool)> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let allocator: &'static EmulatedPageAllocator =
                        Box::leak(Box::new(EmulatedPageAllocator::new(4096, 4096)));
                    let cell = &cell;
                    s.spawn(move || {
                        let platform = Platform::new().with_page_allocator(allocator);
                        (allocator, try_install(cell, platform))
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .collect()
        });

        let winners: Vec<_> = results.iter().filter(|(_, installed)| *installed).collect();
        assert_eq!(winners.len(), 1);

        let stored = cell.get().and_then(Platform::page_allocator).unwrap();
        assert!(same_allocator(stored, winners[0].0));
    }

    #[cfg(unix)]
    #[test]
    fn falls_back_to_os_allocator() {
        let allocator = platform_page_allocator();
        assert!(allocator.allocate_page_size().is_power_of_two());
        assert!(same_allocator(allocator, platform_page_allocator()));
    }
}
