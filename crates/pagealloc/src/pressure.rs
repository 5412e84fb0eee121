//! Bounded retry under memory pressure.
//!
//! Page allocations that fail are retried a fixed number of times. Between a failed attempt and
//! the next one the embedder's [`MemoryPressureHandler`] is told how much memory is wanted, giving
//! it a chance to drop caches or otherwise free address space.

use crate::Platform;

/// Number of times an allocation is attempted before giving up.
pub const ALLOCATION_TRIES: usize = 2;

/// Receives critical memory pressure notifications.
///
/// The handler runs synchronously on the allocating thread. It may do arbitrary work, but must not
/// re-enter the allocation path that notified it.
pub trait MemoryPressureHandler: Sync {
    /// Called when an allocation failed and memory should be released if possible.
    fn on_critical_memory_pressure(&self);

    /// Called with the number of bytes the failed allocation needed.
    ///
    /// Returns false if the handler does not support sized notifications, in which case the
    /// unsized variant is called instead.
    fn on_critical_memory_pressure_sized(&self, length: usize) -> bool {
        let _ = length;
        self.on_critical_memory_pressure();
        true
    }
}

/// Notifies the platform's pressure handler that `length` bytes are urgently needed.
///
/// Always returns true: relief is best-effort and there is no signal saying whether anything was
/// actually freed, so callers keep retrying until their attempt bound.
pub fn on_critical_memory_pressure(length: usize) -> bool {
    match Platform::current().pressure_handler() {
        Some(handler) => {
            log::debug!("critical memory pressure: {:#x} bytes requested", length);
            if !handler.on_critical_memory_pressure_sized(length) {
                handler.on_critical_memory_pressure();
            }
        }
        None => log::debug!(
            "critical memory pressure ({:#x} bytes), no handler registered",
            length
        ),
    }
    true
}

/// Runs `attempt` up to [`ALLOCATION_TRIES`] times, signalling memory pressure between attempts.
///
/// `requested` is the size passed to the pressure handler. Returns the first successful result,
/// or `None` once every attempt has failed. Never aborts.
pub fn retry_under_pressure<T>(
    requested: usize,
    mut attempt: impl FnMut() -> Option<T>,
) -> Option<T> {
    for i in 0..ALLOCATION_TRIES {
        if let Some(result) = attempt() {
            return Some(result);
        }
        if i + 1 == ALLOCATION_TRIES {
            break;
        }
        if !on_critical_memory_pressure(requested) {
            break;
        }
    }

    log::warn!(
        "allocation of {:#x} bytes failed after {} attempts",
        requested,
        ALLOCATION_TRIES
    );
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Pressure handler that counts notifications and remembers the last requested size.
    #[derive(Default)]
    pub(crate) struct CountingHandler {
        pub(crate) sized: AtomicUsize,
        pub(crate) plain: AtomicUsize,
        pub(crate) last_length: AtomicUsize,
        pub(crate) sized_unsupported: bool,
    }

    impl CountingHandler {
        pub(crate) fn notifications(&self) -> usize {
            self.sized.load(Ordering::Relaxed).max(self.plain.load(Ordering::Relaxed))
        }
    }

    impl MemoryPressureHandler for CountingHandler {
        fn on_critical_memory_pressure(&self) {
            self.plain.fetch_add(1, Ordering::Relaxed);
        }

        fn on_critical_memory_pressure_sized(&self, length: usize) -> bool {
            self.sized.fetch_add(1, Ordering::Relaxed);
            self.last_length.store(length, Ordering::Relaxed);
            !self.sized_unsupported
        }
    }

    /// Installs a fresh counting handler as this thread's platform pressure handler.
    pub(crate) fn install_counting_handler() -> &'static CountingHandler {
        let handler: &'static CountingHandler = Box::leak(Box::new(CountingHandler::default()));
        Platform::set_current(Platform::new().with_pressure_handler(handler));
        handler
    }

    #[test]
    fn first_attempt_success_does_not_notify() {
        let handler = install_counting_handler();
        assert_eq!(retry_under_pressure(4096, || Some(7)), Some(7));
        assert_eq!(handler.notifications(), 0);
    }

    #[test]
    fn second_attempt_success_notifies_once() {
        let handler = install_counting_handler();
        let mut calls = 0;
        let result = retry_under_pressure(8192, || {
            calls += 1;
            (calls == 2).then_some(calls)
        });
        assert_eq!(result, Some(2));
        assert_eq!(calls, 2);
        assert_eq!(handler.sized.load(Ordering::Relaxed), 1);
        assert_eq!(handler.last_length.load(Ordering::Relaxed), 8192);
    }

    #[test]
    fn exhaustion_stops_at_bound() {
        let handler = install_counting_handler();
        let mut calls = 0;
        let result: Option<()> = retry_under_pressure(4096, || {
            calls += 1;
            None
        });
        assert_eq!(result, None);
        assert_eq!(calls, ALLOCATION_TRIES);
        assert_eq!(handler.notifications(), ALLOCATION_TRIES - 1);
    }

    #[test]
    fn falls_back_to_unsized_notification() {
        let handler: &'static CountingHandler = Box::leak(Box::new(CountingHandler {
            sized_unsupported: true,
            ..CountingHandler::default()
        }));
        Platform::set_current(Platform::new().with_pressure_handler(handler));

        assert!(on_critical_memory_pressure(1024));
        assert_eq!(handler.sized.load(Ordering::Relaxed), 1);
        assert_eq!(handler.plain.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn default_sized_notification_calls_unsized() {
        struct Plain(AtomicUsize);

        impl MemoryPressureHandler for Plain {
            fn on_critical_memory_pressure(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let handler: &'static Plain = Box::leak(Box::new(Plain(AtomicUsize::new(0))));
        Platform::set_current(Platform::new().with_pressure_handler(handler));

        assert!(on_critical_memory_pressure(1024));
        assert_eq!(handler.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn notification_without_handler_still_succeeds() {
        assert!(on_critical_memory_pressure(4096));
    }
}
