use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type OnComplete = Box<dyn FnOnce() + Send>;

/// Counts outstanding invalidations and runs the completion once all of them,
/// plus the issuing call itself, have arrived.
struct InvalidateBarrier {
    pending: AtomicUsize,
    on_complete: Mutex<Option<OnComplete>>,
}

impl InvalidateBarrier {
    fn arrive(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let cb = self
                .on_complete
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(cb) = cb {
                cb();
            }
        }
    }
}

/// Issuer's arrival at an invalidation barrier.
///
/// Dropping the guard marks issuance finished. Callers drop it after leaving
/// any critical section so the completion never runs under a lock it might
/// need.
#[must_use = "dropping the guard releases the invalidation completion"]
pub struct InvalidateGuard {
    barrier: Arc<InvalidateBarrier>,
}

impl InvalidateGuard {
    /// Start an invalidation. `on_complete` runs once the guard is dropped and
    /// every notifier handed out through it has completed.
    pub fn new(on_complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            barrier: Arc::new(InvalidateBarrier {
                pending: AtomicUsize::new(1),
                on_complete: Mutex::new(Some(Box::new(on_complete))),
            }),
        }
    }

    /// Hand out a notifier for one asynchronous invalidation.
    pub(crate) fn notifier(&self) -> InvalidateNotifier {
        self.barrier.pending.fetch_add(1, Ordering::AcqRel);
        InvalidateNotifier {
            barrier: Arc::clone(&self.barrier),
        }
    }
}

impl Drop for InvalidateGuard {
    fn drop(&mut self) {
        self.barrier.arrive();
    }
}

/// Held by a memory domain while an invalidation is in flight.
///
/// Completion is signalled by dropping the notifier (or calling `complete`).
pub struct InvalidateNotifier {
    barrier: Arc<InvalidateBarrier>,
}

impl InvalidateNotifier {
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for InvalidateNotifier {
    fn drop(&mut self) {
        self.barrier.arrive();
    }
}

impl std::fmt::Debug for InvalidateNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidateNotifier")
            .field("pending", &self.barrier.pending.load(Ordering::Relaxed))
            .finish()
    }
}
