//! Single-transition broadcast latch.
//!
//! A latch trips exactly once and stays tripped; every waiter past and future
//! observes the transition. Used for piece-finished signalling and for
//! aborting blocked reads.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot broadcast signal: `trip` releases all current and future waiters.
#[derive(Debug, Default)]
pub(crate) struct Latch {
    tripped: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Trips the latch, waking every waiter. Idempotent.
    pub(crate) fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Waits until the latch trips. Returns immediately if already tripped.
    ///
    /// No spurious completions: the future only resolves once `trip` has run.
    pub(crate) async fn wait(&self) {
        while !self.is_tripped() {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking, so a trip between the check and
            // the await still wakes us.
            notified.as_mut().enable();
            if self.is_tripped() {
                return;
            }
            notified.await;
        }
    }
}
