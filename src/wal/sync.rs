//! The sync barrier callers block on between appending a change and
//! being told it's durable.
//!
//! Conceptually this mirrors closing a `chan struct{}` to broadcast to
//! every waiter at once: [`SyncPoint::fire`] flips the flag and wakes
//! every thread parked in [`SyncPoint::wait`]; the WAL then replaces its
//! current sync point with a fresh, unfired one for the next batch.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

pub struct SyncPoint {
    fired: Mutex<bool>,
    condvar: Condvar,
}

impl SyncPoint {
    pub fn new() -> Arc<Self> {
        Arc::new(SyncPoint { fired: Mutex::new(false), condvar: Condvar::new() })
    }

    /// Blocks the calling thread until this sync point is fired.
    pub fn wait(self: &Arc<Self>) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.condvar.wait(&mut fired);
        }
    }

    pub fn fire(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.condvar.notify_all();
    }

    #[cfg(test)]
    pub fn is_fired(&self) -> bool {
        *self.fired.lock()
    }
}
