//! Shutdown barrier for in-flight public operations.
//!
//! Every public operation registers itself before touching the WAL or a
//! folder and deregisters on return. `close()` flips the group into
//! draining mode (new operations are refused with
//! [`ContractManagerError::ShuttingDown`]) and then blocks until the
//! last in-flight operation has deregistered, so the final sync can run
//! without anything concurrently mutating state underneath it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

pub struct ThreadGroup {
    count: AtomicUsize,
    draining: AtomicBool,
    zero: Mutex<()>,
    zero_condvar: Condvar,
}

/// Proof that an operation registered with the group; dropping it
/// deregisters, so early returns (via `?`) can't leak a count.
pub struct GroupGuard<'a> {
    group: &'a ThreadGroup,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        if self.group.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _lock = self.group.zero.lock();
            self.group.zero_condvar.notify_all();
        }
    }
}

impl ThreadGroup {
    pub fn new() -> Self {
        ThreadGroup {
            count: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            zero: Mutex::new(()),
            zero_condvar: Condvar::new(),
        }
    }

    /// Registers one in-flight operation. Returns `None` once the group
    /// has begun draining; callers should surface
    /// [`crate::error::ContractManagerError::ShuttingDown`] in that case.
    pub fn add(&self) -> Option<GroupGuard<'_>> {
        if self.draining.load(Ordering::Acquire) {
            return None;
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        // Re-check after incrementing: a `close()` that started between
        // the load above and this increment must still see us counted,
        // so it can't proceed until our guard drops.
        if self.draining.load(Ordering::Acquire) {
            drop(GroupGuard { group: self });
            return None;
        }
        Some(GroupGuard { group: self })
    }

    /// Begins draining and blocks until every registered operation has
    /// finished. Idempotent: calling it twice is harmless.
    pub fn close(&self) {
        self.draining.store(true, Ordering::Release);
        let mut lock = self.zero.lock();
        while self.count.load(Ordering::Acquire) != 0 {
            self.zero_condvar.wait(&mut lock);
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn close_waits_for_in_flight_guard() {
        let group = Arc::new(ThreadGroup::new());
        let guard = group.add().unwrap();
        let closer_group = group.clone();
        let closer = thread::spawn(move || closer_group.close());
        thread::sleep(Duration::from_millis(20));
        assert!(group.is_draining());
        drop(guard);
        closer.join().unwrap();
    }

    #[test]
    fn add_refused_once_draining() {
        let group = ThreadGroup::new();
        group.close();
        assert!(group.add().is_none());
    }
}
