//! Blocking wait queue used by flush waiters.
//!
//! The condition itself lives elsewhere (usually behind the work queue lock);
//! this type only provides the sleep/wake rendezvous. Waiters evaluate the
//! condition while holding the internal mutex and wakers take that mutex
//! before notifying, so a wakeup issued between the check and the sleep is
//! never lost.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Sleep/wake rendezvous for a condition owned by the caller.
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    /// Create a new wait queue.
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `condition` returns `true`.
    pub fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let mut guard = self.guard();
        while !condition() {
            guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until `condition` returns `true` or `timeout` elapses.
    ///
    /// Returns `true` if the condition was satisfied, `false` on timeout.
    pub fn wait_until_timeout<F>(&self, mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = self.guard();
        loop {
            if condition() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wake every waiter so it re-checks its condition.
    pub fn notify_all(&self) {
        let _guard = self.guard();
        self.cond.notify_all();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
