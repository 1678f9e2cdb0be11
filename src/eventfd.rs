//! In-process event counter with `eventfd(2)`-like semantics.
//!
//! An [`EventFd`] is readable while its counter is non-zero. Writers add to
//! the counter and wake every registered [`PollWaker`]; a read drains the
//! counter. It serves both as a ring's kick source ([`ReadinessSource`]) and
//! as its completion notifier ([`CallNotifier`]).
//!
//! Wakers run with the internal lock held, which is what makes
//! [`remove_waker`](ReadinessSource::remove_waker) a barrier: once it
//! returns, the removed waker is neither running nor reachable.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::notifier::CallNotifier;
use crate::poll::{PollMask, PollWaker, ReadinessSource, WakerToken};

struct EventFdInner {
    count: u64,
    error: bool,
    next_token: u64,
    wakers: Vec<(WakerToken, Arc<dyn PollWaker>)>,
}

impl EventFdInner {
    fn readiness(&self) -> PollMask {
        let mut mask = PollMask::OUT;
        if self.count > 0 {
            mask |= PollMask::IN;
        }
        if self.error {
            mask |= PollMask::ERR;
        }
        mask
    }

    fn wake_all(&self) {
        let events = self.readiness();
        for (_, waker) in &self.wakers {
            waker.wake(events);
        }
    }
}

/// Level-triggered event counter.
pub struct EventFd {
    inner: Mutex<EventFdInner>,
}

impl EventFd {
    /// Creates a counter at zero with no wakers.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EventFdInner {
                count: 0,
                error: false,
                next_token: 0,
                wakers: Vec::new(),
            }),
        }
    }

    /// Adds `n` to the counter and wakes every waker.
    pub fn write(&self, n: u64) {
        let mut inner = self.inner.lock();
        inner.count = inner.count.saturating_add(n);
        inner.wake_all();
    }

    /// Drains the counter, returning its value or `None` if it was zero.
    pub fn read(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        match core::mem::take(&mut inner.count) {
            0 => None,
            n => Some(n),
        }
    }

    /// Current counter value without draining it.
    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    /// Whether the counter is non-zero.
    pub fn is_signaled(&self) -> bool {
        self.count() > 0
    }

    /// Puts the source into an error state reported as [`PollMask::ERR`].
    pub fn set_error(&self) {
        let mut inner = self.inner.lock();
        inner.error = true;
        inner.wake_all();
    }

    /// Number of registered wakers.
    pub fn waker_count(&self) -> usize {
        self.inner.lock().wakers.len()
    }
}

impl Default for EventFd {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessSource for EventFd {
    fn poll(&self) -> PollMask {
        self.inner.lock().readiness()
    }

    fn add_waker(&self, waker: Arc<dyn PollWaker>) -> WakerToken {
        let mut inner = self.inner.lock();
        let token = WakerToken(inner.next_token);
        inner.next_token += 1;
        inner.wakers.push((token, waker));
        token
    }

    fn remove_waker(&self, token: WakerToken) {
        self.inner.lock().wakers.retain(|(t, _)| *t != token);
    }
}

impl CallNotifier for EventFd {
    fn notify(&self) {
        self.write(1);
    }
}
