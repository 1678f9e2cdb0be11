//! Readiness polling adapter.
//!
//! A [`PollAdapter`] ties one [`WorkItem`] to an external readiness source.
//! The source calls back into the adapter from its own notification path; the
//! adapter filters the reported events against its mask and, on a match,
//! submits the work item to the device queue. That submission is the only
//! thing the wakeup path ever does, so it never blocks.
//!
//! ```text
//! ReadinessSource ──wake(events)──► PollWakeup ──mask match──► WorkQueue::enqueue
//!        ▲                                                         │
//!        └──── add_waker / remove_waker ◄── PollAdapter            ▼
//!                                                                Worker
//! ```

use alloc::sync::Arc;
use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};
use std::time::Duration;

use spin::Mutex;

use crate::error::{VhostError, VhostResult};
use crate::queue::WorkQueue;
use crate::work::WorkItem;

/// Readiness bits, using the Linux `poll(2)` encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PollMask(u32);

impl PollMask {
    /// No events.
    pub const EMPTY: Self = Self(0);
    /// Readable.
    pub const IN: Self = Self(0x001);
    /// Urgent data readable.
    pub const PRI: Self = Self(0x002);
    /// Writable.
    pub const OUT: Self = Self(0x004);
    /// Error condition.
    pub const ERR: Self = Self(0x008);
    /// Hung up.
    pub const HUP: Self = Self(0x010);

    /// Builds a mask from raw bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits of the mask.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for PollMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PollMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PollMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for PollMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PollMask, &str); 5] = [
            (PollMask::IN, "IN"),
            (PollMask::PRI, "PRI"),
            (PollMask::OUT, "OUT"),
            (PollMask::ERR, "ERR"),
            (PollMask::HUP, "HUP"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// Token identifying one registered waker on a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakerToken(pub u64);

/// Callback invoked by a readiness source when its state changes.
///
/// Implementations may be called concurrently with themselves and with the
/// worker, and must not block.
pub trait PollWaker: Send + Sync {
    fn wake(&self, events: PollMask);
}

/// Something whose readiness can be queried and watched.
pub trait ReadinessSource: Send + Sync {
    /// Current readiness.
    fn poll(&self) -> PollMask;

    /// Registers `waker` for future readiness changes.
    fn add_waker(&self, waker: Arc<dyn PollWaker>) -> WakerToken;

    /// Deregisters a waker. Once this returns the waker is not running and
    /// will not be called again.
    fn remove_waker(&self, token: WakerToken);
}

/// The part of an adapter handed to the readiness source.
struct PollWakeup {
    mask: PollMask,
    work: Arc<WorkItem>,
    queue: Arc<WorkQueue>,
}

impl PollWaker for PollWakeup {
    fn wake(&self, events: PollMask) {
        trace!("poll wakeup for work {}: {:?} vs {:?}", self.work.id(), events, self.mask);
        if !events.intersects(self.mask) {
            return;
        }
        self.queue.enqueue(&self.work);
    }
}

struct Registration {
    source: Arc<dyn ReadinessSource>,
    token: WakerToken,
}

/// Binds a work item to a readiness source under a wakeup mask.
pub struct PollAdapter {
    wakeup: Arc<PollWakeup>,
    registration: Mutex<Option<Registration>>,
}

impl PollAdapter {
    /// Creates an unregistered adapter submitting `work` to `queue` whenever
    /// a wakeup matching `mask` arrives.
    pub fn new(mask: PollMask, work: Arc<WorkItem>, queue: Arc<WorkQueue>) -> VhostResult<Self> {
        if mask.is_empty() {
            warn!("poll adapter for work {} created with an empty mask", work.id());
            return Err(VhostError::InvalidArgument("poll mask is empty"));
        }
        Ok(Self {
            wakeup: Arc::new(PollWakeup { mask, work, queue }),
            registration: Mutex::new(None),
        })
    }

    /// Starts watching `source`.
    ///
    /// Readiness that already matches the mask is replayed as a wakeup, so
    /// nothing that happened before registration is missed. If the source
    /// reports an error condition the registration is rolled back and the
    /// adapter stays inactive.
    pub fn start(&self, source: Arc<dyn ReadinessSource>) -> VhostResult {
        let mut registration = self.registration.lock();
        if registration.is_some() {
            return Err(VhostError::InvalidArgument("poll adapter already started"));
        }

        let token = source.add_waker(Arc::clone(&self.wakeup) as Arc<dyn PollWaker>);
        let events = source.poll();
        if !events.is_empty() {
            self.wakeup.wake(events);
        }
        if events.contains(PollMask::ERR) {
            source.remove_waker(token);
            warn!("poll start for work {} failed: {:?}", self.wakeup.work.id(), events);
            return Err(VhostError::ReadinessRegistrationFailed);
        }

        *registration = Some(Registration { source, token });
        debug!("poll started for work {}", self.wakeup.work.id());
        Ok(())
    }

    /// Stops watching the source. Idempotent.
    ///
    /// Work already queued or running is unaffected; call
    /// [`flush`](Self::flush) afterwards for full quiescence.
    pub fn stop(&self) {
        let registration = self.registration.lock().take();
        if let Some(Registration { source, token }) = registration {
            source.remove_waker(token);
            debug!("poll stopped for work {}", self.wakeup.work.id());
        }
    }

    /// Waits for the adapter's outstanding work to finish.
    pub fn flush(&self) {
        self.wakeup.queue.flush(&self.wakeup.work);
    }

    /// Bounded [`flush`](Self::flush). Returns `false` on timeout.
    pub fn flush_timeout(&self, timeout: Duration) -> bool {
        self.wakeup.queue.flush_timeout(&self.wakeup.work, timeout)
    }

    /// Submits the adapter's work item as if a matching wakeup had arrived.
    pub fn queue(&self) {
        self.wakeup.queue.enqueue(&self.wakeup.work);
    }

    /// Delivers `events` through the wakeup filter.
    pub fn wakeup(&self, events: PollMask) {
        self.wakeup.wake(events);
    }

    /// Whether the adapter is registered with a source.
    pub fn is_active(&self) -> bool {
        self.registration.lock().is_some()
    }

    #[inline]
    pub fn mask(&self) -> PollMask {
        self.wakeup.mask
    }

    #[inline]
    pub fn work(&self) -> &Arc<WorkItem> {
        &self.wakeup.work
    }
}

impl Drop for PollAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for PollAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollAdapter")
            .field("mask", &self.wakeup.mask)
            .field("work", &self.wakeup.work)
            .field("active", &self.is_active())
            .finish()
    }
}
