//! Deferred work items and their sequence counters.
//!
//! A [`WorkItem`] is embedded by whoever produces the work (a poll adapter or
//! a device user) and only linked into a [`WorkQueue`](crate::WorkQueue).
//! The queue never owns it beyond the `Arc` held while the item is pending.
//!
//! The `queued` flag, both sequence counters and the flushing count are only
//! mutated while the owning queue's lock is held. They are atomics so they
//! can be observed from outside the lock for diagnostics.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::wait::WaitQueue;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Handler run by the worker for a dequeued item.
pub type WorkFn = Box<dyn Fn(&WorkItem) + Send + Sync>;

/// A unit of deferred work that is queued at most once at a time.
pub struct WorkItem {
    id: usize,
    func: WorkFn,
    queued: AtomicBool,
    queue_seq: AtomicU64,
    done_seq: AtomicU64,
    flushing: AtomicUsize,
    done: WaitQueue,
}

impl WorkItem {
    /// Creates a new idle work item running `func` on the worker.
    pub fn new<F>(func: F) -> Arc<Self>
    where
        F: Fn(&WorkItem) + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            func: Box::new(func),
            queued: AtomicBool::new(false),
            queue_seq: AtomicU64::new(0),
            done_seq: AtomicU64::new(0),
            flushing: AtomicUsize::new(0),
            done: WaitQueue::new(),
        })
    }

    /// Process-unique identifier, used in logs.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the item is currently linked into a queue.
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Number of non-coalesced submissions so far.
    #[inline]
    pub fn queue_seq(&self) -> u64 {
        self.queue_seq.load(Ordering::Acquire)
    }

    /// Sequence of the last submission whose execution has completed.
    #[inline]
    pub fn done_seq(&self) -> u64 {
        self.done_seq.load(Ordering::Acquire)
    }

    /// Number of threads currently blocked flushing this item.
    #[inline]
    pub fn flushing(&self) -> usize {
        self.flushing.load(Ordering::Acquire)
    }

    // Everything below requires the owning queue's lock.

    /// Marks the item queued and bumps its submission sequence.
    ///
    /// Returns `false` without touching the sequence if it was already queued.
    pub(crate) fn mark_queued(&self) -> bool {
        if self.queued.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.queue_seq.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Unlinks the item and returns the sequence captured for this execution.
    pub(crate) fn mark_dequeued(&self) -> u64 {
        self.queued.store(false, Ordering::Release);
        self.queue_seq()
    }

    pub(crate) fn complete(&self, seq: u64) {
        debug_assert!(seq <= self.queue_seq());
        self.done_seq.store(seq, Ordering::Release);
    }

    pub(crate) fn begin_flush(&self) -> u64 {
        self.flushing.fetch_add(1, Ordering::AcqRel);
        self.queue_seq()
    }

    pub(crate) fn end_flush(&self) {
        let prev = self.flushing.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "work item {} flush count underflow", self.id);
    }

    // Lock-free from here on.

    pub(crate) fn done_queue(&self) -> &WaitQueue {
        &self.done
    }

    pub(crate) fn run(&self) {
        (self.func)(self)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("queued", &self.is_queued())
            .field("queue_seq", &self.queue_seq())
            .field("done_seq", &self.done_seq())
            .field("flushing", &self.flushing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_initial_state() {
        let item = WorkItem::new(|_| {});
        assert!(!item.is_queued());
        assert_eq!(item.queue_seq(), 0);
        assert_eq!(item.done_seq(), 0);
        assert_eq!(item.flushing(), 0);
    }

    #[test]
    fn test_mark_queued_coalesces() {
        let item = WorkItem::new(|_| {});
        assert!(item.mark_queued());
        assert!(!item.mark_queued());
        assert!(!item.mark_queued());
        assert_eq!(item.queue_seq(), 1);

        assert_eq!(item.mark_dequeued(), 1);
        assert!(!item.is_queued());
        assert!(item.mark_queued());
        assert_eq!(item.queue_seq(), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = WorkItem::new(|_| {});
        let b = WorkItem::new(|_| {});
        assert_ne!(a.id(), b.id());
    }

    #[test]
    #[should_panic(expected = "flush count underflow")]
    fn test_unbalanced_flush_is_fatal() {
        let item = WorkItem::new(|_| {});
        item.end_flush();
    }
}
