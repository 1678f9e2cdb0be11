//! Per-device FIFO of pending work with sequence-numbered flush.
//!
//! A single spin lock covers the pending list, every linked item's `queued`
//! flag, sequence counters and flushing count, plus the worker's stop
//! request and the closed flag. It is only ever held for O(1) list
//! mutations: never across a handler and never across a flush wait.
//!
//! # Flush protocol
//!
//! ```text
//!  flusher                         worker
//!  ───────                         ──────
//!  lock; seq = queue_seq;          lock; item.done_seq = captured seq;
//!        flushing += 1; unlock           flushing > 0 ? ──► done.notify_all()
//!  wait(done_seq >= seq)  ◄──────────────┘
//!  lock; flushing -= 1; unlock
//! ```

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use std::thread::Thread;
use std::time::Duration;

use spin::Mutex;

use crate::work::WorkItem;

/// Counters for work queue activity.
#[derive(Debug, Default)]
pub struct WorkStats {
    /// Submissions that linked an item into the queue.
    pub enqueued: AtomicU64,
    /// Submissions absorbed because the item was already queued.
    pub coalesced: AtomicU64,
    /// Handler executions that ran to completion.
    pub completed: AtomicU64,
    /// Handler executions that panicked.
    pub panicked: AtomicU64,
}

impl WorkStats {
    /// Creates a new statistics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn record_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_coalesce(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_complete(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_panic(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the number of linking submissions.
    #[inline]
    pub fn enqueues(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Gets the number of coalesced submissions.
    #[inline]
    pub fn coalesces(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Gets the number of completed executions.
    #[inline]
    pub fn completions(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Gets the number of panicked executions.
    #[inline]
    pub fn panics(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

struct QueueInner {
    pending: VecDeque<Arc<WorkItem>>,
    worker: Option<Thread>,
    should_stop: bool,
    /// Set once the device stops; never cleared.
    closed: bool,
}

/// What the worker should do next.
pub(crate) enum Next {
    Run(Arc<WorkItem>, u64),
    Idle,
    Stop,
}

/// FIFO of pending work items, drained by a single worker.
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    stats: WorkStats,
}

impl WorkQueue {
    /// Creates an empty queue with no worker attached.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                worker: None,
                should_stop: false,
                closed: false,
            }),
            stats: WorkStats::new(),
        }
    }

    /// Submits `item`.
    ///
    /// Never blocks beyond the O(1) critical section, so it is safe from a
    /// wakeup callback. Returns `false` if the item was already pending and
    /// the submission was coalesced, or if the queue is closed.
    pub fn enqueue(&self, item: &Arc<WorkItem>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            warn!("work {} submitted to a closed queue, dropped", item.id());
            return false;
        }
        if !item.mark_queued() {
            self.stats.record_coalesce();
            trace!("work {} already queued, coalesced", item.id());
            return false;
        }
        inner.pending.push_back(Arc::clone(item));
        self.stats.record_enqueue();
        trace!("work {} queued, seq {}", item.id(), item.queue_seq());
        if let Some(worker) = &inner.worker {
            worker.unpark();
        }
        true
    }

    /// Pops the oldest pending item along with the sequence captured for it.
    ///
    /// The worker pops through [`complete_and_next`](Self::complete_and_next).
    #[cfg(test)]
    pub(crate) fn dequeue(&self) -> Option<(Arc<WorkItem>, u64)> {
        let mut inner = self.inner.lock();
        Self::pop(&mut inner)
    }

    fn pop(inner: &mut QueueInner) -> Option<(Arc<WorkItem>, u64)> {
        let item = inner.pending.pop_front()?;
        let seq = item.mark_dequeued();
        Some((item, seq))
    }

    /// Blocks until every submission of `item` made before this call has
    /// finished executing.
    ///
    /// Must not be called while holding a lock that the item's handler takes.
    pub fn flush(&self, item: &WorkItem) {
        let seq = self.begin_flush(item);
        item.done_queue().wait_until(|| self.seq_done(item, seq));
        self.end_flush(item);
    }

    /// Like [`flush`](Self::flush) but gives up after `timeout`.
    ///
    /// Returns `true` if the work completed in time.
    pub fn flush_timeout(&self, item: &WorkItem, timeout: Duration) -> bool {
        let seq = self.begin_flush(item);
        let done = item
            .done_queue()
            .wait_until_timeout(|| self.seq_done(item, seq), timeout);
        self.end_flush(item);
        if !done {
            debug!("flush of work {} timed out at seq {}", item.id(), seq);
        }
        done
    }

    fn begin_flush(&self, item: &WorkItem) -> u64 {
        let _inner = self.inner.lock();
        item.begin_flush()
    }

    fn end_flush(&self, item: &WorkItem) {
        let _inner = self.inner.lock();
        item.end_flush();
    }

    fn seq_done(&self, item: &WorkItem, seq: u64) -> bool {
        let _inner = self.inner.lock();
        item.done_seq() >= seq
    }

    /// Whether the queue refuses new submissions.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Refuses every later submission. Work already pending still runs.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            debug!("work queue closed, {} pending", inner.pending.len());
        }
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether no item is pending.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Gets a reference to the statistics.
    #[inline]
    pub fn stats(&self) -> &WorkStats {
        &self.stats
    }

    /// Clears a stale stop request before a new worker is spawned.
    pub(crate) fn arm(&self) {
        self.inner.lock().should_stop = false;
    }

    /// Registers the calling thread as the one to unpark on new work.
    pub(crate) fn attach_worker(&self, thread: Thread) {
        self.inner.lock().worker = Some(thread);
    }

    pub(crate) fn detach_worker(&self) {
        self.inner.lock().worker = None;
    }

    /// Asks the worker to exit at its next iteration.
    pub(crate) fn request_stop(&self) {
        let mut inner = self.inner.lock();
        inner.should_stop = true;
        if let Some(worker) = &inner.worker {
            worker.unpark();
        }
    }

    /// Records completion of `finished`, then picks the next action.
    ///
    /// Flush waiters of the finished item are woken after the lock is dropped.
    pub(crate) fn complete_and_next(&self, finished: Option<(Arc<WorkItem>, u64)>) -> Next {
        let mut inner = self.inner.lock();
        let mut wake = None;
        if let Some((item, seq)) = finished {
            item.complete(seq);
            if item.flushing() > 0 {
                wake = Some(item);
            }
        }

        let next = if inner.should_stop {
            Next::Stop
        } else {
            match Self::pop(&mut inner) {
                Some((item, seq)) => Next::Run(item, seq),
                None => Next::Idle,
            }
        };
        drop(inner);

        if let Some(item) = wake {
            item.done_queue().notify_all();
        }
        next
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn idle_item() -> Arc<WorkItem> {
        WorkItem::new(|_| {})
    }

    #[test]
    fn test_enqueue_coalesces() {
        let queue = WorkQueue::new();
        let item = idle_item();

        assert!(queue.enqueue(&item));
        for _ in 0..4 {
            assert!(!queue.enqueue(&item));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(item.queue_seq(), 1);
        assert_eq!(queue.stats().enqueues(), 1);
        assert_eq!(queue.stats().coalesces(), 4);
    }

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new();
        let a = idle_item();
        let b = idle_item();
        let c = idle_item();
        queue.enqueue(&a);
        queue.enqueue(&b);
        queue.enqueue(&c);

        let order: Vec<usize> = core::iter::from_fn(|| queue.dequeue())
            .map(|(item, _)| item.id())
            .collect();
        assert_eq!(order, vec![a.id(), b.id(), c.id()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_clears_queued_and_captures_seq() {
        let queue = WorkQueue::new();
        let item = idle_item();

        queue.enqueue(&item);
        let (popped, seq) = queue.dequeue().unwrap();
        assert!(Arc::ptr_eq(&popped, &item));
        assert_eq!(seq, 1);
        assert!(!item.is_queued());

        // Re-submission after dequeue is a fresh execution.
        assert!(queue.enqueue(&item));
        assert_eq!(item.queue_seq(), 2);
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_complete_records_done_seq() {
        let queue = WorkQueue::new();
        let item = idle_item();
        queue.enqueue(&item);

        let (popped, seq) = match queue.complete_and_next(None) {
            Next::Run(item, seq) => (item, seq),
            _ => panic!("expected work"),
        };
        assert_eq!(item.done_seq(), 0);
        assert!(matches!(queue.complete_and_next(Some((popped, seq))), Next::Idle));
        assert_eq!(item.done_seq(), 1);
        assert!(item.done_seq() <= item.queue_seq());
    }

    #[test]
    fn test_stop_request_wins_over_pending_work() {
        let queue = WorkQueue::new();
        let item = idle_item();
        queue.enqueue(&item);
        queue.request_stop();
        assert!(matches!(queue.complete_and_next(None), Next::Stop));
        assert_eq!(queue.len(), 1);

        queue.arm();
        assert!(matches!(queue.complete_and_next(None), Next::Run(..)));
    }

    #[test]
    fn test_closed_queue_refuses_work() {
        let queue = WorkQueue::new();
        let pending = idle_item();
        let late = idle_item();
        queue.enqueue(&pending);

        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.enqueue(&late));
        assert_eq!(late.queue_seq(), 0);
        assert!(!late.is_queued());
        assert_eq!(queue.stats().enqueues(), 1);

        // Already linked work is still handed to the worker.
        assert!(matches!(queue.complete_and_next(None), Next::Run(..)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_without_submission_returns() {
        let queue = WorkQueue::new();
        let item = idle_item();
        queue.flush(&item);
        assert_eq!(item.flushing(), 0);
    }

    #[test]
    fn test_flush_waits_for_completion() {
        let queue = Arc::new(WorkQueue::new());
        let item = idle_item();
        queue.enqueue(&item);

        let flusher = {
            let queue = Arc::clone(&queue);
            let item = Arc::clone(&item);
            thread::spawn(move || queue.flush(&item))
        };

        while item.flushing() == 0 {
            thread::yield_now();
        }
        assert!(!flusher.is_finished());

        let (popped, seq) = queue.dequeue().unwrap();
        queue.complete_and_next(Some((popped, seq)));
        flusher.join().unwrap();
        assert_eq!(item.flushing(), 0);
    }

    #[test]
    fn test_flush_timeout_expires() {
        let queue = WorkQueue::new();
        let item = idle_item();
        queue.enqueue(&item);
        assert!(!queue.flush_timeout(&item, Duration::from_millis(20)));
        assert_eq!(item.flushing(), 0);
        assert_eq!(queue.len(), 1);
    }
}
