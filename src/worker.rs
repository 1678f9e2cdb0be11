//! The per-device worker thread.
//!
//! One worker drains one [`WorkQueue`], running handlers strictly one at a
//! time. It binds itself to the owner's execution context before the first
//! item and unbinds after the loop exits. Stopping is cooperative: the stop
//! request is observed between items, never in the middle of a handler, and
//! items still pending at that point are left in the queue.

use alloc::format;
use alloc::sync::Arc;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crate::config::DeviceConfig;
use crate::context::ExecContext;
use crate::error::VhostResult;
use crate::queue::{Next, WorkQueue};

/// Handle to a running worker thread.
pub struct Worker {
    queue: Arc<WorkQueue>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker draining `queue` inside `ctx`.
    pub fn spawn(
        queue: Arc<WorkQueue>,
        ctx: Arc<dyn ExecContext>,
        config: &DeviceConfig,
    ) -> VhostResult<Self> {
        let mut builder =
            thread::Builder::new().name(format!("{}-{}", config.worker_name, ctx.id().0));
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }

        queue.arm();
        let yield_after_work = config.yield_after_work;
        let worker_queue = Arc::clone(&queue);
        let handle = builder.spawn(move || run(&worker_queue, ctx.as_ref(), yield_after_work))?;

        debug!("worker {:?} spawned", handle.thread().name());
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Requests the worker to exit and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.queue.request_stop();
        if handle.thread().id() == thread::current().id() {
            warn!("worker dropped from its own thread, not joining");
            return;
        }
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
        debug!("worker joined");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(queue: &WorkQueue, ctx: &dyn ExecContext, yield_after_work: bool) {
    ctx.bind();
    queue.attach_worker(thread::current());

    let mut finished = None;
    loop {
        match queue.complete_and_next(finished.take()) {
            Next::Stop => break,
            Next::Idle => thread::park(),
            Next::Run(item, seq) => {
                trace!("worker running work {} seq {}", item.id(), seq);
                if panic::catch_unwind(AssertUnwindSafe(|| item.run())).is_ok() {
                    queue.stats().record_complete();
                } else {
                    queue.stats().record_panic();
                    error!("work {} handler panicked", item.id());
                }
                finished = Some((item, seq));
                if yield_after_work {
                    thread::yield_now();
                }
            }
        }
    }

    queue.detach_worker();
    ctx.unbind();
}
