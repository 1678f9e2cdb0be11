use alloc::string::String;

use crate::poll::PollMask;

/// Per-device tunables for the worker and the kick adapters.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Worker thread name prefix. The owner id is appended, e.g. `vhost-42`.
    pub worker_name: String,
    /// Stack size for the worker thread, platform default if `None`.
    pub stack_size: Option<usize>,
    /// Yield the worker thread after every handler invocation.
    pub yield_after_work: bool,
    /// Readiness bits a kick source must report to schedule its ring handler.
    pub kick_mask: PollMask,
}

impl DeviceConfig {
    /// Default tunables: `vhost` workers, platform stack, yielding, `IN` kicks.
    pub fn new() -> Self {
        Self {
            worker_name: String::from("vhost"),
            stack_size: None,
            yield_after_work: true,
            kick_mask: PollMask::IN,
        }
    }

    /// Sets the worker thread name prefix.
    pub fn with_worker_name(mut self, name: &str) -> Self {
        self.worker_name = String::from(name);
        self
    }

    /// Sets the worker stack size in bytes.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Sets whether the worker yields after each handler.
    pub fn with_yield_after_work(mut self, yield_after_work: bool) -> Self {
        self.yield_after_work = yield_after_work;
        self
    }

    /// Sets the readiness bits that schedule a ring handler.
    pub fn with_kick_mask(mut self, mask: PollMask) -> Self {
        self.kick_mask = mask;
        self
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}
