//! # AxVhost Device Worker Core
//!
//! This crate provides the task-execution core of a virtual device backend:
//! expensive per-device work is moved off the notification path onto one
//! dedicated worker thread per device, with deterministic flush semantics and
//! exclusive-ownership lifecycle management.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐ wake(events) ┌─────────────┐ enqueue ┌───────────┐ unpark ┌────────┐
//! │ReadinessSource │ ───────────> │ PollAdapter │ ──────> │ WorkQueue │ ─────> │ Worker │
//! │  (kick)        │              │ (mask)      │ (dedupe)│ (FIFO)    │        │        │
//! └────────────────┘              └─────────────┘         └───────────┘        └───┬────┘
//!                                                              ▲  done_seq         │ run
//!                                                              └───────────────────┤
//!                                                                                  ▼
//!                                                        ┌──────────────────────────────┐
//!                                                        │ ring handler (RingKick)      │
//!                                                        │  - memory table snapshot     │
//!                                                        │  - signal() -> CallNotifier  │
//!                                                        └──────────────────────────────┘
//! ```
//!
//! ### Core Infrastructure
//! - [`WorkItem`]: Deferred work with queue/done sequence counters
//! - [`WorkQueue`]: Per-device FIFO with coalescing enqueue and flush
//! - [`Worker`]: Dedicated thread bound to the owner's execution context
//! - [`PollAdapter`]: Turns readiness wakeups into queued work
//!
//! ### Device
//! - [`Ring`]: One directional endpoint with kick source, notifier and handler
//! - [`VhostDevice`]: Two rings, the queue, the worker and ownership state
//! - [`DeviceGuard`]: The device's exclusivity lock and lifecycle operations
//! - [`DeviceLifecycle`]: `Uninitialized -> Initialized -> Owned -> Stopped -> Cleaned`
//!
//! ## Examples
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use axvhost::*;
//!
//! let rx = Ring::with_handler(RingDirection::Rx, |kick: &RingKick<'_, ()>| {
//!     // ... consume the ring ...
//!     kick.signal();
//! });
//! let dev = VhostDevice::new(
//!     Ring::new(RingDirection::Tx),
//!     rx,
//!     Arc::new(ProcessContextProvider),
//!     DeviceConfig::default(),
//! )?;
//!
//! let kick = Arc::new(EventFd::new());
//! {
//!     let mut guard = dev.lock();
//!     guard.set_owner()?;
//!     guard.set_vring_kick(RingDirection::Rx, Some(kick.clone()))?;
//! }
//!
//! kick.write(1); // the handler runs on the worker
//!
//! let mut guard = dev.lock();
//! guard.stop()?;
//! guard.cleanup()?;
//! ```

extern crate alloc;
#[macro_use]
extern crate log;

mod config;
mod context;
mod device;
mod error;
mod eventfd;
mod lifecycle;
mod notifier;
mod poll;
mod queue;
mod ring;
mod wait;
mod work;
mod worker;

pub use config::DeviceConfig;
pub use context::{
    ContextId, ContextProvider, ExecContext, ProcessContext, ProcessContextProvider,
    ScopedContext, ScopedContextProvider, ScopedGuard,
};
pub use device::{DeviceGuard, VhostDevice};
pub use error::{VhostError, VhostResult};
pub use eventfd::EventFd;
pub use lifecycle::{DeviceLifecycle, DeviceState};
pub use notifier::{CallNotifier, CallbackNotifier};
pub use poll::{PollAdapter, PollMask, PollWaker, ReadinessSource, WakerToken};
pub use queue::{WorkQueue, WorkStats};
pub use ring::{KickFn, Ring, RingBackend, RingDirection, RingKick};
pub use wait::WaitQueue;
pub use work::{WorkFn, WorkItem};
pub use worker::Worker;
