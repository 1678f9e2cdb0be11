//! Device rings.
//!
//! A ring is one directional endpoint of a device. The ring supplier hands
//! the device a ring with an optional kick handler; the device wires a
//! [`PollAdapter`] for it at init. Kick source, completion notifier and
//! backend are transient fields set by the owner and cleared by reset.

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

use spin::Mutex;

use crate::notifier::CallNotifier;
use crate::poll::{PollAdapter, ReadinessSource};

/// Direction of a ring relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingDirection {
    /// Device to external party.
    Tx = 0,
    /// External party to device.
    Rx = 1,
}

impl RingDirection {
    /// Both directions, in ring index order.
    pub const ALL: [RingDirection; 2] = [RingDirection::Tx, RingDirection::Rx];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// What a kick handler gets to see while it runs on the worker.
pub struct RingKick<'a, M> {
    ring: &'a Ring<M>,
    memory: Option<Arc<M>>,
}

impl<'a, M> RingKick<'a, M> {
    pub(crate) fn new(ring: &'a Ring<M>, memory: Option<Arc<M>>) -> Self {
        Self { ring, memory }
    }

    /// The ring that was kicked.
    #[inline]
    pub fn ring(&self) -> &'a Ring<M> {
        self.ring
    }

    /// Memory table snapshot taken when the handler started.
    ///
    /// Stays valid for the whole invocation even if the owner swaps in a new
    /// table meanwhile.
    #[inline]
    pub fn memory(&self) -> Option<&Arc<M>> {
        self.memory.as_ref()
    }

    /// Signals the ring's completion notifier, if any.
    pub fn signal(&self) {
        self.ring.signal();
    }
}

/// Kick handler run on the device worker.
pub type KickFn<M> = Arc<dyn Fn(&RingKick<'_, M>) + Send + Sync>;

/// Opaque per-ring backend state.
pub type RingBackend = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct RingState {
    kick: Option<Arc<dyn ReadinessSource>>,
    call: Option<Arc<dyn CallNotifier>>,
    backend: Option<RingBackend>,
}

/// One directional endpoint of a device.
pub struct Ring<M> {
    direction: RingDirection,
    handler: Option<KickFn<M>>,
    state: Mutex<RingState>,
    poll: Option<PollAdapter>,
}

impl<M> Ring<M> {
    /// Creates a ring without a kick handler.
    pub fn new(direction: RingDirection) -> Self {
        Self {
            direction,
            handler: None,
            state: Mutex::new(RingState::default()),
            poll: None,
        }
    }

    /// Creates a ring whose kicks run `handler` on the device worker.
    pub fn with_handler<F>(direction: RingDirection, handler: F) -> Self
    where
        F: Fn(&RingKick<'_, M>) + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(handler)),
            ..Self::new(direction)
        }
    }

    #[inline]
    pub fn direction(&self) -> RingDirection {
        self.direction
    }

    #[inline]
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// The kick adapter, present iff the ring has a handler.
    #[inline]
    pub fn poll(&self) -> Option<&PollAdapter> {
        self.poll.as_ref()
    }

    pub fn kick(&self) -> Option<Arc<dyn ReadinessSource>> {
        self.state.lock().kick.clone()
    }

    pub fn call(&self) -> Option<Arc<dyn CallNotifier>> {
        self.state.lock().call.clone()
    }

    pub fn backend(&self) -> Option<RingBackend> {
        self.state.lock().backend.clone()
    }

    /// Fires the completion notifier if one is set.
    pub fn signal(&self) {
        if let Some(call) = self.call() {
            trace!("signal {:?} ring", self.direction);
            call.notify();
        }
    }

    pub(crate) fn handler(&self) -> Option<&KickFn<M>> {
        self.handler.as_ref()
    }

    pub(crate) fn attach_poll(&mut self, poll: PollAdapter) {
        self.poll = Some(poll);
    }

    pub(crate) fn replace_kick(
        &self,
        kick: Option<Arc<dyn ReadinessSource>>,
    ) -> Option<Arc<dyn ReadinessSource>> {
        core::mem::replace(&mut self.state.lock().kick, kick)
    }

    pub(crate) fn replace_call(
        &self,
        call: Option<Arc<dyn CallNotifier>>,
    ) -> Option<Arc<dyn CallNotifier>> {
        core::mem::replace(&mut self.state.lock().call, call)
    }

    pub(crate) fn replace_backend(&self, backend: Option<RingBackend>) -> Option<RingBackend> {
        core::mem::replace(&mut self.state.lock().backend, backend)
    }

    /// Clears every transient field, dropping the references it held.
    pub(crate) fn reset(&self) {
        let old = core::mem::take(&mut *self.state.lock());
        drop(old);
    }
}

impl<M> fmt::Debug for Ring<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Ring")
            .field("direction", &self.direction)
            .field("handler", &self.handler.is_some())
            .field("kick", &state.kick.is_some())
            .field("call", &state.call.is_some())
            .field("backend", &state.backend.is_some())
            .field("poll", &self.poll)
            .finish()
    }
}
