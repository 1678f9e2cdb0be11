//! The device: rings, work queue, worker and ownership in one place.
//!
//! Lifecycle operations go through a [`DeviceGuard`], obtained with
//! [`VhostDevice::lock`]. Holding the guard is holding the device's
//! exclusivity lock; it is a sleeping lock because `stop` and the ring
//! setters block on flushes while holding it. Ring handlers never take it.

use alloc::sync::{Arc, Weak};
use std::sync::{Mutex, MutexGuard, PoisonError};

use spin::RwLock;

use crate::config::DeviceConfig;
use crate::context::{ContextId, ContextProvider, ExecContext, ScopedContext};
use crate::error::{VhostError, VhostResult};
use crate::lifecycle::{DeviceLifecycle, DeviceState};
use crate::notifier::CallNotifier;
use crate::poll::{PollAdapter, ReadinessSource};
use crate::queue::{WorkQueue, WorkStats};
use crate::ring::{Ring, RingBackend, RingDirection, RingKick};
use crate::work::WorkItem;
use crate::worker::Worker;

/// State reachable from ring handlers on the worker.
struct DeviceShared<M> {
    rings: [Ring<M>; 2],
    queue: Arc<WorkQueue>,
    /// Replaced as a whole under the exclusivity lock, never mutated in place.
    memory: RwLock<Option<Arc<M>>>,
    lifecycle: DeviceLifecycle,
}

impl<M> DeviceShared<M> {
    fn handle_kick(&self, direction: RingDirection) {
        let ring = &self.rings[direction.index()];
        let Some(handler) = ring.handler() else {
            return;
        };
        let memory = self.memory.read().clone();
        handler(&RingKick::new(ring, memory));
    }
}

/// Fields guarded by the exclusivity lock.
#[derive(Default)]
struct OwnerState {
    ctx: Option<Arc<dyn ExecContext>>,
    worker: Option<Worker>,
}

/// A virtual device backend with two rings and one worker.
pub struct VhostDevice<M: Send + Sync + 'static = ()> {
    // Declared first so the worker is joined before the shared state drops.
    owner: Mutex<OwnerState>,
    shared: Arc<DeviceShared<M>>,
    provider: Arc<dyn ContextProvider>,
    config: DeviceConfig,
}

impl<M: Send + Sync + 'static> VhostDevice<M> {
    /// Wires `tx` and `rx` into a new device.
    ///
    /// Each ring's transient fields are reset and every ring with a handler
    /// gets a kick adapter using `config.kick_mask`.
    pub fn new(
        tx: Ring<M>,
        rx: Ring<M>,
        provider: Arc<dyn ContextProvider>,
        config: DeviceConfig,
    ) -> VhostResult<Self> {
        if tx.direction() != RingDirection::Tx || rx.direction() != RingDirection::Rx {
            warn!("rings passed as ({:?}, {:?})", tx.direction(), rx.direction());
            return Err(VhostError::InvalidArgument("rings must be passed as (tx, rx)"));
        }

        let queue = Arc::new(WorkQueue::new());
        let mask = config.kick_mask;
        let mut rings = [tx, rx];
        let mut failure = None;

        let shared = Arc::new_cyclic(|weak: &Weak<DeviceShared<M>>| {
            for ring in rings.iter_mut() {
                ring.reset();
                if !ring.has_handler() {
                    continue;
                }
                let direction = ring.direction();
                let weak = weak.clone();
                let work = WorkItem::new(move |_| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_kick(direction);
                    }
                });
                match PollAdapter::new(mask, work, Arc::clone(&queue)) {
                    Ok(poll) => ring.attach_poll(poll),
                    Err(err) => failure = Some(err),
                }
            }
            DeviceShared {
                rings,
                queue,
                memory: RwLock::new(None),
                lifecycle: DeviceLifecycle::new(),
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }

        shared
            .lifecycle
            .transition(DeviceState::Initialized)
            .map_err(VhostError::BadState)?;
        Ok(Self {
            owner: Mutex::new(OwnerState::default()),
            shared,
            provider,
            config,
        })
    }

    /// Takes the device's exclusivity lock.
    pub fn lock(&self) -> DeviceGuard<'_, M> {
        DeviceGuard {
            dev: self,
            owner: self.owner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        self.shared.lifecycle.state()
    }

    #[inline]
    pub fn ring(&self, direction: RingDirection) -> &Ring<M> {
        &self.shared.rings[direction.index()]
    }

    /// Fires `direction`'s completion notifier, if set.
    pub fn signal(&self, direction: RingDirection) {
        self.ring(direction).signal();
    }

    /// Submits `item` to the device's work queue.
    ///
    /// Returns `true` if the item was linked, `false` if it was coalesced
    /// with a pending submission or the device no longer accepts work.
    pub fn queue_work(&self, item: &Arc<WorkItem>) -> bool {
        self.shared.queue.enqueue(item)
    }

    /// Waits until every earlier submission of `item` has run.
    pub fn flush_work(&self, item: &WorkItem) {
        self.shared.queue.flush(item);
    }

    /// Current memory table.
    pub fn memory(&self) -> Option<Arc<M>> {
        self.shared.memory.read().clone()
    }

    #[inline]
    pub fn work_queue(&self) -> &Arc<WorkQueue> {
        &self.shared.queue
    }

    #[inline]
    pub fn stats(&self) -> &WorkStats {
        self.shared.queue.stats()
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}

/// Proof of holding a device's exclusivity lock.
pub struct DeviceGuard<'a, M: Send + Sync + 'static> {
    dev: &'a VhostDevice<M>,
    owner: MutexGuard<'a, OwnerState>,
}

impl<M: Send + Sync + 'static> DeviceGuard<'_, M> {
    fn shared(&self) -> &DeviceShared<M> {
        &self.dev.shared
    }

    /// Succeeds iff the calling context is the one bound to the device.
    pub fn check_owner(&self) -> VhostResult {
        let caller = self.dev.provider.current().id();
        match &self.owner.ctx {
            Some(ctx) if ctx.id() == caller => Ok(()),
            _ => Err(VhostError::PermissionDenied),
        }
    }

    /// Identity of the bound context, if any.
    pub fn owner_id(&self) -> Option<ContextId> {
        self.owner.ctx.as_ref().map(|ctx| ctx.id())
    }

    /// Binds the calling context and starts the worker inside it.
    ///
    /// A caller outside any scoped context has no identity to bind and is
    /// rejected with [`VhostError::InvalidArgument`].
    pub fn set_owner(&mut self) -> VhostResult {
        if self.owner.ctx.is_some() {
            warn!("set_owner on a device owned by {:?}", self.owner_id());
            return Err(VhostError::AlreadyOwned);
        }
        let state = self.dev.state();
        if state != DeviceState::Initialized {
            return Err(VhostError::BadState(state));
        }

        let ctx = self.dev.provider.current();
        if ctx.id() == ScopedContext::NONE {
            warn!("set_owner from a thread outside any context");
            return Err(VhostError::InvalidArgument("caller has no execution context"));
        }
        let queue = Arc::clone(&self.shared().queue);
        let worker = Worker::spawn(queue, Arc::clone(&ctx), &self.dev.config)
            .inspect_err(|err| warn!("worker spawn for {:?} failed: {}", ctx.id(), err))?;

        if let Err(state) = self.shared().lifecycle.transition(DeviceState::Owned) {
            worker.stop();
            return Err(VhostError::BadState(state));
        }
        debug!("device owned by {:?}", ctx.id());
        self.owner.ctx = Some(ctx);
        self.owner.worker = Some(worker);
        Ok(())
    }

    /// Closes the work queue, stops every ring's adapter and waits for
    /// handler work to finish.
    ///
    /// After this returns no ring handler runs again. Idempotent once stopped.
    pub fn stop(&mut self) -> VhostResult {
        match self.shared().lifecycle.transition(DeviceState::Stopped) {
            Ok(_) => {}
            Err(DeviceState::Stopped) => return Ok(()),
            Err(state) => return Err(VhostError::BadState(state)),
        }

        // Submissions racing with the drain are refused under the queue lock.
        self.shared().queue.close();
        for ring in &self.shared().rings {
            if let Some(poll) = ring.poll() {
                poll.stop();
                poll.flush();
            }
        }
        Ok(())
    }

    /// Releases everything the device holds.
    ///
    /// # Panics
    ///
    /// Panics if work is still pending, which means `stop` was skipped or
    /// work was submitted without being flushed.
    pub fn cleanup(&mut self) -> VhostResult {
        let state = self.dev.state();
        if !state.can_transition(DeviceState::Cleaned) {
            return Err(VhostError::BadState(state));
        }

        self.shared().queue.close();
        for ring in &self.shared().rings {
            if let Some(poll) = ring.poll() {
                poll.stop();
            }
            ring.reset();
        }

        assert!(
            self.shared().queue.is_empty(),
            "work queue not empty at cleanup ({} pending)",
            self.shared().queue.len()
        );

        if let Some(worker) = self.owner.worker.take() {
            worker.stop();
        }
        self.owner.ctx = None;

        // The worker is joined, nothing can be reading the table anymore.
        let memory = self.shared().memory.write().take();
        drop(memory);

        self.shared()
            .lifecycle
            .transition(DeviceState::Cleaned)
            .map_err(VhostError::BadState)?;
        Ok(())
    }

    /// Installs a new memory table, returning the previous one.
    ///
    /// Handlers already running keep their own snapshot of the old table.
    pub fn set_memory(&mut self, memory: Option<Arc<M>>) -> VhostResult<Option<Arc<M>>> {
        let state = self.dev.state();
        if state == DeviceState::Cleaned {
            return Err(VhostError::BadState(state));
        }
        Ok(core::mem::replace(&mut *self.shared().memory.write(), memory))
    }

    fn require_owner(&self) -> VhostResult {
        let state = self.dev.state();
        if state != DeviceState::Owned {
            return Err(VhostError::BadState(state));
        }
        self.check_owner()
    }

    /// Replaces `direction`'s kick source.
    ///
    /// The old source is deregistered, the new one registered, and work
    /// triggered through the old one is flushed before returning. If the new
    /// source fails to register it is not kept.
    pub fn set_vring_kick(
        &mut self,
        direction: RingDirection,
        kick: Option<Arc<dyn ReadinessSource>>,
    ) -> VhostResult {
        self.require_owner()?;
        let ring = self.dev.ring(direction);

        let old = ring.kick();
        let unchanged = match (&old, &kick) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        if let Some(poll) = ring.poll() {
            poll.stop();
        }
        ring.replace_kick(kick.clone());

        let mut result = Ok(());
        if let (Some(poll), Some(kick)) = (ring.poll(), kick) {
            if let Err(err) = poll.start(kick) {
                ring.replace_kick(None);
                result = Err(err);
            }
        }
        if let Some(poll) = ring.poll() {
            poll.flush();
        }
        drop(old);
        result
    }

    /// Replaces `direction`'s completion notifier.
    pub fn set_vring_call(
        &mut self,
        direction: RingDirection,
        call: Option<Arc<dyn CallNotifier>>,
    ) -> VhostResult {
        self.require_owner()?;
        self.dev.ring(direction).replace_call(call);
        Ok(())
    }

    /// Replaces `direction`'s backend and returns the old one once no
    /// handler can still be using it.
    pub fn set_vring_backend(
        &mut self,
        direction: RingDirection,
        backend: Option<RingBackend>,
    ) -> VhostResult<Option<RingBackend>> {
        self.require_owner()?;
        let ring = self.dev.ring(direction);
        let old = ring.replace_backend(backend);
        if let Some(poll) = ring.poll() {
            poll.flush();
        }
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProcessContextProvider, ScopedContext, ScopedContextProvider};
    use crate::eventfd::EventFd;
    use crate::poll::PollMask;

    use core::sync::atomic::{AtomicUsize, Ordering};

    fn device(provider: Arc<dyn ContextProvider>) -> VhostDevice<u32> {
        VhostDevice::new(
            Ring::with_handler(RingDirection::Tx, |_| {}),
            Ring::new(RingDirection::Rx),
            provider,
            DeviceConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_init_wires_adapters() {
        let dev = device(Arc::new(ProcessContextProvider));
        assert_eq!(dev.state(), DeviceState::Initialized);
        assert!(dev.ring(RingDirection::Tx).poll().is_some());
        assert!(dev.ring(RingDirection::Rx).poll().is_none());
        assert_eq!(dev.ring(RingDirection::Tx).poll().unwrap().mask(), PollMask::IN);
    }

    #[test]
    fn test_init_rejects_swapped_rings() {
        let res = VhostDevice::<()>::new(
            Ring::new(RingDirection::Rx),
            Ring::new(RingDirection::Tx),
            Arc::new(ProcessContextProvider),
            DeviceConfig::default(),
        );
        assert!(matches!(res, Err(VhostError::InvalidArgument(_))));
    }

    #[test]
    fn test_init_rejects_empty_mask() {
        let res = VhostDevice::<()>::new(
            Ring::with_handler(RingDirection::Tx, |_| {}),
            Ring::new(RingDirection::Rx),
            Arc::new(ProcessContextProvider),
            DeviceConfig::default().with_kick_mask(PollMask::EMPTY),
        );
        assert!(matches!(res, Err(VhostError::InvalidArgument(_))));
    }

    #[test]
    fn test_set_owner_twice() {
        let dev = device(Arc::new(ProcessContextProvider));
        let mut guard = dev.lock();
        guard.set_owner().unwrap();
        assert_eq!(dev.state(), DeviceState::Owned);
        assert!(matches!(guard.set_owner(), Err(VhostError::AlreadyOwned)));
        guard.check_owner().unwrap();

        guard.stop().unwrap();
        assert!(matches!(guard.set_owner(), Err(VhostError::AlreadyOwned)));
        guard.cleanup().unwrap();
    }

    #[test]
    fn test_set_owner_spawn_failure_rolls_back() {
        let dev = VhostDevice::<u32>::new(
            Ring::with_handler(RingDirection::Tx, |_| {}),
            Ring::new(RingDirection::Rx),
            Arc::new(ProcessContextProvider),
            DeviceConfig::default().with_stack_size(usize::MAX / 2),
        )
        .unwrap();
        let mut guard = dev.lock();
        assert!(matches!(
            guard.set_owner(),
            Err(VhostError::WorkerSpawnFailed(_))
        ));
        assert_eq!(dev.state(), DeviceState::Initialized);
        assert_eq!(guard.owner_id(), None);
        assert!(matches!(
            guard.check_owner(),
            Err(VhostError::PermissionDenied)
        ));
        drop(guard);

        let dev = VhostDevice::<u32>::new(
            Ring::with_handler(RingDirection::Tx, |_| {}),
            Ring::new(RingDirection::Rx),
            Arc::new(ProcessContextProvider),
            DeviceConfig::default(),
        )
        .unwrap();
        let mut guard = dev.lock();
        guard.set_owner().unwrap();
        assert_eq!(dev.state(), DeviceState::Owned);
        guard.stop().unwrap();
        guard.cleanup().unwrap();
    }

    #[test]
    fn test_set_owner_outside_context_rejected() {
        let dev = device(Arc::new(ScopedContextProvider));
        let mut guard = dev.lock();
        assert_eq!(ScopedContext::current_id(), ScopedContext::NONE);
        assert!(matches!(
            guard.set_owner(),
            Err(VhostError::InvalidArgument(_))
        ));
        assert_eq!(dev.state(), DeviceState::Initialized);
        assert_eq!(guard.owner_id(), None);

        let _ctx = ScopedContext::enter(ContextId(5));
        guard.set_owner().unwrap();
        assert_eq!(guard.owner_id(), Some(ContextId(5)));
    }

    #[test]
    fn test_check_owner_without_owner() {
        let dev = device(Arc::new(ProcessContextProvider));
        assert!(matches!(
            dev.lock().check_owner(),
            Err(VhostError::PermissionDenied)
        ));
    }

    #[test]
    fn test_check_owner_other_context() {
        let dev = device(Arc::new(ScopedContextProvider));
        {
            let _ctx = ScopedContext::enter(ContextId(10));
            dev.lock().set_owner().unwrap();
            dev.lock().check_owner().unwrap();
        }
        {
            let _ctx = ScopedContext::enter(ContextId(11));
            assert!(matches!(
                dev.lock().check_owner(),
                Err(VhostError::PermissionDenied)
            ));
            assert!(matches!(
                dev.lock().set_vring_call(RingDirection::Tx, None),
                Err(VhostError::PermissionDenied)
            ));
        }
        assert_eq!(dev.lock().owner_id(), Some(ContextId(10)));
    }

    #[test]
    fn test_state_rules() {
        let dev = device(Arc::new(ProcessContextProvider));
        let mut guard = dev.lock();
        assert!(matches!(
            guard.stop(),
            Err(VhostError::BadState(DeviceState::Initialized))
        ));
        guard.set_owner().unwrap();
        assert!(matches!(
            guard.cleanup(),
            Err(VhostError::BadState(DeviceState::Owned))
        ));
        guard.stop().unwrap();
        guard.stop().unwrap();
        guard.cleanup().unwrap();
        assert_eq!(dev.state(), DeviceState::Cleaned);
        assert!(matches!(
            guard.cleanup(),
            Err(VhostError::BadState(DeviceState::Cleaned))
        ));
        assert!(matches!(
            guard.set_owner(),
            Err(VhostError::BadState(DeviceState::Cleaned))
        ));
    }

    #[test]
    fn test_unowned_cleanup() {
        let dev = device(Arc::new(ProcessContextProvider));
        let mut guard = dev.lock();
        guard.set_memory(Some(Arc::new(1))).unwrap();
        guard.cleanup().unwrap();
        assert_eq!(dev.state(), DeviceState::Cleaned);
        assert!(dev.memory().is_none());
    }

    #[test]
    fn test_setters_require_owned() {
        let dev = device(Arc::new(ProcessContextProvider));
        let mut guard = dev.lock();
        assert!(matches!(
            guard.set_vring_kick(RingDirection::Tx, Some(Arc::new(EventFd::new()))),
            Err(VhostError::BadState(DeviceState::Initialized))
        ));
        assert!(dev.ring(RingDirection::Tx).kick().is_none());
    }

    #[test]
    fn test_set_memory_returns_previous() {
        let dev = device(Arc::new(ProcessContextProvider));
        let mut guard = dev.lock();
        assert!(guard.set_memory(Some(Arc::new(1))).unwrap().is_none());
        let old = guard.set_memory(Some(Arc::new(2))).unwrap();
        assert_eq!(old.as_deref(), Some(&1));
        assert_eq!(dev.memory().as_deref(), Some(&2));
    }

    #[test]
    fn test_queue_work_rejected_after_stop() {
        let dev = device(Arc::new(ProcessContextProvider));
        let item = WorkItem::new(|_| {});
        let mut guard = dev.lock();
        guard.set_owner().unwrap();
        guard.stop().unwrap();
        assert!(!dev.queue_work(&item));
        assert_eq!(item.queue_seq(), 0);
        guard.cleanup().unwrap();
    }

    #[test]
    fn test_no_handler_runs_after_stop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let dev = VhostDevice::<u32>::new(
            Ring::new(RingDirection::Tx),
            Ring::with_handler(RingDirection::Rx, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(ProcessContextProvider),
            DeviceConfig::default(),
        )
        .unwrap();
        let kick = Arc::new(EventFd::new());
        let mut guard = dev.lock();
        guard.set_owner().unwrap();
        guard.set_vring_kick(RingDirection::Rx, Some(kick.clone())).unwrap();
        guard.stop().unwrap();
        assert!(dev.work_queue().is_closed());

        let before = hits.load(Ordering::SeqCst);
        let poll = dev.ring(RingDirection::Rx).poll().unwrap();
        poll.queue();
        poll.wakeup(PollMask::IN);
        kick.write(1);
        let item = WorkItem::new(|_| {});
        assert!(!dev.queue_work(&item));
        poll.flush();

        assert_eq!(hits.load(Ordering::SeqCst), before);
        assert!(dev.work_queue().is_empty());
        guard.cleanup().unwrap();
    }

    #[test]
    #[should_panic(expected = "work queue not empty at cleanup")]
    fn test_cleanup_with_pending_work_is_fatal() {
        let dev = device(Arc::new(ProcessContextProvider));
        let item = WorkItem::new(|_| {});
        assert!(dev.queue_work(&item));
        let _ = dev.lock().cleanup();
    }
}
