//! Execution-context providers.
//!
//! A device is owned by exactly one execution context (an address space, a
//! tenant, a process). The worker binds itself to the owner's context when it
//! starts so that handler code observes the owner, not the worker thread.
//!
//! Two providers are built in:
//! - [`ProcessContextProvider`]: every caller in the process is the same
//!   context. Ownership checks only guard against double binding.
//! - [`ScopedContextProvider`]: the context is a per-thread identity entered
//!   with [`ScopedContext::enter`]. The worker thread enters the owner's
//!   identity for its lifetime.

use alloc::sync::Arc;
use core::cell::Cell;

/// Identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u64);

/// Handle to an acquired execution context.
///
/// Dropping the last `Arc` releases the context.
pub trait ExecContext: Send + Sync {
    /// Identity used for ownership checks.
    fn id(&self) -> ContextId;

    /// Called on the worker thread before it processes any work.
    fn bind(&self) {}

    /// Called on the worker thread after its loop exits.
    fn unbind(&self) {}
}

/// Resolves the caller's execution context.
pub trait ContextProvider: Send + Sync {
    /// Acquires a handle to the calling context.
    fn current(&self) -> Arc<dyn ExecContext>;
}

/// The whole process as a single context.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    pid: u32,
}

impl ExecContext for ProcessContext {
    fn id(&self) -> ContextId {
        ContextId(self.pid as u64)
    }
}

/// Provider returning [`ProcessContext`] for every caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessContextProvider;

impl ContextProvider for ProcessContextProvider {
    fn current(&self) -> Arc<dyn ExecContext> {
        Arc::new(ProcessContext {
            pid: std::process::id(),
        })
    }
}

std::thread_local! {
    static CURRENT: Cell<ContextId> = const { Cell::new(ScopedContext::NONE) };
}

/// Thread-scoped context identity.
#[derive(Debug)]
pub struct ScopedContext {
    id: ContextId,
}

impl ScopedContext {
    /// Identity of a thread that has not entered any context.
    pub const NONE: ContextId = ContextId(0);

    /// Makes `id` the calling thread's context until the guard is dropped.
    pub fn enter(id: ContextId) -> ScopedGuard {
        let prev = CURRENT.with(|cur| cur.replace(id));
        ScopedGuard { prev }
    }

    /// The calling thread's context identity.
    pub fn current_id() -> ContextId {
        CURRENT.with(Cell::get)
    }
}

impl ExecContext for ScopedContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn bind(&self) {
        CURRENT.with(|cur| cur.set(self.id));
    }

    fn unbind(&self) {
        CURRENT.with(|cur| cur.set(Self::NONE));
    }
}

/// Restores the previous thread context on drop.
#[must_use = "the context is left as soon as the guard is dropped"]
pub struct ScopedGuard {
    prev: ContextId,
}

impl Drop for ScopedGuard {
    fn drop(&mut self) {
        CURRENT.with(|cur| cur.set(self.prev));
    }
}

/// Provider returning the calling thread's [`ScopedContext`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopedContextProvider;

impl ContextProvider for ScopedContextProvider {
    fn current(&self) -> Arc<dyn ExecContext> {
        Arc::new(ScopedContext {
            id: ScopedContext::current_id(),
        })
    }
}
