//! Completion notifiers.
//!
//! A ring's completion notifier tells the external party "something was
//! consumed". Notification is level-style and coalescing: several signals
//! issued before the other side looks are indistinguishable from one.

use alloc::sync::Arc;

/// Fire-and-forget completion signal.
///
/// `notify` must not block and cannot fail observably.
pub trait CallNotifier: Send + Sync {
    fn notify(&self);
}

/// Notifier that runs a closure, useful for embedding and tests.
pub struct CallbackNotifier {
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl CallbackNotifier {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl CallNotifier for CallbackNotifier {
    fn notify(&self) {
        (self.callback)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_callback_notifier() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let notifier = CallbackNotifier::new(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.notify();
        notifier.notify();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
