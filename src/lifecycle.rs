//! Device lifecycle state machine.
//!
//! The state lives in a single `AtomicU8` so it can be read lock-free (the
//! work submission path checks it), while transitions use CAS so a state
//! check and the move to the next state cannot be separated by a racing
//! transition.
//!
//! # State Transitions
//!
//! ```text
//! ┌───────────────┐ new ┌─────────────┐ set_owner ┌───────┐ stop ┌─────────┐ cleanup ┌─────────┐
//! │ Uninitialized │ ──> │ Initialized │ ────────> │ Owned │ ───> │ Stopped │ ──────> │ Cleaned │
//! └───────────────┘     └─────────────┘           └───────┘      └─────────┘         └─────────┘
//!                              │                   cleanup (never owned)                  ▲
//!                              └──────────────────────────────────────────────────────────┘
//! ```

use core::sync::atomic::{AtomicU8, Ordering};

/// Device lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    /// Constructed, rings not wired yet.
    Uninitialized = 0,
    /// Rings wired, no owner.
    Initialized = 1,
    /// An execution context is bound and the worker is running.
    Owned = 2,
    /// Kick adapters stopped and flushed; no handler will run again.
    Stopped = 3,
    /// Everything released. Terminal.
    Cleaned = 4,
}

impl DeviceState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            2 => Self::Owned,
            3 => Self::Stopped,
            _ => Self::Cleaned,
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub const fn can_transition(self, to: DeviceState) -> bool {
        matches!(
            (self, to),
            (Self::Uninitialized, Self::Initialized)
                | (Self::Initialized, Self::Owned)
                | (Self::Owned, Self::Stopped)
                | (Self::Stopped, Self::Cleaned)
                | (Self::Initialized, Self::Cleaned)
        )
    }
}

/// Atomic holder of a device's [`DeviceState`].
pub struct DeviceLifecycle {
    state: AtomicU8,
}

impl DeviceLifecycle {
    /// Creates a new lifecycle in the `Uninitialized` state.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(DeviceState::Uninitialized as u8),
        }
    }

    /// Gets the current lifecycle state.
    #[inline]
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `to` if the current state allows it.
    ///
    /// Returns the previous state on success, the current (unchanged) state
    /// otherwise.
    pub fn transition(&self, to: DeviceState) -> Result<DeviceState, DeviceState> {
        loop {
            let current = self.state();
            if !current.can_transition(to) {
                return Err(current);
            }
            match self.state.compare_exchange_weak(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("device state {:?} -> {:?}", current, to);
                    return Ok(current);
                }
                Err(_) => continue,
            }
        }
    }
}

impl Default for DeviceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DeviceLifecycle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceLifecycle")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_initial_state() {
        let lifecycle = DeviceLifecycle::new();
        assert_eq!(lifecycle.state(), DeviceState::Uninitialized);
    }

    #[test]
    fn test_lifecycle_full_path() {
        let lifecycle = DeviceLifecycle::new();
        for to in [
            DeviceState::Initialized,
            DeviceState::Owned,
            DeviceState::Stopped,
            DeviceState::Cleaned,
        ] {
            assert!(lifecycle.transition(to).is_ok());
            assert_eq!(lifecycle.state(), to);
        }
    }

    #[test]
    fn test_lifecycle_unowned_cleanup() {
        let lifecycle = DeviceLifecycle::new();
        lifecycle.transition(DeviceState::Initialized).unwrap();
        assert_eq!(
            lifecycle.transition(DeviceState::Cleaned),
            Ok(DeviceState::Initialized)
        );
    }

    #[test]
    fn test_lifecycle_rejects_skips() {
        let lifecycle = DeviceLifecycle::new();
        assert_eq!(
            lifecycle.transition(DeviceState::Owned),
            Err(DeviceState::Uninitialized)
        );

        lifecycle.transition(DeviceState::Initialized).unwrap();
        lifecycle.transition(DeviceState::Owned).unwrap();
        assert_eq!(
            lifecycle.transition(DeviceState::Cleaned),
            Err(DeviceState::Owned)
        );
        assert_eq!(lifecycle.transition(DeviceState::Owned), Err(DeviceState::Owned));
    }

    #[test]
    fn test_cleaned_is_terminal() {
        let lifecycle = DeviceLifecycle::new();
        lifecycle.transition(DeviceState::Initialized).unwrap();
        lifecycle.transition(DeviceState::Cleaned).unwrap();
        for to in [
            DeviceState::Uninitialized,
            DeviceState::Initialized,
            DeviceState::Owned,
            DeviceState::Stopped,
        ] {
            assert_eq!(lifecycle.transition(to), Err(DeviceState::Cleaned));
        }
    }
}
