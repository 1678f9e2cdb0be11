//! Error kinds reported by the device core.
//!
//! Every variant here is recoverable: the operation that returned it left the
//! device in the state it was in before the call. Broken lifecycle contracts
//! (a non-empty work queue at cleanup, an unbalanced flush counter) are not
//! represented here, they panic.

use std::io;

use axerrno::AxError;
use thiserror::Error;

use crate::lifecycle::DeviceState;

/// Errors returned by lifecycle, ring and poll operations.
#[derive(Error, Debug)]
pub enum VhostError {
    /// The calling context is not the one bound to the device.
    #[error("caller does not own the device")]
    PermissionDenied,

    /// `set_owner` was called while a context is already bound.
    #[error("device already has an owner")]
    AlreadyOwned,

    /// The worker thread could not be created.
    #[error("failed to spawn worker: {0}")]
    WorkerSpawnFailed(#[from] io::Error),

    /// The readiness source reported an error condition while the adapter
    /// was being registered.
    #[error("readiness source reported an error condition")]
    ReadinessRegistrationFailed,

    /// Malformed mask, mismatched ring or similar caller mistake.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The device is not in a state that allows the operation.
    #[error("operation not permitted in state {0:?}")]
    BadState(DeviceState),
}

/// Result type used throughout the crate.
pub type VhostResult<T = ()> = Result<T, VhostError>;

impl From<VhostError> for AxError {
    fn from(err: VhostError) -> Self {
        match err {
            VhostError::PermissionDenied => AxError::PermissionDenied,
            VhostError::AlreadyOwned => AxError::ResourceBusy,
            VhostError::WorkerSpawnFailed(_) => AxError::NoMemory,
            VhostError::ReadinessRegistrationFailed | VhostError::InvalidArgument(_) => {
                AxError::InvalidInput
            }
            VhostError::BadState(_) => AxError::BadState,
        }
    }
}
