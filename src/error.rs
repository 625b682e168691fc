//! Fault taxonomy shared across the crate.
//!
//! Session-scoped relay faults never surface here — the bridge absorbs them
//! and only ends the affected session. Everything that can fail a whole
//! mapping (or a caller's request) is a variant of [`Error`], so the state
//! machine and the observer feed carry a machine-readable fault kind in
//! addition to the human-readable message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The serial device could not be opened, or is already claimed.
    #[error("serial device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The requested public or local port is already reserved.
    #[error("port {0} is already reserved")]
    PortConflict(u16),

    /// The external forwarding client could not be launched.
    #[error("failed to launch forwarding client: {0}")]
    SpawnFailed(String),

    /// The external forwarding client exited while mappings were running.
    #[error("forwarding client exited unexpectedly: {0}")]
    ProcessCrashed(String),

    /// No mapping with the given id exists.
    #[error("mapping {0} not found")]
    MappingNotFound(String),

    /// The requested operation is not legal in the mapping's current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The mapping definition itself is unusable.
    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
