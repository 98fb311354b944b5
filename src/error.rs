//! Throttling error types

use thiserror::Error;

/// Errors surfaced by the throttling engine
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Internal capacity exhausted while creating a group or device record
    #[error("out of memory: {0}")]
    NoMemory(&'static str),

    /// Malformed configuration line, unknown device, or partition reference
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration attempted against a device being torn down
    #[error("device is being torn down")]
    DeviceDying,

    /// Device is in bypass mode and the retry budget was exhausted
    #[error("device busy")]
    Busy,
}

/// Result type for throttling operations
pub type Result<T> = std::result::Result<T, ThrottleError>;
