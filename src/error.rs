//! Error types for zigbee-device-runtime.

use std::fmt;

/// Result type for zigbee-device-runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Device key 0 is reserved and cannot name a machine
    InvalidDeviceKey,
    /// The event loop has shut down
    LoopShutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidDeviceKey => write!(f, "Device key 0 is reserved"),
            Error::LoopShutdown => write!(f, "Event loop has shut down"),
        }
    }
}

impl std::error::Error for Error {}
