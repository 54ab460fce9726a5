//! Error types for the lelink library
//!
//! Every fallible call in the stack returns [`BtResult`]. The same error kinds
//! travel inside asynchronous client events, which is why [`BtError`] is `Copy`.

use thiserror::Error;

/// Errors reported by the LE connection and GATT client machinery
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BtError {
    /// Malformed input or a reference to something that does not exist
    #[error("Invalid parameter")]
    InvalidParameter,

    /// The request is not valid in the current intent/discovery/subscription state
    #[error("Invalid state for operation")]
    InvalidState,

    /// A fixed-capacity table or an allocation was exhausted
    #[error("Not enough resources")]
    NotEnoughResources,

    /// The link dropped while service discovery was outstanding
    #[error("Service discovery interrupted by disconnection")]
    ServiceDiscoveryDisconnected,

    /// The discovery watchdog ran out of retries
    #[error("Service discovery timed out")]
    ServiceDiscoveryTimeout,

    /// Previously discovered services are stale and must be queried again
    #[error("Remote GATT database changed")]
    ServiceDiscoveryDatabaseChanged,

    /// Status code reported by the controller driver, passed through untouched
    #[error("Driver error: {0:#x}")]
    Driver(i32),
}

impl BtError {
    /// Maps a driver status code to a result, `0` meaning success
    pub fn from_driver_status(status: i32) -> BtResult<()> {
        if status == 0 {
            Ok(())
        } else {
            Err(BtError::Driver(status))
        }
    }
}

/// Result type for stack operations
pub type BtResult<T> = std::result::Result<T, BtError>;
