//! Host BLE adapter layer
//!
//! Provides the adapter capability trait, the shared BLE data types, a
//! simulated host adapter for testing, well-known GATT identifiers, and an
//! optional btleplug-backed host adapter (`ble-central` feature).

#[cfg(feature = "ble-central")]
pub mod btleplug;
pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;
use uuid::Uuid;

use crate::central::ConnectionState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Connection attempt timed out")]
    ConnectionTimeout,

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Characteristic {0} does not support notifications")]
    UnsupportedCharacteristic(Uuid),

    #[error("Characteristic {0} already has a handler")]
    AlreadySubscribed(Uuid),

    #[error("Characteristic write timed out")]
    WriteTimeout,

    #[error("No reply arrived before the request timeout")]
    RequestTimeout,

    #[error("Another request is already in flight")]
    RequestInFlight,

    #[error("Request canceled")]
    RequestCanceled,

    #[error("Link lost")]
    LinkLost,

    #[error("Connection attempt canceled by disconnect")]
    Canceled,

    #[error("Operation not allowed in state {0:?}")]
    InvalidState(ConnectionState),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("GATT error: {0}")]
    GattError(String),
}

impl BleError {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BleError::ConnectionTimeout
                | BleError::ConnectionRefused(_)
                | BleError::WriteTimeout
                | BleError::RequestTimeout
                | BleError::LinkLost
                | BleError::GattError(_)
        )
    }
}
