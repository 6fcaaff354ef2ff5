// Gattlink - BLE GATT central client

pub mod ble;
pub mod central;
pub mod config;

pub use ble::transport::{
    AddressType, BleAdapter, BleAddress, ConnectionToken, NotificationEvent, PeripheralHandle,
    SubscriptionDescriptor,
};
pub use ble::BleError;
pub use central::{ConnectionState, DispatchStats, GattClient, PendingRequest, RequestId};
pub use config::ClientConfig;
