//! BLE adapter trait definitions and core types
//!
//! Defines the host adapter capability set that both the simulated adapter
//! and the btleplug adapter implement, plus the values passed across it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Mac([u8; 6]),
    /// A platform-assigned identifier (e.g. a CoreBluetooth peripheral UUID).
    Platform(String),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Mac(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            BleAddress::Platform(id) => f.write_str(id),
        }
    }
}

impl FromStr for BleAddress {
    type Err = BleError;

    /// Parses `AA:BB:CC:DD:EE:FF`. Anything else is kept as a platform id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BleError::InvalidConfig("empty BLE address".into()));
        }
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() == 6 && parts.iter().all(|p| p.len() == 2) {
            let mut bytes = [0u8; 6];
            for (i, part) in parts.iter().enumerate() {
                bytes[i] = u8::from_str_radix(part, 16).map_err(|_| {
                    BleError::InvalidConfig(format!("invalid MAC address {}", s))
                })?;
            }
            return Ok(BleAddress::Mac(bytes));
        }
        Ok(BleAddress::Platform(s.to_string()))
    }
}

/// Address type used when initiating a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    #[default]
    Random,
}

/// A peripheral observed during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralHandle {
    pub address: BleAddress,
    pub address_type: AddressType,
    /// When the advertisement was observed.
    pub discovered_at: Instant,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    pub local_name: Option<String>,
}

impl PeripheralHandle {
    pub fn new(address: BleAddress, address_type: AddressType) -> Self {
        Self {
            address,
            address_type,
            discovered_at: Instant::now(),
            rssi: None,
            local_name: None,
        }
    }
}

/// An established link, as handed out by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionToken {
    /// Adapter-assigned link id, unique for the adapter's lifetime.
    pub id: u64,
    pub address: BleAddress,
}

/// Adapter-assigned id of an active characteristic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// What to subscribe to on a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    pub characteristic: Uuid,
    /// Subscribe with indications (acknowledged) instead of notifications.
    pub indicate: bool,
    /// Wait for the CCCD write response when enabling the subscription.
    pub response_expected: bool,
}

impl SubscriptionDescriptor {
    /// A plain notification subscription.
    pub fn notify(characteristic: Uuid) -> Self {
        Self {
            characteristic,
            indicate: false,
            response_expected: false,
        }
    }

    pub fn indicate(characteristic: Uuid) -> Self {
        Self {
            characteristic,
            indicate: true,
            response_expected: true,
        }
    }
}

/// A characteristic value change pushed by a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

impl NotificationEvent {
    pub fn new(characteristic: Uuid, payload: Vec<u8>) -> Self {
        Self {
            characteristic,
            payload,
            received_at: Instant::now(),
        }
    }
}

/// Asynchronous link-level signals from the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link to a peripheral dropped without being asked to.
    Disconnected(BleAddress),
}

/// Callback an adapter invokes from its own event context for each value
/// change on a subscribed characteristic. Must not block.
pub type NotificationSink = Arc<dyn Fn(NotificationEvent) + Send + Sync>;

/// Capability set of a host BLE backend, central role.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Acquire the host radio.
    async fn start(&self) -> Result<(), BleError>;

    /// Release the host radio. Idempotent.
    async fn stop(&self) -> Result<(), BleError>;

    /// Scan for `duration` and report every advertisement seen, duplicates
    /// included.
    async fn scan(&self, duration: Duration) -> Result<Vec<PeripheralHandle>, BleError>;

    /// Open a link to a previously scanned peripheral.
    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        address_type: AddressType,
        timeout: Duration,
    ) -> Result<ConnectionToken, BleError>;

    /// Enable value-change delivery for a characteristic.
    async fn subscribe(
        &self,
        token: &ConnectionToken,
        descriptor: &SubscriptionDescriptor,
        sink: NotificationSink,
    ) -> Result<SubscriptionId, BleError>;

    async fn unsubscribe(
        &self,
        token: &ConnectionToken,
        subscription: SubscriptionId,
    ) -> Result<(), BleError>;

    /// Write a characteristic value.
    async fn write(
        &self,
        token: &ConnectionToken,
        characteristic: Uuid,
        data: &[u8],
        expect_response: bool,
    ) -> Result<(), BleError>;

    /// Close the link. Idempotent.
    async fn disconnect(&self, token: &ConnectionToken) -> Result<(), BleError>;

    /// Subscribe to link-level events.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}
