//! Client configuration
//!
//! Defaults suit a single vendor peripheral that answers on one reply
//! characteristic: random address type, one second scans and request
//! timeouts, five second connects, writes without response.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ble::gatt::DEFAULT_REPLY_CHARACTERISTIC;
use crate::ble::transport::{AddressType, SubscriptionDescriptor};
use crate::ble::BleError;

/// Configuration for a [`GattClient`](crate::central::GattClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address type used when connecting.
    pub address_type: AddressType,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Default reply timeout for `send`.
    pub request_timeout_ms: u64,
    /// Hard bound on a single characteristic write in the host adapter.
    pub write_timeout_ms: u64,
    /// Subscribe attempts per connect before giving up.
    pub subscribe_attempts: u32,
    /// Capacity of each peripheral's notification queue.
    pub notification_queue_capacity: usize,
    /// Reject a second concurrent request instead of allowing several.
    pub strict_ordering: bool,
    /// Characteristic requests are written to.
    pub write_characteristic: Uuid,
    /// Characteristic replies arrive on.
    pub reply_characteristic: Uuid,
    pub write_with_response: bool,
    /// Subscribe to replies with indications rather than notifications.
    pub reply_indicate: bool,
    /// Characteristics subscribed on every connect, besides the reply one.
    pub extra_subscriptions: Vec<SubscriptionDescriptor>,
    /// Log payloads of notifications nobody handled.
    pub log_notifications: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address_type: AddressType::Random,
            scan_timeout_ms: 1_000,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 1_000,
            write_timeout_ms: 1_000,
            subscribe_attempts: 3,
            notification_queue_capacity: 64,
            strict_ordering: true,
            write_characteristic: DEFAULT_REPLY_CHARACTERISTIC,
            reply_characteristic: DEFAULT_REPLY_CHARACTERISTIC,
            write_with_response: false,
            reply_indicate: false,
            extra_subscriptions: Vec::new(),
            log_notifications: true,
        }
    }
}

impl ClientConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, BleError> {
        let config: ClientConfig = serde_json::from_str(json)
            .map_err(|e| BleError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BleError> {
        if self.subscribe_attempts == 0 {
            return Err(BleError::InvalidConfig(
                "subscribe_attempts must be at least 1".into(),
            ));
        }
        if self.notification_queue_capacity == 0 {
            return Err(BleError::InvalidConfig(
                "notification_queue_capacity must be > 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0
            || self.request_timeout_ms == 0
            || self.write_timeout_ms == 0
        {
            return Err(BleError::InvalidConfig("timeouts must be > 0".into()));
        }
        let mut seen = vec![self.reply_characteristic];
        for extra in &self.extra_subscriptions {
            if seen.contains(&extra.characteristic) {
                return Err(BleError::InvalidConfig(format!(
                    "characteristic {} subscribed twice",
                    extra.characteristic
                )));
            }
            seen.push(extra.characteristic);
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Everything the state machine must subscribe to before Ready.
    pub fn required_subscriptions(&self) -> Vec<SubscriptionDescriptor> {
        let reply = SubscriptionDescriptor {
            characteristic: self.reply_characteristic,
            indicate: self.reply_indicate,
            response_expected: self.reply_indicate,
        };
        let mut subs = vec![reply];
        subs.extend(self.extra_subscriptions.iter().copied());
        subs
    }
}
