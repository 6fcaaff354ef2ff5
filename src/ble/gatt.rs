//! Well-known GATT identifiers
//!
//! Bluetooth SIG short-UUID expansion and the default reply characteristic
//! used by peripherals speaking the write-then-notify protocol.

use uuid::Uuid;

/// Bluetooth SIG base UUID: `0000xxxx-0000-1000-8000-00805F9B34FB`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Default characteristic replies are notified on.
pub const DEFAULT_REPLY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0f1d_0003_2021_aaaa_aaaa_0f1d_1aaa_aaaa);

/// Expand a 16-bit SIG-assigned UUID to its 128-bit form.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Recover the 16-bit form of a SIG-assigned UUID, if it is one.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = !(0xFFFF_u128 << 96);
    if value & mask == BLUETOOTH_BASE_UUID && value >> 112 == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Heart Rate Measurement, handy as a notify-only characteristic in tests.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);
