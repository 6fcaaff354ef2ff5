//! Scan registry
//!
//! Coalesces the raw advertisement stream of one scan into one handle per
//! address, keeping the most recent sighting.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::ble::transport::{BleAdapter, BleAddress, PeripheralHandle};
use crate::ble::BleError;

/// Deduplicated results of a single scan window.
pub struct ScanRegistry {
    window_start: Instant,
    /// First-seen order of addresses.
    order: Vec<BleAddress>,
    entries: HashMap<BleAddress, PeripheralHandle>,
}

impl ScanRegistry {
    /// Start a registry whose window opens at `window_start`. Sightings
    /// stamped earlier than that are stale host cache and are ignored.
    pub fn new(window_start: Instant) -> Self {
        Self {
            window_start,
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    /// Record one sighting. Returns true if the address was new.
    pub fn record(&mut self, sighting: PeripheralHandle) -> bool {
        if sighting.discovered_at < self.window_start {
            return false;
        }
        match self.entries.get_mut(&sighting.address) {
            Some(existing) => {
                if sighting.discovered_at >= existing.discovered_at {
                    let name = sighting.local_name.or_else(|| existing.local_name.take());
                    let rssi = sighting.rssi.or(existing.rssi);
                    existing.discovered_at = sighting.discovered_at;
                    existing.address_type = sighting.address_type;
                    existing.local_name = name;
                    existing.rssi = rssi;
                } else if existing.local_name.is_none() {
                    existing.local_name = sighting.local_name;
                }
                false
            }
            None => {
                self.order.push(sighting.address.clone());
                self.entries.insert(sighting.address.clone(), sighting);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, address: &BleAddress) -> Option<&PeripheralHandle> {
        self.entries.get(address)
    }

    /// Consume the registry, yielding handles in first-seen order.
    pub fn into_handles(mut self) -> Vec<PeripheralHandle> {
        self.order
            .iter()
            .filter_map(|addr| self.entries.remove(addr))
            .collect()
    }
}

/// Scan through `adapter` for `duration` and return each address once.
pub async fn scan(
    adapter: &dyn BleAdapter,
    duration: Duration,
) -> Result<Vec<PeripheralHandle>, BleError> {
    let mut registry = ScanRegistry::new(Instant::now());
    let sightings = adapter.scan(duration).await?;
    let raw = sightings.len();
    for sighting in sightings {
        registry.record(sighting);
    }
    log::debug!(
        "Scan finished: {} advertisements from {} peripherals",
        raw,
        registry.len()
    );
    Ok(registry.into_handles())
}
