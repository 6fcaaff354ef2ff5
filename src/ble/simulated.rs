//! In-process BLE host simulator
//!
//! Provides a scripted host adapter whose peripherals advertise, accept or
//! refuse links, expose notifiable characteristics, answer writes with
//! delayed notifications, and drop links on command, entirely in-process.
//! Used for testing and demos without requiring real BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::gatt::DEFAULT_REPLY_CHARACTERISTIC;
use super::transport::{
    AddressType, BleAdapter, BleAddress, ConnectionToken, LinkEvent, NotificationEvent,
    NotificationSink, PeripheralHandle, SubscriptionDescriptor, SubscriptionId,
};
use super::BleError;

/// A notification the simulated peripheral sends back after a write.
#[derive(Debug, Clone)]
pub struct SimReply {
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    pub delay: Duration,
}

impl SimReply {
    /// Reply on the default reply characteristic.
    pub fn after(delay: Duration, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic: DEFAULT_REPLY_CHARACTERISTIC,
            payload: payload.into(),
            delay,
        }
    }
}

type Responder = Arc<dyn Fn(&[u8]) -> Option<SimReply> + Send + Sync>;

/// Script for one simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub address: BleAddress,
    pub address_type: AddressType,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    /// Offsets into a scan at which this peripheral advertises.
    pub advertise_at: Vec<Duration>,
    /// Time between the connect request and the link coming up.
    pub connect_latency: Duration,
    pub refuse_connections: bool,
    /// Characteristics that can be subscribed to.
    pub characteristics: Vec<Uuid>,
    /// Number of subscribe attempts that fail before one succeeds.
    pub subscribe_failures: u32,
}

impl SimPeripheral {
    pub fn new(address: BleAddress) -> Self {
        Self {
            address,
            address_type: AddressType::Random,
            local_name: None,
            rssi: Some(-50),
            advertise_at: vec![Duration::ZERO],
            connect_latency: Duration::ZERO,
            refuse_connections: false,
            characteristics: vec![DEFAULT_REPLY_CHARACTERISTIC],
            subscribe_failures: 0,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.local_name = Some(name.to_string());
        self
    }

    pub fn advertising_at(mut self, offsets: Vec<Duration>) -> Self {
        self.advertise_at = offsets;
        self
    }

    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connections = true;
        self
    }

    pub fn with_characteristics(mut self, characteristics: Vec<Uuid>) -> Self {
        self.characteristics = characteristics;
        self
    }

    pub fn failing_subscribes(mut self, failures: u32) -> Self {
        self.subscribe_failures = failures;
        self
    }
}

struct PeripheralState {
    script: SimPeripheral,
    /// Id of the active link, if any.
    link: Option<u64>,
    subscriptions: HashMap<SubscriptionId, (Uuid, NotificationSink)>,
    responder: Option<Responder>,
    writes: Vec<(Uuid, Vec<u8>)>,
    stall_writes: bool,
    write_error: Option<BleError>,
    subscribe_failures_left: u32,
}

impl PeripheralState {
    fn check_link(&self, token: &ConnectionToken) -> Result<(), BleError> {
        if self.link == Some(token.id) {
            Ok(())
        } else {
            Err(BleError::NotConnected)
        }
    }

    fn sinks_for(&self, characteristic: Uuid) -> Vec<NotificationSink> {
        self.subscriptions
            .values()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, sink)| Arc::clone(sink))
            .collect()
    }
}

struct SimState {
    started: bool,
    radio_available: bool,
    stop_count: u32,
    peripherals: HashMap<BleAddress, PeripheralState>,
}

/// The simulated host adapter.
pub struct SimBleAdapter {
    state: Mutex<SimState>,
    link_tx: broadcast::Sender<LinkEvent>,
    next_id: AtomicU64,
    /// Reply tasks need to reach back into the adapter.
    self_ref: Weak<SimBleAdapter>,
}

impl SimBleAdapter {
    /// Create a new simulated adapter with the radio available.
    pub fn new() -> Arc<Self> {
        let (link_tx, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(SimState {
                started: false,
                radio_available: true,
                stop_count: 0,
                peripherals: HashMap::new(),
            }),
            link_tx,
            next_id: AtomicU64::new(1),
            self_ref: weak.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the other tasks.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_peripheral(&self, script: SimPeripheral) {
        let failures = script.subscribe_failures;
        self.lock().peripherals.insert(
            script.address.clone(),
            PeripheralState {
                script,
                link: None,
                subscriptions: HashMap::new(),
                responder: None,
                writes: Vec::new(),
                stall_writes: false,
                write_error: None,
                subscribe_failures_left: failures,
            },
        );
    }

    /// Power the simulated radio on or off. `start()` fails while off.
    pub fn set_radio_available(&self, available: bool) {
        self.lock().radio_available = available;
    }

    /// Answer every write to `address` with whatever `responder` returns.
    pub fn set_responder<F>(&self, address: &BleAddress, responder: F)
    where
        F: Fn(&[u8]) -> Option<SimReply> + Send + Sync + 'static,
    {
        if let Some(p) = self.lock().peripherals.get_mut(address) {
            p.responder = Some(Arc::new(responder));
        }
    }

    /// Make writes to `address` hang forever, like a wedged host stack.
    pub fn set_stall_writes(&self, address: &BleAddress, stall: bool) {
        if let Some(p) = self.lock().peripherals.get_mut(address) {
            p.stall_writes = stall;
        }
    }

    /// Fail every write to `address` with `error` until cleared with `None`.
    pub fn set_write_error(&self, address: &BleAddress, error: Option<BleError>) {
        if let Some(p) = self.lock().peripherals.get_mut(address) {
            p.write_error = error;
        }
    }

    /// Push a value change now. Returns false if nobody is subscribed.
    pub fn notify(&self, address: &BleAddress, characteristic: Uuid, payload: &[u8]) -> bool {
        let sinks = match self.lock().peripherals.get(address) {
            Some(p) if p.link.is_some() => p.sinks_for(characteristic),
            _ => Vec::new(),
        };
        for sink in &sinks {
            sink(NotificationEvent::new(characteristic, payload.to_vec()));
        }
        !sinks.is_empty()
    }

    /// Drop the link to `address` as if the peripheral went out of range.
    pub fn drop_link(&self, address: &BleAddress) {
        let dropped = match self.lock().peripherals.get_mut(address) {
            Some(p) if p.link.is_some() => {
                p.link = None;
                p.subscriptions.clear();
                true
            }
            _ => false,
        };
        if dropped {
            let _ = self.link_tx.send(LinkEvent::Disconnected(address.clone()));
        }
    }

    /// Every write received by `address`, oldest first.
    pub fn writes(&self, address: &BleAddress) -> Vec<(Uuid, Vec<u8>)> {
        self.lock()
            .peripherals
            .get(address)
            .map(|p| p.writes.clone())
            .unwrap_or_default()
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// How many times `stop()` has run.
    pub fn stop_count(&self) -> u32 {
        self.lock().stop_count
    }

    pub fn is_linked(&self, address: &BleAddress) -> bool {
        self.lock()
            .peripherals
            .get(address)
            .map_or(false, |p| p.link.is_some())
    }

    pub fn active_subscriptions(&self, address: &BleAddress) -> usize {
        self.lock()
            .peripherals
            .get(address)
            .map_or(0, |p| p.subscriptions.len())
    }

    fn ensure_started(&self) -> Result<(), BleError> {
        if self.lock().started {
            Ok(())
        } else {
            Err(BleError::RadioUnavailable("adapter not started".into()))
        }
    }

    fn deliver_reply(&self, address: &BleAddress, link: u64, reply: SimReply) {
        let sinks = match self.lock().peripherals.get(address) {
            Some(p) if p.link == Some(link) => p.sinks_for(reply.characteristic),
            _ => return,
        };
        for sink in sinks {
            sink(NotificationEvent::new(reply.characteristic, reply.payload.clone()));
        }
    }
}

#[async_trait]
impl BleAdapter for SimBleAdapter {
    async fn start(&self) -> Result<(), BleError> {
        let mut state = self.lock();
        if !state.radio_available {
            return Err(BleError::RadioUnavailable(
                "simulated radio is powered off".into(),
            ));
        }
        state.started = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), BleError> {
        let mut state = self.lock();
        state.started = false;
        state.stop_count += 1;
        for p in state.peripherals.values_mut() {
            p.link = None;
            p.subscriptions.clear();
        }
        Ok(())
    }

    async fn scan(&self, duration: Duration) -> Result<Vec<PeripheralHandle>, BleError> {
        self.ensure_started()?;
        let started = Instant::now();
        tokio::time::sleep(duration).await;

        let state = self.lock();
        let mut seen = Vec::new();
        for p in state.peripherals.values() {
            for offset in p.script.advertise_at.iter().filter(|o| **o <= duration) {
                seen.push(PeripheralHandle {
                    address: p.script.address.clone(),
                    address_type: p.script.address_type,
                    discovered_at: started + *offset,
                    rssi: p.script.rssi,
                    local_name: p.script.local_name.clone(),
                });
            }
        }
        seen.sort_by_key(|h| h.discovered_at);
        Ok(seen)
    }

    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        _address_type: AddressType,
        timeout: Duration,
    ) -> Result<ConnectionToken, BleError> {
        self.ensure_started()?;
        let (latency, refuse) = {
            let state = self.lock();
            let p = state.peripherals.get(&peripheral.address).ok_or_else(|| {
                BleError::ConnectionRefused(format!("no peripheral at {}", peripheral.address))
            })?;
            (p.script.connect_latency, p.script.refuse_connections)
        };

        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(BleError::ConnectionTimeout);
        }
        tokio::time::sleep(latency).await;
        if refuse {
            return Err(BleError::ConnectionRefused(format!(
                "{} rejected the connection",
                peripheral.address
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        let p = state
            .peripherals
            .get_mut(&peripheral.address)
            .ok_or_else(|| BleError::ConnectionRefused("peripheral vanished".into()))?;
        p.link = Some(id);
        p.subscriptions.clear();
        Ok(ConnectionToken {
            id,
            address: peripheral.address.clone(),
        })
    }

    async fn subscribe(
        &self,
        token: &ConnectionToken,
        descriptor: &SubscriptionDescriptor,
        sink: NotificationSink,
    ) -> Result<SubscriptionId, BleError> {
        let mut state = self.lock();
        let p = state
            .peripherals
            .get_mut(&token.address)
            .ok_or(BleError::NotConnected)?;
        p.check_link(token)?;
        if !p.script.characteristics.contains(&descriptor.characteristic) {
            return Err(BleError::UnsupportedCharacteristic(descriptor.characteristic));
        }
        if p.subscribe_failures_left > 0 {
            p.subscribe_failures_left -= 1;
            return Err(BleError::GattError("simulated CCCD write failure".into()));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        p.subscriptions.insert(id, (descriptor.characteristic, sink));
        Ok(id)
    }

    async fn unsubscribe(
        &self,
        token: &ConnectionToken,
        subscription: SubscriptionId,
    ) -> Result<(), BleError> {
        let mut state = self.lock();
        let p = state
            .peripherals
            .get_mut(&token.address)
            .ok_or(BleError::NotConnected)?;
        p.check_link(token)?;
        p.subscriptions.remove(&subscription);
        Ok(())
    }

    async fn write(
        &self,
        token: &ConnectionToken,
        characteristic: Uuid,
        data: &[u8],
        _expect_response: bool,
    ) -> Result<(), BleError> {
        let (stall, reply) = {
            let mut state = self.lock();
            let p = state
                .peripherals
                .get_mut(&token.address)
                .ok_or(BleError::NotConnected)?;
            p.check_link(token)?;
            if let Some(err) = &p.write_error {
                return Err(err.clone());
            }
            p.writes.push((characteristic, data.to_vec()));
            let reply = p.responder.as_ref().and_then(|r| r(data));
            (p.stall_writes, reply)
        };

        if let (Some(reply), Some(adapter)) = (reply, self.self_ref.upgrade()) {
            let address = token.address.clone();
            let link = token.id;
            tokio::spawn(async move {
                tokio::time::sleep(reply.delay).await;
                adapter.deliver_reply(&address, link, reply);
            });
        }

        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self, token: &ConnectionToken) -> Result<(), BleError> {
        let mut state = self.lock();
        if let Some(p) = state.peripherals.get_mut(&token.address) {
            if p.link == Some(token.id) {
                p.link = None;
                p.subscriptions.clear();
            }
        }
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}
