//! Host adapter backed by btleplug (Mac/Linux/Windows)
//!
//! Characteristics are looked up by UUID after service discovery. Each
//! subscription runs a task that forwards matching values from the
//! peripheral's notification stream to the subscription's sink, and one
//! task per adapter turns `DeviceDisconnected` into [`LinkEvent`]s.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::transport::{
    AddressType, BleAdapter, BleAddress, ConnectionToken, LinkEvent, NotificationEvent,
    NotificationSink, PeripheralHandle, SubscriptionDescriptor, SubscriptionId,
};
use super::BleError;

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => BleError::LinkLost,
            btleplug::Error::PermissionDenied => {
                BleError::RadioUnavailable("permission denied".into())
            }
            btleplug::Error::TimedOut(_) => BleError::WriteTimeout,
            other => BleError::GattError(other.to_string()),
        }
    }
}

struct Link {
    address: BleAddress,
    peripheral: Peripheral,
    subscriptions: HashMap<SubscriptionId, (Characteristic, JoinHandle<()>)>,
}

impl Link {
    fn abort_forwarders(&mut self) {
        for (_, (_, task)) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

type LinkTable = Arc<Mutex<HashMap<u64, Link>>>;

fn lock_links(links: &LinkTable) -> MutexGuard<'_, HashMap<u64, Link>> {
    links.lock().unwrap_or_else(|p| p.into_inner())
}

/// Remove every link to `id`, returning their addresses.
fn forget_peripheral(links: &LinkTable, id: &PeripheralId) -> Vec<BleAddress> {
    let mut links = lock_links(links);
    let dead: Vec<u64> = links
        .iter()
        .filter(|(_, link)| &link.peripheral.id() == id)
        .map(|(token, _)| *token)
        .collect();
    dead.into_iter()
        .filter_map(|token| links.remove(&token))
        .map(|mut link| {
            link.abort_forwarders();
            link.address
        })
        .collect()
}

/// macOS hides the MAC behind a per-host UUID, reported as an all-zero
/// address; fall back to the platform id there.
fn address_of(peripheral: &Peripheral, props: &PeripheralProperties) -> BleAddress {
    let mac = props.address.into_inner();
    if mac == [0u8; 6] {
        BleAddress::Platform(peripheral.id().to_string())
    } else {
        BleAddress::Mac(mac)
    }
}

fn address_type_of(props: &PeripheralProperties) -> AddressType {
    match props.address_type {
        Some(btleplug::api::AddressType::Public) => AddressType::Public,
        _ => AddressType::Random,
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, BleError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(BleError::UnsupportedCharacteristic(uuid))
}

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Run a characteristic write, giving up with `WriteTimeout` once
/// `timeout` elapses.
async fn bounded_write<F>(timeout: Duration, write: F) -> Result<(), BleError>
where
    F: Future<Output = Result<(), btleplug::Error>>,
{
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(BleError::WriteTimeout),
    }
}

/// btleplug host adapter. Uses the first adapter the OS reports.
pub struct BtleplugAdapter {
    adapter: RwLock<Option<Adapter>>,
    links: LinkTable,
    next_id: AtomicU64,
    link_tx: broadcast::Sender<LinkEvent>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    write_timeout: Duration,
}

impl BtleplugAdapter {
    pub fn new() -> Arc<Self> {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }

    /// Writes that the host stack has not finished within `write_timeout`
    /// fail with `WriteTimeout`.
    pub fn with_write_timeout(write_timeout: Duration) -> Arc<Self> {
        let (link_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            adapter: RwLock::new(None),
            links: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            link_tx,
            event_task: Mutex::new(None),
            write_timeout,
        })
    }

    async fn adapter(&self) -> Result<Adapter, BleError> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or_else(|| BleError::RadioUnavailable("adapter not started".into()))
    }

    fn link_peripheral(&self, token: &ConnectionToken) -> Result<Peripheral, BleError> {
        lock_links(&self.links)
            .get(&token.id)
            .map(|link| link.peripheral.clone())
            .ok_or(BleError::NotConnected)
    }

    async fn find_peripheral(
        adapter: &Adapter,
        address: &BleAddress,
    ) -> Result<Option<Peripheral>, BleError> {
        for peripheral in adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if &address_of(&peripheral, &props) == address {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    async fn spawn_disconnect_watcher(&self, adapter: &Adapter) -> Result<JoinHandle<()>, BleError> {
        let mut events = adapter.events().await?;
        let links = Arc::clone(&self.links);
        let link_tx = self.link_tx.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    for address in forget_peripheral(&links, &id) {
                        log::info!("BLE link to {} dropped", address);
                        let _ = link_tx.send(LinkEvent::Disconnected(address));
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn start(&self) -> Result<(), BleError> {
        let mut slot = self.adapter.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::RadioUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::RadioUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::RadioUnavailable("no BLE adapter found".into()))?;

        let watcher = self.spawn_disconnect_watcher(&adapter).await?;
        if let Some(old) = self
            .event_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(watcher)
        {
            old.abort();
        }
        *slot = Some(adapter);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BleError> {
        let Some(adapter) = self.adapter.write().await.take() else {
            return Ok(());
        };
        if let Some(task) = self
            .event_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        let _ = adapter.stop_scan().await;

        let links: Vec<Link> = lock_links(&self.links).drain().map(|(_, l)| l).collect();
        for mut link in links {
            link.abort_forwarders();
            if let Err(e) = link.peripheral.disconnect().await {
                log::debug!("Disconnect from {} on stop failed: {}", link.address, e);
            }
        }
        Ok(())
    }

    async fn scan(&self, duration: Duration) -> Result<Vec<PeripheralHandle>, BleError> {
        let adapter = self.adapter().await?;
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + duration;
        let mut sightings: Vec<(PeripheralId, Instant)> = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, events.next()).await {
                Ok(Some(CentralEvent::DeviceDiscovered(id)))
                | Ok(Some(CentralEvent::DeviceUpdated(id))) => {
                    sightings.push((id, Instant::now()));
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if let Err(e) = adapter.stop_scan().await {
            log::debug!("stop_scan failed: {}", e);
        }

        let mut properties: HashMap<PeripheralId, Option<(BleAddress, PeripheralProperties)>> =
            HashMap::new();
        let mut handles = Vec::with_capacity(sightings.len());
        for (id, seen_at) in sightings {
            if !properties.contains_key(&id) {
                let resolved = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral
                        .properties()
                        .await?
                        .map(|props| (address_of(&peripheral, &props), props)),
                    Err(_) => None,
                };
                properties.insert(id.clone(), resolved);
            }
            if let Some(Some((address, props))) = properties.get(&id) {
                handles.push(PeripheralHandle {
                    address: address.clone(),
                    address_type: address_type_of(props),
                    discovered_at: seen_at,
                    rssi: props.rssi,
                    local_name: props.local_name.clone(),
                });
            }
        }
        Ok(handles)
    }

    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        address_type: AddressType,
        timeout: Duration,
    ) -> Result<ConnectionToken, BleError> {
        let adapter = self.adapter().await?;
        let target = Self::find_peripheral(&adapter, &peripheral.address)
            .await?
            .ok_or_else(|| {
                BleError::ConnectionRefused(format!("{} not known to host", peripheral.address))
            })?;
        log::debug!(
            "Connecting to {} ({:?} address, host picks the type)",
            peripheral.address,
            address_type
        );

        let attempt = async {
            target.connect().await?;
            target.discover_services().await?;
            Ok::<(), btleplug::Error>(())
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BleError::ConnectionRefused(e.to_string())),
            Err(_) => {
                let _ = target.disconnect().await;
                return Err(BleError::ConnectionTimeout);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock_links(&self.links).insert(
            id,
            Link {
                address: peripheral.address.clone(),
                peripheral: target,
                subscriptions: HashMap::new(),
            },
        );
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
        let peripheral = self.link_peripheral(token)?;
        let characteristic = find_characteristic(&peripheral, descriptor.characteristic)?;
        let wanted = if descriptor.indicate {
            CharPropFlags::INDICATE
        } else {
            CharPropFlags::NOTIFY
        };
        if !characteristic.properties.contains(wanted) {
            return Err(BleError::UnsupportedCharacteristic(descriptor.characteristic));
        }

        peripheral.subscribe(&characteristic).await?;
        let mut stream = peripheral.notifications().await?;
        let uuid = characteristic.uuid;
        let forwarder = tokio::spawn(async move {
            while let Some(value) = stream.next().await {
                if value.uuid == uuid {
                    sink(NotificationEvent::new(value.uuid, value.value));
                }
            }
        });

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut links = lock_links(&self.links);
        match links.get_mut(&token.id) {
            Some(link) => {
                link.subscriptions.insert(id, (characteristic, forwarder));
                Ok(id)
            }
            None => {
                forwarder.abort();
                Err(BleError::LinkLost)
            }
        }
    }

    async fn unsubscribe(
        &self,
        token: &ConnectionToken,
        subscription: SubscriptionId,
    ) -> Result<(), BleError> {
        let (peripheral, characteristic) = {
            let mut links = lock_links(&self.links);
            let link = links.get_mut(&token.id).ok_or(BleError::NotConnected)?;
            match link.subscriptions.remove(&subscription) {
                Some((characteristic, task)) => {
                    task.abort();
                    (link.peripheral.clone(), characteristic)
                }
                None => return Ok(()),
            }
        };
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn write(
        &self,
        token: &ConnectionToken,
        characteristic: Uuid,
        data: &[u8],
        expect_response: bool,
    ) -> Result<(), BleError> {
        let peripheral = self.link_peripheral(token)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let write_type = if expect_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        bounded_write(
            self.write_timeout,
            peripheral.write(&target, data, write_type),
        )
        .await
    }

    async fn disconnect(&self, token: &ConnectionToken) -> Result<(), BleError> {
        let link = lock_links(&self.links).remove(&token.id);
        let Some(mut link) = link else {
            return Ok(());
        };
        link.abort_forwarders();
        link.peripheral.disconnect().await?;
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}
