//! GattClient: the application-facing central
//!
//! Owns the host adapter for its lifetime and one session per peripheral.
//! A session bundles the peripheral's connection state machine, request
//! correlator and notification dispatcher; sessions never share locks, so
//! peripherals proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::transport::{
    BleAdapter, BleAddress, ConnectionToken, LinkEvent, PeripheralHandle,
    SubscriptionDescriptor, SubscriptionId,
};
use crate::ble::BleError;
use crate::config::ClientConfig;

use super::correlator::{OutgoingWrite, PendingRequest, RequestCorrelator, RequestId};
use super::dispatcher::{DispatchStats, NotificationDispatcher, NotificationHandler};
use super::scan_registry;
use super::state_machine::{ConnectParams, ConnectionState, ConnectionStateMachine};

struct PeripheralSession {
    machine: ConnectionStateMachine,
    correlator: Arc<RequestCorrelator>,
    dispatcher: Arc<NotificationDispatcher>,
    dispatch_task: JoinHandle<()>,
}

impl PeripheralSession {
    fn new(peripheral: PeripheralHandle, config: &ClientConfig) -> Self {
        let address = peripheral.address.clone();
        let correlator = Arc::new(RequestCorrelator::new(
            address.clone(),
            config.strict_ordering,
        ));
        let dispatcher = NotificationDispatcher::new(
            address,
            config.notification_queue_capacity,
            config.log_notifications,
        );
        let dispatch_task = dispatcher.spawn(Arc::clone(&correlator));
        Self {
            machine: ConnectionStateMachine::new(peripheral),
            correlator,
            dispatcher,
            dispatch_task,
        }
    }

    /// Everything that depended on the link is gone.
    fn link_down(&self) {
        let failed = self.correlator.fail_all(BleError::LinkLost);
        self.dispatcher.clear_handlers();
        if failed > 0 {
            log::warn!(
                "{} pending requests to {} failed with LinkLost",
                failed,
                self.machine.peripheral().address
            );
        }
    }

    fn close(&self) {
        self.dispatcher.close();
    }
}

struct ClientShared {
    adapter: Arc<dyn BleAdapter>,
    config: ClientConfig,
    sessions: RwLock<HashMap<BleAddress, Arc<PeripheralSession>>>,
    stopped: AtomicBool,
}

impl ClientShared {
    fn session(&self, address: &BleAddress) -> Option<Arc<PeripheralSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(address)
            .cloned()
    }

    fn session_for(&self, peripheral: &PeripheralHandle) -> Arc<PeripheralSession> {
        if let Some(session) = self.session(&peripheral.address) {
            return session;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            sessions
                .entry(peripheral.address.clone())
                .or_insert_with(|| Arc::new(PeripheralSession::new(peripheral.clone(), &self.config))),
        )
    }

    fn all_sessions(&self) -> Vec<Arc<PeripheralSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    async fn handle_link_lost(&self, address: &BleAddress) {
        let Some(session) = self.session(address) else {
            return;
        };
        if session.machine.on_link_lost().await {
            session.link_down();
        }
    }
}

/// BLE central client.
pub struct GattClient {
    shared: Arc<ClientShared>,
    link_watcher: JoinHandle<()>,
}

impl GattClient {
    /// Acquire the adapter and start watching its link events. The adapter
    /// is released by [`GattClient::shutdown`], or on drop.
    pub async fn start(
        adapter: Arc<dyn BleAdapter>,
        config: ClientConfig,
    ) -> Result<Self, BleError> {
        config.validate()?;
        let events = adapter.link_events();
        adapter.start().await?;
        log::info!("BLE adapter started");

        let shared = Arc::new(ClientShared {
            adapter,
            config,
            sessions: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });
        let link_watcher = spawn_link_watcher(Arc::downgrade(&shared), events);
        Ok(Self {
            shared,
            link_watcher,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Scan for `duration`; each peripheral appears once.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<PeripheralHandle>, BleError> {
        log::info!("Scanning for BLE devices for {:?}", duration);
        scan_registry::scan(self.shared.adapter.as_ref(), duration).await
    }

    /// Connect and subscribe to the configured characteristics. Returns
    /// once the peripheral is Ready.
    pub async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        timeout: Duration,
    ) -> Result<ConnectionToken, BleError> {
        let session = self.shared.session_for(peripheral);
        let params = ConnectParams {
            address_type: self.shared.config.address_type,
            timeout,
            subscriptions: self.shared.config.required_subscriptions(),
            subscribe_attempts: self.shared.config.subscribe_attempts,
        };
        let token = session
            .machine
            .connect(
                self.shared.adapter.as_ref(),
                &params,
                session.dispatcher.sink(),
            )
            .await?;
        session.correlator.open(token.id);
        Ok(token)
    }

    fn ready_session(&self, token: &ConnectionToken) -> Result<Arc<PeripheralSession>, BleError> {
        self.shared
            .session(&token.address)
            .ok_or(BleError::NotConnected)
    }

    /// Route notifications on `characteristic` to `handler`.
    pub async fn subscribe(
        &self,
        token: &ConnectionToken,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<SubscriptionId, BleError> {
        self.subscribe_with(token, SubscriptionDescriptor::notify(characteristic), handler)
            .await
    }

    /// Like [`GattClient::subscribe`] with full control over the descriptor.
    pub async fn subscribe_with(
        &self,
        token: &ConnectionToken,
        descriptor: SubscriptionDescriptor,
        handler: NotificationHandler,
    ) -> Result<SubscriptionId, BleError> {
        let session = self.ready_session(token)?;
        session.machine.check_ready(token).await?;
        session
            .dispatcher
            .set_handler(descriptor.characteristic, handler)?;

        let result = session
            .machine
            .subscribe_extra(
                self.shared.adapter.as_ref(),
                token,
                &descriptor,
                session.dispatcher.sink(),
            )
            .await;
        if result.is_err() {
            session.dispatcher.remove_handler(&descriptor.characteristic);
        }
        result
    }

    /// Remove the handler for `characteristic`. Characteristics the client
    /// subscribes to on connect stay subscribed.
    pub async fn unsubscribe(
        &self,
        token: &ConnectionToken,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        let session = self.ready_session(token)?;
        session.dispatcher.remove_handler(&characteristic);
        let required = self
            .shared
            .config
            .required_subscriptions()
            .iter()
            .any(|d| d.characteristic == characteristic);
        if !required {
            session
                .machine
                .unsubscribe(self.shared.adapter.as_ref(), token, &characteristic)
                .await?;
        }
        Ok(())
    }

    /// Write `data` and return the payload of the reply notification.
    pub async fn send(
        &self,
        token: &ConnectionToken,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, BleError> {
        let pending = self.begin_send(token, data, timeout).await?;
        pending.outcome().await.map(|event| event.payload)
    }

    /// Write `data` and return the pending reply without waiting for it.
    pub async fn begin_send(
        &self,
        token: &ConnectionToken,
        data: &[u8],
        timeout: Duration,
    ) -> Result<PendingRequest, BleError> {
        let session = self.ready_session(token)?;
        session.machine.check_ready(token).await?;
        let config = &self.shared.config;
        let write = OutgoingWrite {
            characteristic: config.write_characteristic,
            payload: data.to_vec(),
            expect_response: config.write_with_response,
            reply_characteristic: config.reply_characteristic,
        };
        session.correlator.send(
            Arc::clone(&self.shared.adapter),
            token.clone(),
            write,
            timeout,
        )
    }

    /// Cancel an in-flight request. Returns false if it already finished.
    pub fn cancel(&self, token: &ConnectionToken, request: RequestId) -> bool {
        match self.shared.session(&token.address) {
            Some(session) => session.correlator.cancel(request),
            None => false,
        }
    }

    /// Close the link `token` refers to. A stale token leaves a newer link
    /// to the same peripheral alone, including one still connecting.
    pub async fn disconnect(&self, token: &ConnectionToken) -> Result<(), BleError> {
        let session = self.ready_session(token)?;
        match session.machine.token().await {
            Some(current) if current == *token => self.disconnect_session(&session).await,
            _ => Err(BleError::NotConnected),
        }
    }

    /// Disconnect from `address` whatever its state, including aborting a
    /// connect that is still in progress.
    pub async fn disconnect_peripheral(&self, address: &BleAddress) -> Result<(), BleError> {
        match self.shared.session(address) {
            Some(session) => self.disconnect_session(&session).await,
            None => Ok(()),
        }
    }

    async fn disconnect_session(&self, session: &PeripheralSession) -> Result<(), BleError> {
        let result = session
            .machine
            .disconnect(self.shared.adapter.as_ref())
            .await;
        session.link_down();
        result
    }

    pub fn state(&self, address: &BleAddress) -> ConnectionState {
        self.shared
            .session(address)
            .map_or(ConnectionState::Disconnected, |s| s.machine.state())
    }

    pub fn watch_state(&self, address: &BleAddress) -> Option<watch::Receiver<ConnectionState>> {
        self.shared.session(address).map(|s| s.machine.watch())
    }

    pub fn is_connected(&self, address: &BleAddress) -> bool {
        self.state(address) == ConnectionState::Ready
    }

    pub fn dispatch_stats(&self, address: &BleAddress) -> Option<DispatchStats> {
        self.shared.session(address).map(|s| s.dispatcher.stats())
    }

    /// Disconnect everything and release the adapter.
    pub async fn shutdown(self) -> Result<(), BleError> {
        for session in self.shared.all_sessions() {
            if let Err(e) = self.disconnect_session(&session).await {
                log::warn!(
                    "Disconnect from {} during shutdown failed: {}",
                    session.machine.peripheral().address,
                    e
                );
            }
            session.close();
        }
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.adapter.stop().await?;
        log::info!("BLE adapter stopped");
        Ok(())
    }
}

impl Drop for GattClient {
    fn drop(&mut self) {
        self.link_watcher.abort();
        for session in self.shared.all_sessions() {
            session.close();
            session.dispatch_task.abort();
        }
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let adapter = Arc::clone(&self.shared.adapter);
                handle.spawn(async move {
                    if let Err(e) = adapter.stop().await {
                        log::warn!("Stopping BLE adapter on drop failed: {}", e);
                    }
                });
            }
            Err(_) => log::warn!("GattClient dropped outside a runtime; adapter left running"),
        }
    }
}

fn spawn_link_watcher(
    shared: Weak<ClientShared>,
    mut events: tokio::sync::broadcast::Receiver<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LinkEvent::Disconnected(address)) => {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    shared.handle_link_lost(&address).await;
                }
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Link watcher missed {} adapter events", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ble::gatt::{DEFAULT_REPLY_CHARACTERISTIC, HEART_RATE_MEASUREMENT};
    use crate::ble::simulated::{SimBleAdapter, SimPeripheral, SimReply};
    use crate::ble::transport::NotificationEvent;

    fn addr(last: u8) -> BleAddress {
        BleAddress::Mac([0x0F, 0x1D, 0, 0, 0, last])
    }

    async fn client_with(scripts: Vec<SimPeripheral>) -> (Arc<SimBleAdapter>, GattClient) {
        let adapter = SimBleAdapter::new();
        for script in scripts {
            adapter.add_peripheral(script);
        }
        let client = GattClient::start(adapter.clone(), ClientConfig::default())
            .await
            .unwrap();
        (adapter, client)
    }

    async fn connect(client: &GattClient, last: u8) -> ConnectionToken {
        let handle = PeripheralHandle::new(addr(last), Default::default());
        client.connect(&handle, Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_start_propagates_radio_unavailable() {
        let adapter = SimBleAdapter::new();
        adapter.set_radio_available(false);
        let result = GattClient::start(adapter, ClientConfig::default()).await;
        assert!(matches!(result, Err(BleError::RadioUnavailable(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let adapter = SimBleAdapter::new();
        let config = ClientConfig {
            notification_queue_capacity: 0,
            ..ClientConfig::default()
        };
        let result = GattClient::start(adapter.clone(), config).await;
        assert!(matches!(result, Err(BleError::InvalidConfig(_))));
        assert!(!adapter.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_send_in_flight_rejected() {
        let (adapter, client) = client_with(vec![SimPeripheral::new(addr(1))]).await;
        adapter.set_responder(&addr(1), |data| {
            Some(SimReply::after(Duration::from_millis(300), data.to_vec()))
        });
        let token = connect(&client, 1).await;

        let first = client
            .begin_send(&token, b"one", Duration::from_secs(1))
            .await
            .unwrap();
        let second = client.send(&token, b"two", Duration::from_secs(1)).await;
        assert_eq!(second, Err(BleError::RequestInFlight));

        // The first request still gets its own reply, and only its write
        // ever reached the peripheral
        assert_eq!(first.outcome().await.unwrap().payload, b"one");
        assert_eq!(adapter.writes(&addr(1)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_surfaces_unmodified() {
        let (adapter, client) = client_with(vec![SimPeripheral::new(addr(1))]).await;
        adapter.set_responder(&addr(1), |data| {
            Some(SimReply::after(Duration::from_millis(20), data.to_vec()))
        });
        let token = connect(&client, 1).await;

        let refused = BleError::GattError("write not permitted".into());
        adapter.set_write_error(&addr(1), Some(refused.clone()));
        let result = client.send(&token, b"x", Duration::from_secs(1)).await;
        assert_eq!(result, Err(refused));

        // The failed request no longer holds the strict-mode slot
        adapter.set_write_error(&addr(1), None);
        let reply = client
            .send(&token, b"y", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"y");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_cannot_abort_reconnect() {
        let adapter = SimBleAdapter::new();
        adapter.add_peripheral(
            SimPeripheral::new(addr(1)).with_connect_latency(Duration::from_millis(500)),
        );
        let client = Arc::new(
            GattClient::start(adapter.clone(), ClientConfig::default())
                .await
                .unwrap(),
        );
        let old = connect(&client, 1).await;
        client.disconnect(&old).await.unwrap();

        let reconnecting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { connect(&client, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(&addr(1)), ConnectionState::Connecting);

        assert_eq!(client.disconnect(&old).await, Err(BleError::NotConnected));
        let fresh = reconnecting.await.unwrap();
        assert_ne!(fresh, old);
        assert_eq!(client.state(&addr(1)), ConnectionState::Ready);
        assert!(adapter.is_linked(&addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_notification_reaches_handler() {
        let (adapter, client) = client_with(vec![SimPeripheral::new(addr(1))
            .with_characteristics(vec![DEFAULT_REPLY_CHARACTERISTIC, HEART_RATE_MEASUREMENT])])
        .await;
        adapter.set_responder(&addr(1), |_| {
            Some(SimReply::after(Duration::from_millis(200), b"ack".to_vec()))
        });
        let token = connect(&client, 1).await;

        let seen: Arc<Mutex<Vec<NotificationEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        client
            .subscribe(
                &token,
                HEART_RATE_MEASUREMENT,
                Arc::new(move |e: NotificationEvent| seen_clone.lock().unwrap().push(e)),
            )
            .await
            .unwrap();

        let pending = client
            .begin_send(&token, b"req", Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(adapter.notify(&addr(1), HEART_RATE_MEASUREMENT, &[72]));

        assert_eq!(pending.outcome().await.unwrap().payload, b"ack");
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].payload, vec![72]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_goes_to_handler() {
        let (adapter, client) = client_with(vec![SimPeripheral::new(addr(1))]).await;
        adapter.set_responder(&addr(1), |_| {
            Some(SimReply::after(Duration::from_millis(1500), b"late".to_vec()))
        });
        let token = connect(&client, 1).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client
            .subscribe(
                &token,
                DEFAULT_REPLY_CHARACTERISTIC,
                Arc::new(move |e: NotificationEvent| {
                    let _ = tx.send(e);
                }),
            )
            .await
            .unwrap();

        let result = client.send(&token, b"slow", Duration::from_secs(1)).await;
        assert_eq!(result, Err(BleError::RequestTimeout));

        let late = rx.recv().await.unwrap();
        assert_eq!(late.payload, b"late");
        let stats = client.dispatch_stats(&addr(1)).unwrap();
        assert_eq!(stats.matched_requests, 0);
        assert_eq!(stats.handled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_still_times_out() {
        let (adapter, client) = client_with(vec![SimPeripheral::new(addr(1))]).await;
        adapter.set_stall_writes(&addr(1), true);
        let token = connect(&client, 1).await;

        let started = tokio::time::Instant::now();
        let result = client.send(&token, b"x", Duration::from_secs(1)).await;
        assert_eq!(result, Err(BleError::RequestTimeout));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight_request() {
        let (_adapter, client) = client_with(vec![SimPeripheral::new(addr(1))]).await;
        let token = connect(&client, 1).await;

        let pending = client
            .begin_send(&token, b"x", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(client.cancel(&token, pending.id()));
        assert!(!client.cancel(&token, pending.id()));
        assert_eq!(pending.outcome().await, Err(BleError::RequestCanceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_fails_pending_and_disconnects() {
        let config = ClientConfig {
            strict_ordering: false,
            ..ClientConfig::default()
        };
        let adapter = SimBleAdapter::new();
        adapter.add_peripheral(SimPeripheral::new(addr(1)));
        let client = GattClient::start(adapter.clone(), config).await.unwrap();
        let token = connect(&client, 1).await;

        let mut pending = Vec::new();
        for i in 0..3u8 {
            pending.push(
                client
                    .begin_send(&token, &[i], Duration::from_secs(5))
                    .await
                    .unwrap(),
            );
        }

        adapter.drop_link(&addr(1));
        for request in pending {
            assert_eq!(request.outcome().await, Err(BleError::LinkLost));
        }
        assert_eq!(client.state(&addr(1)), ConnectionState::Disconnected);
        assert!(!client.is_connected(&addr(1)));

        // The old token is dead; a fresh connect works
        let result = client.send(&token, b"x", Duration::from_secs(1)).await;
        assert_eq!(result, Err(BleError::NotConnected));
        connect(&client, 1).await;
        assert!(client.is_connected(&addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripherals_are_independent() {
        let (adapter, client) =
            client_with(vec![SimPeripheral::new(addr(1)), SimPeripheral::new(addr(2))]).await;
        adapter.set_responder(&addr(2), |_| {
            Some(SimReply::after(Duration::from_millis(10), b"two".to_vec()))
        });
        adapter.set_stall_writes(&addr(1), true);
        let token_1 = connect(&client, 1).await;
        let token_2 = connect(&client, 2).await;

        let stuck = client
            .begin_send(&token_1, b"x", Duration::from_secs(10))
            .await
            .unwrap();
        let reply = client
            .send(&token_2, b"y", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"two");

        adapter.drop_link(&addr(1));
        assert_eq!(stuck.outcome().await, Err(BleError::LinkLost));
        assert!(client.is_connected(&addr(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_cannot_disconnect_new_link() {
        let (adapter, client) = client_with(vec![SimPeripheral::new(addr(1))]).await;
        let old = connect(&client, 1).await;
        client.disconnect(&old).await.unwrap();
        let fresh = connect(&client, 1).await;

        assert_eq!(client.disconnect(&old).await, Err(BleError::NotConnected));
        assert!(adapter.is_linked(&addr(1)));
        client.disconnect(&fresh).await.unwrap();
        assert!(!adapter.is_linked(&addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_adapter() {
        let (adapter, client) = client_with(vec![SimPeripheral::new(addr(1))]).await;
        connect(&client, 1).await;
        client.shutdown().await.unwrap();
        assert!(!adapter.is_linked(&addr(1)));
        assert!(!adapter.is_started());
        assert_eq!(adapter.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_adapter() {
        let (adapter, client) = client_with(vec![SimPeripheral::new(addr(1))]).await;
        drop(client);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!adapter.is_started());
    }
}
