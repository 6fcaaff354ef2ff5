//! Per-peripheral connection state machine
//!
//! Drives a peripheral from Disconnected through Connecting, Connected and
//! Subscribing to Ready. Transitions are serialized by one lock per
//! peripheral; adapter calls are awaited outside it and a generation counter
//! tells a finishing adapter call whether a disconnect or link loss has
//! overtaken it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::ble::transport::{
    AddressType, BleAdapter, ConnectionToken, NotificationSink, PeripheralHandle,
    SubscriptionDescriptor, SubscriptionId,
};
use crate::ble::BleError;

/// Lifecycle state of one peripheral connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    SubscribingFailed,
    Ready,
    Failed,
}

impl ConnectionState {
    /// Disconnected and Failed wait for an explicit connect.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// Whether a link to the peripheral is (or may be) up.
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Subscribing
                | ConnectionState::SubscribingFailed
                | ConnectionState::Ready
        )
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            // explicit disconnect is always allowed
            (_, Disconnected) => true,
            (Disconnected | Failed, Connecting) => true,
            (Connecting, Connected | Failed) => true,
            (Connected | SubscribingFailed, Subscribing) => true,
            (Subscribing, Ready | SubscribingFailed | Failed) => true,
            (SubscribingFailed, Failed) => true,
            _ => false,
        }
    }
}

/// Parameters of one connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub address_type: AddressType,
    pub timeout: Duration,
    /// Subscriptions that must all succeed before Ready.
    pub subscriptions: Vec<SubscriptionDescriptor>,
    pub subscribe_attempts: u32,
}

struct MachineInner {
    state: ConnectionState,
    generation: u64,
    /// Why the last generation bump happened.
    abort_reason: BleError,
    token: Option<ConnectionToken>,
    subscriptions: HashMap<Uuid, SubscriptionId>,
}

/// Owns the [`ConnectionState`] of one peripheral.
pub struct ConnectionStateMachine {
    peripheral: PeripheralHandle,
    inner: Mutex<MachineInner>,
    state_tx: watch::Sender<ConnectionState>,
    generation_tx: watch::Sender<u64>,
}

impl ConnectionStateMachine {
    pub fn new(peripheral: PeripheralHandle) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (generation_tx, _) = watch::channel(0);
        Self {
            peripheral,
            inner: Mutex::new(MachineInner {
                state: ConnectionState::Disconnected,
                generation: 0,
                abort_reason: BleError::Canceled,
                token: None,
                subscriptions: HashMap::new(),
            }),
            state_tx,
            generation_tx,
        }
    }

    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.peripheral
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The token of the current link, if one is up.
    pub async fn token(&self) -> Option<ConnectionToken> {
        self.inner.lock().await.token.clone()
    }

    /// Fail with `NotConnected` unless `token` is the current link and the
    /// machine is Ready.
    pub async fn check_ready(&self, token: &ConnectionToken) -> Result<(), BleError> {
        let inner = self.inner.lock().await;
        if inner.token.as_ref() != Some(token) {
            return Err(BleError::NotConnected);
        }
        if inner.state != ConnectionState::Ready {
            return Err(BleError::InvalidState(inner.state));
        }
        Ok(())
    }

    pub async fn is_subscribed(&self, characteristic: &Uuid) -> bool {
        self.inner
            .lock()
            .await
            .subscriptions
            .contains_key(characteristic)
    }

    fn transition(
        &self,
        inner: &mut MachineInner,
        next: ConnectionState,
    ) -> Result<(), BleError> {
        if !inner.state.can_transition_to(next) {
            return Err(BleError::InvalidState(inner.state));
        }
        if inner.state != next {
            log::debug!("{}: {:?} -> {:?}", self.peripheral.address, inner.state, next);
        }
        inner.state = next;
        self.state_tx.send_replace(next);
        Ok(())
    }

    fn bump_generation(&self, inner: &mut MachineInner, reason: BleError) {
        inner.generation += 1;
        inner.abort_reason = reason;
        self.generation_tx.send_replace(inner.generation);
    }

    /// Resolves once the machine has moved past `generation`.
    async fn superseded(&self, generation: u64) {
        let mut rx = self.generation_tx.subscribe();
        loop {
            if *rx.borrow_and_update() != generation {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Transition, provided nothing has overtaken `generation`.
    async fn advance(&self, generation: u64, next: ConnectionState) -> Result<(), BleError> {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Err(inner.abort_reason.clone());
        }
        self.transition(&mut inner, next)
    }

    /// Bring the link up and subscribe to every required characteristic.
    /// `sink` receives values from all of them.
    pub async fn connect(
        &self,
        adapter: &dyn BleAdapter,
        params: &ConnectParams,
        sink: NotificationSink,
    ) -> Result<ConnectionToken, BleError> {
        let generation = {
            let mut inner = self.inner.lock().await;
            self.transition(&mut inner, ConnectionState::Connecting)?;
            self.bump_generation(&mut inner, BleError::Canceled);
            inner.generation
        };

        log::info!(
            "Connecting to {} ({:?}, timeout {:?})",
            self.peripheral.address,
            params.address_type,
            params.timeout
        );
        let attempt = tokio::time::timeout(
            params.timeout,
            adapter.connect(&self.peripheral, params.address_type, params.timeout),
        );
        let result = tokio::select! {
            r = attempt => r.unwrap_or(Err(BleError::ConnectionTimeout)),
            _ = self.superseded(generation) => Err(BleError::Canceled),
        };

        let token = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                let reason = inner.abort_reason.clone();
                drop(inner);
                if let Ok(token) = result {
                    let _ = adapter.disconnect(&token).await;
                }
                log::debug!("Connect to {} overtaken: {}", self.peripheral.address, reason);
                return Err(reason);
            }
            match result {
                Ok(token) => {
                    inner.token = Some(token.clone());
                    self.transition(&mut inner, ConnectionState::Connected)?;
                    token
                }
                Err(err) => {
                    self.transition(&mut inner, ConnectionState::Failed)?;
                    log::warn!("Connect to {} failed: {}", self.peripheral.address, err);
                    return Err(err);
                }
            }
        };

        self.subscribe_required(adapter, params, &sink, generation, &token)
            .await?;
        log::info!("{} ready", self.peripheral.address);
        Ok(token)
    }

    async fn subscribe_required(
        &self,
        adapter: &dyn BleAdapter,
        params: &ConnectParams,
        sink: &NotificationSink,
        generation: u64,
        token: &ConnectionToken,
    ) -> Result<(), BleError> {
        let attempts = params.subscribe_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.advance(generation, ConnectionState::Subscribing).await?;

            let err = match self
                .subscribe_missing(adapter, &params.subscriptions, sink, generation, token)
                .await
            {
                Ok(()) => return self.advance(generation, ConnectionState::Ready).await,
                Err(err) => err,
            };
            {
                let inner = self.inner.lock().await;
                if inner.generation != generation {
                    return Err(inner.abort_reason.clone());
                }
            }

            if err.is_transient() {
                log::warn!(
                    "Subscribe attempt {}/{} on {} failed: {}",
                    attempt,
                    attempts,
                    self.peripheral.address,
                    err
                );
                self.advance(generation, ConnectionState::SubscribingFailed)
                    .await?;
                if attempt < attempts {
                    continue;
                }
            }
            self.fail(adapter, generation).await;
            return Err(err);
        }
    }

    async fn subscribe_missing(
        &self,
        adapter: &dyn BleAdapter,
        required: &[SubscriptionDescriptor],
        sink: &NotificationSink,
        generation: u64,
        token: &ConnectionToken,
    ) -> Result<(), BleError> {
        for descriptor in required {
            if self.is_subscribed(&descriptor.characteristic).await {
                continue;
            }
            let id = adapter
                .subscribe(token, descriptor, sink.clone())
                .await?;
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return Err(inner.abort_reason.clone());
            }
            inner.subscriptions.insert(descriptor.characteristic, id);
        }
        Ok(())
    }

    /// Move to Failed and release the link.
    async fn fail(&self, adapter: &dyn BleAdapter, generation: u64) {
        let (token, subscriptions) = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            if self.transition(&mut inner, ConnectionState::Failed).is_err() {
                return;
            }
            let subs: Vec<SubscriptionId> =
                inner.subscriptions.drain().map(|(_, id)| id).collect();
            (inner.token.take(), subs)
        };
        if let Some(token) = token {
            release_link(adapter, &token, subscriptions).await;
        }
    }

    /// Subscribe to one more characteristic on a Ready link. Returns the
    /// existing id if the characteristic is already subscribed.
    pub async fn subscribe_extra(
        &self,
        adapter: &dyn BleAdapter,
        token: &ConnectionToken,
        descriptor: &SubscriptionDescriptor,
        sink: NotificationSink,
    ) -> Result<SubscriptionId, BleError> {
        let generation = {
            let inner = self.inner.lock().await;
            if inner.token.as_ref() != Some(token) {
                return Err(BleError::NotConnected);
            }
            if inner.state != ConnectionState::Ready {
                return Err(BleError::InvalidState(inner.state));
            }
            if let Some(id) = inner.subscriptions.get(&descriptor.characteristic) {
                return Ok(*id);
            }
            inner.generation
        };

        let id = adapter.subscribe(token, descriptor, sink).await?;
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Err(inner.abort_reason.clone());
        }
        // A concurrent subscribe may have won; keep the first and drop ours.
        if let Some(existing) = inner.subscriptions.get(&descriptor.characteristic) {
            let existing = *existing;
            drop(inner);
            let _ = adapter.unsubscribe(token, id).await;
            return Ok(existing);
        }
        inner.subscriptions.insert(descriptor.characteristic, id);
        Ok(id)
    }

    /// Drop the subscription on `characteristic`, if any.
    pub async fn unsubscribe(
        &self,
        adapter: &dyn BleAdapter,
        token: &ConnectionToken,
        characteristic: &Uuid,
    ) -> Result<bool, BleError> {
        let id = {
            let mut inner = self.inner.lock().await;
            if inner.token.as_ref() != Some(token) {
                return Err(BleError::NotConnected);
            }
            match inner.subscriptions.remove(characteristic) {
                Some(id) => id,
                None => return Ok(false),
            }
        };
        adapter.unsubscribe(token, id).await?;
        Ok(true)
    }

    /// Explicit disconnect, valid from any state. Any in-flight connect is
    /// abandoned and fails with `Canceled`.
    pub async fn disconnect(&self, adapter: &dyn BleAdapter) -> Result<(), BleError> {
        let (token, subscriptions) = {
            let mut inner = self.inner.lock().await;
            self.bump_generation(&mut inner, BleError::Canceled);
            self.transition(&mut inner, ConnectionState::Disconnected)?;
            let subs: Vec<SubscriptionId> =
                inner.subscriptions.drain().map(|(_, id)| id).collect();
            (inner.token.take(), subs)
        };
        if let Some(token) = token {
            log::info!("Disconnecting from {}", self.peripheral.address);
            release_link(adapter, &token, subscriptions).await;
        }
        Ok(())
    }

    /// The adapter reported the link gone. Returns true if a live link was
    /// torn down by this call.
    pub async fn on_link_lost(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.state.has_link() {
            return false;
        }
        log::warn!("Link to {} lost in state {:?}", self.peripheral.address, inner.state);
        self.bump_generation(&mut inner, BleError::LinkLost);
        inner.token = None;
        inner.subscriptions.clear();
        self.transition(&mut inner, ConnectionState::Disconnected)
            .is_ok()
    }
}

async fn release_link(
    adapter: &dyn BleAdapter,
    token: &ConnectionToken,
    subscriptions: Vec<SubscriptionId>,
) {
    for id in subscriptions {
        if let Err(e) = adapter.unsubscribe(token, id).await {
            log::debug!("Unsubscribe {:?} on {} failed: {}", id, token.address, e);
        }
    }
    if let Err(e) = adapter.disconnect(token).await {
        log::warn!("Disconnect from {} failed: {}", token.address, e);
    }
}
