//! Request/response correlation
//!
//! Implements "write, then wait for the peripheral to notify a reply".
//! Every request owns a slot holding the sending half of a oneshot channel;
//! whichever of reply, timeout, cancel, link loss or write failure removes
//! the slot first decides the outcome, and later attempts find nothing to
//! resolve.
//!
//! Writes are only admitted for the link the correlator was last opened
//! for; `fail_all` closes it, so a request racing a link loss is refused
//! with `LinkLost` instead of being left to a dead write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::ble::transport::{BleAdapter, BleAddress, ConnectionToken, NotificationEvent};
use crate::ble::BleError;

/// Identifies a request among those of one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

type Outcome = Result<NotificationEvent, BleError>;

/// A characteristic write whose reply is awaited.
#[derive(Debug, Clone)]
pub struct OutgoingWrite {
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    pub expect_response: bool,
    /// Characteristic the reply is notified on.
    pub reply_characteristic: Uuid,
}

struct Slot {
    id: RequestId,
    characteristic: Uuid,
    reply: oneshot::Sender<Outcome>,
    done: Arc<Notify>,
}

/// Caller's half of an outstanding request.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    characteristic: Uuid,
    issued_at: Instant,
    timeout: Duration,
    outcome: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Characteristic the reply is expected on.
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn deadline(&self) -> Instant {
        self.issued_at + self.timeout
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> Result<NotificationEvent, BleError> {
        self.outcome.await.unwrap_or(Err(BleError::RequestCanceled))
    }
}

struct Pending {
    slots: VecDeque<Slot>,
    /// Link id that `send` accepts writes for.
    live_link: Option<u64>,
}

/// Pending requests of one peripheral, oldest first.
pub struct RequestCorrelator {
    address: BleAddress,
    /// At most one request outstanding at a time.
    strict: bool,
    next_id: AtomicU64,
    pending: Mutex<Pending>,
}

impl RequestCorrelator {
    pub fn new(address: BleAddress, strict: bool) -> Self {
        Self {
            address,
            strict,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Pending {
                slots: VecDeque::new(),
                live_link: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn pending_count(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.lock().slots.iter().any(|s| s.id == id)
    }

    /// Accept writes for link `link` until the next `fail_all`.
    pub fn open(&self, link: u64) {
        self.lock().live_link = Some(link);
    }

    /// Open a request expecting a reply on `characteristic` within
    /// `timeout`. The deadline is enforced by a watchdog task.
    pub fn register(
        self: &Arc<Self>,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<PendingRequest, BleError> {
        self.register_on(None, characteristic, timeout)
    }

    fn register_on(
        self: &Arc<Self>,
        link: Option<u64>,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<PendingRequest, BleError> {
        let (tx, rx) = oneshot::channel();
        let done = Arc::new(Notify::new());
        let issued_at = Instant::now();
        let id = {
            let mut pending = self.lock();
            if link.is_some() && pending.live_link != link {
                return Err(BleError::LinkLost);
            }
            if self.strict && !pending.slots.is_empty() {
                return Err(BleError::RequestInFlight);
            }
            let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
            pending.slots.push_back(Slot {
                id,
                characteristic,
                reply: tx,
                done: Arc::clone(&done),
            });
            id
        };

        let correlator = Arc::clone(self);
        let deadline = issued_at + timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if correlator.complete(id, Err(BleError::RequestTimeout)) {
                        log::debug!("Request {:?} to {} timed out", id, correlator.address);
                    }
                }
                _ = done.notified() => {}
            }
        });

        Ok(PendingRequest {
            id,
            characteristic,
            issued_at,
            timeout,
            outcome: rx,
        })
    }

    /// Register a request and issue its write. The write runs on its own
    /// task bounded by the request deadline, so a wedged adapter cannot
    /// hold the caller past the timeout. Fails with `LinkLost` unless the
    /// correlator is open for `token`'s link.
    pub fn send(
        self: &Arc<Self>,
        adapter: Arc<dyn BleAdapter>,
        token: ConnectionToken,
        write: OutgoingWrite,
        timeout: Duration,
    ) -> Result<PendingRequest, BleError> {
        let pending = self.register_on(Some(token.id), write.reply_characteristic, timeout)?;
        let id = pending.id();
        let deadline = pending.deadline();
        let correlator = Arc::clone(self);

        tokio::spawn(async move {
            let result = tokio::time::timeout_at(
                deadline,
                adapter.write(
                    &token,
                    write.characteristic,
                    &write.payload,
                    write.expect_response,
                ),
            )
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::warn!("Write to {} failed: {}", correlator.address, err);
                    correlator.complete(id, Err(err));
                }
                Err(_) => {
                    correlator.complete(id, Err(BleError::RequestTimeout));
                }
            }
        });

        Ok(pending)
    }

    /// Offer a notification to the pending requests. The oldest request
    /// waiting on the event's characteristic takes it; otherwise the event
    /// is handed back.
    pub fn offer(&self, event: NotificationEvent) -> Option<NotificationEvent> {
        let mut event = event;
        loop {
            let slot = {
                let mut pending = self.lock();
                match pending
                    .slots
                    .iter()
                    .position(|s| s.characteristic == event.characteristic)
                {
                    Some(pos) => pending.slots.remove(pos),
                    None => None,
                }
            };
            let Some(slot) = slot else {
                return Some(event);
            };
            slot.done.notify_one();
            match slot.reply.send(Ok(event)) {
                Ok(()) => return None,
                // The caller stopped waiting; try the next request.
                Err(Ok(returned)) => event = returned,
                Err(Err(_)) => return None,
            }
        }
    }

    /// Resolve request `id` with `outcome` if it is still pending.
    pub fn complete(&self, id: RequestId, outcome: Result<NotificationEvent, BleError>) -> bool {
        let slot = {
            let mut pending = self.lock();
            match pending.slots.iter().position(|s| s.id == id) {
                Some(pos) => pending.slots.remove(pos),
                None => None,
            }
        };
        match slot {
            Some(slot) => {
                slot.done.notify_one();
                let _ = slot.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Cancel request `id`. Returns false if it already finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.complete(id, Err(BleError::RequestCanceled))
    }

    /// Close the correlator and resolve every pending request with `err`.
    /// Returns how many there were.
    pub fn fail_all(&self, err: BleError) -> usize {
        let slots: Vec<Slot> = {
            let mut pending = self.lock();
            pending.live_link = None;
            pending.slots.drain(..).collect()
        };
        let count = slots.len();
        for slot in slots {
            slot.done.notify_one();
            let _ = slot.reply.send(Err(err.clone()));
        }
        if count > 0 {
            log::debug!("Failed {} pending requests to {}: {}", count, self.address, err);
        }
        count
    }
}
