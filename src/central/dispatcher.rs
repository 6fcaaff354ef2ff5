//! Notification dispatcher
//!
//! The adapter pushes value changes into a bounded queue from its own event
//! context; a per-peripheral task drains the queue, offers each event to the
//! request correlator and hands whatever is left to the handler registered
//! for that characteristic. When the queue is full the oldest event is
//! dropped and counted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::transport::{BleAddress, NotificationEvent, NotificationSink};
use crate::ble::BleError;

use super::correlator::RequestCorrelator;

/// Application callback for value changes nobody was waiting for. Runs on
/// the dispatch task.
pub type NotificationHandler = Arc<dyn Fn(NotificationEvent) + Send + Sync>;

/// Counters describing what happened to delivered events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events that resolved a pending request.
    pub matched_requests: u64,
    /// Events passed to a registered handler.
    pub handled: u64,
    /// Events with no request and no handler.
    pub unhandled: u64,
    /// Events discarded because the queue was full.
    pub dropped: u64,
}

struct QueueInner {
    events: VecDeque<NotificationEvent>,
    closed: bool,
}

/// Bounded single-consumer queue that never blocks the producer.
pub struct NotificationQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    ready: Notify,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue an event. If the queue is full the oldest event is evicted
    /// and returned. Events pushed after `close` are returned unqueued.
    pub fn push(&self, event: NotificationEvent) -> Option<NotificationEvent> {
        let evicted = {
            let mut inner = self.lock();
            if inner.closed {
                return Some(event);
            }
            let evicted = if inner.events.len() >= self.capacity {
                inner.events.pop_front()
            } else {
                None
            };
            inner.events.push_back(event);
            evicted
        };
        self.ready.notify_one();
        evicted
    }

    /// Next event in arrival order; `None` once closed and drained.
    pub async fn pop(&self) -> Option<NotificationEvent> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(event) = inner.events.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes one peripheral's notifications.
pub struct NotificationDispatcher {
    address: BleAddress,
    queue: NotificationQueue,
    handlers: RwLock<HashMap<Uuid, NotificationHandler>>,
    stats: Mutex<DispatchStats>,
    log_unhandled: bool,
}

impl NotificationDispatcher {
    pub fn new(address: BleAddress, capacity: usize, log_unhandled: bool) -> Arc<Self> {
        Arc::new(Self {
            address,
            queue: NotificationQueue::new(capacity),
            handlers: RwLock::new(HashMap::new()),
            stats: Mutex::new(DispatchStats::default()),
            log_unhandled,
        })
    }

    fn bump(&self, f: impl FnOnce(&mut DispatchStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }

    pub fn stats(&self) -> DispatchStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The callback handed to the adapter. Only enqueues.
    pub fn sink(self: &Arc<Self>) -> NotificationSink {
        let dispatcher = Arc::clone(self);
        Arc::new(move |event: NotificationEvent| dispatcher.enqueue(event))
    }

    /// Push an event as the adapter would.
    pub fn enqueue(&self, event: NotificationEvent) {
        if let Some(dropped) = self.queue.push(event) {
            self.bump(|s| s.dropped += 1);
            log::warn!(
                "NotificationDropped: {} queue full, discarded {} byte event on {}",
                self.address,
                dropped.payload.len(),
                dropped.characteristic
            );
        }
    }

    /// Register the handler for `characteristic`.
    pub fn set_handler(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), BleError> {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.contains_key(&characteristic) {
            return Err(BleError::AlreadySubscribed(characteristic));
        }
        handlers.insert(characteristic, handler);
        Ok(())
    }

    pub fn remove_handler(&self, characteristic: &Uuid) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(characteristic)
            .is_some()
    }

    pub fn clear_handlers(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Route one event: pending request first, then handler, then log.
    pub fn dispatch(&self, event: NotificationEvent, correlator: &RequestCorrelator) {
        let event = match correlator.offer(event) {
            None => {
                self.bump(|s| s.matched_requests += 1);
                return;
            }
            Some(unmatched) => unmatched,
        };

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&event.characteristic)
            .cloned();
        match handler {
            Some(handler) => {
                self.bump(|s| s.handled += 1);
                handler(event);
            }
            None => {
                self.bump(|s| s.unhandled += 1);
                if self.log_unhandled {
                    log::debug!(
                        "Notification from {} on {}: {}",
                        self.address,
                        event.characteristic,
                        String::from_utf8_lossy(&event.payload)
                    );
                }
            }
        }
    }

    /// Drain the queue until it is closed.
    pub async fn run(&self, correlator: Arc<RequestCorrelator>) {
        while let Some(event) = self.queue.pop().await {
            self.dispatch(event, &correlator);
        }
        log::debug!("Dispatcher for {} stopped", self.address);
    }

    pub fn spawn(self: &Arc<Self>, correlator: Arc<RequestCorrelator>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.run(correlator).await })
    }

    /// Stop the dispatch task once the queued events are delivered.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
