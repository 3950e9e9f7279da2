//! Krill Events - Publish/Subscribe Hub
//!
//! Single-process fan-out from publishers to N independent subscriber queues.
//!
//! # Queue policy
//!
//! Every subscriber owns a bounded queue. `publish` uses `try_send` and
//! **drops the new event** for any subscriber whose queue is full - the
//! publisher never blocks, so a slow observer can never stall an agent
//! worker. Dropped events are counted per subscription.
//!
//! # Shutdown contract
//!
//! `close()` is idempotent. It marks the bus closed and drops every
//! subscriber sender, so any consumer blocked in `Subscription::recv`
//! immediately observes `None`. Callers MUST close the bus before asking a
//! component that blocks on `recv` to terminate; the reverse order deadlocks
//! that component's shutdown against its own blocking read.

use krill_core::{BusError, KrillError, KrillResult, SwarmEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// A subscriber's receiving end of the bus.
pub struct Subscription {
    receiver: mpsc::Receiver<SwarmEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the bus is closed and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<SwarmEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<SwarmEvent> {
        self.receiver.try_recv().ok()
    }

    /// Number of events dropped for this subscriber because its queue was
    /// full at publish time.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

struct SubscriberHandle {
    sender: mpsc::Sender<SwarmEvent>,
    dropped: Arc<AtomicU64>,
}

/// In-process publish/subscribe hub with bounded subscriber queues.
pub struct EventBus {
    subscribers: Mutex<Vec<SubscriberHandle>>,
    closed: AtomicBool,
    queue_capacity: usize,
}

impl EventBus {
    /// Create a new open bus. `queue_capacity` bounds every subscriber queue.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new subscriber and return its queue.
    pub fn subscribe(&self) -> KrillResult<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KrillError::Bus(BusError::Closed));
        }
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("event bus subscriber list poisoned");
        subscribers.push(SubscriberHandle {
            sender,
            dropped: Arc::clone(&dropped),
        });
        Ok(Subscription { receiver, dropped })
    }

    /// Fan an event out to every live subscriber.
    ///
    /// Never blocks: a full subscriber queue drops this event for that
    /// subscriber (drop-new policy) and bumps its drop counter. Subscribers
    /// whose receiving end has gone away are pruned.
    pub fn publish(&self, event: &SwarmEvent) -> KrillResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KrillError::Bus(BusError::Closed));
        }
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("event bus subscriber list poisoned");
        subscribers.retain(|handle| match handle.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                handle.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    /// Close the bus. Idempotent.
    ///
    /// Drops every subscriber sender so blocked `recv` calls observe `None`
    /// immediately. Subsequent `subscribe`/`publish` calls fail with
    /// [`BusError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("event bus subscriber list poisoned");
        subscribers.clear();
    }

    /// Whether the bus has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus subscriber list poisoned")
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.is_closed())
            .field("subscribers", &self.subscriber_count())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
