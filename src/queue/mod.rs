//! Per-tenant outbound operation queue.
//!
//! [`RequestQueue`] buffers operations while the link is down or the
//! backend is saturated. Each identity gets an independent bounded queue:
//!
//! - **Ordering** — higher priority first, then oldest enqueue (stable FIFO
//!   within a priority band).
//! - **Backpressure** — crossing the fill threshold emits one advisory
//!   event per edge; enqueue at capacity rejects, it never blocks.
//! - **Durability** — High-priority operations are mirrored to the durable
//!   store on enqueue and cleared on dequeue; [`RequestQueue::restore_persisted`]
//!   merges surviving mirrors back in after a restart, de-duplicated by id.
//! - **Expiry** — operations past their deadline are dropped and reported,
//!   never dispatched.
//!
//! ## Concurrency
//!
//! The identity map is behind an `RwLock`; each tenant queue sits behind its
//! own mutex, so enqueue/dequeue for different identities never contend.
//! Capacity, backpressure, and ordering checks all happen inside one
//! critical section per identity.

pub mod store;

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TunnelError;
use crate::metrics;
use crate::tunnel::frame::b64;
use crate::util::now_ms;
use store::OperationStore;

/// Dispatch priority. Declaration order matters: later variants order
/// greater, so `High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// One unit of forwarded work. Created by the caller, owned by the queue
/// until dispatched, then handed to the dispatch path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub identity: String,
    pub priority: Priority,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
    /// Epoch ms after which the operation must not be dispatched.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    pub enqueued_ms: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Operation {
    pub fn new(
        identity: impl Into<String>,
        priority: Priority,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        timeout_ms: u64,
        deadline_ms: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity: identity.into(),
            priority,
            payload,
            headers,
            timeout_ms,
            deadline_ms,
            enqueued_ms: now_ms(),
            retries: 0,
            correlation_id: None,
        }
    }

    /// Whether the deadline has passed at `now` (epoch ms).
    pub fn is_expired(&self, now: u64) -> bool {
        self.deadline_ms.is_some_and(|d| now >= d)
    }
}

/// Heap entry: priority first, then earlier enqueue sequence.
struct QueueSlot {
    op: Operation,
    seq: u64,
}

impl PartialEq for QueueSlot {
    fn eq(&self, other: &Self) -> bool {
        self.op.priority == other.op.priority && self.seq == other.seq
    }
}
impl Eq for QueueSlot {}

impl PartialOrd for QueueSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, then the smaller sequence number.
        self.op
            .priority
            .cmp(&other.op.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Advisory events emitted by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Fill crossed the backpressure threshold (`should_throttle = true`) or
    /// dropped back under it (`should_throttle = false`).
    Backpressure {
        identity: String,
        fill: f64,
        should_throttle: bool,
    },
    /// An operation passed its deadline while queued and was dropped.
    Expired { identity: String, id: String },
}

/// State for one identity's queue.
struct TenantQueue {
    heap: BinaryHeap<QueueSlot>,
    next_seq: u64,
    throttled: bool,
}

impl TenantQueue {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            throttled: false,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.heap.iter().any(|slot| slot.op.id == id)
    }
}

/// Bounded priority queue per identity with durable High-priority mirrors.
pub struct RequestQueue {
    tenants: RwLock<HashMap<String, Arc<Mutex<TenantQueue>>>>,
    capacity: usize,
    backpressure_threshold: f64,
    store: Option<Arc<dyn OperationStore>>,
    events: broadcast::Sender<QueueEvent>,
}

impl RequestQueue {
    pub fn new(capacity: usize, backpressure_threshold: f64) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tenants: RwLock::new(HashMap::new()),
            capacity,
            backpressure_threshold,
            store: None,
            events,
        }
    }

    /// Attach a durable store for High-priority mirrors.
    pub fn with_store(mut self, store: Arc<dyn OperationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Subscribe to backpressure and expiry events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn tenant(&self, identity: &str) -> Arc<Mutex<TenantQueue>> {
        {
            let tenants = self.tenants.read().expect("queue map lock poisoned");
            if let Some(tenant) = tenants.get(identity) {
                return Arc::clone(tenant);
            }
        }
        let mut tenants = self.tenants.write().expect("queue map lock poisoned");
        Arc::clone(
            tenants
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TenantQueue::new()))),
        )
    }

    fn fill(&self, len: usize) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let fill = len as f64 / self.capacity.max(1) as f64;
        fill
    }

    /// Emit backpressure edges after a size change. Must be called with the
    /// tenant lock held so the check-and-flip is atomic.
    fn signal_backpressure(&self, identity: &str, tenant: &mut TenantQueue) {
        let fill = self.fill(tenant.heap.len());
        if !tenant.throttled && fill >= self.backpressure_threshold {
            tenant.throttled = true;
            debug!(identity, fill, "Queue backpressure threshold crossed");
            let _ = self.events.send(QueueEvent::Backpressure {
                identity: identity.to_string(),
                fill,
                should_throttle: true,
            });
        } else if tenant.throttled && fill < self.backpressure_threshold {
            tenant.throttled = false;
            let _ = self.events.send(QueueEvent::Backpressure {
                identity: identity.to_string(),
                fill,
                should_throttle: false,
            });
        }
    }

    /// Buffer an operation. Rejects at capacity; never blocks.
    pub fn enqueue(&self, op: Operation) -> Result<(), TunnelError> {
        if op.is_expired(now_ms()) {
            return Err(TunnelError::OperationExpired { id: op.id });
        }

        let identity = op.identity.clone();
        let tenant = self.tenant(&identity);
        let mut tenant = tenant.lock().expect("tenant queue lock poisoned");

        if tenant.heap.len() >= self.capacity {
            return Err(TunnelError::QueueFull {
                identity,
                capacity: self.capacity,
            });
        }

        // Mirror High-priority entries to disk before they become visible.
        if op.priority == Priority::High {
            if let Some(ref store) = self.store {
                if let Err(e) = store.append(&op) {
                    warn!(identity = %identity, op_id = %op.id, "Durable mirror failed: {e}");
                }
            }
        }

        let seq = tenant.next_seq;
        tenant.next_seq += 1;
        tenant.heap.push(QueueSlot { op, seq });

        metrics::record_queue_depth(&identity, tenant.heap.len());
        self.signal_backpressure(&identity, &mut tenant);
        Ok(())
    }

    /// Take the highest-priority, oldest-enqueued eligible operation.
    /// Expired entries encountered on the way are dropped and reported.
    pub fn dequeue(&self, identity: &str) -> Option<Operation> {
        let tenant = self.tenant(identity);
        let mut tenant = tenant.lock().expect("tenant queue lock poisoned");

        let now = now_ms();
        let mut dispatched = None;
        while let Some(slot) = tenant.heap.pop() {
            if slot.op.is_expired(now) {
                self.clear_mirror(&slot.op);
                metrics::record_operation_expired(identity);
                let _ = self.events.send(QueueEvent::Expired {
                    identity: identity.to_string(),
                    id: slot.op.id.clone(),
                });
                warn!(identity, op_id = %slot.op.id, "Dropped expired operation");
                continue;
            }
            self.clear_mirror(&slot.op);
            dispatched = Some(slot.op);
            break;
        }

        metrics::record_queue_depth(identity, tenant.heap.len());
        self.signal_backpressure(identity, &mut tenant);
        dispatched
    }

    fn clear_mirror(&self, op: &Operation) {
        if op.priority == Priority::High {
            if let Some(ref store) = self.store {
                if let Err(e) = store.remove(&op.id) {
                    warn!(op_id = %op.id, "Durable mirror removal failed: {e}");
                }
            }
        }
    }

    /// Reload mirrors left behind by a prior run and merge them into the
    /// live queue, de-duplicated by operation id. Entries that no longer
    /// fit stay in the store for the next cycle. Returns how many were
    /// admitted.
    pub fn restore_persisted(&self) -> Result<usize, TunnelError> {
        let Some(ref store) = self.store else {
            return Ok(0);
        };

        let now = now_ms();
        let mut restored = 0;
        for op in store.load()? {
            if op.is_expired(now) {
                let _ = store.remove(&op.id);
                let _ = self.events.send(QueueEvent::Expired {
                    identity: op.identity.clone(),
                    id: op.id,
                });
                continue;
            }

            let identity = op.identity.clone();
            let tenant = self.tenant(&identity);
            let mut tenant = tenant.lock().expect("tenant queue lock poisoned");
            if tenant.contains(&op.id) {
                continue;
            }
            if tenant.heap.len() >= self.capacity {
                warn!(identity = %identity, op_id = %op.id, "Restore deferred, queue at capacity");
                continue;
            }
            let seq = tenant.next_seq;
            tenant.next_seq += 1;
            tenant.heap.push(QueueSlot { op, seq });
            restored += 1;
            self.signal_backpressure(&identity, &mut tenant);
        }

        if restored > 0 {
            debug!(restored, "Restored persisted operations");
        }
        Ok(restored)
    }

    /// Current depth for one identity.
    pub fn depth(&self, identity: &str) -> usize {
        let tenants = self.tenants.read().expect("queue map lock poisoned");
        tenants
            .get(identity)
            .map_or(0, |t| t.lock().expect("tenant queue lock poisoned").heap.len())
    }

    /// Depth per identity, for metrics and diagnostics.
    pub fn depths(&self) -> HashMap<String, usize> {
        let tenants = self.tenants.read().expect("queue map lock poisoned");
        tenants
            .iter()
            .map(|(id, t)| {
                (
                    id.clone(),
                    t.lock().expect("tenant queue lock poisoned").heap.len(),
                )
            })
            .collect()
    }

    /// Identities with at least one buffered operation.
    pub fn identities_with_backlog(&self) -> Vec<String> {
        self.depths()
            .into_iter()
            .filter(|(_, depth)| *depth > 0)
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::store::JsonlStore;
    use super::*;

    fn op(identity: &str, priority: Priority) -> Operation {
        Operation::new(identity, priority, b"x".to_vec(), HashMap::new(), 1000, None)
    }

    #[test]
    fn dequeue_orders_by_priority_then_fifo() {
        let queue = RequestQueue::new(10, 0.8);
        queue.enqueue(op("acme", Priority::Normal)).expect("enqueue");
        queue.enqueue(op("acme", Priority::High)).expect("enqueue");
        queue.enqueue(op("acme", Priority::Low)).expect("enqueue");

        assert_eq!(queue.dequeue("acme").expect("op").priority, Priority::High);
        assert_eq!(
            queue.dequeue("acme").expect("op").priority,
            Priority::Normal
        );
        assert_eq!(queue.dequeue("acme").expect("op").priority, Priority::Low);
        assert!(queue.dequeue("acme").is_none());
    }

    #[test]
    fn fifo_within_a_priority_band() {
        let queue = RequestQueue::new(10, 0.8);
        let first = op("acme", Priority::Normal);
        let second = op("acme", Priority::Normal);
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        queue.enqueue(first).expect("enqueue");
        queue.enqueue(second).expect("enqueue");

        assert_eq!(queue.dequeue("acme").expect("op").id, first_id);
        assert_eq!(queue.dequeue("acme").expect("op").id, second_id);
    }

    #[tokio::test]
    async fn backpressure_fires_exactly_once_per_crossing() {
        let queue = RequestQueue::new(10, 0.8);
        let mut events = queue.subscribe();

        for _ in 0..8 {
            queue.enqueue(op("acme", Priority::Normal)).expect("enqueue");
        }

        match events.try_recv().expect("one backpressure event") {
            QueueEvent::Backpressure {
                should_throttle,
                fill,
                ..
            } => {
                assert!(should_throttle);
                assert!((fill - 0.8).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err(), "no second event while above");

        for _ in 8..10 {
            queue.enqueue(op("acme", Priority::Normal)).expect("enqueue");
        }
        let err = queue
            .enqueue(op("acme", Priority::Normal))
            .expect_err("over capacity");
        assert_eq!(err.code(), "QUEUE_FULL");
        assert_eq!(queue.depth("acme"), 10, "failed enqueue must not mutate");
    }

    #[tokio::test]
    async fn backpressure_releases_when_drained() {
        let queue = RequestQueue::new(10, 0.8);
        let mut events = queue.subscribe();

        for _ in 0..8 {
            queue.enqueue(op("acme", Priority::Normal)).expect("enqueue");
        }
        let _ = events.try_recv().expect("throttle on");

        queue.dequeue("acme").expect("op");
        match events.try_recv().expect("throttle off") {
            QueueEvent::Backpressure {
                should_throttle, ..
            } => assert!(!should_throttle),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn expired_operations_are_dropped_not_dispatched() {
        let queue = RequestQueue::new(10, 0.8);
        let mut stale = op("acme", Priority::Normal);
        stale.deadline_ms = Some(now_ms() + 20);
        queue.enqueue(stale).expect("enqueue");

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(queue.dequeue("acme").is_none());
        assert_eq!(queue.depth("acme"), 0);
    }

    #[test]
    fn identities_do_not_share_queues() {
        let queue = RequestQueue::new(10, 0.8);
        queue.enqueue(op("acme", Priority::Normal)).expect("enqueue");
        queue.enqueue(op("globex", Priority::High)).expect("enqueue");

        assert_eq!(queue.dequeue("acme").expect("op").identity, "acme");
        assert_eq!(queue.dequeue("globex").expect("op").identity, "globex");
    }

    #[test]
    fn high_priority_survives_restart_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn OperationStore> =
            Arc::new(JsonlStore::open(dir.path()).expect("open store"));

        let queue = RequestQueue::new(10, 0.8).with_store(Arc::clone(&store));
        let high = op("acme", Priority::High);
        let high_id = high.id.clone();
        queue.enqueue(high).expect("enqueue");

        // Simulate a crash: fresh in-memory queue over the same store.
        let recovered = RequestQueue::new(10, 0.8).with_store(Arc::clone(&store));
        assert_eq!(recovered.restore_persisted().expect("restore"), 1);
        // A second restore finds the id already live and adds nothing.
        assert_eq!(recovered.restore_persisted().expect("restore"), 0);
        assert_eq!(recovered.depth("acme"), 1);

        let restored = recovered.dequeue("acme").expect("op");
        assert_eq!(restored.id, high_id);

        // Dispatch cleared the mirror, so the next restart restores nothing.
        let after_dispatch = RequestQueue::new(10, 0.8).with_store(store);
        assert_eq!(after_dispatch.restore_persisted().expect("restore"), 0);
    }

    #[test]
    fn normal_priority_is_not_mirrored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn OperationStore> =
            Arc::new(JsonlStore::open(dir.path()).expect("open store"));

        let queue = RequestQueue::new(10, 0.8).with_store(Arc::clone(&store));
        queue.enqueue(op("acme", Priority::Normal)).expect("enqueue");

        let recovered = RequestQueue::new(10, 0.8).with_store(store);
        assert_eq!(recovered.restore_persisted().expect("restore"), 0);
    }
}
