//! The in-process Live Bus (spec.md §4.C, §5 "Subscriber queues").
//!
//! `mpsc::Sender::try_send` gives no way to evict an already-queued item
//! when full, and spec.md's backpressure policy is
//! drop-**oldest**-then-drop-new. So each subscriber's real buffer is a
//! `VecDeque` behind a plain mutex, woken by a `Notify`, rather than an
//! `mpsc` channel — `publish` never awaits, which an `mpsc::Sender::send`
//! would require once the channel fills.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;

const DEFAULT_CAPACITY: usize = 1000;

struct SubscriberInner {
    queue: Mutex<VecDeque<Value>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

struct Subscriber {
    id: u64,
    inner: Arc<SubscriberInner>,
}

/// Bounded, best-effort fanout per task. `publish` is synchronous and never
/// blocks; a full subscriber queue drops its oldest entry, then the new one
/// if it's still full afterward (it never will be, but the check is kept
/// explicit to match the documented two-step policy).
#[derive(Clone)]
pub struct LiveBus {
    inner: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for LiveBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self, task_id: &str) -> EventReceiver {
        self.subscribe_with_capacity(task_id, DEFAULT_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, task_id: &str, capacity: usize) -> EventReceiver {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber_inner = Arc::new(SubscriberInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let mut map = self.inner.lock().expect("live bus mutex poisoned");
        map.entry(task_id.to_string()).or_default().push(Subscriber {
            id,
            inner: subscriber_inner.clone(),
        });
        EventReceiver {
            bus: self.clone(),
            task_id: task_id.to_string(),
            id,
            inner: subscriber_inner,
        }
    }

    /// Enqueue `event` to every current subscriber of `task_id`. Never
    /// awaits and never panics on a slow/dead subscriber — it only ever
    /// touches its own queue.
    pub fn publish(&self, task_id: &str, event: Value) {
        let map = self.inner.lock().expect("live bus mutex poisoned");
        let Some(subs) = map.get(task_id) else { return };
        for sub in subs {
            let mut queue = sub.inner.queue.lock().expect("subscriber queue poisoned");
            if queue.len() >= sub.inner.capacity {
                queue.pop_front();
                sub.inner.dropped.fetch_add(1, Ordering::Relaxed);
                if queue.len() >= sub.inner.capacity {
                    sub.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            queue.push_back(event.clone());
            drop(queue);
            sub.inner.notify.notify_waiters();
        }
    }

    pub fn unsubscribe(&self, task_id: &str, id: u64) {
        let mut map = self.inner.lock().expect("live bus mutex poisoned");
        if let Some(subs) = map.get_mut(task_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                map.remove(task_id);
            }
        }
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.inner
            .lock()
            .expect("live bus mutex poisoned")
            .get(task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// A live subscription. Dropping it unsubscribes from the bus.
pub struct EventReceiver {
    bus: LiveBus,
    task_id: String,
    id: u64,
    inner: Arc<SubscriberInner>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("subscriber queue poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.task_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_then_receive_fifo() {
        let bus = LiveBus::new();
        let mut rx = bus.subscribe("t1");
        bus.publish("t1", json!({"n": 1}));
        bus.publish("t1", json!({"n": 2}));
        assert_eq!(rx.recv().await, Some(json!({"n": 1})));
        assert_eq!(rx.recv().await, Some(json!({"n": 2})));
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let bus = LiveBus::new();
        let mut rx = bus.subscribe_with_capacity("t1", 2);
        bus.publish("t1", json!(1));
        bus.publish("t1", json!(2));
        bus.publish("t1", json!(3));
        assert_eq!(rx.recv().await, Some(json!(2)));
        assert_eq!(rx.recv().await, Some(json!(3)));
        assert_eq!(rx.dropped_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_on_drop_empties_task_entry() {
        let bus = LiveBus::new();
        let rx = bus.subscribe("t1");
        assert_eq!(bus.subscriber_count("t1"), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count("t1"), 0);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let bus = LiveBus::new();
        bus.publish("ghost", json!(1));
    }
}
