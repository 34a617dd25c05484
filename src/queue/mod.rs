//! The optional in-process Task Queue (spec.md §4.L): a lease-based FIFO
//! with delayed retry and token-guarded completion. Single-process default;
//! not backed by the Task Repository.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemState {
    Available,
    Delayed,
    InFlight,
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub item_id: String,
    pub task_id: String,
    pub payload: Option<Value>,
    pub attempt: u32,
    state: ItemState,
    ready_at: DateTime<Utc>,
    lease_token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

const DEFAULT_LEASE_SECONDS: i64 = 60;
const DEFAULT_RETRY_SECONDS: i64 = 5;

/// All state behind one mutex: the queue is small and every operation is
/// O(n), which is fine at the scale a single-process queue is meant for.
pub struct TaskQueue {
    items: Mutex<VecDeque<QueueItem>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self { items: Mutex::new(VecDeque::new()) }
    }

    pub fn enqueue(&self, task_id: &str, payload: Option<Value>) -> QueueItem {
        let item = QueueItem {
            item_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            payload,
            attempt: 0,
            state: ItemState::Available,
            ready_at: Utc::now(),
            lease_token: None,
            lease_expires_at: None,
        };
        self.items.lock().expect("queue mutex poisoned").push_back(item.clone());
        item
    }

    /// Promotes ready `delayed` items and reclaims expired in-flight leases,
    /// then claims up to `limit` available items for `worker_id`.
    pub fn claim(&self, _worker_id: &str, lease_seconds: i64, limit: usize) -> Vec<QueueItem> {
        let now = Utc::now();
        let mut items = self.items.lock().expect("queue mutex poisoned");

        for item in items.iter_mut() {
            if item.state == ItemState::Delayed && item.ready_at <= now {
                item.state = ItemState::Available;
            }
            if item.state == ItemState::InFlight {
                if let Some(expires) = item.lease_expires_at {
                    if expires <= now {
                        item.state = ItemState::Available;
                        item.attempt += 1;
                        item.lease_token = None;
                        item.lease_expires_at = None;
                    }
                }
            }
        }

        let lease_secs = if lease_seconds > 0 { lease_seconds } else { DEFAULT_LEASE_SECONDS };
        let mut claimed = Vec::with_capacity(limit);
        for item in items.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if item.state == ItemState::Available {
                item.state = ItemState::InFlight;
                item.lease_token = Some(Uuid::new_v4().to_string());
                item.lease_expires_at = Some(now + chrono::Duration::seconds(lease_secs));
                claimed.push(item.clone());
            }
        }
        claimed
    }

    pub fn ack(&self, item_id: &str, lease_token: &str) -> bool {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        let Some(pos) = items.iter().position(|i| i.item_id == item_id) else { return false };
        if items[pos].lease_token.as_deref() != Some(lease_token) {
            return false;
        }
        items.remove(pos);
        true
    }

    /// Re-enqueues the item under a fresh id with `attempt` incremented,
    /// moved to `delayed` until `retry_in_seconds` from now.
    pub fn nack(&self, item_id: &str, lease_token: &str, retry_in_seconds: i64) -> bool {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        let Some(pos) = items.iter().position(|i| i.item_id == item_id) else { return false };
        if items[pos].lease_token.as_deref() != Some(lease_token) {
            return false;
        }
        let mut retried = items.remove(pos).expect("position just found");
        let delay = if retry_in_seconds > 0 { retry_in_seconds } else { DEFAULT_RETRY_SECONDS };
        retried.item_id = Uuid::new_v4().to_string();
        retried.attempt += 1;
        retried.state = ItemState::Delayed;
        retried.ready_at = Utc::now() + chrono::Duration::seconds(delay);
        retried.lease_token = None;
        retried.lease_expires_at = None;
        items.push_back(retried);
        true
    }

    pub fn size(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn pending_count(&self) -> usize {
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .iter()
            .filter(|i| i.state != ItemState::InFlight)
            .count()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_ack_removes_item() {
        let q = TaskQueue::new();
        q.enqueue("t1", None);
        let claimed = q.claim("w1", 60, 1);
        assert_eq!(claimed.len(), 1);
        assert!(q.ack(&claimed[0].item_id, claimed[0].lease_token.as_ref().unwrap()));
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn ack_with_stale_token_fails() {
        let q = TaskQueue::new();
        q.enqueue("t1", None);
        let claimed = q.claim("w1", 60, 1);
        assert!(!q.ack(&claimed[0].item_id, "not-the-real-token"));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn nack_increments_attempt_and_delays() {
        let q = TaskQueue::new();
        q.enqueue("t1", None);
        let claimed = q.claim("w1", 60, 1);
        let token = claimed[0].lease_token.clone().unwrap();
        assert!(q.nack(&claimed[0].item_id, &token, 5));
        assert_eq!(q.pending_count(), 1);
        let reclaimed = q.claim("w1", 60, 1);
        assert!(reclaimed.is_empty(), "item is still delayed");
    }

    #[test]
    fn in_flight_item_is_not_reclaimed_before_lease_expiry() {
        let q = TaskQueue::new();
        q.enqueue("t1", None);
        let claimed = q.claim("w1", 60, 1);
        assert_eq!(claimed[0].attempt, 0);
        let again = q.claim("w2", 60, 1);
        assert!(again.is_empty(), "item is still leased to w1");
    }
}
