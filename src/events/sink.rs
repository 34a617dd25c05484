//! The Composite Sink: stores before publishing (spec.md §4.C, §7
//! "Composite Sink stores before publishing, so subscribers never see an
//! event that isn't durable").

use serde_json::{json, Value};
use tracing::warn;

use crate::error::Result;
use crate::models::task::StoredEvent;

use super::bus::LiveBus;
use super::store::EventStore;

#[derive(Clone)]
pub struct CompositeSink {
    store: EventStore,
    bus: LiveBus,
}

impl CompositeSink {
    pub fn new(store: EventStore, bus: LiveBus) -> Self {
        Self { store, bus }
    }

    /// Durable emission: append then publish. If the live-bus publish were
    /// ever fallible it would not roll back the append — the event is
    /// durable regardless of delivery.
    pub async fn emit(&self, task_id: &str, event_type: &str, payload: Value) -> Result<StoredEvent> {
        let stored = self.store.append(task_id, event_type, payload).await?;
        let mut live_payload = stored.payload.clone();
        if let Value::Object(ref mut map) = live_payload {
            map.insert("_event_id".to_string(), json!(stored.id));
        }
        self.bus.publish(
            task_id,
            json!({
                "id": stored.id,
                "type": stored.event_type,
                "payload": live_payload,
                "created_at": stored.created_at,
            }),
        );
        Ok(stored)
    }

    /// Live-only emission for high-frequency `progress` events (spec.md
    /// §4.C): bypasses the store entirely. Degrades to a silent no-op if
    /// there happen to be no subscribers, never an error.
    pub fn emit_live_only(&self, task_id: &str, event_type: &str, payload: Value) {
        self.bus.publish(
            task_id,
            json!({
                "type": event_type,
                "payload": payload,
            }),
        );
    }

    /// Falls back to live-only when the store is failing, per spec.md
    /// §4.C's "degrades gracefully to live-only on store failure" note.
    pub async fn emit_best_effort(&self, task_id: &str, event_type: &str, payload: Value) {
        if let Err(e) = self.emit(task_id, event_type, payload.clone()).await {
            warn!(task_id, event_type, error = %e, "event store append failed, degrading to live-only");
            self.emit_live_only(task_id, event_type, payload);
        }
    }

    pub fn bus(&self) -> &LiveBus {
        &self.bus
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }
}
