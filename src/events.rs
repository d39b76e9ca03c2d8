use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    JobSubmitted,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobRetry,
    JobDlq,
}

/// A lifecycle transition, fanned out to every live subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: Uuid,
    pub tenant_id: String,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl Event {
    pub fn for_job(kind: EventKind, job: &Job) -> Self {
        Self {
            kind,
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            trace_id: job.trace_id.clone(),
            timestamp: Utc::now(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// In-process broadcaster of lifecycle events.
///
/// Publishing never blocks: each subscriber owns a bounded buffer and a
/// subscriber that falls behind loses the oldest events rather than
/// applying backpressure to workers. Dropping the receiver detaches it.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(
            kind = ?event.kind,
            job_id = %event.job_id,
            tenant_id = %event.tenant_id,
            trace_id = %event.trace_id,
            "event published"
        );
        // Err means no live subscribers, which is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
