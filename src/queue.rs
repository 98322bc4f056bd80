//! `WorkQueue`: the durable at-least-once work-queue external contract
//! (spec §4.5). Only the contract is specified by the source system; this
//! module provides the message shape and an in-memory fake used by tests
//! and the synchronous processing strategy, following the same
//! "interface + in-memory fake" pattern as `storage::object_store`.

use crate::error::QueueError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Wire payload for the processing work stream (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMessage {
    pub upload_id: String,
    pub storage_path: String,
    pub resume_from_line: u64,
    pub attempt: u32,
}

/// A delivered message with its server-assigned id.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub payload: UploadMessage,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, stream: &str, message: UploadMessage) -> Result<(), QueueError>;

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer_id: &str,
        batch: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<(), QueueError>;

    /// Message ids delivered but not ack'd for at least `min_idle`,
    /// regardless of which consumer they were handed to — used to reclaim
    /// work after a crash (spec §4.5, §4.8 step 9).
    async fn pending(&self, stream: &str, group: &str, min_idle: Duration) -> Result<Vec<String>, QueueError>;

    async fn enqueue_dead(&self, dlq_stream: &str, payload: serde_json::Value) -> Result<(), QueueError>;
}

struct PendingEntry {
    message_id: String,
    payload: UploadMessage,
    group: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct StreamState {
    backlog: VecDeque<(String, UploadMessage)>,
    pending: Vec<PendingEntry>,
}

#[derive(Default)]
pub struct InMemoryQueue {
    streams: Mutex<HashMap<String, StreamState>>,
    dlqs: Mutex<HashMap<String, Vec<serde_json::Value>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/ops helper: number of messages in the DLQ for a given stream.
    pub fn dlq_len(&self, dlq_stream: &str) -> usize {
        self.dlqs.lock().unwrap().get(dlq_stream).map(|v| v.len()).unwrap_or(0)
    }

    pub fn dlq_entries(&self, dlq_stream: &str) -> Vec<serde_json::Value> {
        self.dlqs.lock().unwrap().get(dlq_stream).cloned().unwrap_or_default()
    }

    /// Test helper: re-enqueue a message id that's sitting in `pending`,
    /// simulating a reclaim after crash, without waiting for `min_idle`.
    pub fn requeue_pending(&self, stream: &str, message_id: &str) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(pos) = state.pending.iter().position(|p| p.message_id == message_id) {
                let entry = state.pending.remove(pos);
                state.backlog.push_back((entry.message_id, entry.payload));
            }
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn enqueue(&self, stream: &str, message: UploadMessage) -> Result<(), QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut streams = self.streams.lock().unwrap();
        streams.entry(stream.to_string()).or_default().backlog.push_back((id, message));
        Ok(())
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        _consumer_id: &str,
        batch: usize,
        _block: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        let mut out = Vec::new();
        for _ in 0..batch {
            match state.backlog.pop_front() {
                Some((id, payload)) => {
                    state.pending.push(PendingEntry {
                        message_id: id.clone(),
                        payload: payload.clone(),
                        group: group.to_string(),
                        delivered_at: Instant::now(),
                    });
                    out.push(Delivery { message_id: id, payload });
                }
                None => break,
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, _group: &str, message_id: &str) -> Result<(), QueueError> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.get_mut(stream).ok_or_else(|| QueueError::NotFound(message_id.to_string()))?;
        let before = state.pending.len();
        state.pending.retain(|p| p.message_id != message_id);
        if state.pending.len() == before {
            return Err(QueueError::NotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str, min_idle: Duration) -> Result<Vec<String>, QueueError> {
        let streams = self.streams.lock().unwrap();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        Ok(state
            .pending
            .iter()
            .filter(|p| p.group == group && now.duration_since(p.delivered_at) >= min_idle)
            .map(|p| p.message_id.clone())
            .collect())
    }

    async fn enqueue_dead(&self, dlq_stream: &str, payload: serde_json::Value) -> Result<(), QueueError> {
        self.dlqs.lock().unwrap().entry(dlq_stream.to_string()).or_default().push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str) -> UploadMessage {
        UploadMessage { upload_id: id.to_string(), storage_path: "p".into(), resume_from_line: 0, attempt: 0 }
    }

    #[tokio::test]
    async fn enqueue_then_consume_delivers_in_order() {
        let q = InMemoryQueue::new();
        q.enqueue("s", msg("a")).await.unwrap();
        q.enqueue("s", msg("b")).await.unwrap();

        let batch = q.consume("s", "g", "c1", 10, Duration::from_millis(0)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload.upload_id, "a");
        assert_eq!(batch[1].payload.upload_id, "b");
    }

    #[tokio::test]
    async fn unacked_messages_show_up_as_pending() {
        let q = InMemoryQueue::new();
        q.enqueue("s", msg("a")).await.unwrap();
        let batch = q.consume("s", "g", "c1", 10, Duration::from_millis(0)).await.unwrap();

        let pending = q.pending("s", "g", Duration::from_millis(0)).await.unwrap();
        assert_eq!(pending, vec![batch[0].message_id.clone()]);

        q.ack("s", "g", &batch[0].message_id).await.unwrap();
        let pending = q.pending("s", "g", Duration::from_millis(0)).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn dlq_accumulates_payloads() {
        let q = InMemoryQueue::new();
        q.enqueue_dead("dlq", serde_json::json!({"upload_id": "x"})).await.unwrap();
        assert_eq!(q.dlq_len("dlq"), 1);
    }

    #[tokio::test]
    async fn requeue_pending_moves_message_back_to_backlog() {
        let q = InMemoryQueue::new();
        q.enqueue("s", msg("a")).await.unwrap();
        let batch = q.consume("s", "g", "c1", 10, Duration::from_millis(0)).await.unwrap();
        q.requeue_pending("s", &batch[0].message_id);

        let redelivered = q.consume("s", "g", "c2", 10, Duration::from_millis(0)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].payload.upload_id, "a");
    }
}
