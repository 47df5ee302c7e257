//! Stream substrate
//!
//! `JobStream` abstracts the append-only work streams with consumer-group
//! pending/ack semantics. The Redis implementation maps directly onto
//! XADD/XREADGROUP/XACK/XPENDING/XCLAIM; the in-memory implementation
//! reproduces the pending-entry semantics for hermetic tests, including a
//! helper to age pending entries so reclaimer staleness is testable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{OrchResult, OrchestratorError};

/// One delivered stream entry.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: serde_json::Value,
}

/// One pending (delivered but unacked) entry.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

#[async_trait]
pub trait JobStream: Send + Sync {
    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> OrchResult<()>;
    /// Append a payload; returns the stream id. FIFO at enqueue time.
    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> OrchResult<String>;
    /// Read new entries for `consumer` within `group`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> OrchResult<Vec<StreamEntry>>;
    async fn ack(&self, stream: &str, group: &str, id: &str) -> OrchResult<()>;
    /// All pending entries of the group.
    async fn pending(&self, stream: &str, group: &str) -> OrchResult<Vec<PendingEntry>>;
    /// Reassign a pending entry to `new_consumer`, returning it.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        id: &str,
    ) -> OrchResult<Option<StreamEntry>>;
    /// Total entries in the stream (backpressure signal).
    async fn depth(&self, stream: &str) -> OrchResult<u64>;
}

fn infra(err: redis::RedisError) -> OrchestratorError {
    OrchestratorError::Transient(err.to_string())
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisStreams {
    conn: redis::aio::ConnectionManager,
}

impl RedisStreams {
    pub async fn connect(url: &str) -> OrchResult<Self> {
        let client = redis::Client::open(url).map_err(infra)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(infra)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl JobStream for RedisStreams {
    async fn ensure_group(&self, stream: &str, group: &str) -> OrchResult<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;
        match result {
            Ok(()) => Ok(()),
            // BUSYGROUP means the group already exists, which is fine.
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(infra(err)),
        }
    }

    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> OrchResult<String> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload)
            .map_err(|err| OrchestratorError::Validation(err.to_string()))?;
        let id: String = conn
            .xadd(stream, "*", &[("payload", body.as_str())])
            .await
            .map_err(infra)?;
        debug!(stream, id, "published stream entry");
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> OrchResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(infra)?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                if let Some(value) = id.map.get("payload") {
                    let raw: String = redis::from_redis_value(value).map_err(infra)?;
                    let payload = serde_json::from_str(&raw)
                        .map_err(|err| OrchestratorError::FatalInvariant(err.to_string()))?;
                    entries.push(StreamEntry { id: id.id, payload });
                }
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> OrchResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await.map_err(infra)?;
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> OrchResult<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", 1000)
            .await
            .map_err(infra)?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        id: &str,
    ) -> OrchResult<Option<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, new_consumer, 0, &[id])
            .await
            .map_err(infra)?;
        if let Some(entry) = reply.ids.into_iter().next() {
            if let Some(value) = entry.map.get("payload") {
                let raw: String = redis::from_redis_value(value).map_err(infra)?;
                let payload = serde_json::from_str(&raw)
                    .map_err(|err| OrchestratorError::FatalInvariant(err.to_string()))?;
                return Ok(Some(StreamEntry {
                    id: entry.id,
                    payload,
                }));
            }
        }
        Ok(None)
    }

    async fn depth(&self, stream: &str) -> OrchResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream).await.map_err(infra)?;
        Ok(len)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct MemPending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
    payload: serde_json::Value,
}

#[derive(Default)]
struct MemGroup {
    /// Index into the entry vec of the next undelivered entry.
    cursor: usize,
    pending: HashMap<String, MemPending>,
}

#[derive(Default)]
struct MemStream {
    next_seq: u64,
    entries: Vec<StreamEntry>,
    acked: u64,
    groups: HashMap<String, MemGroup>,
}

/// In-memory stream substrate with consumer-group semantics.
#[derive(Default)]
pub struct MemoryStreams {
    streams: Mutex<HashMap<String, MemStream>>,
}

impl MemoryStreams {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test helper: backdate every pending entry of a group so it appears
    /// idle for at least `by`.
    pub async fn age_pending(&self, stream: &str, group: &str, by: Duration) {
        let mut streams = self.streams.lock().await;
        if let Some(s) = streams.get_mut(stream) {
            if let Some(g) = s.groups.get_mut(group) {
                for pending in g.pending.values_mut() {
                    pending.delivered_at = pending
                        .delivered_at
                        .checked_sub(by)
                        .unwrap_or(pending.delivered_at);
                }
            }
        }
    }
}

#[async_trait]
impl JobStream for MemoryStreams {
    async fn ensure_group(&self, stream: &str, group: &str) -> OrchResult<()> {
        let mut streams = self.streams.lock().await;
        let s = streams.entry(stream.to_string()).or_default();
        s.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> OrchResult<String> {
        let mut streams = self.streams.lock().await;
        let s = streams.entry(stream.to_string()).or_default();
        s.next_seq += 1;
        let id = format!("{}-0", s.next_seq);
        s.entries.push(StreamEntry {
            id: id.clone(),
            payload: payload.clone(),
        });
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> OrchResult<Vec<StreamEntry>> {
        let mut streams = self.streams.lock().await;
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| OrchestratorError::NotFound(format!("stream {stream}")))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| OrchestratorError::NotFound(format!("group {group}")))?;

        let mut delivered = Vec::new();
        while g.cursor < s.entries.len() && delivered.len() < count {
            let entry = s.entries[g.cursor].clone();
            g.pending.insert(
                entry.id.clone(),
                MemPending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                    payload: entry.payload.clone(),
                },
            );
            delivered.push(entry);
            g.cursor += 1;
        }
        Ok(delivered)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> OrchResult<()> {
        let mut streams = self.streams.lock().await;
        if let Some(s) = streams.get_mut(stream) {
            if let Some(g) = s.groups.get_mut(group) {
                if g.pending.remove(id).is_some() {
                    s.acked += 1;
                }
            }
        }
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> OrchResult<Vec<PendingEntry>> {
        let streams = self.streams.lock().await;
        let Some(s) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get(group) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<PendingEntry> = g
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                consumer: p.consumer.clone(),
                idle_ms: p.delivered_at.elapsed().as_millis() as u64,
                delivery_count: p.delivery_count,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        id: &str,
    ) -> OrchResult<Option<StreamEntry>> {
        let mut streams = self.streams.lock().await;
        let Some(s) = streams.get_mut(stream) else {
            return Ok(None);
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(None);
        };
        if let Some(pending) = g.pending.get_mut(id) {
            pending.consumer = new_consumer.to_string();
            pending.delivered_at = Instant::now();
            pending.delivery_count += 1;
            return Ok(Some(StreamEntry {
                id: id.to_string(),
                payload: pending.payload.clone(),
            }));
        }
        Ok(None)
    }

    async fn depth(&self, stream: &str) -> OrchResult<u64> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(stream)
            .map(|s| (s.entries.len() as u64).saturating_sub(s.acked))
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_read_ack_cycle() {
        let streams = MemoryStreams::new();
        streams.ensure_group("s", "g").await.unwrap();
        streams.publish("s", &json!({"n": 1})).await.unwrap();
        streams.publish("s", &json!({"n": 2})).await.unwrap();

        let read = streams.read_group("s", "g", "c1", 10).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(streams.pending("s", "g").await.unwrap().len(), 2);

        streams.ack("s", "g", &read[0].id).await.unwrap();
        assert_eq!(streams.pending("s", "g").await.unwrap().len(), 1);
        assert_eq!(streams.depth("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_reassigns_consumer() {
        let streams = MemoryStreams::new();
        streams.ensure_group("s", "g").await.unwrap();
        streams.publish("s", &json!({"n": 1})).await.unwrap();
        let read = streams.read_group("s", "g", "c1", 1).await.unwrap();

        let claimed = streams
            .claim("s", "g", "c2", &read[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.payload["n"], json!(1));

        let pending = streams.pending("s", "g").await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_fifo_order_at_enqueue() {
        let streams = MemoryStreams::new();
        streams.ensure_group("s", "g").await.unwrap();
        for n in 0..5 {
            streams.publish("s", &json!({ "n": n })).await.unwrap();
        }
        let read = streams.read_group("s", "g", "c", 5).await.unwrap();
        let order: Vec<i64> = read.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }
}
