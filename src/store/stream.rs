// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Consumer-group access to the durable lifecycle stream. Each downstream
// service reads through its own group with explicit acks, so delivery is
// at-least-once per group: unacked records are re-read on restart.

use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{keys, RedisStore};
use crate::error::Result;
use crate::types::{EventKind, LifecycleEvent};

/// Downstream groups provisioned at startup.
pub const CONSUMER_GROUPS: [&str; 5] = [
    "webhook",
    "orchestrator",
    "capacity-planner",
    "billing",
    "monitoring",
];

#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Stream record id, used for acknowledgment.
    pub id: String,
    pub event: LifecycleEvent,
}

pub struct EventStreamConsumer {
    store: RedisStore,
    group: String,
    consumer: String,
}

impl EventStreamConsumer {
    pub fn new(store: RedisStore, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            store,
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    /// Create every downstream group (and the stream itself) if missing.
    pub async fn ensure_groups(store: &RedisStore) -> Result<()> {
        for group in CONSUMER_GROUPS {
            let mut conn = store.conn.clone();
            let result: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(keys::EVENTS_STREAM)
                .arg(group)
                .arg("$")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match result {
                Ok(()) => info!(group, "created event consumer group"),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(group, "event consumer group already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Records delivered to this consumer but not yet acknowledged.
    pub async fn read_unacked(&self, count: usize) -> Result<Vec<StreamEvent>> {
        self.read(count, None, "0").await
    }

    /// New records, optionally blocking up to `block_ms`.
    pub async fn read_new(&self, count: usize, block_ms: Option<usize>) -> Result<Vec<StreamEvent>> {
        self.read(count, block_ms, ">").await
    }

    async fn read(
        &self,
        count: usize,
        block_ms: Option<usize>,
        cursor: &str,
    ) -> Result<Vec<StreamEvent>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);
        if let Some(ms) = block_ms {
            opts = opts.block(ms);
        }
        let mut conn = self.store.conn.clone();
        let reply: StreamReadReply = match conn
            .xread_options(&[keys::EVENTS_STREAM], &[cursor], &opts)
            .await
        {
            Ok(reply) => reply,
            // An empty read (or a BLOCK timeout) comes back as nil.
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("nil") || msg.contains("timed out") || msg.contains("timeout") {
                    return Ok(Vec::new());
                }
                return Err(e.into());
            }
        };

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                match parse_entry(&entry) {
                    Some(event) => out.push(StreamEvent {
                        id: entry.id.clone(),
                        event,
                    }),
                    None => debug!(record_id = %entry.id, "skipping unreadable event record"),
                }
            }
        }
        Ok(out)
    }

    pub async fn ack(&self, record_id: &str) -> Result<()> {
        let mut conn = self.store.conn.clone();
        let _: i64 = conn
            .xack(keys::EVENTS_STREAM, &self.group, &[record_id])
            .await?;
        Ok(())
    }
}

fn parse_entry(entry: &redis::streams::StreamId) -> Option<LifecycleEvent> {
    let event_type = EventKind::parse(&entry.get::<String>("event_type")?)?;
    let subject_id = entry.get::<String>("subject_id")?;
    let timestamp = entry.get::<i64>("timestamp")?;
    let payload = entry
        .get::<String>("payload")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(serde_json::Value::Null);
    Some(LifecycleEvent {
        event_type,
        subject_id,
        timestamp,
        payload,
    })
}
