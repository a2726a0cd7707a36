// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Lifecycle event fan-out. Two sinks with different guarantees: the
// durable stream gets every event before anything else (at-least-once
// for consumer groups), monitors get best-effort at-most-once delivery
// with a bounded in-memory ring for resync after reconnect.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::RedisStore;
use crate::types::{self, LifecycleEvent};

/// Cap on events a resync response may carry regardless of the request.
pub const RESYNC_HARD_CAP: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
}

impl EventFilters {
    fn admits(&self, event: &LifecycleEvent) -> bool {
        if let Some(job_id) = &self.job_id {
            let hit = (event.event_type.topic() == "job" && &event.subject_id == job_id)
                || event.payload.get("job_id").and_then(|v| v.as_str()) == Some(job_id);
            if !hit {
                return false;
            }
        }
        if let Some(worker_id) = &self.worker_id {
            let hit = (event.event_type.topic() == "worker" && &event.subject_id == worker_id)
                || event.payload.get("worker_id").and_then(|v| v.as_str()) == Some(worker_id);
            if !hit {
                return false;
            }
        }
        if let Some(customer_id) = &self.customer_id {
            if event.payload.get("customer_id").and_then(|v| v.as_str()) != Some(customer_id) {
                return false;
            }
        }
        true
    }
}

/// What one monitor asked to see. Empty topics means everything; a topic
/// may be a prefix ("job", "worker") or a full event name.
#[derive(Debug, Clone, Default)]
pub struct MonitorSubscription {
    pub topics: HashSet<String>,
    pub filters: EventFilters,
}

impl MonitorSubscription {
    pub fn wants(&self, event: &LifecycleEvent) -> bool {
        let topic_hit = self.topics.is_empty()
            || self.topics.contains(event.event_type.topic())
            || self.topics.contains(event.event_type.as_str());
        topic_hit && self.filters.admits(event)
    }
}

/// Bounded ring of recent events, ordered by their (strictly increasing)
/// timestamps. Old entries fall off the front.
#[derive(Debug)]
pub struct EventRing {
    buffer: VecDeque<LifecycleEvent>,
    capacity: usize,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: LifecycleEvent) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event);
    }

    /// Events strictly newer than `since_ts`, oldest first, capped.
    pub fn since(&self, since_ts: i64, max: usize) -> Vec<LifecycleEvent> {
        self.buffer
            .iter()
            .filter(|e| e.timestamp > since_ts)
            .take(max.min(RESYNC_HARD_CAP))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

struct MonitorEntry {
    subscription: MonitorSubscription,
    sender: mpsc::UnboundedSender<LifecycleEvent>,
}

pub struct EventBroadcaster {
    store: RedisStore,
    monitors: RwLock<HashMap<String, MonitorEntry>>,
    ring: Mutex<EventRing>,
    last_ts: Mutex<i64>,
}

impl EventBroadcaster {
    /// Default resync ring size.
    pub const DEFAULT_RING_CAPACITY: usize = 1000;

    pub fn new(store: RedisStore, ring_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            monitors: RwLock::new(HashMap::new()),
            ring: Mutex::new(EventRing::new(ring_capacity)),
            last_ts: Mutex::new(0),
        })
    }

    /// Attach a monitor. Until it subscribes it receives every event.
    pub async fn attach_monitor(
        &self,
        connection_id: &str,
        sender: mpsc::UnboundedSender<LifecycleEvent>,
    ) {
        self.monitors.write().await.insert(
            connection_id.to_string(),
            MonitorEntry {
                subscription: MonitorSubscription::default(),
                sender,
            },
        );
        debug!(connection_id, "monitor attached");
    }

    pub async fn is_attached(&self, connection_id: &str) -> bool {
        self.monitors.read().await.contains_key(connection_id)
    }

    pub async fn update_subscription(&self, connection_id: &str, subscription: MonitorSubscription) {
        if let Some(entry) = self.monitors.write().await.get_mut(connection_id) {
            entry.subscription = subscription;
        }
    }

    pub async fn detach_monitor(&self, connection_id: &str) {
        self.monitors.write().await.remove(connection_id);
    }

    pub async fn monitor_count(&self) -> usize {
        self.monitors.read().await.len()
    }

    /// Publish one lifecycle event: durable stream first, then the ring,
    /// then best-effort monitor delivery. Timestamps are bumped to stay
    /// strictly increasing so resync cursors are unambiguous.
    pub async fn publish(&self, mut event: LifecycleEvent) -> Result<()> {
        {
            let mut last = self.last_ts.lock().await;
            let now = types::now_ms();
            event.timestamp = if now > *last { now } else { *last + 1 };
            *last = event.timestamp;
        }

        self.store.append_event(&event).await?;
        self.ring.lock().await.push(event.clone());

        let mut dead = Vec::new();
        {
            let monitors = self.monitors.read().await;
            for (id, entry) in monitors.iter() {
                if !entry.subscription.wants(&event) {
                    continue;
                }
                if entry.sender.send(event.clone()).is_err() {
                    dead.push(id.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut monitors = self.monitors.write().await;
            for id in dead {
                warn!(connection_id = %id, "dropping dead monitor channel");
                monitors.remove(&id);
            }
        }
        Ok(())
    }

    /// Buffered events newer than `since_ts`, for a reconnecting monitor.
    pub async fn resync(&self, since_ts: i64, max_events: Option<usize>) -> Vec<LifecycleEvent> {
        let max = max_events.unwrap_or(RESYNC_HARD_CAP);
        self.ring.lock().await.since(since_ts, max)
    }
}
