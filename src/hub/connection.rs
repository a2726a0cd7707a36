// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Connection registry. The hub owns every live connection: identity,
// role, outbound channel and activity counters. Other components reach
// a connection only through this registry (the broker's cancel signal
// goes through the CancelNotifier seam below).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::broker::CancelNotifier;
use crate::error::{BrokerError, Result};
use crate::hub::messages::{ConnectionRole, OutboundFrame};
use crate::types;

pub struct ConnectionEntry {
    pub connection_id: String,
    pub role: ConnectionRole,
    /// Identity from the connection URL (worker/client/monitor id).
    pub bound_id: String,
    pub sender: mpsc::UnboundedSender<OutboundFrame>,
    pub connected_at: i64,
    pub last_activity: i64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub connection_id: String,
    pub role: ConnectionRole,
    pub bound_id: String,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        })
    }

    /// Admit a connection, enforcing the connection cap.
    pub async fn register(
        &self,
        role: ConnectionRole,
        bound_id: &str,
        sender: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Result<String> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_connections {
            warn!(
                count = connections.len(),
                cap = self.max_connections,
                "rejecting connection, limit reached"
            );
            return Err(BrokerError::Overload);
        }
        let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
        let now = types::now_ms();
        connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                connection_id: connection_id.clone(),
                role,
                bound_id: bound_id.to_string(),
                sender,
                connected_at: now,
                last_activity: now,
                messages_received: 0,
                messages_sent: 0,
            },
        );
        info!(connection_id = %connection_id, role = role.as_str(), bound_id, "connection registered");
        Ok(connection_id)
    }

    pub async fn remove(&self, connection_id: &str) -> Option<ConnectionSummary> {
        let removed = self.connections.write().await.remove(connection_id);
        if let Some(entry) = &removed {
            info!(
                connection_id,
                received = entry.messages_received,
                sent = entry.messages_sent,
                "connection removed"
            );
        }
        removed.map(|e| ConnectionSummary {
            connection_id: e.connection_id,
            role: e.role,
            bound_id: e.bound_id,
        })
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn record_received(&self, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(connection_id) {
            entry.messages_received += 1;
            entry.last_activity = types::now_ms();
        }
    }

    /// Send a frame through a connection's outbound channel.
    pub async fn send(&self, connection_id: &str, frame: OutboundFrame) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(connection_id) {
            Some(entry) => {
                if entry.sender.send(frame).is_ok() {
                    entry.messages_sent += 1;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Send to the connection bound to a worker id, if it is online.
    pub async fn send_to_worker(&self, worker_id: &str, frame: OutboundFrame) -> bool {
        let target = {
            let connections = self.connections.read().await;
            connections
                .values()
                .find(|e| e.role == ConnectionRole::Worker && e.bound_id == worker_id)
                .map(|e| e.connection_id.clone())
        };
        match target {
            Some(connection_id) => self.send(&connection_id, frame).await,
            None => false,
        }
    }

    /// Last inbound activity for a connection, used by its idle check.
    pub async fn last_activity(&self, connection_id: &str) -> Option<i64> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|e| e.last_activity)
    }
}

#[async_trait]
impl CancelNotifier for ConnectionRegistry {
    async fn notify_cancel(&self, worker_id: &str, job_id: &str) {
        if !self
            .send_to_worker(worker_id, OutboundFrame::cancel_job(job_id))
            .await
        {
            debug!(worker_id, job_id, "cancel signal undeliverable, worker offline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cap_is_enforced() {
        let registry = ConnectionRegistry::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        registry
            .register(ConnectionRole::Worker, "w1", tx)
            .await
            .unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let err = registry
            .register(ConnectionRole::Client, "c1", tx2)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "overload");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn send_to_worker_routes_by_bound_id() {
        let registry = ConnectionRegistry::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register(ConnectionRole::Worker, "w1", tx)
            .await
            .unwrap();

        assert!(registry
            .send_to_worker("w1", OutboundFrame::cancel_job("j1"))
            .await);
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.msg_type, "cancel_job");
        assert_eq!(frame.data["job_id"], "j1");

        assert!(!registry
            .send_to_worker("w2", OutboundFrame::cancel_job("j1"))
            .await);
    }

    #[tokio::test]
    async fn counters_track_traffic() {
        let registry = ConnectionRegistry::new(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry
            .register(ConnectionRole::Monitor, "m1", tx)
            .await
            .unwrap();
        registry.record_received(&id).await;
        registry.record_received(&id).await;
        registry.send(&id, OutboundFrame::heartbeat()).await;

        let connections = registry.connections.read().await;
        let entry = connections.get(&id).unwrap();
        assert_eq!(entry.messages_received, 2);
        assert_eq!(entry.messages_sent, 1);
    }

    #[tokio::test]
    async fn activity_advances_on_received_messages() {
        let registry = ConnectionRegistry::new(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry
            .register(ConnectionRole::Worker, "w1", tx)
            .await
            .unwrap();

        let before = registry.last_activity(&id).await.unwrap();
        {
            let mut connections = registry.connections.write().await;
            connections.get_mut(&id).unwrap().last_activity -= 120_000;
        }
        registry.record_received(&id).await;
        let after = registry.last_activity(&id).await.unwrap();
        assert!(after >= before);
        assert!(registry.last_activity("conn-nope").await.is_none());
    }
}
