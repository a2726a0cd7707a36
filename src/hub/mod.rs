// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod connection;
pub mod handler;
pub mod messages;
pub mod server;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::JobBroker;
use crate::config::BrokerConfig;
use crate::events::EventBroadcaster;
use crate::hub::messages::OutboundFrame;

pub use connection::{ConnectionRegistry, ConnectionSummary};
pub use messages::ConnectionRole;
pub use server::serve;

/// Shared state behind every hub task and route handler.
pub struct HubState {
    pub config: Arc<BrokerConfig>,
    pub broker: Arc<JobBroker>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub registry: Arc<ConnectionRegistry>,
}

impl HubState {
    /// Start forwarding lifecycle events to a connection as `event`
    /// frames. Idempotent per connection.
    pub async fn attach_event_feed(self: &Arc<Self>, connection_id: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.broadcaster.attach_monitor(connection_id, tx).await;

        let registry = self.registry.clone();
        let broadcaster = self.broadcaster.clone();
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !registry
                    .send(&connection_id, OutboundFrame::event(&event))
                    .await
                {
                    broadcaster.detach_monitor(&connection_id).await;
                    break;
                }
            }
        });
    }
}
