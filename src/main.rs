// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fabstir_job_broker::{
    config::BrokerConfig,
    events::EventBroadcaster,
    hub::{self, connection::ConnectionRegistry, HubState},
    recovery::RecoveryLoop,
    store::{EventStreamConsumer, RedisStore},
    JobBroker,
};
use tracing::{error, info};

/// Cadence of the archival sweep; the age cutoff itself comes from
/// configuration.
const ARCHIVE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    println!("🚀 Starting Fabstir Job Broker...\n");

    // Fail-loud configuration: nothing starts with a half-set environment.
    let config = Arc::new(BrokerConfig::from_env()?);

    let store = RedisStore::connect(&config.store_url).await?;
    info!("connected to state store at {}", config.store_url);
    EventStreamConsumer::ensure_groups(&store).await?;

    let broadcaster = EventBroadcaster::new(store.clone(), EventBroadcaster::DEFAULT_RING_CAPACITY);
    let registry = ConnectionRegistry::new(config.max_connections);
    let broker = Arc::new(JobBroker::new(
        store.clone(),
        broadcaster.clone(),
        registry.clone(),
        config.matcher_max_scan,
    ));

    RecoveryLoop::new(
        broker.clone(),
        config.stuck_job_cleanup_interval,
        config.worker_grace(),
        config.connection_timeout,
    )
    .spawn();

    spawn_archive_sweep(broker.clone(), config.clone());

    let hub = Arc::new(HubState {
        config: config.clone(),
        broker,
        broadcaster,
        registry,
    });

    println!("✅ Broker ready, hub on {}\n", config.hub_listen_address);
    hub::serve(hub).await
}

fn spawn_archive_sweep(broker: Arc<JobBroker>, config: Arc<BrokerConfig>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ARCHIVE_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match broker
                .archive(config.archive_older_than, &config.archive_dir)
                .await
            {
                Ok(stats) if stats.archived > 0 => {
                    info!(
                        archived = stats.archived,
                        partitions = stats.partitions,
                        "archive sweep done"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("archive sweep failed: {}", e),
            }
        }
    });
}
