// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Shared harness for store-backed integration tests: one throwaway
// Redis container per test, wired to a full broker stack.

use std::sync::Arc;

use fabstir_job_broker::broker::{JobBroker, NoopCancelNotifier};
use fabstir_job_broker::events::EventBroadcaster;
use fabstir_job_broker::store::{EventStreamConsumer, RedisStore};
use fabstir_job_broker::types::{Job, JobSubmission, WorkerCapabilities, WorkerInfo};
use testcontainers_modules::redis::{Redis, REDIS_PORT};
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use testcontainers_modules::testcontainers::ContainerAsync;

pub struct Harness {
    _container: ContainerAsync<Redis>,
    pub url: String,
    pub store: RedisStore,
    pub broadcaster: Arc<EventBroadcaster>,
    pub broker: Arc<JobBroker>,
}

pub async fn harness() -> Harness {
    harness_with_scan(100).await
}

pub async fn harness_with_scan(max_scan: usize) -> Harness {
    let container = Redis::default().start().await.expect("start redis container");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("mapped redis port");
    let url = format!("redis://127.0.0.1:{}/", port);

    let store = RedisStore::connect(&url).await.expect("connect to redis");
    EventStreamConsumer::ensure_groups(&store)
        .await
        .expect("create consumer groups");

    let broadcaster = EventBroadcaster::new(store.clone(), 256);
    let broker = Arc::new(JobBroker::new(
        store.clone(),
        broadcaster.clone(),
        Arc::new(NoopCancelNotifier),
        max_scan,
    ));

    Harness {
        _container: container,
        url,
        store,
        broadcaster,
        broker,
    }
}

impl Harness {
    pub async fn submit(&self, id: &str, service: &str, priority: i64) -> Job {
        self.broker
            .submit(submission(id, service, priority))
            .await
            .expect("submit job")
    }

    pub async fn register(&self, worker_id: &str, capabilities: serde_json::Value) -> WorkerInfo {
        self.broker
            .register_worker(worker_id, caps(capabilities))
            .await
            .expect("register worker")
    }

    /// Lifecycle event types for one subject, in stream order, read
    /// through a consumer group.
    pub async fn events_for(&self, group: &str, subject_id: &str) -> Vec<String> {
        let consumer = EventStreamConsumer::new(self.store.clone(), group, "test-consumer");
        let mut kinds = Vec::new();
        loop {
            let batch = consumer.read_new(100, None).await.expect("read events");
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                consumer.ack(&entry.id).await.expect("ack event");
                if entry.event.subject_id == subject_id {
                    kinds.push(entry.event.event_type.as_str().to_string());
                }
            }
        }
        kinds
    }
}

pub fn submission(id: &str, service: &str, priority: i64) -> JobSubmission {
    JobSubmission {
        id: Some(id.to_string()),
        service_required: service.to_string(),
        priority,
        ..Default::default()
    }
}

pub fn caps(value: serde_json::Value) -> WorkerCapabilities {
    serde_json::from_value(value).expect("worker capabilities")
}
