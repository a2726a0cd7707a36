// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// tests/broker_tests.rs - broker, matcher and queue semantics against a
// real Redis.

mod support;

use fabstir_job_broker::broker::CancelOutcome;
use fabstir_job_broker::types::{JobStatus, WorkerStatus};
use serde_json::json;
use support::{caps, harness, harness_with_scan, submission};

#[tokio::test]
async fn happy_path_single_job() {
    let h = harness().await;

    h.submit("j1", "sim", 50).await;
    h.register("w1", json!({"services": ["sim"], "hardware": {"gpu_memory_gb": 8}}))
        .await;

    let job = h.broker.claim("w1").await.unwrap().expect("job assigned");
    assert_eq!(job.id, "j1");
    assert_eq!(job.status, JobStatus::Assigned);
    assert_eq!(job.worker_id.as_deref(), Some("w1"));

    for progress in [25.0, 50.0, 75.0] {
        h.broker
            .progress("j1", "w1", progress, None, None, None)
            .await
            .unwrap();
    }
    let running = h.store.get_live_job("j1").await.unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Processing);

    h.broker
        .complete("j1", "w1", json!({"ok": true}))
        .await
        .unwrap();

    // Terminal state: job in the completed map only, worker idle again.
    let done = h.store.get_terminal_job("j1").await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.worker_id.is_none());
    assert!(h.store.get_live_job("j1").await.unwrap().is_none());
    assert!(h.store.pending_score("j1").await.unwrap().is_none());

    let worker = h.store.get_worker("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(worker.current_job_id.is_none());

    let kinds = h.events_for("webhook", "j1").await;
    assert_eq!(
        kinds,
        [
            "job.submitted",
            "job.assigned",
            "job.progress",
            "job.progress",
            "job.progress",
            "job.completed",
        ]
    );
}

#[tokio::test]
async fn capability_filtering_routes_to_the_big_worker() {
    let h = harness().await;

    let mut sub = submission("j2", "gpu", 80);
    sub.requirements = serde_json::from_value(
        json!({"positive_requirements": {"hardware": {"gpu_memory_gb": 24}}}),
    )
    .unwrap();
    h.broker.submit(sub).await.unwrap();

    h.register("w_small", json!({"services": ["gpu"], "hardware": {"gpu_memory_gb": 16}}))
        .await;
    h.register("w_big", json!({"services": ["gpu"], "hardware": {"gpu_memory_gb": 48}}))
        .await;

    let (small, big) = tokio::join!(h.broker.claim("w_small"), h.broker.claim("w_big"));
    assert!(small.unwrap().is_none());
    let job = big.unwrap().expect("big worker gets the job");
    assert_eq!(job.id, "j2");
    assert_eq!(job.worker_id.as_deref(), Some("w_big"));
}

#[tokio::test]
async fn concurrent_claims_never_double_assign() {
    let h = harness().await;
    h.submit("j1", "sim", 50).await;
    for worker in ["w1", "w2", "w3", "w4"] {
        h.register(worker, json!({"services": ["sim"]})).await;
    }

    let (a, b, c, d) = tokio::join!(
        h.broker.claim("w1"),
        h.broker.claim("w2"),
        h.broker.claim("w3"),
        h.broker.claim("w4"),
    );
    let wins: Vec<_> = [a, b, c, d]
        .into_iter()
        .filter_map(|r| r.unwrap())
        .collect();
    assert_eq!(wins.len(), 1, "exactly one claim may win");
    assert_eq!(wins[0].id, "j1");
}

#[tokio::test]
async fn workflow_priority_outranks_job_priority() {
    let h = harness().await;

    let mut j3a = submission("j3a", "sim", 10);
    j3a.workflow_id = Some("wf".to_string());
    j3a.workflow_priority = Some(100);
    j3a.workflow_datetime = Some("2024-01-01T00:00:00Z".parse().unwrap());
    h.broker.submit(j3a).await.unwrap();
    h.submit("j3b", "sim", 90).await;

    h.register("w1", json!({"services": ["sim"]})).await;
    let first = h.broker.claim("w1").await.unwrap().unwrap();
    assert_eq!(first.id, "j3a");
}

#[tokio::test]
async fn strict_customer_isolation() {
    let h = harness().await;

    let mut j6 = submission("j6", "sim", 50);
    j6.customer_id = Some("A".to_string());
    j6.requirements = serde_json::from_value(
        json!({"positive_requirements": {"customer_isolation": "strict"}}),
    )
    .unwrap();
    h.broker.submit(j6).await.unwrap();

    h.register(
        "w6_loose",
        json!({"services": ["sim"], "customer_access": {"isolation": "loose"}}),
    )
    .await;
    h.register(
        "w6",
        json!({
            "services": ["sim"],
            "customer_access": {"isolation": "strict", "allowed_customers": ["A"]}
        }),
    )
    .await;

    let (loose, strict) = tokio::join!(h.broker.claim("w6_loose"), h.broker.claim("w6"));
    assert!(loose.unwrap().is_none());
    assert_eq!(strict.unwrap().unwrap().worker_id.as_deref(), Some("w6"));
}

#[tokio::test]
async fn no_service_overlap_means_no_match_even_with_long_queue() {
    let h = harness().await;
    for i in 0..20 {
        h.submit(&format!("j{}", i), "sim", 10).await;
    }
    h.register("w_audio", json!({"services": ["audio"]})).await;
    assert!(h.broker.claim("w_audio").await.unwrap().is_none());
}

#[tokio::test]
async fn max_scan_zero_always_returns_no_match() {
    let h = harness_with_scan(0).await;
    h.submit("j1", "sim", 50).await;
    h.register("w1", json!({"services": ["sim"]})).await;
    assert!(h.broker.claim("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn submit_validation() {
    let h = harness().await;

    let err = h
        .broker
        .submit(submission("jx", "", 10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = h
        .broker
        .submit(submission("jx", "sim", -1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    h.submit("dup", "sim", 1).await;
    let err = h.broker.submit(submission("dup", "sim", 1)).await.unwrap_err();
    assert_eq!(err.kind(), "state_conflict");
}

#[tokio::test]
async fn progress_is_clamped_and_ownership_enforced() {
    let h = harness().await;
    h.submit("j1", "sim", 50).await;
    h.register("w1", json!({"services": ["sim"]})).await;
    h.register("w2", json!({"services": ["sim"]})).await;
    h.broker.claim("w1").await.unwrap().unwrap();

    let err = h
        .broker
        .progress("j1", "w2", 10.0, None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_owner");

    let record = h
        .broker
        .progress("j1", "w1", 150.0, None, None, None)
        .await
        .unwrap();
    assert_eq!(record.progress, 100.0);
    let record = h
        .broker
        .progress("j1", "w1", -5.0, None, None, None)
        .await
        .unwrap();
    assert_eq!(record.progress, 0.0);
    assert!(record.regressed, "backwards progress is annotated");
}

#[tokio::test]
async fn retryable_failure_requeues_and_preserves_order() {
    let h = harness().await;

    // Two jobs at the same priority; the earlier one must stay ahead
    // even after a failure round-trip.
    h.submit("j_early", "sim", 50).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    h.submit("j_late", "sim", 50).await;

    h.register("w1", json!({"services": ["sim"]})).await;
    let first = h.broker.claim("w1").await.unwrap().unwrap();
    assert_eq!(first.id, "j_early");

    h.broker
        .fail("j_early", "w1", "transient", true)
        .await
        .unwrap();

    let requeued = h.store.get_live_job("j_early").await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.last_failed_worker.as_deref(), Some("w1"));

    let again = h.broker.claim("w1").await.unwrap().unwrap();
    assert_eq!(again.id, "j_early", "requeue preserves composite order");

    let kinds = h.events_for("webhook", "j_early").await;
    assert!(kinds.contains(&"job.requeued".to_string()));
}

#[tokio::test]
async fn exhausted_retries_fail_terminally() {
    let h = harness().await;

    let mut sub = submission("j1", "sim", 50);
    sub.max_retries = Some(1);
    h.broker.submit(sub).await.unwrap();
    h.register("w1", json!({"services": ["sim"]})).await;
    h.broker.claim("w1").await.unwrap().unwrap();

    h.broker.fail("j1", "w1", "boom", true).await.unwrap();

    let failed = h.store.get_terminal_job("j1").await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(h.store.get_live_job("j1").await.unwrap().is_none());

    // Further reports about the job are state conflicts.
    let err = h.broker.fail("j1", "w1", "boom", true).await.unwrap_err();
    assert_eq!(err.kind(), "state_conflict");
}

#[tokio::test]
async fn cancel_pending_leaves_no_trace_in_the_index() {
    let h = harness().await;
    h.submit("j1", "sim", 50).await;

    let outcome = h.broker.cancel("j1").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);
    assert!(h.store.pending_score("j1").await.unwrap().is_none());
    assert!(h.store.pending_ids().await.unwrap().is_empty());

    let cancelled = h.store.get_terminal_job("j1").await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // Terminal: a second cancel is ignored.
    assert_eq!(h.broker.cancel("j1").await.unwrap(), CancelOutcome::Ignored);
}

#[tokio::test]
async fn cancel_running_marks_the_record_and_keeps_it_live() {
    let h = harness().await;
    h.submit("j1", "sim", 50).await;
    h.register("w1", json!({"services": ["sim"]})).await;
    h.broker.claim("w1").await.unwrap().unwrap();

    let outcome = h.broker.cancel("j1").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Requested);
    let job = h.store.get_live_job("j1").await.unwrap().unwrap();
    assert!(job.cancel_requested);
    assert_eq!(job.status, JobStatus::Assigned);
}

#[tokio::test]
async fn sync_restores_a_lost_index_entry() {
    let h = harness().await;
    h.submit("j1", "sim", 50).await;

    // Simulate index loss.
    h.store.remove_pending("j1").await.unwrap();
    assert!(h.store.pending_score("j1").await.unwrap().is_none());

    let job = h.broker.sync("j1").await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(h.store.pending_score("j1").await.unwrap().is_some());
}

#[tokio::test]
async fn worker_custom_capabilities_participate_in_matching() {
    let h = harness().await;

    let mut sub = submission("j1", "sim", 50);
    sub.requirements = serde_json::from_value(json!({
        "positive_requirements": {"drivers": ["cuda"]},
        "negative_requirements": {"region": "eu"}
    }))
    .unwrap();
    h.broker.submit(sub).await.unwrap();

    h.register(
        "w_eu",
        json!({"services": ["sim"], "drivers": ["cuda", "vulkan"], "region": "eu"}),
    )
    .await;
    h.register(
        "w_us",
        json!({"services": ["sim"], "drivers": ["cuda"], "region": "us"}),
    )
    .await;

    assert!(h.broker.claim("w_eu").await.unwrap().is_none());
    let job = h.broker.claim("w_us").await.unwrap().unwrap();
    assert_eq!(job.worker_id.as_deref(), Some("w_us"));
}

#[tokio::test]
async fn claim_appends_assigned_progress_and_zero_notification() {
    let h = harness().await;
    h.submit("j1", "sim", 50).await;
    h.register("w1", json!({"services": ["sim"]})).await;
    h.broker.claim("w1").await.unwrap().unwrap();

    let progress = h.store.read_progress("j1").await.unwrap();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].progress, 0.0);
    assert_eq!(progress[0].message.as_deref(), Some("assigned"));
    assert_eq!(progress[0].worker_id, "w1");

    // Claim also flips the registry entry.
    let worker = h.store.get_worker("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(worker.current_job_id.as_deref(), Some("j1"));
    let active = h.store.active_job_ids("w1").await.unwrap();
    assert_eq!(active, ["j1"]);
}
