// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Redis key schema. Everything durable lives under these keys; no other
// module builds key strings.

/// Priority-ordered set of pending job ids (score = effective priority).
pub const PENDING_INDEX: &str = "jobs:pending";

/// Hash of terminal completed jobs, id -> full job JSON.
pub const COMPLETED_MAP: &str = "jobs:completed";

/// Hash of terminal failed jobs, id -> full job JSON.
pub const FAILED_MAP: &str = "jobs:failed";

/// Set of registered worker ids.
pub const WORKERS_INDEX: &str = "workers:index";

/// Global lifecycle event stream consumed by downstream groups.
pub const EVENTS_STREAM: &str = "events:lifecycle";

/// Pub/sub channel carrying progress notifications for downstream
/// delivery (webhook relays subscribe here).
pub const PROGRESS_CHANNEL: &str = "progress:updates";

/// Hash holding a live job record, one per job.
pub fn job(id: &str) -> String {
    format!("job:{}", id)
}

/// Hash holding a worker registry record.
pub fn worker(id: &str) -> String {
    format!("worker:{}", id)
}

/// Hash of a worker's active jobs, job id -> assigned-at ms.
pub fn worker_active(id: &str) -> String {
    format!("worker:{}:active", id)
}

/// Append-only progress stream for one job.
pub fn progress(job_id: &str) -> String {
    format!("progress:{}", job_id)
}
