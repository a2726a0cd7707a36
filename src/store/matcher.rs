// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Claim path: scan the pending index top-down, evaluate the matching
// predicate per candidate, then claim the first match with a server-side
// script. The script's ZREM is the test-and-set that settles races
// between concurrent claimers; everything after it runs atomically in
// the store, so a job can never be handed to two workers.

use redis::Script;
use tracing::{debug, info};

use super::{keys, RedisStore};
use crate::error::Result;
use crate::types::{self, matching, Job, JobStatus, ProgressRecord, WorkerInfo};

/// Seven-step claim protocol, executed atomically:
/// remove from pending (or bail), flip the record to assigned, write the
/// worker's active entry, mark the worker busy, publish the zero-progress
/// notification, and append the `assigned` progress entry.
const CLAIM_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[2], 'status', 'assigned', 'worker_id', ARGV[2], 'assigned_at', ARGV[3])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('HSET', KEYS[4], 'status', 'busy', 'current_job_id', ARGV[1], 'last_activity', ARGV[3])
redis.call('PUBLISH', ARGV[4], ARGV[5])
redis.call('XADD', KEYS[5], '*', 'record', ARGV[5])
return 1
"#;

pub struct Matcher {
    store: RedisStore,
    max_scan: usize,
    claim: Script,
}

impl Matcher {
    pub fn new(store: RedisStore, max_scan: usize) -> Self {
        Self {
            store,
            max_scan,
            claim: Script::new(CLAIM_SCRIPT),
        }
    }

    /// Find and claim the best pending job this worker can run. Returns
    /// the claimed job with its record already transitioned to assigned,
    /// or `None` when nothing in the scan window matches.
    pub async fn claim_for(&self, worker: &WorkerInfo) -> Result<Option<Job>> {
        if self.max_scan == 0 {
            return Ok(None);
        }

        let ids = self.store.pending_top(self.max_scan).await?;
        if ids.is_empty() {
            return Ok(None);
        }

        let mut candidates = Vec::with_capacity(ids.len());
        for id in &ids {
            // A candidate can vanish between the range read and the
            // record fetch when another claimer wins it; skip.
            if let Some(job) = self.store.get_live_job(id).await? {
                if job.status == JobStatus::Pending {
                    candidates.push(job);
                }
            }
        }
        order_candidates(&mut candidates);

        for job in candidates {
            match matching::check(&worker.capabilities, &job) {
                Ok(()) => {}
                Err(rejection) => {
                    debug!(job_id = %job.id, worker_id = %worker.worker_id, %rejection, "candidate skipped");
                    continue;
                }
            }
            if let Some(claimed) = self.try_claim(job, worker).await? {
                return Ok(Some(claimed));
            }
            // Race lost; keep scanning.
        }

        Ok(None)
    }

    async fn try_claim(&self, mut job: Job, worker: &WorkerInfo) -> Result<Option<Job>> {
        let now = types::now_ms();
        let record = ProgressRecord {
            job_id: job.id.clone(),
            worker_id: worker.worker_id.clone(),
            progress: 0.0,
            message: Some("assigned".to_string()),
            current_step: None,
            total_steps: None,
            regressed: false,
            timestamp: now,
        };
        let record_json = serde_json::to_string(&record)
            .map_err(|e| crate::error::BrokerError::Storage(format!("progress record: {}", e)))?;

        let mut conn = self.store.conn.clone();
        let won: i64 = self
            .claim
            .key(keys::PENDING_INDEX)
            .key(keys::job(&job.id))
            .key(keys::worker_active(&worker.worker_id))
            .key(keys::worker(&worker.worker_id))
            .key(keys::progress(&job.id))
            .arg(&job.id)
            .arg(&worker.worker_id)
            .arg(now)
            .arg(keys::PROGRESS_CHANNEL)
            .arg(&record_json)
            .invoke_async(&mut conn)
            .await?;

        if won == 0 {
            debug!(job_id = %job.id, worker_id = %worker.worker_id, "claim race lost");
            return Ok(None);
        }

        job.status = JobStatus::Assigned;
        job.worker_id = Some(worker.worker_id.clone());
        job.assigned_at = Some(now);
        info!(job_id = %job.id, worker_id = %worker.worker_id, "job claimed");
        Ok(Some(job))
    }
}

/// Composite ordering: effective priority descending, then the workflow
/// datetime (or creation time) ascending, then id for a stable tiebreak.
pub fn order_candidates(candidates: &mut [Job]) {
    candidates.sort_by(|a, b| {
        b.effective_priority()
            .cmp(&a.effective_priority())
            .then_with(|| a.order_timestamp().cmp(&b.order_timestamp()))
            .then_with(|| a.id.cmp(&b.id))
    });
}
