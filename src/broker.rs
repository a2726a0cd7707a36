// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// The job broker: the only writer to job records and queues. Every
// operation verifies ownership and state before mutating, persists
// through the store, and emits the corresponding lifecycle event.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{BrokerError, Result};
use crate::events::EventBroadcaster;
use crate::store::{keys, Matcher, QueueCounts, RedisStore};
use crate::types::{
    self, EventKind, Job, JobStatus, JobSubmission, LifecycleEvent, ProgressRecord,
    WorkerCapabilities, WorkerInfo, WorkerStatus,
};

/// Seam through which the broker asks the hub to deliver a cancel signal
/// to the worker that owns a job.
#[async_trait]
pub trait CancelNotifier: Send + Sync {
    async fn notify_cancel(&self, worker_id: &str, job_id: &str);
}

/// Used when no hub is attached (tools, tests).
pub struct NoopCancelNotifier;

#[async_trait]
impl CancelNotifier for NoopCancelNotifier {
    async fn notify_cancel(&self, _worker_id: &str, _job_id: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled.
    Cancelled,
    /// The job is running; the owning worker has been signalled.
    Requested,
    /// The job was already terminal; nothing changed.
    Ignored,
}

#[derive(Debug, Default, Serialize)]
pub struct ArchiveStats {
    pub archived: usize,
    pub partitions: usize,
}

/// Point-in-time view sent to monitors requesting full state.
#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub workers: Vec<WorkerInfo>,
    pub pending_jobs: Vec<Job>,
    pub active_jobs: Vec<Job>,
    pub completed_jobs: Vec<Job>,
    pub failed_jobs: Vec<Job>,
    pub counts: SnapshotCounts,
}

#[derive(Debug, Serialize)]
pub struct SnapshotCounts {
    pub workers: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct JobBroker {
    store: RedisStore,
    matcher: Matcher,
    broadcaster: Arc<EventBroadcaster>,
    notifier: Arc<dyn CancelNotifier>,
}

impl JobBroker {
    pub fn new(
        store: RedisStore,
        broadcaster: Arc<EventBroadcaster>,
        notifier: Arc<dyn CancelNotifier>,
        matcher_max_scan: usize,
    ) -> Self {
        let matcher = Matcher::new(store.clone(), matcher_max_scan);
        Self {
            store,
            matcher,
            broadcaster,
            notifier,
        }
    }

    pub fn store(&self) -> &RedisStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    pub async fn submit(&self, submission: JobSubmission) -> Result<Job> {
        if submission.service_required.is_empty() {
            return Err(BrokerError::Validation(
                "service_required must be set".to_string(),
            ));
        }
        if submission.priority < 0 {
            return Err(BrokerError::Validation(format!(
                "priority must be non-negative, got {}",
                submission.priority
            )));
        }

        let job = Job::from_submission(submission, types::now_ms());
        if self.store.get_job(&job.id).await?.is_some() {
            return Err(BrokerError::StateConflict(format!(
                "job {} already exists",
                job.id
            )));
        }

        self.store.insert_pending(&job).await?;
        info!(job_id = %job.id, service = %job.service_required, priority = job.priority, "job submitted");
        self.emit(
            EventKind::JobSubmitted,
            &job.id,
            json!({
                "service_required": job.service_required,
                "job_type": job.job_type,
                "priority": job.priority,
                "workflow_id": job.workflow_id,
                "customer_id": job.customer_id,
            }),
        )
        .await?;
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Claiming
    // ------------------------------------------------------------------

    /// Run the matcher for a registered worker. `Some` means the job has
    /// been atomically claimed and the assignment event emitted.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("worker {}", worker_id)))?;

        let claimed = self.matcher.claim_for(&worker).await?;
        if let Some(job) = &claimed {
            self.emit(
                EventKind::JobAssigned,
                &job.id,
                json!({
                    "worker_id": worker_id,
                    "service_required": job.service_required,
                    "customer_id": job.customer_id,
                }),
            )
            .await?;
            self.emit(
                EventKind::WorkerStatusChanged,
                worker_id,
                json!({"status": "busy", "job_id": job.id}),
            )
            .await?;
        }
        Ok(claimed)
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    pub async fn progress(
        &self,
        job_id: &str,
        worker_id: &str,
        progress: f64,
        message: Option<String>,
        current_step: Option<u32>,
        total_steps: Option<u32>,
    ) -> Result<ProgressRecord> {
        let mut job = self.owned_live_job(job_id, worker_id).await?;

        // First report moves the job from assigned to processing.
        if job.status == JobStatus::Assigned {
            job.status = JobStatus::Processing;
            job.started_at = Some(types::now_ms());
            self.store.put_job(&job).await?;
        }

        let clamped = progress.clamp(0.0, 100.0);
        let regressed = match self.store.last_progress(job_id).await? {
            Some(last) => clamped < last.progress,
            None => false,
        };

        let record = ProgressRecord {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
            progress: clamped,
            message,
            current_step,
            total_steps,
            regressed,
            timestamp: types::now_ms(),
        };
        self.store.append_progress(&record).await?;
        self.store.publish_progress(&record).await?;
        self.store.touch_worker(worker_id, record.timestamp).await?;

        self.emit(
            EventKind::JobProgress,
            job_id,
            json!({
                "worker_id": worker_id,
                "progress": record.progress,
                "message": record.message,
                "current_step": record.current_step,
                "total_steps": record.total_steps,
            }),
        )
        .await?;
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Completion / failure
    // ------------------------------------------------------------------

    pub async fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Job> {
        let mut job = self.owned_live_job(job_id, worker_id).await?;
        let now = types::now_ms();

        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.result = Some(result);
        job.worker_id = None;
        job.cancel_requested = false;

        self.store.move_to_terminal(&job, Some(worker_id)).await?;
        self.finish_progress(&job.id, worker_id, 100.0, "completed", now)
            .await?;
        self.idle_worker(worker_id).await?;

        info!(job_id = %job.id, worker_id, "job completed");
        self.emit(
            EventKind::JobCompleted,
            &job.id,
            json!({"worker_id": worker_id, "customer_id": job.customer_id}),
        )
        .await?;
        self.emit(
            EventKind::WorkerStatusChanged,
            worker_id,
            json!({"status": "idle"}),
        )
        .await?;
        Ok(job)
    }

    pub async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Job> {
        let job = self.owned_live_job(job_id, worker_id).await?;
        let job = self.apply_failure(job, worker_id, error, retryable).await?;
        self.idle_worker(worker_id).await?;
        self.emit(
            EventKind::WorkerStatusChanged,
            worker_id,
            json!({"status": "idle"}),
        )
        .await?;
        Ok(job)
    }

    /// Retry bookkeeping shared by `fail`, worker disconnects and orphan
    /// recovery. The caller has already established who owned the job.
    pub(crate) async fn apply_failure(
        &self,
        mut job: Job,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Job> {
        // A pending cancel outranks retry handling; the job must not be
        // recycled back into the queue.
        if job.cancel_requested {
            return self.force_cancel(job).await;
        }

        let now = types::now_ms();
        job.retry_count += 1;
        job.last_failed_worker = Some(worker_id.to_string());
        job.error = Some(error.to_string());

        if retryable && job.retry_count < job.max_retries {
            // Back to the queue with the composite score it was
            // submitted with; created_at is deliberately not refreshed.
            let score = job.pending_score();
            job.status = JobStatus::Pending;
            job.worker_id = None;
            job.assigned_at = None;
            job.started_at = None;
            self.store.requeue(&job, score, worker_id).await?;
            warn!(job_id = %job.id, worker_id, retry_count = job.retry_count, "job requeued");
            self.emit(
                EventKind::JobRequeued,
                &job.id,
                json!({
                    "worker_id": worker_id,
                    "retry_count": job.retry_count,
                    "max_retries": job.max_retries,
                    "error": error,
                }),
            )
            .await?;
        } else {
            job.status = JobStatus::Failed;
            job.failed_at = Some(now);
            job.worker_id = None;
            self.store.move_to_terminal(&job, Some(worker_id)).await?;
            self.finish_progress(&job.id, worker_id, 100.0, "failed", now)
                .await?;
            warn!(job_id = %job.id, worker_id, retry_count = job.retry_count, "job failed terminally");
            self.emit(
                EventKind::JobFailed,
                &job.id,
                json!({
                    "worker_id": worker_id,
                    "retry_count": job.retry_count,
                    "error": error,
                }),
            )
            .await?;
        }
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Err(BrokerError::NotFound(format!("job {}", job_id)));
        };

        match job.status {
            JobStatus::Pending => {
                self.store.remove_pending(job_id).await?;
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(types::now_ms());
                self.store.move_to_terminal(&job, None).await?;
                info!(job_id, "pending job cancelled");
                self.emit(EventKind::JobCancelled, job_id, json!({"was": "pending"}))
                    .await?;
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Assigned | JobStatus::Processing => {
                let worker_id = job.worker_id.clone().unwrap_or_default();
                self.store.mark_cancel_requested(job_id).await?;
                self.notifier.notify_cancel(&worker_id, job_id).await;
                info!(job_id, worker_id = %worker_id, "cancel requested from owning worker");
                Ok(CancelOutcome::Requested)
            }
            _ => Ok(CancelOutcome::Ignored),
        }
    }

    /// Escalation used by the recovery loop when a worker ignored a
    /// cancel request past the grace window.
    pub(crate) async fn force_cancel(&self, mut job: Job) -> Result<Job> {
        let prev_worker = job.worker_id.take();
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(types::now_ms());
        self.store.move_to_terminal(&job, prev_worker.as_deref()).await?;
        if let Some(worker) = &prev_worker {
            self.idle_worker(worker).await?;
        }
        self.emit(
            EventKind::JobCancelled,
            &job.id,
            json!({"was": "running", "worker_id": prev_worker}),
        )
        .await?;
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Sync / lookup
    // ------------------------------------------------------------------

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("job {}", job_id)))
    }

    /// Reconcile one job record against the pending index and the active
    /// maps. Admin tooling calls this when a record looks off; it applies
    /// the same healing rules as the recovery loop.
    pub async fn sync(&self, job_id: &str) -> Result<Job> {
        let job = self.get_job(job_id).await?;
        match job.status {
            JobStatus::Pending => {
                if self.store.pending_score(job_id).await?.is_none() {
                    warn!(job_id, "pending job missing from index, re-adding");
                    self.store.insert_pending_with_score(&job, job.pending_score()).await?;
                }
                Ok(job)
            }
            JobStatus::Assigned | JobStatus::Processing => {
                let owner = job.worker_id.clone().unwrap_or_default();
                let registered = self.store.get_worker(&owner).await?;
                let tracked = self
                    .store
                    .active_job_ids(&owner)
                    .await?
                    .contains(&job.id);
                if registered.is_none() || !tracked {
                    warn!(job_id, worker_id = %owner, "active job is orphaned, requeueing");
                    return self.apply_failure(job, &owner, "orphaned", true).await;
                }
                Ok(job)
            }
            _ => {
                // Terminal records must not linger in the index.
                if self.store.remove_pending(job_id).await? {
                    warn!(job_id, "removed terminal job from pending index");
                }
                Ok(job)
            }
        }
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub async fn register_worker(
        &self,
        worker_id: &str,
        capabilities: WorkerCapabilities,
    ) -> Result<WorkerInfo> {
        let info = WorkerInfo::register(worker_id.to_string(), capabilities, types::now_ms());
        self.store.put_worker(&info).await?;
        info!(worker_id, services = ?info.capabilities.services, "worker registered");
        self.emit(
            EventKind::WorkerRegistered,
            worker_id,
            json!({"services": info.capabilities.services}),
        )
        .await?;
        Ok(info)
    }

    /// Replace a worker's declared capabilities (claim requests may carry
    /// a refreshed set). Falls back to a fresh registration if the worker
    /// is unknown.
    pub async fn refresh_worker_capabilities(
        &self,
        worker_id: &str,
        capabilities: WorkerCapabilities,
    ) -> Result<WorkerInfo> {
        match self.store.get_worker(worker_id).await? {
            Some(mut info) => {
                info.capabilities = capabilities;
                info.last_activity = types::now_ms();
                self.store.put_worker(&info).await?;
                Ok(info)
            }
            None => self.register_worker(worker_id, capabilities).await,
        }
    }

    pub async fn worker_heartbeat(&self, worker_id: &str) -> Result<()> {
        self.store.touch_worker(worker_id, types::now_ms()).await
    }

    pub async fn worker_status_change(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        let current = match status {
            WorkerStatus::Busy => self
                .store
                .get_worker(worker_id)
                .await?
                .and_then(|w| w.current_job_id),
            _ => None,
        };
        self.store
            .set_worker_state(worker_id, status, current.as_deref())
            .await?;
        self.emit(
            EventKind::WorkerStatusChanged,
            worker_id,
            json!({"status": status.as_str()}),
        )
        .await?;
        Ok(())
    }

    /// Mark a worker gone and recover everything it was running. Used by
    /// the hub on connection close and by the recovery loop on staleness.
    pub async fn disconnect_worker(&self, worker_id: &str, reason: &str) -> Result<()> {
        let active = self.store.active_job_ids(worker_id).await?;
        for job_id in &active {
            match self.store.get_live_job(job_id).await? {
                Some(job) => {
                    self.apply_failure(job, worker_id, reason, true).await?;
                }
                None => {
                    self.store.remove_active(worker_id, job_id).await?;
                }
            }
        }
        self.store
            .set_worker_state(worker_id, WorkerStatus::Disconnected, None)
            .await?;
        info!(worker_id, recovered = active.len(), reason, "worker disconnected");
        self.emit(
            EventKind::WorkerDisconnected,
            worker_id,
            json!({"recovered_jobs": active, "reason": reason}),
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        let workers = self.store.all_workers().await?;

        let mut pending_jobs = Vec::new();
        for id in self.store.pending_ids().await? {
            if let Some(job) = self.store.get_live_job(&id).await? {
                pending_jobs.push(job);
            }
        }

        let mut active_jobs = Vec::new();
        for worker in &workers {
            for id in self.store.active_job_ids(&worker.worker_id).await? {
                if let Some(job) = self.store.get_live_job(&id).await? {
                    active_jobs.push(job);
                }
            }
        }

        let completed_jobs = self.store.terminal_jobs(keys::COMPLETED_MAP).await?;
        let failed_jobs = self.store.terminal_jobs(keys::FAILED_MAP).await?;

        let counts = SnapshotCounts {
            workers: workers.len(),
            pending: pending_jobs.len(),
            active: active_jobs.len(),
            completed: completed_jobs.len(),
            failed: failed_jobs.len(),
        };
        Ok(StateSnapshot {
            workers,
            pending_jobs,
            active_jobs,
            completed_jobs,
            failed_jobs,
            counts,
        })
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.store.counts().await
    }

    // ------------------------------------------------------------------
    // Archival
    // ------------------------------------------------------------------

    /// Move terminal jobs older than the cutoff into date/status JSONL
    /// partitions under `archive_dir`, then drop them from the store.
    /// Already-archived ids are gone from the terminal maps, so a second
    /// pass over the same window moves nothing.
    pub async fn archive(&self, older_than: Duration, archive_dir: &Path) -> Result<ArchiveStats> {
        let cutoff = types::now_ms() - older_than.as_millis() as i64;
        let mut stats = ArchiveStats::default();

        for map_key in [keys::COMPLETED_MAP, keys::FAILED_MAP] {
            let jobs = self.store.terminal_jobs(map_key).await?;
            let mut partitions: std::collections::HashMap<(String, &'static str), Vec<Job>> =
                std::collections::HashMap::new();
            for job in jobs {
                let finished = job
                    .completed_at
                    .or(job.failed_at)
                    .unwrap_or(job.created_at);
                if finished >= cutoff {
                    continue;
                }
                let date = chrono::DateTime::from_timestamp_millis(finished)
                    .map(|dt| dt.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "1970-01-01".to_string());
                partitions
                    .entry((date, job.status.as_str()))
                    .or_default()
                    .push(job);
            }

            for ((date, status), jobs) in partitions {
                let dir = archive_dir.join(&date);
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| BrokerError::Storage(format!("archive dir: {}", e)))?;
                let path = dir.join(format!("{}.jsonl", status));
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(|e| BrokerError::Storage(format!("archive file: {}", e)))?;
                for job in &jobs {
                    let line = serde_json::to_string(job)
                        .map_err(|e| BrokerError::Storage(format!("archive record: {}", e)))?;
                    file.write_all(line.as_bytes())
                        .await
                        .map_err(|e| BrokerError::Storage(format!("archive write: {}", e)))?;
                    file.write_all(b"\n")
                        .await
                        .map_err(|e| BrokerError::Storage(format!("archive write: {}", e)))?;
                }
                file.flush()
                    .await
                    .map_err(|e| BrokerError::Storage(format!("archive flush: {}", e)))?;

                // Only forget a job once its line is on disk.
                for job in &jobs {
                    self.store.remove_terminal(map_key, &job.id).await?;
                    self.store.delete_progress(&job.id).await?;
                    stats.archived += 1;
                }
                stats.partitions += 1;
                info!(date = %date, status, count = jobs.len(), "archived terminal jobs");
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn owned_live_job(&self, job_id: &str, worker_id: &str) -> Result<Job> {
        let Some(job) = self.store.get_live_job(job_id).await? else {
            if self.store.get_terminal_job(job_id).await?.is_some() {
                return Err(BrokerError::StateConflict(format!(
                    "job {} is already terminal",
                    job_id
                )));
            }
            return Err(BrokerError::NotFound(format!("job {}", job_id)));
        };
        if job.worker_id.as_deref() != Some(worker_id) {
            return Err(BrokerError::NotOwner {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }

    async fn finish_progress(
        &self,
        job_id: &str,
        worker_id: &str,
        progress: f64,
        message: &str,
        now: i64,
    ) -> Result<()> {
        let record = ProgressRecord {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
            progress,
            message: Some(message.to_string()),
            current_step: None,
            total_steps: None,
            regressed: false,
            timestamp: now,
        };
        self.store.append_progress(&record).await?;
        self.store.publish_progress(&record).await
    }

    async fn idle_worker(&self, worker_id: &str) -> Result<()> {
        self.store
            .set_worker_state(worker_id, WorkerStatus::Idle, None)
            .await?;
        self.store.touch_worker(worker_id, types::now_ms()).await
    }

    async fn emit(
        &self,
        kind: EventKind,
        subject_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.broadcaster
            .publish(LifecycleEvent::new(kind, subject_id, payload))
            .await
    }
}
