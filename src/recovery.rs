// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Periodic reconciliation. Every tick: silent workers are marked gone
// and their jobs recovered, orphaned active jobs are requeued, the
// pending index is squared with the records it points at, and ignored
// cancel requests are escalated. All mutations go through broker
// primitives so the usual invariants and events apply. A tick that
// errors just ends; the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::JobBroker;
use crate::error::Result;
use crate::store::RedisStore;
use crate::types::{self, JobStatus, WorkerStatus};

#[derive(Debug, Default, PartialEq)]
pub struct RecoveryReport {
    pub stale_workers: usize,
    pub orphans_recovered: usize,
    pub index_repairs: usize,
    pub cancels_escalated: usize,
}

impl RecoveryReport {
    pub fn is_quiet(&self) -> bool {
        *self == RecoveryReport::default()
    }
}

pub struct RecoveryLoop {
    broker: Arc<JobBroker>,
    store: RedisStore,
    interval: Duration,
    /// Silence threshold after which a worker is treated as gone.
    worker_grace: Duration,
    /// How long a worker may sit on a cancel request before escalation.
    cancel_grace: Duration,
}

impl RecoveryLoop {
    pub fn new(
        broker: Arc<JobBroker>,
        interval: Duration,
        worker_grace: Duration,
        cancel_grace: Duration,
    ) -> Self {
        let store = broker.store().clone();
        Self {
            broker,
            store,
            interval,
            worker_grace,
            cancel_grace,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate tick; start sweeping after one period
            loop {
                ticker.tick().await;
                match self.tick().await {
                    Ok(report) if report.is_quiet() => debug!("recovery tick: nothing to do"),
                    Ok(report) => info!(
                        stale_workers = report.stale_workers,
                        orphans = report.orphans_recovered,
                        index_repairs = report.index_repairs,
                        cancels = report.cancels_escalated,
                        "recovery tick healed state"
                    ),
                    Err(e) => error!("recovery tick failed: {}", e),
                }
            }
        })
    }

    /// One reconciliation pass. Safe to run concurrently with normal
    /// operation and idempotent: a second back-to-back run finds nothing.
    pub async fn tick(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = types::now_ms();

        // Workers that stopped talking: mark disconnected and recover
        // whatever they were running.
        let grace_ms = self.worker_grace.as_millis() as i64;
        for worker in self.store.all_workers().await? {
            if worker.status == WorkerStatus::Disconnected {
                continue;
            }
            if now - worker.last_activity > grace_ms {
                warn!(worker_id = %worker.worker_id, "worker silent past grace, disconnecting");
                self.broker
                    .disconnect_worker(&worker.worker_id, "activity timeout")
                    .await?;
                report.stale_workers += 1;
            }
        }

        // Active jobs whose owner is gone (unregistered, disconnected,
        // or not actually tracking the job), plus stale cancel requests.
        let cancel_ms = self.cancel_grace.as_millis() as i64;
        for job in self.store.scan_live_jobs().await? {
            if !job.status.is_active() {
                continue;
            }
            let owner = job.worker_id.clone().unwrap_or_default();
            let worker = self.store.get_worker(&owner).await?;
            let alive = worker
                .map(|w| w.status != WorkerStatus::Disconnected)
                .unwrap_or(false);
            let tracked = self.store.active_job_ids(&owner).await?.contains(&job.id);
            if !alive || !tracked {
                warn!(job_id = %job.id, worker_id = %owner, "orphaned job, recovering");
                self.broker
                    .apply_failure(job, &owner, "orphaned", true)
                    .await?;
                report.orphans_recovered += 1;
                continue;
            }
            if job.cancel_requested {
                let requested_since = job.assigned_at.unwrap_or(job.created_at);
                if now - requested_since > cancel_ms {
                    warn!(job_id = %job.id, "cancel request ignored past grace, escalating");
                    self.broker.force_cancel(job).await?;
                    report.cancels_escalated += 1;
                }
            }
        }

        // The pending index must point at pending records and nothing
        // else.
        for id in self.store.pending_ids().await? {
            match self.store.get_live_job(&id).await? {
                None => {
                    warn!(job_id = %id, "pending index entry without live record, dropping");
                    self.store.remove_pending(&id).await?;
                    report.index_repairs += 1;
                }
                Some(job) if job.status == JobStatus::Pending => {}
                Some(mut job) if job.status.is_terminal() => {
                    warn!(job_id = %id, status = job.status.as_str(), "terminal record in pending index");
                    self.store.remove_pending(&id).await?;
                    job.worker_id = None;
                    self.store.move_to_terminal(&job, None).await?;
                    report.index_repairs += 1;
                }
                Some(mut job) => {
                    // Indexed but recorded active: the index wins, the
                    // record is corrected back to pending.
                    warn!(job_id = %id, status = job.status.as_str(), "active record in pending index, correcting");
                    let stale_owner = job.worker_id.take();
                    job.status = JobStatus::Pending;
                    job.assigned_at = None;
                    job.started_at = None;
                    self.store.put_job(&job).await?;
                    if let Some(owner) = stale_owner {
                        self.store.remove_active(&owner, &job.id).await?;
                    }
                    report.index_repairs += 1;
                }
            }
        }

        Ok(report)
    }
}
