// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Redis-backed state store. The store exclusively owns durable state:
// job records, the pending index, per-worker active maps, the worker
// registry, progress streams and the lifecycle event stream. Writes that
// must move a job between owners are wrapped in MULTI/EXEC pipelines;
// the claim itself runs as a server-side script (see `matcher`).

pub mod keys;
pub mod matcher;
pub mod records;
pub mod stream;

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::Result;
use crate::types::{Job, JobStatus, LifecycleEvent, ProgressRecord, WorkerInfo, WorkerStatus};

pub use matcher::Matcher;
pub use stream::{EventStreamConsumer, CONSUMER_GROUPS};

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // ------------------------------------------------------------------
    // Job records
    // ------------------------------------------------------------------

    /// Write a full job record, dropping any stale fields from a previous
    /// shape of the record.
    pub async fn put_job(&self, job: &Job) -> Result<()> {
        let pairs = records::job_to_pairs(job)?;
        let key = keys::job(&job.id);
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&key).ignore();
        pipe.hset_multiple(&key, &pairs).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Live record only (pending/assigned/processing).
    pub async fn get_live_job(&self, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn.hgetall(keys::job(id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        records::job_from_map(&map).map(Some)
    }

    /// Live record, falling back to the terminal maps.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        if let Some(job) = self.get_live_job(id).await? {
            return Ok(Some(job));
        }
        self.get_terminal_job(id).await
    }

    pub async fn mark_cancel_requested(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hset(keys::job(id), "cancel_requested", "1").await?;
        Ok(())
    }

    /// All live job records (SCAN, used by recovery and sync).
    pub async fn scan_live_jobs(&self) -> Result<Vec<Job>> {
        let mut conn = self.conn();
        let job_keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>("job:*").await?;
            let mut found = Vec::new();
            while let Some(key) = iter.next_item().await {
                found.push(key);
            }
            found
        };
        let mut jobs = Vec::with_capacity(job_keys.len());
        for key in job_keys {
            let map: HashMap<String, String> = conn.hgetall(&key).await?;
            if map.is_empty() {
                continue;
            }
            match records::job_from_map(&map) {
                Ok(job) => jobs.push(job),
                Err(e) => debug!(key = %key, error = %e, "skipping unreadable job record"),
            }
        }
        Ok(jobs)
    }

    // ------------------------------------------------------------------
    // Pending index
    // ------------------------------------------------------------------

    /// Persist a pending job and index it in one transaction.
    pub async fn insert_pending(&self, job: &Job) -> Result<()> {
        self.insert_pending_with_score(job, job.pending_score()).await
    }

    /// Variant used by requeue, which preserves the score captured at
    /// submit time instead of recomputing it.
    pub async fn insert_pending_with_score(&self, job: &Job, score: f64) -> Result<()> {
        let pairs = records::job_to_pairs(job)?;
        let key = keys::job(&job.id);
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&key).ignore();
        pipe.hset_multiple(&key, &pairs).ignore();
        pipe.zadd(keys::PENDING_INDEX, &job.id, score).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Returns true when the id was present (claim races use the script
    /// path instead; this is the broker/cancel/recovery path).
    pub async fn remove_pending(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(keys::PENDING_INDEX, id).await?;
        Ok(removed > 0)
    }

    /// Top of the queue by score, descending. Ties are re-ordered by the
    /// caller using the records' composite ordering.
    pub async fn pending_top(&self, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .zrevrange(keys::PENDING_INDEX, 0, limit as isize - 1)
            .await?;
        Ok(ids)
    }

    pub async fn pending_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.zrevrange(keys::PENDING_INDEX, 0, -1).await?;
        Ok(ids)
    }

    pub async fn pending_score(&self, id: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        let score: Option<f64> = conn.zscore(keys::PENDING_INDEX, id).await?;
        Ok(score)
    }

    // ------------------------------------------------------------------
    // Composite transitions
    // ------------------------------------------------------------------

    /// Return a failed job to the queue: rewrite the record, re-index it
    /// with the preserved score, and clear the previous owner's active
    /// entry, atomically.
    pub async fn requeue(&self, job: &Job, score: f64, prev_worker: &str) -> Result<()> {
        let pairs = records::job_to_pairs(job)?;
        let key = keys::job(&job.id);
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&key).ignore();
        pipe.hset_multiple(&key, &pairs).ignore();
        pipe.zadd(keys::PENDING_INDEX, &job.id, score).ignore();
        pipe.hdel(keys::worker_active(prev_worker), &job.id).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Move a job into its terminal map and drop the live record and the
    /// owner's active entry, atomically. The record's status decides the
    /// destination map (cancelled records live with failed).
    pub async fn move_to_terminal(&self, job: &Job, prev_worker: Option<&str>) -> Result<()> {
        let map_key = terminal_map_for(job.status);
        let json = serde_json::to_string(job)
            .map_err(|e| crate::error::BrokerError::Storage(format!("terminal record: {}", e)))?;
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(map_key, &job.id, json).ignore();
        pipe.del(keys::job(&job.id)).ignore();
        pipe.zrem(keys::PENDING_INDEX, &job.id).ignore();
        if let Some(worker) = prev_worker {
            pipe.hdel(keys::worker_active(worker), &job.id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal maps
    // ------------------------------------------------------------------

    pub async fn get_terminal_job(&self, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn();
        for map_key in [keys::COMPLETED_MAP, keys::FAILED_MAP] {
            let raw: Option<String> = conn.hget(map_key, id).await?;
            if let Some(raw) = raw {
                let job = serde_json::from_str(&raw).map_err(|e| {
                    crate::error::BrokerError::Storage(format!("terminal record {}: {}", id, e))
                })?;
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    pub async fn terminal_jobs(&self, map_key: &str) -> Result<Vec<Job>> {
        let mut conn = self.conn();
        let raws: Vec<String> = conn.hvals(map_key).await?;
        let mut jobs = Vec::with_capacity(raws.len());
        for raw in raws {
            match serde_json::from_str(&raw) {
                Ok(job) => jobs.push(job),
                Err(e) => debug!(error = %e, "skipping unreadable terminal record"),
            }
        }
        Ok(jobs)
    }

    pub async fn remove_terminal(&self, map_key: &str, id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.hdel(map_key, id).await?;
        Ok(removed > 0)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.conn();
        let pending: usize = conn.zcard(keys::PENDING_INDEX).await?;
        let completed: usize = conn.hlen(keys::COMPLETED_MAP).await?;
        let failed: usize = conn.hlen(keys::FAILED_MAP).await?;
        Ok(QueueCounts {
            pending,
            completed,
            failed,
        })
    }

    // ------------------------------------------------------------------
    // Worker registry
    // ------------------------------------------------------------------

    pub async fn put_worker(&self, info: &WorkerInfo) -> Result<()> {
        let pairs = records::worker_to_pairs(info)?;
        let key = keys::worker(&info.worker_id);
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&key).ignore();
        pipe.hset_multiple(&key, &pairs).ignore();
        pipe.sadd(keys::WORKERS_INDEX, &info.worker_id).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get_worker(&self, id: &str) -> Result<Option<WorkerInfo>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn.hgetall(keys::worker(id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        records::worker_from_map(&map).map(Some)
    }

    pub async fn worker_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(keys::WORKERS_INDEX).await?;
        Ok(ids)
    }

    pub async fn all_workers(&self) -> Result<Vec<WorkerInfo>> {
        let ids = self.worker_ids().await?;
        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(info) = self.get_worker(&id).await? {
                workers.push(info);
            }
        }
        Ok(workers)
    }

    pub async fn touch_worker(&self, id: &str, now_ms: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .hset(keys::worker(id), "last_activity", now_ms.to_string())
            .await?;
        Ok(())
    }

    pub async fn set_worker_state(
        &self,
        id: &str,
        status: WorkerStatus,
        current_job_id: Option<&str>,
    ) -> Result<()> {
        let key = keys::worker(id);
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(&key, "status", status.as_str()).ignore();
        match current_job_id {
            Some(job_id) => pipe.hset(&key, "current_job_id", job_id).ignore(),
            None => pipe.hdel(&key, "current_job_id").ignore(),
        };
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn remove_worker(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(keys::WORKERS_INDEX, id).ignore();
        pipe.del(keys::worker(id)).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-worker active maps
    // ------------------------------------------------------------------

    pub async fn active_job_ids(&self, worker_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.hkeys(keys::worker_active(worker_id)).await?;
        Ok(ids)
    }

    pub async fn remove_active(&self, worker_id: &str, job_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hdel(keys::worker_active(worker_id), job_id).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Progress streams + external progress channel
    // ------------------------------------------------------------------

    pub async fn append_progress(&self, record: &ProgressRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| crate::error::BrokerError::Storage(format!("progress record: {}", e)))?;
        let mut conn = self.conn();
        let _: String = redis::cmd("XADD")
            .arg(keys::progress(&record.job_id))
            .arg("*")
            .arg("record")
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn read_progress(&self, job_id: &str) -> Result<Vec<ProgressRecord>> {
        let mut conn = self.conn();
        let reply: StreamRangeReply = conn.xrange_all(keys::progress(job_id)).await?;
        let mut out = Vec::with_capacity(reply.ids.len());
        for entry in reply.ids {
            if let Some(raw) = entry.get::<String>("record") {
                match serde_json::from_str(&raw) {
                    Ok(record) => out.push(record),
                    Err(e) => debug!(job_id = %job_id, error = %e, "skipping unreadable progress entry"),
                }
            }
        }
        Ok(out)
    }

    /// Most recent progress entry, if any.
    pub async fn last_progress(&self, job_id: &str) -> Result<Option<ProgressRecord>> {
        let mut conn = self.conn();
        let reply: StreamRangeReply = conn
            .xrevrange_count(keys::progress(job_id), "+", "-", 1)
            .await?;
        let record = reply
            .ids
            .first()
            .and_then(|entry| entry.get::<String>("record"))
            .and_then(|raw| serde_json::from_str(&raw).ok());
        Ok(record)
    }

    pub async fn delete_progress(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(keys::progress(job_id)).await?;
        Ok(())
    }

    pub async fn publish_progress(&self, record: &ProgressRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| crate::error::BrokerError::Storage(format!("progress record: {}", e)))?;
        let mut conn = self.conn();
        let _: () = conn.publish(keys::PROGRESS_CHANNEL, json).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle event stream
    // ------------------------------------------------------------------

    /// Append one event; returns the stream record id.
    pub async fn append_event(&self, event: &LifecycleEvent) -> Result<String> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| crate::error::BrokerError::Storage(format!("event payload: {}", e)))?;
        let mut conn = self.conn();
        let id: String = redis::cmd("XADD")
            .arg(keys::EVENTS_STREAM)
            .arg("*")
            .arg("event_type")
            .arg(event.event_type.as_str())
            .arg("subject_id")
            .arg(&event.subject_id)
            .arg("timestamp")
            .arg(event.timestamp)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }
}

fn terminal_map_for(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Completed => keys::COMPLETED_MAP,
        _ => keys::FAILED_MAP,
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_jobs_land_in_the_failed_map() {
        assert_eq!(terminal_map_for(JobStatus::Completed), keys::COMPLETED_MAP);
        assert_eq!(terminal_map_for(JobStatus::Failed), keys::FAILED_MAP);
        assert_eq!(terminal_map_for(JobStatus::Cancelled), keys::FAILED_MAP);
    }
}
