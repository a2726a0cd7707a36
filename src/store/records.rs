// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Field-level mapping between domain records and Redis hashes. Job
// records are stored one hash per job so the claim script can flip
// status/worker_id without rewriting the whole record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{BrokerError, Result};
use crate::types::{
    Job, JobStatus, WorkerCapabilities, WorkerInfo, WorkerStatus,
};

pub fn job_to_pairs(job: &Job) -> Result<Vec<(&'static str, String)>> {
    let mut pairs: Vec<(&'static str, String)> = vec![
        ("id", job.id.clone()),
        ("service_required", job.service_required.clone()),
        ("priority", job.priority.to_string()),
        ("payload", to_json("payload", &job.payload)?),
        ("requirements", to_json("requirements", &job.requirements)?),
        ("status", job.status.as_str().to_string()),
        ("created_at", job.created_at.to_string()),
        ("retry_count", job.retry_count.to_string()),
        ("max_retries", job.max_retries.to_string()),
        ("cancel_requested", (if job.cancel_requested { "1" } else { "0" }).to_string()),
    ];
    push_opt(&mut pairs, "job_type", job.job_type.clone());
    push_opt(&mut pairs, "customer_id", job.customer_id.clone());
    push_opt(&mut pairs, "workflow_id", job.workflow_id.clone());
    push_opt(&mut pairs, "workflow_priority", job.workflow_priority.map(|p| p.to_string()));
    push_opt(
        &mut pairs,
        "workflow_datetime",
        job.workflow_datetime.map(|dt| dt.to_rfc3339()),
    );
    push_opt(&mut pairs, "step_number", job.step_number.map(|s| s.to_string()));
    push_opt(&mut pairs, "worker_id", job.worker_id.clone());
    push_opt(&mut pairs, "assigned_at", job.assigned_at.map(|t| t.to_string()));
    push_opt(&mut pairs, "started_at", job.started_at.map(|t| t.to_string()));
    push_opt(&mut pairs, "completed_at", job.completed_at.map(|t| t.to_string()));
    push_opt(&mut pairs, "failed_at", job.failed_at.map(|t| t.to_string()));
    push_opt(&mut pairs, "last_failed_worker", job.last_failed_worker.clone());
    if let Some(result) = &job.result {
        pairs.push(("result", to_json("result", result)?));
    }
    push_opt(&mut pairs, "error", job.error.clone());
    Ok(pairs)
}

pub fn job_from_map(map: &HashMap<String, String>) -> Result<Job> {
    let status_raw = required(map, "status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| corrupt(format!("unknown job status {:?}", status_raw)))?;
    Ok(Job {
        id: required(map, "id")?,
        service_required: required(map, "service_required")?,
        job_type: map.get("job_type").cloned(),
        priority: parse_field(map, "priority")?,
        payload: from_json(map, "payload")?.unwrap_or(serde_json::Value::Null),
        requirements: from_json(map, "requirements")?.unwrap_or_default(),
        customer_id: map.get("customer_id").cloned(),
        workflow_id: map.get("workflow_id").cloned(),
        workflow_priority: parse_opt(map, "workflow_priority")?,
        workflow_datetime: parse_datetime(map)?,
        step_number: parse_opt(map, "step_number")?,
        status,
        worker_id: map.get("worker_id").cloned().filter(|w| !w.is_empty()),
        created_at: parse_field(map, "created_at")?,
        assigned_at: parse_opt(map, "assigned_at")?,
        started_at: parse_opt(map, "started_at")?,
        completed_at: parse_opt(map, "completed_at")?,
        failed_at: parse_opt(map, "failed_at")?,
        retry_count: parse_field(map, "retry_count")?,
        max_retries: parse_field(map, "max_retries")?,
        last_failed_worker: map.get("last_failed_worker").cloned(),
        cancel_requested: map.get("cancel_requested").map(|v| v == "1").unwrap_or(false),
        result: from_json(map, "result")?,
        error: map.get("error").cloned(),
    })
}

pub fn worker_to_pairs(info: &WorkerInfo) -> Result<Vec<(&'static str, String)>> {
    let mut pairs: Vec<(&'static str, String)> = vec![
        ("worker_id", info.worker_id.clone()),
        ("capabilities", to_json("capabilities", &info.capabilities)?),
        ("status", info.status.as_str().to_string()),
        ("connected_at", info.connected_at.to_string()),
        ("last_activity", info.last_activity.to_string()),
    ];
    push_opt(&mut pairs, "current_job_id", info.current_job_id.clone());
    Ok(pairs)
}

pub fn worker_from_map(map: &HashMap<String, String>) -> Result<WorkerInfo> {
    let status_raw = required(map, "status")?;
    let status = match status_raw.as_str() {
        "idle" => WorkerStatus::Idle,
        "busy" => WorkerStatus::Busy,
        "disconnected" => WorkerStatus::Disconnected,
        other => return Err(corrupt(format!("unknown worker status {:?}", other))),
    };
    let capabilities: WorkerCapabilities = serde_json::from_str(&required(map, "capabilities")?)
        .map_err(|e| corrupt(format!("capabilities: {}", e)))?;
    Ok(WorkerInfo {
        worker_id: required(map, "worker_id")?,
        capabilities,
        status,
        current_job_id: map.get("current_job_id").cloned().filter(|j| !j.is_empty()),
        connected_at: parse_field(map, "connected_at")?,
        last_activity: parse_field(map, "last_activity")?,
    })
}

fn push_opt(pairs: &mut Vec<(&'static str, String)>, field: &'static str, value: Option<String>) {
    if let Some(value) = value {
        pairs.push((field, value));
    }
}

fn to_json<T: serde::Serialize>(field: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| corrupt(format!("{}: {}", field, e)))
}

fn from_json<T: serde::de::DeserializeOwned>(
    map: &HashMap<String, String>,
    field: &str,
) -> Result<Option<T>> {
    map.get(field)
        .map(|raw| serde_json::from_str(raw).map_err(|e| corrupt(format!("{}: {}", field, e))))
        .transpose()
}

fn required(map: &HashMap<String, String>, field: &str) -> Result<String> {
    map.get(field)
        .cloned()
        .ok_or_else(|| corrupt(format!("missing field {}", field)))
}

fn parse_field<T: std::str::FromStr>(map: &HashMap<String, String>, field: &str) -> Result<T> {
    required(map, field)?
        .parse()
        .map_err(|_| corrupt(format!("unparsable field {}", field)))
}

fn parse_opt<T: std::str::FromStr>(map: &HashMap<String, String>, field: &str) -> Result<Option<T>> {
    map.get(field)
        .map(|raw| raw.parse().map_err(|_| corrupt(format!("unparsable field {}", field))))
        .transpose()
}

fn parse_datetime(map: &HashMap<String, String>) -> Result<Option<DateTime<Utc>>> {
    map.get("workflow_datetime")
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("workflow_datetime: {}", e)))
        })
        .transpose()
}

fn corrupt(detail: String) -> BrokerError {
    BrokerError::Storage(format!("corrupt record: {}", detail))
}
