// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle event kinds emitted by the broker core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.submitted")]
    JobSubmitted,
    #[serde(rename = "job.assigned")]
    JobAssigned,
    #[serde(rename = "job.progress")]
    JobProgress,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "job.requeued")]
    JobRequeued,
    #[serde(rename = "worker.registered")]
    WorkerRegistered,
    #[serde(rename = "worker.disconnected")]
    WorkerDisconnected,
    #[serde(rename = "worker.status_changed")]
    WorkerStatusChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobSubmitted => "job.submitted",
            EventKind::JobAssigned => "job.assigned",
            EventKind::JobProgress => "job.progress",
            EventKind::JobCompleted => "job.completed",
            EventKind::JobFailed => "job.failed",
            EventKind::JobCancelled => "job.cancelled",
            EventKind::JobRequeued => "job.requeued",
            EventKind::WorkerRegistered => "worker.registered",
            EventKind::WorkerDisconnected => "worker.disconnected",
            EventKind::WorkerStatusChanged => "worker.status_changed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job.submitted" => Some(EventKind::JobSubmitted),
            "job.assigned" => Some(EventKind::JobAssigned),
            "job.progress" => Some(EventKind::JobProgress),
            "job.completed" => Some(EventKind::JobCompleted),
            "job.failed" => Some(EventKind::JobFailed),
            "job.cancelled" => Some(EventKind::JobCancelled),
            "job.requeued" => Some(EventKind::JobRequeued),
            "worker.registered" => Some(EventKind::WorkerRegistered),
            "worker.disconnected" => Some(EventKind::WorkerDisconnected),
            "worker.status_changed" => Some(EventKind::WorkerStatusChanged),
            _ => None,
        }
    }

    /// Topic prefix used by monitor subscriptions ("job" or "worker").
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::WorkerRegistered
            | EventKind::WorkerDisconnected
            | EventKind::WorkerStatusChanged => "worker",
            _ => "job",
        }
    }
}

/// One entry on the lifecycle event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_type: EventKind,
    pub subject_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
}

impl LifecycleEvent {
    pub fn new(event_type: EventKind, subject_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            subject_id: subject_id.into(),
            timestamp: super::now_ms(),
            payload,
        }
    }
}

/// One record on a per-job progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_id: String,
    pub worker_id: String,
    pub progress: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,

    /// Set when a report moved backwards; the value is kept as reported.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub regressed: bool,

    pub timestamp: i64,
}
