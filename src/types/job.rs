// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::capability::CapabilityValue;

/// Default retry budget for submissions that do not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Assigned => "assigned",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "assigned" => Some(JobStatus::Assigned),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses that carry a non-empty `worker_id`.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CustomerIsolation {
    #[default]
    None,
    Loose,
    Strict,
}

/// Per-service model requirement. The literal `"all"` waives the check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelRequirement {
    Many(Vec<String>),
    One(String),
}

impl ModelRequirement {
    pub fn is_waiver(&self) -> bool {
        matches!(self, ModelRequirement::One(s) if s == "all")
    }

    pub fn required(&self) -> &[String] {
        match self {
            ModelRequirement::Many(list) => list,
            ModelRequirement::One(one) => std::slice::from_ref(one),
        }
    }
}

/// One branch of a requirement predicate. `positive` entries must all be
/// satisfied by the worker; `negative` entries must none be satisfied.
/// Unknown keys land in `custom` and are compared with the capability
/// value rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequirementBranch {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub hardware: HashMap<String, CapabilityValue>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub models: HashMap<String, ModelRequirement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_isolation: Option<CustomerIsolation>,

    #[serde(flatten)]
    pub custom: HashMap<String, CapabilityValue>,
}

impl RequirementBranch {
    pub fn is_empty(&self) -> bool {
        self.hardware.is_empty()
            && self.models.is_empty()
            && self.customer_isolation.is_none()
            && self.custom.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequirements {
    #[serde(default, skip_serializing_if = "RequirementBranch::is_empty")]
    pub positive_requirements: RequirementBranch,

    #[serde(default, skip_serializing_if = "RequirementBranch::is_empty")]
    pub negative_requirements: RequirementBranch,
}

/// What a client sends to create a job. The broker fills in identity,
/// status and timestamps on submit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub service_required: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,

    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub requirements: JobRequirements,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_priority: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_datetime: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub service_required: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,

    pub priority: i64,

    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub requirements: JobRequirements,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_priority: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_datetime: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,

    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    pub created_at: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub max_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_worker: Option<String>,

    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Build a fresh pending job from a submission.
    pub fn from_submission(submission: JobSubmission, now_ms: i64) -> Self {
        let id = submission
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("job-{}", uuid::Uuid::new_v4()));
        Self {
            id,
            service_required: submission.service_required,
            job_type: submission.job_type,
            priority: submission.priority,
            payload: submission.payload,
            requirements: submission.requirements,
            customer_id: submission.customer_id,
            workflow_id: submission.workflow_id.filter(|w| !w.is_empty()),
            workflow_priority: submission.workflow_priority,
            workflow_datetime: submission.workflow_datetime,
            step_number: submission.step_number,
            status: JobStatus::Pending,
            worker_id: None,
            created_at: now_ms,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            retry_count: 0,
            max_retries: submission.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            last_failed_worker: None,
            cancel_requested: false,
            result: None,
            error: None,
        }
    }

    /// Primary ordering component: workflow priority wins over the job's
    /// own priority so workflow steps inherit their workflow's position.
    pub fn effective_priority(&self) -> i64 {
        self.workflow_priority.unwrap_or(self.priority)
    }

    /// Secondary ordering component, ascending (older first). Steps of a
    /// workflow order by the workflow's datetime, not their own creation.
    pub fn order_timestamp(&self) -> i64 {
        self.workflow_datetime
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(self.created_at)
    }

    /// Score for the pending index. Ties on the score are broken by
    /// `order_timestamp` during candidate iteration.
    pub fn pending_score(&self) -> f64 {
        self.effective_priority() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(id: &str, priority: i64) -> JobSubmission {
        JobSubmission {
            id: Some(id.to_string()),
            service_required: "sim".to_string(),
            priority,
            ..Default::default()
        }
    }

    #[test]
    fn submission_defaults_are_filled_in() {
        let job = Job::from_submission(submission("j1", 50), 1_000);
        assert_eq!(job.id, "j1");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.created_at, 1_000);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.retry_count, 0);
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn missing_id_gets_generated() {
        let mut sub = submission("", 1);
        sub.id = None;
        let a = Job::from_submission(sub.clone(), 0);
        let b = Job::from_submission(sub, 0);
        assert!(a.id.starts_with("job-"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn workflow_priority_overrides_job_priority() {
        let mut sub = submission("j3a", 10);
        sub.workflow_id = Some("wf".to_string());
        sub.workflow_priority = Some(100);
        let job = Job::from_submission(sub, 0);
        assert_eq!(job.effective_priority(), 100);

        let plain = Job::from_submission(submission("j3b", 90), 0);
        assert_eq!(plain.effective_priority(), 90);
        assert!(job.pending_score() > plain.pending_score());
    }

    #[test]
    fn workflow_datetime_orders_instead_of_created_at() {
        let mut sub = submission("j1", 10);
        sub.workflow_datetime = Some("2024-01-01T00:00:00Z".parse().unwrap());
        let job = Job::from_submission(sub, 9_999_999);
        assert_eq!(job.order_timestamp(), 1_704_067_200_000);

        let plain = Job::from_submission(submission("j2", 10), 42);
        assert_eq!(plain.order_timestamp(), 42);
    }

    #[test]
    fn empty_workflow_id_means_no_workflow() {
        let mut sub = submission("j1", 1);
        sub.workflow_id = Some(String::new());
        let job = Job::from_submission(sub, 0);
        assert!(job.workflow_id.is_none());
    }

    #[test]
    fn requirements_parse_from_plain_json() {
        let req: JobRequirements = serde_json::from_str(
            r#"{
                "positive_requirements": {
                    "hardware": {"gpu_memory_gb": 24, "cpu_cores": "all"},
                    "models": {"sdxl": ["base", "refiner"], "llm": "all"},
                    "customer_isolation": "strict",
                    "region": "eu"
                },
                "negative_requirements": {
                    "hardware": {"gpu_memory_gb": 80}
                }
            }"#,
        )
        .unwrap();
        let pos = &req.positive_requirements;
        assert_eq!(pos.hardware.len(), 2);
        assert!(pos.hardware["cpu_cores"].is_waiver());
        assert!(pos.models["llm"].is_waiver());
        assert_eq!(pos.models["sdxl"].required(), ["base", "refiner"]);
        assert_eq!(pos.customer_isolation, Some(CustomerIsolation::Strict));
        assert!(pos.custom.contains_key("region"));
        assert!(!req.negative_requirements.is_empty());
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job::from_submission(submission("j1", 50), 1_000);
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::Pending);
        assert_eq!(back.priority, 50);
    }
}
