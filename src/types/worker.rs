// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::capability::CapabilityValue;
use super::job::CustomerIsolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Disconnected,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerAccess {
    #[serde(default)]
    pub isolation: CustomerIsolation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_customers: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_customers: Option<Vec<String>>,
}

/// Everything a worker declares about itself at registration. Unknown
/// keys are kept in `custom` and participate in matching via the
/// capability value rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,

    #[serde(default)]
    pub services: HashSet<String>,

    #[serde(default)]
    pub hardware: HashMap<String, f64>,

    #[serde(default)]
    pub models: HashMap<String, HashSet<String>>,

    #[serde(default)]
    pub customer_access: CustomerAccess,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(flatten)]
    pub custom: HashMap<String, CapabilityValue>,
}

impl WorkerCapabilities {
    /// An empty-string workflow restriction means unrestricted.
    pub fn workflow_restriction(&self) -> Option<&str> {
        self.workflow_id.as_deref().filter(|w| !w.is_empty())
    }
}

/// Durable registry record for a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,

    #[serde(flatten)]
    pub capabilities: WorkerCapabilities,

    pub status: WorkerStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<String>,

    pub connected_at: i64,
    pub last_activity: i64,
}

impl WorkerInfo {
    pub fn register(worker_id: String, capabilities: WorkerCapabilities, now_ms: i64) -> Self {
        Self {
            worker_id,
            capabilities,
            status: WorkerStatus::Idle,
            current_job_id: None,
            connected_at: now_ms,
            last_activity: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_record_starts_idle() {
        let info = WorkerInfo::register("w1".into(), WorkerCapabilities::default(), 7);
        assert_eq!(info.status, WorkerStatus::Idle);
        assert_eq!(info.connected_at, 7);
        assert_eq!(info.last_activity, 7);
        assert!(info.current_job_id.is_none());
    }

    #[test]
    fn empty_workflow_id_is_unrestricted() {
        let mut caps = WorkerCapabilities::default();
        assert!(caps.workflow_restriction().is_none());
        caps.workflow_id = Some(String::new());
        assert!(caps.workflow_restriction().is_none());
        caps.workflow_id = Some("wf-1".into());
        assert_eq!(caps.workflow_restriction(), Some("wf-1"));
    }

    #[test]
    fn capabilities_parse_with_custom_keys() {
        let caps: WorkerCapabilities = serde_json::from_str(
            r#"{
                "services": ["sim", "gpu"],
                "hardware": {"gpu_memory_gb": 48, "cpu_cores": 16},
                "models": {"sdxl": ["base", "refiner"]},
                "customer_access": {"isolation": "strict", "allowed_customers": ["A"]},
                "region": "eu",
                "drivers": ["cuda", "vulkan"]
            }"#,
        )
        .unwrap();
        assert!(caps.services.contains("gpu"));
        assert_eq!(caps.hardware["gpu_memory_gb"], 48.0);
        assert_eq!(caps.customer_access.isolation, CustomerIsolation::Strict);
        assert!(caps.custom.contains_key("region"));
        assert!(caps.custom.contains_key("drivers"));
    }

    #[test]
    fn worker_info_round_trips_with_flattened_capabilities() {
        let mut caps = WorkerCapabilities::default();
        caps.services.insert("sim".into());
        let info = WorkerInfo::register("w1".into(), caps, 1);
        let json = serde_json::to_string(&info).unwrap();
        let back: WorkerInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_id, "w1");
        assert!(back.capabilities.services.contains("sim"));
        assert_eq!(back.status, WorkerStatus::Idle);
    }
}
