// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Wire protocol: one JSON frame per message, every frame carrying id,
// type, timestamp and a data object. Inbound frames parse into a
// role-specific enum, so a monitor connection physically cannot produce
// a state-changing message: its enum has no such variant.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::broker::StateSnapshot;
use crate::error::{BrokerError, Result};
use crate::events::EventFilters;
use crate::types::{self, Job, JobSubmission, LifecycleEvent, WorkerCapabilities, WorkerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    Worker,
    Client,
    Monitor,
}

impl ConnectionRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "worker" => Some(ConnectionRole::Worker),
            "client" => Some(ConnectionRole::Client),
            "monitor" => Some(ConnectionRole::Monitor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Worker => "worker",
            ConnectionRole::Client => "client",
            ConnectionRole::Monitor => "monitor",
        }
    }
}

/// Raw inbound frame, before role dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(default)]
    pub timestamp: i64,

    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| BrokerError::Validation(format!("malformed frame: {}", e)))
    }
}

fn from_data<T: serde::de::DeserializeOwned>(msg_type: &str, data: &Value) -> Result<T> {
    serde_json::from_value(data.clone())
        .map_err(|e| BrokerError::Validation(format!("invalid {} payload: {}", msg_type, e)))
}

// ----------------------------------------------------------------------
// Worker role
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    #[serde(default)]
    pub preferred_types: Option<Vec<String>>,

    /// Refreshed capabilities; when present they replace the registered
    /// record before matching.
    #[serde(default)]
    pub capabilities: Option<WorkerCapabilities>,
}

fn default_max_jobs() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,

    #[serde(default)]
    pub worker_id: Option<String>,

    pub progress: f64,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub current_step: Option<u32>,

    #[serde(default)]
    pub total_steps: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionReport {
    pub job_id: String,

    #[serde(default)]
    pub worker_id: Option<String>,

    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailureReport {
    pub job_id: String,

    #[serde(default)]
    pub worker_id: Option<String>,

    pub error: String,

    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Register { capabilities: WorkerCapabilities },
    Claim(ClaimRequest),
    Progress(ProgressUpdate),
    Completion(CompletionReport),
    Failure(FailureReport),
    Heartbeat,
    StatusChange { status: WorkerStatus },
}

impl WorkerMessage {
    pub fn parse(frame: &Frame) -> Result<Self> {
        match frame.msg_type.as_str() {
            "register_worker" => {
                #[derive(Deserialize)]
                struct Payload {
                    #[serde(default)]
                    capabilities: WorkerCapabilities,
                }
                let payload: Payload = from_data(&frame.msg_type, &frame.data)?;
                Ok(WorkerMessage::Register {
                    capabilities: payload.capabilities,
                })
            }
            "claim_job" => Ok(WorkerMessage::Claim(from_data(&frame.msg_type, &frame.data)?)),
            "progress" => Ok(WorkerMessage::Progress(from_data(&frame.msg_type, &frame.data)?)),
            "completion" => Ok(WorkerMessage::Completion(from_data(&frame.msg_type, &frame.data)?)),
            "failure" => Ok(WorkerMessage::Failure(from_data(&frame.msg_type, &frame.data)?)),
            "heartbeat" => Ok(WorkerMessage::Heartbeat),
            "status_change" => {
                #[derive(Deserialize)]
                struct Payload {
                    status: WorkerStatus,
                }
                let payload: Payload = from_data(&frame.msg_type, &frame.data)?;
                Ok(WorkerMessage::StatusChange {
                    status: payload.status,
                })
            }
            other => Err(BrokerError::Validation(format!(
                "unknown message type for worker connection: {}",
                other
            ))),
        }
    }
}

// ----------------------------------------------------------------------
// Client role
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ClientMessage {
    SubmitJob(JobSubmission),
    CancelJob { job_id: String },
    SyncJob { job_id: String },
    SubscribeJobEvents { job_id: String },
}

#[derive(Debug, Clone, Deserialize)]
struct JobIdPayload {
    job_id: String,
}

impl ClientMessage {
    pub fn parse(frame: &Frame) -> Result<Self> {
        match frame.msg_type.as_str() {
            "submit_job" => Ok(ClientMessage::SubmitJob(from_data(&frame.msg_type, &frame.data)?)),
            "cancel_job" => {
                let payload: JobIdPayload = from_data(&frame.msg_type, &frame.data)?;
                Ok(ClientMessage::CancelJob {
                    job_id: payload.job_id,
                })
            }
            "sync_job" => {
                let payload: JobIdPayload = from_data(&frame.msg_type, &frame.data)?;
                Ok(ClientMessage::SyncJob {
                    job_id: payload.job_id,
                })
            }
            "subscribe_job_events" => {
                let payload: JobIdPayload = from_data(&frame.msg_type, &frame.data)?;
                Ok(ClientMessage::SubscribeJobEvents {
                    job_id: payload.job_id,
                })
            }
            other => Err(BrokerError::Validation(format!(
                "unknown message type for client connection: {}",
                other
            ))),
        }
    }
}

// ----------------------------------------------------------------------
// Monitor role (strictly read-only)
// ----------------------------------------------------------------------

pub const MONITOR_POLICY: &str =
    "monitor connections can only send: monitor_connect, subscribe, heartbeat, resync_request";

#[derive(Debug, Clone)]
pub enum MonitorMessage {
    Connect { request_full_state: bool },
    Subscribe { topics: Vec<String>, filters: EventFilters },
    Heartbeat,
    ResyncRequest { since_timestamp: i64, max_events: Option<usize> },
}

impl MonitorMessage {
    pub fn parse(frame: &Frame) -> Result<Self> {
        match frame.msg_type.as_str() {
            "monitor_connect" => {
                #[derive(Deserialize)]
                struct Payload {
                    #[serde(default)]
                    request_full_state: bool,
                }
                let payload: Payload = from_data(&frame.msg_type, &frame.data)?;
                Ok(MonitorMessage::Connect {
                    request_full_state: payload.request_full_state,
                })
            }
            "subscribe" => {
                #[derive(Deserialize)]
                struct Payload {
                    #[serde(default)]
                    topics: Vec<String>,
                    #[serde(default)]
                    filters: EventFilters,
                }
                let payload: Payload = from_data(&frame.msg_type, &frame.data)?;
                Ok(MonitorMessage::Subscribe {
                    topics: payload.topics,
                    filters: payload.filters,
                })
            }
            "heartbeat" => Ok(MonitorMessage::Heartbeat),
            "resync_request" => {
                #[derive(Deserialize)]
                struct Payload {
                    since_timestamp: i64,
                    #[serde(default)]
                    max_events: Option<usize>,
                }
                let payload: Payload = from_data(&frame.msg_type, &frame.data)?;
                Ok(MonitorMessage::ResyncRequest {
                    since_timestamp: payload.since_timestamp,
                    max_events: payload.max_events,
                })
            }
            _ => Err(BrokerError::Validation(MONITOR_POLICY.to_string())),
        }
    }
}

// ----------------------------------------------------------------------
// Outbound frames
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub id: String,

    #[serde(rename = "type")]
    pub msg_type: String,

    pub timestamp: i64,

    pub data: Value,
}

impl OutboundFrame {
    pub fn new(msg_type: &str, data: Value) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            msg_type: msg_type.to_string(),
            timestamp: types::now_ms(),
            data,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn system_status(connection_id: &str, role: ConnectionRole) -> Self {
        Self::new(
            "system_status",
            json!({
                "connection_id": connection_id,
                "role": role.as_str(),
                "server_time": types::now_ms(),
            }),
        )
    }

    pub fn error(err: &BrokerError) -> Self {
        Self::new(
            "error",
            json!({"kind": err.kind(), "message": err.to_string()}),
        )
    }

    pub fn heartbeat() -> Self {
        Self::new("heartbeat", json!({}))
    }

    pub fn heartbeat_ack() -> Self {
        Self::new("heartbeat_ack", json!({}))
    }

    pub fn worker_registered(worker_id: &str) -> Self {
        Self::new("worker_registered", json!({"worker_id": worker_id}))
    }

    pub fn assigned_job(job: &Job) -> Self {
        Self::new(
            "assigned_job",
            serde_json::to_value(job).unwrap_or(Value::Null),
        )
    }

    pub fn no_match() -> Self {
        Self::new("no_match", json!({}))
    }

    pub fn job_submitted(job_id: &str) -> Self {
        Self::new("job_submitted", json!({"job_id": job_id}))
    }

    pub fn cancel_result(job_id: &str, outcome: &str) -> Self {
        Self::new("cancel_result", json!({"job_id": job_id, "outcome": outcome}))
    }

    /// Server → worker cancel signal.
    pub fn cancel_job(job_id: &str) -> Self {
        Self::new("cancel_job", json!({"job_id": job_id}))
    }

    pub fn job_state(job: &Job) -> Self {
        Self::new("job_state", serde_json::to_value(job).unwrap_or(Value::Null))
    }

    pub fn event(event: &LifecycleEvent) -> Self {
        Self::new(
            "event",
            json!({
                "event_type": event.event_type.as_str(),
                "subject_id": event.subject_id,
                "timestamp": event.timestamp,
                "payload": event.payload,
            }),
        )
    }

    pub fn full_state_snapshot(snapshot: &StateSnapshot) -> Self {
        Self::new(
            "full_state_snapshot",
            serde_json::to_value(snapshot).unwrap_or(Value::Null),
        )
    }

    pub fn monitor_connected(connection_id: &str) -> Self {
        Self::new("monitor_connected", json!({"connection_id": connection_id}))
    }

    pub fn subscribed(topics: &[String]) -> Self {
        Self::new("subscribed", json!({"topics": topics}))
    }

    pub fn resync_complete(count: usize) -> Self {
        Self::new("resync_complete", json!({"events": count}))
    }
}
