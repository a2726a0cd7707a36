// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod capability;
pub mod event;
pub mod job;
pub mod matching;
pub mod worker;

pub use capability::CapabilityValue;
pub use event::{EventKind, LifecycleEvent, ProgressRecord};
pub use job::{
    CustomerIsolation, Job, JobRequirements, JobStatus, JobSubmission, ModelRequirement,
    RequirementBranch, DEFAULT_MAX_RETRIES,
};
pub use matching::{worker_can_run, MatchRejection};
pub use worker::{CustomerAccess, WorkerCapabilities, WorkerInfo, WorkerStatus};

/// Milliseconds since the UNIX epoch; the timestamp unit used on the wire
/// and in stored records.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
