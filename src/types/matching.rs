// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// The matching predicate: can this worker run this job? Evaluated per
// candidate during a claim scan, short-circuiting on the first failed
// check. The comparison semantics for schemaless capability values live
// in `capability::satisfies`; this module orders the checks.

use std::fmt;

use super::capability::{satisfies, CapabilityValue};
use super::job::{CustomerIsolation, Job, RequirementBranch};
use super::worker::WorkerCapabilities;

/// Why a candidate was skipped. Carried in debug logs and tests; workers
/// only ever observe `no_match`.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchRejection {
    WorkflowRestricted,
    ServiceUnsupported,
    Hardware(String),
    IsolationTooWeak,
    CustomerNotAllowed,
    CustomerDenied,
    MissingModels(String),
    Capability(String),
    NegativeRequirement(String),
}

impl fmt::Display for MatchRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchRejection::WorkflowRestricted => write!(f, "worker is restricted to another workflow"),
            MatchRejection::ServiceUnsupported => write!(f, "service not offered by worker"),
            MatchRejection::Hardware(key) => write!(f, "hardware requirement not met: {}", key),
            MatchRejection::IsolationTooWeak => write!(f, "strict customer isolation required"),
            MatchRejection::CustomerNotAllowed => write!(f, "customer not in worker allow list"),
            MatchRejection::CustomerDenied => write!(f, "customer in worker deny list"),
            MatchRejection::MissingModels(service) => write!(f, "missing models for service: {}", service),
            MatchRejection::Capability(key) => write!(f, "capability requirement not met: {}", key),
            MatchRejection::NegativeRequirement(key) => write!(f, "negative requirement violated: {}", key),
        }
    }
}

/// Full §-ordered predicate: workflow restriction, service, positive
/// requirements, negative requirements.
pub fn check(worker: &WorkerCapabilities, job: &Job) -> Result<(), MatchRejection> {
    if let Some(restriction) = worker.workflow_restriction() {
        if job.workflow_id.as_deref() != Some(restriction) {
            return Err(MatchRejection::WorkflowRestricted);
        }
    }

    if !job.service_required.is_empty() && !worker.services.contains(&job.service_required) {
        return Err(MatchRejection::ServiceUnsupported);
    }

    check_positive(worker, job, &job.requirements.positive_requirements)?;
    check_negative(worker, &job.requirements.negative_requirements)?;
    Ok(())
}

pub fn worker_can_run(worker: &WorkerCapabilities, job: &Job) -> bool {
    check(worker, job).is_ok()
}

fn check_positive(
    worker: &WorkerCapabilities,
    job: &Job,
    branch: &RequirementBranch,
) -> Result<(), MatchRejection> {
    for (key, required) in &branch.hardware {
        if required.is_waiver() {
            continue;
        }
        let minimum = required
            .as_number()
            .ok_or_else(|| MatchRejection::Hardware(key.clone()))?;
        match worker.hardware.get(key) {
            Some(have) if *have >= minimum => {}
            _ => return Err(MatchRejection::Hardware(key.clone())),
        }
    }

    if branch.customer_isolation == Some(CustomerIsolation::Strict)
        && worker.customer_access.isolation != CustomerIsolation::Strict
    {
        return Err(MatchRejection::IsolationTooWeak);
    }
    if let Some(allowed) = &worker.customer_access.allowed_customers {
        let ok = job
            .customer_id
            .as_ref()
            .map(|c| allowed.contains(c))
            .unwrap_or(false);
        if !ok {
            return Err(MatchRejection::CustomerNotAllowed);
        }
    }
    if let Some(denied) = &worker.customer_access.denied_customers {
        if let Some(customer) = &job.customer_id {
            if denied.contains(customer) {
                return Err(MatchRejection::CustomerDenied);
            }
        }
    }

    for (service, requirement) in &branch.models {
        if requirement.is_waiver() {
            continue;
        }
        let available = worker.models.get(service);
        let ok = requirement
            .required()
            .iter()
            .all(|model| available.map(|set| set.contains(model)).unwrap_or(false));
        if !ok {
            return Err(MatchRejection::MissingModels(service.clone()));
        }
    }

    for (key, required) in &branch.custom {
        match worker_custom_value(worker, key) {
            Some(have) if satisfies(have, required) => {}
            _ => return Err(MatchRejection::Capability(key.clone())),
        }
    }

    Ok(())
}

/// Negative branch: the candidate is skipped if the worker satisfies any
/// entry. A missing worker value is safe.
fn check_negative(
    worker: &WorkerCapabilities,
    branch: &RequirementBranch,
) -> Result<(), MatchRejection> {
    for (key, required) in &branch.hardware {
        if required.is_waiver() {
            continue;
        }
        if let (Some(have), Some(limit)) = (worker.hardware.get(key), required.as_number()) {
            if *have >= limit {
                return Err(MatchRejection::NegativeRequirement(key.clone()));
            }
        }
    }

    if let Some(isolation) = branch.customer_isolation {
        if worker.customer_access.isolation == isolation {
            return Err(MatchRejection::NegativeRequirement("customer_isolation".into()));
        }
    }

    for (service, requirement) in &branch.models {
        if requirement.is_waiver() {
            continue;
        }
        if let Some(available) = worker.models.get(service) {
            if requirement.required().iter().all(|m| available.contains(m)) {
                return Err(MatchRejection::NegativeRequirement(format!("models.{}", service)));
            }
        }
    }

    for (key, required) in &branch.custom {
        if let Some(have) = worker_custom_value(worker, key) {
            if satisfies(have, required) {
                return Err(MatchRejection::NegativeRequirement(key.clone()));
            }
        }
    }

    Ok(())
}

fn worker_custom_value<'a>(
    worker: &'a WorkerCapabilities,
    key: &str,
) -> Option<&'a CapabilityValue> {
    worker.custom.get(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::JobSubmission;
    use crate::types::worker::CustomerAccess;
    use std::collections::HashMap;

    fn job_with_requirements(requirements: &str) -> Job {
        let sub = JobSubmission {
            id: Some("j".into()),
            service_required: "gpu".into(),
            priority: 1,
            requirements: serde_json::from_str(requirements).unwrap(),
            ..Default::default()
        };
        Job::from_submission(sub, 0)
    }

    fn gpu_worker(memory_gb: f64) -> WorkerCapabilities {
        WorkerCapabilities {
            services: ["gpu".to_string()].into_iter().collect(),
            hardware: HashMap::from([("gpu_memory_gb".to_string(), memory_gb)]),
            ..Default::default()
        }
    }

    #[test]
    fn service_must_overlap() {
        let job = job_with_requirements("{}");
        let mut worker = gpu_worker(8.0);
        worker.services.clear();
        worker.services.insert("sim".into());
        assert_eq!(check(&worker, &job), Err(MatchRejection::ServiceUnsupported));
    }

    #[test]
    fn hardware_minimum_filters_small_workers() {
        let job = job_with_requirements(
            r#"{"positive_requirements": {"hardware": {"gpu_memory_gb": 24}}}"#,
        );
        assert!(worker_can_run(&gpu_worker(48.0), &job));
        assert!(worker_can_run(&gpu_worker(24.0), &job));
        assert!(!worker_can_run(&gpu_worker(16.0), &job));
    }

    #[test]
    fn hardware_all_waives_the_check() {
        let job = job_with_requirements(
            r#"{"positive_requirements": {"hardware": {"gpu_memory_gb": "all"}}}"#,
        );
        let mut worker = gpu_worker(1.0);
        worker.hardware.clear();
        assert!(worker_can_run(&worker, &job));
    }

    #[test]
    fn strict_isolation_requires_strict_worker() {
        let mut job = job_with_requirements(
            r#"{"positive_requirements": {"customer_isolation": "strict"}}"#,
        );
        job.customer_id = Some("A".into());

        let mut strict = gpu_worker(8.0);
        strict.customer_access = CustomerAccess {
            isolation: CustomerIsolation::Strict,
            allowed_customers: Some(vec!["A".into()]),
            denied_customers: None,
        };
        assert!(worker_can_run(&strict, &job));

        let mut loose = gpu_worker(8.0);
        loose.customer_access.isolation = CustomerIsolation::Loose;
        assert!(!worker_can_run(&loose, &job));
    }

    #[test]
    fn allow_and_deny_lists_are_enforced() {
        let mut job = job_with_requirements("{}");
        job.customer_id = Some("B".into());

        let mut worker = gpu_worker(8.0);
        worker.customer_access.allowed_customers = Some(vec!["A".into()]);
        assert_eq!(check(&worker, &job), Err(MatchRejection::CustomerNotAllowed));

        let mut worker = gpu_worker(8.0);
        worker.customer_access.denied_customers = Some(vec!["B".into()]);
        assert_eq!(check(&worker, &job), Err(MatchRejection::CustomerDenied));

        // A worker with an allow list rejects anonymous jobs too.
        let mut anonymous = job_with_requirements("{}");
        anonymous.customer_id = None;
        let mut worker = gpu_worker(8.0);
        worker.customer_access.allowed_customers = Some(vec!["A".into()]);
        assert_eq!(check(&worker, &anonymous), Err(MatchRejection::CustomerNotAllowed));
    }

    #[test]
    fn required_models_must_be_available() {
        let job = job_with_requirements(
            r#"{"positive_requirements": {"models": {"sdxl": ["base", "refiner"]}}}"#,
        );
        let mut worker = gpu_worker(8.0);
        worker.models.insert(
            "sdxl".into(),
            ["base".to_string(), "refiner".to_string()].into_iter().collect(),
        );
        assert!(worker_can_run(&worker, &job));

        worker.models.get_mut("sdxl").unwrap().remove("refiner");
        assert!(!worker_can_run(&worker, &job));

        let waived = job_with_requirements(
            r#"{"positive_requirements": {"models": {"sdxl": "all"}}}"#,
        );
        assert!(worker_can_run(&gpu_worker(8.0), &waived));
    }

    #[test]
    fn custom_capability_uses_value_rules() {
        let job = job_with_requirements(
            r#"{"positive_requirements": {"drivers": ["cuda"], "region": "eu"}}"#,
        );
        let mut worker = gpu_worker(8.0);
        worker.custom = serde_json::from_str(
            r#"{"drivers": ["cuda", "vulkan"], "region": "eu"}"#,
        )
        .unwrap();
        assert!(worker_can_run(&worker, &job));

        worker.custom.remove("region");
        assert_eq!(
            check(&worker, &job),
            Err(MatchRejection::Capability("region".into()))
        );
    }

    #[test]
    fn negative_hardware_rejects_at_or_above_limit() {
        let job = job_with_requirements(
            r#"{"negative_requirements": {"hardware": {"gpu_memory_gb": 40}}}"#,
        );
        assert!(worker_can_run(&gpu_worker(16.0), &job));
        assert!(!worker_can_run(&gpu_worker(40.0), &job));
        assert!(!worker_can_run(&gpu_worker(80.0), &job));

        // Missing value is safe on the negative branch.
        let mut bare = gpu_worker(0.0);
        bare.hardware.clear();
        assert!(worker_can_run(&bare, &job));
    }

    #[test]
    fn negative_custom_capability_skips_matching_workers() {
        let job = job_with_requirements(
            r#"{"negative_requirements": {"region": "eu"}}"#,
        );
        let mut worker = gpu_worker(8.0);
        worker.custom = serde_json::from_str(r#"{"region": "eu"}"#).unwrap();
        assert!(!worker_can_run(&worker, &job));

        worker.custom = serde_json::from_str(r#"{"region": "us"}"#).unwrap();
        assert!(worker_can_run(&worker, &job));

        worker.custom.clear();
        assert!(worker_can_run(&worker, &job));
    }

    #[test]
    fn workflow_restricted_worker_only_takes_its_workflow() {
        let mut job = job_with_requirements("{}");
        job.workflow_id = Some("wf-1".into());

        let mut worker = gpu_worker(8.0);
        worker.workflow_id = Some("wf-1".into());
        assert!(worker_can_run(&worker, &job));

        worker.workflow_id = Some("wf-2".into());
        assert!(!worker_can_run(&worker, &job));

        // Unrestricted workers take anything.
        worker.workflow_id = None;
        assert!(worker_can_run(&worker, &job));

        // A restricted worker does not take workflow-less jobs.
        worker.workflow_id = Some("wf-1".into());
        let plain = job_with_requirements("{}");
        assert!(!worker_can_run(&worker, &plain));
    }

    #[test]
    fn model_requirement_without_service_overlap_is_no_match() {
        // A long queue of unmatchable jobs still yields no_match.
        let job = job_with_requirements("{}");
        let mut worker = gpu_worker(8.0);
        worker.services.clear();
        worker.services.insert("audio".into());
        assert!(!worker_can_run(&worker, &job));
    }
}
