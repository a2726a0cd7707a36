// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Schemaless capability values and the comparison rules used to match a
// worker's declared capabilities against a job's requirement bag. New job
// classes add keys, not code; the rules below are the single place the
// semantics live.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single capability value as declared by a worker or demanded by a job.
///
/// Deserialized untagged so requirement bags stay plain JSON on the wire:
/// `{"gpu_memory_gb": 24, "drivers": ["cuda", "vulkan"], "region": "eu"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<CapabilityValue>),
    Map(HashMap<String, CapabilityValue>),
}

impl CapabilityValue {
    /// The literal `"all"` waives a check wherever it appears as a
    /// required value.
    pub fn is_waiver(&self) -> bool {
        matches!(self, CapabilityValue::Text(s) if s == "all")
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CapabilityValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Whether `worker` satisfies `required`.
///
/// Rules, checked in order:
/// - required is an array: worker must be an array containing every
///   required item (subset);
/// - worker is an array, required is a scalar: the array must contain it;
/// - required is a number: worker must be a number and >= required;
/// - otherwise: equality.
///
/// A missing worker value never reaches this function; callers treat it
/// as no-match on the positive branch and as safe on the negative branch.
pub fn satisfies(worker: &CapabilityValue, required: &CapabilityValue) -> bool {
    if required.is_waiver() {
        return true;
    }
    match (worker, required) {
        (CapabilityValue::List(have), CapabilityValue::List(want)) => {
            want.iter().all(|item| have.contains(item))
        }
        // A scalar requirement against a list capability: containment.
        (CapabilityValue::List(have), scalar) => have.contains(scalar),
        (_, CapabilityValue::List(_)) => false,
        (CapabilityValue::Number(have), CapabilityValue::Number(want)) => have >= want,
        (_, CapabilityValue::Number(_)) => false,
        (have, want) => have == want,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> CapabilityValue {
        CapabilityValue::Number(n)
    }

    fn text(s: &str) -> CapabilityValue {
        CapabilityValue::Text(s.to_string())
    }

    fn list(items: &[&str]) -> CapabilityValue {
        CapabilityValue::List(items.iter().map(|s| text(s)).collect())
    }

    #[test]
    fn numeric_requirement_is_a_minimum() {
        assert!(satisfies(&num(48.0), &num(24.0)));
        assert!(satisfies(&num(24.0), &num(24.0)));
        assert!(!satisfies(&num(16.0), &num(24.0)));
    }

    #[test]
    fn non_number_never_satisfies_numeric_requirement() {
        assert!(!satisfies(&text("24"), &num(24.0)));
        assert!(!satisfies(&CapabilityValue::Bool(true), &num(1.0)));
    }

    #[test]
    fn required_array_means_subset() {
        assert!(satisfies(&list(&["cuda", "vulkan", "opencl"]), &list(&["cuda", "vulkan"])));
        assert!(!satisfies(&list(&["cuda"]), &list(&["cuda", "vulkan"])));
        // Worker scalar can never cover an array requirement.
        assert!(!satisfies(&text("cuda"), &list(&["cuda"])));
    }

    #[test]
    fn worker_array_contains_scalar_requirement() {
        assert!(satisfies(&list(&["eu", "us"]), &text("eu")));
        assert!(!satisfies(&list(&["eu", "us"]), &text("ap")));
    }

    #[test]
    fn scalars_fall_back_to_equality() {
        assert!(satisfies(&text("eu"), &text("eu")));
        assert!(!satisfies(&text("eu"), &text("us")));
        assert!(satisfies(&CapabilityValue::Bool(true), &CapabilityValue::Bool(true)));
        assert!(!satisfies(&CapabilityValue::Bool(false), &CapabilityValue::Bool(true)));
    }

    #[test]
    fn all_waives_any_check() {
        assert!(satisfies(&num(1.0), &text("all")));
        assert!(satisfies(&text("anything"), &text("all")));
    }

    #[test]
    fn untagged_json_round_trip() {
        let v: CapabilityValue = serde_json::from_str(r#"{"gpu_memory_gb": 24}"#).unwrap();
        match v {
            CapabilityValue::Map(m) => assert_eq!(m["gpu_memory_gb"], num(24.0)),
            other => panic!("expected map, got {:?}", other),
        }
    }
}
