// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Prometheus monitoring metrics for the rotation orchestrator.
///
/// Intentionally not Clone because we expect this to be passed around in an
/// Arc.
pub struct Metrics {
    /// Completed state transitions, by source and destination state.
    pub transitions: IntCounterVec,
    /// Transitions or mutations blocked by the safety enforcer, by rule.
    pub vetoes: IntCounterVec,
    /// Rollbacks started, by kind and reason.
    pub rollbacks: IntCounterVec,
    /// Retries of external collaborator calls, by operation.
    pub external_retries: IntCounterVec,
    /// External collaborator calls that exhausted their retries.
    pub external_failures: IntCounterVec,
    /// Timeout alerts raised, by state.
    pub timeout_alerts: IntCounterVec,
    /// Groups forced into FAULT.
    pub faults: IntCounter,
    /// The ordinal of each group's current state.
    pub phase: IntGaugeVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Returns a new [Metrics] instance connected to the given registry.
    pub fn register_into(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.transitions.clone()))?;
        registry.register(Box::new(metrics.vetoes.clone()))?;
        registry.register(Box::new(metrics.rollbacks.clone()))?;
        registry.register(Box::new(metrics.external_retries.clone()))?;
        registry.register(Box::new(metrics.external_failures.clone()))?;
        registry.register(Box::new(metrics.timeout_alerts.clone()))?;
        registry.register(Box::new(metrics.faults.clone()))?;
        registry.register(Box::new(metrics.phase.clone()))?;
        Ok(metrics)
    }

    /// Returns a new [Metrics] instance that is not exported anywhere.
    pub fn unregistered() -> Self {
        fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
            IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric definition")
        }

        Metrics {
            transitions: counter_vec(
                "mz_rotation_transitions_total",
                "count of completed rotation state transitions",
                &["from", "to"],
            ),
            vetoes: counter_vec(
                "mz_rotation_vetoes_total",
                "count of transitions blocked by a safety rule",
                &["rule"],
            ),
            rollbacks: counter_vec(
                "mz_rotation_rollbacks_total",
                "count of rollbacks started",
                &["kind", "reason"],
            ),
            external_retries: counter_vec(
                "mz_rotation_external_retries_total",
                "count of retried external collaborator calls",
                &["op"],
            ),
            external_failures: counter_vec(
                "mz_rotation_external_failures_total",
                "count of external collaborator calls that exhausted their retries",
                &["op"],
            ),
            timeout_alerts: counter_vec(
                "mz_rotation_timeout_alerts_total",
                "count of timeout alerts raised",
                &["phase"],
            ),
            faults: IntCounter::new(
                "mz_rotation_faults_total",
                "count of groups forced into FAULT",
            )
            .expect("valid metric definition"),
            phase: IntGaugeVec::new(
                Opts::new(
                    "mz_rotation_phase",
                    "ordinal of the current rotation state of each group",
                ),
                &["group"],
            )
            .expect("valid metric definition"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once_per_registry() {
        let registry = Registry::new();
        let metrics = Metrics::register_into(&registry).expect("first registration");
        metrics.faults.inc();
        assert!(Metrics::register_into(&registry).is_err());
        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"mz_rotation_faults_total".to_owned()));
    }
}
