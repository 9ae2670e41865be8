// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tunables of the rotation state machine.

use std::time::Duration;

use crate::error::RotationError;
use crate::retry::Retry;
use crate::state::RotationPhase;

/// How long each waiting state may last before its timeout policy applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub provisioning: Duration,
    pub bootstrapping: Duration,
    pub mesh_linking: Duration,
    pub data_syncing: Duration,
    pub traffic_canary: Duration,
    pub switchover_locked: Duration,
    pub promoted: Duration,
    pub draining: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        PhaseTimeouts {
            provisioning: Duration::from_secs(30 * 60),
            bootstrapping: Duration::from_secs(20 * 60),
            mesh_linking: Duration::from_secs(10 * 60),
            data_syncing: Duration::from_secs(2 * 60 * 60),
            traffic_canary: Duration::from_secs(2 * 60 * 60),
            switchover_locked: Duration::from_secs(2 * 60),
            promoted: Duration::from_secs(60 * 60),
            draining: Duration::from_secs(30 * 60),
        }
    }
}

impl PhaseTimeouts {
    /// The timeout of `phase`, if it has one.
    pub fn for_phase(&self, phase: RotationPhase) -> Option<Duration> {
        use RotationPhase::*;
        match phase {
            Provisioning => Some(self.provisioning),
            Bootstrapping => Some(self.bootstrapping),
            MeshLinking => Some(self.mesh_linking),
            DataSyncing => Some(self.data_syncing),
            TrafficCanary => Some(self.traffic_canary),
            SwitchoverLocked => Some(self.switchover_locked),
            Promoted => Some(self.promoted),
            Draining => Some(self.draining),
            IdleStable | Fault => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RotationConfig {
    /// Replication lag above which switchover is refused.
    pub lag_threshold_bytes: u64,
    /// How long lag must stay under the threshold before canarying.
    pub lag_window: Duration,
    /// Target weights of the canary, strictly increasing.
    pub canary_steps: Vec<u32>,
    /// How long each canary weight bakes before stepping up.
    pub canary_bake: Duration,
    /// Minimum success rate of the target during the canary.
    pub canary_success_threshold: f64,
    pub timeouts: PhaseTimeouts,
    /// How often each group's task reconciles.
    pub poll_interval: Duration,
    pub retry: Retry,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            lag_threshold_bytes: 1024,
            lag_window: Duration::from_secs(60),
            canary_steps: vec![10, 50, 90],
            canary_bake: Duration::from_secs(5 * 60),
            canary_success_threshold: 0.99,
            timeouts: PhaseTimeouts::default(),
            poll_interval: Duration::from_secs(5),
            retry: Retry::default(),
        }
    }
}

impl RotationConfig {
    pub fn validate(&self) -> Result<(), RotationError> {
        if self.canary_steps.is_empty() {
            return Err(RotationError::InvalidRequest(
                "at least one canary step is required".into(),
            ));
        }
        if self.canary_steps.iter().any(|w| !(1..=99).contains(w)) {
            return Err(RotationError::InvalidRequest(format!(
                "canary weights must lie in 1..=99: {:?}",
                self.canary_steps
            )));
        }
        if self.canary_steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(RotationError::InvalidRequest(format!(
                "canary weights must strictly increase: {:?}",
                self.canary_steps
            )));
        }
        if !(0.0..=1.0).contains(&self.canary_success_threshold) {
            return Err(RotationError::InvalidRequest(format!(
                "canary success threshold {} is not a ratio",
                self.canary_success_threshold
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(RotationError::InvalidRequest(
                "retry budget must allow at least one attempt".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RotationConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.timeouts.for_phase(RotationPhase::SwitchoverLocked),
            Some(Duration::from_secs(120))
        );
        assert_eq!(config.timeouts.for_phase(RotationPhase::IdleStable), None);
    }

    #[test]
    fn canary_steps_must_increase() {
        let mut config = RotationConfig::default();
        config.canary_steps = vec![10, 10, 90];
        assert!(config.validate().is_err());
        config.canary_steps = vec![50, 100];
        assert!(config.validate().is_err());
        config.canary_steps = vec![];
        assert!(config.validate().is_err());
        config.canary_steps = vec![25];
        config.validate().unwrap();
    }
}
