// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Safety rules consulted before every transition.
//!
//! Everything here is a pure function of the values it is handed. Callers
//! gather the observations, the enforcer only says yes or no.

use crate::collaborators::{LinkHealth, ReplicationStatus};
use crate::error::{SafetyRule, Violation};
use crate::gateway::ObservedConfig;
use crate::id::ClusterId;
use crate::state::{RotationPhase, RotationState};
use crate::traffic::TrafficSplit;
use crate::write_pointer::WritePointer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SafetyConfig {
    pub lag_threshold_bytes: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        SafetyConfig {
            lag_threshold_bytes: 1024,
        }
    }
}

/// Everything known about a group at the moment a transition is proposed.
#[derive(Clone, Copy, Debug)]
pub struct TransitionCheck<'a> {
    pub state: &'a RotationState,
    pub proposed: RotationPhase,
    pub pointer: &'a WritePointer,
    pub replication: Option<&'a ReplicationStatus>,
    pub split: Option<&'a TrafficSplit>,
    /// The split the transition is about to publish, if any.
    pub proposed_split: Option<&'a TrafficSplit>,
    pub observed: &'a [ObservedConfig],
    pub link_ready: bool,
    /// Whether the transition is part of an explicit rollback.
    pub rollback: bool,
}

/// Returns the clusters that currently act as writable masters, if more than
/// one does.
pub fn detect_split_brain(observed: &[ObservedConfig]) -> Option<Vec<ClusterId>> {
    let claimers: Vec<_> = observed
        .iter()
        .filter(|o| o.claims_mastership())
        .map(|o| o.cluster.clone())
        .collect();
    (claimers.len() > 1).then_some(claimers)
}

/// Validates a proposed transition, returning the first rule it breaks.
///
/// Rules are checked from most to least severe, so a split brain is never
/// masked by a lesser veto.
pub fn check_transition(check: &TransitionCheck, config: &SafetyConfig) -> Result<(), Violation> {
    let phase = check.state.phase;
    if let Some(clusters) = detect_split_brain(check.observed) {
        return Err(Violation::new(
            SafetyRule::SplitBrain,
            phase,
            format!("clusters {clusters:?} all accept writes"),
        ));
    }
    check_single_master(check.pointer, check.observed, phase)?;
    if check.proposed == RotationPhase::DataSyncing {
        check_mirror(phase, check.link_ready)?;
    }
    if check.proposed == RotationPhase::SwitchoverLocked {
        check_lag(check.replication, config, phase)?;
    }
    if let Some(proposed) = check.proposed_split {
        check_split(check.state, check.split, proposed, check.rollback)?;
    }
    Ok(())
}

/// An observed cluster acting as master must be the pointer's master.
pub fn check_single_master(
    pointer: &WritePointer,
    observed: &[ObservedConfig],
    phase: RotationPhase,
) -> Result<(), Violation> {
    for o in observed.iter().filter(|o| o.claims_mastership()) {
        if !pointer.is_master(&o.cluster) {
            return Err(Violation::new(
                SafetyRule::SingleMaster,
                phase,
                format!(
                    "{} accepts writes but the write pointer names {:?}",
                    o.cluster, pointer.master
                ),
            ));
        }
    }
    Ok(())
}

/// Mirror writes need a ready mesh link to travel over.
pub fn check_mirror(phase: RotationPhase, link_ready: bool) -> Result<(), Violation> {
    if link_ready {
        Ok(())
    } else {
        Err(Violation::new(
            SafetyRule::BlindMirror,
            phase,
            "mesh link is not ready or exposes no mirror endpoints",
        ))
    }
}

pub fn check_lag(
    replication: Option<&ReplicationStatus>,
    config: &SafetyConfig,
    phase: RotationPhase,
) -> Result<(), Violation> {
    let Some(status) = replication else {
        return Err(Violation::new(
            SafetyRule::LagGate,
            phase,
            "replication status unknown",
        ));
    };
    if status.link == LinkHealth::Down {
        return Err(Violation::new(
            SafetyRule::LagGate,
            phase,
            "replication link is down",
        ));
    }
    if status.lag_bytes > config.lag_threshold_bytes {
        return Err(Violation::new(
            SafetyRule::LagGate,
            phase,
            format!(
                "replication lag {} bytes exceeds threshold {} bytes",
                status.lag_bytes, config.lag_threshold_bytes
            ),
        ));
    }
    Ok(())
}

/// The target's weight never decreases within a rotation unless rolling back.
pub fn check_split(
    state: &RotationState,
    current: Option<&TrafficSplit>,
    proposed: &TrafficSplit,
    rollback: bool,
) -> Result<(), Violation> {
    if rollback {
        return Ok(());
    }
    let (Some(target), Some(current)) = (state.target(), current) else {
        return Ok(());
    };
    let before = current.weight_of(target).unwrap_or(0);
    let after = proposed.weight_of(target).unwrap_or(0);
    if after < before {
        return Err(Violation::new(
            SafetyRule::CanaryMonotonicity,
            state.phase,
            format!("target {target} weight would drop from {before} to {after}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::id::RotationId;
    use crate::registry::ClusterSpec;
    use crate::state::RotationRequest;
    use crate::write_pointer::ClusterWriteConfig;

    fn state(phase: RotationPhase) -> RotationState {
        let mut state = RotationState::new("payments".into(), "payments-api".into(), 0);
        state.phase = phase;
        state.request = Some(RotationRequest {
            rotation_id: RotationId(1),
            group: "payments".into(),
            service: "payments-api".into(),
            source: "blue".into(),
            target: ClusterSpec {
                id: "green".into(),
                region: "us-east-1".into(),
                endpoints: vec![],
                profile: "base".into(),
            },
            requested_at: 0,
        });
        state
    }

    fn pointer() -> WritePointer {
        let mut pointer = WritePointer::new("payments".into(), "blue".into());
        pointer.members.insert("green".into());
        pointer
    }

    fn observed(pointer: &WritePointer) -> Vec<ObservedConfig> {
        pointer
            .members
            .iter()
            .map(|c| ObservedConfig {
                cluster: c.clone(),
                applied: Some(pointer.write_config_for(c)),
            })
            .collect()
    }

    fn replication(lag_bytes: u64) -> ReplicationStatus {
        ReplicationStatus {
            lag_bytes,
            link: LinkHealth::Up,
            source: Some("blue".into()),
        }
    }

    fn split(green: u32) -> TrafficSplit {
        TrafficSplit::new(
            "payments".into(),
            "blue".into(),
            100 - green,
            "green".into(),
            green,
        )
        .unwrap()
    }

    fn check<'a>(
        state: &'a RotationState,
        proposed: RotationPhase,
        pointer: &'a WritePointer,
        observed: &'a [ObservedConfig],
    ) -> TransitionCheck<'a> {
        TransitionCheck {
            state,
            proposed,
            pointer,
            replication: None,
            split: None,
            proposed_split: None,
            observed,
            link_ready: true,
            rollback: false,
        }
    }

    #[test]
    fn lag_gate_blocks_switchover() {
        let state = state(RotationPhase::TrafficCanary);
        let pointer = pointer();
        let observed = observed(&pointer);
        let status = replication(5000);
        let mut c = check(&state, RotationPhase::SwitchoverLocked, &pointer, &observed);
        c.replication = Some(&status);
        let err = check_transition(&c, &SafetyConfig::default()).unwrap_err();
        assert_eq!(err.rule, SafetyRule::LagGate);
        assert_eq!(err.phase, Some(RotationPhase::TrafficCanary));

        let status = replication(200);
        c.replication = Some(&status);
        check_transition(&c, &SafetyConfig::default()).unwrap();

        let mut down = replication(0);
        down.link = LinkHealth::Down;
        c.replication = Some(&down);
        let err = check_transition(&c, &SafetyConfig::default()).unwrap_err();
        assert_eq!(err.rule, SafetyRule::LagGate);
    }

    #[test]
    fn blind_mirror_requires_a_ready_link() {
        let state = state(RotationPhase::MeshLinking);
        let pointer = pointer();
        let observed = observed(&pointer);
        let mut c = check(&state, RotationPhase::DataSyncing, &pointer, &observed);
        c.link_ready = false;
        let err = check_transition(&c, &SafetyConfig::default()).unwrap_err();
        assert_eq!(err.rule, SafetyRule::BlindMirror);
    }

    #[test]
    fn canary_weight_only_drops_on_rollback() {
        let state = state(RotationPhase::TrafficCanary);
        let pointer = pointer();
        let observed = observed(&pointer);
        let current = split(50);
        let lower = split(10);
        let mut c = check(&state, RotationPhase::TrafficCanary, &pointer, &observed);
        c.split = Some(&current);
        c.proposed_split = Some(&lower);
        let err = check_transition(&c, &SafetyConfig::default()).unwrap_err();
        assert_eq!(err.rule, SafetyRule::CanaryMonotonicity);
        c.rollback = true;
        check_transition(&c, &SafetyConfig::default()).unwrap();
    }

    #[test]
    fn two_writable_masters_is_a_split_brain() {
        let state = state(RotationPhase::DataSyncing);
        let pointer = pointer();
        let mut observed = observed(&pointer);
        let rogue = ClusterWriteConfig {
            is_master: true,
            accepts_writes: true,
            ..pointer.write_config_for(&"green".into())
        };
        observed[1].applied = Some(rogue);
        let c = check(&state, RotationPhase::TrafficCanary, &pointer, &observed);
        let err = check_transition(&c, &SafetyConfig::default()).unwrap_err();
        assert_eq!(err.rule, SafetyRule::SplitBrain);
        assert!(err.rule.is_fatal());
    }

    #[test]
    fn stale_master_claim_is_vetoed() {
        let state = state(RotationPhase::Promoted);
        let mut pointer = pointer();
        let stale = observed(&pointer);
        pointer.master = Some("green".into());
        pointer.version += 1;
        let c = check(&state, RotationPhase::Draining, &pointer, &stale);
        let err = check_transition(&c, &SafetyConfig::default()).unwrap_err();
        assert_eq!(err.rule, SafetyRule::SingleMaster);
    }

    proptest! {
        #[test]
        fn lag_gate_matches_threshold(lag in 0u64..10_000, threshold in 0u64..10_000) {
            let status = replication(lag);
            let config = SafetyConfig { lag_threshold_bytes: threshold };
            let res = check_lag(Some(&status), &config, RotationPhase::TrafficCanary);
            prop_assert_eq!(res.is_ok(), lag <= threshold);
        }
    }
}
