// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Rotation states and their durable bookkeeping.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Violation;
use crate::id::{ClusterId, GroupId, LinkId, RotationId};
use crate::now::EpochMillis;
use crate::registry::ClusterSpec;

/// The states of the rotation state machine, in forward order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationPhase {
    IdleStable,
    Provisioning,
    Bootstrapping,
    MeshLinking,
    DataSyncing,
    TrafficCanary,
    SwitchoverLocked,
    Promoted,
    Draining,
    /// Terminal for automation. Only an operator can leave it.
    Fault,
}

impl RotationPhase {
    /// The single forward edge out of each state.
    pub fn next(self) -> RotationPhase {
        use RotationPhase::*;
        match self {
            IdleStable => Provisioning,
            Provisioning => Bootstrapping,
            Bootstrapping => MeshLinking,
            MeshLinking => DataSyncing,
            DataSyncing => TrafficCanary,
            TrafficCanary => SwitchoverLocked,
            SwitchoverLocked => Promoted,
            Promoted => Draining,
            Draining => IdleStable,
            Fault => Fault,
        }
    }

    /// Whether the normal rollback edge exists from this state.
    pub fn allows_rollback(self) -> bool {
        self <= RotationPhase::TrafficCanary
    }

    /// Whether only the emergency path can unwind from this state.
    pub fn allows_emergency_rollback(self) -> bool {
        matches!(
            self,
            RotationPhase::SwitchoverLocked | RotationPhase::Promoted
        )
    }

    pub fn as_str(self) -> &'static str {
        use RotationPhase::*;
        match self {
            IdleStable => "IDLE_STABLE",
            Provisioning => "PROVISIONING",
            Bootstrapping => "BOOTSTRAPPING",
            MeshLinking => "MESH_LINKING",
            DataSyncing => "DATA_SYNCING",
            TrafficCanary => "TRAFFIC_CANARY",
            SwitchoverLocked => "SWITCHOVER_LOCKED",
            Promoted => "PROMOTED",
            Draining => "DRAINING",
            Fault => "FAULT",
        }
    }

    /// A stable ordinal, exported as a gauge.
    pub fn ordinal(self) -> i64 {
        use RotationPhase::*;
        match self {
            IdleStable => 0,
            Provisioning => 1,
            Bootstrapping => 2,
            MeshLinking => 3,
            DataSyncing => 4,
            TrafficCanary => 5,
            SwitchoverLocked => 6,
            Promoted => 7,
            Draining => 8,
            Fault => 9,
        }
    }
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accepted request to rotate a group onto a new cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRequest {
    pub rotation_id: RotationId,
    pub group: GroupId,
    /// The logical service the group's clusters serve.
    pub service: String,
    pub source: ClusterId,
    pub target: ClusterSpec,
    pub requested_at: EpochMillis,
}

/// Why an automatic or operator rollback happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackReason {
    Operator,
    Timeout,
    CanaryFailed,
}

impl RollbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RollbackReason::Operator => "operator",
            RollbackReason::Timeout => "timeout",
            RollbackReason::CanaryFailed => "canary-failed",
        }
    }
}

/// Which unwind path a group is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Unwind {
    Rollback(RollbackReason),
    Emergency,
}

/// Why a transition happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum TransitionCause {
    /// An operator started a rotation.
    Started,
    /// The advance condition of the previous state held.
    Advanced,
    /// An operator forced the advance past a gated wait.
    Forced,
    /// The rotation finished and the target became the source of record.
    Completed,
    RolledBack { reason: RollbackReason },
    EmergencyRolledBack { divergent_writes: usize },
    Faulted { detail: String },
    /// An operator cleared a fault by naming the true master.
    OperatorResolved { master: ClusterId },
}

/// How many transitions a group's log keeps. A single rotation makes at most
/// eleven, so the active rotation is always fully logged.
pub const TRANSITION_LOG_CAPACITY: usize = 64;

/// One entry in a group's transition log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub rotation_id: Option<RotationId>,
    pub from: RotationPhase,
    pub to: RotationPhase,
    pub at: EpochMillis,
    pub cause: TransitionCause,
}

/// A state-mutating instruction already issued in the current state.
///
/// Together with the rotation id and the state, an effect forms the
/// idempotency key of the instruction: effects recorded here are never
/// reissued, and the set is cleared on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Effect {
    Provisioned,
    ProfileApplied,
    MemberAdded,
    LinkCreated,
    ReplicationSourceSet,
    MirrorEnabled,
    CanaryWeight(u32),
    MaintenanceEntered,
    ReplicationDetached,
    MasterFlipped,
    MaintenanceExited,
    SplitPromoted,
    LinkDeleted,
    SourceRetired,
    SourceDecommissioned,
}

/// The durable state of a group's rotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    pub group: GroupId,
    pub service: String,
    pub phase: RotationPhase,
    pub entered_at: EpochMillis,
    pub request: Option<RotationRequest>,
    /// The highest rotation id ever accepted for the group.
    pub last_rotation_id: RotationId,
    pub log: Vec<TransitionRecord>,
    pub effects: BTreeSet<Effect>,
    pub link: Option<LinkId>,
    /// When replication lag last dropped under the threshold without
    /// bouncing back above it since.
    pub lag_below_since: Option<EpochMillis>,
    pub canary_step: usize,
    pub canary_step_started_at: Option<EpochMillis>,
    /// When write authority moved to the target.
    pub switchover_at: Option<EpochMillis>,
    pub routing_confirmed: bool,
    pub force_advance: bool,
    pub unwinding: Option<Unwind>,
    pub last_veto: Option<Violation>,
    pub last_error: Option<String>,
    pub alerted: bool,
    pub halted: Option<String>,
    pub fault: Option<String>,
}

impl RotationState {
    pub fn new(group: GroupId, service: String, now: EpochMillis) -> Self {
        RotationState {
            group,
            service,
            phase: RotationPhase::IdleStable,
            entered_at: now,
            request: None,
            last_rotation_id: RotationId::default(),
            log: Vec::new(),
            effects: BTreeSet::new(),
            link: None,
            lag_below_since: None,
            canary_step: 0,
            canary_step_started_at: None,
            switchover_at: None,
            routing_confirmed: false,
            force_advance: false,
            unwinding: None,
            last_veto: None,
            last_error: None,
            alerted: false,
            halted: None,
            fault: None,
        }
    }

    pub fn rotation_id(&self) -> Option<RotationId> {
        self.request.as_ref().map(|r| r.rotation_id)
    }

    pub fn source(&self) -> Option<&ClusterId> {
        self.request.as_ref().map(|r| &r.source)
    }

    pub fn target(&self) -> Option<&ClusterId> {
        self.request.as_ref().map(|r| &r.target.id)
    }

    pub fn has_effect(&self, effect: Effect) -> bool {
        self.effects.contains(&effect)
    }

    /// Moves to `to`, appending to the log and resetting per-state progress.
    pub fn transition(&mut self, to: RotationPhase, at: EpochMillis, cause: TransitionCause) {
        self.log.push(TransitionRecord {
            rotation_id: self.rotation_id(),
            from: self.phase,
            to,
            at,
            cause,
        });
        if self.log.len() > TRANSITION_LOG_CAPACITY {
            let excess = self.log.len() - TRANSITION_LOG_CAPACITY;
            self.log.drain(..excess);
        }
        self.phase = to;
        self.entered_at = at;
        self.effects.clear();
        self.lag_below_since = None;
        self.force_advance = false;
        self.last_veto = None;
        self.last_error = None;
        self.alerted = false;
        if to != RotationPhase::TrafficCanary {
            self.canary_step = 0;
            self.canary_step_started_at = None;
        }
        if to == RotationPhase::IdleStable {
            self.request = None;
            self.link = None;
            self.switchover_at = None;
            self.routing_confirmed = false;
            self.unwinding = None;
            self.halted = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_edges_form_a_cycle_through_idle() {
        let mut phase = RotationPhase::IdleStable;
        let mut seen = vec![phase];
        loop {
            phase = phase.next();
            if phase == RotationPhase::IdleStable {
                break;
            }
            seen.push(phase);
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(RotationPhase::Fault.next(), RotationPhase::Fault);
        assert!(RotationPhase::TrafficCanary.allows_rollback());
        assert!(!RotationPhase::SwitchoverLocked.allows_rollback());
        assert!(RotationPhase::Promoted.allows_emergency_rollback());
        assert!(!RotationPhase::Draining.allows_emergency_rollback());
    }

    #[test]
    fn transition_resets_per_state_progress() {
        let mut state = RotationState::new("payments".into(), "payments-api".into(), 0);
        state.phase = RotationPhase::DataSyncing;
        state.effects.insert(Effect::ReplicationSourceSet);
        state.lag_below_since = Some(5);
        state.force_advance = true;
        state.transition(RotationPhase::TrafficCanary, 10, TransitionCause::Advanced);
        assert!(state.effects.is_empty());
        assert_eq!(state.lag_below_since, None);
        assert!(!state.force_advance);
        assert_eq!(state.entered_at, 10);
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log[0].from, RotationPhase::DataSyncing);
    }

    #[test]
    fn transition_log_keeps_the_newest_entries() {
        let mut state = RotationState::new("payments".into(), "payments-api".into(), 0);
        for at in 0..200 {
            let to = state.phase.next();
            state.transition(to, at, TransitionCause::Advanced);
        }
        assert_eq!(state.log.len(), TRANSITION_LOG_CAPACITY);
        assert_eq!(state.log.first().map(|r| r.at), Some(200 - 64));
        assert_eq!(state.log.last().map(|r| r.at), Some(199));
    }

    #[test]
    fn phases_serialize_in_operator_spelling() {
        let json = serde_json::to_string(&RotationPhase::SwitchoverLocked).unwrap();
        assert_eq!(json, r#""SWITCHOVER_LOCKED""#);
    }
}
