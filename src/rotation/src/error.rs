// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Rotation errors.
//!
//! Every rejection carries the rule that was violated and the state that
//! caused it, so that operators never see a generic failure.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::{ClusterId, GroupId, RotationId};
use crate::state::RotationPhase;

/// A safety rule enforced before every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SafetyRule {
    /// At most one cluster per group may be write master.
    SingleMaster,
    /// No mirror write path before the mesh link is confirmed ready.
    BlindMirror,
    /// No switchover while replication lag exceeds the threshold.
    LagGate,
    /// The target's traffic weight only grows, except on rollback.
    CanaryMonotonicity,
    /// More than one cluster claims write mastership.
    SplitBrain,
}

impl SafetyRule {
    /// Whether a violation of this rule ends automation for the group.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SafetyRule::SplitBrain)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyRule::SingleMaster => "SingleMaster",
            SafetyRule::BlindMirror => "BlindMirror",
            SafetyRule::LagGate => "LagGate",
            SafetyRule::CanaryMonotonicity => "CanaryMonotonicity",
            SafetyRule::SplitBrain => "SplitBrain",
        }
    }
}

impl fmt::Display for SafetyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vetoed transition or mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: SafetyRule,
    /// The state the group was in when the veto happened. `None` when the
    /// veto came from a write pointer call made outside a transition.
    pub phase: Option<RotationPhase>,
    pub detail: String,
}

impl Violation {
    pub fn new(rule: SafetyRule, phase: RotationPhase, detail: impl Into<String>) -> Self {
        Violation {
            rule,
            phase: Some(phase),
            detail: detail.into(),
        }
    }

    /// A violation not tied to a rotation state.
    pub fn detached(rule: SafetyRule, detail: impl Into<String>) -> Self {
        Violation {
            rule,
            phase: None,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "{} in {}: {}", self.rule, phase, self.detail),
            None => write!(f, "{}: {}", self.rule, self.detail),
        }
    }
}

/// Errors from the durable state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version mismatch for group {group}: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        group: GroupId,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors surfaced by the rotation orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// A safety rule blocked the operation. Recoverable: fix the
    /// precondition and retry.
    #[error("InvariantViolation: {0}")]
    InvariantViolation(Violation),
    /// A gated wait exceeded its budget.
    #[error("Timeout: {phase} did not complete within {limit:?}")]
    Timeout { phase: RotationPhase, limit: Duration },
    /// An external collaborator kept failing after retries.
    #[error("ExternalCallFailure: {op} failed after {attempts} attempts: {cause}")]
    ExternalCallFailure {
        op: &'static str,
        attempts: usize,
        cause: String,
    },
    /// The master to be replaced has not been demoted.
    #[error("ConflictingMaster: {master} still accepts writes for group {group} in {phase}")]
    ConflictingMaster {
        group: GroupId,
        master: ClusterId,
        phase: RotationPhase,
    },
    /// More than one cluster claims write mastership.
    #[error("SplitBrainFault: clusters {clusters:?} of group {group} all claim write mastership in {phase}")]
    SplitBrainFault {
        group: GroupId,
        clusters: Vec<ClusterId>,
        phase: RotationPhase,
    },
    #[error("InvalidWeight: {weight_a}/{weight_b} rejected: {reason}")]
    InvalidWeight {
        weight_a: u32,
        weight_b: u32,
        reason: &'static str,
    },
    #[error("RotationInProgress: rotation {active} is active for group {group}")]
    RotationInProgress { group: GroupId, active: RotationId },
    #[error("StaleRotation: rotation {requested} does not match {current:?} for group {group}")]
    StaleRotation {
        group: GroupId,
        requested: RotationId,
        current: Option<RotationId>,
    },
    #[error("InvalidState: {op} is not permitted in {phase}")]
    InvalidState {
        op: &'static str,
        phase: RotationPhase,
    },
    #[error("UnknownGroup: {0}")]
    UnknownGroup(GroupId),
    #[error("UnknownCluster: {0}")]
    UnknownCluster(ClusterId),
    /// Writes are paused and only `set_master` may change the pointer.
    #[error("WritesPaused: {op} is not permitted while group {group} is in maintenance")]
    WritesPaused { group: GroupId, op: &'static str },
    #[error("InvalidRequest: {0}")]
    InvalidRequest(String),
    #[error("StoreFailure: {0}")]
    Store(#[from] StoreError),
}

impl RotationError {
    /// A stable name for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RotationError::InvariantViolation(_) => "InvariantViolation",
            RotationError::Timeout { .. } => "Timeout",
            RotationError::ExternalCallFailure { .. } => "ExternalCallFailure",
            RotationError::ConflictingMaster { .. } => "ConflictingMaster",
            RotationError::SplitBrainFault { .. } => "SplitBrainFault",
            RotationError::InvalidWeight { .. } => "InvalidWeight",
            RotationError::RotationInProgress { .. } => "RotationInProgress",
            RotationError::StaleRotation { .. } => "StaleRotation",
            RotationError::InvalidState { .. } => "InvalidState",
            RotationError::UnknownGroup(_) => "UnknownGroup",
            RotationError::UnknownCluster(_) => "UnknownCluster",
            RotationError::WritesPaused { .. } => "WritesPaused",
            RotationError::InvalidRequest(_) => "InvalidRequest",
            RotationError::Store(_) => "StoreFailure",
        }
    }

    /// The violated rule, if this error is a veto.
    pub fn rule(&self) -> Option<SafetyRule> {
        match self {
            RotationError::InvariantViolation(v) => Some(v.rule),
            RotationError::SplitBrainFault { .. } => Some(SafetyRule::SplitBrain),
            _ => None,
        }
    }

    /// The rotation state the error was raised in, when known.
    pub fn phase(&self) -> Option<RotationPhase> {
        match self {
            RotationError::InvariantViolation(v) => v.phase,
            RotationError::Timeout { phase, .. }
            | RotationError::ConflictingMaster { phase, .. }
            | RotationError::SplitBrainFault { phase, .. }
            | RotationError::InvalidState { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether the error ends automation for the group.
    pub fn is_fatal(&self) -> bool {
        match self {
            RotationError::ConflictingMaster { .. } | RotationError::SplitBrainFault { .. } => true,
            RotationError::InvariantViolation(v) => v.rule.is_fatal(),
            _ => false,
        }
    }
}
