// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Unwinding rotations.
//!
//! Before the switchover a rotation is undone by tearing the target down
//! again. After it, write authority has to be taken back from the target,
//! and whatever the target accepted in the meantime is reported, not merged.
//!
//! Both paths persist their intent before acting, so a controller that
//! crashes halfway through resumes the unwind instead of the rotation.

use serde::Serialize;
use tracing::{info, warn};

use crate::collaborators::DivergentWrite;
use crate::error::RotationError;
use crate::id::{ClusterId, RotationId};
use crate::machine::{RotationMachine, RotationStatus, StepOutcome};
use crate::registry::ClusterRole;
use crate::state::{RollbackReason, RotationPhase, TransitionCause, Unwind};

/// What an emergency rollback left for operators to reconcile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EmergencyRollbackReport {
    pub rotation_id: RotationId,
    pub source: ClusterId,
    pub target: ClusterId,
    /// Writes the target accepted after it became master.
    pub divergence: Vec<DivergentWrite>,
}

impl RotationMachine {
    /// Reverses a rotation that has not reached the switchover.
    ///
    /// Rolling back a group with no active rotation is a no-op.
    pub async fn rollback(
        &mut self,
        rotation_id: RotationId,
    ) -> Result<RotationStatus, RotationError> {
        if self.state.request.is_none() && rotation_id <= self.state.last_rotation_id {
            return Ok(self.status());
        }
        self.expect_rotation(rotation_id)?;
        let phase = self.state.phase;
        if !phase.allows_rollback() {
            return Err(RotationError::InvalidState {
                op: "rollback",
                phase,
            });
        }
        if self.state.unwinding.is_none() {
            self.begin_rollback(RollbackReason::Operator).await?;
        } else {
            self.step().await?;
        }
        Ok(self.status())
    }

    pub(crate) async fn begin_rollback(
        &mut self,
        reason: RollbackReason,
    ) -> Result<StepOutcome, RotationError> {
        warn!(
            group = %self.state.group,
            phase = %self.state.phase,
            reason = reason.as_str(),
            "rolling back rotation"
        );
        self.ctx
            .metrics
            .rollbacks
            .with_label_values(&["rollback", reason.as_str()])
            .inc();
        self.state.unwinding = Some(Unwind::Rollback(reason));
        self.persist().await?;
        self.unwind_rollback(reason).await
    }

    /// Every instruction here is idempotent, so resuming reissues them all.
    pub(crate) async fn unwind_rollback(
        &mut self,
        reason: RollbackReason,
    ) -> Result<StepOutcome, RotationError> {
        let ctx = std::sync::Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let request = self.request()?.clone();
        let (source, target) = (&request.source, &request.target.id);

        ctx.traffic.set_split(&group, source, 100, target, 0).await?;
        let pointer = ctx.pointers.get_pointer(&group)?;
        if pointer.mirrors.contains_key(target) {
            ctx.pointers.disable_mirror(&group, target).await?;
        }
        ctx.external("detach_replication", || {
            ctx.collaborators.replication.detach_replication(target)
        })
        .await?;
        if let Some(link) = self.state.link.clone() {
            ctx.external("delete_link", || ctx.collaborators.mesh.delete_link(&link))
                .await?;
        }
        ctx.pointers.remove_member(&group, target).await?;
        ctx.external("decommission_cluster", || {
            ctx.collaborators.provisioner.decommission_cluster(target)
        })
        .await?;

        self.registry.remove(target);
        ctx.traffic.clear(&group).await;
        self.transition(
            RotationPhase::IdleStable,
            TransitionCause::RolledBack { reason },
        )
        .await?;
        info!(%group, rotation = %request.rotation_id, %target, "rotation rolled back");
        Ok(StepOutcome::RolledBack { reason })
    }

    /// Hands write authority back to the source after the switchover.
    pub async fn emergency_rollback(
        &mut self,
        rotation_id: RotationId,
    ) -> Result<EmergencyRollbackReport, RotationError> {
        self.expect_rotation(rotation_id)?;
        let phase = self.state.phase;
        if !phase.allows_emergency_rollback() {
            return Err(RotationError::InvalidState {
                op: "emergency_rollback",
                phase,
            });
        }
        if self.state.unwinding.is_none() {
            warn!(group = %self.state.group, %phase, "emergency rollback requested");
            self.ctx
                .metrics
                .rollbacks
                .with_label_values(&["emergency", RollbackReason::Operator.as_str()])
                .inc();
            self.state.unwinding = Some(Unwind::Emergency);
            self.persist().await?;
        }
        self.unwind_emergency().await
    }

    pub(crate) async fn unwind_emergency(
        &mut self,
    ) -> Result<EmergencyRollbackReport, RotationError> {
        let ctx = std::sync::Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let phase = self.state.phase;
        let request = self.request()?.clone();
        let (source, target) = (&request.source, &request.target.id);

        ctx.pointers.enter_maintenance(&group).await?;
        let (_, observed) = self.observe().await?;
        if let Some(rogue) = observed
            .iter()
            .find(|o| o.cluster != *source && o.claims_mastership())
        {
            let err = RotationError::ConflictingMaster {
                group: group.clone(),
                master: rogue.cluster.clone(),
                phase,
            };
            self.fault(err.to_string()).await?;
            return Err(err);
        }

        let divergence = match self.state.switchover_at {
            Some(since) => {
                ctx.external("writes_since", || {
                    ctx.collaborators.replication.writes_since(target, since)
                })
                .await?
            }
            None => Vec::new(),
        };

        ctx.pointers.set_master(&group, source).await?;
        ctx.pointers.exit_maintenance(&group).await?;
        ctx.traffic.set_split(&group, source, 100, target, 0).await?;
        ctx.external("detach_replication", || {
            ctx.collaborators.replication.detach_replication(target)
        })
        .await?;
        if let Some(link) = self.state.link.clone() {
            ctx.external("delete_link", || ctx.collaborators.mesh.delete_link(&link))
                .await?;
        }
        ctx.pointers.remove_member(&group, target).await?;

        self.registry.set_role(source, ClusterRole::Active)?;
        self.registry.set_role(target, ClusterRole::Idle)?;
        ctx.traffic.clear(&group).await;
        self.transition(
            RotationPhase::IdleStable,
            TransitionCause::EmergencyRolledBack {
                divergent_writes: divergence.len(),
            },
        )
        .await?;
        if !divergence.is_empty() {
            warn!(
                %group,
                %target,
                divergent_writes = divergence.len(),
                "writes accepted by the target after switchover need reconciling"
            );
        }
        info!(%group, rotation = %request.rotation_id, %source, "emergency rollback complete");
        Ok(EmergencyRollbackReport {
            rotation_id: request.rotation_id,
            source: source.clone(),
            target: target.clone(),
            divergence,
        })
    }

    /// Clears a fault by naming the cluster that holds write authority.
    ///
    /// The other cluster of the rotation, if any, is demoted to idle and kept
    /// for reconciliation. Resolving to the current master of a stable group
    /// is a no-op.
    pub async fn resolve_fault(
        &mut self,
        master: ClusterId,
    ) -> Result<RotationStatus, RotationError> {
        let ctx = std::sync::Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let phase = self.state.phase;
        let pointer = ctx.pointers.get_pointer(&group)?;
        if phase == RotationPhase::IdleStable && pointer.is_master(&master) {
            return Ok(self.status());
        }
        if phase != RotationPhase::Fault {
            return Err(RotationError::InvalidState {
                op: "resolve_fault",
                phase,
            });
        }
        if !pointer.members.contains(&master) {
            return Err(RotationError::UnknownCluster(master));
        }
        let other = self.state.request.as_ref().and_then(|r| {
            [&r.source, &r.target.id]
                .into_iter()
                .find(|c| **c != master)
                .cloned()
        });

        ctx.pointers.enter_maintenance(&group).await?;
        ctx.pointers.set_master(&group, &master).await?;
        ctx.external("detach_replication", || {
            ctx.collaborators.replication.detach_replication(&master)
        })
        .await?;
        if let Some(link) = self.state.link.clone() {
            ctx.external("delete_link", || ctx.collaborators.mesh.delete_link(&link))
                .await?;
        }
        ctx.pointers.exit_maintenance(&group).await?;
        if let Some(other) = &other {
            ctx.traffic.set_split(&group, &master, 100, other, 0).await?;
            if pointer.members.contains(other) {
                ctx.pointers.remove_member(&group, other).await?;
            }
            if self.registry.get(other).is_some() {
                self.registry.set_role(other, ClusterRole::Idle)?;
            }
        }
        self.registry.set_role(&master, ClusterRole::Active)?;
        ctx.traffic.clear(&group).await;
        self.state.fault = None;
        self.transition(
            RotationPhase::IdleStable,
            TransitionCause::OperatorResolved {
                master: master.clone(),
            },
        )
        .await?;
        info!(%group, %master, ?other, "fault resolved by operator");
        Ok(self.status())
    }
}
