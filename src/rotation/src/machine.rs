// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-group rotation state machine.
//!
//! A [`RotationMachine`] is driven by [`RotationMachine::step`], one
//! reconcile pass that observes the world, decides whether the current state
//! is done, acts, and persists. Every state-mutating instruction is recorded
//! as an [`Effect`] of the current state before the next one is issued, so a
//! machine restored after a crash picks up exactly where it left off and
//! never issues the same instruction twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::collaborators::{ClusterHealth, Collaborators, LinkHealth, ReconciliationStatus};
use crate::config::RotationConfig;
use crate::durable::{GroupRecord, StateStore, VersionedRecord};
use crate::enforcer::{self, SafetyConfig, TransitionCheck};
use crate::error::{RotationError, Violation};
use crate::gateway::{HealthGateway, ObservedConfig};
use crate::id::{ClusterId, GroupId, RotationId};
use crate::metrics::Metrics;
use crate::now::{to_datetime, EpochMillis, NowFn};
use crate::registry::{ClusterRegistry, ClusterRole, ClusterSpec};
use crate::retry::retry_external;
use crate::state::{
    Effect, RollbackReason, RotationPhase, RotationRequest, RotationState, TransitionCause,
    TransitionRecord, Unwind,
};
use crate::traffic::{TrafficController, TrafficSplit};
use crate::write_pointer::{WritePointer, WritePointerManager};

/// State shared by the machines of every group.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MachineContext {
    pub config: RotationConfig,
    #[derivative(Debug = "ignore")]
    pub collaborators: Collaborators,
    #[derivative(Debug = "ignore")]
    pub gateway: HealthGateway,
    pub pointers: WritePointerManager,
    pub traffic: TrafficController,
    pub store: Arc<dyn StateStore>,
    #[derivative(Debug = "ignore")]
    pub metrics: Arc<Metrics>,
    pub now: NowFn,
}

impl MachineContext {
    pub fn new(
        config: RotationConfig,
        collaborators: Collaborators,
        store: Arc<dyn StateStore>,
        metrics: Arc<Metrics>,
        now: NowFn,
    ) -> Result<Self, RotationError> {
        config.validate()?;
        let pointers = WritePointerManager::new(
            Arc::clone(&collaborators.distributor),
            config.retry.clone(),
            Arc::clone(&metrics),
        );
        let traffic = TrafficController::new(
            Arc::clone(&collaborators.traffic),
            config.retry.clone(),
            Arc::clone(&metrics),
        );
        let gateway = HealthGateway::new(
            collaborators.clone(),
            config.retry.clone(),
            Arc::clone(&metrics),
        );
        Ok(MachineContext {
            config,
            collaborators,
            gateway,
            pointers,
            traffic,
            store,
            metrics,
            now,
        })
    }

    pub fn safety(&self) -> SafetyConfig {
        SafetyConfig {
            lag_threshold_bytes: self.config.lag_threshold_bytes,
        }
    }

    /// Issues one external mutation with the configured retry policy.
    pub(crate) async fn external<T, F, Fut>(
        &self,
        op: &'static str,
        work: F,
    ) -> Result<T, RotationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        retry_external(op, &self.config.retry, &self.metrics, work).await
    }
}

/// An operator's request to rotate a group onto a new cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRotation {
    pub rotation_id: RotationId,
    pub target: ClusterSpec,
}

/// What a reconcile pass did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum StepOutcome {
    /// No rotation is active.
    Idle,
    /// The current state's advance condition does not hold yet.
    Waiting,
    Advanced {
        from: RotationPhase,
        to: RotationPhase,
    },
    Vetoed {
        violation: Violation,
    },
    /// Automation is halted until an operator intervenes.
    Halted,
    RolledBack {
        reason: RollbackReason,
    },
    EmergencyRolledBack {
        divergent_writes: usize,
    },
    Faulted,
}

/// A snapshot of a group for operators.
#[derive(Clone, Debug, Serialize)]
pub struct RotationStatus {
    pub group: GroupId,
    pub service: String,
    pub phase: RotationPhase,
    pub rotation_id: Option<RotationId>,
    pub last_rotation_id: RotationId,
    pub source: Option<ClusterId>,
    pub target: Option<ClusterId>,
    pub entered_at: DateTime<Utc>,
    /// Time spent in the current state.
    pub elapsed_ms: u64,
    pub last_veto: Option<Violation>,
    pub last_error: Option<String>,
    pub halted: Option<String>,
    pub fault: Option<String>,
    pub canary_weight: Option<u32>,
    pub master: Option<ClusterId>,
    pub maintenance: bool,
    pub split: Option<TrafficSplit>,
    pub log: Vec<TransitionRecord>,
}

/// The outcome of a state's handler.
#[derive(Debug)]
pub(crate) enum Progress {
    Wait,
    Ready,
    Veto(Violation),
    Rollback(RollbackReason),
}

/// Drives the rotations of one group.
#[derive(Debug)]
pub struct RotationMachine {
    pub(crate) ctx: Arc<MachineContext>,
    pub(crate) state: RotationState,
    pub(crate) registry: ClusterRegistry,
    /// The version of the last persisted record.
    pub(crate) version: Option<u64>,
}

impl RotationMachine {
    /// Registers a new group whose only cluster, `master`, takes writes.
    pub async fn register(
        ctx: Arc<MachineContext>,
        group: GroupId,
        service: String,
        master: ClusterSpec,
    ) -> Result<Self, RotationError> {
        let now = ctx.now.now();
        let mut registry = ClusterRegistry::default();
        registry.insert(&master, ClusterRole::Active, now)?;
        ctx.pointers.register(&group, &master.id).await?;
        ctx.traffic.restore(&group, None);
        ctx.metrics
            .phase
            .with_label_values(&[group.as_str()])
            .set(RotationPhase::IdleStable.ordinal());
        let mut machine = RotationMachine {
            state: RotationState::new(group, service, now),
            registry,
            version: None,
            ctx,
        };
        machine.persist().await?;
        info!(group = %machine.state.group, master = %master.id, "group registered");
        Ok(machine)
    }

    /// Resumes a group from its last durable record.
    pub fn restore(ctx: Arc<MachineContext>, record: VersionedRecord) -> Self {
        let VersionedRecord { version, record } = record;
        let group = record.state.group.clone();
        ctx.pointers.restore(record.pointer);
        ctx.traffic.restore(&group, record.split);
        ctx.metrics
            .phase
            .with_label_values(&[group.as_str()])
            .set(record.state.phase.ordinal());
        info!(%group, phase = %record.state.phase, version, "group restored");
        RotationMachine {
            ctx,
            state: record.state,
            registry: record.registry,
            version: Some(version),
        }
    }

    pub fn group(&self) -> &GroupId {
        &self.state.group
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn status(&self) -> RotationStatus {
        let state = &self.state;
        let pointer = self.ctx.pointers.get_pointer(&state.group).ok();
        let canary_weight = (state.phase == RotationPhase::TrafficCanary)
            .then(|| self.ctx.config.canary_steps.get(state.canary_step).copied())
            .flatten();
        RotationStatus {
            group: state.group.clone(),
            service: state.service.clone(),
            phase: state.phase,
            rotation_id: state.rotation_id(),
            last_rotation_id: state.last_rotation_id,
            source: state.source().cloned(),
            target: state.target().cloned(),
            entered_at: to_datetime(state.entered_at),
            elapsed_ms: self.ctx.now.now().saturating_sub(state.entered_at),
            last_veto: state.last_veto.clone(),
            last_error: state.last_error.clone(),
            halted: state.halted.clone(),
            fault: state.fault.clone(),
            canary_weight,
            master: pointer.as_ref().and_then(|p| p.master.clone()),
            maintenance: pointer.as_ref().is_some_and(|p| p.maintenance),
            split: self.ctx.traffic.get_split(&state.group),
            log: state.log.clone(),
        }
    }

    /// Accepts a rotation request and enters PROVISIONING.
    ///
    /// Restarting the active rotation with the same id and target is a no-op.
    pub async fn start(&mut self, start: StartRotation) -> Result<RotationStatus, RotationError> {
        let group = self.state.group.clone();
        if let Some(active) = &self.state.request {
            if active.rotation_id == start.rotation_id && active.target == start.target {
                return Ok(self.status());
            }
            return Err(RotationError::RotationInProgress {
                group,
                active: active.rotation_id,
            });
        }
        if self.state.phase != RotationPhase::IdleStable {
            return Err(RotationError::InvalidState {
                op: "start_rotation",
                phase: self.state.phase,
            });
        }
        if start.rotation_id <= self.state.last_rotation_id {
            return Err(RotationError::StaleRotation {
                group,
                requested: start.rotation_id,
                current: Some(self.state.last_rotation_id),
            });
        }
        let pointer = self.ctx.pointers.get_pointer(&group)?;
        let Some(source) = pointer.master.clone() else {
            return Err(RotationError::InvalidRequest(format!(
                "group {group} has no write master to rotate away from"
            )));
        };
        if start.target.id == source {
            return Err(RotationError::InvalidRequest(format!(
                "target {source} is already the source of group {group}"
            )));
        }
        if let Some(existing) = self.registry.get(&start.target.id) {
            if existing.role != ClusterRole::Idle {
                return Err(RotationError::InvalidRequest(format!(
                    "cluster {} is already {} in group {group}",
                    existing.id, existing.role
                )));
            }
        }
        if let Err(violation) = self.check(RotationPhase::Provisioning, None, false).await? {
            if violation.rule.is_fatal() {
                self.fault(violation.to_string()).await?;
            }
            return Err(RotationError::InvariantViolation(violation));
        }

        let now = self.ctx.now.now();
        // An idle cluster left behind by an emergency rollback may be the
        // target again.
        if self.registry.get(&start.target.id).is_some() {
            self.registry
                .set_role(&start.target.id, ClusterRole::Target)?;
        } else {
            self.registry
                .insert(&start.target, ClusterRole::Target, now)?;
        }
        self.state.last_rotation_id = start.rotation_id;
        self.state.request = Some(RotationRequest {
            rotation_id: start.rotation_id,
            group: group.clone(),
            service: self.state.service.clone(),
            source,
            target: start.target,
            requested_at: now,
        });
        self.transition(RotationPhase::Provisioning, TransitionCause::Started)
            .await?;
        Ok(self.status())
    }

    /// Forces the advance past a gated wait, and resumes halted automation.
    ///
    /// Safety rules still apply: a vetoed transition is returned as an error.
    pub async fn promote(
        &mut self,
        rotation_id: RotationId,
    ) -> Result<RotationStatus, RotationError> {
        self.expect_rotation(rotation_id)?;
        if self.state.phase == RotationPhase::Fault {
            return Err(RotationError::InvalidState {
                op: "promote",
                phase: self.state.phase,
            });
        }
        self.state.force_advance = true;
        if let Some(reason) = self.state.halted.take() {
            info!(group = %self.state.group, %reason, "automation resumed by operator");
        }
        self.persist().await?;
        match self.step().await? {
            StepOutcome::Vetoed { violation } => Err(RotationError::InvariantViolation(violation)),
            _ => Ok(self.status()),
        }
    }

    /// Records that downstream routing now points at the target.
    pub async fn confirm_routing(
        &mut self,
        rotation_id: RotationId,
    ) -> Result<RotationStatus, RotationError> {
        self.expect_rotation(rotation_id)?;
        match self.state.phase {
            RotationPhase::Promoted => {
                if !self.state.routing_confirmed {
                    self.state.routing_confirmed = true;
                    self.persist().await?;
                }
                Ok(self.status())
            }
            RotationPhase::Draining => Ok(self.status()),
            phase => Err(RotationError::InvalidState {
                op: "confirm_routing",
                phase,
            }),
        }
    }

    /// Runs one reconcile pass.
    pub async fn step(&mut self) -> Result<StepOutcome, RotationError> {
        let before = self.state.clone();
        let outcome = self.reconcile().await;
        if let Err(err) = &outcome {
            if !matches!(err, RotationError::Store(_)) {
                self.state.last_error = Some(err.to_string());
            }
        }
        if self.state != before {
            self.persist().await?;
        }
        outcome
    }

    async fn reconcile(&mut self) -> Result<StepOutcome, RotationError> {
        if self.state.phase == RotationPhase::Fault {
            return Ok(StepOutcome::Faulted);
        }
        let (_, observed) = self.observe().await?;
        if let Some(clusters) = enforcer::detect_split_brain(&observed) {
            return Err(self.split_brain(clusters).await);
        }
        if let Some(unwind) = self.state.unwinding {
            return match unwind {
                Unwind::Rollback(reason) => self.unwind_rollback(reason).await,
                Unwind::Emergency => {
                    let report = self.unwind_emergency().await?;
                    Ok(StepOutcome::EmergencyRolledBack {
                        divergent_writes: report.divergence.len(),
                    })
                }
            };
        }
        if self.state.request.is_none() {
            return Ok(StepOutcome::Idle);
        }
        if self.state.halted.is_some() {
            return Ok(StepOutcome::Halted);
        }
        if let Some(outcome) = self.check_timeout().await? {
            return Ok(outcome);
        }
        let progress = match self.state.phase {
            RotationPhase::Provisioning => self.provisioning().await?,
            RotationPhase::Bootstrapping => self.bootstrapping().await?,
            RotationPhase::MeshLinking => self.mesh_linking().await?,
            RotationPhase::DataSyncing => self.data_syncing().await?,
            RotationPhase::TrafficCanary => self.traffic_canary().await?,
            RotationPhase::SwitchoverLocked => self.switchover_locked().await?,
            RotationPhase::Promoted => self.promoted().await?,
            RotationPhase::Draining => self.draining().await?,
            RotationPhase::IdleStable | RotationPhase::Fault => return Ok(StepOutcome::Idle),
        };
        match progress {
            Progress::Wait => Ok(StepOutcome::Waiting),
            Progress::Ready => self.advance().await,
            Progress::Veto(violation) => self.veto(violation).await,
            Progress::Rollback(reason) => self.begin_rollback(reason).await,
        }
    }

    fn elapsed(&self) -> Duration {
        Duration::from_millis(self.ctx.now.now().saturating_sub(self.state.entered_at))
    }

    fn since(&self, at: EpochMillis) -> Duration {
        Duration::from_millis(self.ctx.now.now().saturating_sub(at))
    }

    async fn check_timeout(&mut self) -> Result<Option<StepOutcome>, RotationError> {
        let phase = self.state.phase;
        let Some(limit) = self.ctx.config.timeouts.for_phase(phase) else {
            return Ok(None);
        };
        if self.elapsed() <= limit {
            return Ok(None);
        }
        let group = self.state.group.clone();
        if phase.allows_rollback() {
            warn!(%group, %phase, ?limit, "state timed out, rolling back");
            self.ctx
                .metrics
                .timeout_alerts
                .with_label_values(&[phase.as_str()])
                .inc();
            return self
                .begin_rollback(RollbackReason::Timeout)
                .await
                .map(Some);
        }
        if self.state.alerted {
            return Ok(None);
        }
        self.state.alerted = true;
        self.ctx
            .metrics
            .timeout_alerts
            .with_label_values(&[phase.as_str()])
            .inc();
        let err = RotationError::Timeout { phase, limit };
        if phase == RotationPhase::SwitchoverLocked {
            error!(%group, %phase, ?limit, "switchover timed out with writes paused; automation halted");
            self.state.halted = Some(err.to_string());
            self.persist().await?;
            return Ok(Some(StepOutcome::Halted));
        }
        error!(%group, %phase, ?limit, "state timed out");
        self.state.last_error = Some(err.to_string());
        self.persist().await?;
        Ok(None)
    }

    /// Polls the applied write configuration of every member of the group.
    pub(crate) async fn observe(
        &self,
    ) -> Result<(WritePointer, Vec<ObservedConfig>), RotationError> {
        let pointer = self.ctx.pointers.get_pointer(&self.state.group)?;
        let observed = self.ctx.gateway.observed_configs(&pointer.members).await?;
        Ok((pointer, observed))
    }

    /// Consults the enforcer about moving to `to`.
    pub(crate) async fn check(
        &self,
        to: RotationPhase,
        proposed_split: Option<&TrafficSplit>,
        rollback: bool,
    ) -> Result<Result<(), Violation>, RotationError> {
        let ctx = &self.ctx;
        let (pointer, observed) = self.observe().await?;
        let replication = match (to, self.state.target()) {
            (RotationPhase::SwitchoverLocked, Some(target)) => {
                Some(ctx.gateway.replication_status(target).await?)
            }
            _ => None,
        };
        let link_ready = match &self.state.link {
            Some(link) if to == RotationPhase::DataSyncing => ctx.gateway.link_ready(link).await?,
            Some(_) => true,
            None => false,
        };
        let split = ctx.traffic.get_split(&self.state.group);
        let check = TransitionCheck {
            state: &self.state,
            proposed: to,
            pointer: &pointer,
            replication: replication.as_ref(),
            split: split.as_ref(),
            proposed_split,
            observed: &observed,
            link_ready,
            rollback,
        };
        Ok(enforcer::check_transition(&check, &ctx.safety()))
    }

    async fn advance(&mut self) -> Result<StepOutcome, RotationError> {
        let from = self.state.phase;
        let to = from.next();
        if let Err(violation) = self.check(to, None, false).await? {
            return self.veto(violation).await;
        }
        if to == RotationPhase::IdleStable {
            self.complete().await?;
        } else {
            let cause = if self.state.force_advance {
                TransitionCause::Forced
            } else {
                TransitionCause::Advanced
            };
            self.transition(to, cause).await?;
        }
        Ok(StepOutcome::Advanced { from, to })
    }

    /// Makes the target the source of record.
    async fn complete(&mut self) -> Result<(), RotationError> {
        let request = self.request()?.clone();
        self.registry.remove(&request.source);
        self.registry
            .set_role(&request.target.id, ClusterRole::Active)?;
        self.ctx.traffic.clear(&self.state.group).await;
        self.transition(RotationPhase::IdleStable, TransitionCause::Completed)
            .await?;
        info!(
            group = %self.state.group,
            rotation = %request.rotation_id,
            source = %request.source,
            target = %request.target.id,
            "rotation complete"
        );
        Ok(())
    }

    async fn veto(&mut self, violation: Violation) -> Result<StepOutcome, RotationError> {
        if violation.rule.is_fatal() {
            let err = RotationError::InvariantViolation(violation.clone());
            self.fault(violation.to_string()).await?;
            return Err(err);
        }
        warn!(
            group = %self.state.group,
            rule = %violation.rule,
            phase = %self.state.phase,
            detail = %violation.detail,
            "transition vetoed"
        );
        self.ctx
            .metrics
            .vetoes
            .with_label_values(&[violation.rule.as_str()])
            .inc();
        self.state.last_veto = Some(violation.clone());
        Ok(StepOutcome::Vetoed { violation })
    }

    async fn split_brain(&mut self, clusters: Vec<ClusterId>) -> RotationError {
        let err = RotationError::SplitBrainFault {
            group: self.state.group.clone(),
            clusters,
            phase: self.state.phase,
        };
        match self.fault(err.to_string()).await {
            Ok(()) => err,
            Err(store) => store,
        }
    }

    /// Stops automation until an operator resolves the fault.
    pub(crate) async fn fault(&mut self, detail: String) -> Result<(), RotationError> {
        error!(
            group = %self.state.group,
            phase = %self.state.phase,
            %detail,
            "group faulted; automation stopped until an operator resolves it"
        );
        self.ctx.metrics.faults.inc();
        self.state.fault = Some(detail.clone());
        self.state.unwinding = None;
        self.transition(RotationPhase::Fault, TransitionCause::Faulted { detail })
            .await
    }

    pub(crate) async fn transition(
        &mut self,
        to: RotationPhase,
        cause: TransitionCause,
    ) -> Result<(), RotationError> {
        let from = self.state.phase;
        let rotation = self.state.rotation_id();
        let now = self.ctx.now.now();
        self.state.transition(to, now, cause.clone());
        self.ctx
            .metrics
            .transitions
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        self.ctx
            .metrics
            .phase
            .with_label_values(&[self.state.group.as_str()])
            .set(to.ordinal());
        info!(group = %self.state.group, ?rotation, %from, %to, ?cause, "rotation transitioned");
        self.persist().await
    }

    async fn record_effect(&mut self, effect: Effect) -> Result<(), RotationError> {
        self.state.effects.insert(effect);
        self.persist().await
    }

    pub(crate) fn record(&self) -> Result<GroupRecord, RotationError> {
        Ok(GroupRecord {
            state: self.state.clone(),
            registry: self.registry.clone(),
            pointer: self.ctx.pointers.get_pointer(&self.state.group)?,
            split: self.ctx.traffic.get_split(&self.state.group),
        })
    }

    pub(crate) async fn persist(&mut self) -> Result<(), RotationError> {
        let record = self.record()?;
        let version = self
            .ctx
            .store
            .compare_and_set(&self.state.group, self.version, &record)
            .await?;
        self.version = Some(version);
        Ok(())
    }

    pub(crate) fn request(&self) -> Result<&RotationRequest, RotationError> {
        self.state
            .request
            .as_ref()
            .ok_or(RotationError::InvalidState {
                op: "reconcile",
                phase: self.state.phase,
            })
    }

    /// Returns the active request if `rotation_id` names it.
    pub(crate) fn expect_rotation(
        &self,
        rotation_id: RotationId,
    ) -> Result<&RotationRequest, RotationError> {
        match &self.state.request {
            Some(request) if request.rotation_id == rotation_id => Ok(request),
            other => Err(RotationError::StaleRotation {
                group: self.state.group.clone(),
                requested: rotation_id,
                current: other.as_ref().map(|r| r.rotation_id),
            }),
        }
    }

    async fn provisioning(&mut self) -> Result<Progress, RotationError> {
        let ctx = Arc::clone(&self.ctx);
        let target = self.request()?.target.clone();
        if !self.state.has_effect(Effect::Provisioned) {
            let id = ctx
                .external("provision_cluster", || {
                    ctx.collaborators.provisioner.provision_cluster(&target)
                })
                .await?;
            if id != target.id {
                return Err(RotationError::InvalidRequest(format!(
                    "provisioner created {id} instead of {}",
                    target.id
                )));
            }
            self.record_effect(Effect::Provisioned).await?;
        }
        match ctx.gateway.cluster_health(&target.id).await? {
            ClusterHealth::Ready => Ok(Progress::Ready),
            ClusterHealth::NotReady => Ok(Progress::Wait),
        }
    }

    async fn bootstrapping(&mut self) -> Result<Progress, RotationError> {
        let ctx = Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let target = self.request()?.target.clone();
        if !self.state.has_effect(Effect::ProfileApplied) {
            ctx.external("apply_profile", || {
                ctx.collaborators
                    .reconciler
                    .apply_profile(&target.id, &target.profile)
            })
            .await?;
            self.record_effect(Effect::ProfileApplied).await?;
        }
        if !self.state.has_effect(Effect::MemberAdded) {
            ctx.pointers.add_member(&group, &target.id).await?;
            self.record_effect(Effect::MemberAdded).await?;
        }
        match ctx.gateway.reconciliation_status(&target.id).await? {
            ReconciliationStatus::Healthy => Ok(Progress::Ready),
            ReconciliationStatus::Pending => Ok(Progress::Wait),
            ReconciliationStatus::Failed => {
                self.state.last_error = Some(format!("reconciliation of {} failed", target.id));
                Ok(Progress::Wait)
            }
        }
    }

    async fn mesh_linking(&mut self) -> Result<Progress, RotationError> {
        let ctx = Arc::clone(&self.ctx);
        let request = self.request()?.clone();
        let link = match self.state.link.clone() {
            Some(link) => link,
            None => {
                let link = ctx
                    .external("create_link", || {
                        ctx.collaborators
                            .mesh
                            .create_link(&request.source, &request.target.id)
                    })
                    .await?;
                self.state.link = Some(link.clone());
                self.record_effect(Effect::LinkCreated).await?;
                link
            }
        };
        if ctx.gateway.link_ready(&link).await? {
            Ok(Progress::Ready)
        } else {
            Ok(Progress::Wait)
        }
    }

    async fn data_syncing(&mut self) -> Result<Progress, RotationError> {
        let ctx = Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let request = self.request()?.clone();
        let target = &request.target.id;
        if !self.state.has_effect(Effect::ReplicationSourceSet) {
            ctx.external("set_replication_source", || {
                ctx.collaborators
                    .replication
                    .set_replication_source(target, &request.source)
            })
            .await?;
            self.record_effect(Effect::ReplicationSourceSet).await?;
        }
        if !self.state.has_effect(Effect::MirrorEnabled) {
            let link_ready = match &self.state.link {
                Some(link) => ctx.gateway.link_ready(link).await?,
                None => false,
            };
            if let Err(violation) = enforcer::check_mirror(self.state.phase, link_ready) {
                return Ok(Progress::Veto(violation));
            }
            ctx.pointers.enable_mirror(&group, target).await?;
            self.record_effect(Effect::MirrorEnabled).await?;
        }
        if self.state.force_advance {
            return Ok(Progress::Ready);
        }
        let status = ctx.gateway.replication_status(target).await?;
        let now = ctx.now.now();
        if status.link == LinkHealth::Up && status.lag_bytes <= ctx.config.lag_threshold_bytes {
            let since = *self.state.lag_below_since.get_or_insert(now);
            if self.since(since) >= ctx.config.lag_window {
                return Ok(Progress::Ready);
            }
            debug!(%group, lag = status.lag_bytes, window_start = since, "replication lag under threshold");
        } else if self.state.lag_below_since.take().is_some() {
            debug!(%group, lag = status.lag_bytes, link = ?status.link, "replication lag window reset");
        }
        Ok(Progress::Wait)
    }

    async fn traffic_canary(&mut self) -> Result<Progress, RotationError> {
        let ctx = Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let request = self.request()?.clone();
        let (source, target) = (&request.source, &request.target.id);
        let steps = &ctx.config.canary_steps;
        let index = self.state.canary_step;
        let Some(&weight) = steps.get(index) else {
            return Ok(Progress::Ready);
        };
        if !self.state.has_effect(Effect::CanaryWeight(weight)) {
            let current = ctx.traffic.get_split(&group);
            let proposed = TrafficSplit::new(
                group.clone(),
                source.clone(),
                100 - weight,
                target.clone(),
                weight,
            )?;
            if let Err(violation) =
                enforcer::check_split(&self.state, current.as_ref(), &proposed, false)
            {
                return Ok(Progress::Veto(violation));
            }
            ctx.traffic
                .set_split(&group, source, 100 - weight, target, weight)
                .await?;
            self.state.canary_step_started_at = Some(ctx.now.now());
            info!(%group, %target, weight, "canary weight applied");
            self.record_effect(Effect::CanaryWeight(weight)).await?;
        }
        let rate = ctx.traffic.observe_success_rate(&group, target).await?;
        // A rate the router cannot compute is no evidence of health.
        if !rate.is_finite() || rate < ctx.config.canary_success_threshold {
            warn!(
                %group,
                %target,
                weight,
                rate,
                threshold = ctx.config.canary_success_threshold,
                "canary success rate below threshold"
            );
            return Ok(Progress::Rollback(RollbackReason::CanaryFailed));
        }
        let started = self
            .state
            .canary_step_started_at
            .unwrap_or(self.state.entered_at);
        if self.since(started) < ctx.config.canary_bake && !self.state.force_advance {
            return Ok(Progress::Wait);
        }
        if index + 1 < steps.len() {
            self.state.canary_step = index + 1;
            self.state.force_advance = false;
            return Ok(Progress::Wait);
        }
        Ok(Progress::Ready)
    }

    async fn switchover_locked(&mut self) -> Result<Progress, RotationError> {
        let ctx = Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let request = self.request()?.clone();
        let (source, target) = (&request.source, &request.target.id);
        if !self.state.has_effect(Effect::MaintenanceEntered) {
            ctx.pointers.enter_maintenance(&group).await?;
            self.record_effect(Effect::MaintenanceEntered).await?;
        }
        if !self.state.has_effect(Effect::ReplicationDetached) {
            let (pointer, observed) = self.observe().await?;
            let paused = observed.iter().all(|o| {
                o.applied
                    .as_ref()
                    .is_some_and(|c| c.maintenance && c.version >= pointer.version)
            });
            if !paused {
                debug!(%group, "waiting for every cluster to pause writes");
                ctx.pointers.republish(&group).await?;
                return Ok(Progress::Wait);
            }
            let mut in_flight = 0;
            for cluster in &pointer.members {
                in_flight += ctx.gateway.in_flight_writes(cluster).await?;
            }
            if in_flight > 0 {
                debug!(%group, in_flight, "waiting for in-flight writes to drain");
                return Ok(Progress::Wait);
            }
            let lag = ctx.gateway.replication_lag(target).await?;
            if lag > 0 {
                debug!(%group, lag, "waiting for replication to catch up");
                return Ok(Progress::Wait);
            }
            ctx.external("detach_replication", || {
                ctx.collaborators.replication.detach_replication(target)
            })
            .await?;
            self.record_effect(Effect::ReplicationDetached).await?;
        }
        if !self.state.has_effect(Effect::MasterFlipped) {
            ctx.pointers.set_master(&group, target).await?;
            self.state.switchover_at = Some(ctx.now.now());
            info!(%group, %source, %target, "write authority moved");
            self.record_effect(Effect::MasterFlipped).await?;
        }
        if !self.state.has_effect(Effect::MaintenanceExited) {
            ctx.pointers.exit_maintenance(&group).await?;
            self.record_effect(Effect::MaintenanceExited).await?;
        }
        let (pointer, observed) = self.observe().await?;
        if !observed
            .iter()
            .all(|o| o.applied_version() == Some(pointer.version))
        {
            debug!(%group, version = pointer.version, "waiting for the flip to be applied");
            ctx.pointers.republish(&group).await?;
            return Ok(Progress::Wait);
        }
        let status = ctx.gateway.replication_status(target).await?;
        if status.source.is_some() {
            return Ok(Progress::Wait);
        }
        Ok(Progress::Ready)
    }

    async fn promoted(&mut self) -> Result<Progress, RotationError> {
        let ctx = Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let request = self.request()?.clone();
        let (source, target) = (&request.source, &request.target.id);
        if !self.state.has_effect(Effect::SplitPromoted) {
            let current = ctx.traffic.get_split(&group);
            let proposed =
                TrafficSplit::new(group.clone(), source.clone(), 0, target.clone(), 100)?;
            if let Err(violation) =
                enforcer::check_split(&self.state, current.as_ref(), &proposed, false)
            {
                return Ok(Progress::Veto(violation));
            }
            ctx.traffic.set_split(&group, source, 0, target, 100).await?;
            self.record_effect(Effect::SplitPromoted).await?;
        }
        if self.state.routing_confirmed || self.state.force_advance {
            Ok(Progress::Ready)
        } else {
            Ok(Progress::Wait)
        }
    }

    async fn draining(&mut self) -> Result<Progress, RotationError> {
        let ctx = Arc::clone(&self.ctx);
        let group = self.state.group.clone();
        let source = self.request()?.source.clone();
        if !self.state.has_effect(Effect::LinkDeleted) {
            if let Some(link) = self.state.link.clone() {
                ctx.external("delete_link", || ctx.collaborators.mesh.delete_link(&link))
                    .await?;
            }
            self.record_effect(Effect::LinkDeleted).await?;
        }
        if !self.state.has_effect(Effect::SourceRetired) {
            self.registry.set_role(&source, ClusterRole::Retiring)?;
            ctx.pointers.remove_member(&group, &source).await?;
            self.record_effect(Effect::SourceRetired).await?;
        }
        if !self.state.has_effect(Effect::SourceDecommissioned) {
            ctx.external("decommission_cluster", || {
                ctx.collaborators.provisioner.decommission_cluster(&source)
            })
            .await?;
            self.record_effect(Effect::SourceDecommissioned).await?;
        }
        Ok(Progress::Ready)
    }
}
