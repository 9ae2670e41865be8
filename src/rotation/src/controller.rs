// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The operator-facing control surface.
//!
//! The controller owns one [`RotationMachine`] per group and a long-lived
//! task per group that reconciles it on an interval. Operator calls and the
//! task take turns on the machine, so a group is never driven by two callers
//! at once, while different groups proceed independently.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collaborators::Collaborators;
use crate::config::RotationConfig;
use crate::durable::StateStore;
use crate::error::RotationError;
use crate::id::{ClusterId, GroupId, RotationId};
use crate::machine::{MachineContext, RotationMachine, RotationStatus, StartRotation, StepOutcome};
use crate::metrics::Metrics;
use crate::now::NowFn;
use crate::registry::{ClusterDescriptor, ClusterSpec};
use crate::rollback::EmergencyRollbackReport;
use crate::write_pointer::WritePointer;

/// A cluster and the group it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterView {
    pub group: GroupId,
    #[serde(flatten)]
    pub cluster: ClusterDescriptor,
}

#[derive(Debug)]
struct GroupHandle {
    machine: Arc<tokio::sync::Mutex<RotationMachine>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct RotationController {
    ctx: Arc<MachineContext>,
    groups: Mutex<BTreeMap<GroupId, GroupHandle>>,
    /// Serializes group registration.
    registering: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl RotationController {
    /// Opens a controller, resuming every group found in `store`.
    pub async fn open(
        config: RotationConfig,
        collaborators: Collaborators,
        store: Arc<dyn StateStore>,
        metrics: Arc<Metrics>,
        now: NowFn,
    ) -> Result<Self, RotationError> {
        let ctx = Arc::new(MachineContext::new(
            config,
            collaborators,
            store,
            metrics,
            now,
        )?);
        let records = ctx.store.load_all().await?;
        let (shutdown, _) = watch::channel(false);
        let controller = RotationController {
            ctx,
            groups: Mutex::new(BTreeMap::new()),
            registering: tokio::sync::Mutex::new(()),
            shutdown,
        };
        info!(groups = records.len(), "resuming rotation groups");
        for record in records {
            let machine = RotationMachine::restore(Arc::clone(&controller.ctx), record);
            controller.spawn(machine);
        }
        Ok(controller)
    }

    fn spawn(&self, machine: RotationMachine) {
        let group = machine.group().clone();
        let machine = Arc::new(tokio::sync::Mutex::new(machine));
        let task = tokio::spawn(run_group(
            group.clone(),
            Arc::clone(&machine),
            self.ctx.config.poll_interval,
            self.shutdown.subscribe(),
        ));
        let mut groups = self.groups.lock().expect("lock poisoned");
        groups.insert(
            group,
            GroupHandle {
                machine,
                task: Some(task),
            },
        );
    }

    fn machine(
        &self,
        group: &GroupId,
    ) -> Result<Arc<tokio::sync::Mutex<RotationMachine>>, RotationError> {
        let groups = self.groups.lock().expect("lock poisoned");
        groups
            .get(group)
            .map(|h| Arc::clone(&h.machine))
            .ok_or_else(|| RotationError::UnknownGroup(group.clone()))
    }

    fn machines(&self) -> Vec<Arc<tokio::sync::Mutex<RotationMachine>>> {
        let groups = self.groups.lock().expect("lock poisoned");
        groups.values().map(|h| Arc::clone(&h.machine)).collect()
    }

    pub fn groups(&self) -> Vec<GroupId> {
        let groups = self.groups.lock().expect("lock poisoned");
        groups.keys().cloned().collect()
    }

    /// Registers a group with `master` as its only, writable, cluster.
    ///
    /// Registering the same group with the same master again is a no-op.
    pub async fn register_group(
        &self,
        group: GroupId,
        service: String,
        master: ClusterSpec,
    ) -> Result<RotationStatus, RotationError> {
        let _guard = self.registering.lock().await;
        if let Ok(existing) = self.machine(&group) {
            let machine = existing.lock().await;
            let status = machine.status();
            if status.service == service && status.master.as_ref() == Some(&master.id) {
                return Ok(status);
            }
            return Err(RotationError::InvalidRequest(format!(
                "group {group} is already registered for {} with master {:?}",
                status.service, status.master
            )));
        }
        let machine =
            RotationMachine::register(Arc::clone(&self.ctx), group, service, master).await?;
        let status = machine.status();
        self.spawn(machine);
        Ok(status)
    }

    pub async fn status(&self, group: &GroupId) -> Result<RotationStatus, RotationError> {
        Ok(self.machine(group)?.lock().await.status())
    }

    pub async fn start_rotation(
        &self,
        group: &GroupId,
        start: StartRotation,
    ) -> Result<RotationStatus, RotationError> {
        self.machine(group)?.lock().await.start(start).await
    }

    pub async fn promote(
        &self,
        group: &GroupId,
        rotation_id: RotationId,
    ) -> Result<RotationStatus, RotationError> {
        self.machine(group)?.lock().await.promote(rotation_id).await
    }

    pub async fn confirm_routing(
        &self,
        group: &GroupId,
        rotation_id: RotationId,
    ) -> Result<RotationStatus, RotationError> {
        self.machine(group)?
            .lock()
            .await
            .confirm_routing(rotation_id)
            .await
    }

    pub async fn rollback(
        &self,
        group: &GroupId,
        rotation_id: RotationId,
    ) -> Result<RotationStatus, RotationError> {
        self.machine(group)?.lock().await.rollback(rotation_id).await
    }

    pub async fn emergency_rollback(
        &self,
        group: &GroupId,
        rotation_id: RotationId,
    ) -> Result<EmergencyRollbackReport, RotationError> {
        self.machine(group)?
            .lock()
            .await
            .emergency_rollback(rotation_id)
            .await
    }

    pub async fn resolve_fault(
        &self,
        group: &GroupId,
        master: ClusterId,
    ) -> Result<RotationStatus, RotationError> {
        self.machine(group)?
            .lock()
            .await
            .resolve_fault(master)
            .await
    }

    /// Runs one reconcile pass of `group` now, without waiting for its task.
    pub async fn step_group(&self, group: &GroupId) -> Result<StepOutcome, RotationError> {
        self.machine(group)?.lock().await.step().await
    }

    /// Every cluster of every group.
    pub async fn list_clusters(&self) -> Vec<ClusterView> {
        let mut clusters = Vec::new();
        for machine in self.machines() {
            let machine = machine.lock().await;
            clusters.extend(machine.registry().iter().map(|c| ClusterView {
                group: machine.group().clone(),
                cluster: c.clone(),
            }));
        }
        clusters
    }

    pub async fn cluster(&self, id: &ClusterId) -> Result<ClusterView, RotationError> {
        self.list_clusters()
            .await
            .into_iter()
            .find(|c| c.cluster.id == *id)
            .ok_or_else(|| RotationError::UnknownCluster(id.clone()))
    }

    pub fn pointer(&self, group: &GroupId) -> Result<WritePointer, RotationError> {
        self.ctx.pointers.get_pointer(group)
    }

    /// Observes every change to the write pointer of `group`.
    pub fn subscribe_pointer(
        &self,
        group: &GroupId,
    ) -> Result<watch::Receiver<WritePointer>, RotationError> {
        self.ctx.pointers.subscribe(group)
    }

    /// Stops every group task after its current reconcile pass.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = {
            let mut groups = self.groups.lock().expect("lock poisoned");
            groups.values_mut().filter_map(|h| h.task.take()).collect()
        };
        for res in future::join_all(tasks).await {
            if let Err(err) = res {
                warn!("group task failed: {err}");
            }
        }
        info!("rotation controller shut down");
    }
}

impl Drop for RotationController {
    fn drop(&mut self) {
        let groups = self.groups.get_mut().expect("lock poisoned");
        for task in groups.values().filter_map(|h| h.task.as_ref()) {
            task.abort();
        }
    }
}

async fn run_group(
    group: GroupId,
    machine: Arc<tokio::sync::Mutex<RotationMachine>>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + poll_interval;
    let mut interval = tokio::time::interval_at(start, poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let mut machine = machine.lock().await;
                match machine.step().await {
                    Ok(StepOutcome::Advanced { from, to }) => {
                        debug!(%group, %from, %to, "group advanced");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%group, "reconcile failed: {err}"),
                }
            }
        }
    }
    debug!(%group, "group task stopped");
}
