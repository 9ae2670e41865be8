// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory implementations for testing and local development.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use async_trait::async_trait;

use crate::collaborators::{
    ClusterHealth, DivergentWrite, LinkHealth, LinkStatus, Mesh, Provisioner, ReconciliationStatus,
    Reconciler, Replication, ReplicationStatus, TrafficRouter, WriteConfigDistributor,
};
use crate::id::{ClusterId, GroupId, LinkId};
use crate::now::EpochMillis;
use crate::registry::ClusterSpec;
use crate::traffic::TrafficSplit;
use crate::write_pointer::ClusterWriteConfig;

#[derive(Debug)]
struct MemCluster {
    health: ClusterHealth,
    profile: Option<String>,
    reconciliation: ReconciliationStatus,
    replication_source: Option<ClusterId>,
    lag_bytes: u64,
    replication_link: LinkHealth,
    applied: Option<ClusterWriteConfig>,
    in_flight_writes: u64,
    success_rate: f64,
    writes: Vec<DivergentWrite>,
}

#[derive(Debug)]
struct MemLink {
    source: ClusterId,
    target: ClusterId,
    status: LinkStatus,
    mirror_endpoints: Vec<String>,
}

#[derive(Debug)]
struct MemCore {
    /// Whether new clusters, profiles and links come up without being told.
    cooperative: bool,
    /// Whether clusters apply the write configuration published to them.
    apply_write_configs: bool,
    clusters: BTreeMap<ClusterId, MemCluster>,
    decommissioned: BTreeSet<ClusterId>,
    links: BTreeMap<LinkId, MemLink>,
    next_link: u64,
    splits: BTreeMap<GroupId, TrafficSplit>,
    calls: BTreeMap<&'static str, usize>,
    failures: BTreeMap<&'static str, usize>,
}

impl MemCore {
    /// Counts a call and consumes an injected failure, if any.
    fn call(&mut self, op: &'static str) -> Result<(), anyhow::Error> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(remaining) = self.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                bail!("injected failure in {op}");
            }
        }
        Ok(())
    }

    /// Lag as a replica sees it: once its source has paused writes and
    /// drained, the replica catches up completely.
    fn lag_bytes(&self, id: &ClusterId) -> u64 {
        let Some(cluster) = self.clusters.get(id) else {
            return 0;
        };
        let drained = cluster
            .replication_source
            .as_ref()
            .and_then(|source| self.clusters.get(source))
            .is_some_and(|source| {
                source.in_flight_writes == 0
                    && source.applied.as_ref().is_some_and(|c| c.maintenance)
            });
        if drained {
            0
        } else {
            cluster.lag_bytes
        }
    }

    fn cluster(&mut self, id: &ClusterId) -> &mut MemCluster {
        let cooperative = self.cooperative;
        self.clusters
            .entry(id.clone())
            .or_insert_with(|| MemCluster {
                health: if cooperative {
                    ClusterHealth::Ready
                } else {
                    ClusterHealth::NotReady
                },
                profile: None,
                reconciliation: ReconciliationStatus::Pending,
                replication_source: None,
                lag_bytes: 0,
                replication_link: LinkHealth::Up,
                applied: None,
                in_flight_writes: 0,
                success_rate: 1.0,
                writes: Vec::new(),
            })
    }
}

/// A simulated world of clusters, links and routers.
///
/// By default the environment is cooperative: clusters are ready as soon as
/// they are provisioned, profiles reconcile immediately, links come up with
/// one mirror endpoint, and replication has no lag. Knobs let tests hold any
/// of these back and inject failures.
#[derive(Debug, Clone)]
pub struct MemEnvironment {
    core: Arc<Mutex<MemCore>>,
}

impl Default for MemEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEnvironment {
    pub fn new() -> Self {
        MemEnvironment {
            core: Arc::new(Mutex::new(MemCore {
                cooperative: true,
                apply_write_configs: true,
                clusters: BTreeMap::new(),
                decommissioned: BTreeSet::new(),
                links: BTreeMap::new(),
                next_link: 0,
                splits: BTreeMap::new(),
                calls: BTreeMap::new(),
                failures: BTreeMap::new(),
            })),
        }
    }

    fn core(&self) -> MutexGuard<'_, MemCore> {
        self.core.lock().expect("lock poisoned")
    }

    /// Makes new clusters, profiles and links wait to be told they are ready.
    pub fn set_cooperative(&self, cooperative: bool) {
        self.core().cooperative = cooperative;
    }

    pub fn set_cluster_health(&self, id: &ClusterId, health: ClusterHealth) {
        self.core().cluster(id).health = health;
    }

    pub fn set_reconciliation(&self, id: &ClusterId, status: ReconciliationStatus) {
        self.core().cluster(id).reconciliation = status;
    }

    /// Sets the status of every link.
    pub fn set_links(&self, status: LinkStatus) {
        for link in self.core().links.values_mut() {
            link.status = status;
        }
    }

    pub fn set_lag(&self, id: &ClusterId, lag_bytes: u64) {
        self.core().cluster(id).lag_bytes = lag_bytes;
    }

    pub fn set_replication_link(&self, id: &ClusterId, health: LinkHealth) {
        self.core().cluster(id).replication_link = health;
    }

    pub fn set_in_flight_writes(&self, id: &ClusterId, writes: u64) {
        self.core().cluster(id).in_flight_writes = writes;
    }

    pub fn set_success_rate(&self, id: &ClusterId, rate: f64) {
        self.core().cluster(id).success_rate = rate;
    }

    /// Whether clusters apply published write configuration. Turning this off
    /// simulates clusters that cannot be reached.
    pub fn set_apply_write_configs(&self, apply: bool) {
        self.core().apply_write_configs = apply;
    }

    /// Overwrites what a cluster reports as its applied write configuration,
    /// as a manual edit would.
    pub fn override_write_config(&self, config: ClusterWriteConfig) {
        let cluster = config.cluster.clone();
        self.core().cluster(&cluster).applied = Some(config);
    }

    /// Records a write accepted by `id`.
    pub fn record_write(&self, id: &ClusterId, key: &str, at: EpochMillis) {
        self.core().cluster(id).writes.push(DivergentWrite {
            key: key.into(),
            accepted_at: at,
        });
    }

    /// Makes the next `n` calls of `op` fail.
    pub fn fail_next(&self, op: &'static str, n: usize) {
        self.core().failures.insert(op, n);
    }

    /// How many times `op` was called, failed attempts included.
    pub fn calls(&self, op: &str) -> usize {
        self.core().calls.get(op).copied().unwrap_or(0)
    }

    pub fn split(&self, group: &GroupId) -> Option<TrafficSplit> {
        self.core().splits.get(group).cloned()
    }

    pub fn write_config(&self, id: &ClusterId) -> Option<ClusterWriteConfig> {
        self.core().clusters.get(id).and_then(|c| c.applied.clone())
    }

    pub fn replication_source(&self, id: &ClusterId) -> Option<ClusterId> {
        self.core()
            .clusters
            .get(id)
            .and_then(|c| c.replication_source.clone())
    }

    pub fn profile(&self, id: &ClusterId) -> Option<String> {
        self.core().clusters.get(id).and_then(|c| c.profile.clone())
    }

    pub fn is_decommissioned(&self, id: &ClusterId) -> bool {
        self.core().decommissioned.contains(id)
    }

    pub fn link_count(&self) -> usize {
        self.core().links.len()
    }
}

#[async_trait]
impl Provisioner for MemEnvironment {
    async fn provision_cluster(&self, spec: &ClusterSpec) -> Result<ClusterId, anyhow::Error> {
        let mut core = self.core();
        core.call("provision_cluster")?;
        core.decommissioned.remove(&spec.id);
        core.cluster(&spec.id);
        Ok(spec.id.clone())
    }

    async fn decommission_cluster(&self, id: &ClusterId) -> Result<(), anyhow::Error> {
        let mut core = self.core();
        core.call("decommission_cluster")?;
        core.clusters.remove(id);
        core.decommissioned.insert(id.clone());
        Ok(())
    }

    async fn cluster_health(&self, id: &ClusterId) -> Result<ClusterHealth, anyhow::Error> {
        let mut core = self.core();
        core.call("cluster_health")?;
        Ok(core
            .clusters
            .get(id)
            .map_or(ClusterHealth::NotReady, |c| c.health))
    }
}

#[async_trait]
impl Reconciler for MemEnvironment {
    async fn apply_profile(&self, id: &ClusterId, profile: &str) -> Result<(), anyhow::Error> {
        let mut core = self.core();
        core.call("apply_profile")?;
        let cooperative = core.cooperative;
        let cluster = core.cluster(id);
        cluster.profile = Some(profile.into());
        if cooperative {
            cluster.reconciliation = ReconciliationStatus::Healthy;
        }
        Ok(())
    }

    async fn reconciliation_status(
        &self,
        id: &ClusterId,
    ) -> Result<ReconciliationStatus, anyhow::Error> {
        let mut core = self.core();
        core.call("reconciliation_status")?;
        Ok(core
            .clusters
            .get(id)
            .map_or(ReconciliationStatus::Pending, |c| c.reconciliation))
    }
}

#[async_trait]
impl Mesh for MemEnvironment {
    async fn create_link(
        &self,
        source: &ClusterId,
        target: &ClusterId,
    ) -> Result<LinkId, anyhow::Error> {
        let mut core = self.core();
        core.call("create_link")?;
        if let Some((id, _)) = core
            .links
            .iter()
            .find(|(_, l)| l.source == *source && l.target == *target)
        {
            return Ok(id.clone());
        }
        core.next_link += 1;
        let id = LinkId::from(format!("link-{}", core.next_link));
        let cooperative = core.cooperative;
        core.links.insert(
            id.clone(),
            MemLink {
                source: source.clone(),
                target: target.clone(),
                status: if cooperative {
                    LinkStatus::Ready
                } else {
                    LinkStatus::Down
                },
                mirror_endpoints: vec![format!("{source}.mirror.{target}")],
            },
        );
        Ok(id)
    }

    async fn link_status(&self, link: &LinkId) -> Result<LinkStatus, anyhow::Error> {
        let mut core = self.core();
        core.call("link_status")?;
        Ok(core.links.get(link).map_or(LinkStatus::Down, |l| l.status))
    }

    async fn mirror_endpoints(&self, link: &LinkId) -> Result<Vec<String>, anyhow::Error> {
        let mut core = self.core();
        core.call("mirror_endpoints")?;
        Ok(core
            .links
            .get(link)
            .map(|l| l.mirror_endpoints.clone())
            .unwrap_or_default())
    }

    async fn delete_link(&self, link: &LinkId) -> Result<(), anyhow::Error> {
        let mut core = self.core();
        core.call("delete_link")?;
        core.links.remove(link);
        Ok(())
    }
}

#[async_trait]
impl Replication for MemEnvironment {
    async fn set_replication_source(
        &self,
        target: &ClusterId,
        source: &ClusterId,
    ) -> Result<(), anyhow::Error> {
        let mut core = self.core();
        core.call("set_replication_source")?;
        if !core.clusters.contains_key(source) {
            return Err(anyhow!("unknown replication source {source}"));
        }
        core.cluster(target).replication_source = Some(source.clone());
        Ok(())
    }

    async fn detach_replication(&self, id: &ClusterId) -> Result<(), anyhow::Error> {
        let mut core = self.core();
        core.call("detach_replication")?;
        if let Some(cluster) = core.clusters.get_mut(id) {
            cluster.replication_source = None;
        }
        Ok(())
    }

    async fn replication_lag(&self, id: &ClusterId) -> Result<u64, anyhow::Error> {
        let mut core = self.core();
        core.call("replication_lag")?;
        Ok(core.lag_bytes(id))
    }

    async fn replication_status(
        &self,
        id: &ClusterId,
    ) -> Result<ReplicationStatus, anyhow::Error> {
        let mut core = self.core();
        core.call("replication_status")?;
        let lag_bytes = core.lag_bytes(id);
        let cluster = core.cluster(id);
        Ok(ReplicationStatus {
            lag_bytes,
            link: if cluster.replication_source.is_some() {
                cluster.replication_link
            } else {
                LinkHealth::Down
            },
            source: cluster.replication_source.clone(),
        })
    }

    async fn writes_since(
        &self,
        id: &ClusterId,
        since: EpochMillis,
    ) -> Result<Vec<DivergentWrite>, anyhow::Error> {
        let mut core = self.core();
        core.call("writes_since")?;
        Ok(core
            .clusters
            .get(id)
            .map(|c| {
                c.writes
                    .iter()
                    .filter(|w| w.accepted_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl TrafficRouter for MemEnvironment {
    async fn apply_split(
        &self,
        group: &GroupId,
        split: &TrafficSplit,
    ) -> Result<(), anyhow::Error> {
        let mut core = self.core();
        core.call("apply_split")?;
        core.splits.insert(group.clone(), split.clone());
        Ok(())
    }

    async fn success_rate(
        &self,
        _group: &GroupId,
        cluster: &ClusterId,
    ) -> Result<f64, anyhow::Error> {
        let mut core = self.core();
        core.call("success_rate")?;
        Ok(core.clusters.get(cluster).map_or(0.0, |c| c.success_rate))
    }
}

#[async_trait]
impl WriteConfigDistributor for MemEnvironment {
    async fn apply_write_config(&self, config: &ClusterWriteConfig) -> Result<(), anyhow::Error> {
        let mut core = self.core();
        core.call("apply_write_config")?;
        if core.apply_write_configs {
            core.cluster(&config.cluster).applied = Some(config.clone());
        }
        Ok(())
    }

    async fn observed_write_config(
        &self,
        cluster: &ClusterId,
    ) -> Result<Option<ClusterWriteConfig>, anyhow::Error> {
        let mut core = self.core();
        core.call("observed_write_config")?;
        Ok(core.clusters.get(cluster).and_then(|c| c.applied.clone()))
    }

    async fn in_flight_writes(&self, cluster: &ClusterId) -> Result<u64, anyhow::Error> {
        let mut core = self.core();
        core.call("in_flight_writes")?;
        Ok(core.clusters.get(cluster).map_or(0, |c| c.in_flight_writes))
    }
}
