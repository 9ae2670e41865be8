// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Capabilities the orchestrator consumes from the outside world.
//!
//! The orchestrator knows nothing about how clusters are provisioned, how
//! manifests are reconciled, how the mesh is wired, or how data is
//! replicated. It only issues requests through these traits and polls them
//! for status. Every mutating method must be idempotent: reissuing an
//! instruction that has already been applied is a no-op.
//!
//! The intent is that you can implement these traits against Terraform,
//! Flux, a service mesh and a database operator in production, and against
//! [`crate::mem::MemEnvironment`] in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id::{ClusterId, GroupId, LinkId};
use crate::now::EpochMillis;
use crate::registry::ClusterSpec;
use crate::traffic::TrafficSplit;
use crate::write_pointer::ClusterWriteConfig;

/// Whether a cluster's API is reachable and its nodes are ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterHealth {
    Ready,
    NotReady,
}

/// The outcome of reconciling a profile onto a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconciliationStatus {
    Healthy,
    Pending,
    Failed,
}

/// The state of a mesh link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStatus {
    Ready,
    Down,
}

/// Health of a replication stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkHealth {
    Up,
    Down,
}

/// A read-only view of a cluster's inbound replication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Bytes accepted by the source but not yet applied on this cluster.
    pub lag_bytes: u64,
    pub link: LinkHealth,
    /// The cluster this one replicates from, `None` once detached.
    pub source: Option<ClusterId>,
}

/// A write accepted by a cluster, as reported for divergence accounting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergentWrite {
    pub key: String,
    pub accepted_at: EpochMillis,
}

/// Creates and destroys clusters.
#[async_trait]
pub trait Provisioner: fmt::Debug + Send + Sync {
    /// Ensures a cluster matching `spec` exists and returns its id.
    async fn provision_cluster(&self, spec: &ClusterSpec) -> Result<ClusterId, anyhow::Error>;

    /// Requests that the cluster be torn down. Returning `Ok` acknowledges the
    /// request.
    async fn decommission_cluster(&self, id: &ClusterId) -> Result<(), anyhow::Error>;

    async fn cluster_health(&self, id: &ClusterId) -> Result<ClusterHealth, anyhow::Error>;
}

/// Installs base controllers onto clusters.
#[async_trait]
pub trait Reconciler: fmt::Debug + Send + Sync {
    async fn apply_profile(&self, id: &ClusterId, profile: &str) -> Result<(), anyhow::Error>;

    async fn reconciliation_status(
        &self,
        id: &ClusterId,
    ) -> Result<ReconciliationStatus, anyhow::Error>;
}

/// Establishes trust and mirror endpoints between clusters.
#[async_trait]
pub trait Mesh: fmt::Debug + Send + Sync {
    /// Ensures a link from `source` to `target` exists and returns its id.
    async fn create_link(
        &self,
        source: &ClusterId,
        target: &ClusterId,
    ) -> Result<LinkId, anyhow::Error>;

    async fn link_status(&self, link: &LinkId) -> Result<LinkStatus, anyhow::Error>;

    /// Lists the mirror endpoints exported over the link.
    async fn mirror_endpoints(&self, link: &LinkId) -> Result<Vec<String>, anyhow::Error>;

    async fn delete_link(&self, link: &LinkId) -> Result<(), anyhow::Error>;
}

/// Streams data between clusters.
#[async_trait]
pub trait Replication: fmt::Debug + Send + Sync {
    async fn set_replication_source(
        &self,
        target: &ClusterId,
        source: &ClusterId,
    ) -> Result<(), anyhow::Error>;

    async fn detach_replication(&self, id: &ClusterId) -> Result<(), anyhow::Error>;

    async fn replication_lag(&self, id: &ClusterId) -> Result<u64, anyhow::Error>;

    async fn replication_status(&self, id: &ClusterId) -> Result<ReplicationStatus, anyhow::Error>;

    /// Lists the writes `id` accepted at or after `since`.
    async fn writes_since(
        &self,
        id: &ClusterId,
        since: EpochMillis,
    ) -> Result<Vec<DivergentWrite>, anyhow::Error>;
}

/// Splits requests between clusters by weight.
#[async_trait]
pub trait TrafficRouter: fmt::Debug + Send + Sync {
    /// Applies both weights of `split` in one update.
    async fn apply_split(&self, group: &GroupId, split: &TrafficSplit)
        -> Result<(), anyhow::Error>;

    /// The fraction of successful requests served by `cluster`, in `[0, 1]`.
    async fn success_rate(&self, group: &GroupId, cluster: &ClusterId)
        -> Result<f64, anyhow::Error>;
}

/// Delivers write-target configuration to clusters.
#[async_trait]
pub trait WriteConfigDistributor: fmt::Debug + Send + Sync {
    async fn apply_write_config(&self, config: &ClusterWriteConfig) -> Result<(), anyhow::Error>;

    /// The configuration the cluster reports as applied, if any.
    async fn observed_write_config(
        &self,
        cluster: &ClusterId,
    ) -> Result<Option<ClusterWriteConfig>, anyhow::Error>;

    /// Writes the cluster has accepted but not yet committed.
    async fn in_flight_writes(&self, cluster: &ClusterId) -> Result<u64, anyhow::Error>;
}

/// Everything the orchestrator talks to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn Provisioner>,
    pub reconciler: Arc<dyn Reconciler>,
    pub mesh: Arc<dyn Mesh>,
    pub replication: Arc<dyn Replication>,
    pub traffic: Arc<dyn TrafficRouter>,
    pub distributor: Arc<dyn WriteConfigDistributor>,
}

impl Collaborators {
    /// Uses one backend for every capability.
    pub fn uniform<T>(backend: Arc<T>) -> Self
    where
        T: Provisioner
            + Reconciler
            + Mesh
            + Replication
            + TrafficRouter
            + WriteConfigDistributor
            + 'static,
    {
        Collaborators {
            provisioner: Arc::clone(&backend) as Arc<dyn Provisioner>,
            reconciler: Arc::clone(&backend) as Arc<dyn Reconciler>,
            mesh: Arc::clone(&backend) as Arc<dyn Mesh>,
            replication: Arc::clone(&backend) as Arc<dyn Replication>,
            traffic: Arc::clone(&backend) as Arc<dyn TrafficRouter>,
            distributor: backend,
        }
    }
}
