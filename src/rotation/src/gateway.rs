// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Read-only views of the outside world.
//!
//! Every poll is side-effect free and retried with the configured backoff, so
//! the state machine can call them as often as it likes.

use std::sync::Arc;

use crate::collaborators::{
    ClusterHealth, Collaborators, LinkStatus, ReconciliationStatus, ReplicationStatus,
};
use crate::error::RotationError;
use crate::id::{ClusterId, LinkId};
use crate::metrics::Metrics;
use crate::retry::{retry_external, Retry};
use crate::write_pointer::ClusterWriteConfig;

/// The write configuration a cluster reports having applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedConfig {
    pub cluster: ClusterId,
    pub applied: Option<ClusterWriteConfig>,
}

impl ObservedConfig {
    pub fn claims_mastership(&self) -> bool {
        self.applied
            .as_ref()
            .is_some_and(ClusterWriteConfig::claims_mastership)
    }

    pub fn applied_version(&self) -> Option<u64> {
        self.applied.as_ref().map(|c| c.version)
    }
}

#[derive(Debug, Clone)]
pub struct HealthGateway {
    collaborators: Collaborators,
    retry: Retry,
    metrics: Arc<Metrics>,
}

impl HealthGateway {
    pub fn new(collaborators: Collaborators, retry: Retry, metrics: Arc<Metrics>) -> Self {
        HealthGateway {
            collaborators,
            retry,
            metrics,
        }
    }

    pub async fn cluster_health(&self, id: &ClusterId) -> Result<ClusterHealth, RotationError> {
        retry_external("cluster_health", &self.retry, &self.metrics, || {
            self.collaborators.provisioner.cluster_health(id)
        })
        .await
    }

    pub async fn reconciliation_status(
        &self,
        id: &ClusterId,
    ) -> Result<ReconciliationStatus, RotationError> {
        retry_external("reconciliation_status", &self.retry, &self.metrics, || {
            self.collaborators.reconciler.reconciliation_status(id)
        })
        .await
    }

    /// Whether `link` is up and exposes at least one mirror endpoint.
    pub async fn link_ready(&self, link: &LinkId) -> Result<bool, RotationError> {
        let status = retry_external("link_status", &self.retry, &self.metrics, || {
            self.collaborators.mesh.link_status(link)
        })
        .await?;
        if status != LinkStatus::Ready {
            return Ok(false);
        }
        let endpoints = retry_external("mirror_endpoints", &self.retry, &self.metrics, || {
            self.collaborators.mesh.mirror_endpoints(link)
        })
        .await?;
        Ok(!endpoints.is_empty())
    }

    pub async fn replication_status(
        &self,
        id: &ClusterId,
    ) -> Result<ReplicationStatus, RotationError> {
        retry_external("replication_status", &self.retry, &self.metrics, || {
            self.collaborators.replication.replication_status(id)
        })
        .await
    }

    /// Bytes `id` still has to replay from its replication source.
    pub async fn replication_lag(&self, id: &ClusterId) -> Result<u64, RotationError> {
        retry_external("replication_lag", &self.retry, &self.metrics, || {
            self.collaborators.replication.replication_lag(id)
        })
        .await
    }

    pub async fn in_flight_writes(&self, id: &ClusterId) -> Result<u64, RotationError> {
        retry_external("in_flight_writes", &self.retry, &self.metrics, || {
            self.collaborators.distributor.in_flight_writes(id)
        })
        .await
    }

    /// Polls the applied write configuration of each of `clusters`.
    pub async fn observed_configs<'a, I>(
        &self,
        clusters: I,
    ) -> Result<Vec<ObservedConfig>, RotationError>
    where
        I: IntoIterator<Item = &'a ClusterId>,
    {
        let mut observed = Vec::new();
        for cluster in clusters {
            let applied = retry_external("observed_write_config", &self.retry, &self.metrics, || {
                self.collaborators.distributor.observed_write_config(cluster)
            })
            .await?;
            observed.push(ObservedConfig {
                cluster: cluster.clone(),
                applied,
            });
        }
        Ok(observed)
    }
}
