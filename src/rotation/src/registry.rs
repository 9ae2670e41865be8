// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cluster registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RotationError;
use crate::id::ClusterId;
use crate::now::EpochMillis;

/// The role a cluster plays within its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterRole {
    /// Serves the group and holds write authority outside of a switchover.
    Active,
    /// Being brought up to replace the active cluster.
    Target,
    /// Replaced, waiting to be decommissioned.
    Retiring,
    /// Known but not serving, e.g. a target kept around after an emergency
    /// rollback.
    Idle,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterRole::Active => "active",
            ClusterRole::Target => "target",
            ClusterRole::Retiring => "retiring",
            ClusterRole::Idle => "idle",
        })
    }
}

/// What an operator asks for when requesting a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub id: ClusterId,
    pub region: String,
    /// Network endpoints, e.g. the API server address.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// The base-controller profile to reconcile onto the cluster.
    #[serde(default = "default_profile")]
    pub profile: String,
}

fn default_profile() -> String {
    "base".into()
}

/// A cluster known to the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub id: ClusterId,
    pub region: String,
    pub role: ClusterRole,
    pub endpoints: Vec<String>,
    pub profile: String,
    pub created_at: EpochMillis,
}

/// The clusters of one group and their roles.
///
/// Only the rotation state machine changes roles, so the mutating methods are
/// crate-private.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRegistry {
    clusters: BTreeMap<ClusterId, ClusterDescriptor>,
}

impl ClusterRegistry {
    pub fn get(&self, id: &ClusterId) -> Option<&ClusterDescriptor> {
        self.clusters.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterDescriptor> {
        self.clusters.values()
    }

    /// Returns the cluster currently holding `role`, if any.
    pub fn with_role(&self, role: ClusterRole) -> Option<&ClusterDescriptor> {
        self.clusters.values().find(|c| c.role == role)
    }

    /// Records a cluster. Re-recording an identical spec is a no-op.
    pub(crate) fn insert(
        &mut self,
        spec: &ClusterSpec,
        role: ClusterRole,
        now: EpochMillis,
    ) -> Result<(), RotationError> {
        if let Some(existing) = self.clusters.get(&spec.id) {
            if existing.region == spec.region && existing.role == role {
                return Ok(());
            }
            return Err(RotationError::InvalidRequest(format!(
                "cluster {} is already registered as {} in {}",
                spec.id, existing.role, existing.region
            )));
        }
        self.clusters.insert(
            spec.id.clone(),
            ClusterDescriptor {
                id: spec.id.clone(),
                region: spec.region.clone(),
                role,
                endpoints: spec.endpoints.clone(),
                profile: spec.profile.clone(),
                created_at: now,
            },
        );
        Ok(())
    }

    pub(crate) fn set_role(
        &mut self,
        id: &ClusterId,
        role: ClusterRole,
    ) -> Result<(), RotationError> {
        match self.clusters.get_mut(id) {
            Some(cluster) => {
                cluster.role = role;
                Ok(())
            }
            None => Err(RotationError::UnknownCluster(id.clone())),
        }
    }

    pub(crate) fn remove(&mut self, id: &ClusterId) -> Option<ClusterDescriptor> {
        self.clusters.remove(id)
    }
}
