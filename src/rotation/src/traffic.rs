// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Read/write traffic weights between the clusters of a group.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::collaborators::TrafficRouter;
use crate::error::RotationError;
use crate::id::{ClusterId, GroupId};
use crate::metrics::Metrics;
use crate::retry::{retry_external, Retry};

/// The share of traffic one cluster receives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterWeight {
    pub cluster: ClusterId,
    pub weight: u32,
}

/// Weights for exactly two clusters, summing to 100.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub group: GroupId,
    weights: [ClusterWeight; 2],
    pub version: u64,
}

impl TrafficSplit {
    /// Validates a split. Weights are unsigned, so only their sum and the
    /// distinctness of the clusters need checking.
    pub fn new(
        group: GroupId,
        a: ClusterId,
        weight_a: u32,
        b: ClusterId,
        weight_b: u32,
    ) -> Result<Self, RotationError> {
        if u64::from(weight_a) + u64::from(weight_b) != 100 {
            return Err(RotationError::InvalidWeight {
                weight_a,
                weight_b,
                reason: "weights must sum to 100",
            });
        }
        if a == b {
            return Err(RotationError::InvalidWeight {
                weight_a,
                weight_b,
                reason: "a split needs two distinct clusters",
            });
        }
        Ok(TrafficSplit {
            group,
            weights: [
                ClusterWeight {
                    cluster: a,
                    weight: weight_a,
                },
                ClusterWeight {
                    cluster: b,
                    weight: weight_b,
                },
            ],
            version: 0,
        })
    }

    pub fn weights(&self) -> &[ClusterWeight; 2] {
        &self.weights
    }

    pub fn weight_of(&self, cluster: &ClusterId) -> Option<u32> {
        self.weights
            .iter()
            .find(|w| w.cluster == *cluster)
            .map(|w| w.weight)
    }

    /// Whether both splits assign the same weight to the same clusters.
    pub fn same_weights(&self, other: &TrafficSplit) -> bool {
        self.weights
            .iter()
            .all(|w| other.weight_of(&w.cluster) == Some(w.weight))
    }
}

#[derive(Debug)]
struct GroupSplit {
    writer: tokio::sync::Mutex<()>,
    tx: watch::Sender<Option<TrafficSplit>>,
}

/// Computes, publishes and remembers traffic splits.
#[derive(Debug)]
pub struct TrafficController {
    groups: Mutex<BTreeMap<GroupId, Arc<GroupSplit>>>,
    router: Arc<dyn TrafficRouter>,
    retry: Retry,
    metrics: Arc<Metrics>,
}

impl TrafficController {
    pub fn new(router: Arc<dyn TrafficRouter>, retry: Retry, metrics: Arc<Metrics>) -> Self {
        TrafficController {
            groups: Mutex::new(BTreeMap::new()),
            router,
            retry,
            metrics,
        }
    }

    fn group(&self, group: &GroupId) -> Arc<GroupSplit> {
        let mut groups = self.groups.lock().expect("lock poisoned");
        let entry = groups.entry(group.clone()).or_insert_with(|| {
            let (tx, _rx) = watch::channel(None);
            Arc::new(GroupSplit {
                writer: tokio::sync::Mutex::new(()),
                tx,
            })
        });
        Arc::clone(entry)
    }

    /// Installs a split loaded from durable state, without publishing.
    pub fn restore(&self, group: &GroupId, split: Option<TrafficSplit>) {
        self.group(group).tx.send_replace(split);
    }

    pub fn get_split(&self, group: &GroupId) -> Option<TrafficSplit> {
        self.group(group).tx.borrow().clone()
    }

    /// Publishes a new split as a single update.
    ///
    /// Fails with `InvalidWeight` unless the weights sum to 100. Reissuing the
    /// current split is a no-op.
    pub async fn set_split(
        &self,
        group: &GroupId,
        a: &ClusterId,
        weight_a: u32,
        b: &ClusterId,
        weight_b: u32,
    ) -> Result<TrafficSplit, RotationError> {
        let mut split = TrafficSplit::new(group.clone(), a.clone(), weight_a, b.clone(), weight_b)?;
        let entry = self.group(group);
        let _guard = entry.writer.lock().await;
        let current = entry.tx.borrow().clone();
        if let Some(current) = current.as_ref() {
            if current.same_weights(&split) {
                return Ok(current.clone());
            }
        }
        split.version = current.map_or(1, |c| c.version + 1);
        retry_external("apply_split", &self.retry, &self.metrics, || {
            self.router.apply_split(group, &split)
        })
        .await?;
        info!(%group, %a, weight_a, %b, weight_b, version = split.version, "traffic split applied");
        entry.tx.send_replace(Some(split.clone()));
        Ok(split)
    }

    /// Forgets the split of a group that is back to a single cluster.
    pub async fn clear(&self, group: &GroupId) {
        let entry = self.group(group);
        let _guard = entry.writer.lock().await;
        entry.tx.send_replace(None);
    }

    /// The success rate of requests `cluster` serves for `group`.
    pub async fn observe_success_rate(
        &self,
        group: &GroupId,
        cluster: &ClusterId,
    ) -> Result<f64, RotationError> {
        retry_external("success_rate", &self.retry, &self.metrics, || {
            self.router.success_rate(group, cluster)
        })
        .await
    }
}
