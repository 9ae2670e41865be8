// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The single source of truth for write authority.
//!
//! Each group has exactly one [`WritePointer`]. The configuration every
//! cluster uses to decide whether to accept, forward or reject writes is
//! derived from it with [`WritePointer::write_config_for`], so no cluster can
//! hold a divergent opinion about who the master is except by failing to
//! apply what was published.
//!
//! Mutations are serialized per group; readers take snapshots from a watch
//! channel and never wait on a writer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::collaborators::WriteConfigDistributor;
use crate::error::{RotationError, SafetyRule, Violation};
use crate::id::{ClusterId, GroupId};
use crate::metrics::Metrics;
use crate::retry::{retry_external, Retry};

/// Which cluster of a group accepts writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePointer {
    pub group: GroupId,
    pub master: Option<ClusterId>,
    /// While set, no cluster accepts writes.
    pub maintenance: bool,
    /// The clusters configuration is published to.
    pub members: BTreeSet<ClusterId>,
    /// Mirror-write configuration: each key forwards writes to its value.
    pub mirrors: BTreeMap<ClusterId, ClusterId>,
    /// Bumped by every effective mutation.
    pub version: u64,
}

impl WritePointer {
    pub fn new(group: GroupId, master: ClusterId) -> Self {
        WritePointer {
            group,
            members: BTreeSet::from([master.clone()]),
            master: Some(master),
            maintenance: false,
            mirrors: BTreeMap::new(),
            version: 1,
        }
    }

    pub fn is_master(&self, cluster: &ClusterId) -> bool {
        self.master.as_ref() == Some(cluster)
    }

    /// Derives the write configuration of one cluster.
    pub fn write_config_for(&self, cluster: &ClusterId) -> ClusterWriteConfig {
        let is_master = self.is_master(cluster) && self.members.contains(cluster);
        ClusterWriteConfig {
            group: self.group.clone(),
            cluster: cluster.clone(),
            version: self.version,
            is_master,
            maintenance: self.maintenance,
            accepts_writes: is_master && !self.maintenance,
            forward_writes_to: if self.maintenance {
                None
            } else {
                self.mirrors.get(cluster).cloned()
            },
        }
    }
}

/// The write configuration of one cluster, as published and as observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterWriteConfig {
    pub group: GroupId,
    pub cluster: ClusterId,
    /// The [`WritePointer::version`] this was derived from.
    pub version: u64,
    pub is_master: bool,
    pub maintenance: bool,
    pub accepts_writes: bool,
    /// Where the cluster's mirror sends writes it receives, if anywhere.
    pub forward_writes_to: Option<ClusterId>,
}

impl ClusterWriteConfig {
    /// Whether the cluster acts as a writable master under this config.
    ///
    /// A cluster in maintenance accepts no writes, so it claims nothing even
    /// if it is still named master.
    pub fn claims_mastership(&self) -> bool {
        self.is_master && !self.maintenance
    }
}

#[derive(Debug)]
struct GroupPointer {
    /// Held for the duration of a mutation, publication included.
    writer: tokio::sync::Mutex<()>,
    tx: watch::Sender<WritePointer>,
}

/// Owns every group's write pointer.
#[derive(Debug)]
pub struct WritePointerManager {
    groups: Mutex<BTreeMap<GroupId, Arc<GroupPointer>>>,
    distributor: Arc<dyn WriteConfigDistributor>,
    retry: Retry,
    metrics: Arc<Metrics>,
}

impl WritePointerManager {
    pub fn new(
        distributor: Arc<dyn WriteConfigDistributor>,
        retry: Retry,
        metrics: Arc<Metrics>,
    ) -> Self {
        WritePointerManager {
            groups: Mutex::new(BTreeMap::new()),
            distributor,
            retry,
            metrics,
        }
    }

    fn group(&self, group: &GroupId) -> Result<Arc<GroupPointer>, RotationError> {
        let groups = self.groups.lock().expect("lock poisoned");
        groups
            .get(group)
            .cloned()
            .ok_or_else(|| RotationError::UnknownGroup(group.clone()))
    }

    /// Installs a pointer loaded from durable state, without publishing.
    pub fn restore(&self, pointer: WritePointer) {
        let mut groups = self.groups.lock().expect("lock poisoned");
        match groups.get(&pointer.group) {
            Some(existing) => {
                existing.tx.send_replace(pointer);
            }
            None => {
                let (tx, _rx) = watch::channel(pointer.clone());
                groups.insert(
                    pointer.group,
                    Arc::new(GroupPointer {
                        writer: tokio::sync::Mutex::new(()),
                        tx,
                    }),
                );
            }
        }
    }

    /// Creates the pointer of a new group with `master` as its only member.
    pub async fn register(
        &self,
        group: &GroupId,
        master: &ClusterId,
    ) -> Result<WritePointer, RotationError> {
        if let Ok(existing) = self.get_pointer(group) {
            if existing.is_master(master) {
                return Ok(existing);
            }
            return Err(RotationError::InvalidRequest(format!(
                "group {group} is already registered with master {:?}",
                existing.master
            )));
        }
        let pointer = WritePointer::new(group.clone(), master.clone());
        self.restore(pointer.clone());
        self.publish(&pointer, &pointer.members).await?;
        Ok(pointer)
    }

    /// Returns the current pointer of `group`.
    pub fn get_pointer(&self, group: &GroupId) -> Result<WritePointer, RotationError> {
        Ok(self.group(group)?.tx.borrow().clone())
    }

    /// Returns a receiver that observes every change to `group`'s pointer.
    pub fn subscribe(&self, group: &GroupId) -> Result<watch::Receiver<WritePointer>, RotationError> {
        Ok(self.group(group)?.tx.subscribe())
    }

    /// Names `cluster` the write master of `group`.
    ///
    /// Fails with a `SingleMaster` violation if another cluster is master and
    /// the group is not in maintenance. Any mirror configuration that does not
    /// forward to the new master is dropped.
    pub async fn set_master(
        &self,
        group: &GroupId,
        cluster: &ClusterId,
    ) -> Result<WritePointer, RotationError> {
        self.mutate(group, "set_master", true, |pointer| {
            if !pointer.members.contains(cluster) {
                return Err(RotationError::UnknownCluster(cluster.clone()));
            }
            match &pointer.master {
                Some(master) if master == cluster => return Ok(false),
                Some(master) if !pointer.maintenance => {
                    return Err(RotationError::InvariantViolation(Violation::detached(
                        SafetyRule::SingleMaster,
                        format!(
                            "{master} is master of {group} and writes are not paused; \
                             refusing to also make {cluster} master"
                        ),
                    )));
                }
                _ => {}
            }
            pointer.master = Some(cluster.clone());
            pointer
                .mirrors
                .retain(|from, to| to == cluster && from != cluster);
            Ok(true)
        })
        .await
    }

    /// Pauses writes on every cluster of `group`.
    pub async fn enter_maintenance(&self, group: &GroupId) -> Result<WritePointer, RotationError> {
        self.mutate(group, "enter_maintenance", true, |pointer| {
            Ok(!std::mem::replace(&mut pointer.maintenance, true))
        })
        .await
    }

    /// Resumes writes on the master of `group`.
    pub async fn exit_maintenance(&self, group: &GroupId) -> Result<WritePointer, RotationError> {
        self.mutate(group, "exit_maintenance", true, |pointer| {
            Ok(std::mem::replace(&mut pointer.maintenance, false))
        })
        .await
    }

    /// Makes `from` forward the writes it receives to the current master.
    ///
    /// Callers must have checked that a mesh link backs the mirror.
    pub async fn enable_mirror(
        &self,
        group: &GroupId,
        from: &ClusterId,
    ) -> Result<WritePointer, RotationError> {
        self.mutate(group, "enable_mirror", false, |pointer| {
            let Some(master) = pointer.master.clone() else {
                return Err(RotationError::InvalidRequest(format!(
                    "group {group} has no master to mirror writes to"
                )));
            };
            if !pointer.members.contains(from) || master == *from {
                return Err(RotationError::InvalidRequest(format!(
                    "{from} cannot mirror writes to {master}"
                )));
            }
            Ok(pointer.mirrors.insert(from.clone(), master.clone()) != Some(master))
        })
        .await
    }

    pub async fn disable_mirror(
        &self,
        group: &GroupId,
        from: &ClusterId,
    ) -> Result<WritePointer, RotationError> {
        self.mutate(group, "disable_mirror", false, |pointer| {
            Ok(pointer.mirrors.remove(from).is_some())
        })
        .await
    }

    /// Starts publishing configuration to `cluster`.
    pub async fn add_member(
        &self,
        group: &GroupId,
        cluster: &ClusterId,
    ) -> Result<WritePointer, RotationError> {
        self.mutate(group, "add_member", false, |pointer| {
            Ok(pointer.members.insert(cluster.clone()))
        })
        .await
    }

    /// Stops publishing configuration to `cluster`, after telling it one last
    /// time that it accepts and forwards nothing.
    pub async fn remove_member(
        &self,
        group: &GroupId,
        cluster: &ClusterId,
    ) -> Result<WritePointer, RotationError> {
        let before = self.get_pointer(group)?;
        let pointer = self
            .mutate(group, "remove_member", true, |pointer| {
                if pointer.is_master(cluster) {
                    return Err(RotationError::InvalidRequest(format!(
                        "cannot remove {cluster}: it is the master of {group}"
                    )));
                }
                pointer.mirrors.remove(cluster);
                Ok(pointer.members.remove(cluster))
            })
            .await?;
        if before.members.contains(cluster) {
            self.publish(&pointer, &BTreeSet::from([cluster.clone()]))
                .await?;
        }
        Ok(pointer)
    }

    /// Publishes the current pointer to every member again.
    pub async fn republish(&self, group: &GroupId) -> Result<WritePointer, RotationError> {
        let entry = self.group(group)?;
        let _guard = entry.writer.lock().await;
        let pointer = entry.tx.borrow().clone();
        self.publish(&pointer, &pointer.members).await?;
        Ok(pointer)
    }

    /// Applies `f` under the group's writer lock. `f` returns whether it
    /// changed anything; unchanged pointers are neither versioned nor
    /// republished.
    async fn mutate<F>(
        &self,
        group: &GroupId,
        op: &'static str,
        allowed_in_maintenance: bool,
        f: F,
    ) -> Result<WritePointer, RotationError>
    where
        F: FnOnce(&mut WritePointer) -> Result<bool, RotationError>,
    {
        let entry = self.group(group)?;
        let _guard = entry.writer.lock().await;
        let mut pointer = entry.tx.borrow().clone();
        if pointer.maintenance && !allowed_in_maintenance {
            return Err(RotationError::WritesPaused {
                group: group.clone(),
                op,
            });
        }
        if !f(&mut pointer)? {
            debug!(%group, op, "write pointer unchanged");
            return Ok(pointer);
        }
        pointer.version += 1;
        entry.tx.send_replace(pointer.clone());
        info!(
            %group,
            op,
            version = pointer.version,
            master = ?pointer.master,
            maintenance = pointer.maintenance,
            "write pointer updated"
        );
        self.publish(&pointer, &pointer.members).await?;
        Ok(pointer)
    }

    async fn publish(
        &self,
        pointer: &WritePointer,
        to: &BTreeSet<ClusterId>,
    ) -> Result<(), RotationError> {
        for cluster in to {
            let config = pointer.write_config_for(cluster);
            retry_external("apply_write_config", &self.retry, &self.metrics, || {
                self.distributor.apply_write_config(&config)
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemEnvironment;

    fn manager(env: &MemEnvironment) -> WritePointerManager {
        WritePointerManager::new(
            Arc::new(env.clone()),
            Retry::immediate(2),
            Arc::new(Metrics::unregistered()),
        )
    }

    #[tokio::test]
    async fn set_master_requires_maintenance_to_replace_a_master() {
        let env = MemEnvironment::new();
        let pointers = manager(&env);
        let group = GroupId::from("orders");
        pointers.register(&group, &"blue".into()).await.unwrap();
        pointers.add_member(&group, &"green".into()).await.unwrap();

        let err = pointers
            .set_master(&group, &"green".into())
            .await
            .expect_err("blue is master");
        assert_eq!(err.rule(), Some(SafetyRule::SingleMaster));

        pointers.enter_maintenance(&group).await.unwrap();
        let pointer = pointers.set_master(&group, &"green".into()).await.unwrap();
        assert_eq!(pointer.master, Some("green".into()));
        let pointer = pointers.exit_maintenance(&group).await.unwrap();
        assert!(!pointer.maintenance);

        let green = env.write_config(&"green".into()).expect("published");
        assert!(green.accepts_writes);
        let blue = env.write_config(&"blue".into()).expect("published");
        assert!(!blue.is_master);
        assert_eq!(blue.version, pointer.version);
    }

    #[tokio::test]
    async fn maintenance_blocks_everything_but_set_master() {
        let env = MemEnvironment::new();
        let pointers = manager(&env);
        let group = GroupId::from("orders");
        pointers.register(&group, &"blue".into()).await.unwrap();
        pointers.enter_maintenance(&group).await.unwrap();

        let err = pointers
            .add_member(&group, &"green".into())
            .await
            .expect_err("paused");
        assert_eq!(err.kind(), "WritesPaused");
        assert!(!env.write_config(&"blue".into()).unwrap().accepts_writes);
    }

    #[tokio::test]
    async fn reissuing_an_applied_instruction_is_a_noop() {
        let env = MemEnvironment::new();
        let pointers = manager(&env);
        let group = GroupId::from("orders");
        let registered = pointers.register(&group, &"blue".into()).await.unwrap();
        let again = pointers.register(&group, &"blue".into()).await.unwrap();
        assert_eq!(registered, again);

        let v1 = pointers.set_master(&group, &"blue".into()).await.unwrap();
        let v2 = pointers.exit_maintenance(&group).await.unwrap();
        assert_eq!(v1.version, registered.version);
        assert_eq!(v2.version, registered.version);
        assert_eq!(env.calls("apply_write_config"), 1);
    }

    #[tokio::test]
    async fn flipping_the_master_drops_stale_mirrors() {
        let env = MemEnvironment::new();
        let pointers = manager(&env);
        let group = GroupId::from("orders");
        pointers.register(&group, &"blue".into()).await.unwrap();
        pointers.add_member(&group, &"green".into()).await.unwrap();
        let pointer = pointers.enable_mirror(&group, &"green".into()).await.unwrap();
        assert_eq!(
            pointer.write_config_for(&"green".into()).forward_writes_to,
            Some("blue".into())
        );

        pointers.enter_maintenance(&group).await.unwrap();
        let pointer = pointers.set_master(&group, &"green".into()).await.unwrap();
        assert!(pointer.mirrors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_set_master_admits_exactly_one() {
        let env = MemEnvironment::new();
        let pointers = Arc::new(manager(&env));
        let group = GroupId::from("orders");
        let mut pointer = WritePointer::new(group.clone(), "blue".into());
        pointer.master = None;
        pointer.members.insert("green".into());
        pointers.restore(pointer);

        let (blue, green) = tokio::join!(
            {
                let pointers = Arc::clone(&pointers);
                let group = group.clone();
                tokio::spawn(async move { pointers.set_master(&group, &"blue".into()).await })
            },
            {
                let pointers = Arc::clone(&pointers);
                let group = group.clone();
                tokio::spawn(async move { pointers.set_master(&group, &"green".into()).await })
            },
        );
        let results = [blue.unwrap(), green.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(err.rule(), Some(SafetyRule::SingleMaster));
    }
}
