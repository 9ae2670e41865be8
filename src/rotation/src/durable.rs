// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable storage of per-group rotation state.
//!
//! Records are written with compare-and-set on a version, so a stale
//! controller can never overwrite the progress of a newer one.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StoreError;
use crate::id::GroupId;
use crate::registry::ClusterRegistry;
use crate::state::RotationState;
use crate::traffic::TrafficSplit;
use crate::write_pointer::WritePointer;

/// Everything needed to resume a group after a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub state: RotationState,
    pub registry: ClusterRegistry,
    pub pointer: WritePointer,
    pub split: Option<TrafficSplit>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub version: u64,
    pub record: GroupRecord,
}

#[async_trait]
pub trait StateStore: std::fmt::Debug + Send + Sync {
    /// Returns the latest record of every group.
    async fn load_all(&self) -> Result<Vec<VersionedRecord>, StoreError>;

    /// Writes `record` if the stored version is `expected`, returning the new
    /// version. `None` means the group must not have been stored yet.
    async fn compare_and_set(
        &self,
        group: &GroupId,
        expected: Option<u64>,
        record: &GroupRecord,
    ) -> Result<u64, StoreError>;
}

fn next_version(
    group: &GroupId,
    expected: Option<u64>,
    actual: Option<u64>,
) -> Result<u64, StoreError> {
    if expected != actual {
        return Err(StoreError::VersionMismatch {
            group: group.clone(),
            expected,
            actual,
        });
    }
    Ok(actual.map_or(1, |v| v + 1))
}

/// An in-memory [StateStore]. Clones share storage, which lets tests drop a
/// controller and start another against the same records.
#[derive(Clone, Debug, Default)]
pub struct MemStateStore {
    records: Arc<Mutex<BTreeMap<GroupId, (u64, Vec<u8>)>>>,
}

impl MemStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemStateStore {
    async fn load_all(&self) -> Result<Vec<VersionedRecord>, StoreError> {
        let records = self.records.lock().expect("lock poisoned");
        records
            .values()
            .map(|(version, buf)| {
                Ok(VersionedRecord {
                    version: *version,
                    record: serde_json::from_slice(buf)?,
                })
            })
            .collect()
    }

    async fn compare_and_set(
        &self,
        group: &GroupId,
        expected: Option<u64>,
        record: &GroupRecord,
    ) -> Result<u64, StoreError> {
        let buf = serde_json::to_vec(record)?;
        let mut records = self.records.lock().expect("lock poisoned");
        let actual = records.get(group).map(|(v, _)| *v);
        let version = next_version(group, expected, actual)?;
        records.insert(group.clone(), (version, buf));
        Ok(version)
    }
}

/// A [StateStore] keeping one JSON file per group in a directory.
///
/// Files are replaced atomically by renaming a fully written temporary file
/// over them.
#[derive(Debug)]
pub struct FileStateStore {
    base_dir: PathBuf,
    /// Serializes compare-and-set within this process.
    writer: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(FileStateStore {
            base_dir,
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Group ids are hex encoded, so that every group gets its own file no
    /// matter which characters its id contains.
    fn record_path(&self, group: &GroupId) -> PathBuf {
        let name: String = group
            .as_str()
            .bytes()
            .map(|b| format!("{b:02x}"))
            .collect();
        self.base_dir.join(format!("group-{name}.json"))
    }

    async fn read(path: &Path) -> Result<Option<VersionedRecord>, StoreError> {
        match fs::read(path).await {
            Ok(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_all(&self) -> Result<Vec<VersionedRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read(&path).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.record.state.group.cmp(&b.record.state.group));
        Ok(records)
    }

    async fn compare_and_set(
        &self,
        group: &GroupId,
        expected: Option<u64>,
        record: &GroupRecord,
    ) -> Result<u64, StoreError> {
        let _guard = self.writer.lock().await;
        let path = self.record_path(group);
        let actual = Self::read(&path).await?.map(|r| r.version);
        let version = next_version(group, expected, actual)?;
        let buf = serde_json::to_vec_pretty(&VersionedRecord {
            version,
            record: record.clone(),
        })?;
        let dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let mut file = tempfile::NamedTempFile::new_in(dir)?;
            file.write_all(&buf)?;
            file.as_file().sync_all()?;
            file.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(version)
    }
}
