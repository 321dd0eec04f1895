// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::{
    Error, GroupId, PartitionId, Result, STORE_REQUESTS,
    config::{GroupConfig, StoreConfig},
    group::{GroupState, PartitionGroup, PartitionGroupStore, QosLevel},
    replicate::ReplicableStore,
    retention::{Purged, RetentionPolicy},
    telemetry::{Observer, Telemetry},
};
use opentelemetry::KeyValue;
use std::{
    collections::BTreeMap,
    fs::{create_dir_all, read_dir, remove_dir_all},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, instrument, warn};

#[derive(Clone, Debug)]
pub struct Builder<P> {
    path: P,
    group_config: GroupConfig,
    observer: Option<Arc<dyn Observer>>,
}

impl Default for Builder<PhantomData<PathBuf>> {
    fn default() -> Self {
        Self {
            path: PhantomData,
            group_config: GroupConfig::default(),
            observer: None,
        }
    }
}

impl<P> Builder<P> {
    pub fn path(self, path: impl Into<PathBuf>) -> Builder<PathBuf> {
        Builder {
            path: path.into(),
            group_config: self.group_config,
            observer: self.observer,
        }
    }

    /// Configuration of groups created without one.
    pub fn group_config(self, group_config: GroupConfig) -> Self {
        Self {
            group_config,
            ..self
        }
    }

    pub fn observer(self, observer: Arc<dyn Observer>) -> Self {
        Self {
            observer: Some(observer),
            ..self
        }
    }
}

impl Builder<PathBuf> {
    pub fn build(self) -> Result<Store> {
        let group_config = self.group_config.validate()?;
        create_dir_all(&self.path)?;

        Ok(Store {
            path: self.path,
            group_config,
            observer: self.observer.unwrap_or_else(|| Arc::new(Telemetry)),
            groups: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        })
    }
}

impl From<StoreConfig> for Builder<PathBuf> {
    fn from(config: StoreConfig) -> Self {
        Builder::default()
            .path(config.path())
            .group_config(config.group_config().clone())
    }
}

/// Owns the partition groups under a directory.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    group_config: GroupConfig,
    observer: Arc<dyn Observer>,
    groups: RwLock<BTreeMap<GroupId, Arc<PartitionGroup>>>,
    running: AtomicBool,
}

impl Store {
    pub fn builder() -> Builder<PhantomData<PathBuf>> {
        Builder::default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Identifiers of the loaded groups.
    pub fn partition_groups(&self) -> Result<Vec<GroupId>> {
        self.groups
            .read()
            .map(|groups| groups.keys().cloned().collect())
            .map_err(Into::into)
    }

    fn lookup(&self, id: &GroupId) -> Result<Arc<PartitionGroup>> {
        self.groups
            .read()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownPartitionGroup(id.clone()))
    }

    fn count(method: &'static str) {
        STORE_REQUESTS.add(1, &[KeyValue::new("method", method)]);
    }

    #[instrument(skip(self))]
    pub fn create_partition_group(
        &self,
        topic: &str,
        group: u32,
        partitions: &[PartitionId],
        config: Option<GroupConfig>,
    ) -> Result<()> {
        Self::count("create_partition_group");

        let id = GroupId::new(topic, group);
        let mut groups = self.groups.write()?;

        if groups.contains_key(&id) {
            return Err(Error::PartitionGroupExists(id));
        }

        let created = PartitionGroup::create(
            &self.path,
            id.clone(),
            partitions,
            config.unwrap_or_else(|| self.group_config.clone()),
            self.observer.clone(),
        )?;

        if self.is_running() {
            created.start()?;
        }

        debug!(%id, partitions = ?created.partitions());
        _ = groups.insert(id, Arc::new(created));
        Ok(())
    }

    /// Load a group from disk.
    ///
    /// Does nothing when the group is already loaded and healthy. A degraded
    /// or stopped group is stopped and loaded again, after which handles on
    /// the previous instance report [`crate::ErrorCode::NotRunning`].
    #[instrument(skip(self))]
    pub async fn restore_partition_group(&self, topic: &str, group: u32) -> Result<()> {
        Self::count("restore_partition_group");

        let id = GroupId::new(topic, group);

        let previous = {
            let groups = self.groups.read()?;

            match groups.get(&id) {
                Some(existing)
                    if !existing.is_degraded() && existing.state() != GroupState::Stopped =>
                {
                    debug!(%id, state = ?existing.state(), "already loaded");
                    return Ok(());
                }

                existing => existing.cloned(),
            }
        };

        if let Some(previous) = previous {
            warn!(%id, degraded = previous.is_degraded(), "reopening");
            previous.stop().await?;
        }

        let restored = PartitionGroup::restore(&self.path, id.clone(), self.observer.clone())?;

        let mut groups = self.groups.write()?;

        if groups.get(&id).is_some_and(|existing| {
            !existing.is_degraded() && existing.state() != GroupState::Stopped
        }) {
            debug!(%id, "restored concurrently");
            return Ok(());
        }

        if self.is_running() {
            restored.start()?;
        }

        _ = groups.insert(id, Arc::new(restored));
        Ok(())
    }

    /// Load every group found under the store path.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<Vec<GroupId>> {
        Self::count("restore");

        let mut ids = vec![];

        for entry in read_dir(&self.path)? {
            let entry = entry?;

            if !entry.file_type()?.is_dir() {
                continue;
            }

            match GroupId::try_from(&entry) {
                Ok(id) => ids.push(id),
                Err(error) => debug!(path = ?entry.path(), ?error, "skipping"),
            }
        }

        ids.sort();

        for id in &ids {
            self.restore_partition_group(id.topic(), id.group()).await?;
        }

        Ok(ids)
    }

    pub fn partition_group_exists(&self, topic: &str, group: u32) -> Result<bool> {
        let id = GroupId::new(topic, group);

        if self.groups.read()?.contains_key(&id) {
            return Ok(true);
        }

        Ok(PartitionGroup::dir(&self.path, &id).exists())
    }

    /// Stop a group and delete its directory.
    #[instrument(skip(self))]
    pub async fn remove_partition_group(&self, topic: &str, group: u32) -> Result<()> {
        Self::count("remove_partition_group");

        let id = GroupId::new(topic, group);
        let removed = self.groups.write()?.remove(&id);

        let dir = if let Some(removed) = removed {
            removed.stop().await?;
            removed.directory().to_path_buf()
        } else {
            PartitionGroup::dir(&self.path, &id)
        };

        if !dir.exists() {
            return Err(Error::UnknownPartitionGroup(id));
        }

        remove_dir_all(&dir).map_err(Into::into)
    }

    pub fn get_store(&self, topic: &str, group: u32, qos: QosLevel) -> Result<PartitionGroupStore> {
        self.lookup(&GroupId::new(topic, group))
            .map(|group| PartitionGroupStore::new(group, qos))
    }

    pub fn get_replicable_store(&self, topic: &str, group: u32) -> Result<ReplicableStore> {
        self.lookup(&GroupId::new(topic, group))
            .map(ReplicableStore::new)
    }

    /// Start the writer task of every loaded group. Must be called within a
    /// tokio runtime.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        Self::count("start");

        let groups = self.groups.read()?;
        self.running.store(true, Ordering::Release);

        for group in groups.values() {
            if group.state() != GroupState::Stopped {
                group.start()?;
            }
        }

        Ok(())
    }

    /// Stop every group. Queued writes complete before each writer exits.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        Self::count("stop");

        self.running.store(false, Ordering::Release);

        let groups = self
            .groups
            .read()
            .map(|groups| groups.values().cloned().collect::<Vec<_>>())?;

        let mut outcome = Ok(());

        for group in groups {
            if let Err(error) = group.stop().await {
                warn!(id = %group.id(), ?error);
                outcome = outcome.and(Err(error));
            }
        }

        outcome
    }

    /// Stop every group and release them.
    pub async fn close(&self) -> Result<()> {
        let stopped = self.stop().await;
        self.groups.write()?.clear();
        stopped
    }

    /// Purge the segments of a group that `policy` no longer retains.
    #[instrument(skip(self))]
    pub async fn apply_retention(
        &self,
        topic: &str,
        group: u32,
        policy: &dyn RetentionPolicy,
    ) -> Result<Option<Purged>> {
        Self::count("apply_retention");

        let group = self.lookup(&GroupId::new(topic, group))?;
        let segments = group.log().segments()?;

        match policy.retain_from(&segments) {
            Some(before) => group.purge(before).await.map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn build_creates_directory() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a/b");

        let store = Store::builder().path(&path).build()?;
        assert!(path.is_dir());
        assert!(!store.is_running());

        Ok(())
    }

    #[test]
    fn build_validates_group_config() -> Result<()> {
        let dir = tempdir()?;

        assert!(matches!(
            Store::builder()
                .group_config(GroupConfig::default().write_request_queue_capacity(0))
                .path(dir.path())
                .build(),
            Err(Error::InvalidConfig(_))
        ));

        Ok(())
    }

    #[test]
    fn create_twice() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::builder().path(dir.path()).build()?;

        store.create_partition_group("orders", 3, &[0, 1], None)?;
        assert!(store.partition_group_exists("orders", 3)?);
        assert!(!store.partition_group_exists("orders", 4)?);

        assert!(matches!(
            store.create_partition_group("orders", 3, &[0], None),
            Err(Error::PartitionGroupExists(_))
        ));

        let other = Store::builder().path(dir.path()).build()?;
        assert!(other.partition_group_exists("orders", 3)?);
        assert!(matches!(
            other.create_partition_group("orders", 3, &[0], None),
            Err(Error::PartitionGroupExists(_))
        ));

        Ok(())
    }

    #[test]
    fn unknown_group() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::builder().path(dir.path()).build()?;

        assert!(matches!(
            store.get_store("orders", 0, QosLevel::Receive),
            Err(Error::UnknownPartitionGroup(_))
        ));

        assert!(matches!(
            store.get_replicable_store("orders", 0),
            Err(Error::UnknownPartitionGroup(_))
        ));

        Ok(())
    }
}
