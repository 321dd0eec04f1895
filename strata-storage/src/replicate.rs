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

//! Replication hooks.
//!
//! A leader ships raw, whole records from its log. A follower applies them
//! through its own writer task with [`ReplicableStore::append_entries`],
//! which keeps the follower's partition indexes in step with the leader's.

use crate::{
    Error, GroupId, PartitionId, Result, group::PartitionGroup, position::Position,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, instrument};

#[derive(Clone, Debug)]
pub struct ReplicableStore {
    group: Arc<PartitionGroup>,
}

impl ReplicableStore {
    pub(crate) fn new(group: Arc<PartitionGroup>) -> Self {
        Self { group }
    }

    pub fn id(&self) -> &GroupId {
        self.group.id()
    }

    pub fn enable(&self) {
        debug!(id = %self.group.id());
        self.group.status().set_replication(true)
    }

    pub fn disable(&self) {
        debug!(id = %self.group.id());
        self.group.status().set_replication(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.group.status().replication()
    }

    /// Position of the oldest retained byte.
    pub fn left_position(&self) -> Result<Position> {
        self.group.log().start()
    }

    /// Position following the last committed record.
    pub fn right_position(&self) -> Position {
        self.group.log().committed()
    }

    /// Position up to which the log is durable.
    pub fn flushed_position(&self) -> Position {
        self.group.log().flushed()
    }

    pub fn left_index(&self, partition: PartitionId) -> Result<u64> {
        self.group.index().left_index(partition)
    }

    pub fn right_index(&self, partition: PartitionId) -> Result<u64> {
        self.group.index().right_index(partition)
    }

    /// Whole encoded records from `position`: at least one record when
    /// `position` is below the right position, otherwise as many as fit in
    /// `max_bytes`.
    #[instrument(skip(self), fields(id = %self.group.id()))]
    pub fn read_entries(&self, position: Position, max_bytes: usize) -> Result<Bytes> {
        if !self.is_enabled() {
            return Err(Error::ReplicationDisabled(self.group.id().clone()));
        }

        if self.group.is_degraded() {
            return Err(Error::Degraded(self.group.id().clone()));
        }

        self.group.log().read_records(position, max_bytes)
    }

    /// Notified with the new right position after every append.
    pub fn subscribe(&self) -> watch::Receiver<Position> {
        self.group.log().subscribe()
    }

    /// Append records read from a leader at `position`, which must equal
    /// this group's right position. Returns the new right position.
    #[instrument(skip(self, entries), fields(id = %self.group.id(), len = entries.len()))]
    pub async fn append_entries(&self, position: Position, entries: Bytes) -> Result<Position> {
        self.group.replicate(position, entries).await
    }
}
