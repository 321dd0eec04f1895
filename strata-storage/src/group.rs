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

//! Partition groups.
//!
//! A group directory (`{topic}-{group:0>10}`) holds `metadata.json`, the
//! segments of the group's log, one index file per partition and the index
//! checkpoint.

use crate::{
    Error, ErrorCode, GroupId, PartitionId, Result,
    config::GroupConfig,
    index::{Index, IndexWriter},
    pipeline::{Command, WriteFuture, WriteRequest, WriteResult, Writer},
    position::Position,
    read::{self, ReadResult},
    retention::Purged,
    segment::{LogReader, LogWriter, SegmentedLog, sync_dir},
    telemetry::{Observer, ReadServed},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, create_dir, rename},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};
use tokio::{
    sync::{Semaphore, TryAcquireError, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, instrument, warn};

const METADATA: &str = "metadata.json";

/// Headroom in the command channel for flush, purge, replication and stop.
const CONTROL_COMMANDS: usize = 16;

/// When writes through a store handle complete.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum QosLevel {
    /// Once appended to the log and indexed.
    #[default]
    Receive,

    /// Once the log is durable on disk.
    Persistence,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[repr(u8)]
pub enum GroupState {
    #[default]
    Created = 0,
    Restoring = 1,
    Running = 2,
    Stopped = 3,
}

impl From<u8> for GroupState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Restoring,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Status {
    state: AtomicU8,
    degraded: AtomicBool,
    replication: AtomicBool,
}

impl Status {
    fn new(state: GroupState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            ..Default::default()
        }
    }

    pub(crate) fn state(&self) -> GroupState {
        GroupState::from(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: GroupState) {
        self.state.store(state as u8, Ordering::Release)
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Mark the group degraded, returning whether it was healthy before.
    pub(crate) fn degrade(&self) -> bool {
        !self.degraded.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn replication(&self) -> bool {
        self.replication.load(Ordering::Acquire)
    }

    pub(crate) fn set_replication(&self, enabled: bool) {
        self.replication.store(enabled, Ordering::Release)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
struct Metadata {
    topic: String,
    group: u32,
    partitions: Vec<PartitionId>,
    config: GroupConfig,
}

impl Metadata {
    fn read(dir: &Path, id: &GroupId) -> Result<Self> {
        match fs::read(dir.join(METADATA)) {
            Ok(encoded) => serde_json::from_slice(&encoded).map_err(Into::into),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(Error::UnknownPartitionGroup(id.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA);
        let staging = path.with_extension("json.tmp");

        let mut file = File::create(&staging)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.sync_all()?;

        rename(&staging, &path)?;
        sync_dir(dir)
    }
}

/// A log shared by a fixed set of partitions, with its writer task.
#[derive(Debug)]
pub(crate) struct PartitionGroup {
    id: GroupId,
    dir: PathBuf,
    partitions: Vec<PartitionId>,
    config: GroupConfig,
    status: Arc<Status>,
    index: Index,
    log: LogReader,
    observer: Arc<dyn Observer>,
    sender: mpsc::Sender<Command>,
    permits: Arc<Semaphore>,
    writer: Mutex<Option<Writer>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionGroup {
    pub(crate) fn dir(root: &Path, id: &GroupId) -> PathBuf {
        root.join(PathBuf::from(id))
    }

    #[instrument(skip(observer))]
    pub(crate) fn create(
        root: &Path,
        id: GroupId,
        partitions: &[PartitionId],
        config: GroupConfig,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        let config = config.validate()?;

        let mut partitions = partitions.to_vec();
        partitions.sort_unstable();
        partitions.dedup();

        if partitions.is_empty() {
            return Err(Error::InvalidConfig(format!("{id}: no partitions")));
        }

        let dir = Self::dir(root, &id);

        create_dir(&dir).map_err(|error| {
            if error.kind() == ErrorKind::AlreadyExists {
                Error::PartitionGroupExists(id.clone())
            } else {
                error.into()
            }
        })?;

        let log = SegmentedLog::new(&dir, config.get_segment_size()).create()?;
        let index = IndexWriter::create(&dir, &partitions)?;

        Metadata {
            topic: id.topic().to_owned(),
            group: id.group(),
            partitions: partitions.clone(),
            config: config.clone(),
        }
        .write(&dir)?;

        sync_dir(root)?;

        let status = Status::new(GroupState::Created);
        Ok(Self::assemble(
            id, dir, partitions, config, status, log, index, observer,
        ))
    }

    #[instrument(skip(observer))]
    pub(crate) fn restore(root: &Path, id: GroupId, observer: Arc<dyn Observer>) -> Result<Self> {
        let status = Status::new(GroupState::Restoring);
        let dir = Self::dir(root, &id);

        let metadata = Metadata::read(&dir, &id)?;
        let config = metadata.config.validate()?;

        let (mut index, from) = IndexWriter::restore(&dir, &metadata.partitions)?;

        let log = SegmentedLog::new(&dir, config.get_segment_size());

        if let Some(start) = log.start()?.filter(|start| *start > from) {
            warn!(%id, %start, checkpoint = %from, "log starts after checkpoint");
            index.rebase()?;
        }

        let (log, recovery) = log
            .recover(from, |position, header| {
                index.replay(position, header).map(|_| ())
            })?;

        index.purge(recovery.start)?;
        debug!(%id, ?recovery);

        status.set(GroupState::Created);
        Ok(Self::assemble(
            id,
            dir,
            metadata.partitions,
            config,
            status,
            log,
            index,
            observer,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: GroupId,
        dir: PathBuf,
        partitions: Vec<PartitionId>,
        config: GroupConfig,
        status: Status,
        log: LogWriter,
        index: IndexWriter,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let capacity = config.get_write_request_queue_capacity();
        let (sender, receiver) = mpsc::channel(capacity + CONTROL_COMMANDS);

        let status = Arc::new(status);
        let reader = log.reader();
        let shared = index.index().clone();

        let writer = Writer::new(
            id.clone(),
            config.clone(),
            log,
            index,
            status.clone(),
            observer.clone(),
            receiver,
        );

        Self {
            id,
            dir,
            partitions,
            config,
            status,
            index: shared,
            log: reader,
            observer,
            sender,
            permits: Arc::new(Semaphore::new(capacity)),
            writer: Mutex::new(Some(writer)),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &GroupId {
        &self.id
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub(crate) fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> GroupState {
        self.status.state()
    }

    pub(crate) fn status(&self) -> &Status {
        &self.status
    }

    pub(crate) fn index(&self) -> &Index {
        &self.index
    }

    pub(crate) fn log(&self) -> &LogReader {
        &self.log
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    pub(crate) fn degrade(&self, error: &Error) {
        if self.status.degrade() {
            self.observer.group_degraded(&self.id, error);
        }
    }

    fn check(&self) -> Result<(), ErrorCode> {
        if self.status.is_degraded() {
            Err(ErrorCode::StorageError)
        } else if self.status.state() != GroupState::Running {
            Err(ErrorCode::NotRunning)
        } else {
            Ok(())
        }
    }

    fn check_running(&self) -> Result<()> {
        match self.check() {
            Ok(()) => Ok(()),
            Err(ErrorCode::StorageError) => Err(Error::Degraded(self.id.clone())),
            Err(_) => Err(Error::NotRunning(self.id.clone())),
        }
    }

    /// Spawn the writer task. Must be called within a tokio runtime.
    pub(crate) fn start(&self) -> Result<()> {
        match self.status.state() {
            GroupState::Running => Ok(()),
            GroupState::Stopped => Err(Error::NotRunning(self.id.clone())),

            GroupState::Created | GroupState::Restoring => {
                let writer = self
                    .writer
                    .lock()?
                    .take()
                    .ok_or(Error::NotRunning(self.id.clone()))?;

                let handle = tokio::spawn(writer.run());
                _ = self.handle.lock()?.replace(handle);

                self.status.set(GroupState::Running);
                debug!(id = %self.id, "started");
                Ok(())
            }
        }
    }

    /// Stop accepting work, drain queued commands through the writer and
    /// wait for it to exit.
    #[instrument(skip(self), fields(id = %self.id))]
    pub(crate) async fn stop(&self) -> Result<()> {
        let previous = self.status.state();
        self.status.set(GroupState::Stopped);
        self.permits.close();

        if previous != GroupState::Running {
            _ = self.writer.lock()?.take();
            return Ok(());
        }

        let (sender, receiver) = oneshot::channel();

        let stopped = if self.sender.send(Command::Stop { sender }).await.is_ok() {
            receiver.await.unwrap_or(Ok(()))
        } else {
            Ok(())
        };

        let handle = self.handle.lock()?.take();

        if let Some(handle) = handle {
            handle
                .await
                .map_err(|error| Error::Message(error.to_string()))?;
        }

        stopped
    }

    fn permits_for(&self, requests: usize) -> Result<u32, ErrorCode> {
        u32::try_from(requests)
            .ok()
            .filter(|_| requests <= self.config.get_write_request_queue_capacity())
            .ok_or(ErrorCode::CapacityExceeded)
    }

    pub(crate) fn submit(&self, requests: Vec<WriteRequest>, qos: QosLevel) -> WriteFuture {
        let count = requests.len();

        if count == 0 {
            return WriteFuture::ready(vec![]);
        }

        let permits = match self.check().and_then(|()| self.permits_for(count)) {
            Ok(permits) => permits,
            Err(code) => return WriteFuture::rejected(code, count),
        };

        let permit = match self.permits.clone().try_acquire_many_owned(permits) {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return WriteFuture::rejected(ErrorCode::CapacityExceeded, count);
            }
            Err(TryAcquireError::Closed) => {
                return WriteFuture::rejected(ErrorCode::NotRunning, count);
            }
        };

        let (sender, receiver) = oneshot::channel();

        match self.sender.try_send(Command::Write {
            requests,
            qos,
            permit,
            sender,
        }) {
            Ok(()) => WriteFuture::pending(receiver, count),
            Err(mpsc::error::TrySendError::Full(_)) => {
                WriteFuture::rejected(ErrorCode::CapacityExceeded, count)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                WriteFuture::rejected(ErrorCode::NotRunning, count)
            }
        }
    }

    pub(crate) async fn write(&self, requests: Vec<WriteRequest>, qos: QosLevel) -> Vec<WriteResult> {
        let count = requests.len();

        if count == 0 {
            return vec![];
        }

        let permits = match self.check().and_then(|()| self.permits_for(count)) {
            Ok(permits) => permits,
            Err(code) => return WriteFuture::rejected(code, count).await,
        };

        let Ok(permit) = self.permits.clone().acquire_many_owned(permits).await else {
            return WriteFuture::rejected(ErrorCode::NotRunning, count).await;
        };

        let (sender, receiver) = oneshot::channel();

        if self
            .sender
            .send(Command::Write {
                requests,
                qos,
                permit,
                sender,
            })
            .await
            .is_err()
        {
            return WriteFuture::rejected(ErrorCode::NotRunning, count).await;
        }

        WriteFuture::pending(receiver, count).await
    }

    pub(crate) fn read(
        &self,
        partition: PartitionId,
        from: u64,
        max_messages: usize,
        max_bytes: usize,
    ) -> ReadResult {
        if let Err(code) = self.check() {
            return ReadResult::error(code);
        }

        match read::read(
            &self.index,
            &self.log,
            partition,
            from,
            max_messages,
            max_bytes,
        ) {
            Ok(result) => {
                self.observer.read_served(&ReadServed {
                    group: &self.id,
                    partition,
                    from,
                    messages: result.messages().len(),
                    bytes: result.bytes(),
                    eop: result.eop(),
                });

                result
            }

            Err(error) if error.is_fatal() => {
                self.degrade(&error);
                ReadResult::error(ErrorCode::StorageError)
            }

            Err(error) => {
                debug!(id = %self.id, partition, from, ?error);
                ReadResult::error(ErrorCode::from(&error))
            }
        }
    }

    async fn control<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        self.check_running()?;

        let (sender, receiver) = oneshot::channel();

        self.sender
            .send(command(sender))
            .await
            .map_err(|_| Error::NotRunning(self.id.clone()))?;

        receiver
            .await
            .map_err(|_| Error::NotRunning(self.id.clone()))?
    }

    pub(crate) async fn flush(&self) -> Result<Position> {
        self.control(|sender| Command::Flush { sender }).await
    }

    pub(crate) async fn purge(&self, before: Position) -> Result<Purged> {
        self.control(|sender| Command::Purge { before, sender })
            .await
    }

    pub(crate) async fn replicate(&self, position: Position, entries: Bytes) -> Result<Position> {
        self.control(|sender| Command::Replicate {
            position,
            entries,
            sender,
        })
        .await
    }
}

/// A handle on a partition group for producers and consumers.
///
/// Handles are cheap to clone. Writes complete according to the handle's
/// [`QosLevel`].
#[derive(Clone, Debug)]
pub struct PartitionGroupStore {
    group: Arc<PartitionGroup>,
    qos: QosLevel,
}

impl PartitionGroupStore {
    pub(crate) fn new(group: Arc<PartitionGroup>, qos: QosLevel) -> Self {
        Self { group, qos }
    }

    pub fn id(&self) -> &GroupId {
        self.group.id()
    }

    pub fn topic(&self) -> &str {
        self.group.id().topic()
    }

    pub fn group(&self) -> u32 {
        self.group.id().group()
    }

    pub fn qos(&self) -> QosLevel {
        self.qos
    }

    pub fn partitions(&self) -> &[PartitionId] {
        self.group.partitions()
    }

    pub fn config(&self) -> &GroupConfig {
        self.group.config()
    }

    pub fn state(&self) -> GroupState {
        self.group.state()
    }

    pub fn is_degraded(&self) -> bool {
        self.group.is_degraded()
    }

    /// Oldest retained index of `partition`.
    pub fn left_index(&self, partition: PartitionId) -> Result<u64> {
        self.group.index().left_index(partition)
    }

    /// Index the next message written to `partition` will be assigned.
    pub fn right_index(&self, partition: PartitionId) -> Result<u64> {
        self.group.index().right_index(partition)
    }

    /// Queue `requests` without waiting for capacity.
    ///
    /// When the group has too many outstanding requests every request
    /// completes at once with [`ErrorCode::CapacityExceeded`].
    pub fn submit(&self, requests: Vec<WriteRequest>) -> WriteFuture {
        self.group.submit(requests, self.qos)
    }

    /// Queue `requests`, waiting for capacity, and wait for completion.
    pub async fn write(&self, requests: Vec<WriteRequest>) -> Vec<WriteResult> {
        self.group.write(requests, self.qos).await
    }

    /// Read up to `max_messages` from `from`, stopping before `max_bytes`
    /// of message data unless that would return nothing.
    pub fn read(
        &self,
        partition: PartitionId,
        from: u64,
        max_messages: usize,
        max_bytes: usize,
    ) -> ReadResult {
        self.group.read(partition, from, max_messages, max_bytes)
    }

    /// Make everything written so far durable.
    pub async fn flush(&self) -> Result<Position> {
        self.group.flush().await
    }
}
