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

//! Write pipeline.
//!
//! Each running group has one writer task that owns the [`LogWriter`] and
//! [`IndexWriter`]. Producers send commands over a bounded channel and
//! receive results over oneshot channels, so every append is totally
//! ordered by the channel and indices are assigned without gaps.

use crate::{
    Error, ErrorCode, GroupId, PartitionId, Result, batch,
    config::GroupConfig,
    group::{QosLevel, Status},
    index::IndexWriter,
    now_millis,
    position::Position,
    record::{Header, Record},
    retention::Purged,
    segment::LogWriter,
    telemetry::{AppendCommitted, Observer},
};
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    select,
    sync::{OwnedSemaphorePermit, mpsc, oneshot},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, instrument, warn};

/// A write of one or more messages to a partition.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WriteRequest {
    partition: PartitionId,
    buffer: Bytes,
    batch_size: u16,
    batch: bool,
}

impl WriteRequest {
    /// A single message.
    pub fn new(partition: PartitionId, buffer: impl Into<Bytes>) -> Self {
        Self {
            partition,
            buffer: buffer.into(),
            batch_size: 1,
            batch: false,
        }
    }

    /// A batch of messages, stored as one physical record.
    pub fn batch<I>(partition: PartitionId, messages: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        batch::encode(messages).map(|(buffer, batch_size)| Self {
            partition,
            buffer,
            batch_size,
            batch: true,
        })
    }

    /// A batch body already framed by [`batch::encode`], carrying
    /// `batch_size` messages.
    pub fn with_batch_size(
        partition: PartitionId,
        buffer: impl Into<Bytes>,
        batch_size: u16,
    ) -> Self {
        Self {
            partition,
            buffer: buffer.into(),
            batch_size,
            batch: true,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn batch_size(&self) -> u16 {
        self.batch_size
    }

    pub fn is_batch(&self) -> bool {
        self.batch
    }
}

/// The outcome of one [`WriteRequest`]: an index per message in request
/// order, or an error code.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WriteResult {
    code: ErrorCode,
    indices: Vec<u64>,
}

impl WriteResult {
    pub(crate) fn ok(indices: Vec<u64>) -> Self {
        Self {
            code: ErrorCode::None,
            indices,
        }
    }

    pub(crate) fn error(code: ErrorCode) -> Self {
        Self {
            code,
            indices: vec![],
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    pub fn first_index(&self) -> Option<u64> {
        self.indices.first().copied()
    }
}

/// Completion of a submitted write, resolving to one result per request.
///
/// Dropping the future does not withdraw the write.
#[derive(Debug)]
pub struct WriteFuture(Completion);

#[derive(Debug)]
enum Completion {
    Ready(Option<Vec<WriteResult>>),
    Pending {
        receiver: oneshot::Receiver<Vec<WriteResult>>,
        requests: usize,
    },
}

impl WriteFuture {
    pub(crate) fn ready(results: Vec<WriteResult>) -> Self {
        Self(Completion::Ready(Some(results)))
    }

    pub(crate) fn rejected(code: ErrorCode, requests: usize) -> Self {
        Self::ready(vec![WriteResult::error(code); requests])
    }

    pub(crate) fn pending(receiver: oneshot::Receiver<Vec<WriteResult>>, requests: usize) -> Self {
        Self(Completion::Pending { receiver, requests })
    }
}

impl Future for WriteFuture {
    type Output = Vec<WriteResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.0 {
            Completion::Ready(results) => Poll::Ready(results.take().unwrap_or_default()),

            Completion::Pending { receiver, requests } => {
                let requests = *requests;

                Pin::new(receiver).poll(cx).map(|completed| {
                    completed.unwrap_or_else(|_| {
                        vec![WriteResult::error(ErrorCode::NotRunning); requests]
                    })
                })
            }
        }
    }
}

pub(crate) enum Command {
    Write {
        requests: Vec<WriteRequest>,
        qos: QosLevel,
        permit: OwnedSemaphorePermit,
        sender: oneshot::Sender<Vec<WriteResult>>,
    },

    Replicate {
        position: Position,
        entries: Bytes,
        sender: oneshot::Sender<Result<Position>>,
    },

    Flush {
        sender: oneshot::Sender<Result<Position>>,
    },

    Purge {
        before: Position,
        sender: oneshot::Sender<Result<Purged>>,
    },

    Stop {
        sender: oneshot::Sender<Result<()>>,
    },
}

impl Debug for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { requests, qos, .. } => f
                .debug_struct("Write")
                .field("requests", &requests.len())
                .field("qos", qos)
                .finish(),

            Self::Replicate {
                position, entries, ..
            } => f
                .debug_struct("Replicate")
                .field("position", position)
                .field("entries", &entries.len())
                .finish(),

            Self::Flush { .. } => f.debug_struct("Flush").finish(),

            Self::Purge { before, .. } => {
                f.debug_struct("Purge").field("before", before).finish()
            }

            Self::Stop { .. } => f.debug_struct("Stop").finish(),
        }
    }
}

#[derive(Debug)]
struct Persisting {
    results: Vec<WriteResult>,
    sender: oneshot::Sender<Vec<WriteResult>>,
    permit: OwnedSemaphorePermit,
}

/// The single owner of a group's log and index writers.
#[derive(Debug)]
pub(crate) struct Writer {
    id: GroupId,
    config: GroupConfig,
    log: LogWriter,
    index: IndexWriter,
    status: Arc<Status>,
    observer: Arc<dyn Observer>,
    receiver: mpsc::Receiver<Command>,
    persisting: Vec<Persisting>,
}

impl Writer {
    pub(crate) fn new(
        id: GroupId,
        config: GroupConfig,
        log: LogWriter,
        index: IndexWriter,
        status: Arc<Status>,
        observer: Arc<dyn Observer>,
        receiver: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            id,
            config,
            log,
            index,
            status,
            observer,
            receiver,
            persisting: vec![],
        }
    }

    #[instrument(skip_all, fields(group = %self.id))]
    pub(crate) async fn run(mut self) {
        let mut interval = time::interval(self.config.get_flush_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                command = self.receiver.recv() => {
                    let Some(command) = command else {
                        _ = self.shutdown();
                        break;
                    };

                    let mut stop = self.handle(command);

                    while stop.is_none() {
                        match self.receiver.try_recv() {
                            Ok(command) => stop = self.handle(command),
                            Err(_) => break,
                        }
                    }

                    self.group_commit();

                    if let Some(sender) = stop {
                        _ = sender.send(self.shutdown());
                        break;
                    }
                }

                _ = interval.tick() => self.tick(),
            }
        }

        debug!("stopped");
    }

    fn handle(&mut self, command: Command) -> Option<oneshot::Sender<Result<()>>> {
        match command {
            Command::Write {
                requests,
                qos,
                permit,
                sender,
            } => {
                let results = requests
                    .iter()
                    .map(|request| self.write(request))
                    .collect::<Vec<_>>();

                match qos {
                    QosLevel::Receive => {
                        _ = sender.send(results);
                        drop(permit);
                    }

                    QosLevel::Persistence => self.persisting.push(Persisting {
                        results,
                        sender,
                        permit,
                    }),
                }

                if self.log.dirty_bytes() > self.config.get_max_dirty_bytes() {
                    debug!(dirty = self.log.dirty_bytes());
                    self.group_commit();
                }
            }

            Command::Replicate {
                position,
                entries,
                sender,
            } => {
                _ = sender.send(self.replicate(position, entries));
            }

            Command::Flush { sender } => {
                let flushed = self.checkpoint().inspect_err(|error| {
                    if error.is_fatal() {
                        self.degrade(error)
                    }
                });

                _ = sender.send(flushed);
            }

            Command::Purge { before, sender } => {
                _ = sender.send(self.purge(before));
            }

            Command::Stop { sender } => return Some(sender),
        }

        None
    }

    fn write(&mut self, request: &WriteRequest) -> WriteResult {
        if self.status.is_degraded() {
            return WriteResult::error(ErrorCode::StorageError);
        }

        match self.append(request) {
            Ok(indices) => WriteResult::ok(indices),

            Err(error) if error.is_fatal() => {
                self.degrade(&error);
                WriteResult::error(ErrorCode::StorageError)
            }

            Err(error) => {
                debug!(partition = request.partition(), ?error);
                WriteResult::error(ErrorCode::from(&error))
            }
        }
    }

    fn append(&mut self, request: &WriteRequest) -> Result<Vec<u64>> {
        let partition = request.partition();
        let index = self.index.index().right_index(partition)?;

        let builder = Record::builder()
            .partition(partition)
            .index(index)
            .timestamp(now_millis()?);

        let record = if request.is_batch() {
            builder.batch(request.buffer().clone(), request.batch_size())
        } else {
            builder.body(request.buffer().clone())
        }
        .build()?;

        let encoded = record.encode();
        let max_message_length = self.config.get_max_message_length();

        if encoded.len() > max_message_length as usize {
            return Err(Error::MessageTooLarge {
                length: encoded.len(),
                max_message_length,
            });
        }

        self.commit(&encoded, record.header())?;
        Ok((index..record.header().next_index()).collect())
    }

    fn commit(&mut self, encoded: &[u8], header: &Header) -> Result<Position> {
        let position = self.log.append(encoded)?;

        _ = self.index.append(
            header.partition,
            header.index,
            position,
            header.length,
            u32::from(header.count),
        )?;

        self.observer.append_committed(&AppendCommitted {
            group: &self.id,
            partition: header.partition,
            index: header.index,
            count: header.count,
            position,
            length: header.length,
        });

        Ok(position)
    }

    /// Apply records replicated from a leader at `position`.
    ///
    /// Every record is validated before any is appended, so a rejected
    /// batch leaves the group untouched.
    fn replicate(&mut self, position: Position, entries: Bytes) -> Result<Position> {
        if self.status.is_degraded() {
            return Err(Error::Degraded(self.id.clone()));
        }

        let expected = self.log.position();
        if position != expected {
            return Err(Error::OutOfBounds {
                position,
                start: expected,
                end: expected,
            });
        }

        let mut records = vec![];
        let mut rights = BTreeMap::new();
        let mut offset = 0;

        while offset < entries.len() {
            let at = position.advance(u64::try_from(offset)?)?;

            let header = Header::decode(&entries[offset..])
                .map_err(|reason| Error::MalformedRecord {
                    position: at,
                    reason,
                })?;

            let end = offset + header.length as usize;
            if end > entries.len() {
                return Err(Error::MalformedRecord {
                    position: at,
                    reason: "incomplete record",
                });
            }

            let record = Record::decode(at, entries.slice(offset..end))?;

            let right_index = match rights.get(&header.partition) {
                Some(right_index) => *right_index,
                None => self.index.index().right_index(header.partition)?,
            };

            if header.index != right_index {
                return Err(Error::OrderingViolation {
                    partition: header.partition,
                    index: header.index,
                    right_index,
                });
            }

            _ = rights.insert(header.partition, header.next_index());
            records.push((entries.slice(offset..end), *record.header()));
            offset = end;
        }

        debug!(%position, records = records.len());

        for (encoded, header) in records {
            if let Err(error) = self.commit(&encoded, &header) {
                self.degrade(&error);
                return Err(error);
            }
        }

        Ok(self.log.position())
    }

    fn purge(&mut self, before: Position) -> Result<Purged> {
        if self.status.is_degraded() {
            return Err(Error::Degraded(self.id.clone()));
        }

        let previous_start = self.log.reader().start()?;

        self.log
            .start_after_purge(before)
            .and_then(|start| {
                if start > previous_start {
                    self.index.purge(start)?;
                    _ = self.checkpoint()?;
                    self.index.compact()?;

                    _ = self.log.purge_before(start)?;
                }

                Ok(Purged {
                    previous_start,
                    start,
                })
            })
            .inspect_err(|error| self.degrade(error))
    }

    /// Complete persistence writes once the log is durable.
    fn group_commit(&mut self) {
        if self.persisting.is_empty() && self.log.dirty_bytes() <= self.config.get_max_dirty_bytes()
        {
            return;
        }

        let flushed = if self.status.is_degraded() {
            Err(Error::Degraded(self.id.clone()))
        } else {
            self.log.flush().inspect_err(|error| self.degrade(error))
        };

        for persisting in self.persisting.drain(..) {
            let results = if flushed.is_ok() {
                persisting.results
            } else {
                vec![WriteResult::error(ErrorCode::StorageError); persisting.results.len()]
            };

            _ = persisting.sender.send(results);
            drop(persisting.permit);
        }
    }

    fn tick(&mut self) {
        if self.status.is_degraded() {
            return;
        }

        self.group_commit();

        if self.log.position() != self.index.checkpointed() {
            if let Err(error) = self.checkpoint() {
                self.degrade(&error);
            }
        }
    }

    /// Make the log durable and record the index checkpoint covering it.
    fn checkpoint(&mut self) -> Result<Position> {
        if self.status.is_degraded() {
            return Err(Error::Degraded(self.id.clone()));
        }

        self.group_commit();

        let flushed = self.log.flush()?;

        if flushed != self.index.checkpointed() {
            self.index.checkpoint(flushed)?;
        }

        Ok(flushed)
    }

    fn degrade(&mut self, error: &Error) {
        if self.status.degrade() {
            self.observer.group_degraded(&self.id, error);
        }
    }

    /// Checkpoint and answer everything still queued with `NotRunning`.
    fn shutdown(&mut self) -> Result<()> {
        let checkpointed = if self.status.is_degraded() {
            self.group_commit();
            Ok(())
        } else {
            self.checkpoint().map(|_| ())
        };

        self.receiver.close();

        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Write {
                    requests, sender, ..
                } => {
                    _ = sender.send(vec![
                        WriteResult::error(ErrorCode::NotRunning);
                        requests.len()
                    ]);
                }

                Command::Replicate { sender, .. } | Command::Flush { sender } => {
                    _ = sender.send(Err(Error::NotRunning(self.id.clone())));
                }

                Command::Purge { sender, .. } => {
                    _ = sender.send(Err(Error::NotRunning(self.id.clone())));
                }

                Command::Stop { sender } => {
                    _ = sender.send(Ok(()));
                }
            }
        }

        if let Err(ref error) = checkpointed {
            warn!(group = %self.id, ?error);
        }

        checkpointed
    }
}
