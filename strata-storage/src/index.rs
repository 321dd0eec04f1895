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

//! Partition indexes.
//!
//! Each partition maps logical message indices to the physical record that
//! carries them. There is one entry per record: a batch record of `count`
//! messages covers `count` consecutive indices from the entry's index. The
//! retained indices of a partition are the half open range `[left, right)`.
//!
//! [`Index`] is the shared, read side. [`IndexWriter`] is owned by the
//! group's writer task, persists entries to one file per partition
//! (`{partition:0>5}.index`) and writes `checkpoint.json` once the log is
//! durable.

use crate::{
    Error, PartitionId, Result,
    position::Position,
    record::Header,
    segment::{Truncate, sync_dir},
};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt::{self, Debug, Formatter},
    fs::{self, File, OpenOptions, rename},
    io::{Cursor, ErrorKind, Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, instrument};

pub const ENTRY_SIZE: usize = 24;

const CHECKPOINT: &str = "checkpoint.json";

/// The physical extent of a record carrying `count` messages from `index`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Entry {
    pub index: u64,
    pub position: Position,
    pub length: u32,
    pub count: u32,
}

impl Entry {
    pub fn next_index(&self) -> u64 {
        self.index + u64::from(self.count)
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.index && index < self.next_index()
    }

    fn encode_into(&self, encoded: &mut BytesMut) {
        encoded.put_u64(self.index);
        encoded.put_u64(self.position.get());
        encoded.put_u32(self.length);
        encoded.put_u32(self.count);
    }

    fn decode(mut encoded: &[u8]) -> Self {
        let index = encoded.get_u64();
        let position = Position::new(encoded.get_u64());
        let length = encoded.get_u32();
        let count = encoded.get_u32();

        Self {
            index,
            position,
            length,
            count,
        }
    }
}

pub trait SyncData {
    fn sync_data(&mut self) -> Result<()>;
}

impl SyncData for File {
    fn sync_data(&mut self) -> Result<()> {
        File::sync_data(self).map_err(Into::into)
    }
}

impl SyncData for Cursor<Vec<u8>> {
    fn sync_data(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Builder;

/// The persisted entries of one partition.
///
/// Appended entries are buffered until [`IndexFile::sync`].
pub struct IndexFile<S> {
    storage: S,
    partition: PartitionId,
    entries: u64,
    pending: BytesMut,
}

impl<S> Debug for IndexFile<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(IndexFile))
            .field("partition", &self.partition)
            .field("entries", &self.entries)
            .field("pending", &(self.pending.len() / ENTRY_SIZE))
            .finish()
    }
}

pub struct IndexFileBuilder<S> {
    storage: S,
    partition: PartitionId,
}

impl<S> Debug for IndexFileBuilder<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(IndexFileBuilder))
            .field("partition", &self.partition)
            .finish()
    }
}

impl IndexFile<PhantomData<Builder>> {
    pub fn builder() -> IndexFileBuilder<Builder> {
        IndexFileBuilder {
            storage: Builder,
            partition: 0,
        }
    }

    pub fn filename(dir: &Path, partition: PartitionId) -> PathBuf {
        dir.join(format!("{partition:0>5}")).with_extension("index")
    }
}

impl<S> IndexFileBuilder<S> {
    pub fn partition(self, partition: PartitionId) -> Self {
        Self { partition, ..self }
    }
}

impl IndexFileBuilder<Builder> {
    pub fn in_memory(self, data: Vec<u8>) -> IndexFileBuilder<Cursor<Vec<u8>>> {
        IndexFileBuilder {
            storage: Cursor::new(data),
            partition: self.partition,
        }
    }

    pub fn file_system<P>(self, path: P) -> Result<IndexFileBuilder<File>>
    where
        P: AsRef<Path>,
    {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(path)
            .map(|storage| IndexFileBuilder {
                storage,
                partition: self.partition,
            })
            .map_err(Into::into)
    }
}

impl<S> IndexFileBuilder<S>
where
    S: Read + Seek + SyncData + Truncate + Write,
{
    pub fn build(self) -> IndexFile<S> {
        IndexFile {
            storage: self.storage,
            partition: self.partition,
            entries: 0,
            pending: BytesMut::new(),
        }
    }
}

impl<S> IndexFile<S>
where
    S: Read + Seek + SyncData + Truncate + Write,
{
    /// Number of durable entries.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn append(&mut self, entry: &Entry) {
        entry.encode_into(&mut self.pending);
    }

    /// Write and sync buffered entries.
    pub fn sync(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let offset = self.entries * ENTRY_SIZE as u64;
        _ = self.storage.seek(SeekFrom::Start(offset))?;
        self.storage.write_all(&self.pending)?;
        self.storage.sync_data()?;

        self.entries += u64::try_from(self.pending.len() / ENTRY_SIZE)?;
        self.pending.clear();

        Ok(())
    }

    /// Read the stored entries ending at or before `right`, discarding
    /// anything stored after them.
    pub fn load(&mut self, right: u64) -> Result<Vec<Entry>> {
        let mut encoded = vec![];

        _ = self.storage.seek(SeekFrom::Start(0))?;
        _ = self.storage.read_to_end(&mut encoded)?;

        let entries = encoded
            .chunks_exact(ENTRY_SIZE)
            .map(Entry::decode)
            .take_while(|entry| entry.next_index() <= right)
            .collect::<Vec<_>>();

        let count = u64::try_from(entries.len())?;

        self.storage.truncate_from(count * ENTRY_SIZE as u64)?;
        self.entries = count;
        self.pending.clear();

        Ok(entries)
    }
}

#[derive(Debug, Default)]
struct PartitionIndex {
    entries: RwLock<VecDeque<Entry>>,
    left: AtomicU64,
    right: AtomicU64,
}

impl PartitionIndex {
    fn new(entries: VecDeque<Entry>, left: u64, right: u64) -> Self {
        Self {
            entries: RwLock::new(entries),
            left: AtomicU64::new(left),
            right: AtomicU64::new(right),
        }
    }
}

/// Shared read access to the partition indexes of a group.
#[derive(Clone, Debug, Default)]
pub struct Index {
    partitions: Arc<BTreeMap<PartitionId, PartitionIndex>>,
}

impl Index {
    fn partition(&self, partition: PartitionId) -> Result<&PartitionIndex> {
        self.partitions
            .get(&partition)
            .ok_or(Error::UnknownPartition(partition))
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    pub fn left_index(&self, partition: PartitionId) -> Result<u64> {
        self.partition(partition)
            .map(|index| index.left.load(Ordering::Acquire))
    }

    pub fn right_index(&self, partition: PartitionId) -> Result<u64> {
        self.partition(partition)
            .map(|index| index.right.load(Ordering::Acquire))
    }

    /// The entry of the record carrying `index`.
    pub fn lookup(&self, partition: PartitionId, index: u64) -> Result<Entry> {
        self.entries_from(partition, index, 1).and_then(|entries| {
            entries.first().copied().ok_or(Error::PositionOverflow {
                partition,
                index,
                left_index: self.left_index(partition).unwrap_or_default(),
                right_index: self.right_index(partition).unwrap_or_default(),
            })
        })
    }

    /// Up to `limit` consecutive entries, the first carrying `index`.
    pub fn entries_from(
        &self,
        partition: PartitionId,
        index: u64,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let partition_index = self.partition(partition)?;

        let right_index = partition_index.right.load(Ordering::Acquire);
        let left_index = partition_index.left.load(Ordering::Acquire);

        let overflow = Error::PositionOverflow {
            partition,
            index,
            left_index,
            right_index,
        };

        if index < left_index || index >= right_index {
            return Err(overflow);
        }

        let entries = partition_index.entries.read()?;
        let first = entries.partition_point(|entry| entry.next_index() <= index);

        if entries.get(first).is_none_or(|entry| !entry.contains(index)) {
            return Err(overflow);
        }

        Ok(entries.range(first..).take(limit).copied().collect())
    }
}

/// Durable bounds of a partition at a checkpoint.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct PartitionCheckpoint {
    pub left: u64,
    pub right: u64,
}

/// Log position covered by the durable index files.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Checkpoint {
    pub position: Position,
    pub partitions: BTreeMap<PartitionId, PartitionCheckpoint>,
}

impl Checkpoint {
    fn read(dir: &Path) -> Result<Option<Self>> {
        match fs::read(dir.join(CHECKPOINT)) {
            Ok(encoded) => serde_json::from_slice(&encoded)
                .map(Some)
                .map_err(Into::into),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CHECKPOINT);
        let staging = path.with_extension("json.tmp");

        let mut file = File::create(&staging)?;
        serde_json::to_writer(&mut file, self)?;
        file.sync_all()?;

        rename(&staging, &path)?;
        sync_dir(dir)
    }
}

/// The write half of a group's indexes.
#[derive(Debug)]
pub struct IndexWriter {
    index: Index,
    dir: PathBuf,
    files: BTreeMap<PartitionId, IndexFile<File>>,
    checkpoint: Position,
    rebased: BTreeSet<PartitionId>,
}

impl IndexWriter {
    /// Empty indexes for `partitions`, replacing any existing index files.
    #[instrument]
    pub fn create(dir: &Path, partitions: &[PartitionId]) -> Result<Self> {
        let mut files = BTreeMap::new();
        let mut indexes = BTreeMap::new();

        for partition in partitions {
            let mut file = IndexFile::builder()
                .partition(*partition)
                .file_system(IndexFile::filename(dir, *partition))?
                .build();

            _ = file.load(0)?;
            _ = files.insert(*partition, file);
            _ = indexes.insert(*partition, PartitionIndex::default());
        }

        let mut writer = Self {
            index: Index {
                partitions: Arc::new(indexes),
            },
            dir: dir.to_path_buf(),
            files,
            checkpoint: Position::ZERO,
            rebased: BTreeSet::new(),
        };

        writer.checkpoint(Position::ZERO)?;
        Ok(writer)
    }

    /// Load the durable entries of every partition, returning the writer
    /// and the log position from which records must be replayed.
    #[instrument]
    pub fn restore(dir: &Path, partitions: &[PartitionId]) -> Result<(Self, Position)> {
        let checkpoint = Checkpoint::read(dir)?.unwrap_or_default();
        debug!(?checkpoint);

        let mut files = BTreeMap::new();
        let mut indexes = BTreeMap::new();

        for partition in partitions {
            let mut file = IndexFile::builder()
                .partition(*partition)
                .file_system(IndexFile::filename(dir, *partition))?
                .build();

            let durable = checkpoint
                .partitions
                .get(partition)
                .copied()
                .unwrap_or_default();

            let entries = file
                .load(durable.right)?
                .into_iter()
                .filter(|entry| entry.index >= durable.left)
                .collect::<VecDeque<_>>();

            let right = entries
                .back()
                .map(Entry::next_index)
                .unwrap_or(durable.left);

            if right != durable.right {
                return Err(Error::Integrity {
                    position: checkpoint.position,
                    reason: format!(
                        "partition: {partition}, index file ends at {right}, checkpoint: {}",
                        durable.right
                    ),
                });
            }

            _ = files.insert(*partition, file);
            _ = indexes.insert(
                *partition,
                PartitionIndex::new(entries, durable.left, durable.right),
            );
        }

        Ok((
            Self {
                index: Index {
                    partitions: Arc::new(indexes),
                },
                dir: dir.to_path_buf(),
                files,
                checkpoint: checkpoint.position,
                rebased: BTreeSet::new(),
            },
            checkpoint.position,
        ))
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Position covered by the last written checkpoint.
    pub fn checkpointed(&self) -> Position {
        self.checkpoint
    }

    /// Publish the entry for a record appended at `position`.
    pub fn append(
        &mut self,
        partition: PartitionId,
        index: u64,
        position: Position,
        length: u32,
        count: u32,
    ) -> Result<Entry> {
        let partition_index = self.index.partition(partition)?;
        let right_index = partition_index.right.load(Ordering::Acquire);

        if index > right_index && self.rebased.remove(&partition) {
            debug!(partition, index, right_index, "rebased");
            partition_index.left.store(index, Ordering::Release);
            partition_index.right.store(index, Ordering::Release);
        } else if index != right_index {
            return Err(Error::OrderingViolation {
                partition,
                index,
                right_index,
            });
        }

        _ = self.rebased.remove(&partition);

        let entry = Entry {
            index,
            position,
            length,
            count,
        };

        partition_index.entries.write()?.push_back(entry);
        partition_index
            .right
            .store(entry.next_index(), Ordering::Release);

        if let Some(file) = self.files.get_mut(&partition) {
            file.append(&entry);
        }

        Ok(entry)
    }

    /// Index a record found while scanning the log.
    pub fn replay(&mut self, position: Position, header: &Header) -> Result<Entry> {
        self.append(
            header.partition,
            header.index,
            position,
            header.length,
            u32::from(header.count),
        )
    }

    /// Drop entries for records before `start`, advancing left bounds.
    #[instrument(skip(self))]
    pub fn purge(&mut self, start: Position) -> Result<()> {
        for (partition, partition_index) in self.index.partitions.iter() {
            let mut entries = partition_index.entries.write()?;

            while entries.front().is_some_and(|entry| entry.position < start) {
                _ = entries.pop_front();
            }

            let left = entries
                .front()
                .map(|entry| entry.index)
                .unwrap_or_else(|| partition_index.right.load(Ordering::Acquire));

            debug!(partition, left);
            partition_index.left.store(left, Ordering::Release);
        }

        Ok(())
    }

    /// Forget every entry, leaving each partition empty at its right
    /// bound.
    ///
    /// Used when the log starts after the checkpoint position, so the
    /// records between them are gone. The first record replayed for each
    /// partition may then carry any index at or above the right bound.
    #[instrument(skip(self))]
    pub fn rebase(&mut self) -> Result<()> {
        for (partition, partition_index) in self.index.partitions.iter() {
            partition_index.entries.write()?.clear();

            let right = partition_index.right.load(Ordering::Acquire);
            partition_index.left.store(right, Ordering::Release);

            _ = self.rebased.insert(*partition);
        }

        Ok(())
    }

    /// Rewrite each index file to hold only the retained entries.
    ///
    /// The entries are written to a staging file that replaces the index
    /// file by rename, so a crash leaves either the old or the new file.
    #[instrument(skip(self))]
    pub fn compact(&mut self) -> Result<()> {
        for (partition, partition_index) in self.index.partitions.iter() {
            let Some(file) = self.files.get_mut(partition) else {
                continue;
            };

            file.sync()?;

            let entries = partition_index.entries.read()?;

            if file.entries() == u64::try_from(entries.len())? {
                continue;
            }

            let path = IndexFile::filename(&self.dir, *partition);
            let staging = path.with_extension("index.tmp");

            let mut compacted = IndexFile::builder()
                .partition(*partition)
                .file_system(&staging)?
                .build();

            _ = compacted.load(0)?;
            entries.iter().for_each(|entry| compacted.append(entry));
            compacted.sync()?;

            rename(&staging, &path)?;

            debug!(partition, from = file.entries(), to = compacted.entries());
            *file = compacted;
        }

        sync_dir(&self.dir)
    }

    /// Sync every index file and record that they cover the log up to
    /// `position`, which must already be durable.
    #[instrument(skip(self))]
    pub fn checkpoint(&mut self, position: Position) -> Result<()> {
        let mut partitions = BTreeMap::new();

        for (partition, file) in self.files.iter_mut() {
            file.sync()?;

            let index = self.index.partition(*partition)?;

            _ = partitions.insert(
                *partition,
                PartitionCheckpoint {
                    left: index.left.load(Ordering::Acquire),
                    right: index.right.load(Ordering::Acquire),
                },
            );
        }

        Checkpoint {
            position,
            partitions,
        }
        .write(&self.dir)?;

        self.checkpoint = position;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn entry(index: u64, position: u64, count: u32) -> Entry {
        Entry {
            index,
            position: Position::new(position),
            length: 64,
            count,
        }
    }

    #[test]
    fn file_in_memory() -> Result<()> {
        let mut file = IndexFile::builder().partition(6).in_memory(vec![]).build();

        file.append(&entry(0, 0, 1));
        file.append(&entry(1, 64, 3));
        assert_eq!(0, file.entries());

        file.sync()?;
        assert_eq!(2, file.entries());

        file.append(&entry(4, 128, 1));

        assert_eq!(vec![entry(0, 0, 1), entry(1, 64, 3)], file.load(2)?);
        assert_eq!(2, file.entries());

        file.append(&entry(4, 128, 1));
        file.sync()?;
        assert_eq!(
            vec![entry(0, 0, 1), entry(1, 64, 3), entry(4, 128, 1)],
            file.load(3)?
        );

        assert_eq!(vec![entry(0, 0, 1), entry(1, 64, 3)], file.load(4)?);
        assert_eq!(2, file.entries());

        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn append_and_lookup() -> Result<()> {
        let dir = tempdir()?;
        let mut writer = IndexWriter::create(dir.path(), &[0, 1])?;
        let index = writer.index().clone();

        _ = writer.append(0, 0, Position::new(0), 64, 1)?;
        _ = writer.append(0, 1, Position::new(64), 64, 3)?;
        _ = writer.append(1, 0, Position::new(128), 64, 1)?;
        _ = writer.append(0, 4, Position::new(192), 64, 1)?;

        assert_eq!(0, index.left_index(0)?);
        assert_eq!(5, index.right_index(0)?);
        assert_eq!(1, index.right_index(1)?);

        assert_eq!(Position::new(64), index.lookup(0, 1)?.position);
        assert_eq!(Position::new(64), index.lookup(0, 3)?.position);
        assert_eq!(Position::new(192), index.lookup(0, 4)?.position);

        assert!(matches!(
            index.lookup(0, 5),
            Err(Error::PositionOverflow {
                partition: 0,
                index: 5,
                left_index: 0,
                right_index: 5
            })
        ));

        assert!(matches!(
            index.right_index(7),
            Err(Error::UnknownPartition(7))
        ));

        let window = index.entries_from(0, 2, 2)?;
        assert_eq!(
            vec![Position::new(64), Position::new(192)],
            window
                .iter()
                .map(|entry| entry.position)
                .collect::<Vec<_>>()
        );

        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn ordering_violation() -> Result<()> {
        let dir = tempdir()?;
        let mut writer = IndexWriter::create(dir.path(), &[0])?;

        _ = writer.append(0, 0, Position::ZERO, 64, 1)?;

        assert!(matches!(
            writer.append(0, 2, Position::new(64), 64, 1),
            Err(Error::OrderingViolation {
                partition: 0,
                index: 2,
                right_index: 1
            })
        ));

        assert!(matches!(
            writer.append(0, 0, Position::new(64), 64, 1),
            Err(Error::OrderingViolation { .. })
        ));

        assert_eq!(1, writer.index().right_index(0)?);

        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn checkpoint_and_restore() -> Result<()> {
        let dir = tempdir()?;

        {
            let mut writer = IndexWriter::create(dir.path(), &[0, 1])?;

            _ = writer.append(0, 0, Position::new(0), 64, 2)?;
            _ = writer.append(1, 0, Position::new(64), 64, 1)?;
            writer.checkpoint(Position::new(128))?;

            _ = writer.append(0, 2, Position::new(128), 64, 1)?;
            file_sync_without_checkpoint(&mut writer)?;
        }

        let (writer, position) = IndexWriter::restore(dir.path(), &[0, 1])?;
        assert_eq!(Position::new(128), position);

        let index = writer.index();
        assert_eq!(2, index.right_index(0)?);
        assert_eq!(1, index.right_index(1)?);
        assert_eq!(Position::new(0), index.lookup(0, 1)?.position);

        Ok(())
    }

    fn file_sync_without_checkpoint(writer: &mut IndexWriter) -> Result<()> {
        writer.files.values_mut().try_for_each(IndexFile::sync)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn restore_without_checkpoint() -> Result<()> {
        let dir = tempdir()?;

        let (writer, position) = IndexWriter::restore(dir.path(), &[3])?;
        assert_eq!(Position::ZERO, position);
        assert_eq!(0, writer.index().right_index(3)?);

        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn purge_advances_left() -> Result<()> {
        let dir = tempdir()?;
        let mut writer = IndexWriter::create(dir.path(), &[0, 1])?;

        _ = writer.append(0, 0, Position::new(0), 64, 1)?;
        _ = writer.append(1, 0, Position::new(64), 64, 1)?;
        _ = writer.append(0, 1, Position::new(128), 64, 4)?;

        writer.purge(Position::new(100))?;

        let index = writer.index().clone();
        assert_eq!(1, index.left_index(0)?);
        assert_eq!(5, index.right_index(0)?);
        assert_eq!(1, index.left_index(1)?);
        assert_eq!(1, index.right_index(1)?);

        assert!(matches!(
            index.lookup(0, 0),
            Err(Error::PositionOverflow { left_index: 1, .. })
        ));

        writer.checkpoint(Position::new(192))?;
        drop(writer);

        let (restored, _) = IndexWriter::restore(dir.path(), &[0, 1])?;
        assert_eq!(1, restored.index().left_index(0)?);
        assert_eq!(Position::new(128), restored.index().lookup(0, 2)?.position);
        assert_eq!(1, restored.index().left_index(1)?);

        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn restore_with_missing_entries() -> Result<()> {
        let dir = tempdir()?;

        {
            let mut writer = IndexWriter::create(dir.path(), &[0])?;
            _ = writer.append(0, 0, Position::new(0), 64, 2)?;
            writer.checkpoint(Position::new(64))?;
        }

        OpenOptions::new()
            .write(true)
            .open(IndexFile::filename(dir.path(), 0))?
            .set_len(0)?;

        assert!(matches!(
            IndexWriter::restore(dir.path(), &[0]),
            Err(Error::Integrity { .. })
        ));

        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn compact_after_purge() -> Result<()> {
        let dir = tempdir()?;
        let path = IndexFile::filename(dir.path(), 0);

        {
            let mut writer = IndexWriter::create(dir.path(), &[0, 1])?;

            for i in 0..8 {
                _ = writer.append(0, i, Position::new(i * 64), 64, 1)?;
            }

            writer.checkpoint(Position::new(512))?;
            assert_eq!(8 * ENTRY_SIZE as u64, fs::metadata(&path)?.len());

            writer.purge(Position::new(320))?;
            writer.checkpoint(Position::new(512))?;
            writer.compact()?;

            assert_eq!(3 * ENTRY_SIZE as u64, fs::metadata(&path)?.len());
            assert_eq!(0, fs::metadata(IndexFile::filename(dir.path(), 1))?.len());

            _ = writer.append(0, 8, Position::new(512), 64, 1)?;
            writer.checkpoint(Position::new(576))?;
            assert_eq!(4 * ENTRY_SIZE as u64, fs::metadata(&path)?.len());
        }

        let (restored, _) = IndexWriter::restore(dir.path(), &[0, 1])?;
        let index = restored.index();

        assert_eq!(5, index.left_index(0)?);
        assert_eq!(9, index.right_index(0)?);
        assert_eq!(Position::new(320), index.lookup(0, 5)?.position);
        assert_eq!(Position::new(512), index.lookup(0, 8)?.position);

        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn rebase_accepts_later_index() -> Result<()> {
        let dir = tempdir()?;

        {
            let mut writer = IndexWriter::create(dir.path(), &[0, 1])?;
            _ = writer.append(0, 0, Position::new(0), 64, 2)?;
            writer.checkpoint(Position::new(64))?;
        }

        let (mut writer, _) = IndexWriter::restore(dir.path(), &[0, 1])?;
        writer.rebase()?;

        let index = writer.index().clone();
        assert_eq!(2, index.left_index(0)?);
        assert_eq!(2, index.right_index(0)?);

        _ = writer.append(0, 7, Position::new(1024), 64, 1)?;
        assert_eq!(7, index.left_index(0)?);
        assert_eq!(8, index.right_index(0)?);

        assert!(matches!(
            writer.append(0, 9, Position::new(1088), 64, 1),
            Err(Error::OrderingViolation { right_index: 8, .. })
        ));

        _ = writer.append(1, 0, Position::new(1088), 64, 1)?;
        assert_eq!(0, index.left_index(1)?);
        assert_eq!(1, index.right_index(1)?);

        writer.checkpoint(Position::new(1152))?;
        drop(writer);

        let (restored, _) = IndexWriter::restore(dir.path(), &[0, 1])?;
        assert_eq!(7, restored.index().left_index(0)?);
        assert_eq!(Position::new(1024), restored.index().lookup(0, 7)?.position);

        Ok(())
    }
}
