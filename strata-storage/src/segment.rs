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

//! Segmented log.
//!
//! A group's log is an ordered, contiguous sequence of segment files named
//! by the position of their first byte (`{base:0>20}.log`). Only the tail
//! segment is appended to. When a record would take the tail past the
//! segment size the tail is synced, sealed (memory mapped) and a new
//! segment started at the current write position. Records never span
//! segments.
//!
//! [`LogWriter`] is the only way to append and is owned by the group's
//! writer task. [`LogReader`] is cheap to clone and never reads past the
//! committed write position.

use crate::{
    Error, Result,
    position::Position,
    record::{HEADER_SIZE, Header, Record, checksum},
};
use bytes::{Bytes, BytesMut};
use memmap2::Mmap;
use regex::Regex;
use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    fs::{DirEntry, File, OpenOptions, remove_file},
    io::{Cursor, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

pub trait Truncate {
    fn truncate_from(&mut self, position: u64) -> Result<()>;
}

impl Truncate for File {
    fn truncate_from(&mut self, position: u64) -> Result<()> {
        self.set_len(position).map_err(Into::into)
    }
}

impl Truncate for Cursor<Vec<u8>> {
    fn truncate_from(&mut self, position: u64) -> Result<()> {
        usize::try_from(position)
            .map_err(Into::into)
            .map(|position| self.get_mut().truncate(position))
    }
}

pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|dir| dir.sync_all())
        .map_err(Into::into)
}

/// A single segment file.
pub struct Segment {
    base: Position,
    path: PathBuf,
    file: File,
    length: AtomicU64,
    mapped: OnceLock<Mmap>,
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Segment))
            .field("base", &self.base)
            .field("path", &self.path)
            .field("length", &self.length)
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Segment {
    fn filename(dir: &Path, base: Position) -> PathBuf {
        dir.join(format!("{:0>20}", base.get())).with_extension("log")
    }

    fn create(dir: &Path, base: Position) -> Result<Self> {
        let path = Self::filename(dir, base);
        debug!(?path);

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .append(true)
            .open(&path)?;

        sync_dir(dir)?;

        Ok(Self {
            base,
            path,
            file,
            length: AtomicU64::new(0),
            mapped: OnceLock::new(),
        })
    }

    fn open(path: PathBuf, base: Position) -> Result<Self> {
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        let length = file.metadata().map(|metadata| metadata.len())?;

        debug!(?path, length);

        Ok(Self {
            base,
            path,
            file,
            length: AtomicU64::new(length),
            mapped: OnceLock::new(),
        })
    }

    fn base_for_log(entry: &DirEntry) -> Result<Position> {
        Regex::new(r"^(?<offset>\d{20}).log$")
            .map_err(Into::into)
            .and_then(|re| {
                entry
                    .file_name()
                    .into_string()
                    .map_err(Error::OsString)
                    .and_then(|ref file_name| {
                        re.captures(file_name)
                            .ok_or(Error::Message(format!("no captures for {file_name}")))
                            .and_then(|ref captures| {
                                captures
                                    .name("offset")
                                    .ok_or(Error::Message(format!(
                                        "missing offset for: {file_name}"
                                    )))
                                    .map(|s| s.as_str())
                                    .and_then(|s| str::parse(s).map_err(Into::into))
                                    .map(Position::new)
                            })
                    })
            })
    }

    pub fn base(&self) -> Position {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn end(&self) -> Position {
        Position::new(self.base.get().saturating_add(self.len()))
    }

    pub fn is_sealed(&self) -> bool {
        self.mapped.get().is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &[u8]) -> Result<()> {
        (&self.file).write_all(record)?;
        _ = self
            .length
            .fetch_add(u64::try_from(record.len())?, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data().map_err(Into::into)
    }

    fn seal(&self) -> Result<()> {
        if self.is_sealed() || self.is_empty() {
            return Ok(());
        }

        // SAFETY: a segment is only ever written while it is the tail and
        // sealing happens after the last append, so the mapped bytes are
        // never modified.
        let mapped = unsafe { Mmap::map(&self.file) }?;
        _ = self.mapped.set(mapped);

        debug!(path = ?self.path, length = self.len());
        Ok(())
    }

    fn read(&self, relative: u64, length: usize) -> Result<Bytes> {
        if let Some(mapped) = self.mapped.get() {
            let start = usize::try_from(relative)?;

            mapped
                .get(start..start + length)
                .map(Bytes::copy_from_slice)
                .ok_or(Error::OutOfBounds {
                    position: Position::new(self.base.get() + relative),
                    start: self.base,
                    end: self.end(),
                })
        } else {
            let mut buffer = BytesMut::zeroed(length);
            self.file.read_exact_at(&mut buffer, relative)?;
            Ok(buffer.freeze())
        }
    }

    fn modified(&self) -> Result<SystemTime> {
        self.file
            .metadata()
            .and_then(|metadata| metadata.modified())
            .map_err(Into::into)
    }
}

/// A summary of one segment, used by retention policies.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SegmentInfo {
    pub base: Position,
    pub length: u64,
    pub modified: SystemTime,
    pub tail: bool,
}

impl SegmentInfo {
    pub fn end(&self) -> Position {
        Position::new(self.base.get().saturating_add(self.length))
    }
}

/// The outcome of opening an existing log.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Recovery {
    pub start: Position,
    pub end: Position,
    pub scanned: u64,
    pub truncated: Option<Position>,
}

#[derive(Debug)]
struct Shared {
    dir: PathBuf,
    segments: RwLock<BTreeMap<Position, Arc<Segment>>>,
    committed: AtomicU64,
    flushed: AtomicU64,
    notify: watch::Sender<Position>,
}

impl Shared {
    fn new(dir: PathBuf, segments: BTreeMap<Position, Arc<Segment>>, end: Position) -> Self {
        let (notify, _) = watch::channel(end);

        Self {
            dir,
            segments: RwLock::new(segments),
            committed: AtomicU64::new(end.get()),
            flushed: AtomicU64::new(end.get()),
            notify,
        }
    }

    fn segment_containing(&self, position: Position) -> Result<Arc<Segment>> {
        let segments = self.segments.read()?;

        segments
            .range(..=position)
            .next_back()
            .map(|(_, segment)| segment.clone())
            .ok_or(Error::OutOfBounds {
                position,
                start: segments.keys().next().copied().unwrap_or_default(),
                end: Position::new(self.committed.load(Ordering::Acquire)),
            })
    }
}

enum Scanned {
    Valid(Header),
    Torn(&'static str),
    Corrupt(String),
}

/// Opens or creates the segmented log in a directory.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SegmentedLog {
    dir: PathBuf,
    segment_size: u64,
}

impl SegmentedLog {
    pub fn new(dir: impl Into<PathBuf>, segment_size: u64) -> Self {
        let dir = dir.into();
        Self { dir, segment_size }
    }

    /// Start an empty log with a single segment at position zero.
    #[instrument]
    pub fn create(self) -> Result<LogWriter> {
        let tail = Segment::create(&self.dir, Position::ZERO).map(Arc::new)?;

        let segments = BTreeMap::from([(Position::ZERO, tail.clone())]);
        let shared = Shared::new(self.dir, segments, Position::ZERO);

        Ok(LogWriter {
            shared: Arc::new(shared),
            tail,
            segment_size: self.segment_size,
            dirty: 0,
        })
    }

    /// Position of the first segment on disk, if any.
    pub fn start(&self) -> Result<Option<Position>> {
        let mut start = None;

        for entry in self.dir.read_dir()? {
            if let Ok(base) = Segment::base_for_log(&entry?) {
                start = Some(start.map_or(base, |start: Position| start.min(base)));
            }
        }

        Ok(start)
    }

    /// Open an existing log, validating every record from `from` to the
    /// end and passing each header to `visitor`.
    ///
    /// A final record that is incomplete or fails its checksum is a torn
    /// write: the tail segment is truncated to the end of the previous
    /// record. Any other invalid record is an [`Error::Integrity`].
    #[instrument(skip(visitor))]
    pub fn recover<F>(self, from: Position, mut visitor: F) -> Result<(LogWriter, Recovery)>
    where
        F: FnMut(Position, &Header) -> Result<()>,
    {
        let mut segments = BTreeMap::new();

        for entry in self.dir.read_dir()? {
            let entry = entry?;

            if let Ok(base) = Segment::base_for_log(&entry) {
                _ = segments.insert(base, Segment::open(entry.path(), base)?);
            }
        }

        if segments.is_empty() {
            return if from == Position::ZERO {
                self.create().map(|writer| (writer, Recovery::default()))
            } else {
                Err(Error::Integrity {
                    position: from,
                    reason: format!("no segments in {:?}", self.dir),
                })
            };
        }

        let mut expected = None;
        for segment in segments.values() {
            if expected.is_some_and(|expected| expected != segment.base()) {
                return Err(Error::Integrity {
                    position: segment.base(),
                    reason: format!("segment gap, expected base: {expected:?}"),
                });
            }

            expected = Some(segment.end());
        }

        let start = segments.keys().next().copied().unwrap_or_default();
        let last = segments.keys().next_back().copied().unwrap_or_default();

        let end = segments
            .values()
            .next_back()
            .map(Segment::end)
            .unwrap_or_default();

        if from > end {
            return Err(Error::Integrity {
                position: from,
                reason: format!("checkpoint beyond end of log: {end}"),
            });
        }

        let mut recovery = Recovery {
            start,
            ..Default::default()
        };

        for (base, segment) in segments.iter_mut() {
            let end = segment.end();

            if end <= from {
                continue;
            }

            let mut position = from.max(*base);

            while position < end {
                match Self::scan(segment, position) {
                    Scanned::Valid(header) => {
                        visitor(position, &header)?;
                        recovery.scanned += 1;
                        position = position.advance(u64::from(header.length))?;
                    }

                    Scanned::Torn(reason) if *base == last => {
                        warn!(
                            path = ?segment.path(),
                            %position,
                            discarded = end.distance_from(position)?,
                            reason,
                            "truncating torn write"
                        );

                        segment.file.truncate_from(position.distance_from(*base)?)?;
                        segment.file.sync_data()?;
                        segment
                            .length
                            .store(position.distance_from(*base)?, Ordering::Release);

                        recovery.truncated = Some(position);
                        break;
                    }

                    Scanned::Torn(reason) => {
                        return Err(Error::Integrity {
                            position,
                            reason: reason.to_owned(),
                        });
                    }

                    Scanned::Corrupt(reason) => {
                        return Err(Error::Integrity { position, reason });
                    }
                }
            }
        }

        let segments = segments
            .into_iter()
            .map(|(base, segment)| {
                if base != last {
                    segment.seal()?;
                }

                Ok((base, Arc::new(segment)))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let tail = segments
            .get(&last)
            .cloned()
            .ok_or(Error::Message(format!("missing tail segment: {last}")))?;

        recovery.end = tail.end();
        debug!(?recovery);

        let shared = Shared::new(self.dir, segments, recovery.end);

        Ok((
            LogWriter {
                shared: Arc::new(shared),
                tail,
                segment_size: self.segment_size,
                dirty: 0,
            },
            recovery,
        ))
    }

    fn scan(segment: &Segment, position: Position) -> Scanned {
        let Ok(relative) = position.distance_from(segment.base()) else {
            return Scanned::Corrupt(format!("{position} before segment {}", segment.base()));
        };

        let remaining = segment.len().saturating_sub(relative);

        if remaining < HEADER_SIZE as u64 {
            return Scanned::Torn("incomplete header");
        }

        let header = match segment.read(relative, HEADER_SIZE) {
            Ok(encoded) => match Header::decode(&encoded) {
                Ok(header) => header,
                Err(reason) => return Self::damaged(segment, relative, reason),
            },

            Err(error) => return Scanned::Corrupt(error.to_string()),
        };

        if u64::from(header.length) > remaining {
            return Self::damaged(segment, relative, "incomplete record");
        }

        let encoded = match segment.read(relative, header.length as usize) {
            Ok(encoded) => encoded,
            Err(error) => return Scanned::Corrupt(error.to_string()),
        };

        let crc = checksum(&encoded);

        if crc == header.crc {
            Scanned::Valid(header)
        } else if u64::from(header.length) == remaining {
            Scanned::Torn("checksum mismatch in final record")
        } else {
            Scanned::Corrupt(format!(
                "crc: {crc:#010x}, expected: {:#010x}",
                header.crc
            ))
        }
    }

    /// An unreadable record is only a torn write when nothing valid was
    /// written after it.
    fn damaged(segment: &Segment, relative: u64, reason: &'static str) -> Scanned {
        match Self::record_follows(segment, relative) {
            Ok(false) => Scanned::Torn(reason),
            Ok(true) => Scanned::Corrupt(format!("{reason}, followed by a valid record")),
            Err(error) => Scanned::Corrupt(error.to_string()),
        }
    }

    /// Whether a complete record with a matching checksum starts anywhere
    /// after `relative` in the segment.
    fn record_follows(segment: &Segment, relative: u64) -> Result<bool> {
        let remaining = usize::try_from(segment.len().saturating_sub(relative))?;
        let trailing = segment.read(relative, remaining)?;

        Ok((1..trailing.len())
            .take_while(|offset| offset + HEADER_SIZE <= trailing.len())
            .any(|offset| {
                Header::decode(&trailing[offset..]).is_ok_and(|header| {
                    let end = offset + header.length as usize;
                    end <= trailing.len() && checksum(&trailing[offset..end]) == header.crc
                })
            }))
    }
}

/// The append half of a segmented log.
#[derive(Debug)]
pub struct LogWriter {
    shared: Arc<Shared>,
    tail: Arc<Segment>,
    segment_size: u64,
    dirty: u64,
}

impl LogWriter {
    pub fn reader(&self) -> LogReader {
        LogReader {
            shared: self.shared.clone(),
        }
    }

    /// The position the next record will be written at.
    pub fn position(&self) -> Position {
        self.tail.end()
    }

    /// Bytes appended since the last flush.
    pub fn dirty_bytes(&self) -> u64 {
        self.dirty
    }

    /// Append one complete encoded record, returning its position.
    pub fn append(&mut self, record: &[u8]) -> Result<Position> {
        let length = u64::try_from(record.len())?;

        if length > self.segment_size {
            return Err(Error::MessageTooLarge {
                length: record.len(),
                max_message_length: u32::try_from(self.segment_size).unwrap_or(u32::MAX),
            });
        }

        if !self.tail.is_empty() && self.tail.len() + length > self.segment_size {
            self.roll()?;
        }

        let position = self.tail.end();
        self.tail.append(record)?;
        self.dirty += length;

        let end = position.advance(length)?;
        self.shared.committed.store(end.get(), Ordering::Release);
        _ = self.shared.notify.send_replace(end);

        Ok(position)
    }

    /// Sync the tail segment, returning the durable end of the log.
    #[instrument(skip_all)]
    pub fn flush(&mut self) -> Result<Position> {
        if self.dirty > 0 {
            self.tail.sync()?;
            self.dirty = 0;
        }

        let flushed = self.tail.end();
        self.shared.flushed.store(flushed.get(), Ordering::Release);
        debug!(%flushed);

        Ok(flushed)
    }

    fn roll(&mut self) -> Result<()> {
        _ = self.flush()?;
        self.tail.seal()?;

        let base = self.tail.end();
        let tail = Segment::create(&self.shared.dir, base).map(Arc::new)?;

        _ = self.shared.segments.write()?.insert(base, tail.clone());
        self.tail = tail;

        debug!(%base);
        Ok(())
    }

    /// The start of the log once every sealed segment ending at or before
    /// `position` is removed.
    pub fn start_after_purge(&self, position: Position) -> Result<Position> {
        let segments = self.shared.segments.read()?;

        Ok(segments
            .values()
            .find(|segment| segment.base() == self.tail.base() || segment.end() > position)
            .map_or_else(|| self.tail.base(), |segment| segment.base()))
    }

    /// Remove every sealed segment that ends at or before `position`,
    /// returning the new start of the log. The tail is never removed.
    #[instrument(skip(self))]
    pub fn purge_before(&mut self, position: Position) -> Result<Position> {
        let mut segments = self.shared.segments.write()?;

        let purgeable = segments
            .values()
            .filter(|segment| segment.base() != self.tail.base() && segment.end() <= position)
            .map(|segment| segment.base())
            .collect::<Vec<_>>();

        for base in purgeable {
            if let Some(segment) = segments.remove(&base) {
                debug!(path = ?segment.path());
                remove_file(segment.path())?;
            }
        }

        sync_dir(&self.shared.dir)?;

        Ok(segments
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.tail.base()))
    }
}

/// The read half of a segmented log.
#[derive(Clone, Debug)]
pub struct LogReader {
    shared: Arc<Shared>,
}

impl LogReader {
    /// Position of the first retained byte.
    pub fn start(&self) -> Result<Position> {
        self.shared
            .segments
            .read()
            .map(|segments| segments.keys().next().copied().unwrap_or_default())
            .map_err(Into::into)
    }

    /// Position following the last appended record.
    pub fn committed(&self) -> Position {
        Position::new(self.shared.committed.load(Ordering::Acquire))
    }

    /// Position up to which the log is known to be durable.
    pub fn flushed(&self) -> Position {
        Position::new(self.shared.flushed.load(Ordering::Acquire))
    }

    pub fn subscribe(&self) -> watch::Receiver<Position> {
        self.shared.notify.subscribe()
    }

    fn check_bounds(&self, position: Position) -> Result<Position> {
        let start = self.start()?;
        let committed = self.committed();

        if position < start || position > committed {
            Err(Error::OutOfBounds {
                position,
                start,
                end: committed,
            })
        } else {
            Ok(committed)
        }
    }

    /// Up to `max_bytes` of the log from `position`, crossing segment
    /// boundaries and stopping at the committed position.
    pub fn read(&self, position: Position, max_bytes: usize) -> Result<Bytes> {
        let committed = self.check_bounds(position)?;
        let limit = committed.distance_from(position).map(|available| {
            usize::try_from(available).map_or(max_bytes, |available| available.min(max_bytes))
        })?;

        let mut buffer = BytesMut::with_capacity(limit);
        let mut position = position;

        while buffer.len() < limit {
            let segment = self.shared.segment_containing(position)?;
            let relative = position.distance_from(segment.base())?;

            let available = usize::try_from(segment.len().saturating_sub(relative))?;
            let length = available.min(limit - buffer.len());

            if length == 0 {
                break;
            }

            buffer.extend_from_slice(&segment.read(relative, length)?);
            position = position.advance(u64::try_from(length)?)?;
        }

        Ok(buffer.freeze())
    }

    /// Read and verify the record at `position`.
    pub fn read_record(&self, position: Position) -> Result<Record> {
        let committed = self.check_bounds(position)?;
        let segment = self.shared.segment_containing(position)?;
        let relative = position.distance_from(segment.base())?;

        let header = segment
            .read(relative, HEADER_SIZE)
            .and_then(|encoded| {
                Header::decode(&encoded)
                    .map_err(|reason| Error::MalformedRecord { position, reason })
            })?;

        let end = position.advance(u64::from(header.length))?;
        if end > committed {
            return Err(Error::OutOfBounds {
                position: end,
                start: position,
                end: committed,
            });
        }

        segment
            .read(relative, header.length as usize)
            .and_then(|encoded| Record::decode(position, encoded))
    }

    /// Whole encoded records from `position`, at least one record when
    /// any are committed, otherwise stopping before `max_bytes` would be
    /// exceeded.
    pub fn read_records(&self, position: Position, max_bytes: usize) -> Result<Bytes> {
        let committed = self.check_bounds(position)?;

        let mut buffer = BytesMut::new();
        let mut position = position;

        while position < committed {
            let record = self.read_record(position)?;
            let length = record.encoded_len();

            if !buffer.is_empty() && buffer.len() + length > max_bytes {
                break;
            }

            buffer.extend_from_slice(&record.encode());
            position = position.advance(u64::try_from(length)?)?;
        }

        Ok(buffer.freeze())
    }

    pub fn segments(&self) -> Result<Vec<SegmentInfo>> {
        let segments = self.shared.segments.read()?;
        let tail = segments.keys().next_back().copied();

        segments
            .values()
            .map(|segment| {
                segment.modified().map(|modified| SegmentInfo {
                    base: segment.base(),
                    length: segment.len(),
                    modified,
                    tail: Some(segment.base()) == tail,
                })
            })
            .collect()
    }
}
