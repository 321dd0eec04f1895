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
//
//! Strata Storage
//!
//! A [`Store`] owns partition groups. A partition group is a single
//! append-only segmented log shared by a fixed set of partitions, with one
//! index per partition mapping logical message indices to physical
//! positions in the log.
//!
//! Writes go through one writer task per group, so appends are totally
//! ordered and indices are assigned without gaps. Reads run concurrently
//! with writes and never take the append path.
//!
//! ```
//! # use strata_storage::{Error, QosLevel, Store, WriteRequest};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! # let dir = tempfile::tempdir()?;
//! let store = Store::builder().path(dir.path()).build()?;
//!
//! store.create_partition_group("orders", 0, &[0, 1], None)?;
//! store.start()?;
//!
//! let orders = store.get_store("orders", 0, QosLevel::Receive)?;
//!
//! let written = orders
//!     .write(vec![WriteRequest::new(1, "hello"), WriteRequest::new(1, "world")])
//!     .await;
//! assert_eq!(vec![0], written[0].indices());
//! assert_eq!(vec![1], written[1].indices());
//!
//! let read = orders.read(1, 0, 10, 1024);
//! assert!(read.eop());
//! assert_eq!(2, read.messages().len());
//!
//! store.close().await?;
//! # Ok(())
//! # }
//! ```

use opentelemetry::{
    InstrumentationScope, global,
    metrics::{Counter, Meter},
};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    array::TryFromSliceError,
    convert::Infallible,
    ffi::OsString,
    fmt::{self, Debug, Display, Formatter},
    fs::DirEntry,
    io,
    num::{ParseIntError, TryFromIntError},
    path::PathBuf,
    process::{ExitCode, Termination},
    result,
    str::FromStr,
    sync::{Arc, LazyLock, PoisonError},
    time::{SystemTime, SystemTimeError},
};

pub mod batch;
pub mod config;
pub mod index;
pub mod position;
pub mod record;
pub mod retention;
pub mod segment;
pub mod telemetry;

mod group;
mod pipeline;
mod read;
mod replicate;
mod store;

pub use config::{GroupConfig, StoreConfig};
pub use group::{GroupState, PartitionGroupStore, QosLevel};
pub use pipeline::{WriteFuture, WriteRequest, WriteResult};
pub use position::Position;
pub use read::ReadResult;
pub use replicate::ReplicableStore;
pub use retention::{Purged, RetentionPolicy, SizeRetention, TimeRetention};
pub use store::{Builder, Store};
pub use telemetry::{Observer, Telemetry};

/// Partition identifier within a group.
pub type PartitionId = u16;

/// Storage Errors
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    CapacityExceeded {
        requested: usize,
        capacity: usize,
    },

    Degraded(GroupId),

    Integrity {
        position: Position,
        reason: String,
    },

    InvalidConfig(String),
    Io(Arc<io::Error>),

    MalformedBatch {
        count: u16,
        reason: &'static str,
    },

    MalformedRecord {
        position: Position,
        reason: &'static str,
    },

    Message(String),

    MessageTooLarge {
        length: usize,
        max_message_length: u32,
    },

    NotRunning(GroupId),
    OneshotRecv,

    OrderingViolation {
        partition: PartitionId,
        index: u64,
        right_index: u64,
    },

    OsString(OsString),

    OutOfBounds {
        position: Position,
        start: Position,
        end: Position,
    },

    ParseInt(#[from] ParseIntError),
    PartitionGroupExists(GroupId),
    Poison,

    PositionOverflow {
        partition: PartitionId,
        index: u64,
        left_index: u64,
        right_index: u64,
    },

    Regex(#[from] regex::Error),
    ReplicationDisabled(GroupId),
    SerdeJson(Arc<serde_json::Error>),
    SystemTime(#[from] SystemTimeError),
    TryFromInt(#[from] TryFromIntError),
    TryFromSlice(#[from] TryFromSliceError),
    UnableToSend,
    UnknownPartition(PartitionId),
    UnknownPartitionGroup(GroupId),
}

impl Error {
    /// Whether this error leaves the group unable to continue safely.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Degraded(_)
                | Self::Integrity { .. }
                | Self::Io(_)
                | Self::MalformedRecord { .. }
                | Self::OrderingViolation { .. }
                | Self::OutOfBounds { .. }
                | Self::Poison
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(Arc::new(value))
    }
}

impl From<Infallible> for Error {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

/// Completion code carried by [`WriteResult`] and [`ReadResult`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ErrorCode {
    #[default]
    None,
    PositionOverflow,
    CapacityExceeded,
    MessageTooLarge,
    MalformedBatch,
    UnknownPartition,
    NotRunning,
    StorageError,
}

impl ErrorCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Termination for ErrorCode {
    fn report(self) -> ExitCode {
        if let Self::None = self {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

impl From<&Error> for ErrorCode {
    fn from(value: &Error) -> Self {
        match value {
            Error::PositionOverflow { .. } => Self::PositionOverflow,
            Error::CapacityExceeded { .. } => Self::CapacityExceeded,
            Error::MessageTooLarge { .. } => Self::MessageTooLarge,
            Error::MalformedBatch { .. } => Self::MalformedBatch,
            Error::UnknownPartition(_) => Self::UnknownPartition,
            Error::NotRunning(_) | Error::UnableToSend | Error::OneshotRecv => Self::NotRunning,
            _ => Self::StorageError,
        }
    }
}

impl From<Error> for ErrorCode {
    fn from(value: Error) -> Self {
        Self::from(&value)
    }
}

/// Partition Group Identifier
///
/// A topic and group number pair, stored on disk as `{topic}-{group:0>10}`.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct GroupId {
    topic: String,
    group: u32,
}

impl GroupId {
    pub fn new(topic: impl Into<String>, group: u32) -> Self {
        let topic = topic.into();
        Self { topic, group }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> u32 {
        self.group
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.group)
    }
}

impl TryFrom<&DirEntry> for GroupId {
    type Error = Error;

    fn try_from(value: &DirEntry) -> result::Result<Self, Self::Error> {
        value
            .file_name()
            .into_string()
            .map_err(Error::OsString)
            .and_then(|ref file_name| Self::from_str(file_name))
    }
}

impl FromStr for GroupId {
    type Err = Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        Regex::new(r"^(?<topic>.+)-(?<group>\d{10})$")
            .map_err(Into::into)
            .and_then(|re| {
                re.captures(s)
                    .ok_or(Error::Message(format!("no captures for {s}")))
                    .and_then(|ref captures| {
                        let topic = captures
                            .name("topic")
                            .ok_or(Error::Message(format!("missing topic for {s}")))
                            .map(|s| s.as_str().to_owned())?;

                        let group = captures
                            .name("group")
                            .ok_or(Error::Message(format!("missing group for: {s}")))
                            .map(|s| s.as_str())
                            .and_then(|s| str::parse(s).map_err(Into::into))?;

                        Ok(Self { topic, group })
                    })
            })
    }
}

impl From<&GroupId> for PathBuf {
    fn from(value: &GroupId) -> Self {
        let topic = value.topic.as_str();
        let group = value.group;
        PathBuf::from(format!("{topic}-{group:0>10}"))
    }
}

pub(crate) fn now_millis() -> Result<i64> {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(Into::into)
        .and_then(|since| i64::try_from(since.as_millis()).map_err(Into::into))
}

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

pub(crate) static STORE_REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("strata_store_requests")
        .with_description("strata store management requests")
        .build()
});

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn group_id_path_round_trip() -> Result<()> {
        let id = GroupId::new("orders-eu", 32123);

        let path = PathBuf::from(&id);
        assert_eq!(PathBuf::from("orders-eu-0000032123"), path);

        let parsed = path
            .to_str()
            .ok_or(Error::Message(format!("{path:?}")))
            .and_then(GroupId::from_str)?;
        assert_eq!(id, parsed);

        Ok(())
    }

    #[test]
    fn group_id_rejects_unpadded_group() {
        assert!(GroupId::from_str("orders-12").is_err());
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            ErrorCode::PositionOverflow,
            ErrorCode::from(&Error::PositionOverflow {
                partition: 0,
                index: 12,
                left_index: 0,
                right_index: 6
            })
        );

        assert_eq!(
            ErrorCode::StorageError,
            ErrorCode::from(&Error::OrderingViolation {
                partition: 3,
                index: 5,
                right_index: 4
            })
        );

        assert!(
            Error::OrderingViolation {
                partition: 3,
                index: 5,
                right_index: 4
            }
            .is_fatal()
        );

        assert!(!Error::UnknownPartition(7).is_fatal());
    }
}
