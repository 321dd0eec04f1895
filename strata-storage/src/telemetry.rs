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

//! Observation points of a partition group.
//!
//! An [`Observer`] is called by the writer task when an append is
//! committed, by readers when a read is served and whenever a group
//! degrades. [`Telemetry`] is the default, emitting tracing events and
//! OpenTelemetry counters.

use crate::{Error, GroupId, METER, PartitionId, position::Position};
use opentelemetry::{KeyValue, metrics::Counter};
use std::{fmt::Debug, sync::LazyLock};
use tracing::{debug, error};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AppendCommitted<'a> {
    pub group: &'a GroupId,
    pub partition: PartitionId,
    pub index: u64,
    pub count: u16,
    pub position: Position,
    pub length: u32,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ReadServed<'a> {
    pub group: &'a GroupId,
    pub partition: PartitionId,
    pub from: u64,
    pub messages: usize,
    pub bytes: usize,
    pub eop: bool,
}

pub trait Observer: Debug + Send + Sync {
    fn append_committed(&self, event: &AppendCommitted<'_>) {
        let _ = event;
    }

    fn read_served(&self, event: &ReadServed<'_>) {
        let _ = event;
    }

    fn group_degraded(&self, group: &GroupId, error: &Error) {
        let _ = (group, error);
    }
}

static APPENDED_RECORDS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("strata_appended_records")
        .with_description("strata records appended to a group log")
        .build()
});

static APPENDED_MESSAGES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("strata_appended_messages")
        .with_description("strata logical messages appended")
        .build()
});

static APPENDED_BYTES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("strata_appended_bytes")
        .with_description("strata encoded record bytes appended")
        .build()
});

static READ_MESSAGES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("strata_read_messages")
        .with_description("strata messages served by reads")
        .build()
});

static READ_BYTES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("strata_read_bytes")
        .with_description("strata message bytes served by reads")
        .build()
});

static DEGRADED_GROUPS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("strata_degraded_groups")
        .with_description("strata partition groups degraded by fatal errors")
        .build()
});

fn attributes(group: &GroupId, partition: Option<PartitionId>) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new("topic", group.topic().to_owned()),
        KeyValue::new("group", i64::from(group.group())),
    ];

    if let Some(partition) = partition {
        attributes.push(KeyValue::new("partition", i64::from(partition)));
    }

    attributes
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Telemetry;

impl Observer for Telemetry {
    fn append_committed(&self, event: &AppendCommitted<'_>) {
        debug!(
            group = %event.group,
            partition = event.partition,
            index = event.index,
            count = event.count,
            position = %event.position,
            length = event.length
        );

        let attributes = attributes(event.group, Some(event.partition));
        APPENDED_RECORDS.add(1, &attributes);
        APPENDED_MESSAGES.add(u64::from(event.count), &attributes);
        APPENDED_BYTES.add(u64::from(event.length), &attributes);
    }

    fn read_served(&self, event: &ReadServed<'_>) {
        debug!(
            group = %event.group,
            partition = event.partition,
            from = event.from,
            messages = event.messages,
            bytes = event.bytes,
            eop = event.eop
        );

        let attributes = attributes(event.group, Some(event.partition));
        READ_MESSAGES.add(event.messages as u64, &attributes);
        READ_BYTES.add(event.bytes as u64, &attributes);
    }

    fn group_degraded(&self, group: &GroupId, error: &Error) {
        error!(%group, %error, "partition group degraded");
        DEGRADED_GROUPS.add(1, &attributes(group, None));
    }
}
