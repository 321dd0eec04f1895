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

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use human_units::iec::iec_unit;
use strata_perf::Perf;
use strata_storage::{ErrorCode, QosLevel};

use crate::{EnvVarExp, Result, cli::DEFAULT_PATH};

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, ValueEnum)]
pub(super) enum Qos {
    /// Writes complete once appended and indexed
    #[default]
    Receive,

    /// Writes complete once durable
    Persistence,
}

impl From<Qos> for QosLevel {
    fn from(value: Qos) -> Self {
        match value {
            Qos::Receive => Self::Receive,
            Qos::Persistence => Self::Persistence,
        }
    }
}

#[iec_unit(symbol = "B/s")]
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(super) struct Throughput(pub u32);

#[derive(Args, Clone, Debug)]
pub(super) struct Arg {
    /// The directory of the store
    #[arg(long, default_value = DEFAULT_PATH, env = "STRATA_STORE_PATH")]
    path: EnvVarExp<PathBuf>,

    /// The topic to generate messages into
    #[clap(value_parser)]
    topic: String,

    /// The partition group of the topic
    #[arg(long, default_value = "0")]
    group: u32,

    /// The number of partitions when the group is created
    #[arg(long, default_value = "1")]
    partitions: u16,

    /// Message batch size used by every producer
    #[arg(long, default_value = "1")]
    batch_size: u32,

    /// Record size used by every producer
    #[arg(long, default_value = "1k", value_parser=clap::value_parser!(human_units::Size))]
    record_size: human_units::Size,

    /// Segment size when the group is created
    #[arg(long, value_parser=clap::value_parser!(human_units::Size))]
    segment_size: Option<human_units::Size>,

    /// The maximum number of messages per second
    #[clap(long, group = "output")]
    per_second: Option<u32>,

    /// Message throughput
    #[clap(long, group = "output")]
    throughput: Option<Throughput>,

    /// The number of producers generating messages
    #[arg(long, default_value = "1")]
    producers: u32,

    /// The number of consumers following the partitions
    #[arg(long, default_value = "0")]
    consumers: u32,

    /// When a write is complete
    #[arg(long, value_enum, default_value_t)]
    qos: Qos,

    /// Stop sending messages after this time
    #[arg(long, default_value = "1m", value_parser=clap::value_parser!(human_units::Duration))]
    duration: Option<human_units::Duration>,
}

impl Arg {
    pub(super) async fn main(self) -> Result<ErrorCode> {
        Perf::builder()
            .path(self.path.into_inner())
            .topic(self.topic)
            .group(self.group)
            .partitions(self.partitions)
            .batch_size(self.batch_size)
            .record_size(self.record_size.0 as usize)
            .segment_size(self.segment_size.map(|segment_size| segment_size.0))
            .per_second(self.per_second)
            .throughput(self.throughput.map(|throughput| throughput.0))
            .producers(self.producers)
            .consumers(self.consumers)
            .qos(self.qos.into())
            .duration(self.duration.map(|duration| duration.0))
            .build()
            .main()
            .await
            .map_err(Into::into)
    }
}
