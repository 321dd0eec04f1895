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

use std::{path::PathBuf, time::Duration};

use clap::Args;
use strata_storage::{ErrorCode, RetentionPolicy, SizeRetention, Store, TimeRetention};
use tracing::debug;

use crate::{EnvVarExp, Result, cli::DEFAULT_PATH};

#[derive(Args, Clone, Debug)]
#[group(required = true, multiple = false, id = "limit")]
struct Limit {
    /// Keep the newest segments up to this combined size
    #[arg(long, value_parser=clap::value_parser!(human_units::Size))]
    max_bytes: Option<human_units::Size>,

    /// Purge segments last written longer ago than this, e.g. "7days"
    #[arg(long, value_parser = humantime::parse_duration)]
    max_age: Option<Duration>,
}

#[derive(Args, Clone, Debug)]
pub(super) struct Arg {
    /// The directory of the store
    #[arg(long, default_value = DEFAULT_PATH, env = "STRATA_STORE_PATH")]
    path: EnvVarExp<PathBuf>,

    /// The topic of the partition group
    #[clap(value_parser)]
    topic: String,

    /// The partition group of the topic
    #[arg(long, default_value = "0")]
    group: u32,

    #[command(flatten)]
    limit: Limit,
}

impl Arg {
    fn policy(&self) -> Box<dyn RetentionPolicy> {
        match (&self.limit.max_bytes, &self.limit.max_age) {
            (Some(max_bytes), _) => Box::new(SizeRetention::new(max_bytes.0)),
            (None, Some(max_age)) => Box::new(TimeRetention::new(*max_age)),
            (None, None) => Box::new(SizeRetention::new(u64::MAX)),
        }
    }

    pub(super) async fn main(self) -> Result<ErrorCode> {
        let policy = self.policy();
        debug!(?policy);

        let store = Store::builder().path(self.path.into_inner()).build()?;
        store.restore_partition_group(&self.topic, self.group).await?;
        store.start()?;

        let purged = store
            .apply_retention(&self.topic, self.group, policy.as_ref())
            .await;

        let closed = store.close().await;

        match purged? {
            Some(purged) => println!(
                "{}/{}: purged {} bytes, log now starts at {}",
                self.topic,
                self.group,
                purged.bytes(),
                purged.start
            ),

            None => println!("{}/{}: nothing to purge", self.topic, self.group),
        }

        closed.map(|()| ErrorCode::None).map_err(Into::into)
    }
}
