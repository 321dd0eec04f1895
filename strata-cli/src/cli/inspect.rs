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

use clap::Args;
use serde_json::{Value, json};
use strata_storage::{ErrorCode, GroupId, QosLevel, Store};
use tracing::debug;

use crate::{EnvVarExp, Result, cli::DEFAULT_PATH};

#[derive(Args, Clone, Debug)]
pub(super) struct Arg {
    /// The directory of the store
    #[arg(long, default_value = DEFAULT_PATH, env = "STRATA_STORE_PATH")]
    path: EnvVarExp<PathBuf>,

    /// Only describe groups of this topic
    #[clap(value_parser)]
    topic: Option<String>,
}

fn describe(store: &Store, id: &GroupId) -> Result<Value> {
    let handle = store.get_store(id.topic(), id.group(), QosLevel::Receive)?;
    let replicable = store.get_replicable_store(id.topic(), id.group())?;

    let partitions = handle
        .partitions()
        .iter()
        .map(|partition| -> Result<Value> {
            Ok(json!({
                "partition": partition,
                "left_index": handle.left_index(*partition)?,
                "right_index": handle.right_index(*partition)?,
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(json!({
        "topic": id.topic(),
        "group": id.group(),
        "state": handle.state(),
        "degraded": handle.is_degraded(),
        "config": handle.config(),
        "left_position": replicable.left_position()?,
        "right_position": replicable.right_position(),
        "partitions": partitions,
    }))
}

impl Arg {
    pub(super) async fn main(self) -> Result<ErrorCode> {
        let store = Store::builder().path(self.path.into_inner()).build()?;

        let groups = store
            .restore()
            .await?
            .into_iter()
            .filter(|id| self.topic.as_deref().is_none_or(|topic| topic == id.topic()))
            .map(|id| describe(&store, &id))
            .collect::<Result<Vec<_>>>();

        let closed = store.close().await;
        let groups = groups?;
        debug!(groups = groups.len());

        println!("{}", serde_json::to_string_pretty(&groups)?);

        closed.map(|()| ErrorCode::None).map_err(Into::into)
    }
}
