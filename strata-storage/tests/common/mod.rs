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

#![allow(dead_code)]
use bytes::Bytes;
use rand::{distr::Alphanumeric, prelude::*, rng};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use strata_storage::{Error, GroupConfig, GroupId, Observer, Result, Store};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

pub(crate) fn init_tracing() -> Result<DefaultGuard> {
    use std::{fs::File, thread};

    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_thread_names(false)
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(
                    format!("{}=debug", env!("CARGO_CRATE_NAME"))
                        .parse()
                        .map_err(|error| Error::Message(format!("{error}")))?,
                ),
            )
            .with_writer(
                thread::current()
                    .name()
                    .ok_or(Error::Message(String::from("unnamed thread")))
                    .and_then(|name| {
                        File::create(format!(
                            "../logs/{}/{}::{name}.log",
                            env!("CARGO_PKG_NAME"),
                            env!("CARGO_CRATE_NAME")
                        ))
                        .map_err(Into::into)
                    })
                    .map(Arc::new)?,
            )
            .finish(),
    ))
}

/// Segments small enough that a few hundred short messages roll the log.
pub(crate) fn small_segments() -> GroupConfig {
    GroupConfig::default()
        .segment_size(1_024)
        .max_message_length(512)
}

/// No background checkpoints while a test is running.
pub(crate) fn quiet() -> GroupConfig {
    GroupConfig::default().flush_interval(Duration::from_secs(3_600))
}

pub(crate) fn store(path: &Path) -> Result<Store> {
    Store::builder().path(path).build()
}

pub(crate) fn group_dir(path: &Path, topic: &str, group: u32) -> PathBuf {
    path.join(PathBuf::from(&GroupId::new(topic, group)))
}

pub(crate) fn tail_segment(path: &Path, topic: &str, group: u32) -> Result<PathBuf> {
    let dir = group_dir(path, topic, group);

    let mut segments = dir
        .read_dir()?
        .map(|entry| entry.map(|entry| entry.path()).map_err(Into::into))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|path| path.extension().is_some_and(|extension| extension == "log"))
        .collect::<Vec<_>>();

    segments.sort();
    segments
        .pop()
        .ok_or(Error::Message(format!("no segments in: {dir:?}")))
}

pub(crate) fn alphanumeric_string(length: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub(crate) fn random_bytes(length: usize) -> Bytes {
    let mut bytes = vec![0u8; length];
    rng().fill(&mut bytes[..]);
    Bytes::from(bytes)
}

/// Records the groups reported as degraded.
#[derive(Clone, Debug, Default)]
pub(crate) struct Recorder {
    degraded: Arc<Mutex<Vec<GroupId>>>,
}

impl Recorder {
    pub(crate) fn degraded(&self) -> Result<Vec<GroupId>> {
        self.degraded
            .lock()
            .map(|degraded| degraded.clone())
            .map_err(Into::into)
    }
}

impl Observer for Recorder {
    fn group_degraded(&self, group: &GroupId, _error: &Error) {
        if let Ok(mut degraded) = self.degraded.lock() {
            degraded.push(group.clone());
        }
    }
}
