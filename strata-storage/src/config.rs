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

//! Store and partition group configuration.

use crate::{Error, Result, record::HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

const MIB: u64 = 1024 * 1024;

/// Per group configuration, persisted in the group's `metadata.json`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(default)]
pub struct GroupConfig {
    segment_size: u64,
    max_message_length: u32,
    write_request_queue_capacity: usize,
    flush_interval: Duration,
    max_dirty_bytes: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            segment_size: 128 * MIB,
            max_message_length: 4 * MIB as u32,
            write_request_queue_capacity: 1024,
            flush_interval: Duration::from_millis(50),
            max_dirty_bytes: 10 * MIB,
        }
    }
}

impl GroupConfig {
    pub fn segment_size(self, segment_size: u64) -> Self {
        Self {
            segment_size,
            ..self
        }
    }

    pub fn max_message_length(self, max_message_length: u32) -> Self {
        Self {
            max_message_length,
            ..self
        }
    }

    pub fn write_request_queue_capacity(self, write_request_queue_capacity: usize) -> Self {
        Self {
            write_request_queue_capacity,
            ..self
        }
    }

    pub fn flush_interval(self, flush_interval: Duration) -> Self {
        Self {
            flush_interval,
            ..self
        }
    }

    pub fn max_dirty_bytes(self, max_dirty_bytes: u64) -> Self {
        Self {
            max_dirty_bytes,
            ..self
        }
    }

    pub fn get_segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Largest encoded record, header included.
    pub fn get_max_message_length(&self) -> u32 {
        self.max_message_length
    }

    pub fn get_write_request_queue_capacity(&self) -> usize {
        self.write_request_queue_capacity
    }

    pub fn get_flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn get_max_dirty_bytes(&self) -> u64 {
        self.max_dirty_bytes
    }

    pub fn validate(self) -> Result<Self> {
        if (self.max_message_length as usize) <= HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_message_length: {} must exceed the record header: {HEADER_SIZE}",
                self.max_message_length
            )));
        }

        if self.segment_size < u64::from(self.max_message_length) {
            return Err(Error::InvalidConfig(format!(
                "segment_size: {} is smaller than max_message_length: {}",
                self.segment_size, self.max_message_length
            )));
        }

        if self.write_request_queue_capacity == 0
            || u32::try_from(self.write_request_queue_capacity).is_err()
        {
            return Err(Error::InvalidConfig(format!(
                "write_request_queue_capacity: {}",
                self.write_request_queue_capacity
            )));
        }

        if self.flush_interval.is_zero() {
            return Err(Error::InvalidConfig(String::from("flush_interval: 0")));
        }

        Ok(self)
    }
}

/// Store configuration: where groups live and the defaults for new groups.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct StoreConfig {
    path: PathBuf,
    group: GroupConfig,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            group: GroupConfig::default(),
        }
    }

    pub fn group(self, group: GroupConfig) -> Self {
        Self { group, ..self }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn group_config(&self) -> &GroupConfig {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let config = GroupConfig::default().validate()?;
        assert_eq!(128 * MIB, config.get_segment_size());
        Ok(())
    }

    #[test]
    fn segment_smaller_than_message() {
        assert!(matches!(
            GroupConfig::default()
                .segment_size(1024)
                .max_message_length(2048)
                .validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_capacity() {
        assert!(
            GroupConfig::default()
                .write_request_queue_capacity(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn partial_json_uses_defaults() -> Result<()> {
        let config: GroupConfig = serde_json::from_str(r#"{"segment_size": 65536}"#)?;
        assert_eq!(65536, config.get_segment_size());
        assert_eq!(
            GroupConfig::default().get_max_dirty_bytes(),
            config.get_max_dirty_bytes()
        );
        Ok(())
    }
}
