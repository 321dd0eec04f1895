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

//! Retention policies.
//!
//! A policy only chooses a position. The group's writer task removes the
//! sealed segments ending at or before it and advances the left bound of
//! every partition. The tail segment is never removed.

use crate::{position::Position, segment::SegmentInfo};
use std::{
    fmt::Debug,
    time::{Duration, SystemTime},
};
use tracing::debug;

pub trait RetentionPolicy: Debug + Send + Sync {
    /// The position before which segments may be purged, if any.
    fn retain_from(&self, segments: &[SegmentInfo]) -> Option<Position>;
}

/// Outcome of applying a retention policy.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Purged {
    pub previous_start: Position,
    pub start: Position,
}

impl Purged {
    pub fn bytes(&self) -> u64 {
        self.start
            .distance_from(self.previous_start)
            .unwrap_or_default()
    }
}

/// Keep the newest segments whose combined length fits in `max_bytes`.
///
/// The tail segment is always kept, even when it alone exceeds the limit.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SizeRetention {
    max_bytes: u64,
}

impl SizeRetention {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl RetentionPolicy for SizeRetention {
    fn retain_from(&self, segments: &[SegmentInfo]) -> Option<Position> {
        let mut retained = 0u64;
        let mut from = None;

        for segment in segments.iter().rev() {
            retained = retained.saturating_add(segment.length);

            if !segment.tail && retained > self.max_bytes {
                break;
            }

            from = Some(segment.base);
        }

        debug!(max_bytes = self.max_bytes, ?from);
        from.filter(|from| segments.first().is_some_and(|first| first.base < *from))
    }
}

/// Purge sealed segments last modified more than `max_age` ago.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimeRetention {
    max_age: Duration,
}

impl TimeRetention {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

impl RetentionPolicy for TimeRetention {
    fn retain_from(&self, segments: &[SegmentInfo]) -> Option<Position> {
        let cutoff = SystemTime::now().checked_sub(self.max_age)?;

        let from = segments
            .iter()
            .take_while(|segment| !segment.tail && segment.modified < cutoff)
            .last()
            .map(SegmentInfo::end);

        debug!(max_age = ?self.max_age, ?from);
        from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn segments(lengths: &[u64], modified: &[SystemTime]) -> Vec<SegmentInfo> {
        let mut base = 0;

        lengths
            .iter()
            .zip(modified)
            .enumerate()
            .map(|(i, (length, modified))| {
                let segment = SegmentInfo {
                    base: Position::new(base),
                    length: *length,
                    modified: *modified,
                    tail: i == lengths.len() - 1,
                };

                base += length;
                segment
            })
            .collect()
    }

    #[test]
    fn size_keeps_newest() {
        let now = SystemTime::now();
        let segments = segments(&[100, 100, 100, 40], &[now; 4]);

        assert_eq!(
            Some(Position::new(200)),
            SizeRetention::new(150).retain_from(&segments)
        );

        assert_eq!(
            Some(Position::new(100)),
            SizeRetention::new(240).retain_from(&segments)
        );

        assert_eq!(None, SizeRetention::new(1_000).retain_from(&segments));
    }

    #[test]
    fn size_never_purges_tail() {
        let now = SystemTime::now();
        let segments = segments(&[100, 500], &[now; 2]);

        assert_eq!(
            Some(Position::new(100)),
            SizeRetention::new(10).retain_from(&segments)
        );
    }

    #[test]
    fn time_purges_old_sealed_segments() {
        let now = SystemTime::now();
        let old = now - Duration::from_secs(3_600);

        let segments = segments(&[100, 100, 100], &[old, now, old]);

        assert_eq!(
            Some(Position::new(100)),
            TimeRetention::new(Duration::from_secs(60)).retain_from(&segments)
        );

        assert_eq!(
            None,
            TimeRetention::new(Duration::from_secs(7_200)).retain_from(&segments)
        );
    }
}
