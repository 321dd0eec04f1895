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

//! Physical positions within a partition group log.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// A byte offset into the logical concatenation of a group's segments.
///
/// Positions only move forward through [`Position::advance`], and the
/// distance between two positions is only taken through
/// [`Position::distance_from`], both of which are checked.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    pub const ZERO: Self = Self(0);

    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn advance(self, length: u64) -> Result<Self> {
        self.0
            .checked_add(length)
            .map(Self)
            .ok_or(Error::OutOfBounds {
                position: self,
                start: Self::ZERO,
                end: Self(u64::MAX),
            })
    }

    /// Bytes from `base` up to this position.
    pub fn distance_from(self, base: Self) -> Result<u64> {
        self.0.checked_sub(base.0).ok_or(Error::OutOfBounds {
            position: self,
            start: base,
            end: Self(u64::MAX),
        })
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Position> for u64 {
    fn from(value: Position) -> Self {
        value.0
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance() -> Result<()> {
        assert_eq!(Position::new(32), Position::ZERO.advance(32)?);
        assert!(Position::new(u64::MAX).advance(1).is_err());
        Ok(())
    }

    #[test]
    fn distance() -> Result<()> {
        assert_eq!(6, Position::new(12).distance_from(Position::new(6))?);
        assert!(matches!(
            Position::new(6).distance_from(Position::new(12)),
            Err(Error::OutOfBounds { .. })
        ));
        Ok(())
    }
}
