//! Size literals (`512M`, `2G`) normalized to whole megabytes.

use rbf_error::{RbfError, RbfResult};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A size in mebibytes. Every partition and image size is carried in this unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct SizeMb(u64);

impl SizeMb {
    pub const fn new(mb: u64) -> Self {
        Self(mb)
    }

    pub const fn mb(self) -> u64 {
        self.0
    }

    /// Parse an integer magnitude followed by exactly one unit character, `M` or `G`.
    pub fn parse(literal: &str) -> RbfResult<Self> {
        let invalid = || RbfError::InvalidSize {
            value: literal.to_string(),
        };
        let trimmed = literal.trim();
        let Some((split, _)) = trimmed.char_indices().last() else {
            return Err(invalid());
        };
        let (magnitude, unit) = trimmed.split_at(split);
        if magnitude.is_empty() || !magnitude.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u64 = magnitude.parse().map_err(|_| invalid())?;
        let mb = match unit {
            "M" => value,
            "G" => value.checked_mul(1024).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        Ok(Self(mb))
    }

    pub fn checked_add(self, other: SizeMb) -> Option<SizeMb> {
        self.0.checked_add(other.0).map(SizeMb)
    }
}

impl FromStr for SizeMb {
    type Err = RbfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SizeMb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}M", self.0)
    }
}
