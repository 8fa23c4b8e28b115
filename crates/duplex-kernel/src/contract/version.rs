//! Semantic contract versions.
//!
//! A [`ContractVersion`] is a `(major, minor, patch)` triple. Ordering is
//! total and lexicographic over the three components, which is exactly what
//! `#[derive(Ord)]` gives for the field declaration order below.
//!
//! Versions serialize as their dotted string form (`"1.2.0"`) so schema files
//! and configuration read naturally.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `(major, minor, patch)` contract version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContractVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ContractVersion {
    /// Construct a version from its three components.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// `true` when both versions share a major component.
    pub fn same_major(&self, other: &ContractVersion) -> bool {
        self.major == other.major
    }

    /// Compare only `(major, minor)`, ignoring the patch component.
    pub fn major_minor(&self) -> (u64, u64) {
        (self.major, self.minor)
    }
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned when a version string is not `major[.minor[.patch]]`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid contract version '{input}': {reason}")]
pub struct ParseVersionError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for ContractVersion {
    type Err = ParseVersionError;

    /// Parse `major`, `major.minor` or `major.minor.patch`. A leading `v` is
    /// tolerated; missing components default to `0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseVersionError {
            input: s.to_string(),
            reason,
        };
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(err("empty version"));
        }

        let mut parts = [0u64; 3];
        let mut count = 0;
        for piece in trimmed.split('.') {
            if count == 3 {
                return Err(err("more than three components"));
            }
            if piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err("components must be non-negative integers"));
            }
            parts[count] = piece.parse().map_err(|_| err("component out of range"))?;
            count += 1;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl TryFrom<String> for ContractVersion {
    type Error = ParseVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContractVersion> for String {
    fn from(v: ContractVersion) -> Self {
        v.to_string()
    }
}
