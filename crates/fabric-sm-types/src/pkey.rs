//! Partition key type.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 16-bit partition key.
///
/// The high bit marks full membership; the low 15 bits identify the
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PKey(u16);

impl PKey {
    const FULL_MEMBER_BIT: u16 = 0x8000;

    /// The default partition (full membership).
    pub const DEFAULT: PKey = PKey(0xffff);

    pub const fn new(raw: u16) -> Self {
        PKey(raw)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    /// Partition identity without the membership bit.
    pub const fn base(&self) -> u16 {
        self.0 & !Self::FULL_MEMBER_BIT
    }

    pub const fn is_full_member(&self) -> bool {
        self.0 & Self::FULL_MEMBER_BIT != 0
    }
}

impl Default for PKey {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for PKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl FromStr for PKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        u16::from_str_radix(hex, 16)
            .map(PKey)
            .map_err(|_| ParseError::InvalidPKey(s.to_string()))
    }
}
