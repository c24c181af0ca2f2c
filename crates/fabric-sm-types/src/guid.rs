//! GUID type with hex parsing and formatting.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 64-bit globally unique identifier of a node or port.
///
/// GUIDs are burned into the hardware and stay stable for the physical
/// lifetime of the component, which makes them the primary key of every
/// entity table.
///
/// # Examples
///
/// ```
/// use fabric_sm_types::Guid;
///
/// let guid: Guid = "0x0002c90300a1b2c3".parse().unwrap();
/// assert_eq!(guid.to_string(), "0x0002c90300a1b2c3");
///
/// // The 0x prefix is optional
/// let guid2: Guid = "0002c90300a1b2c3".parse().unwrap();
/// assert_eq!(guid, guid2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Guid(u64);

impl Guid {
    /// The all-zero GUID. Never a valid entity identity.
    pub const ZERO: Guid = Guid(0);

    /// Creates a GUID from its raw value.
    pub const fn new(raw: u64) -> Self {
        Guid(raw)
    }

    /// Returns the raw 64-bit value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the zero GUID.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for Guid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        if digits.is_empty() || digits.len() > 16 {
            return Err(ParseError::InvalidGuid(s.to_string()));
        }

        u64::from_str_radix(digits, 16)
            .map(Guid)
            .map_err(|_| ParseError::InvalidGuid(s.to_string()))
    }
}

impl TryFrom<String> for Guid {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Guid> for String {
    fn from(guid: Guid) -> String {
        guid.to_string()
    }
}

impl From<u64> for Guid {
    fn from(raw: u64) -> Self {
        Guid(raw)
    }
}
