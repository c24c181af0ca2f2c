//! Local identifier (LID) type.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 16-bit local identifier assigned by the subnet manager.
///
/// The LID space is split into a unicast range (`0x0001..=0xBFFF`) and a
/// multicast range (`0xC000..=0xFFFE`). LID 0 is reserved and `0xFFFF` is
/// the permissive LID; neither is ever assigned.
///
/// # Examples
///
/// ```
/// use fabric_sm_types::Lid;
///
/// let lid = Lid::new(12);
/// assert!(lid.is_unicast());
/// assert!(Lid::MULTICAST_START.is_multicast());
/// assert_eq!("0xc000".parse::<Lid>().unwrap(), Lid::MULTICAST_START);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lid(u16);

impl Lid {
    /// First assignable unicast LID.
    pub const UNICAST_START: Lid = Lid(0x0001);
    /// Last unicast LID.
    pub const UNICAST_END: Lid = Lid(0xBFFF);
    /// First multicast LID.
    pub const MULTICAST_START: Lid = Lid(0xC000);
    /// Last assignable multicast LID.
    pub const MULTICAST_END: Lid = Lid(0xFFFE);
    /// The permissive LID.
    pub const PERMISSIVE: Lid = Lid(0xFFFF);

    /// Creates a LID from its raw value.
    pub const fn new(raw: u16) -> Self {
        Lid(raw)
    }

    /// Returns the raw 16-bit value.
    pub const fn raw(&self) -> u16 {
        self.0
    }

    /// Returns true if this LID lies in the unicast range.
    pub const fn is_unicast(&self) -> bool {
        self.0 >= Self::UNICAST_START.0 && self.0 <= Self::UNICAST_END.0
    }

    /// Returns true if this LID lies in the multicast range.
    pub const fn is_multicast(&self) -> bool {
        self.0 >= Self::MULTICAST_START.0 && self.0 <= Self::MULTICAST_END.0
    }

    /// Returns the LID `n` above this one, or `None` on overflow.
    pub fn checked_add(&self, n: u16) -> Option<Lid> {
        self.0.checked_add(n).map(Lid)
    }
}

impl fmt::Display for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl FromStr for Lid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => s.parse::<u16>(),
        };
        parsed
            .map(Lid)
            .map_err(|_| ParseError::InvalidLid(s.to_string()))
    }
}

impl From<u16> for Lid {
    fn from(raw: u16) -> Self {
        Lid(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        assert!(!Lid::new(0).is_unicast());
        assert!(Lid::new(1).is_unicast());
        assert!(Lid::UNICAST_END.is_unicast());
        assert!(!Lid::UNICAST_END.is_multicast());
        assert!(Lid::MULTICAST_START.is_multicast());
        assert!(!Lid::PERMISSIVE.is_multicast());
        assert!(!Lid::PERMISSIVE.is_unicast());
    }

    #[test]
    fn test_parse_decimal_and_hex() {
        assert_eq!("2047".parse::<Lid>().unwrap(), Lid::new(2047));
        assert_eq!("0x7ff".parse::<Lid>().unwrap(), Lid::new(2047));
        assert!("lid".parse::<Lid>().is_err());
        assert!("70000".parse::<Lid>().is_err());
    }

    #[test]
    fn test_checked_add() {
        assert_eq!(Lid::new(4).checked_add(3), Some(Lid::new(7)));
        assert_eq!(Lid::PERMISSIVE.checked_add(1), None);
    }
}
