//! Device role.
//!
//! Roles are asymmetric and fixed at boot: PRIMARY is the time
//! reference and session authority, SECONDARY applies the offset it
//! receives in every batch.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Which side of the link this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum Role {
    /// Time reference, command source, session authority.
    Primary = 0,
    /// Stateless with respect to sync; applies the received offset.
    Secondary = 1,
}

impl Role {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Primary),
            1 => Some(Self::Secondary),
            _ => None,
        }
    }

    #[inline]
    pub const fn is_primary(self) -> bool {
        matches!(self, Self::Primary)
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Primary
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "PRIMARY"),
            Self::Secondary => write!(f, "SECONDARY"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRIMARY" => Ok(Self::Primary),
            "SECONDARY" => Ok(Self::Secondary),
            _ => Err(format!(
                "unknown Role: {s:?}, expected \"PRIMARY\" or \"SECONDARY\""
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_display_parse() {
        for role in [Role::Primary, Role::Secondary] {
            let s = role.to_string();
            let parsed: Role = s.parse().unwrap();
            assert_eq!(parsed, role, "roundtrip failed for {s}");
        }
    }

    #[test]
    fn rejects_unknown_strings() {
        assert!("primary".parse::<Role>().is_err());
        assert!("".parse::<Role>().is_err());
    }

    #[test]
    fn from_u8_roundtrip() {
        assert_eq!(Role::from_u8(0), Some(Role::Primary));
        assert_eq!(Role::from_u8(1), Some(Role::Secondary));
        assert_eq!(Role::from_u8(2), None);
    }
}
