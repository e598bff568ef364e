//! Trust levels and their arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A representation of a public key's trust.
///
/// Levels are bytes so that partial trust can accumulate: two `LOW`
/// signatures are worth `0x02`, still below the threshold, while a third
/// one reaches it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TrustLevel(pub u8);

impl TrustLevel {
    pub const NONE: TrustLevel = TrustLevel(0x00);
    pub const LOW: TrustLevel = TrustLevel(0x01);
    pub const HIGH: TrustLevel = TrustLevel(0x03);
    pub const ULTIMATE: TrustLevel = TrustLevel(0xff);

    /// Required level for a verification to pass.
    pub const THRESHOLD: TrustLevel = TrustLevel::HIGH;

    pub fn byte(self) -> u8 {
        self.0
    }

    /// The minimum of two levels.
    pub fn min(self, other: TrustLevel) -> TrustLevel {
        if self < other {
            self
        } else {
            other
        }
    }

    /// Safe addition of two levels.
    ///
    /// `ULTIMATE` absorbs everything; otherwise the sum is capped at the
    /// threshold so accumulated partial trust never overtakes an ultimate
    /// seed.
    pub fn add(self, other: TrustLevel) -> TrustLevel {
        if self == TrustLevel::ULTIMATE || other == TrustLevel::ULTIMATE {
            return TrustLevel::ULTIMATE;
        }

        if self >= TrustLevel::THRESHOLD || other >= TrustLevel::THRESHOLD {
            return TrustLevel::THRESHOLD;
        }

        TrustLevel(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TrustLevel::NONE => write!(f, "none"),
            TrustLevel::LOW => write!(f, "low"),
            TrustLevel::HIGH => write!(f, "high"),
            TrustLevel::ULTIMATE => write!(f, "ultimate"),
            TrustLevel(other) => write!(f, "{other}"),
        }
    }
}

impl FromStr for TrustLevel {
    type Err = super::KeyRingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(TrustLevel::NONE),
            "low" => Ok(TrustLevel::LOW),
            "high" => Ok(TrustLevel::HIGH),
            "ultimate" => Ok(TrustLevel::ULTIMATE),
            other => other
                .parse::<u8>()
                .map(TrustLevel)
                .map_err(|_| super::KeyRingError::UnrecognizedTrust(s.to_string())),
        }
    }
}
