//! Canonical binary forms shared across peers.
//!
//! Values exchanged through the consensus algorithm must marshal to the
//! exact same bytes on every node: floats use a canonical decimal text
//! form, sets use a length-prefixed layout that preserves insertion order.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

mod float;
mod set;

pub use float::Float;
pub use set::Set;

/// Errors raised while decoding canonical forms.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("non-numeric value")]
    NotNumeric,
    #[error("non-valid set")]
    InvalidSet,
    #[error("invalid empty element")]
    EmptyElement,
}

/// Marshal a u64 to its canonical little-endian form.
pub fn u64_to_bytes(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

/// Unmarshal a u64 from its canonical little-endian form.
pub fn bytes_to_u64(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    u64::from_le_bytes(buf)
}

/// Wall-clock instant with second precision, stable across peers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp {
            seconds: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos(),
        }
    }

    /// The instant `d` after this one.
    pub fn after(&self, d: Duration) -> Self {
        Timestamp {
            seconds: self.seconds + d.as_secs() as i64,
            nanos: self.nanos + d.subsec_nanos(),
        }
        .normalized()
    }

    /// Whether this instant is strictly in the past according to the local
    /// clock.
    pub fn is_past(&self) -> bool {
        *self < Timestamp::now()
    }

    /// Duration from now until this instant, zero when already past.
    pub fn until(&self) -> Duration {
        let now = Timestamp::now();
        if *self <= now {
            return Duration::ZERO;
        }
        let mut seconds = (self.seconds - now.seconds) as u64;
        let nanos = if self.nanos >= now.nanos {
            self.nanos - now.nanos
        } else {
            seconds = seconds.saturating_sub(1);
            1_000_000_000 + self.nanos - now.nanos
        };
        Duration::new(seconds, nanos)
    }

    fn normalized(mut self) -> Self {
        if self.nanos >= 1_000_000_000 {
            self.seconds += (self.nanos / 1_000_000_000) as i64;
            self.nanos %= 1_000_000_000;
        }
        self
    }
}
