//! Arbitrary-precision decimal values.

use bigdecimal::BigDecimal;
use std::str::FromStr;

use super::EncodingError;

/// Arbitrary-precision decimal, marshalled as canonical text.
///
/// Empty bytes decode to zero so that numeric operations work on keys that
/// were never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Float {
    inner: BigDecimal,
}

impl Float {
    /// A new float with zero value.
    pub fn zero() -> Self {
        Float {
            inner: BigDecimal::from(0),
        }
    }

    /// Parse the canonical text form. Empty input decodes to zero.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EncodingError> {
        if data.is_empty() {
            return Ok(Float::zero());
        }

        let text = std::str::from_utf8(data).map_err(|_| EncodingError::NotNumeric)?;
        let inner = BigDecimal::from_str(text.trim()).map_err(|_| EncodingError::NotNumeric)?;
        Ok(Float { inner })
    }

    /// Emit the canonical text form (normalized, no trailing zeros).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.normalized().to_string().into_bytes()
    }

    pub fn add(&self, other: &Float) -> Float {
        Float {
            inner: &self.inner + &other.inner,
        }
    }

    pub fn mul(&self, other: &Float) -> Float {
        Float {
            inner: &self.inner * &other.inner,
        }
    }

    pub fn to_u64(&self) -> Option<u64> {
        bigdecimal::ToPrimitive::to_u64(&self.inner.normalized())
    }

    pub fn from_u64(v: u64) -> Self {
        Float {
            inner: BigDecimal::from(v),
        }
    }
}
