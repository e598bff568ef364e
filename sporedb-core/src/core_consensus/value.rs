//! Mutable value state threaded through a transaction.

use crate::core_encoding::{EncodingError, Float, Set};

/// Holds the data used by operations.
///
/// One value, and only one, is used per key in a given transaction. The
/// raw bytes stay canonical after every operation; the typed views are
/// decoded lazily and kept as caches.
#[derive(Debug, Clone, Default)]
pub struct Value {
    pub raw: Vec<u8>,
    vfloat: Option<Float>,
    vset: Option<Set>,
}

impl Value {
    pub fn new(raw: Vec<u8>) -> Self {
        Value {
            raw,
            vfloat: None,
            vset: None,
        }
    }

    /// Lazily decode the current float value.
    pub fn float(&mut self) -> Result<&Float, EncodingError> {
        if self.vfloat.is_none() {
            self.vfloat = Some(Float::from_bytes(&self.raw)?);
        }
        Ok(self.vfloat.as_ref().expect("cache populated above"))
    }

    /// Lazily decode the current set value.
    pub fn set(&mut self) -> Result<&mut Set, EncodingError> {
        if self.vset.is_none() {
            self.vset = Some(Set::from_bytes(&self.raw)?);
        }
        Ok(self.vset.as_mut().expect("cache populated above"))
    }

    /// Replace the raw bytes, dropping the typed caches.
    pub fn replace(&mut self, raw: Vec<u8>) {
        self.raw = raw;
        self.reset();
    }

    /// Append to the raw bytes, dropping the typed caches.
    pub fn concat(&mut self, data: &[u8]) {
        self.raw.extend_from_slice(data);
        self.reset();
    }

    pub(crate) fn store_float(&mut self, f: Float) {
        self.raw = f.to_bytes();
        self.vfloat = Some(f);
        self.vset = None;
    }

    pub(crate) fn sync_set(&mut self) {
        if let Some(set) = &self.vset {
            self.raw = set.to_bytes();
        }
        self.vfloat = None;
    }

    fn reset(&mut self) {
        self.vfloat = None;
        self.vset = None;
    }
}
