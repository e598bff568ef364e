/*
    core_store - durable key/value storage

    The engine sees an ordered byte-value store through the `Store` trait:
    every value is persisted with its 64-byte version digest prepended, and
    batch writes are atomic. The exclusive mutation lock required by the
    consensus algorithm (read-simulate-write sequences must be coherent
    with the batch commit) is provided by `SharedStore`.
*/

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::core_version::{Version, VERSION_BYTES};

mod memory_store;
mod sled_store;

pub use memory_store::MemoryStore;
pub use sled_store::SledStore;

/// Errors raised by storage drivers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is absent, or its stored value is shorter than a version
    /// digest.
    #[error("key corrupted or unknown")]
    NotFound,
    /// A version that is not a full digest was handed to a write.
    #[error("invalid version digest")]
    InvalidVersion,
    /// Batch arrays of mismatched lengths.
    #[error("batch length mismatch")]
    BatchMismatch,
    /// Underlying driver failure, surfaced unchanged.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Interface storage drivers must implement.
///
/// Values are persisted as `digest || bytes` under the raw key.
pub trait Store: Send {
    /// Returns the value and the version stored currently for the key.
    ///
    /// Absent or corrupted entries yield `StoreError::NotFound`.
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError>;

    /// Set the value and the version stored for the key.
    fn set(&mut self, key: &str, value: &[u8], version: &Version) -> Result<(), StoreError>;

    /// Execute the given writes atomically, all-or-nothing.
    fn set_batch(
        &mut self,
        keys: &[String],
        values: &[Vec<u8>],
        versions: &[Version],
    ) -> Result<(), StoreError>;

    /// The full catalog of (key, version) pairs; used by full-state
    /// recovery only.
    fn list(&self) -> Result<BTreeMap<String, Version>, StoreError>;
}

/// Validate the arguments of a batch write.
fn check_batch(
    keys: &[String],
    values: &[Vec<u8>],
    versions: &[Version],
) -> Result<(), StoreError> {
    if keys.len() != values.len() || keys.len() != versions.len() {
        return Err(StoreError::BatchMismatch);
    }
    for version in versions {
        if version.as_bytes().len() != VERSION_BYTES {
            return Err(StoreError::InvalidVersion);
        }
    }
    Ok(())
}

/// A store behind the engine's exclusive mutation lock.
///
/// Validation and application sequences hold the guard across their whole
/// read-then-write walk; the convenience accessors lock only briefly.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<Box<dyn Store>>>,
}

impl SharedStore {
    pub fn new(store: Box<dyn Store>) -> Self {
        SharedStore {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Take the exclusive lock.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Store>> {
        self.inner.lock()
    }

    pub fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        self.lock().get(key)
    }

    pub fn set(&self, key: &str, value: &[u8], version: &Version) -> Result<(), StoreError> {
        self.lock().set(key, value, version)
    }

    pub fn list(&self) -> Result<BTreeMap<String, Version>, StoreError> {
        self.lock().list()
    }
}

/// Read a key, mapping an absent entry to `(empty, Version::NONE)`.
///
/// Backend failures still surface.
pub fn get_or_empty(
    store: &dyn Store,
    key: &str,
) -> Result<(Vec<u8>, Version), StoreError> {
    match store.get(key) {
        Ok(pair) => Ok(pair),
        Err(StoreError::NotFound) => Ok((Vec::new(), Version::NONE)),
        Err(err) => Err(err),
    }
}
