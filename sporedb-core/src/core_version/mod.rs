//! Value version management.
//!
//! A `Version` is the SHA-512 digest of a stored value. It is emitted by
//! the store on reads and by the engine when committing, and drives the
//! requirement checks of the consensus algorithm.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;

/// Space used by a version when marshalled.
pub const VERSION_BYTES: usize = 64;

/// Returned when two versions are not matching.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("the stored version does not match with the required version")]
    Mismatch,
}

/// Content hash of a stored value.
///
/// The distinguished `Version::NONE` sentinel (empty digest) is returned
/// when no version is available for a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Version {
    hash: Vec<u8>,
}

impl Version {
    /// The sentinel returned for absent or corrupted entries.
    pub const NONE: Version = Version { hash: Vec::new() };

    /// Compute the version of some data.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha512::digest(data);
        Version {
            hash: digest.to_vec(),
        }
    }

    /// Rebuild a version from its marshalled digest.
    pub fn from_bytes(data: &[u8]) -> Self {
        Version {
            hash: data.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.hash
    }

    pub fn is_none(&self) -> bool {
        self.hash.is_empty()
    }

    /// Byte-exact equality check used by requirement validation.
    pub fn matches(&self, other: &Version) -> Result<(), VersionError> {
        if self.hash != other.hash {
            return Err(VersionError::Mismatch);
        }
        Ok(())
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        write!(f, "{}", hex::encode(&self.hash[..8]))
    }
}
