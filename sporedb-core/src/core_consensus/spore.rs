//! Spores: signed, time-bounded transaction proposals.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::core_encoding::Timestamp;
use crate::core_version::Version;

use super::error::ConsensusError;
use super::operation::Operation;

/// Fallback lifetime of a spore without an explicit deadline.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

/// A signed, time-bounded proposal of one or more operations on keys
/// under a policy. Immutable once signed: any field mutation invalidates
/// the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spore {
    pub uuid: String,
    pub policy: String,
    pub emitter: String,
    /// Expected current version per key; an empty map means no
    /// requirement.
    pub requirements: BTreeMap<String, Version>,
    pub operations: Vec<Operation>,
    /// Instant after which the spore must not be accepted for
    /// endorsement.
    pub deadline: Option<Timestamp>,
    /// Signature by `emitter` over the spore with this field cleared.
    pub signature: Vec<u8>,
}

impl Spore {
    /// A fresh spore under the given policy, with a process-wide unique
    /// identifier.
    pub fn new(policy: &str) -> Self {
        Spore {
            uuid: Uuid::new_v4().to_string(),
            policy: policy.to_string(),
            emitter: String::new(),
            requirements: BTreeMap::new(),
            operations: Vec::new(),
            deadline: None,
            signature: Vec::new(),
        }
    }

    /// Set the deadline to `timeout` from now.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Timestamp::now().after(timeout));
    }

    /// Whether the deadline is in the past according to the local clock.
    pub fn deadline_passed(&self) -> bool {
        match &self.deadline {
            Some(deadline) => deadline.is_past(),
            None => false,
        }
    }

    /// Duration until the deadline, used to arm the staging timer.
    pub fn time_until_deadline(&self) -> Duration {
        match &self.deadline {
            Some(deadline) => deadline.until(),
            None => DEFAULT_LIFETIME,
        }
    }

    /// The instant until which re-application must be refused, `None`
    /// meaning "remember forever".
    pub fn grace_instant(&self, grace_period: Duration) -> Option<Timestamp> {
        self.deadline.map(|deadline| deadline.after(grace_period))
    }

    /// Hash of the spore as currently marshalled (signature included).
    /// This is the message covered by endorsements.
    pub fn hash(&self) -> Result<Vec<u8>, ConsensusError> {
        let raw = bincode::serialize(self)?;
        Ok(Sha512::digest(&raw).to_vec())
    }

    /// Hash of the spore with the signature cleared. This is the message
    /// covered by the emitter's own signature.
    pub fn signable_hash(&self) -> Result<Vec<u8>, ConsensusError> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        unsigned.hash()
    }

    /// Whether two spores cannot coexist in staging: they share the same
    /// policy and some operation pair conflicts. Different policies never
    /// conflict.
    pub fn conflicts_with(&self, other: &Spore) -> bool {
        if self.policy != other.policy {
            return false;
        }

        self.operations.iter().any(|op| {
            other
                .operations
                .iter()
                .any(|other_op| op.conflicts_with(other_op))
        })
    }
}

/// A vote by a policy endorser over a spore's hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorsement {
    pub uuid: String,
    pub emitter: String,
    /// Signature over the spore's hash by the emitter.
    pub signature: Vec<u8>,
}

/// Request for the current state of one key, or (with an empty key) for
/// the peer's full catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRequest {
    pub key: String,
}

/// Full (key, version) catalog used by full-state recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub keys: BTreeMap<String, Version>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_consensus::operation::OpCode;

    #[test]
    fn test_new_spore_has_unique_uuid() {
        let a = Spore::new("none");
        let b = Spore::new("none");
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_deadline_lifecycle() {
        let mut spore = Spore::new("none");
        assert!(!spore.deadline_passed());
        assert_eq!(spore.time_until_deadline(), DEFAULT_LIFETIME);

        spore.set_timeout(Duration::from_secs(60));
        assert!(!spore.deadline_passed());
        assert!(spore.time_until_deadline() <= Duration::from_secs(60));

        spore.set_timeout(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(spore.deadline_passed());
    }

    #[test]
    fn test_hash_is_stable() {
        let mut spore = Spore::new("none");
        spore.set_timeout(Duration::from_secs(60));
        spore
            .operations
            .push(Operation::new("key", OpCode::Set, b"value"));

        assert_eq!(spore.hash().unwrap(), spore.hash().unwrap());
        assert_ne!(spore.hash().unwrap(), Spore::new("none").hash().unwrap());
    }

    #[test]
    fn test_signable_hash_ignores_signature() {
        let mut spore = Spore::new("none");
        spore
            .operations
            .push(Operation::new("key", OpCode::Set, b"value"));

        let before = spore.signable_hash().unwrap();
        spore.signature = vec![1, 2, 3];
        assert_eq!(spore.signable_hash().unwrap(), before);
        assert_ne!(spore.hash().unwrap(), before);
    }

    #[test]
    fn test_conflicts_require_same_policy() {
        let mut a = Spore::new("one");
        a.operations.push(Operation::new("k", OpCode::Set, b"x"));
        let mut b = Spore::new("two");
        b.operations.push(Operation::new("k", OpCode::Set, b"y"));

        assert!(!a.conflicts_with(&b));

        b.policy = "one".to_string();
        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn test_grace_instant() {
        let mut spore = Spore::new("none");
        assert!(spore.grace_instant(Duration::from_secs(10)).is_none());

        spore.set_timeout(Duration::ZERO);
        let instant = spore.grace_instant(Duration::from_secs(3600)).unwrap();
        assert!(!instant.is_past());
    }
}
