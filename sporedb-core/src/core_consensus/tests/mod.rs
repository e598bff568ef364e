//! Consensus engine test suite.


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

pub use crate::core_keyring::{KeyRing, TrustLevel};
pub use crate::core_store::{MemoryStore, SharedStore};

pub use super::{Endorser, Engine, EngineMessage, OpCode, Operation, Policy, Spore};

/// A fresh engine over an in-memory store, with an unlocked keyring and
/// the allow-everything policy registered.
pub fn testing_engine(identity: &str) -> (Arc<Engine>, mpsc::Receiver<EngineMessage>) {
    let keyring = Arc::new(KeyRing::new());
    keyring.create_private("password").unwrap();

    let store = SharedStore::new(Box::new(MemoryStore::new()));
    let (engine, messages) = Engine::new(store, identity, keyring);
    engine.add_policy(Policy::none()).unwrap();
    (engine, messages)
}

/// A policy with the provided quorum whose endorsers are the given rings.
pub fn quorum_policy(quorum: u64, endorsers: &[&KeyRing]) -> Policy {
    let mut policy = Policy::none();
    policy.uuid = "quorum".to_string();
    policy.quorum = quorum;
    policy.endorsers = endorsers
        .iter()
        .map(|ring| Endorser {
            public: ring.get_public("").unwrap().0,
            comment: String::new(),
        })
        .collect();
    policy
}

/// A signed single-operation spore from the engine's own identity.
pub fn signed_spore(
    engine: &Engine,
    policy: &str,
    timeout: Duration,
    operations: Vec<Operation>,
) -> Spore {
    let mut spore = Spore::new(policy);
    spore.set_timeout(timeout);
    spore.operations = operations;
    spore.emitter = engine.identity.clone();
    spore.signature = engine
        .keyring
        .sign(&spore.signable_hash().unwrap())
        .unwrap();
    spore
}

pub fn set_op(key: &str, data: &[u8]) -> Operation {
    Operation::new(key, OpCode::Set, data)
}

/// Introduce `other`'s public key into `ring` as a trusted identity.
pub fn trust_key(ring: &KeyRing, identity: &str, other: &KeyRing) {
    let (public, _) = other.get_public("").unwrap();
    ring.add_public(identity, TrustLevel::HIGH, &public).unwrap();
}
