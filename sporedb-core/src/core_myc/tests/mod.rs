//! Overlay test suite: trust gating, recovery quorum, gossip pull and
//! membership merging.

mod gossip_tests;
mod recovery_tests;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use crate::core_consensus::{Engine, Policy};
pub use crate::core_keyring::{KeyRing, TrustLevel};
pub use crate::core_store::{MemoryStore, SharedStore};
pub use crate::shutdown::ShutdownCoordinator;

pub use super::mycelium::{Mycelium, MyceliumConfig, PeerCtx};
pub use super::protocol::Node;

use super::mycelium::PeerEntry;

/// An overlay without any network listener, over a fresh engine.
pub async fn testing_mycelium(identity: &str) -> Arc<Mycelium> {
    let keyring = Arc::new(KeyRing::new());
    keyring.create_private("password").unwrap();

    let store = SharedStore::new(Box::new(MemoryStore::new()));
    let (engine, messages) = Engine::new(store, identity, keyring);
    engine.add_policy(Policy::none()).unwrap();

    Mycelium::start(
        engine,
        messages,
        MyceliumConfig::default(),
        ShutdownCoordinator::new(),
    )
    .await
    .unwrap()
}

/// Register a fake connected peer, returning the receiving end of its
/// mailbox so tests can observe outbound frames.
pub fn fake_peer(
    mycelium: &Mycelium,
    identity: &str,
    address: &str,
    trusted: bool,
) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    mycelium.peers.write().push(PeerEntry {
        node: Node::new(identity, address),
        mailbox: tx,
        trusted,
        ready: true,
    });
    rx
}

pub fn peer_ctx(identity: &str, address: &str, trusted: bool) -> PeerCtx {
    PeerCtx {
        node: Node::new(identity, address),
        trusted,
    }
}

/// Make `other`'s key trusted under `identity` in the mycelium's ring.
pub fn trust_key(mycelium: &Mycelium, identity: &str, other: &KeyRing) {
    let (public, _) = other.get_public("").unwrap();
    mycelium
        .engine
        .keyring
        .add_public(identity, TrustLevel::HIGH, &public)
        .unwrap();
}
