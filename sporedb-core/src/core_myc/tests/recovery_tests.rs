//! Per-key recovery and full-sync behavior, including trust gating.

use std::time::Duration;

use tokio::time::timeout;

use crate::core_consensus::{Catalog, RecoverRequest};
use crate::core_keyring::KeyRing;
use crate::core_myc::protocol::{Call, Raw};
use crate::core_version::Version;

use super::*;

fn signed_raw(ring: &KeyRing, key: &str, data: &[u8]) -> Raw {
    let mut raw = Raw {
        key: key.to_string(),
        version: Version::of(data),
        data: data.to_vec(),
        signature: Vec::new(),
    };
    raw.signature = ring.sign(&raw.signable_message().unwrap()).unwrap();
    raw
}

#[tokio::test]
async fn test_recovery_applies_quorum_answer() {
    let mycelium = testing_mycelium("alice").await;

    let bob = KeyRing::new();
    bob.create_private("password").unwrap();
    let carol = KeyRing::new();
    carol.create_private("password").unwrap();
    trust_key(&mycelium, "bob", &bob);
    trust_key(&mycelium, "carol", &carol);

    mycelium.start_recovery("lost-key", 2);

    // One answer is not enough.
    mycelium.handle_raw(
        &peer_ctx("bob", "10.0.0.1:1", true),
        signed_raw(&bob, "lost-key", b"recovered"),
    );
    assert!(mycelium.engine.get("lost-key").is_err());

    // A second identical answer reaches the quorum.
    mycelium.handle_raw(
        &peer_ctx("carol", "10.0.0.2:1", true),
        signed_raw(&carol, "lost-key", b"recovered"),
    );

    let (data, version) = mycelium.engine.get("lost-key").unwrap();
    assert_eq!(data, b"recovered");
    assert_eq!(version, Version::of(b"recovered"));
}

#[tokio::test]
async fn test_recovery_requires_identical_votes() {
    let mycelium = testing_mycelium("alice").await;

    let bob = KeyRing::new();
    bob.create_private("password").unwrap();
    let carol = KeyRing::new();
    carol.create_private("password").unwrap();
    trust_key(&mycelium, "bob", &bob);
    trust_key(&mycelium, "carol", &carol);

    mycelium.start_recovery("lost-key", 2);

    mycelium.handle_raw(
        &peer_ctx("bob", "10.0.0.1:1", true),
        signed_raw(&bob, "lost-key", b"one value"),
    );
    mycelium.handle_raw(
        &peer_ctx("carol", "10.0.0.2:1", true),
        signed_raw(&carol, "lost-key", b"another value"),
    );

    // Enough answers, but no version has a quorum of identical votes.
    assert!(mycelium.engine.get("lost-key").is_err());
}

#[tokio::test]
async fn test_recovery_ignores_untrusted_answers() {
    let mycelium = testing_mycelium("alice").await;

    let eve = KeyRing::new();
    eve.create_private("password").unwrap();

    mycelium.start_recovery("lost-key", 1);

    // Eve's session is untrusted: her answer must be dropped even though
    // it is well-formed.
    mycelium.handle_raw(
        &peer_ctx("eve", "10.6.6.6:1", false),
        signed_raw(&eve, "lost-key", b"poisoned"),
    );
    assert!(mycelium.engine.get("lost-key").is_err());
}

#[tokio::test]
async fn test_recovery_rejects_mismatched_version() {
    let mycelium = testing_mycelium("alice").await;

    let bob = KeyRing::new();
    bob.create_private("password").unwrap();
    trust_key(&mycelium, "bob", &bob);

    mycelium.start_recovery("lost-key", 1);

    // The carried version does not hash the carried data.
    let mut raw = Raw {
        key: "lost-key".to_string(),
        version: Version::of(b"other data"),
        data: b"actual data".to_vec(),
        signature: Vec::new(),
    };
    raw.signature = bob.sign(&raw.signable_message().unwrap()).unwrap();

    mycelium.handle_raw(&peer_ctx("bob", "10.0.0.1:1", true), raw);
    assert!(mycelium.engine.get("lost-key").is_err());
}

#[tokio::test]
async fn test_recovery_without_session_is_dropped() {
    let mycelium = testing_mycelium("alice").await;

    let bob = KeyRing::new();
    bob.create_private("password").unwrap();
    trust_key(&mycelium, "bob", &bob);

    // No start_recovery: the answer is unsolicited.
    mycelium.handle_raw(
        &peer_ctx("bob", "10.0.0.1:1", true),
        signed_raw(&bob, "lost-key", b"data"),
    );
    assert!(mycelium.engine.get("lost-key").is_err());
}

#[tokio::test]
async fn test_recover_request_served_to_trusted_peer() {
    let mycelium = testing_mycelium("alice").await;
    let mut mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);

    mycelium
        .engine
        .store
        .set("known", b"payload", &Version::of(b"payload"))
        .unwrap();

    mycelium.handle_recover_request(
        &peer_ctx("bob", "10.0.0.1:1", true),
        RecoverRequest {
            key: "known".to_string(),
        },
    );

    let frame = timeout(Duration::from_secs(1), mailbox.recv())
        .await
        .unwrap()
        .unwrap();
    let call = Call::unpack(&mut std::io::Cursor::new(frame)).await.unwrap();

    let Call::Raw(raw) = call else {
        panic!("expected a raw payload");
    };
    assert_eq!(raw.key, "known");
    assert_eq!(raw.data, b"payload");
    assert_eq!(raw.version, Version::of(b"payload"));
    assert!(!raw.signature.is_empty());
}

#[tokio::test]
async fn test_recover_request_refused_to_untrusted_peer() {
    let mycelium = testing_mycelium("alice").await;
    let mut mailbox = fake_peer(&mycelium, "eve", "10.6.6.6:1", false);

    mycelium
        .engine
        .store
        .set("known", b"payload", &Version::of(b"payload"))
        .unwrap();

    mycelium.handle_recover_request(
        &peer_ctx("eve", "10.6.6.6:1", false),
        RecoverRequest {
            key: "known".to_string(),
        },
    );
    mycelium.handle_recover_request(
        &peer_ctx("eve", "10.6.6.6:1", false),
        RecoverRequest { key: String::new() },
    );

    assert!(
        timeout(Duration::from_millis(100), mailbox.recv())
            .await
            .is_err(),
        "untrusted peers must not be served"
    );
}

#[tokio::test]
async fn test_blank_recover_request_returns_catalog() {
    let mycelium = testing_mycelium("alice").await;
    let mut mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);

    mycelium
        .engine
        .store
        .set("a", b"1", &Version::of(b"1"))
        .unwrap();
    mycelium
        .engine
        .store
        .set("b", b"2", &Version::of(b"2"))
        .unwrap();

    mycelium.handle_recover_request(
        &peer_ctx("bob", "10.0.0.1:1", true),
        RecoverRequest { key: String::new() },
    );

    let frame = timeout(Duration::from_secs(1), mailbox.recv())
        .await
        .unwrap()
        .unwrap();
    let call = Call::unpack(&mut std::io::Cursor::new(frame)).await.unwrap();

    let Call::Catalog(catalog) = call else {
        panic!("expected a catalog");
    };
    assert_eq!(catalog.keys.len(), 2);
    assert_eq!(catalog.keys["a"], Version::of(b"1"));
}

#[tokio::test]
async fn test_full_sync_targets_trusted_connected_peer() {
    let mycelium = testing_mycelium("alice").await;
    let mut trusted_mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);
    let _untrusted_mailbox = fake_peer(&mycelium, "eve", "10.6.6.6:1", false);

    // Unknown or untrusted peers are refused.
    mycelium.start_full_sync("nobody");
    assert!(mycelium.full_sync_peer.lock().is_empty());
    mycelium.start_full_sync("eve");
    assert!(mycelium.full_sync_peer.lock().is_empty());

    mycelium.start_full_sync("bob");
    assert_eq!(*mycelium.full_sync_peer.lock(), "bob");

    let frame = timeout(Duration::from_secs(1), trusted_mailbox.recv())
        .await
        .unwrap()
        .unwrap();
    let call = Call::unpack(&mut std::io::Cursor::new(frame)).await.unwrap();
    assert_eq!(call, Call::RecoverRequest(RecoverRequest::default()));
}

#[tokio::test]
async fn test_catalog_triggers_per_key_recoveries() {
    let mycelium = testing_mycelium("alice").await;
    let mut mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);

    // Local state: "same" matches the remote catalog, "diverged" does
    // not, "missing" is absent locally.
    mycelium
        .engine
        .store
        .set("same", b"x", &Version::of(b"x"))
        .unwrap();
    mycelium
        .engine
        .store
        .set("diverged", b"old", &Version::of(b"old"))
        .unwrap();

    let mut catalog = Catalog::default();
    catalog.keys.insert("same".to_string(), Version::of(b"x"));
    catalog
        .keys
        .insert("diverged".to_string(), Version::of(b"new"));
    catalog
        .keys
        .insert("missing".to_string(), Version::of(b"y"));

    // A catalog from someone else than the full-sync peer is ignored.
    mycelium.handle_catalog(&peer_ctx("carol", "10.0.0.2:1", true), catalog.clone());
    assert!(mycelium.recoveries.lock().is_empty());

    mycelium.start_full_sync("bob");
    let _ = mailbox.recv().await; // drain the blank recover request

    mycelium.handle_catalog(&peer_ctx("bob", "10.0.0.1:1", true), catalog);

    let recoveries = mycelium.recoveries.lock();
    assert!(recoveries.contains_key("diverged"));
    assert!(recoveries.contains_key("missing"));
    assert!(!recoveries.contains_key("same"));
    drop(recoveries);

    // The full-sync marker is consumed by the catalog.
    assert!(mycelium.full_sync_peer.lock().is_empty());
}
