//! Gossip proposal/request behavior and broadcast fan-out.

use std::time::Duration;

use tokio::time::timeout;

use crate::core_myc::protocol::{Call, Gossip};

use super::*;

#[tokio::test]
async fn test_proposal_for_unknown_spore_pulls_once() {
    let mycelium = testing_mycelium("alice").await;
    let mut mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);
    let bob = peer_ctx("bob", "10.0.0.1:1", true);

    let proposal = Gossip {
        spores: vec!["some-uuid".to_string()],
        request: false,
    };

    mycelium.handle_gossip_proposal(&bob, proposal.clone());

    let frame = timeout(Duration::from_secs(1), mailbox.recv())
        .await
        .unwrap()
        .unwrap();
    let call = Call::unpack(&mut std::io::Cursor::new(frame)).await.unwrap();
    assert_eq!(
        call,
        Call::Gossip(Gossip {
            spores: vec!["some-uuid".to_string()],
            request: true,
        })
    );

    // The same proposal from the same node does not pull again.
    mycelium.handle_gossip_proposal(&bob, proposal);
    assert!(
        timeout(Duration::from_millis(100), mailbox.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_proposal_for_delivered_spore_is_ignored() {
    let mycelium = testing_mycelium("alice").await;
    let mut mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);
    let bob = peer_ctx("bob", "10.0.0.1:1", true);

    mycelium
        .requests
        .set_delivered("delivered-uuid", b"cached frame".to_vec());

    mycelium.handle_gossip_proposal(
        &bob,
        Gossip {
            spores: vec!["delivered-uuid".to_string()],
            request: false,
        },
    );

    assert!(
        timeout(Duration::from_millis(100), mailbox.recv())
            .await
            .is_err(),
        "no pull for an already delivered spore"
    );
}

#[tokio::test]
async fn test_request_replays_cached_bytes() {
    let mycelium = testing_mycelium("alice").await;
    let mut mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);
    let bob = peer_ctx("bob", "10.0.0.1:1", true);

    mycelium
        .requests
        .set_delivered("known-uuid", b"cached frame".to_vec());

    mycelium.handle_gossip_request(
        &bob,
        Gossip {
            spores: vec!["known-uuid".to_string(), "unknown-uuid".to_string()],
            request: true,
        },
    );

    let frame = timeout(Duration::from_secs(1), mailbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, b"cached frame");

    // The unknown uuid is a miss, nothing else is sent.
    assert!(
        timeout(Duration::from_millis(100), mailbox.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_broadcast_excludes_origin() {
    let mycelium = testing_mycelium("alice").await;
    let mut bob_mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);
    let mut carol_mailbox = fake_peer(&mycelium, "carol", "10.0.0.2:1", true);

    let call = Call::Gossip(Gossip {
        spores: vec!["uuid".to_string()],
        request: false,
    });

    let origin = peer_ctx("bob", "10.0.0.1:1", true);
    let sent = mycelium.broadcast(Some(&origin.node), &call);
    assert_eq!(sent, 1);

    assert!(carol_mailbox.recv().await.is_some());
    assert!(
        timeout(Duration::from_millis(100), bob_mailbox.recv())
            .await
            .is_err(),
        "the originating peer must not receive its own message back"
    );
}

#[tokio::test]
async fn test_broadcast_caches_spores_for_pull() {
    let mycelium = testing_mycelium("alice").await;
    let _mailbox = fake_peer(&mycelium, "bob", "10.0.0.1:1", true);

    let mut spore = crate::core_consensus::Spore::new("none");
    spore.set_timeout(Duration::from_secs(1));
    let uuid = spore.uuid.clone();

    mycelium.broadcast(None, &Call::Spore(spore));
    assert!(mycelium.requests.is_delivered(&uuid));
}
