//! Key management and web of trust.
//!
//! The keyring holds the node's Ed25519 private key (encrypted at rest)
//! and the public keys of known identities, together with the signatures
//! they emitted over each other. Signature verification requires both a
//! valid signature and enough *effective trust*, computed from the
//! signature graph.

use thiserror::Error;

mod armor;
mod ring;
mod trust;

pub use armor::{Block, PRIVATE_BLOCK_TYPE, PUBLIC_BLOCK_TYPE};
pub use ring::{
    fingerprint, KeyRing, KeySignature, ListedKey, PUBLIC_KEY_BYTES, SIGNATURE_BYTES,
};
pub use trust::TrustLevel;

/// Errors raised by keyring operations.
#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("keyring is locked")]
    Locked,
    #[error("no private key available")]
    NoPrivateKey,
    #[error("unable to decrypt private key")]
    DecryptFailed,
    #[error("invalid identity")]
    InvalidIdentity,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("insufficient trust for identity {identity} ({level})")]
    InsufficientTrust {
        identity: String,
        level: TrustLevel,
    },
    #[error("unrecognized trust level: {0}")]
    UnrecognizedTrust(String),
    #[error("invalid armor: {0}")]
    Armor(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlocked_ring() -> KeyRing {
        let ring = KeyRing::new();
        ring.create_private("password").unwrap();
        ring
    }

    /// Register `identity`'s public key into `ring` at the given trust.
    fn introduce(ring: &KeyRing, identity: &str, other: &KeyRing, trust: TrustLevel) {
        let (public, _) = other.get_public("").unwrap();
        ring.add_public(identity, trust, &public).unwrap();
    }

    #[test]
    fn test_sign_requires_unlocked_ring() {
        let ring = KeyRing::new();
        assert!(matches!(ring.sign(b"msg"), Err(KeyRingError::Locked)));
        assert!(ring.locked());

        ring.create_private("password").unwrap();
        assert!(!ring.locked());
        assert_eq!(ring.sign(b"msg").unwrap().len(), SIGNATURE_BYTES);
    }

    #[test]
    fn test_self_signature_round_trip() {
        let ring = unlocked_ring();
        let signature = ring.sign(b"the message").unwrap();

        assert!(ring.verify("", b"the message", &signature).is_ok());
        assert!(matches!(
            ring.verify("", b"another message", &signature),
            Err(KeyRingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_verify_requires_trust() {
        let alice = unlocked_ring();
        let bob = unlocked_ring();

        let signature = bob.sign(b"hello").unwrap();

        // Unknown identity first.
        assert!(matches!(
            alice.verify("bob", b"hello", &signature),
            Err(KeyRingError::UnknownIdentity(_))
        ));

        // Known but not trusted enough.
        introduce(&alice, "bob", &bob, TrustLevel::LOW);
        assert!(matches!(
            alice.verify("bob", b"hello", &signature),
            Err(KeyRingError::InsufficientTrust { .. })
        ));

        // Trusted.
        introduce(&alice, "bob", &bob, TrustLevel::HIGH);
        assert!(alice.verify("bob", b"hello", &signature).is_ok());
    }

    #[test]
    fn test_transitive_trust_through_signature() {
        // Alice trusts Bob (HIGH). Bob signed Carol's key with HIGH trust.
        // Importing that signature must make Carol trusted by Alice.
        let alice = unlocked_ring();
        let bob = unlocked_ring();
        let carol = unlocked_ring();

        introduce(&bob, "carol", &carol, TrustLevel::HIGH);
        bob.add_signature("carol", "", None).unwrap();
        let bob_over_carol = bob.get_signatures("carol").remove("").unwrap();

        introduce(&alice, "bob", &bob, TrustLevel::HIGH);
        introduce(&alice, "carol", &carol, TrustLevel::NONE);
        alice
            .add_signature("carol", "bob", Some(bob_over_carol))
            .unwrap();

        assert!(alice.trusted("carol").is_ok());
    }

    #[test]
    fn test_low_trust_key_does_not_extend_the_web() {
        // Dave is only LOW-trusted by Alice; his signature over Eve must
        // not push Eve over the threshold.
        let alice = unlocked_ring();
        let dave = unlocked_ring();
        let eve = unlocked_ring();

        introduce(&dave, "eve", &eve, TrustLevel::ULTIMATE);
        dave.add_signature("eve", "", None).unwrap();
        let dave_over_eve = dave.get_signatures("eve").remove("").unwrap();

        introduce(&alice, "dave", &dave, TrustLevel::LOW);
        introduce(&alice, "eve", &eve, TrustLevel::NONE);

        // Dave is below the threshold, so his signature is never walked.
        alice
            .add_signature("eve", "dave", Some(dave_over_eve))
            .unwrap();
        assert!(alice.trusted("eve").is_err());
    }

    #[test]
    fn test_adding_signatures_never_lowers_trust() {
        let alice = unlocked_ring();
        let bob = unlocked_ring();
        let carol = unlocked_ring();

        introduce(&alice, "bob", &bob, TrustLevel::HIGH);
        introduce(&alice, "carol", &carol, TrustLevel::HIGH);
        assert!(alice.trusted("carol").is_ok());

        // A LOW signature from Bob over Carol must not lower her level.
        introduce(&bob, "carol", &carol, TrustLevel::LOW);
        bob.add_signature("carol", "", None).unwrap();
        let signature = bob.get_signatures("carol").remove("").unwrap();
        alice
            .add_signature("carol", "bob", Some(signature))
            .unwrap();

        assert!(alice.trusted("carol").is_ok());
    }

    #[test]
    fn test_forged_third_party_signature_rejected() {
        let alice = unlocked_ring();
        let bob = unlocked_ring();
        let carol = unlocked_ring();

        introduce(&alice, "bob", &bob, TrustLevel::HIGH);
        introduce(&alice, "carol", &carol, TrustLevel::NONE);

        let forged = KeySignature {
            data: vec![0u8; SIGNATURE_BYTES],
            trust: TrustLevel::ULTIMATE,
        };
        assert!(matches!(
            alice.add_signature("carol", "bob", Some(forged)),
            Err(KeyRingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let alice = unlocked_ring();
        let bob = unlocked_ring();

        introduce(&alice, "bob", &bob, TrustLevel::HIGH);
        alice.add_signature("bob", "", None).unwrap();

        let armored = alice.save().unwrap();

        let restored = KeyRing::new();
        restored.load(&armored).unwrap();
        assert!(restored.locked());
        restored.unlock_private("password").unwrap();

        // Identity and trust web survive the round trip.
        assert_eq!(
            restored.get_public("bob").unwrap(),
            alice.get_public("bob").unwrap()
        );
        assert!(restored.trusted("bob").is_ok());
        assert_eq!(restored.get_signatures("bob").len(), 1);

        // The restored private key is the same.
        let signature = restored.sign(b"check").unwrap();
        assert!(alice.verify("", b"check", &signature).is_ok());
    }

    #[test]
    fn test_unlock_with_wrong_password() {
        let alice = unlocked_ring();
        let armored = alice.save().unwrap();

        let restored = KeyRing::new();
        restored.load(&armored).unwrap();
        assert!(matches!(
            restored.unlock_private("not-the-password"),
            Err(KeyRingError::DecryptFailed)
        ));
        assert!(restored.locked());
    }

    #[test]
    fn test_export_import_with_rebranding() {
        let alice = unlocked_ring();
        let bob = unlocked_ring();

        introduce(&alice, "bob", &bob, TrustLevel::LOW);
        let exported = alice.export("bob").unwrap();

        // Carol imports Alice's view of Bob under a different local name.
        let carol = unlocked_ring();
        assert!(matches!(
            carol.import(&exported, "robert", TrustLevel::HIGH),
            Err(KeyRingError::InvalidIdentity)
        ));

        carol.import(&exported, "bob", TrustLevel::HIGH).unwrap();
        assert!(carol.trusted("bob").is_ok());
    }

    #[test]
    fn test_local_export_has_no_identity_header() {
        let alice = unlocked_ring();
        let exported = alice.export("").unwrap();
        let text = String::from_utf8(exported.clone()).unwrap();
        assert!(!text.contains("identity:"));

        // A local export can be imported under any identity.
        let bob = unlocked_ring();
        bob.import(&exported, "alice", TrustLevel::HIGH).unwrap();
        assert!(bob.trusted("alice").is_ok());

        let signature = alice.sign(b"msg").unwrap();
        assert!(bob.verify("alice", b"msg", &signature).is_ok());
    }

    #[test]
    fn test_remove_public() {
        let alice = unlocked_ring();
        let bob = unlocked_ring();

        introduce(&alice, "bob", &bob, TrustLevel::HIGH);
        alice.remove_public("bob");
        assert!(matches!(
            alice.trusted("bob"),
            Err(KeyRingError::UnknownIdentity(_))
        ));

        // The self key cannot be removed.
        alice.remove_public("");
        assert!(alice.get_public("").is_ok());
    }

    #[test]
    fn test_list_public_sorted() {
        let alice = unlocked_ring();
        let bob = unlocked_ring();
        let carol = unlocked_ring();

        introduce(&alice, "carol", &carol, TrustLevel::LOW);
        introduce(&alice, "bob", &bob, TrustLevel::LOW);

        let listed = alice.list_public();
        let identities: Vec<&str> = listed.iter().map(|k| k.identity.as_str()).collect();
        assert_eq!(identities, vec!["", "bob", "carol"]);
    }

    #[test]
    fn test_fingerprint() {
        assert_eq!(fingerprint(&[0xAB; 5]), "AB:AB:AB:AB:AB");
        assert_eq!(fingerprint(&[1, 2, 3]), "");
    }
}
