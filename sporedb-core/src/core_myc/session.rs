/*
    session.rs - authenticated encrypted sessions

    Each side of a connection generates an ephemeral Curve25519 keypair
    and exchanges signed Hello messages. The shared secret obtained by
    scalar multiplication keys an AES-256-CTR stream on each direction
    (fresh key per session, so the zero IV is acceptable).

    A peer whose identity is unknown or insufficiently trusted still
    completes the handshake, but the session is marked untrusted: only
    public consensus messages may be exchanged with it.
*/

use std::sync::Arc;
use std::time::Duration;

use aes::Aes256;
use ctr::cipher::KeyIvInit;
use ctr::Ctr128BE;
use rand::Rng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::core_encoding::Timestamp;
use crate::core_keyring::{KeyRing, KeyRingError};

use super::protocol::{Hello, PROTOCOL_VERSION};
use super::MycError;

/// Stream cipher wrapping one direction of the transport.
pub type SessionCipher = Ctr128BE<Aes256>;

/// Maximum accepted age of a handshake timestamp (replay guard).
const HELLO_MAX_AGE: Duration = Duration::from_secs(30);

/// Authenticated-encryption state of one connection.
pub struct Session {
    keyring: Arc<KeyRing>,
    identity: String,

    secret: Option<StaticSecret>,
    public: [u8; 32],
    peer_public: [u8; 32],
    trusted: bool,
}

impl Session {
    /// A new session using the keyring for peer authentication and
    /// signature management. `identity` is the local node's identity.
    pub fn new(keyring: Arc<KeyRing>, identity: &str) -> Self {
        Session {
            keyring,
            identity: identity.to_string(),
            secret: None,
            public: [0u8; 32],
            peer_public: [0u8; 32],
            trusted: false,
        }
    }

    /// Build a signed Hello message with a fresh ephemeral key. May be
    /// called several times, in case of connection reset.
    pub fn hello(&mut self) -> Result<Hello, MycError> {
        let seed: [u8; 32] = rand::thread_rng().gen();
        let secret = StaticSecret::from(seed);
        self.public = X25519Public::from(&secret).to_bytes();
        self.secret = Some(secret);

        let mut hello = Hello {
            version: PROTOCOL_VERSION,
            identity: self.identity.clone(),
            timestamp: Timestamp::now(),
            public_key: self.public.to_vec(),
            signature: Vec::new(),
        };

        hello.signature = self.keyring.sign(&hello.signable_message()?)?;
        Ok(hello)
    }

    /// Verify a peer's Hello message for conformity.
    ///
    /// A cryptographically invalid signature aborts the session; an
    /// unknown or insufficiently trusted identity only leaves it
    /// untrusted.
    pub fn verify(&mut self, hello: &Hello) -> Result<(), MycError> {
        if hello.public_key.len() != 32 {
            return Err(MycError::InvalidPublicKey);
        }

        if hello.version != PROTOCOL_VERSION {
            return Err(MycError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: hello.version,
            });
        }

        // Replay-attack protection.
        let oldest = Timestamp::now().seconds - HELLO_MAX_AGE.as_secs() as i64;
        if hello.timestamp.seconds < oldest {
            return Err(MycError::OldTimestamp);
        }

        match self
            .keyring
            .verify(&hello.identity, &hello.signable_message()?, &hello.signature)
        {
            Ok(()) => self.trusted = true,
            Err(KeyRingError::InvalidSignature) => {
                return Err(MycError::KeyRing(KeyRingError::InvalidSignature));
            }
            Err(_) => {} // unknown or untrusted identity: proceed untrusted
        }

        self.peer_public.copy_from_slice(&hello.public_key);
        Ok(())
    }

    /// Whether the peer is correctly authenticated and trusted.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Derive the shared secret and return the (read, write) stream
    /// ciphers. Must be called after a successful Hello round-trip.
    pub fn open(&self) -> Result<(SessionCipher, SessionCipher), MycError> {
        let secret = self.secret.as_ref().ok_or(MycError::HandshakeIncomplete)?;
        let shared = secret.diffie_hellman(&X25519Public::from(self.peer_public));

        // Zero IV: the shared key is never reused across sessions.
        let iv = [0u8; 16];
        let read = SessionCipher::new(shared.as_bytes().into(), &iv.into());
        let write = SessionCipher::new(shared.as_bytes().into(), &iv.into());
        Ok((read, write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_keyring::TrustLevel;
    use ctr::cipher::StreamCipher;

    fn ring(_name: &str) -> Arc<KeyRing> {
        let ring = KeyRing::new();
        ring.create_private("password").unwrap();
        Arc::new(ring)
    }

    fn introduce(ring: &KeyRing, identity: &str, other: &KeyRing) {
        let (public, _) = other.get_public("").unwrap();
        ring.add_public(identity, TrustLevel::HIGH, &public).unwrap();
    }

    #[test]
    fn test_handshake_between_trusted_peers() {
        let alice_ring = ring("alice");
        let bob_ring = ring("bob");
        introduce(&alice_ring, "bob", &bob_ring);
        introduce(&bob_ring, "alice", &alice_ring);

        let mut alice = Session::new(alice_ring, "alice");
        let mut bob = Session::new(bob_ring, "bob");

        let alice_hello = alice.hello().unwrap();
        let bob_hello = bob.hello().unwrap();

        alice.verify(&bob_hello).unwrap();
        bob.verify(&alice_hello).unwrap();

        assert!(alice.is_trusted());
        assert!(bob.is_trusted());

        // Both sides derive the same keystream.
        let (mut alice_read, _) = alice.open().unwrap();
        let (_, mut bob_write) = bob.open().unwrap();

        let mut message = b"encrypted payload".to_vec();
        bob_write.apply_keystream(&mut message);
        assert_ne!(message, b"encrypted payload");

        alice_read.apply_keystream(&mut message);
        assert_eq!(message, b"encrypted payload");
    }

    #[test]
    fn test_unknown_identity_is_untrusted_but_accepted() {
        let alice_ring = ring("alice");
        let bob_ring = ring("bob");
        // Alice does not know Bob.

        let mut alice = Session::new(alice_ring, "alice");
        let mut bob = Session::new(bob_ring, "bob");

        let bob_hello = bob.hello().unwrap();
        alice.verify(&bob_hello).unwrap();
        assert!(!alice.is_trusted());
    }

    #[test]
    fn test_invalid_signature_aborts() {
        let alice_ring = ring("alice");
        let bob_ring = ring("bob");
        introduce(&alice_ring, "bob", &bob_ring);

        let mut alice = Session::new(alice_ring, "alice");
        let mut bob = Session::new(bob_ring, "bob");

        let mut bob_hello = bob.hello().unwrap();
        bob_hello.signature[0] ^= 0xFF;

        assert!(matches!(
            alice.verify(&bob_hello),
            Err(MycError::KeyRing(KeyRingError::InvalidSignature))
        ));
    }

    #[test]
    fn test_old_timestamp_rejected() {
        let alice_ring = ring("alice");
        let bob_ring = ring("bob");
        introduce(&alice_ring, "bob", &bob_ring);

        let mut alice = Session::new(alice_ring.clone(), "alice");
        let mut bob = Session::new(bob_ring.clone(), "bob");

        let mut bob_hello = bob.hello().unwrap();
        bob_hello.timestamp.seconds -= 60;
        bob_hello.signature = bob_ring
            .sign(&bob_hello.signable_message().unwrap())
            .unwrap();

        assert!(matches!(
            alice.verify(&bob_hello),
            Err(MycError::OldTimestamp)
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let alice_ring = ring("alice");
        let bob_ring = ring("bob");
        introduce(&alice_ring, "bob", &bob_ring);

        let mut alice = Session::new(alice_ring, "alice");
        let mut bob = Session::new(bob_ring.clone(), "bob");

        let mut bob_hello = bob.hello().unwrap();
        bob_hello.version = PROTOCOL_VERSION + 1;
        bob_hello.signature = bob_ring
            .sign(&bob_hello.signable_message().unwrap())
            .unwrap();

        assert!(matches!(
            alice.verify(&bob_hello),
            Err(MycError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_public_key_rejected() {
        let alice_ring = ring("alice");
        let bob_ring = ring("bob");

        let mut alice = Session::new(alice_ring, "alice");
        let mut bob = Session::new(bob_ring, "bob");

        let mut bob_hello = bob.hello().unwrap();
        bob_hello.public_key = vec![0u8; 16];

        assert!(matches!(
            alice.verify(&bob_hello),
            Err(MycError::InvalidPublicKey)
        ));
    }
}
