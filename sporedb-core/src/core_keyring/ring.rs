/*
    ring.rs - Ed25519 keyring and web of trust

    Holds the node's private key (encrypted at rest) and a directory of
    public keys with the signatures they emitted over each other. The
    effective trust of every key is derived lazily from the signature
    graph: any write marks the ring stale, and the next reader rebuilds
    the web before proceeding.
*/

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::{RwLock, RwLockReadGuard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::armor::{decode_block, Block, PRIVATE_BLOCK_TYPE, PUBLIC_BLOCK_TYPE};
use super::{KeyRingError, TrustLevel};

/// Ed25519 public keys are 32 bytes, signatures 64 bytes.
pub const PUBLIC_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

/// A local or third-party signature over a public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySignature {
    /// Signature over `signee_public || trust_byte`.
    pub data: Vec<u8>,
    /// Trust level granted by the signer.
    pub trust: TrustLevel,
}

/// One entry of the public key directory.
#[derive(Debug, Clone, Default)]
struct KeyRecord {
    public: Vec<u8>,
    /// Trust level assigned locally by the user.
    trust: TrustLevel,
    /// Signatures emitted by this key, keyed by signee identity.
    signatures: BTreeMap<String, KeySignature>,
    /// Derived: trust computed from the web of trust.
    effective: TrustLevel,
    /// Derived: identities whose signature granted trust to this key.
    signed_by: Vec<String>,
}

/// Listing entry returned by `list_public`.
#[derive(Debug, Clone)]
pub struct ListedKey {
    pub identity: String,
    pub public: Vec<u8>,
    pub trust: TrustLevel,
}

/// Private key material encrypted at rest.
#[derive(Debug, Clone)]
struct EncryptedSecret {
    salt: Vec<u8>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

struct RingInner {
    /// Identity directory. The empty identity is the ring itself.
    keys: HashMap<String, KeyRecord>,
    secret: Option<SigningKey>,
    armored_secret: Option<EncryptedSecret>,
    stale: bool,
}

/// Key management structure, used to sign and verify endorsements,
/// spores and sessions.
pub struct KeyRing {
    inner: RwLock<RingInner>,
}

/// Armored payload of a public block.
#[derive(Serialize, Deserialize)]
struct PublicPayload {
    public: String,
    signatures: BTreeMap<String, SignaturePayload>,
}

#[derive(Serialize, Deserialize)]
struct SignaturePayload {
    data: String,
    trust: TrustLevel,
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRing {
    pub fn new() -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            String::new(),
            KeyRecord {
                trust: TrustLevel::ULTIMATE,
                effective: TrustLevel::ULTIMATE,
                ..Default::default()
            },
        );

        KeyRing {
            inner: RwLock::new(RingInner {
                keys,
                secret: None,
                armored_secret: None,
                stale: false,
            }),
        }
    }

    /// Whether the private key is currently unavailable in cleartext.
    pub fn locked(&self) -> bool {
        self.inner.read().secret.is_none()
    }

    /// Generate a new private key, encrypting it at rest under a key
    /// derived from the password.
    pub fn create_private(&self, password: &str) -> Result<(), KeyRingError> {
        let seed: [u8; 32] = rand::thread_rng().gen();
        let signing_key = SigningKey::from_bytes(&seed);

        let salt: [u8; 16] = rand::thread_rng().gen();
        let nonce: [u8; 12] = rand::thread_rng().gen();
        let mut derived = derive_key(password, &salt)?;

        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| KeyRingError::Armor(e.to_string()))?;
        derived.zeroize();

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), seed.as_slice())
            .map_err(|_| KeyRingError::DecryptFailed)?;

        let mut inner = self.inner.write();
        inner.armored_secret = Some(EncryptedSecret {
            salt: salt.to_vec(),
            nonce: nonce.to_vec(),
            ciphertext,
        });
        let public = signing_key.verifying_key().to_bytes().to_vec();
        inner.secret = Some(signing_key);
        inner.self_record_mut().public = public;
        inner.stale = true;
        Ok(())
    }

    /// Decrypt the private key block in memory.
    pub fn unlock_private(&self, password: &str) -> Result<(), KeyRingError> {
        let mut inner = self.inner.write();
        if inner.secret.is_some() {
            return Ok(()); // already unlocked
        }

        let armored = inner
            .armored_secret
            .as_ref()
            .ok_or(KeyRingError::NoPrivateKey)?;

        let mut derived = derive_key(password, &armored.salt)?;
        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| KeyRingError::Armor(e.to_string()))?;
        derived.zeroize();

        let mut seed = cipher
            .decrypt(Nonce::from_slice(&armored.nonce), armored.ciphertext.as_slice())
            .map_err(|_| KeyRingError::DecryptFailed)?;

        if seed.len() != 32 {
            seed.zeroize();
            return Err(KeyRingError::DecryptFailed);
        }

        let mut seed_bytes = [0u8; 32];
        seed_bytes.copy_from_slice(&seed);
        seed.zeroize();

        let signing_key = SigningKey::from_bytes(&seed_bytes);
        seed_bytes.zeroize();

        let public = signing_key.verifying_key().to_bytes().to_vec();
        inner.secret = Some(signing_key);
        inner.self_record_mut().public = public;
        inner.stale = true;
        Ok(())
    }

    /// Drop the cleartext private key from memory.
    pub fn lock_private(&self) {
        self.inner.write().secret = None;
    }

    /// Sign the message with the unlocked private key.
    pub fn sign(&self, cleartext: &[u8]) -> Result<Vec<u8>, KeyRingError> {
        let inner = self.inner.read();
        let secret = inner.secret.as_ref().ok_or(KeyRingError::Locked)?;
        Ok(secret.sign(cleartext).to_bytes().to_vec())
    }

    /// Return the stored public key for the provided identity.
    ///
    /// The empty identity returns the ring's own public key with
    /// `ULTIMATE` trust.
    pub fn get_public(&self, identity: &str) -> Result<(Vec<u8>, TrustLevel), KeyRingError> {
        let inner = self.inner.read();

        if identity.is_empty() {
            let secret = inner.secret.as_ref().ok_or(KeyRingError::Locked)?;
            return Ok((
                secret.verifying_key().to_bytes().to_vec(),
                TrustLevel::ULTIMATE,
            ));
        }

        let record = inner
            .keys
            .get(identity)
            .ok_or_else(|| KeyRingError::UnknownIdentity(identity.to_string()))?;
        Ok((record.public.clone(), record.trust))
    }

    /// Add or overwrite a public key. Signatures emitted by the identity
    /// are reset when the key material changes.
    pub fn add_public(
        &self,
        identity: &str,
        trust: TrustLevel,
        data: &[u8],
    ) -> Result<(), KeyRingError> {
        if identity.is_empty() {
            return Err(KeyRingError::InvalidIdentity);
        }
        if data.len() != PUBLIC_KEY_BYTES {
            return Err(KeyRingError::InvalidPublicKey);
        }

        let mut inner = self.inner.write();
        let record = inner.keys.entry(identity.to_string()).or_default();

        if record.public != data {
            record.public = data.to_vec();
            record.signatures.clear();
            record.signed_by.clear();
        }
        record.trust = trust;
        inner.stale = true;
        Ok(())
    }

    /// Remove a key from the ring. The self key cannot be removed.
    pub fn remove_public(&self, identity: &str) {
        if identity.is_empty() {
            return;
        }

        let mut inner = self.inner.write();
        if inner.keys.remove(identity).is_some() {
            inner.stale = true;
        }
    }

    /// List the known public keys, sorted by identity. The self key is
    /// listed under the empty identity.
    pub fn list_public(&self) -> Vec<ListedKey> {
        let inner = self.read_fresh();
        let mut listed: Vec<ListedKey> = inner
            .keys
            .iter()
            .map(|(identity, record)| ListedKey {
                identity: identity.clone(),
                public: record.public.clone(),
                trust: record.trust,
            })
            .collect();
        listed.sort_by(|a, b| a.identity.cmp(&b.identity));
        listed
    }

    /// Signatures over the provided identity, keyed by signer.
    pub fn get_signatures(&self, identity: &str) -> BTreeMap<String, KeySignature> {
        let inner = self.read_fresh();

        let record = match inner.keys.get(identity) {
            Some(record) => record,
            None => return BTreeMap::new(),
        };

        let mut signatures = BTreeMap::new();
        for signer in &record.signed_by {
            if let Some(signer_record) = inner.keys.get(signer) {
                if let Some(signature) = signer_record.signatures.get(identity) {
                    signatures.insert(signer.clone(), signature.clone());
                }
            }
        }
        signatures
    }

    /// Add a signature over `identity`, from signer `from`.
    ///
    /// An empty `from` emits a new local signature using the private key,
    /// at the signee's current user trust. Third-party signatures are
    /// validated cryptographically before being accepted.
    pub fn add_signature(
        &self,
        identity: &str,
        from: &str,
        signature: Option<KeySignature>,
    ) -> Result<(), KeyRingError> {
        let signature = {
            let inner = self.inner.read();
            let signee = inner
                .keys
                .get(identity)
                .ok_or_else(|| KeyRingError::UnknownIdentity(identity.to_string()))?;
            let signer = inner
                .keys
                .get(from)
                .ok_or_else(|| KeyRingError::UnknownIdentity(from.to_string()))?;

            if from.is_empty() {
                let message = signature_message(&signee.public, signee.trust);
                let secret = inner.secret.as_ref().ok_or(KeyRingError::Locked)?;
                KeySignature {
                    data: secret.sign(&message).to_bytes().to_vec(),
                    trust: signee.trust,
                }
            } else {
                let signature = signature.ok_or(KeyRingError::InvalidSignature)?;
                let message = signature_message(&signee.public, signature.trust);
                if !raw_verify(&signer.public, &message, &signature.data) {
                    return Err(KeyRingError::InvalidSignature);
                }
                signature
            }
        };

        let mut inner = self.inner.write();
        inner
            .keys
            .get_mut(from)
            .ok_or_else(|| KeyRingError::UnknownIdentity(from.to_string()))?
            .signatures
            .insert(identity.to_string(), signature);
        inner.stale = true;
        Ok(())
    }

    /// Check a message signed by `from`: the signature must verify
    /// cryptographically AND the signer's effective trust must reach the
    /// threshold.
    pub fn verify(
        &self,
        from: &str,
        cleartext: &[u8],
        signature: &[u8],
    ) -> Result<(), KeyRingError> {
        let inner = self.read_fresh();

        let record = inner
            .keys
            .get(from)
            .ok_or_else(|| KeyRingError::UnknownIdentity(from.to_string()))?;

        if record.public.is_empty() {
            // Only the locked self record can end up here.
            return Err(KeyRingError::Locked);
        }

        if !raw_verify(&record.public, cleartext, signature) {
            return Err(KeyRingError::InvalidSignature);
        }

        trusted_record(from, record)
    }

    /// Whether an identity is currently trusted by the ring.
    pub fn trusted(&self, identity: &str) -> Result<(), KeyRingError> {
        let inner = self.read_fresh();
        let record = inner
            .keys
            .get(identity)
            .ok_or_else(|| KeyRingError::UnknownIdentity(identity.to_string()))?;
        trusted_record(identity, record)
    }

    /// Export one identity as an armored public block.
    ///
    /// A local export (empty identity) carries no headers; a third-party
    /// export records this ring's view of the identity and trust.
    pub fn export(&self, identity: &str) -> Result<Vec<u8>, KeyRingError> {
        let inner = self.inner.read();
        inner.export_unsafe(identity).map(String::into_bytes)
    }

    /// Import an armored public block under the given identity and trust.
    ///
    /// A third-party export carrying a different identity header is
    /// rejected; a private block is never importable this way.
    pub fn import(
        &self,
        data: &[u8],
        identity: &str,
        trust: TrustLevel,
    ) -> Result<(), KeyRingError> {
        if identity.is_empty() {
            return Err(KeyRingError::InvalidIdentity);
        }

        let text =
            std::str::from_utf8(data).map_err(|e| KeyRingError::Armor(e.to_string()))?;
        let (block, _) = decode_block(text)?
            .ok_or_else(|| KeyRingError::Armor("no armored block found".to_string()))?;

        if block.block_type == PRIVATE_BLOCK_TYPE {
            return Err(KeyRingError::InvalidIdentity);
        }

        let header_identity = block.header("identity").unwrap_or_default();
        if !header_identity.is_empty() && header_identity != identity {
            return Err(KeyRingError::InvalidIdentity);
        }

        let record = record_from_block(&block)?;

        let mut inner = self.inner.write();
        inner.keys.insert(
            identity.to_string(),
            KeyRecord {
                trust,
                ..record
            },
        );
        inner.stale = true;
        Ok(())
    }

    /// Marshal the whole ring (private block included) to armored text.
    pub fn save(&self) -> Result<Vec<u8>, KeyRingError> {
        let inner = self.inner.read();
        let mut out = String::new();

        if let Some(armored) = &inner.armored_secret {
            let block = Block::new(PRIVATE_BLOCK_TYPE, armored.ciphertext.clone())
                .with_header("salt", &BASE64.encode(&armored.salt))
                .with_header("nonce", &BASE64.encode(&armored.nonce));
            out.push_str(&block.encode());
        }

        let mut identities: Vec<&String> = inner.keys.keys().collect();
        identities.sort();
        for identity in identities {
            out.push_str(&inner.export_unsafe(identity)?);
        }

        Ok(out.into_bytes())
    }

    /// Rebuild a ring from its armored form. Parse errors on individual
    /// blocks abort the load.
    pub fn load(&self, data: &[u8]) -> Result<(), KeyRingError> {
        let text =
            std::str::from_utf8(data).map_err(|e| KeyRingError::Armor(e.to_string()))?;

        let mut inner = self.inner.write();
        let mut rest = text;

        while let Some((block, remaining)) = decode_block(rest)? {
            rest = remaining;

            if block.block_type == PRIVATE_BLOCK_TYPE {
                let salt = BASE64
                    .decode(block.header("salt").unwrap_or_default())
                    .map_err(|e| KeyRingError::Armor(e.to_string()))?;
                let nonce = BASE64
                    .decode(block.header("nonce").unwrap_or_default())
                    .map_err(|e| KeyRingError::Armor(e.to_string()))?;
                inner.armored_secret = Some(EncryptedSecret {
                    salt,
                    nonce,
                    ciphertext: block.data.clone(),
                });
                continue;
            }

            if block.block_type != PUBLIC_BLOCK_TYPE {
                continue;
            }

            let identity = block.header("identity").unwrap_or_default().to_string();
            let record = record_from_block(&block)?;

            if identity.is_empty() {
                // Self block: only the emitted signatures are meaningful,
                // the public key is derived from the private material.
                let self_record = inner.self_record_mut();
                self_record.signatures = record.signatures;
                continue;
            }

            inner.keys.insert(identity, record);
        }

        inner.stale = true;
        Ok(())
    }

    /// Save the ring to a file, restricting its permissions.
    pub fn save_file(&self, path: &Path) -> Result<(), KeyRingError> {
        let data = self.save()?;
        std::fs::write(path, data).map_err(|e| KeyRingError::Armor(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| KeyRingError::Armor(e.to_string()))?;
        }

        Ok(())
    }

    /// Load the ring from a file.
    pub fn load_file(&self, path: &Path) -> Result<(), KeyRingError> {
        let data = std::fs::read(path).map_err(|e| KeyRingError::Armor(e.to_string()))?;
        self.load(&data)
    }

    /// Take a read guard over a ring whose web of trust is up to date.
    fn read_fresh(&self) -> RwLockReadGuard<'_, RingInner> {
        loop {
            {
                let guard = self.inner.read();
                if !guard.stale {
                    return guard;
                }
            }

            let mut guard = self.inner.write();
            if guard.stale {
                guard.rebuild_trust_web();
            }
        }
    }
}

impl RingInner {
    fn self_record_mut(&mut self) -> &mut KeyRecord {
        self.keys
            .entry(String::new())
            .or_insert_with(|| KeyRecord {
                trust: TrustLevel::ULTIMATE,
                effective: TrustLevel::ULTIMATE,
                ..Default::default()
            })
    }

    fn export_unsafe(&self, identity: &str) -> Result<String, KeyRingError> {
        let record = self
            .keys
            .get(identity)
            .ok_or_else(|| KeyRingError::UnknownIdentity(identity.to_string()))?;

        let mut public = record.public.clone();
        if identity.is_empty() {
            if let Some(secret) = &self.secret {
                public = secret.verifying_key().to_bytes().to_vec();
            }
        }

        let payload = PublicPayload {
            public: BASE64.encode(&public),
            signatures: record
                .signatures
                .iter()
                .map(|(signee, sig)| {
                    (
                        signee.clone(),
                        SignaturePayload {
                            data: BASE64.encode(&sig.data),
                            trust: sig.trust,
                        },
                    )
                })
                .collect(),
        };

        let data =
            serde_json::to_vec(&payload).map_err(|e| KeyRingError::Armor(e.to_string()))?;

        let mut block = Block::new(PUBLIC_BLOCK_TYPE, data);
        if !identity.is_empty() {
            block = block
                .with_header("identity", identity)
                .with_header("trust", &record.trust.to_string());
        }

        Ok(block.encode())
    }

    /// Construct the web of trust.
    ///
    /// Works as a greedy BFS over the signature graph: the queue only
    /// ever contains keys whose signatures can already be trusted, and
    /// processing them may promote further keys over the threshold.
    fn rebuild_trust_web(&mut self) {
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashMap<String, bool> = HashMap::new();

        self.self_record_mut().trust = TrustLevel::ULTIMATE;

        for (identity, record) in self.keys.iter_mut() {
            record.effective = record.trust;
            record.signed_by.clear();

            if record.trust >= TrustLevel::THRESHOLD {
                queue.push_back(identity.clone());
                visited.insert(identity.clone(), true);
            }
        }

        while let Some(current) = queue.pop_front() {
            let (signer_public, signer_effective, signatures) = {
                let record = &self.keys[&current];
                (
                    record.public.clone(),
                    record.effective,
                    record.signatures.clone(),
                )
            };

            for (signee, signature) in signatures {
                let Some(signee_record) = self.keys.get_mut(&signee) else {
                    continue;
                };

                // Discard forged signatures instead of letting them
                // inflate the signee's trust.
                let message = signature_message(&signee_record.public, signature.trust);
                if !raw_verify(&signer_public, &message, &signature.data) {
                    continue;
                }

                signee_record.effective = signee_record
                    .effective
                    .add(signature.trust.min(signer_effective));
                signee_record.signed_by.push(current.clone());

                if signee_record.effective >= TrustLevel::THRESHOLD
                    && !visited.get(&signee).copied().unwrap_or(false)
                {
                    queue.push_back(signee.clone());
                    visited.insert(signee.clone(), true);
                }
            }
        }

        self.stale = false;
    }
}

fn trusted_record(identity: &str, record: &KeyRecord) -> Result<(), KeyRingError> {
    if record.effective < TrustLevel::THRESHOLD {
        return Err(KeyRingError::InsufficientTrust {
            identity: identity.to_string(),
            level: record.effective,
        });
    }
    Ok(())
}

/// The message covered by a key signature.
fn signature_message(public: &[u8], trust: TrustLevel) -> Vec<u8> {
    let mut message = public.to_vec();
    message.push(trust.byte());
    message
}

/// Raw cryptographic check, without any trust-chain consideration.
fn raw_verify(public: &[u8], message: &[u8], signature: &[u8]) -> bool {
    if public.len() != PUBLIC_KEY_BYTES || signature.len() != SIGNATURE_BYTES {
        return false;
    }

    let public: [u8; 32] = public.try_into().expect("length checked");
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    verifying_key.verify(message, &signature).is_ok()
}

fn record_from_block(block: &Block) -> Result<KeyRecord, KeyRingError> {
    let payload: PublicPayload = serde_json::from_slice(&block.data)
        .map_err(|_| KeyRingError::InvalidSignature)?;

    let public = BASE64
        .decode(&payload.public)
        .map_err(|_| KeyRingError::InvalidPublicKey)?;
    if !public.is_empty() && public.len() != PUBLIC_KEY_BYTES {
        return Err(KeyRingError::InvalidPublicKey);
    }

    let mut signatures = BTreeMap::new();
    for (signee, sig) in payload.signatures {
        signatures.insert(
            signee,
            KeySignature {
                data: BASE64
                    .decode(&sig.data)
                    .map_err(|_| KeyRingError::InvalidSignature)?,
                trust: sig.trust,
            },
        );
    }

    let trust = block
        .header("trust")
        .unwrap_or("none")
        .parse::<TrustLevel>()
        .unwrap_or(TrustLevel::NONE);

    Ok(KeyRecord {
        public,
        trust,
        signatures,
        effective: TrustLevel::NONE,
        signed_by: Vec::new(),
    })
}

/// Derive a 32-byte symmetric key from a password and salt.
fn derive_key(password: &str, salt: &[u8]) -> Result<Vec<u8>, KeyRingError> {
    let mut key = vec![0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| KeyRingError::Armor(e.to_string()))?;
    Ok(key)
}

/// Human-friendly representation of a key: the last five bytes as
/// colon-separated hex.
pub fn fingerprint(data: &[u8]) -> String {
    if data.len() < 5 {
        return String::new();
    }

    data[data.len() - 5..]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
