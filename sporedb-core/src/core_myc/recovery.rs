/*
    recovery.rs - per-key quorum resync and full-catalog sync

    A recovery session collects signed Raw answers from trusted peers
    until enough identical versions are gathered, then writes the value
    through to the local store. A full sync asks one trusted peer for its
    whole (key, version) catalog and starts a per-key recovery for every
    divergence.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::core_consensus::{Catalog, RecoverRequest, INTERNAL_KEY_PREFIX};
use crate::core_encoding::Timestamp;
use crate::core_version::Version;

use super::mycelium::{Mycelium, PeerCtx};
use super::protocol::{Call, Raw};

/// Lifetime of a recovery session.
const RECOVERY_DEADLINE: Duration = Duration::from_secs(60);

/// An in-flight recovery for one key.
pub(super) struct Recovery {
    deadline: Timestamp,
    answers: HashMap<String, Raw>,
    quorum: usize,
    stale: bool,
}

impl Recovery {
    /// The answer shared by at least `quorum` distinct peers, if any.
    fn quorum_answer(&self) -> Option<&Raw> {
        let mut counts: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut answers: HashMap<Vec<u8>, &Raw> = HashMap::new();

        for raw in self.answers.values() {
            let id = raw.version.as_bytes().to_vec();
            *counts.entry(id.clone()).or_default() += 1;
            answers.insert(id, raw);
        }

        counts
            .into_iter()
            .find(|(_, count)| *count >= self.quorum)
            .and_then(|(id, _)| answers.remove(&id))
    }
}

impl Mycelium {
    /// Register a new recovery process for the specified key. The new
    /// value is trusted once at least `quorum` answers are identical.
    pub fn start_recovery(&self, key: &str, quorum: usize) {
        let mut recoveries = self.recoveries.lock();
        if recoveries.contains_key(key) {
            return;
        }

        let deadline = Timestamp::now().after(RECOVERY_DEADLINE);
        recoveries.insert(
            key.to_string(),
            Recovery {
                deadline,
                answers: HashMap::new(),
                quorum,
                stale: false,
            },
        );

        info!(key, quorum, "starting partial recovery");
    }

    /// Abort a recovery process for the specified key.
    pub fn stop_recovery(&self, key: &str) {
        let mut recoveries = self.recoveries.lock();
        if let Some(recovery) = recoveries.remove(key) {
            info!(
                key,
                quorum = recovery.quorum,
                answers = recovery.answers.len(),
                aborted = recovery.stale,
                "stopping partial recovery"
            );
        }
    }

    /// Register a recovery for one key and broadcast its request to the
    /// peers.
    pub fn recover(&self, key: &str) {
        self.start_recovery(key, self.config.recovery_quorum);
        self.broadcast(
            None,
            &Call::RecoverRequest(RecoverRequest {
                key: key.to_string(),
            }),
        );
    }

    /// Start a full state-transfer by asking a trusted connected peer
    /// for its catalog of (key, version) pairs.
    pub fn start_full_sync(&self, peer_identity: &str) {
        let mailbox = {
            let peers = self.peers.read();
            let Some(peer) = peers
                .iter()
                .find(|p| p.ready && p.node.identity == peer_identity)
            else {
                warn!(peer = peer_identity, "unable to find full state-transfer peer");
                return;
            };

            if !peer.trusted {
                warn!(peer = peer_identity, "untrusted full state-transfer peer");
                return;
            }

            peer.mailbox.clone()
        };

        let request = Call::RecoverRequest(RecoverRequest::default());
        match request.pack() {
            Ok(data) => {
                if mailbox.try_send(data).is_err() {
                    warn!(peer = peer_identity, "peer mailbox saturated, dropping frame");
                    return;
                }
            }
            Err(err) => {
                error!(error = %err, "unable to pack recovery request");
                return;
            }
        }

        *self.full_sync_peer.lock() = peer_identity.to_string();
        info!(peer = peer_identity, "asking for a full state-transfer");
    }

    /// Serve a recovery request: the full catalog for a blank key, a
    /// signed Raw payload otherwise. Only trusted peers are served.
    pub(super) fn handle_recover_request(&self, peer: &PeerCtx, request: RecoverRequest) {
        if !peer.trusted {
            return;
        }

        let call = if request.key.is_empty() {
            // Full-state-transfer request: send the catalog.
            match self.engine.catalog() {
                Ok(catalog) => {
                    info!(peer = %peer.node.identity, "sending catalog");
                    Call::Catalog(catalog)
                }
                Err(err) => {
                    error!(error = %err, "unable to send the catalog");
                    return;
                }
            }
        } else {
            let (data, version) = match self.engine.get(&request.key) {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(key = %request.key, error = %err, "unable to get key for recovery");
                    return;
                }
            };

            let mut raw = Raw {
                key: request.key.clone(),
                version,
                data,
                signature: Vec::new(),
            };

            let message = match raw.signable_message() {
                Ok(message) => message,
                Err(err) => {
                    error!(error = %err, "unable to marshal recovery payload");
                    return;
                }
            };
            match self.engine.keyring.sign(&message) {
                Ok(signature) => raw.signature = signature,
                Err(err) => {
                    error!(step = "recovery_proposal", error = %err, "unable to sign payload");
                    return;
                }
            }

            Call::Raw(raw)
        };

        match call.pack() {
            Ok(data) => self.send_to(&peer.node.address, data),
            Err(err) => error!(kind = %call.function(), error = %err, "unable to pack recovery response"),
        }
    }

    /// Register a signed recovery answer from a trusted peer.
    pub(super) fn handle_raw(&self, peer: &PeerCtx, raw: Raw) {
        if !peer.trusted {
            return;
        }

        let mut recoveries = self.recoveries.lock();
        let Some(recovery) = recoveries.get_mut(&raw.key) else {
            return;
        };

        // Verify the recovery timeout.
        if recovery.stale || recovery.deadline.is_past() {
            recovery.stale = true;
            warn!(key = %raw.key, "recovery expired");
            let key = raw.key.clone();
            drop(recoveries);
            self.stop_recovery(&key);
            return;
        }

        // Verify the version against the data.
        if !raw.key.starts_with(INTERNAL_KEY_PREFIX)
            && Version::of(&raw.data).matches(&raw.version).is_err()
        {
            warn!(key = %raw.key, emitter = %peer.node.identity, step = "version", "invalid recovery proposal");
            return;
        }

        // Verify the issuer's signature.
        let message = match raw.signable_message() {
            Ok(message) => message,
            Err(_) => return,
        };
        if let Err(err) =
            self.engine
                .keyring
                .verify(&peer.node.identity, &message, &raw.signature)
        {
            warn!(key = %raw.key, emitter = %peer.node.identity, step = "crypto", error = %err, "invalid recovery proposal");
            return;
        }

        let key = raw.key.clone();
        recovery.answers.insert(peer.node.identity.clone(), raw);

        let winner = if recovery.answers.len() >= recovery.quorum {
            recovery.quorum_answer().cloned()
        } else {
            None
        };
        drop(recoveries);

        if let Some(winner) = winner {
            if let Err(err) = self
                .engine
                .store
                .set(&winner.key, &winner.data, &winner.version)
            {
                error!(key = %winner.key, error = %err, "unable to write recovered value");
            }

            self.stop_recovery(&key);
        }
    }

    /// Process a catalog received from the full-sync peer: every
    /// diverging key starts its own recovery.
    pub(super) fn handle_catalog(&self, peer: &PeerCtx, catalog: Catalog) {
        {
            let mut full_sync_peer = self.full_sync_peer.lock();
            if peer.node.identity != *full_sync_peer || !peer.trusted {
                return;
            }
            full_sync_peer.clear();
        }

        for (key, version) in catalog.keys {
            let local = match self.engine.get(&key) {
                Ok((_, version)) => version,
                Err(_) => Version::NONE,
            };

            if version.matches(&local).is_err() {
                self.start_recovery(&key, self.config.recovery_quorum);
                self.broadcast(None, &Call::RecoverRequest(RecoverRequest { key }));
            }
        }
    }
}
