//! Incoming call dispatch.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core_consensus::{ConsensusError, Endorsement, Spore};

use super::mycelium::{Mycelium, PeerCtx};
use super::protocol::{Call, Gossip};

/// Endorsements for spores not yet known locally are retried while the
/// gossip pull catches up.
const ENDORSEMENT_RETRIES: usize = 20;
const ENDORSEMENT_RETRY_DELAY: Duration = Duration::from_millis(100);

impl Mycelium {
    /// Route one incoming call to its handler. Handlers run on their own
    /// tasks so a slow one never stalls the peer's reader.
    pub(super) async fn dispatch(self: &Arc<Self>, peer: &PeerCtx, call: Call) {
        debug!(
            kind = %call.function(),
            address = %peer.node.address,
            identity = %peer.node.identity,
            "P2P"
        );

        let mycelium = Arc::clone(self);
        let peer = peer.clone();

        match call {
            Call::Spore(spore) => {
                tokio::spawn(async move { mycelium.handle_spore(&peer, spore).await });
            }
            Call::Endorsement(endorsement) => {
                tokio::spawn(async move { mycelium.handle_endorsement(&peer, endorsement).await });
            }
            Call::Gossip(gossip) => {
                tokio::spawn(async move {
                    if gossip.request {
                        mycelium.handle_gossip_request(&peer, gossip);
                    } else {
                        mycelium.handle_gossip_proposal(&peer, gossip);
                    }
                });
            }
            Call::RecoverRequest(request) => {
                tokio::spawn(async move { mycelium.handle_recover_request(&peer, request) });
            }
            Call::Raw(raw) => {
                tokio::spawn(async move { mycelium.handle_raw(&peer, raw) });
            }
            Call::Catalog(catalog) => {
                tokio::spawn(async move { mycelium.handle_catalog(&peer, catalog) });
            }
            Call::Nodes(nodes) => {
                tokio::spawn(async move { mycelium.handle_nodes(&peer, nodes) });
            }
            Call::Hello(_) => {
                // Handshake already completed on this session.
                debug!(address = %peer.node.address, "unexpected hello ignored");
            }
        }
    }

    /// A spore received from a peer: replay the endorsement validation,
    /// then gossip its availability onwards.
    async fn handle_spore(self: &Arc<Self>, peer: &PeerCtx, spore: Spore) {
        let uuid = spore.uuid.clone();

        match self.engine.endorse(spore.clone()).await {
            Ok(()) => {
                match Call::Spore(spore).pack() {
                    Ok(data) => self.requests.set_delivered(&uuid, data),
                    Err(err) => {
                        warn!(step = "handle_spore", error = %err, "unable to pack message");
                    }
                }

                self.broadcast(
                    Some(&peer.node),
                    &Call::Gossip(Gossip {
                        spores: vec![uuid],
                        request: false,
                    }),
                );
            }
            Err(err) => {
                debug!(uuid = %uuid, error = %err, "spore not endorsed");
            }
        }
    }

    /// An endorsement received from a peer. The related spore may still
    /// be in flight, in which case registration is retried with a fixed
    /// back-off.
    async fn handle_endorsement(self: &Arc<Self>, peer: &PeerCtx, endorsement: Endorsement) {
        for _ in 0..ENDORSEMENT_RETRIES {
            match self.engine.add_endorsement(&endorsement) {
                Ok(()) => {
                    self.broadcast(Some(&peer.node), &Call::Endorsement(endorsement));
                    return;
                }
                Err(ConsensusError::NoRelatedSpore) => {
                    tokio::time::sleep(ENDORSEMENT_RETRY_DELAY).await;
                }
                Err(err) => {
                    debug!(uuid = %endorsement.uuid, error = %err, "endorsement dropped");
                    return;
                }
            }
        }

        debug!(uuid = %endorsement.uuid, "endorsement dropped after retries");
    }

    /// A gossip proposal: ask the sender for the spores we have not seen
    /// yet.
    pub(super) fn handle_gossip_proposal(&self, peer: &PeerCtx, gossip: Gossip) {
        let mut wanted = Vec::new();

        for uuid in gossip.spores {
            if self.requests.is_delivered(&uuid) {
                continue;
            }
            if self.requests.add(&uuid, &peer.node) {
                wanted.push(uuid);
            }
        }

        if wanted.is_empty() {
            return;
        }

        let request = Call::Gossip(Gossip {
            spores: wanted,
            request: true,
        });
        match request.pack() {
            Ok(data) => self.send_to(&peer.node.address, data),
            Err(err) => warn!(step = "gossip_request", error = %err, "unable to pack message"),
        }
    }

    /// A gossip request: replay the cached bytes of delivered spores.
    pub(super) fn handle_gossip_request(&self, peer: &PeerCtx, gossip: Gossip) {
        for uuid in gossip.spores {
            match self.requests.delivered(&uuid) {
                Some(data) => self.send_to(&peer.node.address, data),
                None => warn!(uuid = %uuid, "gossip miss"),
            }
        }
    }
}
