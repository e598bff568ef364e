//! Membership maintenance: connector and directory gossip.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::debug;

use super::mycelium::{Mycelium, PeerCtx};
use super::protocol::{Call, Node, Nodes};

/// Pause after a connection attempt.
const CONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Pause when the connectivity target is satisfied or no node is
/// available.
const CONNECT_IDLE: Duration = Duration::from_secs(10);

/// Period of the membership gossip.
const GOSSIP_PERIOD: Duration = Duration::from_secs(10);

impl Mycelium {
    /// Ensure the local node stays bound to enough peers. The node
    /// directory is fed by connected peers through membership gossip.
    pub(super) async fn membership_connector(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let node_to_bind = {
                let peers = self.peers.read();
                if peers.len() < self.config.connectivity {
                    let nodes = self.nodes.read();
                    let candidates: Vec<Node> = nodes
                        .iter()
                        .filter(|node| !peers.iter().any(|p| p.node.matches(node)))
                        .cloned()
                        .collect();
                    candidates.choose(&mut rand::thread_rng()).cloned()
                } else {
                    None
                }
            };

            let pause = match node_to_bind {
                Some(node) => {
                    debug!(address = %node.address, "binding to node");
                    self.bind(node);
                    CONNECT_PAUSE
                }
                None => CONNECT_IDLE, // target reached or no node available
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Periodically gossip a random sample of the node directory to
    /// every peer.
    pub(super) async fn membership_broadcaster(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(GOSSIP_PERIOD);
        ticker.tick().await; // the first tick is immediate

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = {
                        let nodes = self.nodes.read();
                        let mut sample: Vec<Node> = nodes.clone();
                        sample.shuffle(&mut rand::thread_rng());
                        sample.truncate(self.config.fanout);
                        sample
                    };

                    if !sample.is_empty() {
                        self.broadcast(None, &Call::Nodes(Nodes { nodes: sample }));
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Merge a membership sample received from a trusted peer into the
    /// node directory: known identities are re-addressed, known
    /// addresses re-identified, everything else is appended.
    pub(super) fn handle_nodes(&self, peer: &PeerCtx, incoming: Nodes) {
        if !peer.trusted {
            return;
        }

        let peers = self.peers.read();
        let mut nodes = self.nodes.write();

        for node in incoming.nodes {
            if node.is_zero() {
                continue;
            }

            // Not ourselves, not an already-connected peer.
            if node.address == self.config.listen || node.identity == self.engine.identity {
                continue;
            }
            if peers.iter().any(|p| p.node.matches(&node)) {
                continue;
            }

            if !node.identity.is_empty() {
                if let Some(known) = nodes
                    .iter_mut()
                    .find(|known| known.identity == node.identity)
                {
                    known.address = node.address;
                    continue;
                }
            }

            if let Some(known) = nodes.iter_mut().find(|known| known.address == node.address) {
                known.identity = node.identity;
                continue;
            }

            debug!(address = %node.address, identity = %node.identity, "node discovered");
            nodes.push(node);
        }
    }
}
