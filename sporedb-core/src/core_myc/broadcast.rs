//! Outbound fan-out of consensus messages.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::core_consensus::EngineMessage;

use super::mycelium::Mycelium;
use super::protocol::{Call, Node};

impl Mycelium {
    /// Send a protocol call to every ready peer. If `from` is provided,
    /// no message is re-sent to that peer. Returns the number of peers
    /// the call was enqueued to.
    pub fn broadcast(&self, from: Option<&Node>, call: &Call) -> usize {
        let data = match call.pack() {
            Ok(data) => data,
            Err(err) => {
                error!(kind = %call.function(), step = "broadcast", error = %err, "unable to pack message");
                return 0;
            }
        };

        // Cache spore bytes for the gossip pull service.
        if let Call::Spore(spore) = call {
            self.requests.set_delivered(&spore.uuid, data.clone());
        }

        let peers = self.peers.read();
        let mut sent = 0;

        for peer in peers.iter() {
            if !peer.ready {
                continue;
            }
            if let Some(from) = from {
                if peer.node.address == from.address {
                    continue; // do not re-send to the originating peer
                }
            }

            if peer.mailbox.try_send(data.clone()).is_ok() {
                sent += 1;
            } else {
                warn!(address = %peer.node.address, "peer mailbox saturated, dropping frame");
            }
        }

        sent
    }

    /// Drain the engine's output channel into the overlay.
    pub(super) async fn broadcaster(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<EngineMessage>,
    ) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(EngineMessage::Spore(spore)) => {
                        self.broadcast(None, &Call::Spore(spore));
                    }
                    Some(EngineMessage::Endorsement(endorsement)) => {
                        self.broadcast(None, &Call::Endorsement(endorsement));
                    }
                    Some(EngineMessage::Recover(request)) => {
                        self.start_recovery(&request.key, self.config.recovery_quorum);
                        self.broadcast(None, &Call::RecoverRequest(request));
                    }
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}
