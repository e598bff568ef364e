/*
    mycelium.rs - the overlay network of nodes

    Keeps the peer list (live authenticated connections) and the node
    directory (known addresses, fed by membership gossip). Each peer has
    one outbound mailbox drained by a writer task and one reader task
    dispatching incoming calls; outbound connections are supervised and
    re-handshaked after every reconnect.
*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::core_consensus::{Engine, EngineMessage};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};

use super::protocol::{Call, Node};
use super::recovery::Recovery;
use super::requests::RequestsContainer;
use super::secure::{SecureReader, SecureWriter};
use super::session::Session;
use super::transport;
use super::MycError;

/// Capacity of each peer's outbound mailbox.
const MAILBOX_CAPACITY: usize = 64;

/// Configuration of the overlay.
#[derive(Debug, Clone)]
pub struct MyceliumConfig {
    /// Peer API listen address; empty disables inbound connections.
    pub listen: String,
    /// Bootstrap nodes. A connection is attempted for each entry.
    pub peers: Vec<Node>,
    /// Minimum identical answers required by a key recovery.
    pub recovery_quorum: usize,
    /// Target number of connected peers.
    pub connectivity: usize,
    /// Directory sample size of each membership broadcast.
    pub fanout: usize,
}

impl Default for MyceliumConfig {
    fn default() -> Self {
        MyceliumConfig {
            listen: String::new(),
            peers: Vec::new(),
            recovery_quorum: 2,
            connectivity: 10,
            fanout: 10,
        }
    }
}

/// A connected peer, as seen by the overlay.
pub(super) struct PeerEntry {
    pub(super) node: Node,
    pub(super) mailbox: mpsc::Sender<Vec<u8>>,
    pub(super) trusted: bool,
    pub(super) ready: bool,
}

/// Per-connection context handed to the message handlers.
#[derive(Debug, Clone)]
pub struct PeerCtx {
    pub node: Node,
    pub trusted: bool,
}

/// Outcome of one connection run.
enum ConnExit {
    /// The transport failed; an outbound peer should reconnect.
    Disconnected,
    /// The mailbox was closed; the peer is going away.
    Closed,
    /// The node is shutting down.
    Shutdown,
}

/// The local node's view of the SporeDB network.
pub struct Mycelium {
    pub engine: Arc<Engine>,
    pub(super) config: MyceliumConfig,
    pub(super) peers: RwLock<Vec<PeerEntry>>,
    pub(super) nodes: RwLock<Vec<Node>>,
    pub(super) requests: RequestsContainer,
    pub(super) recoveries: Mutex<HashMap<String, Recovery>>,
    pub(super) full_sync_peer: Mutex<String>,
    pub(super) shutdown: ShutdownCoordinator,
}

impl Mycelium {
    /// Set up the overlay: inbound listener, consensus broadcaster and
    /// membership loops. Bootstrap connections are attempted by the
    /// connector loop.
    pub async fn start(
        engine: Arc<Engine>,
        messages: mpsc::Receiver<EngineMessage>,
        config: MyceliumConfig,
        shutdown: ShutdownCoordinator,
    ) -> Result<Arc<Mycelium>, MycError> {
        let nodes = config.peers.clone();

        let mycelium = Arc::new(Mycelium {
            engine,
            config,
            peers: RwLock::new(Vec::new()),
            nodes: RwLock::new(nodes),
            requests: RequestsContainer::new(),
            recoveries: Mutex::new(HashMap::new()),
            full_sync_peer: Mutex::new(String::new()),
            shutdown,
        });

        if !mycelium.config.listen.is_empty() {
            let listener = transport::listen(&mycelium.config.listen).await?;
            info!(kind = "P2P", address = %mycelium.config.listen, "listening");
            tokio::spawn(Arc::clone(&mycelium).accept_loop(listener));
        }

        tokio::spawn(Arc::clone(&mycelium).broadcaster(messages));
        tokio::spawn(Arc::clone(&mycelium).membership_connector());
        tokio::spawn(Arc::clone(&mycelium).membership_broadcaster());

        Ok(mycelium)
    }

    /// Bind the mycelium to a specific peer. The connection is
    /// supervised: it is re-established and re-handshaked after any
    /// disconnection.
    pub fn bind(self: &Arc<Self>, node: Node) {
        let rx = {
            let mut peers = self.peers.write();
            if peers.iter().any(|p| p.node.address == node.address) {
                return; // already bound
            }

            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            peers.push(PeerEntry {
                node: node.clone(),
                mailbox: tx,
                trusted: false,
                ready: false,
            });
            rx
        };

        tokio::spawn(Arc::clone(self).outbound_supervisor(node, rx));
    }

    /// Number of ready peer connections.
    pub fn peer_count(&self) -> usize {
        self.peers.read().iter().filter(|p| p.ready).count()
    }

    /// Identities of the currently connected, ready peers.
    pub fn members(&self) -> Vec<Node> {
        self.peers
            .read()
            .iter()
            .filter(|p| p.ready)
            .map(|p| p.node.clone())
            .collect()
    }

    /// Ask every task of the overlay to terminate.
    pub fn close(&self) {
        self.shutdown.shutdown();
    }

    async fn outbound_supervisor(
        self: Arc<Self>,
        node: Node,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let stream = tokio::select! {
                stream = transport::connect_with_backoff(&node.address) => stream,
                _ = shutdown_rx.recv() => break,
            };

            let handshake = tokio::time::timeout(
                transport::HANDSHAKE_TIMEOUT,
                self.client_handshake(stream, &node.address),
            )
            .await;

            match handshake {
                Ok(Ok((peer, reader, writer))) => {
                    self.mark_ready(&node.address, &peer);
                    info!(
                        mode = "client",
                        address = %node.address,
                        identity = %peer.node.identity,
                        trusted = peer.trusted,
                        "handshake"
                    );

                    let exit = self
                        .run_connection(peer, reader, writer, &mut rx, &mut shutdown_rx)
                        .await;
                    self.mark_not_ready(&node.address);

                    match exit {
                        ConnExit::Disconnected => continue, // reconnect + replay handshake
                        ConnExit::Closed | ConnExit::Shutdown => break,
                    }
                }
                Ok(Err(err)) => {
                    warn!(address = %node.address, error = %err, "handshake failure");
                    tokio::time::sleep(transport::HANDSHAKE_RETRY_DELAY).await;
                }
                Err(_) => {
                    warn!(address = %node.address, "handshake timeout");
                }
            }
        }

        self.remove_peer(&node.address);
    }

    /// Client side of the Hello round-trip: send ours, verify theirs,
    /// open the encrypted channel.
    async fn client_handshake(
        &self,
        mut stream: TcpStream,
        address: &str,
    ) -> Result<
        (
            PeerCtx,
            SecureReader<OwnedReadHalf>,
            SecureWriter<OwnedWriteHalf>,
        ),
        MycError,
    > {
        use tokio::io::AsyncWriteExt;

        let mut session = Session::new(Arc::clone(&self.engine.keyring), &self.engine.identity);

        let hello = session.hello()?;
        stream.write_all(&Call::Hello(hello).pack()?).await?;

        let Call::Hello(peer_hello) = Call::unpack(&mut stream).await? else {
            return Err(MycError::InvalidHello);
        };
        session.verify(&peer_hello)?;

        let (read_cipher, write_cipher) = session.open()?;
        let (read_half, write_half) = stream.into_split();

        Ok((
            PeerCtx {
                node: Node::new(&peer_hello.identity, address),
                trusted: session.is_trusted(),
            },
            SecureReader::new(read_half, read_cipher),
            SecureWriter::new(write_half, write_cipher),
        ))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(Arc::clone(&self).inbound_connection(stream, address));
                    }
                    Err(err) => {
                        warn!(error = %err, "unable to accept connection");
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Server side of an incoming connection: wait for the peer's Hello,
    /// answer with ours, then serve the session until disconnection.
    async fn inbound_connection(self: Arc<Self>, mut stream: TcpStream, address: SocketAddr) {
        use tokio::io::AsyncWriteExt;

        let handshake = tokio::time::timeout(transport::HANDSHAKE_TIMEOUT, async {
            let Call::Hello(peer_hello) = Call::unpack(&mut stream).await? else {
                return Err(MycError::InvalidHello);
            };

            let mut session =
                Session::new(Arc::clone(&self.engine.keyring), &self.engine.identity);
            session.verify(&peer_hello)?;

            let hello = session.hello()?;
            stream.write_all(&Call::Hello(hello).pack()?).await?;
            Ok((peer_hello, session))
        })
        .await;

        let (peer_hello, session) = match handshake {
            Ok(Ok(parts)) => parts,
            Ok(Err(err)) => {
                warn!(address = %address, error = %err, "inbound handshake rejected");
                return;
            }
            Err(_) => {
                warn!(address = %address, "inbound handshake timeout");
                return;
            }
        };

        let Ok((read_cipher, write_cipher)) = session.open() else {
            return;
        };

        let node = Node::new(&peer_hello.identity, &address.to_string());
        let peer = PeerCtx {
            node: node.clone(),
            trusted: session.is_trusted(),
        };

        let mut rx = {
            let mut peers = self.peers.write();
            if peers.iter().any(|p| p.node.address == node.address) {
                return; // already bound
            }

            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            peers.push(PeerEntry {
                node: node.clone(),
                mailbox: tx,
                trusted: peer.trusted,
                ready: true,
            });
            rx
        };

        info!(
            mode = "server",
            address = %node.address,
            identity = %node.identity,
            trusted = peer.trusted,
            "handshake"
        );

        let (read_half, write_half) = stream.into_split();
        let reader = SecureReader::new(read_half, read_cipher);
        let writer = SecureWriter::new(write_half, write_cipher);

        let mut shutdown_rx = self.shutdown.subscribe();
        let _ = self
            .run_connection(peer, reader, writer, &mut rx, &mut shutdown_rx)
            .await;

        self.remove_peer(&node.address);
    }

    /// Serve one live connection: a reader task dispatches incoming
    /// calls while the mailbox is drained into the encrypted writer.
    async fn run_connection(
        self: &Arc<Self>,
        peer: PeerCtx,
        reader: SecureReader<OwnedReadHalf>,
        mut writer: SecureWriter<OwnedWriteHalf>,
        rx: &mut mpsc::Receiver<Vec<u8>>,
        shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>,
    ) -> ConnExit {
        let mut read_task = tokio::spawn(Arc::clone(self).reader_loop(reader, peer));

        let exit = loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(data) => {
                        if writer.write_frame(&data).await.is_err() {
                            break ConnExit::Disconnected;
                        }
                    }
                    None => break ConnExit::Closed,
                },
                _ = &mut read_task => break ConnExit::Disconnected,
                _ = shutdown_rx.recv() => break ConnExit::Shutdown,
            }
        };

        read_task.abort();
        exit
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut reader: SecureReader<OwnedReadHalf>,
        peer: PeerCtx,
    ) {
        loop {
            match Call::unpack(&mut reader).await {
                Ok(call) => self.dispatch(&peer, call).await,
                Err(err) => {
                    // Unknown codes and transport failures both
                    // terminate the stream.
                    tracing::debug!(
                        address = %peer.node.address,
                        error = %err,
                        "peer stream terminated"
                    );
                    return;
                }
            }
        }
    }

    /// The outbound mailbox of a connected peer.
    pub(super) fn peer_mailbox(&self, address: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.peers
            .read()
            .iter()
            .find(|p| p.node.address == address)
            .map(|p| p.mailbox.clone())
    }

    /// Enqueue one packed frame to a peer, dropping it when the mailbox
    /// is saturated.
    pub(super) fn send_to(&self, address: &str, data: Vec<u8>) {
        if let Some(mailbox) = self.peer_mailbox(address) {
            if mailbox.try_send(data).is_err() {
                warn!(address, "peer mailbox saturated, dropping frame");
            }
        }
    }

    fn mark_ready(&self, address: &str, peer: &PeerCtx) {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.iter_mut().find(|p| p.node.address == address) {
            entry.node.identity = peer.node.identity.clone();
            entry.trusted = peer.trusted;
            entry.ready = true;
        }
    }

    fn mark_not_ready(&self, address: &str) {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.iter_mut().find(|p| p.node.address == address) {
            entry.ready = false;
        }
    }

    fn remove_peer(&self, address: &str) {
        self.peers.write().retain(|p| p.node.address != address);
    }
}
