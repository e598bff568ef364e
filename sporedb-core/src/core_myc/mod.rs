//! The SporeDB mycelium: peer membership, authenticated-encrypted
//! sessions, gossip-based broadcast with pull-on-demand, and recovery.

use thiserror::Error;

use crate::core_keyring::KeyRingError;

mod broadcast;
mod membership;
mod mycelium;
pub mod protocol;
mod recovery;
mod requests;
mod router;
mod secure;
pub mod session;
mod transport;

#[cfg(test)]
mod tests;

pub use mycelium::{Mycelium, MyceliumConfig, PeerCtx};
pub use protocol::{Call, Function, Gossip, Hello, Node, Nodes, Raw, PROTOCOL_VERSION};
pub use requests::RequestsContainer;
pub use secure::{SecureReader, SecureWriter};
pub use session::Session;

/// Errors raised by the overlay.
#[derive(Debug, Error)]
pub enum MycError {
    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid function: {0:#04x}")]
    InvalidFunction(u8),
    #[error("frame length out of bounds: {0}")]
    FrameTooLarge(u64),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("invalid hello message")]
    InvalidHello,
    #[error("session timestamp too old")]
    OldTimestamp,
    #[error("invalid session public key")]
    InvalidPublicKey,
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u64, theirs: u64 },
    #[error("handshake incomplete")]
    HandshakeIncomplete,
    #[error(transparent)]
    KeyRing(#[from] KeyRingError),
}

impl From<bincode::Error> for MycError {
    fn from(err: bincode::Error) -> Self {
        MycError::Serialization(err.to_string())
    }
}
