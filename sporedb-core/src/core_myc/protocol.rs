/*
    protocol.rs - mycelium wire protocol

    Frame format:
    - 1 byte for function selection
    - n bytes for payload length specification (uvarint)
    - remaining bytes containing the payload

    Payloads are the canonical bincode form of the message. Unknown
    function codes and bad length prefixes terminate the stream.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core_consensus::{Catalog, Endorsement, RecoverRequest, Spore};
use crate::core_encoding::Timestamp;
use crate::core_version::Version;

use super::MycError;

/// Current version of the protocol. Two different versions are not
/// supposed to be able to communicate.
pub const PROTOCOL_VERSION: u64 = 1;

/// Maximum accepted payload length.
const MAX_PAYLOAD: u64 = 16 << 20;

/// Function codes of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Function {
    Hello = 0x01,
    Spore = 0x02,
    Endorse = 0x03,
    RecoverRequest = 0x04,
    Raw = 0x05,
    Gossip = 0x06,
    Nodes = 0x07,
    Catalog = 0x08,
}

impl TryFrom<u8> for Function {
    type Error = MycError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Function::Hello),
            0x02 => Ok(Function::Spore),
            0x03 => Ok(Function::Endorse),
            0x04 => Ok(Function::RecoverRequest),
            0x05 => Ok(Function::Raw),
            0x06 => Ok(Function::Gossip),
            0x07 => Ok(Function::Nodes),
            0x08 => Ok(Function::Catalog),
            other => Err(MycError::InvalidFunction(other)),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Function::Hello => "hello",
            Function::Spore => "spore",
            Function::Endorse => "endorse",
            Function::RecoverRequest => "recover",
            Function::Raw => "raw",
            Function::Gossip => "gossip",
            Function::Nodes => "nodes",
            Function::Catalog => "catalog",
        };
        write!(f, "{name}")
    }
}

/// Handshake message opening an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u64,
    pub identity: String,
    pub timestamp: Timestamp,
    /// Ephemeral Curve25519 public key, 32 bytes.
    pub public_key: Vec<u8>,
    /// Signature by the long-term key, over the message with this field
    /// cleared.
    pub signature: Vec<u8>,
}

impl Hello {
    /// The bytes covered by the handshake signature.
    pub fn signable_message(&self) -> Result<Vec<u8>, MycError> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        Ok(bincode::serialize(&unsigned)?)
    }
}

/// A node of the mycelium, as exchanged through membership gossip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub identity: String,
    pub address: String,
}

impl Node {
    pub fn new(identity: &str, address: &str) -> Self {
        Node {
            identity: identity.to_string(),
            address: address.to_string(),
        }
    }

    /// Whether two nodes designate the same participant, by address or by
    /// identity.
    pub fn matches(&self, other: &Node) -> bool {
        (!self.address.is_empty() && self.address == other.address)
            || (!self.identity.is_empty() && self.identity == other.identity)
    }

    pub fn is_zero(&self) -> bool {
        self.address.is_empty()
    }
}

/// Membership gossip: a sample of the sender's node directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nodes {
    pub nodes: Vec<Node>,
}

/// Spore gossip: either a proposal of recently seen spore uuids, or a
/// pull request for their raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gossip {
    pub spores: Vec<String>,
    pub request: bool,
}

/// Signed recovery payload carrying the current state of one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raw {
    pub key: String,
    pub version: Version,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Raw {
    /// The bytes covered by the issuer's signature.
    pub fn signable_message(&self) -> Result<Vec<u8>, MycError> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        Ok(bincode::serialize(&unsigned)?)
    }
}

/// A package that can be sent across the mycelium network.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Hello(Hello),
    Spore(Spore),
    Endorsement(Endorsement),
    RecoverRequest(RecoverRequest),
    Raw(Raw),
    Gossip(Gossip),
    Nodes(Nodes),
    Catalog(Catalog),
}

impl Call {
    pub fn function(&self) -> Function {
        match self {
            Call::Hello(_) => Function::Hello,
            Call::Spore(_) => Function::Spore,
            Call::Endorsement(_) => Function::Endorse,
            Call::RecoverRequest(_) => Function::RecoverRequest,
            Call::Raw(_) => Function::Raw,
            Call::Gossip(_) => Function::Gossip,
            Call::Nodes(_) => Function::Nodes,
            Call::Catalog(_) => Function::Catalog,
        }
    }

    /// Generate a ready-to-send frame for the call.
    pub fn pack(&self) -> Result<Vec<u8>, MycError> {
        let payload = match self {
            Call::Hello(m) => bincode::serialize(m),
            Call::Spore(m) => bincode::serialize(m),
            Call::Endorsement(m) => bincode::serialize(m),
            Call::RecoverRequest(m) => bincode::serialize(m),
            Call::Raw(m) => bincode::serialize(m),
            Call::Gossip(m) => bincode::serialize(m),
            Call::Nodes(m) => bincode::serialize(m),
            Call::Catalog(m) => bincode::serialize(m),
        }?;

        let mut frame = Vec::with_capacity(1 + 10 + payload.len());
        frame.push(self.function() as u8);
        put_uvarint(&mut frame, payload.len() as u64);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Retrieve one call from the raw stream.
    pub async fn unpack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Call, MycError> {
        let function = Function::try_from(reader.read_u8().await?)?;

        let length = read_uvarint(reader).await?;
        if length > MAX_PAYLOAD {
            return Err(MycError::FrameTooLarge(length));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        let call = match function {
            Function::Hello => Call::Hello(bincode::deserialize(&payload)?),
            Function::Spore => Call::Spore(bincode::deserialize(&payload)?),
            Function::Endorse => Call::Endorsement(bincode::deserialize(&payload)?),
            Function::RecoverRequest => Call::RecoverRequest(bincode::deserialize(&payload)?),
            Function::Raw => Call::Raw(bincode::deserialize(&payload)?),
            Function::Gossip => Call::Gossip(bincode::deserialize(&payload)?),
            Function::Nodes => Call::Nodes(bincode::deserialize(&payload)?),
            Function::Catalog => Call::Catalog(bincode::deserialize(&payload)?),
        };
        Ok(call)
    }
}

/// Append the uvarint form of `v` to the buffer.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Read one uvarint from the stream.
pub async fn read_uvarint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, MycError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    loop {
        let byte = reader.read_u8().await?;
        if shift == 63 && byte > 1 {
            return Err(MycError::FrameTooLarge(u64::MAX));
        }

        value |= u64::from(byte & 0x7f) << shift;
        if byte < 0x80 {
            return Ok(value);
        }

        shift += 7;
        if shift > 63 {
            return Err(MycError::FrameTooLarge(u64::MAX));
        }
    }
}
