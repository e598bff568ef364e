//! Request/response contract of the application endpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sporedb_core::core_consensus::Operation;
use sporedb_core::core_version::Version;

use super::ApiError;

/// Maximum accepted message size.
const MAX_MESSAGE: u32 = 16 << 20;

/// A transaction submitted by an application, wrapped into a fresh spore
/// by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub policy: String,
    pub requirements: BTreeMap<String, Version>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiRequest {
    Get { key: String },
    Members { key: String },
    Contains { key: String, element: Vec<u8> },
    Submit { transaction: Transaction },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiResponse {
    Value {
        data: Vec<u8>,
        version: Version,
    },
    Values {
        data: Vec<Vec<u8>>,
        version: Version,
    },
    Boolean {
        value: bool,
    },
    Receipt {
        uuid: String,
    },
    Error {
        message: String,
    },
}

/// Write one length-prefixed message.
pub(crate) async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), ApiError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = bincode::serialize(message)?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
pub(crate) async fn read_message<R, M>(reader: &mut R) -> Result<M, ApiError>
where
    R: AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    let length = reader.read_u32().await?;
    if length > MAX_MESSAGE {
        return Err(ApiError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}
