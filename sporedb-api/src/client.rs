//! Typed client of the application endpoint.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use sporedb_core::core_version::Version;

use super::messages::{read_message, write_message, ApiRequest, ApiResponse, Transaction};
use super::ApiError;

/// Default per-request deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected SporeDB application client.
pub struct Client {
    stream: TcpStream,
    timeout: Duration,
}

impl Client {
    /// Connect to a SporeDB endpoint.
    pub async fn connect(address: &str) -> Result<Self, ApiError> {
        let stream = TcpStream::connect(address).await?;
        Ok(Client {
            stream,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the per-request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read the raw value of a key.
    pub async fn get(&mut self, key: &str) -> Result<(Vec<u8>, Version), ApiError> {
        match self.request(ApiRequest::Get { key: key.to_string() }).await? {
            ApiResponse::Value { data, version } => Ok((data, version)),
            other => Err(remote_or_unexpected(other)),
        }
    }

    /// Enumerate the members of a set key.
    pub async fn members(&mut self, key: &str) -> Result<(Vec<Vec<u8>>, Version), ApiError> {
        match self
            .request(ApiRequest::Members { key: key.to_string() })
            .await?
        {
            ApiResponse::Values { data, version } => Ok((data, version)),
            other => Err(remote_or_unexpected(other)),
        }
    }

    /// Whether a set key contains the given element.
    pub async fn contains(&mut self, key: &str, element: &[u8]) -> Result<bool, ApiError> {
        match self
            .request(ApiRequest::Contains {
                key: key.to_string(),
                element: element.to_vec(),
            })
            .await?
        {
            ApiResponse::Boolean { value } => Ok(value),
            other => Err(remote_or_unexpected(other)),
        }
    }

    /// Submit a transaction, returning the uuid of the wrapped spore.
    pub async fn submit(&mut self, transaction: Transaction) -> Result<String, ApiError> {
        match self.request(ApiRequest::Submit { transaction }).await? {
            ApiResponse::Receipt { uuid } => Ok(uuid),
            other => Err(remote_or_unexpected(other)),
        }
    }

    async fn request(&mut self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let exchange = async {
            write_message(&mut self.stream, &request).await?;
            read_message::<_, ApiResponse>(&mut self.stream).await
        };

        timeout(self.timeout, exchange)
            .await
            .map_err(|_| ApiError::Timeout)?
    }
}

fn remote_or_unexpected(response: ApiResponse) -> ApiError {
    match response {
        ApiResponse::Error { message } => ApiError::Remote(message),
        _ => ApiError::UnexpectedResponse,
    }
}
