//! Errors of the application endpoint.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("message length out of bounds: {0}")]
    MessageTooLarge(u32),
    #[error("request timed out")]
    Timeout,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("unexpected response kind")]
    UnexpectedResponse,
}

impl From<bincode::Error> for ApiError {
    fn from(err: bincode::Error) -> Self {
        ApiError::Serialization(err.to_string())
    }
}
