//! SporeDB application endpoint.
//!
//! Applications submit transactions and read values through a small
//! framed request/response protocol: each message is a 4-byte big-endian
//! length prefix followed by its canonical binary payload.

mod client;
mod error;
mod messages;
mod server;

pub use client::Client;
pub use error::ApiError;
pub use messages::{ApiRequest, ApiResponse, Transaction};
pub use server::ApiServer;
