//! Stream-oriented transport, concretely TCP.
//!
//! Outbound binds reconnect with a bounded back-off; the overlay replays
//! the session handshake after every reconnect so the encrypted channel
//! is re-established transparently above the framed read/write API.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Initial delay between two outbound connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound of the reconnection back-off.
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// Delay between two handshake attempts over a live connection.
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Maximum duration of one handshake round-trip.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial a peer, retrying with back-off until the connection succeeds.
pub async fn connect_with_backoff(address: &str) -> TcpStream {
    let mut delay = RECONNECT_DELAY;

    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return stream;
            }
            Err(err) => {
                debug!(address, error = %err, "connection attempt failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_DELAY_MAX);
            }
        }
    }
}

/// Bind the inbound listener.
pub async fn listen(address: &str) -> std::io::Result<TcpListener> {
    TcpListener::bind(address).await
}
