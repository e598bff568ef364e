//! Server side of the application endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use sporedb_core::core_consensus::Engine;
use sporedb_core::core_encoding::Set;
use sporedb_core::core_consensus::Spore;
use sporedb_core::shutdown::ShutdownCoordinator;

use super::messages::{read_message, write_message, ApiRequest, ApiResponse, Transaction};
use super::ApiError;

/// Deadline given to submitted transactions.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// The SporeDB endpoint serving applications.
pub struct ApiServer {
    engine: Arc<Engine>,
}

impl ApiServer {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(ApiServer { engine })
    }

    /// Accept and serve client connections until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listen: &str,
        shutdown: ShutdownCoordinator,
    ) -> Result<(), ApiError> {
        let listener = TcpListener::bind(listen).await?;
        info!(kind = "API", address = listen, "listening");

        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        debug!(address = %address, "client connected");
                        tokio::spawn(Arc::clone(&self).serve_connection(stream));
                    }
                    Err(err) => warn!(error = %err, "unable to accept client"),
                },
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let request: ApiRequest = match read_message(&mut stream).await {
                Ok(request) => request,
                Err(_) => return, // disconnected or malformed stream
            };

            let response = self.handle(request).await;
            if write_message(&mut stream, &response).await.is_err() {
                return;
            }
        }
    }

    /// Dispatch one request against the engine.
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        match request {
            ApiRequest::Get { key } => match self.engine.get(&key) {
                Ok((data, version)) => ApiResponse::Value { data, version },
                Err(err) => ApiResponse::Error {
                    message: err.to_string(),
                },
            },

            ApiRequest::Members { key } => match self.members(&key) {
                Ok(response) => response,
                Err(message) => ApiResponse::Error { message },
            },

            ApiRequest::Contains { key, element } => match self.engine.get(&key) {
                Ok((data, _)) => match Set::from_bytes(&data) {
                    Ok(set) => ApiResponse::Boolean {
                        value: set.contains(&element),
                    },
                    Err(err) => ApiResponse::Error {
                        message: err.to_string(),
                    },
                },
                Err(err) => ApiResponse::Error {
                    message: err.to_string(),
                },
            },

            ApiRequest::Submit { transaction } => self.submit(transaction).await,
        }
    }

    fn members(&self, key: &str) -> Result<ApiResponse, String> {
        let (data, version) = self.engine.get(key).map_err(|e| e.to_string())?;
        let set = Set::from_bytes(&data).map_err(|e| e.to_string())?;

        Ok(ApiResponse::Values {
            data: set.elements().iter().map(|e| e.to_vec()).collect(),
            version,
        })
    }

    async fn submit(&self, transaction: Transaction) -> ApiResponse {
        let mut spore = Spore::new(&transaction.policy);
        spore.requirements = transaction.requirements;
        spore.operations = transaction.operations;
        spore.set_timeout(SUBMIT_TIMEOUT);

        let uuid = spore.uuid.clone();
        match self.engine.submit(spore).await {
            Ok(()) => ApiResponse::Receipt { uuid },
            Err(err) => ApiResponse::Error {
                message: err.to_string(),
            },
        }
    }
}
