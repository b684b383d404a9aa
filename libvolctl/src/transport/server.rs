//! QUIC server that runs next to SPDK and dispatches incoming requests to a
//! [`VolumeController`].

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use super::MAX_MESSAGE_SIZE;
use crate::controller::VolumeController;
use crate::error::ControllerError;
use crate::message::RpcMessage;

/// Accepts QUIC connections and dispatches [`RpcMessage`] requests to a
/// [`VolumeController`] implementation.
pub struct RpcServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
}

impl<T> RpcServer<T>
where
    T: VolumeController + 'static,
{
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, ControllerError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| ControllerError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint =
            quinn::Endpoint::server(server_config, addr).map_err(ControllerError::transport)?;
        info!(addr = ?endpoint.local_addr().ok(), "controller QUIC server listening");
        Ok(Self { endpoint, handler })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), ControllerError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler).await {
                            warn!(%remote, error = %e, "connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(
        conn: quinn::Connection,
        handler: Arc<T>,
    ) -> Result<(), ControllerError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
                Err(e) => return Err(ControllerError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler).await {
                    error!(error = %e, "stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
    ) -> Result<(), ControllerError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(ControllerError::transport)?;

        let response = match serde_json::from_slice::<RpcMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "request received");
                Self::dispatch(handler, request).await
            }
            Err(e) => RpcMessage::Error(ControllerError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(ControllerError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(ControllerError::transport)?;
        send.finish().map_err(ControllerError::transport)?;
        Ok(())
    }

    /// Map a request to the controller call and wrap the result in a
    /// response.
    async fn dispatch(handler: &T, request: RpcMessage) -> RpcMessage {
        let result = match request {
            RpcMessage::MapVolume(req) => handler.map_volume(req).await.map(RpcMessage::VolumeMapped),
            RpcMessage::UnmapVolume(id) => handler.unmap_volume(&id).await.map(|()| RpcMessage::Ok),
            RpcMessage::ProvisionMallocBDev(req) => handler
                .provision_malloc_bdev(req)
                .await
                .map(|()| RpcMessage::Ok),
            RpcMessage::CheckMallocBDev { bdev_name } => handler
                .check_malloc_bdev(&bdev_name)
                .await
                .map(|()| RpcMessage::Ok),

            // Registry writes and responses never arrive as controller requests.
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                Err(ControllerError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        };
        result.unwrap_or_else(RpcMessage::Error)
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ControllerError> {
        self.endpoint.local_addr().map_err(ControllerError::transport)
    }

    /// Stop accepting connections; [`Self::serve`] returns afterwards.
    pub fn close(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
    }
}
