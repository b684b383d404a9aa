//! QUIC client used by CSI drivers to talk to a volume controller, and by
//! the controller itself to write into the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use super::MAX_MESSAGE_SIZE;
use crate::error::ControllerError;
use crate::message::RpcMessage;
use crate::registration::{RegistryClient, RegistryDialer};
use crate::types::*;

/// Sends [`RpcMessage`] requests over a single QUIC connection and returns
/// the server's response.
pub struct RpcClient {
    connection: quinn::Connection,
}

impl RpcClient {
    /// Establish a new QUIC connection to the server at `addr`.
    ///
    /// * `server_name` — TLS SNI name that must match a SAN in the server's
    ///   certificate
    /// * `tls_config` — client TLS configuration trusting the server's CA
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, ControllerError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| ControllerError::TransportError(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let bind: SocketAddr = if addr.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = quinn::Endpoint::client(bind).map_err(ControllerError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(ControllerError::transport)?
            .await
            .map_err(ControllerError::transport)?;

        debug!(%addr, %server_name, "QUIC connection established");
        Ok(Self { connection })
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional QUIC stream, writes the
    /// JSON-serialized request, finishes the send side, then reads the
    /// full response and deserializes it.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &RpcMessage) -> Result<RpcMessage, ControllerError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(ControllerError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(ControllerError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(ControllerError::transport)?;
        send.finish().map_err(ControllerError::transport)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(ControllerError::transport)?;

        let response: RpcMessage =
            serde_json::from_slice(&buf).map_err(ControllerError::transport)?;
        debug!(%response, "response received");
        Ok(response)
    }

    /// Send a request that is answered with [`RpcMessage::Ok`].
    async fn expect_ok(&self, msg: RpcMessage) -> Result<(), ControllerError> {
        match self.request(&msg).await? {
            RpcMessage::Ok => Ok(()),
            RpcMessage::Error(e) => Err(e),
            other => Err(unexpected(&msg, &other)),
        }
    }

    pub async fn map_volume(
        &self,
        req: MapVolumeRequest,
    ) -> Result<MapVolumeReply, ControllerError> {
        let msg = RpcMessage::MapVolume(req);
        match self.request(&msg).await? {
            RpcMessage::VolumeMapped(reply) => Ok(reply),
            RpcMessage::Error(e) => Err(e),
            other => Err(unexpected(&msg, &other)),
        }
    }

    pub async fn unmap_volume(&self, volume_id: VolumeId) -> Result<(), ControllerError> {
        self.expect_ok(RpcMessage::UnmapVolume(volume_id)).await
    }

    pub async fn provision_malloc_bdev(
        &self,
        req: ProvisionMallocBDevRequest,
    ) -> Result<(), ControllerError> {
        self.expect_ok(RpcMessage::ProvisionMallocBDev(req)).await
    }

    pub async fn check_malloc_bdev(&self, bdev_name: &str) -> Result<(), ControllerError> {
        self.expect_ok(RpcMessage::CheckMallocBDev {
            bdev_name: bdev_name.to_owned(),
        })
        .await
    }

    /// Close the underlying QUIC connection gracefully.
    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}

fn unexpected(request: &RpcMessage, response: &RpcMessage) -> ControllerError {
    ControllerError::Internal(format!("unexpected response {response} to {request}"))
}

#[async_trait]
impl RegistryClient for RpcClient {
    async fn set_value(&self, path: &str, value: &str) -> Result<(), ControllerError> {
        self.expect_ok(RpcMessage::SetValue {
            path: path.to_owned(),
            value: value.to_owned(),
        })
        .await
    }

    fn close(&self) {
        RpcClient::close(self);
    }
}

/// Dials the registry over QUIC for every registration attempt.
#[derive(Clone)]
pub struct QuicRegistryDialer {
    tls: rustls::ClientConfig,
    server_name: String,
}

impl QuicRegistryDialer {
    pub fn new(tls: rustls::ClientConfig, server_name: impl Into<String>) -> Self {
        Self {
            tls,
            server_name: server_name.into(),
        }
    }
}

#[async_trait]
impl RegistryDialer for QuicRegistryDialer {
    async fn connect(&self, address: &str) -> Result<Box<dyn RegistryClient>, ControllerError> {
        let addr = tokio::net::lookup_host(address)
            .await
            .map_err(|e| ControllerError::TransportError(format!("resolve {address}: {e}")))?
            .next()
            .ok_or_else(|| {
                ControllerError::TransportError(format!("resolve {address}: no addresses"))
            })?;
        let client = RpcClient::connect(addr, &self.server_name, self.tls.clone()).await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BlockBackend;
    use crate::backend::memory::MemoryBackend;
    use crate::transport::server::RpcServer;
    use crate::vhost::Controller;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn tls_pair() -> (rustls::ServerConfig, rustls::ClientConfig) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let cert_der: CertificateDer<'static> = certified.cert.der().clone();
        let key_der =
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let server = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (server, client)
    }

    async fn serve_memory_controller() -> (Arc<RpcServer<Controller>>, SocketAddr, rustls::ClientConfig)
    {
        let (server_tls, client_tls) = tls_pair();
        let backend: Arc<dyn BlockBackend> = Arc::new(MemoryBackend::new(["vhost.0"]));
        let controller = Controller::builder()
            .backend(backend)
            .vhost_controller("vhost.0")
            .vhost_dev("00:15.0")
            .build()
            .unwrap();
        let server = Arc::new(
            RpcServer::new(
                "127.0.0.1:0".parse().unwrap(),
                server_tls,
                Arc::new(controller),
            )
            .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve().await });
        (server, addr, client_tls)
    }

    #[tokio::test]
    async fn volume_lifecycle_over_quic() {
        let (server, addr, client_tls) = serve_memory_controller().await;
        let client = RpcClient::connect(addr, "localhost", client_tls)
            .await
            .unwrap();

        client
            .provision_malloc_bdev(ProvisionMallocBDevRequest {
                bdev_name: "m0".into(),
                size: 1 << 20,
            })
            .await
            .unwrap();
        client.check_malloc_bdev("m0").await.unwrap();

        let reply = client
            .map_volume(MapVolumeRequest {
                volume_id: "m0".into(),
                params: Some(VolumeParams::Malloc),
            })
            .await
            .unwrap();
        assert_eq!(reply.pci_address.to_string(), "0000:00:15.0");
        assert_eq!(reply.scsi_disk, ScsiDisk { target: 0, lun: 0 });

        client.unmap_volume("m0".into()).await.unwrap();

        let err = client
            .provision_malloc_bdev(ProvisionMallocBDevRequest {
                bdev_name: "m0".into(),
                size: 2 << 20,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::AlreadyExists { actual_size, .. } if actual_size == 1 << 20
        ));

        let err = client.check_malloc_bdev("missing").await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)), "{err}");

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn controller_rejects_registry_writes() {
        let (server, addr, client_tls) = serve_memory_controller().await;
        let client = QuicRegistryDialer::new(client_tls, "localhost")
            .connect(&addr.to_string())
            .await
            .unwrap();

        let err = client
            .set_value("host-0/address", "10.0.0.1:7000")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidArgument(_)), "{err}");

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn dialer_reports_unresolvable_address() {
        let (_, client_tls) = tls_pair();
        let err = QuicRegistryDialer::new(client_tls, "localhost")
            .connect("not an address")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ControllerError::TransportError(_)), "{err}");
    }
}
