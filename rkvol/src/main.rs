//! `rkvol` — vhost volume controller daemon.
//!
//! Loads the YAML configuration, connects to SPDK, registers with the
//! registry and serves controller requests over QUIC until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use libvolctl::backend::spdk::SpdkClient;
use libvolctl::config::{BackendConfig, CONFIG_ENV, TlsConfig};
use libvolctl::transport::client::QuicRegistryDialer;
use libvolctl::transport::server::RpcServer;
use libvolctl::{ControllerConfig, ControllerError};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rkvol", version, about = "vhost volume controller for SPDK")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Address of the RPC server, overrides `listen` from the configuration
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log as JSON lines instead of human-readable text
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

struct Tls {
    server: rustls::ServerConfig,
    client: rustls::ClientConfig,
}

fn load_tls(tls: &TlsConfig) -> Result<Tls> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certs = CertificateDer::pem_file_iter(&tls.cert)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .with_context(|| format!("read certificate {}", tls.cert.display()))?;
    let key = PrivateKeyDer::from_pem_file(&tls.key)
        .with_context(|| format!("read private key {}", tls.key.display()))?;
    let server = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("server certificate does not match its key")?;

    let mut roots = rustls::RootCertStore::empty();
    for ca in CertificateDer::pem_file_iter(&tls.ca)
        .with_context(|| format!("read CA {}", tls.ca.display()))?
    {
        roots.add(ca.with_context(|| format!("parse CA {}", tls.ca.display()))?)?;
    }
    let client = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Tls { server, client })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("load configuration {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }

    let tls = config.tls.as_ref().map(load_tls).transpose()?;

    let mut builder = config.builder();
    if let BackendConfig::Spdk { socket } = &config.backend {
        let client = SpdkClient::connect(socket.clone())
            .await
            .with_context(|| format!("connect to SPDK at {}", socket.display()))?;
        info!(socket = %socket.display(), "connected to SPDK");
        builder = builder.backend(Arc::new(client));
    }
    if !config.registry_address.is_empty() {
        let Some(tls) = &tls else {
            bail!("registry_address is set but no tls section is configured");
        };
        builder = builder.registry_dialer(Arc::new(QuicRegistryDialer::new(
            tls.client.clone(),
            config.registry_server_name(),
        )));
    }
    let controller = Arc::new(builder.build().context("invalid controller configuration")?);

    let server = match (config.listen, &tls) {
        (Some(addr), Some(tls)) => Some(RpcServer::new(
            addr,
            tls.server.clone(),
            Arc::clone(&controller),
        )?),
        (Some(_), None) => bail!("listen is set but no tls section is configured"),
        (None, _) => None,
    };

    controller.start().await?;
    info!(controller_id = controller.controller_id(), "controller started");

    let serve = async {
        match &server {
            Some(server) => server.serve().await,
            None => std::future::pending::<Result<(), ControllerError>>().await,
        }
    };
    let result = tokio::select! {
        res = serve => res.context("RPC server failed"),
        res = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            res.context("wait for interrupt")
        }
    };

    if let Some(server) = &server {
        server.close();
    }
    controller.stop().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flags() {
        let args = Args::try_parse_from([
            "rkvol",
            "--config",
            "/etc/rkvol/rkvol.yaml",
            "--listen",
            "0.0.0.0:7000",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/rkvol/rkvol.yaml")));
        assert_eq!(args.listen, Some("0.0.0.0:7000".parse().unwrap()));
        assert!(args.log_json);

        assert!(Args::try_parse_from(["rkvol", "--listen", "nowhere"]).is_err());
    }

    #[test]
    fn tls_files_must_exist() {
        let dir = std::env::temp_dir().join("rkvol-missing-tls");
        let err = load_tls(&TlsConfig {
            cert: dir.join("tls.crt"),
            key: dir.join("tls.key"),
            ca: dir.join("ca.crt"),
        })
        .err()
        .unwrap();
        assert!(err.to_string().contains("tls.crt"), "{err:#}");
    }
}
