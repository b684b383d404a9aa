//! File-based controller configuration.
//!
//! The daemon reads one YAML document:
//!
//! ```yaml
//! registry_address: registry.example:8999
//! registry_delay: 1m
//! controller_id: host-0
//! controller_address: 10.0.0.1:7000
//! backend:
//!   kind: spdk
//!   socket: /var/tmp/spdk.sock
//! vhost_controller: vhost.0
//! vhost_dev: "0000:00:15.0"
//! listen: 0.0.0.0:7000
//! tls:
//!   cert: /etc/rkvol/tls.crt
//!   key: /etc/rkvol/tls.key
//!   ca: /etc/rkvol/ca.crt
//! ```
//!
//! Every field is optional and falls back to the [`ControllerBuilder`]
//! default.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::memory::MemoryBackend;
use crate::error::ControllerError;
use crate::vhost::{
    Controller, ControllerBuilder, DEFAULT_CONTROLLER_ID, DEFAULT_MAX_SCSI_TARGETS,
    DEFAULT_REGISTRY_DELAY,
};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "RKVOL_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Empty disables registration.
    pub registry_address: String,
    #[serde(with = "humantime_duration")]
    pub registry_delay: Duration,
    /// TLS name of the registry; the host part of `registry_address` when
    /// unset.
    pub registry_server_name: Option<String>,
    pub controller_id: String,
    pub controller_address: String,
    pub backend: BackendConfig,
    pub vhost_controller: String,
    pub vhost_dev: Option<String>,
    pub max_scsi_targets: u32,
    /// Where the RPC server listens.
    pub listen: Option<SocketAddr>,
    pub tls: Option<TlsConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            registry_address: String::new(),
            registry_delay: DEFAULT_REGISTRY_DELAY,
            registry_server_name: None,
            controller_id: DEFAULT_CONTROLLER_ID.to_owned(),
            controller_address: String::new(),
            backend: BackendConfig::None,
            vhost_controller: String::new(),
            vhost_dev: None,
            max_scsi_targets: DEFAULT_MAX_SCSI_TARGETS,
            listen: None,
            tls: None,
        }
    }
}

/// Which block backend the controller drives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// No backend; every operation fails with `NotConnected`.
    #[default]
    None,
    /// SPDK JSON-RPC socket.
    Spdk { socket: PathBuf },
    /// In-memory emulation with the named vhost SCSI controllers.
    Memory { controllers: Vec<String> },
}

/// PEM files for the QUIC endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Certificate chain presented by the RPC server.
    pub cert: PathBuf,
    /// Private key of `cert`.
    pub key: PathBuf,
    /// CA that signed the registry's certificate.
    pub ca: PathBuf,
}

impl ControllerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ControllerError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| ControllerError::InvalidArgument(format!("invalid configuration: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ControllerError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::InvalidArgument(format!("read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    /// TLS name to expect from the registry.
    pub fn registry_server_name(&self) -> &str {
        match &self.registry_server_name {
            Some(name) => name,
            None => self
                .registry_address
                .rsplit_once(':')
                .map_or(self.registry_address.as_str(), |(host, _)| host)
                .trim_start_matches('[')
                .trim_end_matches(']'),
        }
    }

    /// Builder carrying every setting of this file.  The registry dialer is
    /// left to the caller.
    pub fn builder(&self) -> ControllerBuilder {
        let mut builder = Controller::builder()
            .registry(self.registry_address.clone())
            .registry_delay(self.registry_delay)
            .controller_id(self.controller_id.clone())
            .controller_address(self.controller_address.clone())
            .vhost_controller(self.vhost_controller.clone())
            .max_scsi_targets(self.max_scsi_targets);
        if let Some(dev) = &self.vhost_dev {
            builder = builder.vhost_dev(dev.clone());
        }
        match &self.backend {
            BackendConfig::None => builder,
            BackendConfig::Spdk { socket } => builder.spdk(socket.clone()),
            BackendConfig::Memory { controllers } => {
                builder.backend(Arc::new(MemoryBackend::new(controllers.iter().cloned())))
            }
        }
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::VolumeController;

    #[test]
    fn full_document() {
        let config = ControllerConfig::from_yaml(
            r#"
registry_address: registry.example:8999
registry_delay: 100ms
controller_id: host-0
controller_address: 10.0.0.1:7000
backend:
  kind: spdk
  socket: /var/tmp/spdk.sock
vhost_controller: vhost.0
vhost_dev: "00:15.0"
max_scsi_targets: 4
listen: 0.0.0.0:7000
tls:
  cert: /etc/rkvol/tls.crt
  key: /etc/rkvol/tls.key
  ca: /etc/rkvol/ca.crt
"#,
        )
        .unwrap();

        assert_eq!(config.registry_delay, Duration::from_millis(100));
        assert_eq!(
            config.backend,
            BackendConfig::Spdk {
                socket: "/var/tmp/spdk.sock".into()
            }
        );
        assert_eq!(config.max_scsi_targets, 4);
        assert_eq!(config.listen, Some("0.0.0.0:7000".parse().unwrap()));
        assert_eq!(config.tls.unwrap().ca, PathBuf::from("/etc/rkvol/ca.crt"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        assert_eq!(ControllerConfig::from_yaml("").unwrap(), ControllerConfig::default());
        let config = ControllerConfig::from_yaml("controller_id: host-1\n").unwrap();
        assert_eq!(config.controller_id, "host-1");
        assert_eq!(config.registry_delay, Duration::from_secs(60));
        assert_eq!(config.max_scsi_targets, 8);
        assert_eq!(config.backend, BackendConfig::None);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        for yaml in [
            "registry_delay: soon\n",
            "no_such_field: 1\n",
            "backend:\n  kind: nvme\n",
        ] {
            let err = ControllerConfig::from_yaml(yaml).unwrap_err();
            assert!(matches!(err, ControllerError::InvalidArgument(_)), "{yaml}: {err}");
        }
    }

    #[test]
    fn registry_server_name_defaults_to_host() {
        let mut config = ControllerConfig {
            registry_address: "registry.example:8999".into(),
            ..Default::default()
        };
        assert_eq!(config.registry_server_name(), "registry.example");
        config.registry_address = "[::1]:8999".into();
        assert_eq!(config.registry_server_name(), "::1");
        config.registry_server_name = Some("registry".into());
        assert_eq!(config.registry_server_name(), "registry");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rkvol.yaml");
        std::fs::write(&path, "controller_id: from-file\n").unwrap();
        assert_eq!(ControllerConfig::load(&path).unwrap().controller_id, "from-file");

        let err = ControllerConfig::load(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn memory_backend_from_config() {
        let config = ControllerConfig::from_yaml(
            "backend:\n  kind: memory\n  controllers: [vhost.0]\nvhost_controller: vhost.0\nvhost_dev: '00:15.0'\n",
        )
        .unwrap();
        let controller = config.builder().build().unwrap();

        let err = controller.check_malloc_bdev("m0").await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)), "{err}");
        let reply = controller
            .map_volume(crate::types::MapVolumeRequest {
                volume_id: "vol-1".into(),
                params: Some(crate::types::VolumeParams::Ceph(crate::types::CephParams {
                    pool: "p".into(),
                    image: "i".into(),
                    ..Default::default()
                })),
            })
            .await
            .unwrap();
        assert_eq!(reply.scsi_disk.target, 0);
    }
}
