//! Core controller types: volume identifiers, map parameters, replies and
//! PCI addressing.
//!
//! These types form the request/response model shared by the
//! [`VolumeController`](crate::controller::VolumeController) trait and the
//! transport layer.  They are all [`Serialize`]/[`Deserialize`] so they can be
//! transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ControllerError;

/// Suffix of the registry path under which a controller publishes its
/// externally reachable address: `<controller-id>/address`.
pub const REGISTRY_ADDRESS: &str = "address";

/// Build the registry path for the address entry of `controller_id`.
pub fn registry_address_path(controller_id: &str) -> String {
    format!("{controller_id}/{REGISTRY_ADDRESS}")
}

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.  Also used verbatim as the name of
/// the backing BDev.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Map parameters
// ---------------------------------------------------------------------------

/// Parameters of a Ceph RBD image that backs a network block device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CephParams {
    /// Ceph user (without the `client.` prefix).
    pub user_id: String,
    /// RADOS pool holding the image.
    pub pool: String,
    /// RBD image name.
    pub image: String,
    /// Comma-separated monitor addresses.
    pub monitors: String,
    /// Secret key of `user_id`.
    pub secret: String,
}

/// How the BDev behind a volume is obtained when it does not exist yet.
///
/// Unknown `kind` tags deserialize into [`VolumeParams::Unsupported`] so that
/// newer callers get a clean error instead of a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeParams {
    /// The volume is a memory-backed BDev that must already be provisioned.
    Malloc,
    /// The volume is an RBD image that is attached on demand.
    Ceph(CephParams),
    /// A parameter variant this controller does not know about.
    #[serde(other)]
    Unsupported,
}

impl VolumeParams {
    /// Short variant name for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Ceph(_) => "ceph",
            Self::Unsupported => "unsupported",
        }
    }
}

// ---------------------------------------------------------------------------
// Requests & replies
// ---------------------------------------------------------------------------

/// Request to make a volume available as a SCSI LUN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapVolumeRequest {
    pub volume_id: VolumeId,
    /// `None` when the caller did not say how to create the BDev.
    #[serde(default)]
    pub params: Option<VolumeParams>,
}

/// SCSI coordinates of a mapped volume inside the vhost controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScsiDisk {
    pub target: u32,
    pub lun: u32,
}

/// Result of a successful [`MapVolumeRequest`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MapVolumeReply {
    /// Address of the vhost device as seen by the hypervisor guest.
    pub pci_address: PciAddress,
    pub scsi_disk: ScsiDisk,
}

/// Request to create (size > 0) or delete (size == 0) a Malloc BDev.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionMallocBDevRequest {
    pub bdev_name: String,
    /// Total size in bytes.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// PCI address
// ---------------------------------------------------------------------------

/// PCI domain/bus/device/function of the vhost device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = ControllerError;

    /// Accepts `DDDD:BB:DD.F` and the short form `BB:DD.F` (domain 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ControllerError::InvalidArgument(format!("invalid PCI address {s:?}"));

        let (head, function) = s.rsplit_once('.').ok_or_else(invalid)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, device) = match parts.as_slice() {
            [bus, device] => ("0", *bus, *device),
            [domain, bus, device] => (*domain, *bus, *device),
            _ => return Err(invalid()),
        };

        let domain = u16::from_str_radix(domain, 16).map_err(|_| invalid())?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| invalid())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| invalid())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
        if device > 0x1f || function > 7 {
            return Err(invalid());
        }

        Ok(Self {
            domain,
            bus,
            device,
            function,
        })
    }
}
