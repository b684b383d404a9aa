//! Controller protocol messages transmitted over QUIC.
//!
//! [`RpcMessage`] is the envelope for every request and response exchanged
//! between a volume controller and its clients, and for the key/value writes
//! the controller sends to the registry.

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;
use crate::types::*;

/// Top-level message envelope.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// matching *response* variant or [`RpcMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcMessage {
    // ----- Requests --------------------------------------------------------
    /// Attach a volume, creating its BDev if needed.
    MapVolume(MapVolumeRequest),
    /// Detach a volume and delete its non-Malloc BDev.
    UnmapVolume(VolumeId),
    /// Create or delete (size 0) a Malloc BDev.
    ProvisionMallocBDev(ProvisionMallocBDevRequest),
    /// Check that a BDev exists.
    CheckMallocBDev { bdev_name: String },
    /// Store `value` under `path` (registry).
    SetValue { path: String, value: String },

    // ----- Responses -------------------------------------------------------
    /// Where a mapped volume is visible to the guest.
    VolumeMapped(MapVolumeReply),
    /// Generic success acknowledgement.
    Ok,
    /// An error occurred.
    Error(ControllerError),
}

impl std::fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MapVolume(req) => write!(
                f,
                "MapVolume({}, params={})",
                req.volume_id,
                req.params.as_ref().map_or("none", VolumeParams::kind)
            ),
            Self::UnmapVolume(id) => write!(f, "UnmapVolume({id})"),
            Self::ProvisionMallocBDev(req) => {
                write!(f, "ProvisionMallocBDev({}, size={})", req.bdev_name, req.size)
            }
            Self::CheckMallocBDev { bdev_name } => write!(f, "CheckMallocBDev({bdev_name})"),
            // Value omitted.
            Self::SetValue { path, .. } => write!(f, "SetValue({path})"),
            Self::VolumeMapped(reply) => write!(
                f,
                "VolumeMapped({} target={} lun={})",
                reply.pci_address, reply.scsi_disk.target, reply.scsi_disk.lun
            ),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_request_keeps_params() {
        let msg = RpcMessage::MapVolume(MapVolumeRequest {
            volume_id: "vol-1".into(),
            params: Some(VolumeParams::Ceph(CephParams {
                user_id: "admin".into(),
                pool: "rbd".into(),
                image: "img".into(),
                monitors: "10.0.0.1:6789".into(),
                secret: "s3cr3t".into(),
            })),
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: RpcMessage = serde_json::from_str(&json).expect("deserialize");
        match de {
            RpcMessage::MapVolume(req) => {
                assert_eq!(req.volume_id.as_str(), "vol-1");
                assert!(matches!(req.params, Some(VolumeParams::Ceph(ref c)) if c.pool == "rbd"));
            }
            other => panic!("unexpected message {other}"),
        }
    }

    #[test]
    fn error_message_roundtrip() {
        let msg = RpcMessage::Error(ControllerError::NotFound("BDev m0".into()));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: RpcMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de, RpcMessage::Error(ControllerError::NotFound(_))));
    }

    #[test]
    fn display_formatting() {
        assert_eq!(RpcMessage::Ok.to_string(), "Ok");
        assert_eq!(
            RpcMessage::MapVolume(MapVolumeRequest {
                volume_id: "vol-1".into(),
                params: None,
            })
            .to_string(),
            "MapVolume(vol-1, params=none)"
        );
        let mapped = RpcMessage::VolumeMapped(MapVolumeReply {
            pci_address: "00:15.0".parse().unwrap(),
            scsi_disk: ScsiDisk { target: 2, lun: 0 },
        });
        assert_eq!(mapped.to_string(), "VolumeMapped(0000:00:15.0 target=2 lun=0)");
        let set = RpcMessage::SetValue {
            path: "host-0/address".into(),
            value: "10.0.0.1:7000".into(),
        };
        assert_eq!(set.to_string(), "SetValue(host-0/address)");
    }
}
