//! Volume controller service trait.
//!
//! The controller maps volumes onto BDevs of the storage backend and exposes
//! them through a vhost SCSI controller.  Every operation is safe to retry:
//! callers (typically a CSI driver) re-issue requests after timeouts and
//! restarts, so each call converges on its target state instead of failing
//! because a previous attempt already got there.

use async_trait::async_trait;

use crate::error::ControllerError;
use crate::types::{MapVolumeReply, MapVolumeRequest, ProvisionMallocBDevRequest, VolumeId};

/// Controller service — volume mapping and Malloc BDev provisioning.
#[async_trait]
pub trait VolumeController: Send + Sync {
    /// Ensure the volume is attached as a SCSI LUN and report where.
    ///
    /// Creates the BDev from `params` if it does not exist.  A volume that is
    /// already attached is reported as-is without a second attachment; the
    /// reply then carries the target and LUN the backend lists, which may be
    /// a non-zero LUN if something other than this controller attached it.
    /// New attachments are always LUN 0.
    async fn map_volume(&self, req: MapVolumeRequest) -> Result<MapVolumeReply, ControllerError>;

    /// Detach the volume from every SCSI target and delete its BDev unless it
    /// is a Malloc BDev.
    ///
    /// This is idempotent — unmapping an unknown volume succeeds.
    async fn unmap_volume(&self, volume_id: &VolumeId) -> Result<(), ControllerError>;

    /// Create (`size > 0`) or delete (`size == 0`) a Malloc BDev.
    ///
    /// Repeating a create with the same size succeeds; a different size fails
    /// with [`ControllerError::AlreadyExists`].
    async fn provision_malloc_bdev(
        &self,
        req: ProvisionMallocBDevRequest,
    ) -> Result<(), ControllerError>;

    /// Succeed iff exactly one BDev called `bdev_name` exists.
    async fn check_malloc_bdev(&self, bdev_name: &str) -> Result<(), ControllerError>;
}
