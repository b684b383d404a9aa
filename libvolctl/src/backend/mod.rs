//! Storage backend contract.
//!
//! [`BlockBackend`] is the capability the controller consumes: BDev
//! listing/construction/deletion and vhost SCSI target management.  Two
//! implementations are provided:
//!
//! * [`spdk::SpdkClient`] — JSON-RPC client for a running SPDK vhost daemon.
//! * [`memory::MemoryBackend`] — in-process emulation for local runs and tests.

pub mod memory;
pub mod spdk;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Product name SPDK reports for memory-backed BDevs.
pub const MALLOC_PRODUCT_NAME: &str = "Malloc disk";

/// Product name SPDK reports for Ceph RBD BDevs.
pub const RBD_PRODUCT_NAME: &str = "Ceph Rbd Disk";

/// Block size used for every BDev this controller constructs.
pub const DEFAULT_BLOCK_SIZE: u64 = 512;

/// A block device as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BDev {
    pub name: String,
    #[serde(default)]
    pub product_name: String,
    pub block_size: u64,
    pub num_blocks: u64,
}

impl BDev {
    /// Total size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.num_blocks.saturating_mul(self.block_size)
    }

    pub fn is_malloc(&self) -> bool {
        self.product_name == MALLOC_PRODUCT_NAME
    }
}

/// Arguments for constructing a memory-backed BDev.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MallocBDevArgs {
    pub name: String,
    pub block_size: u64,
    pub num_blocks: u64,
}

/// Arguments for constructing a Ceph RBD BDev.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RbdBDevArgs {
    pub name: String,
    pub block_size: u64,
    pub user_id: String,
    pub pool_name: String,
    pub rbd_name: String,
    /// Extra librados configuration, e.g. `mon_host` and `key`.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// One LUN inside a SCSI target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScsiLun {
    pub id: u32,
    pub bdev_name: String,
}

/// One SCSI target of a vhost SCSI controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScsiTarget {
    pub scsi_dev_num: u32,
    #[serde(default)]
    pub luns: Vec<ScsiLun>,
}

/// Backend-specific part of a vhost controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerBackend {
    /// vhost-scsi: targets with LUNs.
    Scsi(Vec<ScsiTarget>),
    /// vhost-blk: exactly one BDev.
    Blk { bdev: String },
    /// Any controller kind this crate does not model.
    Unknown,
}

/// A vhost controller as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VHostController {
    pub name: String,
    pub backend: ControllerBackend,
}

impl VHostController {
    /// SCSI targets of this controller, empty for non-SCSI controllers.
    pub fn scsi_targets(&self) -> &[ScsiTarget] {
        match &self.backend {
            ControllerBackend::Scsi(targets) => targets,
            ControllerBackend::Blk { .. } | ControllerBackend::Unknown => &[],
        }
    }
}

/// Storage backend operations used by the controller.
///
/// Every call may fail; callers must not assume a particular error shape
/// distinguishes "not found" from other failures beyond
/// [`BackendError::is_not_found`].
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// List BDevs, optionally restricted to the one called `name`.
    async fn get_bdevs(&self, name: Option<&str>) -> Result<Vec<BDev>, BackendError>;

    /// Construct a memory-backed BDev and return its name.
    async fn construct_malloc_bdev(&self, args: MallocBDevArgs) -> Result<String, BackendError>;

    /// Construct a Ceph RBD BDev and return its name.
    async fn construct_rbd_bdev(&self, args: RbdBDevArgs) -> Result<String, BackendError>;

    async fn delete_bdev(&self, name: &str) -> Result<(), BackendError>;

    /// List all vhost controllers with their targets and LUNs.
    async fn get_vhost_controllers(&self) -> Result<Vec<VHostController>, BackendError>;

    /// Attach `bdev_name` as LUN 0 of a new SCSI target `scsi_target_num`.
    async fn add_vhost_scsi_lun(
        &self,
        controller: &str,
        scsi_target_num: u32,
        bdev_name: &str,
    ) -> Result<(), BackendError>;

    /// Detach SCSI target `scsi_target_num` with all its LUNs.
    async fn remove_vhost_scsi_target(
        &self,
        controller: &str,
        scsi_target_num: u32,
    ) -> Result<(), BackendError>;
}
