//! In-process emulation of the SPDK BDev and vhost-scsi RPCs.
//!
//! [`MemoryBackend`] keeps BDevs and vhost SCSI controllers in memory and
//! rejects the same requests SPDK would (duplicate names, occupied or
//! out-of-range target numbers, unknown names), using the same negative errno
//! codes.  No data is stored; only the bookkeeping the controller observes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    BDev, BlockBackend, ControllerBackend, MALLOC_PRODUCT_NAME, MallocBDevArgs,
    RBD_PRODUCT_NAME, RbdBDevArgs, ScsiLun, ScsiTarget, VHostController,
};
use crate::error::{BackendError, ENODEV};

const EEXIST: i64 = -17;
const EINVAL: i64 = -22;

/// Default number of SCSI targets per controller, as in SPDK.
pub const DEFAULT_MAX_TARGETS: u32 = 8;

#[derive(Default)]
struct State {
    bdevs: BTreeMap<String, BDev>,
    /// Controller name -> target number -> BDev attached as LUN 0.
    controllers: BTreeMap<String, BTreeMap<u32, String>>,
}

/// [`BlockBackend`] that lives entirely in memory.
pub struct MemoryBackend {
    state: Mutex<State>,
    max_targets: u32,
}

impl MemoryBackend {
    /// Create a backend exposing one empty vhost SCSI controller per name.
    pub fn new<I, S>(controllers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = State {
            bdevs: BTreeMap::new(),
            controllers: controllers
                .into_iter()
                .map(|name| (name.into(), BTreeMap::new()))
                .collect(),
        };
        Self {
            state: Mutex::new(state),
            max_targets: DEFAULT_MAX_TARGETS,
        }
    }

    /// Override the number of SCSI targets each controller accepts.
    pub fn with_max_targets(mut self, max_targets: u32) -> Self {
        self.max_targets = max_targets;
        self
    }

    /// Number of (controller, target) attachments of `bdev_name`.
    pub async fn attachment_count(&self, bdev_name: &str) -> usize {
        let state = self.state.lock().await;
        state
            .controllers
            .values()
            .flat_map(|targets| targets.values())
            .filter(|name| name.as_str() == bdev_name)
            .count()
    }

    async fn insert_bdev(&self, bdev: BDev) -> Result<String, BackendError> {
        if bdev.block_size == 0 || bdev.num_blocks == 0 {
            return Err(BackendError::new(EINVAL, "Invalid parameters"));
        }
        let mut state = self.state.lock().await;
        if state.bdevs.contains_key(&bdev.name) {
            return Err(BackendError::new(EEXIST, "File exists"));
        }
        let name = bdev.name.clone();
        debug!(bdev = %name, product = %bdev.product_name, "emulated BDev constructed");
        state.bdevs.insert(name.clone(), bdev);
        Ok(name)
    }
}

fn no_such_device() -> BackendError {
    BackendError::new(ENODEV, "No such device")
}

#[async_trait]
impl BlockBackend for MemoryBackend {
    async fn get_bdevs(&self, name: Option<&str>) -> Result<Vec<BDev>, BackendError> {
        let state = self.state.lock().await;
        match name {
            Some(name) => state
                .bdevs
                .get(name)
                .map(|bdev| vec![bdev.clone()])
                .ok_or_else(no_such_device),
            None => Ok(state.bdevs.values().cloned().collect()),
        }
    }

    async fn construct_malloc_bdev(&self, args: MallocBDevArgs) -> Result<String, BackendError> {
        self.insert_bdev(BDev {
            name: args.name,
            product_name: MALLOC_PRODUCT_NAME.to_owned(),
            block_size: args.block_size,
            num_blocks: args.num_blocks,
        })
        .await
    }

    /// The image size is unknown without a cluster, so the emulated BDev
    /// reports a single block.
    async fn construct_rbd_bdev(&self, args: RbdBDevArgs) -> Result<String, BackendError> {
        if args.pool_name.is_empty() || args.rbd_name.is_empty() {
            return Err(BackendError::new(EINVAL, "Invalid parameters"));
        }
        self.insert_bdev(BDev {
            name: args.name,
            product_name: RBD_PRODUCT_NAME.to_owned(),
            block_size: args.block_size,
            num_blocks: 1,
        })
        .await
    }

    /// Deleting an attached BDev hot-removes its LUNs, like SPDK does.
    async fn delete_bdev(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.bdevs.remove(name).ok_or_else(no_such_device)?;
        for targets in state.controllers.values_mut() {
            targets.retain(|_, bdev| bdev.as_str() != name);
        }
        Ok(())
    }

    async fn get_vhost_controllers(&self) -> Result<Vec<VHostController>, BackendError> {
        let state = self.state.lock().await;
        let controllers = state
            .controllers
            .iter()
            .map(|(name, targets)| VHostController {
                name: name.clone(),
                backend: ControllerBackend::Scsi(
                    targets
                        .iter()
                        .map(|(num, bdev)| ScsiTarget {
                            scsi_dev_num: *num,
                            luns: vec![ScsiLun {
                                id: 0,
                                bdev_name: bdev.clone(),
                            }],
                        })
                        .collect(),
                ),
            })
            .collect();
        Ok(controllers)
    }

    async fn add_vhost_scsi_lun(
        &self,
        controller: &str,
        scsi_target_num: u32,
        bdev_name: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if !state.bdevs.contains_key(bdev_name) {
            return Err(no_such_device());
        }
        let max_targets = self.max_targets;
        let targets = state
            .controllers
            .get_mut(controller)
            .ok_or_else(no_such_device)?;
        if scsi_target_num >= max_targets {
            return Err(BackendError::new(EINVAL, "Invalid parameters"));
        }
        if targets.contains_key(&scsi_target_num) {
            return Err(BackendError::new(EEXIST, "File exists"));
        }
        targets.insert(scsi_target_num, bdev_name.to_owned());
        Ok(())
    }

    async fn remove_vhost_scsi_target(
        &self,
        controller: &str,
        scsi_target_num: u32,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let targets = state
            .controllers
            .get_mut(controller)
            .ok_or_else(no_such_device)?;
        targets
            .remove(&scsi_target_num)
            .map(|_| ())
            .ok_or_else(no_such_device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malloc(name: &str, num_blocks: u64) -> MallocBDevArgs {
        MallocBDevArgs {
            name: name.into(),
            block_size: 512,
            num_blocks,
        }
    }

    #[tokio::test]
    async fn bdev_lifecycle() {
        let backend = MemoryBackend::new(["vhost.0"]);
        assert!(backend.get_bdevs(Some("m0")).await.unwrap_err().is_not_found());

        backend.construct_malloc_bdev(malloc("m0", 4)).await.unwrap();
        let err = backend.construct_malloc_bdev(malloc("m0", 4)).await.unwrap_err();
        assert_eq!(err.code, Some(EEXIST));

        let bdevs = backend.get_bdevs(Some("m0")).await.unwrap();
        assert_eq!(bdevs[0].size_bytes(), 2048);
        assert!(bdevs[0].is_malloc());

        backend.delete_bdev("m0").await.unwrap();
        assert!(backend.delete_bdev("m0").await.unwrap_err().is_not_found());
        assert!(backend.get_bdevs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn targets_are_exclusive_and_bounded() {
        let backend = MemoryBackend::new(["vhost.0"]).with_max_targets(2);
        backend.construct_malloc_bdev(malloc("a", 1)).await.unwrap();
        backend.construct_malloc_bdev(malloc("b", 1)).await.unwrap();

        backend.add_vhost_scsi_lun("vhost.0", 0, "a").await.unwrap();
        let err = backend.add_vhost_scsi_lun("vhost.0", 0, "b").await.unwrap_err();
        assert_eq!(err.code, Some(EEXIST));
        let err = backend.add_vhost_scsi_lun("vhost.0", 2, "b").await.unwrap_err();
        assert_eq!(err.code, Some(EINVAL));
        assert!(
            backend
                .add_vhost_scsi_lun("vhost.9", 1, "b")
                .await
                .unwrap_err()
                .is_not_found()
        );

        let controllers = backend.get_vhost_controllers().await.unwrap();
        let targets = controllers[0].scsi_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].luns[0].bdev_name, "a");

        backend.remove_vhost_scsi_target("vhost.0", 0).await.unwrap();
        assert_eq!(backend.attachment_count("a").await, 0);
    }

    #[tokio::test]
    async fn deleting_attached_bdev_hot_removes_lun() {
        let backend = MemoryBackend::new(["vhost.0"]);
        backend.construct_malloc_bdev(malloc("a", 1)).await.unwrap();
        backend.add_vhost_scsi_lun("vhost.0", 5, "a").await.unwrap();
        backend.delete_bdev("a").await.unwrap();
        assert_eq!(backend.attachment_count("a").await, 0);
    }
}
