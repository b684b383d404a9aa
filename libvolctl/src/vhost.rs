//! SPDK vhost-scsi implementation of [`VolumeController`].
//!
//! [`Controller`] keeps no volume table.  Every call asks the backend what
//! exists and which SCSI targets are in use, then acts on that answer; the
//! backend is the only source of truth, so a restarted controller or a
//! retried request sees exactly what is there.
//!
//! # Volume states
//!
//! ```text
//! absent --map/provision--> bdev --map--> bdev+attached
//! bdev+attached --unmap (detach)--> bdev --unmap (delete) / provision 0--> absent
//! ```
//!
//! Calls for the same identifier are serialized through [`VolumeLocks`];
//! calls for different identifiers run concurrently.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::backend::spdk::SpdkClient;
use crate::backend::{
    BDev, BlockBackend, DEFAULT_BLOCK_SIZE, MallocBDevArgs, RbdBDevArgs, VHostController,
};
use crate::controller::VolumeController;
use crate::error::ControllerError;
use crate::locks::VolumeLocks;
use crate::registration::{Registration, RegistrationHandle, RegistryDialer};
use crate::types::*;

/// Controller ID used when none is configured.
pub const DEFAULT_CONTROLLER_ID: &str = "unset-controller-id";

/// Pause between two registration attempts.
pub const DEFAULT_REGISTRY_DELAY: Duration = Duration::from_secs(60);

/// Number of SCSI target numbers tried when attaching a volume.  SPDK does
/// not report its limit; 8 is its default.
pub const DEFAULT_MAX_SCSI_TARGETS: u32 = 8;

/// Volume controller for one SPDK vhost SCSI controller.
pub struct Controller {
    registry_address: String,
    registry_delay: Duration,
    controller_id: String,
    controller_address: String,
    backend: Option<Arc<dyn BlockBackend>>,
    vhost_scsi: String,
    vhost_dev: Option<PciAddress>,
    max_scsi_targets: u32,
    dialer: Option<Arc<dyn RegistryDialer>>,
    locks: VolumeLocks,
    registration: Mutex<Option<RegistrationHandle>>,
}

/// Builder for [`Controller`].
pub struct ControllerBuilder {
    registry_address: String,
    registry_delay: Duration,
    controller_id: String,
    controller_address: String,
    spdk_path: Option<PathBuf>,
    backend: Option<Arc<dyn BlockBackend>>,
    vhost_scsi: String,
    vhost_dev: Option<String>,
    max_scsi_targets: u32,
    dialer: Option<Arc<dyn RegistryDialer>>,
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self {
            registry_address: String::new(),
            registry_delay: DEFAULT_REGISTRY_DELAY,
            controller_id: DEFAULT_CONTROLLER_ID.to_owned(),
            controller_address: String::new(),
            spdk_path: None,
            backend: None,
            vhost_scsi: String::new(),
            vhost_dev: None,
            max_scsi_targets: DEFAULT_MAX_SCSI_TARGETS,
            dialer: None,
        }
    }
}

impl ControllerBuilder {
    /// Registry to publish the controller address to.  Empty disables
    /// registration.
    pub fn registry(mut self, address: impl Into<String>) -> Self {
        self.registry_address = address.into();
        self
    }

    pub fn registry_delay(mut self, delay: Duration) -> Self {
        self.registry_delay = delay;
        self
    }

    pub fn controller_id(mut self, id: impl Into<String>) -> Self {
        self.controller_id = id.into();
        self
    }

    /// The *external* address of the controller, i.e. what the registry
    /// hands out to clients that want to reach it.
    pub fn controller_address(mut self, address: impl Into<String>) -> Self {
        self.controller_address = address.into();
        self
    }

    /// Talk to the SPDK RPC socket at `path`.
    pub fn spdk(mut self, path: impl Into<PathBuf>) -> Self {
        self.spdk_path = Some(path.into());
        self
    }

    /// Use an already constructed backend.  Takes precedence over
    /// [`Self::spdk`].
    pub fn backend(mut self, backend: Arc<dyn BlockBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Name of the vhost SCSI controller new LUNs are attached to.
    pub fn vhost_controller(mut self, name: impl Into<String>) -> Self {
        self.vhost_scsi = name.into();
        self
    }

    /// PCI address (`DDDD:BB:DD.F` or `BB:DD.F`) under which the hypervisor
    /// guest sees the vhost controller.
    pub fn vhost_dev(mut self, address: impl Into<String>) -> Self {
        self.vhost_dev = Some(address.into());
        self
    }

    pub fn max_scsi_targets(mut self, max: u32) -> Self {
        self.max_scsi_targets = max;
        self
    }

    pub fn registry_dialer(mut self, dialer: Arc<dyn RegistryDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn build(self) -> Result<Controller, ControllerError> {
        let vhost_dev = self
            .vhost_dev
            .as_deref()
            .map(str::parse::<PciAddress>)
            .transpose()?;

        let backend = match (self.backend, self.spdk_path) {
            (Some(backend), _) => Some(backend),
            (None, Some(path)) if !path.as_os_str().is_empty() => {
                Some(Arc::new(SpdkClient::new(path)) as Arc<dyn BlockBackend>)
            }
            (None, _) => None,
        };

        if !self.registry_address.is_empty() {
            if self.controller_id.is_empty() || self.controller_address.is_empty() {
                return Err(ControllerError::InvalidArgument(
                    "need both controller ID and external controller address for registering with the registry"
                        .to_owned(),
                ));
            }
            if self.dialer.is_none() {
                return Err(ControllerError::InvalidArgument(
                    "registry configured without a registry dialer".to_owned(),
                ));
            }
        }

        Ok(Controller {
            registry_address: self.registry_address,
            registry_delay: self.registry_delay,
            controller_id: self.controller_id,
            controller_address: self.controller_address,
            backend,
            vhost_scsi: self.vhost_scsi,
            vhost_dev,
            max_scsi_targets: self.max_scsi_targets,
            dialer: self.dialer,
            locks: VolumeLocks::new(),
            registration: Mutex::new(None),
        })
    }
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    /// Start registering with the registry, if one is configured.  Calling
    /// this while the loop already runs has no effect.
    pub async fn start(&self) -> Result<(), ControllerError> {
        if self.registry_address.is_empty() {
            return Ok(());
        }
        let dialer = self.dialer.clone().ok_or_else(|| {
            ControllerError::Internal("registry configured without a registry dialer".to_owned())
        })?;

        let mut slot = self.registration.lock().await;
        if slot.is_none() {
            let registration = Registration::new(
                self.registry_address.clone(),
                self.registry_delay,
                self.controller_id.clone(),
                self.controller_address.clone(),
                dialer,
            );
            *slot = Some(registration.spawn());
        }
        Ok(())
    }

    /// Stop registering and wait until the registration task has exited.
    pub async fn stop(&self) {
        let handle = self.registration.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    fn backend(&self) -> Result<&dyn BlockBackend, ControllerError> {
        self.backend
            .as_deref()
            .ok_or_else(|| ControllerError::NotConnected("not connected to SPDK".to_owned()))
    }

    /// Look up one BDev by name.  A not-found answer from the backend is
    /// `Ok(None)`; see [`BackendError::is_not_found`](crate::error::BackendError::is_not_found)
    /// for what counts as one.
    async fn lookup_bdev(
        backend: &dyn BlockBackend,
        name: &str,
    ) -> Result<Option<BDev>, ControllerError> {
        match backend.get_bdevs(Some(name)).await {
            Ok(bdevs) => Ok(bdevs.into_iter().next()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(ControllerError::backend(format!("get_bdevs {name}"), e)),
        }
    }

    /// Create the BDev for a volume that does not have one yet.
    async fn create_bdev(
        backend: &dyn BlockBackend,
        volume_id: &str,
        params: Option<&VolumeParams>,
    ) -> Result<(), ControllerError> {
        match params {
            Some(VolumeParams::Malloc) => Err(ControllerError::InvalidArgument(format!(
                "no existing Malloc BDev with name {volume_id} found"
            ))),
            Some(VolumeParams::Ceph(ceph)) => Self::map_ceph(backend, volume_id, ceph).await,
            Some(VolumeParams::Unsupported) => Err(ControllerError::InvalidArgument(
                "unsupported volume parameters".to_owned(),
            )),
            None => Err(ControllerError::InvalidArgument(
                "missing volume parameters".to_owned(),
            )),
        }
    }

    async fn map_ceph(
        backend: &dyn BlockBackend,
        volume_id: &str,
        ceph: &CephParams,
    ) -> Result<(), ControllerError> {
        let args = RbdBDevArgs {
            name: volume_id.to_owned(),
            block_size: DEFAULT_BLOCK_SIZE,
            user_id: ceph.user_id.clone(),
            pool_name: ceph.pool.clone(),
            rbd_name: ceph.image.clone(),
            config: HashMap::from([
                ("mon_host".to_owned(), ceph.monitors.clone()),
                ("key".to_owned(), ceph.secret.clone()),
            ]),
        };
        backend.construct_rbd_bdev(args).await.map_err(|e| {
            ControllerError::backend(
                format!(
                    "construct_rbd_bdev {volume_id} for RBD pool {} and image {}, monitors {}",
                    ceph.pool, ceph.image, ceph.monitors
                ),
                e,
            )
        })?;
        info!(%volume_id, pool = %ceph.pool, image = %ceph.image, "RBD BDev constructed");
        Ok(())
    }
}

/// Every `(controller, target, lun)` whose LUN is backed by `bdev_name`.
fn attachments<'a>(
    controllers: &'a [VHostController],
    bdev_name: &'a str,
) -> impl Iterator<Item = (&'a str, u32, u32)> + 'a {
    controllers.iter().flat_map(move |controller| {
        controller.scsi_targets().iter().flat_map(move |target| {
            target
                .luns
                .iter()
                .filter(move |lun| lun.bdev_name == bdev_name)
                .map(move |lun| (controller.name.as_str(), target.scsi_dev_num, lun.id))
        })
    })
}

#[async_trait]
impl VolumeController for Controller {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn map_volume(&self, req: MapVolumeRequest) -> Result<MapVolumeReply, ControllerError> {
        let volume_id = req.volume_id.as_str();
        if volume_id.is_empty() {
            return Err(ControllerError::InvalidArgument("empty volume ID".to_owned()));
        }
        let backend = self.backend()?;
        if self.vhost_scsi.is_empty() {
            return Err(ControllerError::NotConnected(
                "no vhost SCSI controller configured".to_owned(),
            ));
        }
        let pci_address = self
            .vhost_dev
            .ok_or_else(|| ControllerError::NotConnected("no PCI address configured".to_owned()))?;

        let _guard = self.locks.lock(volume_id).await;

        // An existing BDev is reused as-is, whatever it was created from.
        match Self::lookup_bdev(backend, volume_id).await? {
            Some(bdev) => info!(%volume_id, product = %bdev.product_name, "reusing existing BDev"),
            None => Self::create_bdev(backend, volume_id, req.params.as_ref()).await?,
        }

        // Already attached: a previous call got this far.
        let controllers = backend
            .get_vhost_controllers()
            .await
            .map_err(|e| ControllerError::backend("get_vhost_controllers", e))?;
        if let Some((controller, target, lun)) = attachments(&controllers, volume_id).next() {
            debug!(%volume_id, controller, target, lun, "BDev already attached");
            return Ok(MapVolumeReply {
                pci_address,
                scsi_disk: ScsiDisk { target, lun },
            });
        }

        // Lowest free target number wins.  The BDev stays in place if all of
        // them fail; UnmapVolume removes it.
        let mut last_err = None;
        for target in 0..self.max_scsi_targets {
            match backend
                .add_vhost_scsi_lun(&self.vhost_scsi, target, volume_id)
                .await
            {
                Ok(()) => {
                    info!(%volume_id, controller = %self.vhost_scsi, target, "volume mapped");
                    return Ok(MapVolumeReply {
                        pci_address,
                        scsi_disk: ScsiDisk { target, lun: 0 },
                    });
                }
                Err(e) => {
                    debug!(%volume_id, target, error = %e, "SCSI target unavailable");
                    last_err = Some(e);
                }
            }
        }

        Err(ControllerError::BackendError {
            context: format!(
                "add_vhost_scsi_lun {volume_id} on {} failed for all {} targets, last error",
                self.vhost_scsi, self.max_scsi_targets
            ),
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no SCSI targets to try".to_owned()),
        })
    }

    #[instrument(skip(self))]
    async fn unmap_volume(&self, volume_id: &VolumeId) -> Result<(), ControllerError> {
        let volume_id = volume_id.as_str();
        if volume_id.is_empty() {
            return Err(ControllerError::InvalidArgument("empty volume ID".to_owned()));
        }
        let backend = self.backend()?;

        let _guard = self.locks.lock(volume_id).await;

        let controllers = backend
            .get_vhost_controllers()
            .await
            .map_err(|e| ControllerError::backend("get_vhost_controllers", e))?;
        // Detach every attachment, not just the first one found.
        let targets: BTreeSet<(&str, u32)> = attachments(&controllers, volume_id)
            .map(|(controller, target, _)| (controller, target))
            .collect();
        for (controller, target) in targets {
            backend
                .remove_vhost_scsi_target(controller, target)
                .await
                .map_err(|e| {
                    ControllerError::backend(
                        format!("remove_vhost_scsi_target {controller} target {target}"),
                        e,
                    )
                })?;
            info!(%volume_id, controller, target, "SCSI target removed");
        }

        // Malloc BDevs belong to ProvisionMallocBDev and are kept.
        match backend.get_bdevs(Some(volume_id)).await {
            Ok(bdevs) => match bdevs.first() {
                Some(bdev) if bdev.is_malloc() => {
                    debug!(%volume_id, "keeping Malloc BDev");
                }
                Some(_) => match backend.delete_bdev(volume_id).await {
                    Ok(()) => info!(%volume_id, "BDev deleted"),
                    Err(e) if e.is_not_found() => debug!(%volume_id, "BDev already gone"),
                    Err(e) => warn!(%volume_id, error = %e, "deleting BDev failed"),
                },
                None => debug!(%volume_id, "no BDev to delete"),
            },
            Err(e) if e.is_not_found() => debug!(%volume_id, "no BDev to delete"),
            Err(e) => warn!(%volume_id, error = %e, "looking up BDev for deletion failed"),
        }

        Ok(())
    }

    #[instrument(skip(self, req), fields(bdev = %req.bdev_name, size = req.size))]
    async fn provision_malloc_bdev(
        &self,
        req: ProvisionMallocBDevRequest,
    ) -> Result<(), ControllerError> {
        let name = req.bdev_name.as_str();
        if name.is_empty() {
            return Err(ControllerError::InvalidArgument("empty BDev name".to_owned()));
        }
        let backend = self.backend()?;

        let _guard = self.locks.lock(name).await;

        if req.size == 0 {
            match backend.delete_bdev(name).await {
                Ok(()) => info!(bdev = %name, "Malloc BDev deleted"),
                Err(e) if e.is_not_found() => debug!(bdev = %name, "Malloc BDev already gone"),
                Err(e) => warn!(bdev = %name, error = %e, "deleting Malloc BDev failed"),
            }
            return Ok(());
        }

        let existing = match backend.get_bdevs(Some(name)).await {
            Ok(mut bdevs) if bdevs.len() == 1 => bdevs.pop(),
            Ok(_) => None,
            Err(e) => {
                debug!(bdev = %name, error = %e, "BDev lookup failed, constructing");
                None
            }
        };

        match existing {
            Some(bdev) => {
                let actual_size = bdev.size_bytes();
                if actual_size != req.size {
                    return Err(ControllerError::AlreadyExists {
                        name: name.to_owned(),
                        actual_size,
                    });
                }
                debug!(bdev = %name, "Malloc BDev already provisioned");
            }
            None => {
                let args = MallocBDevArgs {
                    name: name.to_owned(),
                    block_size: DEFAULT_BLOCK_SIZE,
                    num_blocks: req.size / DEFAULT_BLOCK_SIZE,
                };
                backend
                    .construct_malloc_bdev(args)
                    .await
                    .map_err(|e| ControllerError::backend(format!("construct_malloc_bdev {name}"), e))?;
                info!(bdev = %name, size = req.size, "Malloc BDev constructed");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn check_malloc_bdev(&self, bdev_name: &str) -> Result<(), ControllerError> {
        if bdev_name.is_empty() {
            return Err(ControllerError::InvalidArgument("empty BDev name".to_owned()));
        }
        let backend = self.backend()?;

        let _guard = self.locks.lock(bdev_name).await;

        match backend.get_bdevs(Some(bdev_name)).await {
            Ok(bdevs) if bdevs.len() == 1 => Ok(()),
            Ok(bdevs) => {
                debug!(bdev = %bdev_name, count = bdevs.len(), "unexpected number of BDevs");
                Err(ControllerError::NotFound(format!("BDev {bdev_name}")))
            }
            Err(e) => {
                debug!(bdev = %bdev_name, error = %e, "BDev lookup failed");
                Err(ControllerError::NotFound(format!("BDev {bdev_name}")))
            }
        }
    }
}
