//! # libvolctl — vhost volume controller for RK8s
//!
//! `libvolctl` maps storage volumes onto SPDK block devices (BDevs) and
//! attaches them as SCSI LUNs of a vhost SCSI controller, so a hypervisor
//! guest sees each volume as a disk at a known PCI address and SCSI target.
//! Requests arrive over QUIC (via [`quinn`]); the controller advertises
//! itself by periodically writing its address into a registry.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `VolumeId`, volume parameters, requests, `PciAddress`. |
//! | [`error`] | [`ControllerError`] and [`BackendError`](error::BackendError). |
//! | [`backend`] | [`BlockBackend`] trait, SPDK JSON-RPC client, in-memory emulation. |
//! | [`controller`] | [`VolumeController`] trait — map, unmap, provision, check. |
//! | [`vhost`] | [`Controller`], the vhost-scsi implementation, and its builder. |
//! | [`locks`] | Per-volume serialization of controller calls. |
//! | [`registration`] | Periodic self-registration with the registry. |
//! | [`config`] | YAML configuration file. |
//! | [`message`] | [`RpcMessage`] protocol envelope for QUIC transport. |
//! | [`transport`] | QUIC client/server built on `quinn`. |

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod locks;
pub mod message;
pub mod registration;
pub mod transport;
pub mod types;
pub mod vhost;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::BlockBackend;
pub use config::ControllerConfig;
pub use controller::VolumeController;
pub use error::ControllerError;
pub use message::RpcMessage;
pub use registration::{RegistryClient, RegistryDialer};
pub use types::*;
pub use vhost::{Controller, ControllerBuilder};
