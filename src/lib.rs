//! ceph-volume-driver: CephFS volumes for a container runtime
//!
//! Attaches and detaches named CephFS volumes on demand. Any number of
//! containers can hold the same volume; it is mounted once and unmounted
//! when the last holder lets go.
//!
//! # Architecture
//!
//! - **Registry**: reference-counted map of known volumes, rebuilt from host
//!   state at startup.
//! - **Credential Resolver**: turns per-volume options and daemon defaults
//!   into the mount source and `-o` option string.
//! - **Executor**: runs `mount -t ceph` / `umount` and classifies failures.
//! - **Keyring Cleaner**: drops the cached cephx key after an unmount.
//! - **Mount Manager**: sequences create/mount/unmount/remove under one lock.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ceph_volume_driver::config::Config;
//! use ceph_volume_driver::exec::SystemRunner;
//! use ceph_volume_driver::keyring::host_key_cache;
//! use ceph_volume_driver::mount::MountManager;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("config.yaml".as_ref())?;
//! let manager = MountManager::start(&config, Arc::new(SystemRunner), host_key_cache());
//!
//! let path = manager.mount("data", "container-1")?;
//! println!("mounted at {}", path.display());
//! manager.unmount("data", "container-1")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod env;
pub mod error;
pub mod exec;
pub mod keyring;
pub mod mount;
pub mod options;
pub mod plugin;
pub mod registry;

pub use error::{Result, VolumeError};
