//! Typed boundary to the volume plugin transport
//!
//! The transport decodes requests from the container runtime and hands them
//! to a [`VolumePlugin`]. [`PluginService`] serves them from a
//! [`MountManager`], moving every call onto the blocking pool: a stuck
//! `mount` holds the manager's lock but never an async worker thread.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VolumeError};
use crate::mount::MountManager;
use crate::options::VolumeOptions;
use crate::registry::VolumeInfo;

/// `VolumeDriver.Create`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Opts", default)]
    pub options: VolumeOptions,
}

/// `VolumeDriver.Mount` and `VolumeDriver.Unmount`
#[derive(Debug, Clone, Deserialize)]
pub struct MountRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID", default)]
    pub id: String,
}

/// Requests carrying only a volume name (`Remove`, `Path`, `Get`)
#[derive(Debug, Clone, Deserialize)]
pub struct NameRequest {
    #[serde(rename = "Name")]
    pub name: String,
}

/// Scope reported to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    #[serde(rename = "Scope")]
    pub scope: String,
}

impl Capabilities {
    /// Volumes are only visible on the host that mounted them
    pub fn local() -> Self {
        Self {
            scope: "local".to_string(),
        }
    }
}

/// Operations the transport can invoke
#[async_trait]
pub trait VolumePlugin: Send + Sync {
    async fn create(&self, req: CreateRequest) -> Result<()>;

    async fn remove(&self, req: NameRequest) -> Result<()>;

    /// Returns the host path to bind into the container
    async fn mount(&self, req: MountRequest) -> Result<PathBuf>;

    async fn unmount(&self, req: MountRequest) -> Result<()>;

    async fn path(&self, req: NameRequest) -> Result<PathBuf>;

    async fn get(&self, req: NameRequest) -> Result<VolumeInfo>;

    async fn list(&self) -> Result<Vec<VolumeInfo>>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::local()
    }
}

/// [`VolumePlugin`] backed by a [`MountManager`]
#[derive(Clone)]
pub struct PluginService {
    manager: Arc<MountManager>,
}

impl PluginService {
    pub fn new(manager: Arc<MountManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<MountManager> {
        &self.manager
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&MountManager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| VolumeError::Task(e.to_string()))?
    }
}

#[async_trait]
impl VolumePlugin for PluginService {
    async fn create(&self, req: CreateRequest) -> Result<()> {
        self.blocking(move |m| m.create(&req.name, req.options)).await
    }

    async fn remove(&self, req: NameRequest) -> Result<()> {
        self.blocking(move |m| m.remove(&req.name)).await
    }

    async fn mount(&self, req: MountRequest) -> Result<PathBuf> {
        self.blocking(move |m| m.mount(&req.name, &req.id)).await
    }

    async fn unmount(&self, req: MountRequest) -> Result<()> {
        self.blocking(move |m| m.unmount(&req.name, &req.id)).await
    }

    async fn path(&self, req: NameRequest) -> Result<PathBuf> {
        self.blocking(move |m| m.path(&req.name)).await
    }

    async fn get(&self, req: NameRequest) -> Result<VolumeInfo> {
        self.blocking(move |m| m.get(&req.name)).await
    }

    async fn list(&self) -> Result<Vec<VolumeInfo>> {
        self.blocking(|m| Ok(m.list())).await
    }
}
