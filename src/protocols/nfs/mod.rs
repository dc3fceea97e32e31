//! Highly available NFS exports
//!
//! Every volume carries a file system that is mounted below
//! `/srv/gateway-exports/<name>` and exported to the allowed clients. The NFS
//! server keeps its lease state on the cluster-private volume, so clients
//! can reclaim locks after a failover.

mod config;

pub use config::{
    export_directory, rooted_path, NfsVolumeConfig, ResourceConfig, DEFAULT_NFS_PORT,
    EXPORT_BASE_PATH, NFS_UUID_NAMESPACE,
};

use crate::controlplane::orchestrator::{GatewayConfig, Orchestrator};
use crate::domain::identity::ResourceName;
use crate::domain::ports::StorageBackend;
use crate::error::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// NFS front end, addressing exports by resource name
pub struct Nfs {
    inner: Orchestrator<ResourceConfig>,
}

impl Nfs {
    pub fn new(backend: Arc<dyn StorageBackend>, config: &GatewayConfig) -> Self {
        Self {
            inner: Orchestrator::new(backend, config),
        }
    }

    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self {
            inner: self.inner.with_cancellation(cancel),
        }
    }

    pub async fn create(&self, rsc: ResourceConfig) -> Result<ResourceConfig> {
        self.inner.create(rsc).await
    }

    pub async fn get(&self, name: &ResourceName) -> Result<Option<ResourceConfig>> {
        self.inner.get(name.as_str()).await
    }

    pub async fn list(&self) -> Result<Vec<ResourceConfig>> {
        self.inner.list().await
    }

    pub async fn start(&self, name: &ResourceName) -> Result<Option<ResourceConfig>> {
        self.inner.start(name.as_str()).await
    }

    pub async fn stop(&self, name: &ResourceName) -> Result<Option<ResourceConfig>> {
        self.inner.stop(name.as_str()).await
    }

    pub async fn delete(&self, name: &ResourceName) -> Result<()> {
        self.inner.delete(name.as_str()).await
    }

    /// Add an export to a stopped NFS resource. An empty export path exports
    /// the volume at the resource's root directory.
    pub async fn add_volume(
        &self,
        name: &ResourceName,
        volume: NfsVolumeConfig,
    ) -> Result<Option<ResourceConfig>> {
        self.inner.add_volume(name.as_str(), volume).await
    }

    pub async fn delete_volume(
        &self,
        name: &ResourceName,
        number: u32,
    ) -> Result<Option<ResourceConfig>> {
        self.inner.delete_volume(name.as_str(), number).await
    }
}
