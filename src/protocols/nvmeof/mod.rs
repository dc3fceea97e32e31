//! Highly available NVMe-oF subsystems
//!
//! A subsystem is backed by one replicated resource named after the
//! subsystem part of its NQN. Volume numbers double as namespace ids.

mod config;

pub use config::{ResourceConfig, DEFAULT_NVMEOF_PORT, NVMEOF_UUID_NAMESPACE};

use crate::controlplane::orchestrator::{GatewayConfig, Orchestrator};
use crate::domain::identity::Nqn;
use crate::domain::ports::StorageBackend;
use crate::domain::volume::VolumeConfig;
use crate::error::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// NVMe-oF front end, addressing subsystems by NQN
pub struct Nvmeof {
    inner: Orchestrator<ResourceConfig>,
}

impl Nvmeof {
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

    pub async fn get(&self, nqn: &Nqn) -> Result<Option<ResourceConfig>> {
        self.inner.get(nqn.subsystem()).await
    }

    pub async fn list(&self) -> Result<Vec<ResourceConfig>> {
        self.inner.list().await
    }

    pub async fn start(&self, nqn: &Nqn) -> Result<Option<ResourceConfig>> {
        self.inner.start(nqn.subsystem()).await
    }

    pub async fn stop(&self, nqn: &Nqn) -> Result<Option<ResourceConfig>> {
        self.inner.stop(nqn.subsystem()).await
    }

    pub async fn delete(&self, nqn: &Nqn) -> Result<()> {
        self.inner.delete(nqn.subsystem()).await
    }

    /// Add a namespace to a stopped subsystem
    pub async fn add_volume(
        &self,
        nqn: &Nqn,
        volume: VolumeConfig,
    ) -> Result<Option<ResourceConfig>> {
        self.inner.add_volume(nqn.subsystem(), volume).await
    }

    pub async fn delete_volume(&self, nqn: &Nqn, number: u32) -> Result<Option<ResourceConfig>> {
        self.inner.delete_volume(nqn.subsystem(), number).await
    }
}
