//! Highly available iSCSI targets
//!
//! A target is backed by one replicated resource named after the unique part
//! of its IQN. Every volume except the cluster-private one is exported as a
//! logical unit with the volume number as LUN.

mod config;

pub use config::{ResourceConfig, DEFAULT_ISCSI_PORT, PRODUCT_ID};

use crate::controlplane::orchestrator::{GatewayConfig, Orchestrator};
use crate::domain::identity::Iqn;
use crate::domain::ports::StorageBackend;
use crate::domain::volume::VolumeConfig;
use crate::error::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// iSCSI front end, addressing targets by IQN
pub struct Iscsi {
    inner: Orchestrator<ResourceConfig>,
}

impl Iscsi {
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

    /// Provision and start a target. Returns the existing target if an
    /// identical one is already deployed.
    pub async fn create(&self, rsc: ResourceConfig) -> Result<ResourceConfig> {
        self.inner.create(rsc).await
    }

    pub async fn get(&self, iqn: &Iqn) -> Result<Option<ResourceConfig>> {
        self.inner.get(iqn.wwn()).await
    }

    pub async fn list(&self) -> Result<Vec<ResourceConfig>> {
        self.inner.list().await
    }

    pub async fn start(&self, iqn: &Iqn) -> Result<Option<ResourceConfig>> {
        self.inner.start(iqn.wwn()).await
    }

    pub async fn stop(&self, iqn: &Iqn) -> Result<Option<ResourceConfig>> {
        self.inner.stop(iqn.wwn()).await
    }

    pub async fn delete(&self, iqn: &Iqn) -> Result<()> {
        self.inner.delete(iqn.wwn()).await
    }

    /// Add a logical unit to a stopped target
    pub async fn add_volume(
        &self,
        iqn: &Iqn,
        volume: VolumeConfig,
    ) -> Result<Option<ResourceConfig>> {
        self.inner.add_volume(iqn.wwn(), volume).await
    }

    /// Remove a logical unit from a stopped target
    pub async fn delete_volume(&self, iqn: &Iqn, lun: u32) -> Result<Option<ResourceConfig>> {
        self.inner.delete_volume(iqn.wwn(), lun).await
    }
}
