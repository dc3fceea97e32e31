//! Gateway Orchestrator
//!
//! Drives the lifecycle of a gateway instance of any protocol:
//! - Provisioning the replicated resource
//! - Compiling and persisting the promoter config
//! - Starting and stopping the service through the HA supervisor
//! - Reconciling volumes of a stopped service

use crate::controlplane::lifecycle::{self, ResourceSpec};
use crate::controlplane::status::status_from_resources;
use crate::controlplane::wait::{self, PollSettings};
use crate::domain::ports::{ResourceDefinition, ResourceWithVolumes, StorageBackend, VolumeDefinition};
use crate::domain::volume::{
    strip_cluster_private, with_cluster_private, AsVolume, ResourceStatus, ServiceState,
    VolumeConfig, CLUSTER_PRIVATE_VOLUME_NUMBER,
};
use crate::error::{Error, Result};
use crate::promoter::{ConfigStore, Deployment, PromoterConfig, Protocol, DEFAULT_PROMOTER_DIR};
use serde::Serialize;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Gateway Configuration
// =============================================================================

/// Configuration shared by all protocol orchestrators
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory drbd-reactor reads promoter configs from
    pub promoter_dir: String,
    /// Deadline for a resource to reach the requested state
    pub resource_timeout: Duration,
    /// Pause between two resource state queries
    pub poll_interval: Duration,
    /// Consecutive checks a started resource has to stay on its node
    pub stability_checks: u32,
    /// Pause between two stability checks
    pub stability_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let poll = PollSettings::default();
        Self {
            promoter_dir: DEFAULT_PROMOTER_DIR.to_string(),
            resource_timeout: poll.timeout,
            poll_interval: poll.interval,
            stability_checks: poll.stability_checks,
            stability_interval: poll.stability_interval,
        }
    }
}

impl GatewayConfig {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            timeout: self.resource_timeout,
            interval: self.poll_interval,
            stability_checks: self.stability_checks,
            stability_interval: self.stability_interval,
        }
    }
}

// =============================================================================
// Gateway Resource
// =============================================================================

/// A protocol specific resource config the orchestrator can deploy.
///
/// Volume lists handed to the orchestrator never contain the cluster-private
/// volume; it is added on create and removed again before a config is
/// returned.
pub trait GatewayResource: Clone + Send + Sync + Serialize + Sized + 'static {
    /// Protocol served, used for config ids
    const PROTOCOL: Protocol;

    /// Protocol specific volume type
    type Volume: AsVolume + Clone + Send + Sync;

    /// Name of the backing storage resource
    fn resource_name(&self) -> &str;

    fn resource_group(&self) -> &str;

    fn fill_defaults(&mut self);

    /// Check the config invariants. Sorts volumes by number.
    fn valid(&mut self) -> Result<()>;

    /// Whether `other` describes the same deployment
    fn matches(&self, other: &Self) -> bool;

    /// Addresses the service binds
    fn service_addrs(&self) -> Vec<IpAddr>;

    fn volumes(&self) -> &[Self::Volume];

    fn volumes_mut(&mut self) -> &mut Vec<Self::Volume>;

    /// The reserved cluster-private volume in this protocol's volume type
    fn cluster_private_volume() -> Self::Volume;

    /// Defaults applied to a volume added to an existing resource
    fn volume_defaults(&self, _volume: &mut Self::Volume) {}

    /// Whether volume sizes include replication metadata
    fn gross_size(&self) -> bool {
        false
    }

    /// Compile into a promoter config for the given deployment
    fn to_promoter(&self, deployment: &[ResourceWithVolumes]) -> Result<PromoterConfig>;

    /// Recover a config from its promoter config and volume definitions
    fn from_promoter(
        cfg: &PromoterConfig,
        definition: &ResourceDefinition,
        volume_definitions: &[VolumeDefinition],
    ) -> Result<Self>;

    fn status(&self) -> &ResourceStatus;

    fn set_status(&mut self, status: ResourceStatus);
}

/// A deployed gateway instance as read from the backend
struct Loaded<R> {
    cfg: PromoterConfig,
    path: String,
    deployment: Deployment,
    /// Parsed config, cluster-private volume included
    resource: R,
    status: ResourceStatus,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Lifecycle operations for gateway instances of one protocol
pub struct Orchestrator<R> {
    store: ConfigStore,
    settings: PollSettings,
    cancel: CancellationToken,
    _resource: PhantomData<fn() -> R>,
}

impl<R: GatewayResource> Orchestrator<R> {
    pub fn new(backend: Arc<dyn StorageBackend>, config: &GatewayConfig) -> Self {
        Self {
            store: ConfigStore::new(backend, config.promoter_dir.clone()),
            settings: config.poll_settings(),
            cancel: CancellationToken::new(),
            _resource: PhantomData,
        }
    }

    /// Use the given token to abort waits
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn backend(&self) -> &dyn StorageBackend {
        self.store.backend().as_ref()
    }

    fn config_id(name: &str) -> String {
        R::PROTOCOL.config_id(name)
    }

    /// Create and start a gateway instance.
    ///
    /// Creating an instance that already exists with a matching config
    /// returns the existing instance unchanged.
    pub async fn create(&self, mut rsc: R) -> Result<R> {
        rsc.fill_defaults();
        with_cluster_private(rsc.volumes_mut(), R::cluster_private_volume());
        rsc.valid()?;

        let name = rsc.resource_name().to_string();
        let id = Self::config_id(&name);
        let addrs = rsc.service_addrs();

        let mut existing = None;
        for (cfg, path) in self.store.list_configs().await? {
            if cfg.id == id {
                existing = Some((cfg, path));
                continue;
            }
            for addr in &addrs {
                cfg.check_ip_collision(*addr)?;
            }
        }

        if let Some((cfg, path)) = existing {
            if let Some(deployed) = self.existing_deployment(&rsc, &cfg, &path).await? {
                info!("{} already exists with matching config", id);
                return Ok(deployed);
            }
        }

        let volumes: Vec<VolumeConfig> = rsc.volumes().iter().map(|v| v.volume().clone()).collect();
        let spec = ResourceSpec {
            name: &name,
            resource_group: rsc.resource_group(),
            volumes: &volumes,
            gross_size: rsc.gross_size(),
        };

        let deployment = match lifecycle::ensure_resource(self.backend(), &spec, false).await {
            Ok(deployment) => deployment,
            Err(e) if e.is_exists() => return Err(e),
            Err(e) => {
                self.rollback(&name).await;
                return Err(e);
            }
        };

        match self.deploy(&rsc, &deployment).await {
            Ok(created) => {
                info!("Created {}", id);
                Ok(created)
            }
            Err(e) => {
                self.rollback(&name).await;
                Err(e)
            }
        }
    }

    async fn deploy(&self, rsc: &R, deployment: &Deployment) -> Result<R> {
        let cfg = rsc.to_promoter(&deployment.resources)?;
        self.store.ensure_config(&cfg).await?;

        self.start(rsc.resource_name())
            .await?
            .ok_or(Error::MissingDeployment)
    }

    // Best effort: failures are logged and the original error is returned.
    async fn rollback(&self, name: &str) {
        debug!("Rollback: deleting just created resources of {}", name);

        if let Err(e) = self.store.delete_config(&Self::config_id(name)).await {
            warn!("Failed to roll back promoter config of {}: {}", name, e);
        }

        if let Err(e) = wait::wait_until(
            self.backend(),
            name,
            "unused",
            &self.settings,
            &self.cancel,
            wait::none_in_use,
        )
        .await
        {
            warn!("Resource {} still in use during rollback: {}", name, e);
        }

        match self.backend().delete_resource_definition(name).await {
            Err(e) if !e.is_not_found() => {
                warn!("Failed to roll back created resource definition {}: {}", name, e)
            }
            _ => {}
        }
    }

    /// The deployed instance behind an existing config. `None` if the config
    /// is a leftover without a storage resource.
    async fn existing_deployment(
        &self,
        rsc: &R,
        cfg: &PromoterConfig,
        path: &str,
    ) -> Result<Option<R>> {
        let deployment = match self.store.deployed_resources(cfg).await {
            Ok(deployment) => deployment,
            Err(e) if e.is_not_found() => {
                warn!("Found an existing promoter config but no corresponding storage resource");
                warn!("Ignoring and overwriting the existing configuration at {}", path);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let deployed = R::from_promoter(cfg, &deployment.definition, &deployment.volume_definitions)?;
        if !rsc.matches(&deployed) {
            debug!("Existing resource {} does not match the requested config", cfg.id);
            return Err(Error::IncompatibleResource { id: cfg.id.clone() });
        }

        Ok(Some(present(deployed, path, &deployment)))
    }

    async fn load(&self, name: &str) -> Result<Option<Loaded<R>>> {
        let id = Self::config_id(name);
        let Some(cfg) = self.store.find_config(&id).await? else {
            return Ok(None);
        };

        let deployment = match self.store.deployed_resources(&cfg).await {
            Ok(deployment) => deployment,
            Err(e) if e.is_not_found() => {
                debug!("Promoter config {} has no storage resource", id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let path = self.store.path(&id);
        let resource = R::from_promoter(&cfg, &deployment.definition, &deployment.volume_definitions)?;
        let status = status_from_resources(
            &path,
            &deployment.definition,
            &deployment.group,
            &deployment.resources,
        );

        Ok(Some(Loaded {
            cfg,
            path,
            deployment,
            resource,
            status,
        }))
    }

    /// Fetch a gateway instance with its live status
    pub async fn get(&self, name: &str) -> Result<Option<R>> {
        Ok(self
            .load(name)
            .await?
            .map(|loaded| present(loaded.resource, &loaded.path, &loaded.deployment)))
    }

    /// All gateway instances of this protocol
    pub async fn list(&self) -> Result<Vec<R>> {
        let mut result = Vec::new();

        for (cfg, path) in self.store.list_configs().await? {
            if R::PROTOCOL.resource_from_id(&cfg.id).is_none() {
                continue;
            }

            let deployment = match self.store.deployed_resources(&cfg).await {
                Ok(deployment) => deployment,
                Err(e) if e.is_not_found() => {
                    debug!("Skipping {} without storage resource", cfg.id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let parsed = R::from_promoter(&cfg, &deployment.definition, &deployment.volume_definitions)?;
            result.push(present(parsed, &path, &deployment));
        }

        Ok(result)
    }

    /// Attach the promoter config and wait for the service to come up
    pub async fn start(&self, name: &str) -> Result<Option<R>> {
        let Some(cfg) = self.store.find_config(&Self::config_id(name)).await? else {
            return Ok(None);
        };

        self.store.attach_config(&cfg).await?;
        wait::wait_until(
            self.backend(),
            name,
            "used",
            &self.settings,
            &self.cancel,
            wait::any_in_use,
        )
        .await?;
        wait::assert_in_use_stable(self.backend(), name, &self.settings, &self.cancel).await?;

        info!("Started {}", cfg.id);
        self.get(name).await
    }

    /// Detach the promoter config and wait for the service to go down
    pub async fn stop(&self, name: &str) -> Result<Option<R>> {
        let Some(cfg) = self.store.find_config(&Self::config_id(name)).await? else {
            return Ok(None);
        };

        self.store.detach_config(&cfg).await?;
        wait::wait_until(
            self.backend(),
            name,
            "unused",
            &self.settings,
            &self.cancel,
            wait::none_in_use,
        )
        .await?;

        info!("Stopped {}", cfg.id);
        self.get(name).await
    }

    /// Remove the promoter config and the storage resource
    pub async fn delete(&self, name: &str) -> Result<()> {
        let id = Self::config_id(name);
        self.store.delete_config(&id).await?;

        wait::wait_until(
            self.backend(),
            name,
            "unused",
            &self.settings,
            &self.cancel,
            wait::none_in_use,
        )
        .await?;

        match self.backend().delete_resource_definition(name).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        info!("Deleted {}", id);
        Ok(())
    }

    /// Add a volume to a stopped gateway instance.
    ///
    /// A volume number of 0 picks the next free number. Adding a volume that
    /// already exists with the same size only rewrites the promoter config.
    pub async fn add_volume(&self, name: &str, mut volume: R::Volume) -> Result<Option<R>> {
        let Some(loaded) = self.load(name).await? else {
            return Ok(None);
        };
        if loaded.status.service == ServiceState::Started {
            return Err(Error::ServiceRunning { id: loaded.cfg.id });
        }

        let mut rsc = loaded.resource;
        let mut deployment = loaded.deployment;

        if volume.volume().number == 0 {
            let next = rsc.volumes().iter().map(|v| v.volume().number).max().unwrap_or(0) + 1;
            volume.volume_mut().number = next;
        }
        rsc.volume_defaults(&mut volume);

        let requested = volume.volume();
        let existing = rsc
            .volumes()
            .iter()
            .map(AsVolume::volume)
            .find(|v| v.number == requested.number);

        match existing {
            Some(existing) if existing.size_kib != requested.size_kib => {
                return Err(Error::VolumeSizeMismatch {
                    number: requested.number,
                    existing: existing.size_kib,
                    requested: requested.size_kib,
                });
            }
            Some(_) => debug!("Volume {} of {} already exists", requested.number, name),
            None => {
                info!("Adding volume {} to {}", requested.number, loaded.cfg.id);
                rsc.volumes_mut().push(volume);
                rsc.valid()?;

                let volumes: Vec<VolumeConfig> =
                    rsc.volumes().iter().map(|v| v.volume().clone()).collect();
                let spec = ResourceSpec {
                    name,
                    resource_group: rsc.resource_group(),
                    volumes: &volumes,
                    gross_size: rsc.gross_size(),
                };
                deployment = lifecycle::ensure_resource(self.backend(), &spec, true).await?;
            }
        }

        let cfg = rsc.to_promoter(&deployment.resources)?;
        self.store.ensure_config(&cfg).await?;

        Ok(Some(present(rsc, &loaded.path, &deployment)))
    }

    /// Remove a volume from a stopped gateway instance. Removing a volume
    /// that does not exist returns the instance unchanged.
    pub async fn delete_volume(&self, name: &str, number: u32) -> Result<Option<R>> {
        if number == CLUSTER_PRIVATE_VOLUME_NUMBER {
            return Err(Error::Validation(
                "the cluster private volume cannot be deleted".into(),
            ));
        }

        let Some(loaded) = self.load(name).await? else {
            return Ok(None);
        };
        if loaded.status.service == ServiceState::Started {
            return Err(Error::ServiceRunning { id: loaded.cfg.id });
        }

        let mut rsc = loaded.resource;
        let Some(index) = rsc.volumes().iter().position(|v| v.volume().number == number) else {
            debug!("Volume {} of {} does not exist", number, name);
            return Ok(Some(present(rsc, &loaded.path, &loaded.deployment)));
        };

        info!("Deleting volume {} of {}", number, loaded.cfg.id);
        match self.backend().delete_volume_definition(name, number).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        rsc.volumes_mut().remove(index);
        let mut resources = loaded.deployment.resources;
        for resource in &mut resources {
            resource.volumes.retain(|v| v.volume_number != number);
        }

        let cfg = rsc.to_promoter(&resources)?;
        self.store.ensure_config(&cfg).await?;

        self.get(name).await
    }
}

/// Attach the live status and hide the cluster-private volume
fn present<R: GatewayResource>(mut rsc: R, path: &str, deployment: &Deployment) -> R {
    let mut status = status_from_resources(
        path,
        &deployment.definition,
        &deployment.group,
        &deployment.resources,
    );
    status.strip_cluster_private();

    strip_cluster_private(rsc.volumes_mut());
    rsc.set_status(status);
    rsc
}
