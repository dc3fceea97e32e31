//! Domain Ports - Storage backend boundary
//!
//! The gateway never talks to the replicated storage layer directly. Everything
//! it needs (resource groups, resource and volume definitions, placement, the
//! live resource view and the external file store that carries promoter
//! configs) goes through the [`StorageBackend`] trait.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property prefix under which the satellite publishes device symlinks
pub const DEVICE_SYMLINK_PROP_PREFIX: &str = "Satellite/Device/Symlinks/";

/// Volume definition flag requesting that the size includes metadata
pub const GROSS_SIZE_FLAG: &str = "GROSS_SIZE";

// =============================================================================
// Definitions
// =============================================================================

/// Placement policy shared by a set of resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Resource group name
    pub name: String,
    /// Number of diskful replicas autoplace should create
    pub place_count: u32,
    /// Group properties
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// A replicated resource, independent of where it is placed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Resource name
    pub name: String,
    /// Resource group the definition belongs to
    pub resource_group_name: String,
    /// Definition properties, including attached external files
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    /// Backend assigned UUID
    #[serde(default)]
    pub uuid: String,
}

/// One volume of a resource definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    /// Volume number within the resource
    pub volume_number: u32,
    /// Size in KiB
    pub size_kib: u64,
    /// Volume definition properties
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    /// Volume definition flags, e.g. `GROSS_SIZE`
    #[serde(default)]
    pub flags: Vec<String>,
    /// Backend assigned UUID
    #[serde(default)]
    pub uuid: String,
}

impl VolumeDefinition {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

// =============================================================================
// Deployed resources
// =============================================================================

/// A volume of a resource as deployed on one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedVolume {
    /// Volume number within the resource
    pub volume_number: u32,
    /// Kernel device path, e.g. `/dev/drbd1000`
    pub device_path: String,
    /// Replication disk state, e.g. `UpToDate` or `Diskless`
    pub disk_state: String,
    /// Volume properties, including device symlinks
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    /// UUID of the volume, shared across nodes
    #[serde(default)]
    pub uuid: String,
}

impl DeployedVolume {
    /// Device path to hand to resource agents.
    ///
    /// Uses the published device symlinks when available, preferring the
    /// stable `/by-res/` link.
    pub fn preferred_device_path(&self) -> &str {
        let symlinks: Vec<&str> = self
            .props
            .iter()
            .filter(|(k, _)| k.starts_with(DEVICE_SYMLINK_PROP_PREFIX))
            .map(|(_, v)| v.as_str())
            .collect();

        symlinks
            .iter()
            .copied()
            .find(|v| v.contains("/by-res/"))
            .or_else(|| symlinks.first().copied())
            .unwrap_or(self.device_path.as_str())
    }
}

/// A resource as deployed on one node, together with its volumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceWithVolumes {
    /// Resource name
    pub name: String,
    /// Node the resource is deployed on
    pub node_name: String,
    /// UUID of the resource definition
    #[serde(default)]
    pub uuid: String,
    /// Whether the resource is opened (primary) on this node, if known
    #[serde(default)]
    pub in_use: Option<bool>,
    /// Deployed volumes, ordered by volume number
    #[serde(default)]
    pub volumes: Vec<DeployedVolume>,
}

impl ResourceWithVolumes {
    pub fn is_in_use(&self) -> bool {
        self.in_use.unwrap_or(false)
    }
}

/// An opaque file distributed by the backend to the nodes of every resource
/// it is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFile {
    /// Absolute path of the file on the nodes
    pub path: String,
    /// File content
    pub content: Vec<u8>,
}

// =============================================================================
// Storage Backend Port
// =============================================================================

/// Port for the replicated storage control plane.
///
/// "Not found" answers are reported as `Error::ResourceNotFound` and "already
/// exists" answers as `Error::ResourceExists`, so callers can decide which of
/// them are expected.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create a resource group
    async fn create_resource_group(&self, group: &ResourceGroup) -> Result<()>;

    /// Get a resource group by name
    async fn get_resource_group(&self, name: &str) -> Result<ResourceGroup>;

    /// Create a resource definition in the given resource group
    async fn create_resource_definition(&self, name: &str, resource_group: &str) -> Result<()>;

    /// Get a resource definition by name
    async fn get_resource_definition(&self, name: &str) -> Result<ResourceDefinition>;

    /// Delete a resource definition together with all its resources
    async fn delete_resource_definition(&self, name: &str) -> Result<()>;

    /// Set and delete resource definition properties
    async fn modify_resource_definition(
        &self,
        name: &str,
        set: BTreeMap<String, String>,
        delete: Vec<String>,
    ) -> Result<()>;

    /// Create a volume definition
    async fn create_volume_definition(&self, resource: &str, volume: &VolumeDefinition)
        -> Result<()>;

    /// List the volume definitions of a resource
    async fn list_volume_definitions(&self, resource: &str) -> Result<Vec<VolumeDefinition>>;

    /// Delete a volume definition
    async fn delete_volume_definition(&self, resource: &str, volume_number: u32) -> Result<()>;

    /// Place the resource according to its resource group
    async fn autoplace(&self, resource: &str) -> Result<()>;

    /// Get the per-node view of a resource
    async fn resource_view(&self, resource: &str) -> Result<Vec<ResourceWithVolumes>>;

    /// List all external files, including their content
    async fn list_external_files(&self) -> Result<Vec<ExternalFile>>;

    /// Get a single external file
    async fn get_external_file(&self, path: &str) -> Result<ExternalFile>;

    /// Create or replace an external file
    async fn put_external_file(&self, file: &ExternalFile) -> Result<()>;

    /// Delete an external file
    async fn delete_external_file(&self, path: &str) -> Result<()>;

    /// Deploy an external file to the nodes of a resource
    async fn attach_external_file(&self, resource: &str, path: &str) -> Result<()>;

    /// Remove an external file from the nodes of a resource
    async fn detach_external_file(&self, resource: &str, path: &str) -> Result<()>;
}
