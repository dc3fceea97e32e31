//! In-memory Storage Backend
//!
//! Keeps resource groups, definitions, placements and external files in
//! process memory. Used by the standalone CLI mode and by tests.
//!
//! The backend also plays the part of the HA supervisor: attaching a promoter
//! config puts the resource in use on its first replica, detaching or deleting
//! the config releases it again. Releasing can be delayed to mimic a slow
//! demotion, and an in-use resource definition cannot be deleted.

use crate::controlplane::lifecycle::{DEFAULT_PLACE_COUNT, DEFAULT_RESOURCE_GROUP};
use crate::domain::ports::{
    DeployedVolume, ExternalFile, ResourceDefinition, ResourceGroup, ResourceWithVolumes,
    StorageBackend, VolumeDefinition, DEVICE_SYMLINK_PROP_PREFIX,
};
use crate::error::{Error, Result};
use crate::promoter::naming;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

const FIRST_DRBD_MINOR: u32 = 1000;

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone)]
struct Placement {
    node_name: String,
    in_use: bool,
    demote_at: Option<Instant>,
}

impl Placement {
    fn new(node_name: String) -> Self {
        Self {
            node_name,
            in_use: false,
            demote_at: None,
        }
    }

    fn is_in_use(&self) -> bool {
        self.in_use && self.demote_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Debug, Default)]
struct State {
    groups: BTreeMap<String, ResourceGroup>,
    definitions: BTreeMap<String, ResourceDefinition>,
    volumes: BTreeMap<String, BTreeMap<u32, (VolumeDefinition, u32)>>,
    placements: BTreeMap<String, Vec<Placement>>,
    files: BTreeMap<String, Vec<u8>>,
    next_minor: u32,
    demote_delay: Duration,
}

impl State {
    fn definition_mut(&mut self, name: &str) -> Result<&mut ResourceDefinition> {
        self.definitions.get_mut(name).ok_or_else(|| not_found("ResourceDefinition", name))
    }

    fn release(&mut self, resource: &str) {
        let delay = self.demote_delay;
        let Some(placements) = self.placements.get_mut(resource) else {
            return;
        };

        for placement in placements.iter_mut().filter(|p| p.in_use) {
            if delay.is_zero() {
                placement.in_use = false;
                placement.demote_at = None;
            } else if placement.demote_at.is_none() {
                placement.demote_at = Some(Instant::now() + delay);
            }
        }
    }

    fn view(&self, resource: &str) -> Vec<ResourceWithVolumes> {
        let Some(definition) = self.definitions.get(resource) else {
            return Vec::new();
        };
        let volumes = self.volumes.get(resource);

        self.placements
            .get(resource)
            .into_iter()
            .flatten()
            .map(|placement| ResourceWithVolumes {
                name: resource.to_string(),
                node_name: placement.node_name.clone(),
                uuid: definition.uuid.clone(),
                in_use: Some(placement.is_in_use()),
                volumes: volumes
                    .into_iter()
                    .flat_map(|v| v.values())
                    .map(|(vd, minor)| deployed_volume(resource, vd, *minor))
                    .collect(),
            })
            .collect()
    }
}

fn deployed_volume(resource: &str, vd: &VolumeDefinition, minor: u32) -> DeployedVolume {
    let mut props = BTreeMap::new();
    props.insert(
        format!("{}0", DEVICE_SYMLINK_PROP_PREFIX),
        format!("/dev/drbd/by-res/{}/{}", resource, vd.volume_number),
    );

    DeployedVolume {
        volume_number: vd.volume_number,
        device_path: format!("/dev/drbd{}", minor),
        disk_state: "UpToDate".to_string(),
        props,
        uuid: vd.uuid.clone(),
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.into(),
        name: name.into(),
    }
}

fn exists(kind: &str, name: &str) -> Error {
    Error::ResourceExists {
        kind: kind.into(),
        name: name.into(),
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

/// Storage backend kept entirely in memory
pub struct MemoryBackend {
    nodes: Vec<String>,
    state: RwLock<State>,
}

impl MemoryBackend {
    /// Create a backend whose resources are placed on the given nodes
    pub fn new(nodes: Vec<String>) -> Self {
        let mut state = State {
            next_minor: FIRST_DRBD_MINOR,
            ..Default::default()
        };
        state.groups.insert(
            DEFAULT_RESOURCE_GROUP.to_string(),
            ResourceGroup {
                name: DEFAULT_RESOURCE_GROUP.to_string(),
                place_count: DEFAULT_PLACE_COUNT,
                props: BTreeMap::new(),
            },
        );

        Self {
            nodes,
            state: RwLock::new(state),
        }
    }

    /// Keep released resources in use for `delay` before they demote
    pub fn with_demote_delay(mut self, delay: Duration) -> Self {
        self.state.get_mut().demote_delay = delay;
        self
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Move the resource to the given node, or release it everywhere
    pub async fn set_in_use(&self, resource: &str, node: Option<&str>) {
        let mut state = self.state.write().await;
        if let Some(placements) = state.placements.get_mut(resource) {
            for placement in placements.iter_mut() {
                placement.in_use = Some(placement.node_name.as_str()) == node;
                placement.demote_at = None;
            }
        }
    }

    /// Number of resource definitions currently known
    pub async fn resource_definition_count(&self) -> usize {
        self.state.read().await.definitions.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(vec!["node1".into(), "node2".into(), "node3".into()])
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn create_resource_group(&self, group: &ResourceGroup) -> Result<()> {
        let mut state = self.state.write().await;
        if state.groups.contains_key(&group.name) {
            return Err(exists("ResourceGroup", &group.name));
        }

        info!("Creating resource group: {}", group.name);
        state.groups.insert(group.name.clone(), group.clone());
        Ok(())
    }

    async fn get_resource_group(&self, name: &str) -> Result<ResourceGroup> {
        self.state
            .read()
            .await
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("ResourceGroup", name))
    }

    async fn create_resource_definition(&self, name: &str, resource_group: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.definitions.contains_key(name) {
            return Err(exists("ResourceDefinition", name));
        }
        if !state.groups.contains_key(resource_group) {
            return Err(not_found("ResourceGroup", resource_group));
        }

        info!("Creating resource definition: {} in {}", name, resource_group);
        state.definitions.insert(
            name.to_string(),
            ResourceDefinition {
                name: name.to_string(),
                resource_group_name: resource_group.to_string(),
                props: BTreeMap::new(),
                uuid: uuid::Uuid::new_v4().to_string(),
            },
        );
        Ok(())
    }

    async fn get_resource_definition(&self, name: &str) -> Result<ResourceDefinition> {
        self.state
            .read()
            .await
            .definitions
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("ResourceDefinition", name))
    }

    async fn delete_resource_definition(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.definitions.contains_key(name) {
            return Err(not_found("ResourceDefinition", name));
        }
        if let Some(primary) = state
            .placements
            .get(name)
            .and_then(|placements| placements.iter().find(|p| p.is_in_use()))
        {
            return Err(Error::backend(
                "delete resource definition",
                format!("resource {} is in use on {}", name, primary.node_name),
            ));
        }

        state.definitions.remove(name);

        info!("Deleting resource definition: {}", name);
        state.volumes.remove(name);
        state.placements.remove(name);
        Ok(())
    }

    async fn modify_resource_definition(
        &self,
        name: &str,
        set: BTreeMap<String, String>,
        delete: Vec<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let definition = state.definition_mut(name)?;

        for key in delete {
            definition.props.remove(&key);
        }
        definition.props.extend(set);
        Ok(())
    }

    async fn create_volume_definition(
        &self,
        resource: &str,
        volume: &VolumeDefinition,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.definition_mut(resource)?;

        let minor = state.next_minor;
        let volumes = state.volumes.entry(resource.to_string()).or_default();
        if volumes.contains_key(&volume.volume_number) {
            return Err(exists(
                "VolumeDefinition",
                &format!("{}/{}", resource, volume.volume_number),
            ));
        }

        let mut vd = volume.clone();
        if vd.uuid.is_empty() {
            vd.uuid = uuid::Uuid::new_v4().to_string();
        }

        debug!("Creating volume definition {}/{}", resource, vd.volume_number);
        volumes.insert(vd.volume_number, (vd, minor));
        state.next_minor += 1;
        Ok(())
    }

    async fn list_volume_definitions(&self, resource: &str) -> Result<Vec<VolumeDefinition>> {
        let state = self.state.read().await;
        if !state.definitions.contains_key(resource) {
            return Err(not_found("ResourceDefinition", resource));
        }

        Ok(state
            .volumes
            .get(resource)
            .into_iter()
            .flat_map(|v| v.values())
            .map(|(vd, _)| vd.clone())
            .collect())
    }

    async fn delete_volume_definition(&self, resource: &str, volume_number: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let removed = state
            .volumes
            .get_mut(resource)
            .and_then(|v| v.remove(&volume_number));

        match removed {
            Some(_) => {
                debug!("Deleted volume definition {}/{}", resource, volume_number);
                Ok(())
            }
            None => Err(not_found(
                "VolumeDefinition",
                &format!("{}/{}", resource, volume_number),
            )),
        }
    }

    async fn autoplace(&self, resource: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let group_name = state.definition_mut(resource)?.resource_group_name.clone();

        if state.placements.contains_key(resource) {
            return Err(exists("Resource", resource));
        }

        let place_count = match state.groups.get(&group_name) {
            Some(group) if group.place_count > 0 => group.place_count,
            _ => DEFAULT_PLACE_COUNT,
        };

        if self.nodes.len() < place_count as usize {
            return Err(Error::backend(
                "autoplace",
                format!(
                    "not enough nodes for {} replicas of {}",
                    place_count, resource
                ),
            ));
        }

        let placements: Vec<Placement> = self
            .nodes
            .iter()
            .take(place_count as usize)
            .map(|node| Placement::new(node.clone()))
            .collect();

        info!("Placed {} on {} nodes", resource, placements.len());
        state.placements.insert(resource.to_string(), placements);
        Ok(())
    }

    async fn resource_view(&self, resource: &str) -> Result<Vec<ResourceWithVolumes>> {
        Ok(self.state.read().await.view(resource))
    }

    async fn list_external_files(&self) -> Result<Vec<ExternalFile>> {
        Ok(self
            .state
            .read()
            .await
            .files
            .iter()
            .map(|(path, content)| ExternalFile {
                path: path.clone(),
                content: content.clone(),
            })
            .collect())
    }

    async fn get_external_file(&self, path: &str) -> Result<ExternalFile> {
        self.state
            .read()
            .await
            .files
            .get(path)
            .map(|content| ExternalFile {
                path: path.to_string(),
                content: content.clone(),
            })
            .ok_or_else(|| not_found("ExternalFile", path))
    }

    async fn put_external_file(&self, file: &ExternalFile) -> Result<()> {
        self.state
            .write()
            .await
            .files
            .insert(file.path.clone(), file.content.clone());
        Ok(())
    }

    async fn delete_external_file(&self, path: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.files.remove(path).is_none() {
            return Err(not_found("ExternalFile", path));
        }

        let prop = naming::attached_file_prop(path);
        let attached: Vec<String> = state
            .definitions
            .values_mut()
            .filter_map(|def| def.props.remove(&prop).map(|_| def.name.clone()))
            .collect();
        for resource in attached {
            state.release(&resource);
        }
        Ok(())
    }

    async fn attach_external_file(&self, resource: &str, path: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.files.contains_key(path) {
            return Err(not_found("ExternalFile", path));
        }

        state
            .definition_mut(resource)?
            .props
            .insert(naming::attached_file_prop(path), "True".to_string());

        if let Some(placements) = state.placements.get_mut(resource) {
            if !placements.iter().any(Placement::is_in_use) {
                for placement in placements.iter_mut() {
                    placement.in_use = false;
                    placement.demote_at = None;
                }
                if let Some(first) = placements.first_mut() {
                    debug!("Promoting {} on {}", resource, first.node_name);
                    first.in_use = true;
                }
            }
        }
        Ok(())
    }

    async fn detach_external_file(&self, resource: &str, path: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .definition_mut(resource)?
            .props
            .remove(&naming::attached_file_prop(path));
        state.release(resource);
        Ok(())
    }
}
