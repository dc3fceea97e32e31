//! Storage resource lifecycle
//!
//! Brings the replicated resource behind a gateway instance into the shape a
//! resource config asks for: group, definition, volume definitions and
//! placement.

use crate::domain::ports::{ResourceGroup, StorageBackend, VolumeDefinition, GROSS_SIZE_FLAG};
use crate::domain::volume::{UidGid, VolumeConfig};
use crate::error::Result;
use crate::promoter::Deployment;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub const DEFAULT_RESOURCE_GROUP: &str = "DfltRscGrp";

/// Place count of resource groups created by the gateway
pub const DEFAULT_PLACE_COUNT: u32 = 2;

pub const PROP_FILE_SYSTEM_TYPE: &str = "FileSystem/Type";
pub const PROP_FILE_SYSTEM_USER: &str = "FileSystem/User";
pub const PROP_FILE_SYSTEM_GROUP: &str = "FileSystem/Group";
pub const PROP_AUTO_PROMOTE: &str = "DrbdOptions/Resource/auto-promote";

/// The storage side of a gateway resource
#[derive(Debug, Clone)]
pub struct ResourceSpec<'a> {
    pub name: &'a str,
    pub resource_group: &'a str,
    /// All volumes, including the cluster-private one
    pub volumes: &'a [VolumeConfig],
    pub gross_size: bool,
}

/// Volume definition requested for a volume config
pub fn volume_definition(volume: &VolumeConfig, gross_size: bool) -> VolumeDefinition {
    let mut props = BTreeMap::new();
    if let Some(fs) = &volume.file_system {
        props.insert(PROP_FILE_SYSTEM_TYPE.to_string(), fs.clone());
        if let Some(owner) = volume.file_system_root_owner {
            props.insert(PROP_FILE_SYSTEM_USER.to_string(), owner.uid.to_string());
            props.insert(PROP_FILE_SYSTEM_GROUP.to_string(), owner.gid.to_string());
        }
    }

    VolumeDefinition {
        volume_number: volume.number,
        size_kib: volume.size_kib,
        props,
        flags: if gross_size {
            vec![GROSS_SIZE_FLAG.to_string()]
        } else {
            Vec::new()
        },
        uuid: String::new(),
    }
}

/// Recover the volume config a volume definition was created from
pub fn volume_from_definition(vd: &VolumeDefinition) -> VolumeConfig {
    let file_system = vd.props.get(PROP_FILE_SYSTEM_TYPE).cloned();

    let uid = vd.props.get(PROP_FILE_SYSTEM_USER).and_then(|u| u.parse().ok());
    let gid = vd.props.get(PROP_FILE_SYSTEM_GROUP).and_then(|g| g.parse().ok());
    let file_system_root_owner = match (uid, gid) {
        (Some(uid), Some(gid)) => Some(UidGid { uid, gid }),
        _ => None,
    };

    VolumeConfig {
        number: vd.volume_number,
        size_kib: vd.size_kib,
        file_system,
        file_system_root_owner,
    }
}

/// Create or reconcile the storage resource of a gateway instance.
///
/// With `allow_existing` unset an existing resource definition is reported as
/// `Error::ResourceExists` before anything is changed. Volume definitions not
/// named in `spec` are deleted.
pub async fn ensure_resource(
    backend: &dyn StorageBackend,
    spec: &ResourceSpec<'_>,
    allow_existing: bool,
) -> Result<Deployment> {
    let group = ResourceGroup {
        name: spec.resource_group.to_string(),
        place_count: DEFAULT_PLACE_COUNT,
        props: BTreeMap::new(),
    };
    match backend.create_resource_group(&group).await {
        Err(e) if !e.is_exists() => return Err(e),
        _ => {}
    }

    match backend
        .create_resource_definition(spec.name, spec.resource_group)
        .await
    {
        Ok(()) => info!("Created resource definition {}", spec.name),
        Err(e) if e.is_exists() && allow_existing => {
            debug!("Resource definition {} already exists", spec.name)
        }
        Err(e) => return Err(e),
    }

    for volume in spec.volumes {
        let vd = volume_definition(volume, spec.gross_size);
        match backend.create_volume_definition(spec.name, &vd).await {
            Err(e) if !e.is_exists() => return Err(e),
            _ => {}
        }
    }

    // Formatting happens on first promotion, so the placement needs to be
    // allowed to promote on its own.
    let any_file_system = spec.volumes.iter().any(|v| v.file_system.is_some());
    if any_file_system {
        set_auto_promote(backend, spec.name, "yes").await?;
    }

    match backend.autoplace(spec.name).await {
        Err(e) if !e.is_exists() => return Err(e),
        _ => {}
    }

    if any_file_system {
        set_auto_promote(backend, spec.name, "no").await?;
    }

    let wanted: BTreeSet<u32> = spec.volumes.iter().map(|v| v.number).collect();
    for vd in backend.list_volume_definitions(spec.name).await? {
        if wanted.contains(&vd.volume_number) {
            continue;
        }

        info!(
            "Deleting volume definition {}/{} not in config",
            spec.name, vd.volume_number
        );
        match backend
            .delete_volume_definition(spec.name, vd.volume_number)
            .await
        {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
    }

    let definition = backend.get_resource_definition(spec.name).await?;
    let group = backend
        .get_resource_group(&definition.resource_group_name)
        .await?;
    let volume_definitions = backend.list_volume_definitions(spec.name).await?;
    let resources = backend.resource_view(spec.name).await?;

    Ok(Deployment {
        definition,
        group,
        volume_definitions,
        resources,
    })
}

async fn set_auto_promote(backend: &dyn StorageBackend, resource: &str, value: &str) -> Result<()> {
    let mut props = BTreeMap::new();
    props.insert(PROP_AUTO_PROMOTE.to_string(), value.to_string());
    backend
        .modify_resource_definition(resource, props, Vec::new())
        .await
}
