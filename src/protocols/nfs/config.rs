//! NFS export configuration and its promoter representation

use crate::controlplane::lifecycle::{volume_from_definition, DEFAULT_RESOURCE_GROUP};
use crate::controlplane::orchestrator::GatewayResource;
use crate::domain::identity::ResourceName;
use crate::domain::net::ServiceIp;
use crate::domain::ports::{ResourceDefinition, ResourceWithVolumes, VolumeDefinition};
use crate::domain::volume::{
    assign_volume_numbers, validate_volumes, AsVolume, ResourceStatus, VolumeConfig,
    CLUSTER_PRIVATE_VOLUME_FILE_SYSTEM, CLUSTER_PRIVATE_VOLUME_NUMBER,
};
use crate::error::{Error, Result};
use crate::promoter::entry::{
    AGENT_EXPORTFS, AGENT_FILESYSTEM, AGENT_IPADDR2, AGENT_NFSSERVER, AGENT_PORTBLOCK,
};
use crate::promoter::{naming, PromoterConfig, Protocol, ResourceAgent};
use crate::protocols::{
    cluster_private_agent, derived_uuid, find_volume_definition, first_deployed, pair_volumes,
    parse_service_ip, parsed_resource, portblock_agent, portunblock_agent, promoter_config,
    service_ip_agent, unexpected_agent, PortBlocks,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

pub const DEFAULT_NFS_PORT: u16 = 2049;

/// Directory all exports are mounted under
pub const EXPORT_BASE_PATH: &str = "/srv/gateway-exports";

/// Namespace of the export fsids
pub const NFS_UUID_NAMESPACE: &str = "nfs.gateway.linstor.linbit.com";

// portblock, fs_cluster_private, service_ip, nfsserver, portunblock
const MIN_AGENT_ENTRIES: usize = 5;

/// Clean up `path` and root it at `/`. `..` never climbs above the root.
pub fn rooted_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Directory a volume of the named resource is mounted at and exported from
pub fn export_directory(resource: &str, export_path: &str) -> String {
    match rooted_path(export_path).as_str() {
        "/" => format!("{}/{}", EXPORT_BASE_PATH, resource),
        rooted => format!("{}/{}{}", EXPORT_BASE_PATH, resource, rooted),
    }
}

/// An exported volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsVolumeConfig {
    #[serde(flatten)]
    pub volume: VolumeConfig,
    /// Path below the resource's export directory
    #[serde(default)]
    pub export_path: String,
}

impl NfsVolumeConfig {
    pub fn new(number: u32, size_kib: u64, export_path: impl Into<String>) -> Self {
        Self {
            volume: VolumeConfig::new(number, size_kib),
            export_path: export_path.into(),
        }
    }
}

impl AsVolume for NfsVolumeConfig {
    fn volume(&self) -> &VolumeConfig {
        &self.volume
    }

    fn volume_mut(&mut self) -> &mut VolumeConfig {
        &mut self.volume
    }
}

fn apply_volume_defaults(vol: &mut NfsVolumeConfig) {
    vol.export_path = rooted_path(&vol.export_path);
    if vol.volume.file_system.is_none() {
        vol.volume.file_system = Some(CLUSTER_PRIVATE_VOLUME_FILE_SYSTEM.to_string());
    }
}

/// A highly available NFS server exporting one or more volumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: ResourceName,
    pub service_ip: ServiceIp,
    /// Clients allowed to mount the exports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<ServiceIp>,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub volumes: Vec<NfsVolumeConfig>,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl ResourceConfig {
    pub fn new(name: ResourceName, service_ip: ServiceIp, volumes: Vec<NfsVolumeConfig>) -> Self {
        Self {
            name,
            service_ip,
            allowed_ips: Vec::new(),
            resource_group: String::new(),
            volumes,
            status: ResourceStatus::default(),
        }
    }

    fn nfsserver_agent(&self) -> ResourceAgent {
        let addr = self.service_ip.addr().to_string();
        ResourceAgent::new(AGENT_NFSSERVER, naming::NFS_SERVER)
            .attr("nfs_ip", &addr)
            .attr(
                "nfs_shared_infodir",
                format!("{}/nfs", naming::cluster_private_dir(self.name.as_str())),
            )
            .attr("nfs_server_scope", addr)
    }
}

/// Export path encoded in the mount directory of a volume agent
fn parse_export_path(id: &str, resource: &str, agent: &ResourceAgent) -> Result<String> {
    let base = export_directory(resource, "/");
    let dir = agent.get("directory");

    match dir.strip_prefix(&base) {
        Some("") => Ok("/".to_string()),
        Some(rest) if rest.starts_with('/') => Ok(rooted_path(rest)),
        _ => Err(Error::malformed(
            id,
            format!("export path {} not rooted in expected export path {}", dir, base),
        )),
    }
}

impl GatewayResource for ResourceConfig {
    const PROTOCOL: Protocol = Protocol::Nfs;

    type Volume = NfsVolumeConfig;

    fn resource_name(&self) -> &str {
        self.name.as_str()
    }

    fn resource_group(&self) -> &str {
        &self.resource_group
    }

    fn fill_defaults(&mut self) {
        if self.resource_group.is_empty() {
            self.resource_group = DEFAULT_RESOURCE_GROUP.to_string();
        }

        assign_volume_numbers(&mut self.volumes);
        for vol in self.volumes.iter_mut().filter(|v| !v.volume.is_cluster_private()) {
            apply_volume_defaults(vol);
        }

        if self.allowed_ips.is_empty() {
            self.allowed_ips = ServiceIp::allow_all();
        }
    }

    fn valid(&mut self) -> Result<()> {
        if self.name.as_str().len() < 2 {
            return Err(Error::Validation("nfs resource name too short (min. 2)".into()));
        }

        if self.allowed_ips.is_empty() {
            return Err(Error::Validation("missing allowed ips".into()));
        }

        validate_volumes(&mut self.volumes)?;

        let mut paths = BTreeSet::new();
        for vol in self.volumes.iter().filter(|v| !v.volume.is_cluster_private()) {
            if !paths.insert(rooted_path(&vol.export_path)) {
                return Err(Error::Validation("nfs export paths must be unique".into()));
            }
        }

        Ok(())
    }

    fn matches(&self, other: &Self) -> bool {
        self.name == other.name
            && self.service_ip.to_string() == other.service_ip.to_string()
            && self.resource_group == other.resource_group
            && self.allowed_ips.len() == other.allowed_ips.len()
            && self
                .allowed_ips
                .iter()
                .zip(&other.allowed_ips)
                .all(|(a, b)| a.to_string() == b.to_string())
            && self.volumes.len() == other.volumes.len()
            && self.volumes.iter().zip(&other.volumes).all(|(a, b)| {
                a.volume.number == b.volume.number
                    && a.volume.size_kib == b.volume.size_kib
                    && a.export_path == b.export_path
            })
    }

    fn service_addrs(&self) -> Vec<IpAddr> {
        vec![self.service_ip.addr()]
    }

    fn volumes(&self) -> &[NfsVolumeConfig] {
        &self.volumes
    }

    fn volumes_mut(&mut self) -> &mut Vec<NfsVolumeConfig> {
        &mut self.volumes
    }

    fn cluster_private_volume() -> NfsVolumeConfig {
        NfsVolumeConfig {
            volume: VolumeConfig::cluster_private(),
            export_path: String::new(),
        }
    }

    fn volume_defaults(&self, volume: &mut NfsVolumeConfig) {
        apply_volume_defaults(volume);
    }

    fn to_promoter(&self, deployment: &[ResourceWithVolumes]) -> Result<PromoterConfig> {
        let deployed = first_deployed(deployment)?;
        let volumes = pair_volumes(&self.volumes, &deployed.volumes)?;
        let name = self.resource_name();

        let mut start = vec![
            portblock_agent(naming::PORTBLOCK.to_string(), &self.service_ip, DEFAULT_NFS_PORT),
            cluster_private_agent(volumes[0].1, name),
            service_ip_agent(naming::SERVICE_IP.to_string(), &self.service_ip),
            self.nfsserver_agent(),
        ];

        for (vol, dep) in volumes.iter().skip(1) {
            let number = vol.volume.number;
            let directory = export_directory(name, &vol.export_path);
            let fsid = derived_uuid(NFS_UUID_NAMESPACE, &deployed.uuid, &dep.uuid).to_string();
            let fstype = vol
                .volume
                .file_system
                .as_deref()
                .unwrap_or(CLUSTER_PRIVATE_VOLUME_FILE_SYSTEM);

            start.push(
                ResourceAgent::new(AGENT_FILESYSTEM, naming::filesystem(number))
                    .attr("device", dep.preferred_device_path())
                    .attr("directory", &directory)
                    .attr("fstype", fstype)
                    .attr("run_fsck", "no"),
            );

            for (i, client) in self.allowed_ips.iter().enumerate() {
                start.push(
                    ResourceAgent::new(AGENT_EXPORTFS, naming::export(number, i))
                        .attr("directory", &directory)
                        .attr("fsid", &fsid)
                        .attr("clientspec", client.to_nfs_clientspec())
                        .attr("options", "rw")
                        .attr("wait_for_leasetime_on_stop", "1"),
                );
            }
        }

        start.push(portunblock_agent(
            naming::PORTUNBLOCK.to_string(),
            &self.service_ip,
            DEFAULT_NFS_PORT,
            name,
        ));

        Ok(promoter_config(Protocol::Nfs, name, start, "BindsTo"))
    }

    fn from_promoter(
        cfg: &PromoterConfig,
        definition: &ResourceDefinition,
        volume_definitions: &[VolumeDefinition],
    ) -> Result<Self> {
        let id = cfg.id.as_str();
        let (name, rsc) = parsed_resource(Protocol::Nfs, cfg, MIN_AGENT_ENTRIES)?;
        let resource = ResourceName::new(name)
            .map_err(|e| Error::malformed(id, format!("invalid resource name: {}", e)))?;

        let mut service_ips = Vec::new();
        let mut allowed_ips: Vec<ServiceIp> = Vec::new();
        let mut export_paths: BTreeMap<u32, String> = BTreeMap::new();
        let mut exported = BTreeSet::new();
        let mut blocks = PortBlocks::default();

        for agent in rsc.agents() {
            match agent.agent_type.as_str() {
                AGENT_PORTBLOCK => blocks.observe(id, agent)?,
                AGENT_IPADDR2 => service_ips.push(parse_service_ip(id, agent)?),
                AGENT_NFSSERVER => {}
                AGENT_FILESYSTEM if agent.name == naming::CLUSTER_PRIVATE_AGENT => {}
                AGENT_FILESYSTEM => {
                    let number = naming::parse_filesystem(&agent.name).ok_or_else(|| {
                        Error::malformed(
                            id,
                            format!("agent {} doesn't have expected name", agent.name),
                        )
                    })?;
                    export_paths.insert(number, parse_export_path(id, name, agent)?);
                }
                AGENT_EXPORTFS => {
                    let (number, _) = naming::parse_export(&agent.name).ok_or_else(|| {
                        Error::malformed(
                            id,
                            format!("agent {} doesn't have expected name", agent.name),
                        )
                    })?;
                    exported.insert(number);

                    let client = ServiceIp::from_nfs_clientspec(agent.get("clientspec"))
                        .map_err(|e| Error::malformed(id, e.to_string()))?;
                    if !allowed_ips
                        .iter()
                        .any(|ip| ip.to_string() == client.to_string())
                    {
                        allowed_ips.push(client);
                    }
                }
                _ => return Err(unexpected_agent(id, agent)),
            }
        }

        if let Some(number) = exported.iter().find(|n| !export_paths.contains_key(n)) {
            return Err(Error::malformed(
                id,
                format!("export of volume {} without a file system agent", number),
            ));
        }

        let service_ip = match service_ips.as_slice() {
            [ip] => *ip,
            ips => {
                return Err(Error::malformed(
                    id,
                    format!("expected exactly one service ip, got {}", ips.len()),
                ))
            }
        };
        blocks.check(id, 1)?;

        if allowed_ips.is_empty() {
            allowed_ips = ServiceIp::allow_all();
        }

        let mut volumes = vec![NfsVolumeConfig {
            volume: volume_from_definition(find_volume_definition(
                id,
                volume_definitions,
                CLUSTER_PRIVATE_VOLUME_NUMBER,
            )?),
            export_path: String::new(),
        }];
        for (number, export_path) in export_paths {
            volumes.push(NfsVolumeConfig {
                volume: volume_from_definition(find_volume_definition(
                    id,
                    volume_definitions,
                    number,
                )?),
                export_path,
            });
        }

        Ok(Self {
            allowed_ips,
            resource_group: definition.resource_group_name.clone(),
            ..Self::new(resource, service_ip, volumes)
        })
    }

    fn status(&self) -> &ResourceStatus {
        &self.status
    }

    fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
    }
}
