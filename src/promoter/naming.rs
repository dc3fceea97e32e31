//! Names generated for promoter configs and their start entries
//!
//! The agent name is the only link between a start entry and the volume it
//! serves, so every name the compilers emit, and every name the parsers
//! recognise, comes from here.

use crate::domain::volume::CLUSTER_PRIVATE_VOLUME_MOUNT_PATH;
use serde::{Deserialize, Serialize};
use std::fmt;

/// File name prefix of every promoter config owned by the gateway
const CONFIG_FILE_PREFIX: &str = "linstor-gateway-";
const CONFIG_FILE_SUFFIX: &str = ".toml";

pub const CLUSTER_PRIVATE_AGENT: &str = "fs_cluster_private";
pub const PORTBLOCK: &str = "portblock";
pub const PORTUNBLOCK: &str = "portunblock";
pub const SERVICE_IP: &str = "service_ip";
pub const ISCSI_TARGET: &str = "target";
pub const NVMET_SUBSYSTEM: &str = "subsys";
pub const NVMET_PORT: &str = "port";
pub const NFS_SERVER: &str = "nfsserver";

/// Gateway protocol, the first component of every config id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Iscsi,
    Nfs,
    Nvmeof,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Iscsi => "iscsi",
            Protocol::Nfs => "nfs",
            Protocol::Nvmeof => "nvmeof",
        }
    }

    /// Promoter config id: `<protocol>-<resource>`
    pub fn config_id(&self, resource: &str) -> String {
        format!("{}-{}", self.as_str(), resource)
    }

    /// Resource name encoded in a config id of this protocol
    pub fn resource_from_id<'a>(&self, id: &'a str) -> Option<&'a str> {
        id.strip_prefix(self.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|rest| !rest.is_empty())
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Config files
// =============================================================================

/// Path of the promoter config with the given id
pub fn config_path(promoter_dir: &str, id: &str) -> String {
    format!(
        "{}/{}{}{}",
        promoter_dir.trim_end_matches('/'),
        CONFIG_FILE_PREFIX,
        id,
        CONFIG_FILE_SUFFIX
    )
}

/// Config id of a file path, if the file is a gateway promoter config
pub fn config_id_from_path<'a>(promoter_dir: &str, path: &'a str) -> Option<&'a str> {
    path.strip_prefix(promoter_dir.trim_end_matches('/'))
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|file| file.strip_prefix(CONFIG_FILE_PREFIX))
        .and_then(|file| file.strip_suffix(CONFIG_FILE_SUFFIX))
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Resource definition property marking a config file as attached
pub fn attached_file_prop(path: &str) -> String {
    format!("files{}", path)
}

/// Mount point of the cluster-private volume of a resource
pub fn cluster_private_dir(resource: &str) -> String {
    format!("{}/{}", CLUSTER_PRIVATE_VOLUME_MOUNT_PATH, resource)
}

// =============================================================================
// Agent names
// =============================================================================

/// Port block agent of the i-th service IP (multi-IP protocols)
pub fn indexed_portblock(index: usize) -> String {
    format!("pblock{}", index)
}

/// Port unblock agent of the i-th service IP (multi-IP protocols)
pub fn indexed_portunblock(index: usize) -> String {
    format!("{}{}", PORTUNBLOCK, index)
}

/// IP address agent of the i-th service IP (multi-IP protocols)
pub fn indexed_service_ip(index: usize) -> String {
    format!("{}{}", SERVICE_IP, index)
}

pub fn logical_unit(volume: u32) -> String {
    format!("lu{}", volume)
}

pub fn parse_logical_unit(name: &str) -> Option<u32> {
    parse_number(name.strip_prefix("lu")?)
}

pub fn namespace(volume: u32) -> String {
    format!("ns_{}", volume)
}

pub fn parse_namespace(name: &str) -> Option<u32> {
    parse_number(name.strip_prefix("ns_")?)
}

pub fn filesystem(volume: u32) -> String {
    format!("fs_{}", volume)
}

pub fn parse_filesystem(name: &str) -> Option<u32> {
    parse_number(name.strip_prefix("fs_")?)
}

/// Export agent of a volume for the i-th allowed client
pub fn export(volume: u32, client: usize) -> String {
    format!("export_{}_{}", volume, client)
}

pub fn parse_export(name: &str) -> Option<(u32, usize)> {
    let (volume, client) = name.strip_prefix("export_")?.split_once('_')?;
    Some((parse_number(volume)?, parse_number(client)?))
}

// Digits only, so that "+1" or "fs_cluster_private" never decode to a volume
fn parse_number<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
