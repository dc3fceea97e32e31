//! Volume and status data model shared by all gateway protocols

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Cluster-private volume
// =============================================================================

/// Volume number reserved for the cluster-private volume
pub const CLUSTER_PRIVATE_VOLUME_NUMBER: u32 = 0;

/// Size of the cluster-private volume (64 MiB)
pub const CLUSTER_PRIVATE_VOLUME_SIZE_KIB: u64 = 64 * 1024;

/// File system the cluster-private volume is formatted with
pub const CLUSTER_PRIVATE_VOLUME_FILE_SYSTEM: &str = "ext4";

/// Base directory the cluster-private volume is mounted under
pub const CLUSTER_PRIVATE_VOLUME_MOUNT_PATH: &str = "/srv/ha/internal";

// =============================================================================
// Volume configuration
// =============================================================================

/// Owner of the root directory of a formatted volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidGid {
    pub uid: u32,
    pub gid: u32,
}

impl fmt::Display for UidGid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

impl FromStr for UidGid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("'{}' is not a valid uid:gid pair", s));

        let (uid, gid) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            uid: uid.parse().map_err(|_| invalid())?,
            gid: gid.parse().map_err(|_| invalid())?,
        })
    }
}

/// A single volume of a gateway resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume number; 0 in a request means "assign one"
    #[serde(default)]
    pub number: u32,
    /// Size in KiB
    pub size_kib: u64,
    /// File system to format the volume with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_system: Option<String>,
    /// Owner of the file system root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_system_root_owner: Option<UidGid>,
}

impl VolumeConfig {
    pub fn new(number: u32, size_kib: u64) -> Self {
        Self {
            number,
            size_kib,
            ..Default::default()
        }
    }

    /// The reserved volume holding cluster-wide service state
    pub fn cluster_private() -> Self {
        Self {
            number: CLUSTER_PRIVATE_VOLUME_NUMBER,
            size_kib: CLUSTER_PRIVATE_VOLUME_SIZE_KIB,
            file_system: Some(CLUSTER_PRIVATE_VOLUME_FILE_SYSTEM.to_string()),
            file_system_root_owner: Some(UidGid { uid: 0, gid: 0 }),
        }
    }

    pub fn is_cluster_private(&self) -> bool {
        self.number == CLUSTER_PRIVATE_VOLUME_NUMBER
    }
}

/// Access to the common volume fields of a protocol specific volume type
pub trait AsVolume {
    fn volume(&self) -> &VolumeConfig;
    fn volume_mut(&mut self) -> &mut VolumeConfig;
}

impl AsVolume for VolumeConfig {
    fn volume(&self) -> &VolumeConfig {
        self
    }

    fn volume_mut(&mut self) -> &mut VolumeConfig {
        self
    }
}

/// Assign numbers to unnumbered volumes, starting at 1 and skipping numbers
/// that are already taken
pub fn assign_volume_numbers<V: AsVolume>(volumes: &mut [V]) {
    let mut taken: BTreeSet<u32> = volumes
        .iter()
        .map(|v| v.volume().number)
        .filter(|n| *n != 0)
        .collect();

    let mut next = 1;
    for vol in volumes.iter_mut().filter(|v| v.volume().number == 0) {
        while taken.contains(&next) {
            next += 1;
        }
        vol.volume_mut().number = next;
        taken.insert(next);
    }
}

/// Sort volumes by number and check the volume invariants.
///
/// Volume 0 is accepted only as the leading cluster-private volume.
pub fn validate_volumes<V: AsVolume>(volumes: &mut [V]) -> Result<()> {
    volumes.sort_by_key(|v| v.volume().number);

    for (i, vol) in volumes.iter().enumerate() {
        let vol = vol.volume();

        if i > 0 && vol.number < 1 {
            return Err(Error::Validation("volume numbers must start at 1".into()));
        }

        if vol.size_kib == 0 {
            return Err(Error::Validation("volume size must be positive".into()));
        }

        if i > 0 && volumes[i - 1].volume().number == vol.number {
            return Err(Error::Validation("volume numbers must be unique".into()));
        }
    }

    Ok(())
}

/// Put the cluster-private volume in front of the requested volumes, unless
/// it is already present
pub fn with_cluster_private<V: AsVolume>(volumes: &mut Vec<V>, private: V) {
    if !volumes.iter().any(|v| v.volume().is_cluster_private()) {
        volumes.insert(0, private);
    }
}

/// Drop the cluster-private volume before handing a config to a caller
pub fn strip_cluster_private<V: AsVolume>(volumes: &mut Vec<V>) {
    volumes.retain(|v| !v.volume().is_cluster_private());
}

// =============================================================================
// Status
// =============================================================================

/// Health of a resource or volume, ordered by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    #[default]
    Unknown,
    OK,
    Degraded,
    Bad,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Unknown => write!(f, "Unknown"),
            ResourceState::OK => write!(f, "OK"),
            ResourceState::Degraded => write!(f, "Degraded"),
            ResourceState::Bad => write!(f, "Bad"),
        }
    }
}

/// Whether the promoter config is attached to the resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    #[default]
    Stopped,
    Started,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "Stopped"),
            ServiceState::Started => write!(f, "Started"),
        }
    }
}

/// Health of a single volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeState {
    pub number: u32,
    pub state: ResourceState,
}

/// Live status of a gateway resource. Always derived, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub state: ResourceState,
    pub service: ServiceState,
    /// Node the resource is in use on, empty if none
    pub primary: String,
    pub nodes: Vec<String>,
    pub volumes: Vec<VolumeState>,
}

impl ResourceStatus {
    /// Drop the state entry of the cluster-private volume
    pub fn strip_cluster_private(&mut self) {
        self.volumes
            .retain(|v| v.number != CLUSTER_PRIVATE_VOLUME_NUMBER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_assign_volume_numbers_skips_taken() {
        let mut volumes = vec![
            VolumeConfig::new(0, 1024),
            VolumeConfig::new(1, 1024),
            VolumeConfig::new(0, 2048),
        ];
        assign_volume_numbers(&mut volumes);

        let numbers: Vec<u32> = volumes.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![2, 1, 3]);
    }

    #[test]
    fn test_validate_volumes_sorts() {
        let mut volumes = vec![
            VolumeConfig::new(2, 1024),
            VolumeConfig::cluster_private(),
            VolumeConfig::new(1, 1024),
        ];
        validate_volumes(&mut volumes).unwrap();

        let numbers: Vec<u32> = volumes.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_validate_volumes_rejects() {
        let mut zero_size = vec![VolumeConfig::cluster_private(), VolumeConfig::new(1, 0)];
        assert_matches!(
            validate_volumes(&mut zero_size),
            Err(Error::Validation(msg)) if msg == "volume size must be positive"
        );

        let mut duplicate = vec![
            VolumeConfig::cluster_private(),
            VolumeConfig::new(1, 1024),
            VolumeConfig::new(1, 2048),
        ];
        assert_matches!(
            validate_volumes(&mut duplicate),
            Err(Error::Validation(msg)) if msg == "volume numbers must be unique"
        );

        let mut second_zero = vec![VolumeConfig::cluster_private(), VolumeConfig::new(0, 1024)];
        assert_matches!(
            validate_volumes(&mut second_zero),
            Err(Error::Validation(msg)) if msg == "volume numbers must start at 1"
        );
    }

    #[test]
    fn test_cluster_private_boundaries() {
        let mut volumes = vec![VolumeConfig::new(1, 1024)];
        with_cluster_private(&mut volumes, VolumeConfig::cluster_private());
        with_cluster_private(&mut volumes, VolumeConfig::cluster_private());
        assert_eq!(volumes.len(), 2);
        assert!(volumes[0].is_cluster_private());

        strip_cluster_private(&mut volumes);
        assert_eq!(volumes, vec![VolumeConfig::new(1, 1024)]);
    }

    #[test]
    fn test_state_severity_and_serde() {
        assert!(ResourceState::Bad > ResourceState::Degraded);
        assert!(ResourceState::Degraded > ResourceState::OK);
        assert!(ResourceState::OK > ResourceState::Unknown);

        assert_eq!(serde_json::to_string(&ResourceState::OK).unwrap(), r#""OK""#);
        assert_eq!(
            serde_json::from_str::<ServiceState>(r#""Started""#).unwrap(),
            ServiceState::Started
        );
        assert!(serde_json::from_str::<ResourceState>(r#""Great""#).is_err());
    }

    #[test]
    fn test_uid_gid() {
        let owner: UidGid = "1000:100".parse().unwrap();
        assert_eq!(owner, UidGid { uid: 1000, gid: 100 });
        assert_eq!(owner.to_string(), "1000:100");
        assert!("1000".parse::<UidGid>().is_err());
    }
}
