//! Gateway protocols
//!
//! Each protocol module pairs a resource config, its promoter compiler and
//! parser, and a typed front end over the generic orchestrator. The helpers
//! below build and read the start entries all protocols share.

pub mod iscsi;
pub mod nfs;
pub mod nvmeof;

use crate::domain::net::ServiceIp;
use crate::domain::ports::{DeployedVolume, ResourceWithVolumes, VolumeDefinition};
use crate::domain::volume::{AsVolume, CLUSTER_PRIVATE_VOLUME_FILE_SYSTEM, CLUSTER_PRIVATE_VOLUME_NUMBER};
use crate::error::{Error, Result};
use crate::promoter::entry::{AGENT_FILESYSTEM, AGENT_IPADDR2, AGENT_PORTBLOCK};
use crate::promoter::{naming, PromoterConfig, PromoterResourceConfig, Protocol, ResourceAgent};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// =============================================================================
// Compiling
// =============================================================================

/// The replica whose volumes the start list refers to
pub(crate) fn first_deployed(deployment: &[ResourceWithVolumes]) -> Result<&ResourceWithVolumes> {
    deployment.first().ok_or(Error::MissingDeployment)
}

/// Pair declared volumes with deployed ones, position by position.
///
/// Both lists are sorted by volume number and start with the cluster-private
/// volume.
pub(crate) fn pair_volumes<'a, V: AsVolume>(
    volumes: &'a [V],
    deployed: &'a [DeployedVolume],
) -> Result<Vec<(&'a V, &'a DeployedVolume)>> {
    if volumes.len() != deployed.len() {
        return Err(Error::VolumeCountMismatch {
            declared: volumes.len(),
            deployed: deployed.len(),
        });
    }

    let pairs: Vec<(&V, &DeployedVolume)> = volumes.iter().zip(deployed).collect();
    for (vol, dep) in &pairs {
        if vol.volume().number != dep.volume_number {
            return Err(Error::InconsistentVolumes {
                expected: dep.volume_number,
                actual: vol.volume().number,
            });
        }
    }

    let first = pairs.first().map(|(vol, _)| vol.volume().number);
    if first != Some(CLUSTER_PRIVATE_VOLUME_NUMBER) {
        return Err(Error::InconsistentVolumes {
            expected: CLUSTER_PRIVATE_VOLUME_NUMBER,
            actual: first.unwrap_or_default(),
        });
    }

    Ok(pairs)
}

pub(crate) fn cluster_private_agent(deployed: &DeployedVolume, resource: &str) -> ResourceAgent {
    ResourceAgent::new(AGENT_FILESYSTEM, naming::CLUSTER_PRIVATE_AGENT)
        .attr("device", deployed.preferred_device_path())
        .attr("directory", naming::cluster_private_dir(resource))
        .attr("fstype", CLUSTER_PRIVATE_VOLUME_FILE_SYSTEM)
        .attr("run_fsck", "no")
}

/// Drop incoming connections to the service port while the service moves
pub(crate) fn portblock_agent(name: String, ip: &ServiceIp, port: u16) -> ResourceAgent {
    ResourceAgent::new(AGENT_PORTBLOCK, name)
        .attr("ip", ip.addr().to_string())
        .attr("portno", port.to_string())
        .attr("action", "block")
        .attr("protocol", "tcp")
}

/// Re-open the service port once everything is up
pub(crate) fn portunblock_agent(
    name: String,
    ip: &ServiceIp,
    port: u16,
    resource: &str,
) -> ResourceAgent {
    ResourceAgent::new(AGENT_PORTBLOCK, name)
        .attr("ip", ip.addr().to_string())
        .attr("portno", port.to_string())
        .attr("action", "unblock")
        .attr("protocol", "tcp")
        .attr("tickle_dir", naming::cluster_private_dir(resource))
}

pub(crate) fn service_ip_agent(name: String, ip: &ServiceIp) -> ResourceAgent {
    ResourceAgent::new(AGENT_IPADDR2, name)
        .attr("ip", ip.addr().to_string())
        .attr("cidr_netmask", ip.prefix().to_string())
}

/// Single resource config with the settings every gateway service uses
pub(crate) fn promoter_config(
    protocol: Protocol,
    resource: &str,
    start: Vec<ResourceAgent>,
    target_as: &str,
) -> PromoterConfig {
    PromoterConfig::new(
        protocol,
        resource,
        PromoterResourceConfig::systemd(start.into_iter().map(Into::into).collect(), target_as),
    )
}

/// Hex encoded prefix of the SHA-256 digest of `input`
pub(crate) fn serial_number(input: &str, bytes: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..bytes.min(digest.len())])
}

/// Stable per-volume UUID, unique per deployment
pub(crate) fn derived_uuid(namespace: &str, resource_uuid: &str, volume_uuid: &str) -> Uuid {
    let namespace = Uuid::new_v5(&Uuid::nil(), namespace.as_bytes());
    let resource = Uuid::new_v5(&namespace, resource_uuid.as_bytes());
    Uuid::new_v5(&resource, volume_uuid.as_bytes())
}

// =============================================================================
// Parsing
// =============================================================================

/// The start list of a gateway promoter config, with the resource name
/// taken from the config id
pub(crate) fn parsed_resource<'a>(
    protocol: Protocol,
    cfg: &'a PromoterConfig,
    min_entries: usize,
) -> Result<(&'a str, &'a PromoterResourceConfig)> {
    let name = protocol.resource_from_id(&cfg.id).ok_or_else(|| {
        Error::malformed(&cfg.id, format!("id is not a {} config id", protocol))
    })?;

    let (resource, rsc) = cfg.single_resource()?;
    if resource != name {
        return Err(Error::malformed(
            &cfg.id,
            format!("promotes resource {} instead of {}", resource, name),
        ));
    }

    if rsc.start.len() < min_entries {
        return Err(Error::malformed(
            &cfg.id,
            format!(
                "config has too few agent entries, expected at least {}, got {}",
                min_entries,
                rsc.start.len()
            ),
        ));
    }

    Ok((name, rsc))
}

pub(crate) fn parse_service_ip(id: &str, agent: &ResourceAgent) -> Result<ServiceIp> {
    let ip = agent.get("ip");
    let addr = ip
        .parse()
        .map_err(|_| Error::malformed(id, format!("malformed ip {}", ip)))?;
    let prefix = agent
        .get("cidr_netmask")
        .parse()
        .map_err(|_| Error::malformed(id, "failed to parse service ip prefix"))?;

    ServiceIp::from_parts(addr, prefix)
}

/// Counts of port block and unblock agents seen in a start list
#[derive(Debug, Default)]
pub(crate) struct PortBlocks {
    blocks: usize,
    unblocks: usize,
}

impl PortBlocks {
    pub fn observe(&mut self, id: &str, agent: &ResourceAgent) -> Result<()> {
        match agent.get("action") {
            "block" => self.blocks += 1,
            "unblock" => self.unblocks += 1,
            other => {
                return Err(Error::malformed(
                    id,
                    format!("unknown portblock action '{}' in {}", other, agent.name),
                ))
            }
        }
        Ok(())
    }

    /// Every service IP needs exactly one block and one unblock agent
    pub fn check(&self, id: &str, service_ips: usize) -> Result<()> {
        if self.blocks != self.unblocks {
            return Err(Error::malformed(
                id,
                "got a different number of portblock and portunblock agents",
            ));
        }
        if self.blocks != service_ips {
            return Err(Error::malformed(
                id,
                "got a different number of portblock agents than IPaddr2 agents",
            ));
        }
        Ok(())
    }
}

/// Reject a file system agent other than the cluster-private one
pub(crate) fn expect_cluster_private(id: &str, agent: &ResourceAgent) -> Result<()> {
    if agent.name != naming::CLUSTER_PRIVATE_AGENT {
        return Err(Error::malformed(
            id,
            format!("unexpected file system agent {}", agent.name),
        ));
    }
    Ok(())
}

pub(crate) fn unexpected_agent(id: &str, agent: &ResourceAgent) -> Error {
    Error::malformed(id, format!("unexpected resource agent: {}", agent.agent_type))
}

pub(crate) fn find_volume_definition<'a>(
    id: &str,
    volume_definitions: &'a [VolumeDefinition],
    number: u32,
) -> Result<&'a VolumeDefinition> {
    volume_definitions
        .iter()
        .find(|vd| vd.volume_number == number)
        .ok_or_else(|| {
            Error::malformed(id, format!("no volume definition for volume number {}", number))
        })
}
