//! NVMe-oF subsystem configuration and its promoter representation

use crate::controlplane::lifecycle::{volume_from_definition, DEFAULT_RESOURCE_GROUP};
use crate::controlplane::orchestrator::GatewayResource;
use crate::domain::identity::Nqn;
use crate::domain::net::ServiceIp;
use crate::domain::ports::{ResourceDefinition, ResourceWithVolumes, VolumeDefinition, GROSS_SIZE_FLAG};
use crate::domain::volume::{
    assign_volume_numbers, validate_volumes, ResourceStatus, VolumeConfig,
    CLUSTER_PRIVATE_VOLUME_NUMBER,
};
use crate::error::{Error, Result};
use crate::promoter::entry::{
    AGENT_FILESYSTEM, AGENT_IPADDR2, AGENT_NVMET_NAMESPACE, AGENT_NVMET_PORT,
    AGENT_NVMET_SUBSYSTEM, AGENT_PORTBLOCK,
};
use crate::promoter::{naming, PromoterConfig, Protocol, ResourceAgent};
use crate::protocols::{
    cluster_private_agent, derived_uuid, expect_cluster_private, find_volume_definition,
    first_deployed, pair_volumes, parse_service_ip, parsed_resource, portblock_agent,
    portunblock_agent, promoter_config, serial_number, service_ip_agent, unexpected_agent,
    PortBlocks,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

pub const DEFAULT_NVMEOF_PORT: u16 = 4420;

/// Namespace of the UUIDs and NGUIDs handed out to NVMe namespaces
pub const NVMEOF_UUID_NAMESPACE: &str = "nvmeof.gateway.linstor.linbit.com";

// portblock, fs_cluster_private, service_ip, subsys, port, portunblock
const MIN_AGENT_ENTRIES: usize = 6;

const SERIAL_BYTES: usize = 8;

/// A highly available NVMe-oF subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub nqn: Nqn,
    pub service_ip: ServiceIp,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub gross_size: bool,
}

impl ResourceConfig {
    pub fn new(nqn: Nqn, service_ip: ServiceIp, volumes: Vec<VolumeConfig>) -> Self {
        Self {
            nqn,
            service_ip,
            resource_group: String::new(),
            volumes,
            status: ResourceStatus::default(),
            gross_size: false,
        }
    }

    fn port_agent(&self) -> ResourceAgent {
        let agent = ResourceAgent::new(AGENT_NVMET_PORT, naming::NVMET_PORT)
            .attr("nqns", self.nqn.to_string())
            .attr("addr", self.service_ip.addr().to_string())
            .attr("type", "tcp")
            .attr("svcid", DEFAULT_NVMEOF_PORT.to_string());

        match self.service_ip.addr() {
            IpAddr::V4(_) => agent,
            IpAddr::V6(_) => agent.attr("adrfam", "ipv6"),
        }
    }
}

impl GatewayResource for ResourceConfig {
    const PROTOCOL: Protocol = Protocol::Nvmeof;

    type Volume = VolumeConfig;

    fn resource_name(&self) -> &str {
        self.nqn.subsystem()
    }

    fn resource_group(&self) -> &str {
        &self.resource_group
    }

    fn fill_defaults(&mut self) {
        if self.resource_group.is_empty() {
            self.resource_group = DEFAULT_RESOURCE_GROUP.to_string();
        }
        assign_volume_numbers(&mut self.volumes);
    }

    fn valid(&mut self) -> Result<()> {
        if self.nqn.subsystem().len() < 2 {
            return Err(Error::Validation(
                "nvme subsystem string too short (min. 2)".into(),
            ));
        }

        validate_volumes(&mut self.volumes)
    }

    fn matches(&self, other: &Self) -> bool {
        self.nqn == other.nqn
            && self.service_ip.to_string() == other.service_ip.to_string()
            && self.resource_group == other.resource_group
            && self.volumes.len() == other.volumes.len()
            && self
                .volumes
                .iter()
                .zip(&other.volumes)
                .all(|(a, b)| a.number == b.number && a.size_kib == b.size_kib)
    }

    fn service_addrs(&self) -> Vec<IpAddr> {
        vec![self.service_ip.addr()]
    }

    fn volumes(&self) -> &[VolumeConfig] {
        &self.volumes
    }

    fn volumes_mut(&mut self) -> &mut Vec<VolumeConfig> {
        &mut self.volumes
    }

    fn cluster_private_volume() -> VolumeConfig {
        VolumeConfig::cluster_private()
    }

    fn gross_size(&self) -> bool {
        self.gross_size
    }

    fn to_promoter(&self, deployment: &[ResourceWithVolumes]) -> Result<PromoterConfig> {
        let deployed = first_deployed(deployment)?;
        let volumes = pair_volumes(&self.volumes, &deployed.volumes)?;
        let name = self.resource_name();
        let nqn = self.nqn.to_string();

        let mut start = vec![
            portblock_agent(naming::PORTBLOCK.to_string(), &self.service_ip, DEFAULT_NVMEOF_PORT),
            cluster_private_agent(volumes[0].1, name),
            service_ip_agent(naming::SERVICE_IP.to_string(), &self.service_ip),
            ResourceAgent::new(AGENT_NVMET_SUBSYSTEM, naming::NVMET_SUBSYSTEM)
                .attr("nqn", &nqn)
                .attr("serial", serial_number(&nqn, SERIAL_BYTES)),
        ];

        for (vol, dep) in volumes.iter().skip(1) {
            // namespace ids start at 1, same as the volume numbers
            let guid = derived_uuid(NVMEOF_UUID_NAMESPACE, &deployed.uuid, &dep.uuid).to_string();
            start.push(
                ResourceAgent::new(AGENT_NVMET_NAMESPACE, naming::namespace(vol.number))
                    .attr("nqn", &nqn)
                    .attr("namespace_id", vol.number.to_string())
                    .attr("backing_path", dep.preferred_device_path())
                    .attr("uuid", &guid)
                    .attr("nguid", &guid),
            );
        }

        start.push(self.port_agent());
        start.push(portunblock_agent(
            naming::PORTUNBLOCK.to_string(),
            &self.service_ip,
            DEFAULT_NVMEOF_PORT,
            name,
        ));

        Ok(promoter_config(Protocol::Nvmeof, name, start, "Requires"))
    }

    fn from_promoter(
        cfg: &PromoterConfig,
        definition: &ResourceDefinition,
        volume_definitions: &[VolumeDefinition],
    ) -> Result<Self> {
        let id = cfg.id.as_str();
        let (name, rsc) = parsed_resource(Protocol::Nvmeof, cfg, MIN_AGENT_ENTRIES)?;

        let mut nqn = None;
        let mut service_ips = Vec::new();
        let mut namespaces = BTreeSet::new();
        let mut blocks = PortBlocks::default();

        for agent in rsc.agents() {
            match agent.agent_type.as_str() {
                AGENT_PORTBLOCK => blocks.observe(id, agent)?,
                AGENT_IPADDR2 => service_ips.push(parse_service_ip(id, agent)?),
                AGENT_FILESYSTEM => expect_cluster_private(id, agent)?,
                AGENT_NVMET_SUBSYSTEM => {
                    let parsed = Nqn::new(agent.require("nqn")?)
                        .map_err(|e| Error::malformed(id, format!("failed to parse NQN: {}", e)))?;
                    nqn = Some(parsed);
                }
                AGENT_NVMET_NAMESPACE => {
                    let number = naming::parse_namespace(&agent.name).ok_or_else(|| {
                        Error::malformed(id, format!("unexpected namespace name {}", agent.name))
                    })?;
                    namespaces.insert(number);
                }
                AGENT_NVMET_PORT => {}
                _ => return Err(unexpected_agent(id, agent)),
            }
        }

        let nqn = nqn.ok_or_else(|| Error::malformed(id, "missing nvmet-subsystem agent"))?;
        if nqn.subsystem() != name {
            return Err(Error::malformed(
                id,
                format!("subsystem {} does not belong to resource {}", nqn, name),
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

        let mut volumes = vec![volume_from_definition(find_volume_definition(
            id,
            volume_definitions,
            CLUSTER_PRIVATE_VOLUME_NUMBER,
        )?)];
        for number in namespaces {
            volumes.push(volume_from_definition(find_volume_definition(
                id,
                volume_definitions,
                number,
            )?));
        }

        Ok(Self {
            resource_group: definition.resource_group_name.clone(),
            gross_size: volume_definitions.iter().any(|vd| vd.has_flag(GROSS_SIZE_FLAG)),
            ..Self::new(nqn, service_ip, volumes)
        })
    }

    fn status(&self) -> &ResourceStatus {
        &self.status
    }

    fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::lifecycle::volume_definition;
    use crate::domain::ports::DeployedVolume;
    use assert_matches::assert_matches;

    fn config() -> ResourceConfig {
        let mut cfg = ResourceConfig::new(
            Nqn::new("nqn.2021-08.com.linbit:nvme:vol1").unwrap(),
            "192.168.0.1/24".parse().unwrap(),
            vec![
                VolumeConfig::cluster_private(),
                VolumeConfig::new(1, 1024 * 1024),
                VolumeConfig::new(2, 2 * 1024 * 1024),
            ],
        );
        cfg.resource_group = DEFAULT_RESOURCE_GROUP.into();
        cfg
    }

    fn deployment(resource_uuid: &str) -> Vec<ResourceWithVolumes> {
        let volumes = (0..3)
            .map(|n| {
                let mut vol = DeployedVolume {
                    volume_number: n,
                    device_path: format!("/dev/drbd100{}", n),
                    disk_state: "UpToDate".into(),
                    uuid: format!("vol-uuid-{}", n),
                    ..Default::default()
                };
                vol.props.insert(
                    "Satellite/Device/Symlinks/0".into(),
                    format!("/dev/drbd/by-res/vol1/{}", n),
                );
                vol
            })
            .collect();

        vec![ResourceWithVolumes {
            name: "vol1".into(),
            node_name: "node1".into(),
            uuid: resource_uuid.into(),
            in_use: Some(true),
            volumes,
        }]
    }

    fn definition() -> ResourceDefinition {
        ResourceDefinition {
            name: "vol1".into(),
            resource_group_name: DEFAULT_RESOURCE_GROUP.into(),
            ..Default::default()
        }
    }

    fn volume_definitions() -> Vec<VolumeDefinition> {
        config().volumes.iter().map(|v| volume_definition(v, false)).collect()
    }

    #[test]
    fn test_start_list() {
        let promoter = config().to_promoter(&deployment("rsc-uuid")).unwrap();
        assert_eq!(promoter.id, "nvmeof-vol1");

        let (name, rsc) = promoter.single_resource().unwrap();
        assert_eq!(name, "vol1");
        assert_eq!(rsc.target_as, "Requires");

        let agents: Vec<&ResourceAgent> = rsc.agents().collect();
        let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "portblock",
                "fs_cluster_private",
                "service_ip",
                "subsys",
                "ns_1",
                "ns_2",
                "port",
                "portunblock"
            ]
        );

        assert_eq!(agents[3].get("serial").len(), 16);
        assert_eq!(agents[4].get("namespace_id"), "1");
        assert_eq!(agents[4].get("backing_path"), "/dev/drbd/by-res/vol1/1");
        assert_eq!(agents[4].get("uuid"), agents[4].get("nguid"));
        assert_ne!(agents[4].get("uuid"), agents[5].get("uuid"));
        assert_eq!(agents[6].get("nqns"), "nqn.2021-08.com.linbit:nvme:vol1");
        assert_eq!(agents[6].get("addr"), "192.168.0.1");
        assert_eq!(agents[6].get("svcid"), "4420");
        assert_eq!(agents[7].get("action"), "unblock");
        assert_eq!(agents[7].get("tickle_dir"), "/srv/ha/internal/vol1");
    }

    #[test]
    fn test_namespace_uuid_depends_on_deployment() {
        let a = config().to_promoter(&deployment("rsc-uuid-a")).unwrap();
        let b = config().to_promoter(&deployment("rsc-uuid-b")).unwrap();
        let again = config().to_promoter(&deployment("rsc-uuid-a")).unwrap();

        let uuid_of = |cfg: &PromoterConfig| {
            cfg.single_resource()
                .unwrap()
                .1
                .agents()
                .find(|a| a.name == "ns_1")
                .unwrap()
                .get("uuid")
                .to_string()
        };
        assert_ne!(uuid_of(&a), uuid_of(&b));
        assert_eq!(uuid_of(&a), uuid_of(&again));
        assert_eq!(a.encode().unwrap(), again.encode().unwrap());
    }

    #[test]
    fn test_round_trip() {
        let cfg = config();
        let text = cfg.to_promoter(&deployment("rsc-uuid")).unwrap().encode().unwrap();
        let decoded = crate::promoter::decode(&text).unwrap().remove(0);

        let parsed =
            ResourceConfig::from_promoter(&decoded, &definition(), &volume_definitions()).unwrap();
        assert_eq!(parsed, cfg);
        assert!(parsed.matches(&cfg));
    }

    #[test]
    fn test_ipv6_port() {
        let mut cfg = config();
        cfg.service_ip = "fd00::10/64".parse().unwrap();

        let promoter = cfg.to_promoter(&deployment("rsc-uuid")).unwrap();
        let port = promoter
            .single_resource()
            .unwrap()
            .1
            .agents()
            .find(|a| a.agent_type == AGENT_NVMET_PORT)
            .unwrap()
            .clone();
        assert_eq!(port.get("addr"), "fd00::10");
        assert_eq!(port.get("adrfam"), "ipv6");

        let parsed =
            ResourceConfig::from_promoter(&promoter, &definition(), &volume_definitions()).unwrap();
        assert_eq!(parsed.service_ip, cfg.service_ip);
    }

    #[test]
    fn test_parse_errors() {
        let mut promoter = config().to_promoter(&deployment("rsc-uuid")).unwrap();
        promoter.id = "iscsi-vol1".into();
        assert_matches!(
            ResourceConfig::from_promoter(&promoter, &definition(), &volume_definitions()),
            Err(Error::MalformedPromoterConfig { .. })
        );

        let mut promoter = config().to_promoter(&deployment("rsc-uuid")).unwrap();
        promoter.resources.get_mut("vol1").unwrap().start.truncate(5);
        assert_matches!(
            ResourceConfig::from_promoter(&promoter, &definition(), &volume_definitions()),
            Err(Error::MalformedPromoterConfig { ref reason, .. }) if reason.contains("too few")
        );

        let promoter = config().to_promoter(&deployment("rsc-uuid")).unwrap();
        let missing_vd: Vec<VolumeDefinition> = volume_definitions()
            .into_iter()
            .filter(|vd| vd.volume_number != 2)
            .collect();
        assert_matches!(
            ResourceConfig::from_promoter(&promoter, &definition(), &missing_vd),
            Err(Error::MalformedPromoterConfig { ref reason, .. })
                if reason.contains("volume number 2")
        );
    }

    #[test]
    fn test_valid_and_matches() {
        let mut cfg = ResourceConfig::new(
            Nqn::new("nqn.2021-08.com.linbit:nvme:vol1").unwrap(),
            "192.168.0.1/24".parse().unwrap(),
            vec![VolumeConfig::new(0, 1024)],
        );
        cfg.fill_defaults();
        assert_eq!(cfg.volumes[0].number, 1);
        cfg.valid().unwrap();

        cfg.volumes.push(VolumeConfig::new(1, 1024));
        assert_matches!(cfg.valid(), Err(Error::Validation(_)));

        let mut other = config();
        other.service_ip = "192.168.0.1/16".parse().unwrap();
        assert!(!config().matches(&other));
    }
}
