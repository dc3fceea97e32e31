//! iSCSI target configuration and its promoter representation

use crate::controlplane::lifecycle::{volume_from_definition, DEFAULT_RESOURCE_GROUP};
use crate::controlplane::orchestrator::GatewayResource;
use crate::domain::identity::Iqn;
use crate::domain::net::ServiceIp;
use crate::domain::ports::{ResourceDefinition, ResourceWithVolumes, VolumeDefinition, GROSS_SIZE_FLAG};
use crate::domain::volume::{
    assign_volume_numbers, validate_volumes, ResourceStatus, VolumeConfig,
    CLUSTER_PRIVATE_VOLUME_NUMBER,
};
use crate::error::{Error, Result};
use crate::promoter::entry::{
    AGENT_FILESYSTEM, AGENT_IPADDR2, AGENT_ISCSI_LU, AGENT_ISCSI_TARGET, AGENT_PORTBLOCK,
};
use crate::promoter::{naming, PromoterConfig, Protocol, ResourceAgent};
use crate::protocols::{
    cluster_private_agent, expect_cluster_private, find_volume_definition, first_deployed,
    pair_volumes, parse_service_ip, parsed_resource, portblock_agent, portunblock_agent,
    promoter_config, serial_number, service_ip_agent, unexpected_agent, PortBlocks,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::trace;

pub const DEFAULT_ISCSI_PORT: u16 = 3260;

/// SCSI product id reported by every logical unit
pub const PRODUCT_ID: &str = "LINSTOR iSCSI";

// portblock, fs_cluster_private, service_ip, target, portunblock
const MIN_AGENT_ENTRIES: usize = 5;

// Same length as the default serial of the iSCSILogicalUnit agent
const SCSI_SN_BYTES: usize = 4;

/// A highly available iSCSI target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub iqn: Iqn,
    /// Initiators allowed to log in; empty allows all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_initiators: Vec<Iqn>,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    /// CHAP user name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// CHAP password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub service_ips: Vec<ServiceIp>,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub gross_size: bool,
    /// iSCSI target implementation, e.g. `lio-t` or `scst`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
}

impl ResourceConfig {
    pub fn new(iqn: Iqn, service_ips: Vec<ServiceIp>, volumes: Vec<VolumeConfig>) -> Self {
        Self {
            iqn,
            allowed_initiators: Vec::new(),
            resource_group: String::new(),
            volumes,
            username: String::new(),
            password: String::new(),
            service_ips,
            status: ResourceStatus::default(),
            gross_size: false,
            implementation: None,
        }
    }

    /// `ip:port` list the target listens on
    fn portals(&self) -> String {
        self.service_ips
            .iter()
            .map(|ip| match ip.addr() {
                IpAddr::V4(addr) => format!("{}:{}", addr, DEFAULT_ISCSI_PORT),
                IpAddr::V6(addr) => format!("[{}]:{}", addr, DEFAULT_ISCSI_PORT),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn target_agent(&self) -> ResourceAgent {
        let allowed = self
            .allowed_initiators
            .iter()
            .map(Iqn::to_string)
            .collect::<Vec<_>>()
            .join(" ");

        let mut agent = ResourceAgent::new(AGENT_ISCSI_TARGET, naming::ISCSI_TARGET)
            .attr("iqn", self.iqn.to_string())
            .attr("portals", self.portals())
            .attr("incoming_username", &self.username)
            .attr("incoming_password", &self.password)
            .attr("allowed_initiators", allowed);
        if let Some(implementation) = &self.implementation {
            agent = agent.attr("implementation", implementation);
        }
        agent
    }

    /// Target level fields of a parsed config; volumes and IPs are filled in later
    fn from_target_agent(id: &str, agent: &ResourceAgent) -> Result<Self> {
        let iqn = Iqn::new(agent.require("iqn")?)
            .map_err(|e| Error::malformed(id, format!("got malformed iqn: {}", e)))?;

        let allowed_initiators = agent
            .get("allowed_initiators")
            .split_whitespace()
            .map(|allowed| {
                Iqn::new(allowed).map_err(|e| {
                    Error::malformed(
                        id,
                        format!("got malformed iqn {} for allowed initiators: {}", allowed, e),
                    )
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            allowed_initiators,
            username: agent.get("incoming_username").to_string(),
            password: agent.get("incoming_password").to_string(),
            implementation: agent
                .attributes
                .get("implementation")
                .filter(|i| !i.is_empty())
                .cloned(),
            ..Self::new(iqn, Vec::new(), Vec::new())
        })
    }
}

impl GatewayResource for ResourceConfig {
    const PROTOCOL: Protocol = Protocol::Iscsi;

    type Volume = VolumeConfig;

    fn resource_name(&self) -> &str {
        self.iqn.wwn()
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
        if self.iqn.wwn().len() < 2 {
            return Err(Error::Validation("iscsi wwn string too short (min. 2)".into()));
        }

        if self.service_ips.is_empty() {
            return Err(Error::Validation("missing service ips".into()));
        }

        validate_volumes(&mut self.volumes)
    }

    fn matches(&self, other: &Self) -> bool {
        self.iqn == other.iqn
            && self.service_ips.len() == other.service_ips.len()
            && self
                .service_ips
                .iter()
                .zip(&other.service_ips)
                .all(|(a, b)| a.to_string() == b.to_string())
            && self.resource_group == other.resource_group
            && self.volumes.len() == other.volumes.len()
            && self
                .volumes
                .iter()
                .zip(&other.volumes)
                .all(|(a, b)| a.number == b.number && a.size_kib == b.size_kib)
            && self.username == other.username
            && self.password == other.password
            && self.allowed_initiators == other.allowed_initiators
            && self
                .implementation
                .as_ref()
                .map_or(true, |wanted| other.implementation.as_ref() == Some(wanted))
    }

    fn service_addrs(&self) -> Vec<IpAddr> {
        self.service_ips.iter().map(ServiceIp::addr).collect()
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

        let serial = serial_number(&self.iqn.to_string(), SCSI_SN_BYTES);
        trace!("Setting scsi serial number of {} to {}", self.iqn, serial);

        let mut start = Vec::new();

        for (i, ip) in self.service_ips.iter().enumerate() {
            start.push(portblock_agent(naming::indexed_portblock(i), ip, DEFAULT_ISCSI_PORT));
        }

        start.push(cluster_private_agent(volumes[0].1, name));

        for (i, ip) in self.service_ips.iter().enumerate() {
            start.push(service_ip_agent(naming::indexed_service_ip(i), ip));
        }

        start.push(self.target_agent());

        for (vol, dep) in volumes.iter().skip(1) {
            let mut lu = ResourceAgent::new(AGENT_ISCSI_LU, naming::logical_unit(vol.number))
                .attr("target_iqn", self.iqn.to_string())
                .attr("lun", vol.number.to_string())
                .attr("path", dep.preferred_device_path())
                .attr("product_id", PRODUCT_ID)
                .attr("scsi_sn", &serial);
            if let Some(implementation) = &self.implementation {
                lu = lu.attr("implementation", implementation);
            }
            start.push(lu);
        }

        for (i, ip) in self.service_ips.iter().enumerate() {
            start.push(portunblock_agent(
                naming::indexed_portunblock(i),
                ip,
                DEFAULT_ISCSI_PORT,
                name,
            ));
        }

        Ok(promoter_config(Protocol::Iscsi, name, start, "Requires"))
    }

    fn from_promoter(
        cfg: &PromoterConfig,
        definition: &ResourceDefinition,
        volume_definitions: &[VolumeDefinition],
    ) -> Result<Self> {
        let id = cfg.id.as_str();
        let (name, rsc) = parsed_resource(Protocol::Iscsi, cfg, MIN_AGENT_ENTRIES)?;

        let mut target: Option<ResourceConfig> = None;
        let mut service_ips = Vec::new();
        let mut luns = BTreeSet::new();
        let mut blocks = PortBlocks::default();

        for agent in rsc.agents() {
            match agent.agent_type.as_str() {
                AGENT_PORTBLOCK => blocks.observe(id, agent)?,
                AGENT_IPADDR2 => service_ips.push(parse_service_ip(id, agent)?),
                AGENT_FILESYSTEM => expect_cluster_private(id, agent)?,
                AGENT_ISCSI_TARGET => target = Some(ResourceConfig::from_target_agent(id, agent)?),
                AGENT_ISCSI_LU => {
                    let lun = naming::parse_logical_unit(&agent.name).ok_or_else(|| {
                        Error::malformed(id, format!("unexpected logical unit name {}", agent.name))
                    })?;
                    luns.insert(lun);
                }
                _ => return Err(unexpected_agent(id, agent)),
            }
        }

        let mut r = target.ok_or_else(|| Error::malformed(id, "missing iSCSI target agent"))?;
        if r.iqn.wwn() != name {
            return Err(Error::malformed(
                id,
                format!("target {} does not belong to resource {}", r.iqn, name),
            ));
        }
        blocks.check(id, service_ips.len())?;

        r.service_ips = service_ips;
        r.resource_group = definition.resource_group_name.clone();
        r.gross_size = volume_definitions.iter().any(|vd| vd.has_flag(GROSS_SIZE_FLAG));

        r.volumes.push(volume_from_definition(find_volume_definition(
            id,
            volume_definitions,
            CLUSTER_PRIVATE_VOLUME_NUMBER,
        )?));
        for lun in luns {
            r.volumes
                .push(volume_from_definition(find_volume_definition(id, volume_definitions, lun)?));
        }

        Ok(r)
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
    use crate::domain::ports::DeployedVolume;
    use crate::promoter::StartEntry;
    use assert_matches::assert_matches;

    const RESOURCE_UUID: &str = "1f3c1a5e-8a31-4c2b-9e41-5b1e5a7e2f10";

    fn iqn() -> Iqn {
        Iqn::new("iqn.2021-08.com.linbit:target1").unwrap()
    }

    fn config() -> ResourceConfig {
        let mut cfg = ResourceConfig::new(
            iqn(),
            vec!["1.1.1.1/16".parse().unwrap()],
            vec![VolumeConfig::cluster_private(), VolumeConfig::new(1, 1024 * 1024)],
        );
        cfg.resource_group = DEFAULT_RESOURCE_GROUP.to_string();
        cfg
    }

    fn deployed_volume(number: u32) -> DeployedVolume {
        let mut vol = DeployedVolume {
            volume_number: number,
            device_path: format!("/dev/drbd100{}", number),
            disk_state: "UpToDate".into(),
            uuid: format!("vol-uuid-{}", number),
            ..Default::default()
        };
        vol.props.insert(
            "Satellite/Device/Symlinks/0".into(),
            format!("/dev/drbd/by-res/target1/{}", number),
        );
        vol
    }

    fn deployment(volumes: &[u32]) -> Vec<ResourceWithVolumes> {
        vec![ResourceWithVolumes {
            name: "target1".into(),
            node_name: "node1".into(),
            uuid: RESOURCE_UUID.into(),
            in_use: Some(false),
            volumes: volumes.iter().copied().map(deployed_volume).collect(),
        }]
    }

    fn definition() -> ResourceDefinition {
        ResourceDefinition {
            name: "target1".into(),
            resource_group_name: DEFAULT_RESOURCE_GROUP.into(),
            ..Default::default()
        }
    }

    fn volume_definitions(cfg: &ResourceConfig) -> Vec<VolumeDefinition> {
        cfg.volumes
            .iter()
            .map(|v| crate::controlplane::lifecycle::volume_definition(v, cfg.gross_size))
            .collect()
    }

    fn agents_of<'a>(cfg: &'a PromoterConfig, agent_type: &str) -> Vec<&'a ResourceAgent> {
        cfg.first_resource()
            .unwrap()
            .1
            .agents()
            .filter(|a| a.agent_type == agent_type)
            .collect()
    }

    #[test]
    fn test_single_target_scenario() {
        let promoter = config().to_promoter(&deployment(&[0, 1])).unwrap();
        assert_eq!(promoter.id, "iscsi-target1");

        let portblocks = agents_of(&promoter, AGENT_PORTBLOCK);
        assert_eq!(portblocks.iter().filter(|a| a.get("action") == "block").count(), 1);
        assert_eq!(portblocks.iter().filter(|a| a.get("action") == "unblock").count(), 1);
        assert_eq!(agents_of(&promoter, AGENT_IPADDR2).len(), 1);

        let targets = agents_of(&promoter, AGENT_ISCSI_TARGET);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].get("iqn"), "iqn.2021-08.com.linbit:target1");
        assert_eq!(targets[0].get("portals"), "1.1.1.1:3260");

        let lus = agents_of(&promoter, AGENT_ISCSI_LU);
        assert_eq!(lus.len(), 1);
        assert_eq!(lus[0].name, "lu1");
        assert_eq!(lus[0].get("path"), "/dev/drbd/by-res/target1/1");
        assert_eq!(lus[0].get("scsi_sn").len(), 8);

        let parsed = ResourceConfig::from_promoter(
            &promoter,
            &definition(),
            &volume_definitions(&config()),
        )
        .unwrap();
        assert_eq!(parsed.iqn.wwn(), "target1");
        assert_eq!(parsed.service_ips, vec!["1.1.1.1/16".parse::<ServiceIp>().unwrap()]);
        let numbers: Vec<u32> = parsed.volumes.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![0, 1]);
    }

    #[test]
    fn test_start_order() {
        let promoter = config().to_promoter(&deployment(&[0, 1])).unwrap();
        let names: Vec<&str> = promoter
            .first_resource()
            .unwrap()
            .1
            .agents()
            .map(|a| a.name.as_str())
            .collect();

        assert_eq!(
            names,
            vec!["pblock0", "fs_cluster_private", "service_ip0", "target", "lu1", "portunblock0"]
        );

        let rsc = promoter.first_resource().unwrap().1;
        assert_eq!(rsc.runner, "systemd");
        assert_eq!(rsc.target_as, "Requires");
        assert_eq!(rsc.on_drbd_demote_failure, "reboot-immediate");
        assert!(rsc.stop_services_on_exit);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let mut cfg = config();
        cfg.service_ips.push("10.0.0.5/24".parse().unwrap());
        cfg.volumes.push(VolumeConfig::new(2, 2048));
        cfg.username = "user".into();
        cfg.password = "s3cr3t pass".into();
        cfg.allowed_initiators = vec![
            Iqn::new("iqn.2021-08.com.linbit:client1").unwrap(),
            Iqn::new("iqn.2021-08.com.linbit:client2").unwrap(),
        ];
        cfg.implementation = Some("lio-t".into());
        cfg.gross_size = true;

        let promoter = cfg.to_promoter(&deployment(&[0, 1, 2])).unwrap();
        let text = promoter.encode().unwrap();
        let decoded = crate::promoter::decode(&text).unwrap().remove(0);

        let parsed =
            ResourceConfig::from_promoter(&decoded, &definition(), &volume_definitions(&cfg))
                .unwrap();
        assert_eq!(parsed, cfg);
        assert!(parsed.matches(&cfg));
    }

    #[test]
    fn test_to_promoter_is_deterministic() {
        let a = config().to_promoter(&deployment(&[0, 1])).unwrap().encode().unwrap();
        let b = config().to_promoter(&deployment(&[0, 1])).unwrap().encode().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_inconsistent_volumes() {
        assert_matches!(
            config().to_promoter(&deployment(&[0, 2])),
            Err(Error::InconsistentVolumes { expected: 2, actual: 1 })
        );
        assert_matches!(
            config().to_promoter(&deployment(&[0])),
            Err(Error::VolumeCountMismatch { .. })
        );
        assert_matches!(config().to_promoter(&[]), Err(Error::MissingDeployment));
    }

    #[test]
    fn test_unbalanced_port_blocks_rejected() {
        let mut promoter = config().to_promoter(&deployment(&[0, 1])).unwrap();
        let rsc = promoter.resources.get_mut("target1").unwrap();
        let extra = portblock_agent(
            naming::indexed_portblock(1),
            &"1.1.1.1/16".parse().unwrap(),
            DEFAULT_ISCSI_PORT,
        );
        rsc.start.insert(0, StartEntry::from(extra));

        assert_matches!(
            ResourceConfig::from_promoter(&promoter, &definition(), &volume_definitions(&config())),
            Err(Error::MalformedPromoterConfig { ref reason, .. })
                if reason.contains("portblock and portunblock")
        );
    }

    #[test]
    fn test_too_few_entries_and_unknown_agents() {
        let mut promoter = config().to_promoter(&deployment(&[0, 1])).unwrap();
        let rsc = promoter.resources.get_mut("target1").unwrap();
        rsc.start.truncate(4);
        assert_matches!(
            ResourceConfig::from_promoter(&promoter, &definition(), &volume_definitions(&config())),
            Err(Error::MalformedPromoterConfig { ref reason, .. }) if reason.contains("too few")
        );

        let mut promoter = config().to_promoter(&deployment(&[0, 1])).unwrap();
        let rsc = promoter.resources.get_mut("target1").unwrap();
        rsc.start
            .push(ResourceAgent::new("ocf:heartbeat:Dummy", "dummy").into());
        rsc.start.push(StartEntry::SystemdService("iscsi-helper.service".into()));
        assert_matches!(
            ResourceConfig::from_promoter(&promoter, &definition(), &volume_definitions(&config())),
            Err(Error::MalformedPromoterConfig { ref reason, .. })
                if reason.contains("unexpected resource agent")
        );
    }

    #[test]
    fn test_systemd_units_ignored() {
        let mut promoter = config().to_promoter(&deployment(&[0, 1])).unwrap();
        let rsc = promoter.resources.get_mut("target1").unwrap();
        rsc.start.push(StartEntry::SystemdService("iscsi-helper.service".into()));

        assert!(ResourceConfig::from_promoter(
            &promoter,
            &definition(),
            &volume_definitions(&config())
        )
        .is_ok());
    }

    #[test]
    fn test_fill_defaults_and_valid() {
        let mut cfg = ResourceConfig::new(
            iqn(),
            vec!["1.1.1.1/16".parse().unwrap()],
            vec![VolumeConfig::new(0, 1024), VolumeConfig::new(0, 2048)],
        );
        cfg.fill_defaults();
        assert_eq!(cfg.resource_group, DEFAULT_RESOURCE_GROUP);
        assert_eq!(cfg.volumes[0].number, 1);
        assert_eq!(cfg.volumes[1].number, 2);
        cfg.valid().unwrap();

        cfg.service_ips.clear();
        assert_matches!(cfg.valid(), Err(Error::Validation(msg)) if msg == "missing service ips");
    }

    #[test]
    fn test_matches() {
        let cfg = config();
        let mut other = config();
        assert!(cfg.matches(&other));

        other.password = "changed".into();
        assert!(!cfg.matches(&other));

        let mut other = config();
        other.service_ips.push("1.1.1.2/16".parse().unwrap());
        assert!(!cfg.matches(&other));

        let mut other = config();
        other.volumes[1].size_kib += 1;
        assert!(!cfg.matches(&other));
    }

    #[test]
    fn test_matches_implementation() {
        let mut deployed = config();
        deployed.implementation = Some("lio-t".into());

        assert!(config().matches(&deployed));

        let mut request = config();
        request.implementation = Some("lio-t".into());
        assert!(request.matches(&deployed));

        request.implementation = Some("scst".into());
        assert!(!request.matches(&deployed));
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(config()).unwrap();
        assert_eq!(json["iqn"], "iqn.2021-08.com.linbit:target1");
        assert_eq!(json["service_ips"][0], "1.1.1.1/16");
        assert_eq!(json["status"]["state"], "Unknown");
        assert!(json.get("username").is_none());

        let parsed: ResourceConfig = serde_json::from_value(serde_json::json!({
            "iqn": "iqn.2021-08.com.linbit:target1",
            "service_ips": ["1.1.1.1/16"],
            "volumes": [{ "size_kib": 1024 }]
        }))
        .unwrap();
        assert_eq!(parsed.volumes[0].number, 0);
        assert!(serde_json::from_value::<ResourceConfig>(serde_json::json!({
            "iqn": "iqn.2021-08.com.linbit:target_1",
            "service_ips": []
        }))
        .is_err());
    }
}
