//! Promoter configuration
//!
//! drbd-reactor's promoter plugin starts an ordered list of services on
//! whichever node promotes a replicated resource. The gateway describes each
//! service it runs as one promoter config, stored as an external file in the
//! storage backend and attached to the resource definition while the service
//! should run.

pub mod entry;
pub mod naming;

pub use entry::{ResourceAgent, StartEntry};
pub use naming::Protocol;

use crate::domain::ports::{
    ExternalFile, ResourceDefinition, ResourceGroup, ResourceWithVolumes, StorageBackend,
    VolumeDefinition,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Directory drbd-reactor reads its configuration snippets from
pub const DEFAULT_PROMOTER_DIR: &str = "/etc/drbd-reactor.d";

/// Current layout version of the generated start lists
pub const SCHEMA_VERSION: u32 = 2;

// =============================================================================
// Configuration model
// =============================================================================

/// Root of a drbd-reactor configuration snippet. Only promoter plugins are
/// supported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub promoter: Vec<PromoterConfig>,
}

/// Gateway bookkeeping stored next to the promoter config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Metadata {
    pub linstor_gateway_schema_version: u32,
}

/// Configuration of one promoter plugin instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoterConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, PromoterResourceConfig>,
}

/// Start list and policy of a single promoted resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PromoterResourceConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start: Vec<StartEntry>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub on_drbd_demote_failure: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stop_services_on_exit: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_as: String,
}

impl PromoterResourceConfig {
    /// systemd runner that reboots the node when demotion fails
    pub fn systemd(start: Vec<StartEntry>, target_as: &str) -> Self {
        Self {
            start,
            runner: "systemd".to_string(),
            on_drbd_demote_failure: "reboot-immediate".to_string(),
            stop_services_on_exit: true,
            target_as: target_as.to_string(),
        }
    }

    /// Resource agents of the start list, skipping systemd units
    pub fn agents(&self) -> impl Iterator<Item = &ResourceAgent> {
        self.start.iter().filter_map(StartEntry::as_agent)
    }
}

impl PromoterConfig {
    /// Config promoting a single resource
    pub fn new(protocol: Protocol, resource: &str, resource_config: PromoterResourceConfig) -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(resource.to_string(), resource_config);

        Self {
            id: protocol.config_id(resource),
            metadata: Some(Metadata {
                linstor_gateway_schema_version: SCHEMA_VERSION,
            }),
            resources,
        }
    }

    pub fn first_resource(&self) -> Option<(&str, &PromoterResourceConfig)> {
        self.resources.iter().next().map(|(k, v)| (k.as_str(), v))
    }

    /// The promoted resource, failing unless there is exactly one
    pub fn single_resource(&self) -> Result<(&str, &PromoterResourceConfig)> {
        match self.resources.len() {
            1 => self
                .first_resource()
                .ok_or_else(|| Error::malformed(&self.id, "no resource found")),
            n => Err(Error::malformed(
                &self.id,
                format!("promoter config without exactly 1 resource (has {})", n),
            )),
        }
    }

    /// Addresses bound by the IPaddr2 agents of this config
    pub fn service_addrs(&self) -> Result<Vec<IpAddr>> {
        let mut addrs = Vec::new();
        for rsc in self.resources.values() {
            for agent in rsc.agents().filter(|a| a.agent_type == entry::AGENT_IPADDR2) {
                let ip = agent.get("ip");
                let addr = ip.parse().map_err(|_| {
                    Error::malformed(
                        &self.id,
                        format!("malformed IP address {} in agent {}", ip, agent.name),
                    )
                })?;
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    /// Fail if this config already binds the given address
    pub fn check_ip_collision(&self, addr: IpAddr) -> Result<()> {
        if self.service_addrs()?.contains(&addr) {
            return Err(Error::IpCollision {
                ip: addr.to_string(),
                config: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Render as a drbd-reactor TOML snippet
    pub fn encode(&self) -> Result<String> {
        let root = Config {
            promoter: vec![self.clone()],
        };
        Ok(toml::to_string_pretty(&root)?)
    }
}

/// Parse a drbd-reactor TOML snippet
pub fn decode(content: &str) -> Result<Vec<PromoterConfig>> {
    let root: Config = toml::from_str(content)?;
    Ok(root.promoter)
}

// =============================================================================
// Deployment
// =============================================================================

/// Backend state of the resource a promoter config refers to
#[derive(Debug, Clone)]
pub struct Deployment {
    pub definition: ResourceDefinition,
    pub group: ResourceGroup,
    pub volume_definitions: Vec<VolumeDefinition>,
    pub resources: Vec<ResourceWithVolumes>,
}

// =============================================================================
// Config Store
// =============================================================================

/// Promoter configs persisted in the storage backend's external file store
pub struct ConfigStore {
    backend: Arc<dyn StorageBackend>,
    promoter_dir: String,
}

impl ConfigStore {
    pub fn new(backend: Arc<dyn StorageBackend>, promoter_dir: impl Into<String>) -> Self {
        Self {
            backend,
            promoter_dir: promoter_dir.into(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// File path of the config with the given id
    pub fn path(&self, id: &str) -> String {
        naming::config_path(&self.promoter_dir, id)
    }

    /// All gateway promoter configs known to the backend, with their paths
    pub async fn list_configs(&self) -> Result<Vec<(PromoterConfig, String)>> {
        let files = self.backend.list_external_files().await?;

        let mut configs = Vec::new();
        for file in files {
            if naming::config_id_from_path(&self.promoter_dir, &file.path).is_none() {
                continue;
            }

            for cfg in decode_file(&file)? {
                configs.push((cfg, file.path.clone()));
            }
        }

        Ok(configs)
    }

    /// Fetch the config with the given id, `None` if it does not exist
    pub async fn find_config(&self, id: &str) -> Result<Option<PromoterConfig>> {
        let path = self.path(id);
        let file = match self.backend.get_external_file(&path).await {
            Ok(file) => file,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(decode_file(&file)?.into_iter().find(|cfg| cfg.id == id))
    }

    /// Create or replace the stored config
    pub async fn ensure_config(&self, cfg: &PromoterConfig) -> Result<()> {
        let path = self.path(&cfg.id);
        let content = cfg.encode()?;

        debug!("Writing promoter config {}", path);
        self.backend
            .put_external_file(&ExternalFile {
                path,
                content: content.into_bytes(),
            })
            .await
    }

    /// Deploy the config to the nodes of every resource it promotes
    pub async fn attach_config(&self, cfg: &PromoterConfig) -> Result<()> {
        let path = self.path(&cfg.id);
        for resource in cfg.resources.keys() {
            info!("Attaching promoter config {} to {}", cfg.id, resource);
            self.backend.attach_external_file(resource, &path).await?;
        }
        Ok(())
    }

    /// Remove the config from the nodes of every resource it promotes
    pub async fn detach_config(&self, cfg: &PromoterConfig) -> Result<()> {
        let path = self.path(&cfg.id);
        for resource in cfg.resources.keys() {
            info!("Detaching promoter config {} from {}", cfg.id, resource);
            self.backend.detach_external_file(resource, &path).await?;
        }
        Ok(())
    }

    /// Delete the stored config. A missing config is not an error.
    pub async fn delete_config(&self, id: &str) -> Result<()> {
        match self.backend.delete_external_file(&self.path(id)).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Fetch the backend state of the single resource the config promotes
    pub async fn deployed_resources(&self, cfg: &PromoterConfig) -> Result<Deployment> {
        let (name, _) = cfg.single_resource()?;

        let definition = self.backend.get_resource_definition(name).await?;
        let group = self
            .backend
            .get_resource_group(&definition.resource_group_name)
            .await?;
        let volume_definitions = self.backend.list_volume_definitions(name).await?;
        let resources = self.backend.resource_view(name).await?;

        Ok(Deployment {
            definition,
            group,
            volume_definitions,
            resources,
        })
    }
}

fn decode_file(file: &ExternalFile) -> Result<Vec<PromoterConfig>> {
    let content = std::str::from_utf8(&file.content)
        .map_err(|e| Error::malformed(&file.path, e.to_string()))?;
    decode(content)
}

#[cfg(test)]
mod tests {
    use super::entry::{AGENT_IPADDR2, AGENT_PORTBLOCK};
    use super::*;
    use assert_matches::assert_matches;

    fn sample() -> PromoterConfig {
        let start = vec![
            ResourceAgent::new(AGENT_PORTBLOCK, "portblock")
                .attr("ip", "192.168.0.1")
                .attr("portno", "4420")
                .attr("action", "block")
                .attr("protocol", "tcp")
                .into(),
            ResourceAgent::new(AGENT_IPADDR2, "service_ip")
                .attr("ip", "192.168.0.1")
                .attr("cidr_netmask", "24")
                .into(),
            StartEntry::SystemdService("nvmet.service".into()),
        ];

        PromoterConfig::new(
            Protocol::Nvmeof,
            "vol1",
            PromoterResourceConfig::systemd(start, "Requires"),
        )
    }

    #[test]
    fn test_encode_layout() {
        let text = sample().encode().unwrap();

        assert!(text.contains("[[promoter]]"));
        assert!(text.contains(r#"id = "nvmeof-vol1""#));
        assert!(text.contains("linstor-gateway-schema-version = 2"));
        assert!(text.contains("[promoter.resources.vol1]"));
        assert!(text.contains(r#"on-drbd-demote-failure = "reboot-immediate""#));
        assert!(text.contains("stop-services-on-exit = true"));
        assert!(text.contains(r#"target-as = "Requires""#));
        assert!(text.contains(
            r#""ocf:heartbeat:IPaddr2 service_ip cidr_netmask=24 ip=192.168.0.1""#
        ));
    }

    #[test]
    fn test_encode_is_stable() {
        let cfg = sample();
        let text = cfg.encode().unwrap();

        let decoded = decode(&text).unwrap();
        assert_eq!(decoded, vec![cfg]);
        assert_eq!(decoded[0].encode().unwrap(), text);
    }

    #[test]
    fn test_decode_handwritten() {
        let text = r#"
[[promoter]]
id = "iscsi-target1"

[promoter.resources.target1]
runner = "systemd"
start = [
  "ocf:heartbeat:portblock pblock0 action=block ip=10.0.0.1 portno=3260 protocol=tcp",
  "ocf:heartbeat:IPaddr2 service_ip0 cidr_netmask=16 ip=10.0.0.1",
]
"#;
        let configs = decode(text).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].metadata, None);

        let (name, rsc) = configs[0].single_resource().unwrap();
        assert_eq!(name, "target1");
        assert_eq!(rsc.start.len(), 2);
        assert!(!rsc.stop_services_on_exit);
    }

    #[test]
    fn test_decode_invalid_start_entry() {
        let text = r#"
[[promoter]]
id = "iscsi-target1"

[promoter.resources.target1]
start = ["ocf:heartbeat:IPaddr2"]
"#;
        assert_matches!(decode(text), Err(Error::TomlDecode(_)));
    }

    #[test]
    fn test_single_resource() {
        let mut cfg = sample();
        assert_eq!(cfg.single_resource().unwrap().0, "vol1");

        cfg.resources.insert("other".into(), PromoterResourceConfig::default());
        assert_matches!(cfg.single_resource(), Err(Error::MalformedPromoterConfig { .. }));

        cfg.resources.clear();
        assert_matches!(cfg.single_resource(), Err(Error::MalformedPromoterConfig { .. }));
    }

    #[test]
    fn test_ip_collision() {
        let cfg = sample();
        assert_matches!(
            cfg.check_ip_collision("192.168.0.1".parse().unwrap()),
            Err(Error::IpCollision { config, .. }) if config == "nvmeof-vol1"
        );
        assert!(cfg.check_ip_collision("192.168.0.2".parse().unwrap()).is_ok());
    }
}
