//! Start entries of a promoter resource
//!
//! Every line of a promoter `start` list is either an OCF resource agent
//! (`ocf:<provider>:<type> <name> [key=value ...]`) or the name of a systemd
//! unit managed outside the gateway.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Prefix that marks a start entry as an OCF resource agent
pub const OCF_PREFIX: &str = "ocf:";

pub const AGENT_PORTBLOCK: &str = "ocf:heartbeat:portblock";
pub const AGENT_IPADDR2: &str = "ocf:heartbeat:IPaddr2";
pub const AGENT_FILESYSTEM: &str = "ocf:heartbeat:Filesystem";
pub const AGENT_ISCSI_TARGET: &str = "ocf:heartbeat:iSCSITarget";
pub const AGENT_ISCSI_LU: &str = "ocf:heartbeat:iSCSILogicalUnit";
pub const AGENT_NVMET_SUBSYSTEM: &str = "ocf:heartbeat:nvmet-subsystem";
pub const AGENT_NVMET_NAMESPACE: &str = "ocf:heartbeat:nvmet-namespace";
pub const AGENT_NVMET_PORT: &str = "ocf:heartbeat:nvmet-port";
pub const AGENT_NFSSERVER: &str = "ocf:heartbeat:nfsserver";
pub const AGENT_EXPORTFS: &str = "ocf:heartbeat:exportfs";

// =============================================================================
// Resource agent
// =============================================================================

/// An OCF resource agent invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAgent {
    /// Agent type, e.g. `ocf:heartbeat:IPaddr2`
    pub agent_type: String,
    /// Instance name, unique within one start list
    pub name: String,
    /// Agent parameters
    pub attributes: BTreeMap<String, String>,
}

impl ResourceAgent {
    pub fn new(agent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder style attribute setter
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Value of an attribute, empty if unset
    pub fn get(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or("")
    }

    /// Value of an attribute that has to be present
    pub fn require(&self, key: &str) -> Result<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::InvalidStartEntry {
                entry: self.name.clone(),
                reason: format!("missing attribute '{}'", key),
            })
    }

    /// Render as a single start line. Keys are sorted, values quoted as needed.
    pub fn encode(&self) -> Result<String> {
        let invalid = |reason: &str| Error::InvalidStartEntry {
            entry: format!("{} {}", self.agent_type, self.name),
            reason: reason.to_string(),
        };

        if self.agent_type.is_empty() || self.name.is_empty() {
            return Err(invalid("agent needs a type and a name"));
        }
        if !is_safe(&self.agent_type) || !is_safe(&self.name) {
            return Err(invalid("agent type and name must not need quoting"));
        }

        let mut line = format!("{} {}", self.agent_type, self.name);
        for (key, value) in &self.attributes {
            if key.is_empty() || key.contains('=') || !is_safe(key) {
                return Err(invalid("attribute keys must be plain words"));
            }
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&quote(value));
        }

        Ok(line)
    }
}

impl FromStr for ResourceAgent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidStartEntry {
            entry: s.to_string(),
            reason: reason.to_string(),
        };

        let words = split(s).map_err(|e| invalid(&e))?;
        if words.len() < 2 {
            return Err(invalid("expected at least type and name"));
        }

        let mut words = words.into_iter();
        let agent_type = words.next().unwrap_or_default();
        let name = words.next().unwrap_or_default();

        let mut attributes = BTreeMap::new();
        for word in words {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| invalid("expected key=value pairs as arguments"))?;
            attributes.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            agent_type,
            name,
            attributes,
        })
    }
}

// =============================================================================
// Start entry
// =============================================================================

/// One step of a promoter start list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartEntry {
    ResourceAgent(ResourceAgent),
    /// A systemd unit started as-is
    SystemdService(String),
}

impl StartEntry {
    pub fn encode(&self) -> Result<String> {
        match self {
            StartEntry::ResourceAgent(agent) => agent.encode(),
            StartEntry::SystemdService(name) => {
                if name.is_empty() || name.starts_with(OCF_PREFIX) || !is_safe(name) {
                    return Err(Error::InvalidStartEntry {
                        entry: name.clone(),
                        reason: "not a valid systemd unit name".into(),
                    });
                }
                Ok(name.clone())
            }
        }
    }

    pub fn as_agent(&self) -> Option<&ResourceAgent> {
        match self {
            StartEntry::ResourceAgent(agent) => Some(agent),
            StartEntry::SystemdService(_) => None,
        }
    }
}

impl From<ResourceAgent> for StartEntry {
    fn from(agent: ResourceAgent) -> Self {
        StartEntry::ResourceAgent(agent)
    }
}

impl FromStr for StartEntry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with(OCF_PREFIX) {
            s.parse().map(StartEntry::ResourceAgent)
        } else {
            Ok(StartEntry::SystemdService(s.trim().to_string()))
        }
    }
}

impl Serialize for StartEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let line = self.encode().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&line)
    }
}

impl<'de> Deserialize<'de> for StartEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let line = String::deserialize(deserializer)?;
        line.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Shell-style quoting
// =============================================================================

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_./:,@%+-".contains(c)
}

fn is_safe(s: &str) -> bool {
    s.chars().all(is_safe_char)
}

/// Quote a word so that [`split`] reads it back unchanged
fn quote(s: &str) -> String {
    if !s.is_empty() && is_safe(s) {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Split a line into words, honouring single quotes, double quotes and
/// backslash escapes like a POSIX shell
fn split(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".into()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some('\n') => {}
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err("unterminated double quote".into()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".into()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('\n') => {}
                    Some(c) => current.push(c),
                    None => return Err("trailing backslash".into()),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use test_case::test_case;

    #[test]
    fn test_encode_sorted_and_quoted() {
        let agent = ResourceAgent::new(AGENT_IPADDR2, "service_ip")
            .attr("title", "my great IP")
            .attr("ip", "1.2=3.4")
            .attr("empty", "");

        assert_eq!(
            agent.encode().unwrap(),
            "ocf:heartbeat:IPaddr2 service_ip empty='' ip='1.2=3.4' title='my great IP'"
        );
    }

    #[test]
    fn test_encode_without_attributes() {
        let agent = ResourceAgent::new(AGENT_NVMET_PORT, "port");
        assert_eq!(agent.encode().unwrap(), "ocf:heartbeat:nvmet-port port");
    }

    #[test]
    fn test_encode_requires_type_and_name() {
        let agent = ResourceAgent::new(AGENT_IPADDR2, "");
        assert_matches!(agent.encode(), Err(Error::InvalidStartEntry { .. }));

        let agent = ResourceAgent::new("", "service_ip");
        assert_matches!(agent.encode(), Err(Error::InvalidStartEntry { .. }));
    }

    #[test]
    fn test_parse_agent() {
        let entry: StartEntry =
            "ocf:heartbeat:IPaddr2 service_ip cidr_netmask=16 ip=1.1.1.1 title='my great IP'"
                .parse()
                .unwrap();

        let agent = entry.as_agent().unwrap();
        assert_eq!(agent.agent_type, AGENT_IPADDR2);
        assert_eq!(agent.name, "service_ip");
        assert_eq!(agent.get("ip"), "1.1.1.1");
        assert_eq!(agent.get("cidr_netmask"), "16");
        assert_eq!(agent.get("title"), "my great IP");
        assert_eq!(agent.get("missing"), "");
    }

    #[test]
    fn test_parse_tolerates_trailing_space() {
        let agent: ResourceAgent = "ocf:heartbeat:nvmet-port port ".parse().unwrap();
        assert!(agent.attributes.is_empty());
    }

    #[test_case("ocf:heartbeat:IPaddr2" ; "missing name")]
    #[test_case("ocf:heartbeat:IPaddr2 service_ip ip" ; "missing value")]
    #[test_case("ocf:heartbeat:IPaddr2 service_ip ip='1.1.1.1" ; "unterminated quote")]
    fn test_parse_agent_invalid(line: &str) {
        assert_matches!(line.parse::<StartEntry>(), Err(Error::InvalidStartEntry { .. }));
    }

    #[test]
    fn test_systemd_service() {
        let entry: StartEntry = "nfs-server.service".parse().unwrap();
        assert_eq!(entry, StartEntry::SystemdService("nfs-server.service".into()));
        assert_eq!(entry.encode().unwrap(), "nfs-server.service");
        assert!(entry.as_agent().is_none());
    }

    #[test]
    fn test_quoting_reads_back() {
        let values = ["plain", "", "with space", "it's", "a=b", "\"double\"", "tab\there"];
        let mut agent = ResourceAgent::new(AGENT_ISCSI_TARGET, "target");
        for (i, value) in values.iter().enumerate() {
            agent = agent.attr(format!("k{}", i), *value);
        }

        let line = agent.encode().unwrap();
        let parsed: ResourceAgent = line.parse().unwrap();
        assert_eq!(parsed, agent);
        assert_eq!(parsed.encode().unwrap(), line);
    }

    #[test]
    fn test_split_double_quotes_and_escapes() {
        assert_eq!(
            split(r#"a "b c" d\ e "x\"y""#).unwrap(),
            vec!["a", "b c", "d e", "x\"y"]
        );
    }

    #[test]
    fn test_serde_as_string() {
        let entry: StartEntry = ResourceAgent::new(AGENT_PORTBLOCK, "portblock")
            .attr("action", "block")
            .into();

        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#""ocf:heartbeat:portblock portblock action=block""#);
        assert_eq!(serde_json::from_str::<StartEntry>(&json).unwrap(), entry);
    }
}
