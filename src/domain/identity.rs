//! Service identities
//!
//! Wire identities of the three gateway flavours. Each one splits into an
//! organisational prefix and a resource-local unique part; the unique part is
//! used verbatim as the storage resource name.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// The IQN prefix format is dictated by the iSCSI target backend (rtslib-fb).
// Unlike RFC 3720 the unique part after the colon is mandatory, because it
// becomes the storage resource name.
static IQN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(iqn\.\d{4}-[0-1][0-9]\.[^ _]*\.[^ _]*):([[:alpha:]][[:alnum:]]+)$")
        .unwrap_or_else(|_| unreachable!())
});

static RESOURCE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[[:alpha:]][[:alnum:]-]+$").unwrap_or_else(|_| unreachable!()));

// =============================================================================
// IQN
// =============================================================================

/// iSCSI qualified name: `iqn.YYYY-MM.<reverse-domain>:<unique>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Iqn {
    prefix: String,
    wwn: String,
}

impl Iqn {
    pub fn new(s: &str) -> Result<Self> {
        s.parse()
    }

    /// The dated reverse-domain part before the colon
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The unique part after the colon, used as the resource name
    pub fn wwn(&self) -> &str {
        &self.wwn
    }
}

impl FromStr for Iqn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = IQN_REGEX
            .captures(s)
            .ok_or_else(|| Error::InvalidIqn(s.to_string()))?;

        Ok(Self {
            prefix: caps[1].to_string(),
            wwn: caps[2].to_string(),
        })
    }
}

impl fmt::Display for Iqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.wwn)
    }
}

impl TryFrom<String> for Iqn {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Iqn> for String {
    fn from(value: Iqn) -> Self {
        value.to_string()
    }
}

// =============================================================================
// NQN
// =============================================================================

/// NVMe qualified name: `<vendor>:nvme:<subsystem>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nqn {
    vendor: String,
    subsystem: String,
}

impl Nqn {
    pub fn new(s: &str) -> Result<Self> {
        s.parse()
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// The subsystem part, used as the resource name
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }
}

impl FromStr for Nqn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [vendor, "nvme", subsystem]
                if !vendor.is_empty()
                    && !vendor.contains(char::is_whitespace)
                    && RESOURCE_NAME_REGEX.is_match(subsystem) =>
            {
                Ok(Self {
                    vendor: vendor.to_string(),
                    subsystem: subsystem.to_string(),
                })
            }
            _ => Err(Error::InvalidNqn(s.to_string())),
        }
    }
}

impl fmt::Display for Nqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:nvme:{}", self.vendor, self.subsystem)
    }
}

impl TryFrom<String> for Nqn {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Nqn> for String {
    fn from(value: Nqn) -> Self {
        value.to_string()
    }
}

// =============================================================================
// Plain resource name
// =============================================================================

/// A bare storage resource name, as used by NFS exports
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName(String);

impl ResourceName {
    pub fn new(s: &str) -> Result<Self> {
        s.parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ResourceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if RESOURCE_NAME_REGEX.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::InvalidName(s.to_string()))
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ResourceName> for String {
    fn from(value: ResourceName) -> Self {
        value.0
    }
}
