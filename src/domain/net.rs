//! Service addresses
//!
//! A service IP is an address together with the prefix length of the network
//! it is bound into. Unlike a network CIDR, the host bits are significant.

use crate::error::{Error, Result};
use cidr::IpInet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IP address plus prefix length, written as `addr/prefix`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceIp(IpInet);

impl ServiceIp {
    /// Build a service IP from its parts, rejecting prefixes longer than the address
    pub fn from_parts(addr: IpAddr, prefix: u8) -> Result<Self> {
        IpInet::new(addr, prefix)
            .map(Self)
            .map_err(|e| Error::InvalidServiceIp {
                input: format!("{}/{}", addr, prefix),
                reason: e.to_string(),
            })
    }

    /// `::/0` and `0.0.0.0/0`, the client list used when none is given
    pub fn allow_all() -> Vec<Self> {
        [
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        ]
        .into_iter()
        .filter_map(|addr| Self::from_parts(addr, 0).ok())
        .collect()
    }

    pub fn addr(&self) -> IpAddr {
        self.0.address()
    }

    pub fn prefix(&self) -> u8 {
        self.0.network_length()
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr().is_ipv4()
    }

    /// Format as an NFS export client specification.
    ///
    /// The NFS server rejects `a.b.c.d/0`, so an IPv4 zero prefix is written as
    /// a dotted netmask instead. IPv6 addresses are bracketed.
    pub fn to_nfs_clientspec(&self) -> String {
        match self.addr() {
            IpAddr::V4(addr) if self.prefix() == 0 => format!("{}/0.0.0.0", addr),
            IpAddr::V4(_) => self.to_string(),
            IpAddr::V6(addr) => format!("[{}]/{}", addr, self.prefix()),
        }
    }

    /// Parse an NFS export client specification, accepting both dotted mask
    /// and prefix length notation
    pub fn from_nfs_clientspec(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidServiceIp {
            input: spec.to_string(),
            reason: reason.to_string(),
        };

        let (host, mask) = spec
            .split_once('/')
            .ok_or_else(|| invalid("expected '/' in nfs client specification"))?;

        let addr: IpAddr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| invalid("malformed address"))?;

        let prefix = if mask.contains('.') {
            let mask: Ipv4Addr = mask.parse().map_err(|_| invalid("malformed netmask"))?;
            let bits = u32::from(mask);
            if bits.leading_ones() + bits.trailing_zeros() != 32 {
                return Err(invalid("netmask is not contiguous"));
            }
            bits.leading_ones() as u8
        } else {
            mask.parse::<u8>()
                .map_err(|_| invalid("malformed prefix length"))?
        };

        Self::from_parts(addr, prefix)
    }
}

impl FromStr for ServiceIp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidServiceIp {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| invalid("missing prefix length"))?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid("malformed address"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| invalid("malformed prefix length"))?;

        Self::from_parts(addr, prefix)
    }
}

impl fmt::Display for ServiceIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.prefix())
    }
}

impl TryFrom<String> for ServiceIp {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ServiceIp> for String {
    fn from(value: ServiceIp) -> Self {
        value.to_string()
    }
}
