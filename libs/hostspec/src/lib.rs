//! Host specification parsing and expansion.
//!
//! Join and apply requests name their target machines as free-form strings:
//! plain IPv4 addresses, `host:port` pairs, inclusive ranges
//! (`192.168.1.1-192.168.1.5`), and CIDR blocks (`192.168.1.0/28`), any of
//! them comma-separated within one field. This library normalizes those
//! specs into explicit comma-separated host lists before anything acts on
//! them.
//!
//! # Invariants
//!
//! - Expansion is deterministic: addresses come out in ascending numeric
//!   order, so identical input always yields byte-identical output.
//! - A field either resolves completely or fails completely; no partial
//!   expansion is ever returned.
//! - After successful resolution a field contains only `host` and
//!   `host:port` tokens, never a range or CIDR block.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host specification errors.
#[derive(Debug, Error)]
pub enum HostSpecError {
    /// Malformed IP, range, CIDR, or port token.
    #[error("invalid host format: {0}")]
    InvalidHostFormat(String),
}

/// A request to join machines to a named cluster.
///
/// The `masters` and `nodes` fields accept shorthand notation on input and
/// hold fully expanded host lists after [`preprocess_ip_list`]. On error the
/// request may be left partially resolved and must be discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterJoinRequest {
    /// Master host spec, possibly empty.
    pub masters: String,

    /// Worker node host spec, possibly empty.
    pub nodes: String,

    /// Cluster identifier, opaque at this layer.
    pub cluster_name: String,
}

/// One comma-separated token of a host spec, parsed into its variant.
///
/// Keeping the variants explicit lets validation and expansion be tested
/// independently of the outer comma splitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSegment {
    /// A single address, optionally with a port.
    Single {
        addr: Ipv4Addr,
        port: Option<u16>,
    },

    /// An inclusive address range. Ports are not valid in range notation.
    Range { start: Ipv4Addr, end: Ipv4Addr },

    /// A CIDR block, expanded to its usable host addresses.
    Cidr(Ipv4Prefix),
}

impl HostSegment {
    /// Number of host addresses this segment expands to.
    pub fn host_count(&self) -> u64 {
        match self {
            Self::Single { .. } => 1,
            Self::Range { start, end } => {
                u64::from(u32::from(*end) - u32::from(*start)) + 1
            }
            Self::Cidr(prefix) => prefix.usable_hosts(),
        }
    }

    /// Append this segment's expanded host tokens to `out`, ascending.
    fn expand_into(&self, out: &mut Vec<String>) {
        match self {
            Self::Single { addr, port: Some(port) } => {
                out.push(format!("{addr}:{port}"));
            }
            Self::Single { addr, port: None } => out.push(addr.to_string()),
            Self::Range { start, end } => {
                for ip in u32::from(*start)..=u32::from(*end) {
                    out.push(Ipv4Addr::from(ip).to_string());
                }
            }
            Self::Cidr(prefix) => {
                out.extend(prefix.hosts().map(|addr| addr.to_string()));
            }
        }
    }
}

impl FromStr for HostSegment {
    type Err = HostSpecError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let invalid = || HostSpecError::InvalidHostFormat(token.to_string());

        if token.contains('/') {
            return Ipv4Prefix::from_cidr(token).map(Self::Cidr);
        }

        if let Some((start, end)) = token.split_once('-') {
            let start = Ipv4Addr::from_str(start).map_err(|_| invalid())?;
            let end = Ipv4Addr::from_str(end).map_err(|_| invalid())?;
            if u32::from(start) > u32::from(end) {
                return Err(invalid());
            }
            return Ok(Self::Range { start, end });
        }

        let (addr, port) = match token.split_once(':') {
            Some((addr, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                (addr, Some(port))
            }
            None => (token, None),
        };
        let addr = Ipv4Addr::from_str(addr).map_err(|_| invalid())?;

        Ok(Self::Single { addr, port })
    }
}

/// IPv4 prefix in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Prefix {
    /// Network address of the prefix.
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 28 for /28).
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix. The address is masked to the prefix length.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, HostSpecError> {
        if prefix_len > 32 {
            return Err(HostSpecError::InvalidHostFormat(format!(
                "{address}/{prefix_len}"
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "192.168.1.0/28").
    pub fn from_cidr(s: &str) -> Result<Self, HostSpecError> {
        let invalid = || HostSpecError::InvalidHostFormat(s.to_string());

        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(invalid());
        };

        let address = Ipv4Addr::from_str(addr_str).map_err(|_| invalid())?;
        let prefix_len = prefix_str.parse::<u8>().map_err(|_| invalid())?;
        if prefix_len > 32 {
            return Err(invalid());
        }

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Total number of addresses in this prefix, network and broadcast
    /// included.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len)
    }

    /// Number of usable host addresses in this prefix.
    ///
    /// Network and broadcast addresses are excluded for prefixes of length
    /// 30 or shorter; a /31 counts both addresses (point-to-point) and a
    /// /32 counts its single address (host route).
    pub fn usable_hosts(&self) -> u64 {
        match self.prefix_len {
            31 | 32 => self.size(),
            _ => self.size() - 2,
        }
    }

    /// Iterate the usable host addresses of this prefix in ascending order.
    ///
    /// Follows the same inclusion policy as [`usable_hosts`]: network and
    /// broadcast addresses are skipped except in /31 and /32 prefixes.
    ///
    /// [`usable_hosts`]: Self::usable_hosts
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u64::from(u32::from(self.address));
        let (first, last) = match self.prefix_len {
            31 | 32 => (base, base + self.size() - 1),
            _ => (base + 1, base + self.size() - 2),
        };

        (first..=last).map(|ip| Ipv4Addr::from(ip as u32))
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

/// Resolve one host spec field into its fully expanded form.
///
/// Each comma-separated token is parsed as a [`HostSegment`], expanded, and
/// the results rejoined with commas. Empty input is valid and resolves to
/// empty output. Any invalid token aborts the whole field with
/// [`HostSpecError::InvalidHostFormat`]; no partial expansion is returned.
pub fn resolve_host_list(spec: &str) -> Result<String, HostSpecError> {
    if spec.is_empty() {
        return Ok(String::new());
    }

    let mut hosts = Vec::new();
    for token in spec.split(',') {
        token.parse::<HostSegment>()?.expand_into(&mut hosts);
    }

    Ok(hosts.join(","))
}

/// Resolve both host fields of a join request in place.
///
/// Fails fast on the first invalid field; the request may then be partially
/// resolved and must be discarded by the caller.
pub fn preprocess_ip_list(request: &mut ClusterJoinRequest) -> Result<(), HostSpecError> {
    request.masters = resolve_host_list(&request.masters)?;
    request.nodes = resolve_host_list(&request.nodes)?;
    Ok(())
}

/// Check whether a spec is already a plain list of concrete addresses.
///
/// True iff every comma-separated token is a literal IPv4 address,
/// optionally suffixed with `:port`. Ranges, CIDR blocks, hostnames and the
/// empty string all return false.
pub fn is_ip_list(spec: &str) -> bool {
    spec.split(',').all(|token| {
        let (addr, port) = match token.split_once(':') {
            Some((addr, port)) => (addr, Some(port)),
            None => (token, None),
        };

        addr.parse::<Ipv4Addr>().is_ok()
            && port.map_or(true, |p| p.parse::<u16>().is_ok())
    })
}
