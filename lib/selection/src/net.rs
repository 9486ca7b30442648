//! Longest-prefix matching of client addresses against configured NET units.
//!
//! Buckets are keyed by prefix length and scanned most-specific first, so a
//! client inside two nested subnets always resolves to the narrower one.
//! IPv4 and IPv6 live in separate tables; prefix lengths only compare within
//! a family.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use spool_core::CacheError;

/// Parse a NET unit name. Accepts `addr/prefixlen` as well as the legacy
/// `addr/dotted-mask` form (`10.0.0.0/255.255.255.0`). Non-contiguous masks
/// are rejected.
pub fn parse_net_unit(name: &str) -> Result<IpNet, CacheError> {
    if let Ok(net) = name.parse::<IpNet>() {
        return Ok(net.trunc());
    }

    // legacy dotted-mask syntax
    let (addr, mask) = name
        .split_once('/')
        .ok_or_else(|| CacheError::InvalidArgument(format!("malformed net unit '{name}'")))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| CacheError::InvalidArgument(format!("malformed net unit '{name}'")))?;
    let mask: IpAddr = mask
        .parse()
        .map_err(|_| CacheError::InvalidArgument(format!("malformed net unit '{name}'")))?;

    let prefix = match mask {
        IpAddr::V4(m) => {
            let bits = u32::from(m);
            if bits.count_ones() + bits.trailing_zeros() != 32 && bits != 0 {
                return Err(CacheError::InvalidArgument(format!(
                    "non-contiguous netmask in '{name}'"
                )));
            }
            bits.count_ones() as u8
        }
        IpAddr::V6(m) => {
            let bits = u128::from(m);
            if bits.count_ones() + bits.trailing_zeros() != 128 && bits != 0 {
                return Err(CacheError::InvalidArgument(format!(
                    "non-contiguous netmask in '{name}'"
                )));
            }
            bits.count_ones() as u8
        }
    };

    IpNet::new(addr, prefix)
        .map(|n| n.trunc())
        .map_err(|_| CacheError::InvalidArgument(format!("malformed net unit '{name}'")))
}

/// Longest-prefix-match table mapping client addresses to NET unit names.
#[derive(Debug, Default, Clone)]
pub struct NetMatcher {
    // prefix length -> network -> unit name; BTreeMap keeps the scan
    // deterministic
    v4: BTreeMap<u8, BTreeMap<Ipv4Net, String>>,
    v6: BTreeMap<u8, BTreeMap<Ipv6Net, String>>,
}

impl NetMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.v4.clear();
        self.v6.clear();
    }

    pub fn add(&mut self, net: IpNet, unit_name: impl Into<String>) {
        match net {
            IpNet::V4(n) => {
                self.v4
                    .entry(n.prefix_len())
                    .or_default()
                    .insert(n, unit_name.into());
            }
            IpNet::V6(n) => {
                self.v6
                    .entry(n.prefix_len())
                    .or_default()
                    .insert(n, unit_name.into());
            }
        }
    }

    pub fn remove(&mut self, net: &IpNet) {
        match net {
            IpNet::V4(n) => {
                if let Some(bucket) = self.v4.get_mut(&n.prefix_len()) {
                    bucket.remove(n);
                    if bucket.is_empty() {
                        self.v4.remove(&n.prefix_len());
                    }
                }
            }
            IpNet::V6(n) => {
                if let Some(bucket) = self.v6.get_mut(&n.prefix_len()) {
                    bucket.remove(n);
                    if bucket.is_empty() {
                        self.v6.remove(&n.prefix_len());
                    }
                }
            }
        }
    }

    /// Resolve an address to the most specific containing NET unit, if any.
    pub fn match_addr(&self, addr: IpAddr) -> Option<&str> {
        match addr {
            IpAddr::V4(a) => self
                .v4
                .iter()
                .rev()
                .flat_map(|(_, bucket)| bucket.iter())
                .find(|(net, _)| net.contains(&a))
                .map(|(_, name)| name.as_str()),
            IpAddr::V6(a) => self
                .v6
                .iter()
                .rev()
                .flat_map(|(_, bucket)| bucket.iter())
                .find(|(net, _)| net.contains(&a))
                .map(|(_, name)| name.as_str()),
        }
    }
}
