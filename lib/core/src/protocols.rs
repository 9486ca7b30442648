//! Payload types shared across the selection, routing and workflow crates.
//!
//! The wire envelope that carries them is out of scope; these are the serde
//! shapes the surrounding cell framework moves around.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Namespace id of a file. Opaque here; the namespace service owns its
/// structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PnfsId(String);

impl PnfsId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PnfsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PnfsId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// The kind of data flow being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
    /// Stage from archival storage into a disk pool.
    Cache,
    /// Pool-to-pool replication.
    P2p,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
            Direction::Cache => write!(f, "cache"),
            Direction::P2p => write!(f, "p2p"),
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Direction::Read),
            "write" => Ok(Direction::Write),
            "cache" | "stage" => Ok(Direction::Cache),
            "p2p" => Ok(Direction::P2p),
            _ => Err(anyhow::anyhow!(
                "invalid direction '{s}'; expected read, write, cache or p2p"
            )),
        }
    }
}

/// Operational mode bitmask reported by a pool in its heartbeat.
///
/// Capability bits say what the pool is willing to do; the disabled bits
/// mark administrative or terminal shutdown states and override everything
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolMode(u32);

impl PoolMode {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    pub const STAGE: u32 = 0x04;
    pub const P2P_CLIENT: u32 = 0x08;
    pub const P2P_SERVER: u32 = 0x10;
    pub const DISABLED: u32 = 0x20;
    pub const DISABLED_STRICT: u32 = 0x40;
    pub const DISABLED_DEAD: u32 = 0x80;

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// All capabilities on, nothing disabled.
    pub const fn enabled() -> Self {
        Self(Self::READ | Self::WRITE | Self::STAGE | Self::P2P_CLIENT | Self::P2P_SERVER)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn is_disabled(self) -> bool {
        self.has(Self::DISABLED | Self::DISABLED_STRICT | Self::DISABLED_DEAD)
    }

    /// Strictly disabled or dead: the down-detection convention forces the
    /// pool's serial id to zero on receipt.
    pub fn is_down(self) -> bool {
        self.has(Self::DISABLED_STRICT | Self::DISABLED_DEAD)
    }

    pub fn may_read(self) -> bool {
        !self.is_disabled() && self.has(Self::READ)
    }

    pub fn may_write(self) -> bool {
        !self.is_disabled() && self.has(Self::WRITE)
    }

    pub fn may_stage(self) -> bool {
        !self.is_disabled() && self.has(Self::STAGE)
    }

    pub fn may_p2p_client(self) -> bool {
        !self.is_disabled() && self.has(Self::P2P_CLIENT)
    }

    pub fn may_p2p_server(self) -> bool {
        !self.is_disabled() && self.has(Self::P2P_SERVER)
    }
}

impl Default for PoolMode {
    fn default() -> Self {
        Self::enabled()
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has(Self::DISABLED_DEAD) {
            return write!(f, "dead");
        }
        if self.has(Self::DISABLED_STRICT) {
            return write!(f, "disabled(strict)");
        }
        if self.has(Self::DISABLED) {
            return write!(f, "disabled");
        }
        let mut caps = Vec::new();
        if self.has(Self::READ) {
            caps.push("read");
        }
        if self.has(Self::WRITE) {
            caps.push("write");
        }
        if self.has(Self::STAGE) {
            caps.push("stage");
        }
        if self.has(Self::P2P_CLIENT) {
            caps.push("p2p-client");
        }
        if self.has(Self::P2P_SERVER) {
            caps.push("p2p-server");
        }
        write!(f, "enabled({})", caps.join(","))
    }
}

/// Load and capacity snapshot a pool reports about itself. How the pool
/// computes these numbers is its own business.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolCostInfo {
    /// Scalar load figure; lower is better.
    pub performance_cost: f64,
    /// Scalar space pressure figure; lower is better.
    pub space_cost: f64,
    pub total_space: u64,
    pub free_space: u64,
}

impl PoolCostInfo {
    pub fn new(performance_cost: f64, space_cost: f64, total_space: u64, free_space: u64) -> Self {
        Self {
            performance_cost,
            space_cost,
            total_space,
            free_space,
        }
    }
}

/// Periodic self-report from a pool process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHeartbeat {
    pub pool: String,
    pub address: String,
    pub hostname: Option<String>,
    /// Restart generation counter; changes when the pool process restarts.
    pub serial: u64,
    pub mode: PoolMode,
    pub cost: PoolCostInfo,
    #[serde(default)]
    pub hsm_instances: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Fired to interested collaborators when a pool's availability changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatusChange {
    Up { pool: String },
    Down { pool: String },
    Restart { pool: String },
}

/// The file-side attributes a routing decision needs. The namespace service
/// owns the authoritative copy; requests carry a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttributes {
    pub pnfs_id: PnfsId,
    pub storage_class: String,
    pub hsm: String,
    #[serde(default)]
    pub cache_class: Option<String>,
    pub size: u64,
    /// Pools currently holding an online replica.
    #[serde(default)]
    pub locations: Vec<String>,
    /// Whether an archival copy exists, i.e. the file can be staged.
    #[serde(default)]
    pub stored: bool,
}

impl FileAttributes {
    /// Composed store-unit name, `<storageClass>@<hsm>`.
    pub fn store_unit_name(&self) -> String {
        format!("{}@{}", self.storage_class, self.hsm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_mode_disabled_overrides_capabilities() {
        let m = PoolMode::new(PoolMode::READ | PoolMode::WRITE | PoolMode::DISABLED);
        assert!(m.is_disabled());
        assert!(!m.may_read());
        assert!(!m.may_write());
        assert!(!m.is_down());

        let dead = PoolMode::new(PoolMode::DISABLED_DEAD);
        assert!(dead.is_down());
    }

    #[test]
    fn test_pool_mode_display() {
        assert_eq!(
            PoolMode::enabled().to_string(),
            "enabled(read,write,stage,p2p-client,p2p-server)"
        );
        assert_eq!(PoolMode::new(PoolMode::DISABLED_DEAD).to_string(), "dead");
    }

    #[test]
    fn test_store_unit_name() {
        let attrs = FileAttributes {
            pnfs_id: PnfsId::new("0000A8"),
            storage_class: "exp:raw".into(),
            hsm: "osm".into(),
            cache_class: None,
            size: 1024,
            locations: vec![],
            stored: true,
        };
        assert_eq!(attrs.store_unit_name(), "exp:raw@osm");
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("stage".parse::<Direction>().unwrap(), Direction::Cache);
        assert_eq!("P2P".parse::<Direction>().unwrap(), Direction::P2p);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_heartbeat_wire_shape() {
        let json = r#"{
            "pool": "pool1",
            "address": "pool1@node:1094",
            "hostname": null,
            "serial": 3,
            "mode": 31,
            "cost": {
                "performance_cost": 0.25,
                "space_cost": 0.5,
                "total_space": 1000,
                "free_space": 400
            },
            "hsm_instances": ["osm"]
        }"#;
        let hb: PoolHeartbeat = serde_json::from_str(json).unwrap();
        assert_eq!(hb.pool, "pool1");
        assert_eq!(hb.mode, PoolMode::enabled());
        assert!(hb.tags.is_empty(), "absent tag map defaults to empty");
        assert_eq!(hb.cost.performance_cost, 0.25);
    }
}
