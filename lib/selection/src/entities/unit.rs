use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use spool_core::CacheError;

/// The four unit kinds a request can be matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    /// IP subnet of the requesting client.
    Net,
    /// `<storageClass>@<hsm>`, wildcardable on either side.
    Store,
    /// Opaque cache-class string.
    Dcache,
    /// `<name>/<majorVersion>`, version wildcardable.
    Protocol,
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitType::Net => write!(f, "net"),
            UnitType::Store => write!(f, "store"),
            UnitType::Dcache => write!(f, "dcache"),
            UnitType::Protocol => write!(f, "protocol"),
        }
    }
}

impl FromStr for UnitType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "net" => Ok(UnitType::Net),
            "store" => Ok(UnitType::Store),
            "dcache" => Ok(UnitType::Dcache),
            "protocol" => Ok(UnitType::Protocol),
            _ => Err(anyhow::anyhow!(
                "invalid unit type '{s}'; expected net, store, dcache or protocol"
            )),
        }
    }
}

/// A named request predicate. Identity (name + type) is fixed at creation;
/// only unit-group membership changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    name: String,
    kind: UnitType,
    /// Unit groups this unit belongs to.
    pub ugroups: BTreeSet<String>,
}

impl Unit {
    pub fn new(name: impl Into<String>, kind: UnitType) -> Result<Self, CacheError> {
        let name = name.into();
        validate_name(&name, kind)?;
        Ok(Self {
            name,
            kind,
            ugroups: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> UnitType {
        self.kind
    }
}

fn validate_name(name: &str, kind: UnitType) -> Result<(), CacheError> {
    if name.is_empty() {
        return Err(CacheError::InvalidArgument("empty unit name".into()));
    }
    match kind {
        UnitType::Store => {
            if !name.contains('@') {
                return Err(CacheError::InvalidArgument(format!(
                    "store unit '{name}' must be <storageClass>@<hsm>"
                )));
            }
        }
        UnitType::Protocol => {
            let Some((proto, version)) = name.split_once('/') else {
                return Err(CacheError::InvalidArgument(format!(
                    "protocol unit '{name}' must be <name>/<majorVersion>"
                )));
            };
            if proto.is_empty() || (version != "*" && version.parse::<u32>().is_err()) {
                return Err(CacheError::InvalidArgument(format!(
                    "malformed protocol unit '{name}'"
                )));
            }
        }
        UnitType::Net => {
            crate::net::parse_net_unit(name)?;
        }
        UnitType::Dcache => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_per_kind() {
        assert!(Unit::new("exp:raw@osm", UnitType::Store).is_ok());
        assert!(Unit::new("no-at-sign", UnitType::Store).is_err());

        assert!(Unit::new("dcap/3", UnitType::Protocol).is_ok());
        assert!(Unit::new("dcap/*", UnitType::Protocol).is_ok());
        assert!(Unit::new("dcap/three", UnitType::Protocol).is_err());
        assert!(Unit::new("/3", UnitType::Protocol).is_err());

        assert!(Unit::new("10.0.0.0/24", UnitType::Net).is_ok());
        assert!(Unit::new("10.0.0.0", UnitType::Net).is_err());

        assert!(Unit::new("anything goes", UnitType::Dcache).is_ok());
    }
}
