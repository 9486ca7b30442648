//! The match operation: resolve the request's units, intersect their links,
//! rank by preference and expand to candidate pools.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use spool_core::CacheError;
use spool_core::protocols::Direction;

use crate::entities::{Link, Pool, UnitType};
use crate::graph::Graph;

/// One tier of equally-ranked candidate pools for a direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPreferenceLevel {
    pub pools: Vec<String>,
    /// Partition tag taken from the level's links, if any carries one.
    pub tag: Option<String>,
}

/// The request attributes a match resolves against.
#[derive(Debug, Clone)]
pub struct MatchInput<'a> {
    pub direction: Direction,
    /// Composed store unit name, `<storageClass>@<hsm>`.
    pub store_unit: &'a str,
    pub dcache_unit: Option<&'a str>,
    /// `<name>/<majorVersion>`.
    pub protocol_unit: Option<&'a str>,
    pub net_address: Option<IpAddr>,
    /// Restrict eligible links to this link group.
    pub link_group: Option<&'a str>,
}

/// Resolve the STORE unit with the wildcard fallback chain, or the regex
/// variant when enabled.
fn resolve_store_unit(g: &Graph, store: &str) -> Result<String, CacheError> {
    if g.regex_store_units {
        let mut names: Vec<&String> = g
            .units
            .iter()
            .filter(|(_, u)| u.kind() == UnitType::Store)
            .map(|(n, _)| n)
            .collect();
        names.sort();
        for name in names {
            match Regex::new(name) {
                Ok(re) => {
                    if re.is_match(store) {
                        return Ok(name.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!("store unit '{name}' is not a valid regex: {e}");
                }
            }
        }
    } else if g.units.get(store).is_some_and(|u| u.kind() == UnitType::Store) {
        return Ok(store.to_string());
    }

    let hsm = store.split_once('@').map(|(_, h)| h).unwrap_or("*");
    for fallback in [format!("*@{hsm}"), "*@*".to_string()] {
        if g.units.get(&fallback).is_some_and(|u| u.kind() == UnitType::Store) {
            return Ok(fallback);
        }
    }
    Err(CacheError::NoPoolConfigured(format!(
        "no store unit matches '{store}'"
    )))
}

/// Resolve the PROTOCOL unit with its fallback chain. A miss is tolerated
/// for backward compatibility.
fn resolve_protocol_unit(g: &Graph, protocol: &str) -> Result<Option<String>, CacheError> {
    let Some((name, _version)) = protocol.split_once('/') else {
        return Err(CacheError::InvalidArgument(format!(
            "malformed protocol unit '{protocol}'"
        )));
    };
    for candidate in [protocol.to_string(), format!("{name}/*"), "*/*".to_string()] {
        if g.units
            .get(&candidate)
            .is_some_and(|u| u.kind() == UnitType::Protocol)
        {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn capability_filter(direction: Direction, pool: &Pool, hsm: &str) -> bool {
    match direction {
        Direction::Read => pool.can_read(),
        Direction::Write => pool.can_write(),
        Direction::Cache => {
            pool.can_read_from_tape() && pool.hsm_instances.contains(hsm)
        }
        Direction::P2p => pool.can_write_for_p2p(),
    }
}

/// Compute the ordered preference levels for a request. Runs under the
/// graph's read lock (the caller holds it).
pub(crate) fn match_levels(
    g: &Graph,
    input: &MatchInput<'_>,
    exclude: &dyn Fn(&Pool) -> bool,
) -> Result<Vec<PoolPreferenceLevel>, CacheError> {
    // 1. resolve units
    let mut matched_units: Vec<String> = Vec::new();

    matched_units.push(resolve_store_unit(g, input.store_unit)?);

    if let Some(dcache) = input.dcache_unit {
        // exact only; this unit type has no fallback
        if !g.units.get(dcache).is_some_and(|u| u.kind() == UnitType::Dcache) {
            return Err(CacheError::InvalidArgument(format!(
                "dcache unit '{dcache}' not found"
            )));
        }
        matched_units.push(dcache.to_string());
    }

    if let Some(protocol) = input.protocol_unit {
        if let Some(unit) = resolve_protocol_unit(g, protocol)? {
            matched_units.push(unit);
        }
    }

    if let Some(addr) = input.net_address {
        if let Some(unit) = g.netmatcher.match_addr(addr) {
            matched_units.push(unit.to_string());
        }
    }

    // 2. unit groups hit by the matched units
    let mut hit_groups: HashSet<&str> = HashSet::new();
    for unit_name in &matched_units {
        if let Some(unit) = g.units.get(unit_name) {
            for group in &unit.ugroups {
                hit_groups.insert(group.as_str());
            }
        }
    }

    if let Some(lg) = input.link_group {
        if !g.link_groups.contains_key(lg) {
            return Err(CacheError::InvalidArgument(format!(
                "link group '{lg}' not found"
            )));
        }
    }

    // 3. qualify links: every required group hit, and no more groups
    // required than units were matched
    let supplied = matched_units.len();
    let mut qualified: Vec<&Link> = g
        .links
        .values()
        .filter(|link| {
            link.ugroups().len() <= supplied
                && link.ugroups().iter().all(|ug| hit_groups.contains(ug.as_str()))
        })
        .filter(|link| match input.link_group {
            Some(lg) => link.link_group.as_deref() == Some(lg),
            None => true,
        })
        .collect();
    qualified.sort_by(|a, b| a.name().cmp(b.name()));

    // 4. group by preference for the direction; zero disables the link
    let mut by_pref: BTreeMap<i32, Vec<&Link>> = BTreeMap::new();
    for link in qualified {
        let pref = link.preference(input.direction);
        if pref > 0 {
            by_pref.entry(pref).or_default().push(link);
        }
    }

    let hsm = input
        .store_unit
        .split_once('@')
        .map(|(_, h)| h)
        .unwrap_or("");

    // 5. expand, filter and de-duplicate per level, best preference first
    let mut levels = Vec::with_capacity(by_pref.len());
    for (_pref, links) in by_pref.iter().rev() {
        let mut names: Vec<String> = Vec::new();
        let mut tag = None;
        for link in links {
            if tag.is_none() {
                tag = link.section.clone();
            }
            for pool in &link.pools {
                if !names.contains(pool) {
                    names.push(pool.clone());
                }
            }
            for pgroup in &link.pgroups {
                g.expand_pgroup(pgroup, &mut names, &mut BTreeSet::new());
            }
        }
        let pools: Vec<String> = names
            .into_iter()
            .filter(|name| {
                g.pools.get(name).is_some_and(|pool| {
                    capability_filter(input.direction, pool, hsm)
                        && (g.all_pools_active || pool.is_active(g.active_timeout))
                        && !exclude(pool)
                })
            })
            .collect();
        levels.push(PoolPreferenceLevel { pools, tag });
    }

    tracing::debug!(
        "match {} store={} -> {} level(s)",
        input.direction,
        input.store_unit,
        levels.len()
    );
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use spool_core::protocols::{PoolCostInfo, PoolHeartbeat, PoolMode};

    use super::*;
    use crate::graph::PoolSelectionUnit;

    fn no_exclude(_: &Pool) -> bool {
        false
    }

    fn heartbeat(pool: &str, mode: PoolMode, hsms: &[&str]) -> PoolHeartbeat {
        PoolHeartbeat {
            pool: pool.to_string(),
            address: format!("{pool}@10.0.0.1:1094"),
            hostname: None,
            serial: 1,
            mode,
            cost: PoolCostInfo::new(0.1, 0.1, 1 << 30, 1 << 29),
            hsm_instances: hsms.iter().map(|s| s.to_string()).collect(),
            tags: BTreeMap::new(),
        }
    }

    /// One store unit in one group, one link with two pools at read
    /// preference 10.
    fn simple_graph() -> PoolSelectionUnit {
        let psu = PoolSelectionUnit::default();
        psu.create_unit("exp:raw@osm", UnitType::Store).unwrap();
        psu.create_ugroup("stores").unwrap();
        psu.addto_ugroup("stores", "exp:raw@osm").unwrap();
        psu.create_link("ln", vec!["stores".to_string()]).unwrap();
        psu.set_link("ln", Some(10), Some(5), Some(5), None, None).unwrap();
        psu.update_pool(&heartbeat("pool1", PoolMode::enabled(), &["osm"]));
        psu.update_pool(&heartbeat("pool2", PoolMode::enabled(), &["osm"]));
        psu.add_link_pool("ln", "pool1").unwrap();
        psu.add_link_pool("ln", "pool2").unwrap();
        psu
    }

    fn read_input(store: &'static str) -> MatchInput<'static> {
        MatchInput {
            direction: Direction::Read,
            store_unit: store,
            dcache_unit: None,
            protocol_unit: None,
            net_address: None,
            link_group: None,
        }
    }

    #[test]
    fn test_single_level_match() {
        let psu = simple_graph();
        let levels = psu.match_levels(&read_input("exp:raw@osm"), &no_exclude).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].pools, vec!["pool1", "pool2"]);
    }

    #[test]
    fn test_store_unit_fallback_chain() {
        let psu = simple_graph();
        psu.create_unit("*@osm", UnitType::Store).unwrap();
        psu.addto_ugroup("stores", "*@osm").unwrap();
        psu.create_unit("*@*", UnitType::Store).unwrap();
        psu.addto_ugroup("stores", "*@*").unwrap();

        // exact miss falls back to *@osm
        let levels = psu.match_levels(&read_input("other:class@osm"), &no_exclude).unwrap();
        assert_eq!(levels[0].pools.len(), 2);

        // unknown hsm falls back to *@*
        let levels = psu.match_levels(&read_input("x@enstore"), &no_exclude).unwrap();
        assert_eq!(levels[0].pools.len(), 2);
    }

    #[test]
    fn test_store_unit_miss_is_an_error() {
        let psu = simple_graph();
        let err = psu.match_levels(&read_input("nobody@nowhere"), &no_exclude).unwrap_err();
        assert!(matches!(err, CacheError::NoPoolConfigured(_)));
    }

    #[test]
    fn test_dcache_unit_has_no_fallback() {
        let psu = simple_graph();
        let mut input = read_input("exp:raw@osm");
        input.dcache_unit = Some("cached");
        assert!(matches!(
            psu.match_levels(&input, &no_exclude),
            Err(CacheError::InvalidArgument(_))
        ));

        psu.create_unit("cached", UnitType::Dcache).unwrap();
        psu.addto_ugroup("stores", "cached").unwrap();
        assert!(psu.match_levels(&input, &no_exclude).is_ok());
    }

    #[test]
    fn test_protocol_miss_is_tolerated() {
        let psu = simple_graph();
        let mut input = read_input("exp:raw@osm");
        input.protocol_unit = Some("dcap/3");
        let levels = psu.match_levels(&input, &no_exclude).unwrap();
        assert_eq!(levels[0].pools.len(), 2);
    }

    #[test]
    fn test_protocol_fallback_chain() {
        let psu = simple_graph();
        psu.create_ugroup("protos").unwrap();
        psu.create_unit("dcap/*", UnitType::Protocol).unwrap();
        psu.addto_ugroup("protos", "dcap/*").unwrap();
        // a second link requires both groups
        psu.create_link("ln2", vec!["stores".to_string(), "protos".to_string()])
            .unwrap();
        psu.set_link("ln2", Some(20), None, None, None, None).unwrap();
        psu.add_link_pool("ln2", "pool1").unwrap();

        // without a protocol only ln qualifies
        let levels = psu.match_levels(&read_input("exp:raw@osm"), &no_exclude).unwrap();
        assert_eq!(levels.len(), 1);

        // dcap/2 falls back to dcap/* and ln2 wins at preference 20
        let mut input = read_input("exp:raw@osm");
        input.protocol_unit = Some("dcap/2");
        let levels = psu.match_levels(&input, &no_exclude).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].pools, vec!["pool1"]);
    }

    #[test]
    fn test_preference_ordering_and_stability() {
        let psu = simple_graph();
        psu.create_link("ln-low", vec!["stores".to_string()]).unwrap();
        psu.set_link("ln-low", Some(5), None, None, None, None).unwrap();
        psu.update_pool(&heartbeat("pool3", PoolMode::enabled(), &["osm"]));
        psu.add_link_pool("ln-low", "pool3").unwrap();

        let first = psu.match_levels(&read_input("exp:raw@osm"), &no_exclude).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].pools, vec!["pool1", "pool2"], "higher preference first");
        assert_eq!(first[1].pools, vec!["pool3"]);

        // repeated calls without graph mutation return identical levels
        for _ in 0..5 {
            let again = psu.match_levels(&read_input("exp:raw@osm"), &no_exclude).unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_direction_capability_filter() {
        let psu = simple_graph();
        // pool2 becomes read-only: still readable, not writable
        psu.set_pool_read_only("pool2", true).unwrap();

        let levels = psu.match_levels(&read_input("exp:raw@osm"), &no_exclude).unwrap();
        assert_eq!(levels[0].pools, vec!["pool1", "pool2"]);

        let mut input = read_input("exp:raw@osm");
        input.direction = Direction::Write;
        let levels = psu.match_levels(&input, &no_exclude).unwrap();
        assert_eq!(levels[0].pools, vec!["pool1"]);
    }

    #[test]
    fn test_cache_direction_requires_attached_hsm() {
        let psu = simple_graph();
        psu.update_pool(&heartbeat("pool-nohsm", PoolMode::enabled(), &[]));
        psu.add_link_pool("ln", "pool-nohsm").unwrap();

        let mut input = read_input("exp:raw@osm");
        input.direction = Direction::Cache;
        let levels = psu.match_levels(&input, &no_exclude).unwrap();
        assert_eq!(levels[0].pools, vec!["pool1", "pool2"]);
    }

    #[test]
    fn test_exclude_predicate() {
        let psu = simple_graph();
        let levels = psu
            .match_levels(&read_input("exp:raw@osm"), &|p: &Pool| p.name() == "pool1")
            .unwrap();
        assert_eq!(levels[0].pools, vec!["pool2"]);
    }

    #[test]
    fn test_link_group_restriction() {
        let psu = simple_graph();
        psu.create_link_group("lg").unwrap();

        let mut input = read_input("exp:raw@osm");
        input.link_group = Some("nope");
        assert!(matches!(
            psu.match_levels(&input, &no_exclude),
            Err(CacheError::InvalidArgument(_))
        ));

        // ln is not in lg: nothing qualifies
        input.link_group = Some("lg");
        let levels = psu.match_levels(&input, &no_exclude).unwrap();
        assert!(levels.is_empty());

        psu.addto_link_group("lg", "ln").unwrap();
        let levels = psu.match_levels(&input, &no_exclude).unwrap();
        assert_eq!(levels[0].pools.len(), 2);
    }

    #[test]
    fn test_inactive_pools_are_filtered() {
        let psu = simple_graph();
        // pool goes dead: mode disables every capability
        psu.update_pool(&heartbeat(
            "pool2",
            PoolMode::new(PoolMode::DISABLED_DEAD),
            &["osm"],
        ));
        let levels = psu.match_levels(&read_input("exp:raw@osm"), &no_exclude).unwrap();
        assert_eq!(levels[0].pools, vec!["pool1"]);
    }

    #[test]
    fn test_net_unit_routing() {
        let psu = simple_graph();
        psu.create_ugroup("nets").unwrap();
        psu.create_unit("10.0.0.0/24", UnitType::Net).unwrap();
        psu.addto_ugroup("nets", "10.0.0.0/24").unwrap();
        psu.create_link("ln-net", vec!["stores".to_string(), "nets".to_string()])
            .unwrap();
        psu.set_link("ln-net", Some(30), None, None, None, None).unwrap();
        psu.add_link_pool("ln-net", "pool2").unwrap();

        // inside the subnet the net link dominates
        let mut input = read_input("exp:raw@osm");
        input.net_address = Some("10.0.0.5".parse().unwrap());
        let levels = psu.match_levels(&input, &no_exclude).unwrap();
        assert_eq!(levels[0].pools, vec!["pool2"]);

        // outside, only the plain link qualifies
        input.net_address = Some("10.0.1.5".parse().unwrap());
        let levels = psu.match_levels(&input, &no_exclude).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].pools, vec!["pool1", "pool2"]);
    }

    #[test]
    fn test_regex_store_units() {
        let psu = simple_graph();
        psu.set_regex_store_units(true);
        psu.create_unit("exp:.*@osm", UnitType::Store).unwrap();
        psu.addto_ugroup("stores", "exp:.*@osm").unwrap();

        let levels = psu.match_levels(&read_input("exp:mc2024@osm"), &no_exclude).unwrap();
        assert_eq!(levels[0].pools.len(), 2);
    }

    #[test]
    fn test_partition_tag_propagates() {
        let psu = simple_graph();
        psu.set_link("ln", None, None, None, None, Some(Some("fast".to_string())))
            .unwrap();
        let levels = psu.match_levels(&read_input("exp:raw@osm"), &no_exclude).unwrap();
        assert_eq!(levels[0].tag.as_deref(), Some("fast"));
    }
}
