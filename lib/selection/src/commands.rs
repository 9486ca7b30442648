//! Text-command administrative surface of the selection unit.
//!
//! Commands follow the classic `psu <verb> …` shape. Every command returns a
//! human-readable result string synchronously; errors are returned to the
//! administrative caller and never retried.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use spool_core::CacheError;
use spool_core::protocols::Direction;

use crate::entities::{PGroupKind, UnitType};
use crate::graph::{DEFAULT_PGROUP, PoolSelectionUnit};
use crate::matcher::MatchInput;

pub struct CommandProcessor {
    psu: Arc<PoolSelectionUnit>,
}

fn usage<T>(message: &str) -> Result<T, CacheError> {
    Err(CacheError::InvalidArgument(format!("usage: {message}")))
}

fn parse_on_off(word: &str) -> Result<bool, CacheError> {
    match word {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(CacheError::InvalidArgument(format!(
            "expected 'on' or 'off', got '{word}'"
        ))),
    }
}

impl CommandProcessor {
    pub fn new(psu: Arc<PoolSelectionUnit>) -> Self {
        Self { psu }
    }

    /// Execute one command line.
    pub fn execute(&self, line: &str) -> Result<String, CacheError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => Ok(String::new()),
            ["psu", "create", rest @ ..] => self.create(rest),
            ["psu", "remove", rest @ ..] => self.remove(rest),
            ["psu", "addto", rest @ ..] => self.addto(rest),
            ["psu", "removefrom", rest @ ..] => self.removefrom(rest),
            ["psu", "set", rest @ ..] => self.set(rest),
            ["psu", "ls", rest @ ..] => self.ls(rest),
            ["psu", "dump", "setup"] => Ok(self.dump_setup()),
            ["psu", "match", rest @ ..] => self.match_probe(rest),
            _ => Err(CacheError::InvalidArgument(format!(
                "unknown command '{line}'"
            ))),
        }
    }

    fn create(&self, args: &[&str]) -> Result<String, CacheError> {
        match args {
            ["unit", kind_flag, name] if kind_flag.starts_with('-') => {
                let kind: UnitType = kind_flag[1..]
                    .parse()
                    .map_err(|e| CacheError::InvalidArgument(format!("{e}")))?;
                self.psu.create_unit(name, kind)?;
                Ok(format!("unit '{name}' ({kind}) created"))
            }
            ["ugroup", name] => {
                self.psu.create_ugroup(name)?;
                Ok(format!("unit group '{name}' created"))
            }
            ["pool", name] => {
                self.psu.create_pool(name)?;
                Ok(format!("pool '{name}' created"))
            }
            ["pgroup", name, flags @ ..] => {
                let primary = flags.contains(&"-primary");
                let mut predicate = BTreeMap::new();
                for flag in flags {
                    if let Some(tag) = flag.strip_prefix("-tag=") {
                        let (k, v) = tag.split_once('=').ok_or_else(|| {
                            CacheError::InvalidArgument(format!("malformed tag predicate '{flag}'"))
                        })?;
                        predicate.insert(k.to_string(), v.to_string());
                    } else if *flag != "-primary" {
                        return Err(CacheError::InvalidArgument(format!(
                            "unknown flag '{flag}'"
                        )));
                    }
                }
                let dynamic = (!predicate.is_empty()).then_some(predicate);
                self.psu.create_pgroup(name, primary, dynamic)?;
                Ok(format!("pool group '{name}' created"))
            }
            ["link", name, ugroups @ ..] if !ugroups.is_empty() => {
                self.psu
                    .create_link(name, ugroups.iter().map(|s| s.to_string()).collect())?;
                Ok(format!("link '{name}' created"))
            }
            ["linkgroup", name] => {
                self.psu.create_link_group(name)?;
                Ok(format!("link group '{name}' created"))
            }
            _ => usage("psu create unit -<type> <name> | ugroup <name> | pool <name> | pgroup <name> [-primary] [-tag=k=v …] | link <name> <ugroup> [<ugroup> …] | linkgroup <name>"),
        }
    }

    fn remove(&self, args: &[&str]) -> Result<String, CacheError> {
        match args {
            ["unit", name] => self.psu.remove_unit(name).map(|_| format!("unit '{name}' removed")),
            ["ugroup", name] => self
                .psu
                .remove_ugroup(name)
                .map(|_| format!("unit group '{name}' removed")),
            ["pool", name] => self.psu.remove_pool(name).map(|_| format!("pool '{name}' removed")),
            ["pgroup", name] => self
                .psu
                .remove_pgroup(name)
                .map(|_| format!("pool group '{name}' removed")),
            ["link", name] => self.psu.remove_link(name).map(|_| format!("link '{name}' removed")),
            ["linkgroup", name] => self
                .psu
                .remove_link_group(name)
                .map(|_| format!("link group '{name}' removed")),
            _ => usage("psu remove unit|ugroup|pool|pgroup|link|linkgroup <name>"),
        }
    }

    fn addto(&self, args: &[&str]) -> Result<String, CacheError> {
        match args {
            ["ugroup", group, unit] => self
                .psu
                .addto_ugroup(group, unit)
                .map(|_| format!("unit '{unit}' added to '{group}'")),
            ["pgroup", group, member] => {
                if let Some(sub) = member.strip_prefix('@') {
                    self.psu
                        .addto_pgroup_nested(group, sub)
                        .map(|_| format!("pool group '{sub}' nested in '{group}'"))
                } else {
                    self.psu
                        .addto_pgroup(group, member)
                        .map(|_| format!("pool '{member}' added to '{group}'"))
                }
            }
            ["link", link, target] => {
                if let Some(pgroup) = target.strip_prefix('@') {
                    self.psu
                        .add_link_pgroup(link, pgroup)
                        .map(|_| format!("pool group '{pgroup}' added to link '{link}'"))
                } else {
                    self.psu
                        .add_link_pool(link, target)
                        .map(|_| format!("pool '{target}' added to link '{link}'"))
                }
            }
            ["linkgroup", group, link] => self
                .psu
                .addto_link_group(group, link)
                .map(|_| format!("link '{link}' added to link group '{group}'")),
            _ => usage("psu addto ugroup|pgroup|link|linkgroup <container> <member>"),
        }
    }

    fn removefrom(&self, args: &[&str]) -> Result<String, CacheError> {
        match args {
            ["ugroup", group, unit] => self
                .psu
                .removefrom_ugroup(group, unit)
                .map(|_| format!("unit '{unit}' removed from '{group}'")),
            ["pgroup", group, member] => {
                if let Some(sub) = member.strip_prefix('@') {
                    self.psu
                        .removefrom_pgroup_nested(group, sub)
                        .map(|_| format!("pool group '{sub}' unnested from '{group}'"))
                } else {
                    self.psu
                        .removefrom_pgroup(group, member)
                        .map(|_| format!("pool '{member}' removed from '{group}'"))
                }
            }
            ["link", link, target] => {
                if let Some(pgroup) = target.strip_prefix('@') {
                    self.psu
                        .remove_link_pgroup(link, pgroup)
                        .map(|_| format!("pool group '{pgroup}' removed from link '{link}'"))
                } else {
                    self.psu
                        .remove_link_pool(link, target)
                        .map(|_| format!("pool '{target}' removed from link '{link}'"))
                }
            }
            ["linkgroup", group, link] => self
                .psu
                .removefrom_link_group(group, link)
                .map(|_| format!("link '{link}' removed from link group '{group}'")),
            _ => usage("psu removefrom ugroup|pgroup|link|linkgroup <container> <member>"),
        }
    }

    fn set(&self, args: &[&str]) -> Result<String, CacheError> {
        match args {
            ["link", name, flags @ ..] if !flags.is_empty() => {
                let mut read = None;
                let mut write = None;
                let mut cache = None;
                let mut p2p = None;
                let mut section = None;
                for flag in flags {
                    let (key, value) = flag.split_once('=').ok_or_else(|| {
                        CacheError::InvalidArgument(format!("malformed flag '{flag}'"))
                    })?;
                    let parse = |v: &str| {
                        v.parse::<i32>().map_err(|_| {
                            CacheError::InvalidArgument(format!("bad preference '{v}'"))
                        })
                    };
                    match key {
                        "-readpref" => read = Some(parse(value)?),
                        "-writepref" => write = Some(parse(value)?),
                        "-cachepref" => cache = Some(parse(value)?),
                        "-p2ppref" => p2p = Some(parse(value)?),
                        "-section" => {
                            section = Some(if value.eq_ignore_ascii_case("none") {
                                None
                            } else {
                                Some(value.to_string())
                            })
                        }
                        _ => {
                            return Err(CacheError::InvalidArgument(format!(
                                "unknown flag '{key}'"
                            )));
                        }
                    }
                }
                self.psu.set_link(name, read, write, cache, p2p, section)?;
                Ok(format!("link '{name}' updated"))
            }
            ["pool", name, state] => {
                match *state {
                    "enabled" => self.psu.set_pool_enabled(name, true)?,
                    "disabled" => self.psu.set_pool_enabled(name, false)?,
                    "rdonly" => self.psu.set_pool_read_only(name, true)?,
                    "notrdonly" => self.psu.set_pool_read_only(name, false)?,
                    _ => {
                        return usage("psu set pool <pool> enabled|disabled|rdonly|notrdonly");
                    }
                }
                Ok(format!("pool '{name}' set {state}"))
            }
            ["linkgroup", name, "attr", key, value] => {
                self.psu
                    .with_link_group_mut(name, |lg| lg.set_attribute(*key, *value))?;
                Ok(format!("link group '{name}' attribute '{key}' extended"))
            }
            ["linkgroup", name, flag, word] => {
                let on = parse_on_off(word)?;
                self.psu.with_link_group_mut(name, |lg| match *flag {
                    "custodial" => {
                        lg.custodial_allowed = on;
                        Ok(())
                    }
                    "output" => {
                        lg.output_allowed = on;
                        Ok(())
                    }
                    "replica" => {
                        lg.replica_allowed = on;
                        Ok(())
                    }
                    "online" => {
                        lg.online_allowed = on;
                        Ok(())
                    }
                    "nearline" => {
                        lg.nearline_allowed = on;
                        Ok(())
                    }
                    _ => Err(CacheError::InvalidArgument(format!(
                        "unknown link group flag '{flag}'"
                    ))),
                })??;
                Ok(format!("link group '{name}' {flag} {word}"))
            }
            ["regex", word] => {
                let on = parse_on_off(word)?;
                self.psu.set_regex_store_units(on);
                Ok(format!("regex store units {word}"))
            }
            ["allpoolsactive", word] => {
                let on = parse_on_off(word)?;
                self.psu.set_all_pools_active(on);
                Ok(format!("all pools active {word}"))
            }
            _ => usage(
                "psu set link <link> -readpref=N … | pool <pool> <state> | linkgroup <lg> <flag> on|off | regex on|off | allpoolsactive on|off",
            ),
        }
    }

    fn ls(&self, args: &[&str]) -> Result<String, CacheError> {
        let mut out = String::new();
        match args {
            ["unit"] => {
                for (name, kind) in self.psu.list_units() {
                    writeln!(out, "{name} ({kind})").ok();
                }
            }
            ["ugroup"] => {
                for name in self.psu.list_ugroups() {
                    writeln!(out, "{name}").ok();
                }
            }
            ["pool"] => self.psu.with_graph(|g| {
                let mut names: Vec<_> = g.pools.keys().collect();
                names.sort();
                for name in names {
                    let p = &g.pools[name];
                    writeln!(
                        out,
                        "{name} mode={} serial={} enabled={} rdonly={} active={}",
                        p.mode,
                        p.serial,
                        p.enabled,
                        p.read_only,
                        g.all_pools_active || p.is_active(g.active_timeout)
                    )
                    .ok();
                }
            }),
            ["pgroup"] => {
                for name in self.psu.list_pgroups() {
                    let pools = self.psu.get_pools_of_pgroup(&name)?;
                    writeln!(out, "{name}: {}", pools.join(",")).ok();
                }
            }
            ["link"] => {
                for link in self.psu.list_links() {
                    writeln!(
                        out,
                        "{} readpref={} writepref={} cachepref={} p2ppref={} section={} ugroups={}",
                        link.name(),
                        link.prefs.read,
                        link.prefs.write,
                        link.prefs.cache,
                        link.prefs.p2p,
                        link.section.as_deref().unwrap_or("-"),
                        link.ugroups().iter().cloned().collect::<Vec<_>>().join(",")
                    )
                    .ok();
                }
            }
            ["linkgroup"] => {
                for lg in self.psu.list_link_groups() {
                    writeln!(
                        out,
                        "{}: links={}",
                        lg.name(),
                        lg.links.iter().cloned().collect::<Vec<_>>().join(",")
                    )
                    .ok();
                }
            }
            _ => return usage("psu ls unit|ugroup|pool|pgroup|link|linkgroup"),
        }
        Ok(out)
    }

    /// Emit a replayable command script reconstructing the current graph.
    fn dump_setup(&self) -> String {
        self.psu.with_graph(|g| {
            let mut out = String::new();

            let mut units: Vec<_> = g.units.values().collect();
            units.sort_by(|a, b| a.name().cmp(b.name()));
            for unit in &units {
                writeln!(out, "psu create unit -{} {}", unit.kind(), unit.name()).ok();
            }

            let mut ugroups: Vec<_> = g.ugroups.values().collect();
            ugroups.sort_by(|a, b| a.name().cmp(b.name()));
            for group in &ugroups {
                writeln!(out, "psu create ugroup {}", group.name()).ok();
                for unit in &group.units {
                    writeln!(out, "psu addto ugroup {} {}", group.name(), unit).ok();
                }
            }

            let mut pools: Vec<_> = g.pools.values().collect();
            pools.sort_by(|a, b| a.name().cmp(b.name()));
            for pool in &pools {
                writeln!(out, "psu create pool {}", pool.name()).ok();
                if !pool.enabled {
                    writeln!(out, "psu set pool {} disabled", pool.name()).ok();
                }
                if pool.read_only {
                    writeln!(out, "psu set pool {} rdonly", pool.name()).ok();
                }
            }

            let mut pgroups: Vec<_> = g.pgroups.values().collect();
            pgroups.sort_by(|a, b| a.name().cmp(b.name()));
            for group in &pgroups {
                if group.name() == DEFAULT_PGROUP {
                    continue;
                }
                write!(out, "psu create pgroup {}", group.name()).ok();
                if group.primary {
                    write!(out, " -primary").ok();
                }
                if let PGroupKind::Dynamic { predicate } = &group.kind {
                    for (k, v) in predicate {
                        write!(out, " -tag={k}={v}").ok();
                    }
                }
                writeln!(out).ok();
                if !group.is_dynamic() {
                    for pool in &group.pools {
                        writeln!(out, "psu addto pgroup {} {}", group.name(), pool).ok();
                    }
                }
                for sub in &group.subgroups {
                    writeln!(out, "psu addto pgroup {} @{}", group.name(), sub).ok();
                }
            }

            let mut links: Vec<_> = g.links.values().collect();
            links.sort_by(|a, b| a.name().cmp(b.name()));
            for link in &links {
                let groups: Vec<_> = link.ugroups().iter().cloned().collect();
                writeln!(out, "psu create link {} {}", link.name(), groups.join(" ")).ok();
                write!(
                    out,
                    "psu set link {} -readpref={} -writepref={} -cachepref={} -p2ppref={}",
                    link.name(),
                    link.prefs.read,
                    link.prefs.write,
                    link.prefs.cache,
                    link.prefs.p2p
                )
                .ok();
                if let Some(section) = &link.section {
                    write!(out, " -section={section}").ok();
                }
                writeln!(out).ok();
                for pool in &link.pools {
                    writeln!(out, "psu addto link {} {}", link.name(), pool).ok();
                }
                for pgroup in &link.pgroups {
                    writeln!(out, "psu addto link {} @{}", link.name(), pgroup).ok();
                }
            }

            let mut link_groups: Vec<_> = g.link_groups.values().collect();
            link_groups.sort_by(|a, b| a.name().cmp(b.name()));
            for lg in &link_groups {
                writeln!(out, "psu create linkgroup {}", lg.name()).ok();
                for (flag, on) in [
                    ("custodial", lg.custodial_allowed),
                    ("output", lg.output_allowed),
                    ("replica", lg.replica_allowed),
                    ("online", lg.online_allowed),
                    ("nearline", lg.nearline_allowed),
                ] {
                    if on {
                        writeln!(out, "psu set linkgroup {} {flag} on", lg.name()).ok();
                    }
                }
                for (key, values) in &lg.attributes {
                    for value in values {
                        writeln!(out, "psu set linkgroup {} attr {key} {value}", lg.name()).ok();
                    }
                }
                for link in &lg.links {
                    writeln!(out, "psu addto linkgroup {} {}", lg.name(), link).ok();
                }
            }

            if g.regex_store_units {
                writeln!(out, "psu set regex on").ok();
            }
            if g.all_pools_active {
                writeln!(out, "psu set allpoolsactive on").ok();
            }
            out
        })
    }

    /// `psu match <direction> <store> <dcache|*> <net|*> <protocol|*>
    /// [-linkgroup=<lg>]` — diagnostic probe against the current policy.
    fn match_probe(&self, args: &[&str]) -> Result<String, CacheError> {
        let Some((&[direction, store, dcache, net, protocol], flags)) =
            args.split_first_chunk::<5>()
        else {
            return usage("psu match read|write|cache|p2p <store> <dcache|*> <net|*> <protocol|*> [-linkgroup=<lg>]");
        };
        let direction: Direction = direction
            .parse()
            .map_err(|e| CacheError::InvalidArgument(format!("{e}")))?;
        let mut link_group = None;
        for flag in flags {
            if let Some(lg) = flag.strip_prefix("-linkgroup=") {
                link_group = Some(lg);
            } else {
                return Err(CacheError::InvalidArgument(format!("unknown flag '{flag}'")));
            }
        }
        let net_address = match net {
            "*" => None,
            addr => Some(addr.parse().map_err(|_| {
                CacheError::InvalidArgument(format!("malformed address '{addr}'"))
            })?),
        };
        let input = MatchInput {
            direction,
            store_unit: store,
            dcache_unit: (dcache != "*").then_some(dcache),
            protocol_unit: (protocol != "*").then_some(protocol),
            net_address,
            link_group,
        };
        let levels = self.psu.match_levels(&input, &|_| false)?;
        if levels.iter().all(|l| l.pools.is_empty()) {
            return Ok("no pools matched".to_string());
        }
        let mut out = String::new();
        for (i, level) in levels.iter().enumerate() {
            writeln!(
                out,
                "level {} (tag={}): {}",
                i,
                level.tag.as_deref().unwrap_or("-"),
                level.pools.join(",")
            )
            .ok();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use spool_core::protocols::{PoolCostInfo, PoolHeartbeat, PoolMode};

    use super::*;

    fn processor() -> CommandProcessor {
        CommandProcessor::new(Arc::new(PoolSelectionUnit::default()))
    }

    fn feed(cp: &CommandProcessor, script: &[&str]) {
        for line in script {
            cp.execute(line).unwrap_or_else(|e| panic!("{line}: {e}"));
        }
    }

    fn activate(cp: &CommandProcessor, pool: &str) {
        cp.psu.update_pool(&PoolHeartbeat {
            pool: pool.to_string(),
            address: format!("{pool}@node:1094"),
            hostname: None,
            serial: 1,
            mode: PoolMode::enabled(),
            cost: PoolCostInfo::new(0.1, 0.1, 1 << 30, 1 << 29),
            hsm_instances: vec!["osm".to_string()],
            tags: BTreeMap::new(),
        });
    }

    #[test]
    fn test_subnet_admin_roundtrip() {
        let cp = processor();
        feed(
            &cp,
            &[
                "psu create unit -store *@*",
                "psu create unit -net 10.0.0.0/24",
                "psu create ugroup UG",
                "psu addto ugroup UG 10.0.0.0/24",
                "psu create ugroup stores",
                "psu addto ugroup stores *@*",
                "psu create pgroup PG",
                "psu create link LNK UG stores",
                "psu set link LNK -readpref=10",
                "psu addto link LNK @PG",
                "psu create pool p1",
                "psu addto pgroup PG p1",
            ],
        );
        activate(&cp, "p1");

        let inside = cp
            .execute("psu match read a@osm * 10.0.0.5 *")
            .unwrap();
        assert!(inside.contains("p1"), "inside subnet must match: {inside}");

        let outside = cp
            .execute("psu match read a@osm * 10.0.1.5 *")
            .unwrap();
        assert_eq!(outside, "no pools matched", "outside subnet must not match");
    }

    #[test]
    fn test_unknown_command_is_an_error() {
        let cp = processor();
        assert!(cp.execute("psu frobnicate").is_err());
        assert!(cp.execute("psu create gizmo x").is_err());
    }

    #[test]
    fn test_dump_setup_replays() {
        let cp = processor();
        feed(
            &cp,
            &[
                "psu create unit -store exp:raw@osm",
                "psu create unit -net 10.0.0.0/24",
                "psu create ugroup stores",
                "psu addto ugroup stores exp:raw@osm",
                "psu create pool p1",
                "psu set pool p1 rdonly",
                "psu create pgroup PG -primary",
                "psu addto pgroup PG p1",
                "psu create pgroup fast -tag=tier=ssd",
                "psu create link LNK stores",
                "psu set link LNK -readpref=10 -section=fast",
                "psu addto link LNK @PG",
                "psu create linkgroup LG",
                "psu set linkgroup LG custodial on",
                "psu set linkgroup LG attr vo atlas",
                "psu addto linkgroup LG LNK",
            ],
        );
        let dump = cp.execute("psu dump setup").unwrap();

        // replaying into a fresh unit reproduces the same dump
        let replay = processor();
        for line in dump.lines() {
            replay.execute(line).unwrap_or_else(|e| panic!("{line}: {e}"));
        }
        assert_eq!(replay.execute("psu dump setup").unwrap(), dump);
    }

    #[test]
    fn test_set_pool_states() {
        let cp = processor();
        feed(&cp, &["psu create pool p1", "psu set pool p1 disabled"]);
        assert!(!cp.psu.get_pool("p1").unwrap().enabled);
        feed(&cp, &["psu set pool p1 enabled", "psu set pool p1 rdonly"]);
        let pool = cp.psu.get_pool("p1").unwrap();
        assert!(pool.enabled && pool.read_only);
    }
}
