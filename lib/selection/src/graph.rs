//! The policy graph and its guarded operations.
//!
//! One process-wide read/write lock mediates the whole graph: matches and
//! snapshot queries share the read side, structural mutation takes the write
//! side. Internal helpers operate on an already-locked view so no code path
//! acquires twice.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use spool_core::CacheError;
use spool_core::config::SelectionConfig;
use spool_core::protocols::{PoolHeartbeat, PoolStatusChange};

use crate::entities::{Link, LinkGroup, PGroup, PGroupKind, Pool, Unit, UnitGroup, UnitType};
use crate::matcher::{self, MatchInput, PoolPreferenceLevel};
use crate::net::{NetMatcher, parse_net_unit};

/// Every pool belongs to this group in addition to any explicit ones.
pub const DEFAULT_PGROUP: &str = "default";

/// Result of a heartbeat upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// False when the heartbeat only refreshed the activity timestamp.
    pub changed: bool,
    pub status_change: Option<PoolStatusChange>,
}

pub(crate) struct Graph {
    pub units: HashMap<String, Unit>,
    pub ugroups: HashMap<String, UnitGroup>,
    pub pools: HashMap<String, Pool>,
    pub pgroups: HashMap<String, PGroup>,
    pub links: HashMap<String, Link>,
    pub link_groups: HashMap<String, LinkGroup>,
    pub netmatcher: NetMatcher,
    pub all_pools_active: bool,
    pub regex_store_units: bool,
    pub active_timeout: Duration,
}

impl Graph {
    fn new(config: &SelectionConfig) -> Self {
        let mut pgroups = HashMap::new();
        pgroups.insert(
            DEFAULT_PGROUP.to_string(),
            PGroup::new(DEFAULT_PGROUP, PGroupKind::Static, false),
        );
        Self {
            units: HashMap::new(),
            ugroups: HashMap::new(),
            pools: HashMap::new(),
            pgroups,
            links: HashMap::new(),
            link_groups: HashMap::new(),
            netmatcher: NetMatcher::new(),
            all_pools_active: config.all_pools_active,
            regex_store_units: config.regex_store_units,
            active_timeout: Duration::from_secs(config.pool_active_timeout_secs),
        }
    }

    /// Expand a pool group to its member pool names, following nested
    /// sub-groups, cycle-safe, in deterministic order.
    pub(crate) fn expand_pgroup(&self, name: &str, out: &mut Vec<String>, seen: &mut BTreeSet<String>) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(group) = self.pgroups.get(name) else {
            return;
        };
        for pool in &group.pools {
            if !out.contains(pool) {
                out.push(pool.clone());
            }
        }
        for sub in &group.subgroups {
            self.expand_pgroup(sub, out, seen);
        }
    }

    fn unknown<T>(kind: &str, name: &str) -> Result<T, CacheError> {
        Err(CacheError::InvalidArgument(format!("{kind} '{name}' not found")))
    }

    fn duplicate<T>(kind: &str, name: &str) -> Result<T, CacheError> {
        Err(CacheError::InvalidArgument(format!("{kind} '{name}' already exists")))
    }

    /// Re-evaluate every dynamic pool group's predicate against one pool.
    fn reevaluate_dynamic_groups(&mut self, pool_name: &str) {
        let tags = match self.pools.get(pool_name) {
            Some(p) => p.tags.clone(),
            None => return,
        };
        let mut joined = Vec::new();
        let mut left = Vec::new();
        for (gname, group) in self.pgroups.iter_mut() {
            if !group.is_dynamic() {
                continue;
            }
            let member = group.pools.contains(pool_name);
            if group.matches_tags(&tags) {
                if !member {
                    group.pools.insert(pool_name.to_string());
                    joined.push(gname.clone());
                }
            } else if member {
                group.pools.remove(pool_name);
                left.push(gname.clone());
            }
        }
        if let Some(pool) = self.pools.get_mut(pool_name) {
            for g in &joined {
                pool.pgroups.insert(g.clone());
            }
            for g in &left {
                pool.pgroups.remove(g);
            }
        }
        for g in joined {
            tracing::info!("pool {pool_name} joined dynamic group {g}");
        }
        for g in left {
            tracing::info!("pool {pool_name} left dynamic group {g}");
        }
    }
}

/// The selection unit. All public accessors take the read lock, all
/// mutators the write lock, exactly once per call.
pub struct PoolSelectionUnit {
    graph: RwLock<Graph>,
    status_tx: broadcast::Sender<PoolStatusChange>,
}

impl Default for PoolSelectionUnit {
    fn default() -> Self {
        Self::new(&SelectionConfig::default())
    }
}

impl PoolSelectionUnit {
    pub fn new(config: &SelectionConfig) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            graph: RwLock::new(Graph::new(config)),
            status_tx,
        }
    }

    /// Subscribe to pool UP/DOWN/RESTART notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolStatusChange> {
        self.status_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // units and unit groups
    // ------------------------------------------------------------------

    pub fn create_unit(&self, name: &str, kind: UnitType) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if g.units.contains_key(name) {
            return Graph::duplicate("unit", name);
        }
        let unit = Unit::new(name, kind)?;
        if kind == UnitType::Net {
            g.netmatcher.add(parse_net_unit(name)?, name);
        }
        g.units.insert(name.to_string(), unit);
        Ok(())
    }

    pub fn remove_unit(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        let Some(unit) = g.units.get(name) else {
            return Graph::unknown("unit", name);
        };
        if !unit.ugroups.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "unit '{name}' is still member of unit group(s); remove it from them first"
            )));
        }
        if unit.kind() == UnitType::Net {
            let net = parse_net_unit(name)?;
            g.netmatcher.remove(&net);
        }
        g.units.remove(name);
        Ok(())
    }

    pub fn create_ugroup(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if g.ugroups.contains_key(name) {
            return Graph::duplicate("unit group", name);
        }
        g.ugroups.insert(name.to_string(), UnitGroup::new(name));
        Ok(())
    }

    pub fn remove_ugroup(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        let Some(group) = g.ugroups.get(name) else {
            return Graph::unknown("unit group", name);
        };
        if !group.units.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "unit group '{name}' still has member units"
            )));
        }
        if !group.links.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "unit group '{name}' is still required by link(s)"
            )));
        }
        g.ugroups.remove(name);
        Ok(())
    }

    pub fn addto_ugroup(&self, group: &str, unit: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.ugroups.contains_key(group) {
            return Graph::unknown("unit group", group);
        }
        if !g.units.contains_key(unit) {
            return Graph::unknown("unit", unit);
        }
        g.ugroups.get_mut(group).unwrap().units.insert(unit.to_string());
        g.units.get_mut(unit).unwrap().ugroups.insert(group.to_string());
        Ok(())
    }

    pub fn removefrom_ugroup(&self, group: &str, unit: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.ugroups.contains_key(group) {
            return Graph::unknown("unit group", group);
        }
        if !g.units.contains_key(unit) {
            return Graph::unknown("unit", unit);
        }
        g.ugroups.get_mut(group).unwrap().units.remove(unit);
        g.units.get_mut(unit).unwrap().ugroups.remove(group);
        Ok(())
    }

    // ------------------------------------------------------------------
    // pools and pool groups
    // ------------------------------------------------------------------

    pub fn create_pool(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if g.pools.contains_key(name) {
            return Graph::duplicate("pool", name);
        }
        let mut pool = Pool::new(name);
        pool.pgroups.insert(DEFAULT_PGROUP.to_string());
        g.pools.insert(name.to_string(), pool);
        g.pgroups
            .get_mut(DEFAULT_PGROUP)
            .expect("default pool group always exists")
            .pools
            .insert(name.to_string());
        Ok(())
    }

    pub fn remove_pool(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        let Some(pool) = g.pools.remove(name) else {
            return Graph::unknown("pool", name);
        };
        for group in &pool.pgroups {
            if let Some(pg) = g.pgroups.get_mut(group) {
                pg.pools.remove(name);
            }
        }
        for link in &pool.links {
            if let Some(l) = g.links.get_mut(link) {
                l.pools.remove(name);
            }
        }
        tracing::info!("pool {name} removed");
        Ok(())
    }

    pub fn create_pgroup(
        &self,
        name: &str,
        primary: bool,
        dynamic_predicate: Option<BTreeMap<String, String>>,
    ) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if g.pgroups.contains_key(name) {
            return Graph::duplicate("pool group", name);
        }
        let kind = match dynamic_predicate {
            Some(predicate) if predicate.is_empty() => {
                return Err(CacheError::InvalidArgument(
                    "dynamic pool group needs a non-empty tag predicate".into(),
                ));
            }
            Some(predicate) => PGroupKind::Dynamic { predicate },
            None => PGroupKind::Static,
        };
        let dynamic = matches!(kind, PGroupKind::Dynamic { .. });
        g.pgroups.insert(name.to_string(), PGroup::new(name, kind, primary));
        if dynamic {
            let pool_names: Vec<String> = g.pools.keys().cloned().collect();
            for pool in pool_names {
                g.reevaluate_dynamic_groups(&pool);
            }
        }
        Ok(())
    }

    pub fn remove_pgroup(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if name == DEFAULT_PGROUP {
            return Err(CacheError::InvalidArgument(
                "the default pool group cannot be removed".into(),
            ));
        }
        let Some(group) = g.pgroups.get(name) else {
            return Graph::unknown("pool group", name);
        };
        if !group.pools.is_empty() || !group.subgroups.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "pool group '{name}' still has members"
            )));
        }
        if !group.links.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "pool group '{name}' is still targeted by link(s)"
            )));
        }
        g.pgroups.remove(name);
        Ok(())
    }

    pub fn addto_pgroup(&self, group: &str, pool: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.pgroups.contains_key(group) {
            return Graph::unknown("pool group", group);
        }
        if !g.pools.contains_key(pool) {
            return Graph::unknown("pool", pool);
        }
        g.pgroups.get_mut(group).unwrap().pools.insert(pool.to_string());
        g.pools.get_mut(pool).unwrap().pgroups.insert(group.to_string());
        Ok(())
    }

    pub fn removefrom_pgroup(&self, group: &str, pool: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if group == DEFAULT_PGROUP {
            return Err(CacheError::InvalidArgument(
                "pools cannot leave the default pool group".into(),
            ));
        }
        if !g.pgroups.contains_key(group) {
            return Graph::unknown("pool group", group);
        }
        if !g.pools.contains_key(pool) {
            return Graph::unknown("pool", pool);
        }
        g.pgroups.get_mut(group).unwrap().pools.remove(pool);
        g.pools.get_mut(pool).unwrap().pgroups.remove(group);
        Ok(())
    }

    /// Nest `child` inside `parent`. Rejects self-nesting; deeper cycles are
    /// tolerated by the cycle-safe expansion.
    pub fn addto_pgroup_nested(&self, parent: &str, child: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if parent == child {
            return Err(CacheError::InvalidArgument(format!(
                "pool group '{parent}' cannot contain itself"
            )));
        }
        if !g.pgroups.contains_key(parent) {
            return Graph::unknown("pool group", parent);
        }
        if !g.pgroups.contains_key(child) {
            return Graph::unknown("pool group", child);
        }
        g.pgroups.get_mut(parent).unwrap().subgroups.insert(child.to_string());
        Ok(())
    }

    pub fn removefrom_pgroup_nested(&self, parent: &str, child: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.pgroups.contains_key(parent) {
            return Graph::unknown("pool group", parent);
        }
        g.pgroups.get_mut(parent).unwrap().subgroups.remove(child);
        Ok(())
    }

    // ------------------------------------------------------------------
    // links and link groups
    // ------------------------------------------------------------------

    /// Create a link requiring the given unit groups. The required set is
    /// fixed for the life of the link.
    pub fn create_link(&self, name: &str, ugroups: Vec<String>) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if g.links.contains_key(name) {
            return Graph::duplicate("link", name);
        }
        for group in &ugroups {
            if !g.ugroups.contains_key(group) {
                return Graph::unknown("unit group", group);
            }
        }
        for group in &ugroups {
            g.ugroups.get_mut(group).unwrap().links.insert(name.to_string());
        }
        let link = Link::new(name, ugroups.into_iter().collect());
        g.links.insert(name.to_string(), link);
        Ok(())
    }

    pub fn remove_link(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        let Some(link) = g.links.remove(name) else {
            return Graph::unknown("link", name);
        };
        for group in link.ugroups() {
            if let Some(ug) = g.ugroups.get_mut(group) {
                ug.links.remove(name);
            }
        }
        for pool in &link.pools {
            if let Some(p) = g.pools.get_mut(pool) {
                p.links.remove(name);
            }
        }
        for pgroup in &link.pgroups {
            if let Some(pg) = g.pgroups.get_mut(pgroup) {
                pg.links.remove(name);
            }
        }
        if let Some(lg) = link.link_group.as_ref().and_then(|n| g.link_groups.get_mut(n)) {
            lg.links.remove(name);
        }
        Ok(())
    }

    pub fn add_link_pool(&self, link: &str, pool: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.links.contains_key(link) {
            return Graph::unknown("link", link);
        }
        if !g.pools.contains_key(pool) {
            return Graph::unknown("pool", pool);
        }
        g.links.get_mut(link).unwrap().pools.insert(pool.to_string());
        g.pools.get_mut(pool).unwrap().links.insert(link.to_string());
        Ok(())
    }

    pub fn remove_link_pool(&self, link: &str, pool: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.links.contains_key(link) {
            return Graph::unknown("link", link);
        }
        g.links.get_mut(link).unwrap().pools.remove(pool);
        if let Some(p) = g.pools.get_mut(pool) {
            p.links.remove(link);
        }
        Ok(())
    }

    pub fn add_link_pgroup(&self, link: &str, pgroup: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.links.contains_key(link) {
            return Graph::unknown("link", link);
        }
        if !g.pgroups.contains_key(pgroup) {
            return Graph::unknown("pool group", pgroup);
        }
        g.links.get_mut(link).unwrap().pgroups.insert(pgroup.to_string());
        g.pgroups.get_mut(pgroup).unwrap().links.insert(link.to_string());
        Ok(())
    }

    pub fn remove_link_pgroup(&self, link: &str, pgroup: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.links.contains_key(link) {
            return Graph::unknown("link", link);
        }
        g.links.get_mut(link).unwrap().pgroups.remove(pgroup);
        if let Some(pg) = g.pgroups.get_mut(pgroup) {
            pg.links.remove(link);
        }
        Ok(())
    }

    pub fn set_link(
        &self,
        name: &str,
        read: Option<i32>,
        write: Option<i32>,
        cache: Option<i32>,
        p2p: Option<i32>,
        section: Option<Option<String>>,
    ) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        let Some(link) = g.links.get_mut(name) else {
            return Graph::unknown("link", name);
        };
        if let Some(v) = read {
            link.prefs.read = v;
        }
        if let Some(v) = write {
            link.prefs.write = v;
        }
        if let Some(v) = cache {
            link.prefs.cache = v;
        }
        if let Some(v) = p2p {
            link.prefs.p2p = v;
        }
        if let Some(v) = section {
            link.section = v;
        }
        Ok(())
    }

    pub fn create_link_group(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if g.link_groups.contains_key(name) {
            return Graph::duplicate("link group", name);
        }
        g.link_groups.insert(name.to_string(), LinkGroup::new(name));
        Ok(())
    }

    pub fn remove_link_group(&self, name: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        let Some(group) = g.link_groups.get(name) else {
            return Graph::unknown("link group", name);
        };
        if !group.links.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "link group '{name}' still has member links"
            )));
        }
        g.link_groups.remove(name);
        Ok(())
    }

    /// Add a link to a link group, leaving its previous group if any. A link
    /// belongs to at most one group at a time.
    pub fn addto_link_group(&self, group: &str, link: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.link_groups.contains_key(group) {
            return Graph::unknown("link group", group);
        }
        let Some(l) = g.links.get(link) else {
            return Graph::unknown("link", link);
        };
        let previous = l.link_group.clone();
        if let Some(prev) = previous {
            if let Some(pg) = g.link_groups.get_mut(&prev) {
                pg.links.remove(link);
            }
        }
        g.link_groups.get_mut(group).unwrap().links.insert(link.to_string());
        g.links.get_mut(link).unwrap().link_group = Some(group.to_string());
        Ok(())
    }

    pub fn removefrom_link_group(&self, group: &str, link: &str) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        if !g.link_groups.contains_key(group) {
            return Graph::unknown("link group", group);
        }
        g.link_groups.get_mut(group).unwrap().links.remove(link);
        if let Some(l) = g.links.get_mut(link) {
            if l.link_group.as_deref() == Some(group) {
                l.link_group = None;
            }
        }
        Ok(())
    }

    pub fn with_link_group_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut LinkGroup) -> R,
    ) -> Result<R, CacheError> {
        let mut g = self.graph.write();
        match g.link_groups.get_mut(name) {
            Some(lg) => Ok(f(lg)),
            None => Graph::unknown("link group", name),
        }
    }

    // ------------------------------------------------------------------
    // pool state
    // ------------------------------------------------------------------

    pub fn set_pool_enabled(&self, name: &str, enabled: bool) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        let Some(pool) = g.pools.get_mut(name) else {
            return Graph::unknown("pool", name);
        };
        pool.enabled = enabled;
        Ok(())
    }

    pub fn set_pool_read_only(&self, name: &str, read_only: bool) -> Result<(), CacheError> {
        let mut g = self.graph.write();
        let Some(pool) = g.pools.get_mut(name) else {
            return Graph::unknown("pool", name);
        };
        pool.read_only = read_only;
        Ok(())
    }

    pub fn set_regex_store_units(&self, on: bool) {
        self.graph.write().regex_store_units = on;
    }

    pub fn set_all_pools_active(&self, on: bool) {
        self.graph.write().all_pools_active = on;
    }

    /// Heartbeat upsert.
    ///
    /// Fast path: nothing but the activity timestamp to refresh, done under
    /// the read lock. Any field delta takes the write lock. A dead or
    /// strictly-disabled mode forces the stored serial to zero; a serial
    /// change on a live pool re-evaluates the dynamic pool groups.
    pub fn update_pool(&self, hb: &PoolHeartbeat) -> UpdateOutcome {
        let effective_serial = if hb.mode.is_down() { 0 } else { hb.serial };
        let hsms: BTreeSet<String> = hb.hsm_instances.iter().cloned().collect();

        {
            let g = self.graph.read();
            if let Some(pool) = g.pools.get(&hb.pool) {
                let unchanged = pool.address == hb.address
                    && pool.hostname == hb.hostname
                    && pool.serial == effective_serial
                    && pool.mode == hb.mode
                    && pool.hsm_instances == hsms
                    && pool.tags == hb.tags;
                if unchanged {
                    pool.touch();
                    return UpdateOutcome {
                        changed: false,
                        status_change: None,
                    };
                }
            }
        }

        let mut g = self.graph.write();
        let known = g.pools.contains_key(&hb.pool);
        let (old_mode, old_serial) = match g.pools.get(&hb.pool) {
            Some(p) => (Some(p.mode), p.serial),
            None => (None, 0),
        };

        if !known {
            let mut pool = Pool::new(&hb.pool);
            pool.pgroups.insert(DEFAULT_PGROUP.to_string());
            g.pools.insert(hb.pool.clone(), pool);
            g.pgroups
                .get_mut(DEFAULT_PGROUP)
                .expect("default pool group always exists")
                .pools
                .insert(hb.pool.clone());
            tracing::info!("pool {} appeared at {}", hb.pool, hb.address);
        }

        {
            let pool = g.pools.get_mut(&hb.pool).unwrap();
            pool.address = hb.address.clone();
            pool.hostname = hb.hostname.clone();
            pool.serial = effective_serial;
            pool.mode = hb.mode;
            pool.hsm_instances = hsms;
            pool.tags = hb.tags.clone();
            pool.touch();
        }

        let serial_changed = old_serial != effective_serial;
        if serial_changed && !hb.mode.is_disabled() {
            g.reevaluate_dynamic_groups(&hb.pool);
        }

        let status_change = match old_mode {
            None => (!hb.mode.is_disabled()).then(|| PoolStatusChange::Up {
                pool: hb.pool.clone(),
            }),
            Some(old) if old.is_disabled() && !hb.mode.is_disabled() => {
                Some(PoolStatusChange::Up {
                    pool: hb.pool.clone(),
                })
            }
            Some(old) if !old.is_disabled() && hb.mode.is_disabled() => {
                Some(PoolStatusChange::Down {
                    pool: hb.pool.clone(),
                })
            }
            Some(_) if serial_changed && !hb.mode.is_disabled() => {
                Some(PoolStatusChange::Restart {
                    pool: hb.pool.clone(),
                })
            }
            Some(_) => None,
        };
        drop(g);

        if let Some(change) = &status_change {
            tracing::info!("pool status change: {change:?}");
            let _ = self.status_tx.send(change.clone());
        }

        UpdateOutcome {
            changed: true,
            status_change,
        }
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    pub fn get_pool(&self, name: &str) -> Option<Pool> {
        self.graph.read().pools.get(name).cloned()
    }

    pub fn get_active_pools(&self) -> Vec<String> {
        let g = self.graph.read();
        let mut names: Vec<String> = g
            .pools
            .values()
            .filter(|p| g.all_pools_active || p.is_active(g.active_timeout))
            .map(|p| p.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn get_defined_pools(&self, enabled_only: bool) -> Vec<String> {
        let g = self.graph.read();
        let mut names: Vec<String> = g
            .pools
            .values()
            .filter(|p| !enabled_only || p.enabled)
            .map(|p| p.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn get_pools_of_pgroup(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let g = self.graph.read();
        if !g.pgroups.contains_key(name) {
            return Graph::unknown("pool group", name);
        }
        let mut out = Vec::new();
        g.expand_pgroup(name, &mut out, &mut BTreeSet::new());
        Ok(out)
    }

    pub fn list_units(&self) -> Vec<(String, UnitType)> {
        let mut v: Vec<_> = self
            .graph
            .read()
            .units
            .values()
            .map(|u| (u.name().to_string(), u.kind()))
            .collect();
        v.sort();
        v
    }

    pub fn list_ugroups(&self) -> Vec<String> {
        let mut v: Vec<_> = self.graph.read().ugroups.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn list_pgroups(&self) -> Vec<String> {
        let mut v: Vec<_> = self.graph.read().pgroups.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn list_links(&self) -> Vec<Link> {
        let mut v: Vec<_> = self.graph.read().links.values().cloned().collect();
        v.sort_by(|a, b| a.name().cmp(b.name()));
        v
    }

    pub fn list_link_groups(&self) -> Vec<LinkGroup> {
        let mut v: Vec<_> = self.graph.read().link_groups.values().cloned().collect();
        v.sort_by(|a, b| a.name().cmp(b.name()));
        v
    }

    /// Read-only access to the raw graph for listings and setup dumps.
    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
        f(&self.graph.read())
    }

    /// Run a match under the read lock.
    pub fn match_levels(
        &self,
        input: &MatchInput<'_>,
        exclude: &dyn Fn(&Pool) -> bool,
    ) -> Result<Vec<PoolPreferenceLevel>, CacheError> {
        let g = self.graph.read();
        matcher::match_levels(&g, input, exclude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spool_core::protocols::{PoolCostInfo, PoolMode};

    fn heartbeat(pool: &str, serial: u64, mode: PoolMode) -> PoolHeartbeat {
        PoolHeartbeat {
            pool: pool.to_string(),
            address: format!("{pool}@10.0.0.1:1094"),
            hostname: None,
            serial,
            mode,
            cost: PoolCostInfo::new(0.1, 0.1, 1 << 30, 1 << 29),
            hsm_instances: vec![],
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_idempotent_heartbeat() {
        let psu = PoolSelectionUnit::default();
        let hb = heartbeat("pool1", 17, PoolMode::enabled());

        let first = psu.update_pool(&hb);
        assert!(first.changed);
        assert_eq!(
            first.status_change,
            Some(PoolStatusChange::Up {
                pool: "pool1".into()
            })
        );

        let second = psu.update_pool(&hb);
        assert!(!second.changed, "identical heartbeat must be a no-op");
        assert!(second.status_change.is_none());
        assert!(psu.get_pool("pool1").unwrap().is_active(Duration::from_secs(300)));
    }

    #[test]
    fn test_down_heartbeat_forces_serial_zero() {
        let psu = PoolSelectionUnit::default();
        psu.update_pool(&heartbeat("pool1", 17, PoolMode::enabled()));

        let out = psu.update_pool(&heartbeat("pool1", 17, PoolMode::new(PoolMode::DISABLED_DEAD)));
        assert!(out.changed);
        assert_eq!(
            out.status_change,
            Some(PoolStatusChange::Down {
                pool: "pool1".into()
            })
        );
        assert_eq!(psu.get_pool("pool1").unwrap().serial, 0);
    }

    #[test]
    fn test_restart_detection() {
        let psu = PoolSelectionUnit::default();
        psu.update_pool(&heartbeat("pool1", 17, PoolMode::enabled()));
        let out = psu.update_pool(&heartbeat("pool1", 18, PoolMode::enabled()));
        assert_eq!(
            out.status_change,
            Some(PoolStatusChange::Restart {
                pool: "pool1".into()
            })
        );
    }

    #[test]
    fn test_dynamic_pgroup_membership_follows_serial_change() {
        let psu = PoolSelectionUnit::default();
        let mut predicate = BTreeMap::new();
        predicate.insert("tier".to_string(), "ssd".to_string());
        psu.create_pgroup("fast", false, Some(predicate)).unwrap();

        let mut hb = heartbeat("pool1", 1, PoolMode::enabled());
        hb.tags.insert("tier".to_string(), "ssd".to_string());
        psu.update_pool(&hb);
        assert_eq!(psu.get_pools_of_pgroup("fast").unwrap(), vec!["pool1"]);

        // restart without the tag: membership is dropped
        let hb = heartbeat("pool1", 2, PoolMode::enabled());
        psu.update_pool(&hb);
        assert!(psu.get_pools_of_pgroup("fast").unwrap().is_empty());
    }

    #[test]
    fn test_referential_integrity_on_removal() {
        let psu = PoolSelectionUnit::default();
        psu.create_ugroup("ug").unwrap();
        psu.create_unit("dcap/3", UnitType::Protocol).unwrap();
        psu.addto_ugroup("ug", "dcap/3").unwrap();

        assert!(psu.remove_ugroup("ug").is_err(), "group with units");
        assert!(psu.remove_unit("dcap/3").is_err(), "unit still in group");

        psu.create_link("ln", vec!["ug".to_string()]).unwrap();
        psu.removefrom_ugroup("ug", "dcap/3").unwrap();
        assert!(psu.remove_ugroup("ug").is_err(), "group with inbound link");

        psu.remove_link("ln").unwrap();
        psu.remove_ugroup("ug").unwrap();
        psu.remove_unit("dcap/3").unwrap();
    }

    #[test]
    fn test_default_pgroup_membership() {
        let psu = PoolSelectionUnit::default();
        psu.create_pool("pool1").unwrap();
        assert_eq!(psu.get_pools_of_pgroup(DEFAULT_PGROUP).unwrap(), vec!["pool1"]);
        assert!(psu.removefrom_pgroup(DEFAULT_PGROUP, "pool1").is_err());
        assert!(psu.remove_pgroup(DEFAULT_PGROUP).is_err());
    }

    #[test]
    fn test_link_group_exclusive_membership() {
        let psu = PoolSelectionUnit::default();
        psu.create_ugroup("ug").unwrap();
        psu.create_link("ln", vec!["ug".to_string()]).unwrap();
        psu.create_link_group("lg1").unwrap();
        psu.create_link_group("lg2").unwrap();

        psu.addto_link_group("lg1", "ln").unwrap();
        psu.addto_link_group("lg2", "ln").unwrap();

        let groups = psu.list_link_groups();
        let lg1 = groups.iter().find(|g| g.name() == "lg1").unwrap();
        let lg2 = groups.iter().find(|g| g.name() == "lg2").unwrap();
        assert!(!lg1.links.contains("ln"));
        assert!(lg2.links.contains("ln"));
    }

    #[test]
    fn test_nested_pgroup_expansion() {
        let psu = PoolSelectionUnit::default();
        psu.create_pgroup("outer", false, None).unwrap();
        psu.create_pgroup("inner", false, None).unwrap();
        psu.create_pool("p1").unwrap();
        psu.create_pool("p2").unwrap();
        psu.addto_pgroup("outer", "p1").unwrap();
        psu.addto_pgroup("inner", "p2").unwrap();
        psu.addto_pgroup_nested("outer", "inner").unwrap();

        assert_eq!(psu.get_pools_of_pgroup("outer").unwrap(), vec!["p1", "p2"]);
        assert!(psu.addto_pgroup_nested("outer", "outer").is_err());
    }
}
