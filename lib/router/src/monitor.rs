//! The pool monitor: one selection context per file-location request,
//! combining the policy match with live cost data and deferring the final
//! ranking to a partition.
//!
//! Uniform fallback rule: a partition failure whose
//! [`CacheError::should_fallback`] is true lets the next preference level be
//! tried; any other failure propagates immediately. When every level is
//! exhausted with only fallback-eligible failures the last one is rethrown;
//! when no level matched at all a "no pool online" error is raised instead.

use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use spool_core::CacheError;
use spool_core::protocols::{Direction, FileAttributes, PoolHeartbeat};
use spool_selection::{MatchInput, PoolPreferenceLevel, PoolSelectionUnit};

use crate::cost::CostModule;
use crate::partition::{PartitionRegistry, PoolInfo};

/// The final pool binding handed back to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedPool {
    pub name: String,
    pub address: String,
}

impl From<PoolInfo> for SelectedPool {
    fn from(info: PoolInfo) -> Self {
        Self {
            name: info.name,
            address: info.address,
        }
    }
}

/// Shared routing state: the policy graph, the cost table and the partition
/// registry. Selection contexts are constructed fresh per request.
pub struct PoolMonitor {
    psu: Arc<PoolSelectionUnit>,
    cost: Arc<CostModule>,
    partitions: Arc<PartitionRegistry>,
    link_fallback: bool,
}

impl PoolMonitor {
    pub fn new(
        psu: Arc<PoolSelectionUnit>,
        cost: Arc<CostModule>,
        partitions: Arc<PartitionRegistry>,
    ) -> Self {
        Self {
            psu,
            cost,
            partitions,
            link_fallback: false,
        }
    }

    /// Allow read selection to fall through to lower preference levels on a
    /// fallback-eligible cost failure.
    pub fn with_link_fallback(mut self, on: bool) -> Self {
        self.link_fallback = on;
        self
    }

    pub fn selection_unit(&self) -> &Arc<PoolSelectionUnit> {
        &self.psu
    }

    pub fn cost_module(&self) -> &Arc<CostModule> {
        &self.cost
    }

    /// Single intake point for pool heartbeats: updates the policy graph and
    /// the cost table together.
    pub fn message_arrived(&self, hb: &PoolHeartbeat) -> spool_selection::UpdateOutcome {
        self.cost.message_arrived(hb);
        self.psu.update_pool(hb)
    }

    /// Build the per-request selection context.
    pub fn selector(
        &self,
        attributes: FileAttributes,
        protocol: Option<String>,
        client: Option<IpAddr>,
        link_group: Option<String>,
        excluded_hosts: HashSet<String>,
    ) -> PoolSelector {
        PoolSelector {
            psu: self.psu.clone(),
            cost: self.cost.clone(),
            partitions: self.partitions.clone(),
            link_fallback: self.link_fallback,
            attributes,
            protocol,
            client,
            link_group,
            excluded_hosts,
        }
    }
}

/// Per-request selection context. One workflow step per method; each call
/// re-reads the current graph and cost state.
pub struct PoolSelector {
    psu: Arc<PoolSelectionUnit>,
    cost: Arc<CostModule>,
    partitions: Arc<PartitionRegistry>,
    link_fallback: bool,
    attributes: FileAttributes,
    protocol: Option<String>,
    client: Option<IpAddr>,
    link_group: Option<String>,
    excluded_hosts: HashSet<String>,
}

impl PoolSelector {
    pub fn attributes(&self) -> &FileAttributes {
        &self.attributes
    }

    fn levels(&self, direction: Direction) -> Result<Vec<PoolPreferenceLevel>, CacheError> {
        let store_unit = self.attributes.store_unit_name();
        let input = MatchInput {
            direction,
            store_unit: &store_unit,
            dcache_unit: self.attributes.cache_class.as_deref(),
            protocol_unit: self.protocol.as_deref(),
            net_address: self.client,
            link_group: self.link_group.as_deref(),
        };
        let excluded = &self.excluded_hosts;
        self.psu.match_levels(&input, &|pool| {
            excluded.contains(pool.name())
                || pool.hostname.as_deref().is_some_and(|h| excluded.contains(h))
        })
    }

    /// Join a matched pool name with its live cost entry. `None` means the
    /// pool is offline for routing purposes.
    fn pool_info(&self, name: &str) -> Option<PoolInfo> {
        let info = self.cost.get_pool_cost_info(name)?;
        let performance_cost = self.cost.get_performance_cost(name)?;
        let pool = self.psu.get_pool(name)?;
        Some(PoolInfo {
            name: name.to_string(),
            address: pool.address.clone(),
            performance_cost,
            space_cost: info.space_cost,
            total_space: info.total_space,
            free_space: info.free_space,
        })
    }

    fn online_locations(&self) -> Vec<PoolInfo> {
        self.attributes
            .locations
            .iter()
            .filter_map(|name| self.pool_info(name))
            .collect()
    }

    /// The file's online replica holders, cheapest first. The workflow uses
    /// the head of this list as the "hot" pool after a cost-exceeded read.
    pub fn online_file_locations(&self) -> Vec<SelectedPool> {
        let mut located = self.online_locations();
        located.sort_by(|a, b| a.performance_cost.total_cmp(&b.performance_cost));
        located.into_iter().map(SelectedPool::from).collect()
    }

    /// Select the pool to serve a read from an existing replica.
    pub fn select_read_pool(&self) -> Result<SelectedPool, CacheError> {
        let levels = self.levels(Direction::Read)?;
        if levels.is_empty() {
            return Err(CacheError::NoPoolConfigured(format!(
                "no links match read request for {}",
                self.attributes.store_unit_name()
            )));
        }
        if self.online_locations().is_empty() {
            return Err(CacheError::FileNotInCache(self.attributes.pnfs_id.clone()));
        }

        let locations: HashSet<&String> = self.attributes.locations.iter().collect();
        let mut last_fallback = None;
        for level in &levels {
            let candidates: Vec<PoolInfo> = level
                .pools
                .iter()
                .filter(|name| locations.contains(name))
                .filter_map(|name| self.pool_info(name))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let partition = self.partitions.get(level.tag.as_deref());
            match partition.select_read_pool(&candidates) {
                Ok(best) => {
                    tracing::debug!(
                        "read pool {} selected for {}",
                        best.name,
                        self.attributes.pnfs_id
                    );
                    return Ok(best.into());
                }
                Err(e) if e.should_fallback() && self.link_fallback => last_fallback = Some(e),
                Err(e) => return Err(e),
            }
        }
        match last_fallback {
            Some(e) => Err(e),
            // the file is online somewhere, just not in any read-allowed
            // matched pool
            None => Err(CacheError::PermissionDenied(format!(
                "file {} has no replica in a read-allowed pool",
                self.attributes.pnfs_id
            ))),
        }
    }

    /// Select the pool to accept a fresh write.
    pub fn select_write_pool(&self, preallocated: u64) -> Result<SelectedPool, CacheError> {
        let levels = self.levels(Direction::Write)?;
        if levels.is_empty() {
            return Err(CacheError::NoPoolConfigured(format!(
                "no links match write request for {}",
                self.attributes.store_unit_name()
            )));
        }

        let mut last_fallback = None;
        for level in &levels {
            let candidates: Vec<PoolInfo> = level
                .pools
                .iter()
                .filter_map(|name| self.pool_info(name))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let partition = self.partitions.get(level.tag.as_deref());
            match partition.select_write_pool(&candidates, preallocated) {
                Ok(best) => return Ok(best.into()),
                Err(e) if e.should_fallback() => last_fallback = Some(e),
                Err(e) => return Err(e),
            }
        }
        match last_fallback {
            Some(e) => Err(e),
            None => Err(CacheError::NoPoolOnline("no write pool online".into())),
        }
    }

    /// Select a source and a destination for a pool-to-pool copy. The
    /// destination may be restricted to a named pool group; `force` disables
    /// the partition's cost cuts.
    pub fn select_pool2pool(
        &self,
        pool_group: Option<&str>,
        force: bool,
    ) -> Result<(SelectedPool, SelectedPool), CacheError> {
        let levels = self.levels(Direction::P2p)?;
        if levels.is_empty() {
            return Err(CacheError::NoPoolConfigured(format!(
                "no links match p2p request for {}",
                self.attributes.store_unit_name()
            )));
        }

        let sources: Vec<PoolInfo> = self
            .attributes
            .locations
            .iter()
            .filter(|name| {
                self.psu
                    .get_pool(name)
                    .is_some_and(|p| p.can_read_for_p2p())
            })
            .filter_map(|name| self.pool_info(name))
            .collect();
        if sources.is_empty() {
            return Err(CacheError::FileNotInCache(self.attributes.pnfs_id.clone()));
        }

        let group_members: Option<HashSet<String>> = match pool_group {
            Some(name) => Some(self.psu.get_pools_of_pgroup(name)?.into_iter().collect()),
            None => None,
        };
        let locations: HashSet<&String> = self.attributes.locations.iter().collect();

        let mut last_fallback = None;
        for level in &levels {
            let destinations: Vec<PoolInfo> = level
                .pools
                .iter()
                .filter(|name| !locations.contains(name))
                .filter(|name| {
                    group_members
                        .as_ref()
                        .is_none_or(|members| members.contains(name.as_str()))
                })
                .filter_map(|name| self.pool_info(name))
                .collect();
            if destinations.is_empty() {
                continue;
            }
            let partition = self.partitions.get(level.tag.as_deref());
            match partition.select_p2p_pair(&sources, &destinations, force) {
                Ok((src, dst)) => {
                    tracing::debug!(
                        "p2p {} -> {} selected for {}",
                        src.name,
                        dst.name,
                        self.attributes.pnfs_id
                    );
                    return Ok((src.into(), dst.into()));
                }
                Err(e) if e.should_fallback() => last_fallback = Some(e),
                Err(e) => return Err(e),
            }
        }
        match last_fallback {
            Some(e) => Err(e),
            None => Err(CacheError::NoPoolOnline("no p2p destination online".into())),
        }
    }

    /// Select the pool to stage an archival copy into, avoiding pools that
    /// already hold an online replica and, when possible, the previous
    /// staging pool.
    pub fn select_stage_pool(&self, previous: Option<&str>) -> Result<SelectedPool, CacheError> {
        let levels = self.levels(Direction::Cache)?;
        if levels.is_empty() {
            return Err(CacheError::NoPoolConfigured(format!(
                "no links match stage request for {}",
                self.attributes.store_unit_name()
            )));
        }

        let locations: HashSet<&String> = self.attributes.locations.iter().collect();
        let mut last_fallback = None;
        for level in &levels {
            let candidates: Vec<PoolInfo> = level
                .pools
                .iter()
                .filter(|name| !locations.contains(name))
                .filter_map(|name| self.pool_info(name))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let partition = self.partitions.get(level.tag.as_deref());
            match partition.select_stage_pool(&candidates, previous) {
                Ok(best) => return Ok(best.into()),
                Err(e) if e.should_fallback() => last_fallback = Some(e),
                Err(e) => return Err(e),
            }
        }
        match last_fallback {
            Some(e) => Err(e),
            None => Err(CacheError::NoPoolOnline("no stage pool online".into())),
        }
    }

    /// Deterministic pin-pool choice: a stable hash of `(pnfsId, pool)`
    /// over the online candidates of the first non-empty read level, so
    /// repeated calls for the same file pick the same pool.
    pub fn select_pin_pool(&self) -> Result<SelectedPool, CacheError> {
        let levels = self.levels(Direction::Read)?;
        if levels.is_empty() {
            return Err(CacheError::NoPoolConfigured(format!(
                "no links match pin request for {}",
                self.attributes.store_unit_name()
            )));
        }
        if self.online_locations().is_empty() {
            return Err(CacheError::FileNotInCache(self.attributes.pnfs_id.clone()));
        }

        let locations: HashSet<&String> = self.attributes.locations.iter().collect();
        for level in &levels {
            let candidates: Vec<PoolInfo> = level
                .pools
                .iter()
                .filter(|name| locations.contains(name))
                .filter_map(|name| self.pool_info(name))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let best = candidates
                .into_iter()
                .min_by_key(|info| {
                    let mut hasher = DefaultHasher::new();
                    self.attributes.pnfs_id.as_str().hash(&mut hasher);
                    info.name.hash(&mut hasher);
                    hasher.finish()
                })
                .expect("non-empty candidate list");
            return Ok(best.into());
        }
        Err(CacheError::PermissionDenied(format!(
            "file {} has no replica in a read-allowed pool",
            self.attributes.pnfs_id
        )))
    }
}
