//! Time-windowed cache of per-pool cost snapshots.
//!
//! Entries expire five minutes after receipt; a query against an expired or
//! absent entry answers "unknown", which excludes the pool from candidate
//! sets. The percentile query keeps its last result and only re-sorts when a
//! pool's cost crosses the cached cut value or the pool set changes size.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use spool_core::CacheError;
use spool_core::config::CostConfig;
use spool_core::protocols::{PoolCostInfo, PoolHeartbeat};

#[derive(Debug, Clone)]
struct CostEntry {
    info: PoolCostInfo,
    received: Instant,
    /// Administrative override of the performance cost, `cm set cost`.
    cost_override: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct PercentileCache {
    fraction: f64,
    value: f64,
    pool_count: usize,
}

#[derive(Default)]
struct CostState {
    entries: HashMap<String, CostEntry>,
    percentile: Option<PercentileCache>,
    /// How often the percentile was recomputed from a fresh sort.
    recomputes: u64,
}

/// The cost table. All operations are cheap point queries under one lock;
/// the percentile computation is amortized by its cache.
pub struct CostModule {
    state: Mutex<CostState>,
    entry_timeout: Duration,
}

impl Default for CostModule {
    fn default() -> Self {
        Self::new(&CostConfig::default())
    }
}

impl CostModule {
    pub fn new(config: &CostConfig) -> Self {
        Self {
            state: Mutex::new(CostState::default()),
            entry_timeout: Duration::from_secs(config.entry_timeout_secs),
        }
    }

    /// Heartbeat intake. Disabled and dead pools lose their entry, anything
    /// else is upserted.
    pub fn message_arrived(&self, hb: &PoolHeartbeat) {
        let mut state = self.state.lock();
        if hb.mode.is_disabled() {
            if state.entries.remove(&hb.pool).is_some() {
                tracing::debug!("cost entry for {} dropped (pool disabled)", hb.pool);
                state.percentile = None;
            }
            return;
        }

        let old_cost = state
            .entries
            .get(&hb.pool)
            .map(|e| e.cost_override.unwrap_or(e.info.performance_cost));
        let new_cost = hb.cost.performance_cost;

        let cost_override = state.entries.get(&hb.pool).and_then(|e| e.cost_override);
        state.entries.insert(
            hb.pool.clone(),
            CostEntry {
                info: hb.cost,
                received: Instant::now(),
                cost_override,
            },
        );

        if let Some(cache) = state.percentile {
            let invalid = match old_cost {
                // set grew
                None => true,
                // cut crossed in either direction
                Some(old) => (old - cache.value).signum() != (new_cost - cache.value).signum(),
            };
            if invalid {
                state.percentile = None;
            }
        }
    }

    fn live<'a>(
        &self,
        state: &'a CostState,
    ) -> impl Iterator<Item = (&'a String, &'a CostEntry)> + 'a {
        let timeout = self.entry_timeout;
        state
            .entries
            .iter()
            .filter(move |(_, e)| e.received.elapsed() < timeout)
    }

    /// The pool's last reported snapshot, or `None` when unknown or expired.
    pub fn get_pool_cost_info(&self, name: &str) -> Option<PoolCostInfo> {
        let state = self.state.lock();
        state
            .entries
            .get(name)
            .filter(|e| e.received.elapsed() < self.entry_timeout)
            .map(|e| e.info)
    }

    /// Effective performance cost with any administrative override applied.
    pub fn get_performance_cost(&self, name: &str) -> Option<f64> {
        let state = self.state.lock();
        state
            .entries
            .get(name)
            .filter(|e| e.received.elapsed() < self.entry_timeout)
            .map(|e| e.cost_override.unwrap_or(e.info.performance_cost))
    }

    /// Pools with a live cost entry, i.e. currently online as far as the
    /// cost table is concerned.
    pub fn known_pools(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = self.live(&state).map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }

    /// The performance cost at the given percentile over all known pools,
    /// `sorted[floor(fraction * count)]`. Zero when no pool is known.
    pub fn get_pools_percentile_performance_cost(&self, fraction: f64) -> Result<f64, CacheError> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(CacheError::InvalidArgument(format!(
                "percentile fraction must be in (0,1), got {fraction}"
            )));
        }
        let mut state = self.state.lock();

        let count = self.live(&state).count();
        if count == 0 {
            return Ok(0.0);
        }
        if let Some(cache) = state.percentile {
            if cache.fraction == fraction && cache.pool_count == count {
                return Ok(cache.value);
            }
        }

        let mut costs: Vec<f64> = self
            .live(&state)
            .map(|(_, e)| e.cost_override.unwrap_or(e.info.performance_cost))
            .collect();
        costs.sort_by(|a, b| a.total_cmp(b));
        let value = costs[(fraction * count as f64).floor() as usize];

        state.percentile = Some(PercentileCache {
            fraction,
            value,
            pool_count: count,
        });
        state.recomputes += 1;
        tracing::debug!("percentile cost recomputed: p{fraction} = {value} over {count} pools");
        Ok(value)
    }

    /// Set or clear the administrative cost override for a pool.
    pub fn set_cost_override(&self, name: &str, value: Option<f64>) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(name) else {
            return Err(CacheError::InvalidArgument(format!(
                "pool '{name}' has no cost entry"
            )));
        };
        entry.cost_override = value;
        state.percentile = None;
        Ok(())
    }

    /// Number of fresh sorts the percentile query has done. Exposed for the
    /// `cm info` admin view and for instrumented tests.
    pub fn percentile_recompute_count(&self) -> u64 {
        self.state.lock().recomputes
    }
}

/// The `cm …` administrative commands.
pub struct CostCommandProcessor {
    cost: Arc<CostModule>,
}

impl CostCommandProcessor {
    pub fn new(cost: Arc<CostModule>) -> Self {
        Self { cost }
    }

    pub fn execute(&self, line: &str) -> Result<String, CacheError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["cm", "ls"] => {
                let mut out = String::new();
                for pool in self.cost.known_pools() {
                    let info = self.cost.get_pool_cost_info(&pool);
                    let cost = self.cost.get_performance_cost(&pool);
                    if let (Some(info), Some(cost)) = (info, cost) {
                        writeln!(
                            out,
                            "{pool} perf={cost} space={} free={} total={}",
                            info.space_cost, info.free_space, info.total_space
                        )
                        .ok();
                    }
                }
                Ok(out)
            }
            ["cm", "info"] => Ok(format!(
                "pools={} percentile-recomputes={}",
                self.cost.known_pools().len(),
                self.cost.percentile_recompute_count()
            )),
            ["cm", "set", "cost", pool, "off"] => {
                self.cost.set_cost_override(pool, None)?;
                Ok(format!("cost override for '{pool}' cleared"))
            }
            ["cm", "set", "cost", pool, value] => {
                let value: f64 = value.parse().map_err(|_| {
                    CacheError::InvalidArgument(format!("bad cost value '{value}'"))
                })?;
                self.cost.set_cost_override(pool, Some(value))?;
                Ok(format!("cost override for '{pool}' set to {value}"))
            }
            _ => Err(CacheError::InvalidArgument(format!(
                "unknown command '{line}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use spool_core::protocols::PoolMode;

    use super::*;

    fn heartbeat(pool: &str, performance_cost: f64, mode: PoolMode) -> PoolHeartbeat {
        PoolHeartbeat {
            pool: pool.to_string(),
            address: format!("{pool}@node:1094"),
            hostname: None,
            serial: 1,
            mode,
            cost: PoolCostInfo::new(performance_cost, 0.5, 1 << 30, 1 << 29),
            hsm_instances: vec![],
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_unknown_pool_answers_none() {
        let cm = CostModule::default();
        assert!(cm.get_pool_cost_info("nope").is_none());
        assert!(cm.get_performance_cost("nope").is_none());
    }

    #[test]
    fn test_disabled_heartbeat_removes_entry() {
        let cm = CostModule::default();
        cm.message_arrived(&heartbeat("p1", 0.3, PoolMode::enabled()));
        assert!(cm.get_pool_cost_info("p1").is_some());

        cm.message_arrived(&heartbeat("p1", 0.3, PoolMode::new(PoolMode::DISABLED)));
        assert!(cm.get_pool_cost_info("p1").is_none());
        assert!(cm.known_pools().is_empty());
    }

    #[test]
    fn test_expired_entry_answers_none() {
        let cm = CostModule::new(&CostConfig {
            entry_timeout_secs: 0,
        });
        cm.message_arrived(&heartbeat("p1", 0.3, PoolMode::enabled()));
        assert!(cm.get_pool_cost_info("p1").is_none());
    }

    #[test]
    fn test_percentile_fraction_bounds() {
        let cm = CostModule::default();
        assert!(cm.get_pools_percentile_performance_cost(0.0).is_err());
        assert!(cm.get_pools_percentile_performance_cost(1.0).is_err());
        assert!(cm.get_pools_percentile_performance_cost(-0.5).is_err());
        assert_eq!(cm.get_pools_percentile_performance_cost(0.5).unwrap(), 0.0);
    }

    #[test]
    fn test_percentile_value() {
        let cm = CostModule::default();
        for (i, cost) in [0.1, 0.2, 0.3, 0.4, 0.5].iter().enumerate() {
            cm.message_arrived(&heartbeat(&format!("p{i}"), *cost, PoolMode::enabled()));
        }
        // floor(0.5 * 5) = index 2
        assert_eq!(cm.get_pools_percentile_performance_cost(0.5).unwrap(), 0.3);
        // floor(0.9 * 5) = index 4
        assert_eq!(cm.get_pools_percentile_performance_cost(0.9).unwrap(), 0.5);
    }

    #[test]
    fn test_percentile_cache_invalidation_on_cut_crossing() {
        let cm = CostModule::default();
        for (i, cost) in [0.1, 0.2, 0.3, 0.4, 0.5].iter().enumerate() {
            cm.message_arrived(&heartbeat(&format!("p{i}"), *cost, PoolMode::enabled()));
        }
        assert_eq!(cm.get_pools_percentile_performance_cost(0.5).unwrap(), 0.3);
        let baseline = cm.percentile_recompute_count();

        // p0 moves but stays below the cached cut: served from cache
        cm.message_arrived(&heartbeat("p0", 0.15, PoolMode::enabled()));
        assert_eq!(cm.get_pools_percentile_performance_cost(0.5).unwrap(), 0.3);
        assert_eq!(cm.percentile_recompute_count(), baseline);

        // p0 crosses the cut: next query re-sorts
        cm.message_arrived(&heartbeat("p0", 0.45, PoolMode::enabled()));
        let fresh = cm.get_pools_percentile_performance_cost(0.5).unwrap();
        assert_eq!(cm.percentile_recompute_count(), baseline + 1);
        // sorted costs are now [0.2, 0.3, 0.4, 0.45, 0.5]
        assert_eq!(fresh, 0.4);
    }

    #[test]
    fn test_percentile_cache_invalidation_on_set_size_change() {
        let cm = CostModule::default();
        cm.message_arrived(&heartbeat("p0", 0.1, PoolMode::enabled()));
        cm.message_arrived(&heartbeat("p1", 0.9, PoolMode::enabled()));
        assert_eq!(cm.get_pools_percentile_performance_cost(0.5).unwrap(), 0.9);
        let baseline = cm.percentile_recompute_count();

        cm.message_arrived(&heartbeat("p2", 0.2, PoolMode::enabled()));
        assert_eq!(cm.get_pools_percentile_performance_cost(0.5).unwrap(), 0.2);
        assert_eq!(cm.percentile_recompute_count(), baseline + 1);
    }

    #[test]
    fn test_cost_override() {
        let cm = CostModule::default();
        cm.message_arrived(&heartbeat("p1", 0.3, PoolMode::enabled()));
        cm.set_cost_override("p1", Some(9.9)).unwrap();
        assert_eq!(cm.get_performance_cost("p1"), Some(9.9));
        // the raw snapshot is untouched
        assert_eq!(cm.get_pool_cost_info("p1").unwrap().performance_cost, 0.3);

        cm.set_cost_override("p1", None).unwrap();
        assert_eq!(cm.get_performance_cost("p1"), Some(0.3));

        assert!(cm.set_cost_override("ghost", Some(1.0)).is_err());
    }

    #[test]
    fn test_cm_commands() {
        let cm = Arc::new(CostModule::default());
        cm.message_arrived(&heartbeat("p1", 0.3, PoolMode::enabled()));
        let cp = CostCommandProcessor::new(cm);

        assert!(cp.execute("cm ls").unwrap().contains("p1"));
        assert!(cp.execute("cm set cost p1 2.5").is_ok());
        assert!(cp.execute("cm set cost p1 off").is_ok());
        assert!(cp.execute("cm set cost p1 nonsense").is_err());
        assert!(cp.execute("cm bogus").is_err());
    }
}
