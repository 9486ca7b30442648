//! Partition strategies: the pluggable cost-based algorithms that pick one
//! pool (or a source/destination pair) from a candidate list.
//!
//! A partition failure carries the fallback flag through
//! [`CacheError::should_fallback`]: `true` lets the pool monitor try the
//! next preference level, `false` aborts the selection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use spool_core::CacheError;

/// A match candidate joined with its live cost data.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolInfo {
    pub name: String,
    pub address: String,
    pub performance_cost: f64,
    pub space_cost: f64,
    pub total_space: u64,
    pub free_space: u64,
}

impl PoolInfo {
    /// Weighted cost used for ranking.
    fn weighted(&self, config: &PartitionConfig) -> f64 {
        config.performance_cost_factor * self.performance_cost
            + config.space_cost_factor * self.space_cost
    }
}

/// A cost-aware selection strategy.
///
/// Implementations must be stateless or internally synchronized; one
/// instance serves concurrent requests.
pub trait Partition: Send + Sync {
    fn name(&self) -> &str;

    fn select_read_pool(&self, candidates: &[PoolInfo]) -> Result<PoolInfo, CacheError>;

    fn select_write_pool(
        &self,
        candidates: &[PoolInfo],
        preallocated: u64,
    ) -> Result<PoolInfo, CacheError>;

    /// Rank a source/destination pair for a pool-to-pool copy. `force`
    /// disables the cost cuts.
    fn select_p2p_pair(
        &self,
        sources: &[PoolInfo],
        destinations: &[PoolInfo],
        force: bool,
    ) -> Result<(PoolInfo, PoolInfo), CacheError>;

    fn select_stage_pool(
        &self,
        candidates: &[PoolInfo],
        previous: Option<&str>,
    ) -> Result<PoolInfo, CacheError>;
}

/// Tunables of the classic partition. A cut of zero means "no cut".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub performance_cost_factor: f64,
    pub space_cost_factor: f64,
    pub max_read_cost: f64,
    pub max_write_cost: f64,
    pub max_p2p_cost: f64,
    pub max_stage_cost: f64,
    /// Whether a cost-cut failure permits falling back to the next
    /// preference level.
    pub fallback_on_cost: bool,
    /// Spread factor >= 1: pick randomly among candidates whose weighted
    /// cost is within `spread * minimum`. Exactly 1 always takes the
    /// cheapest.
    pub spread: f64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            performance_cost_factor: 1.0,
            space_cost_factor: 1.0,
            max_read_cost: 0.0,
            max_write_cost: 0.0,
            max_p2p_cost: 0.0,
            max_stage_cost: 0.0,
            fallback_on_cost: true,
            spread: 1.0,
        }
    }
}

/// Weighted lowest-cost selection with optional random spread among the
/// cheapest candidates.
#[derive(Debug, Clone, Default)]
pub struct ClassicPartition {
    pub config: PartitionConfig,
}

impl ClassicPartition {
    pub fn new(config: PartitionConfig) -> Self {
        Self { config }
    }

    fn cheapest(&self, candidates: &[PoolInfo]) -> Option<PoolInfo> {
        let min = candidates
            .iter()
            .map(|p| p.weighted(&self.config))
            .fold(f64::INFINITY, f64::min);
        if min.is_infinite() {
            return None;
        }
        if self.config.spread <= 1.0 {
            return candidates
                .iter()
                .min_by(|a, b| a.weighted(&self.config).total_cmp(&b.weighted(&self.config)))
                .cloned();
        }
        let ceiling = if min <= 0.0 {
            // non-positive minimum: the spread window degenerates to ties
            min
        } else {
            min * self.config.spread
        };
        let low: Vec<&PoolInfo> = candidates
            .iter()
            .filter(|p| p.weighted(&self.config) <= ceiling)
            .collect();
        low.choose(&mut rand::rng()).map(|p| (*p).clone())
    }

    fn check_cut(&self, pool: &PoolInfo, cut: f64, what: &str) -> Result<(), CacheError> {
        if cut > 0.0 && pool.weighted(&self.config) > cut {
            return Err(CacheError::CostExceeded {
                message: format!(
                    "{what} cost {:.3} of pool {} exceeds cut {cut}",
                    pool.weighted(&self.config),
                    pool.name
                ),
                fallback: self.config.fallback_on_cost,
            });
        }
        Ok(())
    }
}

impl Partition for ClassicPartition {
    fn name(&self) -> &str {
        "classic"
    }

    fn select_read_pool(&self, candidates: &[PoolInfo]) -> Result<PoolInfo, CacheError> {
        let best = self
            .cheapest(candidates)
            .ok_or_else(|| CacheError::NoPoolOnline("no read candidate".into()))?;
        self.check_cut(&best, self.config.max_read_cost, "read")?;
        Ok(best)
    }

    fn select_write_pool(
        &self,
        candidates: &[PoolInfo],
        preallocated: u64,
    ) -> Result<PoolInfo, CacheError> {
        let fitting: Vec<PoolInfo> = candidates
            .iter()
            .filter(|p| p.free_space >= preallocated)
            .cloned()
            .collect();
        if fitting.is_empty() && !candidates.is_empty() {
            return Err(CacheError::CostExceeded {
                message: format!("no candidate has {preallocated} bytes free"),
                fallback: self.config.fallback_on_cost,
            });
        }
        let best = self
            .cheapest(&fitting)
            .ok_or_else(|| CacheError::NoPoolOnline("no write candidate".into()))?;
        self.check_cut(&best, self.config.max_write_cost, "write")?;
        Ok(best)
    }

    fn select_p2p_pair(
        &self,
        sources: &[PoolInfo],
        destinations: &[PoolInfo],
        force: bool,
    ) -> Result<(PoolInfo, PoolInfo), CacheError> {
        // source side ranks by performance only; space does not matter for
        // reading a replica
        let source = sources
            .iter()
            .min_by(|a, b| a.performance_cost.total_cmp(&b.performance_cost))
            .cloned()
            .ok_or_else(|| CacheError::NoPoolOnline("no p2p source".into()))?;
        if !force && self.config.max_p2p_cost > 0.0 && source.performance_cost > self.config.max_p2p_cost
        {
            return Err(CacheError::SourceCostExceeded {
                message: format!(
                    "source cost {:.3} of pool {} exceeds cut {}",
                    source.performance_cost, source.name, self.config.max_p2p_cost
                ),
                fallback: self.config.fallback_on_cost,
            });
        }

        let destination = self
            .cheapest(destinations)
            .ok_or_else(|| CacheError::NoPoolOnline("no p2p destination".into()))?;
        if !force {
            if let Err(CacheError::CostExceeded { message, fallback }) =
                self.check_cut(&destination, self.config.max_p2p_cost, "p2p destination")
            {
                return Err(CacheError::DestinationCostExceeded { message, fallback });
            }
        }
        Ok((source, destination))
    }

    fn select_stage_pool(
        &self,
        candidates: &[PoolInfo],
        previous: Option<&str>,
    ) -> Result<PoolInfo, CacheError> {
        // avoid repeating the previous staging pool when an alternative
        // exists
        let filtered: Vec<PoolInfo> = match previous {
            Some(prev) if candidates.iter().any(|p| p.name != prev) => {
                candidates.iter().filter(|p| p.name != prev).cloned().collect()
            }
            _ => candidates.to_vec(),
        };
        let best = self
            .cheapest(&filtered)
            .ok_or_else(|| CacheError::NoPoolOnline("no stage candidate".into()))?;
        self.check_cut(&best, self.config.max_stage_cost, "stage")?;
        Ok(best)
    }
}

/// Uniform random selection among the candidates, ignoring cost.
#[derive(Debug, Clone, Default)]
pub struct RandomPartition;

impl RandomPartition {
    fn pick(&self, candidates: &[PoolInfo], what: &str) -> Result<PoolInfo, CacheError> {
        candidates
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| CacheError::NoPoolOnline(format!("no {what} candidate")))
    }
}

impl Partition for RandomPartition {
    fn name(&self) -> &str {
        "random"
    }

    fn select_read_pool(&self, candidates: &[PoolInfo]) -> Result<PoolInfo, CacheError> {
        self.pick(candidates, "read")
    }

    fn select_write_pool(
        &self,
        candidates: &[PoolInfo],
        preallocated: u64,
    ) -> Result<PoolInfo, CacheError> {
        let fitting: Vec<PoolInfo> = candidates
            .iter()
            .filter(|p| p.free_space >= preallocated)
            .cloned()
            .collect();
        self.pick(&fitting, "write")
    }

    fn select_p2p_pair(
        &self,
        sources: &[PoolInfo],
        destinations: &[PoolInfo],
        _force: bool,
    ) -> Result<(PoolInfo, PoolInfo), CacheError> {
        Ok((
            self.pick(sources, "p2p source")?,
            self.pick(destinations, "p2p destination")?,
        ))
    }

    fn select_stage_pool(
        &self,
        candidates: &[PoolInfo],
        previous: Option<&str>,
    ) -> Result<PoolInfo, CacheError> {
        let filtered: Vec<PoolInfo> = match previous {
            Some(prev) if candidates.iter().any(|p| p.name != prev) => {
                candidates.iter().filter(|p| p.name != prev).cloned().collect()
            }
            _ => candidates.to_vec(),
        };
        self.pick(&filtered, "stage")
    }
}

/// Partitions keyed by the preference level's tag, with a `"default"` entry
/// every lookup can fall back to.
pub struct PartitionRegistry {
    partitions: RwLock<HashMap<String, Arc<dyn Partition>>>,
}

pub const DEFAULT_PARTITION: &str = "default";

impl Default for PartitionRegistry {
    fn default() -> Self {
        let mut map: HashMap<String, Arc<dyn Partition>> = HashMap::new();
        map.insert(
            DEFAULT_PARTITION.to_string(),
            Arc::new(ClassicPartition::default()),
        );
        Self {
            partitions: RwLock::new(map),
        }
    }
}

impl PartitionRegistry {
    pub fn insert(&self, tag: impl Into<String>, partition: Arc<dyn Partition>) {
        self.partitions.write().insert(tag.into(), partition);
    }

    /// Resolve a preference level's tag, falling back to the default
    /// partition for unknown or absent tags.
    pub fn get(&self, tag: Option<&str>) -> Arc<dyn Partition> {
        let map = self.partitions.read();
        tag.and_then(|t| map.get(t))
            .or_else(|| map.get(DEFAULT_PARTITION))
            .cloned()
            .expect("default partition always registered")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, perf: f64, space: f64, free: u64) -> PoolInfo {
        PoolInfo {
            name: name.to_string(),
            address: format!("{name}@node:1094"),
            performance_cost: perf,
            space_cost: space,
            total_space: 1 << 40,
            free_space: free,
        }
    }

    #[test]
    fn test_classic_picks_lowest_weighted_cost() {
        let p = ClassicPartition::default();
        let candidates = [
            pool("a", 0.9, 0.1, 1 << 30),
            pool("b", 0.2, 0.1, 1 << 30),
            pool("c", 0.5, 0.9, 1 << 30),
        ];
        assert_eq!(p.select_read_pool(&candidates).unwrap().name, "b");
    }

    #[test]
    fn test_classic_cost_cut_carries_fallback_flag() {
        let p = ClassicPartition::new(PartitionConfig {
            max_read_cost: 0.5,
            fallback_on_cost: true,
            ..Default::default()
        });
        let err = p.select_read_pool(&[pool("a", 0.9, 0.3, 1)]).unwrap_err();
        assert!(matches!(err, CacheError::CostExceeded { .. }));
        assert!(err.should_fallback());

        let strict = ClassicPartition::new(PartitionConfig {
            max_read_cost: 0.5,
            fallback_on_cost: false,
            ..Default::default()
        });
        let err = strict.select_read_pool(&[pool("a", 0.9, 0.3, 1)]).unwrap_err();
        assert!(!err.should_fallback());
    }

    #[test]
    fn test_write_requires_free_space() {
        let p = ClassicPartition::default();
        let candidates = [pool("a", 0.1, 0.1, 100), pool("b", 0.9, 0.1, 10_000)];
        let best = p.select_write_pool(&candidates, 5_000).unwrap();
        assert_eq!(best.name, "b");

        let err = p.select_write_pool(&candidates, 50_000).unwrap_err();
        assert!(matches!(err, CacheError::CostExceeded { .. }));
    }

    #[test]
    fn test_p2p_pair_and_force() {
        let p = ClassicPartition::new(PartitionConfig {
            max_p2p_cost: 0.5,
            ..Default::default()
        });
        let sources = [pool("src-hot", 0.9, 0.0, 1)];
        let destinations = [pool("dst", 0.1, 0.1, 1 << 30)];

        let err = p.select_p2p_pair(&sources, &destinations, false).unwrap_err();
        assert!(matches!(err, CacheError::SourceCostExceeded { .. }));

        let (src, dst) = p.select_p2p_pair(&sources, &destinations, true).unwrap();
        assert_eq!((src.name.as_str(), dst.name.as_str()), ("src-hot", "dst"));
    }

    #[test]
    fn test_stage_avoids_previous_pool() {
        let p = ClassicPartition::default();
        let candidates = [pool("a", 0.1, 0.1, 1), pool("b", 0.5, 0.1, 1)];
        assert_eq!(p.select_stage_pool(&candidates, None).unwrap().name, "a");
        assert_eq!(p.select_stage_pool(&candidates, Some("a")).unwrap().name, "b");
        // previous is the only candidate: repeat it rather than fail
        assert_eq!(
            p.select_stage_pool(&candidates[..1], Some("a")).unwrap().name,
            "a"
        );
    }

    #[test]
    fn test_spread_picks_among_cheap_candidates() {
        let p = ClassicPartition::new(PartitionConfig {
            spread: 2.0,
            space_cost_factor: 0.0,
            ..Default::default()
        });
        let candidates = [
            pool("a", 0.10, 0.0, 1),
            pool("b", 0.15, 0.0, 1),
            pool("c", 0.90, 0.0, 1),
        ];
        for _ in 0..50 {
            let best = p.select_read_pool(&candidates).unwrap();
            assert_ne!(best.name, "c", "expensive pool must never win");
        }
    }

    #[test]
    fn test_random_partition_empty_candidates() {
        let p = RandomPartition;
        assert!(matches!(
            p.select_read_pool(&[]),
            Err(CacheError::NoPoolOnline(_))
        ));
    }

    #[test]
    fn test_registry_tag_fallback() {
        let registry = PartitionRegistry::default();
        registry.insert("random", Arc::new(RandomPartition));

        assert_eq!(registry.get(Some("random")).name(), "random");
        assert_eq!(registry.get(Some("unknown-tag")).name(), "classic");
        assert_eq!(registry.get(None).name(), "classic");
    }
}
