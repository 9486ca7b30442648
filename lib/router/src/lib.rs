//! Cost-aware pool routing: the time-windowed cost table fed by pool
//! heartbeats, the pluggable partition strategies that rank candidates, and
//! the pool monitor that combines policy matches with live cost data to pick
//! one pool per workflow step.

pub mod cost;
pub mod monitor;
pub mod partition;

pub use cost::{CostCommandProcessor, CostModule};
pub use monitor::{PoolMonitor, PoolSelector, SelectedPool};
pub use partition::{ClassicPartition, Partition, PartitionConfig, PartitionRegistry, PoolInfo, RandomPartition};
