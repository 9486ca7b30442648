//! The selection unit: the policy graph of units, unit groups, pools, pool
//! groups, links and link groups, and the matcher that turns a request into
//! ranked preference levels of candidate pools.
//!
//! The graph is read-heavy: matches run concurrently under a shared read
//! lock while administrative mutation takes the write lock exclusively.

pub mod commands;
pub mod entities;
pub mod graph;
pub mod matcher;
pub mod net;

pub use commands::CommandProcessor;
pub use entities::{Link, LinkGroup, PGroup, Pool, Unit, UnitGroup, UnitType};
pub use graph::{PoolSelectionUnit, UpdateOutcome};
pub use matcher::{MatchInput, PoolPreferenceLevel};
pub use net::NetMatcher;
