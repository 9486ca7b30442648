//! Entities of the policy graph.
//!
//! Relations are stored as name-keyed adjacency sets on both sides rather
//! than object references, so removal and referential-integrity checks are
//! plain set edits under the graph lock.

mod group;
mod link;
mod pool;
mod unit;

pub use group::{LinkGroup, PGroup, PGroupKind, UnitGroup};
pub use link::{Link, LinkPreferences};
pub use pool::Pool;
pub use unit::{Unit, UnitType};
