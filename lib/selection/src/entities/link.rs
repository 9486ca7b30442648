use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use spool_core::protocols::Direction;

/// Per-direction preference numbers of a link. Zero disables the link for
/// that direction; a negative p2p preference inherits the read preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreferences {
    pub read: i32,
    pub write: i32,
    pub cache: i32,
    pub p2p: i32,
}

impl Default for LinkPreferences {
    fn default() -> Self {
        Self {
            read: 0,
            write: 0,
            cache: 0,
            p2p: -1,
        }
    }
}

impl LinkPreferences {
    pub fn for_direction(&self, direction: Direction) -> i32 {
        match direction {
            Direction::Read => self.read,
            Direction::Write => self.write,
            Direction::Cache => self.cache,
            Direction::P2p => {
                if self.p2p < 0 {
                    self.read
                } else {
                    self.p2p
                }
            }
        }
    }
}

/// A routing rule binding required unit groups to target pools and pool
/// groups. The unit-group set is fixed at creation; targets and preferences
/// change through explicit relation commands.
#[derive(Debug, Clone)]
pub struct Link {
    name: String,
    /// Unit groups that must all be hit for this link to qualify.
    ugroups: BTreeSet<String>,
    /// Directly targeted pools.
    pub pools: BTreeSet<String>,
    /// Targeted pool groups.
    pub pgroups: BTreeSet<String>,
    pub prefs: LinkPreferences,
    /// Partition tag handed to the pool monitor with each preference level.
    pub section: Option<String>,
    /// Owning link group, at most one.
    pub link_group: Option<String>,
}

impl Link {
    pub fn new(name: impl Into<String>, ugroups: BTreeSet<String>) -> Self {
        Self {
            name: name.into(),
            ugroups,
            pools: BTreeSet::new(),
            pgroups: BTreeSet::new(),
            prefs: LinkPreferences::default(),
            section: None,
            link_group: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ugroups(&self) -> &BTreeSet<String> {
        &self.ugroups
    }

    pub fn preference(&self, direction: Direction) -> i32 {
        self.prefs.for_direction(direction)
    }
}
