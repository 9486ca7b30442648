use std::collections::{BTreeMap, BTreeSet};

/// A named set of units, referenced by links.
#[derive(Debug, Clone, Default)]
pub struct UnitGroup {
    name: String,
    pub units: BTreeSet<String>,
    /// Links requiring this group.
    pub links: BTreeSet<String>,
}

impl UnitGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How a pool group's membership is maintained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PGroupKind {
    Static,
    /// Membership recomputed from the pool tag map whenever a pool's
    /// generation changes: the pool joins iff every listed key maps to the
    /// listed value.
    Dynamic { predicate: BTreeMap<String, String> },
}

/// A named set of pools, possibly nesting other pool groups.
#[derive(Debug, Clone)]
pub struct PGroup {
    name: String,
    pub kind: PGroupKind,
    /// Historically "resilient".
    pub primary: bool,
    pub pools: BTreeSet<String>,
    /// Nested sub-groups.
    pub subgroups: BTreeSet<String>,
    /// Links targeting this group.
    pub links: BTreeSet<String>,
}

impl PGroup {
    pub fn new(name: impl Into<String>, kind: PGroupKind, primary: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            primary,
            pools: BTreeSet::new(),
            subgroups: BTreeSet::new(),
            links: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, PGroupKind::Dynamic { .. })
    }

    /// Whether a pool's tag map satisfies a dynamic group's predicate.
    /// Static groups never match automatically.
    pub fn matches_tags(&self, tags: &BTreeMap<String, String>) -> bool {
        match &self.kind {
            PGroupKind::Static => false,
            PGroupKind::Dynamic { predicate } => predicate
                .iter()
                .all(|(k, v)| tags.get(k).is_some_and(|t| t == v)),
        }
    }
}

/// An optional grouping of links carrying space-accounting capability flags
/// and a free-form attribute map, both consumed downstream.
#[derive(Debug, Clone, Default)]
pub struct LinkGroup {
    name: String,
    pub links: BTreeSet<String>,
    pub custodial_allowed: bool,
    pub output_allowed: bool,
    pub replica_allowed: bool,
    pub online_allowed: bool,
    pub nearline_allowed: bool,
    pub attributes: BTreeMap<String, BTreeSet<String>>,
}

impl LinkGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes
            .entry(key.into())
            .or_default()
            .insert(value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_predicate() {
        let mut predicate = BTreeMap::new();
        predicate.insert("rack".to_string(), "r1".to_string());
        predicate.insert("tier".to_string(), "ssd".to_string());
        let g = PGroup::new("fast", PGroupKind::Dynamic { predicate }, false);

        let mut tags = BTreeMap::new();
        tags.insert("rack".to_string(), "r1".to_string());
        assert!(!g.matches_tags(&tags), "partial tag match must not qualify");

        tags.insert("tier".to_string(), "ssd".to_string());
        assert!(g.matches_tags(&tags));

        tags.insert("extra".to_string(), "ignored".to_string());
        assert!(g.matches_tags(&tags));
    }

    #[test]
    fn test_static_group_never_auto_matches() {
        let g = PGroup::new("plain", PGroupKind::Static, false);
        assert!(!g.matches_tags(&BTreeMap::new()));
    }

    #[test]
    fn test_link_group_multi_valued_attributes() {
        let mut lg = LinkGroup::new("lg");
        lg.set_attribute("vo", "atlas");
        lg.set_attribute("vo", "cms");
        assert_eq!(lg.attributes.get("vo").unwrap().len(), 2);
    }
}
