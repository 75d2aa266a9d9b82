use std::collections::{
    BTreeSet,
    HashMap,
};

/// The scope name that stands for "all namespaces".
pub const ALL_NAMESPACES: &str = "";

/// Which namespaces the controller is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    All,
    Namespaces(BTreeSet<String>),
}

impl NamespaceScope {
    /// An empty list, or any empty entry, selects all namespaces.
    pub fn from_namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for ns in namespaces {
            let ns = ns.as_ref().trim();
            if ns == ALL_NAMESPACES {
                return NamespaceScope::All;
            }
            set.insert(ns.to_string());
        }
        if set.is_empty() {
            NamespaceScope::All
        } else {
            NamespaceScope::Namespaces(set)
        }
    }

    /// The scope names to register a watch group for.
    pub fn scope_names(&self) -> Vec<String> {
        match self {
            NamespaceScope::All => vec![ALL_NAMESPACES.to_string()],
            NamespaceScope::Namespaces(set) => set.iter().cloned().collect(),
        }
    }
}

/// Maps namespaces to the group of watches responsible for them.
///
/// A group registered for [`ALL_NAMESPACES`] takes precedence over every other registration.
#[derive(Debug)]
pub struct ScopeResolver<G> {
    groups: HashMap<String, G>,
}

impl<G> Default for ScopeResolver<G> {
    fn default() -> Self {
        Self { groups: HashMap::new() }
    }
}

impl<G> ScopeResolver<G> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scope: impl Into<String>, group: G) {
        self.groups.insert(scope.into(), group);
    }

    /// Returns `None` when the controller does not watch `namespace`.
    pub fn resolve(&self, namespace: &str) -> Option<&G> {
        self.groups
            .get(ALL_NAMESPACES)
            .or_else(|| self.groups.get(namespace))
    }

    pub fn groups(&self) -> impl Iterator<Item = &G> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
