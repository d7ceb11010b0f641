//! Policy profiles keyed by version label.

use crate::Error;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// The ordered flags a node of some version is started with.
///
/// Flags are opaque to the harness: they are handed to the node verbatim and never
/// interpreted here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterSet {
    label: String,
    flags: Vec<String>,
}

impl ParameterSet {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }
}

/// Registered [ParameterSet]s, remembering registration order.
///
/// Entries are immutable once registered and shared (via [Arc]) with every node
/// provisioned from them.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    order: Vec<Arc<ParameterSet>>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `flags` under `label`.
    pub fn register<I, S>(&mut self, label: &str, flags: I) -> Result<Arc<ParameterSet>, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.index.contains_key(label) {
            return Err(Error::DuplicateVersion(label.to_string()));
        }
        let set = Arc::new(ParameterSet {
            label: label.to_string(),
            flags: flags.into_iter().map(Into::into).collect(),
        });
        debug!(label, flags = ?set.flags, "registered version");
        self.index.insert(label.to_string(), self.order.len());
        self.order.push(set.clone());
        Ok(set)
    }

    /// Return the [ParameterSet] registered under `label`.
    pub fn resolve(&self, label: &str) -> Result<Arc<ParameterSet>, Error> {
        self.index
            .get(label)
            .map(|index| self.order[*index].clone())
            .ok_or_else(|| Error::UnknownVersion(label.to_string()))
    }

    /// Iterate over version labels in registration order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|set| set.label())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = Registry::new();
        registry
            .register("01140300", ["-minrelaytxfee=1", "-debug"])
            .unwrap();
        registry.register("01140400", ["-debug"]).unwrap();
        registry.register("01140500", Vec::<String>::new()).unwrap();

        let set = registry.resolve("01140300").unwrap();
        assert_eq!(set.label(), "01140300");
        assert_eq!(set.flags(), ["-minrelaytxfee=1", "-debug"]);
        assert!(registry.resolve("01140500").unwrap().flags().is_empty());
        assert_eq!(
            registry.labels().collect::<Vec<_>>(),
            ["01140300", "01140400", "01140500"]
        );
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_version() {
        let mut registry = Registry::new();
        registry.register("a", ["-x"]).unwrap();
        assert!(matches!(
            registry.register("a", ["-y"]),
            Err(Error::DuplicateVersion(label)) if label == "a"
        ));

        // The first entry is untouched
        assert_eq!(registry.resolve("a").unwrap().flags(), ["-x"]);
    }

    #[test]
    fn test_unknown_version() {
        let registry = Registry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("missing"),
            Err(Error::UnknownVersion(label)) if label == "missing"
        ));
    }
}
