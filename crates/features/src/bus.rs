//! Feature bus: how features find each other.
//!
//! Replaces pairwise setter injection. Every feature gets the bus at
//! construction and looks collaborators up by name, receiving a typed
//! option; a missing collaborator is handled at the call site.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::Feature;

#[derive(Clone, Default)]
pub struct FeatureBus {
    inner: Arc<RwLock<HashMap<&'static str, Arc<dyn Feature>>>>,
}

impl FeatureBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a feature under its own name.
    pub fn publish(&self, feature: Arc<dyn Feature>) {
        self.inner.write().insert(feature.name(), feature);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Feature>> {
        self.inner.read().get(name).cloned()
    }

    /// Typed lookup; `None` when absent or of another type.
    pub fn get_as<T: Feature>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name)
            .and_then(|f| f.as_any().downcast::<T>().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Feature>> {
        self.inner.write().remove(name)
    }

    pub fn all(&self) -> Vec<Arc<dyn Feature>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.inner.read().keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
