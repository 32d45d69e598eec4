//! Process-wide provider registry: `ProviderId -> Adapter`.
//!
//! Adapters are registered once at startup and live for the process
//! lifetime; there is no unregister operation because every adapter is a
//! singleton for as long as the process runs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::{Adapter, ProviderId};

#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderId, Arc<dyn Adapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.id().clone(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    pub fn list(&self) -> Vec<Arc<dyn Adapter>> {
        self.adapters.values().cloned().collect()
    }

    pub fn list_ids(&self) -> Vec<ProviderId> {
        self.adapters.keys().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.adapters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::MockAdapter;

    #[test]
    fn register_and_lookup() {
        let mut registry = ProviderRegistry::new();
        assert_eq!(registry.size(), 0);
        registry.register(Arc::new(MockAdapter::new("a", vec![])));
        assert!(registry.has("a"));
        assert!(!registry.has("b"));
        assert_eq!(registry.list_ids(), vec!["a".to_string()]);
        assert_eq!(registry.size(), 1);
    }
}
