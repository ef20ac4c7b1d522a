//! Published flows, keyed by stream id.
//!
//! The registry is owned by a [`crate::FlowRuntime`]; there is no global table.
//! Relays look their target flow up here.

use crate::error::{FlowError, FlowResult};
use crate::flow::Flow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct FlowRegistry<D> {
    flows: RwLock<HashMap<String, Arc<Flow<D>>>>,
}

impl<D> Default for FlowRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> FlowRegistry<D> {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }

    /// Add a flow. Ids are unique; re-registering an id is rejected.
    pub fn register(&self, flow: Flow<D>) -> FlowResult<Arc<Flow<D>>> {
        let mut flows = self
            .flows
            .write()
            .map_err(|_| FlowError::generic("Failed to acquire write lock on flow registry"))?;
        if flows.contains_key(flow.id()) {
            return Err(FlowError::configuration(format!(
                "flow '{}' is already published",
                flow.id()
            )));
        }
        let flow = Arc::new(flow);
        flows.insert(flow.id().to_string(), Arc::clone(&flow));
        Ok(flow)
    }

    pub fn get(&self, id: &str) -> FlowResult<Arc<Flow<D>>> {
        let flows = self
            .flows
            .read()
            .map_err(|_| FlowError::generic("Failed to acquire read lock on flow registry"))?;
        flows
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::flow_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.flows
            .read()
            .map(|flows| flows.contains_key(id))
            .unwrap_or(false)
    }

    pub fn ids(&self) -> Vec<String> {
        self.flows
            .read()
            .map(|flows| flows.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowBuilder;

    #[test]
    fn test_register_and_lookup() {
        let registry = FlowRegistry::new();
        let flow = FlowBuilder::<i32>::new("a").map("m", Ok).close().unwrap();
        registry.register(flow).unwrap();

        assert!(registry.contains("a"));
        assert_eq!(registry.get("a").unwrap().id(), "a");
        assert_eq!(registry.ids(), vec!["a".to_string()]);

        let missing = registry.get("b").unwrap_err();
        assert_eq!(missing, FlowError::flow_not_found("b"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = FlowRegistry::new();
        registry
            .register(FlowBuilder::<i32>::new("a").map("m", Ok).close().unwrap())
            .unwrap();
        let err = registry
            .register(FlowBuilder::<i32>::new("a").map("m", Ok).close().unwrap())
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
