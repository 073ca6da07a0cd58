//! In-memory worker registry.

use std::{collections::BTreeMap, sync::RwLock};

use async_trait::async_trait;
use raven_core::{NodeInfo, RegistryError, WorkerDescriptor, WorkerRegistry};

/// In-memory registry.
///
/// Useful for tests and short-lived coordinators.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryRegistry {
    nodes: RwLock<BTreeMap<String, NodeInfo>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for MemoryRegistry {
    async fn get(&self, host: &str) -> Result<Option<WorkerDescriptor>, RegistryError> {
        Ok(self
            .nodes
            .read()
            .map_err(|e| RegistryError::Internal(e.to_string()))?
            .get(host)
            .map(|info| WorkerDescriptor::from_node_info(host, info.clone())))
    }

    async fn put(&self, worker: &WorkerDescriptor) -> Result<(), RegistryError> {
        self.nodes
            .write()
            .map_err(|e| RegistryError::Internal(e.to_string()))?
            .insert(worker.host.clone(), worker.node_info());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkerDescriptor>, RegistryError> {
        let nodes = self
            .nodes
            .read()
            .map_err(|e| RegistryError::Internal(e.to_string()))?;

        Ok(nodes
            .iter()
            .map(|(host, info)| WorkerDescriptor::from_node_info(host.as_str(), info.clone()))
            .collect())
    }
}
