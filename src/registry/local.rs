//! Local Entity Registry
//!
//! Single-process registry for deployments without a cluster. It keeps only
//! the forward index, so it offers [`EntityDirectory`] but deliberately not
//! [`crate::domain::ports::NodeAware`]: there is no departed node to clean up
//! after.

use crate::domain::ports::{EntityDirectory, NodeId, RegistrationRecord};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;

/// Forward-index-only registry owned by the local node
#[derive(Debug)]
pub struct LocalEntityRegistry {
    local: NodeId,
    entries: DashMap<String, BTreeSet<String>>,
}

impl LocalEntityRegistry {
    pub fn new(local: impl Into<NodeId>) -> Self {
        Self {
            local: local.into(),
            entries: DashMap::new(),
        }
    }

    /// Entity types with at least one registration
    pub fn entity_type_keys(&self) -> BTreeSet<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }
}

#[async_trait]
impl EntityDirectory for LocalEntityRegistry {
    async fn register(
        &self,
        _node_id: &NodeId,
        entity_type_key: &str,
        qualified_name: &str,
    ) -> Result<()> {
        self.entries
            .entry(entity_type_key.to_string())
            .or_default()
            .insert(qualified_name.to_string());
        Ok(())
    }

    async fn unregister(
        &self,
        _node_id: &NodeId,
        entity_type_key: &str,
        qualified_name: &str,
    ) -> Result<()> {
        if let Some(mut names) = self.entries.get_mut(entity_type_key) {
            names.remove(qualified_name);
        }
        self.entries.remove_if(entity_type_key, |_, names| names.is_empty());
        Ok(())
    }

    async fn get(&self, entity_type_key: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .entries
            .get(entity_type_key)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    /// Everything belongs to the local node
    async fn get_clustering_information(
        &self,
        node_id: &NodeId,
    ) -> Result<BTreeSet<RegistrationRecord>> {
        if *node_id != self.local {
            return Ok(BTreeSet::new());
        }
        Ok(self
            .entries
            .iter()
            .flat_map(|r| {
                let key = r.key().clone();
                r.value()
                    .iter()
                    .map(|name| RegistrationRecord::new(name.clone(), key.clone()))
                    .collect::<Vec<_>>()
            })
            .collect())
    }
}
