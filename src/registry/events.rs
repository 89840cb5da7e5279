//! Registry Events
//!
//! Events emitted by the entity registry for external consumers to react to
//! registration changes and node removals.

use crate::domain::ports::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by the entity registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A node published a resource for an entity type
    EntryRegistered {
        node_id: NodeId,
        entity_type_key: String,
        qualified_name: String,
    },

    /// A node withdrew a resource
    EntryUnregistered {
        node_id: NodeId,
        entity_type_key: String,
        qualified_name: String,
    },

    /// Every registration of a departed node was removed
    NodeUnregistered {
        node_id: NodeId,
        records_removed: usize,
        removed_at: DateTime<Utc>,
    },
}

impl RegistryEvent {
    /// Get the node ID associated with this event
    pub fn node_id(&self) -> &NodeId {
        match self {
            RegistryEvent::EntryRegistered { node_id, .. } => node_id,
            RegistryEvent::EntryUnregistered { node_id, .. } => node_id,
            RegistryEvent::NodeUnregistered { node_id, .. } => node_id,
        }
    }

    /// Get the entity type if this is an entry-level event
    pub fn entity_type_key(&self) -> Option<&str> {
        match self {
            RegistryEvent::EntryRegistered { entity_type_key, .. } => Some(entity_type_key),
            RegistryEvent::EntryUnregistered { entity_type_key, .. } => Some(entity_type_key),
            RegistryEvent::NodeUnregistered { .. } => None,
        }
    }

    /// Check if this is a node-level event
    pub fn is_node_event(&self) -> bool {
        matches!(self, RegistryEvent::NodeUnregistered { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = RegistryEvent::EntryRegistered {
            node_id: "node-001".into(),
            entity_type_key: "Customer".to_string(),
            qualified_name: "verticleX".to_string(),
        };
        assert_eq!(event.node_id().as_str(), "node-001");
        assert_eq!(event.entity_type_key(), Some("Customer"));
        assert!(!event.is_node_event());

        let event = RegistryEvent::NodeUnregistered {
            node_id: "node-002".into(),
            records_removed: 3,
            removed_at: Utc::now(),
        };
        assert_eq!(event.entity_type_key(), None);
        assert!(event.is_node_event());
    }
}
