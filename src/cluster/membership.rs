//! Static Membership
//!
//! A membership view maintained by explicit join/leave calls. Each change is
//! broadcast as a [`MembershipEvent`] so departure listeners can react
//! eagerly; the cleanup coordinator only reads the current snapshot.

use crate::domain::ports::{MembershipProvider, NodeId};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Membership changes observed by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    /// A node joined the cluster
    NodeJoined { node_id: NodeId },

    /// A node left the cluster (or was declared dead)
    NodeLeft { node_id: NodeId },
}

impl MembershipEvent {
    /// Get the node ID associated with this event
    pub fn node_id(&self) -> &NodeId {
        match self {
            MembershipEvent::NodeJoined { node_id } => node_id,
            MembershipEvent::NodeLeft { node_id } => node_id,
        }
    }
}

/// Shared live-node set
///
/// Several logical nodes in one process can share the same set while each
/// keeps its own local id, see [`StaticMembership::view_for`].
#[derive(Debug)]
struct MemberSet {
    live: RwLock<BTreeSet<NodeId>>,
    event_sender: broadcast::Sender<MembershipEvent>,
}

/// Explicitly managed membership view
#[derive(Debug, Clone)]
pub struct StaticMembership {
    local: NodeId,
    members: Arc<MemberSet>,
}

impl StaticMembership {
    /// Create a view containing only `local`
    pub fn new(local: impl Into<NodeId>) -> Self {
        let local = local.into();
        let (event_sender, _) = broadcast::channel(256);
        let mut live = BTreeSet::new();
        live.insert(local.clone());

        Self {
            local,
            members: Arc::new(MemberSet {
                live: RwLock::new(live),
                event_sender,
            }),
        }
    }

    /// A view of the same member set from another node's perspective
    pub fn view_for(&self, local: impl Into<NodeId>) -> Self {
        Self {
            local: local.into(),
            members: Arc::clone(&self.members),
        }
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.members.event_sender.subscribe()
    }

    /// Mark a node as alive
    pub fn join(&self, node_id: impl Into<NodeId>) -> bool {
        let node_id = node_id.into();
        let inserted = self.members.live.write().insert(node_id.clone());
        if inserted {
            let _ = self
                .members
                .event_sender
                .send(MembershipEvent::NodeJoined { node_id });
        }
        inserted
    }

    /// Mark a node as departed
    pub fn leave(&self, node_id: impl Into<NodeId>) -> bool {
        let node_id = node_id.into();
        let removed = self.members.live.write().remove(&node_id);
        if removed {
            let _ = self
                .members
                .event_sender
                .send(MembershipEvent::NodeLeft { node_id });
        }
        removed
    }

    /// Current snapshot without going through the async port
    pub fn snapshot(&self) -> BTreeSet<NodeId> {
        self.members.live.read().clone()
    }
}

#[async_trait]
impl MembershipProvider for StaticMembership {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    async fn live_node_ids(&self) -> Result<BTreeSet<NodeId>> {
        Ok(self.snapshot())
    }
}
