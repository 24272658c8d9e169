use crate::{Command, LinkId, NodeEventKind, NodeId, PortId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ClientId = Uuid;

/// Object created on behalf of a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum ObjectRef {
    Node(NodeId),
    Link(LinkId),
}

/// Events emitted while the graph is built and driven
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GraphEvent {
    NodeAdded {
        node_id: NodeId,
        node_type: String,
        timestamp: DateTime<Utc>,
    },
    NodeRemoved {
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    LinkAdded {
        link_id: LinkId,
        output: PortId,
        input: PortId,
        timestamp: DateTime<Utc>,
    },
    LinkRemoved {
        link_id: LinkId,
        timestamp: DateTime<Utc>,
    },
    NodeStateChanged {
        node_id: NodeId,
        command: Command,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        node_id: NodeId,
        event: NodeEventKind,
        timestamp: DateTime<Utc>,
    },
    BranchFailed {
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    PermissionDenied {
        client: ClientId,
        seq: u32,
        operation: String,
        timestamp: DateTime<Utc>,
    },
    RequestCompleted {
        client: ClientId,
        seq: u32,
        object: ObjectRef,
        timestamp: DateTime<Utc>,
    },
    /// A granted request whose deferred work failed
    RequestFailed {
        client: ClientId,
        seq: u32,
        operation: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for graph events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget; having no subscriber is fine.
    pub fn emit(&self, event: GraphEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
