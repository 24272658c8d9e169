use crate::{Direction, LinkId, NodeId, PortId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Reactor error: {0}")]
    Reactor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by node methods.
///
/// Flow-control outcomes (`NeedBuffer`, `HaveBuffer`) are not errors; they
/// are carried by [`crate::Status`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("No format negotiated on port")]
    NoFormat,

    #[error("No buffers assigned to port")]
    NoBuffers,

    #[error("Permission denied")]
    NoPermission,

    #[error("Enumeration exhausted")]
    EnumEnd,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid {direction} port {port}")]
    InvalidPort { direction: Direction, port: u32 },

    #[error("Node busy")]
    Busy,

    #[error("Node failed: {0}")]
    Failed(String),
}

/// Structural failures of graph operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Port not found: {0}")]
    PortNotFound(PortId),

    #[error("Link not found: {0}")]
    LinkNotFound(LinkId),

    #[error("Link would create a cycle between {from} and {to}")]
    CyclicLink { from: NodeId, to: NodeId },

    #[error("Format mismatch between {output} and {input}")]
    FormatMismatch { output: PortId, input: PortId },

    #[error("Port already linked: {0}")]
    AlreadyLinked(PortId),

    #[error("Expected an {expected} port, got {port}")]
    DirectionMismatch { port: PortId, expected: Direction },

    #[error("Node {0} is running")]
    NodeRunning(NodeId),

    #[error("Unknown node factory: {0}")]
    UnknownFactory(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Permission denied")]
    NoPermission,

    #[error("Propagation failed at {node}: {error}")]
    Branch { node: NodeId, error: NodeError },

    #[error("Node error: {0}")]
    Node(#[from] NodeError),
}
