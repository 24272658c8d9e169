//! Core data model of the media graph
//!
//! Buffers, IO regions, formats and the node capability interface. This
//! crate knows nothing about scheduling or the reactor; those live in
//! `mediaruntime`.

mod buffer;
mod error;
pub mod events;
mod format;
mod id;
mod io;
mod node;
mod topology;
mod value;

pub use buffer::{Buffer, BufferId, BufferPool, BufferTag, BufferView, Chunk, MetaHeader};
pub use error::{GraphError, MediaError, NodeError};
pub use events::*;
pub use format::{Format, FormatTable, MediaSubtype, MediaType};
pub use id::{IdAllocator, LinkId, NodeId, PortId, SourceId};
pub use io::{IoRegion, IoStatus};
pub use node::{
    Command, Completion, Direction, Node, NodeCallbacks, NodeEventKind, NodeFlags, NodeInfo,
    Notification, NotificationQueue, Notifier, Status,
};
pub use topology::{
    BufferSpec, FormatSpec, GraphSpec, LinkSpec, NodeSpec, PortRef, RunMode, RunSettings,
};
pub use value::{Properties, PropertiesExt, Value};

/// Result type for media graph operations
pub type Result<T> = std::result::Result<T, MediaError>;
