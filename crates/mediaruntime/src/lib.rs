//! Graph runtime
//!
//! Owns the node graph, schedules processing through it and runs the
//! single-threaded data loop that dispatches reactor readiness, permission
//! replies and device events.

pub mod access;
mod driver;
mod graph;
pub mod loader;
pub mod monitor;
mod negotiation;
pub mod reactor;
mod registry;
mod runtime;
mod scheduler;

pub use access::{
    AccessControl, AccessPolicy, AllowAll, ClientInfo, Decision, DenyingPortal, Operation,
    PermissionPortal, PermissionReply, PortalRequest, PortalResponse, SandboxPolicy,
};
pub use driver::{drive, DriveReport};
pub use graph::{Graph, Link, Port, RunState, DEFAULT_WAVE_LIMIT};
pub use loader::{load, validate, LoadedGraph, ValidationIssue};
pub use monitor::{DeviceEvent, DeviceMonitor, MonitorAction};
pub use negotiation::Negotiator;
pub use reactor::{LoopHandle, LoopMessage, LoopRef, Reactor, ReactorError, Ready, SourceKind};
pub use registry::{FactoryMetadata, NodeFactory, NodeRegistry, NodeSetup, PortDefinition};
pub use runtime::{MediaRuntime, RequestOutcome, RunStats, RuntimeConfig};
pub use scheduler::WaveReport;
