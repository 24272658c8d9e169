//! Built-in node library
//!
//! Test sources and sinks, a volume filter and the client stream endpoint.

mod client;
mod fakesink;
mod fakesrc;
mod volume;

pub use client::{ClientNode, ClientNodeFactory, CLIENT_NODE};
pub use fakesink::{FakeSink, FakeSinkFactory, SinkStats, FAKESINK};
pub use fakesrc::{FakeSource, FakeSourceConfig, FakeSourceFactory, SourceStats, FAKESRC};
pub use volume::{Volume, VolumeFactory, VOLUME};
use mediaruntime::NodeRegistry;

use std::sync::Arc;

/// Register all built-in nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(fakesrc::FakeSourceFactory));
    registry.register(Arc::new(fakesink::FakeSinkFactory));
    registry.register(Arc::new(volume::VolumeFactory));
    registry.register(Arc::new(client::ClientNodeFactory));
}
