//! Graph-side endpoint for a client stream.
//!
//! Clients talk to their node over a transport that is not part of this
//! crate; inside the graph the endpoint behaves like a plain source
//! (`media.direction = "output"`) or sink (`"input"`).

use crate::fakesink::FakeSink;
use crate::fakesrc::{default_formats, FakeSource, FakeSourceConfig};
use mediacore::{
    BufferId, BufferPool, Command, Completion, Direction, Format, IoRegion, Node, NodeError,
    NodeInfo, Notifier, PropertiesExt, SourceId, Status,
};
use mediaruntime::{FactoryMetadata, NodeFactory, NodeSetup, PortDefinition};
use std::rc::Rc;

pub const CLIENT_NODE: &str = "client-node";

pub struct ClientNode {
    direction: Direction,
    inner: Box<dyn Node>,
}

impl ClientNode {
    pub fn new(direction: Direction, inner: Box<dyn Node>) -> Self {
        Self { direction, inner }
    }

    /// Direction of the stream's single port
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl Node for ClientNode {
    fn node_type(&self) -> &str {
        CLIENT_NODE
    }

    fn info(&self) -> NodeInfo {
        self.inner.info()
    }

    fn set_notifier(&mut self, notifier: Notifier) {
        self.inner.set_notifier(notifier)
    }

    fn enum_formats(&self, direction: Direction, port: u32, index: u32) -> Result<Format, NodeError> {
        self.inner.enum_formats(direction, port, index)
    }

    fn set_format(&mut self, direction: Direction, port: u32, format: Option<&Format>) -> Result<(), NodeError> {
        self.inner.set_format(direction, port, format)
    }

    fn use_buffers(&mut self, direction: Direction, port: u32, buffers: Option<Rc<BufferPool>>) -> Result<(), NodeError> {
        self.inner.use_buffers(direction, port, buffers)
    }

    fn set_io(&mut self, direction: Direction, port: u32, io: Option<IoRegion>) -> Result<(), NodeError> {
        self.inner.set_io(direction, port, io)
    }

    fn send_command(&mut self, command: Command) -> Result<Completion, NodeError> {
        self.inner.send_command(command)
    }

    fn process_output(&mut self) -> Result<Status, NodeError> {
        self.inner.process_output()
    }

    fn process_input(&mut self) -> Result<Status, NodeError> {
        self.inner.process_input()
    }

    fn reuse_buffer(&mut self, port: u32, buffer: BufferId) -> Result<(), NodeError> {
        self.inner.reuse_buffer(port, buffer)
    }

    fn on_ready(&mut self, source: SourceId, count: u64) -> Result<(), NodeError> {
        self.inner.on_ready(source, count)
    }
}

pub struct ClientNodeFactory;

impl NodeFactory for ClientNodeFactory {
    fn create(&self, setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        let formats = default_formats(setup.formats);
        let (direction, inner): (Direction, Box<dyn Node>) =
            match setup.props.get_str("media.direction").unwrap_or("output") {
                "output" => {
                    let config = FakeSourceConfig::from_props(setup.props);
                    let source = FakeSource::with_loop(config, setup.data_loop.clone(), setup.id);
                    (Direction::Output, Box::new(source.with_formats(formats)))
                }
                "input" => {
                    let sink = if setup.props.get_bool_or("node.async", false) {
                        FakeSink::new_async(setup.data_loop.clone(), setup.id)
                    } else {
                        FakeSink::new()
                    };
                    (Direction::Input, Box::new(sink.with_formats(formats)))
                }
                other => {
                    return Err(NodeError::Failed(format!("unknown media.direction '{}'", other)));
                }
            };
        tracing::debug!("Client node {} streams {}", setup.id, direction);
        Ok(Box::new(ClientNode::new(direction, inner)))
    }

    fn factory_name(&self) -> &str {
        CLIENT_NODE
    }

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata {
            description: "Endpoint of a client stream".to_string(),
            category: "client".to_string(),
            inputs: vec![PortDefinition::new("in", "any")],
            outputs: vec![PortDefinition::new("out", "any")],
        }
    }
}
