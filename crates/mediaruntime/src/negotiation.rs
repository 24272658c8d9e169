//! Two-phase configuration of a link.
//!
//! Phase one puts the same format on both ports and creates the link;
//! phase two allocates one buffer pool and hands it to both ends. A failure
//! in either phase rolls back what that phase already changed.

use crate::graph::Graph;
use mediacore::{BufferPool, BufferSpec, Direction, Format, FormatTable, GraphError, LinkId, NodeError, PortId};
use std::rc::Rc;

pub struct Negotiator<'t> {
    table: &'t FormatTable,
}

impl<'t> Negotiator<'t> {
    pub fn new(table: &'t FormatTable) -> Self {
        Self { table }
    }

    /// First format the output port offers that the input port also offers.
    ///
    /// Ports that enumerate nothing accept whatever the other side offers.
    pub fn common_format(&self, graph: &Graph, output: PortId, input: PortId) -> Result<Format, GraphError> {
        let offered = self.enumerate(graph, output)?;
        let accepted = self.enumerate(graph, input)?;

        let found = match (offered.is_empty(), accepted.is_empty()) {
            (false, false) => offered.into_iter().find(|f| accepted.iter().any(|a| a.matches(f))),
            (false, true) => offered.into_iter().next(),
            (true, false) => accepted.into_iter().next(),
            (true, true) => None,
        };
        found.ok_or(GraphError::FormatMismatch { output, input })
    }

    fn enumerate(&self, graph: &Graph, port_id: PortId) -> Result<Vec<Format>, GraphError> {
        let port = graph.port(port_id).ok_or(GraphError::PortNotFound(port_id))?;
        let entry = graph
            .nodes
            .get(&port.node)
            .ok_or(GraphError::NodeNotFound(port.node))?;

        let mut formats = Vec::new();
        for index in 0.. {
            match entry.node.enum_formats(port.direction, port.index, index) {
                Ok(format) => {
                    if self.table.validate(&format).is_ok() {
                        formats.push(format);
                    }
                }
                Err(NodeError::EnumEnd) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(formats)
    }

    /// Phase one: identical format on both ports, then the link itself.
    pub fn link(
        &self,
        graph: &mut Graph,
        output: PortId,
        input: PortId,
        format: &Format,
    ) -> Result<LinkId, GraphError> {
        self.table.validate(format)?;
        self.check_direction(graph, output, Direction::Output)?;
        self.check_direction(graph, input, Direction::Input)?;

        let previous = (self.current_format(graph, output), self.current_format(graph, input));
        graph.set_format(output, Some(format.clone()), self.table)?;
        if let Err(e) = graph.set_format(input, Some(format.clone()), self.table) {
            self.restore_format(graph, output, previous.0);
            return Err(e);
        }
        match graph.link(output, input) {
            Ok(link) => Ok(link),
            Err(e) => {
                self.restore_format(graph, output, previous.0);
                self.restore_format(graph, input, previous.1);
                Err(e)
            }
        }
    }

    /// Phase two: one pool shared by both ends of the link.
    pub fn allocate(&self, graph: &mut Graph, link: LinkId, spec: BufferSpec) -> Result<Rc<BufferPool>, GraphError> {
        let (output, input) = {
            let link = graph.get_link(link).ok_or(GraphError::LinkNotFound(link))?;
            (link.output, link.input)
        };
        let pool = Rc::new(BufferPool::with_buffers(spec.count, spec.size));

        // consumer first so the producer never sees buffers nobody can take
        graph.use_buffers(input, Some(pool.clone()))?;
        if let Err(e) = graph.use_buffers(output, Some(pool.clone())) {
            if let Err(undo) = graph.use_buffers(input, None) {
                tracing::warn!("Rolling back buffers on {} failed: {}", input, undo);
            }
            return Err(e);
        }
        tracing::debug!(
            "{} negotiated with {} buffers of {} bytes",
            link,
            pool.len(),
            spec.size
        );
        Ok(pool)
    }

    /// Both phases; if buffers cannot be set up the link is removed and both
    /// ports get their earlier formats back.
    pub fn connect(
        &self,
        graph: &mut Graph,
        output: PortId,
        input: PortId,
        format: &Format,
        spec: BufferSpec,
    ) -> Result<LinkId, GraphError> {
        let previous = (self.current_format(graph, output), self.current_format(graph, input));
        let link = self.link(graph, output, input, format)?;
        if let Err(e) = self.allocate(graph, link, spec) {
            if let Err(undo) = graph.unlink(link) {
                tracing::warn!("Removing half-configured {} failed: {}", link, undo);
            }
            self.restore_format(graph, output, previous.0);
            self.restore_format(graph, input, previous.1);
            return Err(e);
        }
        Ok(link)
    }

    fn check_direction(&self, graph: &Graph, port_id: PortId, expected: Direction) -> Result<(), GraphError> {
        let port = graph.port(port_id).ok_or(GraphError::PortNotFound(port_id))?;
        if port.direction != expected {
            return Err(GraphError::DirectionMismatch {
                port: port_id,
                expected,
            });
        }
        Ok(())
    }

    fn current_format(&self, graph: &Graph, port: PortId) -> Option<Format> {
        graph.port(port).and_then(|p| p.format().cloned())
    }

    fn restore_format(&self, graph: &mut Graph, port: PortId, format: Option<Format>) {
        if let Err(e) = graph.set_format(port, format, self.table) {
            tracing::warn!("Restoring format on {} failed: {}", port, e);
        }
    }
}
