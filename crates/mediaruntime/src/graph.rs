//! Node, port and link arenas plus the operations that mutate them.
//!
//! Every node, port and link is owned by the [`Graph`] and addressed by id.
//! Ports remember their node, links remember their two ports, and the
//! directed node topology is mirrored in a petgraph map so that cycles can
//! be rejected before a link is created.

use crate::reactor::LoopRef;
use crate::scheduler::{Action, Scheduler, WaveReport};
use chrono::Utc;
use mediacore::{
    BufferPool, BufferTag, Command, Completion, Direction, EventBus, Format, FormatTable,
    GraphError, GraphEvent, IdAllocator, IoRegion, IoStatus, LinkId, Node, NodeCallbacks,
    NodeError, NodeId, NodeInfo, Notification, NotificationQueue, Notifier, PortId, Properties,
    SourceId, Status,
};
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::rc::Rc;

/// Default bound on node activations within a single wave
pub const DEFAULT_WAVE_LIMIT: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Some port still lacks a format or buffers
    Created,
    /// Every port has a format and buffers; the node can be started
    Configured,
    Running,
    Paused,
}

#[derive(Debug)]
pub struct Port {
    pub id: PortId,
    pub node: NodeId,
    pub direction: Direction,
    pub index: u32,
    format: Option<Format>,
    buffers: Option<Rc<BufferPool>>,
    link: Option<LinkId>,
}

impl Port {
    pub fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    pub fn buffers(&self) -> Option<&Rc<BufferPool>> {
        self.buffers.as_ref()
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    fn is_configured(&self) -> bool {
        self.format.is_some() && self.buffers.is_some()
    }
}

#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub output: PortId,
    pub input: PortId,
    io: IoRegion,
}

impl Link {
    pub fn io(&self) -> &IoRegion {
        &self.io
    }
}

pub(crate) struct NodeEntry {
    pub(crate) node: Box<dyn Node>,
    node_type: String,
    pub(crate) info: NodeInfo,
    pub(crate) state: RunState,
    props: Properties,
    owner: Option<u32>,
    pub(crate) inputs: Vec<PortId>,
    pub(crate) outputs: Vec<PortId>,
    callbacks: Option<Box<dyn NodeCallbacks>>,
    pub(crate) pending_output: bool,
    pub(crate) pending_input: bool,
    pending_commands: HashMap<u32, Command>,
}

impl NodeEntry {
    fn ports(&self) -> impl Iterator<Item = &PortId> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

/// A port on the other side of a ready link
#[derive(Debug, Clone, Copy)]
pub(crate) struct Peer {
    pub(crate) node: NodeId,
    pub(crate) status: IoStatus,
}

pub struct Graph {
    node_ids: IdAllocator,
    port_ids: IdAllocator,
    link_ids: IdAllocator,
    pub(crate) nodes: BTreeMap<NodeId, NodeEntry>,
    ports: HashMap<PortId, Port>,
    links: BTreeMap<LinkId, Link>,
    topology: DiGraphMap<NodeId, u32>,
    notifications: NotificationQueue,
    data_loop: LoopRef,
    events: EventBus,
    scheduler: Scheduler,
    wave_limit: usize,
    stop_requested: bool,
}

impl Graph {
    pub fn new(data_loop: LoopRef, events: EventBus) -> Self {
        Self {
            node_ids: IdAllocator::new(),
            port_ids: IdAllocator::new(),
            link_ids: IdAllocator::new(),
            nodes: BTreeMap::new(),
            ports: HashMap::new(),
            links: BTreeMap::new(),
            topology: DiGraphMap::new(),
            notifications: NotificationQueue::new(),
            data_loop,
            events,
            scheduler: Scheduler::default(),
            wave_limit: DEFAULT_WAVE_LIMIT,
            stop_requested: false,
        }
    }

    pub fn set_wave_limit(&mut self, limit: usize) {
        self.wave_limit = limit.max(1);
    }

    pub fn data_loop(&self) -> &LoopRef {
        &self.data_loop
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Allocate the id the next node will be inserted under.
    ///
    /// Factories need the id up front to tag the reactor sources they
    /// register on the node's behalf.
    pub fn reserve_node_id(&mut self) -> NodeId {
        self.node_ids.next()
    }

    pub fn add_node(&mut self, node: Box<dyn Node>) -> Result<NodeId, GraphError> {
        let id = self.reserve_node_id();
        self.insert_node(id, node, Properties::new())
    }

    /// Insert a node under a previously reserved id, creating its ports.
    pub fn insert_node(
        &mut self,
        id: NodeId,
        mut node: Box<dyn Node>,
        props: Properties,
    ) -> Result<NodeId, GraphError> {
        if self.nodes.contains_key(&id) {
            return Err(GraphError::Unsupported(format!("{} is already in use", id)));
        }

        let info = node.info();
        let node_type = node.node_type().to_string();
        let mut inputs = Vec::with_capacity(info.n_input_ports as usize);
        let mut outputs = Vec::with_capacity(info.n_output_ports as usize);
        for direction in [Direction::Input, Direction::Output] {
            for index in 0..info.n_ports(direction) {
                let port_id: PortId = self.port_ids.next();
                self.ports.insert(
                    port_id,
                    Port {
                        id: port_id,
                        node: id,
                        direction,
                        index,
                        format: None,
                        buffers: None,
                        link: None,
                    },
                );
                match direction {
                    Direction::Input => inputs.push(port_id),
                    Direction::Output => outputs.push(port_id),
                }
            }
        }

        node.set_notifier(Notifier::new(id, self.notifications.clone()));

        let state = if inputs.is_empty() && outputs.is_empty() {
            RunState::Configured
        } else {
            RunState::Created
        };
        self.nodes.insert(
            id,
            NodeEntry {
                node,
                node_type: node_type.clone(),
                info,
                state,
                props,
                owner: None,
                inputs,
                outputs,
                callbacks: None,
                pending_output: false,
                pending_input: false,
                pending_commands: HashMap::new(),
            },
        );
        self.topology.add_node(id);

        tracing::debug!(
            "Added {} ({}) with {} inputs, {} outputs",
            id,
            node_type,
            info.n_input_ports,
            info.n_output_ports
        );
        self.events.emit(GraphEvent::NodeAdded {
            node_id: id,
            node_type,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    /// Remove a node, unlinking it and dropping every reactor source and
    /// queued notification that belongs to it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let entry = self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))?;
        if entry.state == RunState::Running {
            if let Err(e) = self.send_command(id, Command::Pause) {
                tracing::warn!("Pausing {} before removal failed: {}", id, e);
            }
        }

        for link in self.links_of(id) {
            self.unlink(link)?;
        }

        let entry = self.nodes.remove(&id).ok_or(GraphError::NodeNotFound(id))?;
        for port in entry.ports() {
            self.ports.remove(port);
        }
        let sources = self.data_loop.remove_owned(id);
        let dropped = self.notifications.discard(id);
        self.topology.remove_node(id);

        tracing::debug!(
            "Removed {} ({}), {} sources, {} queued notifications",
            id,
            entry.node_type,
            sources,
            dropped
        );
        self.events.emit(GraphEvent::NodeRemoved {
            node_id: id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_links(&self) -> usize {
        self.links.len()
    }

    pub fn node_state(&self, id: NodeId) -> Option<RunState> {
        self.nodes.get(&id).map(|e| e.state)
    }

    pub fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.get(&id).map(|e| e.info)
    }

    pub fn node_type(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|e| e.node_type.as_str())
    }

    pub fn node_props(&self, id: NodeId) -> Option<&Properties> {
        self.nodes.get(&id).map(|e| &e.props)
    }

    /// Merge `props` into the node's properties
    pub fn update_props(&mut self, id: NodeId, props: Properties) -> Result<(), GraphError> {
        let entry = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        entry.props.extend(props);
        Ok(())
    }

    /// Uid of the client that owns the node, if any
    pub fn owner(&self, id: NodeId) -> Option<u32> {
        self.nodes.get(&id).and_then(|e| e.owner)
    }

    pub fn set_owner(&mut self, id: NodeId, uid: Option<u32>) -> Result<(), GraphError> {
        let entry = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        entry.owner = uid;
        Ok(())
    }

    pub fn port_id(&self, node: NodeId, direction: Direction, index: u32) -> Result<PortId, GraphError> {
        let entry = self.nodes.get(&node).ok_or(GraphError::NodeNotFound(node))?;
        let ports = match direction {
            Direction::Input => &entry.inputs,
            Direction::Output => &entry.outputs,
        };
        ports
            .get(index as usize)
            .copied()
            .ok_or(GraphError::Node(NodeError::InvalidPort { direction, port: index }))
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(&id)
    }

    pub fn get_link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    /// Links attached to any port of `node`, inputs first
    pub fn links_of(&self, node: NodeId) -> Vec<LinkId> {
        self.nodes
            .get(&node)
            .map(|entry| {
                entry
                    .ports()
                    .filter_map(|p| self.ports.get(p).and_then(|p| p.link))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes at the two ends of a link
    pub fn link_nodes(&self, id: LinkId) -> Option<(NodeId, NodeId)> {
        let link = self.links.get(&id)?;
        let output = self.ports.get(&link.output)?;
        let input = self.ports.get(&link.input)?;
        Some((output.node, input.node))
    }

    /// Number of links whose IO region currently holds a published buffer
    pub fn buffers_in_flight(&self) -> usize {
        self.links
            .values()
            .filter(|l| l.io.status() == IoStatus::HaveBuffer)
            .count()
    }

    /// Both ends formatted and sharing the same buffer pool
    pub fn is_link_ready(&self, id: LinkId) -> bool {
        let Some(link) = self.links.get(&id) else {
            return false;
        };
        match (
            self.ports.get(&link.output).and_then(|p| p.buffers.as_ref()),
            self.ports.get(&link.input).and_then(|p| p.buffers.as_ref()),
        ) {
            (Some(out), Some(inp)) => Rc::ptr_eq(out, inp),
            _ => false,
        }
    }

    /// Set or clear the format of an unlinked port.
    ///
    /// Changing the format drops any buffers previously assigned to the port.
    pub fn set_format(
        &mut self,
        port_id: PortId,
        format: Option<Format>,
        table: &FormatTable,
    ) -> Result<(), GraphError> {
        let port = self.ports.get_mut(&port_id).ok_or(GraphError::PortNotFound(port_id))?;
        let entry = self
            .nodes
            .get_mut(&port.node)
            .ok_or(GraphError::NodeNotFound(port.node))?;
        if entry.state == RunState::Running {
            return Err(GraphError::NodeRunning(port.node));
        }
        if let Some(link) = port.link {
            return Err(GraphError::Unsupported(format!("{} is linked by {}", port_id, link)));
        }
        if let Some(format) = &format {
            table.validate(format)?;
        }

        entry.node.set_format(port.direction, port.index, format.as_ref())?;
        if port.buffers.take().is_some() {
            if let Err(e) = entry.node.use_buffers(port.direction, port.index, None) {
                tracing::warn!("Clearing buffers on {} failed: {}", port_id, e);
            }
        }
        tracing::trace!(
            "{} format: {}",
            port_id,
            format.as_ref().map(|f| table.describe(f)).unwrap_or_else(|| "none".into())
        );
        port.format = format;
        let node = port.node;
        self.refresh_state(node);
        Ok(())
    }

    /// Assign or clear the buffers of a linked port.
    ///
    /// Buffers can only be assigned after a format has been set; the port is
    /// left untouched when the call fails.
    pub fn use_buffers(
        &mut self,
        port_id: PortId,
        buffers: Option<Rc<BufferPool>>,
    ) -> Result<(), GraphError> {
        let port = self.ports.get_mut(&port_id).ok_or(GraphError::PortNotFound(port_id))?;
        if let Some(pool) = &buffers {
            if port.format.is_none() {
                return Err(NodeError::NoFormat.into());
            }
            if port.link.is_none() {
                return Err(GraphError::Unsupported(format!("{} is not linked", port_id)));
            }
            if pool.is_empty() {
                return Err(NodeError::NoBuffers.into());
            }
        }
        let entry = self
            .nodes
            .get_mut(&port.node)
            .ok_or(GraphError::NodeNotFound(port.node))?;
        if entry.state == RunState::Running {
            return Err(GraphError::NodeRunning(port.node));
        }

        entry.node.use_buffers(port.direction, port.index, buffers.clone())?;
        tracing::trace!(
            "{} uses {} buffers",
            port_id,
            buffers.as_ref().map(|b| b.len()).unwrap_or(0)
        );
        port.buffers = buffers;
        let node = port.node;
        self.refresh_state(node);
        Ok(())
    }

    /// Connect an output port to an input port.
    ///
    /// Both ports must be free and carry identical formats, and the link must
    /// not close a cycle. A new IO region is handed to both nodes.
    pub fn link(&mut self, output: PortId, input: PortId) -> Result<LinkId, GraphError> {
        let out = self.ports.get(&output).ok_or(GraphError::PortNotFound(output))?;
        let inp = self.ports.get(&input).ok_or(GraphError::PortNotFound(input))?;

        if out.direction != Direction::Output {
            return Err(GraphError::DirectionMismatch {
                port: output,
                expected: Direction::Output,
            });
        }
        if inp.direction != Direction::Input {
            return Err(GraphError::DirectionMismatch {
                port: input,
                expected: Direction::Input,
            });
        }
        if out.link.is_some() {
            return Err(GraphError::AlreadyLinked(output));
        }
        if inp.link.is_some() {
            return Err(GraphError::AlreadyLinked(input));
        }
        match (&out.format, &inp.format) {
            (Some(a), Some(b)) if a.matches(b) => {}
            (Some(_), Some(_)) => return Err(GraphError::FormatMismatch { output, input }),
            _ => return Err(NodeError::NoFormat.into()),
        }

        let (from, to) = (out.node, inp.node);
        let (out_index, in_index) = (out.index, inp.index);
        if from == to || has_path_connecting(&self.topology, to, from, None) {
            return Err(GraphError::CyclicLink { from, to });
        }

        if !self.nodes.contains_key(&to) {
            return Err(GraphError::NodeNotFound(to));
        }

        let io = IoRegion::new();
        let producer = self.nodes.get_mut(&from).ok_or(GraphError::NodeNotFound(from))?;
        producer
            .node
            .set_io(Direction::Output, out_index, Some(io.clone()))?;
        let consumer = self.nodes.get_mut(&to).ok_or(GraphError::NodeNotFound(to))?;
        if let Err(e) = consumer.node.set_io(Direction::Input, in_index, Some(io.clone())) {
            self.detach_io(from, Direction::Output, out_index);
            return Err(e.into());
        }

        let id: LinkId = self.link_ids.next();
        if let Some(port) = self.ports.get_mut(&output) {
            port.link = Some(id);
        }
        if let Some(port) = self.ports.get_mut(&input) {
            port.link = Some(id);
        }
        match self.topology.edge_weight_mut(from, to) {
            Some(count) => *count += 1,
            None => {
                self.topology.add_edge(from, to, 1);
            }
        }
        self.links.insert(id, Link { id, output, input, io });

        tracing::debug!("Linked {} -> {} as {}", output, input, id);
        self.events.emit(GraphEvent::LinkAdded {
            link_id: id,
            output,
            input,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    /// Tear down a link, detaching IO regions and buffers from both ports.
    pub fn unlink(&mut self, id: LinkId) -> Result<(), GraphError> {
        let link = self.links.remove(&id).ok_or(GraphError::LinkNotFound(id))?;

        let mut ends = Vec::with_capacity(2);
        for port_id in [link.output, link.input] {
            let Some(port) = self.ports.get_mut(&port_id) else {
                continue;
            };
            port.link = None;
            let had_buffers = port.buffers.take().is_some();
            ends.push(port.node);
            if let Some(entry) = self.nodes.get_mut(&port.node) {
                if let Err(e) = entry.node.set_io(port.direction, port.index, None) {
                    tracing::warn!("Detaching io from {} failed: {}", port_id, e);
                }
                if had_buffers {
                    if let Err(e) = entry.node.use_buffers(port.direction, port.index, None) {
                        tracing::warn!("Clearing buffers on {} failed: {}", port_id, e);
                    }
                }
            }
        }

        if let [from, to] = ends[..] {
            let remaining = match self.topology.edge_weight_mut(from, to) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                self.topology.remove_edge(from, to);
            }
        }
        for node in ends {
            self.refresh_state(node);
        }

        tracing::debug!("Unlinked {}", id);
        self.events.emit(GraphEvent::LinkRemoved {
            link_id: id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn detach_io(&mut self, node: NodeId, direction: Direction, index: u32) {
        if let Some(entry) = self.nodes.get_mut(&node) {
            if let Err(e) = entry.node.set_io(direction, index, None) {
                tracing::warn!("Rolling back io on {} failed: {}", node, e);
            }
        }
    }

    fn ports_configured(&self, node: NodeId) -> bool {
        self.nodes
            .get(&node)
            .map(|entry| {
                entry
                    .ports()
                    .all(|p| self.ports.get(p).map(Port::is_configured).unwrap_or(false))
            })
            .unwrap_or(false)
    }

    fn refresh_state(&mut self, node: NodeId) {
        let configured = self.ports_configured(node);
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.state = match entry.state {
                RunState::Created | RunState::Configured if configured => RunState::Configured,
                RunState::Created | RunState::Configured => RunState::Created,
                other => other,
            };
        }
    }

    /// Start or pause a node.
    ///
    /// Start requires every port to be configured. Pausing a node that is
    /// not running is a no-op. A node may finish the command asynchronously,
    /// in which case the state changes when its `Done` notification arrives.
    pub fn send_command(&mut self, id: NodeId, command: Command) -> Result<Completion, GraphError> {
        let configured = self.ports_configured(id);
        let entry = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        match command {
            Command::Start => {
                if entry.state == RunState::Running {
                    return Ok(Completion::Done);
                }
                if !configured {
                    return Err(NodeError::InvalidState(format!(
                        "{} has unconfigured ports",
                        id
                    ))
                    .into());
                }
            }
            Command::Pause => {
                if entry.state != RunState::Running {
                    return Ok(Completion::Done);
                }
            }
        }

        let completion = entry.node.send_command(command)?;
        match completion {
            Completion::Done => self.apply_command(id, command),
            Completion::Async(seq) => {
                tracing::trace!("{} completes {:?} asynchronously (seq {})", id, command, seq);
                entry.pending_commands.insert(seq, command);
            }
        }
        Ok(completion)
    }

    fn apply_command(&mut self, id: NodeId, command: Command) {
        let Some(entry) = self.nodes.get_mut(&id) else {
            return;
        };
        entry.state = match command {
            Command::Start => RunState::Running,
            Command::Pause => {
                entry.pending_input = false;
                entry.pending_output = false;
                RunState::Paused
            }
        };
        tracing::debug!("{} is now {:?}", id, entry.state);
        self.events.emit(GraphEvent::NodeStateChanged {
            node_id: id,
            command,
            timestamp: Utc::now(),
        });
    }

    fn complete_command(&mut self, id: NodeId, seq: u32, result: &Result<(), NodeError>) {
        let Some(command) = self
            .nodes
            .get_mut(&id)
            .and_then(|e| e.pending_commands.remove(&seq))
        else {
            tracing::debug!("{} completed unknown seq {}", id, seq);
            return;
        };
        match result {
            Ok(()) => self.apply_command(id, command),
            Err(e) => tracing::warn!("{} failed {:?}: {}", id, command, e),
        }
    }

    /// Install the observer for a node. Only one may be installed.
    pub fn set_callbacks(
        &mut self,
        id: NodeId,
        callbacks: Box<dyn NodeCallbacks>,
    ) -> Result<(), GraphError> {
        let entry = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        if entry.callbacks.is_some() {
            return Err(GraphError::Unsupported(format!(
                "{} already has callbacks installed",
                id
            )));
        }
        entry.callbacks = Some(callbacks);
        Ok(())
    }

    /// Queue a push activation starting at `node`
    pub fn schedule_push(&mut self, node: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&node) {
            return Err(GraphError::NodeNotFound(node));
        }
        self.scheduler.schedule(node, Action::Output);
        Ok(())
    }

    /// Queue a pull activation starting at `node`
    pub fn schedule_pull(&mut self, node: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&node) {
            return Err(GraphError::NodeNotFound(node));
        }
        self.scheduler.schedule(node, Action::Input);
        Ok(())
    }

    /// Run queued activations to a stable point, then dispatch the
    /// notifications they raised.
    ///
    /// A failing node ends only its own branch; the rest of the wave still
    /// runs and the first failure is returned afterwards.
    pub fn iterate(&mut self) -> Result<WaveReport, GraphError> {
        let mut report = WaveReport::default();
        self.run_wave(&mut report);
        if self.drain(&mut report).is_break() {
            self.stop_requested = true;
        }
        report.into_result()
    }

    pub fn push(&mut self, node: NodeId) -> Result<WaveReport, GraphError> {
        self.schedule_push(node)?;
        self.iterate()
    }

    pub fn pull(&mut self, node: NodeId) -> Result<WaveReport, GraphError> {
        self.schedule_pull(node)?;
        self.iterate()
    }

    /// Run one producer and one consumer back to back without the scheduler.
    ///
    /// Only valid for two synchronous nodes connected by a single link.
    pub fn process_direct(&mut self, output: NodeId, input: NodeId) -> Result<Status, GraphError> {
        let producer = self.nodes.get(&output).ok_or(GraphError::NodeNotFound(output))?;
        let consumer = self.nodes.get(&input).ok_or(GraphError::NodeNotFound(input))?;
        if producer.info.flags.async_output || consumer.info.flags.async_input {
            return Err(GraphError::Unsupported(
                "direct processing needs synchronous nodes".into(),
            ));
        }
        for node in [output, input] {
            if self.node_state(node) != Some(RunState::Running) {
                return Err(NodeError::InvalidState(format!("{} is not running", node)).into());
            }
        }
        let links = self.links_of(output);
        let direct = links.len() == 1
            && self.links_of(input).len() == 1
            && self.link_nodes(links[0]) == Some((output, input))
            && self.is_link_ready(links[0]);
        if !direct {
            return Err(GraphError::Unsupported(format!(
                "{} and {} are not connected by a single link",
                output, input
            )));
        }

        let status = self
            .nodes
            .get_mut(&output)
            .ok_or(GraphError::NodeNotFound(output))?
            .node
            .process_output()
            .map_err(|error| GraphError::Branch { node: output, error })?;
        let status = match status {
            Status::NeedBuffer => Status::NeedBuffer,
            _ => self
                .nodes
                .get_mut(&input)
                .ok_or(GraphError::NodeNotFound(input))?
                .node
                .process_input()
                .map_err(|error| GraphError::Branch { node: input, error })?,
        };

        let mut report = WaveReport::default();
        if self.drain(&mut report).is_break() {
            self.stop_requested = true;
        }
        report.into_result()?;
        Ok(status)
    }

    /// A reactor source owned by `node` became ready.
    pub fn source_ready(&mut self, node: NodeId, source: SourceId, count: u64) -> Result<(), GraphError> {
        let entry = self.nodes.get_mut(&node).ok_or(GraphError::NodeNotFound(node))?;
        entry.node.on_ready(source, count)?;
        Ok(())
    }

    /// Dispatch queued notifications, running the waves they start.
    ///
    /// Returns `Break` when a callback asked the run loop to stop.
    pub fn dispatch_notifications(&mut self) -> Result<ControlFlow<()>, GraphError> {
        let mut report = WaveReport::default();
        let mut flow = self.drain(&mut report);
        if std::mem::take(&mut self.stop_requested) {
            flow = ControlFlow::Break(());
        }
        report.into_result()?;
        Ok(flow)
    }

    /// Whether a callback asked to stop since the last check
    pub fn take_stop_request(&mut self) -> bool {
        std::mem::take(&mut self.stop_requested)
    }

    pub fn pending_notifications(&self) -> usize {
        self.notifications.len()
    }

    fn run_wave(&mut self, report: &mut WaveReport) {
        let seen = report.errors.len();
        let limit = self.wave_limit;
        let mut scheduler = std::mem::take(&mut self.scheduler);
        scheduler.run(self, limit, report);
        self.scheduler = scheduler;

        for (node, error) in &report.errors[seen..] {
            tracing::warn!("Propagation stopped at {}: {}", node, error);
            self.events.emit(GraphEvent::BranchFailed {
                node_id: *node,
                error: error.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn drain(&mut self, report: &mut WaveReport) -> ControlFlow<()> {
        let mut flow = ControlFlow::Continue(());
        while let Some((id, notification)) = self.notifications.pop() {
            let Some(entry) = self.nodes.get_mut(&id) else {
                tracing::trace!("Dropping notification from removed {}", id);
                continue;
            };
            match notification {
                Notification::NeedInput => {
                    entry.pending_input = false;
                    let wanted = match entry.callbacks.as_mut() {
                        Some(cb) => cb.on_need_input(),
                        None => ControlFlow::Continue(()),
                    };
                    // a stop request only holds back the node that made it
                    if wanted.is_break() {
                        flow = ControlFlow::Break(());
                    } else {
                        self.scheduler.schedule(id, Action::Input);
                        self.run_wave(report);
                    }
                }
                Notification::HaveOutput => {
                    entry.pending_output = false;
                    let wanted = match entry.callbacks.as_mut() {
                        Some(cb) => cb.on_have_output(),
                        None => ControlFlow::Continue(()),
                    };
                    if wanted.is_break() {
                        flow = ControlFlow::Break(());
                    } else {
                        self.scheduler.schedule(id, Action::Output);
                        self.run_wave(report);
                    }
                }
                Notification::ReuseBuffer { port, buffer } => {
                    if let Some(cb) = entry.callbacks.as_mut() {
                        cb.on_reuse_buffer(port, buffer.id);
                    }
                    self.return_buffer(id, port, buffer);
                }
                Notification::Done { seq, result } => {
                    if let Some(cb) = entry.callbacks.as_mut() {
                        cb.on_done(seq, &result);
                    }
                    self.complete_command(id, seq, &result);
                }
                Notification::Event(event) => {
                    if let Some(cb) = entry.callbacks.as_mut() {
                        cb.on_event(&event);
                    }
                    self.events.emit(GraphEvent::NodeEvent {
                        node_id: id,
                        event,
                        timestamp: Utc::now(),
                    });
                }
            }
        }
        flow
    }

    /// Route a buffer released on a consumer's input port back to the
    /// producer on the other end of the link.
    ///
    /// Returns that arrive after the link or its buffers were replaced are
    /// dropped.
    fn return_buffer(&mut self, consumer: NodeId, port: u32, tag: BufferTag) {
        let producer = self
            .port_id(consumer, Direction::Input, port)
            .ok()
            .and_then(|p| self.ports.get(&p))
            .and_then(|p| p.link)
            .and_then(|l| self.links.get(&l))
            .and_then(|l| self.ports.get(&l.output))
            .filter(|out| out.buffers.as_ref().map(|b| b.owns(tag)).unwrap_or(false))
            .map(|out| (out.node, out.index));

        let Some((node, index)) = producer else {
            tracing::debug!("Dropping stale return of buffer {} from {}", tag.id, consumer);
            return;
        };
        if let Some(entry) = self.nodes.get_mut(&node) {
            if let Err(e) = entry.node.reuse_buffer(index, tag.id) {
                tracing::warn!("{} refused buffer {}: {}", node, tag.id, e);
            }
        }
    }

    /// Nodes on the far side of the ready links attached to `ports`
    pub(crate) fn peers(&self, ports: &[PortId]) -> Vec<Peer> {
        ports
            .iter()
            .filter_map(|p| self.ports.get(p))
            .filter_map(|port| {
                let link_id = port.link?;
                if !self.is_link_ready(link_id) {
                    return None;
                }
                let link = self.links.get(&link_id)?;
                let far = match port.direction {
                    Direction::Output => link.input,
                    Direction::Input => link.output,
                };
                Some(Peer {
                    node: self.ports.get(&far)?.node,
                    status: link.io.status(),
                })
            })
            .collect()
    }
}
