#![allow(dead_code)]

use mediacore::{
    BufferId, BufferPool, BufferTag, Command, Completion, Direction, Format, FormatTable, IoRegion,
    IoStatus, Node, NodeError, NodeFlags, NodeId, NodeInfo, Notifier, Status,
};
use mediaruntime::{Graph, MediaRuntime};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mediaruntime=debug")
        .with_test_writer()
        .try_init();
}

/// Kind of processing call recorded in an [`ActivationLog`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Output,
    Input,
}

pub type ActivationLog = Rc<RefCell<Vec<(NodeId, Call)>>>;

/// Shared view into a [`TestNode`], kept by the test after the node moved
/// into the graph
#[derive(Default)]
pub struct Probe {
    pub produced: Cell<u64>,
    pub consumed: Cell<u64>,
    pub reused: Cell<u64>,
    /// Processing calls made while an async call in that direction was
    /// still in flight
    pub overlapping: Cell<u64>,
    pub fail: Cell<bool>,
    pub commands: RefCell<Vec<Command>>,
    ready: Cell<bool>,
    pending_output: Cell<bool>,
    pending_input: Cell<bool>,
    command_seq: Cell<u32>,
    notifier: RefCell<Option<Notifier>>,
}

impl Probe {
    /// Let an async producer make its next buffer and announce it
    pub fn complete_output(&self) {
        self.ready.set(true);
        self.pending_output.set(false);
        if let Some(notifier) = self.notifier.borrow().as_ref() {
            notifier.have_output();
        }
    }

    /// Let an async consumer accept its next buffer and ask for it
    pub fn complete_input(&self) {
        self.pending_input.set(false);
        if let Some(notifier) = self.notifier.borrow().as_ref() {
            notifier.need_input();
        }
    }

    /// Finish the last asynchronous command
    pub fn complete_command(&self, result: Result<(), NodeError>) {
        if let Some(notifier) = self.notifier.borrow().as_ref() {
            notifier.done(self.command_seq.get(), result);
        }
    }

    pub fn reuse(&self, port: u32, tag: BufferTag) {
        if let Some(notifier) = self.notifier.borrow().as_ref() {
            notifier.reuse_buffer(port, tag);
        }
    }
}

#[derive(Default)]
struct PortSlot {
    format: Option<Format>,
    pool: Option<Rc<BufferPool>>,
    io: Option<IoRegion>,
    free: VecDeque<BufferId>,
    held: Option<BufferId>,
}

/// Counting node with any number of ports.
///
/// Sources produce whenever a buffer is free, filters forward what they
/// hold on every output, sinks hand buffers straight back.
pub struct TestNode {
    flags: NodeFlags,
    async_commands: bool,
    inputs: Vec<PortSlot>,
    outputs: Vec<PortSlot>,
    probe: Rc<Probe>,
    log: Option<ActivationLog>,
    id: Option<NodeId>,
}

impl TestNode {
    pub fn new(n_inputs: u32, n_outputs: u32) -> Self {
        Self {
            flags: NodeFlags::default(),
            async_commands: false,
            inputs: (0..n_inputs).map(|_| PortSlot::default()).collect(),
            outputs: (0..n_outputs).map(|_| PortSlot::default()).collect(),
            probe: Rc::new(Probe::default()),
            log: None,
            id: None,
        }
    }

    pub fn source() -> Self {
        Self::new(0, 1)
    }

    pub fn sink() -> Self {
        Self::new(1, 0)
    }

    pub fn filter() -> Self {
        Self::new(1, 1)
    }

    pub fn async_output(mut self) -> Self {
        self.flags.async_output = true;
        self
    }

    pub fn async_input(mut self) -> Self {
        self.flags.async_input = true;
        self
    }

    pub fn async_commands(mut self) -> Self {
        self.async_commands = true;
        self
    }

    pub fn with_log(mut self, log: &ActivationLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn probe(&self) -> Rc<Probe> {
        self.probe.clone()
    }

    fn record(&self, call: Call) {
        if let (Some(log), Some(id)) = (&self.log, self.id) {
            log.borrow_mut().push((id, call));
        }
    }

    fn slot(&mut self, direction: Direction, port: u32) -> Result<&mut PortSlot, NodeError> {
        let slots = match direction {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        };
        slots
            .get_mut(port as usize)
            .ok_or(NodeError::InvalidPort { direction, port })
    }

    fn release(&self, port: u32, slot: &PortSlot, id: BufferId) {
        if let Some(pool) = &slot.pool {
            self.probe.reuse(port, pool.tag(id));
        }
    }
}

impl Node for TestNode {
    fn node_type(&self) -> &str {
        "test.probe"
    }

    fn info(&self) -> NodeInfo {
        NodeInfo {
            n_input_ports: self.inputs.len() as u32,
            n_output_ports: self.outputs.len() as u32,
            flags: self.flags,
        }
    }

    fn set_notifier(&mut self, notifier: Notifier) {
        self.id = Some(notifier.node_id());
        *self.probe.notifier.borrow_mut() = Some(notifier);
    }

    fn set_format(&mut self, direction: Direction, port: u32, format: Option<&Format>) -> Result<(), NodeError> {
        let slot = self.slot(direction, port)?;
        slot.format = format.cloned();
        if format.is_none() {
            slot.pool = None;
            slot.free.clear();
            slot.held = None;
        }
        Ok(())
    }

    fn use_buffers(&mut self, direction: Direction, port: u32, buffers: Option<Rc<BufferPool>>) -> Result<(), NodeError> {
        let slot = self.slot(direction, port)?;
        if slot.format.is_none() {
            return Err(NodeError::NoFormat);
        }
        slot.free = match (direction, &buffers) {
            (Direction::Output, Some(pool)) => pool.ids().collect(),
            _ => VecDeque::new(),
        };
        slot.held = None;
        slot.pool = buffers;
        Ok(())
    }

    fn set_io(&mut self, direction: Direction, port: u32, io: Option<IoRegion>) -> Result<(), NodeError> {
        self.slot(direction, port)?.io = io;
        Ok(())
    }

    fn send_command(&mut self, command: Command) -> Result<Completion, NodeError> {
        self.probe.commands.borrow_mut().push(command);
        if self.async_commands {
            let seq = self.probe.command_seq.get() + 1;
            self.probe.command_seq.set(seq);
            return Ok(Completion::Async(seq));
        }
        Ok(Completion::Done)
    }

    fn process_output(&mut self) -> Result<Status, NodeError> {
        self.record(Call::Output);
        if self.flags.async_output && self.probe.pending_output.get() {
            self.probe.overlapping.set(self.probe.overlapping.get() + 1);
        }
        if self.probe.fail.get() {
            return Err(NodeError::Failed("injected failure".into()));
        }
        if self
            .outputs
            .iter()
            .any(|s| s.io.as_ref().map(|io| io.status() == IoStatus::HaveBuffer).unwrap_or(false))
        {
            return Ok(Status::HaveBuffer);
        }
        if self.flags.async_output && !self.probe.ready.get() {
            self.probe.pending_output.set(true);
            return Ok(Status::NeedBuffer);
        }
        if !self.inputs.is_empty() && self.inputs.iter().all(|s| s.held.is_none()) {
            return Ok(Status::NeedBuffer);
        }
        if self.outputs.iter().any(|s| s.free.is_empty() || s.io.is_none()) {
            return Ok(Status::NeedBuffer);
        }

        for slot in &mut self.outputs {
            if let (Some(id), Some(io)) = (slot.free.pop_front(), &slot.io) {
                io.produce(id)?;
            }
        }
        for (port, slot) in self.inputs.iter().enumerate() {
            if let Some(id) = slot.held {
                self.release(port as u32, slot, id);
            }
        }
        for slot in &mut self.inputs {
            slot.held = None;
        }
        self.probe.ready.set(false);
        self.probe.produced.set(self.probe.produced.get() + 1);
        Ok(Status::Ok)
    }

    fn process_input(&mut self) -> Result<Status, NodeError> {
        self.record(Call::Input);
        if self.flags.async_input && self.probe.pending_input.get() {
            self.probe.overlapping.set(self.probe.overlapping.get() + 1);
        }
        if self.probe.fail.get() {
            return Err(NodeError::Failed("injected failure".into()));
        }

        let mut took = false;
        for slot in &mut self.inputs {
            if slot.held.is_some() {
                continue;
            }
            if let Some(id) = slot.io.as_ref().and_then(IoRegion::take) {
                slot.held = Some(id);
                took = true;
            }
        }
        if !took {
            return Ok(Status::HaveBuffer);
        }

        if self.outputs.is_empty() {
            for (port, slot) in self.inputs.iter().enumerate() {
                if let Some(id) = slot.held {
                    self.release(port as u32, slot, id);
                }
            }
            for slot in &mut self.inputs {
                slot.held = None;
            }
        }
        if self.flags.async_input {
            self.probe.pending_input.set(true);
        }
        self.probe.consumed.set(self.probe.consumed.get() + 1);
        Ok(Status::Ok)
    }

    fn reuse_buffer(&mut self, port: u32, buffer: BufferId) -> Result<(), NodeError> {
        let slot = self.slot(Direction::Output, port)?;
        slot.free.push_back(buffer);
        self.probe.reused.set(self.probe.reused.get() + 1);
        Ok(())
    }
}

/// Add a node to a bare graph, returning its probe
pub fn add(graph: &mut Graph, node: TestNode) -> (NodeId, Rc<Probe>) {
    let probe = node.probe();
    let id = graph.add_node(Box::new(node)).unwrap();
    (id, probe)
}

pub fn binary(table: &FormatTable) -> Format {
    table.format("binary", "raw").unwrap()
}

/// Negotiate `output:op → input:ip` with one 64-byte buffer
pub fn connect(runtime: &mut MediaRuntime, output: NodeId, op: u32, input: NodeId, ip: u32) -> mediacore::LinkId {
    let format = binary(runtime.formats());
    runtime
        .connect_with(output, op, input, ip, &format, mediacore::BufferSpec { count: 1, size: 64 })
        .unwrap()
}
