use crate::{BufferId, BufferPool, BufferTag, Format, IoRegion, NodeError, NodeId, SourceId};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::ControlFlow;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Flow-control outcome of a processing call.
///
/// For `process_output`: `Ok` means a buffer was published on the output IO
/// region, `NeedBuffer` means nothing could be produced yet (an async node
/// will signal `HaveOutput` later, a filter needs input first).
///
/// For `process_input`: `Ok` means the input was drained, `HaveBuffer` means
/// a buffer is still owed by upstream and the node could not make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NeedBuffer,
    HaveBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Start,
    Pause,
}

/// Result of a command that may finish out of band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// Finishes later with a `Done` notification carrying this sequence number
    Async(u32),
}

/// Which directions complete asynchronously
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub async_input: bool,
    pub async_output: bool,
}

impl NodeFlags {
    pub fn is_async(&self, direction: Direction) -> bool {
        match direction {
            Direction::Input => self.async_input,
            Direction::Output => self.async_output,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub n_input_ports: u32,
    pub n_output_ports: u32,
    pub flags: NodeFlags,
}

impl NodeInfo {
    pub fn n_ports(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Input => self.n_input_ports,
            Direction::Output => self.n_output_ports,
        }
    }
}

/// Free-form events a node reports about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEventKind {
    Info { message: String },
    Warning { message: String },
    Error { message: String },
    Underrun { port: u32 },
}

/// Notifications a node emits towards the graph
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Done { seq: u32, result: Result<(), NodeError> },
    Event(NodeEventKind),
    NeedInput,
    HaveOutput,
    ReuseBuffer { port: u32, buffer: BufferTag },
}

/// Queue of notifications waiting to be dispatched on the data thread.
#[derive(Debug, Clone, Default)]
pub struct NotificationQueue(Rc<RefCell<VecDeque<(NodeId, Notification)>>>);

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, node: NodeId, notification: Notification) {
        self.0.borrow_mut().push_back((node, notification));
    }

    pub fn pop(&self) -> Option<(NodeId, Notification)> {
        self.0.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Drop everything queued on behalf of `node`.
    pub fn discard(&self, node: NodeId) -> usize {
        let mut queue = self.0.borrow_mut();
        let before = queue.len();
        queue.retain(|(from, _)| *from != node);
        before - queue.len()
    }
}

/// Handle a node uses to emit notifications.
#[derive(Debug, Clone)]
pub struct Notifier {
    node: NodeId,
    queue: NotificationQueue,
}

impl Notifier {
    pub fn new(node: NodeId, queue: NotificationQueue) -> Self {
        Self { node, queue }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn done(&self, seq: u32, result: Result<(), NodeError>) {
        self.queue.push(self.node, Notification::Done { seq, result });
    }

    pub fn event(&self, event: NodeEventKind) {
        self.queue.push(self.node, Notification::Event(event));
    }

    pub fn need_input(&self) {
        self.queue.push(self.node, Notification::NeedInput);
    }

    pub fn have_output(&self) {
        self.queue.push(self.node, Notification::HaveOutput);
    }

    pub fn reuse_buffer(&self, port: u32, buffer: BufferTag) {
        self.queue.push(self.node, Notification::ReuseBuffer { port, buffer });
    }
}

/// Capability interface every node kind implements.
///
/// All methods are called on the data thread and must not block. A node
/// flagged async for a direction returns from the processing call right away
/// and reports readiness later through its [`Notifier`].
pub trait Node {
    /// Type identifier, e.g. "test.fakesrc"
    fn node_type(&self) -> &str;

    fn info(&self) -> NodeInfo;

    /// Called once when the node is added to a graph
    fn set_notifier(&mut self, _notifier: Notifier) {}

    /// Formats the port can do, by index; `EnumEnd` past the last one.
    fn enum_formats(&self, _direction: Direction, _port: u32, _index: u32) -> Result<Format, NodeError> {
        Err(NodeError::EnumEnd)
    }

    /// Set or clear (`None`) the port format
    fn set_format(&mut self, direction: Direction, port: u32, format: Option<&Format>) -> Result<(), NodeError>;

    /// Assign or clear (`None`) the buffers used on a port
    fn use_buffers(
        &mut self,
        direction: Direction,
        port: u32,
        buffers: Option<Rc<BufferPool>>,
    ) -> Result<(), NodeError>;

    /// Attach or detach the IO region of a linked port
    fn set_io(&mut self, direction: Direction, port: u32, io: Option<IoRegion>) -> Result<(), NodeError>;

    fn send_command(&mut self, command: Command) -> Result<Completion, NodeError>;

    fn process_output(&mut self) -> Result<Status, NodeError>;

    fn process_input(&mut self) -> Result<Status, NodeError>;

    /// A consumer gave `buffer` back on output `port`
    fn reuse_buffer(&mut self, _port: u32, _buffer: BufferId) -> Result<(), NodeError> {
        Ok(())
    }

    /// A reactor source owned by this node became ready
    fn on_ready(&mut self, _source: SourceId, _count: u64) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Observer installed once per node by whoever drives the graph.
///
/// Returning `ControlFlow::Break` from the readiness callbacks asks the
/// run loop to stop after the current dispatch.
pub trait NodeCallbacks {
    fn on_done(&mut self, _seq: u32, _result: &Result<(), NodeError>) {}

    fn on_event(&mut self, _event: &NodeEventKind) {}

    fn on_need_input(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn on_have_output(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn on_reuse_buffer(&mut self, _port: u32, _buffer: BufferId) {}
}
