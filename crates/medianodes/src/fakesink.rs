use crate::fakesrc::default_formats;
use mediacore::{
    BufferPool, Command, Completion, Direction, Format, IoRegion, Node, NodeError, NodeFlags, NodeId,
    NodeInfo, Notifier, Properties, PropertiesExt, SourceId, Status,
};
use mediaruntime::{FactoryMetadata, LoopRef, NodeFactory, NodeSetup, PortDefinition};
use std::cell::Cell;
use std::rc::Rc;

pub const FAKESINK: &str = "test.fakesink";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub consumed: u64,
    /// Times the sink was asked to consume with nothing published
    pub starved: u64,
    /// Sequence numbers that did not follow the previous one
    pub gaps: u64,
    pub last_seq: Option<u32>,
}

/// Sink that checks sequence numbers and hands every buffer straight back.
pub struct FakeSink {
    is_async: bool,
    formats: Vec<Format>,
    notifier: Option<Notifier>,
    format: Option<Format>,
    pool: Option<Rc<BufferPool>>,
    io: Option<IoRegion>,
    started: bool,
    requested: bool,
    data_loop: Option<LoopRef>,
    wakeup: Option<SourceId>,
    stats: Rc<Cell<SinkStats>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self {
            is_async: false,
            formats: Vec::new(),
            notifier: None,
            format: None,
            pool: None,
            io: None,
            started: false,
            requested: false,
            data_loop: None,
            wakeup: None,
            stats: Rc::new(Cell::new(SinkStats::default())),
        }
    }

    /// An async sink: it asks for input with `NeedInput` from a wakeup
    /// event registered on `data_loop` as `owner`.
    pub fn new_async(data_loop: LoopRef, owner: NodeId) -> Self {
        let wakeup = data_loop.add_event(Some(owner));
        Self {
            is_async: true,
            data_loop: Some(data_loop),
            wakeup: Some(wakeup),
            ..Self::new()
        }
    }

    pub fn with_formats(mut self, formats: Vec<Format>) -> Self {
        self.formats = formats;
        self
    }

    pub fn stats(&self) -> Rc<Cell<SinkStats>> {
        self.stats.clone()
    }

    fn check_port(&self, direction: Direction, port: u32) -> Result<(), NodeError> {
        if direction != Direction::Input || port != 0 {
            return Err(NodeError::InvalidPort { direction, port });
        }
        Ok(())
    }

    fn request_wakeup(&mut self) -> Result<(), NodeError> {
        if self.requested {
            return Ok(());
        }
        let (Some(data_loop), Some(wakeup)) = (&self.data_loop, self.wakeup) else {
            return Ok(());
        };
        data_loop
            .signal(wakeup)
            .map_err(|e| NodeError::Failed(e.to_string()))?;
        self.requested = true;
        Ok(())
    }
}

impl Default for FakeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for FakeSink {
    fn node_type(&self) -> &str {
        FAKESINK
    }

    fn info(&self) -> NodeInfo {
        NodeInfo {
            n_input_ports: 1,
            n_output_ports: 0,
            flags: NodeFlags {
                async_input: self.is_async,
                async_output: false,
            },
        }
    }

    fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = Some(notifier);
    }

    fn enum_formats(&self, direction: Direction, port: u32, index: u32) -> Result<Format, NodeError> {
        self.check_port(direction, port)?;
        self.formats.get(index as usize).cloned().ok_or(NodeError::EnumEnd)
    }

    fn set_format(&mut self, direction: Direction, port: u32, format: Option<&Format>) -> Result<(), NodeError> {
        self.check_port(direction, port)?;
        if let Some(format) = format {
            let supported = self.formats.is_empty()
                || self
                    .formats
                    .iter()
                    .any(|f| f.media_type == format.media_type && f.media_subtype == format.media_subtype);
            if !supported {
                return Err(NodeError::InvalidFormat(format!("{}: unsupported media", FAKESINK)));
            }
        } else {
            self.pool = None;
        }
        self.format = format.cloned();
        Ok(())
    }

    fn use_buffers(&mut self, direction: Direction, port: u32, buffers: Option<Rc<BufferPool>>) -> Result<(), NodeError> {
        self.check_port(direction, port)?;
        if buffers.is_some() && self.format.is_none() {
            return Err(NodeError::NoFormat);
        }
        self.pool = buffers;
        Ok(())
    }

    fn set_io(&mut self, direction: Direction, port: u32, io: Option<IoRegion>) -> Result<(), NodeError> {
        self.check_port(direction, port)?;
        self.io = io;
        Ok(())
    }

    fn send_command(&mut self, command: Command) -> Result<Completion, NodeError> {
        match command {
            Command::Start => {
                self.started = true;
                if self.is_async {
                    self.request_wakeup()?;
                }
            }
            Command::Pause => self.started = false,
        }
        Ok(Completion::Done)
    }

    fn process_output(&mut self) -> Result<Status, NodeError> {
        Err(NodeError::InvalidPort {
            direction: Direction::Output,
            port: 0,
        })
    }

    fn process_input(&mut self) -> Result<Status, NodeError> {
        let io = self.io.as_ref().ok_or(NodeError::NoBuffers)?;
        let pool = self.pool.as_ref().ok_or(NodeError::NoBuffers)?;

        let Some(id) = io.take() else {
            let mut stats = self.stats.get();
            stats.starved += 1;
            self.stats.set(stats);
            return Ok(Status::HaveBuffer);
        };

        let seq = pool.get(id)?.header().map(|h| h.seq);
        let mut stats = self.stats.get();
        stats.consumed += 1;
        if let (Some(last), Some(seq)) = (stats.last_seq, seq) {
            if seq != last.wrapping_add(1) {
                stats.gaps += 1;
                tracing::debug!("{} expected seq {} got {}", FAKESINK, last.wrapping_add(1), seq);
            }
        }
        stats.last_seq = seq.or(stats.last_seq);
        self.stats.set(stats);

        if let Some(notifier) = &self.notifier {
            notifier.reuse_buffer(0, pool.tag(id));
        }
        if self.is_async && self.started {
            self.request_wakeup()?;
        }
        Ok(Status::Ok)
    }

    fn on_ready(&mut self, source: SourceId, _count: u64) -> Result<(), NodeError> {
        if Some(source) != self.wakeup {
            return Ok(());
        }
        self.requested = false;
        if self.started {
            if let Some(notifier) = &self.notifier {
                notifier.need_input();
            }
        }
        Ok(())
    }
}

pub struct FakeSinkFactory;

impl NodeFactory for FakeSinkFactory {
    fn create(&self, setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        let sink = if is_async(setup.props) {
            FakeSink::new_async(setup.data_loop.clone(), setup.id)
        } else {
            FakeSink::new()
        };
        Ok(Box::new(sink.with_formats(default_formats(setup.formats))))
    }

    fn factory_name(&self) -> &str {
        FAKESINK
    }

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata {
            description: "Consumes buffers and returns them".to_string(),
            category: "test".to_string(),
            inputs: vec![PortDefinition::new("in", "binary/raw")],
            outputs: vec![],
        }
    }
}

fn is_async(props: &Properties) -> bool {
    props.get_bool_or("node.async", false)
}
