use mediacore::{
    BufferId, BufferPool, Chunk, Command, Completion, Direction, Format, FormatTable, IoRegion,
    IoStatus, MetaHeader, Node, NodeError, NodeEventKind, NodeFlags, NodeId, NodeInfo, Notifier,
    Properties, PropertiesExt, SourceId, Status,
};
use mediaruntime::{FactoryMetadata, LoopRef, NodeFactory, NodeSetup, PortDefinition};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

pub const FAKESRC: &str = "test.fakesrc";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub produced: u64,
    pub reused: u64,
    pub underruns: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeSourceConfig {
    /// Buffers become available later, announced with `HaveOutput`
    pub is_async: bool,
    /// Keep producing on its own instead of waiting to be asked
    pub live: bool,
    /// Produce on a periodic timer instead of an event
    pub period: Option<Duration>,
    /// Byte pattern written into every buffer after the sequence number
    pub fill: u8,
}

impl FakeSourceConfig {
    pub fn from_props(props: &Properties) -> Self {
        let period_ms = props.get_i64_or("period.ms", 0);
        Self {
            is_async: props.get_bool_or("node.async", false),
            live: props.get_bool_or("node.live", false),
            period: (period_ms > 0).then(|| Duration::from_millis(period_ms as u64)),
            fill: props.get_i64_or("fill", 0) as u8,
        }
    }
}

/// Source that stamps a sequence number into every buffer it produces.
pub struct FakeSource {
    config: FakeSourceConfig,
    formats: Vec<Format>,
    notifier: Option<Notifier>,
    format: Option<Format>,
    pool: Option<Rc<BufferPool>>,
    io: Option<IoRegion>,
    free: VecDeque<BufferId>,
    started: bool,
    ready: bool,
    requested: bool,
    starved: bool,
    seq: u32,
    data_loop: Option<LoopRef>,
    wakeup: Option<SourceId>,
    timer: Option<SourceId>,
    stats: Rc<Cell<SourceStats>>,
}

impl FakeSource {
    /// A synchronous source
    pub fn new(config: FakeSourceConfig) -> Self {
        Self {
            config,
            formats: Vec::new(),
            notifier: None,
            format: None,
            pool: None,
            io: None,
            free: VecDeque::new(),
            started: false,
            ready: false,
            requested: false,
            starved: false,
            seq: 0,
            data_loop: None,
            wakeup: None,
            timer: None,
            stats: Rc::new(Cell::new(SourceStats::default())),
        }
    }

    /// A source that registers its wakeup sources on `data_loop` as `owner`
    pub fn with_loop(config: FakeSourceConfig, data_loop: LoopRef, owner: NodeId) -> Self {
        let mut source = Self::new(config);
        if config.is_async {
            source.wakeup = Some(data_loop.add_event(Some(owner)));
        }
        if config.period.is_some() {
            source.timer = Some(data_loop.add_timer(Some(owner)));
        }
        source.data_loop = Some(data_loop);
        source
    }

    /// Restrict the formats the output accepts and enumerates
    pub fn with_formats(mut self, formats: Vec<Format>) -> Self {
        self.formats = formats;
        self
    }

    /// Shared view of the counters
    pub fn stats(&self) -> Rc<Cell<SourceStats>> {
        self.stats.clone()
    }

    fn update(&self, f: impl FnOnce(&mut SourceStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn check_port(&self, direction: Direction, port: u32) -> Result<(), NodeError> {
        if direction != Direction::Output || port != 0 {
            return Err(NodeError::InvalidPort { direction, port });
        }
        Ok(())
    }

    /// Arrange for `HaveOutput` once the next buffer may be produced
    fn request_wakeup(&mut self) -> Result<(), NodeError> {
        if self.requested || self.timer.is_some() {
            return Ok(());
        }
        let (Some(data_loop), Some(wakeup)) = (&self.data_loop, self.wakeup) else {
            return Err(NodeError::Failed("async source without a data loop".into()));
        };
        data_loop
            .signal(wakeup)
            .map_err(|e| NodeError::Failed(e.to_string()))?;
        self.requested = true;
        Ok(())
    }

    fn arm_timer(&self, armed: bool) -> Result<(), NodeError> {
        if let (Some(data_loop), Some(timer), Some(period)) = (&self.data_loop, self.timer, self.config.period) {
            let value = armed.then_some(period);
            data_loop
                .update_timer(timer, value, value)
                .map_err(|e| NodeError::Failed(e.to_string()))?;
        }
        Ok(())
    }

    fn fill(&self, pool: &BufferPool, id: BufferId) -> Result<(), NodeError> {
        let buffer = pool.get(id)?;
        {
            let mut data = pool.write(id)?;
            let n = data.len().min(4);
            let (head, rest) = data.split_at_mut(n);
            head.copy_from_slice(&self.seq.to_le_bytes()[..head.len()]);
            rest.fill(self.config.fill);
        }
        buffer.set_chunk(Chunk {
            offset: 0,
            size: buffer.capacity() as u32,
            stride: 0,
        });
        buffer.set_header(MetaHeader {
            flags: 0,
            seq: self.seq,
            pts: self.seq as i64,
            dts_offset: 0,
        });
        Ok(())
    }
}

impl Node for FakeSource {
    fn node_type(&self) -> &str {
        FAKESRC
    }

    fn info(&self) -> NodeInfo {
        NodeInfo {
            n_input_ports: 0,
            n_output_ports: 1,
            flags: NodeFlags {
                async_input: false,
                async_output: self.config.is_async,
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
        match format {
            Some(format) => {
                let supported = self.formats.is_empty()
                    || self.formats.iter().any(|f| {
                        f.media_type == format.media_type && f.media_subtype == format.media_subtype
                    });
                if !supported {
                    return Err(NodeError::InvalidFormat(format!("{}: unsupported media", FAKESRC)));
                }
                self.format = Some(format.clone());
            }
            None => {
                self.format = None;
                self.pool = None;
                self.free.clear();
            }
        }
        Ok(())
    }

    fn use_buffers(&mut self, direction: Direction, port: u32, buffers: Option<Rc<BufferPool>>) -> Result<(), NodeError> {
        self.check_port(direction, port)?;
        if buffers.is_some() && self.format.is_none() {
            return Err(NodeError::NoFormat);
        }
        self.free = buffers.iter().flat_map(|pool| pool.ids()).collect();
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
                self.arm_timer(true)?;
                if self.config.is_async && self.config.live {
                    self.request_wakeup()?;
                }
            }
            Command::Pause => {
                self.started = false;
                self.ready = false;
                self.arm_timer(false)?;
            }
        }
        Ok(Completion::Done)
    }

    fn process_output(&mut self) -> Result<Status, NodeError> {
        let io = self.io.clone().ok_or(NodeError::NoBuffers)?;
        let pool = self.pool.clone().ok_or(NodeError::NoBuffers)?;
        if io.status() == IoStatus::HaveBuffer {
            return Ok(Status::HaveBuffer);
        }
        if self.config.is_async && !self.ready {
            self.request_wakeup()?;
            return Ok(Status::NeedBuffer);
        }

        let Some(id) = self.free.pop_front() else {
            self.update(|s| s.underruns += 1);
            if self.config.is_async {
                self.starved = true;
            }
            if let Some(notifier) = &self.notifier {
                notifier.event(NodeEventKind::Underrun { port: 0 });
            }
            return Ok(Status::NeedBuffer);
        };

        self.fill(&pool, id)?;
        io.produce(id)?;
        tracing::trace!("{} produced buffer {} seq {}", FAKESRC, id, self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.ready = false;
        self.update(|s| s.produced += 1);

        if self.config.is_async && self.config.live {
            self.request_wakeup()?;
        }
        Ok(Status::Ok)
    }

    fn process_input(&mut self) -> Result<Status, NodeError> {
        Err(NodeError::InvalidPort {
            direction: Direction::Input,
            port: 0,
        })
    }

    fn reuse_buffer(&mut self, port: u32, buffer: BufferId) -> Result<(), NodeError> {
        self.check_port(Direction::Output, port)?;
        let pool = self.pool.as_ref().ok_or(NodeError::NoBuffers)?;
        pool.get(buffer)?;
        if self.free.contains(&buffer) {
            return Err(NodeError::InvalidState(format!("buffer {} is already free", buffer)));
        }
        self.free.push_back(buffer);
        self.update(|s| s.reused += 1);

        if std::mem::take(&mut self.starved) {
            if let Some(notifier) = &self.notifier {
                notifier.have_output();
            }
        }
        Ok(())
    }

    fn on_ready(&mut self, source: SourceId, _count: u64) -> Result<(), NodeError> {
        if Some(source) != self.wakeup && Some(source) != self.timer {
            return Ok(());
        }
        self.requested = false;
        if !self.started {
            return Ok(());
        }
        self.ready = true;
        if let Some(notifier) = &self.notifier {
            notifier.have_output();
        }
        Ok(())
    }
}

pub struct FakeSourceFactory;

impl NodeFactory for FakeSourceFactory {
    fn create(&self, setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        let config = FakeSourceConfig::from_props(setup.props);
        let source = FakeSource::with_loop(config, setup.data_loop.clone(), setup.id)
            .with_formats(default_formats(setup.formats));
        Ok(Box::new(source))
    }

    fn factory_name(&self) -> &str {
        FAKESRC
    }

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata {
            description: "Produces sequence-numbered buffers".to_string(),
            category: "test".to_string(),
            inputs: vec![],
            outputs: vec![PortDefinition::new("out", "binary/raw")],
        }
    }
}

/// Formats the test nodes offer, in preference order
pub(crate) fn default_formats(table: &FormatTable) -> Vec<Format> {
    let mut formats = Vec::new();
    if let Ok(binary) = table.format("binary", "raw") {
        formats.push(binary);
    }
    if let Ok(audio) = table.format("audio", "raw") {
        formats.push(
            audio
                .with_param("format", "F32LE")
                .with_param("rate", 48000i64)
                .with_param("channels", 2i64),
        );
    }
    formats
}
