use mediacore::{
    BufferId, BufferPool, Chunk, Command, Completion, Direction, Format, FormatTable, IoRegion,
    IoStatus, MediaSubtype, MediaType, Node, NodeError, NodeEventKind, NodeInfo, Notifier,
    PropertiesExt, Status, Value,
};
use mediaruntime::{FactoryMetadata, NodeFactory, NodeSetup, PortDefinition};
use std::collections::VecDeque;
use std::rc::Rc;

pub const VOLUME: &str = "filter.volume";

const SAMPLE_FORMAT: &str = "F32LE";

#[derive(Default)]
struct PortState {
    format: Option<Format>,
    pool: Option<Rc<BufferPool>>,
    io: Option<IoRegion>,
}

impl PortState {
    fn clear(&mut self) {
        self.format = None;
        self.pool = None;
    }
}

/// Multiplies interleaved `F32LE` samples by a gain.
///
/// Holds at most one input buffer; it is returned upstream as soon as the
/// scaled copy has been published on the output.
pub struct Volume {
    gain: f32,
    media: (MediaType, MediaSubtype),
    template: Format,
    notifier: Option<Notifier>,
    input: PortState,
    output: PortState,
    held: Option<BufferId>,
    free: VecDeque<BufferId>,
}

impl Volume {
    pub fn new(gain: f32, table: &FormatTable) -> Result<Self, NodeError> {
        let template = table
            .format("audio", "raw")?
            .with_param("format", SAMPLE_FORMAT)
            .with_param("rate", 48000i64)
            .with_param("channels", 2i64);
        Ok(Self {
            gain,
            media: (template.media_type, template.media_subtype),
            template,
            notifier: None,
            input: PortState::default(),
            output: PortState::default(),
            held: None,
            free: VecDeque::new(),
        })
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    fn port(&mut self, direction: Direction, port: u32) -> Result<&mut PortState, NodeError> {
        match (direction, port) {
            (Direction::Input, 0) => Ok(&mut self.input),
            (Direction::Output, 0) => Ok(&mut self.output),
            _ => Err(NodeError::InvalidPort { direction, port }),
        }
    }

    fn accepts(&self, format: &Format) -> Result<(), NodeError> {
        if (format.media_type, format.media_subtype) != self.media {
            return Err(NodeError::InvalidFormat(format!("{} only handles audio/raw", VOLUME)));
        }
        match format.param("format").and_then(Value::as_str) {
            Some(SAMPLE_FORMAT) | None => Ok(()),
            Some(other) => Err(NodeError::InvalidFormat(format!(
                "{} needs {} samples, got {}",
                VOLUME, SAMPLE_FORMAT, other
            ))),
        }
    }

    fn scale(&self, input: &BufferPool, from: BufferId, output: &BufferPool, to: BufferId) -> Result<(), NodeError> {
        let src = input.describe(from)?;
        let size = {
            let mut dst = output.write(to)?;
            let bytes = src.valid();
            let n = bytes.len().min(dst.len()) / 4 * 4;
            for (s, d) in bytes[..n].chunks_exact(4).zip(dst[..n].chunks_exact_mut(4)) {
                let sample = f32::from_le_bytes([s[0], s[1], s[2], s[3]]) * self.gain;
                d.copy_from_slice(&sample.to_le_bytes());
            }
            n
        };
        let buffer = output.get(to)?;
        buffer.set_chunk(Chunk {
            offset: 0,
            size: size as u32,
            stride: 4,
        });
        if let Some(header) = src.header {
            buffer.set_header(header);
        }
        Ok(())
    }
}

impl Node for Volume {
    fn node_type(&self) -> &str {
        VOLUME
    }

    fn info(&self) -> NodeInfo {
        NodeInfo {
            n_input_ports: 1,
            n_output_ports: 1,
            flags: Default::default(),
        }
    }

    fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = Some(notifier);
    }

    fn enum_formats(&self, direction: Direction, port: u32, index: u32) -> Result<Format, NodeError> {
        if port != 0 {
            return Err(NodeError::InvalidPort { direction, port });
        }
        // once one side is fixed the other follows it
        let fixed = match direction {
            Direction::Input => self.output.format.as_ref(),
            Direction::Output => self.input.format.as_ref(),
        };
        match index {
            0 => Ok(fixed.unwrap_or(&self.template).clone()),
            _ => Err(NodeError::EnumEnd),
        }
    }

    fn set_format(&mut self, direction: Direction, port: u32, format: Option<&Format>) -> Result<(), NodeError> {
        if let Some(format) = format {
            self.accepts(format)?;
        }
        let state = self.port(direction, port)?;
        match format {
            Some(format) => state.format = Some(format.clone()),
            None => state.clear(),
        }
        match direction {
            Direction::Input if format.is_none() => self.held = None,
            Direction::Output if format.is_none() => self.free.clear(),
            _ => {}
        }
        Ok(())
    }

    fn use_buffers(&mut self, direction: Direction, port: u32, buffers: Option<Rc<BufferPool>>) -> Result<(), NodeError> {
        let state = self.port(direction, port)?;
        if buffers.is_some() && state.format.is_none() {
            return Err(NodeError::NoFormat);
        }
        state.pool = buffers;
        match direction {
            Direction::Input => self.held = None,
            Direction::Output => {
                self.free = self.output.pool.iter().flat_map(|pool| pool.ids()).collect();
            }
        }
        Ok(())
    }

    fn set_io(&mut self, direction: Direction, port: u32, io: Option<IoRegion>) -> Result<(), NodeError> {
        self.port(direction, port)?.io = io;
        Ok(())
    }

    fn send_command(&mut self, _command: Command) -> Result<Completion, NodeError> {
        Ok(Completion::Done)
    }

    fn process_input(&mut self) -> Result<Status, NodeError> {
        if self.held.is_some() {
            return Ok(Status::Ok);
        }
        let io = self.input.io.as_ref().ok_or(NodeError::NoBuffers)?;
        match io.take() {
            Some(id) => {
                self.held = Some(id);
                Ok(Status::Ok)
            }
            None => Ok(Status::HaveBuffer),
        }
    }

    fn process_output(&mut self) -> Result<Status, NodeError> {
        let out_io = self.output.io.clone().ok_or(NodeError::NoBuffers)?;
        if out_io.status() == IoStatus::HaveBuffer {
            return Ok(Status::HaveBuffer);
        }
        let Some(held) = self.held else {
            return Ok(Status::NeedBuffer);
        };
        let Some(target) = self.free.pop_front() else {
            if let Some(notifier) = &self.notifier {
                notifier.event(NodeEventKind::Underrun { port: 0 });
            }
            return Ok(Status::NeedBuffer);
        };

        let in_pool = self.input.pool.clone().ok_or(NodeError::NoBuffers)?;
        let out_pool = self.output.pool.clone().ok_or(NodeError::NoBuffers)?;
        if let Err(e) = self.scale(&in_pool, held, &out_pool, target) {
            self.free.push_front(target);
            return Err(e);
        }
        out_io.produce(target)?;
        self.held = None;
        if let Some(notifier) = &self.notifier {
            notifier.reuse_buffer(0, in_pool.tag(held));
        }
        Ok(Status::Ok)
    }

    fn reuse_buffer(&mut self, port: u32, buffer: BufferId) -> Result<(), NodeError> {
        if port != 0 {
            return Err(NodeError::InvalidPort {
                direction: Direction::Output,
                port,
            });
        }
        if !self.free.contains(&buffer) {
            self.free.push_back(buffer);
        }
        Ok(())
    }
}

pub struct VolumeFactory;

impl NodeFactory for VolumeFactory {
    fn create(&self, setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        let gain = if setup.props.get_bool_or("mute", false) {
            0.0
        } else {
            setup.props.get("volume").and_then(Value::as_f64).unwrap_or(1.0) as f32
        };
        if !gain.is_finite() || gain < 0.0 {
            return Err(NodeError::Failed(format!("invalid volume {}", gain)));
        }
        Ok(Box::new(Volume::new(gain, setup.formats)?))
    }

    fn factory_name(&self) -> &str {
        VOLUME
    }

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata {
            description: "Scales F32LE samples by a constant gain".to_string(),
            category: "filter".to_string(),
            inputs: vec![PortDefinition::new("in", "audio/raw")],
            outputs: vec![PortDefinition::new("out", "audio/raw")],
        }
    }
}
