use crate::access::{
    AccessControl, AccessPolicy, ClientInfo, Decision, DenyingPortal, Operation, PermissionPortal,
    PermissionReply, PortalRequest, PortalResponse,
};
use crate::graph::Graph;
use crate::monitor::{DeviceEvent, DeviceMonitor, MonitorAction};
use crate::negotiation::Negotiator;
use crate::reactor::{LoopHandle, LoopMessage, LoopRef, Reactor, Ready};
use crate::registry::{NodeRegistry, NodeSetup};
use chrono::Utc;
use mediacore::{
    BufferSpec, ClientId, Command, Completion, Direction, EventBus, Format, FormatTable, GraphError,
    GraphEvent, LinkId, NodeError, NodeId, ObjectRef, Properties,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

/// Main runtime: owns the graph and drives it from a single data loop
pub struct MediaRuntime {
    config: RuntimeConfig,
    reactor: Reactor,
    graph: Graph,
    registry: Arc<NodeRegistry>,
    formats: FormatTable,
    event_bus: EventBus,
    access: AccessControl,
    portal: Arc<dyn PermissionPortal>,
    monitors: BTreeMap<u32, DeviceMonitor>,
    quit: bool,
}

/// Result of a client request that may need a permission round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed(ObjectRef),
    /// Answered later with `RequestCompleted` or `PermissionDenied`
    Pending { seq: u32 },
}

/// Counters for one `run` of the data loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub wakeups: u64,
    pub dispatched: u64,
    pub elapsed: Duration,
}

impl MediaRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-populated registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let reactor = Reactor::new();
        let event_bus = EventBus::new(config.event_buffer_size);
        let mut graph = Graph::new(reactor.loop_ref(), event_bus.clone());
        graph.set_wave_limit(config.max_wave_activations);

        Self {
            config,
            reactor,
            graph,
            registry,
            formats: FormatTable::standard(),
            event_bus,
            access: AccessControl::default(),
            portal: Arc::new(DenyingPortal),
            monitors: BTreeMap::new(),
            quit: false,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn loop_ref(&self) -> LoopRef {
        self.reactor.loop_ref()
    }

    /// Handle other threads use to wake the data loop
    pub fn handle(&self) -> LoopHandle {
        self.reactor.handle()
    }

    /// Subscribe to graph events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<GraphEvent> {
        self.event_bus.subscribe()
    }

    pub fn set_access_policy(&mut self, policy: Box<dyn AccessPolicy>) {
        self.access = AccessControl::new(policy);
    }

    pub fn set_portal(&mut self, portal: Arc<dyn PermissionPortal>) {
        self.portal = portal;
    }

    /// Parse `"type/subtype"` plus parameters against the runtime's table
    pub fn format(&self, media: &str, params: &BTreeMap<String, mediacore::Value>) -> Result<Format, GraphError> {
        Ok(self.formats.parse(media, params)?)
    }

    /// Create a node through the registry and add it to the graph
    pub fn create_node(&mut self, factory: &str, props: Properties) -> Result<NodeId, GraphError> {
        let id = self.graph.reserve_node_id();
        let created = {
            let setup = NodeSetup {
                id,
                props: &props,
                data_loop: self.graph.data_loop(),
                formats: &self.formats,
            };
            self.registry.create_node(factory, &setup)
        };
        let node = match created {
            Ok(node) => node,
            Err(e) => {
                self.graph.data_loop().remove_owned(id);
                return Err(e);
            }
        };
        self.graph.insert_node(id, node, props)
    }

    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.graph.remove_node(id)
    }

    /// Negotiate and link two ports using the default buffer settings
    pub fn connect(
        &mut self,
        output: NodeId,
        output_port: u32,
        input: NodeId,
        input_port: u32,
        format: &Format,
    ) -> Result<LinkId, GraphError> {
        let spec = BufferSpec {
            count: self.config.default_buffer_count,
            size: self.config.default_buffer_size,
        };
        self.connect_with(output, output_port, input, input_port, format, spec)
    }

    pub fn connect_with(
        &mut self,
        output: NodeId,
        output_port: u32,
        input: NodeId,
        input_port: u32,
        format: &Format,
        buffers: BufferSpec,
    ) -> Result<LinkId, GraphError> {
        let out = self.graph.port_id(output, Direction::Output, output_port)?;
        let inp = self.graph.port_id(input, Direction::Input, input_port)?;
        Negotiator::new(&self.formats).connect(&mut self.graph, out, inp, format, buffers)
    }

    /// Link two ports with the first format both sides can do
    pub fn negotiate(
        &mut self,
        output: NodeId,
        output_port: u32,
        input: NodeId,
        input_port: u32,
    ) -> Result<LinkId, GraphError> {
        let out = self.graph.port_id(output, Direction::Output, output_port)?;
        let inp = self.graph.port_id(input, Direction::Input, input_port)?;
        let negotiator = Negotiator::new(&self.formats);
        let format = negotiator.common_format(&self.graph, out, inp)?;
        let spec = BufferSpec {
            count: self.config.default_buffer_count,
            size: self.config.default_buffer_size,
        };
        negotiator.connect(&mut self.graph, out, inp, &format, spec)
    }

    pub fn start(&mut self, node: NodeId) -> Result<Completion, GraphError> {
        self.graph.send_command(node, Command::Start)
    }

    pub fn pause(&mut self, node: NodeId) -> Result<Completion, GraphError> {
        self.graph.send_command(node, Command::Pause)
    }

    /// Start every node, sinks first
    pub fn start_all(&mut self) -> Result<(), GraphError> {
        let mut nodes = self.graph.node_ids();
        nodes.sort_by_key(|id| {
            self.graph
                .node_info(*id)
                .map(|info| info.n_output_ports)
                .unwrap_or(0)
        });
        for node in nodes {
            self.start(node)?;
        }
        Ok(())
    }

    pub fn pause_all(&mut self) -> Result<(), GraphError> {
        for node in self.graph.node_ids() {
            self.pause(node)?;
        }
        Ok(())
    }

    pub fn add_client(&mut self, info: ClientInfo) -> ClientId {
        self.access.add_client(info)
    }

    /// Disconnect a client; its pending permission requests are cancelled
    pub fn remove_client(&mut self, client: ClientId) {
        let cancelled = self.access.remove_client(client);
        if !cancelled.is_empty() {
            tracing::debug!("Client {} left with {} pending requests", client, cancelled.len());
        }
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    /// Node creation on behalf of a client, subject to the access policy.
    pub fn client_create_node(
        &mut self,
        client: ClientId,
        factory: &str,
        props: Properties,
    ) -> Result<RequestOutcome, GraphError> {
        if self.access.is_busy(client) {
            return Err(NodeError::Busy.into());
        }
        let operation = Operation::CreateNode {
            factory: factory.to_string(),
        };
        match self.access.check(client, &operation)? {
            Decision::Allowed => {
                let seq = self.access.next_seq();
                let node = self.create_owned_node(client, factory, props)?;
                self.complete(client, seq, ObjectRef::Node(node));
                Ok(RequestOutcome::Completed(ObjectRef::Node(node)))
            }
            Decision::Denied => {
                let seq = self.access.next_seq();
                self.deny(client, seq, &operation);
                Err(GraphError::NoPermission)
            }
            Decision::AskPortal => self.ask_portal(client, factory, props),
        }
    }

    /// Link creation on behalf of a client. Both nodes must be visible to it.
    #[allow(clippy::too_many_arguments)]
    pub fn client_create_link(
        &mut self,
        client: ClientId,
        output: NodeId,
        output_port: u32,
        input: NodeId,
        input_port: u32,
        format: &Format,
    ) -> Result<LinkId, GraphError> {
        if self.access.is_busy(client) {
            return Err(NodeError::Busy.into());
        }
        let operation = Operation::CreateLink { output, input };
        let seq = self.access.next_seq();
        let allowed = self.access.check(client, &operation)? == Decision::Allowed
            && self.is_node_visible(client, output)
            && self.is_node_visible(client, input);
        if !allowed {
            self.deny(client, seq, &operation);
            return Err(GraphError::NoPermission);
        }
        let link = self.connect(output, output_port, input, input_port, format)?;
        self.complete(client, seq, ObjectRef::Link(link));
        Ok(link)
    }

    pub fn is_node_visible(&self, client: ClientId, node: NodeId) -> bool {
        self.graph.contains_node(node) && self.access.is_visible(client, self.graph.owner(node))
    }

    /// A link is visible when both of its nodes are
    pub fn is_link_visible(&self, client: ClientId, link: LinkId) -> bool {
        match self.graph.link_nodes(link) {
            Some((output, input)) => self.is_node_visible(client, output) && self.is_node_visible(client, input),
            None => false,
        }
    }

    pub fn visible_nodes(&self, client: ClientId) -> Vec<NodeId> {
        self.graph
            .node_ids()
            .into_iter()
            .filter(|n| self.is_node_visible(client, *n))
            .collect()
    }

    fn create_owned_node(&mut self, client: ClientId, factory: &str, props: Properties) -> Result<NodeId, GraphError> {
        let uid = self.access.client(client).map(|c| c.uid);
        let node = self.create_node(factory, props)?;
        self.graph.set_owner(node, uid)?;
        Ok(node)
    }

    fn ask_portal(&mut self, client: ClientId, factory: &str, props: Properties) -> Result<RequestOutcome, GraphError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| GraphError::Unsupported("permission portal needs a tokio runtime".into()))?;
        let pid = self.access.client(client).and_then(|c| c.pid);
        let request = self.access.begin(client, factory, props);
        tracing::info!("Asking portal for client {} ({})", client, request.handle);

        let portal_request = PortalRequest {
            handle: request.handle.clone(),
            client,
            pid,
            devices: vec!["camera".to_string()],
        };
        let portal = self.portal.clone();
        let loop_handle = self.reactor.handle();
        let cancel = request.cancel.clone();
        let handle = request.handle.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Portal request {} cancelled", handle);
                }
                response = portal.access_device(portal_request) => {
                    let reply = PermissionReply { handle, response };
                    if let Err(e) = loop_handle.send(LoopMessage::Permission(reply)) {
                        tracing::debug!("Portal reply lost: {}", e);
                    }
                }
            }
        });
        Ok(RequestOutcome::Pending { seq: request.seq })
    }

    fn on_permission(&mut self, reply: PermissionReply) {
        let Some(request) = self.access.complete(&reply.handle) else {
            tracing::debug!("Ignoring portal reply for {}", reply.handle);
            return;
        };
        tracing::debug!("Portal answered {:?} for {}", reply.response, reply.handle);
        match reply.response {
            PortalResponse::Granted => {
                match self.create_owned_node(request.client, &request.factory, request.props) {
                    Ok(node) => self.complete(request.client, request.seq, ObjectRef::Node(node)),
                    Err(e) => {
                        tracing::error!("Deferred creation of {} failed: {}", request.factory, e);
                        let operation = Operation::CreateNode {
                            factory: request.factory,
                        };
                        self.event_bus.emit(GraphEvent::RequestFailed {
                            client: request.client,
                            seq: request.seq,
                            operation: operation.to_string(),
                            error: e.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                }
            }
            PortalResponse::Cancelled | PortalResponse::Denied => {
                let operation = Operation::CreateNode {
                    factory: request.factory,
                };
                self.deny(request.client, request.seq, &operation);
            }
        }
    }

    fn complete(&self, client: ClientId, seq: u32, object: ObjectRef) {
        self.event_bus.emit(GraphEvent::RequestCompleted {
            client,
            seq,
            object,
            timestamp: Utc::now(),
        });
    }

    fn deny(&self, client: ClientId, seq: u32, operation: &Operation) {
        tracing::warn!("Denied {} for client {}", operation, client);
        self.event_bus.emit(GraphEvent::PermissionDenied {
            client,
            seq,
            operation: operation.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Attach a device monitor bridge
    pub fn add_device(&mut self, monitor: DeviceMonitor) {
        self.monitors.insert(monitor.device_id(), monitor);
    }

    pub fn device(&self, device: u32) -> Option<&DeviceMonitor> {
        self.monitors.get(&device)
    }

    /// Apply a device monitor event; returns the node it concerned
    pub fn handle_device_event(&mut self, device: u32, event: DeviceEvent) -> Result<Option<NodeId>, GraphError> {
        let action = self
            .monitors
            .get_mut(&device)
            .ok_or_else(|| GraphError::Unsupported(format!("unknown device {}", device)))?
            .apply(event);

        match action {
            MonitorAction::Create {
                object_id,
                factory,
                props,
            } => {
                let node = self.create_node(&factory, props)?;
                if let Some(monitor) = self.monitors.get_mut(&device) {
                    monitor.bind(object_id, node);
                }
                Ok(Some(node))
            }
            MonitorAction::Update { node, props } => {
                self.graph.update_props(node, props)?;
                Ok(Some(node))
            }
            MonitorAction::Remove { node } => {
                self.graph.remove_node(node)?;
                Ok(Some(node))
            }
            MonitorAction::Ignore => Ok(None),
        }
    }

    /// Ask the loop to stop after the current dispatch
    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Run the data loop until quit is requested, by a callback, a
    /// `LoopHandle` or [`MediaRuntime::quit`].
    pub async fn run(&mut self) -> RunStats {
        let start = tokio::time::Instant::now();
        let mut stats = RunStats::default();
        self.quit = false;
        tracing::info!("Data loop running with {} nodes", self.graph.n_nodes());

        self.flush();
        while !self.quit {
            stats.dispatched += self.turn().await;
            stats.wakeups += 1;
        }

        stats.elapsed = start.elapsed();
        tracing::info!(
            "Data loop stopped after {} wakeups in {:?}",
            stats.wakeups,
            stats.elapsed
        );
        stats
    }

    /// One wait on the reactor plus dispatch of everything it returned.
    /// Returns the number of entries dispatched.
    pub async fn turn(&mut self) -> u64 {
        let ready = self.reactor.wait().await;
        let mut dispatched = 0;
        for entry in ready {
            if self.quit {
                break;
            }
            dispatched += 1;
            match entry {
                Ready::Source {
                    id,
                    owner: Some(node),
                    count,
                    ..
                } => {
                    if let Err(e) = self.graph.source_ready(node, id, count) {
                        match e {
                            GraphError::NodeNotFound(_) => tracing::trace!("{} fired for removed {}", id, node),
                            e => tracing::warn!("{} failed handling {}: {}", node, id, e),
                        }
                    }
                }
                Ready::Source { id, owner: None, .. } => tracing::trace!("Unowned {} ready", id),
                Ready::Message(LoopMessage::Permission(reply)) => self.on_permission(reply),
                Ready::Message(LoopMessage::Device { device, event }) => {
                    if let Err(e) = self.handle_device_event(device, event) {
                        tracing::warn!("Device {} event failed: {}", device, e);
                    }
                }
                Ready::Message(LoopMessage::Quit) => self.quit = true,
                Ready::Message(LoopMessage::Signal(id)) => tracing::trace!("Late wakeup for {}", id),
            }
            self.flush();
        }
        dispatched
    }

    fn flush(&mut self) {
        match self.graph.dispatch_notifications() {
            Ok(ControlFlow::Break(())) => {
                tracing::debug!("Callback requested stop");
                self.quit = true;
            }
            Ok(ControlFlow::Continue(())) => {}
            // already reported as BranchFailed
            Err(e) => tracing::debug!("Dispatch finished with error: {}", e),
        }
    }
}

impl Default for MediaRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    /// Buffers allocated per link when none are requested explicitly
    pub default_buffer_count: usize,
    pub default_buffer_size: usize,
    pub max_wave_activations: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            default_buffer_count: 1,
            default_buffer_size: 4096,
            max_wave_activations: crate::graph::DEFAULT_WAVE_LIMIT,
        }
    }
}
