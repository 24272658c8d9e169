mod common;

use common::{add, binary, connect, init_tracing, ActivationLog, Call, TestNode};
use mediacore::{
    BufferPool, BufferSpec, Command, Completion, Direction, FormatTable, GraphError, GraphEvent,
    NodeError,
};
use mediaruntime::{MediaRuntime, RunState};
use std::ops::ControlFlow;
use std::rc::Rc;

fn audio(table: &FormatTable) -> mediacore::Format {
    table
        .format("audio", "raw")
        .unwrap()
        .with_param("format", "F32LE")
        .with_param("rate", 48000i64)
        .with_param("channels", 2i64)
}

const ONE_BUFFER: BufferSpec = BufferSpec { count: 1, size: 64 };

#[test]
fn test_cycle_is_rejected_and_graph_unchanged() {
    init_tracing();
    let mut runtime = MediaRuntime::new();
    let format = binary(runtime.formats());
    let (a, _) = add(runtime.graph_mut(), TestNode::filter());
    let (b, _) = add(runtime.graph_mut(), TestNode::filter());
    connect(&mut runtime, a, 0, b, 0);

    let result = runtime.connect_with(b, 0, a, 0, &format, ONE_BUFFER);

    assert_eq!(result, Err(GraphError::CyclicLink { from: b, to: a }));
    assert_eq!(runtime.graph().n_links(), 1);
    for (node, direction) in [(b, Direction::Output), (a, Direction::Input)] {
        let port = runtime.graph().port_id(node, direction, 0).unwrap();
        let port = runtime.graph().port(port).unwrap();
        assert!(port.format().is_none(), "Rejected link should not leave a format behind");
        assert!(port.link().is_none());
    }
}

#[test]
fn test_failed_allocation_restores_earlier_formats() {
    let table = FormatTable::standard();
    let mut runtime = MediaRuntime::new();
    let (src, _) = add(runtime.graph_mut(), TestNode::source());
    let (sink, _) = add(runtime.graph_mut(), TestNode::sink());
    let out = runtime.graph().port_id(src, Direction::Output, 0).unwrap();
    let inp = runtime.graph().port_id(sink, Direction::Input, 0).unwrap();
    runtime
        .graph_mut()
        .set_format(out, Some(audio(&table)), &table)
        .unwrap();

    let no_buffers = BufferSpec { count: 0, size: 64 };
    let result = runtime.connect_with(src, 0, sink, 0, &binary(&table), no_buffers);

    assert_eq!(result, Err(GraphError::Node(NodeError::NoBuffers)));
    assert_eq!(runtime.graph().n_links(), 0);
    let out = runtime.graph().port(out).unwrap();
    assert!(
        out.format().is_some_and(|f| f.matches(&audio(&table))),
        "Output should get its earlier format back"
    );
    assert!(out.link().is_none());
    assert!(runtime.graph().port(inp).unwrap().format().is_none());
}

#[test]
fn test_self_link_is_a_cycle() {
    let mut runtime = MediaRuntime::new();
    let format = binary(runtime.formats());
    let (node, _) = add(runtime.graph_mut(), TestNode::filter());

    let result = runtime.connect_with(node, 0, node, 0, &format, ONE_BUFFER);

    assert_eq!(result, Err(GraphError::CyclicLink { from: node, to: node }));
    assert_eq!(runtime.graph().n_links(), 0);
}

#[test]
fn test_link_requires_matching_formats() {
    let table = FormatTable::standard();
    let mut runtime = MediaRuntime::new();
    let (src, _) = add(runtime.graph_mut(), TestNode::source());
    let (sink, _) = add(runtime.graph_mut(), TestNode::sink());
    let graph = runtime.graph_mut();
    let out = graph.port_id(src, Direction::Output, 0).unwrap();
    let inp = graph.port_id(sink, Direction::Input, 0).unwrap();

    graph.set_format(out, Some(binary(&table)), &table).unwrap();
    assert_eq!(graph.link(out, inp), Err(GraphError::Node(NodeError::NoFormat)));

    graph.set_format(inp, Some(audio(&table)), &table).unwrap();
    assert_eq!(
        graph.link(out, inp),
        Err(GraphError::FormatMismatch { output: out, input: inp })
    );

    graph.set_format(inp, Some(binary(&table)), &table).unwrap();
    assert!(graph.link(out, inp).is_ok());
    assert_eq!(graph.link(out, inp), Err(GraphError::AlreadyLinked(out)));
    assert_eq!(
        graph.link(inp, out),
        Err(GraphError::DirectionMismatch {
            port: inp,
            expected: Direction::Output
        })
    );
}

#[test]
fn test_buffers_before_format_are_refused() {
    let mut runtime = MediaRuntime::new();
    let (src, _) = add(runtime.graph_mut(), TestNode::source());
    let graph = runtime.graph_mut();
    let port = graph.port_id(src, Direction::Output, 0).unwrap();

    let result = graph.use_buffers(port, Some(Rc::new(BufferPool::with_buffers(1, 64))));

    assert_eq!(result, Err(GraphError::Node(NodeError::NoFormat)));
    let port = graph.port(port).unwrap();
    assert!(port.format().is_none());
    assert!(port.buffers().is_none(), "Port should be left untouched");
    assert_eq!(graph.node_state(src), Some(RunState::Created));
}

#[test]
fn test_unknown_format_is_refused() {
    let table = FormatTable::standard();
    let mut runtime = MediaRuntime::new();
    let (src, _) = add(runtime.graph_mut(), TestNode::source());
    let graph = runtime.graph_mut();
    let port = graph.port_id(src, Direction::Output, 0).unwrap();

    // audio/raw without its required properties
    let incomplete = table.format("audio", "raw").unwrap();
    assert!(graph.set_format(port, Some(incomplete), &table).is_err());
    assert!(graph.port(port).unwrap().format().is_none());
}

#[test]
fn test_format_is_frozen_while_running() {
    let table = FormatTable::standard();
    let mut runtime = MediaRuntime::new();
    let (src, _) = add(runtime.graph_mut(), TestNode::source());
    let (sink, _) = add(runtime.graph_mut(), TestNode::sink());
    connect(&mut runtime, src, 0, sink, 0);
    runtime.start_all().unwrap();

    let graph = runtime.graph_mut();
    let port = graph.port_id(src, Direction::Output, 0).unwrap();

    assert_eq!(graph.set_format(port, None, &table), Err(GraphError::NodeRunning(src)));
    assert_eq!(graph.use_buffers(port, None), Err(GraphError::NodeRunning(src)));
}

#[test]
fn test_nodes_become_configured_when_every_port_is_ready() {
    let mut runtime = MediaRuntime::new();
    let (src, _) = add(runtime.graph_mut(), TestNode::source());
    let (sink, _) = add(runtime.graph_mut(), TestNode::sink());
    assert_eq!(runtime.graph().node_state(src), Some(RunState::Created));

    let link = connect(&mut runtime, src, 0, sink, 0);
    assert!(runtime.graph().is_link_ready(link));
    assert_eq!(runtime.graph().node_state(src), Some(RunState::Configured));
    assert_eq!(runtime.graph().node_state(sink), Some(RunState::Configured));

    runtime.graph_mut().unlink(link).unwrap();
    assert_eq!(runtime.graph().node_state(src), Some(RunState::Created));
    assert_eq!(runtime.graph().n_links(), 0);
}

#[test]
fn test_removing_linked_node_removes_its_links() {
    init_tracing();
    let log = ActivationLog::default();
    let mut runtime = MediaRuntime::new();
    let mut events = runtime.subscribe_events();
    let (src, src_probe) = add(runtime.graph_mut(), TestNode::source().with_log(&log));
    let (filter, _) = add(runtime.graph_mut(), TestNode::filter().with_log(&log));
    let (sink, sink_probe) = add(runtime.graph_mut(), TestNode::sink().with_log(&log));
    connect(&mut runtime, src, 0, filter, 0);
    connect(&mut runtime, filter, 0, sink, 0);
    runtime.start_all().unwrap();

    for _ in 0..3 {
        runtime.graph_mut().push(src).unwrap();
    }
    assert_eq!(sink_probe.consumed.get(), 3);

    runtime.remove_node(filter).unwrap();
    assert!(!runtime.graph().contains_node(filter));
    assert_eq!(runtime.graph().n_links(), 0);
    assert!(runtime.graph().links_of(src).is_empty());

    log.borrow_mut().clear();
    for _ in 0..3 {
        runtime.graph_mut().push(src).unwrap();
    }
    assert!(
        log.borrow().iter().all(|(node, _)| *node != filter),
        "Removed node should never be scheduled again"
    );
    assert_eq!(src_probe.produced.get(), 3);
    assert_eq!(runtime.graph().node_state(src), Some(RunState::Running));

    let mut removed_links = 0;
    let mut removed_node = None;
    while let Ok(event) = events.try_recv() {
        match event {
            GraphEvent::LinkRemoved { .. } => removed_links += 1,
            GraphEvent::NodeRemoved { node_id, .. } => removed_node = Some(node_id),
            _ => {}
        }
    }
    assert_eq!(removed_links, 2);
    assert_eq!(removed_node, Some(filter));
}

#[test]
fn test_removed_node_notifications_are_dropped() {
    let mut runtime = MediaRuntime::new();
    let (src, src_probe) = add(runtime.graph_mut(), TestNode::source().async_output());
    let (sink, sink_probe) = add(runtime.graph_mut(), TestNode::sink());
    connect(&mut runtime, src, 0, sink, 0);
    runtime.start_all().unwrap();
    runtime.graph_mut().push(src).unwrap();

    src_probe.complete_output();
    assert_eq!(runtime.graph().pending_notifications(), 1);
    runtime.remove_node(src).unwrap();

    assert_eq!(runtime.graph().pending_notifications(), 0);
    assert_eq!(runtime.graph_mut().dispatch_notifications(), Ok(ControlFlow::Continue(())));
    assert_eq!(sink_probe.consumed.get(), 0);
}

#[test]
fn test_start_requires_configured_ports() {
    let mut runtime = MediaRuntime::new();
    let (src, src_probe) = add(runtime.graph_mut(), TestNode::source());

    assert!(matches!(
        runtime.start(src),
        Err(GraphError::Node(NodeError::InvalidState(_)))
    ));
    assert!(src_probe.commands.borrow().is_empty(), "Node should not see the command");

    // pausing a node that is not running is a no-op
    assert_eq!(runtime.pause(src), Ok(Completion::Done));
    assert!(src_probe.commands.borrow().is_empty());
}

#[test]
fn test_async_command_applies_on_completion() {
    let mut runtime = MediaRuntime::new();
    let (src, src_probe) = add(runtime.graph_mut(), TestNode::source().async_commands());
    let (sink, _) = add(runtime.graph_mut(), TestNode::sink());
    connect(&mut runtime, src, 0, sink, 0);

    assert_eq!(runtime.start(src), Ok(Completion::Async(1)));
    assert_eq!(runtime.graph().node_state(src), Some(RunState::Configured));

    src_probe.complete_command(Ok(()));
    assert_eq!(runtime.graph_mut().dispatch_notifications(), Ok(ControlFlow::Continue(())));
    assert_eq!(runtime.graph().node_state(src), Some(RunState::Running));

    assert_eq!(runtime.pause(src), Ok(Completion::Async(2)));
    src_probe.complete_command(Err(NodeError::Busy));
    assert_eq!(runtime.graph_mut().dispatch_notifications(), Ok(ControlFlow::Continue(())));
    assert_eq!(
        runtime.graph().node_state(src),
        Some(RunState::Running),
        "A failed command leaves the state alone"
    );
    assert_eq!(*src_probe.commands.borrow(), vec![Command::Start, Command::Pause]);
}

#[test]
fn test_stale_buffer_return_is_ignored() {
    let mut runtime = MediaRuntime::new();
    let (src, src_probe) = add(runtime.graph_mut(), TestNode::source());
    let (sink, sink_probe) = add(runtime.graph_mut(), TestNode::sink());
    let link = connect(&mut runtime, src, 0, sink, 0);

    let port = runtime.graph().port_id(sink, Direction::Input, 0).unwrap();
    let old_tag = runtime.graph().port(port).unwrap().buffers().unwrap().tag(0);

    runtime.graph_mut().unlink(link).unwrap();
    connect(&mut runtime, src, 0, sink, 0);

    sink_probe.reuse(0, old_tag);
    assert_eq!(runtime.graph_mut().dispatch_notifications(), Ok(ControlFlow::Continue(())));
    assert_eq!(src_probe.reused.get(), 0, "Buffer from the old pool should not come back");
}

#[test]
fn test_pause_stops_scheduling() {
    let log = ActivationLog::default();
    let mut runtime = MediaRuntime::new();
    let (src, _) = add(runtime.graph_mut(), TestNode::source().with_log(&log));
    let (sink, _) = add(runtime.graph_mut(), TestNode::sink().with_log(&log));
    connect(&mut runtime, src, 0, sink, 0);
    runtime.start_all().unwrap();
    runtime.graph_mut().push(src).unwrap();
    assert_eq!(*log.borrow(), vec![(src, Call::Output), (sink, Call::Input)]);

    runtime.pause_all().unwrap();
    log.borrow_mut().clear();
    let report = runtime.graph_mut().push(src).unwrap();

    assert!(log.borrow().is_empty());
    assert_eq!(report.skipped, 1);
    assert_eq!(runtime.graph().node_state(src), Some(RunState::Paused));
}
