//! Breadth-first propagation of processing through the graph.
//!
//! A wave starts from one or more scheduled activations and runs until the
//! queue is empty. Push activations (`Output`) ask a node to produce and
//! move downstream when it does; pull activations (`Input`) ask a node to
//! consume and walk upstream when it is starved. Each (node, action) pair
//! runs at most once per readiness signal: a pair becomes eligible again
//! only when a buffer is published towards it or its input was drained.

use crate::graph::{Graph, RunState};
use mediacore::{GraphError, IoStatus, NodeError, NodeId, Status};
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Action {
    Output,
    Input,
}

/// Outcome of one propagation wave
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveReport {
    /// Processing calls issued
    pub activations: usize,
    /// Buffers published by producers
    pub produced: usize,
    /// Successful `process_input` calls
    pub consumed: usize,
    /// Activations skipped (node not running, async operation in flight,
    /// output slot still full)
    pub skipped: usize,
    /// Nodes whose branch stopped with an error, in the order they failed
    pub errors: Vec<(NodeId, NodeError)>,
    /// The wave hit the activation limit and was cut short
    pub truncated: bool,
}

impl WaveReport {
    pub fn into_result(self) -> Result<WaveReport, GraphError> {
        match self.errors.first() {
            Some((node, error)) => Err(GraphError::Branch {
                node: *node,
                error: error.clone(),
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queue: VecDeque<(NodeId, Action)>,
    queued: HashSet<(NodeId, Action)>,
    visited: HashSet<(NodeId, Action)>,
}

impl Scheduler {
    /// Queue an activation from outside a wave.
    pub(crate) fn schedule(&mut self, node: NodeId, action: Action) {
        self.refresh(node, action);
    }

    fn enqueue(&mut self, node: NodeId, action: Action) {
        if self.visited.contains(&(node, action)) || !self.queued.insert((node, action)) {
            return;
        }
        self.queue.push_back((node, action));
    }

    /// Make a pair eligible again after new data reached it.
    fn refresh(&mut self, node: NodeId, action: Action) {
        self.visited.remove(&(node, action));
        self.enqueue(node, action);
    }

    pub(crate) fn run(&mut self, graph: &mut Graph, limit: usize, report: &mut WaveReport) {
        while let Some((node, action)) = self.queue.pop_front() {
            self.queued.remove(&(node, action));
            if report.activations >= limit {
                tracing::error!("Wave exceeded {} activations, dropping {} queued", limit, self.queue.len() + 1);
                report.truncated = true;
                self.queue.clear();
                self.queued.clear();
                break;
            }
            self.visited.insert((node, action));
            match action {
                Action::Output => self.output(graph, node, report),
                Action::Input => self.input(graph, node, report),
            }
        }
        self.visited.clear();
    }

    fn output(&mut self, graph: &mut Graph, node: NodeId, report: &mut WaveReport) {
        let Some(entry) = graph.nodes.get(&node) else {
            tracing::trace!("{} is gone, skipping output", node);
            return;
        };
        if entry.state != RunState::Running {
            report.skipped += 1;
            return;
        }
        let is_async = entry.info.flags.async_output;
        if is_async && entry.pending_output {
            tracing::trace!("{} still has output in flight", node);
            report.skipped += 1;
            return;
        }
        let (inputs, outputs) = (entry.inputs.clone(), entry.outputs.clone());

        let full: Vec<NodeId> = graph
            .peers(&outputs)
            .into_iter()
            .filter(|p| p.status == IoStatus::HaveBuffer)
            .map(|p| p.node)
            .collect();
        if !full.is_empty() {
            // previous buffer not consumed yet
            for peer in full {
                self.enqueue(peer, Action::Input);
            }
            report.skipped += 1;
            return;
        }

        let Some(entry) = graph.nodes.get_mut(&node) else {
            return;
        };
        report.activations += 1;
        match entry.node.process_output() {
            Ok(Status::NeedBuffer) => {
                if is_async {
                    entry.pending_output = true;
                } else {
                    for peer in graph.peers(&inputs) {
                        match peer.status {
                            IoStatus::HaveBuffer => self.enqueue(node, Action::Input),
                            _ => self.enqueue(peer.node, Action::Output),
                        }
                    }
                }
            }
            Ok(status) => {
                if status == Status::Ok {
                    report.produced += 1;
                }
                for peer in graph.peers(&outputs) {
                    if peer.status == IoStatus::HaveBuffer {
                        self.refresh(peer.node, Action::Input);
                    }
                }
            }
            Err(e) => report.errors.push((node, e)),
        }
    }

    fn input(&mut self, graph: &mut Graph, node: NodeId, report: &mut WaveReport) {
        let Some(entry) = graph.nodes.get_mut(&node) else {
            tracing::trace!("{} is gone, skipping input", node);
            return;
        };
        if entry.state != RunState::Running {
            report.skipped += 1;
            return;
        }
        let is_async = entry.info.flags.async_input;
        if is_async && entry.pending_input {
            tracing::trace!("{} still has input in flight", node);
            report.skipped += 1;
            return;
        }
        let inputs = entry.inputs.clone();
        let has_outputs = !entry.outputs.is_empty();

        report.activations += 1;
        match entry.node.process_input() {
            Ok(Status::HaveBuffer) => {
                // starved: ask upstream for the buffers still owed
                for peer in graph.peers(&inputs) {
                    if peer.status != IoStatus::HaveBuffer {
                        self.enqueue(peer.node, Action::Output);
                    }
                }
            }
            Ok(_) => {
                report.consumed += 1;
                if is_async {
                    entry.pending_input = true;
                }
                if has_outputs {
                    self.refresh(node, Action::Output);
                }
            }
            Err(e) => report.errors.push((node, e)),
        }
    }
}
