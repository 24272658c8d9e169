//! Drive a producer → consumer pair for a number of cycles.
//!
//! The synchronous modes call into the graph directly; the asynchronous
//! modes hand control to the data loop and count readiness callbacks until
//! the requested number of cycles has completed.

use crate::runtime::MediaRuntime;
use mediacore::{BufferId, GraphError, MediaError, NodeCallbacks, NodeId, RunMode};
use std::cell::Cell;
use std::ops::ControlFlow;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveReport {
    pub mode: RunMode,
    pub cycles: u64,
    /// Buffers the consumer handed back
    pub reused: u64,
    pub elapsed: Duration,
}

/// Counts one kind of readiness callback and stops the loop at a limit
struct CycleCounter {
    remaining: Rc<Cell<u64>>,
    reused: Rc<Cell<u64>>,
}

impl CycleCounter {
    fn tick(&mut self) -> ControlFlow<()> {
        let left = self.remaining.get().saturating_sub(1);
        self.remaining.set(left);
        if left == 0 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

struct SourceCounter(CycleCounter);

impl NodeCallbacks for SourceCounter {
    fn on_have_output(&mut self) -> ControlFlow<()> {
        self.0.tick()
    }
}

struct SinkCounter(CycleCounter);

impl NodeCallbacks for SinkCounter {
    fn on_need_input(&mut self) -> ControlFlow<()> {
        self.0.tick()
    }

    fn on_reuse_buffer(&mut self, _port: u32, _buffer: BufferId) {
        self.0.reused.set(self.0.reused.get() + 1);
    }
}

struct ReuseCounter(Rc<Cell<u64>>);

impl NodeCallbacks for ReuseCounter {
    fn on_reuse_buffer(&mut self, _port: u32, _buffer: BufferId) {
        self.0.set(self.0.get() + 1);
    }
}

/// Start every node and run `cycles` cycles from `source` to `sink`.
///
/// Installs callbacks on the node that paces the run (the sink for pull
/// modes, the source for async push), so neither may have callbacks yet.
pub async fn drive(
    runtime: &mut MediaRuntime,
    source: NodeId,
    sink: NodeId,
    mode: RunMode,
    cycles: u64,
) -> Result<DriveReport, MediaError> {
    let graph = runtime.graph();
    let source_info = graph.node_info(source).ok_or(GraphError::NodeNotFound(source))?;
    let sink_info = graph.node_info(sink).ok_or(GraphError::NodeNotFound(sink))?;
    match mode {
        RunMode::AsyncPush if !source_info.flags.async_output => {
            return Err(GraphError::Unsupported("async-push needs an async source".into()).into())
        }
        RunMode::AsyncPull if !sink_info.flags.async_input => {
            return Err(GraphError::Unsupported("async-pull needs an async sink".into()).into())
        }
        _ => {}
    }

    let remaining = Rc::new(Cell::new(cycles));
    let reused = Rc::new(Cell::new(0));
    let counter = CycleCounter {
        remaining: remaining.clone(),
        reused: reused.clone(),
    };
    match mode {
        RunMode::AsyncPush => {
            runtime
                .graph_mut()
                .set_callbacks(source, Box::new(SourceCounter(counter)))?;
            runtime
                .graph_mut()
                .set_callbacks(sink, Box::new(ReuseCounter(reused.clone())))?;
        }
        RunMode::AsyncPull => {
            runtime
                .graph_mut()
                .set_callbacks(sink, Box::new(SinkCounter(counter)))?;
        }
        _ => {
            runtime
                .graph_mut()
                .set_callbacks(sink, Box::new(ReuseCounter(reused.clone())))?;
        }
    }

    tracing::info!("Driving {} cycles in {:?} mode", cycles, mode);
    runtime.start_all()?;
    let start = tokio::time::Instant::now();

    let mut done = 0;
    match mode {
        RunMode::SyncPush => {
            for _ in 0..cycles {
                runtime.graph_mut().push(source)?;
                done += 1;
            }
        }
        RunMode::SyncPull => {
            for _ in 0..cycles {
                runtime.graph_mut().pull(sink)?;
                done += 1;
            }
        }
        RunMode::Direct => {
            for _ in 0..cycles {
                runtime.graph_mut().process_direct(source, sink)?;
                done += 1;
            }
        }
        RunMode::AsyncPush | RunMode::AsyncPull => {
            if cycles > 0 {
                runtime.run().await;
            }
            done = cycles - remaining.get();
        }
    }

    let elapsed = start.elapsed();
    runtime.pause_all()?;
    let report = DriveReport {
        mode,
        cycles: done,
        reused: reused.get(),
        elapsed,
    };
    tracing::info!(
        "{} cycles in {:?} ({} buffers reused)",
        report.cycles,
        report.elapsed,
        report.reused
    );
    Ok(report)
}
