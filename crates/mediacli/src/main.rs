use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mediacore::{
    FormatSpec, GraphEvent, GraphSpec, NodeEventKind, NodeId, NodeSpec, Properties, RunMode, Value,
};
use mediaruntime::{drive, load, validate, DriveReport, LoadedGraph, MediaRuntime, NodeRegistry, RuntimeConfig};
use medianodes::{FAKESINK, FAKESRC, VOLUME};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mediad")]
#[command(about = "Media graph engine", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a source → sink pair and report the cycle rate
    Bench {
        #[arg(short, long, value_enum, default_value = "sync-push")]
        mode: Mode,

        #[arg(short, long, default_value_t = 100_000)]
        iterations: u64,

        /// Buffers allocated on the link
        #[arg(short, long, default_value_t = 1)]
        buffers: usize,
    },

    /// Build and run a graph description
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Override the mode from the description
        #[arg(short, long, value_enum)]
        mode: Option<Mode>,

        /// Override the iteration count from the description
        #[arg(short, long)]
        iterations: Option<u64>,
    },

    /// Validate a graph description
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// List available node factories
    Nodes,

    /// Write an example graph description
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    SyncPush,
    SyncPull,
    AsyncPush,
    AsyncPull,
    Direct,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::SyncPush => RunMode::SyncPush,
            Mode::SyncPull => RunMode::SyncPull,
            Mode::AsyncPush => RunMode::AsyncPush,
            Mode::AsyncPull => RunMode::AsyncPull,
            Mode::Direct => RunMode::Direct,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Bench {
            mode,
            iterations,
            buffers,
        } => {
            bench(mode.into(), iterations, buffers).await?;
        }

        Commands::Run {
            file,
            mode,
            iterations,
        } => {
            run_graph(file, mode.map(RunMode::from), iterations).await?;
        }

        Commands::Validate { file } => {
            validate_graph(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_graph(output)?;
        }
    }

    Ok(())
}

fn create_registry() -> Arc<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    medianodes::register_all(&mut registry);
    Arc::new(registry)
}

fn read_spec(file: &PathBuf) -> Result<GraphSpec> {
    let json = std::fs::read_to_string(file)?;
    Ok(serde_json::from_str(&json)?)
}

async fn bench(mode: RunMode, iterations: u64, buffers: usize) -> Result<()> {
    let config = RuntimeConfig {
        default_buffer_count: buffers,
        ..Default::default()
    };
    let mut runtime = MediaRuntime::with_registry(create_registry(), config);

    let mut src_props = Properties::new();
    let mut sink_props = Properties::new();
    match mode {
        RunMode::AsyncPush => {
            src_props.insert("node.async".into(), Value::from(true));
            src_props.insert("node.live".into(), Value::from(true));
        }
        RunMode::AsyncPull => {
            src_props.insert("node.async".into(), Value::from(true));
            sink_props.insert("node.async".into(), Value::from(true));
        }
        _ => {}
    }
    let src = runtime.create_node(FAKESRC, src_props)?;
    let sink = runtime.create_node(FAKESINK, sink_props)?;
    runtime.negotiate(src, 0, sink, 0)?;

    let report = drive(&mut runtime, src, sink, mode, iterations).await?;
    print_report(&report);
    Ok(())
}

async fn run_graph(file: PathBuf, mode: Option<RunMode>, iterations: Option<u64>) -> Result<()> {
    println!("🚀 Loading graph from: {}", file.display());
    let spec = read_spec(&file)?;
    let mode = mode.unwrap_or(spec.settings.mode);
    let iterations = iterations.unwrap_or(spec.settings.iterations);

    let mut runtime = MediaRuntime::with_registry(create_registry(), RuntimeConfig::default());
    let mut events = runtime.subscribe_events();

    let loaded = load(&mut runtime, &spec)?;
    println!("📋 Graph: {}", spec.name);
    println!("   Nodes: {}", loaded.nodes.len());
    println!("   Links: {}", loaded.links.len());
    println!();

    let (source, sink) = endpoints(&runtime, &spec, &loaded, mode)?;
    let report = drive(&mut runtime, source, sink, mode, iterations).await?;

    let mut underruns = 0;
    loop {
        match events.try_recv() {
            Ok(GraphEvent::BranchFailed { node_id, error, .. }) => {
                println!("  ❌ {} failed: {}", node_id, error);
            }
            Ok(GraphEvent::NodeEvent { event: NodeEventKind::Underrun { .. }, .. }) => underruns += 1,
            Ok(GraphEvent::NodeEvent { node_id, event, .. }) => {
                println!("     ℹ️  [{}] {:?}", node_id, event);
            }
            Ok(_) => {}
            Err(TryRecvError::Lagged(n)) => tracing::debug!("Skipped {} events", n),
            Err(_) => break,
        }
    }

    print_report(&report);
    if underruns > 0 {
        println!("   Underruns: {}", underruns);
    }
    Ok(())
}

/// Pick the node that starts each cycle and the one that ends it
fn endpoints(
    runtime: &MediaRuntime,
    spec: &GraphSpec,
    loaded: &LoadedGraph,
    mode: RunMode,
) -> Result<(NodeId, NodeId)> {
    let graph = runtime.graph();
    let ordered: Vec<NodeId> = spec.nodes.iter().filter_map(|n| loaded.node(&n.name)).collect();
    let first = |pred: &dyn Fn(NodeId) -> bool| ordered.iter().copied().find(|id| pred(*id));

    let mut source = first(&|id| graph.node_info(id).map(|i| i.n_input_ports == 0).unwrap_or(false))
        .ok_or_else(|| anyhow!("graph has no source node"))?;
    let mut sink = first(&|id| graph.node_info(id).map(|i| i.n_output_ports == 0).unwrap_or(false))
        .ok_or_else(|| anyhow!("graph has no sink node"))?;

    if let Some(driver) = &spec.settings.driver {
        let id = loaded
            .node(driver)
            .ok_or_else(|| anyhow!("driver '{}' is not a node", driver))?;
        match mode {
            RunMode::SyncPull | RunMode::AsyncPull => sink = id,
            _ => source = id,
        }
    }
    Ok((source, sink))
}

fn print_report(report: &DriveReport) {
    let per_cycle = if report.cycles > 0 {
        report.elapsed.as_nanos() / report.cycles as u128
    } else {
        0
    };
    println!("📊 {:?}: {} cycles in {:?}", report.mode, report.cycles, report.elapsed);
    println!("   {} ns per cycle", per_cycle);
    println!("   Buffers reused: {}", report.reused);
}

fn validate_graph(file: PathBuf) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());

    let spec = read_spec(&file)?;
    let registry = create_registry();
    let formats = mediacore::FormatTable::standard();
    let issues = validate(&spec, &registry, &formats);

    if !issues.is_empty() {
        for issue in &issues {
            println!("  ❌ {}", issue);
        }
        return Err(anyhow!("{} problems in {}", issues.len(), file.display()));
    }

    println!("✅ Graph is valid:");
    println!("   Name: {}", spec.name);
    println!("   Nodes: {}", spec.nodes.len());
    println!("   Links: {}", spec.links.len());
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Factories:");
    println!();

    let registry = create_registry();
    for name in registry.list_factories() {
        if let Some(metadata) = registry.get_metadata(&name) {
            println!("  • {} ({})", name, metadata.category);
            println!("    {}", metadata.description);
            for port in &metadata.inputs {
                println!("    ← {} [{}]", port.name, port.media);
            }
            for port in &metadata.outputs {
                println!("    → {} [{}]", port.name, port.media);
            }
        } else {
            println!("  • {}", name);
        }
    }
}

fn create_example_graph(output: PathBuf) -> Result<()> {
    let mut spec = GraphSpec::new("Volume chain");
    spec.description = Some("Sequence source through a volume filter into a sink".to_string());

    let audio = FormatSpec::new("audio/raw")
        .with_param("format", "F32LE")
        .with_param("rate", 48000i64)
        .with_param("channels", 2i64);

    let src = spec.add_node(NodeSpec::new("source", FAKESRC));
    let gain = spec.add_node(NodeSpec::new("gain", VOLUME).with_prop("volume", 0.5));
    let sink = spec.add_node(NodeSpec::new("sink", FAKESINK));
    spec.connect(src, 0, gain.clone(), 0, audio.clone());
    spec.connect(gain, 0, sink, 0, audio);

    let json = serde_json::to_string_pretty(&spec)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  mediad run --file {}", output.display());
    Ok(())
}
