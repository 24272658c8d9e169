//! Build a graph from a [`GraphSpec`] description.

use crate::registry::NodeRegistry;
use crate::runtime::MediaRuntime;
use mediacore::{BufferSpec, Direction, FormatTable, GraphError, GraphSpec, LinkId, NodeId};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    DuplicateNode(String),
    UnknownFactory { node: String, factory: String },
    UnknownNode { link: usize, node: String },
    PortReused { node: String, direction: Direction, port: u32 },
    InvalidFormat { link: usize, reason: String },
    Cycle,
    UnknownDriver(String),
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::DuplicateNode(name) => write!(f, "node '{}' is declared twice", name),
            ValidationIssue::UnknownFactory { node, factory } => {
                write!(f, "node '{}' uses unknown factory '{}'", node, factory)
            }
            ValidationIssue::UnknownNode { link, node } => {
                write!(f, "link {} refers to unknown node '{}'", link, node)
            }
            ValidationIssue::PortReused { node, direction, port } => {
                write!(f, "{} port {} of '{}' is linked more than once", direction, port, node)
            }
            ValidationIssue::InvalidFormat { link, reason } => write!(f, "link {}: {}", link, reason),
            ValidationIssue::Cycle => write!(f, "links form a cycle"),
            ValidationIssue::UnknownDriver(name) => write!(f, "driver '{}' is not a node", name),
        }
    }
}

/// Check a description without instantiating anything.
pub fn validate(spec: &GraphSpec, registry: &NodeRegistry, formats: &FormatTable) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut graph = DiGraph::<&str, ()>::new();
    let mut index = HashMap::new();
    for node in &spec.nodes {
        if index.contains_key(node.name.as_str()) {
            issues.push(ValidationIssue::DuplicateNode(node.name.clone()));
            continue;
        }
        if !registry.contains(&node.factory) {
            issues.push(ValidationIssue::UnknownFactory {
                node: node.name.clone(),
                factory: node.factory.clone(),
            });
        }
        index.insert(node.name.as_str(), graph.add_node(node.name.as_str()));
    }

    let mut used = HashSet::new();
    for (i, link) in spec.links.iter().enumerate() {
        let ends = [
            (&link.output, Direction::Output),
            (&link.input, Direction::Input),
        ];
        let mut resolved = Vec::with_capacity(2);
        for (port, direction) in ends {
            match index.get(port.node.as_str()) {
                Some(idx) => resolved.push(*idx),
                None => issues.push(ValidationIssue::UnknownNode {
                    link: i,
                    node: port.node.clone(),
                }),
            }
            if !used.insert((port.node.as_str(), direction, port.port)) {
                issues.push(ValidationIssue::PortReused {
                    node: port.node.clone(),
                    direction,
                    port: port.port,
                });
            }
        }
        if let [from, to] = resolved[..] {
            graph.add_edge(from, to, ());
        }

        if let Err(e) = formats
            .parse(&link.format.media, &link.format.params)
            .and_then(|f| formats.validate(&f))
        {
            issues.push(ValidationIssue::InvalidFormat {
                link: i,
                reason: e.to_string(),
            });
        }
    }

    if toposort(&graph, None).is_err() {
        issues.push(ValidationIssue::Cycle);
    }

    if let Some(driver) = &spec.settings.driver {
        if !index.contains_key(driver.as_str()) {
            issues.push(ValidationIssue::UnknownDriver(driver.clone()));
        }
    }
    issues
}

/// Nodes and links created from a description
#[derive(Debug, Clone, Default)]
pub struct LoadedGraph {
    pub nodes: BTreeMap<String, NodeId>,
    pub links: Vec<LinkId>,
}

impl LoadedGraph {
    pub fn node(&self, name: &str) -> Option<NodeId> {
        self.nodes.get(name).copied()
    }
}

/// Instantiate every node and link of a description.
///
/// Nothing is left behind when a step fails.
pub fn load(runtime: &mut MediaRuntime, spec: &GraphSpec) -> Result<LoadedGraph, GraphError> {
    let issues = validate(spec, runtime.registry(), runtime.formats());
    if !issues.is_empty() {
        let text: Vec<String> = issues.iter().map(ToString::to_string).collect();
        return Err(GraphError::Unsupported(text.join("; ")));
    }

    let mut loaded = LoadedGraph::default();
    if let Err(e) = build(runtime, spec, &mut loaded) {
        tracing::warn!("Loading '{}' failed: {}", spec.name, e);
        for node in loaded.nodes.values() {
            if let Err(e) = runtime.remove_node(*node) {
                tracing::warn!("Rollback of {} failed: {}", node, e);
            }
        }
        return Err(e);
    }

    tracing::info!(
        "Loaded '{}': {} nodes, {} links",
        spec.name,
        loaded.nodes.len(),
        loaded.links.len()
    );
    Ok(loaded)
}

fn build(runtime: &mut MediaRuntime, spec: &GraphSpec, loaded: &mut LoadedGraph) -> Result<(), GraphError> {
    for node in &spec.nodes {
        let id = runtime.create_node(&node.factory, node.props.clone())?;
        loaded.nodes.insert(node.name.clone(), id);
    }

    for link in &spec.links {
        let lookup = |name: &str| {
            loaded
                .node(name)
                .ok_or_else(|| GraphError::Unsupported(format!("unknown node '{}'", name)))
        };
        let output = lookup(&link.output.node)?;
        let input = lookup(&link.input.node)?;
        let format = runtime.format(&link.format.media, &link.format.params)?;
        let buffers = link.buffers.unwrap_or(BufferSpec {
            count: runtime.config().default_buffer_count,
            size: runtime.config().default_buffer_size,
        });
        let id = runtime.connect_with(output, link.output.port, input, link.input.port, &format, buffers)?;
        loaded.links.push(id);
    }
    Ok(())
}
