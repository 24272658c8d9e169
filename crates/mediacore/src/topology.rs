use crate::{Properties, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declarative description of a graph, as read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub settings: RunSettings,
}

impl GraphSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            links: Vec::new(),
            settings: RunSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> String {
        let name = node.name.clone();
        self.nodes.push(node);
        name
    }

    pub fn connect(
        &mut self,
        from_node: impl Into<String>,
        from_port: u32,
        to_node: impl Into<String>,
        to_port: u32,
        format: FormatSpec,
    ) {
        self.links.push(LinkSpec {
            output: PortRef {
                node: from_node.into(),
                port: from_port,
            },
            input: PortRef {
                node: to_node.into(),
                port: to_port,
            },
            format,
            buffers: None,
        });
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Node instance in a graph description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub factory: String,
    #[serde(default)]
    pub props: Properties,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, factory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory: factory.into(),
            props: Properties::new(),
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub port: u32,
}

/// Link between an output port and an input port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    pub output: PortRef,
    pub input: PortRef,
    pub format: FormatSpec,
    #[serde(default)]
    pub buffers: Option<BufferSpec>,
}

/// Format as written in a description: `"audio/raw"` plus parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatSpec {
    pub media: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl FormatSpec {
    pub fn new(media: impl Into<String>) -> Self {
        Self {
            media: media.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferSpec {
    pub count: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    SyncPush,
    SyncPull,
    AsyncPush,
    AsyncPull,
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub mode: RunMode,
    pub iterations: u64,
    /// Node that starts each cycle; defaults to the first source or sink
    #[serde(default)]
    pub driver: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            mode: RunMode::SyncPush,
            iterations: 1000,
            driver: None,
        }
    }
}
