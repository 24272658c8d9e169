use crate::reactor::LoopRef;
use mediacore::{FormatTable, GraphError, Node, NodeError, NodeId, Properties};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a factory gets to build a node instance
pub struct NodeSetup<'a> {
    /// Id the node will be inserted under
    pub id: NodeId,
    pub props: &'a Properties,
    /// Used to register event, idle and timer sources owned by the node
    pub data_loop: &'a LoopRef,
    pub formats: &'a FormatTable,
}

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node
    fn create(&self, setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError>;

    /// Factory name clients refer to, e.g. "test.fakesrc"
    fn factory_name(&self) -> &str;

    /// Optional: describe the ports and purpose of the nodes this factory makes
    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata::default()
    }
}

/// Metadata about a node factory
#[derive(Debug, Clone)]
pub struct FactoryMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for FactoryMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    /// `"type/subtype"` the port produces or accepts
    pub media: String,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, media: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            media: media.into(),
        }
    }
}

/// Registry of available node factories
pub struct NodeRegistry {
    factories: BTreeMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a node factory, replacing any factory with the same name
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let name = factory.factory_name().to_string();
        tracing::info!("Registering node factory: {}", name);
        self.factories.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Create a node instance from a factory name
    pub fn create_node(&self, name: &str, setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, GraphError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| GraphError::UnknownFactory(name.to_string()))?;

        factory.create(setup).map_err(|e| {
            tracing::warn!("Factory {} failed to create {}: {}", name, setup.id, e);
            GraphError::Node(e)
        })
    }

    /// Get all registered factory names, sorted
    pub fn list_factories(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Get metadata for a factory
    pub fn get_metadata(&self, name: &str) -> Option<FactoryMetadata> {
        self.factories.get(name).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
