//! Bridge from a device monitor to graph nodes.
//!
//! Device enumeration runs elsewhere; what reaches the data loop is a stream
//! of [`DeviceEvent`]s keyed by the monitor's object ids. The bridge keeps
//! the object → node mapping and fills in the node properties a monitor
//! usually leaves out.

use mediacore::{NodeId, Properties, PropertiesExt, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const KEY_DEVICE_ID: &str = "device.id";
pub const KEY_DEVICE_NAME: &str = "device.name";
pub const KEY_DEVICE_DESCRIPTION: &str = "device.description";
pub const KEY_FACTORY_NAME: &str = "factory.name";
pub const KEY_MEDIA_CLASS: &str = "media.class";
pub const KEY_NODE_NAME: &str = "node.name";
pub const KEY_NODE_DESCRIPTION: &str = "node.description";
pub const KEY_PRIORITY_MASTER: &str = "priority.master";
pub const KEY_PRIORITY_SESSION: &str = "priority.session";
pub const KEY_ALSA_CARD: &str = "api.alsa.card";
pub const KEY_PCM_DEVICE: &str = "api.alsa.pcm.device";
pub const KEY_PCM_SUBDEVICE: &str = "api.alsa.pcm.subdevice";
pub const KEY_PCM_STREAM: &str = "api.alsa.pcm.stream";
pub const KEY_PCM_NAME: &str = "api.alsa.pcm.name";
pub const KEY_PCM_ID: &str = "api.alsa.pcm.id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DeviceEvent {
    ObjectAdded {
        object_id: u32,
        factory: String,
        props: Properties,
    },
    ObjectUpdated {
        object_id: u32,
        props: Properties,
    },
    ObjectRemoved {
        object_id: u32,
    },
}

/// What the runtime should do with a device event
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    Create {
        object_id: u32,
        factory: String,
        props: Properties,
    },
    Update {
        node: NodeId,
        props: Properties,
    },
    Remove {
        node: NodeId,
    },
    Ignore,
}

/// Per-device state of the bridge
#[derive(Debug)]
pub struct DeviceMonitor {
    device_id: u32,
    props: Properties,
    priority: i64,
    first: bool,
    objects: BTreeMap<u32, NodeId>,
}

impl DeviceMonitor {
    pub fn new(device_id: u32, props: Properties) -> Self {
        let mut priority = 1000;
        if let Some(card) = props.get(KEY_ALSA_CARD).and_then(Value::as_i64) {
            priority -= card * 64;
        }
        Self {
            device_id,
            props,
            priority,
            first: true,
            objects: BTreeMap::new(),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn node_for(&self, object_id: u32) -> Option<NodeId> {
        self.objects.get(&object_id).copied()
    }

    pub fn n_objects(&self) -> usize {
        self.objects.len()
    }

    /// Record the node created for an object
    pub fn bind(&mut self, object_id: u32, node: NodeId) {
        self.objects.insert(object_id, node);
    }

    /// Translate an event into a graph action, updating the object map.
    pub fn apply(&mut self, event: DeviceEvent) -> MonitorAction {
        match event {
            DeviceEvent::ObjectAdded {
                object_id,
                factory,
                props,
            } => {
                if let Some(node) = self.objects.get(&object_id) {
                    tracing::warn!("Object {} already bound to {}", object_id, node);
                    return MonitorAction::Ignore;
                }
                tracing::debug!("New object {} ({})", object_id, factory);
                let props = self.node_props(&factory, props);
                MonitorAction::Create {
                    object_id,
                    factory,
                    props,
                }
            }
            DeviceEvent::ObjectUpdated { object_id, props } => match self.objects.get(&object_id) {
                Some(node) => MonitorAction::Update { node: *node, props },
                None => {
                    tracing::warn!("Update for unknown object {}", object_id);
                    MonitorAction::Ignore
                }
            },
            DeviceEvent::ObjectRemoved { object_id } => match self.objects.remove(&object_id) {
                Some(node) => MonitorAction::Remove { node },
                None => {
                    tracing::warn!("Removal of unknown object {}", object_id);
                    MonitorAction::Ignore
                }
            },
        }
    }

    /// Complete the properties of a new node with defaults derived from the
    /// device and the pcm stream it represents.
    pub fn node_props(&mut self, factory: &str, mut props: Properties) -> Properties {
        props.insert(KEY_DEVICE_ID.into(), Value::from(self.device_id));
        props.insert(KEY_FACTORY_NAME.into(), Value::from(factory));

        let dev = props.get_i64_or(KEY_PCM_DEVICE, 0);
        let subdev = props.get_i64_or(KEY_PCM_SUBDEVICE, 0);
        let stream = props.get_str(KEY_PCM_STREAM).unwrap_or("unknown").to_string();
        let capture = stream == "capture";

        if self.first {
            if dev != 0 {
                self.priority -= 256;
            }
            self.first = false;
        }

        let mut priority = self.priority;
        if capture {
            priority += 1000;
        }
        priority -= dev * 16;
        priority -= subdev;

        if !props.contains_key(KEY_PRIORITY_MASTER) {
            props.insert(KEY_PRIORITY_MASTER.into(), Value::Int(priority));
            props.insert(KEY_PRIORITY_SESSION.into(), Value::Int(priority));
        }

        props.set_default(
            KEY_MEDIA_CLASS,
            if capture { "Audio/Source" } else { "Audio/Sink" },
        );

        if !props.contains_key(KEY_NODE_NAME) {
            let device = self.props.get_str(KEY_DEVICE_NAME).unwrap_or("unknown");
            props.insert(
                KEY_NODE_NAME.into(),
                Value::String(format!("{}.{}.{}.{}", device, stream, dev, subdev)),
            );
        }

        if !props.contains_key(KEY_NODE_DESCRIPTION) {
            let desc = self.props.get_str(KEY_DEVICE_DESCRIPTION).unwrap_or("unknown");
            let name = props
                .get_str(KEY_PCM_NAME)
                .or_else(|| props.get_str(KEY_PCM_ID))
                .map(str::to_string)
                .unwrap_or_else(|| dev.to_string());
            let description = if subdev != 0 {
                format!("{} ({} {})", desc, name, subdev)
            } else if dev != 0 {
                format!("{} ({})", desc, name)
            } else {
                desc.to_string()
            };
            props.insert(KEY_NODE_DESCRIPTION.into(), Value::String(description));
        }
        props
    }
}
