mod common;

use common::TestNode;
use mediacore::{GraphError, Node, NodeError, Properties, Value};
use mediaruntime::monitor::{
    KEY_ALSA_CARD, KEY_DEVICE_DESCRIPTION, KEY_DEVICE_ID, KEY_DEVICE_NAME, KEY_MEDIA_CLASS,
    KEY_NODE_DESCRIPTION, KEY_NODE_NAME, KEY_PCM_DEVICE, KEY_PCM_NAME, KEY_PCM_STREAM,
    KEY_PCM_SUBDEVICE, KEY_PRIORITY_MASTER, KEY_PRIORITY_SESSION,
};
use mediaruntime::{
    DeviceEvent, DeviceMonitor, LoopMessage, MediaRuntime, MonitorAction, NodeFactory,
    NodeRegistry, NodeSetup, RuntimeConfig,
};
use std::sync::Arc;

const PCM_FACTORY: &str = "api.alsa.pcm";

struct PcmFactory;

impl NodeFactory for PcmFactory {
    fn create(&self, _setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(TestNode::sink()))
    }

    fn factory_name(&self) -> &str {
        PCM_FACTORY
    }
}

fn card(index: i64) -> Properties {
    let mut props = Properties::new();
    props.insert(KEY_ALSA_CARD.into(), Value::Int(index));
    props.insert(KEY_DEVICE_NAME.into(), Value::from("alsa_card.pci-0000_00_1f.3"));
    props.insert(KEY_DEVICE_DESCRIPTION.into(), Value::from("Built-in Audio"));
    props
}

fn pcm(stream: &str, device: i64, subdevice: i64) -> Properties {
    let mut props = Properties::new();
    props.insert(KEY_PCM_STREAM.into(), Value::from(stream));
    props.insert(KEY_PCM_DEVICE.into(), Value::Int(device));
    props.insert(KEY_PCM_SUBDEVICE.into(), Value::Int(subdevice));
    props
}

fn added(object_id: u32, props: Properties) -> DeviceEvent {
    DeviceEvent::ObjectAdded {
        object_id,
        factory: PCM_FACTORY.to_string(),
        props,
    }
}

fn priority(props: &Properties) -> Option<&Value> {
    props.get(KEY_PRIORITY_MASTER)
}

#[test]
fn test_priorities_follow_card_device_and_direction() {
    let mut monitor = DeviceMonitor::new(40, card(1));

    let playback = monitor.node_props(PCM_FACTORY, pcm("playback", 0, 0));
    let capture = monitor.node_props(PCM_FACTORY, pcm("capture", 0, 0));
    let second = monitor.node_props(PCM_FACTORY, pcm("playback", 2, 1));

    assert_eq!(priority(&playback), Some(&Value::Int(936)));
    assert_eq!(priority(&capture), Some(&Value::Int(1936)), "Capture ranks above playback");
    assert_eq!(priority(&second), Some(&Value::Int(903)));
    assert_eq!(playback.get(KEY_PRIORITY_SESSION), priority(&playback));
}

#[test]
fn test_first_secondary_device_lowers_priority() {
    let mut monitor = DeviceMonitor::new(40, card(1));

    let props = monitor.node_props(PCM_FACTORY, pcm("playback", 1, 0));

    assert_eq!(priority(&props), Some(&Value::Int(1000 - 64 - 256 - 16)));
}

#[test]
fn test_default_names_and_class() {
    let mut monitor = DeviceMonitor::new(40, card(0));

    let mut named = pcm("capture", 3, 0);
    named.insert(KEY_PCM_NAME.into(), Value::from("HDMI 0"));
    let props = monitor.node_props(PCM_FACTORY, named);

    assert_eq!(props.get(KEY_DEVICE_ID), Some(&Value::from(40u32)));
    assert_eq!(props.get(KEY_MEDIA_CLASS), Some(&Value::from("Audio/Source")));
    assert_eq!(
        props.get(KEY_NODE_NAME),
        Some(&Value::from("alsa_card.pci-0000_00_1f.3.capture.3.0"))
    );
    assert_eq!(
        props.get(KEY_NODE_DESCRIPTION),
        Some(&Value::from("Built-in Audio (HDMI 0)"))
    );

    let mut preset = pcm("playback", 0, 0);
    preset.insert(KEY_PRIORITY_MASTER.into(), Value::Int(5));
    preset.insert(KEY_MEDIA_CLASS.into(), Value::from("Audio/Duplex"));
    let props = monitor.node_props(PCM_FACTORY, preset);
    assert_eq!(priority(&props), Some(&Value::Int(5)), "Given priorities are kept");
    assert_eq!(props.get(KEY_MEDIA_CLASS), Some(&Value::from("Audio/Duplex")));
    assert_eq!(props.get(KEY_NODE_DESCRIPTION), Some(&Value::from("Built-in Audio")));
}

#[test]
fn test_unknown_objects_are_ignored() {
    let mut monitor = DeviceMonitor::new(40, card(0));

    assert_eq!(
        monitor.apply(DeviceEvent::ObjectRemoved { object_id: 9 }),
        MonitorAction::Ignore
    );
    assert_eq!(
        monitor.apply(DeviceEvent::ObjectUpdated {
            object_id: 9,
            props: Properties::new()
        }),
        MonitorAction::Ignore
    );
    assert!(matches!(
        monitor.apply(added(9, pcm("playback", 0, 0))),
        MonitorAction::Create { object_id: 9, .. }
    ));
}

fn create_runtime() -> MediaRuntime {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(PcmFactory));
    let mut runtime = MediaRuntime::with_registry(Arc::new(registry), RuntimeConfig::default());
    runtime.add_device(DeviceMonitor::new(40, card(0)));
    runtime
}

#[test]
fn test_runtime_follows_device_objects() {
    let mut runtime = create_runtime();

    let node = runtime
        .handle_device_event(40, added(1, pcm("playback", 0, 0)))
        .unwrap()
        .unwrap();
    assert_eq!(runtime.device(40).unwrap().node_for(1), Some(node));
    assert_eq!(
        runtime.graph().node_props(node).unwrap().get(KEY_MEDIA_CLASS),
        Some(&Value::from("Audio/Sink"))
    );

    assert_eq!(
        runtime.handle_device_event(40, added(1, pcm("playback", 0, 0))).unwrap(),
        None,
        "Duplicate objects are ignored"
    );

    let mut update = Properties::new();
    update.insert("api.alsa.volume".into(), Value::Float(0.5));
    runtime
        .handle_device_event(40, DeviceEvent::ObjectUpdated { object_id: 1, props: update })
        .unwrap();
    let props = runtime.graph().node_props(node).unwrap();
    assert_eq!(props.get("api.alsa.volume"), Some(&Value::Float(0.5)));
    assert!(props.contains_key(KEY_NODE_NAME), "Update merges into existing props");

    assert_eq!(
        runtime.handle_device_event(40, DeviceEvent::ObjectRemoved { object_id: 1 }),
        Ok(Some(node))
    );
    assert!(!runtime.graph().contains_node(node));
    assert_eq!(runtime.device(40).unwrap().n_objects(), 0);
}

#[test]
fn test_unknown_device_is_an_error() {
    let mut runtime = create_runtime();

    assert!(matches!(
        runtime.handle_device_event(41, added(1, Properties::new())),
        Err(GraphError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_device_events_arrive_through_the_loop() {
    let mut runtime = create_runtime();
    let handle = runtime.handle();

    handle
        .send(LoopMessage::Device {
            device: 40,
            event: added(7, pcm("capture", 0, 0)),
        })
        .unwrap();
    runtime.turn().await;

    let node = runtime.device(40).unwrap().node_for(7).unwrap();
    assert_eq!(
        runtime.graph().node_props(node).unwrap().get(KEY_MEDIA_CLASS),
        Some(&Value::from("Audio/Source"))
    );
}
