use mediacore::{FormatTable, GraphSpec, NodeError, PropertiesExt, Properties, RunMode, Value};
use std::collections::BTreeMap;

#[test]
fn test_standard_table_requires_audio_properties() {
    let table = FormatTable::standard();
    let base = table.format("audio", "raw").unwrap();

    assert!(matches!(table.validate(&base), Err(NodeError::InvalidFormat(_))));

    let full = base
        .clone()
        .with_param("format", "S16LE")
        .with_param("rate", 44100i64)
        .with_param("channels", 2i64);
    assert_eq!(table.validate(&full), Ok(()));

    let unknown_sample = full.clone().with_param("format", "S13LE");
    assert!(table.validate(&unknown_sample).is_err());

    let null_rate = full.with_param("rate", Value::Null);
    assert!(table.validate(&null_rate).is_err(), "Null counts as missing");
}

#[test]
fn test_binary_needs_no_properties() {
    let table = FormatTable::standard();
    let binary = table.format("binary", "raw").unwrap();

    assert_eq!(table.validate(&binary), Ok(()));
    assert_eq!(table.describe(&binary), "binary/raw");
}

#[test]
fn test_unsupported_combinations_are_refused() {
    let table = FormatTable::standard();

    assert!(table.format("audio", "flac").is_err());
    assert!(table.format("midi", "raw").is_err());
    let opus = table.format("audio", "opus").unwrap();
    assert!(table.validate(&opus).is_err(), "No requirements registered for audio/opus");
}

#[test]
fn test_parse_and_match() {
    let table = FormatTable::standard();
    let mut params = BTreeMap::new();
    params.insert("format".to_string(), Value::from("F32LE"));
    params.insert("rate".to_string(), Value::from(48000i64));
    params.insert("channels".to_string(), Value::from(2i64));

    let parsed = table.parse("audio/raw", &params).unwrap();
    let built = table
        .format("audio", "raw")
        .unwrap()
        .with_param("channels", 2i64)
        .with_param("rate", 48000i64)
        .with_param("format", "F32LE");

    assert!(parsed.matches(&built));
    assert!(!parsed.matches(&built.clone().with_param("rate", 44100i64)));
    assert_eq!(table.describe(&parsed), "audio/raw channels=2 format=F32LE rate=48000");
    assert!(table.parse("audio", &params).is_err());
}

#[test]
fn test_registering_twice_keeps_ids() {
    let mut table = FormatTable::new();
    let first = table.register_type("video");
    let second = table.register_type("video");

    assert_eq!(first, second);
    assert_eq!(table.type_name(first), Some("video"));
    assert_eq!(table.audio_format("F32LE"), None, "Empty table knows no sample formats");
}

#[test]
fn test_property_lookups() {
    let mut props = Properties::new();
    props.insert("node.async".into(), Value::from("true"));
    props.insert("period.ms".into(), Value::from("20"));
    props.insert("fill".into(), Value::Float(3.0));

    assert!(props.get_bool_or("node.async", false));
    assert!(!props.get_bool_or("node.live", false));
    assert_eq!(props.get_i64_or("period.ms", 0), 20);
    assert_eq!(props.get_i64_or("fill", 0), 3);

    props.set_default("fill", 9i64);
    props.set_default("mute", false);
    assert_eq!(props.get("fill"), Some(&Value::Float(3.0)));
    assert_eq!(props.get("mute"), Some(&Value::Bool(false)));
}

#[test]
fn test_graph_description_from_json() {
    let json = r#"{
        "name": "Volume chain",
        "nodes": [
            { "name": "source", "factory": "test.fakesrc", "props": { "fill": 7 } },
            { "name": "gain", "factory": "filter.volume", "props": { "volume": 0.5 } },
            { "name": "sink", "factory": "test.fakesink" }
        ],
        "links": [
            {
                "output": { "node": "source", "port": 0 },
                "input": { "node": "gain", "port": 0 },
                "format": { "media": "audio/raw", "params": { "format": "F32LE", "rate": 48000, "channels": 2 } },
                "buffers": { "count": 2, "size": 1024 }
            }
        ],
        "settings": { "mode": "async-pull", "iterations": 10 }
    }"#;

    let spec: GraphSpec = serde_json::from_str(json).unwrap();

    assert_eq!(spec.nodes.len(), 3);
    assert_eq!(spec.find_node("source").unwrap().props.get("fill"), Some(&Value::Int(7)));
    assert_eq!(spec.find_node("gain").unwrap().props.get("volume"), Some(&Value::Float(0.5)));
    assert!(spec.find_node("sink").unwrap().props.is_empty());
    assert_eq!(spec.links[0].format.params.get("rate"), Some(&Value::Int(48000)));
    assert_eq!(spec.links[0].buffers.map(|b| b.count), Some(2));
    assert_eq!(spec.settings.mode, RunMode::AsyncPull);
    assert_eq!(spec.settings.driver, None);
}

#[test]
fn test_settings_default_when_missing() {
    let spec: GraphSpec = serde_json::from_str(r#"{ "name": "empty", "nodes": [] }"#).unwrap();

    assert_eq!(spec.settings.mode, RunMode::SyncPush);
    assert_eq!(spec.settings.iterations, 1000);
    assert!(spec.links.is_empty());
}
