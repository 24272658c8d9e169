//! Media formats and the format descriptor table.
//!
//! A [`Format`] is a media type, a media subtype and a set of named
//! parameters. Type and subtype are interned ids handed out by a
//! [`FormatTable`], which is built once at startup and passed by reference
//! to whoever needs to construct or validate formats.

use crate::{NodeError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaType(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaSubtype(pub u32);

/// A fully described format as carried by a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub media_type: MediaType,
    pub media_subtype: MediaSubtype,
    pub params: BTreeMap<String, Value>,
}

impl Format {
    pub fn new(media_type: MediaType, media_subtype: MediaSubtype) -> Self {
        Self {
            media_type,
            media_subtype,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Structural identity: same type, subtype and parameter set.
    pub fn matches(&self, other: &Format) -> bool {
        self == other
    }
}

/// Interned media type names and the parameters each (type, subtype) pair
/// requires before a format counts as fully specified.
#[derive(Debug, Clone, Default)]
pub struct FormatTable {
    media_types: Vec<String>,
    media_subtypes: Vec<String>,
    audio_formats: Vec<String>,
    required: HashMap<(MediaType, MediaSubtype), Vec<String>>,
}

/// Sample formats understood by `audio/raw`.
const AUDIO_FORMATS: &[&str] = &[
    "UNKNOWN", "ENCODED", "S8", "U8", "S16LE", "S16BE", "U16LE", "U16BE", "S24_32LE",
    "S24_32BE", "U24_32LE", "U24_32BE", "S32LE", "S32BE", "U32LE", "U32BE", "S24LE", "S24BE",
    "U24LE", "U24BE", "S20LE", "S20BE", "U20LE", "U20BE", "S18LE", "S18BE", "U18LE", "U18BE",
    "F32LE", "F32BE", "F64LE", "F64BE", "U8P", "S16P", "S24_32P", "S32P", "S24P", "F32P",
    "F64P",
];

impl FormatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the media types the built-in nodes speak.
    pub fn standard() -> Self {
        let mut table = Self::new();
        let binary = table.register_type("binary");
        let audio = table.register_type("audio");
        let video = table.register_type("video");
        let raw = table.register_subtype("raw");
        table.register_subtype("opus");
        table.register_subtype("h264");

        table.require(binary, raw, &[]);
        table.require(audio, raw, &["format", "rate", "channels"]);
        table.require(video, raw, &["format", "width", "height"]);

        for name in AUDIO_FORMATS {
            table.audio_formats.push((*name).to_string());
        }
        table
    }

    pub fn register_type(&mut self, name: &str) -> MediaType {
        if let Some(existing) = self.media_type(name) {
            return existing;
        }
        self.media_types.push(name.to_string());
        MediaType(self.media_types.len() as u32 - 1)
    }

    pub fn register_subtype(&mut self, name: &str) -> MediaSubtype {
        if let Some(existing) = self.media_subtype(name) {
            return existing;
        }
        self.media_subtypes.push(name.to_string());
        MediaSubtype(self.media_subtypes.len() as u32 - 1)
    }

    pub fn require(&mut self, media_type: MediaType, media_subtype: MediaSubtype, params: &[&str]) {
        self.required.insert(
            (media_type, media_subtype),
            params.iter().map(|p| p.to_string()).collect(),
        );
    }

    pub fn media_type(&self, name: &str) -> Option<MediaType> {
        self.media_types
            .iter()
            .position(|n| n == name)
            .map(|i| MediaType(i as u32))
    }

    pub fn media_subtype(&self, name: &str) -> Option<MediaSubtype> {
        self.media_subtypes
            .iter()
            .position(|n| n == name)
            .map(|i| MediaSubtype(i as u32))
    }

    pub fn type_name(&self, media_type: MediaType) -> Option<&str> {
        self.media_types.get(media_type.0 as usize).map(String::as_str)
    }

    pub fn subtype_name(&self, media_subtype: MediaSubtype) -> Option<&str> {
        self.media_subtypes.get(media_subtype.0 as usize).map(String::as_str)
    }

    pub fn audio_format(&self, name: &str) -> Option<u32> {
        self.audio_formats.iter().position(|n| n == name).map(|i| i as u32)
    }

    pub fn audio_format_name(&self, id: u32) -> Option<&str> {
        self.audio_formats.get(id as usize).map(String::as_str)
    }

    /// Start a format from type and subtype names.
    pub fn format(&self, media_type: &str, media_subtype: &str) -> Result<Format, NodeError> {
        let ty = self
            .media_type(media_type)
            .ok_or_else(|| NodeError::InvalidFormat(format!("unknown media type '{}'", media_type)))?;
        let sub = self.media_subtype(media_subtype).ok_or_else(|| {
            NodeError::InvalidFormat(format!("unknown media subtype '{}'", media_subtype))
        })?;
        Ok(Format::new(ty, sub))
    }

    /// Parse `"type/subtype"` and attach parameters.
    pub fn parse(&self, spec: &str, params: &BTreeMap<String, Value>) -> Result<Format, NodeError> {
        let (ty, sub) = spec
            .split_once('/')
            .ok_or_else(|| NodeError::InvalidFormat(format!("expected type/subtype, got '{}'", spec)))?;
        let mut format = self.format(ty, sub)?;
        format.params.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(format)
    }

    /// Check that a format is known to the table and fully specified.
    pub fn validate(&self, format: &Format) -> Result<(), NodeError> {
        let ty = self
            .type_name(format.media_type)
            .ok_or_else(|| NodeError::InvalidFormat(format!("unknown media type {:?}", format.media_type)))?;
        self.subtype_name(format.media_subtype).ok_or_else(|| {
            NodeError::InvalidFormat(format!("unknown media subtype {:?}", format.media_subtype))
        })?;

        let required = self
            .required
            .get(&(format.media_type, format.media_subtype))
            .ok_or_else(|| NodeError::InvalidFormat(format!("unsupported format {}", self.describe(format))))?;

        for name in required {
            match format.params.get(name) {
                None | Some(Value::Null) => {
                    return Err(NodeError::InvalidFormat(format!(
                        "missing parameter '{}' for {}",
                        name,
                        self.describe(format)
                    )));
                }
                Some(_) => {}
            }
        }

        if ty == "audio" {
            if let Some(sample) = format.params.get("format").and_then(Value::as_str) {
                if self.audio_format(sample).is_none() {
                    return Err(NodeError::InvalidFormat(format!("unknown sample format '{}'", sample)));
                }
            }
        }
        Ok(())
    }

    pub fn describe(&self, format: &Format) -> String {
        let mut out = format!(
            "{}/{}",
            self.type_name(format.media_type).unwrap_or("?"),
            self.subtype_name(format.media_subtype).unwrap_or("?")
        );
        for (key, value) in &format.params {
            out.push_str(&format!(" {}={}", key, DisplayValue(value)));
        }
        out
    }
}

struct DisplayValue<'a>(&'a Value);

impl fmt::Display for DisplayValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", DisplayValue(item))?;
                }
                write!(f, "]")
            }
        }
    }
}
