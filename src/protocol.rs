use crate::error::{LinkError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub type StreamId = String;
pub type EnvelopeId = u64;
pub type Timestamp = i64;

pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
    Numeric = 0,
    Vector = 1,
    Matrix = 2,
    String = 3,
    Boolean = 4,
    Object = 5,
}

impl ValueKind {
    pub const ALL: [ValueKind; 6] = [
        ValueKind::Numeric,
        ValueKind::Vector,
        ValueKind::Matrix,
        ValueKind::String,
        ValueKind::Boolean,
        ValueKind::Object,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Numeric => "numeric",
            ValueKind::Vector => "vector",
            ValueKind::Matrix => "matrix",
            ValueKind::String => "string",
            ValueKind::Boolean => "boolean",
            ValueKind::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loosely typed field used inside structured values and point metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Array(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    fn estimated_bytes(&self) -> usize {
        match self {
            FieldValue::Null | FieldValue::Bool(_) => 1,
            FieldValue::Integer(_) | FieldValue::Number(_) => 8,
            FieldValue::String(s) => s.len(),
            FieldValue::Array(items) => items.iter().map(FieldValue::estimated_bytes).sum(),
            FieldValue::Map(map) => map
                .iter()
                .map(|(k, v)| k.len() + v.estimated_bytes())
                .sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryValue {
    Numeric(f64),
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
    String(String),
    Boolean(bool),
    Object(BTreeMap<String, FieldValue>),
}

impl TelemetryValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            TelemetryValue::Numeric(_) => ValueKind::Numeric,
            TelemetryValue::Vector(_) => ValueKind::Vector,
            TelemetryValue::Matrix(_) => ValueKind::Matrix,
            TelemetryValue::String(_) => ValueKind::String,
            TelemetryValue::Boolean(_) => ValueKind::Boolean,
            TelemetryValue::Object(_) => ValueKind::Object,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    pub fn estimated_bytes(&self) -> usize {
        match self {
            TelemetryValue::Numeric(_) => 8,
            TelemetryValue::Vector(v) => v.len() * 8,
            TelemetryValue::Matrix(rows) => rows.iter().map(|r| r.len() * 8).sum(),
            TelemetryValue::String(s) => s.len(),
            TelemetryValue::Boolean(_) => 1,
            TelemetryValue::Object(map) => map
                .iter()
                .map(|(k, v)| k.len() + v.estimated_bytes())
                .sum(),
        }
    }
}

impl From<f64> for TelemetryValue {
    fn from(value: f64) -> Self {
        TelemetryValue::Numeric(value)
    }
}

impl From<Vec<f64>> for TelemetryValue {
    fn from(value: Vec<f64>) -> Self {
        TelemetryValue::Vector(value)
    }
}

impl From<Vec<Vec<f64>>> for TelemetryValue {
    fn from(value: Vec<Vec<f64>>) -> Self {
        TelemetryValue::Matrix(value)
    }
}

impl From<bool> for TelemetryValue {
    fn from(value: bool) -> Self {
        TelemetryValue::Boolean(value)
    }
}

impl From<&str> for TelemetryValue {
    fn from(value: &str) -> Self {
        TelemetryValue::String(value.to_string())
    }
}

fn default_quality() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub timestamp: Timestamp,
    pub value: TelemetryValue,
    #[serde(default = "default_quality")]
    pub quality: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, FieldValue>,
}

impl TelemetryPoint {
    pub fn new(timestamp: Timestamp, value: impl Into<TelemetryValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
            quality: default_quality(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }

    /// Rough in-memory footprint used for the client memory budget.
    pub fn estimated_bytes(&self) -> usize {
        let metadata: usize = self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + v.estimated_bytes())
            .sum();
        48 + self.value.estimated_bytes() + metadata
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Protocol {
    /// Compact binary, struct fields written as maps.
    MessagePack = 1,
    /// Compact binary, enum variants written as integer tags.
    Bincode = 2,
    /// Plain text for debugging.
    Json = 3,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::MessagePack, Protocol::Bincode, Protocol::Json];

    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Protocol::MessagePack),
            2 => Ok(Protocol::Bincode),
            3 => Ok(Protocol::Json),
            other => Err(LinkError::Protocol(format!("Unknown protocol tag: {}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::MessagePack => "messagepack",
            Protocol::Bincode => "bincode",
            Protocol::Json => "json",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Deflate = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl CompressionType {
    pub const ALL: [CompressionType; 4] = [
        CompressionType::None,
        CompressionType::Deflate,
        CompressionType::Lz4,
        CompressionType::Zstd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Deflate => "deflate",
            CompressionType::Lz4 => "lz4",
            CompressionType::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Telemetry = 0,
    TelemetryBatch = 1,
    BufferSnapshot = 2,
    Control = 3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEnvelope {
    pub id: EnvelopeId,
    pub message_kind: MessageKind,
    pub payload: Bytes,
    pub protocol: Protocol,
    pub compressed: bool,
    pub compression: CompressionType,
    pub schema_id: Option<String>,
    pub checksum: Option<u32>,
}

impl SerializedEnvelope {
    pub fn new(message_kind: MessageKind, protocol: Protocol, payload: Bytes) -> Self {
        Self {
            id: next_envelope_id(),
            message_kind,
            payload,
            protocol,
            compressed: false,
            compression: CompressionType::None,
            schema_id: None,
            checksum: None,
        }
    }
}

static ENVELOPE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn next_envelope_id() -> EnvelopeId {
    let sequence = ENVELOPE_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
    let timestamp = now_millis().max(0) as u64;
    (timestamp << 20) | (sequence & 0xFFFFF)
}

/// Ordered sequence of points carried as one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub points: Vec<TelemetryPoint>,
}
