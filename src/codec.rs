//! Wire protocol codecs.
//!
//! Every codec implements [`ProtocolCodec`]: generic envelope encode/decode plus
//! telemetry-specialised point encode/decode. The telemetry path can trim
//! numeric precision before encoding to shrink payloads. Trimming is lossy:
//! a decoded point carries the rounded values, not the originals.

use crate::error::Result;
use crate::protocol::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryCodecOptions {
    /// Round numeric values to this many decimal digits before encoding.
    pub precision: Option<u32>,
}

impl TelemetryCodecOptions {
    pub fn with_precision(mut self, digits: u32) -> Self {
        self.precision = Some(digits);
        self
    }
}

pub trait ProtocolCodec: Send + Sync {
    fn protocol(&self) -> Protocol;
    fn encode_envelope(&self, envelope: &SerializedEnvelope) -> Result<Vec<u8>>;
    fn decode_envelope(&self, data: &[u8]) -> Result<SerializedEnvelope>;
    fn supports_compression(&self) -> bool;
    fn supported_compression_algorithms(&self) -> Vec<CompressionType>;
    fn encode_telemetry(&self, point: &TelemetryPoint, kind: ValueKind, options: &TelemetryCodecOptions) -> Result<Vec<u8>>;
    fn decode_telemetry(&self, data: &[u8], options: &TelemetryCodecOptions) -> Result<TelemetryPoint>;
    fn encode_batch(&self, batch: &TelemetryBatch, options: &TelemetryCodecOptions) -> Result<Vec<u8>>;
    fn decode_batch(&self, data: &[u8]) -> Result<TelemetryBatch>;
}

fn to_bytes<T: Serialize>(protocol: Protocol, value: &T) -> Result<Vec<u8>> {
    match protocol {
        Protocol::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        Protocol::Bincode => Ok(bincode::serialize(value)?),
        Protocol::Json => Ok(serde_json::to_vec(value)?),
    }
}

fn from_bytes<T: DeserializeOwned>(protocol: Protocol, data: &[u8]) -> Result<T> {
    match protocol {
        Protocol::MessagePack => Ok(rmp_serde::from_slice(data)?),
        Protocol::Bincode => Ok(bincode::deserialize(data)?),
        Protocol::Json => Ok(serde_json::from_slice(data)?),
    }
}

fn prepare_point(point: &TelemetryPoint, options: &TelemetryCodecOptions) -> TelemetryPoint {
    match options.precision {
        Some(digits) => trim_point(point, digits),
        None => point.clone(),
    }
}

/// Serde-driven codec shared by all three protocols; the protocol only
/// changes the underlying data format.
struct SerdeCodec {
    protocol: Protocol,
    compression: &'static [CompressionType],
}

impl ProtocolCodec for SerdeCodec {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn encode_envelope(&self, envelope: &SerializedEnvelope) -> Result<Vec<u8>> {
        to_bytes(self.protocol, envelope)
    }

    fn decode_envelope(&self, data: &[u8]) -> Result<SerializedEnvelope> {
        from_bytes(self.protocol, data)
    }

    fn supports_compression(&self) -> bool {
        !self.compression.is_empty()
    }

    fn supported_compression_algorithms(&self) -> Vec<CompressionType> {
        self.compression.to_vec()
    }

    fn encode_telemetry(&self, point: &TelemetryPoint, _kind: ValueKind, options: &TelemetryCodecOptions) -> Result<Vec<u8>> {
        to_bytes(self.protocol, &prepare_point(point, options))
    }

    fn decode_telemetry(&self, data: &[u8], _options: &TelemetryCodecOptions) -> Result<TelemetryPoint> {
        from_bytes(self.protocol, data)
    }

    fn encode_batch(&self, batch: &TelemetryBatch, options: &TelemetryCodecOptions) -> Result<Vec<u8>> {
        if options.precision.is_none() {
            return to_bytes(self.protocol, batch);
        }
        let trimmed = TelemetryBatch {
            points: batch.points.iter().map(|p| prepare_point(p, options)).collect(),
        };
        to_bytes(self.protocol, &trimmed)
    }

    fn decode_batch(&self, data: &[u8]) -> Result<TelemetryBatch> {
        from_bytes(self.protocol, data)
    }
}

pub struct MessagePackCodec(SerdeCodec);

impl MessagePackCodec {
    pub fn new() -> Self {
        Self(SerdeCodec {
            protocol: Protocol::MessagePack,
            compression: &[CompressionType::Deflate, CompressionType::Lz4, CompressionType::Zstd],
        })
    }
}

pub struct BincodeCodec(SerdeCodec);

impl BincodeCodec {
    pub fn new() -> Self {
        Self(SerdeCodec {
            protocol: Protocol::Bincode,
            compression: &[CompressionType::Lz4, CompressionType::Zstd, CompressionType::Deflate],
        })
    }
}

pub struct JsonCodec(SerdeCodec);

impl JsonCodec {
    pub fn new() -> Self {
        Self(SerdeCodec {
            protocol: Protocol::Json,
            compression: &[CompressionType::Deflate],
        })
    }
}

macro_rules! delegate_codec {
    ($codec:ty) => {
        impl Default for $codec {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ProtocolCodec for $codec {
            fn protocol(&self) -> Protocol {
                self.0.protocol()
            }

            fn encode_envelope(&self, envelope: &SerializedEnvelope) -> Result<Vec<u8>> {
                self.0.encode_envelope(envelope)
            }

            fn decode_envelope(&self, data: &[u8]) -> Result<SerializedEnvelope> {
                self.0.decode_envelope(data)
            }

            fn supports_compression(&self) -> bool {
                self.0.supports_compression()
            }

            fn supported_compression_algorithms(&self) -> Vec<CompressionType> {
                self.0.supported_compression_algorithms()
            }

            fn encode_telemetry(&self, point: &TelemetryPoint, kind: ValueKind, options: &TelemetryCodecOptions) -> Result<Vec<u8>> {
                self.0.encode_telemetry(point, kind, options)
            }

            fn decode_telemetry(&self, data: &[u8], options: &TelemetryCodecOptions) -> Result<TelemetryPoint> {
                self.0.decode_telemetry(data, options)
            }

            fn encode_batch(&self, batch: &TelemetryBatch, options: &TelemetryCodecOptions) -> Result<Vec<u8>> {
                self.0.encode_batch(batch, options)
            }

            fn decode_batch(&self, data: &[u8]) -> Result<TelemetryBatch> {
                self.0.decode_batch(data)
            }
        }
    };
}

delegate_codec!(MessagePackCodec);
delegate_codec!(BincodeCodec);
delegate_codec!(JsonCodec);

pub fn codec_for(protocol: Protocol) -> Box<dyn ProtocolCodec> {
    match protocol {
        Protocol::MessagePack => Box::new(MessagePackCodec::new()),
        Protocol::Bincode => Box::new(BincodeCodec::new()),
        Protocol::Json => Box::new(JsonCodec::new()),
    }
}

pub fn round_to(value: f64, digits: u32) -> f64 {
    if !value.is_finite() || value.fract() == 0.0 {
        return value;
    }
    let factor = 10f64.powi(digits.min(15) as i32);
    let rounded = (value * factor).round() / factor;
    if rounded.is_finite() { rounded } else { value }
}

fn trim_field(field: &FieldValue, digits: u32) -> FieldValue {
    match field {
        FieldValue::Number(v) => FieldValue::Number(round_to(*v, digits)),
        FieldValue::Array(items) => FieldValue::Array(items.iter().map(|f| trim_field(f, digits)).collect()),
        FieldValue::Map(map) => FieldValue::Map(trim_map(map, digits)),
        other => other.clone(),
    }
}

fn trim_map(map: &BTreeMap<String, FieldValue>, digits: u32) -> BTreeMap<String, FieldValue> {
    map.iter()
        .map(|(k, v)| (k.clone(), trim_field(v, digits)))
        .collect()
}

/// Lossy: rounds every numeric value in the point to `digits` decimals.
pub fn trim_point(point: &TelemetryPoint, digits: u32) -> TelemetryPoint {
    let value = match &point.value {
        TelemetryValue::Numeric(v) => TelemetryValue::Numeric(round_to(*v, digits)),
        TelemetryValue::Vector(values) => {
            TelemetryValue::Vector(values.iter().map(|v| round_to(*v, digits)).collect())
        }
        TelemetryValue::Matrix(rows) => TelemetryValue::Matrix(
            rows.iter()
                .map(|row| row.iter().map(|v| round_to(*v, digits)).collect())
                .collect(),
        ),
        TelemetryValue::Object(fields) => TelemetryValue::Object(trim_map(fields, digits)),
        other => other.clone(),
    };

    TelemetryPoint {
        timestamp: point.timestamp,
        value,
        quality: point.quality,
        metadata: point.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_points() -> Vec<TelemetryPoint> {
        let mut fields = BTreeMap::new();
        fields.insert("gear".to_string(), FieldValue::Integer(3));
        fields.insert("temps".to_string(), FieldValue::Array(vec![FieldValue::Number(91.25)]));
        fields.insert("label".to_string(), FieldValue::String("lap".to_string()));

        vec![
            TelemetryPoint::new(1_000, 12.5).with_quality(0.75),
            TelemetryPoint::new(1_001, vec![1.0, -2.5, 3.125]),
            TelemetryPoint::new(1_002, vec![vec![1.0, 2.0], vec![3.0, 4.0]]),
            TelemetryPoint::new(1_003, "pit entry"),
            TelemetryPoint::new(1_004, true).with_metadata("source", FieldValue::String("ecu".to_string())),
            TelemetryPoint::new(1_005, TelemetryValue::Object(fields)),
        ]
    }

    #[test]
    fn test_telemetry_round_trip_every_protocol() {
        for protocol in Protocol::ALL {
            let codec = codec_for(protocol);
            for point in sample_points() {
                let encoded = codec
                    .encode_telemetry(&point, point.kind(), &TelemetryCodecOptions::default())
                    .unwrap();
                let decoded = codec.decode_telemetry(&encoded, &TelemetryCodecOptions::default()).unwrap();
                assert_eq!(decoded, point, "{}", protocol);
            }
        }
    }

    #[test]
    fn test_matrix_exact_via_bincode() {
        let codec = BincodeCodec::new();
        let point = TelemetryPoint::new(7, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);

        let encoded = codec.encode_telemetry(&point, ValueKind::Matrix, &TelemetryCodecOptions::default()).unwrap();
        let decoded = codec.decode_telemetry(&encoded, &TelemetryCodecOptions::default()).unwrap();

        assert_eq!(decoded.value, TelemetryValue::Matrix(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
    }

    #[test]
    fn test_envelope_round_trip() {
        for protocol in Protocol::ALL {
            let codec = codec_for(protocol);
            let mut envelope = SerializedEnvelope::new(MessageKind::Telemetry, protocol, Bytes::from_static(b"\x00\x01payload"));
            envelope.checksum = Some(0xDEADBEEF);
            envelope.schema_id = Some("telemetry.numeric.v1.0.0".to_string());

            let encoded = codec.encode_envelope(&envelope).unwrap();
            assert_eq!(codec.decode_envelope(&encoded).unwrap(), envelope);
        }
    }

    #[test]
    fn test_precision_trim_is_lossy() {
        let codec = MessagePackCodec::new();
        let point = TelemetryPoint::new(1, vec![1.23456, 2.0, -0.98765]);
        let options = TelemetryCodecOptions::default().with_precision(2);

        let encoded = codec.encode_telemetry(&point, ValueKind::Vector, &options).unwrap();
        let decoded = codec.decode_telemetry(&encoded, &options).unwrap();

        assert_eq!(decoded.value, TelemetryValue::Vector(vec![1.23, 2.0, -0.99]));
    }

    #[test]
    fn test_round_to_keeps_integers() {
        assert_eq!(round_to(42.0, 0), 42.0);
        assert_eq!(round_to(0.125, 2), 0.13);
        assert!(round_to(f64::NAN, 2).is_nan());
    }

    #[test]
    fn test_compression_capabilities() {
        assert!(JsonCodec::new().supports_compression());
        assert_eq!(JsonCodec::new().supported_compression_algorithms(), vec![CompressionType::Deflate]);
        assert!(BincodeCodec::new().supported_compression_algorithms().contains(&CompressionType::Lz4));
    }
}
