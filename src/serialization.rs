use crate::codec::{JsonCodec, ProtocolCodec, TelemetryCodecOptions};
use crate::compression::{compression_ratio, CompressionManager, DEFAULT_COMPRESSION_THRESHOLD};
use crate::debug;
use crate::error::{LinkError, Result};
use crate::protocol::*;
use crate::schema::SchemaRegistry;
use crate::selector::{recommend_compression, CodecSelector};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationConfig {
    pub compression_threshold: usize,
    pub enable_checksum: bool,
    pub default_precision: Option<u32>,
    pub stats_window: usize,
    pub default_protocol: Option<Protocol>,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            enable_checksum: true,
            default_precision: None,
            stats_window: 1000,
            default_protocol: None,
        }
    }
}

impl SerializationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.enable_checksum = enabled;
        self
    }

    pub fn with_default_precision(mut self, digits: u32) -> Self {
        self.default_precision = Some(digits);
        self
    }

    pub fn with_stats_window(mut self, samples: usize) -> Self {
        self.stats_window = samples;
        self
    }

    pub fn with_default_protocol(mut self, protocol: Protocol) -> Self {
        self.default_protocol = Some(protocol);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SerializeOptions {
    /// Pin a protocol instead of asking the selector.
    pub protocol: Option<Protocol>,
    /// Pin an algorithm; it still only applies above the size threshold.
    pub compression: Option<CompressionType>,
    pub skip_validation: bool,
    /// Overrides `SerializationConfig::enable_checksum`.
    pub checksum: Option<bool>,
    pub precision: Option<u32>,
}

impl SerializeOptions {
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn skip_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }

    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum = Some(enabled);
        self
    }

    pub fn with_precision(mut self, digits: u32) -> Self {
        self.precision = Some(digits);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeserializeOptions {
    pub verify_checksum: bool,
    /// On checksum mismatch, try reading the payload as plain JSON before failing.
    pub fallback_to_json: bool,
}

impl Default for DeserializeOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            fallback_to_json: false,
        }
    }
}

impl DeserializeOptions {
    pub fn with_fallback_to_json(mut self) -> Self {
        self.fallback_to_json = true;
        self
    }

    pub fn without_checksum(mut self) -> Self {
        self.verify_checksum = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerializedTelemetry {
    pub bytes: Bytes,
    pub envelope_id: EnvelopeId,
    pub protocol: Protocol,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compressed: bool,
    pub compression: CompressionType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeserializedTelemetry {
    pub data: TelemetryPoint,
    pub validated: bool,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_micros: f64,
    pub p50_micros: u64,
    pub p95_micros: u64,
    pub p99_micros: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub serialize_count: u64,
    pub deserialize_count: u64,
    pub compressed_count: u64,
    pub validation_failures: u64,
    pub integrity_failures: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub average_compression_ratio: f64,
    pub encode: LatencySummary,
    pub decode: LatencySummary,
}

struct PerformanceTracker {
    window: usize,
    encode_micros: VecDeque<u64>,
    decode_micros: VecDeque<u64>,
    ratio_sum: f64,
    stats: PerformanceStats,
}

impl PerformanceTracker {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            encode_micros: VecDeque::new(),
            decode_micros: VecDeque::new(),
            ratio_sum: 0.0,
            stats: PerformanceStats::default(),
        }
    }

    fn push_sample(samples: &mut VecDeque<u64>, window: usize, micros: u64) {
        if samples.len() == window {
            samples.pop_front();
        }
        samples.push_back(micros);
    }

    fn record_encode(&mut self, micros: u64, original: usize, stored: usize, compressed: bool) {
        Self::push_sample(&mut self.encode_micros, self.window, micros);
        self.stats.serialize_count += 1;
        self.stats.bytes_in += original as u64;
        self.stats.bytes_out += stored as u64;
        if compressed {
            self.stats.compressed_count += 1;
        }
        self.ratio_sum += compression_ratio(original, stored);
    }

    fn record_decode(&mut self, micros: u64) {
        Self::push_sample(&mut self.decode_micros, self.window, micros);
        self.stats.deserialize_count += 1;
    }

    fn snapshot(&self) -> PerformanceStats {
        let mut stats = self.stats.clone();
        stats.encode = summarize(&self.encode_micros);
        stats.decode = summarize(&self.decode_micros);
        stats.average_compression_ratio = if stats.serialize_count > 0 {
            self.ratio_sum / stats.serialize_count as f64
        } else {
            0.0
        };
        stats
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn summarize(samples: &VecDeque<u64>) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }

    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();

    LatencySummary {
        samples: sorted.len(),
        mean_micros: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
        p50_micros: percentile(&sorted, 0.50),
        p95_micros: percentile(&sorted, 0.95),
        p99_micros: percentile(&sorted, 0.99),
    }
}

fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Validate, encode, compress, checksum and frame telemetry (and the inverse).
///
/// Takes `&self` everywhere so a single manager can be shared behind an `Arc`
/// by encode workers; statistics live behind a mutex.
pub struct SerializationManager {
    registry: SchemaRegistry,
    selector: CodecSelector,
    compression: CompressionManager,
    config: SerializationConfig,
    tracker: Mutex<PerformanceTracker>,
}

impl SerializationManager {
    pub fn new(
        registry: SchemaRegistry,
        selector: CodecSelector,
        compression: CompressionManager,
        config: SerializationConfig,
    ) -> Self {
        let tracker = Mutex::new(PerformanceTracker::new(config.stats_window));
        Self {
            registry,
            selector,
            compression,
            config,
            tracker,
        }
    }

    pub fn with_config(config: SerializationConfig) -> Self {
        let selector = CodecSelector::with_compression_threshold(config.compression_threshold);
        Self::new(SchemaRegistry::new(), selector, CompressionManager::new(), config)
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn selector(&self) -> &CodecSelector {
        &self.selector
    }

    pub fn config(&self) -> &SerializationConfig {
        &self.config
    }

    pub fn serialize_telemetry(
        &self,
        point: &TelemetryPoint,
        kind: ValueKind,
        options: &SerializeOptions,
    ) -> Result<SerializedTelemetry> {
        let started = Instant::now();

        let schema_id = if options.skip_validation {
            None
        } else {
            Some(self.validate(point, kind)?)
        };

        let protocol = self.plan(kind, point.estimated_bytes(), options)?;
        let codec = self.selector.codec(protocol)?;
        let codec_options = self.codec_options(options);
        let encoded = codec.encode_telemetry(point, kind, &codec_options)?;

        self.finish(MessageKind::Telemetry, codec.as_ref(), encoded, schema_id, options, started)
    }

    pub fn deserialize_telemetry(
        &self,
        data: &[u8],
        expected_kind: Option<ValueKind>,
        options: &DeserializeOptions,
    ) -> Result<DeserializedTelemetry> {
        let started = Instant::now();
        let envelope = self.decode_frame(data)?;
        expect_kind(&envelope, MessageKind::Telemetry)?;

        let (point, protocol) = match self.open_payload(&envelope, options)? {
            OpenedPayload::Verified(payload) => {
                let codec = self.selector.codec(envelope.protocol)?;
                let point = codec.decode_telemetry(&payload, &TelemetryCodecOptions::default())?;
                (point, envelope.protocol)
            }
            OpenedPayload::JsonFallback(point) => (point, Protocol::Json),
        };

        let validated = match expected_kind {
            Some(kind) => {
                self.validate(&point, kind)?;
                true
            }
            None => false,
        };

        self.record_decode(started, envelope.protocol, data.len());

        Ok(DeserializedTelemetry {
            data: point,
            validated,
            protocol,
        })
    }

    /// Encodes an ordered sequence of points as a single envelope.
    pub fn serialize_batch(
        &self,
        points: &[(TelemetryPoint, ValueKind)],
        options: &SerializeOptions,
    ) -> Result<SerializedTelemetry> {
        self.encode_points(MessageKind::TelemetryBatch, points, options)
    }

    pub fn deserialize_batch(&self, data: &[u8], options: &DeserializeOptions) -> Result<Vec<TelemetryPoint>> {
        self.decode_points(MessageKind::TelemetryBatch, data, options)
    }

    /// Serializes buffered points for recovery across a reconnect.
    pub fn serialize_snapshot(&self, points: &[TelemetryPoint]) -> Result<SerializedTelemetry> {
        let with_kinds: Vec<(TelemetryPoint, ValueKind)> =
            points.iter().map(|p| (p.clone(), p.kind())).collect();
        let options = SerializeOptions::default()
            .with_protocol(Protocol::Bincode)
            .skip_validation();
        self.encode_points(MessageKind::BufferSnapshot, &with_kinds, &options)
    }

    pub fn deserialize_snapshot(&self, data: &[u8]) -> Result<Vec<TelemetryPoint>> {
        self.decode_points(MessageKind::BufferSnapshot, data, &DeserializeOptions::default())
    }

    pub fn get_performance_stats(&self) -> PerformanceStats {
        self.tracker
            .lock()
            .map(|tracker| tracker.snapshot())
            .unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        if let Ok(mut tracker) = self.tracker.lock() {
            *tracker = PerformanceTracker::new(self.config.stats_window);
        }
    }

    /// Writes `[protocol tag][envelope encoded by that protocol]`.
    pub fn encode_frame(&self, envelope: &SerializedEnvelope) -> Result<Bytes> {
        let codec = self.selector.codec(envelope.protocol)?;
        let body = codec.encode_envelope(envelope)?;

        let mut frame = BytesMut::with_capacity(body.len() + 1);
        frame.put_u8(envelope.protocol.tag());
        frame.put_slice(&body);

        debug::log_envelope("outbound", envelope);
        Ok(frame.freeze())
    }

    pub fn decode_frame(&self, data: &[u8]) -> Result<SerializedEnvelope> {
        let (&tag, body) = data
            .split_first()
            .ok_or_else(|| LinkError::Protocol("empty frame".to_string()))?;
        let protocol = Protocol::from_tag(tag)?;

        let codec = self.selector.codec(protocol)?;
        let envelope = codec.decode_envelope(body)?;

        if envelope.protocol != protocol {
            return Err(LinkError::Protocol(format!(
                "frame tagged {} carries {} envelope",
                protocol, envelope.protocol
            )));
        }

        debug::log_envelope("inbound", &envelope);
        Ok(envelope)
    }

    fn validate(&self, point: &TelemetryPoint, kind: ValueKind) -> Result<String> {
        self.registry.validate_point(point, kind).inspect_err(|e| {
            tracing::debug!(error = %e, %kind, "point rejected by schema");
            if let Ok(mut tracker) = self.tracker.lock() {
                tracker.stats.validation_failures += 1;
            }
        })
    }

    fn plan(&self, kind: ValueKind, estimated_size: usize, options: &SerializeOptions) -> Result<Protocol> {
        match options.protocol.or(self.config.default_protocol) {
            Some(protocol) => Ok(protocol),
            None => Ok(self.selector.get_telemetry_configuration(kind, estimated_size)?.protocol),
        }
    }

    /// Picks the algorithm from the encoded size; a pinned algorithm wins.
    fn choose_compression(&self, codec: &dyn ProtocolCodec, encoded_size: usize, options: &SerializeOptions) -> CompressionType {
        match options.compression {
            Some(pinned) => pinned,
            None if codec.supports_compression() => recommend_compression(
                encoded_size,
                self.config.compression_threshold,
                &codec.supported_compression_algorithms(),
            ),
            None => CompressionType::None,
        }
    }

    fn codec_options(&self, options: &SerializeOptions) -> TelemetryCodecOptions {
        TelemetryCodecOptions {
            precision: options.precision.or(self.config.default_precision),
        }
    }

    fn finish(
        &self,
        message_kind: MessageKind,
        codec: &dyn ProtocolCodec,
        encoded: Vec<u8>,
        schema_id: Option<String>,
        options: &SerializeOptions,
        started: Instant,
    ) -> Result<SerializedTelemetry> {
        let original_size = encoded.len();
        let compression = self.choose_compression(codec, original_size, options);

        let wants_compression = compression != CompressionType::None
            && codec.supported_compression_algorithms().contains(&compression)
            && self
                .compression
                .should_compress(original_size, self.config.compression_threshold);

        let (payload, compression) = if wants_compression {
            let compressed = self.compression.compress(&encoded, compression)?.into_owned();
            debug::trace_compression(compression.name(), original_size, compressed.len());
            if compressed.len() < original_size {
                (Bytes::from(compressed), compression)
            } else {
                (Bytes::from(encoded), CompressionType::None)
            }
        } else {
            (Bytes::from(encoded), CompressionType::None)
        };

        let compressed = compression != CompressionType::None;
        let compressed_size = payload.len();

        let mut envelope = SerializedEnvelope::new(message_kind, codec.protocol(), payload);
        envelope.compressed = compressed;
        envelope.compression = compression;
        envelope.schema_id = schema_id;
        if options.checksum.unwrap_or(self.config.enable_checksum) {
            envelope.checksum = Some(checksum(&envelope.payload));
        }

        let bytes = self.encode_frame(&envelope)?;

        let elapsed = started.elapsed().as_micros();
        debug::trace_serialization(codec.protocol().name(), bytes.len(), elapsed);
        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.record_encode(elapsed as u64, original_size, compressed_size, compressed);
        }

        Ok(SerializedTelemetry {
            bytes,
            envelope_id: envelope.id,
            protocol: codec.protocol(),
            original_size,
            compressed_size,
            compressed,
            compression,
        })
    }

    fn open_payload(&self, envelope: &SerializedEnvelope, options: &DeserializeOptions) -> Result<OpenedPayload> {
        if options.verify_checksum {
            if let Some(expected) = envelope.checksum {
                let actual = checksum(&envelope.payload);
                if actual != expected {
                    if let Ok(mut tracker) = self.tracker.lock() {
                        tracker.stats.integrity_failures += 1;
                    }
                    tracing::warn!(envelope_id = envelope.id, expected, actual, "checksum mismatch");

                    if options.fallback_to_json {
                        return self.json_fallback(envelope).map(OpenedPayload::JsonFallback);
                    }
                    return Err(LinkError::Integrity(format!(
                        "checksum mismatch on envelope {}: expected {:08x}, got {:08x}",
                        envelope.id, expected, actual
                    )));
                }
            }
        }

        let payload = if envelope.compressed {
            self.compression
                .decompress(&envelope.payload, envelope.compression)?
                .into_owned()
        } else {
            envelope.payload.to_vec()
        };

        Ok(OpenedPayload::Verified(payload))
    }

    fn json_fallback(&self, envelope: &SerializedEnvelope) -> Result<TelemetryPoint> {
        let raw = if envelope.compressed {
            self.compression
                .decompress(&envelope.payload, envelope.compression)
                .map(|p| p.into_owned())
                .unwrap_or_else(|_| envelope.payload.to_vec())
        } else {
            envelope.payload.to_vec()
        };

        JsonCodec::new()
            .decode_telemetry(&raw, &TelemetryCodecOptions::default())
            .map_err(|e| {
                LinkError::Integrity(format!(
                    "checksum mismatch on envelope {} and JSON fallback failed: {}",
                    envelope.id, e
                ))
            })
    }

    fn encode_points(
        &self,
        message_kind: MessageKind,
        points: &[(TelemetryPoint, ValueKind)],
        options: &SerializeOptions,
    ) -> Result<SerializedTelemetry> {
        let started = Instant::now();

        if !options.skip_validation {
            for (point, kind) in points {
                self.validate(point, *kind)?;
            }
        }

        let estimated_size: usize = points.iter().map(|(p, _)| p.estimated_bytes()).sum();
        let dominant = dominant_kind(points);
        let protocol = self.plan(dominant, estimated_size, options)?;
        let codec = self.selector.codec(protocol)?;

        let batch = TelemetryBatch {
            points: points.iter().map(|(p, _)| p.clone()).collect(),
        };
        let encoded = codec.encode_batch(&batch, &self.codec_options(options))?;

        self.finish(message_kind, codec.as_ref(), encoded, None, options, started)
    }

    fn decode_points(
        &self,
        message_kind: MessageKind,
        data: &[u8],
        options: &DeserializeOptions,
    ) -> Result<Vec<TelemetryPoint>> {
        let started = Instant::now();
        let envelope = self.decode_frame(data)?;
        expect_kind(&envelope, message_kind)?;

        let payload = match self.open_payload(&envelope, &DeserializeOptions {
            fallback_to_json: false,
            ..options.clone()
        })? {
            OpenedPayload::Verified(payload) => payload,
            OpenedPayload::JsonFallback(_) => {
                return Err(LinkError::Integrity("batch payloads have no JSON fallback".to_string()));
            }
        };

        let codec = self.selector.codec(envelope.protocol)?;
        let batch = codec.decode_batch(&payload)?;
        self.record_decode(started, envelope.protocol, data.len());

        Ok(batch.points)
    }

    fn record_decode(&self, started: Instant, protocol: Protocol, size: usize) {
        let elapsed = started.elapsed().as_micros();
        debug::trace_deserialization(protocol.name(), size, elapsed);
        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.record_decode(elapsed as u64);
        }
    }
}

impl Default for SerializationManager {
    fn default() -> Self {
        Self::with_config(SerializationConfig::default())
    }
}

enum OpenedPayload {
    Verified(Vec<u8>),
    JsonFallback(TelemetryPoint),
}

fn expect_kind(envelope: &SerializedEnvelope, expected: MessageKind) -> Result<()> {
    if envelope.message_kind == expected {
        Ok(())
    } else {
        Err(LinkError::Protocol(format!(
            "expected {:?} envelope, got {:?}",
            expected, envelope.message_kind
        )))
    }
}

fn dominant_kind(points: &[(TelemetryPoint, ValueKind)]) -> ValueKind {
    if points.is_empty() {
        return ValueKind::Numeric;
    }
    let mut counts = [0usize; 6];
    for (_, kind) in points {
        counts[*kind as usize] += 1;
    }
    ValueKind::ALL
        .into_iter()
        .max_by_key(|kind| counts[*kind as usize])
        .unwrap_or(ValueKind::Numeric)
}
