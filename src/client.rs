use crate::buffer::{
    BufferConfig, BufferConfigPatch, BufferQuery, BufferStatistics, FlushBatch, FlushTrigger, OverflowStrategy,
    PushOutcome, StreamBuffer, DEFAULT_HEALTH_WARNING_THRESHOLD,
};
use crate::debug;
use crate::error::{LinkError, Result};
use crate::events::{BufferEvent, EventBus};
use crate::optimization::{self, OptimizationPolicy, OptimizationRecommendation, MAX_CAPACITY, MIN_WINDOW_MS};
use crate::protocol::*;
use crate::serialization::{DeserializeOptions, PerformanceStats, SerializationManager, SerializeOptions};
use crate::transport::Transport;
use ahash::AHashMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Fixed per-point overhead used when projecting a new buffer's footprint.
const PROJECTED_POINT_BYTES: usize = 56;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        now_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { now: AtomicI64::new(start) }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream_id: StreamId,
    pub name: String,
    pub kind: ValueKind,
    pub sample_rate_hz: Option<f64>,
    pub priority: Priority,
}

impl StreamDescriptor {
    pub fn new(stream_id: impl Into<StreamId>, kind: ValueKind) -> Self {
        let stream_id = stream_id.into();
        Self {
            name: stream_id.clone(),
            stream_id,
            kind,
            sample_rate_hz: None,
            priority: Priority::Normal,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sample_rate(mut self, hz: f64) -> Self {
        self.sample_rate_hz = Some(hz);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub default_buffer: BufferConfig,
    pub memory_limit_bytes: usize,
    pub enable_persistence: bool,
    pub auto_optimize: bool,
    pub optimization: OptimizationPolicy,
    pub health_warning_threshold: f64,
    pub high_rate_threshold_hz: f64,
    pub very_high_rate_threshold_hz: f64,
    /// Pin the protocol used for flushed batches; otherwise the selector decides.
    pub flush_protocol: Option<Protocol>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_buffer: BufferConfig::default(),
            memory_limit_bytes: 50 * 1024 * 1024,
            enable_persistence: true,
            auto_optimize: false,
            optimization: OptimizationPolicy::default(),
            health_warning_threshold: DEFAULT_HEALTH_WARNING_THRESHOLD,
            high_rate_threshold_hz: 100.0,
            very_high_rate_threshold_hz: 1000.0,
            flush_protocol: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_default_buffer(mut self, config: BufferConfig) -> Self {
        self.default_buffer = config;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.enable_persistence = enabled;
        self
    }

    pub fn with_auto_optimize(mut self, enabled: bool) -> Self {
        self.auto_optimize = enabled;
        self
    }

    pub fn with_optimization_policy(mut self, policy: OptimizationPolicy) -> Self {
        self.optimization = policy;
        self
    }

    pub fn with_health_warning_threshold(mut self, threshold: f64) -> Self {
        self.health_warning_threshold = threshold;
        self
    }

    pub fn with_flush_protocol(mut self, protocol: Protocol) -> Self {
        self.flush_protocol = Some(protocol);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.default_buffer.validate()?;
        if !(0.0..=1.0).contains(&self.optimization.confidence_threshold) {
            return Err(LinkError::Config(format!(
                "confidence threshold {} outside [0, 1]",
                self.optimization.confidence_threshold
            )));
        }
        if self.high_rate_threshold_hz > self.very_high_rate_threshold_hz {
            return Err(LinkError::Config(
                "high_rate_threshold_hz exceeds very_high_rate_threshold_hz".to_string(),
            ));
        }
        Ok(())
    }

    /// Buffer configuration for a newly subscribed stream.
    pub fn derive_buffer_config(&self, descriptor: &StreamDescriptor) -> BufferConfig {
        let mut config = self.default_buffer.clone();

        if let Some(rate) = descriptor.sample_rate_hz.filter(|r| r.is_finite() && *r > 0.0) {
            if rate >= self.high_rate_threshold_hz {
                let divisor = if rate >= self.very_high_rate_threshold_hz { 5 } else { 2 };
                config.window_size_ms = (config.window_size_ms / divisor).max(MIN_WINDOW_MS);

                let window_s = config.window_size_ms as f64 / 1000.0;
                config.capacity = ((rate * window_s).round() as usize).clamp(100, MAX_CAPACITY);
            }
        }

        match descriptor.priority {
            Priority::Low => {
                config.capacity = (config.capacity / 2).max(1);
                config.overflow_strategy = OverflowStrategy::Downsample;
                config.downsample_factor = Some(2);
            }
            Priority::Normal => {}
            Priority::High => {
                config.capacity = (config.capacity * 2).min(MAX_CAPACITY);
            }
            Priority::Critical => {
                config.overflow_strategy = OverflowStrategy::DropOldest;
            }
        }

        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    Disconnected { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataQuery {
    pub count: Option<usize>,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub include_statistics: bool,
}

impl DataQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn between(mut self, start_time: Timestamp, end_time: Timestamp) -> Self {
        self.start_time = Some(start_time);
        self.end_time = Some(end_time);
        self
    }

    pub fn with_statistics(mut self) -> Self {
        self.include_statistics = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedData {
    pub points: Vec<TelemetryPoint>,
    pub statistics: Option<BufferStatistics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    pub points_ingested: u64,
    pub points_rejected: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub decode_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamReport {
    pub stream_id: StreamId,
    pub name: String,
    pub kind: ValueKind,
    pub priority: Priority,
    pub config: BufferConfig,
    pub statistics: BufferStatistics,
    pub issues: Vec<String>,
    pub memory_flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReport {
    pub generated_at: Timestamp,
    pub connection: ConnectionState,
    pub streams: Vec<StreamReport>,
    pub total_memory_bytes: usize,
    pub memory_limit_bytes: usize,
    pub memory_limit_exceeded: bool,
    pub overall_health: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<OptimizationRecommendation>,
    pub client: ClientStats,
    pub serialization: PerformanceStats,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceSummary {
    pub flushed_points: usize,
    pub health_warnings: usize,
    pub optimizations_applied: usize,
}

struct ManagedStream {
    descriptor: StreamDescriptor,
    buffer: StreamBuffer,
    memory_flagged: bool,
}

/// Owns one [`StreamBuffer`] per subscribed stream and moves flushed data to
/// the transport.
pub struct BufferedStreamClient<T: Transport> {
    transport: T,
    serializer: Arc<SerializationManager>,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    streams: AHashMap<StreamId, ManagedStream>,
    persisted: AHashMap<StreamId, Bytes>,
    events: EventBus,
    connection: ConnectionState,
    memory_limit_exceeded: bool,
    stats: ClientStats,
}

impl<T: Transport> BufferedStreamClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let connection = if transport.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected { reason: "transport not connected".to_string() }
        };

        Ok(Self {
            transport,
            serializer: Arc::new(SerializationManager::default()),
            config,
            clock: Arc::new(SystemClock),
            streams: AHashMap::new(),
            persisted: AHashMap::new(),
            events: EventBus::new(),
            connection,
            memory_limit_exceeded: false,
            stats: ClientStats::default(),
        })
    }

    pub fn with_serializer(mut self, serializer: Arc<SerializationManager>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn serializer(&self) -> &Arc<SerializationManager> {
        &self.serializer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn total_memory_bytes(&self) -> usize {
        self.streams.values().map(|s| s.buffer.memory_bytes()).sum()
    }

    pub fn subscribe_events(&mut self) -> Receiver<BufferEvent> {
        self.events.subscribe()
    }

    pub fn take_events(&mut self) -> Vec<BufferEvent> {
        self.events.drain()
    }

    /// Creates the stream's buffer. Subscribing an existing stream replaces
    /// its descriptor and re-derives the configuration in place.
    pub fn subscribe(&mut self, descriptor: StreamDescriptor) -> Result<()> {
        let config = self.config.derive_buffer_config(&descriptor);
        let stream_id = descriptor.stream_id.clone();

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            tracing::debug!(%stream_id, "resubscribing existing stream");
            stream.buffer.update_config(config)?;
            stream.descriptor = descriptor;
            return Ok(());
        }

        let buffer = StreamBuffer::new(stream_id.clone(), config.clone())?
            .with_health_threshold(self.config.health_warning_threshold);

        let projected = self.total_memory_bytes() + config.capacity * PROJECTED_POINT_BYTES;
        let memory_flagged = projected > self.config.memory_limit_bytes;

        tracing::info!(
            %stream_id,
            kind = %descriptor.kind,
            priority = ?descriptor.priority,
            capacity = config.capacity,
            window_size_ms = config.window_size_ms,
            "subscribed stream"
        );

        self.streams.insert(
            stream_id.clone(),
            ManagedStream {
                descriptor,
                buffer,
                memory_flagged,
            },
        );

        self.events.publish(BufferEvent::Created {
            stream_id,
            capacity: config.capacity,
            window_size_ms: config.window_size_ms,
        });

        if memory_flagged {
            self.events.publish(BufferEvent::MemoryLimit {
                total_bytes: projected,
                limit_bytes: self.config.memory_limit_bytes,
            });
        }

        Ok(())
    }

    /// Flushes once and destroys the buffer. Unknown ids are a no-op; returns
    /// whether a buffer was removed.
    pub fn unsubscribe(&mut self, stream_id: &str) -> bool {
        let Some(mut stream) = self.streams.remove(stream_id) else {
            tracing::debug!(stream_id, "unsubscribe for unknown stream ignored");
            return false;
        };

        let now = self.clock.now_millis();
        let batch = stream.buffer.flush(FlushTrigger::Manual, now);
        match self.send_batch(stream_id, stream.descriptor.kind, &batch) {
            Ok(bytes_sent) if !batch.points.is_empty() => {
                self.events.publish(BufferEvent::Flushed {
                    stream_id: stream_id.to_string(),
                    trigger: batch.trigger,
                    point_count: batch.points.len(),
                    bytes_sent,
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(stream_id, error = %e, dropped = batch.points.len(), "final flush failed");
                self.events.publish(BufferEvent::Error {
                    stream_id: Some(stream_id.to_string()),
                    message: format!("final flush failed: {}", e),
                });
            }
        }

        stream.buffer.destroy();
        self.persisted.remove(stream_id);
        self.events.publish(BufferEvent::Destroyed {
            stream_id: stream_id.to_string(),
        });
        self.check_memory();

        true
    }

    /// Validates the point against the stream's kind and buffers it. Returns
    /// whether the buffer kept it.
    pub fn push_point(&mut self, stream_id: &str, point: TelemetryPoint) -> Result<bool> {
        let now = self.clock.now_millis();
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| LinkError::StreamNotFound(stream_id.to_string()))?;

        if let Err(e) = self.serializer.registry().validate_point(&point, stream.descriptor.kind) {
            self.stats.points_rejected += 1;
            return Err(e);
        }

        let kind = stream.descriptor.kind;
        let outcome = stream.buffer.push(point, now);
        self.stats.points_ingested += 1;

        let accepted = outcome.accepted;
        self.process_outcome(stream_id, kind, outcome);
        self.check_memory();

        Ok(accepted)
    }

    /// Decodes a frame received for `stream_id` and buffers the point.
    pub fn handle_incoming(&mut self, stream_id: &str, data: &[u8], declared: Option<Protocol>) -> Result<bool> {
        let kind = self
            .streams
            .get(stream_id)
            .map(|s| s.descriptor.kind)
            .ok_or_else(|| LinkError::StreamNotFound(stream_id.to_string()))?;

        let decoded = self.decode_incoming(data, declared, kind);
        match decoded {
            Ok(point) => self.push_point(stream_id, point),
            Err(e) => {
                self.stats.decode_failures += 1;
                self.events.publish(BufferEvent::Error {
                    stream_id: Some(stream_id.to_string()),
                    message: format!("failed to decode incoming frame: {}", e),
                });
                Err(e)
            }
        }
    }

    /// Drains the transport's inbound queue into `stream_id`.
    pub fn poll_transport(&mut self, stream_id: &str) -> Result<usize> {
        let mut accepted = 0;
        while let Some((frame, declared)) = self.transport.receive()? {
            if self.handle_incoming(stream_id, &frame, declared)? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    pub fn get_buffered_data(&self, stream_id: &str, query: &DataQuery) -> Result<BufferedData> {
        let stream = self.stream(stream_id)?;

        let points = stream.buffer.query(&BufferQuery {
            count: query.count,
            start_time: query.start_time,
            end_time: query.end_time,
        });
        let statistics = query.include_statistics.then(|| stream.buffer.statistics());

        Ok(BufferedData { points, statistics })
    }

    pub fn get_buffer_statistics(&self, stream_id: &str) -> Result<BufferStatistics> {
        Ok(self.stream(stream_id)?.buffer.statistics())
    }

    pub fn get_buffer_config(&self, stream_id: &str) -> Result<BufferConfig> {
        Ok(self.stream(stream_id)?.buffer.config().clone())
    }

    /// Unknown ids publish an error event and return `Ok(false)`; an invalid
    /// resulting configuration is a `Config` error and leaves the buffer as is.
    pub fn update_buffer_config(&mut self, stream_id: &str, patch: &BufferConfigPatch) -> Result<bool> {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            self.events.publish(BufferEvent::Error {
                stream_id: Some(stream_id.to_string()),
                message: format!("cannot update config of unknown stream {}", stream_id),
            });
            return Ok(false);
        };

        let mut config = patch.apply_to(stream.buffer.config());
        if stream.descriptor.priority == Priority::Critical {
            config.overflow_strategy = OverflowStrategy::DropOldest;
        }

        let evicted = stream.buffer.update_config(config)?;
        tracing::debug!(stream_id, evicted, "buffer config updated");
        Ok(true)
    }

    /// Manually flushes one stream; returns the number of points sent.
    pub fn flush_buffer(&mut self, stream_id: &str) -> Result<usize> {
        let now = self.clock.now_millis();
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| LinkError::StreamNotFound(stream_id.to_string()))?;

        let kind = stream.descriptor.kind;
        let batch = stream.buffer.flush(FlushTrigger::Manual, now);
        self.dispatch(stream_id, kind, batch)
    }

    /// Flushes every stream. Per-stream failures are published as events and
    /// do not stop the remaining streams.
    pub fn flush_all_buffers(&mut self) -> usize {
        let mut flushed = 0;
        for stream_id in self.stream_ids() {
            match self.flush_buffer(&stream_id) {
                Ok(count) => flushed += count,
                Err(e) => tracing::warn!(%stream_id, error = %e, "flush failed"),
            }
        }
        flushed
    }

    /// Empties a stream through the manual trigger without sending, for hosts
    /// that encode off-thread.
    pub fn take_flush_batch(&mut self, stream_id: &str) -> Result<Vec<(TelemetryPoint, ValueKind)>> {
        let now = self.clock.now_millis();
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| LinkError::StreamNotFound(stream_id.to_string()))?;

        let kind = stream.descriptor.kind;
        let batch = stream.buffer.flush(FlushTrigger::Manual, now);
        Ok(batch.points.into_iter().map(|p| (p, kind)).collect())
    }

    pub fn get_optimization_recommendations(&self) -> Vec<OptimizationRecommendation> {
        self.sorted_streams()
            .flat_map(|(stream_id, stream)| {
                optimization::analyze(
                    stream_id,
                    &stream.buffer.statistics(),
                    stream.buffer.config(),
                    stream.descriptor.priority == Priority::Critical,
                    &self.config.optimization,
                )
            })
            .collect()
    }

    /// Applies recommendations at or above the confidence threshold; returns
    /// how many were applied.
    pub fn apply_optimizations(&mut self, recommendations: &[OptimizationRecommendation]) -> usize {
        let threshold = self.config.optimization.confidence_threshold;
        let mut applied = 0;

        for recommendation in recommendations {
            if !recommendation.is_applicable(threshold) {
                tracing::debug!(
                    stream_id = %recommendation.stream_id,
                    kind = ?recommendation.kind,
                    confidence = recommendation.confidence,
                    "recommendation below confidence threshold"
                );
                continue;
            }

            match self.update_buffer_config(&recommendation.stream_id, &recommendation.patch) {
                Ok(true) => {
                    applied += 1;
                    self.events.publish(BufferEvent::Optimized {
                        stream_id: recommendation.stream_id.clone(),
                        description: recommendation.description.clone(),
                        impact: recommendation.impact,
                        confidence: recommendation.confidence,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    self.events.publish(BufferEvent::Error {
                        stream_id: Some(recommendation.stream_id.clone()),
                        message: format!("optimization rejected: {}", e),
                    });
                }
            }
        }

        applied
    }

    pub fn get_comprehensive_report(&self) -> ClientReport {
        let mut issues = Vec::new();
        let mut streams = Vec::with_capacity(self.streams.len());

        for (stream_id, stream) in self.sorted_streams() {
            let health = stream.buffer.health();
            issues.extend(health.issues.iter().map(|issue| format!("{}: {}", stream_id, issue)));
            if stream.memory_flagged {
                issues.push(format!("{}: subscribed over the memory limit", stream_id));
            }

            streams.push(StreamReport {
                stream_id: stream_id.clone(),
                name: stream.descriptor.name.clone(),
                kind: stream.descriptor.kind,
                priority: stream.descriptor.priority,
                config: stream.buffer.config().clone(),
                statistics: stream.buffer.statistics(),
                issues: health.issues,
                memory_flagged: stream.memory_flagged,
            });
        }

        let overall_health = if streams.is_empty() {
            100.0
        } else {
            streams.iter().map(|s| s.statistics.health_score).sum::<f64>() / streams.len() as f64
        };

        let total_memory_bytes = self.total_memory_bytes();
        if self.memory_limit_exceeded {
            issues.push(format!(
                "buffered data {} exceeds memory limit {}",
                debug::format_bytes(total_memory_bytes),
                debug::format_bytes(self.config.memory_limit_bytes)
            ));
        }
        if let ConnectionState::Disconnected { reason } = &self.connection {
            issues.push(format!("transport disconnected: {}", reason));
        }

        ClientReport {
            generated_at: self.clock.now_millis(),
            connection: self.connection.clone(),
            streams,
            total_memory_bytes,
            memory_limit_bytes: self.config.memory_limit_bytes,
            memory_limit_exceeded: self.memory_limit_exceeded,
            overall_health,
            issues,
            recommendations: self.get_optimization_recommendations(),
            client: self.stats.clone(),
            serialization: self.serializer.get_performance_stats(),
        }
    }

    /// Periodic tick: time-window triggers, health, memory and, when enabled,
    /// automatic optimization.
    pub fn run_maintenance(&mut self) -> MaintenanceSummary {
        let now = self.clock.now_millis();
        let mut summary = MaintenanceSummary::default();

        for stream_id in self.stream_ids() {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            let kind = stream.descriptor.kind;
            let outcome = stream.buffer.tick(now);

            summary.health_warnings += usize::from(outcome.health_warning.is_some());
            summary.flushed_points += self.process_outcome(&stream_id, kind, outcome);
        }

        self.check_memory();

        if self.config.auto_optimize {
            let recommendations = self.get_optimization_recommendations();
            summary.optimizations_applied = self.apply_optimizations(&recommendations);
        }

        summary
    }

    /// On disconnect, buffered points are moved into serialized snapshots
    /// (when persistence is enabled). On reconnect, snapshots are restored
    /// into streams that are still subscribed; the rest are discarded.
    pub fn handle_connection_change(&mut self, state: ConnectionState) -> Result<()> {
        match &state {
            ConnectionState::Disconnected { reason } => {
                tracing::warn!(%reason, "transport disconnected");
                if self.config.enable_persistence {
                    self.persist_buffers();
                }
            }
            ConnectionState::Connected => {
                tracing::info!(pending = self.persisted.len(), "transport connected");
                self.restore_buffers();
            }
        }

        self.connection = state;
        Ok(())
    }

    /// Flushes and destroys every stream, then closes the transport.
    pub fn shutdown(&mut self) -> Result<()> {
        for stream_id in self.stream_ids() {
            self.unsubscribe(&stream_id);
        }
        self.transport.close()
    }

    fn stream(&self, stream_id: &str) -> Result<&ManagedStream> {
        self.streams
            .get(stream_id)
            .ok_or_else(|| LinkError::StreamNotFound(stream_id.to_string()))
    }

    fn sorted_streams(&self) -> impl Iterator<Item = (&StreamId, &ManagedStream)> {
        let mut streams: Vec<(&StreamId, &ManagedStream)> = self.streams.iter().collect();
        streams.sort_by(|a, b| a.0.cmp(b.0));
        streams.into_iter()
    }

    fn decode_incoming(&self, data: &[u8], declared: Option<Protocol>, kind: ValueKind) -> Result<TelemetryPoint> {
        if let Some(protocol) = declared {
            let tag = data
                .first()
                .copied()
                .ok_or_else(|| LinkError::Protocol("empty frame".to_string()))?;
            if tag != protocol.tag() {
                return Err(LinkError::Protocol(format!(
                    "declared {} but frame is tagged {}",
                    protocol, tag
                )));
            }
        }

        let decoded = self
            .serializer
            .deserialize_telemetry(data, Some(kind), &DeserializeOptions::default())?;
        Ok(decoded.data)
    }

    /// Publishes overflow and health events and dispatches any flushes.
    /// Returns the number of points sent.
    fn process_outcome(&mut self, stream_id: &str, kind: ValueKind, outcome: PushOutcome) -> usize {
        if let Some(overflow) = outcome.overflow {
            self.events.publish(BufferEvent::Overflow {
                stream_id: stream_id.to_string(),
                strategy: overflow.strategy,
                dropped_count: overflow.dropped_count,
            });
        }

        let link_down = !self.connection.is_connected() || !self.transport.is_connected();
        let mut sent = 0;
        for batch in outcome.flushes {
            if link_down {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.buffer.requeue_flush(batch);
                }
                continue;
            }
            match self.dispatch(stream_id, kind, batch) {
                Ok(count) => sent += count,
                Err(e) => tracing::debug!(stream_id, error = %e, "automatic flush not delivered"),
            }
        }

        if let Some(report) = outcome.health_warning {
            self.events.publish(BufferEvent::HealthWarning {
                stream_id: stream_id.to_string(),
                score: report.score,
                issues: report.issues,
            });
        }

        sent
    }

    /// Sends a flushed batch. Undeliverable points go back into the buffer.
    fn dispatch(&mut self, stream_id: &str, kind: ValueKind, batch: FlushBatch) -> Result<usize> {
        if batch.points.is_empty() {
            return Ok(0);
        }

        debug::trace_flush(stream_id, batch.trigger, batch.points.len());

        match self.send_batch(stream_id, kind, &batch) {
            Ok(bytes_sent) => {
                self.events.publish(BufferEvent::Flushed {
                    stream_id: stream_id.to_string(),
                    trigger: batch.trigger,
                    point_count: batch.points.len(),
                    bytes_sent,
                });
                Ok(batch.points.len())
            }
            Err(e) => {
                let count = batch.points.len();
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.buffer.requeue_flush(batch);
                }
                self.events.publish(BufferEvent::Error {
                    stream_id: Some(stream_id.to_string()),
                    message: format!("flush of {} points not delivered: {}", count, e),
                });
                Err(e)
            }
        }
    }

    fn send_batch(&mut self, stream_id: &str, kind: ValueKind, batch: &FlushBatch) -> Result<usize> {
        if batch.points.is_empty() {
            return Ok(0);
        }
        if !self.connection.is_connected() || !self.transport.is_connected() {
            return Err(LinkError::ConnectionClosed);
        }

        let points: Vec<(TelemetryPoint, ValueKind)> = batch.points.iter().map(|p| (p.clone(), kind)).collect();
        let mut options = SerializeOptions::default().skip_validation();
        if let Some(protocol) = self.config.flush_protocol {
            options = options.with_protocol(protocol);
        }

        let serialized = self.serializer.serialize_batch(&points, &options)?;
        if let Err(e) = self.transport.send(&serialized.bytes) {
            self.stats.send_failures += 1;
            return Err(e);
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += serialized.bytes.len() as u64;
        tracing::debug!(
            stream_id,
            points = points.len(),
            protocol = %serialized.protocol,
            bytes = serialized.bytes.len(),
            "sent batch"
        );

        Ok(serialized.bytes.len())
    }

    /// Moves every non-empty buffer into a snapshot. A stream whose snapshot
    /// cannot be written keeps its points in the buffer.
    fn persist_buffers(&mut self) {
        for stream_id in self.stream_ids() {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            if stream.buffer.is_empty() {
                continue;
            }

            let mut points = stream.buffer.take_all();
            if let Some(previous) = self.persisted.remove(&stream_id) {
                match self.serializer.deserialize_snapshot(&previous) {
                    Ok(mut earlier) => {
                        earlier.append(&mut points);
                        points = earlier;
                    }
                    Err(e) => {
                        self.events.publish(BufferEvent::Error {
                            stream_id: Some(stream_id.clone()),
                            message: format!("discarded unreadable snapshot: {}", e),
                        });
                    }
                }
            }

            match self.serializer.serialize_snapshot(&points) {
                Ok(snapshot) => {
                    let bytes = snapshot.bytes.len();
                    self.persisted.insert(stream_id.clone(), snapshot.bytes);
                    self.events.publish(BufferEvent::PersistentSaved {
                        stream_id,
                        point_count: points.len(),
                        bytes,
                    });
                }
                Err(e) => {
                    let count = points.len();
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.buffer.requeue(points);
                    }
                    self.events.publish(BufferEvent::Error {
                        stream_id: Some(stream_id.clone()),
                        message: format!("snapshot of {} points failed, kept in buffer: {}", count, e),
                    });
                }
            }
        }

        self.check_memory();
    }

    fn restore_buffers(&mut self) {
        for (stream_id, snapshot) in std::mem::take(&mut self.persisted) {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                tracing::debug!(%stream_id, "discarding snapshot of unsubscribed stream");
                continue;
            };

            match self.serializer.deserialize_snapshot(&snapshot) {
                Ok(points) => {
                    let restored = stream.buffer.requeue(points);
                    tracing::info!(%stream_id, restored, "restored buffered points");
                }
                Err(e) => {
                    self.events.publish(BufferEvent::Error {
                        stream_id: Some(stream_id.clone()),
                        message: format!("failed to restore snapshot: {}", e),
                    });
                }
            }
        }

        self.check_memory();
    }

    /// Advisory only: publishes once per crossing of the limit.
    fn check_memory(&mut self) {
        let total = self.total_memory_bytes();
        if total > self.config.memory_limit_bytes {
            if !self.memory_limit_exceeded {
                self.memory_limit_exceeded = true;
                self.events.publish(BufferEvent::MemoryLimit {
                    total_bytes: total,
                    limit_bytes: self.config.memory_limit_bytes,
                });
            }
        } else {
            self.memory_limit_exceeded = false;
        }
    }
}
