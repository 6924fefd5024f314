pub mod protocol;
pub mod transport;
pub mod serialization;
pub mod compression;
pub mod codec;
pub mod selector;
pub mod schema;
pub mod error;
pub mod buffer;
pub mod events;
pub mod optimization;
pub mod client;
pub mod debug;

#[cfg(feature = "async")]
pub mod worker;

pub use protocol::{
    StreamId, EnvelopeId, Timestamp,
    ValueKind, FieldValue, TelemetryValue, TelemetryPoint, TelemetryBatch,
    Protocol, CompressionType, MessageKind, SerializedEnvelope,
};

pub use serialization::{
    SerializationManager, SerializationConfig,
    SerializeOptions, DeserializeOptions,
    SerializedTelemetry, DeserializedTelemetry,
    PerformanceStats, LatencySummary,
};

pub use codec::{
    ProtocolCodec, TelemetryCodecOptions,
    MessagePackCodec, BincodeCodec, JsonCodec,
};

pub use selector::{
    CodecSelector, PayloadProfile, Recommendation, TelemetryConfiguration,
};

pub use compression::CompressionManager;

pub use schema::{
    SchemaRegistry, SchemaVersion, TelemetrySchema, ShapeRules,
};

pub use buffer::{
    StreamBuffer, BufferConfig, BufferConfigPatch, BufferState, BufferStatistics, BufferQuery,
    OverflowStrategy, FlushTrigger, FlushBatch, PushOutcome, HealthReport,
};

pub use events::{
    BufferEvent, EventBus,
};

pub use optimization::{
    OptimizationRecommendation, OptimizationPolicy, ImpactLevel, RecommendationKind,
};

pub use client::{
    BufferedStreamClient, ClientConfig, ClientReport, StreamDescriptor, Priority,
    ConnectionState, DataQuery, BufferedData, Clock, SystemClock, ManualClock,
};

pub use transport::{
    Transport, MemoryTransport,
};

#[cfg(feature = "async")]
pub use transport::{AsyncTransport, ChannelTransport};

#[cfg(feature = "async")]
pub use worker::{EncodeWorker, CancelOutcome};

pub use error::{
    LinkError, CodecError, Result,
};

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_envelope, trace_serialization, trace_deserialization,
    trace_compression, trace_flush,
    format_bytes, envelope_summary,
};
