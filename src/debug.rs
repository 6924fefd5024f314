use crate::buffer::FlushTrigger;
use crate::protocol::{MessageKind, SerializedEnvelope};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `TELEMETRY_LINK_DEBUG=1`: Dump every envelope as pretty JSON at debug level
/// - `TELEMETRY_LINK_TRACE=1`: Emit per-operation traces (encode, decode, compress, flush)
///
/// Output goes through `tracing`; install a subscriber to see it.
pub fn init_debug_mode() {
    let debug = env::var("TELEMETRY_LINK_DEBUG").is_ok();
    let trace = env::var("TELEMETRY_LINK_TRACE").is_ok();

    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);

    if debug {
        tracing::info!("debug mode enabled, envelopes will be logged as JSON");
    }

    if trace {
        tracing::info!("trace mode enabled, operations will be logged");
    }
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Log an envelope in JSON format if debug mode is enabled
pub fn log_envelope(direction: &str, envelope: &SerializedEnvelope) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string_pretty(envelope) {
        Ok(json) => tracing::debug!(direction, "{} envelope:\n{}", envelope_summary(envelope), json),
        Err(e) => tracing::warn!(error = %e, "failed to render envelope as JSON"),
    }
}

pub fn trace_serialization(protocol: &str, size_bytes: usize, duration_micros: u128) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!(protocol, size = %format_bytes(size_bytes), duration_micros, "serialized");
}

pub fn trace_deserialization(protocol: &str, size_bytes: usize, duration_micros: u128) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!(protocol, size = %format_bytes(size_bytes), duration_micros, "deserialized");
}

pub fn trace_compression(algorithm: &str, original_size: usize, compressed_size: usize) {
    if !is_trace_enabled() {
        return;
    }

    let ratio = crate::compression::compression_ratio(original_size, compressed_size);
    tracing::trace!(
        algorithm,
        original = %format_bytes(original_size),
        compressed = %format_bytes(compressed_size),
        "compression ratio {:.2}x",
        ratio
    );
}

pub fn trace_flush(stream_id: &str, trigger: FlushTrigger, point_count: usize) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!(stream_id, ?trigger, point_count, "flushed buffer");
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

pub fn envelope_summary(envelope: &SerializedEnvelope) -> String {
    let kind = match envelope.message_kind {
        MessageKind::Telemetry => "Telemetry",
        MessageKind::TelemetryBatch => "TelemetryBatch",
        MessageKind::BufferSnapshot => "BufferSnapshot",
        MessageKind::Control => "Control",
    };

    let compression = if envelope.compressed {
        format!(", {}", envelope.compression)
    } else {
        String::new()
    };

    format!(
        "{} (id: {}, {}, {}{})",
        kind,
        envelope.id,
        envelope.protocol,
        format_bytes(envelope.payload.len()),
        compression
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CompressionType, Protocol};
    use bytes::Bytes;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_envelope_summary() {
        let mut envelope = SerializedEnvelope::new(MessageKind::TelemetryBatch, Protocol::Bincode, Bytes::from_static(&[0; 10]));
        envelope.id = 7;
        envelope.compressed = true;
        envelope.compression = CompressionType::Lz4;

        assert_eq!(envelope_summary(&envelope), "TelemetryBatch (id: 7, bincode, 10 bytes, lz4)");
    }

    #[test]
    fn test_debug_mode_initialization() {
        // Should not crash without env vars
        init_debug_mode();
    }
}
