use std::collections::BTreeMap;
use std::sync::Arc;
use telemetry_link::{
    BufferConfig, BufferEvent, BufferedStreamClient, ClientConfig, ConnectionState, DataQuery, DeserializeOptions,
    FieldValue, FlushTrigger, ImpactLevel, LinkError, ManualClock, MemoryTransport, OptimizationPolicy,
    OverflowStrategy, Priority, Protocol, SerializeOptions, StreamDescriptor, TelemetryPoint, TelemetryValue,
    Transport, ValueKind,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client_with(config: ClientConfig) -> (BufferedStreamClient<MemoryTransport>, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(10_000));
    let client = BufferedStreamClient::new(MemoryTransport::new(), config)
        .unwrap()
        .with_clock(clock.clone());
    (client, clock)
}

#[test]
fn test_drop_oldest_scenario_through_client() {
    let config = ClientConfig::new().with_default_buffer(
        BufferConfig::new()
            .with_capacity(5)
            .with_overflow_strategy(OverflowStrategy::DropOldest)
            .with_flush_triggers(&[FlushTrigger::Manual]),
    );
    let (mut client, _) = client_with(config);
    client.subscribe(StreamDescriptor::new("speed", ValueKind::Numeric)).unwrap();

    for (ts, value) in [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0), (5, 50.0), (6, 60.0)] {
        client.push_point("speed", TelemetryPoint::new(ts, value)).unwrap();
    }

    let data = client.get_buffered_data("speed", &DataQuery::new().with_statistics()).unwrap();
    let values: Vec<f64> = data.points.iter().filter_map(|p| p.value.as_f64()).collect();
    assert_eq!(values, vec![20.0, 30.0, 40.0, 50.0, 60.0]);
    assert_eq!(data.statistics.unwrap().total_dropped, 1);
}

#[test]
fn test_flush_round_trips_through_transport() {
    let config = ClientConfig::new()
        .with_default_buffer(BufferConfig::new().with_flush_triggers(&[FlushTrigger::Manual]))
        .with_flush_protocol(Protocol::Bincode);
    let (mut client, _) = client_with(config);
    client.subscribe(StreamDescriptor::new("accel", ValueKind::Matrix)).unwrap();

    let matrix = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
    client.push_point("accel", TelemetryPoint::new(9_990, matrix.clone())).unwrap();
    client.push_point("accel", TelemetryPoint::new(9_995, matrix.clone())).unwrap();

    assert_eq!(client.flush_buffer("accel").unwrap(), 2);

    let frames = client.transport_mut().take_sent();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][0], Protocol::Bincode.tag());

    let points = client
        .serializer()
        .deserialize_batch(&frames[0], &DeserializeOptions::default())
        .unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].value, TelemetryValue::Matrix(matrix));
}

#[test]
fn test_incoming_frames_feed_buffers() {
    let (mut client, _) = client_with(ClientConfig::new());
    client.subscribe(StreamDescriptor::new("tyres", ValueKind::Object)).unwrap();

    let mut fields = BTreeMap::new();
    fields.insert("fl".to_string(), FieldValue::Number(82.5));
    fields.insert("compound".to_string(), FieldValue::String("soft".to_string()));
    let point = TelemetryPoint::new(9_999, TelemetryValue::Object(fields));

    for protocol in Protocol::ALL {
        let serialized = client
            .serializer()
            .serialize_telemetry(&point, ValueKind::Object, &SerializeOptions::default().with_protocol(protocol))
            .unwrap();
        client.transport_mut().inject(serialized.bytes, Some(protocol));
    }

    assert_eq!(client.poll_transport("tyres").unwrap(), 3);
    let data = client.get_buffered_data("tyres", &DataQuery::new()).unwrap();
    assert_eq!(data.points.len(), 3);
    assert!(data.points.iter().all(|p| *p == point));
}

#[test]
fn test_corrupted_frame_is_reported_not_buffered() {
    let (mut client, _) = client_with(ClientConfig::new());
    client.subscribe(StreamDescriptor::new("rpm", ValueKind::Numeric)).unwrap();
    client.take_events();

    let result = client.handle_incoming("rpm", &[0xEE, 1, 2, 3], None);
    assert!(matches!(result, Err(LinkError::Protocol(_))));

    let events = client.take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name(), "buffer:error");
    assert_eq!(client.get_buffer_statistics("rpm").unwrap().size, 0);
    assert_eq!(client.stats().decode_failures, 1);
}

#[test]
fn test_event_observer_sees_lifecycle() {
    let config = ClientConfig::new().with_default_buffer(
        BufferConfig::new()
            .with_capacity(2)
            .with_flush_triggers(&[FlushTrigger::Manual]),
    );
    let (mut client, _) = client_with(config);
    let events = client.subscribe_events();

    client.subscribe(StreamDescriptor::new("rpm", ValueKind::Numeric)).unwrap();
    for ts in 0..3 {
        client.push_point("rpm", TelemetryPoint::new(9_000 + ts, 1.0)).unwrap();
    }
    client.unsubscribe("rpm");
    client.unsubscribe("rpm");

    let names: Vec<&str> = events.try_iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"buffer:created"));
    assert!(names.contains(&"buffer:overflow"));
    assert!(names.contains(&"buffer:flushed"));
    assert_eq!(names.last(), Some(&"buffer:destroyed"));
    assert_eq!(names.iter().filter(|n| **n == "buffer:destroyed").count(), 1);
}

#[test]
fn test_auto_optimize_during_maintenance() {
    let config = ClientConfig::new()
        .with_default_buffer(
            BufferConfig::new()
                .with_capacity(10)
                .with_flush_triggers(&[FlushTrigger::Manual]),
        )
        .with_auto_optimize(true)
        .with_optimization_policy(OptimizationPolicy::new().with_confidence_threshold(0.5));
    let (mut client, _) = client_with(config);
    client.subscribe(StreamDescriptor::new("rpm", ValueKind::Numeric)).unwrap();

    for ts in 0..60 {
        client
            .push_point("rpm", TelemetryPoint::new(9_000 + ts, 1.0).with_quality(0.2))
            .unwrap();
    }

    let report = client.get_comprehensive_report();
    assert!(report.overall_health < 50.0);
    assert!(report.recommendations.iter().any(|r| r.impact == ImpactLevel::High));
    assert!(!report.issues.is_empty());

    client.take_events();
    let summary = client.run_maintenance();
    assert!(summary.optimizations_applied > 0);

    let config = client.get_buffer_config("rpm").unwrap();
    assert_eq!(config.overflow_strategy, OverflowStrategy::Downsample);
    assert_eq!(config.capacity, 20);
    assert!(client
        .take_events()
        .iter()
        .any(|e| matches!(e, BufferEvent::Optimized { stream_id, .. } if stream_id == "rpm")));
}

#[test]
fn test_disconnect_persists_and_reconnect_restores() {
    let config = ClientConfig::new()
        .with_default_buffer(BufferConfig::new().with_flush_triggers(&[FlushTrigger::Manual]));
    let (mut client, _) = client_with(config);
    client
        .subscribe(StreamDescriptor::new("brake", ValueKind::Numeric).with_priority(Priority::Critical))
        .unwrap();

    for ts in 0..5 {
        client.push_point("brake", TelemetryPoint::new(9_000 + ts, ts as f64)).unwrap();
    }

    client.transport_mut().disconnect();
    client
        .handle_connection_change(ConnectionState::Disconnected { reason: "timeout".to_string() })
        .unwrap();
    assert!(client.flush_buffer("brake").unwrap() == 0);

    client.push_point("brake", TelemetryPoint::new(9_010, 10.0)).unwrap();
    assert!(client.flush_buffer("brake").is_err());

    client.transport_mut().reconnect();
    client.handle_connection_change(ConnectionState::Connected).unwrap();

    assert_eq!(client.flush_buffer("brake").unwrap(), 6);
    let frames = client.transport_mut().take_sent();
    let points = client
        .serializer()
        .deserialize_batch(&frames[0], &DeserializeOptions::default())
        .unwrap();
    let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
    assert_eq!(timestamps, vec![9_000, 9_001, 9_002, 9_003, 9_004, 9_010]);
}

#[test]
fn test_shutdown_flushes_everything() {
    let config = ClientConfig::new()
        .with_default_buffer(BufferConfig::new().with_flush_triggers(&[FlushTrigger::Manual]));
    let (mut client, _) = client_with(config);
    for id in ["a", "b"] {
        client.subscribe(StreamDescriptor::new(id, ValueKind::Boolean)).unwrap();
        client.push_point(id, TelemetryPoint::new(9_500, true)).unwrap();
    }

    let sent_before = client.stats().frames_sent;
    client.shutdown().unwrap();

    assert!(client.stream_ids().is_empty());
    assert_eq!(client.stats().frames_sent, sent_before + 2);
    assert!(!client.transport().is_connected());
}
