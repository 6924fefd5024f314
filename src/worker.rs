//! Off-thread batch encoding.
//!
//! Encoding runs on tokio's blocking pool. Results are handed back per stream
//! in submission order; there is no ordering across streams.

use crate::error::{LinkError, Result};
use crate::protocol::{StreamId, TelemetryPoint, ValueKind};
use crate::serialization::{SerializationManager, SerializeOptions, SerializedTelemetry};
use ahash::AHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type EncodeHandle = JoinHandle<Result<SerializedTelemetry>>;

#[derive(Debug, Default)]
pub struct CancelOutcome {
    pub completed: Vec<SerializedTelemetry>,
    pub failed: usize,
    pub abandoned: usize,
}

pub struct EncodeWorker {
    serializer: Arc<SerializationManager>,
    pending: AHashMap<StreamId, VecDeque<EncodeHandle>>,
}

impl EncodeWorker {
    pub fn new(serializer: Arc<SerializationManager>) -> Self {
        Self {
            serializer,
            pending: AHashMap::new(),
        }
    }

    pub fn submit(&mut self, stream_id: &str, points: Vec<(TelemetryPoint, ValueKind)>, options: SerializeOptions) {
        let serializer = Arc::clone(&self.serializer);
        let handle = tokio::task::spawn_blocking(move || serializer.serialize_batch(&points, &options));

        self.pending
            .entry(stream_id.to_string())
            .or_default()
            .push_back(handle);
    }

    pub fn pending_count(&self, stream_id: &str) -> usize {
        self.pending.get(stream_id).map_or(0, VecDeque::len)
    }

    /// Awaits every outstanding job for the stream, oldest first.
    pub async fn drain(&mut self, stream_id: &str) -> Vec<Result<SerializedTelemetry>> {
        let Some(queue) = self.pending.remove(stream_id) else {
            return Vec::new();
        };

        let mut results = Vec::with_capacity(queue.len());
        for handle in queue {
            results.push(join(handle).await);
        }
        results
    }

    /// Awaits outstanding jobs until `timeout` elapses, then aborts the rest.
    pub async fn cancel(&mut self, stream_id: &str, timeout: Duration) -> CancelOutcome {
        let mut outcome = CancelOutcome::default();
        let Some(queue) = self.pending.remove(stream_id) else {
            return outcome;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        for mut handle in queue {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => match flatten(joined) {
                    Ok(serialized) => outcome.completed.push(serialized),
                    Err(e) => {
                        tracing::warn!(stream_id, error = %e, "encode job failed during cancel");
                        outcome.failed += 1;
                    }
                },
                Err(_) => {
                    handle.abort();
                    outcome.abandoned += 1;
                }
            }
        }

        if outcome.abandoned > 0 {
            tracing::warn!(
                stream_id,
                abandoned = outcome.abandoned,
                timeout_ms = timeout.as_millis() as u64,
                "abandoned encode jobs after timeout"
            );
        }

        outcome
    }
}

async fn join(handle: EncodeHandle) -> Result<SerializedTelemetry> {
    flatten(handle.await)
}

fn flatten(joined: std::result::Result<Result<SerializedTelemetry>, tokio::task::JoinError>) -> Result<SerializedTelemetry> {
    joined.map_err(|e| LinkError::Unknown(format!("encode task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, FlushTrigger};
    use crate::client::{BufferedStreamClient, ClientConfig, ManualClock, StreamDescriptor};
    use crate::serialization::DeserializeOptions;
    use crate::transport::{AsyncTransport, ChannelTransport, MemoryTransport};

    fn batch(values: &[f64]) -> Vec<(TelemetryPoint, ValueKind)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (TelemetryPoint::new(i as i64, *v), ValueKind::Numeric))
            .collect()
    }

    #[tokio::test]
    async fn test_drain_preserves_submission_order() {
        let serializer = Arc::new(SerializationManager::default());
        let mut worker = EncodeWorker::new(Arc::clone(&serializer));

        for value in [1.0, 2.0, 3.0] {
            worker.submit("rpm", batch(&[value]), SerializeOptions::default());
        }
        assert_eq!(worker.pending_count("rpm"), 3);

        let results = worker.drain("rpm").await;
        assert_eq!(worker.pending_count("rpm"), 0);

        let values: Vec<f64> = results
            .into_iter()
            .map(|r| {
                let decoded = serializer
                    .deserialize_batch(&r.unwrap().bytes, &DeserializeOptions::default())
                    .unwrap();
                decoded[0].value.as_f64().unwrap()
            })
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_cancel_with_generous_timeout_completes() {
        let mut worker = EncodeWorker::new(Arc::new(SerializationManager::default()));
        worker.submit("rpm", batch(&[1.0, 2.0]), SerializeOptions::default());

        let outcome = worker.cancel("rpm", Duration::from_secs(5)).await;
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.abandoned, 0);
        assert_eq!(worker.pending_count("rpm"), 0);

        let empty = worker.cancel("unknown", Duration::from_millis(1)).await;
        assert!(empty.completed.is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_reported() {
        let mut worker = EncodeWorker::new(Arc::new(SerializationManager::default()));
        let invalid = vec![(TelemetryPoint::new(0, "invalid"), ValueKind::Numeric)];
        worker.submit("rpm", invalid, SerializeOptions::default());

        let results = worker.drain("rpm").await;
        assert!(matches!(results[0], Err(LinkError::Validation(_))));
    }

    #[tokio::test]
    async fn test_offloaded_flush_over_channel() {
        let config = ClientConfig::new()
            .with_default_buffer(BufferConfig::new().with_flush_triggers(&[FlushTrigger::Manual]));
        let mut client = BufferedStreamClient::new(MemoryTransport::new(), config)
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(0)));
        client.subscribe(StreamDescriptor::new("rpm", ValueKind::Numeric)).unwrap();
        for ts in 0..4 {
            client.push_point("rpm", TelemetryPoint::new(ts, ts as f64)).unwrap();
        }

        let mut worker = EncodeWorker::new(Arc::clone(client.serializer()));
        let points = client.take_flush_batch("rpm").unwrap();
        worker.submit("rpm", points, SerializeOptions::default());

        let (mut transport, mut outgoing, _incoming) = ChannelTransport::new(4);
        for result in worker.drain("rpm").await {
            transport.send(result.unwrap().bytes).await.unwrap();
        }

        let frame = outgoing.recv().await.unwrap();
        let decoded = client
            .serializer()
            .deserialize_batch(&frame, &DeserializeOptions::default())
            .unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(client.get_buffer_statistics("rpm").unwrap().size, 0);
    }
}
