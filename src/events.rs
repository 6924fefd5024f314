//! Buffer lifecycle events and the observer list that fans them out.

use crate::buffer::{FlushTrigger, OverflowStrategy};
use crate::optimization::ImpactLevel;
use crate::protocol::StreamId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

const DEFAULT_QUEUE_LIMIT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BufferEvent {
    Created {
        stream_id: StreamId,
        capacity: usize,
        window_size_ms: u64,
    },
    Flushed {
        stream_id: StreamId,
        trigger: FlushTrigger,
        point_count: usize,
        bytes_sent: usize,
    },
    Overflow {
        stream_id: StreamId,
        strategy: OverflowStrategy,
        dropped_count: usize,
    },
    HealthWarning {
        stream_id: StreamId,
        score: f64,
        issues: Vec<String>,
    },
    MemoryLimit {
        total_bytes: usize,
        limit_bytes: usize,
    },
    Optimized {
        stream_id: StreamId,
        description: String,
        impact: ImpactLevel,
        confidence: f64,
    },
    PersistentSaved {
        stream_id: StreamId,
        point_count: usize,
        bytes: usize,
    },
    Destroyed {
        stream_id: StreamId,
    },
    Error {
        stream_id: Option<StreamId>,
        message: String,
    },
}

impl BufferEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BufferEvent::Created { .. } => "buffer:created",
            BufferEvent::Flushed { .. } => "buffer:flushed",
            BufferEvent::Overflow { .. } => "buffer:overflow",
            BufferEvent::HealthWarning { .. } => "buffer:health:warning",
            BufferEvent::MemoryLimit { .. } => "buffer:memory:limit",
            BufferEvent::Optimized { .. } => "buffer:optimized",
            BufferEvent::PersistentSaved { .. } => "buffer:persistent:saved",
            BufferEvent::Destroyed { .. } => "buffer:destroyed",
            BufferEvent::Error { .. } => "buffer:error",
        }
    }

    pub fn stream_id(&self) -> Option<&str> {
        match self {
            BufferEvent::Created { stream_id, .. }
            | BufferEvent::Flushed { stream_id, .. }
            | BufferEvent::Overflow { stream_id, .. }
            | BufferEvent::HealthWarning { stream_id, .. }
            | BufferEvent::Optimized { stream_id, .. }
            | BufferEvent::PersistentSaved { stream_id, .. }
            | BufferEvent::Destroyed { stream_id } => Some(stream_id),
            BufferEvent::Error { stream_id, .. } => stream_id.as_deref(),
            BufferEvent::MemoryLimit { .. } => None,
        }
    }

    /// Degradation signals are logged at warn, everything else at debug.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            BufferEvent::Overflow { .. }
                | BufferEvent::HealthWarning { .. }
                | BufferEvent::MemoryLimit { .. }
                | BufferEvent::Error { .. }
        )
    }
}

/// Observer list plus a bounded queue of recent events.
///
/// Each observer gets a channel bounded by the queue limit. Events for an
/// observer whose channel is full are dropped and counted. Observers that hang
/// up are pruned on the next publish.
pub struct EventBus {
    observers: Vec<SyncSender<BufferEvent>>,
    queue: VecDeque<BufferEvent>,
    queue_limit: usize,
    published: u64,
    undelivered: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_limit(DEFAULT_QUEUE_LIMIT)
    }

    pub fn with_queue_limit(queue_limit: usize) -> Self {
        Self {
            observers: Vec::new(),
            queue: VecDeque::new(),
            queue_limit: queue_limit.max(1),
            published: 0,
            undelivered: 0,
        }
    }

    pub fn subscribe(&mut self) -> Receiver<BufferEvent> {
        let (tx, rx) = sync_channel(self.queue_limit);
        self.observers.push(tx);
        rx
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Events dropped because an observer's channel was full.
    pub fn undelivered(&self) -> u64 {
        self.undelivered
    }

    pub fn publish(&mut self, event: BufferEvent) {
        if event.is_warning() {
            tracing::warn!(event = event.name(), stream_id = event.stream_id(), ?event);
        } else {
            tracing::debug!(event = event.name(), stream_id = event.stream_id(), ?event);
        }

        let mut undelivered = 0;
        self.observers.retain(|observer| match observer.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                undelivered += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        if undelivered > 0 {
            self.undelivered += undelivered;
            tracing::trace!(event = event.name(), undelivered, "observer channel full");
        }

        if self.queue.len() >= self.queue_limit {
            self.queue.pop_front();
        }
        self.queue.push_back(event);
        self.published += 1;
    }

    /// Removes and returns every queued event, oldest first.
    pub fn drain(&mut self) -> Vec<BufferEvent> {
        self.queue.drain(..).collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
