//! Per-stream windowed buffer.
//!
//! A [`StreamBuffer`] holds at most `capacity` points ordered by timestamp,
//! oldest first. When a point arrives at a full buffer the configured
//! [`OverflowStrategy`] decides what gives way. After every mutation the
//! enabled [`FlushTrigger`]s are evaluated and any resulting flushes are
//! handed back to the caller in the [`PushOutcome`]; the buffer itself never
//! talks to a transport or emits events.
//!
//! Time is always passed in explicitly (`now`, epoch milliseconds) so the
//! owner decides which clock drives windowing.

use crate::error::{LinkError, Result};
use crate::protocol::*;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

pub const DEFAULT_HEALTH_WARNING_THRESHOLD: f64 = 70.0;

const UTILIZATION_PENALTY_START: f64 = 0.8;
const UTILIZATION_WEIGHT: f64 = 0.3;
const OVERFLOW_WEIGHT: f64 = 0.4;
const QUALITY_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OverflowStrategy {
    Fifo,
    DropOldest,
    DropNewest,
    Downsample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlushTrigger {
    /// Fires when the buffer is at capacity and holds points older than the
    /// window; only that expired slice is drained. A full buffer with nothing
    /// expired is left to the overflow strategy.
    BufferFull,
    /// Fires whenever the oldest point is older than the window; drains the
    /// expired slice.
    TimeWindow,
    /// Explicit flush; drains everything.
    Manual,
    /// Average quality under the configured floor; drains everything.
    QualityThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    Idle,
    Active,
    Flushing,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub window_size_ms: u64,
    pub capacity: usize,
    pub overflow_strategy: OverflowStrategy,
    pub flush_triggers: BTreeSet<FlushTrigger>,
    /// Points collapsed per overflow under `Downsample`; 2 when unset.
    pub downsample_factor: Option<usize>,
    /// How far behind the window a point may arrive before it is rejected.
    pub late_grace_ms: u64,
    /// Average quality below this flushes early when `QualityThreshold` is enabled.
    pub quality_floor: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 10_000,
            capacity: 1000,
            overflow_strategy: OverflowStrategy::DropOldest,
            flush_triggers: [FlushTrigger::BufferFull, FlushTrigger::TimeWindow, FlushTrigger::Manual]
                .into_iter()
                .collect(),
            downsample_factor: None,
            late_grace_ms: 1000,
            quality_floor: 0.5,
        }
    }
}

impl BufferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_window_size_ms(mut self, window_size_ms: u64) -> Self {
        self.window_size_ms = window_size_ms;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_overflow_strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.overflow_strategy = strategy;
        self
    }

    pub fn with_flush_triggers(mut self, triggers: &[FlushTrigger]) -> Self {
        self.flush_triggers = triggers.iter().copied().collect();
        self
    }

    pub fn with_downsample_factor(mut self, factor: usize) -> Self {
        self.downsample_factor = Some(factor);
        self
    }

    pub fn with_late_grace_ms(mut self, grace_ms: u64) -> Self {
        self.late_grace_ms = grace_ms;
        self
    }

    pub fn with_quality_floor(mut self, floor: f64) -> Self {
        self.quality_floor = floor;
        self
    }

    pub fn has_trigger(&self, trigger: FlushTrigger) -> bool {
        self.flush_triggers.contains(&trigger)
    }

    pub fn effective_downsample_factor(&self) -> usize {
        self.downsample_factor.unwrap_or(2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(LinkError::Config("capacity must be greater than 0".to_string()));
        }
        if self.window_size_ms == 0 {
            return Err(LinkError::Config("window_size_ms must be greater than 0".to_string()));
        }
        if let Some(factor) = self.downsample_factor {
            if factor < 2 {
                return Err(LinkError::Config(format!("downsample_factor must be at least 2, got {}", factor)));
            }
        }
        if !(0.0..=1.0).contains(&self.quality_floor) {
            return Err(LinkError::Config(format!("quality_floor {} outside [0, 1]", self.quality_floor)));
        }
        Ok(())
    }
}

/// Partial update for a [`BufferConfig`]; unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfigPatch {
    pub window_size_ms: Option<u64>,
    pub capacity: Option<usize>,
    pub overflow_strategy: Option<OverflowStrategy>,
    pub flush_triggers: Option<BTreeSet<FlushTrigger>>,
    pub downsample_factor: Option<usize>,
    pub late_grace_ms: Option<u64>,
    pub quality_floor: Option<f64>,
}

impl BufferConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, base: &BufferConfig) -> BufferConfig {
        BufferConfig {
            window_size_ms: self.window_size_ms.unwrap_or(base.window_size_ms),
            capacity: self.capacity.unwrap_or(base.capacity),
            overflow_strategy: self.overflow_strategy.unwrap_or(base.overflow_strategy),
            flush_triggers: self.flush_triggers.clone().unwrap_or_else(|| base.flush_triggers.clone()),
            downsample_factor: self.downsample_factor.or(base.downsample_factor),
            late_grace_ms: self.late_grace_ms.unwrap_or(base.late_grace_ms),
            quality_floor: self.quality_floor.unwrap_or(base.quality_floor),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DropCounts {
    pub fifo: u64,
    pub drop_oldest: u64,
    pub drop_newest: u64,
    pub downsample: u64,
    pub late: u64,
}

impl DropCounts {
    fn record(&mut self, strategy: OverflowStrategy, count: u64) {
        match strategy {
            OverflowStrategy::Fifo => self.fifo += count,
            OverflowStrategy::DropOldest => self.drop_oldest += count,
            OverflowStrategy::DropNewest => self.drop_newest += count,
            OverflowStrategy::Downsample => self.downsample += count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferStatistics {
    pub size: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub total_received: u64,
    pub total_stored: u64,
    pub total_dropped: u64,
    pub total_flushed: u64,
    pub flush_count: u64,
    pub overflow_events: u64,
    pub drops: DropCounts,
    pub average_insertion_micros: f64,
    pub average_retrieval_micros: f64,
    /// Points per second over the span of received timestamps.
    pub data_rate: f64,
    pub average_quality: f64,
    pub oldest_timestamp: Option<Timestamp>,
    pub newest_timestamp: Option<Timestamp>,
    pub memory_bytes: usize,
    pub health_score: f64,
}

impl BufferStatistics {
    pub fn overflow_rate(&self) -> f64 {
        if self.total_received == 0 {
            0.0
        } else {
            self.total_dropped as f64 / self.total_received as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowEvent {
    pub strategy: OverflowStrategy,
    pub dropped_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: f64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlushBatch {
    pub trigger: FlushTrigger,
    pub points: Vec<TelemetryPoint>,
    pub statistics: BufferStatistics,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOutcome {
    pub accepted: bool,
    pub overflow: Option<OverflowEvent>,
    pub flushes: Vec<FlushBatch>,
    pub health_warning: Option<HealthReport>,
}

#[derive(Debug, Clone, Default)]
pub struct BufferQuery {
    /// Only the newest `count` matching points.
    pub count: Option<usize>,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
}

impl BufferQuery {
    pub fn latest(count: usize) -> Self {
        Self { count: Some(count), ..Self::default() }
    }

    pub fn between(start_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            start_time: Some(start_time),
            end_time: Some(end_time),
            ..Self::default()
        }
    }
}

pub struct StreamBuffer {
    stream_id: StreamId,
    config: BufferConfig,
    state: BufferState,
    points: VecDeque<TelemetryPoint>,
    quality_sum: f64,
    memory_bytes: usize,
    total_received: u64,
    total_stored: u64,
    total_dropped: u64,
    total_flushed: u64,
    flush_count: u64,
    overflow_events: u64,
    drops: DropCounts,
    insertion_micros_total: u128,
    insertion_count: u64,
    retrieval_micros_total: Cell<u128>,
    retrieval_count: Cell<u64>,
    first_seen: Option<Timestamp>,
    last_seen: Option<Timestamp>,
    health_threshold: f64,
    health_warned: bool,
}

impl StreamBuffer {
    pub fn new(stream_id: impl Into<StreamId>, config: BufferConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            stream_id: stream_id.into(),
            points: VecDeque::with_capacity(config.capacity.min(4096)),
            config,
            state: BufferState::Idle,
            quality_sum: 0.0,
            memory_bytes: 0,
            total_received: 0,
            total_stored: 0,
            total_dropped: 0,
            total_flushed: 0,
            flush_count: 0,
            overflow_events: 0,
            drops: DropCounts::default(),
            insertion_micros_total: 0,
            insertion_count: 0,
            retrieval_micros_total: Cell::new(0),
            retrieval_count: Cell::new(0),
            first_seen: None,
            last_seen: None,
            health_threshold: DEFAULT_HEALTH_WARNING_THRESHOLD,
            health_warned: false,
        })
    }

    pub fn with_health_threshold(mut self, threshold: f64) -> Self {
        self.health_threshold = threshold;
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn push(&mut self, point: TelemetryPoint, now: Timestamp) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        if self.state == BufferState::Destroyed {
            return outcome;
        }

        let started = Instant::now();
        self.total_received += 1;
        self.first_seen = Some(self.first_seen.map_or(point.timestamp, |t| t.min(point.timestamp)));
        self.last_seen = Some(self.last_seen.map_or(point.timestamp, |t| t.max(point.timestamp)));

        let late_cutoff = now - (self.config.window_size_ms + self.config.late_grace_ms) as Timestamp;
        if point.timestamp < late_cutoff {
            self.total_dropped += 1;
            self.drops.late += 1;
            tracing::trace!(stream_id = %self.stream_id, timestamp = point.timestamp, "rejected late point");
            outcome.health_warning = self.check_health();
            return outcome;
        }

        if self.state == BufferState::Idle {
            self.state = BufferState::Active;
        }

        let mut accepted = true;
        if self.points.len() >= self.config.capacity {
            let strategy = self.config.overflow_strategy;
            let dropped_count = match strategy {
                OverflowStrategy::Fifo | OverflowStrategy::DropOldest => self.evict_oldest(1),
                OverflowStrategy::DropNewest => {
                    accepted = false;
                    1
                }
                OverflowStrategy::Downsample => self.downsample_oldest(),
            };

            self.total_dropped += dropped_count as u64;
            self.drops.record(strategy, dropped_count as u64);
            self.overflow_events += 1;
            outcome.overflow = Some(OverflowEvent { strategy, dropped_count });
        }

        if accepted {
            self.insert_ordered(point);
            self.total_stored += 1;
        }
        outcome.accepted = accepted;

        self.insertion_micros_total += started.elapsed().as_micros();
        self.insertion_count += 1;

        outcome.flushes = self.evaluate_triggers(now);
        outcome.health_warning = self.check_health();
        outcome
    }

    /// Re-evaluates time-based triggers and health without new data.
    pub fn tick(&mut self, now: Timestamp) -> PushOutcome {
        if self.state == BufferState::Destroyed {
            return PushOutcome::default();
        }

        PushOutcome {
            accepted: false,
            overflow: None,
            flushes: self.evaluate_triggers(now),
            health_warning: self.check_health(),
        }
    }

    /// `Manual` and `QualityThreshold` drain everything; `BufferFull` and
    /// `TimeWindow` drain only the points that have aged out of the window.
    pub fn flush(&mut self, trigger: FlushTrigger, now: Timestamp) -> FlushBatch {
        let previous = self.state;
        if previous != BufferState::Destroyed {
            self.state = BufferState::Flushing;
        }

        let points: Vec<TelemetryPoint> = match trigger {
            FlushTrigger::Manual | FlushTrigger::QualityThreshold => self.drain_front(self.points.len()),
            FlushTrigger::BufferFull | FlushTrigger::TimeWindow => {
                let cutoff = self.window_cutoff(now);
                let expired = self.points.partition_point(|p| p.timestamp < cutoff);
                self.drain_front(expired)
            }
        };

        if !points.is_empty() {
            self.total_flushed += points.len() as u64;
            self.flush_count += 1;
        }

        if previous != BufferState::Destroyed {
            self.state = BufferState::Active;
        }

        FlushBatch {
            trigger,
            points,
            statistics: self.statistics(),
        }
    }

    pub fn query(&self, query: &BufferQuery) -> Vec<TelemetryPoint> {
        let started = Instant::now();

        let in_range = |p: &&TelemetryPoint| {
            query.start_time.map_or(true, |start| p.timestamp >= start)
                && query.end_time.map_or(true, |end| p.timestamp <= end)
        };

        let selected: Vec<TelemetryPoint> = match query.count {
            Some(count) => {
                let mut newest: Vec<TelemetryPoint> =
                    self.points.iter().rev().filter(in_range).take(count).cloned().collect();
                newest.reverse();
                newest
            }
            None => self.points.iter().filter(in_range).cloned().collect(),
        };

        self.retrieval_micros_total
            .set(self.retrieval_micros_total.get() + started.elapsed().as_micros());
        self.retrieval_count.set(self.retrieval_count.get() + 1);

        selected
    }

    pub fn snapshot(&self) -> Vec<TelemetryPoint> {
        self.points.iter().cloned().collect()
    }

    /// Merges points recovered from elsewhere with the current contents,
    /// keeping the newest `capacity`. Recovered points count as received;
    /// those pushed out by the merge count as dropped. Returns how many
    /// recovered points were kept.
    pub fn restore(&mut self, recovered: Vec<TelemetryPoint>) -> usize {
        if self.state == BufferState::Destroyed {
            return 0;
        }

        self.total_received += recovered.len() as u64;
        let kept = self.merge(recovered);
        self.total_stored += kept as u64;
        kept
    }

    /// Puts back points this buffer already stored and handed out without
    /// them being delivered. Only evictions are recorded. Returns how many
    /// were kept.
    pub fn requeue(&mut self, points: Vec<TelemetryPoint>) -> usize {
        self.merge(points)
    }

    /// Requeues an undelivered flush and reverses its flush accounting.
    pub fn requeue_flush(&mut self, batch: FlushBatch) -> usize {
        if self.state == BufferState::Destroyed {
            return 0;
        }

        if !batch.points.is_empty() {
            self.total_flushed = self.total_flushed.saturating_sub(batch.points.len() as u64);
            self.flush_count = self.flush_count.saturating_sub(1);
        }
        self.merge(batch.points)
    }

    /// Applies a new configuration, evicting the oldest points if the
    /// capacity shrank below the current size. Returns the evicted count.
    pub fn update_config(&mut self, config: BufferConfig) -> Result<usize> {
        config.validate()?;

        let evicted = self.points.len().saturating_sub(config.capacity);
        self.config = config;
        if evicted > 0 {
            self.evict_oldest(evicted);
            self.total_dropped += evicted as u64;
            self.drops.record(self.config.overflow_strategy, evicted as u64);
        }

        Ok(evicted)
    }

    /// Empties the buffer without recording a flush.
    pub fn take_all(&mut self) -> Vec<TelemetryPoint> {
        self.drain_front(self.points.len())
    }

    /// Idempotent; returns whatever was still buffered the first time.
    pub fn destroy(&mut self) -> Vec<TelemetryPoint> {
        if self.state == BufferState::Destroyed {
            return Vec::new();
        }
        let remaining = self.drain_front(self.points.len());
        self.state = BufferState::Destroyed;
        remaining
    }

    pub fn statistics(&self) -> BufferStatistics {
        let size = self.points.len();
        let utilization = size as f64 / self.config.capacity as f64;
        let average_quality = self.average_quality();

        let data_rate = match (self.first_seen, self.last_seen) {
            (Some(first), Some(last)) if last > first => {
                self.total_received as f64 / ((last - first) as f64 / 1000.0)
            }
            _ => 0.0,
        };

        let mut stats = BufferStatistics {
            size,
            capacity: self.config.capacity,
            utilization,
            total_received: self.total_received,
            total_stored: self.total_stored,
            total_dropped: self.total_dropped,
            total_flushed: self.total_flushed,
            flush_count: self.flush_count,
            overflow_events: self.overflow_events,
            drops: self.drops.clone(),
            average_insertion_micros: average(self.insertion_micros_total, self.insertion_count),
            average_retrieval_micros: average(self.retrieval_micros_total.get(), self.retrieval_count.get()),
            data_rate,
            average_quality,
            oldest_timestamp: self.points.front().map(|p| p.timestamp),
            newest_timestamp: self.points.back().map(|p| p.timestamp),
            memory_bytes: self.memory_bytes,
            health_score: 0.0,
        };
        stats.health_score = health_score(&stats);
        stats
    }

    pub fn health(&self) -> HealthReport {
        let stats = self.statistics();
        HealthReport {
            score: stats.health_score,
            issues: health_issues(&stats),
        }
    }

    fn average_quality(&self) -> f64 {
        if self.points.is_empty() {
            1.0
        } else {
            (self.quality_sum / self.points.len() as f64).clamp(0.0, 1.0)
        }
    }

    fn window_cutoff(&self, now: Timestamp) -> Timestamp {
        now - self.config.window_size_ms as Timestamp
    }

    fn evaluate_triggers(&mut self, now: Timestamp) -> Vec<FlushBatch> {
        let mut flushes = Vec::new();
        if self.points.is_empty() {
            return flushes;
        }

        if self.config.has_trigger(FlushTrigger::QualityThreshold)
            && self.average_quality() < self.config.quality_floor
        {
            flushes.push(self.flush(FlushTrigger::QualityThreshold, now));
            return flushes;
        }

        let cutoff = self.window_cutoff(now);
        let has_expired = self.points.front().is_some_and(|p| p.timestamp < cutoff);

        if self.config.has_trigger(FlushTrigger::BufferFull)
            && self.points.len() >= self.config.capacity
            && has_expired
        {
            flushes.push(self.flush(FlushTrigger::BufferFull, now));
        } else if self.config.has_trigger(FlushTrigger::TimeWindow) && has_expired {
            flushes.push(self.flush(FlushTrigger::TimeWindow, now));
        }

        flushes
    }

    /// Edge-triggered: reports once when the score drops below the threshold,
    /// then stays quiet until it recovers.
    fn check_health(&mut self) -> Option<HealthReport> {
        let report = self.health();
        if report.score < self.health_threshold {
            if !self.health_warned {
                self.health_warned = true;
                return Some(report);
            }
        } else {
            self.health_warned = false;
        }
        None
    }

    fn insert_ordered(&mut self, point: TelemetryPoint) {
        self.account_added(&point);
        let in_order = self.points.back().map_or(true, |last| last.timestamp <= point.timestamp);
        if in_order {
            self.points.push_back(point);
        } else {
            let index = self.points.partition_point(|p| p.timestamp <= point.timestamp);
            self.points.insert(index, point);
        }
    }

    fn account_added(&mut self, point: &TelemetryPoint) {
        self.quality_sum += point.quality;
        self.memory_bytes += point.estimated_bytes();
    }

    fn account_removed(&mut self, point: &TelemetryPoint) {
        self.quality_sum -= point.quality;
        self.memory_bytes = self.memory_bytes.saturating_sub(point.estimated_bytes());
        if self.points.is_empty() {
            self.quality_sum = 0.0;
            self.memory_bytes = 0;
        }
    }

    fn drain_front(&mut self, count: usize) -> Vec<TelemetryPoint> {
        let count = count.min(self.points.len());
        let drained: Vec<TelemetryPoint> = self.points.drain(..count).collect();
        for point in &drained {
            self.account_removed(point);
        }
        drained
    }

    fn evict_oldest(&mut self, count: usize) -> usize {
        self.drain_front(count).len()
    }

    /// Returns how many of `incoming` survive the merge. Evicted points,
    /// incoming or resident, are recorded as drops.
    fn merge(&mut self, incoming: Vec<TelemetryPoint>) -> usize {
        if self.state == BufferState::Destroyed || incoming.is_empty() {
            return 0;
        }

        let incoming_count = incoming.len();
        let mut merged: Vec<(bool, TelemetryPoint)> = incoming
            .into_iter()
            .map(|p| (true, p))
            .chain(self.points.drain(..).map(|p| (false, p)))
            .collect();
        merged.sort_by_key(|(_, p)| p.timestamp);

        let excess = merged.len().saturating_sub(self.config.capacity);
        let incoming_evicted = merged[..excess].iter().filter(|(incoming, _)| *incoming).count();

        self.quality_sum = 0.0;
        self.memory_bytes = 0;
        for (_, point) in merged.into_iter().skip(excess) {
            self.account_added(&point);
            self.points.push_back(point);
        }

        if excess > 0 {
            self.total_dropped += excess as u64;
            self.drops.record(self.config.overflow_strategy, excess as u64);
            tracing::debug!(stream_id = %self.stream_id, excess, "merge exceeded capacity");
        }
        if self.state == BufferState::Idle {
            self.state = BufferState::Active;
        }

        incoming_count - incoming_evicted
    }

    /// Collapses the oldest `factor` points into their average. Falls back to
    /// evicting the oldest point when fewer than two can be collapsed.
    fn downsample_oldest(&mut self) -> usize {
        let factor = self.config.effective_downsample_factor().min(self.points.len());
        if factor < 2 {
            return self.evict_oldest(1);
        }

        let group = self.drain_front(factor);
        let collapsed = collapse(&group);
        self.account_added(&collapsed);
        self.points.push_front(collapsed);

        factor - 1
    }
}

fn average(total: u128, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

pub fn health_score(stats: &BufferStatistics) -> f64 {
    let utilization_penalty =
        ((stats.utilization - UTILIZATION_PENALTY_START) / (1.0 - UTILIZATION_PENALTY_START)).clamp(0.0, 1.0);
    let overflow_rate = stats.overflow_rate().clamp(0.0, 1.0);

    let score = UTILIZATION_WEIGHT * (1.0 - utilization_penalty)
        + OVERFLOW_WEIGHT * (1.0 - overflow_rate)
        + QUALITY_WEIGHT * stats.average_quality;

    (score * 100.0).clamp(0.0, 100.0)
}

pub fn health_issues(stats: &BufferStatistics) -> Vec<String> {
    let mut issues = Vec::new();

    if stats.utilization > 0.9 {
        issues.push(format!("buffer utilization at {:.0}%", stats.utilization * 100.0));
    }
    if stats.overflow_rate() > 0.05 {
        issues.push(format!(
            "{:.1}% of received points dropped ({} total)",
            stats.overflow_rate() * 100.0,
            stats.total_dropped
        ));
    }
    if stats.average_quality < 0.8 {
        issues.push(format!("average quality {:.2}", stats.average_quality));
    }
    if stats.drops.late > 0 {
        issues.push(format!("{} points arrived outside the window", stats.drops.late));
    }

    issues
}

/// Mean of numeric, vector and matrix values of matching shape; otherwise the
/// newest value wins.
fn average_values(values: &[&TelemetryValue]) -> TelemetryValue {
    let newest = || values.last().map(|v| (*v).clone()).unwrap_or(TelemetryValue::Numeric(0.0));

    let numbers: Option<Vec<f64>> = values.iter().map(|v| v.as_f64()).collect();
    if let Some(numbers) = numbers {
        return TelemetryValue::Numeric(mean(numbers.into_iter()));
    }

    let vectors: Option<Vec<&Vec<f64>>> = values
        .iter()
        .map(|v| match v {
            TelemetryValue::Vector(items) => Some(items),
            _ => None,
        })
        .collect();
    if let Some(vectors) = vectors {
        let width = vectors[0].len();
        if vectors.iter().all(|v| v.len() == width) {
            let mean = (0..width)
                .map(|i| mean(vectors.iter().map(|v| v[i])))
                .collect();
            return TelemetryValue::Vector(mean);
        }
        return newest();
    }

    let matrices: Option<Vec<&Vec<Vec<f64>>>> = values
        .iter()
        .map(|v| match v {
            TelemetryValue::Matrix(rows) => Some(rows),
            _ => None,
        })
        .collect();
    if let Some(matrices) = matrices {
        let shape: Vec<usize> = matrices[0].iter().map(Vec::len).collect();
        let same_shape = matrices
            .iter()
            .all(|m| m.len() == shape.len() && m.iter().zip(&shape).all(|(row, w)| row.len() == *w));
        if same_shape {
            let mean = shape
                .iter()
                .enumerate()
                .map(|(r, width)| {
                    (0..*width)
                        .map(|c| mean(matrices.iter().map(|m| m[r][c])))
                        .collect()
                })
                .collect();
            return TelemetryValue::Matrix(mean);
        }
    }

    newest()
}

/// Arithmetic mean that stays finite for finite inputs whose sum overflows.
fn mean(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count() as f64;
    if n == 0.0 {
        return 0.0;
    }

    let direct = values.clone().sum::<f64>() / n;
    if direct.is_finite() {
        direct
    } else {
        values.map(|v| v / n).sum()
    }
}

fn collapse(group: &[TelemetryPoint]) -> TelemetryPoint {
    let values: Vec<&TelemetryValue> = group.iter().map(|p| &p.value).collect();
    let timestamp = group.iter().map(|p| p.timestamp).min().unwrap_or_default();
    let quality = group.iter().map(|p| p.quality).sum::<f64>() / group.len().max(1) as f64;

    let mut metadata = BTreeMap::new();
    metadata.insert("downsampled_from".to_string(), FieldValue::Integer(group.len() as i64));

    TelemetryPoint {
        timestamp,
        value: average_values(&values),
        quality,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_only(capacity: usize, strategy: OverflowStrategy) -> BufferConfig {
        BufferConfig::new()
            .with_capacity(capacity)
            .with_overflow_strategy(strategy)
            .with_flush_triggers(&[FlushTrigger::Manual])
    }

    fn values(buffer: &StreamBuffer) -> Vec<f64> {
        buffer.snapshot().iter().filter_map(|p| p.value.as_f64()).collect()
    }

    #[test]
    fn test_drop_oldest_scenario() {
        let mut buffer = StreamBuffer::new("speed", manual_only(5, OverflowStrategy::DropOldest)).unwrap();

        for (ts, value) in [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0), (5, 50.0), (6, 60.0)] {
            buffer.push(TelemetryPoint::new(ts, value), 6);
        }

        assert_eq!(values(&buffer), vec![20.0, 30.0, 40.0, 50.0, 60.0]);
        let stats = buffer.statistics();
        assert_eq!(stats.total_dropped, 1);
        assert_eq!(stats.drops.drop_oldest, 1);
        assert_eq!(stats.size, 5);
    }

    #[test]
    fn test_overflow_event_reported() {
        let mut buffer = StreamBuffer::new("s", manual_only(2, OverflowStrategy::Fifo)).unwrap();

        assert!(buffer.push(TelemetryPoint::new(1, 1.0), 1).overflow.is_none());
        assert!(buffer.push(TelemetryPoint::new(2, 2.0), 2).overflow.is_none());
        let outcome = buffer.push(TelemetryPoint::new(3, 3.0), 3);

        assert_eq!(
            outcome.overflow,
            Some(OverflowEvent { strategy: OverflowStrategy::Fifo, dropped_count: 1 })
        );
        assert!(outcome.accepted);
    }

    #[test]
    fn test_drop_newest_keeps_existing() {
        let mut buffer = StreamBuffer::new("s", manual_only(3, OverflowStrategy::DropNewest)).unwrap();

        for ts in 1..=5 {
            buffer.push(TelemetryPoint::new(ts, ts as f64), 5);
        }

        assert_eq!(values(&buffer), vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.statistics().drops.drop_newest, 2);
    }

    #[test]
    fn test_downsample_collapses_oldest() {
        let config = manual_only(4, OverflowStrategy::Downsample).with_downsample_factor(3);
        let mut buffer = StreamBuffer::new("s", config).unwrap();

        for ts in 1..=4 {
            buffer.push(TelemetryPoint::new(ts, ts as f64 * 10.0).with_quality(0.5 + ts as f64 * 0.1), 4);
        }
        let outcome = buffer.push(TelemetryPoint::new(5, 50.0), 5);

        assert_eq!(outcome.overflow.unwrap().dropped_count, 2);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].value, TelemetryValue::Numeric(20.0));
        assert_eq!(snapshot[0].timestamp, 1);
        assert!((snapshot[0].quality - 0.7).abs() < 1e-9);
        assert_eq!(values(&buffer), vec![20.0, 40.0, 50.0]);
    }

    #[test]
    fn test_downsample_vectors_elementwise() {
        let config = manual_only(2, OverflowStrategy::Downsample);
        let mut buffer = StreamBuffer::new("s", config).unwrap();

        buffer.push(TelemetryPoint::new(1, vec![1.0, 10.0]), 3);
        buffer.push(TelemetryPoint::new(2, vec![3.0, 20.0]), 3);
        buffer.push(TelemetryPoint::new(3, vec![5.0, 30.0]), 3);

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot[0].value, TelemetryValue::Vector(vec![2.0, 15.0]));
        assert_eq!(snapshot[1].value, TelemetryValue::Vector(vec![5.0, 30.0]));
    }

    #[test]
    fn test_downsample_capacity_one_evicts() {
        let mut buffer = StreamBuffer::new("s", manual_only(1, OverflowStrategy::Downsample)).unwrap();

        buffer.push(TelemetryPoint::new(1, 1.0), 2);
        buffer.push(TelemetryPoint::new(2, 2.0), 2);

        assert_eq!(values(&buffer), vec![2.0]);
    }

    #[test]
    fn test_late_points_rejected() {
        let config = manual_only(10, OverflowStrategy::DropOldest)
            .with_window_size_ms(1000)
            .with_late_grace_ms(500);
        let mut buffer = StreamBuffer::new("s", config).unwrap();

        let outcome = buffer.push(TelemetryPoint::new(8_000, 1.0), 10_000);
        assert!(!outcome.accepted);
        assert!(buffer.push(TelemetryPoint::new(8_600, 2.0), 10_000).accepted);

        let stats = buffer.statistics();
        assert_eq!(stats.drops.late, 1);
        assert_eq!(stats.total_dropped, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_out_of_order_points_sorted() {
        let mut buffer = StreamBuffer::new("s", manual_only(10, OverflowStrategy::DropOldest)).unwrap();

        for ts in [5, 1, 3, 4, 2] {
            buffer.push(TelemetryPoint::new(ts, ts as f64), 5);
        }

        assert_eq!(values(&buffer), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_time_window_flush_drains_expired_slice() {
        let config = BufferConfig::new()
            .with_capacity(100)
            .with_window_size_ms(1_000)
            .with_flush_triggers(&[FlushTrigger::TimeWindow]);
        let mut buffer = StreamBuffer::new("s", config).unwrap();

        for ts in [100, 200, 900] {
            assert!(buffer.push(TelemetryPoint::new(ts, 1.0), ts).flushes.is_empty());
        }

        let outcome = buffer.push(TelemetryPoint::new(1_250, 1.0), 1_250);
        assert_eq!(outcome.flushes.len(), 1);
        let flush = &outcome.flushes[0];
        assert_eq!(flush.trigger, FlushTrigger::TimeWindow);
        assert_eq!(flush.points.iter().map(|p| p.timestamp).collect::<Vec<_>>(), vec![100, 200]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(flush.statistics.total_flushed, 2);
    }

    #[test]
    fn test_buffer_full_without_expired_points_overflows() {
        let config = BufferConfig::new()
            .with_capacity(3)
            .with_window_size_ms(10_000)
            .with_flush_triggers(&[FlushTrigger::BufferFull]);
        let mut buffer = StreamBuffer::new("s", config).unwrap();

        for ts in 1..=4 {
            let outcome = buffer.push(TelemetryPoint::new(ts, 1.0), 10);
            assert!(outcome.flushes.is_empty());
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.statistics().overflow_events, 1);

        let outcome = buffer.tick(10_003);
        assert_eq!(outcome.flushes.len(), 1);
        assert_eq!(outcome.flushes[0].trigger, FlushTrigger::BufferFull);
        assert_eq!(outcome.flushes[0].points.len(), 1);
        assert_eq!(buffer.len(), 2);

        assert!(buffer.tick(10_004).flushes.is_empty());
    }

    #[test]
    fn test_buffer_full_reported_only_at_capacity() {
        let config = BufferConfig::new()
            .with_capacity(3)
            .with_window_size_ms(100)
            .with_flush_triggers(&[FlushTrigger::BufferFull, FlushTrigger::TimeWindow]);

        let mut full = StreamBuffer::new("s", config.clone()).unwrap();
        for ts in [0, 1, 150] {
            full.push(TelemetryPoint::new(ts, 1.0), 50);
        }
        let outcome = full.tick(150);
        assert_eq!(outcome.flushes[0].trigger, FlushTrigger::BufferFull);
        assert_eq!(outcome.flushes[0].points.len(), 2);

        let mut partial = StreamBuffer::new("s", config).unwrap();
        for ts in [0, 150] {
            partial.push(TelemetryPoint::new(ts, 1.0), 50);
        }
        let outcome = partial.tick(150);
        assert_eq!(outcome.flushes[0].trigger, FlushTrigger::TimeWindow);
        assert_eq!(outcome.flushes[0].points.len(), 1);
    }

    #[test]
    fn test_quality_threshold_flushes_everything() {
        let config = BufferConfig::new()
            .with_flush_triggers(&[FlushTrigger::QualityThreshold])
            .with_quality_floor(0.6);
        let mut buffer = StreamBuffer::new("s", config).unwrap();

        assert!(buffer.push(TelemetryPoint::new(1, 1.0).with_quality(0.9), 1).flushes.is_empty());
        let outcome = buffer.push(TelemetryPoint::new(2, 1.0).with_quality(0.1), 2);

        assert_eq!(outcome.flushes.len(), 1);
        assert_eq!(outcome.flushes[0].trigger, FlushTrigger::QualityThreshold);
        assert_eq!(outcome.flushes[0].points.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_manual_flush_and_state() {
        let mut buffer = StreamBuffer::new("s", manual_only(10, OverflowStrategy::DropOldest)).unwrap();
        assert_eq!(buffer.state(), BufferState::Idle);

        buffer.push(TelemetryPoint::new(1, 1.0), 1);
        buffer.push(TelemetryPoint::new(2, 2.0), 2);
        assert_eq!(buffer.state(), BufferState::Active);

        let flush = buffer.flush(FlushTrigger::Manual, 2);
        assert_eq!(flush.points.len(), 2);
        assert_eq!(flush.statistics.size, 0);
        assert_eq!(flush.statistics.flush_count, 1);
        assert_eq!(buffer.state(), BufferState::Active);

        assert!(buffer.push(TelemetryPoint::new(3, 3.0), 3).accepted);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut buffer = StreamBuffer::new("s", manual_only(10, OverflowStrategy::DropOldest)).unwrap();
        buffer.push(TelemetryPoint::new(1, 1.0), 1);

        assert_eq!(buffer.destroy().len(), 1);
        assert!(buffer.destroy().is_empty());
        assert_eq!(buffer.state(), BufferState::Destroyed);
        assert!(!buffer.push(TelemetryPoint::new(2, 2.0), 2).accepted);
    }

    #[test]
    fn test_query_filters_without_mutation() {
        let mut buffer = StreamBuffer::new("s", manual_only(10, OverflowStrategy::DropOldest)).unwrap();
        for ts in 1..=6 {
            buffer.push(TelemetryPoint::new(ts, ts as f64), 6);
        }

        let latest = buffer.query(&BufferQuery::latest(2));
        assert_eq!(latest.iter().map(|p| p.timestamp).collect::<Vec<_>>(), vec![5, 6]);

        let range = buffer.query(&BufferQuery::between(2, 4));
        assert_eq!(range.len(), 3);

        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.statistics().size, 6);
    }

    #[test]
    fn test_health_warning_edge_triggered() {
        let mut buffer = StreamBuffer::new("s", manual_only(10, OverflowStrategy::DropOldest)).unwrap();

        let mut warnings = 0;
        for ts in 1..=60 {
            let outcome = buffer.push(TelemetryPoint::new(ts, 1.0).with_quality(0.3), 60);
            if outcome.health_warning.is_some() {
                warnings += 1;
            }
        }

        assert_eq!(warnings, 1);
        let health = buffer.health();
        assert!(health.score < 70.0);
        assert!(!health.issues.is_empty());
    }

    #[test]
    fn test_health_score_bounds() {
        let mut buffer = StreamBuffer::new("s", manual_only(100, OverflowStrategy::DropOldest)).unwrap();
        buffer.push(TelemetryPoint::new(1, 1.0), 1);

        let score = buffer.statistics().health_score;
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_config_shrinks() {
        let mut buffer = StreamBuffer::new("s", manual_only(10, OverflowStrategy::DropOldest)).unwrap();
        for ts in 1..=8 {
            buffer.push(TelemetryPoint::new(ts, ts as f64), 8);
        }

        let evicted = buffer.update_config(manual_only(5, OverflowStrategy::DropOldest)).unwrap();
        assert_eq!(evicted, 3);
        assert_eq!(values(&buffer), vec![4.0, 5.0, 6.0, 7.0, 8.0]);

        assert!(buffer.update_config(manual_only(0, OverflowStrategy::DropOldest)).is_err());
        assert_eq!(buffer.config().capacity, 5);
    }

    #[test]
    fn test_restore_keeps_newest() {
        let mut buffer = StreamBuffer::new("s", manual_only(4, OverflowStrategy::DropOldest)).unwrap();
        buffer.push(TelemetryPoint::new(10, 10.0), 10);
        buffer.push(TelemetryPoint::new(11, 11.0), 11);

        let recovered = (5..=8).map(|ts| TelemetryPoint::new(ts, ts as f64)).collect();
        assert_eq!(buffer.restore(recovered), 2);
        assert_eq!(values(&buffer), vec![7.0, 8.0, 10.0, 11.0]);

        let stats = buffer.statistics();
        assert_eq!(stats.total_received, 6);
        assert_eq!(stats.total_stored, 4);
        assert_eq!(stats.total_dropped, 2);
    }

    #[test]
    fn test_requeue_flush_reverses_accounting() {
        let config = BufferConfig::new()
            .with_capacity(4)
            .with_window_size_ms(1_000)
            .with_flush_triggers(&[FlushTrigger::TimeWindow]);
        let mut buffer = StreamBuffer::new("s", config).unwrap();

        for ts in 0..3 {
            buffer.push(TelemetryPoint::new(ts, ts as f64), ts);
        }
        let mut outcome = buffer.push(TelemetryPoint::new(1_500, 9.0), 1_500);
        assert_eq!(outcome.flushes.len(), 1);
        let batch = outcome.flushes.remove(0);
        assert_eq!(batch.points.len(), 3);

        assert_eq!(buffer.requeue_flush(batch), 3);
        let stats = buffer.statistics();
        assert_eq!(stats.size, 4);
        assert_eq!(stats.total_received, 4);
        assert_eq!(stats.total_stored, 4);
        assert_eq!(stats.total_flushed, 0);
        assert_eq!(stats.flush_count, 0);
        assert_eq!(stats.total_dropped, 0);

        buffer.update_config(buffer.config().clone().with_capacity(8)).unwrap();
        let extra = (-6..0).map(|ts| TelemetryPoint::new(ts, 0.0)).collect();
        assert_eq!(buffer.requeue(extra), 4);
        let stats = buffer.statistics();
        assert_eq!(stats.size, 8);
        assert_eq!(stats.total_stored, 4);
        assert_eq!(stats.total_dropped, 2);
    }

    #[test]
    fn test_downsample_mean_of_huge_values_stays_finite() {
        let mut buffer = StreamBuffer::new("s", manual_only(2, OverflowStrategy::Downsample)).unwrap();

        buffer.push(TelemetryPoint::new(1, 1e308), 3);
        buffer.push(TelemetryPoint::new(2, 1e308), 3);
        buffer.push(TelemetryPoint::new(3, 5.0), 3);

        assert_eq!(values(&buffer), vec![1e308, 5.0]);
    }

    #[test]
    fn test_config_validation() {
        assert!(BufferConfig::new().validate().is_ok());
        assert!(BufferConfig::new().with_capacity(0).validate().is_err());
        assert!(BufferConfig::new().with_downsample_factor(1).validate().is_err());
        assert!(StreamBuffer::new("s", BufferConfig::new().with_capacity(0)).is_err());

        let patched = BufferConfigPatch { capacity: Some(20), ..BufferConfigPatch::default() }
            .apply_to(&BufferConfig::new());
        assert_eq!(patched.capacity, 20);
        assert_eq!(patched.window_size_ms, 10_000);
    }

    #[test]
    fn test_config_from_json() {
        let config = BufferConfig::from_json_str(r#"{"capacity": 64, "overflow_strategy": "Downsample", "downsample_factor": 4}"#).unwrap();
        assert_eq!(config.capacity, 64);
        assert_eq!(config.overflow_strategy, OverflowStrategy::Downsample);
        assert_eq!(config.effective_downsample_factor(), 4);
        assert!(BufferConfig::from_json_str(r#"{"capacity": 0}"#).is_err());
    }
}
