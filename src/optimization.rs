//! Buffer tuning recommendations derived from statistics.
//!
//! Analysis is a pure function of a buffer's statistics and configuration;
//! applying a recommendation is the client's job.

use crate::buffer::{BufferConfig, BufferConfigPatch, BufferStatistics, FlushTrigger, OverflowStrategy};
use crate::protocol::StreamId;
use serde::{Deserialize, Serialize};

pub const MAX_CAPACITY: usize = 100_000;
pub const MIN_WINDOW_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecommendationKind {
    EnableDownsampling,
    IncreaseCapacity,
    ShrinkWindow,
    EnableQualityFlush,
    ExtendLateGrace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    pub stream_id: StreamId,
    pub kind: RecommendationKind,
    pub description: String,
    pub impact: ImpactLevel,
    pub confidence: f64,
    pub patch: BufferConfigPatch,
}

impl OptimizationRecommendation {
    pub fn is_applicable(&self, confidence_threshold: f64) -> bool {
        self.confidence >= confidence_threshold && !self.patch.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationPolicy {
    /// Recommendations below this confidence are reported but never applied.
    pub confidence_threshold: f64,
    pub overflow_rate_threshold: f64,
    pub low_utilization_threshold: f64,
    pub low_quality_threshold: f64,
    pub late_rate_threshold: f64,
    /// Fewer received points than this halves every confidence.
    pub min_samples: u64,
}

impl Default for OptimizationPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            overflow_rate_threshold: 0.05,
            low_utilization_threshold: 0.2,
            low_quality_threshold: 0.7,
            late_rate_threshold: 0.1,
            min_samples: 20,
        }
    }
}

impl OptimizationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_min_samples(mut self, samples: u64) -> Self {
        self.min_samples = samples;
        self
    }
}

/// Proposes configuration deltas for one buffer. `strategy_locked` keeps the
/// overflow strategy fixed (critical streams).
pub fn analyze(
    stream_id: &str,
    stats: &BufferStatistics,
    config: &BufferConfig,
    strategy_locked: bool,
    policy: &OptimizationPolicy,
) -> Vec<OptimizationRecommendation> {
    let mut recommendations = Vec::new();
    if stats.total_received == 0 {
        return recommendations;
    }

    let sample_weight = if stats.total_received < policy.min_samples { 0.5 } else { 1.0 };
    let mut push = |kind, description: String, impact, confidence: f64, patch| {
        recommendations.push(OptimizationRecommendation {
            stream_id: stream_id.to_string(),
            kind,
            description,
            impact,
            confidence: confidence.clamp(0.0, 0.95) * sample_weight,
            patch,
        });
    };

    let overflow_dropped = stats.total_dropped.saturating_sub(stats.drops.late);
    let overflow_rate = overflow_dropped as f64 / stats.total_received as f64;
    if stats.overflow_events > 0 && overflow_rate >= policy.overflow_rate_threshold {
        let impact = if stats.health_score < 50.0 || overflow_rate > 0.25 {
            ImpactLevel::High
        } else if overflow_rate > 0.1 {
            ImpactLevel::Medium
        } else {
            ImpactLevel::Low
        };

        if !strategy_locked && config.overflow_strategy != OverflowStrategy::Downsample {
            push(
                RecommendationKind::EnableDownsampling,
                format!(
                    "{:.0}% of points dropped under {:?}; downsample instead of discarding",
                    overflow_rate * 100.0,
                    config.overflow_strategy
                ),
                impact,
                0.5 + overflow_rate,
                BufferConfigPatch {
                    overflow_strategy: Some(OverflowStrategy::Downsample),
                    downsample_factor: Some(config.effective_downsample_factor()),
                    ..BufferConfigPatch::default()
                },
            );
        }

        if config.capacity < MAX_CAPACITY {
            let capacity = (config.capacity * 2).min(MAX_CAPACITY);
            push(
                RecommendationKind::IncreaseCapacity,
                format!("grow capacity from {} to {} to absorb bursts", config.capacity, capacity),
                impact,
                0.45 + overflow_rate,
                BufferConfigPatch {
                    capacity: Some(capacity),
                    ..BufferConfigPatch::default()
                },
            );
        }
    }

    let cycled = stats.total_received >= config.capacity as u64;
    if cycled
        && stats.overflow_events == 0
        && stats.utilization < policy.low_utilization_threshold
        && config.window_size_ms > MIN_WINDOW_MS
    {
        let window_size_ms = (config.window_size_ms / 2).max(MIN_WINDOW_MS);
        let capacity = (config.capacity / 2).max(1);
        push(
            RecommendationKind::ShrinkWindow,
            format!(
                "utilization {:.0}%; shrink window to {} ms and capacity to {}",
                stats.utilization * 100.0,
                window_size_ms,
                capacity
            ),
            ImpactLevel::Low,
            0.5 + (policy.low_utilization_threshold - stats.utilization) * 2.0,
            BufferConfigPatch {
                window_size_ms: Some(window_size_ms),
                capacity: Some(capacity),
                ..BufferConfigPatch::default()
            },
        );
    }

    if stats.size > 0
        && stats.average_quality < policy.low_quality_threshold
        && !config.has_trigger(FlushTrigger::QualityThreshold)
    {
        let mut triggers = config.flush_triggers.clone();
        triggers.insert(FlushTrigger::QualityThreshold);
        push(
            RecommendationKind::EnableQualityFlush,
            format!(
                "average quality {:.2}; flush early so degraded data does not linger",
                stats.average_quality
            ),
            ImpactLevel::Medium,
            0.5 + (policy.low_quality_threshold - stats.average_quality),
            BufferConfigPatch {
                flush_triggers: Some(triggers),
                ..BufferConfigPatch::default()
            },
        );
    }

    let late_rate = stats.drops.late as f64 / stats.total_received as f64;
    if late_rate > policy.late_rate_threshold {
        let grace = (config.late_grace_ms * 2).max(MIN_WINDOW_MS);
        push(
            RecommendationKind::ExtendLateGrace,
            format!("{:.0}% of points arrived late; extend grace to {} ms", late_rate * 100.0, grace),
            ImpactLevel::Low,
            0.4 + late_rate,
            BufferConfigPatch {
                late_grace_ms: Some(grace),
                ..BufferConfigPatch::default()
            },
        );
    }

    recommendations
}
