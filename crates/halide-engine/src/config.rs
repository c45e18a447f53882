//! Engine configuration.
//!
//! All limits are soft: they bound work and memory, they do not promise
//! fairness. Every field has a named default, and the whole tree
//! deserializes from partial JSON (missing keys keep their defaults).
//! Durations are written as fractional seconds (`"jobTimeout": 8.0`).

use std::time::Duration;

use halide_pipeline::EffectParams;
use serde::{Deserialize, Serialize};

use crate::resilience::RuleSelector;

/// Top-level configuration for a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Candidate discovery bounds.
    pub discovery: DiscoveryLimits,
    /// Job admission and pacing.
    pub scheduler: SchedulerLimits,
    /// Result cache bounds.
    pub cache: CacheLimits,
    /// Overlay supervision.
    pub resilience: ResilienceConfig,
    /// Grain and vignette strength.
    pub effects: EffectParams,
    /// Strategy selection rules.
    pub strategy: RuleSelector,
    /// Coalescing window for surface-change notifications.
    #[serde(with = "secs")]
    pub debounce: Duration,
    /// Period of the background new-content check.
    #[serde(with = "secs")]
    pub rescan_interval: Duration,
    /// Whether the periodic new-content check runs at all.
    pub new_content_check: bool,
}

impl EngineConfig {
    /// Default debounce window.
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);
    /// Default periodic rescan interval.
    pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(5);
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryLimits::default(),
            scheduler: SchedulerLimits::default(),
            cache: CacheLimits::default(),
            resilience: ResilienceConfig::default(),
            effects: EffectParams::default(),
            strategy: RuleSelector::default(),
            debounce: Self::DEFAULT_DEBOUNCE,
            rescan_interval: Self::DEFAULT_RESCAN_INTERVAL,
            new_content_check: true,
        }
    }
}

/// Bounds on what a scan returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryLimits {
    /// Surfaces smaller than this on either axis are ignored (px).
    pub min_size: f64,
    /// Slack added around the viewport on every side (px).
    pub viewport_margin: f64,
    /// Surfaces at least this large on either axis go to the large tier (px).
    pub large_threshold: f64,
    /// Cap on candidates per scan.
    pub max_candidates: usize,
    /// How long a scan result is reused for the same viewport.
    #[serde(with = "secs")]
    pub memo_ttl: Duration,
}

impl DiscoveryLimits {
    /// Default minimum surface size.
    pub const DEFAULT_MIN_SIZE: f64 = 32.0;
    /// Default viewport slack.
    pub const DEFAULT_VIEWPORT_MARGIN: f64 = 3000.0;
    /// Default large-tier threshold.
    pub const DEFAULT_LARGE_THRESHOLD: f64 = 180.0;
    /// Default candidate cap.
    pub const DEFAULT_MAX_CANDIDATES: usize = 150;
    /// Default memo lifetime.
    pub const DEFAULT_MEMO_TTL: Duration = Duration::from_secs(1);
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            min_size: Self::DEFAULT_MIN_SIZE,
            viewport_margin: Self::DEFAULT_VIEWPORT_MARGIN,
            large_threshold: Self::DEFAULT_LARGE_THRESHOLD,
            max_candidates: Self::DEFAULT_MAX_CANDIDATES,
            memo_ttl: Self::DEFAULT_MEMO_TTL,
        }
    }
}

/// Admission control and pacing for processing jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerLimits {
    /// Ceiling on jobs in `Processing`.
    pub max_concurrent: usize,
    /// Visible candidates dispatched together.
    pub batch_size: usize,
    /// Pause between visible batches.
    #[serde(with = "secs")]
    pub batch_pause: Duration,
    /// Approximate decoded bytes allowed in flight.
    pub memory_budget: u64,
    /// Pause inserted when admitting a job would exceed the budget.
    #[serde(with = "secs")]
    pub memory_pause: Duration,
    /// Bound on a single job.
    #[serde(with = "secs")]
    pub job_timeout: Duration,
    /// Delay before a finished job's in-flight marker is cleared.
    #[serde(with = "secs")]
    pub release_delay: Duration,
    /// Delay before the full-sweep rescan that follows a run.
    #[serde(with = "secs")]
    pub sweep_delay: Duration,
}

impl SchedulerLimits {
    /// Default concurrency ceiling.
    pub const DEFAULT_MAX_CONCURRENT: usize = 4;
    /// Default visible batch size.
    pub const DEFAULT_BATCH_SIZE: usize = 3;
    /// Default inter-batch pause.
    pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(50);
    /// Default memory budget (96 MiB).
    pub const DEFAULT_MEMORY_BUDGET: u64 = 96 * 1024 * 1024;
    /// Default memory back-off.
    pub const DEFAULT_MEMORY_PAUSE: Duration = Duration::from_millis(150);
    /// Default job bound.
    pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(8);
    /// Default marker release delay.
    pub const DEFAULT_RELEASE_DELAY: Duration = Duration::from_millis(100);
    /// Default full-sweep delay.
    pub const DEFAULT_SWEEP_DELAY: Duration = Duration::from_secs(2);
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_concurrent: Self::DEFAULT_MAX_CONCURRENT,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            batch_pause: Self::DEFAULT_BATCH_PAUSE,
            memory_budget: Self::DEFAULT_MEMORY_BUDGET,
            memory_pause: Self::DEFAULT_MEMORY_PAUSE,
            job_timeout: Self::DEFAULT_JOB_TIMEOUT,
            release_delay: Self::DEFAULT_RELEASE_DELAY,
            sweep_delay: Self::DEFAULT_SWEEP_DELAY,
        }
    }
}

/// Result cache bounds.
///
/// When an insert pushes the cache above `max_entries`, the oldest
/// entries are evicted until at most `clean_threshold` remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheLimits {
    /// Hard ceiling after any insert completes.
    pub max_entries: usize,
    /// Low-water mark reached by an eviction pass.
    pub clean_threshold: usize,
}

impl CacheLimits {
    /// Default ceiling.
    pub const DEFAULT_MAX_ENTRIES: usize = 200;
    /// Default low-water mark.
    pub const DEFAULT_CLEAN_THRESHOLD: usize = 150;
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            clean_threshold: Self::DEFAULT_CLEAN_THRESHOLD,
        }
    }
}

/// Overlay supervision timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceConfig {
    /// How often a supervisor re-asserts its overlay.
    #[serde(with = "secs")]
    pub overlay_check_interval: Duration,
    /// How long a supervisor runs after commit.
    #[serde(with = "secs")]
    pub overlay_supervision: Duration,
}

impl ResilienceConfig {
    /// Default re-assertion interval.
    pub const DEFAULT_OVERLAY_CHECK_INTERVAL: Duration = Duration::from_secs(1);
    /// Default supervision window.
    pub const DEFAULT_OVERLAY_SUPERVISION: Duration = Duration::from_secs(25);
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            overlay_check_interval: Self::DEFAULT_OVERLAY_CHECK_INTERVAL,
            overlay_supervision: Self::DEFAULT_OVERLAY_SUPERVISION,
        }
    }
}

/// `Duration` as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = EngineConfig::default();
        assert!(config.cache.clean_threshold <= config.cache.max_entries);
        assert!(config.scheduler.batch_size <= config.scheduler.max_concurrent);
        assert!(config.discovery.min_size < config.discovery.large_threshold);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"scheduler":{"maxConcurrent":2,"jobTimeout":0.5},"debounce":0.25}"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrent, 2);
        assert_eq!(config.scheduler.job_timeout, Duration::from_millis(500));
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(
            config.scheduler.batch_size,
            SchedulerLimits::DEFAULT_BATCH_SIZE
        );
        assert_eq!(config.cache, CacheLimits::default());
    }

    #[test]
    fn negative_duration_is_rejected() {
        let result: Result<EngineConfig, _> = serde_json::from_str(r#"{"debounce":-1.0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn serde_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
