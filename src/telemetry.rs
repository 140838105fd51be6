//! Telemetry metric name constants.
//!
//! Centralised metric names for throttler operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `vedrfolnir_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `task`: task identifier (its `Debug` rendering)
//! - `status`: outcome: "ok", "rate_limited" or "error"
//! - `flow`: target flow of a transition: "normal" or "suspended"

/// Total batches executed against the provider.
///
/// Labels: `task`, `status` ("ok" | "rate_limited" | "error").
pub const EXECUTIONS_TOTAL: &str = "vedrfolnir_executions_total";

/// Batch execution duration in seconds.
///
/// Labels: `task`.
pub const EXECUTION_DURATION_SECONDS: &str = "vedrfolnir_execution_duration_seconds";

/// Requests served from a task cache.
///
/// Labels: `task`.
pub const CACHE_HITS_TOTAL: &str = "vedrfolnir_cache_hits_total";

/// Requests that missed the task cache (or bypassed it).
///
/// Labels: `task`.
pub const CACHE_MISSES_TOTAL: &str = "vedrfolnir_cache_misses_total";

/// Queue items re-enqueued after a rate-limit rejection.
///
/// Labels: `task`.
pub const RETRIES_TOTAL: &str = "vedrfolnir_retries_total";

/// Rate-limit rejections observed from the provider.
pub const RATE_LIMITS_TOTAL: &str = "vedrfolnir_rate_limits_total";

/// Flow transitions performed by the strategy.
///
/// Labels: `flow` ("normal" | "suspended").
pub const FLOW_TRANSITIONS_TOTAL: &str = "vedrfolnir_flow_transitions_total";

/// Last remaining-reads value reported by the provider.
pub const REMAINING_READS: &str = "vedrfolnir_remaining_reads";
