//! Metrics emission tests.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

use vedrfolnir::{
    ExecutionType, QuotaWindow, Result, SettingsHandle, TaskKey, Throttler, ThrottlerAdapter,
    ThrottlerError, ThrottlerSettings, ThrottlerStrategy, ThrottlerTask, telemetry,
};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AzureTask {
    FetchInstances,
}

const FETCH_INSTANCES: TaskKey<AzureTask, String, String> = TaskKey::new(AzureTask::FetchInstances);

struct CountingTask {
    calls: Arc<AtomicU32>,
    failure: Option<ThrottlerError>,
}

#[async_trait]
impl ThrottlerTask<()> for CountingTask {
    type Parameter = String;
    type Output = String;

    async fn create(&self, _api: &(), parameter: &String) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(format!("{parameter}-vms")),
        }
    }

    fn is_cacheable(&self) -> bool {
        true
    }
}

fn throttler(settings: ThrottlerSettings, failure: Option<ThrottlerError>) -> (Arc<Throttler<(), AzureTask>>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let adapter = ThrottlerAdapter::standalone((), SettingsHandle::new(settings));
    let throttler = Arc::new(Throttler::new("metrics", adapter));
    throttler
        .register_task(
            FETCH_INSTANCES,
            Arc::new(CountingTask {
                calls: calls.clone(),
                failure,
            }),
            ExecutionType::Periodical,
            Duration::from_secs(60),
        )
        .unwrap();
    throttler.start();
    (throttler, calls)
}

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Sum counter values matching a metric name and one label pair.
fn counter_with_label(snapshot: &SnapshotVec, name: &str, label: &str, value: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| {
            key.kind() == MetricKind::Counter
                && key.key().name() == name
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == label && l.value() == value)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Check if any histogram entries exist for a given metric name.
fn has_histogram(snapshot: &SnapshotVec, name: &str) -> bool {
    snapshot
        .iter()
        .any(|(key, _, _, _)| key.kind() == MetricKind::Histogram && key.key().name() == name)
}

/// Last value of a gauge, if it was ever set.
fn gauge_value(snapshot: &SnapshotVec, name: &str) -> Option<f64> {
    snapshot.iter().find_map(|(key, _, _, value)| match value {
        DebugValue::Gauge(v) if key.key().name() == name => Some(v.0),
        _ => None,
    })
}

// ============================================================================
// Tests
// ============================================================================

/// Batches run on spawned tasks, so the recorder is installed as the
/// thread default on a current-thread runtime where every task is polled.
#[tokio::test(start_paused = true)]
async fn test_execution_and_cache_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let (throttler, calls) = throttler(ThrottlerSettings::default(), None);
    for _ in 0..2 {
        let output = throttler
            .execute_task(FETCH_INSTANCES, "agents".to_string())
            .await
            .unwrap();
        assert_eq!(output.value, "agents-vms");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::EXECUTIONS_TOTAL, "status", "ok"),
        1
    );
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_HITS_TOTAL), 1);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::CACHE_HITS_TOTAL, "task", "FetchInstances"),
        1
    );
    assert!(
        has_histogram(&snapshot, telemetry::EXECUTION_DURATION_SECONDS),
        "expected a duration histogram entry"
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_retry_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let (throttler, calls) = throttler(
        ThrottlerSettings::default().max_retry_count(3),
        Some(ThrottlerError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        }),
    );
    throttler.enable_retry_on_throttle(FETCH_INSTANCES).unwrap();

    let err = throttler
        .execute_task(FETCH_INSTANCES, "agents".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ThrottlerError::MaxRetryCountExceeded { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::EXECUTIONS_TOTAL, "status", "rate_limited"),
        3
    );
    assert_eq!(counter_total(&snapshot, telemetry::RETRIES_TOTAL), 2);
    assert_eq!(counter_total(&snapshot, telemetry::RATE_LIMITS_TOTAL), 3);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::FLOW_TRANSITIONS_TOTAL, "flow", "suspended"),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_execution_records_error_status() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let (throttler, _) = throttler(
        ThrottlerSettings::default(),
        Some(ThrottlerError::Api {
            status: 409,
            message: "conflict".to_string(),
        }),
    );
    let _ = throttler
        .execute_task(FETCH_INSTANCES, "agents".to_string())
        .await;

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::EXECUTIONS_TOTAL, "status", "error"),
        1
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::EXECUTIONS_TOTAL, "status", "ok"),
        0
    );
    assert_eq!(counter_total(&snapshot, telemetry::RATE_LIMITS_TOTAL), 0);
}

#[test]
fn test_flow_transitions_are_counted_once_per_change() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        let settings = SettingsHandle::new(ThrottlerSettings::default());
        let quota = Arc::new(QuotaWindow::new(settings.clone()));
        let strategy = ThrottlerStrategy::new(quota, settings);

        strategy.notify_rate_limit_reached(Duration::from_secs(10));
        strategy.notify_rate_limit_reached(Duration::from_secs(20));
        strategy.notify_completed();
        strategy.notify_completed();
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::RATE_LIMITS_TOTAL), 2);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::FLOW_TRANSITIONS_TOTAL, "flow", "suspended"),
        1
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::FLOW_TRANSITIONS_TOTAL, "flow", "normal"),
        1
    );
}

#[test]
fn test_remaining_reads_gauge() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        let quota = QuotaWindow::new(SettingsHandle::new(ThrottlerSettings::default()));
        quota.notify_remaining_reads(12_000);
        quota.notify_remaining_reads(11_999);
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(gauge_value(&snapshot, telemetry::REMAINING_READS), Some(11_999.0));
}
