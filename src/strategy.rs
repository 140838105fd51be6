//! Throttler strategy: flow state machine and quota rebalancing.
//!
//! The strategy owns the throttler-wide [`ThrottlerFlow`]. Only two
//! operations move it:
//!
//! - [`ThrottlerStrategy::notify_rate_limit_reached`] (Normal → Suspended):
//!   raises every queue's cache timeout to `retry_after + rate_limit_delta`
//!   as an adapter-forced value;
//! - [`ThrottlerStrategy::notify_completed`] (Suspended → Normal): resets
//!   every queue's cache so data fetched while suspended is not served
//!   forever.
//!
//! [`ThrottlerStrategy::apply_task_changes`] runs once per scheduler tick
//! and spreads the remaining provider quota over the registered queues.
//!
//! Queues are held as [`Weak`] references; a queue dropped with its
//! throttler simply disappears from the next pass.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::QuotaWindow;
use crate::config::SettingsHandle;
use crate::queue::{CallStatistics, HISTORY_WINDOW, ThrottlingSource};
use crate::task::ExecutionType;
use crate::telemetry;

/// Throttler-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottlerFlow {
    Normal,
    /// The provider rejected a call for rate limiting; cached data is
    /// preferred over fresh calls until a call succeeds again.
    Suspended,
}

impl ThrottlerFlow {
    fn as_u8(self) -> u8 {
        match self {
            ThrottlerFlow::Normal => 0,
            ThrottlerFlow::Suspended => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ThrottlerFlow::Suspended,
            _ => ThrottlerFlow::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThrottlerFlow::Normal => "normal",
            ThrottlerFlow::Suspended => "suspended",
        }
    }
}

/// What the strategy and the scheduler need from a task queue, independent
/// of its parameter and output types.
pub trait QueueControl: Send + Sync {
    /// Name used in logs and metric labels.
    fn label(&self) -> &str;

    fn execution_type(&self) -> ExecutionType;

    /// When the queue last started a batch; `None` if never.
    fn last_updated(&self) -> Option<Instant>;

    /// Start the next ready batch. Returns `false` when nothing was ready.
    fn execute_next(self: Arc<Self>) -> bool;

    fn cache_timeout(&self) -> Duration;

    /// Raise the cache timeout; rejected unless it grows.
    fn set_cache_timeout(&self, timeout: Duration, source: ThrottlingSource) -> bool;

    /// Drop every cached entry and reset the timeout raised by `source`.
    fn reset_cache(&self, source: ThrottlingSource);

    /// Reset the timeout raised by `source`, keeping cached entries.
    fn reset_cache_timeout(&self, source: ThrottlingSource);

    fn statistics(&self, since: Instant) -> CallStatistics;
}

/// Flow state and quota rebalancing shared by all queues of one throttler.
pub struct ThrottlerStrategy {
    flow: AtomicU8,
    quota: Arc<QuotaWindow>,
    settings: SettingsHandle,
    tasks: RwLock<Vec<Weak<dyn QueueControl>>>,
    resume_after: Mutex<Option<Instant>>,
    last_window_start: Mutex<Instant>,
}

impl std::fmt::Debug for ThrottlerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottlerStrategy")
            .field("flow", &self.flow())
            .field("tasks", &self.read_tasks().len())
            .field("resume_after", &self.resume_after())
            .finish()
    }
}

impl ThrottlerStrategy {
    pub fn new(quota: Arc<QuotaWindow>, settings: SettingsHandle) -> Self {
        let window_start = quota.window_start();
        Self {
            flow: AtomicU8::new(ThrottlerFlow::Normal.as_u8()),
            quota,
            settings,
            tasks: RwLock::new(Vec::new()),
            resume_after: Mutex::new(None),
            last_window_start: Mutex::new(window_start),
        }
    }

    pub fn flow(&self) -> ThrottlerFlow {
        ThrottlerFlow::from_u8(self.flow.load(Ordering::Acquire))
    }

    /// Earliest time a suspended request should be retried.
    pub fn resume_after(&self) -> Option<Instant> {
        *self.resume_after.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_task(&self, task: Weak<dyn QueueControl>) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// The provider rejected a call. Enter (or stay in) Suspended flow and
    /// hold every cache for at least `retry_after + rate_limit_delta`.
    pub fn notify_rate_limit_reached(&self, retry_after: Duration) {
        let (retry_after, delta) = self
            .settings
            .read(|s| (s.clamp_retry_after(retry_after), s.rate_limit_delta_duration()));
        let previous = self
            .flow
            .swap(ThrottlerFlow::Suspended.as_u8(), Ordering::AcqRel);
        metrics::counter!(telemetry::RATE_LIMITS_TOTAL).increment(1);
        if ThrottlerFlow::from_u8(previous) == ThrottlerFlow::Normal {
            warn!(retry_after_secs = retry_after.as_secs(), "rate limit reached, suspending flow");
            metrics::counter!(telemetry::FLOW_TRANSITIONS_TOTAL, "flow" => "suspended")
                .increment(1);
        }

        let timeout = retry_after.saturating_add(delta);
        for task in self.live_tasks() {
            if task.set_cache_timeout(timeout, ThrottlingSource::Adapter) {
                debug!(task = task.label(), timeout_secs = timeout.as_secs(), "cache timeout forced");
            }
        }

        let now = Instant::now();
        let resume = now.checked_add(retry_after).unwrap_or(now);
        let mut resume_after = self.resume_after.lock().unwrap_or_else(PoisonError::into_inner);
        *resume_after = Some(resume_after.map_or(resume, |current| current.max(resume)));
    }

    /// A provider call succeeded. Leaves Suspended flow if it was active.
    pub fn notify_completed(&self) {
        let resumed = self
            .flow
            .compare_exchange(
                ThrottlerFlow::Suspended.as_u8(),
                ThrottlerFlow::Normal.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !resumed {
            return;
        }

        info!("provider call succeeded, resuming normal flow");
        metrics::counter!(telemetry::FLOW_TRANSITIONS_TOTAL, "flow" => "normal").increment(1);
        *self.resume_after.lock().unwrap_or_else(PoisonError::into_inner) = None;
        for task in self.live_tasks() {
            task.reset_cache(ThrottlingSource::Adapter);
        }
    }

    /// Rebalance cache timeouts and the per-request delay against the
    /// quota left in the current window.
    pub fn apply_task_changes(&self) {
        let state = self.quota.state();
        let tasks = self.live_tasks();

        {
            let mut last = self
                .last_window_start
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *last != state.window_start {
                *last = state.window_start;
                debug!("new quota window, resetting rebalanced timeouts");
                for task in &tasks {
                    task.reset_cache_timeout(ThrottlingSource::Throttler);
                }
            }
        }

        let (Some(default_reads), Some(remaining_reads)) = (state.default_reads, state.remaining_reads)
        else {
            return;
        };
        let settings = self.settings.get();
        let window_ms = self.quota.window_width_in_milliseconds();

        let usable = 100u64.saturating_sub(u64::from(settings.resource_reservation_percent));
        let operable_total = default_reads.saturating_mul(usable) / 100;
        let operable_remaining = remaining_reads.saturating_mul(usable) / 100;

        if operable_remaining == 0 {
            warn!(window_ms, "operable quota exhausted, pausing until window reset");
            self.quota.set_throttling_delay(Duration::from_millis(window_ms));
            return;
        }

        if self.flow() == ThrottlerFlow::Normal {
            let random_usage: u64 = tasks
                .iter()
                .filter(|task| task.execution_type() == ExecutionType::Random)
                .map(|task| task.statistics(state.window_start).resource_units.unwrap_or(0))
                .sum();
            let random_reserve = random_usage.max(
                operable_total.saturating_mul(u64::from(settings.random_task_reservation_percent)) / 100,
            );
            let random_left = random_reserve - random_usage;
            let periodical_total = operable_remaining.saturating_sub(random_left);

            let periodical: Vec<_> = tasks
                .iter()
                .filter(|task| task.execution_type() == ExecutionType::Periodical)
                .collect();
            if !periodical.is_empty() {
                let share = periodical_total as f64 / periodical.len() as f64;
                let since = Instant::now()
                    .checked_sub(HISTORY_WINDOW)
                    .unwrap_or(state.window_start);
                for task in periodical {
                    let cost = task
                        .statistics(since)
                        .average_execution_cost()
                        .filter(|cost| *cost > 0.0)
                        .unwrap_or(1.0);
                    let calls = (share / cost).ceil() as u64;
                    let timeout = Duration::from_millis(window_ms / (calls + 1));
                    if task.set_cache_timeout(timeout, ThrottlingSource::Throttler) {
                        debug!(
                            task = task.label(),
                            timeout_ms = timeout.as_millis() as u64,
                            share,
                            "periodical cache timeout rebalanced"
                        );
                    }
                }
            }
        }

        let remaining_percent = remaining_reads.saturating_mul(100) / default_reads.max(1);
        let threshold = 100u64.saturating_sub(u64::from(settings.aggressive_throttling_limit_percent));
        let delay = if remaining_percent <= threshold {
            Duration::from_millis(window_ms / remaining_reads.max(1))
        } else {
            Duration::ZERO
        };
        self.quota.set_throttling_delay(delay);
    }

    fn live_tasks(&self) -> Vec<Arc<dyn QueueControl>> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| task.strong_count() > 0);
        tasks.iter().filter_map(Weak::upgrade).collect()
    }

    fn read_tasks(&self) -> std::sync::RwLockReadGuard<'_, Vec<Weak<dyn QueueControl>>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }
}
