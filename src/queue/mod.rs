//! Per-task queue: cache, request batching and retry handling.
//!
//! A [`TaskQueue`] owns everything about one registered task: the pending
//! [`RequestQueue`], its [`CallHistory`], the optional [`TaskCache`] and the
//! [`CacheTimeout`] the strategy adjusts. The scheduler drives it through
//! [`QueueControl::execute_next`]; callers reach it through
//! [`TaskQueue::request_task`].
//!
//! # Request decision
//!
//! For a cacheable task in Normal flow:
//!
//! | cached entry age                      | outcome                                   |
//! |---------------------------------------|-------------------------------------------|
//! | below the queue's default timeout     | served from cache                         |
//! | below the effective (raised) timeout  | waits for a refresh due at `updated + timeout` |
//! | otherwise, or no entry                | enqueued for the next tick                |
//!
//! In Suspended flow any cached entry is served; a miss is enqueued no
//! earlier than the strategy's resume time.

pub mod cache;
pub mod history;
pub mod request;

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapter::{AdapterResult, ThrottlerAdapter};
use crate::config::SettingsHandle;
use crate::strategy::{QueueControl, ThrottlerFlow, ThrottlerStrategy};
use crate::task::{ExecutionType, SharedTask, TaskOutput};
use crate::{Result, ThrottlerError, telemetry};

pub use cache::{CacheEntry, CacheTimeout, TaskCache, ThrottlingSource};
pub use history::{CallHistory, CallStatistics, HISTORY_WINDOW};
pub use request::{ParameterComparer, QueueItem, RequestBatch, RequestQueue, ResultSink};

/// Outcome of submitting a request: either settled on the spot (cache hit)
/// or waiting for a batch.
#[derive(Debug)]
pub(crate) enum Pending<O> {
    Ready(Result<TaskOutput<O>>),
    Waiting(oneshot::Receiver<Result<TaskOutput<O>>>),
}

impl<O> Pending<O> {
    pub(crate) async fn wait(self) -> Result<TaskOutput<O>> {
        match self {
            Pending::Ready(outcome) => outcome,
            Pending::Waiting(rx) => rx.await.unwrap_or(Err(ThrottlerError::Stopped)),
        }
    }
}

/// Queue, cache and history of one registered task.
pub struct TaskQueue<A, P, O> {
    label: String,
    task: SharedTask<A, P, O>,
    execution_type: ExecutionType,
    adapter: Arc<ThrottlerAdapter<A>>,
    strategy: Arc<ThrottlerStrategy>,
    settings: SettingsHandle,
    requests: RequestQueue<P, O>,
    history: CallHistory,
    cache: Option<TaskCache<P, O>>,
    timeout: CacheTimeout,
    retry_on_throttle: AtomicBool,
    last_updated: Mutex<Option<Instant>>,
}

impl<A, P, O> TaskQueue<A, P, O>
where
    A: Send + Sync + 'static,
    P: Clone + Eq + Hash + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new(
        label: String,
        task: SharedTask<A, P, O>,
        execution_type: ExecutionType,
        default_timeout: Duration,
        adapter: Arc<ThrottlerAdapter<A>>,
        strategy: Arc<ThrottlerStrategy>,
        settings: SettingsHandle,
    ) -> Self {
        let comparer: ParameterComparer<P> = {
            let task = task.clone();
            Arc::new(move |left: &P, right: &P| task.same_parameters(left, right))
        };
        let cache = task.is_cacheable().then(|| {
            let (capacity, ttl) = settings.read(|s| (s.cache_max_entries, s.cache_ttl_duration()));
            TaskCache::new(capacity, ttl)
        });
        Self {
            label,
            task,
            execution_type,
            adapter,
            strategy,
            settings,
            requests: RequestQueue::new(comparer),
            history: CallHistory::new(),
            cache,
            timeout: CacheTimeout::new(default_timeout),
            retry_on_throttle: AtomicBool::new(false),
            last_updated: Mutex::new(None),
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache.is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn enable_retry_on_throttle(&self, enabled: bool) {
        self.retry_on_throttle.store(enabled, Ordering::Release);
    }

    pub fn retry_on_throttle(&self) -> bool {
        self.retry_on_throttle.load(Ordering::Acquire)
    }

    /// Drop cached entries and any rebalanced timeout. A timeout forced by
    /// a rate limit stays until the flow resumes.
    pub fn invalidate_cache(&self) {
        self.reset_cache(ThrottlingSource::Throttler);
    }

    /// Request the task for `parameter` and wait for the outcome.
    pub async fn request_task(&self, flow: ThrottlerFlow, parameter: P) -> Result<TaskOutput<O>> {
        self.submit(flow, parameter).wait().await
    }

    /// Execute on the next tick regardless of cache state and timing.
    pub async fn refresh(&self, parameter: P) -> Result<TaskOutput<O>> {
        self.submit_forced(parameter).wait().await
    }

    pub(crate) fn submit(&self, flow: ThrottlerFlow, parameter: P) -> Pending<O> {
        self.history.add_request_call();
        let now = Instant::now();

        if let Some(entry) = self.cache.as_ref().and_then(|c| c.get_from_cache(&parameter)) {
            let age = entry.age(now);
            match flow {
                ThrottlerFlow::Suspended => {
                    debug!(task = %self.label, age_ms = age.as_millis() as u64, "suspended, serving cache");
                    return self.cache_hit(entry.value);
                }
                ThrottlerFlow::Normal if age < self.timeout.default_value() => {
                    if self.settings.read(|s| s.refresh_on_cache_hit) {
                        self.requests
                            .add_background_once(entry.updated_at + self.timeout.get(), parameter, now);
                    }
                    return self.cache_hit(entry.value);
                }
                ThrottlerFlow::Normal => {
                    let timeout = self.timeout.get();
                    if age < timeout {
                        debug!(
                            task = %self.label,
                            age_ms = age.as_millis() as u64,
                            timeout_ms = timeout.as_millis() as u64,
                            "cache stale but throttled"
                        );
                        return self.enqueue(entry.updated_at + timeout, parameter, now);
                    }
                }
            }
        }

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "task" => self.label.clone()).increment(1);
        let execute_at = match flow {
            ThrottlerFlow::Normal => now,
            ThrottlerFlow::Suspended => self
                .strategy
                .resume_after()
                .map_or(now, |resume| resume.max(now)),
        };
        self.enqueue(execute_at, parameter, now)
    }

    pub(crate) fn submit_forced(&self, parameter: P) -> Pending<O> {
        self.history.add_request_call();
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "task" => self.label.clone()).increment(1);
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.requests.add_request(
            now,
            parameter,
            ResultSink::Caller(tx),
            true,
            self.task.combine_requests(),
            1,
            now,
        );
        Pending::Waiting(rx)
    }

    fn cache_hit(&self, value: O) -> Pending<O> {
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "task" => self.label.clone()).increment(1);
        Pending::Ready(Ok(TaskOutput::cached(value)))
    }

    fn enqueue(&self, execute_at: Instant, parameter: P, now: Instant) -> Pending<O> {
        let (tx, rx) = oneshot::channel();
        self.requests.add_request(
            execute_at,
            parameter,
            ResultSink::Caller(tx),
            false,
            self.task.combine_requests(),
            1,
            now,
        );
        Pending::Waiting(rx)
    }

    async fn execute_batch(self: Arc<Self>, batch: RequestBatch<P, O>) {
        let Some(parameter) = batch.parameter().cloned() else {
            return;
        };
        let started = Instant::now();
        let task = self.task.clone();
        let query_parameter = parameter.clone();
        let outcome = self
            .adapter
            .execute(&self.label, |api| async move { task.create(api, &query_parameter).await })
            .await;
        metrics::histogram!(telemetry::EXECUTION_DURATION_SECONDS, "task" => self.label.clone())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => self.complete(batch, parameter, result),
            Err(err) if err.is_rate_limit() => self.rate_limited(batch, err),
            Err(err) => {
                warn!(task = %self.label, error = %err, subscribers = batch.len(), "task failed");
                self.history.add_execution_call(None);
                metrics::counter!(telemetry::EXECUTIONS_TOTAL, "task" => self.label.clone(), "status" => "error")
                    .increment(1);
                batch.deliver(Err(err));
            }
        }
    }

    fn complete(&self, batch: RequestBatch<P, O>, parameter: P, result: AdapterResult<O>) {
        self.history.add_execution_call(result.consumed_reads);
        metrics::counter!(telemetry::EXECUTIONS_TOTAL, "task" => self.label.clone(), "status" => "ok")
            .increment(1);
        // Resuming resets every cache, so resume before storing the fresh value.
        self.strategy.notify_completed();
        if let Some(cache) = &self.cache {
            cache.set_to_cache(parameter.clone(), result.value.clone());
        }
        debug!(
            task = %self.label,
            subscribers = batch.len(),
            consumed_reads = result.consumed_reads,
            "batch executed"
        );

        let output = TaskOutput::executed(result.value);
        batch.deliver(Ok(output.clone()));
        loop {
            let stragglers = self.requests.extract_batch_for(&parameter);
            if stragglers.is_empty() {
                break;
            }
            debug!(task = %self.label, subscribers = stragglers.len(), "delivering to late subscribers");
            stragglers.deliver(Ok(output.clone()));
        }
    }

    fn rate_limited(&self, batch: RequestBatch<P, O>, err: ThrottlerError) {
        let settings = self.settings.get();
        let retry_after = settings.clamp_retry_after(
            err.retry_after()
                .unwrap_or(settings.default_retry_after_duration()),
        );
        self.history.add_execution_call(None);
        metrics::counter!(telemetry::EXECUTIONS_TOTAL, "task" => self.label.clone(), "status" => "rate_limited")
            .increment(1);
        self.strategy.notify_rate_limit_reached(retry_after);

        if !self.retry_on_throttle() {
            batch.deliver(Err(err));
            return;
        }

        let now = Instant::now();
        let max_lifetime = settings.max_task_lifetime_duration();
        for item in batch.into_items() {
            if item.attempt_no >= settings.max_retry_count {
                warn!(task = %self.label, attempts = item.attempt_no, "retry count exhausted");
                item.sink.deliver(Err(ThrottlerError::MaxRetryCountExceeded {
                    attempts: item.attempt_no,
                    max: settings.max_retry_count,
                }));
                continue;
            }
            let lifetime = (now + retry_after).saturating_duration_since(item.created_at);
            if lifetime > max_lifetime {
                warn!(task = %self.label, lifetime_secs = lifetime.as_secs(), "task lifetime exhausted");
                item.sink.deliver(Err(ThrottlerError::MaxTaskLifetimeExceeded {
                    lifetime: max_lifetime,
                }));
                continue;
            }

            debug!(
                task = %self.label,
                attempt = item.attempt_no + 1,
                retry_after_ms = retry_after.as_millis() as u64,
                "rescheduling rate-limited request"
            );
            metrics::counter!(telemetry::RETRIES_TOTAL, "task" => self.label.clone()).increment(1);
            self.requests.add_request(
                now + retry_after,
                item.parameter,
                item.sink,
                false,
                item.can_combine,
                item.attempt_no + 1,
                item.created_at,
            );
        }
    }
}

impl<A, P, O> QueueControl for TaskQueue<A, P, O>
where
    A: Send + Sync + 'static,
    P: Clone + Eq + Hash + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn execution_type(&self) -> ExecutionType {
        self.execution_type
    }

    fn last_updated(&self) -> Option<Instant> {
        *self.last_updated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute_next(self: Arc<Self>) -> bool {
        let now = Instant::now();
        let held = self.strategy.flow() == ThrottlerFlow::Suspended
            && self.strategy.resume_after().is_some_and(|resume| resume > now);
        let batch = if held {
            self.requests.extract_forced_batch()
        } else {
            self.requests.extract_next_batch(now)
        };
        if batch.is_empty() {
            return false;
        }
        *self.last_updated.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        tokio::spawn(self.execute_batch(batch));
        true
    }

    fn cache_timeout(&self) -> Duration {
        self.timeout.get()
    }

    fn set_cache_timeout(&self, timeout: Duration, source: ThrottlingSource) -> bool {
        self.timeout.set(timeout, source)
    }

    fn reset_cache(&self, source: ThrottlingSource) {
        if let Some(cache) = &self.cache {
            cache.invalidate_cache();
        }
        self.timeout.reset(source);
    }

    fn reset_cache_timeout(&self, source: ThrottlingSource) {
        self.timeout.reset(source);
    }

    fn statistics(&self, since: Instant) -> CallStatistics {
        self.history.get_statistics(since)
    }
}
