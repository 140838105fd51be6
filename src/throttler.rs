//! Top-level throttler: task registry and background scheduler.
//!
//! A [`Throttler`] owns one task queue per registered task identifier, the
//! shared [`ThrottlerStrategy`] and the [`ThrottlerAdapter`]. Callers
//! address queues through typed [`TaskKey`]s; a queue registered with one
//! parameter/output pair cannot be reached with another.
//!
//! # Scheduling
//!
//! [`Throttler::start`] spawns a loop that calls [`Throttler::tick`] every
//! `scheduler_period`. A tick visits the queues least recently updated
//! first and starts at most one batch, then lets the strategy rebalance.
//! Provider calls run on their own tasks, so batches of different queues
//! may overlap; only the scheduling decision is serialized.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use vedrfolnir::{
//!     ExecutionType, Result, SettingsHandle, TaskKey, Throttler, ThrottlerAdapter,
//!     ThrottlerSettings, ThrottlerTask,
//! };
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum AzureTask {
//!     FetchInstances,
//! }
//!
//! const FETCH_INSTANCES: TaskKey<AzureTask, String, Vec<String>> =
//!     TaskKey::new(AzureTask::FetchInstances);
//!
//! struct FetchInstances;
//!
//! #[async_trait]
//! impl ThrottlerTask<()> for FetchInstances {
//!     type Parameter = String;
//!     type Output = Vec<String>;
//!
//!     async fn create(&self, _api: &(), group: &String) -> Result<Vec<String>> {
//!         Ok(vec![format!("{group}/vm-1")])
//!     }
//!
//!     fn is_cacheable(&self) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let settings = SettingsHandle::new(ThrottlerSettings::default());
//! let adapter = ThrottlerAdapter::standalone((), settings);
//! let throttler = Arc::new(Throttler::new("subscription-a", adapter));
//! throttler.register_task(
//!     FETCH_INSTANCES,
//!     Arc::new(FetchInstances),
//!     ExecutionType::Periodical,
//!     Duration::from_secs(60),
//! )?;
//! throttler.start();
//!
//! let instances = throttler
//!     .execute_task(FETCH_INSTANCES, "build-agents".to_string())
//!     .await?;
//! println!("{:?} (cached: {})", instances.value, instances.from_cache);
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{ApiCredentials, ApiHandleFactory, ThrottlerAdapter};
use crate::config::SettingsHandle;
use crate::queue::{CallStatistics, Pending, TaskQueue, ThrottlingSource};
use crate::strategy::{QueueControl, ThrottlerFlow, ThrottlerStrategy};
use crate::task::{ExecutionType, SharedTask, TaskDescriptor, TaskId, TaskKey, TaskOutput};
use crate::{Result, ThrottlerError};

/// One registered queue, reachable both type-erased (scheduler, strategy)
/// and typed (callers, via downcast).
struct RegisteredQueue {
    control: Arc<dyn QueueControl>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Request throttler for one authenticated API session.
pub struct Throttler<A, I> {
    name: String,
    adapter: Arc<ThrottlerAdapter<A>>,
    strategy: Arc<ThrottlerStrategy>,
    settings: SettingsHandle,
    queues: RwLock<HashMap<I, RegisteredQueue>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl<A, I: fmt::Debug> fmt::Debug for Throttler<A, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks: Vec<String> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|id| format!("{id:?}"))
            .collect();
        f.debug_struct("Throttler")
            .field("name", &self.name)
            .field("flow", &self.strategy.flow())
            .field("tasks", &tasks)
            .finish()
    }
}

impl<A, I> Throttler<A, I> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flow(&self) -> ThrottlerFlow {
        self.strategy.flow()
    }

    pub fn strategy(&self) -> &Arc<ThrottlerStrategy> {
        &self.strategy
    }

    pub fn adapter(&self) -> &Arc<ThrottlerAdapter<A>> {
        &self.adapter
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the scheduler and the deferral refill loop. Queued requests
    /// stay queued until the throttler is started again or dropped.
    pub fn stop(&self) {
        let task = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            self.adapter.time_manager().stop();
            info!(throttler = %self.name, "throttler stopped");
        }
    }
}

impl<A, I> Throttler<A, I>
where
    A: Send + Sync + 'static,
    I: TaskId,
{
    pub fn new(name: impl Into<String>, adapter: ThrottlerAdapter<A>) -> Self {
        let settings = adapter.settings().clone();
        let strategy = Arc::new(ThrottlerStrategy::new(adapter.quota().clone(), settings.clone()));
        Self {
            name: name.into(),
            adapter: Arc::new(adapter),
            strategy,
            settings,
            queues: RwLock::new(HashMap::new()),
            scheduler: Mutex::new(None),
        }
    }

    /// Create the API handle from `credentials` and wrap it.
    pub async fn connect<F>(
        name: impl Into<String>,
        factory: &F,
        credentials: &ApiCredentials,
        settings: SettingsHandle,
    ) -> Result<Self>
    where
        F: ApiHandleFactory<A>,
    {
        let adapter = ThrottlerAdapter::connect(factory, credentials, settings).await?;
        Ok(Self::new(name, adapter))
    }

    /// Create the queue for `key`. Each identifier can be registered once.
    pub fn register_task<P, O>(
        &self,
        key: TaskKey<I, P, O>,
        task: SharedTask<A, P, O>,
        execution_type: ExecutionType,
        default_timeout: Duration,
    ) -> Result<()>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.insert_queue(key, task, execution_type, default_timeout)
            .map(|_| ())
    }

    /// Register a descriptor; a missing default timeout falls back to the
    /// class timeout from the settings.
    pub fn register_descriptor<P, O>(&self, descriptor: &TaskDescriptor<A, I, P, O>) -> Result<()>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let default_timeout = descriptor.default_timeout.unwrap_or_else(|| {
            self.settings
                .read(|s| s.default_cache_timeout(descriptor.execution_type))
        });
        let queue = self.insert_queue(
            descriptor.key,
            (descriptor.factory)(),
            descriptor.execution_type,
            default_timeout,
        )?;
        queue.enable_retry_on_throttle(descriptor.retry_on_throttle);
        Ok(())
    }

    /// Re-enqueue rate-limited requests of `key` instead of failing them.
    pub fn enable_retry_on_throttle<P, O>(&self, key: TaskKey<I, P, O>) -> Result<()>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.queue(key)?.enable_retry_on_throttle(true);
        Ok(())
    }

    /// Run the task for `parameter`, from cache when the queue allows it.
    pub async fn execute_task<P, O>(&self, key: TaskKey<I, P, O>, parameter: P) -> Result<TaskOutput<O>>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let queue = self.queue(key)?;
        queue.request_task(self.strategy.flow(), parameter).await
    }

    /// Like [`execute_task`](Self::execute_task), failing with
    /// [`ThrottlerError::Timeout`] once `timeout` elapses. The request
    /// stays queued and still executes; only this caller stops waiting.
    pub async fn execute_task_with_timeout<P, O>(
        &self,
        key: TaskKey<I, P, O>,
        parameter: P,
        timeout: Duration,
    ) -> Result<TaskOutput<O>>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let queue = self.queue(key)?;
        match queue.submit(self.strategy.flow(), parameter) {
            Pending::Ready(outcome) => outcome,
            Pending::Waiting(mut rx) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(outcome) => outcome.unwrap_or(Err(ThrottlerError::Stopped)),
                Err(_) => {
                    warn!(
                        throttler = %self.name,
                        task = ?key.id(),
                        timeout_ms = timeout.as_millis() as u64,
                        "timed out waiting for task result"
                    );
                    // keep the subscription so the batch is not pruned
                    tokio::spawn(async move {
                        let _ = rx.await;
                    });
                    Err(ThrottlerError::Timeout(timeout))
                }
            },
        }
    }

    /// Execute on the next tick, bypassing cache and timing.
    pub async fn refresh_task<P, O>(&self, key: TaskKey<I, P, O>, parameter: P) -> Result<TaskOutput<O>>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.queue(key)?.refresh(parameter).await
    }

    pub fn invalidate_cache<P, O>(&self, key: TaskKey<I, P, O>) -> Result<()>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.queue(key)?.invalidate_cache();
        Ok(())
    }

    pub fn statistics<P, O>(&self, key: TaskKey<I, P, O>, since: Instant) -> Result<CallStatistics> {
        Ok(self.control(key.id())?.statistics(since))
    }

    pub fn cache_timeout<P, O>(&self, key: TaskKey<I, P, O>) -> Result<Duration> {
        Ok(self.control(key.id())?.cache_timeout())
    }

    /// Raise the cache timeout of one queue. Returns `false` when the value
    /// would not increase the current timeout.
    pub fn set_cache_timeout<P, O>(
        &self,
        key: TaskKey<I, P, O>,
        timeout: Duration,
        source: ThrottlingSource,
    ) -> Result<bool> {
        Ok(self.control(key.id())?.set_cache_timeout(timeout, source))
    }

    /// Start the scheduler and the deferral refill loop. No-op when
    /// already running.
    pub fn start(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if scheduler.is_some() {
            return;
        }
        self.adapter.time_manager().start();

        let throttler = Arc::downgrade(self);
        *scheduler = Some(tokio::spawn(async move {
            loop {
                let Some(period) = throttler.upgrade().map(|throttler| {
                    throttler.tick();
                    throttler.settings.read(|s| s.scheduler_period_duration())
                }) else {
                    break;
                };
                tokio::time::sleep(period).await;
            }
        }));
        info!(throttler = %self.name, "throttler started");
    }

    /// One scheduler round. Returns whether a batch was started.
    #[instrument(level = "trace", skip(self), fields(throttler = %self.name))]
    pub fn tick(&self) -> bool {
        let queues: Vec<Arc<dyn QueueControl>> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|queue| queue.control.clone())
            .collect();
        let executed = run_scheduler_round(&queues);
        if executed {
            self.strategy.apply_task_changes();
        }
        executed
    }

    fn insert_queue<P, O>(
        &self,
        key: TaskKey<I, P, O>,
        task: SharedTask<A, P, O>,
        execution_type: ExecutionType,
        default_timeout: Duration,
    ) -> Result<Arc<TaskQueue<A, P, O>>>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let id = key.id();
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        if queues.contains_key(&id) {
            return Err(ThrottlerError::DuplicateTask(format!("{id:?}")));
        }

        let queue = Arc::new(TaskQueue::new(
            format!("{id:?}"),
            task,
            execution_type,
            default_timeout,
            self.adapter.clone(),
            self.strategy.clone(),
            self.settings.clone(),
        ));
        let control: Arc<dyn QueueControl> = queue.clone();
        self.strategy.register_task(Arc::downgrade(&control));
        queues.insert(
            id,
            RegisteredQueue {
                control,
                typed: queue.clone(),
            },
        );
        debug!(
            throttler = %self.name,
            task = ?id,
            ?execution_type,
            default_timeout_ms = default_timeout.as_millis() as u64,
            "task registered"
        );
        Ok(queue)
    }

    fn queue<P, O>(&self, key: TaskKey<I, P, O>) -> Result<Arc<TaskQueue<A, P, O>>>
    where
        P: Clone + Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let id = key.id();
        let typed = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|queue| queue.typed.clone())
            .ok_or_else(|| ThrottlerError::TaskNotRegistered(format!("{id:?}")))?;
        typed
            .downcast::<TaskQueue<A, P, O>>()
            .map_err(|_| ThrottlerError::TaskTypeMismatch(format!("{id:?}")))
    }

    fn control(&self, id: I) -> Result<Arc<dyn QueueControl>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|queue| queue.control.clone())
            .ok_or_else(|| ThrottlerError::TaskNotRegistered(format!("{id:?}")))
    }
}

impl<A, I> Drop for Throttler<A, I> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Offer a batch slot to `queues`, least recently updated first, until one
/// of them starts a batch.
fn run_scheduler_round(queues: &[Arc<dyn QueueControl>]) -> bool {
    let mut ordered = queues.to_vec();
    ordered.sort_by_key(|queue| queue.last_updated());
    ordered.into_iter().any(|queue| queue.execute_next())
}
