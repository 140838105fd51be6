//! Task capability traits and descriptors.
//!
//! A task wraps one remote operation (list virtual machines, create a
//! deployment, ...). Tasks implement a single capability trait,
//! [`ThrottlerTask`], and opt into result caching through
//! [`ThrottlerTask::is_cacheable`] rather than through a second trait
//! hierarchy. The owning task queue supplies the cache itself.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use vedrfolnir::{Result, ThrottlerTask};
//!
//! struct ListVirtualMachines;
//!
//! #[async_trait]
//! impl ThrottlerTask<Vec<String>> for ListVirtualMachines {
//!     type Parameter = String;
//!     type Output = Vec<String>;
//!
//!     async fn create(&self, api: &Vec<String>, group: &String) -> Result<Vec<String>> {
//!         Ok(api.iter().filter(|vm| vm.starts_with(group.as_str())).cloned().collect())
//!     }
//!
//!     fn is_cacheable(&self) -> bool {
//!         true
//!     }
//! }
//! ```

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::Result;

/// Identifier of a task kind. Usually a fieldless enum.
pub trait TaskId: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> TaskId for T where T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// How a task is invoked by its owner, which decides how the strategy
/// shares the provider quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// Ad hoc calls driven by caller demand (e.g. create deployment).
    Random,
    /// Calls on a steady polling cadence (e.g. fetch instance list).
    Periodical,
}

/// One remote operation executed against the API handle `A`.
#[async_trait]
pub trait ThrottlerTask<A>: Send + Sync {
    type Parameter: Clone + Eq + Hash + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Perform the remote call.
    async fn create(&self, api: &A, parameter: &Self::Parameter) -> Result<Self::Output>;

    /// Equality used to combine queued requests into one batch.
    fn same_parameters(&self, left: &Self::Parameter, right: &Self::Parameter) -> bool {
        left == right
    }

    /// Whether identical requests may share one execution.
    fn combine_requests(&self) -> bool {
        true
    }

    /// Whether results may be served from the queue's cache.
    fn is_cacheable(&self) -> bool {
        false
    }
}

/// Shared, type-erased task with fixed parameter and output types.
pub type SharedTask<A, P, O> = Arc<dyn ThrottlerTask<A, Parameter = P, Output = O>>;

/// Typed handle binding a task identifier to its parameter and output
/// types, so `execute_task` is checked at compile time.
///
/// ```rust
/// # use vedrfolnir::TaskKey;
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum AzureTask { FetchInstances }
///
/// const FETCH_INSTANCES: TaskKey<AzureTask, String, Vec<String>> =
///     TaskKey::new(AzureTask::FetchInstances);
/// assert_eq!(FETCH_INSTANCES.id(), AzureTask::FetchInstances);
/// ```
pub struct TaskKey<I, P, O> {
    id: I,
    _types: PhantomData<fn() -> (P, O)>,
}

impl<I: Copy, P, O> TaskKey<I, P, O> {
    pub const fn new(id: I) -> Self {
        Self {
            id,
            _types: PhantomData,
        }
    }

    pub fn id(&self) -> I {
        self.id
    }
}

impl<I: Copy, P, O> Clone for TaskKey<I, P, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I: Copy, P, O> Copy for TaskKey<I, P, O> {}

impl<I: fmt::Debug, P, O> fmt::Debug for TaskKey<I, P, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskKey").field(&self.id).finish()
    }
}

type TaskFactory<A, P, O> = Box<dyn Fn() -> SharedTask<A, P, O> + Send + Sync>;

/// Binds a task key to a factory producing the task, plus its queue
/// configuration. Registered with
/// [`Throttler::register_descriptor`](crate::Throttler::register_descriptor).
pub struct TaskDescriptor<A, I, P, O> {
    pub(crate) key: TaskKey<I, P, O>,
    pub(crate) factory: TaskFactory<A, P, O>,
    pub(crate) execution_type: ExecutionType,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) retry_on_throttle: bool,
}

impl<A, I: Copy, P, O> TaskDescriptor<A, I, P, O> {
    /// Describe a task. The cache timeout defaults to the class timeout
    /// from the settings.
    pub fn new<F>(key: TaskKey<I, P, O>, execution_type: ExecutionType, factory: F) -> Self
    where
        F: Fn() -> SharedTask<A, P, O> + Send + Sync + 'static,
    {
        Self {
            key,
            factory: Box::new(factory),
            execution_type,
            default_timeout: None,
            retry_on_throttle: false,
        }
    }

    /// Override the default cache timeout.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Re-enqueue rate-limited requests instead of failing them.
    pub fn retry_on_throttle(mut self, enabled: bool) -> Self {
        self.retry_on_throttle = enabled;
        self
    }

    pub fn key(&self) -> TaskKey<I, P, O> {
        self.key
    }

    pub fn execution_type(&self) -> ExecutionType {
        self.execution_type
    }
}

/// Result delivered to a caller of `execute_task`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput<O> {
    pub value: O,
    /// Served from the queue's cache without a provider call.
    pub from_cache: bool,
}

impl<O> TaskOutput<O> {
    pub(crate) fn executed(value: O) -> Self {
        Self {
            value,
            from_cache: false,
        }
    }

    pub(crate) fn cached(value: O) -> Self {
        Self {
            value,
            from_cache: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Fetch,
    }

    struct Echo;

    #[async_trait]
    impl ThrottlerTask<()> for Echo {
        type Parameter = u32;
        type Output = u32;

        async fn create(&self, _api: &(), parameter: &u32) -> Result<u32> {
            Ok(*parameter)
        }
    }

    #[test]
    fn task_defaults() {
        let task = Echo;
        assert!(task.same_parameters(&1, &1));
        assert!(!task.same_parameters(&1, &2));
        assert!(task.combine_requests());
        assert!(!task.is_cacheable());
    }

    #[test]
    fn descriptor_builder() {
        const KEY: TaskKey<Kind, u32, u32> = TaskKey::new(Kind::Fetch);
        let descriptor = TaskDescriptor::new(KEY, ExecutionType::Periodical, || {
            Arc::new(Echo) as SharedTask<(), u32, u32>
        })
        .default_timeout(Duration::from_secs(30))
        .retry_on_throttle(true);

        assert_eq!(descriptor.key().id(), Kind::Fetch);
        assert_eq!(descriptor.execution_type(), ExecutionType::Periodical);
        assert_eq!(descriptor.default_timeout, Some(Duration::from_secs(30)));
        assert!(descriptor.retry_on_throttle);
    }

    #[test]
    fn execution_type_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: ExecutionType,
        }
        let parsed: Wrapper = toml::from_str("kind = \"periodical\"").unwrap();
        assert_eq!(parsed.kind, ExecutionType::Periodical);
    }
}
