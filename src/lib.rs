//! Vedrfolnir - adaptive request throttling for cloud control-plane APIs
//!
//! This crate multiplexes many logically distinct remote operations
//! ("tasks") over one rate-limited provider quota. It caches read results,
//! combines identical in-flight requests, suspends fresh calls when the
//! provider rejects one for rate limiting, retries with bounded attempts and
//! lifetime, and paces every call through a token bucket and a minimum
//! spacing between operations.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use vedrfolnir::{
//!     ApiCredentials, ExecutionType, HttpApi, HttpApiFactory, Result, SettingsHandle, SharedTask,
//!     TaskDescriptor, TaskKey, Throttler, ThrottlerSettings, ThrottlerTask,
//! };
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum AzureTask {
//!     FetchInstances,
//! }
//!
//! const FETCH_INSTANCES: TaskKey<AzureTask, String, serde_json::Value> =
//!     TaskKey::new(AzureTask::FetchInstances);
//!
//! struct FetchInstances;
//!
//! #[async_trait]
//! impl ThrottlerTask<HttpApi> for FetchInstances {
//!     type Parameter = String;
//!     type Output = serde_json::Value;
//!
//!     async fn create(&self, api: &HttpApi, group: &String) -> Result<serde_json::Value> {
//!         api.get_json(&format!("/resourceGroups/{group}/providers/Microsoft.Compute/virtualMachines"))
//!             .await
//!     }
//!
//!     fn is_cacheable(&self) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = SettingsHandle::new(ThrottlerSettings::default());
//!     let credentials = ApiCredentials::new("https://management.azure.com/subscriptions/0000", "token");
//!     let throttler: Arc<Throttler<HttpApi, AzureTask>> = Arc::new(
//!         Throttler::connect("subscription", &HttpApiFactory::default(), &credentials, settings).await?,
//!     );
//!     throttler.register_descriptor(&TaskDescriptor::new(
//!         FETCH_INSTANCES,
//!         ExecutionType::Periodical,
//!         || Arc::new(FetchInstances) as SharedTask<_, _, _>,
//!     ))?;
//!     throttler.start();
//!
//!     let instances = throttler
//!         .execute_task(FETCH_INSTANCES, "build-agents".to_string())
//!         .await?;
//!     println!("{}", instances.value);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod locks;
pub mod queue;
pub mod strategy;
pub mod task;
pub mod telemetry;
pub mod throttler;
pub mod time;

// Re-export main types at crate root
pub use error::{Result, ThrottlerError};
pub use throttler::Throttler;

pub use adapter::{
    AdapterResult, ApiCredentials, ApiHandleFactory, HttpApi, HttpApiFactory, QuotaWindow,
    RateLimitInterceptor, ThrottlerAdapter, WindowState,
};
pub use config::{SettingsHandle, ThrottlerSettings};
pub use locks::{NamedLockGuard, NamedLocks};
pub use queue::{CallStatistics, ThrottlingSource};
pub use strategy::{QueueControl, ThrottlerFlow, ThrottlerStrategy};
pub use task::{
    ExecutionType, SharedTask, TaskDescriptor, TaskId, TaskKey, TaskOutput, ThrottlerTask,
};
pub use time::TimeManager;
