//! Throttler adapter: the single gateway from task queues to the provider.
//!
//! [`ThrottlerAdapter`] owns the authenticated API handle and the shared
//! [`QuotaWindow`]. Each execution first passes the pacing gates of the
//! [`TimeManager`](crate::time::TimeManager) (burst token bucket, minimum
//! spacing ticket), then runs the query and estimates the quota it consumed.
//!
//! # Consumed-quota estimate
//!
//! The provider does not report a per-call cost. The adapter diffs the
//! remaining-reads value before and after the call, which is only a best
//! effort: calls overlapping on other queues move the same counter.

pub mod http;
pub mod interceptor;
pub mod quota;
pub mod retry_after;

use std::future::Future;
use std::sync::Arc;

use tracing::trace;

use crate::Result;
use crate::config::SettingsHandle;
use crate::time::TimeManager;

pub use http::{ApiCredentials, ApiHandleFactory, HttpApi, HttpApiFactory};
pub use interceptor::RateLimitInterceptor;
pub use quota::{QuotaWindow, WindowState};

/// Outcome of one adapter execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResult<T> {
    pub value: T,
    /// Quota units the call is estimated to have consumed.
    pub consumed_reads: Option<u64>,
    /// Always `false` for adapter executions.
    pub from_cache: bool,
}

/// Wraps an API handle and the provider quota state.
pub struct ThrottlerAdapter<A> {
    api: A,
    quota: Arc<QuotaWindow>,
    time_manager: Arc<TimeManager>,
    settings: SettingsHandle,
}

impl<A> ThrottlerAdapter<A> {
    /// Wrap `api`, sharing `quota` with the interceptor that feeds it.
    pub fn new(api: A, quota: Arc<QuotaWindow>, settings: SettingsHandle) -> Self {
        let time_manager = Arc::new(TimeManager::new(settings.clone()));
        Self {
            api,
            quota,
            time_manager,
            settings,
        }
    }

    /// Wrap a handle that reports no quota headers (tests, local fakes).
    pub fn standalone(api: A, settings: SettingsHandle) -> Self {
        let quota = Arc::new(QuotaWindow::new(settings.clone()));
        Self::new(api, quota, settings)
    }

    /// Build the interceptor and handle from credentials, then wrap them.
    pub async fn connect<F>(
        factory: &F,
        credentials: &http::ApiCredentials,
        settings: SettingsHandle,
    ) -> Result<Self>
    where
        F: ApiHandleFactory<A>,
    {
        let quota = Arc::new(QuotaWindow::new(settings.clone()));
        let interceptor = Arc::new(RateLimitInterceptor::new(quota.clone(), settings.clone()));
        let api = factory.create_handle(credentials, interceptor).await?;
        Ok(Self::new(api, quota, settings))
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn quota(&self) -> &Arc<QuotaWindow> {
        &self.quota
    }

    pub fn time_manager(&self) -> &Arc<TimeManager> {
        &self.time_manager
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn remaining_reads(&self) -> Option<u64> {
        self.quota.remaining_reads()
    }

    pub fn default_reads(&self) -> Option<u64> {
        self.quota.default_reads()
    }

    pub fn get_window_width_in_milliseconds(&self) -> u64 {
        self.quota.window_width_in_milliseconds()
    }

    pub fn notify_remaining_reads(&self, value: u64) -> bool {
        self.quota.notify_remaining_reads(value)
    }

    /// Run `query` against the API handle once the pacing gates open.
    pub async fn execute<'a, F, Fut, T>(&'a self, operation: &str, query: F) -> Result<AdapterResult<T>>
    where
        F: FnOnce(&'a A) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        self.time_manager.get_deferral_sequence(operation).await;
        self.time_manager.take_ticket().wait().await;

        let before = self.quota.remaining_reads();
        let value = query(&self.api).await?;
        let after = self.quota.remaining_reads();

        let consumed_reads = match (before, after) {
            (Some(before), Some(after)) if before >= after => Some(before - after),
            _ => None,
        };
        trace!(operation, ?consumed_reads, "provider query completed");
        Ok(AdapterResult {
            value,
            consumed_reads,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{ThrottlerError, ThrottlerSettings};

    /// Fake handle that reports a falling quota on every call.
    struct CountingApi {
        remaining: AtomicU64,
        quota: Arc<QuotaWindow>,
    }

    impl CountingApi {
        async fn read(&self, cost: u64) -> Result<&'static str> {
            let left = self.remaining.fetch_sub(cost, Ordering::SeqCst) - cost;
            self.quota.notify_remaining_reads(left);
            Ok("done")
        }
    }

    fn settings() -> SettingsHandle {
        SettingsHandle::new(ThrottlerSettings::new().min_operation_spacing(std::time::Duration::ZERO))
    }

    #[tokio::test(start_paused = true)]
    async fn consumed_reads_from_header_diff() {
        let settings = settings();
        let quota = Arc::new(QuotaWindow::new(settings.clone()));
        quota.notify_remaining_reads(1000);
        let api = CountingApi {
            remaining: AtomicU64::new(1000),
            quota: quota.clone(),
        };
        let adapter = ThrottlerAdapter::new(api, quota, settings);

        let result = adapter.execute("read", |api| api.read(3)).await.unwrap();
        assert_eq!(result.value, "done");
        assert_eq!(result.consumed_reads, Some(3));
        assert!(!result.from_cache);
        assert_eq!(adapter.remaining_reads(), Some(997));
    }

    #[tokio::test(start_paused = true)]
    async fn no_headers_means_no_estimate() {
        let adapter = ThrottlerAdapter::standalone((), settings());
        let result = adapter
            .execute("noop", |_| async { Ok::<_, ThrottlerError>(5) })
            .await
            .unwrap();
        assert_eq!(result.value, 5);
        assert_eq!(result.consumed_reads, None);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_propagate() {
        let adapter = ThrottlerAdapter::standalone((), settings());
        let err = adapter
            .execute("fail", |_| async {
                Err::<(), _>(ThrottlerError::RateLimited {
                    retry_after: None,
                })
            })
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[tokio::test(start_paused = true)]
    async fn executions_respect_minimum_spacing() {
        let settings =
            SettingsHandle::new(ThrottlerSettings::new().min_operation_spacing(std::time::Duration::from_millis(400)));
        let adapter = ThrottlerAdapter::standalone((), settings);
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            adapter
                .execute("noop", |_| async { Ok::<_, ThrottlerError>(()) })
                .await
                .unwrap();
        }
        assert!(start.elapsed() >= std::time::Duration::from_millis(800));
    }
}
