//! HTTP-level rate-limit interception.
//!
//! Every request made through an [`HttpApi`](super::HttpApi) passes through
//! [`RateLimitInterceptor`]: before sending, the strategy's throttling delay
//! is applied; after receiving, the remaining-reads header is forwarded to
//! the [`QuotaWindow`] and HTTP 429 responses are turned into
//! [`ThrottlerError::RateLimited`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::{debug, warn};

use super::quota::QuotaWindow;
use super::retry_after::{parse_retry_after_body, parse_retry_after_header};
use crate::config::SettingsHandle;
use crate::{Result, ThrottlerError};

/// Observes provider responses on behalf of the throttler.
#[derive(Debug, Clone)]
pub struct RateLimitInterceptor {
    quota: Arc<QuotaWindow>,
    settings: SettingsHandle,
}

impl RateLimitInterceptor {
    pub fn new(quota: Arc<QuotaWindow>, settings: SettingsHandle) -> Self {
        Self { quota, settings }
    }

    pub fn quota(&self) -> &Arc<QuotaWindow> {
        &self.quota
    }

    /// Apply the aggressive-throttling delay, if the strategy set one.
    pub async fn before_request(&self) {
        let delay = self.quota.throttling_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "delaying provider request");
            tokio::time::sleep(delay).await;
        }
    }

    /// Forward the remaining-reads header, if present.
    pub fn observe_headers(&self, headers: &HeaderMap) {
        let name = self.settings.read(|s| s.remaining_reads_header.clone());
        let remaining = headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        if let Some(remaining) = remaining {
            self.quota.notify_remaining_reads(remaining);
        }
    }

    /// Inspect a response. Rate-limit rejections become
    /// [`ThrottlerError::RateLimited`]; anything else is handed back.
    pub async fn after_response(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        self.observe_headers(response.headers());
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }

        let header_hint = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after_header);
        let retry_after = match header_hint {
            Some(hint) => Some(hint),
            None => retry_after_from_body(response).await,
        };
        warn!(
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "provider rate limit reached"
        );
        Err(ThrottlerError::RateLimited { retry_after })
    }
}

async fn retry_after_from_body(response: reqwest::Response) -> Option<Duration> {
    let body = response.text().await.ok()?;
    parse_retry_after_body(&body)
}
