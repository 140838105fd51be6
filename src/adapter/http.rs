//! Authenticated HTTP handle to the provider's control-plane API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::interceptor::RateLimitInterceptor;
use crate::locks::{NamedLockGuard, NamedLocks};
use crate::{Result, ThrottlerError};

/// Credentials for one authenticated session.
#[derive(Clone)]
pub struct ApiCredentials {
    pub base_url: String,
    pub bearer_token: String,
}

impl ApiCredentials {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
        }
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("base_url", &self.base_url)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

/// Turns credentials into an API handle whose traffic flows through the
/// given interceptor.
#[async_trait]
pub trait ApiHandleFactory<A>: Send + Sync {
    async fn create_handle(
        &self,
        credentials: &ApiCredentials,
        interceptor: Arc<RateLimitInterceptor>,
    ) -> Result<A>;
}

/// reqwest-backed provider handle.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
    interceptor: Arc<RateLimitInterceptor>,
    locks: Arc<NamedLocks>,
}

impl HttpApi {
    pub fn new(
        client: reqwest::Client,
        credentials: &ApiCredentials,
        interceptor: Arc<RateLimitInterceptor>,
    ) -> Self {
        Self {
            client,
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            bearer_token: credentials.bearer_token.clone(),
            interceptor,
            locks: Arc::new(NamedLocks::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start an authenticated request to `path` (relative to the base URL).
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.client
            .request(method, url)
            .bearer_auth(&self.bearer_token)
    }

    /// Send a request through the interceptor.
    ///
    /// Rate-limit responses come back as [`ThrottlerError::RateLimited`];
    /// other statuses are left to the caller.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.interceptor.before_request().await;
        let response = request.send().await?;
        debug!(status = response.status().as_u16(), url = %response.url(), "provider response");
        self.interceptor.after_response(response).await
    }

    /// GET `path` and decode a JSON body, mapping error statuses.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)).await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// DELETE `path`, mapping error statuses. A 404 counts as success.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self.send(self.request(Method::DELETE, path)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await.map(|_| ())
    }

    /// Serialize operations on one remote object (e.g. a resource group
    /// deployment) across every task sharing this handle.
    pub async fn lock_resource(&self, name: impl Into<String>) -> NamedLockGuard {
        self.locks.lock(name).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ThrottlerError::AuthenticationFailed),
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(ThrottlerError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Builds [`HttpApi`] handles.
#[derive(Debug, Clone)]
pub struct HttpApiFactory {
    timeout: Duration,
}

impl Default for HttpApiFactory {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

impl HttpApiFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-request timeout of created handles.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ApiHandleFactory<HttpApi> for HttpApiFactory {
    async fn create_handle(
        &self,
        credentials: &ApiCredentials,
        interceptor: Arc<RateLimitInterceptor>,
    ) -> Result<HttpApi> {
        if credentials.bearer_token.is_empty() {
            return Err(ThrottlerError::AuthenticationFailed);
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ThrottlerError::Configuration(format!("HTTP client: {e}")))?;
        Ok(HttpApi::new(client, credentials, interceptor))
    }
}
