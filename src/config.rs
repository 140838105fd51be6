//! Throttler tunables and their loading.
//!
//! Every tunable is late-bound: components hold a [`SettingsHandle`] and take
//! a fresh snapshot on each use, so a change made through
//! [`SettingsHandle::update`] applies from the next scheduler tick on.
//!
//! Settings can be loaded from TOML with the following resolution order:
//! 1. Explicit path (if provided)
//! 2. `~/.vedrfolnir/throttler.toml` (user)
//! 3. `/etc/vedrfolnir/throttler.toml` (system)
//!
//! ```toml
//! scheduler_period_ms = 300
//! max_retry_count = 12
//! aggressive_throttling_limit_percent = 90
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;

use crate::adapter::retry_after::MAX_RETRY_AFTER;
use crate::task::ExecutionType;
use crate::{Result, ThrottlerError};

/// Azure Resource Manager reports the per-subscription read budget here.
pub const DEFAULT_REMAINING_READS_HEADER: &str = "x-ms-ratelimit-remaining-subscription-reads";

/// Tunables for one throttler instance.
///
/// ```rust
/// # use vedrfolnir::ThrottlerSettings;
/// # use std::time::Duration;
/// let settings = ThrottlerSettings::new()
///     .scheduler_period(Duration::from_millis(500))
///     .max_retry_count(5);
/// assert_eq!(settings.scheduler_period_ms, 500);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThrottlerSettings {
    /// Default cache timeout for random (on-demand) tasks. Default: 10s.
    pub random_task_cache_timeout_secs: u64,
    /// Default cache timeout for periodical (polled) tasks. Default: 60s.
    pub periodical_task_cache_timeout_secs: u64,
    /// Share of the provider quota never spent by the strategy. Default: 10%.
    pub resource_reservation_percent: u32,
    /// Minimum share of the operable quota kept for random tasks. Default: 50%.
    pub random_task_reservation_percent: u32,
    /// Once this share of the quota is consumed, every request is delayed.
    /// Default: 90%.
    pub aggressive_throttling_limit_percent: u32,
    /// Scheduler tick period. Default: 300ms.
    pub scheduler_period_ms: u64,
    /// Attempts allowed for a rate-limited request when retry is enabled.
    /// Default: 12.
    pub max_retry_count: u32,
    /// Lifetime after which a retried request is failed. Default: 30 minutes.
    pub max_task_lifetime_secs: u64,
    /// Added to the provider retry-after when extending cache timeouts.
    /// Default: 5s.
    pub rate_limit_delta_secs: u64,
    /// Retry-after assumed when the provider gave no hint. Default: 60s.
    pub default_retry_after_secs: u64,
    /// Wall-clock eviction of cache entries. Default: 1 hour.
    pub cache_ttl_secs: u64,
    /// Maximum cache entries per task. Default: 10,000.
    pub cache_max_entries: u64,
    /// Token bucket capacity of the deferral sequence. Default: 20.
    pub deferral_bucket_size: u32,
    /// Tokens added per refill. Default: 2.
    pub deferral_refill_amount: u32,
    /// Refill period. Default: 1s.
    pub deferral_refill_interval_ms: u64,
    /// Poll period of a caller waiting for a token. Default: 1s.
    pub deferral_poll_interval_ms: u64,
    /// Minimum spacing between two provider operations. Default: 400ms.
    pub min_operation_spacing_ms: u64,
    /// Width of the provider quota window. Default: 1 hour.
    pub quota_window_secs: u64,
    /// Enqueue a background refresh whenever a request is served from cache
    /// in normal flow. Default: off.
    pub refresh_on_cache_hit: bool,
    /// Response header carrying the remaining read quota.
    pub remaining_reads_header: String,
}

impl Default for ThrottlerSettings {
    fn default() -> Self {
        Self {
            random_task_cache_timeout_secs: 10,
            periodical_task_cache_timeout_secs: 60,
            resource_reservation_percent: 10,
            random_task_reservation_percent: 50,
            aggressive_throttling_limit_percent: 90,
            scheduler_period_ms: 300,
            max_retry_count: 12,
            max_task_lifetime_secs: 30 * 60,
            rate_limit_delta_secs: 5,
            default_retry_after_secs: 60,
            cache_ttl_secs: 3600,
            cache_max_entries: 10_000,
            deferral_bucket_size: 20,
            deferral_refill_amount: 2,
            deferral_refill_interval_ms: 1000,
            deferral_poll_interval_ms: 1000,
            min_operation_spacing_ms: 400,
            quota_window_secs: 3600,
            refresh_on_cache_hit: false,
            remaining_reads_header: DEFAULT_REMAINING_READS_HEADER.to_string(),
        }
    }
}

impl ThrottlerSettings {
    /// Create settings with the defaults listed on each field.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default cache timeout for a task class.
    pub fn default_cache_timeout(&self, execution_type: ExecutionType) -> Duration {
        match execution_type {
            ExecutionType::Random => Duration::from_secs(self.random_task_cache_timeout_secs),
            ExecutionType::Periodical => {
                Duration::from_secs(self.periodical_task_cache_timeout_secs)
            }
        }
    }

    pub fn scheduler_period_duration(&self) -> Duration {
        Duration::from_millis(self.scheduler_period_ms)
    }

    pub fn max_task_lifetime_duration(&self) -> Duration {
        Duration::from_secs(self.max_task_lifetime_secs)
    }

    pub fn rate_limit_delta_duration(&self) -> Duration {
        Duration::from_secs(self.rate_limit_delta_secs)
    }

    pub fn default_retry_after_duration(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }

    pub fn cache_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn deferral_refill_interval_duration(&self) -> Duration {
        Duration::from_millis(self.deferral_refill_interval_ms)
    }

    pub fn deferral_poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.deferral_poll_interval_ms)
    }

    pub fn min_operation_spacing_duration(&self) -> Duration {
        Duration::from_millis(self.min_operation_spacing_ms)
    }

    pub fn quota_window_duration(&self) -> Duration {
        Duration::from_secs(self.quota_window_secs)
    }

    /// Bound a retry-after hint by the quota window: a provider never
    /// blocks longer than one window.
    pub fn clamp_retry_after(&self, hint: Duration) -> Duration {
        hint.min(self.quota_window_duration()).min(MAX_RETRY_AFTER)
    }

    /// Set the default cache timeout of a task class.
    pub fn cache_timeout(mut self, execution_type: ExecutionType, timeout: Duration) -> Self {
        match execution_type {
            ExecutionType::Random => self.random_task_cache_timeout_secs = timeout.as_secs(),
            ExecutionType::Periodical => {
                self.periodical_task_cache_timeout_secs = timeout.as_secs()
            }
        }
        self
    }

    /// Set the share of quota withheld from every calculation.
    pub fn resource_reservation_percent(mut self, percent: u32) -> Self {
        self.resource_reservation_percent = percent.min(100);
        self
    }

    /// Set the minimum share of operable quota guaranteed to random tasks.
    pub fn random_task_reservation_percent(mut self, percent: u32) -> Self {
        self.random_task_reservation_percent = percent.min(100);
        self
    }

    /// Set the consumed-quota share that turns on per-request delays.
    pub fn aggressive_throttling_limit_percent(mut self, percent: u32) -> Self {
        self.aggressive_throttling_limit_percent = percent.min(100);
        self
    }

    /// Set the scheduler tick period.
    pub fn scheduler_period(mut self, period: Duration) -> Self {
        self.scheduler_period_ms = period.as_millis() as u64;
        self
    }

    /// Set the maximum number of attempts of a rate-limited request.
    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    /// Set the maximum lifetime of a retried request.
    pub fn max_task_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_task_lifetime_secs = lifetime.as_secs();
        self
    }

    /// Set the margin added to provider retry-after hints.
    pub fn rate_limit_delta(mut self, delta: Duration) -> Self {
        self.rate_limit_delta_secs = delta.as_secs();
        self
    }

    /// Set the retry-after assumed when the provider gave none.
    pub fn default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after_secs = retry_after.as_secs();
        self
    }

    /// Set the wall-clock time-to-live of cache entries.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the per-task cache capacity.
    pub fn cache_max_entries(mut self, n: u64) -> Self {
        self.cache_max_entries = n;
        self
    }

    /// Configure the deferral token bucket.
    pub fn deferral_bucket(mut self, size: u32, refill_amount: u32, interval: Duration) -> Self {
        self.deferral_bucket_size = size;
        self.deferral_refill_amount = refill_amount;
        self.deferral_refill_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set how often a waiting caller re-checks the deferral bucket.
    pub fn deferral_poll_interval(mut self, interval: Duration) -> Self {
        self.deferral_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the minimum spacing between provider operations.
    pub fn min_operation_spacing(mut self, spacing: Duration) -> Self {
        self.min_operation_spacing_ms = spacing.as_millis() as u64;
        self
    }

    /// Set the provider quota window width.
    pub fn quota_window(mut self, window: Duration) -> Self {
        self.quota_window_secs = window.as_secs();
        self
    }

    /// Enable or disable background refresh on cache hits.
    pub fn refresh_on_cache_hit(mut self, enabled: bool) -> Self {
        self.refresh_on_cache_hit = enabled;
        self
    }

    /// Set the header carrying the remaining read quota.
    pub fn remaining_reads_header(mut self, header: impl Into<String>) -> Self {
        self.remaining_reads_header = header.into();
        self
    }

    /// Load settings from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.vedrfolnir/throttler.toml`
    /// 3. `/etc/vedrfolnir/throttler.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            ThrottlerError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ThrottlerError::Configuration(msg) => {
                ThrottlerError::Configuration(format!("{msg} (in {path:?})"))
            }
            other => other,
        })
    }

    /// Parse settings from TOML text. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content).map_err(|e| {
            ThrottlerError::Configuration(format!("Failed to parse throttler settings: {e}"))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the scheduler and quota bookkeeping cannot run with.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("scheduler_period_ms", self.scheduler_period_ms),
            ("deferral_refill_interval_ms", self.deferral_refill_interval_ms),
            ("deferral_poll_interval_ms", self.deferral_poll_interval_ms),
            ("quota_window_secs", self.quota_window_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(ThrottlerError::Configuration(format!(
                "{name} must be greater than zero"
            )));
        }

        let percents = [
            ("resource_reservation_percent", self.resource_reservation_percent),
            ("random_task_reservation_percent", self.random_task_reservation_percent),
            ("aggressive_throttling_limit_percent", self.aggressive_throttling_limit_percent),
        ];
        if let Some((name, value)) = percents.iter().find(|(_, value)| *value > 100) {
            return Err(ThrottlerError::Configuration(format!(
                "{name} must be at most 100, got {value}"
            )));
        }
        Ok(())
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(ThrottlerError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".vedrfolnir").join("throttler.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/vedrfolnir/throttler.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(ThrottlerError::Configuration(
            "No config file found. Create ~/.vedrfolnir/throttler.toml or /etc/vedrfolnir/throttler.toml"
                .to_string(),
        ))
    }
}

/// Shared, runtime-mutable view of [`ThrottlerSettings`].
///
/// Cloning the handle shares the underlying settings.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<ThrottlerSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: ThrottlerSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> ThrottlerSettings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read one value without cloning the whole struct.
    pub fn read<T>(&self, f: impl FnOnce(&ThrottlerSettings) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Mutate the settings in place.
    pub fn update(&self, f: impl FnOnce(&mut ThrottlerSettings)) {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// Replace the settings wholesale.
    pub fn replace(&self, settings: ThrottlerSettings) {
        self.update(|current| *current = settings);
    }
}

impl From<ThrottlerSettings> for SettingsHandle {
    fn from(settings: ThrottlerSettings) -> Self {
        Self::new(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = ThrottlerSettings::default();
        assert_eq!(settings.scheduler_period_duration(), Duration::from_millis(300));
        assert_eq!(settings.max_retry_count, 12);
        assert_eq!(settings.rate_limit_delta_duration(), Duration::from_secs(5));
        assert!(!settings.refresh_on_cache_hit);
        assert_eq!(
            settings.remaining_reads_header,
            DEFAULT_REMAINING_READS_HEADER
        );
    }

    #[test]
    fn class_timeouts() {
        let settings = ThrottlerSettings::new()
            .cache_timeout(ExecutionType::Random, Duration::from_secs(3))
            .cache_timeout(ExecutionType::Periodical, Duration::from_secs(90));
        assert_eq!(
            settings.default_cache_timeout(ExecutionType::Random),
            Duration::from_secs(3)
        );
        assert_eq!(
            settings.default_cache_timeout(ExecutionType::Periodical),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn percentages_are_clamped() {
        let settings = ThrottlerSettings::new()
            .resource_reservation_percent(150)
            .aggressive_throttling_limit_percent(101);
        assert_eq!(settings.resource_reservation_percent, 100);
        assert_eq!(settings.aggressive_throttling_limit_percent, 100);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings = ThrottlerSettings::from_toml(
            r#"
            scheduler_period_ms = 1000
            refresh_on_cache_hit = true
            "#,
        )
        .unwrap();
        assert_eq!(settings.scheduler_period_ms, 1000);
        assert!(settings.refresh_on_cache_hit);
        assert_eq!(settings.max_retry_count, 12);
    }

    #[test]
    fn invalid_toml_is_configuration_error() {
        let err = ThrottlerSettings::from_toml("scheduler_period_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ThrottlerError::Configuration(_)));
    }

    #[test]
    fn builders_and_getters_agree() {
        let settings = ThrottlerSettings::new()
            .scheduler_period(Duration::from_millis(500))
            .max_task_lifetime(Duration::from_secs(90))
            .min_operation_spacing(Duration::from_millis(250))
            .quota_window(Duration::from_secs(300))
            .deferral_bucket(5, 1, Duration::from_millis(200));
        assert_eq!(settings.scheduler_period_duration(), Duration::from_millis(500));
        assert_eq!(settings.max_task_lifetime_duration(), Duration::from_secs(90));
        assert_eq!(settings.min_operation_spacing_duration(), Duration::from_millis(250));
        assert_eq!(settings.quota_window_duration(), Duration::from_secs(300));
        assert_eq!(settings.deferral_refill_interval_duration(), Duration::from_millis(200));
    }

    #[test]
    fn retry_after_is_clamped_to_window() {
        let settings = ThrottlerSettings::new().quota_window(Duration::from_secs(300));
        assert_eq!(settings.clamp_retry_after(Duration::from_secs(30)), Duration::from_secs(30));
        assert_eq!(settings.clamp_retry_after(Duration::MAX), Duration::from_secs(300));
    }

    #[test]
    fn zero_periods_are_rejected() {
        for key in [
            "scheduler_period_ms",
            "deferral_refill_interval_ms",
            "deferral_poll_interval_ms",
            "quota_window_secs",
        ] {
            let err = ThrottlerSettings::from_toml(&format!("{key} = 0")).unwrap_err();
            match err {
                ThrottlerError::Configuration(msg) => assert!(msg.contains(key), "{msg}"),
                other => panic!("expected Configuration error, got {other:?}"),
            }
        }
    }

    #[test]
    fn oversized_percentages_are_rejected() {
        let err = ThrottlerSettings::from_toml("random_task_reservation_percent = 150").unwrap_err();
        assert!(matches!(err, ThrottlerError::Configuration(msg) if msg.contains("150")));
        assert!(ThrottlerSettings::default().validate().is_ok());
    }

    #[test]
    fn handle_updates_are_visible_to_clones() {
        let handle = SettingsHandle::new(ThrottlerSettings::default());
        let clone = handle.clone();
        handle.update(|s| s.max_retry_count = 3);
        assert_eq!(clone.read(|s| s.max_retry_count), 3);
        assert_eq!(clone.get().max_retry_count, 3);
    }
}
