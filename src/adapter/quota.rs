//! Provider quota window as observed through response headers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SettingsHandle;
use crate::telemetry;

/// Snapshot of the quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Last remaining-reads value reported by the provider.
    pub remaining_reads: Option<u64>,
    /// Highest remaining-reads value ever observed, taken as the quota
    /// ceiling of a full window.
    pub default_reads: Option<u64>,
    pub window_start: Instant,
}

/// Shared quota state, written by the interceptor and read by the adapter
/// and the strategy.
#[derive(Debug)]
pub struct QuotaWindow {
    state: Mutex<WindowState>,
    throttling_delay_ms: AtomicU64,
    settings: SettingsHandle,
}

impl QuotaWindow {
    pub fn new(settings: SettingsHandle) -> Self {
        Self {
            state: Mutex::new(WindowState {
                remaining_reads: None,
                default_reads: None,
                window_start: Instant::now(),
            }),
            throttling_delay_ms: AtomicU64::new(0),
            settings,
        }
    }

    /// Record a remaining-reads value reported by the provider.
    ///
    /// A value higher than the previous one means the provider opened a new
    /// window, so the window start moves to now. Returns `true` in that
    /// case.
    pub fn notify_remaining_reads(&self, value: u64) -> bool {
        let mut state = self.lock();
        let new_window = state.remaining_reads.is_some_and(|last| value > last);
        if new_window {
            info!(
                previous = state.remaining_reads,
                remaining = value,
                "provider quota window reset"
            );
            state.window_start = Instant::now();
        }
        state.remaining_reads = Some(value);
        state.default_reads = Some(state.default_reads.map_or(value, |max| max.max(value)));
        debug!(remaining = value, default = state.default_reads, "remaining reads");
        metrics::gauge!(telemetry::REMAINING_READS).set(value as f64);
        new_window
    }

    pub fn state(&self) -> WindowState {
        *self.lock()
    }

    pub fn remaining_reads(&self) -> Option<u64> {
        self.lock().remaining_reads
    }

    pub fn default_reads(&self) -> Option<u64> {
        self.lock().default_reads
    }

    pub fn window_start(&self) -> Instant {
        self.lock().window_start
    }

    /// Time left until the current quota window resets.
    pub fn window_width(&self) -> Duration {
        let window = self.settings.read(|s| s.quota_window_duration());
        if window.is_zero() {
            return Duration::ZERO;
        }
        let elapsed = Instant::now().saturating_duration_since(self.window_start());
        let into_window = Duration::from_nanos((elapsed.as_nanos() % window.as_nanos()) as u64);
        window - into_window
    }

    pub fn window_width_in_milliseconds(&self) -> u64 {
        self.window_width().as_millis() as u64
    }

    /// Delay inserted before every provider request.
    pub fn throttling_delay(&self) -> Duration {
        Duration::from_millis(self.throttling_delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_throttling_delay(&self, delay: Duration) {
        let previous = self
            .throttling_delay_ms
            .swap(delay.as_millis() as u64, Ordering::Relaxed);
        if previous != delay.as_millis() as u64 {
            debug!(delay_ms = delay.as_millis() as u64, "throttling delay changed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThrottlerSettings;

    fn window() -> QuotaWindow {
        QuotaWindow::new(SettingsHandle::new(ThrottlerSettings::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_remaining_and_ceiling() {
        let quota = window();
        assert_eq!(quota.remaining_reads(), None);

        assert!(!quota.notify_remaining_reads(1000));
        assert!(!quota.notify_remaining_reads(990));
        assert_eq!(quota.remaining_reads(), Some(990));
        assert_eq!(quota.default_reads(), Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn increase_starts_new_window() {
        let quota = window();
        quota.notify_remaining_reads(500);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(quota.window_width(), Duration::from_secs(3000));

        assert!(quota.notify_remaining_reads(12_000));
        assert_eq!(quota.window_start(), Instant::now());
        assert_eq!(quota.window_width(), Duration::from_secs(3600));
        assert_eq!(quota.default_reads(), Some(12_000));
    }

    #[tokio::test(start_paused = true)]
    async fn window_width_wraps_after_full_window() {
        let quota = window();
        tokio::time::advance(Duration::from_secs(3600 + 100)).await;
        assert_eq!(quota.window_width_in_milliseconds(), 3_500_000);
    }

    #[test]
    fn throttling_delay_round_trip() {
        let quota = window();
        assert_eq!(quota.throttling_delay(), Duration::ZERO);
        quota.set_throttling_delay(Duration::from_millis(250));
        assert_eq!(quota.throttling_delay(), Duration::from_millis(250));
    }
}
