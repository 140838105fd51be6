//! Token-bucket deferral sequence.
//!
//! A bucket of `deferral_bucket_size` tokens, topped up by
//! `deferral_refill_amount` every `deferral_refill_interval_ms`. A caller
//! that finds the bucket empty re-checks every `deferral_poll_interval_ms`
//! until a token is available.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::config::SettingsHandle;

#[derive(Debug)]
pub struct DeferralSequence {
    tokens: AtomicU32,
    settings: SettingsHandle,
}

impl DeferralSequence {
    /// Create a full bucket.
    pub fn new(settings: SettingsHandle) -> Self {
        let size = settings.read(|s| s.deferral_bucket_size);
        Self {
            tokens: AtomicU32::new(size),
            settings,
        }
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> u32 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Take one token if there is one.
    pub fn try_acquire(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                tokens.checked_sub(1)
            })
            .is_ok()
    }

    /// Add one refill's worth of tokens, capped at the bucket size.
    pub fn refill(&self) {
        let (size, amount) = self
            .settings
            .read(|s| (s.deferral_bucket_size, s.deferral_refill_amount));
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some(tokens.saturating_add(amount).min(size))
            });
    }

    /// Complete once a token has been taken for `id`.
    pub async fn get_deferral_sequence(&self, id: &str) {
        if self.try_acquire() {
            return;
        }
        trace!(id, "deferral bucket empty, waiting for a token");
        loop {
            let poll = self.settings.read(|s| s.deferral_poll_interval_duration());
            tokio::time::sleep(poll).await;
            if self.try_acquire() {
                trace!(id, "deferral token acquired");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ThrottlerSettings;

    fn bucket(size: u32, amount: u32) -> DeferralSequence {
        DeferralSequence::new(SettingsHandle::new(ThrottlerSettings::new().deferral_bucket(
            size,
            amount,
            Duration::from_secs(10),
        )))
    }

    #[test]
    fn starts_full_and_drains() {
        let bucket = bucket(2, 1);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.available(), 0);
    }

    #[test]
    fn refill_is_capped() {
        let bucket = bucket(3, 2);
        bucket.try_acquire();
        bucket.refill();
        assert_eq!(bucket.available(), 3);
    }

    #[test]
    fn refill_follows_runtime_settings() {
        let settings = SettingsHandle::new(ThrottlerSettings::new().deferral_bucket(
            1,
            1,
            Duration::from_secs(10),
        ));
        let bucket = DeferralSequence::new(settings.clone());
        bucket.try_acquire();
        settings.update(|s| {
            s.deferral_bucket_size = 5;
            s.deferral_refill_amount = 4;
        });
        bucket.refill();
        assert_eq!(bucket.available(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_completes_after_refill() {
        let bucket = std::sync::Arc::new(bucket(1, 1));
        bucket.get_deferral_sequence("first").await;

        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.get_deferral_sequence("second").await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!waiter.is_finished());

        bucket.refill();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(waiter.is_finished());
        assert_eq!(bucket.available(), 0);
    }
}
