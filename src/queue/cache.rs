//! Result cache and cache-timeout bookkeeping for one task queue.
//!
//! Two clocks apply to a cached value:
//!
//! - the queue's *default* timeout decides when an entry is stale enough to
//!   re-fetch;
//! - the *cache timeout* is the minimum age before a stale entry may be
//!   re-fetched. The strategy raises it under quota pressure and the
//!   adapter raises it on rate-limit rejections; it never goes down through
//!   [`CacheTimeout::set`].
//!
//! Entries are additionally evicted by a fixed wall-clock TTL (moka),
//! independent of both timeouts.

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use moka::sync::Cache;
use tokio::time::Instant;

/// Who raised a cache timeout. `Adapter` outranks `Throttler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottlingSource {
    /// Periodic strategy rebalancing.
    Throttler,
    /// Provider rate-limit rejection.
    Adapter,
}

#[derive(Debug, Clone, Copy)]
struct TimeoutState {
    value: Duration,
    source: Option<ThrottlingSource>,
}

/// Monotonic cache timeout with a resettable default.
#[derive(Debug)]
pub struct CacheTimeout {
    default: Duration,
    state: Mutex<TimeoutState>,
}

impl CacheTimeout {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            state: Mutex::new(TimeoutState {
                value: default,
                source: None,
            }),
        }
    }

    pub fn default_value(&self) -> Duration {
        self.default
    }

    pub fn get(&self) -> Duration {
        self.lock().value
    }

    /// Source of the last accepted raise, `None` while at the default.
    pub fn source(&self) -> Option<ThrottlingSource> {
        self.lock().source
    }

    /// Raise the timeout. Returns `false` (and changes nothing) unless
    /// `timeout` is larger than the current value.
    pub fn set(&self, timeout: Duration, source: ThrottlingSource) -> bool {
        let mut state = self.lock();
        if timeout <= state.value {
            return false;
        }
        state.value = timeout;
        state.source = Some(source);
        true
    }

    /// Return to the default if the current value was raised by `source`
    /// or by a lower-ranked source. An adapter reset clears everything; a
    /// throttler reset leaves adapter-forced values alone.
    pub fn reset(&self, source: ThrottlingSource) -> bool {
        let mut state = self.lock();
        let clear = match (source, state.source) {
            (_, None) => false,
            (ThrottlingSource::Adapter, Some(_)) => true,
            (ThrottlingSource::Throttler, Some(current)) => current == ThrottlingSource::Throttler,
        };
        if clear {
            *state = TimeoutState {
                value: self.default,
                source: None,
            };
        }
        clear
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimeoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cached value and the time it was fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry<O> {
    pub value: O,
    pub updated_at: Instant,
}

impl<O> CacheEntry<O> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.updated_at)
    }
}

/// Per-parameter result cache of a cacheable task.
pub struct TaskCache<P, O> {
    entries: Cache<P, CacheEntry<O>>,
}

impl<P, O> TaskCache<P, O>
where
    P: Clone + Eq + Hash + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { entries }
    }

    pub fn get_from_cache(&self, parameter: &P) -> Option<CacheEntry<O>> {
        self.entries.get(parameter)
    }

    pub fn set_to_cache(&self, parameter: P, value: O) {
        self.entries.insert(
            parameter,
            CacheEntry {
                value,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_cache(&self) {
        self.entries.invalidate_all();
    }
}
