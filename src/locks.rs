//! Named async mutexes.
//!
//! Delete and cancel operations against the same remote object (a resource
//! group, a deployment) must not race each other. [`NamedLocks`] hands out
//! one mutex per name; entries nobody holds are dropped on the next
//! acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

/// Guard of a named lock; the lock is released on drop.
#[derive(Debug)]
pub struct NamedLockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of per-name async mutexes.
#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock name for a deployment inside a resource group.
    pub fn deployment_key(resource_group: &str, deployment: &str) -> String {
        format!("{resource_group}/{deployment}")
    }

    /// Wait for and take the lock called `name`.
    pub async fn lock(&self, name: impl Into<String>) -> NamedLockGuard {
        let name = name.into();
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|key, mutex| key == &name || Arc::strong_count(mutex) > 1);
            locks.entry(name.clone()).or_default().clone()
        };
        trace!(lock = %name, "acquiring named lock");
        NamedLockGuard {
            name,
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of names currently tracked.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
