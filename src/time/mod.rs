//! Pacing of provider operations.
//!
//! [`TimeManager`] puts two independent mechanisms behind one facade:
//!
//! - [`TicketManager`]: every operation reserves a start slot at least
//!   `min_operation_spacing` after the previous reservation;
//! - [`DeferralSequence`]: a token bucket bounding burst rate regardless of
//!   per-task cache timeouts.
//!
//! The bucket is refilled by a background loop between [`TimeManager::start`]
//! and [`TimeManager::stop`]; [`TimeManager::refill`] performs one refill by
//! hand.

pub mod deferral;
pub mod ticket;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SettingsHandle;

pub use deferral::DeferralSequence;
pub use ticket::{Ticket, TicketManager};

#[derive(Debug)]
pub struct TimeManager {
    tickets: TicketManager,
    deferral: DeferralSequence,
    settings: SettingsHandle,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl TimeManager {
    pub fn new(settings: SettingsHandle) -> Self {
        Self {
            tickets: TicketManager::new(settings.clone()),
            deferral: DeferralSequence::new(settings.clone()),
            settings,
            refill_task: Mutex::new(None),
        }
    }

    pub fn take_ticket(&self) -> Ticket {
        self.tickets.take_ticket()
    }

    pub async fn get_deferral_sequence(&self, id: &str) {
        self.deferral.get_deferral_sequence(id).await
    }

    pub fn refill(&self) {
        self.deferral.refill();
    }

    pub fn available_tokens(&self) -> u32 {
        self.deferral.available()
    }

    /// Start the refill loop. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.refill_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let manager = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            loop {
                let Some(interval) = manager
                    .upgrade()
                    .map(|m| m.settings.read(|s| s.deferral_refill_interval_duration()))
                else {
                    break;
                };
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.refill();
            }
        }));
        debug!("deferral refill loop started");
    }

    pub fn stop(&self) {
        if let Some(task) = self
            .refill_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            debug!("deferral refill loop stopped");
        }
    }
}

impl Drop for TimeManager {
    fn drop(&mut self) {
        self.stop();
    }
}
