//! Minimum spacing between provider operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SettingsHandle;

/// Upper bound of one sleep while waiting for a ticket.
const WAIT_STEP: Duration = Duration::from_millis(50);

/// A reserved start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub time: Instant,
}

impl Ticket {
    pub fn is_due(&self) -> bool {
        Instant::now() >= self.time
    }

    /// Sleep in short steps until the reserved time.
    pub async fn wait(&self) {
        loop {
            let now = Instant::now();
            if now >= self.time {
                return;
            }
            tokio::time::sleep((self.time - now).min(WAIT_STEP)).await;
        }
    }
}

/// Hands out tickets at least `min_operation_spacing` apart.
#[derive(Debug)]
pub struct TicketManager {
    origin: Instant,
    /// Next free slot, in milliseconds since `origin`.
    next_slot_ms: AtomicU64,
    settings: SettingsHandle,
}

impl TicketManager {
    pub fn new(settings: SettingsHandle) -> Self {
        Self {
            origin: Instant::now(),
            next_slot_ms: AtomicU64::new(0),
            settings,
        }
    }

    /// Reserve the earliest free slot and push the next one out by the
    /// configured spacing. Never blocks.
    pub fn take_ticket(&self) -> Ticket {
        let spacing = self.settings.read(|s| s.min_operation_spacing_ms);
        let now_ms = Instant::now().duration_since(self.origin).as_millis() as u64;
        let mut current = self.next_slot_ms.load(Ordering::Acquire);
        loop {
            let slot = current.max(now_ms);
            match self.next_slot_ms.compare_exchange_weak(
                current,
                slot + spacing,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ticket {
                        time: self.origin + Duration::from_millis(slot),
                    };
                }
                Err(actual) => current = actual,
            }
        }
    }
}
