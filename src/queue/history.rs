//! Time-windowed log of request and execution events for one task queue.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Records older than this are discarded on append.
pub const HISTORY_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Request,
    Execution { resource_units: Option<u64> },
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: Instant,
    kind: CallKind,
}

/// Aggregated history since a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStatistics {
    pub request_call_count: u64,
    pub execution_call_count: u64,
    /// Executions that carried a consumed-units estimate.
    pub measured_execution_count: u64,
    /// Summed quota units; `None` when no execution reported any, which is
    /// distinct from a measured cost of zero.
    pub resource_units: Option<u64>,
}

impl CallStatistics {
    /// Average quota units per measured execution.
    pub fn average_execution_cost(&self) -> Option<f64> {
        let units = self.resource_units?;
        if self.measured_execution_count == 0 {
            return None;
        }
        Some(units as f64 / self.measured_execution_count as f64)
    }
}

/// Bounded, time-windowed call log.
#[derive(Debug, Default)]
pub struct CallHistory {
    records: Mutex<VecDeque<CallRecord>>,
}

impl CallHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A caller asked for the task.
    pub fn add_request_call(&self) {
        self.push(CallKind::Request);
    }

    /// The task ran against the provider.
    pub fn add_execution_call(&self, resource_units: Option<u64>) {
        self.push(CallKind::Execution { resource_units });
    }

    pub fn get_statistics(&self, since: Instant) -> CallStatistics {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .filter(|record| record.at >= since)
            .fold(CallStatistics::default(), |mut stats, record| {
                match record.kind {
                    CallKind::Request => stats.request_call_count += 1,
                    CallKind::Execution { resource_units } => {
                        stats.execution_call_count += 1;
                        if let Some(units) = resource_units {
                            stats.measured_execution_count += 1;
                            stats.resource_units = Some(stats.resource_units.unwrap_or(0) + units);
                        }
                    }
                }
                stats
            })
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, kind: CallKind) {
        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        while records
            .front()
            .is_some_and(|record| now.duration_since(record.at) > HISTORY_WINDOW)
        {
            records.pop_front();
        }
        records.push_back(CallRecord { at: now, kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_requests_and_executions() {
        let history = CallHistory::new();
        let start = Instant::now();
        history.add_request_call();
        history.add_request_call();
        history.add_execution_call(Some(3));
        history.add_execution_call(Some(1));

        let stats = history.get_statistics(start);
        assert_eq!(stats.request_call_count, 2);
        assert_eq!(stats.execution_call_count, 2);
        assert_eq!(stats.resource_units, Some(4));
        assert_eq!(stats.average_execution_cost(), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_units_are_absent_not_zero() {
        let history = CallHistory::new();
        let start = Instant::now();
        history.add_execution_call(None);

        let stats = history.get_statistics(start);
        assert_eq!(stats.execution_call_count, 1);
        assert_eq!(stats.resource_units, None);
        assert_eq!(stats.average_execution_cost(), None);

        history.add_execution_call(Some(0));
        let stats = history.get_statistics(start);
        assert_eq!(stats.resource_units, Some(0));
        assert_eq!(stats.average_execution_cost(), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn statistics_respect_since() {
        let history = CallHistory::new();
        history.add_request_call();
        tokio::time::advance(Duration::from_secs(10)).await;
        let since = Instant::now();
        history.add_request_call();

        assert_eq!(history.get_statistics(since).request_call_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn old_records_are_pruned_on_append() {
        let history = CallHistory::new();
        history.add_request_call();
        history.add_execution_call(Some(1));
        tokio::time::advance(HISTORY_WINDOW + Duration::from_secs(1)).await;
        history.add_request_call();

        assert_eq!(history.len(), 1);
    }
}
