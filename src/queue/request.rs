//! Pending invocations of one task kind.
//!
//! Items are extracted in batches: every queued item whose parameter equals
//! the lead item's (per the owning task's comparer) and that allows
//! combination rides on the same provider call. Extraction happens under a
//! single lock, so an item claimed by one batch can never be claimed by
//! another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::Result;
use crate::task::TaskOutput;

/// Parameter equality supplied by the owning task.
pub type ParameterComparer<P> = Arc<dyn Fn(&P, &P) -> bool + Send + Sync>;

/// Where the outcome of one queued item goes.
#[derive(Debug)]
pub enum ResultSink<O> {
    /// A caller awaiting the result.
    Caller(oneshot::Sender<Result<TaskOutput<O>>>),
    /// Background refresh nobody awaits; executed for its cache update.
    Background,
}

impl<O> ResultSink<O> {
    /// A caller that dropped its receiver no longer needs the result.
    pub fn is_closed(&self) -> bool {
        match self {
            ResultSink::Caller(tx) => tx.is_closed(),
            ResultSink::Background => false,
        }
    }

    pub fn deliver(self, outcome: Result<TaskOutput<O>>) {
        if let ResultSink::Caller(tx) = self {
            // receiver gone: caller stopped listening
            let _ = tx.send(outcome);
        }
    }
}

/// One pending invocation.
#[derive(Debug)]
pub struct QueueItem<P, O> {
    pub(crate) sequence: u64,
    pub parameter: P,
    pub time_to_execute: Instant,
    pub(crate) sink: ResultSink<O>,
    /// Bypass cache and timing; extracted before anything else.
    pub force: bool,
    pub can_combine: bool,
    /// 1 for the first execution, incremented per retry.
    pub attempt_no: u32,
    pub created_at: Instant,
}

/// Items sharing equal parameters, satisfied by one provider call.
#[derive(Debug)]
pub struct RequestBatch<P, O> {
    items: Vec<QueueItem<P, O>>,
}

impl<P, O> RequestBatch<P, O> {
    fn empty() -> Self {
        Self { items: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The parameter the batch executes with.
    pub fn parameter(&self) -> Option<&P> {
        self.items.first().map(|item| &item.parameter)
    }

    pub fn items(&self) -> &[QueueItem<P, O>] {
        &self.items
    }

    pub fn into_items(self) -> Vec<QueueItem<P, O>> {
        self.items
    }
}

impl<P, O: Clone> RequestBatch<P, O> {
    /// Deliver the same outcome to every subscriber of the batch.
    pub fn deliver(self, outcome: Result<TaskOutput<O>>) {
        for item in self.items {
            item.sink.deliver(outcome.clone());
        }
    }
}

/// Queue of pending invocations for one task kind.
pub struct RequestQueue<P, O> {
    items: Mutex<Vec<QueueItem<P, O>>>,
    sequence: AtomicU64,
    comparer: ParameterComparer<P>,
}

impl<P, O> RequestQueue<P, O> {
    pub fn new(comparer: ParameterComparer<P>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            comparer,
        }
    }

    /// Enqueue one invocation.
    #[allow(clippy::too_many_arguments)]
    pub fn add_request(
        &self,
        time_to_execute: Instant,
        parameter: P,
        sink: ResultSink<O>,
        force: bool,
        can_combine: bool,
        attempt_no: u32,
        created_at: Instant,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.lock().push(QueueItem {
            sequence,
            parameter,
            time_to_execute,
            sink,
            force,
            can_combine,
            attempt_no,
            created_at,
        });
    }

    /// Queue a background refresh unless one with an equal parameter is
    /// already waiting. Returns whether an item was added.
    pub fn add_background_once(&self, time_to_execute: Instant, parameter: P, created_at: Instant) -> bool {
        let mut items = self.lock();
        let pending = items.iter().any(|item| {
            matches!(item.sink, ResultSink::Background) && (self.comparer)(&parameter, &item.parameter)
        });
        if pending {
            return false;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        items.push(QueueItem {
            sequence,
            parameter,
            time_to_execute,
            sink: ResultSink::Background,
            force: false,
            can_combine: true,
            attempt_no: 1,
            created_at,
        });
        true
    }

    /// Next batch to execute: a forced item first, otherwise the earliest
    /// item due at `now`, together with every combinable item carrying an
    /// equal parameter. Empty when nothing qualifies.
    pub fn extract_next_batch(&self, now: Instant) -> RequestBatch<P, O> {
        self.extract(Some(now))
    }

    /// Next forced batch only; items waiting on their due time stay queued.
    pub fn extract_forced_batch(&self) -> RequestBatch<P, O> {
        self.extract(None)
    }

    fn extract(&self, due_by: Option<Instant>) -> RequestBatch<P, O> {
        let mut items = self.lock();
        items.retain(|item| !item.sink.is_closed());

        let forced = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.force)
            .min_by_key(|(_, item)| item.sequence)
            .map(|(index, _)| index);
        let lead = forced.or_else(|| {
            let now = due_by?;
            items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.time_to_execute <= now)
                .min_by_key(|(_, item)| (item.time_to_execute, item.sequence))
                .map(|(index, _)| index)
        });

        let Some(index) = lead else {
            return RequestBatch::empty();
        };
        let lead = items.remove(index);
        if !lead.can_combine {
            return RequestBatch { items: vec![lead] };
        }

        let mut batch = vec![lead];
        let combined = self.take_matching(&mut items, &batch[0].parameter);
        batch.extend(combined);
        RequestBatch { items: batch }
    }

    /// Every combinable item with a parameter equal to `parameter`. Used to
    /// pick up requests that arrived while a batch was in flight.
    pub fn extract_batch_for(&self, parameter: &P) -> RequestBatch<P, O> {
        let mut items = self.lock();
        items.retain(|item| !item.sink.is_closed());
        RequestBatch {
            items: self.take_matching(&mut items, parameter),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_matching(&self, items: &mut Vec<QueueItem<P, O>>, parameter: &P) -> Vec<QueueItem<P, O>> {
        let (mut matched, rest): (Vec<_>, Vec<_>) = std::mem::take(items)
            .into_iter()
            .partition(|item| item.can_combine && (self.comparer)(parameter, &item.parameter));
        *items = rest;
        matched.sort_by_key(|item| item.sequence);
        matched
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QueueItem<P, O>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
