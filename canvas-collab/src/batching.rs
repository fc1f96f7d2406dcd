//! Outgoing update batching and throttling.
//!
//! Operations are queued per priority tier. The first operation in an idle
//! tier arms that tier's timer:
//!
//! | Tier   | Delay            |
//! |--------|------------------|
//! | high   | `high_delay`     |
//! | medium | `window`         |
//! | low    | `2 * window`     |
//!
//! When any timer fires, every tier is drained high first, then medium, then
//! low. Each tier's batch runs as one document transaction, split into
//! sub-batches of `chunk_size` with a scheduler yield between them.
//! Consecutive updates of the same record within a tier are merged into one
//! patch before they reach the document.
//!
//! The batcher holds only a weak reference to the document. A timer firing
//! after the document is gone discards the queue and does nothing else.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::document::{Document, Operation};
use crate::metrics::{as_millis_f64, ConnectionQuality, LatencyTracker};
use crate::model::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Delay before the high tier is processed.
    pub high_delay: Duration,
    /// Medium tier window; the low tier waits twice as long.
    pub window: Duration,
    /// Operations per transaction before yielding to the scheduler.
    pub chunk_size: usize,
    /// Recommended batch size under excellent conditions.
    pub baseline_batch_size: usize,
    /// Number of batch latencies in the rolling average.
    pub latency_samples: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            high_delay: Duration::from_millis(10),
            window: Duration::from_millis(50),
            chunk_size: 10,
            baseline_batch_size: 100,
            latency_samples: 50,
        }
    }
}

impl BatchConfig {
    pub fn delay_for(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High => self.high_delay,
            Priority::Medium => self.window,
            Priority::Low => self.window * 2,
        }
    }
}

/// Monitoring view of the batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Drained from the tiers but not yet applied.
    pub in_flight: usize,
    pub processed_batches: u64,
    pub processed_operations: u64,
    pub average_latency_ms: Option<f64>,
    pub quality: ConnectionQuality,
    pub recommended_batch_size: usize,
}

impl QueueStatus {
    pub fn pending(&self) -> usize {
        self.high + self.medium + self.low + self.in_flight
    }
}

#[derive(Default)]
struct Tier {
    ops: Vec<Operation>,
    /// Armed timer and its generation.
    timer: Option<(u64, JoinHandle<()>)>,
}

impl Tier {
    /// Append, merging into the latest queued operation on the same record
    /// when both are updates.
    fn push(&mut self, op: Operation) {
        let target = op.target();
        let op = match self.ops.iter_mut().rev().find(|queued| queued.target() == target) {
            Some(last) => match last.coalesce(op) {
                Ok(()) => return,
                Err(op) => op,
            },
            None => op,
        };
        self.ops.push(op);
    }
}

struct State {
    tiers: [Tier; 3],
    in_flight: VecDeque<(Priority, Operation)>,
    timers_armed: u64,
    latency: LatencyTracker,
    processed_batches: u64,
    processed_operations: u64,
}

struct Shared {
    document: Weak<Mutex<Document>>,
    config: BatchConfig,
    state: Mutex<State>,
    /// Held while popping and applying, so batches reach the document in
    /// queue order even when a timer and `flush()` race.
    apply: Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move every tier into the in-flight queue, high first, and cancel the
    /// tiers' timers: operations queued from now on arm fresh ones.
    fn stage_all(state: &mut State) {
        for priority in Priority::ALL {
            let tier = &mut state.tiers[priority.index()];
            if let Some((_, timer)) = tier.timer.take() {
                timer.abort();
            }
            let ops = std::mem::take(&mut tier.ops);
            state.in_flight.extend(ops.into_iter().map(|op| (priority, op)));
        }
    }

    /// Apply the next batch from the in-flight queue: operations of one tier,
    /// at most `limit` of them. Returns how many were applied.
    fn apply_next(&self, limit: usize) -> usize {
        let _apply = self.apply.lock().unwrap_or_else(|p| p.into_inner());

        let batch: Vec<Operation> = {
            let mut state = self.lock();
            let Some(priority) = state.in_flight.front().map(|(p, _)| *p) else {
                return 0;
            };
            let mut batch = Vec::new();
            while batch.len() < limit {
                match state.in_flight.front() {
                    Some((p, _)) if *p == priority => {
                        if let Some((_, op)) = state.in_flight.pop_front() {
                            batch.push(op);
                        }
                    }
                    _ => break,
                }
            }
            batch
        };

        let Some(document) = self.document.upgrade() else {
            log::debug!("Document dropped, discarding queued operations");
            let mut state = self.lock();
            state.in_flight.clear();
            for tier in state.tiers.iter_mut() {
                tier.ops.clear();
            }
            return 0;
        };

        let count = batch.len();
        // Processing time only; the batching window itself is not latency.
        let started = Instant::now();
        {
            let mut doc = document.lock().unwrap_or_else(|p| p.into_inner());
            doc.transact(|txn| {
                for op in batch {
                    if let Err(e) = op.apply(txn) {
                        log::warn!("Queued operation rejected: {e}");
                    }
                }
            });
        }
        let elapsed = started.elapsed();

        let mut state = self.lock();
        state.latency.record(elapsed);
        state.processed_batches += 1;
        state.processed_operations += count as u64;
        log::trace!("Applied batch of {count} operation(s)");
        count
    }
}

/// Timer body: stage everything, then apply sub-batches with yields.
async fn drain(shared: Arc<Shared>, fired: Priority, generation: u64) {
    {
        let mut state = shared.lock();
        let tier = &mut state.tiers[fired.index()];
        if tier.timer.as_ref().map(|(armed, _)| *armed) != Some(generation) {
            // Cancelled after waking; whoever cancelled us staged the queue.
            return;
        }
        // Our own handle: dropped, not aborted, before the rest are cancelled.
        tier.timer = None;
        Shared::stage_all(&mut state);
    }

    let chunk = shared.config.chunk_size.max(1);
    while shared.apply_next(chunk) > 0 {
        tokio::task::yield_now().await;
    }
}

/// Priority queue in front of a shared [`Document`].
pub struct UpdateBatcher {
    shared: Arc<Shared>,
}

impl UpdateBatcher {
    pub fn new(document: &Arc<Mutex<Document>>, config: BatchConfig) -> Self {
        let latency = LatencyTracker::new(config.latency_samples);
        Self {
            shared: Arc::new(Shared {
                document: Arc::downgrade(document),
                config,
                state: Mutex::new(State {
                    tiers: Default::default(),
                    in_flight: VecDeque::new(),
                    timers_armed: 0,
                    latency,
                    processed_batches: 0,
                    processed_operations: 0,
                }),
                apply: Mutex::new(()),
            }),
        }
    }

    /// Queue an operation.
    ///
    /// Malformed payloads are rejected here, before anything is queued.
    /// Outside a Tokio runtime no timer is armed and the operation waits for
    /// [`flush`](Self::flush).
    pub fn enqueue(&self, op: Operation, priority: Priority) -> Result<(), ValidationError> {
        op.validate()?;

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let tier = &mut state.tiers[priority.index()];
        tier.push(op);

        if tier.timer.is_none() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    state.timers_armed += 1;
                    let generation = state.timers_armed;
                    let shared = self.shared.clone();
                    let delay = self.shared.config.delay_for(priority);
                    let timer = handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        drain(shared, priority, generation).await;
                    });
                    tier.timer = Some((generation, timer));
                }
                Err(_) => log::debug!("No runtime, {priority:?} operation waits for flush"),
            }
        }
        Ok(())
    }

    /// Apply everything pending right now, one transaction per tier.
    /// Returns the number of operations applied.
    pub fn flush(&self) -> usize {
        Shared::stage_all(&mut self.shared.lock());
        let mut applied = 0;
        loop {
            let n = self.shared.apply_next(usize::MAX);
            if n == 0 {
                break;
            }
            applied += n;
        }
        applied
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.shared.lock();
        let baseline = self.shared.config.baseline_batch_size;
        QueueStatus {
            high: state.tiers[Priority::High.index()].ops.len(),
            medium: state.tiers[Priority::Medium.index()].ops.len(),
            low: state.tiers[Priority::Low.index()].ops.len(),
            in_flight: state.in_flight.len(),
            processed_batches: state.processed_batches,
            processed_operations: state.processed_operations,
            average_latency_ms: state.latency.average().map(as_millis_f64),
            quality: state.latency.quality(),
            recommended_batch_size: state.latency.recommended_batch_size(baseline),
        }
    }

    /// Largest batch producers should pre-coalesce to, given current latency.
    pub fn recommended_batch_size(&self) -> usize {
        self.shared
            .lock()
            .latency
            .recommended_batch_size(self.shared.config.baseline_batch_size)
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.shared.lock().latency.quality()
    }

    pub fn average_latency(&self) -> Option<Duration> {
        self.shared.lock().latency.average()
    }

    /// Cancel all pending timers. Queued operations stay queued.
    pub fn cancel_timers(&self) {
        let mut state = self.shared.lock();
        for tier in state.tiers.iter_mut() {
            if let Some((_, timer)) = tier.timer.take() {
                timer.abort();
            }
        }
    }
}

impl Drop for UpdateBatcher {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}
