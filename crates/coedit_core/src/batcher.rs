//! Outbound update batching.
//!
//! Local deltas are accumulated into an [`UpdateBatch`] and flushed to a
//! [`BatchSink`] when one of three triggers fires:
//!
//! - **size**: the batch reaches `max_batch_size` (flushed inside `push`),
//! - **debounce**: no new delta for `debounce_ms` (reset on every delta),
//! - **max wait**: `max_wait_ms` after the batch was opened (never reset).
//!
//! A flush merges the batch's deltas into one update. Failed sends are retried
//! with their own backoff, `min(1000 × 2^(n-1), 10000)` ms, up to
//! `max_send_retries` times; after that the batch is dropped. The content is
//! never lost locally, since the deltas were already applied to the replica
//! they came from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::config::BatchConfig;
use crate::crdt::merge_updates;
use crate::error::Result;
use crate::remote::BoxFuture;
use crate::scheduler::ScheduledTask;
use crate::stats::SyncStats;

/// What triggered a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The batch reached `max_batch_size`
    MaxSize,
    /// The debounce period elapsed without new deltas
    Debounce,
    /// The batch stayed open for `max_wait_ms`
    MaxWait,
    /// [`UpdateBatcher::flush_now`]
    Manual,
    /// [`UpdateBatcher::shutdown`] with `flush = true`
    Shutdown,
    /// Resend after a failed attempt
    Retry,
}

/// Deltas collected between two flush points.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    /// Batcher-local identifier
    pub id: u64,
    /// Raw deltas, in edit order
    pub updates: Vec<Vec<u8>>,
    /// Failed send attempts so far
    pub retry_count: u32,
    /// When the first delta arrived
    pub created_at: DateTime<Utc>,
}

/// A flushed batch, as handed to the sink.
#[derive(Debug, Clone)]
pub struct FlushedBatch {
    /// All deltas merged into one update. `None` if merging failed, in which
    /// case the sink sends `updates` individually.
    pub merged: Option<Vec<u8>>,
    /// The raw deltas
    pub updates: Vec<Vec<u8>>,
    /// When the batch was opened
    pub created_at: DateTime<Utc>,
    /// What triggered this send
    pub reason: FlushReason,
    /// 1 for the first send, incremented on every retry
    pub attempt: u32,
}

/// Destination of flushed batches.
pub trait BatchSink: Send + Sync {
    /// Deliver a batch. An error schedules a retry.
    fn send_batch(&self, batch: FlushedBatch) -> BoxFuture<'static, Result<()>>;
}

/// Delay before resend number `retry` (1-based).
pub fn send_retry_delay(retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    Duration::from_millis((1000u64 << exponent).min(10_000))
}

/// Debounced, size- and time-bounded batcher. Clones share the same batch.
#[derive(Clone)]
pub struct UpdateBatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: BatchConfig,
    sink: Arc<dyn BatchSink>,
    stats: Arc<SyncStats>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    current: Option<UpdateBatch>,
    debounce: Option<ScheduledTask>,
    max_wait: Option<ScheduledTask>,
    /// Send tasks and retry timers, by batch id
    in_flight: HashMap<u64, ScheduledTask>,
    next_batch_id: u64,
    flush_count: u64,
    last_error: Option<String>,
    shut_down: bool,
}

/// A batch on its way to the sink.
struct Outbound {
    batch: UpdateBatch,
    merged: Option<Vec<u8>>,
}

impl UpdateBatcher {
    /// Create a batcher delivering to `sink`.
    pub fn new(config: BatchConfig, sink: Arc<dyn BatchSink>, stats: Arc<SyncStats>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                stats,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Add a local delta.
    ///
    /// Must be called from within a tokio runtime, since it (re)arms timers.
    pub fn push(&self, update: Vec<u8>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shut_down {
            log::warn!("[UpdateBatcher] Dropping update pushed after shutdown");
            return;
        }
        self.inner.stats.record_update();

        if state.current.is_none() {
            state.next_batch_id += 1;
            state.current = Some(UpdateBatch {
                id: state.next_batch_id,
                updates: Vec::new(),
                retry_count: 0,
                created_at: Utc::now(),
            });
            let weak = Arc::downgrade(&self.inner);
            state.max_wait = Some(ScheduledTask::after(
                self.inner.config.max_wait(),
                move || flush_from_timer(&weak, FlushReason::MaxWait),
            ));
        }

        let len = match state.current.as_mut() {
            Some(batch) => {
                batch.updates.push(update);
                batch.updates.len()
            }
            None => return,
        };

        if len >= self.inner.config.max_batch_size {
            self.inner.flush_locked(&mut state, FlushReason::MaxSize);
        } else {
            let weak = Arc::downgrade(&self.inner);
            state.debounce = Some(ScheduledTask::after(
                self.inner.config.debounce(),
                move || flush_from_timer(&weak, FlushReason::Debounce),
            ));
        }
    }

    /// Flush the current batch immediately, if any.
    pub fn flush_now(&self) {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.flush_locked(&mut state, FlushReason::Manual);
    }

    /// Stop accepting deltas and cancel the flush timers.
    ///
    /// With `flush`, the open batch is handed to the sink right away and any
    /// sends already in flight run to completion. Without it, the open batch
    /// and all pending retries are abandoned.
    pub fn shutdown(&self, flush: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.shut_down = true;
        state.debounce = None;
        state.max_wait = None;
        if flush {
            self.inner.flush_locked(&mut state, FlushReason::Shutdown);
        } else {
            if let Some(batch) = state.current.take() {
                log::info!(
                    "[UpdateBatcher] Abandoning {} unsent updates on shutdown",
                    batch.updates.len()
                );
            }
            state.in_flight.clear();
        }
    }

    /// Deltas in the open batch.
    pub fn pending_updates(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.current.as_ref().map_or(0, |b| b.updates.len())
    }

    /// Batches sent or awaiting a retry.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().unwrap().in_flight.len()
    }

    /// Number of flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.inner.state.lock().unwrap().flush_count
    }

    /// Error of the most recent failed send, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().unwrap().last_error.clone()
    }

    /// Whether anything is waiting to be delivered.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.current.is_none() && state.in_flight.is_empty()
    }
}

fn flush_from_timer(weak: &Weak<Inner>, reason: FlushReason) {
    if let Some(inner) = weak.upgrade() {
        let mut state = inner.state.lock().unwrap();
        inner.flush_locked(&mut state, reason);
    }
}

impl Inner {
    fn flush_locked(self: &Arc<Self>, state: &mut State, reason: FlushReason) {
        state.debounce = None;
        state.max_wait = None;
        let Some(batch) = state.current.take() else {
            return;
        };
        if batch.updates.is_empty() {
            return;
        }

        let raw_bytes: usize = batch.updates.iter().map(Vec::len).sum();
        let merged = match merge_updates(&batch.updates) {
            Ok(merged) => {
                self.stats.record_flush(raw_bytes, merged.len());
                Some(merged)
            }
            Err(e) => {
                log::warn!(
                    "[UpdateBatcher] Merge failed, sending {} updates unmerged: {}",
                    batch.updates.len(),
                    e
                );
                None
            }
        };

        state.flush_count += 1;
        log::debug!(
            "[UpdateBatcher] Flushing batch {} ({} updates, {:?})",
            batch.id,
            batch.updates.len(),
            reason
        );
        self.dispatch(state, Outbound { batch, merged }, reason);
    }

    fn dispatch(self: &Arc<Self>, state: &mut State, outbound: Outbound, reason: FlushReason) {
        let id = outbound.batch.id;
        let flushed = FlushedBatch {
            merged: outbound.merged.clone(),
            updates: outbound.batch.updates.clone(),
            created_at: outbound.batch.created_at,
            reason,
            attempt: outbound.batch.retry_count + 1,
        };
        let sink = Arc::clone(&self.sink);
        let weak = Arc::downgrade(self);

        let task = ScheduledTask::spawn(async move {
            let started = Instant::now();
            let result = sink.send_batch(flushed).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_send_result(outbound, started.elapsed(), result);
            }
        });
        state.in_flight.insert(id, task);
    }

    fn on_send_result(self: &Arc<Self>, mut outbound: Outbound, latency: Duration, result: Result<()>) {
        let mut state = self.state.lock().unwrap();
        let id = outbound.batch.id;
        let count = outbound.batch.updates.len();
        // Our own handle; the task ends right after this call.
        state.in_flight.remove(&id);

        let error = match result {
            Ok(()) => {
                self.stats.record_success(count, latency);
                state.last_error = None;
                log::debug!("[UpdateBatcher] Batch {} delivered in {:?}", id, latency);
                return;
            }
            Err(e) => e,
        };

        state.last_error = Some(error.to_string());
        outbound.batch.retry_count += 1;
        let retry = outbound.batch.retry_count;

        if !error.is_retryable() || retry > self.config.max_send_retries {
            log::error!(
                "[UpdateBatcher] Giving up on batch {} ({} updates) after {} attempts: {}",
                id,
                count,
                retry,
                error
            );
            self.stats.record_failure(count);
            return;
        }

        let delay = send_retry_delay(retry);
        log::warn!(
            "[UpdateBatcher] Send of batch {} failed ({}), retry {}/{} in {:?}",
            id,
            error,
            retry,
            self.config.max_send_retries,
            delay
        );
        let weak = Arc::downgrade(self);
        let mut pending = Some(outbound);
        let timer = ScheduledTask::after(delay, move || {
            if let (Some(inner), Some(outbound)) = (weak.upgrade(), pending.take()) {
                let mut state = inner.state.lock().unwrap();
                inner.dispatch(&mut state, outbound, FlushReason::Retry);
            }
        });
        state.in_flight.insert(id, timer);
    }
}

impl std::fmt::Debug for UpdateBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBatcher")
            .field("config", &self.inner.config)
            .field("pending_updates", &self.pending_updates())
            .finish_non_exhaustive()
    }
}
