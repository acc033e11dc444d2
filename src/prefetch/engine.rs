//! Background transfer engine for expert weights.
//!
//! One worker thread per engine services transfer requests strictly in
//! submission order. A request sleeps for the configured delay (the
//! simulated memory transfer), then lands the weights in a single-consumer
//! cache and settles a one-shot completion signal. The cache map, signal
//! table, and statistics share one mutex; the lock is dropped while a
//! consumer waits on a signal so the worker is never starved.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::MoeError;
use crate::expert::{ExpertId, ExpertWeights};

use super::signal::{PrefetchHandle, TransferSignal};
use super::stats::PrefetchStats;

/// How long `stop` waits for the worker to drain and exit before giving
/// up and detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A scheduled transfer travelling through the worker channel.
struct TransferRequest {
    expert_id: ExpertId,
    weights: ExpertWeights,
    signal: Arc<TransferSignal>,
}

enum WorkerMsg {
    Transfer(TransferRequest),
    Shutdown,
}

/// State shared between the caller thread and the worker.
#[derive(Default)]
struct EngineState {
    /// Weights whose transfer has completed, keyed by expert id. Each
    /// entry is consumed (removed) by exactly one `get`.
    cache: HashMap<ExpertId, ExpertWeights>,
    /// Completion signals for transfers still in flight. Scheduling the
    /// same id again replaces the registration (last writer wins).
    pending: HashMap<ExpertId, Arc<TransferSignal>>,
    stats: PrefetchStats,
}

/// Prefetch engine: schedules simulated expert weight transfers on a
/// background worker and hands completed weights to a single consumer.
///
/// Dropping the engine closes the request channel; the worker finishes
/// its current transfer (if any) and exits on its own.
pub struct PrefetchEngine {
    state: Arc<Mutex<EngineState>>,
    transfer_delay: Duration,
    sender: Option<Sender<WorkerMsg>>,
    worker: Option<JoinHandle<()>>,
}

impl PrefetchEngine {
    pub fn new(transfer_delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            transfer_delay,
            sender: None,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    pub fn transfer_delay(&self) -> Duration {
        self.transfer_delay
    }

    /// Spawn the worker thread. No-op when already running.
    pub fn start(&mut self) {
        if self.sender.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        let state = Arc::clone(&self.state);
        let delay = self.transfer_delay;
        self.worker = Some(thread::spawn(move || run_worker(rx, state, delay)));
        self.sender = Some(tx);
        debug!(transfer_delay = ?self.transfer_delay, "prefetch worker started");
    }

    /// Stop the worker: enqueue a shutdown message behind any outstanding
    /// transfers (drain-then-exit) and join with a bounded timeout.
    ///
    /// Idempotent; safe before `start`. On timeout the worker is detached
    /// and the non-fatal [`MoeError::JoinTimeout`] is returned — the
    /// engine still counts as stopped and callers may ignore the error.
    pub fn stop(&mut self) -> Result<(), MoeError> {
        let Some(sender) = self.sender.take() else {
            return Ok(());
        };
        // The worker may already have exited on a dropped channel.
        let _ = sender.send(WorkerMsg::Shutdown);
        drop(sender);

        if let Some(handle) = self.worker.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    warn!(timeout = ?JOIN_TIMEOUT, "prefetch worker did not exit; detaching");
                    return Err(MoeError::JoinTimeout {
                        timeout: JOIN_TIMEOUT,
                    });
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        debug!("prefetch worker stopped");
        Ok(())
    }

    /// Schedule a transfer for `expert_id`. Non-blocking: the request is
    /// enqueued at the channel tail and this returns immediately,
    /// regardless of the configured transfer delay.
    ///
    /// An existing registration for the same id is replaced; the previous
    /// handle still settles when its own transfer completes, but `get`
    /// only consults the latest registration.
    ///
    /// Errors with [`MoeError::EngineNotRunning`] when the worker was
    /// never started (the request would otherwise queue forever).
    pub fn schedule(
        &self,
        expert_id: ExpertId,
        weights: ExpertWeights,
    ) -> Result<PrefetchHandle, MoeError> {
        let sender = self.sender.as_ref().ok_or(MoeError::EngineNotRunning)?;

        let signal = Arc::new(TransferSignal::new());
        self.lock_state()?
            .pending
            .insert(expert_id, Arc::clone(&signal));

        let request = TransferRequest {
            expert_id,
            weights,
            signal: Arc::clone(&signal),
        };
        if sender.send(WorkerMsg::Transfer(request)).is_err() {
            // Worker gone; undo the registration so no consumer blocks on
            // a signal that will never settle.
            if let Ok(mut state) = self.state.lock() {
                if state
                    .pending
                    .get(&expert_id)
                    .is_some_and(|s| Arc::ptr_eq(s, &signal))
                {
                    state.pending.remove(&expert_id);
                }
            }
            return Err(MoeError::EngineNotRunning);
        }

        trace!(expert_id, "transfer scheduled");
        Ok(PrefetchHandle::new(expert_id, signal))
    }

    /// Fetch weights for `expert_id`, consuming the cache entry.
    ///
    /// Resident entry: consumed immediately, counted as a hit. Transfer in
    /// flight: blocks on the completion signal with the state lock
    /// released (the wait is accumulated into `blocked_time`), then
    /// consumes the entry as a hit. Neither: `fallback` runs synchronously
    /// and the lookup counts as a miss — this path never blocks.
    pub fn get<F>(&self, expert_id: ExpertId, fallback: F) -> Result<(ExpertWeights, bool), MoeError>
    where
        F: FnOnce() -> ExpertWeights,
    {
        let mut state = self.lock_state()?;

        if let Some(weights) = state.cache.remove(&expert_id) {
            state.stats.hits += 1;
            return Ok((weights, true));
        }

        let Some(signal) = state.pending.get(&expert_id).map(Arc::clone) else {
            state.stats.misses += 1;
            drop(state);
            return Ok((fallback(), false));
        };

        // Release the lock while waiting so the worker can land the
        // weights, then reacquire to consume the entry.
        drop(state);
        let wait_start = Instant::now();
        signal.wait();
        let blocked = wait_start.elapsed();

        let mut state = self.lock_state()?;
        state.stats.blocked_time += blocked;
        match state.cache.remove(&expert_id) {
            Some(weights) => {
                state.stats.hits += 1;
                Ok((weights, true))
            }
            None => {
                // A clear() raced with the transfer; treat as a miss.
                state.stats.misses += 1;
                drop(state);
                Ok((fallback(), false))
            }
        }
    }

    /// Drop all cache entries and pending signal registrations.
    ///
    /// Does not cancel an in-flight transfer: a transfer already running
    /// still writes into the cache afterwards, leaving an orphaned entry
    /// that is only consumed if the same id is requested again.
    pub fn clear(&self) -> Result<(), MoeError> {
        let mut state = self.lock_state()?;
        state.cache.clear();
        state.pending.clear();
        debug!("prefetch cache cleared");
        Ok(())
    }

    /// Whether a completed transfer for `expert_id` is waiting to be
    /// consumed.
    pub fn is_resident(&self, expert_id: ExpertId) -> Result<bool, MoeError> {
        Ok(self.lock_state()?.cache.contains_key(&expert_id))
    }

    /// Whether a transfer for `expert_id` is registered but not yet
    /// consumed-or-cleared.
    pub fn is_pending(&self, expert_id: ExpertId) -> Result<bool, MoeError> {
        Ok(self.lock_state()?.pending.contains_key(&expert_id))
    }

    /// Snapshot of the cumulative statistics.
    pub fn stats(&self) -> Result<PrefetchStats, MoeError> {
        Ok(self.lock_state()?.stats.clone())
    }

    pub fn reset_stats(&self) -> Result<(), MoeError> {
        self.lock_state()?.stats.reset();
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, EngineState>, MoeError> {
        self.state.lock().map_err(|_| MoeError::LockPoisoned)
    }
}

fn run_worker(rx: Receiver<WorkerMsg>, state: Arc<Mutex<EngineState>>, delay: Duration) {
    loop {
        match rx.recv() {
            Ok(WorkerMsg::Transfer(request)) => {
                let start = Instant::now();
                if !delay.is_zero() {
                    thread::sleep(delay);
                }

                if let Ok(mut state) = state.lock() {
                    state.cache.insert(request.expert_id, request.weights);
                    // Only drop the signal-table entry if it still refers
                    // to this request; a re-schedule may have replaced it.
                    let superseded = state
                        .pending
                        .get(&request.expert_id)
                        .is_some_and(|s| !Arc::ptr_eq(s, &request.signal));
                    if !superseded {
                        state.pending.remove(&request.expert_id);
                    }
                    state.stats.total_transfer_time += start.elapsed();
                }

                // Settle unconditionally so a waiter is never stranded,
                // even if the state lock was poisoned.
                request.signal.set();
                trace!(expert_id = request.expert_id, "transfer complete");
            }
            Ok(WorkerMsg::Shutdown) | Err(_) => break,
        }
    }
}
