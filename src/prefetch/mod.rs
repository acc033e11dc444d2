//! Expert weight prefetching.
//!
//! The transfer/compute overlap machinery: a background worker that
//! simulates expert weight transfers, a single-consumer cache of resident
//! weights, one-shot completion signals, and cumulative hit/miss/timing
//! statistics.
//!
//! Scheduling is non-blocking; the only suspension point is a
//! [`PrefetchEngine::get`] against a transfer that is still in flight.

mod engine;
mod signal;
mod stats;

pub use engine::PrefetchEngine;
pub use signal::{PrefetchHandle, TransferSignal};
pub use stats::PrefetchStats;
