//! Cumulative prefetch statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Counters and time accumulators for the prefetch engine.
///
/// Counters only ever increase; `reset` is the sole way back to zero.
/// `blocked_time` is the time consumers spent waiting inside `get` for an
/// in-flight transfer; `total_transfer_time` is the summed wall time of
/// all completed transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchStats {
    pub hits: u64,
    pub misses: u64,
    pub total_transfer_time: Duration,
    pub blocked_time: Duration,
}

impl PrefetchStats {
    /// Hit rate over all lookups, `None` before the first lookup.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        if total == 0 {
            None
        } else {
            Some(self.hits as f64 / total as f64)
        }
    }

    /// Fraction of transfer time hidden from the consumer:
    /// `1 - blocked_time / total_transfer_time`.
    ///
    /// `None` until at least one transfer has completed.
    pub fn overlap_efficiency(&self) -> Option<f64> {
        let total = self.total_transfer_time.as_secs_f64();
        if total == 0.0 {
            None
        } else {
            Some(1.0 - self.blocked_time.as_secs_f64() / total)
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
