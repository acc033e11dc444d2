//! One-shot completion signalling between the transfer worker and the
//! consuming thread.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::expert::ExpertId;

/// One-shot signal settled exactly once by the transfer worker and awaited
/// zero or more times by the consumer.
///
/// Built from a `Mutex<bool>` + `Condvar` pair so a waiter can block
/// without holding the engine's state lock.
#[derive(Debug, Default)]
pub struct TransferSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl TransferSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the transfer complete and wake all waiters.
    pub fn set(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cv.notify_all();
    }

    /// Block until the transfer completes. Returns immediately if it
    /// already has.
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .cv
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_set(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by [`schedule`](super::PrefetchEngine::schedule).
///
/// Wraps the request's completion signal so a caller can await or poll the
/// transfer directly. Note that scheduling the same expert id again
/// replaces the engine's signal-table registration: a consumer going
/// through [`get`](super::PrefetchEngine::get) always observes the latest
/// registration, while this handle only tracks its own request.
#[derive(Debug, Clone)]
pub struct PrefetchHandle {
    expert_id: ExpertId,
    signal: Arc<TransferSignal>,
}

impl PrefetchHandle {
    pub(crate) fn new(expert_id: ExpertId, signal: Arc<TransferSignal>) -> Self {
        Self { expert_id, signal }
    }

    pub fn expert_id(&self) -> ExpertId {
        self.expert_id
    }

    /// Block until this request's transfer completes.
    pub fn wait(&self) {
        self.signal.wait();
    }

    pub fn is_complete(&self) -> bool {
        self.signal.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_before_wait_returns_immediately() {
        let signal = TransferSignal::new();
        assert!(!signal.is_set());
        signal.set();
        assert!(signal.is_set());
        signal.wait(); // must not block
    }

    #[test]
    fn wait_blocks_until_set_from_another_thread() {
        let signal = Arc::new(TransferSignal::new());
        let setter = Arc::clone(&signal);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });

        signal.wait();
        assert!(signal.is_set());
        handle.join().unwrap();
    }

    #[test]
    fn multiple_waiters_all_wake() {
        let signal = Arc::new(TransferSignal::new());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let s = Arc::clone(&signal);
                thread::spawn(move || s.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        signal.set();
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn handle_reports_expert_id_and_completion() {
        let signal = Arc::new(TransferSignal::new());
        let handle = PrefetchHandle::new(3, Arc::clone(&signal));
        assert_eq!(handle.expert_id(), 3);
        assert!(!handle.is_complete());
        signal.set();
        assert!(handle.is_complete());
        handle.wait();
    }
}
