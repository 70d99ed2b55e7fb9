//! Coalescing gate: at most one run in flight, at most one pending.

use std::sync::atomic::{AtomicBool, Ordering};

/// What a call to [`SaveGate::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// This caller ran the operation (and any request queued meanwhile).
    Ran,
    /// Another run was in flight; this request was folded into its single
    /// follow-up run.
    Queued,
}

/// Serializes an operation and collapses bursts of requests.
///
/// Requests arriving while a run is in progress set one pending flag; the
/// running caller performs exactly one more run for all of them.
#[derive(Debug, Default)]
pub struct SaveGate {
    running: AtomicBool,
    pending: AtomicBool,
}

impl SaveGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn run<F: FnMut()>(&self, mut f: F) -> GateOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.pending.store(true, Ordering::SeqCst);
            // The runner may have finished between the two operations.
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return GateOutcome::Queued;
            }
        }

        loop {
            self.pending.store(false, Ordering::SeqCst);
            f();
            if !self.pending.load(Ordering::SeqCst) {
                self.running.store(false, Ordering::SeqCst);
                // A request may have queued after the check above.
                if self.pending.load(Ordering::SeqCst)
                    && self
                        .running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }
                return GateOutcome::Ran;
            }
        }
    }
}
