//! Signal handling for graceful shutdown (SIGINT/SIGTERM)
//!
//! The first signal asks the scheduler to stop: cluster monitors are joined,
//! one final save runs, pending pushes are flushed and the backup directory
//! is refreshed. A second signal skips everything after the final save.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Granularity of interruptible sleeps.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared shutdown flags.
#[derive(Debug, Default)]
pub struct ShutdownState {
    stop_requested: AtomicBool,
    immediate_exit: AtomicBool,
    signal_count: AtomicU8,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Second signal received.
    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop without a signal.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Record one SIGINT/SIGTERM and return what to do about it.
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            self.stop_requested.store(true, Ordering::SeqCst);
            SignalAction::Shutdown
        } else if count == 1 {
            self.immediate_exit.store(true, Ordering::SeqCst);
            SignalAction::ImmediateExit
        } else {
            SignalAction::Ignore
        }
    }

    /// Sleep for `duration`, waking early on a stop request. Returns true
    /// when stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stop_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: graceful shutdown
    Shutdown,
    /// Second signal: stop after the final save
    ImmediateExit,
    /// Third+ signal
    Ignore,
}

/// Install the SIGINT/SIGTERM handler. Call once at startup.
pub fn install(state: Arc<ShutdownState>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || match state.handle_signal() {
        SignalAction::Shutdown => warn!("received interrupt signal, shutting down"),
        SignalAction::ImmediateExit => warn!("received second interrupt, exiting after final save"),
        SignalAction::Ignore => {}
    })
}
