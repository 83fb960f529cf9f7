//! Process-wide Ctrl-C handling (§5 Cancellation).
//!
//! A single `ctrlc::set_handler` is installed once per process and bumps a
//! shared level: the first Ctrl-C asks the scheduler to stop launching new
//! lanes and SIGTERM the agents still running; a second escalates to
//! SIGKILL. The scheduler polls the level rather than being interrupted,
//! matching the rest of the engine's file-poll-over-async-signal style (§9).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const NONE: u8 = 0;
const TERM_REQUESTED: u8 = 1;
const KILL_REQUESTED: u8 = 2;

/// Shared cancellation level, cheaply cloned into scheduler loops.
#[derive(Clone)]
pub struct CancelFlag(Arc<AtomicU8>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(NONE)))
    }

    pub fn term_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) >= TERM_REQUESTED
    }

    pub fn kill_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) >= KILL_REQUESTED
    }

    /// First Ctrl-C: ask the scheduler to stop launching new lanes and
    /// SIGTERM everything in flight.
    pub fn request_term(&self) {
        self.0.fetch_max(TERM_REQUESTED, Ordering::SeqCst);
    }

    /// Second Ctrl-C: escalate to SIGKILL.
    pub fn request_kill(&self) {
        self.0.store(KILL_REQUESTED, Ordering::SeqCst);
    }

    /// Install the process's single Ctrl-C handler. First press requests a
    /// graceful stop; a second escalates to kill.
    pub fn install(&self) {
        let flag = self.clone();
        let _ = ctrlc::set_handler(move || {
            if flag.term_requested() {
                flag.request_kill();
            } else {
                flag.request_term();
            }
        });
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}
