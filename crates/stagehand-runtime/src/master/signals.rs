//! Process-wide signal capture for the master.
//!
//! Asynchronous signals are blocked before any phase thread exists, so
//! every thread inherits the mask, and a dedicated thread consumes them
//! with `sigwait(2)`. Synchronous fault signals stay unblocked.

use std::sync::mpsc::{self, Receiver};
use std::thread;

use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use stagehand_common::error::{Result, StagehandError};

const SYNCHRONOUS: [Signal; 4] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
];

fn captured_set() -> SigSet {
    let mut set = SigSet::all();
    for signal in SYNCHRONOUS {
        set.remove(signal);
    }
    set.remove(Signal::SIGKILL);
    set.remove(Signal::SIGSTOP);
    set
}

/// Blocked asynchronous signals, restored by [`BlockedSignals::restore`].
#[derive(Debug)]
pub struct BlockedSignals {
    set: SigSet,
    previous: SigSet,
}

impl BlockedSignals {
    /// Blocks asynchronous signals on the calling thread.
    ///
    /// Call this before spawning any thread that must not receive them.
    ///
    /// # Errors
    ///
    /// Returns an error if `pthread_sigmask(3)` fails.
    pub fn block() -> Result<Self> {
        let set = captured_set();
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous)).map_err(|e| {
            StagehandError::Monitor {
                message: format!("blocking signals failed: {e}"),
            }
        })?;
        Ok(Self { set, previous })
    }

    /// Starts the waiter thread and returns the stream of caught signals.
    ///
    /// The thread exits once the receiver is dropped and another signal
    /// arrives.
    #[must_use]
    pub fn spawn_waiter(&self) -> Receiver<Signal> {
        let (tx, rx) = mpsc::channel();
        let set = self.set;
        let _waiter = thread::spawn(move || {
            loop {
                match set.wait() {
                    Ok(signal) => {
                        if tx.send(signal).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "sigwait returned an error"),
                }
            }
        });
        rx
    }

    /// Restores the signal mask that was in place before [`Self::block`].
    ///
    /// # Errors
    ///
    /// Returns an error if `pthread_sigmask(3)` fails.
    pub fn restore(self) -> Result<()> {
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None).map_err(|e| {
            StagehandError::Monitor {
                message: format!("restoring signal mask failed: {e}"),
            }
        })
    }
}
