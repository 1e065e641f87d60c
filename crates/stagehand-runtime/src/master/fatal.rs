//! Single-slot outcome channel shared by the master phases.
//!
//! Up to three phases may report concurrently. The slot holds one value,
//! producers never block, and only the first report is kept.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::WaitStatus;

/// What ended the supervision of a container.
#[derive(Debug)]
pub enum Outcome {
    /// A phase failed; the launch is torn down.
    Fatal(StagehandError),
    /// The container terminated and was reaped.
    Exited(WaitStatus),
}

impl From<Result<WaitStatus>> for Outcome {
    fn from(result: Result<WaitStatus>) -> Self {
        match result {
            Ok(status) => Self::Exited(status),
            Err(e) => Self::Fatal(e),
        }
    }
}

/// Producer side, cloned into each phase.
#[derive(Debug, Clone)]
pub struct FatalSender {
    tx: SyncSender<Outcome>,
}

impl FatalSender {
    /// Offers `outcome`. Returns `false` when another phase already won.
    pub fn report(&self, outcome: Outcome) -> bool {
        match self.tx.try_send(outcome) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped) | TrySendError::Disconnected(dropped)) => {
                tracing::debug!(outcome = ?dropped, "outcome already decided, dropping report");
                false
            }
        }
    }
}

/// Consumer side, owned by the master.
#[derive(Debug)]
pub struct FatalReceiver {
    rx: Receiver<Outcome>,
}

impl FatalReceiver {
    /// Blocks until a phase reports.
    ///
    /// # Errors
    ///
    /// Returns an error if every phase ended without reporting.
    pub fn recv(&self) -> Result<Outcome> {
        self.rx.recv().map_err(|_| StagehandError::Monitor {
            message: "every phase ended without reporting an outcome".into(),
        })
    }
}

/// Creates a connected sender and receiver.
#[must_use]
pub fn channel() -> (FatalSender, FatalReceiver) {
    let (tx, rx) = mpsc::sync_channel(1);
    (FatalSender { tx }, FatalReceiver { rx })
}
