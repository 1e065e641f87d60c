//! Translation of a supervision outcome into the master's own exit.
//!
//! | outcome            | exit code  | extra                        |
//! |--------------------|------------|------------------------------|
//! | fatal error        | 255        |                              |
//! | exited with `c`    | `c`        |                              |
//! | killed by signal n | 128 + n    | `n` is re-raised on the master |
//!
//! A backgrounded instance that ends with a non-zero code also sends
//! `SIGUSR2` to its parent before exiting.

use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use stagehand_common::constants::FATAL_EXIT_CODE;
use stagehand_common::types::WaitStatus;

use crate::master::InstanceParent;
use crate::master::fatal::Outcome;

/// How the master terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPlan {
    /// Process exit code.
    pub code: i32,
    /// Signal re-raised against the master before exiting.
    pub raise: Option<Signal>,
    /// Signal sent to the instance parent before exiting.
    pub notify: Option<Signal>,
}

impl ExitPlan {
    /// Derives the plan from an outcome.
    #[must_use]
    pub fn new(outcome: &Outcome, instance: bool) -> Self {
        let (code, raise) = match outcome {
            Outcome::Fatal(_) => (FATAL_EXIT_CODE, None),
            Outcome::Exited(WaitStatus::Exited(code)) => (*code, None),
            Outcome::Exited(WaitStatus::Signaled(signo)) => {
                (128 + signo, Signal::try_from(*signo).ok())
            }
        };
        let notify = (instance && code != 0).then_some(Signal::SIGUSR2);
        Self {
            code,
            raise,
            notify,
        }
    }

    /// Carries out the plan: notify the parent, re-raise the signal with
    /// its default disposition, then exit with `code`.
    pub fn perform(self, parent: Option<&InstanceParent>) -> ! {
        if let (Some(signal), Some(parent)) = (self.notify, parent) {
            let _ = parent.notify(signal);
        }
        if let Some(signal) = self.raise {
            tracing::debug!(%signal, "re-raising container signal");
            reraise(signal);
        }
        tracing::info!(code = self.code, "master exiting");
        std::process::exit(self.code)
    }
}

fn reraise(signal: Signal) {
    // SAFETY: installing SIG_DFL has no handler code to race with.
    if let Err(e) = unsafe { signal::signal(signal, SigHandler::SigDfl) } {
        tracing::debug!(%signal, error = %e, "resetting disposition failed");
    }
    let mut set = SigSet::empty();
    set.add(signal);
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);
    let _ = signal::raise(signal);
}

#[cfg(test)]
mod tests {
    use stagehand_common::error::StagehandError;

    use super::*;

    #[test]
    fn fatal_is_255() {
        let outcome = Outcome::Fatal(StagehandError::Config {
            message: "bad".into(),
        });
        let plan = ExitPlan::new(&outcome, false);
        assert_eq!(plan.code, 255);
        assert_eq!(plan.raise, None);
        assert_eq!(plan.notify, None);
    }

    #[test]
    fn exit_code_passes_through() {
        let plan = ExitPlan::new(&Outcome::Exited(WaitStatus::Exited(42)), false);
        assert_eq!(plan.code, 42);
        assert_eq!(plan.raise, None);
    }

    #[test]
    fn signal_death_is_128_plus_and_reraised() {
        let plan = ExitPlan::new(&Outcome::Exited(WaitStatus::Signaled(9)), false);
        assert_eq!(plan.code, 137);
        assert_eq!(plan.raise, Some(Signal::SIGKILL));
    }

    #[test]
    fn instance_failure_notifies_parent() {
        let plan = ExitPlan::new(&Outcome::Exited(WaitStatus::Exited(1)), true);
        assert_eq!(plan.notify, Some(Signal::SIGUSR2));
        let plan = ExitPlan::new(&Outcome::Exited(WaitStatus::Exited(0)), true);
        assert_eq!(plan.notify, None);
    }
}
