//! Default container monitor: reap on `SIGCHLD`, forward everything else.

use std::sync::mpsc::Receiver;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{self, WaitPidFlag};
use nix::unistd::Pid;
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::WaitStatus;

/// Non-blocking reap of `pid`. `None` while it is still running.
///
/// # Errors
///
/// Returns an error if `waitpid(2)` fails, for instance because `pid` is
/// not a child of this process.
pub fn try_reap(pid: Pid) -> Result<Option<WaitStatus>> {
    loop {
        match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(wait::WaitStatus::Exited(_, code)) => return Ok(Some(WaitStatus::Exited(code))),
            Ok(wait::WaitStatus::Signaled(_, signal, _)) => {
                return Ok(Some(WaitStatus::Signaled(signal as i32)));
            }
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(StagehandError::Monitor {
                    message: format!("waitpid({pid}) failed: {e}"),
                });
            }
        }
    }
}

/// Consumes signals until the container is reaped.
///
/// `SIGCHLD` triggers a reap of `pid` only, so other children are left
/// alone. Any other signal is forwarded to the container. The container is
/// also reaped once up front: it may have exited before signal capture was
/// installed, and that `SIGCHLD` is gone.
///
/// # Errors
///
/// Returns an error if reaping fails, a signal cannot be delivered, or the
/// signal source goes away.
pub fn monitor(pid: Pid, signals: &Receiver<Signal>) -> Result<WaitStatus> {
    tracing::debug!(%pid, "monitoring container");
    if let Some(status) = try_reap(pid)? {
        tracing::info!(%pid, %status, "container terminated before monitoring");
        return Ok(status);
    }
    loop {
        let signal = signals.recv().map_err(|_| StagehandError::Monitor {
            message: "signal source closed".into(),
        })?;
        if signal == Signal::SIGCHLD {
            if let Some(status) = try_reap(pid)? {
                tracing::info!(%pid, %status, "container terminated");
                return Ok(status);
            }
            continue;
        }
        tracing::debug!(%pid, %signal, "forwarding signal to container");
        kill(pid, signal).map_err(|e| StagehandError::Monitor {
            message: format!("forwarding {signal} to {pid} failed: {e}"),
        })?;
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::sync::mpsc;

    use super::*;

    fn spawn(script: &str) -> Pid {
        let child = Command::new("sh").args(["-c", script]).spawn().unwrap();
        Pid::from_raw(i32::try_from(child.id()).unwrap())
    }

    fn pump(tx: mpsc::Sender<Signal>) {
        let _pump = std::thread::spawn(move || {
            while tx.send(Signal::SIGCHLD).is_ok() {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        });
    }

    #[test]
    fn exit_code_is_reported() {
        let pid = spawn("exit 3");
        let (tx, rx) = mpsc::channel();
        pump(tx);
        assert_eq!(monitor(pid, &rx).unwrap(), WaitStatus::Exited(3));
    }

    #[test]
    fn forwarded_signal_terminates_container() {
        let pid = spawn("sleep 30");
        let (tx, rx) = mpsc::channel();
        tx.send(Signal::SIGTERM).unwrap();
        pump(tx);
        assert_eq!(monitor(pid, &rx).unwrap(), WaitStatus::Signaled(15));
    }

    #[test]
    fn already_reaped_container_is_fatal() {
        let pid = spawn("exit 0");
        assert!(matches!(
            wait::waitpid(pid, None).unwrap(),
            wait::WaitStatus::Exited(_, 0)
        ));
        let (tx, rx) = mpsc::channel();
        tx.send(Signal::SIGCHLD).unwrap();
        let err = monitor(pid, &rx).unwrap_err();
        assert!(matches!(err, StagehandError::Monitor { .. }));
    }

    #[test]
    fn container_gone_before_capture_is_reaped_without_sigchld() {
        let pid = spawn("exit 4");
        let _ = wait::waitid(
            wait::Id::Pid(pid),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
        )
        .unwrap();
        let (_tx, rx) = mpsc::channel();
        assert_eq!(monitor(pid, &rx).unwrap(), WaitStatus::Exited(4));
    }

    #[test]
    fn closed_source_is_fatal() {
        let (tx, rx) = mpsc::channel::<Signal>();
        drop(tx);
        assert!(monitor(Pid::from_raw(1), &rx).is_err());
    }
}
