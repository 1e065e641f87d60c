//! Signals sent to the master are captured and forwarded to the container,
//! and its death arrives as a real `SIGCHLD`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::getpid;
use stagehand_common::types::WaitStatus;
use stagehand_runtime::master::fatal::Outcome;
use stagehand_runtime::master::signals::BlockedSignals;

fn main() {
    let _blocked = BlockedSignals::block().unwrap();
    common::watchdog(Duration::from_secs(10));

    let pid = common::spawn_container("sleep 30");
    let (master, _rpc) = common::idle_master(pid);
    let _sender = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(300));
        kill(getpid(), Signal::SIGTERM).unwrap();
    });

    let supervised = master.run().unwrap();
    assert!(matches!(
        supervised.outcome,
        Outcome::Exited(WaitStatus::Signaled(15))
    ));
    let plan = supervised.exit_plan();
    assert_eq!(plan.code, 143);
    assert_eq!(plan.raise, Some(Signal::SIGTERM));
}
