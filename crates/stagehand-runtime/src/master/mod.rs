//! Master supervisor.
//!
//! The master runs three phases concurrently on detached threads:
//!
//! - **create**: builds the container environment over RPC,
//! - **synchronize**: waits for stage two to exec the payload, then runs
//!   the post-start step,
//! - **monitor**: reaps the container and forwards signals to it.
//!
//! The phases only share the engine, the container PID, and a single-slot
//! outcome channel. The first phase to report decides the outcome, after
//! which the master cleans up exactly once.

pub mod fatal;
pub mod monitor;
pub mod signals;

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use stagehand_common::constants::{INSTANCE_NOTIFY_DELAY, START_FAILURE_SENTINEL};
use stagehand_common::error::Result;

use crate::engine::Engine;
use crate::exit::ExitPlan;
use crate::rpc::client::RpcClient;
use fatal::{FatalSender, Outcome};
use signals::BlockedSignals;

/// Parent process of a backgrounded instance.
///
/// Notifications are only sent while the parent is still the one recorded
/// at start, so a re-parented master never signals an unrelated process.
pub struct InstanceParent {
    pid: Pid,
    current: Box<dyn Fn() -> Pid + Send + Sync>,
}

impl std::fmt::Debug for InstanceParent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceParent")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl InstanceParent {
    /// Records the current parent process.
    #[must_use]
    pub fn current() -> Self {
        Self::new(nix::unistd::getppid())
    }

    /// Records `pid` as the parent, checked against `getppid(2)`.
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            current: Box::new(nix::unistd::getppid),
        }
    }

    /// Replaces the lookup of the current parent.
    #[must_use]
    pub fn with_lookup(mut self, lookup: impl Fn() -> Pid + Send + Sync + 'static) -> Self {
        self.current = Box::new(lookup);
        self
    }

    /// Returns the recorded parent.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Sends `signal` to the parent if it is still the recorded one.
    ///
    /// Returns whether the signal was sent.
    pub fn notify(&self, signal: Signal) -> bool {
        let now = (self.current)();
        if now != self.pid {
            tracing::debug!(original = %self.pid, current = %now, "parent changed, not notifying");
            return false;
        }
        match kill(self.pid, signal) {
            Ok(()) => {
                tracing::debug!(parent = %self.pid, %signal, "parent notified");
                true
            }
            Err(e) => {
                tracing::warn!(parent = %self.pid, %signal, error = %e, "parent notification failed");
                false
            }
        }
    }
}

/// Result of a supervision run.
#[derive(Debug)]
pub struct Supervised {
    /// What ended the run.
    pub outcome: Outcome,
    /// Parent to notify when running as an instance.
    pub parent: Option<Arc<InstanceParent>>,
}

impl Supervised {
    /// Derives the exit behavior of the master.
    #[must_use]
    pub fn exit_plan(&self) -> ExitPlan {
        ExitPlan::new(&self.outcome, self.parent.is_some())
    }

    /// Notifies the parent if needed and terminates the master.
    pub fn exit(self) -> ! {
        let plan = self.exit_plan();
        plan.perform(self.parent.as_deref())
    }
}

/// Supervisor of one container launch.
#[derive(Debug)]
pub struct Master {
    engine: Arc<Engine>,
    container_pid: Pid,
    master_socket: UnixStream,
    rpc_socket: UnixStream,
    parent: Option<Arc<InstanceParent>>,
}

impl Master {
    /// Creates a master for the container process `container_pid`, which
    /// must be a child of the calling process.
    #[must_use]
    pub fn new(
        engine: Engine,
        container_pid: Pid,
        master_socket: UnixStream,
        rpc_socket: UnixStream,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            container_pid,
            master_socket,
            rpc_socket,
            parent: None,
        }
    }

    /// Runs as a backgrounded instance reporting to `parent`.
    #[must_use]
    pub fn instance(mut self, parent: InstanceParent) -> Self {
        self.parent = Some(Arc::new(parent));
        self
    }

    /// Captures signals, supervises the container, and restores the signal
    /// mask afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if signals cannot be blocked. A failure to restore
    /// the mask afterwards is only logged.
    pub fn run(self) -> Result<Supervised> {
        let blocked = BlockedSignals::block()?;
        let signals = blocked.spawn_waiter();
        let supervised = self.supervise(signals);
        Ok(after_restore(supervised, blocked.restore()))
    }

    /// Runs the three phases against `signals` and waits for the outcome.
    pub fn supervise(self, signals: Receiver<Signal>) -> Supervised {
        let Self {
            engine,
            container_pid: pid,
            master_socket,
            rpc_socket,
            parent,
        } = self;
        tracing::info!(engine = %engine.name(), %pid, "master supervising container");
        let (tx, rx) = fatal::channel();

        {
            let engine = Arc::clone(&engine);
            let tx = tx.clone();
            let _create = thread::spawn(move || create_phase(&engine, pid, rpc_socket, &tx));
        }
        {
            let engine = Arc::clone(&engine);
            let tx = tx.clone();
            let parent = parent.clone();
            let _sync = thread::spawn(move || {
                sync_phase(&engine, pid, master_socket, parent.as_deref(), &tx);
            });
        }
        {
            let engine = Arc::clone(&engine);
            let _monitor = thread::spawn(move || {
                let _ = tx.report(Outcome::from(engine.monitor_container(pid, &signals)));
            });
        }

        let outcome = rx.recv().unwrap_or_else(Outcome::Fatal);
        let (fatal, status) = match &outcome {
            Outcome::Fatal(e) => {
                tracing::error!(%pid, error = %e, "launch failed, killing container");
                match kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => tracing::warn!(%pid, error = %err, "failed to kill container"),
                }
                (Some(e), None)
            }
            Outcome::Exited(status) => (None, Some(*status)),
        };
        if let Err(e) = engine.cleanup_container(fatal, status) {
            tracing::error!(error = %e, "container cleanup failed");
        }
        Supervised { outcome, parent }
    }
}

/// Logs a failed mask restore. The supervision outcome stands either way.
fn after_restore(supervised: Supervised, restored: Result<()>) -> Supervised {
    if let Err(e) = restored {
        tracing::warn!(error = %e, "signal mask not restored");
    }
    supervised
}

fn create_phase(engine: &Engine, pid: Pid, rpc_socket: UnixStream, tx: &FatalSender) {
    let mut client = RpcClient::new(engine.name(), rpc_socket);
    if let Err(e) = engine.create_container(pid, &mut client) {
        let _ = tx.report(Outcome::Fatal(e));
    }
}

fn sync_phase(
    engine: &Engine,
    pid: Pid,
    mut socket: UnixStream,
    parent: Option<&InstanceParent>,
    tx: &FatalSender,
) {
    match synchronize(engine, pid, &mut socket) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            let _ = tx.report(Outcome::Fatal(e));
            return;
        }
    }
    if let Err(e) = engine.post_start_process(pid) {
        let _ = tx.report(Outcome::Fatal(e));
        return;
    }
    if let Some(parent) = parent {
        thread::sleep(INSTANCE_NOTIFY_DELAY);
        let _ = parent.notify(Signal::SIGUSR1);
    }
}

/// What stage two reported over the master socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReport {
    /// The socket closed without data: the payload was exec'd.
    Started,
    /// Stage two sent the failure sentinel.
    Failed,
    /// Anything else; handled like a failure.
    Unexpected,
}

/// Reads stage two's single-byte report.
pub fn read_start_report(socket: &mut UnixStream) -> StartReport {
    let mut byte = [0_u8; 1];
    loop {
        match socket.read(&mut byte) {
            Ok(0) => return StartReport::Started,
            Ok(_) if byte[0] == START_FAILURE_SENTINEL => return StartReport::Failed,
            Ok(_) => {
                tracing::warn!(byte = byte[0], "unexpected byte from stage two");
                return StartReport::Unexpected;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(error = %e, "reading stage two report failed");
                return StartReport::Unexpected;
            }
        }
    }
}

/// Reads stage two's readiness byte ahead of a pre-start hook. EOF and read
/// errors both defer to the wait status.
fn await_readiness(socket: &mut UnixStream) -> bool {
    let mut ready = [0_u8; 1];
    loop {
        match socket.read(&mut ready) {
            Ok(0) => {
                tracing::warn!("stage two closed before signalling readiness");
                return false;
            }
            Ok(_) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(error = %e, "reading readiness byte failed");
                return false;
            }
        }
    }
}

/// Runs the synchronization protocol. `Ok(true)` means the payload started
/// and the post-start step should run; `Ok(false)` defers to the wait
/// status.
fn synchronize(engine: &Engine, pid: Pid, socket: &mut UnixStream) -> Result<bool> {
    if let Some(hook) = engine.pre_start_hook() {
        if !await_readiness(socket) {
            return Ok(false);
        }
        hook.pre_start_process(pid, socket)?;
    }
    match read_start_report(socket) {
        StartReport::Started => {
            tracing::info!(%pid, "payload started");
            Ok(true)
        }
        StartReport::Failed | StartReport::Unexpected => {
            tracing::info!(%pid, "payload failed to start, waiting for exit status");
            Ok(false)
        }
    }
}
