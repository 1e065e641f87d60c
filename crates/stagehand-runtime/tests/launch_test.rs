//! End-to-end launch scenarios for the master and the stages.
//!
//! Containers are real `sh` children of the test process. Signals are fed
//! to the master through a fake pump instead of process-wide capture, so
//! the tests can run in parallel.
//! 1. Payload exits normally
//! 2. Payload fails to start (stage two sentinel)
//! 3. Payload is killed by a signal
//! 4. Instance launch notifies the parent
//! 5. Create failure tears the container down
//! 6. Pre-start hook protocol
//! 7. Stage one writes the engine configuration back

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::convert::Infallible;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::{self, WaitStatus as NixWaitStatus};
use nix::unistd::Pid;
use stagehand_common::config::CommonConfig;
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::{ContainerId, WaitStatus};
use stagehand_core::capability::CapabilitySet;
use stagehand_core::shared::Config;
use stagehand_runtime::engine::{Engine, EngineRegistry, Operations, PreStartHook};
use stagehand_runtime::master::fatal::Outcome;
use stagehand_runtime::master::{InstanceParent, Master};
use stagehand_runtime::rpc::client::RpcClient;
use stagehand_runtime::stage;

// ── Scripted engine ──────────────────────────────────────────────────

#[derive(Default)]
struct Journal {
    post_started: AtomicBool,
    cleanup: Mutex<Option<(bool, Option<WaitStatus>)>>,
}

#[derive(Default)]
struct Scripted {
    journal: Arc<Journal>,
    fail_create: bool,
    handshake: Option<Handshake>,
}

struct Handshake;

impl PreStartHook for Handshake {
    fn pre_start_process(&self, _pid: Pid, master: &mut UnixStream) -> Result<()> {
        master.write_all(b"g").map_err(|e| StagehandError::Sync {
            message: e.to_string(),
        })
    }
}

impl Operations for Scripted {
    fn init_config(&mut self, _: serde_json::Value) -> Result<()> {
        Ok(())
    }
    fn config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
    fn prepare_config(&mut self, _: &mut Config) -> Result<()> {
        Ok(())
    }
    fn create_container(&self, _: Pid, _: &mut RpcClient) -> Result<()> {
        if self.fail_create {
            return Err(StagehandError::RpcCall {
                method: "scripted.Mount".into(),
                message: "mount refused".into(),
            });
        }
        Ok(())
    }
    fn start_process(&self, _: &mut UnixStream) -> Result<Infallible> {
        Err(StagehandError::Config {
            message: "scripted engine never starts".into(),
        })
    }
    fn post_start_process(&self, _: Pid) -> Result<()> {
        self.journal.post_started.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn cleanup_container(&self, fatal: Option<&StagehandError>, status: Option<WaitStatus>) -> Result<()> {
        *self.journal.cleanup.lock().unwrap() = Some((fatal.is_some(), status));
        Ok(())
    }
    fn pre_start_hook(&self) -> Option<&dyn PreStartHook> {
        self.handshake.as_ref().map(|h| h as &dyn PreStartHook)
    }
}

fn engine(ops: Scripted) -> Engine {
    let common = CommonConfig {
        engine_name: "scripted".into(),
        container_id: ContainerId::new("test"),
        engine_config: serde_json::Value::Null,
    };
    Engine::new(common, Box::new(ops))
}

fn spawn_container(script: &str) -> Pid {
    let child = Command::new("sh").args(["-c", script]).spawn().unwrap();
    Pid::from_raw(i32::try_from(child.id()).unwrap())
}

fn sigchld_pump() -> Receiver<Signal> {
    let (tx, rx) = mpsc::channel();
    let _pump = std::thread::spawn(move || {
        while tx.send(Signal::SIGCHLD).is_ok() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    rx
}

/// Returns the master, the stage two end of the master socket, and the
/// RPC server end.
fn master(ops: Scripted, pid: Pid) -> (Master, UnixStream, UnixStream) {
    let (master_end, stage_two_end) = UnixStream::pair().unwrap();
    let (rpc_client_end, rpc_server_end) = UnixStream::pair().unwrap();
    let master = Master::new(engine(ops), pid, master_end, rpc_client_end);
    (master, stage_two_end, rpc_server_end)
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn payload_exit_zero_gives_exit_zero() {
    let journal = Arc::new(Journal::default());
    let pid = spawn_container("exit 0");
    let (master, stage_two, _rpc) = master(
        Scripted {
            journal: Arc::clone(&journal),
            ..Scripted::default()
        },
        pid,
    );
    drop(stage_two);

    let supervised = master.supervise(sigchld_pump());
    assert!(matches!(supervised.outcome, Outcome::Exited(WaitStatus::Exited(0))));
    let plan = supervised.exit_plan();
    assert_eq!(plan.code, 0);
    assert_eq!(plan.raise, None);
    assert_eq!(
        *journal.cleanup.lock().unwrap(),
        Some((false, Some(WaitStatus::Exited(0))))
    );
}

#[test]
fn failed_exec_skips_post_start_and_keeps_exit_code() {
    let journal = Arc::new(Journal::default());
    let native = EngineRegistry::builtin()
        .unwrap()
        .new_engine(br#"{"engineName":"native","engineConfig":{"rootfs":"/","args":["/nonexistent/payload"],"cwd":"."}}"#)
        .unwrap();

    let pid = spawn_container("sleep 0.2; exit 127");
    let (master, mut stage_two, _rpc) = master(
        Scripted {
            journal: Arc::clone(&journal),
            ..Scripted::default()
        },
        pid,
    );

    let err = stage::stage_two(&native, &mut stage_two);
    assert_eq!(err.exit_code(), 127);
    drop(stage_two);

    let supervised = master.supervise(sigchld_pump());
    assert_eq!(supervised.exit_plan().code, 127);
    assert!(!journal.post_started.load(Ordering::SeqCst));
}

#[test]
fn killed_payload_gives_137_and_reraises() {
    let pid = spawn_container("kill -9 $$");
    let (master, stage_two, _rpc) = master(Scripted::default(), pid);
    drop(stage_two);

    let plan = master.supervise(sigchld_pump()).exit_plan();
    assert_eq!(plan.code, 137);
    assert_eq!(plan.raise, Some(Signal::SIGKILL));
}

#[test]
fn instance_start_notifies_parent_with_sigusr1() {
    let mut helper = Command::new("sh")
        .args([
            "-c",
            "trap 'exit 42' USR1; echo ready; while :; do sleep 0.05; done",
        ])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut line = String::new();
    let _ = BufReader::new(helper.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line.trim(), "ready");
    let helper_pid = Pid::from_raw(i32::try_from(helper.id()).unwrap());

    let pid = spawn_container("sleep 0.5");
    let (master, stage_two, _rpc) = master(Scripted::default(), pid);
    let master = master.instance(InstanceParent::new(helper_pid).with_lookup(move || helper_pid));
    drop(stage_two);

    let supervised = master.supervise(sigchld_pump());
    assert_eq!(supervised.exit_plan().code, 0);
    assert_eq!(supervised.exit_plan().notify, None);
    assert!(matches!(
        wait::waitpid(helper_pid, None).unwrap(),
        NixWaitStatus::Exited(_, 42)
    ));
}

#[test]
fn create_failure_kills_container_and_exits_255() {
    let journal = Arc::new(Journal::default());
    let pid = spawn_container("sleep 30");
    let (master, _stage_two, _rpc) = master(
        Scripted {
            journal: Arc::clone(&journal),
            fail_create: true,
            ..Scripted::default()
        },
        pid,
    );

    let supervised = master.supervise(sigchld_pump());
    assert!(matches!(
        supervised.outcome,
        Outcome::Fatal(StagehandError::RpcCall { .. })
    ));
    assert_eq!(supervised.exit_plan().code, 255);
    assert_eq!(*journal.cleanup.lock().unwrap(), Some((true, None)));
}

#[test]
fn pre_start_hook_runs_after_readiness_byte() {
    let journal = Arc::new(Journal::default());
    let pid = spawn_container("sleep 0.2");
    let (master, mut stage_two, _rpc) = master(
        Scripted {
            journal: Arc::clone(&journal),
            handshake: Some(Handshake),
            ..Scripted::default()
        },
        pid,
    );
    let peer = std::thread::spawn(move || {
        stage_two.write_all(b"r").unwrap();
        let mut reply = [0_u8; 1];
        stage_two.read_exact(&mut reply).unwrap();
        reply[0]
    });

    let supervised = master.supervise(sigchld_pump());
    assert_eq!(peer.join().unwrap(), b'g');
    assert_eq!(supervised.exit_plan().code, 0);
    assert!(journal.post_started.load(Ordering::SeqCst));
}

// ── Stage one ────────────────────────────────────────────────────────

#[test]
fn stage_one_commits_engine_configuration() {
    let payload = br#"{"engineName":"native","containerID":"c7","engineConfig":{"rootfs":"rel","args":["/bin/sh"],"namespaces":["mount"],"capabilities":{"bounding":["CAP_SYS_ADMIN"]}}}"#;
    let file = tempfile::tempfile().unwrap();
    file.set_len(stagehand_common::constants::SHARED_CONFIG_SIZE as u64)
        .unwrap();
    let region = stagehand_core::shared::region::SharedRegion::attach(
        &file,
        stagehand_common::constants::SHARED_CONFIG_SIZE,
    )
    .unwrap();
    let mut config = Config::initialize(region, payload).unwrap();

    let registry = EngineRegistry::builtin().unwrap();
    let engine = stage::stage_one(&registry, &mut config).unwrap();
    assert_eq!(engine.name(), "native");
    config.release().unwrap();

    let reread = Config::attach(&file).unwrap();
    assert_ne!(reread.capabilities(CapabilitySet::Bounding), 0);
    let json: serde_json::Value = serde_json::from_slice(reread.json()).unwrap();
    assert_eq!(json["containerID"], "c7");
    let rootfs = json["engineConfig"]["rootfs"].as_str().unwrap();
    assert!(rootfs.starts_with('/') && rootfs.ends_with("rel"));
}

#[test]
fn stage_one_rejects_unknown_engine() {
    let mut config = Config::create(br#"{"engineName":"docker"}"#).unwrap();
    let err = stage::stage_one(&EngineRegistry::builtin().unwrap(), &mut config).unwrap_err();
    assert!(matches!(err, StagehandError::UnknownEngine { .. }));
}

#[test]
fn stage_two_reports_failure_sentinel() {
    let registry = EngineRegistry::builtin().unwrap();
    let native = registry
        .new_engine(br#"{"engineName":"native","engineConfig":{"args":["/nonexistent/payload"],"cwd":"."}}"#)
        .unwrap();
    let (mut ours, mut theirs) = UnixStream::pair().unwrap();
    let _err = stage::stage_two(&native, &mut ours);
    drop(ours);
    let mut received = Vec::new();
    let _ = theirs.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"f");
}
