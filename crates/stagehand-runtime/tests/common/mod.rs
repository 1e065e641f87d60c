//! Helpers shared by the real-signal supervision tests.
//!
//! These tests own their process: signals are blocked on the main thread
//! before any helper thread exists, so only the master's waiter consumes
//! them.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used, clippy::print_stderr)]

use std::convert::Infallible;
use std::os::unix::net::UnixStream;
use std::process::Command;
use std::time::Duration;

use nix::unistd::Pid;
use stagehand_common::config::CommonConfig;
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::{ContainerId, WaitStatus};
use stagehand_core::shared::Config;
use stagehand_runtime::engine::{Engine, Operations};
use stagehand_runtime::master::Master;
use stagehand_runtime::rpc::client::RpcClient;

/// Engine whose lifecycle steps all succeed without doing anything.
pub struct Idle;

impl Operations for Idle {
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
        Ok(())
    }
    fn start_process(&self, _: &mut UnixStream) -> Result<Infallible> {
        Err(StagehandError::Config {
            message: "idle engine never starts".into(),
        })
    }
    fn post_start_process(&self, _: Pid) -> Result<()> {
        Ok(())
    }
    fn cleanup_container(&self, _: Option<&StagehandError>, _: Option<WaitStatus>) -> Result<()> {
        Ok(())
    }
}

pub fn spawn_container(script: &str) -> Pid {
    let child = Command::new("sh").args(["-c", script]).spawn().unwrap();
    Pid::from_raw(i32::try_from(child.id()).unwrap())
}

/// A master over `pid` whose stage two already exec'd. The returned socket
/// keeps the RPC connection open.
pub fn idle_master(pid: Pid) -> (Master, UnixStream) {
    let common = CommonConfig {
        engine_name: "idle".into(),
        container_id: ContainerId::new("signals"),
        engine_config: serde_json::Value::Null,
    };
    let (master_end, stage_two_end) = UnixStream::pair().unwrap();
    drop(stage_two_end);
    let (rpc_client_end, rpc_server_end) = UnixStream::pair().unwrap();
    let master = Master::new(
        Engine::new(common, Box::new(Idle)),
        pid,
        master_end,
        rpc_client_end,
    );
    (master, rpc_server_end)
}

/// Fails the test process if it is still running after `limit`.
pub fn watchdog(limit: Duration) {
    let _watchdog = std::thread::spawn(move || {
        std::thread::sleep(limit);
        eprintln!("master did not finish within {limit:?}");
        std::process::exit(1);
    });
}
