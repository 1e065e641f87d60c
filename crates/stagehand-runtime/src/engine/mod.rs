//! Engine contract shared by every role.
//!
//! An engine implements [`Operations`] for one kind of workload. The
//! lifecycle always runs in the same order across roles:
//!
//! 1. `prepare_config` in stage one,
//! 2. `create_container` in the master, over RPC,
//! 3. `start_process` in stage two,
//! 4. `post_start_process` in the master,
//! 5. `monitor_container` in the master,
//! 6. `cleanup_container` in the master, exactly once.

pub mod native;
pub mod registry;

use std::convert::Infallible;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::Receiver;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use stagehand_common::config::CommonConfig;
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::{ContainerId, WaitStatus};
use stagehand_core::shared::Config;

use crate::rpc::client::RpcClient;
use crate::rpc::methods::{PrivilegedMethods, RpcMethods};

pub use registry::{EngineRegistry, Registrar};

/// Per-workload implementation of the container lifecycle.
///
/// Errors from `prepare_config` and `start_process` abort the launch.
/// Errors from `create_container` and `post_start_process` are reported
/// to the master and trigger teardown. Errors from `cleanup_container`
/// are only logged.
pub trait Operations: Send + Sync {
    /// Decodes and stores the engine-specific part of the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not match the engine's schema.
    fn init_config(&mut self, config: serde_json::Value) -> Result<()>;

    /// Serializes the current engine-specific configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn config(&self) -> Result<serde_json::Value>;

    /// Validates the configuration and writes namespace, identity, and
    /// capability settings into the shared block.
    ///
    /// # Errors
    ///
    /// Returns a configuration error; the launch is aborted.
    fn prepare_config(&mut self, config: &mut Config) -> Result<()>;

    /// Builds the container environment through the privileged RPC server.
    ///
    /// # Errors
    ///
    /// Returns an error if any privileged operation fails.
    fn create_container(&self, pid: Pid, rpc: &mut RpcClient) -> Result<()>;

    /// Replaces the current process with the payload.
    ///
    /// Returns only on failure.
    ///
    /// # Errors
    ///
    /// Returns the reason the payload could not be started.
    fn start_process(&self, master: &mut UnixStream) -> Result<Infallible>;

    /// Runs once the payload has been started.
    ///
    /// # Errors
    ///
    /// Returns an error if the post-start work fails.
    fn post_start_process(&self, pid: Pid) -> Result<()>;

    /// Waits for the container to terminate, forwarding signals to it.
    ///
    /// # Errors
    ///
    /// Returns an error if reaping fails or a signal cannot be delivered.
    fn monitor_container(&self, pid: Pid, signals: &Receiver<Signal>) -> Result<WaitStatus> {
        crate::master::monitor::monitor(pid, signals)
    }

    /// Releases container resources after the outcome is known.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails; the master only logs it.
    fn cleanup_container(
        &self,
        fatal: Option<&StagehandError>,
        status: Option<WaitStatus>,
    ) -> Result<()>;

    /// Optional hook run between stage two's readiness byte and the start
    /// sentinel.
    fn pre_start_hook(&self) -> Option<&dyn PreStartHook> {
        None
    }

    /// Method table the RPC server exposes for this engine.
    fn rpc_methods(&self) -> Box<dyn RpcMethods> {
        Box::new(PrivilegedMethods::default())
    }
}

/// Engine-defined exchange with stage two before the payload starts.
pub trait PreStartHook: Send + Sync {
    /// Runs the engine's own protocol over the master socket.
    ///
    /// # Errors
    ///
    /// Returns an error to abort the launch.
    fn pre_start_process(&self, pid: Pid, master: &mut UnixStream) -> Result<()>;
}

/// A resolved engine: its name, the common payload wrapper, and the
/// implementation.
pub struct Engine {
    name: String,
    common: CommonConfig,
    ops: Box<dyn Operations>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("container_id", &self.common.container_id)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Wraps an initialized implementation.
    #[must_use]
    pub fn new(common: CommonConfig, ops: Box<dyn Operations>) -> Self {
        Self {
            name: common.engine_name.clone(),
            common,
            ops,
        }
    }

    /// Returns the engine name, also used as the RPC service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the container identifier from the payload.
    #[must_use]
    pub const fn container_id(&self) -> &ContainerId {
        &self.common.container_id
    }

    /// Serializes the payload with the engine's current configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let common = CommonConfig {
            engine_config: self.ops.config()?,
            ..self.common.clone()
        };
        Ok(serde_json::to_vec(&common)?)
    }

    /// See [`Operations::prepare_config`].
    ///
    /// # Errors
    ///
    /// Propagates the engine's error.
    pub fn prepare_config(&mut self, config: &mut Config) -> Result<()> {
        self.ops.prepare_config(config)
    }

    /// See [`Operations::create_container`].
    ///
    /// # Errors
    ///
    /// Propagates the engine's error.
    pub fn create_container(&self, pid: Pid, rpc: &mut RpcClient) -> Result<()> {
        tracing::info!(engine = %self.name, %pid, "creating container");
        self.ops.create_container(pid, rpc)
    }

    /// See [`Operations::start_process`].
    ///
    /// # Errors
    ///
    /// Propagates the engine's error.
    pub fn start_process(&self, master: &mut UnixStream) -> Result<Infallible> {
        tracing::info!(engine = %self.name, "starting payload");
        self.ops.start_process(master)
    }

    /// See [`Operations::post_start_process`].
    ///
    /// # Errors
    ///
    /// Propagates the engine's error.
    pub fn post_start_process(&self, pid: Pid) -> Result<()> {
        self.ops.post_start_process(pid)
    }

    /// See [`Operations::monitor_container`].
    ///
    /// # Errors
    ///
    /// Propagates the engine's error.
    pub fn monitor_container(&self, pid: Pid, signals: &Receiver<Signal>) -> Result<WaitStatus> {
        self.ops.monitor_container(pid, signals)
    }

    /// See [`Operations::cleanup_container`].
    ///
    /// # Errors
    ///
    /// Propagates the engine's error.
    pub fn cleanup_container(
        &self,
        fatal: Option<&StagehandError>,
        status: Option<WaitStatus>,
    ) -> Result<()> {
        self.ops.cleanup_container(fatal, status)
    }

    /// See [`Operations::pre_start_hook`].
    #[must_use]
    pub fn pre_start_hook(&self) -> Option<&dyn PreStartHook> {
        self.ops.pre_start_hook()
    }

    /// See [`Operations::rpc_methods`].
    #[must_use]
    pub fn rpc_methods(&self) -> Box<dyn RpcMethods> {
        self.ops.rpc_methods()
    }
}
