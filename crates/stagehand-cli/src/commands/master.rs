//! `master` role: supervise the container.

use std::os::fd::RawFd;

use clap::Args;
use nix::unistd::Pid;
use stagehand_runtime::master::{InstanceParent, Master};

/// Arguments for the `master` role.
#[derive(Args, Debug)]
pub struct MasterArgs {
    /// Descriptor of the shared configuration block.
    #[arg(long, env = "STAGEHAND_SHARED_CONFIG_FD")]
    pub shared_config_fd: RawFd,

    /// Master end of the master socket.
    #[arg(long, env = "STAGEHAND_MASTER_FD")]
    pub master_fd: RawFd,

    /// Client end of the RPC socket.
    #[arg(long, env = "STAGEHAND_RPC_FD")]
    pub rpc_fd: RawFd,

    /// PID of the container process, a child of this process.
    #[arg(long, env = "STAGEHAND_CONTAINER_PID", value_parser = clap::value_parser!(i32).range(1..))]
    pub container_pid: i32,
}

/// Supervises the container and exits the way it did.
///
/// # Errors
///
/// Returns an error if setup fails before supervision starts.
pub fn execute(args: &MasterArgs) -> anyhow::Result<()> {
    let config = super::attach_config(args.shared_config_fd)?;
    let engine = super::load_engine(&config)?;
    let instance = config.is_instance();
    config.release()?;

    let master_socket = super::adopt_socket(args.master_fd, "master socket")?;
    let rpc_socket = super::adopt_socket(args.rpc_fd, "rpc socket")?;
    let mut master = Master::new(
        engine,
        Pid::from_raw(args.container_pid),
        master_socket,
        rpc_socket,
    );
    if instance {
        master = master.instance(InstanceParent::current());
    }
    master.run()?.exit()
}
