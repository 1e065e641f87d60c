//! `rpc-server` role: serve privileged operations for the master.

use std::os::fd::RawFd;

use clap::Args;
use stagehand_runtime::rpc::server::RpcServer;

/// Arguments for the `rpc-server` role.
#[derive(Args, Debug)]
pub struct RpcServerArgs {
    /// Descriptor of the shared configuration block.
    #[arg(long, env = "STAGEHAND_SHARED_CONFIG_FD")]
    pub shared_config_fd: RawFd,

    /// Server end of the RPC socket.
    #[arg(long, env = "STAGEHAND_RPC_FD")]
    pub rpc_fd: RawFd,
}

/// Serves the engine's method table until the master hangs up.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the
/// connection fails.
pub fn execute(args: &RpcServerArgs) -> anyhow::Result<()> {
    let config = super::attach_config(args.shared_config_fd)?;
    let engine = super::load_engine(&config)?;
    config.release()?;

    let stream = super::adopt_socket(args.rpc_fd, "rpc socket")?;
    let mut server = RpcServer::new(engine.name(), engine.rpc_methods());
    server.serve(&stream)?;
    Ok(())
}
