//! `stage-two` role: become the payload.

use std::os::fd::RawFd;

use anyhow::Context;
use clap::Args;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use stagehand_runtime::stage;

/// Arguments for the `stage-two` role.
#[derive(Args, Debug)]
pub struct StageTwoArgs {
    /// Descriptor of the shared configuration block.
    #[arg(long, env = "STAGEHAND_SHARED_CONFIG_FD")]
    pub shared_config_fd: RawFd,

    /// Stage two end of the master socket.
    #[arg(long, env = "STAGEHAND_MASTER_FD")]
    pub master_fd: RawFd,
}

/// Execs the payload. On failure, reports to the master and exits with a
/// shell-style code.
///
/// # Errors
///
/// Returns an error if the configuration or the engine cannot be loaded.
pub fn execute(args: &StageTwoArgs) -> anyhow::Result<()> {
    let config = super::attach_config(args.shared_config_fd)?;
    let engine = super::load_engine(&config)?;
    config.release()?;

    let mut master = super::adopt_socket(args.master_fd, "master socket")?;
    // Inherited without close-on-exec. The master reads EOF on a successful
    // exec only once the payload no longer holds this end.
    let _ = fcntl(&master, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .context("failed to mark master socket close-on-exec")?;
    let err = stage::stage_two(&engine, &mut master);
    std::process::exit(err.exit_code())
}
