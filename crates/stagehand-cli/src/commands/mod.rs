//! Role definitions and dispatch.

pub mod master;
pub mod rpc_server;
pub mod stage_one;
pub mod stage_two;

use std::fs::File;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use stagehand_common::constants::BIN_NAME;
use stagehand_core::shared::Config;
use stagehand_runtime::engine::{Engine, EngineRegistry};

/// Stagehand starter: one role of a container launch per invocation.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Role to run.
    #[command(subcommand)]
    pub command: Command,

    /// Log output format. Verbosity is controlled by `RUST_LOG`.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available roles.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Prepare the shared configuration with the original privileges.
    StageOne(stage_one::StageOneArgs),
    /// Exec the payload inside the container namespaces.
    StageTwo(stage_two::StageTwoArgs),
    /// Supervise the container until it terminates.
    Master(master::MasterArgs),
    /// Serve privileged operations for the master.
    RpcServer(rpc_server::RpcServerArgs),
}

/// Dispatches the parsed role to its handler.
///
/// # Errors
///
/// Returns an error if the role fails before it can exit on its own terms.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::StageOne(args) => stage_one::execute(&args),
        Command::StageTwo(args) => stage_two::execute(&args),
        Command::Master(args) => master::execute(&args),
        Command::RpcServer(args) => rpc_server::execute(&args),
    }
}

/// Takes ownership of a descriptor inherited from the bootstrap.
fn adopt_fd(fd: RawFd, what: &str) -> anyhow::Result<OwnedFd> {
    if fd < 0 {
        anyhow::bail!("invalid {what} descriptor {fd}");
    }
    #[allow(unsafe_code)]
    // SAFETY: the descriptor was handed to this process by the bootstrap
    // for this role only; nothing else in the process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(owned)
}

/// Maps the shared configuration block behind `fd`.
fn attach_config(fd: RawFd) -> anyhow::Result<Config> {
    let file = File::from(adopt_fd(fd, "shared configuration")?);
    Config::attach(&file).context("failed to attach shared configuration")
}

/// Wraps an inherited socket descriptor.
fn adopt_socket(fd: RawFd, what: &str) -> anyhow::Result<UnixStream> {
    Ok(UnixStream::from(adopt_fd(fd, what)?))
}

/// Builds the engine named by the shared configuration.
fn load_engine(config: &Config) -> anyhow::Result<Engine> {
    let registry = EngineRegistry::builtin()?;
    Ok(registry.new_engine(config.json())?)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn master_role_parses() {
        let cli = Cli::try_parse_from([
            BIN_NAME,
            "--log-format",
            "json",
            "master",
            "--shared-config-fd",
            "3",
            "--master-fd",
            "4",
            "--rpc-fd",
            "5",
            "--container-pid",
            "1234",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Master(args) if args.container_pid == 1234));
    }

    #[test]
    fn negative_descriptor_is_rejected() {
        assert!(adopt_fd(-1, "test").is_err());
    }
}
