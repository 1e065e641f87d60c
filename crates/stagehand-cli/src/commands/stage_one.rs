//! `stage-one` role: prepare the shared configuration.

use std::os::fd::RawFd;

use anyhow::Context;
use clap::Args;
use stagehand_runtime::engine::EngineRegistry;
use stagehand_runtime::stage;

/// Arguments for the `stage-one` role.
#[derive(Args, Debug)]
pub struct StageOneArgs {
    /// Descriptor of the shared configuration block.
    #[arg(long, env = "STAGEHAND_SHARED_CONFIG_FD")]
    pub shared_config_fd: RawFd,
}

/// Runs stage one and releases the shared configuration.
///
/// # Errors
///
/// Returns an error if the engine rejects the configuration.
pub fn execute(args: &StageOneArgs) -> anyhow::Result<()> {
    let mut config = super::attach_config(args.shared_config_fd)?;
    let registry = EngineRegistry::builtin()?;
    let engine = stage::stage_one(&registry, &mut config).context("stage one failed")?;
    config.release()?;
    tracing::info!(engine = %engine.name(), "shared configuration prepared");
    Ok(())
}
