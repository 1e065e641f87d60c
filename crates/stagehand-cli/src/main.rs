//! # stagehand-starter
//!
//! Role dispatcher exec'd by the native bootstrap. Each invocation runs
//! exactly one role of a container launch with the file descriptors the
//! bootstrap prepared.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;

use std::process::ExitCode;

use clap::Parser;
use stagehand_common::constants::FATAL_EXIT_CODE;

use crate::commands::{Cli, LogFormat};

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match commands::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "stagehand-starter failed");
            ExitCode::from(u8::try_from(FATAL_EXIT_CODE).unwrap_or(u8::MAX))
        }
    }
}
