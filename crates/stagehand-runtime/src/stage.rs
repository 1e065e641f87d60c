//! Stage one and stage two.
//!
//! Stage one runs with the original privileges and fills in the shared
//! configuration. Stage two runs inside the container namespaces after
//! privileges were dropped and turns into the payload.

use std::io::Write;
use std::os::unix::net::UnixStream;

use stagehand_common::constants::START_FAILURE_SENTINEL;
use stagehand_common::error::{Result, StagehandError};
use stagehand_core::shared::Config;

use crate::engine::{Engine, EngineRegistry};

/// Builds the engine from the payload, lets it prepare the shared
/// configuration, and writes its possibly updated configuration back.
///
/// # Errors
///
/// Returns any error before the launch creates a container resource:
/// unknown engine, invalid configuration, or a capacity overflow.
pub fn stage_one(registry: &EngineRegistry, config: &mut Config) -> Result<Engine> {
    let mut engine = registry.new_engine(config.json())?;
    tracing::info!(engine = %engine.name(), container = %engine.container_id(), "stage one");
    engine.prepare_config(config)?;
    let json = engine.to_json()?;
    config.set_json(&json)?;
    config.commit()?;
    Ok(engine)
}

/// Starts the payload. Returns only if it could not be started, after
/// telling the master with the failure sentinel.
///
/// The caller exits with [`StagehandError::exit_code`] of the result.
pub fn stage_two(engine: &Engine, master: &mut UnixStream) -> StagehandError {
    let err = match engine.start_process(master) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    tracing::error!(error = %err, "payload failed to start");
    if let Err(e) = master.write_all(&[START_FAILURE_SENTINEL]) {
        tracing::warn!(error = %e, "could not report start failure to master");
    }
    err
}
