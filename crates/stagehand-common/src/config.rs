//! Engine configuration wrapper carried in the shared JSON payload.
//!
//! The payload always has the shape
//! `{ "engineName": ..., "containerID": ..., "engineConfig": ... }`.
//! The orchestrator only interprets the first two fields; `engineConfig` is
//! opaque here and decoded by the selected engine.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StagehandError};
use crate::types::ContainerId;

/// Common wrapper around an engine-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Name of the engine that owns `engine_config`.
    #[serde(rename = "engineName")]
    pub engine_name: String,
    /// Identifier of the container being launched.
    #[serde(rename = "containerID", default)]
    pub container_id: ContainerId,
    /// Engine-defined configuration, decoded by the engine itself.
    #[serde(rename = "engineConfig", default)]
    pub engine_config: serde_json::Value,
}

#[derive(Deserialize)]
struct EngineNameProbe {
    #[serde(rename = "engineName")]
    engine_name: String,
}

/// Reads only the `engineName` field of a payload.
///
/// # Errors
///
/// Returns an error if the payload is not a JSON object or lacks a string
/// `engineName` field.
pub fn probe_engine_name(payload: &[u8]) -> Result<String> {
    let probe: EngineNameProbe = serde_json::from_slice(payload)?;
    if probe.engine_name.is_empty() {
        return Err(StagehandError::Config {
            message: "engineName is empty".into(),
        });
    }
    Ok(probe.engine_name)
}
