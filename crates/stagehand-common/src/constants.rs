//! System-wide constants, fixed capacities, and protocol values.

use std::time::Duration;

/// Size in bytes of the mapped shared configuration region.
pub const SHARED_CONFIG_SIZE: usize = 256 * 1024;

/// Maximum length of a path stored in the shared configuration, NUL included.
pub const MAX_PATH_SIZE: usize = 4096;

/// Maximum number of UID (or GID) mapping entries.
pub const MAX_ID_MAPPING: usize = 5;

/// Maximum number of supplementary target GIDs.
pub const MAX_GID: usize = 32;

/// Maximum size of the embedded engine JSON payload.
pub const MAX_JSON_SIZE: usize = 128 * 1024;

/// Byte written by stage two when the payload failed to start.
pub const START_FAILURE_SENTINEL: u8 = b'f';

/// Exit code reserved for orchestrator-level fatal errors.
pub const FATAL_EXIT_CODE: i32 = 255;

/// Delay before notifying the parent that an instance started.
pub const INSTANCE_NOTIFY_DELAY: Duration = Duration::from_millis(100);

/// Default number of loop devices probed by a loop-device attach.
pub const DEFAULT_MAX_LOOP_DEVICES: u32 = 256;

/// Binary name exec'd by the bootstrap for every role.
pub const BIN_NAME: &str = "stagehand-starter";
