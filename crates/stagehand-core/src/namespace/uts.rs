//! UTS namespace hostname control.

use stagehand_common::error::{Result, StagehandError};

/// Maximum hostname length accepted by the kernel (`HOST_NAME_MAX`).
const HOST_NAME_MAX: usize = 64;

/// Sets the hostname of the current UTS namespace.
///
/// # Errors
///
/// Returns an error if the name is empty or too long, or if
/// `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > HOST_NAME_MAX {
        return Err(StagehandError::Config {
            message: format!("invalid hostname {hostname:?}"),
        });
    }
    nix::unistd::sethostname(hostname).map_err(|e| StagehandError::PermissionDenied {
        message: format!("sethostname {hostname:?} failed: {e}"),
    })?;
    tracing::debug!(hostname, "hostname set");
    Ok(())
}
