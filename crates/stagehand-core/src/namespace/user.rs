//! User namespace ID mappings and filesystem identity.

use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::IdMapping;

/// Renders mappings in the `/proc/<pid>/uid_map` text format.
///
/// Each entry becomes one `container host size` line.
#[must_use]
pub fn render_id_map(mappings: &[IdMapping]) -> String {
    mappings.iter().map(|m| format!("{m}\n")).collect()
}

/// Checks that a mapping is usable by the kernel.
///
/// # Errors
///
/// Returns an error for an empty range or one that wraps around `u32`.
pub fn validate_mapping(mapping: &IdMapping) -> Result<()> {
    let fits = |start: u32| start.checked_add(mapping.size).is_some();
    if mapping.size == 0 || !fits(mapping.container_id) || !fits(mapping.host_id) {
        return Err(StagehandError::Config {
            message: format!("invalid ID mapping {mapping}"),
        });
    }
    Ok(())
}

/// Switches the filesystem UID and GID used for permission checks.
///
/// `setfsuid(2)` never reports failure directly, so the call is repeated
/// with an invalid ID to read back the value that is now in effect.
///
/// # Errors
///
/// Returns an error if the kernel kept a different ID.
pub fn set_fs_id(uid: u32, gid: u32) -> Result<()> {
    use nix::unistd::{Gid, Uid, setfsgid, setfsuid};

    let _ = setfsgid(Gid::from_raw(gid));
    let current_gid = setfsgid(Gid::from_raw(u32::MAX));
    let _ = setfsuid(Uid::from_raw(uid));
    let current_uid = setfsuid(Uid::from_raw(u32::MAX));

    if current_uid.as_raw() != uid || current_gid.as_raw() != gid {
        return Err(StagehandError::PermissionDenied {
            message: format!(
                "setfsuid/setfsgid to {uid}/{gid} left {}/{}",
                current_uid.as_raw(),
                current_gid.as_raw()
            ),
        });
    }
    tracing::debug!(uid, gid, "filesystem identity set");
    Ok(())
}
