//! Mount namespace propagation settings.
//!
//! Engines name a propagation mode (`rprivate`, `slave`, ...); the shared
//! configuration stores the matching `MS_*` bits for the bootstrap to apply
//! to `/` once the mount namespace exists.

use nix::mount::MsFlags;
use stagehand_common::error::{Result, StagehandError};

/// Parses a propagation mode into mount flags.
///
/// An `r` prefix adds `MS_REC`. An empty string means "leave propagation
/// untouched" and yields empty flags.
///
/// # Errors
///
/// Returns a configuration error for an unknown mode.
pub fn propagation_flags(mode: &str) -> Result<MsFlags> {
    let mode = mode.trim();
    if mode.is_empty() {
        return Ok(MsFlags::empty());
    }
    let (recursive, base) = mode
        .strip_prefix('r')
        .map_or((false, mode), |rest| (true, rest));
    let flag = match base {
        "shared" => MsFlags::MS_SHARED,
        "slave" => MsFlags::MS_SLAVE,
        "private" => MsFlags::MS_PRIVATE,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        _ => {
            return Err(StagehandError::Config {
                message: format!("unknown mount propagation {mode:?}"),
            });
        }
    };
    Ok(if recursive { flag | MsFlags::MS_REC } else { flag })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_prefix_adds_ms_rec() {
        assert_eq!(
            propagation_flags("rprivate").unwrap(),
            MsFlags::MS_PRIVATE | MsFlags::MS_REC
        );
        assert_eq!(
            propagation_flags("rslave").unwrap(),
            MsFlags::MS_SLAVE | MsFlags::MS_REC
        );
    }

    #[test]
    fn plain_modes() {
        assert_eq!(propagation_flags("private").unwrap(), MsFlags::MS_PRIVATE);
        assert_eq!(propagation_flags("shared").unwrap(), MsFlags::MS_SHARED);
        assert_eq!(propagation_flags("").unwrap(), MsFlags::empty());
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!(propagation_flags("rsideways").is_err());
        assert!(propagation_flags("public").is_err());
    }
}
