//! Root filesystem switching.
//!
//! `pivot_root(2)` is preferred because it changes the root mount of the
//! whole mount namespace and lets the old root be detached. Some roots
//! cannot be pivoted (for example an initramfs root), so a move mount
//! followed by `chroot(2)` is kept as a fallback.

use std::fmt;
use std::path::Path;

use nix::mount::{MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use stagehand_common::error::{Result, StagehandError};

/// Strategy used to make a directory the new root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChrootMethod {
    /// `pivot_root(2)` and detach the old root.
    Pivot,
    /// Move-mount the new root over `/`, then `chroot(2)`.
    Move,
}

impl fmt::Display for ChrootMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pivot => f.write_str("pivot"),
            Self::Move => f.write_str("move"),
        }
    }
}

fn denied(op: &str, root: &Path, e: nix::errno::Errno) -> StagehandError {
    StagehandError::PermissionDenied {
        message: format!("{op} into {} failed: {e}", root.display()),
    }
}

/// Makes `new_root` the root of the mount namespace with `pivot_root(2)`.
///
/// The new root is bind-mounted onto itself first so it is guaranteed to
/// be a mount point. The old root is stacked under the new one by
/// `pivot_root(".", ".")` and detached right away.
///
/// # Errors
///
/// Returns an error if any of the mount, pivot, or chroot steps fail.
pub fn pivot_root(new_root: &Path) -> Result<()> {
    tracing::info!(new_root = %new_root.display(), "performing pivot_root");

    nix::mount::mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| denied("bind mount", new_root, e))?;
    nix::unistd::chdir(new_root).map_err(|e| denied("chdir", new_root, e))?;
    nix::unistd::pivot_root(".", ".").map_err(|e| denied("pivot_root", new_root, e))?;
    nix::mount::umount2(".", MntFlags::MNT_DETACH)
        .map_err(|e| denied("detach old root", new_root, e))?;
    nix::unistd::chroot(".").map_err(|e| denied("chroot", new_root, e))?;
    nix::unistd::chdir("/").map_err(|e| denied("chdir", new_root, e))?;
    Ok(())
}

/// Moves the mount at `new_root` over `/` and chroots into it.
///
/// # Errors
///
/// Returns an error if the move mount or `chroot(2)` fails.
pub fn move_chroot(new_root: &Path) -> Result<()> {
    tracing::info!(new_root = %new_root.display(), "performing move and chroot");

    nix::unistd::chdir(new_root).map_err(|e| denied("chdir", new_root, e))?;
    nix::mount::mount(
        Some("."),
        "/",
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| denied("move mount", new_root, e))?;
    nix::unistd::chroot(".").map_err(|e| denied("chroot", new_root, e))?;
    nix::unistd::chdir("/").map_err(|e| denied("chdir", new_root, e))?;
    Ok(())
}

/// Switches root with the requested method.
///
/// With [`ChrootMethod::Pivot`], a failed pivot is logged at debug level
/// and the move method is attempted; its result is what the caller sees.
/// The strategies are parameters so callers and tests can substitute them.
///
/// # Errors
///
/// Returns the error of the last method attempted.
pub fn switch_root<P, M>(new_root: &Path, method: ChrootMethod, pivot: P, move_root: M) -> Result<()>
where
    P: FnOnce(&Path) -> Result<()>,
    M: FnOnce(&Path) -> Result<()>,
{
    if method == ChrootMethod::Pivot {
        match pivot(new_root) {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "pivot_root failed, falling back to move");
            }
        }
    }
    move_root(new_root)
}
