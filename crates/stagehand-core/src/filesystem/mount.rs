//! Mount and path utilities for container filesystem setup.

use std::path::Path;

use nix::mount::MsFlags;
use nix::sys::stat::Mode;
use stagehand_common::error::{Result, StagehandError};

/// Performs a `mount(2)` with raw `MS_*` flags.
///
/// Unknown flag bits are dropped. Empty `fs_type` and `data` are passed as
/// null pointers, which is what bind, move, and propagation mounts expect.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn mount(source: &str, target: &Path, fs_type: &str, flags: u64, data: &str) -> Result<()> {
    let ms_flags = MsFlags::from_bits_truncate(flags as libc::c_ulong);
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());
    nix::mount::mount(
        non_empty(source).as_deref(),
        target,
        non_empty(fs_type).as_deref(),
        ms_flags,
        non_empty(data).as_deref(),
    )
    .map_err(|e| StagehandError::PermissionDenied {
        message: format!("mount {source:?} on {} failed: {e}", target.display()),
    })?;
    tracing::debug!(source, target = %target.display(), fs_type, flags, "mounted");
    Ok(())
}

/// Creates a directory with the given permission bits.
///
/// An already existing directory is not an error.
///
/// # Errors
///
/// Returns an error if `mkdir(2)` fails for any other reason.
pub fn mkdir(path: &Path, perm: u32) -> Result<()> {
    match nix::unistd::mkdir(path, Mode::from_bits_truncate(perm as libc::mode_t)) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), perm, "directory created");
            Ok(())
        }
        Err(nix::errno::Errno::EEXIST) if path.is_dir() => Ok(()),
        Err(e) => Err(StagehandError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        }),
    }
}

/// Creates a symbolic link at `link` pointing to `target`.
///
/// # Errors
///
/// Returns an error if `symlink(2)` fails.
pub fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| StagehandError::Io {
        path: link.to_path_buf(),
        source: e,
    })
}

/// Changes the current working directory.
///
/// # Errors
///
/// Returns an error if `chdir(2)` fails.
pub fn chdir(path: &Path) -> Result<()> {
    nix::unistd::chdir(path).map_err(|e| StagehandError::Io {
        path: path.to_path_buf(),
        source: e.into(),
    })
}
