//! Method tables served by the RPC server.

use serde::Serialize;
use serde::de::DeserializeOwned;
use stagehand_common::error::Result;
use stagehand_core::filesystem::loop_device::{self, LoopDevice};
use stagehand_core::filesystem::{mount, pivot_root};
use stagehand_core::namespace::{user, uts};

use super::{
    ChdirArgs, ChrootArgs, FsIdArgs, HostnameArgs, LoopArgs, Method, MkdirArgs, MountArgs,
    SymlinkArgs,
};

/// Privileged operations an engine exposes to its master.
pub trait RpcMethods: Send {
    /// Performs a mount.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn mount(&mut self, args: MountArgs) -> Result<()>;

    /// Makes a directory the new root.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be switched.
    fn chroot(&mut self, args: ChrootArgs) -> Result<()>;

    /// Attaches an image to a loop device and returns the device number.
    ///
    /// # Errors
    ///
    /// Returns an error if no device could be attached.
    fn loop_device(&mut self, args: LoopArgs) -> Result<u32>;

    /// Sets the hostname.
    ///
    /// # Errors
    ///
    /// Returns an error if the hostname is invalid or refused.
    fn set_hostname(&mut self, args: HostnameArgs) -> Result<()>;

    /// Switches the filesystem identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel kept a different identity.
    fn set_fs_id(&mut self, args: FsIdArgs) -> Result<()>;

    /// Creates a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn mkdir(&mut self, args: MkdirArgs) -> Result<()>;

    /// Changes the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be entered.
    fn chdir(&mut self, args: ChdirArgs) -> Result<()>;

    /// Creates a symbolic link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be created.
    fn symlink(&mut self, args: SymlinkArgs) -> Result<()>;
}

/// Standard method table backed by the `stagehand-core` primitives.
///
/// Attached loop devices are held open until the server exits so that
/// auto-clearing devices stay bound while the master mounts them.
#[derive(Debug, Default)]
pub struct PrivilegedMethods {
    loop_devices: Vec<LoopDevice>,
}

impl RpcMethods for PrivilegedMethods {
    fn mount(&mut self, args: MountArgs) -> Result<()> {
        mount::mount(&args.source, &args.target, &args.fs_type, args.flags, &args.data)
    }

    fn chroot(&mut self, args: ChrootArgs) -> Result<()> {
        pivot_root::switch_root(
            &args.root,
            args.method,
            pivot_root::pivot_root,
            pivot_root::move_chroot,
        )
    }

    fn loop_device(&mut self, args: LoopArgs) -> Result<u32> {
        let device = loop_device::attach(
            &args.image,
            args.mode,
            &args.info,
            args.max_devices,
            args.shared,
        )?;
        let index = device.index();
        self.loop_devices.push(device);
        Ok(index)
    }

    fn set_hostname(&mut self, args: HostnameArgs) -> Result<()> {
        uts::set_hostname(&args.name)
    }

    fn set_fs_id(&mut self, args: FsIdArgs) -> Result<()> {
        user::set_fs_id(args.uid, args.gid)
    }

    fn mkdir(&mut self, args: MkdirArgs) -> Result<()> {
        mount::mkdir(&args.path, args.perm)
    }

    fn chdir(&mut self, args: ChdirArgs) -> Result<()> {
        mount::chdir(&args.path)
    }

    fn symlink(&mut self, args: SymlinkArgs) -> Result<()> {
        mount::symlink(&args.target, &args.link)
    }
}

/// Result of one dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    /// The method succeeded.
    Value(serde_json::Value),
    /// The method ran and failed.
    Failed(String),
    /// The call never reached the method.
    Transport(String),
}

fn invoke<A, R, F>(params: serde_json::Value, f: F) -> Reply
where
    A: DeserializeOwned,
    R: Serialize,
    F: FnOnce(A) -> Result<R>,
{
    let args = match serde_json::from_value(params) {
        Ok(args) => args,
        Err(e) => return Reply::Transport(format!("invalid params: {e}")),
    };
    match f(args) {
        Ok(value) => serde_json::to_value(value)
            .map_or_else(|e| Reply::Transport(format!("invalid result: {e}")), Reply::Value),
        Err(e) => Reply::Failed(e.to_string()),
    }
}

/// Decodes `params` for `method` and runs it against `table`.
pub(crate) fn dispatch(
    table: &mut dyn RpcMethods,
    method: Method,
    params: serde_json::Value,
) -> Reply {
    match method {
        Method::Mount => invoke(params, |a| table.mount(a)),
        Method::Chroot => invoke(params, |a| table.chroot(a)),
        Method::LoopDevice => invoke(params, |a| table.loop_device(a)),
        Method::SetHostname => invoke(params, |a| table.set_hostname(a)),
        Method::SetFsId => invoke(params, |a| table.set_fs_id(a)),
        Method::Mkdir => invoke(params, |a| table.mkdir(a)),
        Method::Chdir => invoke(params, |a| table.chdir(a)),
        Method::Symlink => invoke(params, |a| table.symlink(a)),
    }
}
