//! Typed RPC client used by the master.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::mount::MsFlags;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stagehand_common::error::{Result, StagehandError};
use stagehand_core::filesystem::loop_device::LoopInfo;
use stagehand_core::filesystem::pivot_root::ChrootMethod;

use super::{
    ChdirArgs, ChrootArgs, FsIdArgs, HostnameArgs, LoopArgs, Method, MkdirArgs, MountArgs,
    Request, Response, SymlinkArgs,
};

/// Client end of the RPC connection.
///
/// Calls are synchronous; one request is in flight at a time.
#[derive(Debug)]
pub struct RpcClient {
    service: String,
    reader: BufReader<UnixStream>,
    next_id: u64,
}

impl RpcClient {
    /// Wraps a connected socket, addressing methods under `service`.
    #[must_use]
    pub fn new(service: impl Into<String>, stream: UnixStream) -> Self {
        Self {
            service: service.into(),
            reader: BufReader::new(stream),
            next_id: 1,
        }
    }

    /// Sends one call and decodes its return value.
    ///
    /// # Errors
    ///
    /// Returns [`StagehandError::RpcTransport`] if the exchange fails or
    /// the response is for another request, and
    /// [`StagehandError::RpcCall`] if the method reported an error.
    pub fn call<P, R>(&mut self, method: Method, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let qualified = method.qualified(&self.service);
        let transport = |message: String| StagehandError::RpcTransport {
            method: qualified.clone(),
            message,
        };

        let id = self.next_id;
        self.next_id += 1;
        let request = Request {
            id,
            method: qualified.clone(),
            params: serde_json::to_value(params)?,
        };
        let mut payload = serde_json::to_string(&request)?;
        payload.push('\n');
        self.reader
            .get_mut()
            .write_all(payload.as_bytes())
            .map_err(|e| transport(format!("send failed: {e}")))?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| transport(format!("receive failed: {e}")))?;
        if read == 0 {
            return Err(transport("connection closed by server".into()));
        }
        let response: Response = serde_json::from_str(&line)
            .map_err(|e| transport(format!("malformed response: {e}")))?;

        if let Some(message) = response.transport_error {
            return Err(transport(message));
        }
        if let Some(message) = response.error {
            return Err(StagehandError::RpcCall {
                method: qualified.clone(),
                message,
            });
        }
        if response.id != id {
            return Err(transport(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        serde_json::from_value(response.value)
            .map_err(|e| transport(format!("unexpected return value: {e}")))
    }

    /// Mounts `source` on `target`.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub fn mount(
        &mut self,
        source: &str,
        target: &Path,
        fs_type: &str,
        flags: MsFlags,
        data: &str,
    ) -> Result<()> {
        let args = MountArgs {
            source: source.to_owned(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_owned(),
            flags: u64::from(flags.bits()),
            data: data.to_owned(),
        };
        self.call(Method::Mount, &args)
    }

    /// Switches the container root to `root`.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub fn chroot(&mut self, root: &Path, method: ChrootMethod) -> Result<()> {
        let args = ChrootArgs {
            root: root.to_path_buf(),
            method,
        };
        self.call(Method::Chroot, &args)
    }

    /// Attaches `image` to a loop device and returns its number.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub fn loop_device(
        &mut self,
        image: &Path,
        mode: i32,
        info: LoopInfo,
        max_devices: u32,
        shared: bool,
    ) -> Result<u32> {
        let args = LoopArgs {
            image: image.to_path_buf(),
            mode,
            info,
            max_devices,
            shared,
        };
        self.call(Method::LoopDevice, &args)
    }

    /// Sets the container hostname.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub fn set_hostname(&mut self, name: &str) -> Result<()> {
        self.call(
            Method::SetHostname,
            &HostnameArgs {
                name: name.to_owned(),
            },
        )
    }

    /// Switches the server's filesystem identity.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub fn set_fs_id(&mut self, uid: u32, gid: u32) -> Result<()> {
        self.call(Method::SetFsId, &FsIdArgs { uid, gid })
    }

    /// Creates a directory.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub fn mkdir(&mut self, path: &Path, perm: u32) -> Result<()> {
        let args = MkdirArgs {
            path: path.to_path_buf(),
            perm,
        };
        self.call(Method::Mkdir, &args)
    }

    /// Changes the server's working directory.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub fn chdir(&mut self, path: &Path) -> Result<()> {
        self.call(
            Method::Chdir,
            &ChdirArgs {
                path: path.to_path_buf(),
            },
        )
    }

    /// Creates a symbolic link at `link` pointing to `target`.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        let args = SymlinkArgs {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        };
        self.call(Method::Symlink, &args)
    }
}
