//! Privileged RPC between the master and the RPC server.
//!
//! The master asks for privileged operations, the server performs them
//! from inside the container namespaces. The exchange is synchronous with
//! one call in flight, framed as newline-delimited JSON over the
//! pre-established socket:
//!
//! ```text
//! -> {"id":1,"method":"native.Mount","params":{...}}
//! <- {"id":1,"value":null,"error":null,"transportError":null}
//! ```
//!
//! `transportError` reports a malformed request, an unknown service or
//! method, or undecodable parameters. `error` is the method's own failure.

pub mod client;
pub mod methods;
pub mod server;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stagehand_common::error::StagehandError;
use stagehand_core::filesystem::loop_device::LoopInfo;
use stagehand_core::filesystem::pivot_root::ChrootMethod;

/// Method names served under an engine's service name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `mount(2)`.
    Mount,
    /// Switch root with pivot or move.
    Chroot,
    /// Attach an image to a loop device.
    LoopDevice,
    /// `sethostname(2)`.
    SetHostname,
    /// `setfsuid(2)` and `setfsgid(2)`.
    SetFsId,
    /// `mkdir(2)`.
    Mkdir,
    /// `chdir(2)`.
    Chdir,
    /// `symlink(2)`.
    Symlink,
}

impl Method {
    /// Every method, in table order.
    pub const ALL: [Self; 8] = [
        Self::Mount,
        Self::Chroot,
        Self::LoopDevice,
        Self::SetHostname,
        Self::SetFsId,
        Self::Mkdir,
        Self::Chdir,
        Self::Symlink,
    ];

    /// Wire name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "Mount",
            Self::Chroot => "Chroot",
            Self::LoopDevice => "LoopDevice",
            Self::SetHostname => "SetHostname",
            Self::SetFsId => "SetFsID",
            Self::Mkdir => "Mkdir",
            Self::Chdir => "Chdir",
            Self::Symlink => "Symlink",
        }
    }

    /// Returns `<service>.<Method>`.
    #[must_use]
    pub fn qualified(self, service: &str) -> String {
        format!("{service}.{}", self.as_str())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = StagehandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| StagehandError::RpcTransport {
                method: s.to_owned(),
                message: "unknown method".into(),
            })
    }
}

/// A call on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed by the response.
    pub id: u64,
    /// Qualified method name.
    pub method: String,
    /// Method arguments.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A reply on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Id of the request being answered.
    pub id: u64,
    /// Return value, `null` for methods without one.
    #[serde(default)]
    pub value: serde_json::Value,
    /// Application error reported by the method.
    #[serde(default)]
    pub error: Option<String>,
    /// Failure of the exchange itself.
    #[serde(default)]
    pub transport_error: Option<String>,
}

/// Arguments of [`Method::Mount`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountArgs {
    /// Mount source, empty for none.
    pub source: String,
    /// Mount point.
    pub target: PathBuf,
    /// Filesystem type, empty for none.
    #[serde(default)]
    pub fs_type: String,
    /// Raw `MS_*` flags.
    #[serde(default)]
    pub flags: u64,
    /// Filesystem-specific options.
    #[serde(default)]
    pub data: String,
}

/// Arguments of [`Method::Chroot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChrootArgs {
    /// Directory that becomes the new root.
    pub root: PathBuf,
    /// Preferred switching method.
    pub method: ChrootMethod,
}

/// Arguments of [`Method::LoopDevice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopArgs {
    /// Image file to attach.
    pub image: PathBuf,
    /// `open(2)` access mode for the image and the device.
    pub mode: i32,
    /// Offset, size limit, and flags for the device.
    #[serde(default)]
    pub info: LoopInfo,
    /// Number of `/dev/loopN` devices to probe.
    pub max_devices: u32,
    /// Reuse a device already backed by the same image.
    #[serde(default)]
    pub shared: bool,
}

/// Arguments of [`Method::Mkdir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirArgs {
    /// Directory to create.
    pub path: PathBuf,
    /// Permission bits.
    pub perm: u32,
}

/// Arguments of [`Method::SetHostname`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameArgs {
    /// New hostname.
    pub name: String,
}

/// Arguments of [`Method::SetFsId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsIdArgs {
    /// Filesystem UID.
    pub uid: u32,
    /// Filesystem GID.
    pub gid: u32,
}

/// Arguments of [`Method::Chdir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChdirArgs {
    /// New working directory.
    pub path: PathBuf,
}

/// Arguments of [`Method::Symlink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkArgs {
    /// Path the link points to.
    pub target: PathBuf,
    /// Path of the link itself.
    pub link: PathBuf,
}
