//! Built-in engine running a command from a root filesystem.
//!
//! The root filesystem is either a directory or a filesystem image that is
//! attached to a loop device and mounted over the directory.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use stagehand_common::constants::DEFAULT_MAX_LOOP_DEVICES;
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::{IdMapping, WaitStatus};
use stagehand_core::capability::CapabilitySet;
use stagehand_core::filesystem::loop_device::{
    self, LO_FLAGS_AUTOCLEAR, LO_FLAGS_READ_ONLY, LoopInfo,
};
use stagehand_core::filesystem::mount;
use stagehand_core::filesystem::pivot_root::ChrootMethod;
use stagehand_core::namespace::{self, NamespaceKind};
use stagehand_core::shared::Config;

use super::Operations;
use crate::rpc::client::RpcClient;

/// Name the engine is registered under.
pub const ENGINE_NAME: &str = "native";

fn default_image_fs() -> String {
    "squashfs".into()
}

/// Filesystem image mounted as the root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Image file on the host.
    pub path: PathBuf,
    /// Filesystem type inside the image.
    #[serde(default = "default_image_fs")]
    pub fs_type: String,
    /// Byte offset of the filesystem inside the image.
    #[serde(default)]
    pub offset: u64,
    /// Size limit of the filesystem, zero for "to end of file".
    #[serde(default)]
    pub size_limit: u64,
    /// Mount read-write instead of read-only.
    #[serde(default)]
    pub writable: bool,
}

/// Additional mount performed inside the container root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MountConfig {
    /// Mount source.
    pub source: String,
    /// Mount point, relative to the container root.
    pub destination: PathBuf,
    /// Filesystem type, empty for bind mounts.
    pub fs_type: String,
    /// Options such as `ro`, `nosuid`, or `rbind`.
    pub options: Vec<String>,
    /// Filesystem-specific data.
    pub data: String,
}

/// Capability names per set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Permitted set.
    pub permitted: Vec<String>,
    /// Effective set.
    pub effective: Vec<String>,
    /// Inheritable set.
    pub inheritable: Vec<String>,
    /// Bounding set.
    pub bounding: Vec<String>,
    /// Ambient set.
    pub ambient: Vec<String>,
}

impl CapabilityConfig {
    /// Names configured for `set`.
    #[must_use]
    pub fn names(&self, set: CapabilitySet) -> &[String] {
        match set {
            CapabilitySet::Permitted => &self.permitted,
            CapabilitySet::Effective => &self.effective,
            CapabilitySet::Inheritable => &self.inheritable,
            CapabilitySet::Bounding => &self.bounding,
            CapabilitySet::Ambient => &self.ambient,
        }
    }
}

/// Configuration of the native engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NativeConfig {
    /// Root filesystem directory.
    pub rootfs: PathBuf,
    /// Image mounted over `rootfs`, if any.
    pub image: Option<ImageConfig>,
    /// Payload command line.
    pub args: Vec<String>,
    /// Payload environment as `KEY=value` entries.
    pub env: Vec<String>,
    /// Working directory of the payload, `/` when unset.
    pub cwd: Option<PathBuf>,
    /// Hostname set when a UTS namespace is created.
    pub hostname: Option<String>,
    /// Namespaces to create, by name.
    pub namespaces: Vec<String>,
    /// Existing namespaces to join, by name.
    pub join_namespaces: BTreeMap<String, String>,
    /// UID mapping for a new user namespace.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mapping for a new user namespace.
    pub gid_mappings: Vec<IdMapping>,
    /// Capabilities kept by the payload.
    pub capabilities: CapabilityConfig,
    /// UID of the payload, the caller's when unset.
    pub uid: Option<u32>,
    /// GIDs of the payload, the caller's primary GID when empty.
    pub gids: Vec<u32>,
    /// Set `PR_SET_NO_NEW_PRIVS`.
    pub no_new_privs: bool,
    /// Propagation of `/`, `rprivate` when a mount namespace is created.
    pub mount_propagation: Option<String>,
    /// Run as a backgrounded instance.
    pub instance: bool,
    /// Extra mounts inside the container root.
    pub mounts: Vec<MountConfig>,
}

/// Translates mount option names into flags.
///
/// # Errors
///
/// Returns an error for an unknown option.
pub fn mount_flags<S: AsRef<str>>(options: &[S]) -> Result<MsFlags> {
    options.iter().try_fold(MsFlags::empty(), |flags, option| {
        let flag = match option.as_ref() {
            "rw" | "defaults" => MsFlags::empty(),
            "ro" => MsFlags::MS_RDONLY,
            "nosuid" => MsFlags::MS_NOSUID,
            "nodev" => MsFlags::MS_NODEV,
            "noexec" => MsFlags::MS_NOEXEC,
            "noatime" => MsFlags::MS_NOATIME,
            "relatime" => MsFlags::MS_RELATIME,
            "bind" => MsFlags::MS_BIND,
            "rbind" => MsFlags::MS_BIND | MsFlags::MS_REC,
            other => {
                return Err(StagehandError::Config {
                    message: format!("unknown mount option {other:?}"),
                });
            }
        };
        Ok(flags | flag)
    })
}

fn container_path(rootfs: &Path, path: &Path) -> PathBuf {
    rootfs.join(path.strip_prefix("/").unwrap_or(path))
}

fn to_cstrings(field: &str, values: &[String]) -> Result<Vec<CString>> {
    values
        .iter()
        .map(|v| {
            CString::new(v.as_str()).map_err(|_| StagehandError::Config {
                message: format!("{field} entry {v:?} contains a NUL byte"),
            })
        })
        .collect()
}

/// The native engine.
#[derive(Debug, Default)]
pub struct NativeEngine {
    config: NativeConfig,
}

impl NativeEngine {
    /// Constructor used by the registry.
    pub fn boxed() -> Box<dyn Operations> {
        Box::new(Self::default())
    }

    /// Current configuration.
    #[must_use]
    pub const fn native_config(&self) -> &NativeConfig {
        &self.config
    }

    fn clone_flags(&self) -> Result<CloneFlags> {
        namespace::clone_flags_from_names(&self.config.namespaces)
    }

    fn mount_image(&self, image: &ImageConfig, rpc: &mut RpcClient) -> Result<()> {
        let (mode, lo_flags) = if image.writable {
            (libc::O_RDWR, LO_FLAGS_AUTOCLEAR)
        } else {
            (libc::O_RDONLY, LO_FLAGS_AUTOCLEAR | LO_FLAGS_READ_ONLY)
        };
        let info = LoopInfo {
            offset: image.offset,
            size_limit: image.size_limit,
            flags: lo_flags,
        };
        let index = rpc.loop_device(
            &image.path,
            mode,
            info,
            DEFAULT_MAX_LOOP_DEVICES,
            !image.writable,
        )?;
        let device = loop_device::device_path(index);
        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if !image.writable {
            flags |= MsFlags::MS_RDONLY;
        }
        rpc.mount(
            &device.to_string_lossy(),
            &self.config.rootfs,
            &image.fs_type,
            flags,
            "",
        )
    }

    fn mount_extra(&self, mount: &MountConfig, rpc: &mut RpcClient) -> Result<()> {
        let target = container_path(&self.config.rootfs, &mount.destination);
        let flags = mount_flags(&mount.options)?;
        rpc.mkdir(&target, 0o755)?;
        rpc.mount(&mount.source, &target, &mount.fs_type, flags, &mount.data)?;
        if flags.contains(MsFlags::MS_BIND) && flags.contains(MsFlags::MS_RDONLY) {
            rpc.mount("", &target, "", flags | MsFlags::MS_REMOUNT, "")?;
        }
        Ok(())
    }
}

impl Operations for NativeEngine {
    fn init_config(&mut self, config: serde_json::Value) -> Result<()> {
        self.config = if config.is_null() {
            NativeConfig::default()
        } else {
            serde_json::from_value(config)?
        };
        Ok(())
    }

    fn config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn prepare_config(&mut self, config: &mut Config) -> Result<()> {
        if self.config.args.is_empty() {
            return Err(StagehandError::Config {
                message: "no command to run".into(),
            });
        }
        if self.config.rootfs.as_os_str().is_empty() {
            return Err(StagehandError::Config {
                message: "no root filesystem given".into(),
            });
        }
        if self.config.rootfs.is_relative() {
            self.config.rootfs =
                std::path::absolute(&self.config.rootfs).map_err(|e| StagehandError::Io {
                    path: self.config.rootfs.clone(),
                    source: e,
                })?;
        }

        let flags = self.clone_flags()?;
        config.set_namespace_flags(flags);
        for (name, path) in &self.config.join_namespaces {
            config.set_namespace_path(name.parse::<NamespaceKind>()?, path)?;
        }
        config.add_uid_mappings(&self.config.uid_mappings)?;
        config.add_gid_mappings(&self.config.gid_mappings)?;
        for set in CapabilitySet::ALL {
            config.set_capabilities(set, self.config.capabilities.names(set))?;
        }

        config.set_target_uid(
            self.config
                .uid
                .unwrap_or_else(|| nix::unistd::getuid().as_raw()),
        );
        if self.config.gids.is_empty() {
            config.set_target_gids(&[nix::unistd::getgid().as_raw()])?;
        } else {
            config.set_target_gids(&self.config.gids)?;
        }

        match self.config.mount_propagation.as_deref() {
            Some(mode) => config.set_mount_propagation(mode)?,
            None if flags.contains(CloneFlags::CLONE_NEWNS) => {
                config.set_mount_propagation("rprivate")?;
            }
            None => {}
        }
        config.set_no_new_privs(self.config.no_new_privs);
        config.set_instance(self.config.instance);
        config.set_loopback(flags.contains(CloneFlags::CLONE_NEWNET));

        tracing::debug!(
            rootfs = %self.config.rootfs.display(),
            namespaces = ?namespace::kinds_in_flags(flags),
            "native configuration prepared"
        );
        Ok(())
    }

    fn create_container(&self, pid: Pid, rpc: &mut RpcClient) -> Result<()> {
        let flags = self.clone_flags()?;
        let rootfs = &self.config.rootfs;

        if let Some(image) = &self.config.image {
            self.mount_image(image, rpc)?;
        }
        for mount in &self.config.mounts {
            self.mount_extra(mount, rpc)?;
        }
        if flags.contains(CloneFlags::CLONE_NEWPID) {
            let proc = rootfs.join("proc");
            rpc.mkdir(&proc, 0o555)?;
            rpc.mount(
                "proc",
                &proc,
                "proc",
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                "",
            )?;
        }
        if flags.contains(CloneFlags::CLONE_NEWUTS) {
            if let Some(hostname) = &self.config.hostname {
                rpc.set_hostname(hostname)?;
            }
        }
        rpc.chroot(rootfs, ChrootMethod::Pivot)?;
        tracing::info!(%pid, rootfs = %rootfs.display(), "container environment ready");
        Ok(())
    }

    fn start_process(&self, _master: &mut UnixStream) -> Result<Infallible> {
        let cwd = self.config.cwd.as_deref().unwrap_or_else(|| Path::new("/"));
        mount::chdir(cwd)?;
        let args = to_cstrings("args", &self.config.args)?;
        let env = to_cstrings("env", &self.config.env)?;
        let Some(program) = args.first() else {
            return Err(StagehandError::Config {
                message: "no command to run".into(),
            });
        };
        let errno = match nix::unistd::execvpe(program, &args, &env) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        Err(StagehandError::Exec {
            program: program.to_string_lossy().into_owned(),
            source: errno.into(),
        })
    }

    fn post_start_process(&self, pid: Pid) -> Result<()> {
        tracing::info!(%pid, command = ?self.config.args, "payload running");
        Ok(())
    }

    fn cleanup_container(
        &self,
        fatal: Option<&StagehandError>,
        status: Option<WaitStatus>,
    ) -> Result<()> {
        match (fatal, status) {
            (Some(e), _) => tracing::warn!(error = %e, "native container torn down after failure"),
            (None, Some(status)) if status.success() => {
                tracing::info!(%status, "native container finished");
            }
            (None, Some(status)) => tracing::warn!(%status, "native container exited abnormally"),
            (None, None) => tracing::info!("native container finished"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use stagehand_core::capability::Capability;

    use super::*;
    use crate::rpc::methods::RpcMethods;
    use crate::rpc::server::RpcServer;
    use crate::rpc::{
        ChdirArgs, ChrootArgs, FsIdArgs, HostnameArgs, LoopArgs, MkdirArgs, MountArgs, SymlinkArgs,
    };

    fn engine(config: serde_json::Value) -> NativeEngine {
        let mut engine = NativeEngine::default();
        engine.init_config(config).unwrap();
        engine
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl RpcMethods for Recorder {
        fn mount(&mut self, a: MountArgs) -> Result<()> {
            self.push(format!("mount {} {} {}", a.source, a.target.display(), a.fs_type));
            Ok(())
        }
        fn chroot(&mut self, a: ChrootArgs) -> Result<()> {
            self.push(format!("chroot {} {}", a.root.display(), a.method));
            Ok(())
        }
        fn loop_device(&mut self, a: LoopArgs) -> Result<u32> {
            self.push(format!("loop {} shared={}", a.image.display(), a.shared));
            Ok(3)
        }
        fn set_hostname(&mut self, a: HostnameArgs) -> Result<()> {
            self.push(format!("hostname {}", a.name));
            Ok(())
        }
        fn set_fs_id(&mut self, _: FsIdArgs) -> Result<()> {
            Ok(())
        }
        fn mkdir(&mut self, a: MkdirArgs) -> Result<()> {
            self.push(format!("mkdir {}", a.path.display()));
            Ok(())
        }
        fn chdir(&mut self, _: ChdirArgs) -> Result<()> {
            Ok(())
        }
        fn symlink(&mut self, _: SymlinkArgs) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn prepare_requires_command_and_rootfs() {
        let mut cfg = Config::create(b"{}").unwrap();
        let err = engine(serde_json::json!({"rootfs": "/r"}))
            .prepare_config(&mut cfg)
            .unwrap_err();
        assert!(err.to_string().contains("no command"));
        let err = engine(serde_json::json!({"args": ["sh"]}))
            .prepare_config(&mut cfg)
            .unwrap_err();
        assert!(err.to_string().contains("root filesystem"));
    }

    #[test]
    fn prepare_writes_shared_configuration() {
        let mut cfg = Config::create(b"{}").unwrap();
        let mut native = engine(serde_json::json!({
            "rootfs": "relative/rootfs",
            "args": ["/bin/sh"],
            "namespaces": ["pid", "mnt", "uts", "net"],
            "joinNamespaces": {"ipc": "/proc/1/ns/ipc"},
            "capabilities": {"bounding": ["CAP_KILL", "CAP_CHOWN"], "effective": ["CAP_KILL"]},
            "uid": 1000,
            "gids": [1000, 27],
            "instance": true
        }));
        native.prepare_config(&mut cfg).unwrap();

        assert!(native.native_config().rootfs.is_absolute());
        assert!(cfg.namespace_flags().contains(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS));
        assert_eq!(cfg.namespace_path(NamespaceKind::Ipc), Some("/proc/1/ns/ipc"));
        assert_eq!(
            cfg.capabilities(CapabilitySet::Effective),
            Capability::from_name("CAP_KILL").unwrap().mask()
        );
        assert_eq!(cfg.capabilities(CapabilitySet::Bounding).count_ones(), 2);
        assert_eq!(cfg.capabilities(CapabilitySet::Ambient), 0);
        assert_eq!(cfg.target_uid(), 1000);
        assert_eq!(cfg.target_gids(), &[1000, 27]);
        assert!(cfg.mount_propagation().contains(MsFlags::MS_PRIVATE | MsFlags::MS_REC));
        assert!(cfg.loopback());
        assert!(cfg.is_instance());
    }

    #[test]
    fn unknown_capability_fails_preparation() {
        let mut cfg = Config::create(b"{}").unwrap();
        let err = engine(serde_json::json!({
            "rootfs": "/r",
            "args": ["sh"],
            "capabilities": {"permitted": ["CAP_FLY"]}
        }))
        .prepare_config(&mut cfg)
        .unwrap_err();
        assert!(matches!(err, StagehandError::Config { .. }));
    }

    #[test]
    fn create_container_drives_rpc_in_order() {
        let native = engine(serde_json::json!({
            "rootfs": "/var/rootfs",
            "image": {"path": "/images/app.sif"},
            "args": ["/bin/true"],
            "namespaces": ["pid", "uts"],
            "hostname": "box",
            "mounts": [{"source": "/data", "destination": "/mnt/data", "options": ["rbind", "ro"]}]
        }));
        let recorder = Recorder::default();
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let server = {
            let recorder = recorder.clone();
            std::thread::spawn(move || {
                RpcServer::new(ENGINE_NAME, Box::new(recorder))
                    .serve(&server_end)
                    .unwrap();
            })
        };
        let mut client = RpcClient::new(ENGINE_NAME, client_end);
        native.create_container(Pid::from_raw(42), &mut client).unwrap();
        drop(client);
        server.join().unwrap();

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "loop /images/app.sif shared=true",
                "mount /dev/loop3 /var/rootfs squashfs",
                "mkdir /var/rootfs/mnt/data",
                "mount /data /var/rootfs/mnt/data ",
                "mount  /var/rootfs/mnt/data ",
                "mkdir /var/rootfs/proc",
                "mount proc /var/rootfs/proc proc",
                "hostname box",
                "chroot /var/rootfs pivot",
            ]
        );
    }

    #[test]
    fn missing_program_is_exec_error_127() {
        let cwd = std::env::current_dir().unwrap();
        let native = engine(serde_json::json!({
            "rootfs": "/",
            "args": ["/nonexistent/stagehand-payload"],
            "cwd": cwd,
        }));
        let (mut ours, _theirs) = UnixStream::pair().unwrap();
        let err = match native.start_process(&mut ours) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        assert!(matches!(err, StagehandError::Exec { .. }));
        assert_eq!(err.exit_code(), 127);
    }

    #[test]
    fn mount_options() {
        assert_eq!(
            mount_flags(&["rbind", "ro"]).unwrap(),
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY
        );
        assert!(mount_flags(&["sync-ish"]).is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let native = engine(serde_json::json!({"rootfs": "/r", "args": ["a"], "hostname": "h"}));
        let again = engine(native.config().unwrap());
        assert_eq!(again.native_config(), native.native_config());
    }
}
