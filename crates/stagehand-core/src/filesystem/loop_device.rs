//! Loop device attachment for filesystem images.
//!
//! Images are attached by probing `/dev/loop0`, `/dev/loop1`, ... up to a
//! caller-provided bound. With `shared` set, a device already backed by
//! the same file at the same offset and size limit is reused instead of
//! consuming a new one.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stagehand_common::error::{Result, StagehandError};

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;

const LOOP_MAJOR: u64 = 7;
const LO_NAME_SIZE: usize = 64;

/// Device is read-only.
pub const LO_FLAGS_READ_ONLY: u32 = 1;
/// Device detaches itself once the last reference is dropped.
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;

/// Caller-controlled part of `struct loop_info64`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopInfo {
    /// Byte offset of the filesystem inside the image.
    pub offset: u64,
    /// Maximum size exposed by the device, zero for "to end of file".
    pub size_limit: u64,
    /// `LO_FLAGS_*` bits.
    pub flags: u32,
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    const fn zeroed() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        }
    }

    fn from_info(info: &LoopInfo, image: &Path) -> Self {
        let mut raw = Self::zeroed();
        raw.lo_offset = info.offset;
        raw.lo_sizelimit = info.size_limit;
        raw.lo_flags = info.flags;
        let name = image.as_os_str().as_encoded_bytes();
        let len = name.len().min(LO_NAME_SIZE - 1);
        raw.lo_file_name[..len].copy_from_slice(&name[..len]);
        raw
    }
}

/// An attached loop device. The device stays referenced while this value lives.
#[derive(Debug)]
pub struct LoopDevice {
    index: u32,
    _device: File,
}

impl LoopDevice {
    /// Returns the device number `N` of `/dev/loopN`.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the device node path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        device_path(self.index)
    }
}

/// Returns `/dev/loopN`.
#[must_use]
pub fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{index}"))
}

fn open_mode(path: &Path, mode: i32) -> std::io::Result<File> {
    let writable = mode & libc::O_ACCMODE == libc::O_RDWR;
    OpenOptions::new()
        .read(true)
        .write(writable)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
}

fn ensure_device_node(index: u32) -> Result<PathBuf> {
    use nix::sys::stat::{Mode, SFlag, makedev, mknod};

    let path = device_path(index);
    if path.exists() {
        return Ok(path);
    }
    match mknod(
        &path,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o660),
        makedev(LOOP_MAJOR, u64::from(index)),
    ) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(path),
        Err(e) => Err(StagehandError::PermissionDenied {
            message: format!("mknod {} failed: {e}", path.display()),
        }),
    }
}

fn status(device: &File) -> Option<LoopInfo64> {
    let mut raw = LoopInfo64::zeroed();
    // SAFETY: LOOP_GET_STATUS64 writes one `struct loop_info64` into `raw`,
    // which is a properly sized and aligned `#[repr(C)]` value.
    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_GET_STATUS64 as _,
            std::ptr::from_mut(&mut raw),
        )
    };
    (ret == 0).then_some(raw)
}

fn backs_image(raw: &LoopInfo64, image: &std::fs::Metadata, info: &LoopInfo) -> bool {
    raw.lo_device == image.dev()
        && raw.lo_inode == image.ino()
        && raw.lo_offset == info.offset
        && raw.lo_sizelimit == info.size_limit
}

/// Attaches `image` to the first free loop device.
///
/// `mode` carries the `open(2)` access mode (`O_RDONLY` or `O_RDWR`) used
/// for both the image and the device.
///
/// # Errors
///
/// Returns an error if the image cannot be opened, a device node cannot be
/// created, configuring the device fails, or all `max_devices` are busy.
pub fn attach(
    image: &Path,
    mode: i32,
    info: &LoopInfo,
    max_devices: u32,
    shared: bool,
) -> Result<LoopDevice> {
    let image_file = open_mode(image, mode).map_err(|e| StagehandError::Io {
        path: image.to_path_buf(),
        source: e,
    })?;
    let image_meta = image_file.metadata().map_err(|e| StagehandError::Io {
        path: image.to_path_buf(),
        source: e,
    })?;

    for index in 0..max_devices {
        let path = ensure_device_node(index)?;
        let Ok(device) = open_mode(&path, mode) else {
            continue;
        };

        if shared {
            if let Some(raw) = status(&device) {
                if backs_image(&raw, &image_meta, info) {
                    tracing::debug!(index, image = %image.display(), "reusing shared loop device");
                    return Ok(LoopDevice {
                        index,
                        _device: device,
                    });
                }
            }
        }

        // SAFETY: LOOP_SET_FD takes the image descriptor by value; both
        // descriptors stay open for the duration of the call.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_FD as _,
                image_file.as_raw_fd(),
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EBUSY) {
                continue;
            }
            return Err(StagehandError::Io { path, source: err });
        }

        let raw = LoopInfo64::from_info(info, image);
        // SAFETY: LOOP_SET_STATUS64 reads one `struct loop_info64` from `raw`.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_STATUS64 as _,
                std::ptr::from_ref(&raw),
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: LOOP_CLR_FD takes no argument.
            let _ = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _, 0) };
            return Err(StagehandError::Io { path, source: err });
        }

        tracing::info!(index, image = %image.display(), "image attached to loop device");
        return Ok(LoopDevice {
            index,
            _device: device,
        });
    }

    Err(StagehandError::Config {
        message: format!(
            "no free loop device among {max_devices} for {}",
            image.display()
        ),
    })
}
