//! Memory mapping that backs the shared configuration.

use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags};
use stagehand_common::error::{Result, StagehandError};

/// A `MAP_SHARED` read-write mapping of fixed length.
///
/// Mappings survive `fork(2)`, which is how the bootstrap hands the block
/// to every role. The mapping is removed by [`SharedRegion::unmap`] or,
/// failing that, on drop.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

fn nonzero(len: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(len).ok_or_else(|| StagehandError::Config {
        message: "shared region length must be non-zero".into(),
    })
}

fn map_error(e: nix::errno::Errno) -> StagehandError {
    StagehandError::PermissionDenied {
        message: format!("mmap of shared configuration failed: {e}"),
    }
}

impl SharedRegion {
    /// Creates a zero-filled anonymous shared mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or `mmap(2)` fails.
    pub fn anonymous(len: usize) -> Result<Self> {
        let length = nonzero(len)?;
        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let ptr = unsafe {
            nix::sys::mman::mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(map_error)?;
        Ok(Self { ptr, len })
    }

    /// Maps `len` bytes of the file behind `fd` (typically a memfd passed
    /// by the bootstrap).
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or `mmap(2)` fails.
    pub fn attach<F: AsFd>(fd: F, len: usize) -> Result<Self> {
        let length = nonzero(len)?;
        // SAFETY: the mapping is MAP_SHARED over a file the bootstrap sized
        // to at least `len` bytes; other processes may write to it only
        // while this one is not reading, which role ordering guarantees.
        let ptr = unsafe {
            nix::sys::mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(map_error)?;
        Ok(Self { ptr, len })
    }

    /// Returns the mapping length.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping is empty, which never happens.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` points to `len` mapped, readable bytes for the
        // lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    /// Copies `bytes` to the start of the mapping.
    ///
    /// # Errors
    ///
    /// Returns a capacity error if `bytes` is longer than the mapping.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.len {
            return Err(StagehandError::Capacity {
                field: "shared region",
                len: bytes.len(),
                max: self.len,
            });
        }
        // SAFETY: the length was checked against the mapping above and the
        // source is a distinct heap buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().cast::<u8>(), bytes.len());
        }
        Ok(())
    }

    /// Removes the mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if `munmap(2)` fails.
    pub fn unmap(self) -> Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` owns the mapping and is never used again.
        unsafe { nix::sys::mman::munmap(this.ptr, this.len) }.map_err(|e| {
            StagehandError::PermissionDenied {
                message: format!("munmap of shared configuration failed: {e}"),
            }
        })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by `self` and not referenced after drop.
        let _ = unsafe { nix::sys::mman::munmap(self.ptr, self.len) };
    }
}
