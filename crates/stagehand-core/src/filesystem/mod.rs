//! Filesystem operations performed inside the container's mount namespace.
//!
//! These are the primitives behind the privileged RPC methods: generic
//! mounts, directory and symlink creation, root switching via `pivot_root`
//! or move-and-chroot, and loop device attachment.

pub mod loop_device;
pub mod mount;
pub mod pivot_root;
