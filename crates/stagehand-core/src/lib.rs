//! # stagehand-core
//!
//! Linux primitives used by the Stagehand starter roles.
//!
//! This crate provides safe abstractions over:
//! - **Shared configuration**: the fixed-capacity block mapped into every role.
//! - **Namespaces**: clone flags, mount propagation, hostname, and ID maps.
//! - **Filesystem**: mounts, root switching, and loop device attachment.
//! - **Capabilities**: name lookup and per-set masks.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod filesystem;
pub mod namespace;
pub mod shared;
