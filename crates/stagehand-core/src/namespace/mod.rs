//! Linux namespace kinds and their `clone(2)` flags.
//!
//! The bootstrap creates or joins namespaces; this module only translates
//! between the symbolic names engines use and the flag bits stored in the
//! shared configuration.

pub mod mount;
pub mod user;
pub mod uts;

use std::fmt;
use std::str::FromStr;

use nix::sched::CloneFlags;
use stagehand_common::error::{Result, StagehandError};

/// A namespace kind that a container may create or join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NamespaceKind {
    /// User namespace.
    User,
    /// IPC namespace.
    Ipc,
    /// UTS (hostname) namespace.
    Uts,
    /// PID namespace.
    Pid,
    /// Network namespace.
    Net,
    /// Mount namespace.
    Mount,
    /// Cgroup namespace.
    Cgroup,
}

impl NamespaceKind {
    /// All kinds, in the order their join paths are stored.
    pub const ALL: [Self; 7] = [
        Self::User,
        Self::Ipc,
        Self::Uts,
        Self::Pid,
        Self::Net,
        Self::Mount,
        Self::Cgroup,
    ];

    /// Returns the `CLONE_NEW*` flag for this kind.
    #[must_use]
    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// Returns the entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Pid => "pid",
            Self::Net => "net",
            Self::Mount => "mnt",
            Self::Cgroup => "cgroup",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::User => 0,
            Self::Ipc => 1,
            Self::Uts => 2,
            Self::Pid => 3,
            Self::Net => 4,
            Self::Mount => 5,
            Self::Cgroup => 6,
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for NamespaceKind {
    type Err = StagehandError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "ipc" => Ok(Self::Ipc),
            "uts" => Ok(Self::Uts),
            "pid" => Ok(Self::Pid),
            "net" | "network" => Ok(Self::Net),
            "mnt" | "mount" => Ok(Self::Mount),
            "cgroup" => Ok(Self::Cgroup),
            other => Err(StagehandError::Config {
                message: format!("unknown namespace {other:?}"),
            }),
        }
    }
}

/// Combines namespace names into a single set of clone flags.
///
/// # Errors
///
/// Returns an error if any name is not a known namespace kind.
pub fn clone_flags_from_names<S: AsRef<str>>(names: &[S]) -> Result<CloneFlags> {
    names.iter().try_fold(CloneFlags::empty(), |flags, name| {
        name.as_ref()
            .parse::<NamespaceKind>()
            .map(|kind| flags | kind.clone_flag())
    })
}

/// Returns the kinds whose flag is present in `flags`.
#[must_use]
pub fn kinds_in_flags(flags: CloneFlags) -> Vec<NamespaceKind> {
    NamespaceKind::ALL
        .into_iter()
        .filter(|kind| flags.contains(kind.clone_flag()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_clone_flags() {
        let flags = clone_flags_from_names(&["pid", "mount", "uts"]).unwrap();
        assert_eq!(
            flags,
            CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS
        );
    }

    #[test]
    fn unknown_namespace_rejected() {
        assert!(clone_flags_from_names(&["pid", "time-travel"]).is_err());
    }

    #[test]
    fn kinds_roundtrip_through_flags() {
        let flags = NamespaceKind::Net.clone_flag() | NamespaceKind::User.clone_flag();
        assert_eq!(kinds_in_flags(flags), vec![NamespaceKind::User, NamespaceKind::Net]);
    }

    #[test]
    fn indexes_are_dense() {
        for (i, kind) in NamespaceKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
