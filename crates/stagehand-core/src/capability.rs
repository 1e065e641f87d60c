//! Linux capability names and bitmask conversion.
//!
//! The shared configuration stores each capability set as a 64-bit mask
//! where bit `n` is capability number `n`. Engines speak symbolic names
//! (`CAP_SYS_ADMIN`), so this module owns the name table.

use std::fmt;

use stagehand_common::error::{Result, StagehandError};

/// The five POSIX capability sets of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilitySet {
    /// Upper bound of the effective set.
    Permitted,
    /// Capabilities checked by the kernel.
    Effective,
    /// Capabilities preserved across `execve(2)` for capable files.
    Inheritable,
    /// Capabilities the process may ever acquire.
    Bounding,
    /// Capabilities preserved across `execve(2)` of unprivileged files.
    Ambient,
}

impl CapabilitySet {
    /// All sets in their on-disk order.
    pub const ALL: [Self; 5] = [
        Self::Permitted,
        Self::Effective,
        Self::Inheritable,
        Self::Bounding,
        Self::Ambient,
    ];

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Permitted => 0,
            Self::Effective => 1,
            Self::Inheritable => 2,
            Self::Bounding => 3,
            Self::Ambient => 4,
        }
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Permitted => "permitted",
            Self::Effective => "effective",
            Self::Inheritable => "inheritable",
            Self::Bounding => "bounding",
            Self::Ambient => "ambient",
        };
        f.write_str(name)
    }
}

/// Capability names indexed by their kernel number.
const CAPABILITY_NAMES: [&str; 41] = [
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// A single Linux capability, identified by its kernel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Capability(u8);

impl Capability {
    /// `CAP_SYS_ADMIN`.
    pub const SYS_ADMIN: Self = Self(21);
    /// `CAP_NET_BIND_SERVICE`.
    pub const NET_BIND_SERVICE: Self = Self(10);

    /// Looks up a capability by name.
    ///
    /// Accepts `CAP_CHOWN`, `cap_chown`, and `chown`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown name.
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let full = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        };
        CAPABILITY_NAMES
            .iter()
            .position(|candidate| *candidate == full)
            .and_then(|idx| u8::try_from(idx).ok())
            .map(Self)
            .ok_or_else(|| StagehandError::Config {
                message: format!("unknown capability {name:?}"),
            })
    }

    /// Returns the kernel capability number.
    #[must_use]
    pub const fn number(self) -> u8 {
        self.0
    }

    /// Returns the bit representing this capability in a set mask.
    #[must_use]
    pub const fn mask(self) -> u64 {
        1 << self.0
    }

    /// Returns the canonical `CAP_*` name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        CAPABILITY_NAMES[self.0 as usize]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds a capability mask from symbolic names.
///
/// # Errors
///
/// Returns an error if any name is unknown; no partial mask is returned.
pub fn mask_from_names<S: AsRef<str>>(names: &[S]) -> Result<u64> {
    names.iter().try_fold(0_u64, |mask, name| {
        Capability::from_name(name.as_ref()).map(|cap| mask | cap.mask())
    })
}

/// Expands a mask back into capabilities, ignoring bits past the last
/// known capability.
#[must_use]
pub fn capabilities_in_mask(mask: u64) -> Vec<Capability> {
    (0..CAPABILITY_NAMES.len())
        .filter_map(|idx| u8::try_from(idx).ok())
        .map(Capability)
        .filter(|cap| mask & cap.mask() != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_in_all_spellings() {
        assert_eq!(Capability::from_name("CAP_SYS_ADMIN").unwrap(), Capability::SYS_ADMIN);
        assert_eq!(Capability::from_name("cap_sys_admin").unwrap(), Capability::SYS_ADMIN);
        assert_eq!(Capability::from_name("sys_admin").unwrap(), Capability::SYS_ADMIN);
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(Capability::from_name("CAP_TELEPORT").is_err());
        assert!(mask_from_names(&["CAP_CHOWN", "CAP_TELEPORT"]).is_err());
    }

    #[test]
    fn mask_sets_kernel_bits() {
        let mask = mask_from_names(&["CAP_CHOWN", "CAP_NET_BIND_SERVICE"]).unwrap();
        assert_eq!(mask, 1 | (1 << 10));
        assert_eq!(mask_from_names::<&str>(&[]).unwrap(), 0);
    }

    #[test]
    fn mask_expands_back_to_names() {
        let caps = capabilities_in_mask((1 << 21) | (1 << 40) | (1 << 63));
        let names: Vec<_> = caps.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["CAP_SYS_ADMIN", "CAP_CHECKPOINT_RESTORE"]);
    }
}
