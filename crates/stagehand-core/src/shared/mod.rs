//! Shared configuration block handed from the bootstrap to every role.
//!
//! The block is allocated once before the roles fork, written by stage one
//! only, and read by everyone else. [`Config`] keeps a decoded copy of the
//! block next to the mapping: setters validate and update the copy, and
//! [`Config::commit`] encodes it back into the mapping in one step.
//!
//! There is no locking. Single-writer-then-handoff is enforced by the order
//! in which the bootstrap runs the roles.

pub mod layout;
pub mod region;

use std::os::fd::AsFd;

use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use stagehand_common::constants::{MAX_GID, MAX_ID_MAPPING, MAX_JSON_SIZE, SHARED_CONFIG_SIZE};
use stagehand_common::error::Result;
use stagehand_common::types::IdMapping;

use crate::capability::{self, CapabilitySet};
use crate::namespace::NamespaceKind;
use crate::namespace::user::{render_id_map, validate_mapping};
use layout::{ConfigBlock, check_capacity, check_path};
use region::SharedRegion;

/// Handle onto the shared configuration block.
#[derive(Debug)]
pub struct Config {
    region: SharedRegion,
    block: ConfigBlock,
}

impl Config {
    /// Maps the block behind `fd` and decodes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails or the block is malformed.
    pub fn attach<F: AsFd>(fd: F) -> Result<Self> {
        Self::from_region(SharedRegion::attach(fd, SHARED_CONFIG_SIZE)?)
    }

    /// Decodes the block already present in `region`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is malformed.
    pub fn from_region(region: SharedRegion) -> Result<Self> {
        let block = layout::decode(region.as_slice())?;
        Ok(Self { region, block })
    }

    /// Writes an initial block carrying `json` into a fresh `region`.
    ///
    /// This is what the bootstrap does before forking the roles.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is over capacity or does not fit.
    pub fn initialize(region: SharedRegion, json: &[u8]) -> Result<Self> {
        let mut config = Self {
            region,
            block: ConfigBlock::default(),
        };
        config.set_json(json)?;
        config.commit()?;
        Ok(config)
    }

    /// Allocates an anonymous region of the standard size and initializes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails or the payload is over capacity.
    pub fn create(json: &[u8]) -> Result<Self> {
        Self::initialize(SharedRegion::anonymous(SHARED_CONFIG_SIZE)?, json)
    }

    /// Returns the decoded block.
    #[must_use]
    pub const fn block(&self) -> &ConfigBlock {
        &self.block
    }

    /// Encodes the block back into the mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is over capacity or the encoded block
    /// does not fit the region.
    pub fn commit(&mut self) -> Result<()> {
        let raw = layout::encode(&self.block)?;
        self.region.write(&raw)?;
        tracing::debug!(bytes = raw.len(), "shared configuration committed");
        Ok(())
    }

    /// Unmaps the block. The handle is consumed, so it cannot be used or
    /// released again.
    ///
    /// # Errors
    ///
    /// Returns an error if `munmap(2)` fails.
    pub fn release(self) -> Result<()> {
        self.region.unmap()
    }

    /// Whether the bootstrap runs setuid root.
    #[must_use]
    pub const fn is_suid(&self) -> bool {
        self.block.is_suid
    }

    /// Records whether the bootstrap runs setuid root.
    pub const fn set_suid(&mut self, suid: bool) {
        self.block.is_suid = suid;
    }

    /// Whether the container runs as a detached instance.
    #[must_use]
    pub const fn is_instance(&self) -> bool {
        self.block.is_instance
    }

    /// Marks the container as a detached instance.
    pub const fn set_instance(&mut self, instance: bool) {
        self.block.is_instance = instance;
    }

    /// Whether `PR_SET_NO_NEW_PRIVS` is requested.
    #[must_use]
    pub const fn no_new_privs(&self) -> bool {
        self.block.no_new_privs
    }

    /// Requests `PR_SET_NO_NEW_PRIVS` for the payload.
    pub const fn set_no_new_privs(&mut self, value: bool) {
        self.block.no_new_privs = value;
    }

    /// Whether the mount namespace is shared with the master.
    #[must_use]
    pub const fn shared_mount(&self) -> bool {
        self.block.shared_mount
    }

    /// Shares the container mount namespace with the master.
    pub const fn set_shared_mount(&mut self, value: bool) {
        self.block.shared_mount = value;
    }

    /// Whether an existing mount namespace is joined.
    #[must_use]
    pub const fn join_mount(&self) -> bool {
        self.block.join_mount
    }

    /// Joins an existing mount namespace instead of creating one.
    pub const fn set_join_mount(&mut self, value: bool) {
        self.block.join_mount = value;
    }

    /// Whether the loopback interface is brought up.
    #[must_use]
    pub const fn loopback(&self) -> bool {
        self.block.loopback
    }

    /// Brings up the loopback interface in a new network namespace.
    pub const fn set_loopback(&mut self, value: bool) {
        self.block.loopback = value;
    }

    /// Whether `setgroups(2)` stays allowed in a new user namespace.
    #[must_use]
    pub const fn allow_setgroups(&self) -> bool {
        self.block.allow_setgroups
    }

    /// Allows `setgroups(2)` in a new user namespace.
    pub const fn set_allow_setgroups(&mut self, value: bool) {
        self.block.allow_setgroups = value;
    }

    /// Namespaces to create.
    #[must_use]
    pub fn namespace_flags(&self) -> CloneFlags {
        #[allow(clippy::cast_possible_wrap)]
        CloneFlags::from_bits_truncate(self.block.namespace_flags as libc::c_int)
    }

    /// Replaces the set of namespaces to create.
    pub fn set_namespace_flags(&mut self, flags: CloneFlags) {
        #[allow(clippy::cast_sign_loss)]
        let bits = flags.bits() as u32;
        self.block.namespace_flags = bits;
    }

    /// Join path for a namespace kind, if one is set.
    #[must_use]
    pub fn namespace_path(&self, kind: NamespaceKind) -> Option<&str> {
        let path = self.block.namespace_paths[kind.index()].as_str();
        (!path.is_empty()).then_some(path)
    }

    /// Sets the path of an existing namespace to join.
    ///
    /// # Errors
    ///
    /// Returns a capacity error if the path does not fit.
    pub fn set_namespace_path(&mut self, kind: NamespaceKind, path: &str) -> Result<()> {
        check_path("namespace path", path)?;
        path.clone_into(&mut self.block.namespace_paths[kind.index()]);
        Ok(())
    }

    /// Appends UID mapping entries.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is invalid or the table would overflow;
    /// the table is left unchanged in that case.
    pub fn add_uid_mappings(&mut self, mappings: &[IdMapping]) -> Result<()> {
        append_mappings("uid mappings", &mut self.block.uid_mappings, mappings)
    }

    /// Appends GID mapping entries.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is invalid or the table would overflow;
    /// the table is left unchanged in that case.
    pub fn add_gid_mappings(&mut self, mappings: &[IdMapping]) -> Result<()> {
        append_mappings("gid mappings", &mut self.block.gid_mappings, mappings)
    }

    /// UID mapping entries.
    #[must_use]
    pub fn uid_mappings(&self) -> &[IdMapping] {
        &self.block.uid_mappings
    }

    /// GID mapping entries.
    #[must_use]
    pub fn gid_mappings(&self) -> &[IdMapping] {
        &self.block.gid_mappings
    }

    /// UID mappings rendered for `/proc/<pid>/uid_map`.
    #[must_use]
    pub fn uid_map_string(&self) -> String {
        render_id_map(&self.block.uid_mappings)
    }

    /// GID mappings rendered for `/proc/<pid>/gid_map`.
    #[must_use]
    pub fn gid_map_string(&self) -> String {
        render_id_map(&self.block.gid_mappings)
    }

    /// Overrides the `newuidmap` helper path.
    ///
    /// # Errors
    ///
    /// Returns a capacity error if the path does not fit.
    pub fn set_new_uidmap_path(&mut self, path: &str) -> Result<()> {
        check_path("newuidmap path", path)?;
        path.clone_into(&mut self.block.new_uidmap_path);
        Ok(())
    }

    /// Overrides the `newgidmap` helper path.
    ///
    /// # Errors
    ///
    /// Returns a capacity error if the path does not fit.
    pub fn set_new_gidmap_path(&mut self, path: &str) -> Result<()> {
        check_path("newgidmap path", path)?;
        path.clone_into(&mut self.block.new_gidmap_path);
        Ok(())
    }

    /// UID the payload runs as.
    #[must_use]
    pub const fn target_uid(&self) -> u32 {
        self.block.target_uid
    }

    /// Sets the UID the payload runs as.
    pub const fn set_target_uid(&mut self, uid: u32) {
        self.block.target_uid = uid;
    }

    /// GIDs the payload runs as.
    #[must_use]
    pub fn target_gids(&self) -> &[u32] {
        &self.block.target_gids
    }

    /// Replaces the GIDs the payload runs as.
    ///
    /// # Errors
    ///
    /// Returns a capacity error if more than the supported number of
    /// GIDs are given.
    pub fn set_target_gids(&mut self, gids: &[u32]) -> Result<()> {
        check_capacity("target gids", gids.len(), MAX_GID)?;
        self.block.target_gids = gids.to_vec();
        Ok(())
    }

    /// Mask of one capability set.
    #[must_use]
    pub const fn capabilities(&self, set: CapabilitySet) -> u64 {
        self.block.capabilities[set.index()]
    }

    /// Replaces one capability set with the named capabilities.
    ///
    /// The previous mask is discarded, never merged.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is unknown; the mask is left unchanged.
    pub fn set_capabilities<S: AsRef<str>>(&mut self, set: CapabilitySet, names: &[S]) -> Result<()> {
        let mask = capability::mask_from_names(names)?;
        self.block.capabilities[set.index()] = mask;
        Ok(())
    }

    /// Propagation flags applied to `/` in the container mount namespace.
    #[must_use]
    pub const fn mount_propagation(&self) -> MsFlags {
        MsFlags::from_bits_truncate(self.block.mount_propagation as libc::c_ulong)
    }

    /// Sets the propagation from a mode name such as `rprivate`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown mode.
    pub fn set_mount_propagation(&mut self, mode: &str) -> Result<()> {
        let flags = crate::namespace::mount::propagation_flags(mode)?;
        self.block.mount_propagation = u64::from(flags.bits());
        Ok(())
    }

    /// Engine JSON payload.
    #[must_use]
    pub fn json(&self) -> &[u8] {
        &self.block.json
    }

    /// Replaces the engine JSON payload.
    ///
    /// # Errors
    ///
    /// Returns a capacity error if the payload is larger than the block
    /// allows. Oversized payloads are never truncated.
    pub fn set_json(&mut self, json: &[u8]) -> Result<()> {
        check_capacity("json payload", json.len(), MAX_JSON_SIZE)?;
        self.block.json = json.to_vec();
        Ok(())
    }
}

fn append_mappings(field: &'static str, table: &mut Vec<IdMapping>, new: &[IdMapping]) -> Result<()> {
    check_capacity(field, table.len() + new.len(), MAX_ID_MAPPING)?;
    for mapping in new {
        validate_mapping(mapping)?;
    }
    table.extend_from_slice(new);
    Ok(())
}
