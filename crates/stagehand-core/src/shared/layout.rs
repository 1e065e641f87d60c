//! Byte layout of the shared configuration block.
//!
//! ```text
//! header   magic "STGH" | version u32 | body length u32
//! fixed    flags u32 | clone flags u32 | 5 x capability mask u64
//!          | target uid u32 | mount propagation u64
//! variable target gids   (count u32, u32 each)
//!          uid mappings  (count u32, 3 x u32 each)
//!          gid mappings  (count u32, 3 x u32 each)
//!          newuidmap path, newgidmap path, 7 namespace paths (len u32, bytes)
//!          json payload  (len u32, bytes)
//! ```
//!
//! All integers are little-endian. [`encode`] and [`decode`] are the only
//! functions that touch this layout, and both enforce the field capacities.

use stagehand_common::constants::{MAX_GID, MAX_ID_MAPPING, MAX_JSON_SIZE, MAX_PATH_SIZE};
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::IdMapping;

const MAGIC: &[u8; 4] = b"STGH";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

const FLAG_SUID: u32 = 1;
const FLAG_INSTANCE: u32 = 1 << 1;
const FLAG_NO_NEW_PRIVS: u32 = 1 << 2;
const FLAG_SHARED_MOUNT: u32 = 1 << 3;
const FLAG_JOIN_MOUNT: u32 = 1 << 4;
const FLAG_LOOPBACK: u32 = 1 << 5;
const FLAG_ALLOW_SETGROUPS: u32 = 1 << 6;

/// Number of per-namespace join paths.
pub const NAMESPACE_PATHS: usize = 7;

/// Decoded contents of the shared configuration block.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigBlock {
    /// The bootstrap runs setuid root.
    pub is_suid: bool,
    /// The container runs detached as an instance.
    pub is_instance: bool,
    /// Set `PR_SET_NO_NEW_PRIVS` before executing the payload.
    pub no_new_privs: bool,
    /// Keep the container mount namespace shared with the master.
    pub shared_mount: bool,
    /// Join an existing mount namespace instead of creating one.
    pub join_mount: bool,
    /// Bring up the loopback interface in a new network namespace.
    pub loopback: bool,
    /// Allow `setgroups(2)` in a new user namespace.
    pub allow_setgroups: bool,
    /// `CLONE_NEW*` flags of namespaces to create.
    pub namespace_flags: u32,
    /// Join paths indexed by namespace kind; empty means "do not join".
    pub namespace_paths: [String; NAMESPACE_PATHS],
    /// Capability masks indexed by capability set.
    pub capabilities: [u64; 5],
    /// UID mapping entries.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mapping entries.
    pub gid_mappings: Vec<IdMapping>,
    /// Override path of the `newuidmap` helper.
    pub new_uidmap_path: String,
    /// Override path of the `newgidmap` helper.
    pub new_gidmap_path: String,
    /// UID the payload runs as.
    pub target_uid: u32,
    /// GIDs the payload runs as, primary first.
    pub target_gids: Vec<u32>,
    /// `MS_*` propagation flags applied to `/`.
    pub mount_propagation: u64,
    /// Engine JSON payload.
    pub json: Vec<u8>,
}

/// Fails with a capacity error when `len > max`.
pub(crate) fn check_capacity(field: &'static str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(StagehandError::Capacity { field, len, max });
    }
    Ok(())
}

/// Validates a path-like string against [`MAX_PATH_SIZE`] (NUL included).
pub(crate) fn check_path(field: &'static str, value: &str) -> Result<()> {
    check_capacity(field, value.len() + 1, MAX_PATH_SIZE)?;
    if value.as_bytes().contains(&0) {
        return Err(StagehandError::Config {
            message: format!("{field} contains a NUL byte"),
        });
    }
    Ok(())
}

impl ConfigBlock {
    /// Checks every bounded field against its capacity.
    ///
    /// # Errors
    ///
    /// Returns the first capacity violation found.
    pub fn validate(&self) -> Result<()> {
        check_capacity("target gids", self.target_gids.len(), MAX_GID)?;
        check_capacity("uid mappings", self.uid_mappings.len(), MAX_ID_MAPPING)?;
        check_capacity("gid mappings", self.gid_mappings.len(), MAX_ID_MAPPING)?;
        check_path("newuidmap path", &self.new_uidmap_path)?;
        check_path("newgidmap path", &self.new_gidmap_path)?;
        for path in &self.namespace_paths {
            check_path("namespace path", path)?;
        }
        check_capacity("json payload", self.json.len(), MAX_JSON_SIZE)
    }

    fn flags(&self) -> u32 {
        [
            (self.is_suid, FLAG_SUID),
            (self.is_instance, FLAG_INSTANCE),
            (self.no_new_privs, FLAG_NO_NEW_PRIVS),
            (self.shared_mount, FLAG_SHARED_MOUNT),
            (self.join_mount, FLAG_JOIN_MOUNT),
            (self.loopback, FLAG_LOOPBACK),
            (self.allow_setgroups, FLAG_ALLOW_SETGROUPS),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }

    fn set_flags(&mut self, flags: u32) {
        self.is_suid = flags & FLAG_SUID != 0;
        self.is_instance = flags & FLAG_INSTANCE != 0;
        self.no_new_privs = flags & FLAG_NO_NEW_PRIVS != 0;
        self.shared_mount = flags & FLAG_SHARED_MOUNT != 0;
        self.join_mount = flags & FLAG_JOIN_MOUNT != 0;
        self.loopback = flags & FLAG_LOOPBACK != 0;
        self.allow_setgroups = flags & FLAG_ALLOW_SETGROUPS != 0;
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| StagehandError::Config {
            message: format!("length {len} does not fit the layout"),
        })?;
        self.u32(len);
        Ok(())
    }

    fn bytes(&mut self, b: &[u8]) -> Result<()> {
        self.len(b.len())?;
        self.buf.extend_from_slice(b);
        Ok(())
    }

    fn mappings(&mut self, maps: &[IdMapping]) -> Result<()> {
        self.len(maps.len())?;
        for m in maps {
            self.u32(m.container_id);
            self.u32(m.host_id);
            self.u32(m.size);
        }
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        let Some(end) = end else {
            return Err(StagehandError::Config {
                message: format!("shared configuration truncated at offset {}", self.pos),
            });
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn count(&mut self, field: &'static str, max: usize) -> Result<usize> {
        let n = self.u32()? as usize;
        check_capacity(field, n, max)?;
        Ok(n)
    }

    fn bytes(&mut self, field: &'static str, max: usize) -> Result<&'a [u8]> {
        let n = self.count(field, max)?;
        self.take(n)
    }

    fn string(&mut self, field: &'static str) -> Result<String> {
        let raw = self.bytes(field, MAX_PATH_SIZE - 1)?;
        String::from_utf8(raw.to_vec()).map_err(|_| StagehandError::Config {
            message: format!("{field} is not valid UTF-8"),
        })
    }

    fn mappings(&mut self, field: &'static str) -> Result<Vec<IdMapping>> {
        let n = self.count(field, MAX_ID_MAPPING)?;
        (0..n)
            .map(|_| {
                Ok(IdMapping {
                    container_id: self.u32()?,
                    host_id: self.u32()?,
                    size: self.u32()?,
                })
            })
            .collect()
    }
}

/// Serializes a block into its byte layout.
///
/// # Errors
///
/// Returns a capacity error if any bounded field is over capacity.
pub fn encode(block: &ConfigBlock) -> Result<Vec<u8>> {
    block.validate()?;

    let mut body = Writer { buf: Vec::new() };
    body.u32(block.flags());
    body.u32(block.namespace_flags);
    for mask in block.capabilities {
        body.u64(mask);
    }
    body.u32(block.target_uid);
    body.u64(block.mount_propagation);

    body.len(block.target_gids.len())?;
    for gid in &block.target_gids {
        body.u32(*gid);
    }
    body.mappings(&block.uid_mappings)?;
    body.mappings(&block.gid_mappings)?;
    body.bytes(block.new_uidmap_path.as_bytes())?;
    body.bytes(block.new_gidmap_path.as_bytes())?;
    for path in &block.namespace_paths {
        body.bytes(path.as_bytes())?;
    }
    body.bytes(&block.json)?;

    let mut out = Writer {
        buf: Vec::with_capacity(HEADER_LEN + body.buf.len()),
    };
    out.buf.extend_from_slice(MAGIC);
    out.u32(VERSION);
    out.bytes(&body.buf)?;
    Ok(out.buf)
}

/// Parses a block from the start of `raw`; trailing bytes are ignored.
///
/// # Errors
///
/// Returns an error on a bad magic, an unknown version, a truncated body,
/// or any length prefix over its field capacity.
pub fn decode(raw: &[u8]) -> Result<ConfigBlock> {
    let mut header = Reader { buf: raw, pos: 0 };
    if header.take(4)? != MAGIC {
        return Err(StagehandError::Config {
            message: "shared configuration has no valid header".into(),
        });
    }
    let version = header.u32()?;
    if version != VERSION {
        return Err(StagehandError::Config {
            message: format!("unsupported shared configuration version {version}"),
        });
    }
    let body_len = header.u32()? as usize;
    let mut r = Reader {
        buf: header.take(body_len)?,
        pos: 0,
    };

    let mut block = ConfigBlock::default();
    block.set_flags(r.u32()?);
    block.namespace_flags = r.u32()?;
    for mask in &mut block.capabilities {
        *mask = r.u64()?;
    }
    block.target_uid = r.u32()?;
    block.mount_propagation = r.u64()?;

    let gids = r.count("target gids", MAX_GID)?;
    block.target_gids = (0..gids).map(|_| r.u32()).collect::<Result<_>>()?;
    block.uid_mappings = r.mappings("uid mappings")?;
    block.gid_mappings = r.mappings("gid mappings")?;
    block.new_uidmap_path = r.string("newuidmap path")?;
    block.new_gidmap_path = r.string("newgidmap path")?;
    for path in &mut block.namespace_paths {
        *path = r.string("namespace path")?;
    }
    block.json = r.bytes("json payload", MAX_JSON_SIZE)?.to_vec();
    Ok(block)
}
