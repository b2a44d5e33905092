//! Subordinate id allocations and the id map used for build namespaces.
//!
//! The invoking user becomes id 0 inside the namespace; the user's
//! subordinate range from `/etc/subuid` and `/etc/subgid` fills ids 1 and up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

pub const SUBUID_PATH: &str = "/etc/subuid";
pub const SUBGID_PATH: &str = "/etc/subgid";

/// First id handed out when no allocation exists yet.
pub const FIRST_ALLOCATION: u64 = 100_000;
/// Size of every allocation written by [`ensure_allocation`].
pub const ALLOCATION_SIZE: u64 = 65_536;

#[derive(Debug, Error)]
pub enum IdMapError {
    #[error("no subordinate id allocation for user '{0}' (see `lamina unpriv-setup`)")]
    NoSubordinateAllocation(String),
    #[error("id map entry {0} overlaps an existing entry")]
    Overlap(IdMapEntry),
    #[error("host id in {0} lies inside a subordinate allocation")]
    HostIdIsSubordinate(IdMapEntry),
    #[error("malformed entry in {file}: '{line}'")]
    Malformed { file: String, line: String },
    #[error("cannot resolve user {0}")]
    UnknownUser(u32),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Which id space an entry maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    Uid,
    Gid,
    Both,
}

impl IdKind {
    fn overlaps(self, other: IdKind) -> bool {
        self == IdKind::Both || other == IdKind::Both || self == other
    }

    fn flag(self) -> char {
        match self {
            IdKind::Uid => 'u',
            IdKind::Gid => 'g',
            IdKind::Both => 'b',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdMapEntry {
    pub kind: IdKind,
    pub ns_id: u32,
    pub host_id: u32,
    pub length: u32,
}

fn overlap(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

impl IdMapEntry {
    pub fn new(kind: IdKind, ns_id: u32, host_id: u32, length: u32) -> Self {
        Self {
            kind,
            ns_id,
            host_id,
            length,
        }
    }

    fn host_range(&self) -> Range<u64> {
        u64::from(self.host_id)..u64::from(self.host_id) + u64::from(self.length)
    }

    fn ns_range(&self) -> Range<u64> {
        u64::from(self.ns_id)..u64::from(self.ns_id) + u64::from(self.length)
    }

    pub fn host_ids_intersect(&self, other: &IdMapEntry) -> bool {
        self.kind.overlaps(other.kind) && overlap(&self.host_range(), &other.host_range())
    }

    pub fn intersects(&self, other: &IdMapEntry) -> bool {
        self.kind.overlaps(other.kind)
            && (overlap(&self.host_range(), &other.host_range())
                || overlap(&self.ns_range(), &other.ns_range()))
    }
}

/// `<u|g|b>:nsid:hostid:length`, the helper's `-m` syntax.
impl fmt::Display for IdMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.kind.flag(),
            self.ns_id,
            self.host_id,
            self.length
        )
    }
}

/// Ordered, overlap-free list of id map entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapSet {
    entries: Vec<IdMapEntry>,
}

impl IdMapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[IdMapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append `entry`, rejecting any intersection with existing entries.
    pub fn add(&mut self, entry: IdMapEntry) -> Result<(), IdMapError> {
        if self.entries.iter().any(|e| e.intersects(&entry)) {
            return Err(IdMapError::Overlap(entry));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Insert `entry`, carving its namespace range out of any entry it
    /// shadows. Fails when the entry's host ids fall inside an existing range.
    pub fn add_safe(&mut self, entry: IdMapEntry) -> Result<(), IdMapError> {
        let mut result = Vec::with_capacity(self.entries.len() + 2);
        let mut added = false;

        for e in &self.entries {
            if !e.intersects(&entry) {
                result.push(*e);
                continue;
            }
            if e.host_ids_intersect(&entry) {
                return Err(IdMapError::HostIdIsSubordinate(entry));
            }
            let lower_len = entry.ns_id.saturating_sub(e.ns_id);
            let consumed = u64::from(lower_len) + u64::from(entry.length);
            let upper_len = u64::from(e.length).saturating_sub(consumed);
            if lower_len > 0 {
                result.push(IdMapEntry::new(e.kind, e.ns_id, e.host_id, lower_len));
            }
            if !added {
                result.push(entry);
                added = true;
            }
            if upper_len > 0 {
                result.push(IdMapEntry::new(
                    e.kind,
                    entry.ns_id + entry.length,
                    (u64::from(e.host_id) + consumed) as u32,
                    upper_len as u32,
                ));
            }
        }
        if !added {
            result.push(entry);
        }
        self.entries = result;
        Ok(())
    }

    /// Arguments for the userns-exec helper, one `-m` pair per entry.
    pub fn helper_args(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|e| ["-m".to_owned(), e.to_string()])
            .collect()
    }
}

/// One line of `/etc/subuid` or `/etc/subgid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubordinateRange {
    pub owner: String,
    pub start: u32,
    pub length: u32,
}

pub fn parse_subordinate(content: &str, file: &str) -> Result<Vec<SubordinateRange>, IdMapError> {
    let malformed = |line: &str| IdMapError::Malformed {
        file: file.to_owned(),
        line: line.to_owned(),
    };
    let mut ranges = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = trimmed.split(':').collect();
        let [owner, start, length] = parts.as_slice() else {
            return Err(malformed(line));
        };
        ranges.push(SubordinateRange {
            owner: (*owner).to_owned(),
            start: start.parse().map_err(|_| malformed(line))?,
            length: length.parse().map_err(|_| malformed(line))?,
        });
    }
    Ok(ranges)
}

/// The identity a build runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
}

impl UserIdentity {
    pub fn current() -> Result<Self, IdMapError> {
        let uid = nix::unistd::getuid();
        let user = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .ok_or(IdMapError::UnknownUser(uid.as_raw()))?;
        Ok(Self {
            name: user.name,
            uid: uid.as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            euid: nix::unistd::geteuid().as_raw(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.euid == 0
    }

    fn owns(&self, range: &SubordinateRange, id: u32) -> bool {
        range.owner == self.name || range.owner == id.to_string()
    }
}

fn entries_for(
    user: &UserIdentity,
    ranges: &[SubordinateRange],
    id: u32,
    kind: IdKind,
) -> Vec<IdMapEntry> {
    let mut ns_id = 0u32;
    let mut out = Vec::new();
    for range in ranges.iter().filter(|r| user.owns(r, id)) {
        out.push(IdMapEntry::new(kind, ns_id, range.start, range.length));
        ns_id = ns_id.saturating_add(range.length);
    }
    out
}

/// Build the id map for `user` from subuid/subgid file contents.
///
/// Root gets an empty map. Identical uid and gid ranges merge into `Both`.
pub fn resolve(user: &UserIdentity, subuid: &str, subgid: &str) -> Result<IdMapSet, IdMapError> {
    if user.is_root() {
        debug!("running as root, no id map needed");
        return Ok(IdMapSet::new());
    }
    let uids = entries_for(user, &parse_subordinate(subuid, SUBUID_PATH)?, user.uid, IdKind::Uid);
    let mut gids =
        entries_for(user, &parse_subordinate(subgid, SUBGID_PATH)?, user.gid, IdKind::Gid);
    if uids.is_empty() || gids.is_empty() {
        return Err(IdMapError::NoSubordinateAllocation(user.name.clone()));
    }

    let mut set = IdMapSet::new();
    for mut entry in uids {
        if let Some(pos) = gids.iter().position(|g| {
            (g.ns_id, g.host_id, g.length) == (entry.ns_id, entry.host_id, entry.length)
        }) {
            gids.remove(pos);
            entry.kind = IdKind::Both;
        }
        set.add(entry)?;
    }
    for entry in gids {
        set.add(entry)?;
    }

    set.add_safe(IdMapEntry::new(IdKind::Uid, 0, user.uid, 1))?;
    set.add_safe(IdMapEntry::new(IdKind::Gid, 0, user.gid, 1))?;
    Ok(set)
}

fn read_optional(path: &Path) -> Result<String, IdMapError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(IdMapError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Resolve the id map of the calling user from the system files.
pub fn resolve_current() -> Result<IdMapSet, IdMapError> {
    let user = UserIdentity::current()?;
    if user.is_root() {
        return Ok(IdMapSet::new());
    }
    resolve(
        &user,
        &read_optional(Path::new(SUBUID_PATH))?,
        &read_optional(Path::new(SUBGID_PATH))?,
    )
}

/// Start of a new allocation for `name`, or `None` if the user has one.
///
/// The start lies past every existing allocation and is advanced in
/// allocation-sized steps until `current_id` is clear of the new range and
/// of the range just below it.
pub fn next_allocation(
    content: &str,
    file: &str,
    name: &str,
    current_id: u32,
) -> Result<Option<u64>, IdMapError> {
    let ranges = parse_subordinate(content, file)?;
    if ranges.iter().any(|r| r.owner == name) {
        return Ok(None);
    }
    let mut candidate = ranges
        .iter()
        .map(|r| u64::from(r.start) + u64::from(r.length))
        .fold(FIRST_ALLOCATION, u64::max);
    let id = u64::from(current_id);
    while candidate - ALLOCATION_SIZE <= id && id < candidate + ALLOCATION_SIZE {
        candidate += ALLOCATION_SIZE;
    }
    Ok(Some(candidate))
}

/// Append an allocation for `name` to `path` unless one exists. The file is
/// replaced atomically. Returns the new range start.
pub fn ensure_allocation(
    path: &Path,
    name: &str,
    current_id: u32,
) -> Result<Option<u64>, IdMapError> {
    let io_err = |source| IdMapError::Io {
        path: path.to_path_buf(),
        source,
    };
    let content = read_optional(path)?;
    let Some(start) = next_allocation(&content, &path.display().to_string(), name, current_id)?
    else {
        debug!("{name} already has an entry in {}", path.display());
        return Ok(None);
    };

    let mut updated = content;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&format!("{name}:{start}:{ALLOCATION_SIZE}\n"));

    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(updated.as_bytes()).map_err(io_err)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))
        .map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    info!("allocated {name}:{start}:{ALLOCATION_SIZE} in {}", path.display());
    Ok(Some(start))
}
