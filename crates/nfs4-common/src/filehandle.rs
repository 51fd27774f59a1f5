//! Opaque filehandles and the registry that resolves them
//!
//! Two handle encodings are issued:
//!
//! - **Path** handles embed the object's path. They are self-describing but
//!   volatile: a RENAME leaves them pointing at the old name.
//! - **Id** handles embed a stable object id allocated by the registry. The
//!   registry tracks the live path of every id, so an Id handle keeps
//!   resolving after the object (or any ancestor) is renamed.
//!
//! Wire layout (the first byte is the type tag):
//!
//! ```text
//! Root: [0]
//! Path: [1] path bytes .. checksum(4)
//! Id:   [2] epoch(8, BE) id(8, BE) checksum(4)
//! ```
//!
//! The checksum is the first four bytes of BLAKE3 over everything before it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{CommonError, CommonResult};
use crate::path::ObjectPath;

/// Maximum filehandle size in bytes (NFS4_FHSIZE)
pub const FHSIZE: usize = 128;

/// Stable identifier the registry assigns to every object it has seen
pub type ObjectId = u64;

/// Id of the export root
pub const ROOT_ID: ObjectId = 1;

const CHECKSUM_LEN: usize = 4;
const ID_HANDLE_LEN: usize = 1 + 8 + 8 + CHECKSUM_LEN;

/// Filehandle type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilehandleKind {
    /// Export root (also served for PUTPUBFH)
    Root = 0,
    /// Path-embedding handle
    Path = 1,
    /// Stable-id handle
    Id = 2,
}

impl TryFrom<u8> for FilehandleKind {
    type Error = CommonError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Root),
            1 => Ok(Self::Path),
            2 => Ok(Self::Id),
            _ => Err(CommonError::InvalidHandle(format!(
                "unknown type tag: {}",
                value
            ))),
        }
    }
}

/// Which encoding the registry issues when a path handle would fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilehandlePolicy {
    /// Path handles when they fit the short budget, Id handles otherwise
    #[default]
    PreferPath,
    /// Always issue Id handles
    AlwaysId,
}

/// Decoded handle contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleTarget {
    /// Export root
    Root,
    /// Object at a path
    Path(ObjectPath),
    /// Object by stable id
    Id {
        /// Registry epoch the handle was issued under
        epoch: u64,
        /// Object id
        id: ObjectId,
    },
}

/// Opaque NFSv4 filehandle as seen on the wire
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Filehandle(Bytes);

impl Filehandle {
    /// Wrap raw handle bytes received from a client
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// The root filehandle
    pub fn root() -> Self {
        Self(Bytes::from_static(&[FilehandleKind::Root as u8]))
    }

    fn path(path: &ObjectPath) -> Self {
        let mut buf = BytesMut::with_capacity(1 + path.len() + CHECKSUM_LEN);
        buf.put_u8(FilehandleKind::Path as u8);
        buf.put_slice(path.as_str().as_bytes());
        let sum = checksum(&buf);
        buf.put_slice(&sum);
        Self(buf.freeze())
    }

    fn id(epoch: u64, id: ObjectId) -> Self {
        let mut buf = BytesMut::with_capacity(ID_HANDLE_LEN);
        buf.put_u8(FilehandleKind::Id as u8);
        buf.put_u64(epoch);
        buf.put_u64(id);
        let sum = checksum(&buf);
        buf.put_slice(&sum);
        Self(buf.freeze())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check for a zero-length handle
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Type tag, if the first byte is a known tag
    pub fn kind(&self) -> Option<FilehandleKind> {
        self.0
            .first()
            .and_then(|tag| FilehandleKind::try_from(*tag).ok())
    }

    /// Check if this is the root filehandle
    pub fn is_root(&self) -> bool {
        self.0.len() == 1 && self.0[0] == FilehandleKind::Root as u8
    }

    /// Parse and validate the handle
    pub fn decode(&self) -> CommonResult<HandleTarget> {
        let data = self.as_bytes();
        if data.is_empty() || data.len() > FHSIZE {
            return Err(CommonError::InvalidHandle(format!(
                "invalid size: {}",
                data.len()
            )));
        }

        match FilehandleKind::try_from(data[0])? {
            FilehandleKind::Root => {
                if data.len() != 1 {
                    return Err(CommonError::InvalidHandle("trailing root bytes".into()));
                }
                Ok(HandleTarget::Root)
            }
            FilehandleKind::Path => {
                let body = verify_checksum(data)?;
                let path = std::str::from_utf8(&body[1..])
                    .map_err(|_| CommonError::InvalidHandle("path is not UTF-8".into()))?;
                Ok(HandleTarget::Path(ObjectPath::parse(path)))
            }
            FilehandleKind::Id => {
                if data.len() != ID_HANDLE_LEN {
                    return Err(CommonError::InvalidHandle(format!(
                        "id handle size: expected {}, got {}",
                        ID_HANDLE_LEN,
                        data.len()
                    )));
                }
                let body = verify_checksum(data)?;
                let mut fields = &body[1..];
                let epoch = fields.get_u64();
                let id = fields.get_u64();
                Ok(HandleTarget::Id { epoch, id })
            }
        }
    }
}

impl fmt::Debug for Filehandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(HandleTarget::Root) => write!(f, "Filehandle(root)"),
            Ok(HandleTarget::Path(path)) => write!(f, "Filehandle(path:{})", path),
            Ok(HandleTarget::Id { epoch, id }) => {
                write!(f, "Filehandle(id:{}@{:016x})", id, epoch)
            }
            Err(_) => {
                write!(f, "Filehandle(invalid:")?;
                for b in self.0.iter() {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }
    }
}

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = blake3::hash(data);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
    out
}

fn verify_checksum(data: &[u8]) -> CommonResult<&[u8]> {
    if data.len() <= CHECKSUM_LEN + 1 {
        return Err(CommonError::InvalidHandle("truncated handle".into()));
    }
    let (body, sum) = data.split_at(data.len() - CHECKSUM_LEN);
    if sum != checksum(body) {
        return Err(CommonError::InvalidHandle("checksum mismatch".into()));
    }
    Ok(body)
}

/// Resolved object: stable id plus its live path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    /// Stable id (keys lock, open and change state)
    pub id: ObjectId,
    /// Current path
    pub path: ObjectPath,
}

#[derive(Default)]
struct NameIndex {
    /// Paths per id; the first entry is the primary name
    by_id: HashMap<ObjectId, Vec<ObjectPath>>,
    by_path: BTreeMap<ObjectPath, ObjectId>,
}

impl NameIndex {
    /// `path` and every registered path below it
    fn subtree(&self, path: &ObjectPath) -> Vec<ObjectPath> {
        let mut out = Vec::new();
        if self.by_path.contains_key(path) {
            out.push(path.clone());
        }
        let prefix = if path.is_root() {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let range = self
            .by_path
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded));
        for (candidate, _) in range {
            if !candidate.as_str().starts_with(&prefix) {
                break;
            }
            if candidate != path {
                out.push(candidate.clone());
            }
        }
        out
    }

    /// Drop a path; returns the id if it lost its last name
    fn detach(&mut self, path: &ObjectPath) -> Option<ObjectId> {
        let id = self.by_path.remove(path)?;
        let orphaned = match self.by_id.get_mut(&id) {
            Some(paths) => {
                paths.retain(|p| p != path);
                paths.is_empty()
            }
            None => false,
        };
        if orphaned {
            self.by_id.remove(&id);
            Some(id)
        } else {
            None
        }
    }
}

/// Issues filehandles and resolves them back to live objects
pub struct FilehandleRegistry {
    /// Random per-instance value; Id handles from another instance are stale
    epoch: u64,
    policy: FilehandlePolicy,
    short_budget: usize,
    next_id: AtomicU64,
    index: RwLock<NameIndex>,
}

impl FilehandleRegistry {
    /// Create a registry with a random epoch
    pub fn new(policy: FilehandlePolicy, short_budget: usize) -> Self {
        Self::with_epoch(policy, short_budget, rand::random())
    }

    /// Create a registry with a fixed epoch
    pub fn with_epoch(policy: FilehandlePolicy, short_budget: usize, epoch: u64) -> Self {
        let mut index = NameIndex::default();
        index.by_id.insert(ROOT_ID, vec![ObjectPath::root()]);
        index.by_path.insert(ObjectPath::root(), ROOT_ID);

        Self {
            epoch,
            policy,
            short_budget: short_budget.min(FHSIZE),
            next_id: AtomicU64::new(ROOT_ID + 1),
            index: RwLock::new(index),
        }
    }

    /// Registry epoch embedded in Id handles
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Handle policy
    pub fn policy(&self) -> FilehandlePolicy {
        self.policy
    }

    /// Identity of the export root
    pub fn root(&self) -> ObjectIdentity {
        ObjectIdentity {
            id: ROOT_ID,
            path: ObjectPath::root(),
        }
    }

    /// Identity of the object at `path` if it is registered
    pub fn lookup(&self, path: &ObjectPath) -> Option<ObjectIdentity> {
        let id = *self.index.read().by_path.get(path)?;
        Some(ObjectIdentity {
            id,
            path: path.clone(),
        })
    }

    /// Identity of the object at `path`, allocating an id on first sight.
    /// Callers confirm the object exists first.
    pub fn identify(&self, path: &ObjectPath) -> ObjectIdentity {
        if let Some(identity) = self.lookup(path) {
            return identity;
        }

        let mut index = self.index.write();
        // Re-check under the write lock
        if let Some(id) = index.by_path.get(path) {
            return ObjectIdentity {
                id: *id,
                path: path.clone(),
            };
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        index.by_path.insert(path.clone(), id);
        index.by_id.insert(id, vec![path.clone()]);
        trace!(id, %path, "registered object");
        ObjectIdentity {
            id,
            path: path.clone(),
        }
    }

    /// Issue a handle for an identity. A Path handle is only produced when
    /// `prefer_short` is set and the encoded path fits the short budget.
    pub fn issue(&self, identity: &ObjectIdentity, prefer_short: bool) -> Filehandle {
        if identity.id == ROOT_ID {
            return Filehandle::root();
        }
        if prefer_short && 1 + identity.path.len() + CHECKSUM_LEN <= self.short_budget {
            Filehandle::path(&identity.path)
        } else {
            Filehandle::id(self.epoch, identity.id)
        }
    }

    /// Identify `path` and issue a handle according to the policy
    pub fn issue_for_path(&self, path: &ObjectPath) -> (ObjectIdentity, Filehandle) {
        let identity = self.identify(path);
        let handle = self.issue(&identity, self.policy == FilehandlePolicy::PreferPath);
        (identity, handle)
    }

    /// Resolve a handle to the object's stable id and live path.
    ///
    /// Never registers anything: a Path handle naming a path the registry
    /// does not know is stale here, and callers that can confirm the object
    /// exists adopt it with [`identify`](Self::identify).
    pub fn resolve(&self, handle: &Filehandle) -> CommonResult<ObjectIdentity> {
        match handle.decode()? {
            HandleTarget::Root => Ok(self.root()),
            HandleTarget::Path(path) => self
                .lookup(&path)
                .ok_or_else(|| CommonError::StaleHandle(format!("unregistered path {}", path))),
            HandleTarget::Id { epoch, id } => {
                if epoch != self.epoch {
                    return Err(CommonError::StaleHandle(format!(
                        "epoch {:016x} is not current",
                        epoch
                    )));
                }
                let index = self.index.read();
                let path = index
                    .by_id
                    .get(&id)
                    .and_then(|paths| paths.first())
                    .ok_or_else(|| CommonError::StaleHandle(format!("unknown object {}", id)))?;
                Ok(ObjectIdentity {
                    id,
                    path: path.clone(),
                })
            }
        }
    }

    /// Number of registered objects, the root included
    pub fn object_count(&self) -> usize {
        self.index.read().by_id.len()
    }

    /// Current primary path of an id
    pub fn path_of(&self, id: ObjectId) -> Option<ObjectPath> {
        self.index
            .read()
            .by_id
            .get(&id)
            .and_then(|paths| paths.first().cloned())
    }

    /// Record a rename: `from` and everything below it move to `to`.
    /// Whatever was registered at `to` is replaced.
    pub fn renamed(&self, from: &ObjectPath, to: &ObjectPath) {
        if from == to {
            return;
        }
        let mut index = self.index.write();

        for replaced in index.subtree(to) {
            index.detach(&replaced);
        }

        for old in index.subtree(from) {
            let Some(new) = old.rebase(from, to) else {
                continue;
            };
            let Some(id) = index.by_path.remove(&old) else {
                continue;
            };
            if let Some(paths) = index.by_id.get_mut(&id) {
                for path in paths.iter_mut() {
                    if *path == old {
                        *path = new.clone();
                    }
                }
            }
            index.by_path.insert(new, id);
        }
        trace!(%from, %to, "registry rename");
    }

    /// Record a new hard link to `id`
    pub fn linked(&self, id: ObjectId, path: &ObjectPath) {
        let mut index = self.index.write();
        index.detach(path);
        index.by_path.insert(path.clone(), id);
        index.by_id.entry(id).or_default().push(path.clone());
    }

    /// Record a removal. Returns the ids that no longer have any name.
    pub fn removed(&self, path: &ObjectPath) -> Vec<ObjectId> {
        let mut index = self.index.write();
        let mut orphaned = Vec::new();
        for gone in index.subtree(path) {
            if let Some(id) = index.detach(&gone) {
                orphaned.push(id);
            }
        }
        orphaned
    }
}

impl fmt::Debug for FilehandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilehandleRegistry")
            .field("epoch", &format_args!("{:016x}", self.epoch))
            .field("policy", &self.policy)
            .field("short_budget", &self.short_budget)
            .field("objects", &self.index.read().by_id.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FilehandleRegistry {
        FilehandleRegistry::with_epoch(FilehandlePolicy::PreferPath, FHSIZE, 7)
    }

    #[test]
    fn test_root_handle() {
        let reg = registry();
        let root = Filehandle::root();
        assert!(root.is_root());
        assert_eq!(root.kind(), Some(FilehandleKind::Root));
        assert_eq!(reg.resolve(&root).unwrap().id, ROOT_ID);
    }

    #[test]
    fn test_short_path_issues_path_handle() {
        let reg = registry();
        let (identity, fh) = reg.issue_for_path(&ObjectPath::parse("/docs/a.txt"));
        assert_eq!(fh.kind(), Some(FilehandleKind::Path));
        assert_eq!(reg.resolve(&fh).unwrap(), identity);
    }

    #[test]
    fn test_long_path_forces_id_handle() {
        let reg = registry();
        let long = format!("/{}", "n".repeat(200));
        let (identity, fh) = reg.issue_for_path(&ObjectPath::parse(&long));
        assert_eq!(fh.kind(), Some(FilehandleKind::Id));
        assert!(fh.len() <= FHSIZE);
        assert_eq!(reg.resolve(&fh).unwrap(), identity);
    }

    #[test]
    fn test_id_handle_survives_rename_and_rename_back() {
        let reg = FilehandleRegistry::with_epoch(FilehandlePolicy::AlwaysId, FHSIZE, 7);
        let original = ObjectPath::parse("/dir/file");
        let (identity, fh) = reg.issue_for_path(&original);

        let moved = ObjectPath::parse("/other/renamed");
        reg.renamed(&original, &moved);
        let resolved = reg.resolve(&fh).unwrap();
        assert_eq!(resolved.id, identity.id);
        assert_eq!(resolved.path, moved);

        reg.renamed(&moved, &original);
        assert_eq!(reg.resolve(&fh).unwrap().path, original);
    }

    #[test]
    fn test_directory_rename_moves_descendants() {
        let reg = FilehandleRegistry::with_epoch(FilehandlePolicy::AlwaysId, FHSIZE, 7);
        let (_, child) = reg.issue_for_path(&ObjectPath::parse("/a/b/c"));
        reg.identify(&ObjectPath::parse("/a"));
        reg.identify(&ObjectPath::parse("/ab"));

        reg.renamed(&ObjectPath::parse("/a"), &ObjectPath::parse("/z"));
        assert_eq!(reg.resolve(&child).unwrap().path.as_str(), "/z/b/c");
        // Sibling sharing a name prefix is untouched
        assert!(reg.index.read().by_path.contains_key("/ab"));
    }

    #[test]
    fn test_rename_over_existing_target_stales_it() {
        let reg = FilehandleRegistry::with_epoch(FilehandlePolicy::AlwaysId, FHSIZE, 7);
        let (_, victim) = reg.issue_for_path(&ObjectPath::parse("/target"));
        let (src, _) = reg.issue_for_path(&ObjectPath::parse("/source"));

        reg.renamed(&ObjectPath::parse("/source"), &ObjectPath::parse("/target"));
        assert!(matches!(reg.resolve(&victim), Err(CommonError::StaleHandle(_))));
        assert_eq!(reg.identify(&ObjectPath::parse("/target")).id, src.id);
    }

    #[test]
    fn test_link_alias_keeps_id_alive() {
        let reg = FilehandleRegistry::with_epoch(FilehandlePolicy::AlwaysId, FHSIZE, 7);
        let (identity, fh) = reg.issue_for_path(&ObjectPath::parse("/orig"));
        reg.linked(identity.id, &ObjectPath::parse("/alias"));

        assert!(reg.removed(&ObjectPath::parse("/orig")).is_empty());
        assert_eq!(reg.resolve(&fh).unwrap().path.as_str(), "/alias");

        assert_eq!(reg.removed(&ObjectPath::parse("/alias")), vec![identity.id]);
        assert!(reg.resolve(&fh).is_err());
    }

    #[test]
    fn test_corrupted_handle_rejected() {
        let reg = registry();
        let (_, fh) = reg.issue_for_path(&ObjectPath::parse("/f"));
        let mut bytes = fh.as_bytes().to_vec();
        bytes[2] ^= 0xFF;
        assert!(matches!(
            reg.resolve(&Filehandle::from_bytes(bytes)),
            Err(CommonError::InvalidHandle(_))
        ));
        assert!(reg.resolve(&Filehandle::from_bytes(vec![9u8])).is_err());
        assert!(reg.resolve(&Filehandle::from_bytes(Vec::new())).is_err());
    }

    #[test]
    fn test_unknown_path_handle_registers_nothing() {
        let reg = registry();
        for n in 0..100 {
            let fh = Filehandle::path(&ObjectPath::parse(&format!("/missing-{n}")));
            assert!(matches!(reg.resolve(&fh), Err(CommonError::StaleHandle(_))));
        }
        assert_eq!(reg.object_count(), 1);

        // Once adopted, the same handle resolves
        let path = ObjectPath::parse("/missing-0");
        let adopted = reg.identify(&path);
        assert_eq!(reg.resolve(&Filehandle::path(&path)).unwrap(), adopted);
        assert_eq!(reg.object_count(), 2);
    }

    #[test]
    fn test_debug_shows_invalid_bytes() {
        let fh = Filehandle::from_bytes(vec![0x09, 0xab]);
        assert_eq!(format!("{fh:?}"), "Filehandle(invalid:09ab)");
        assert_eq!(format!("{:?}", Filehandle::root()), "Filehandle(root)");
    }

    #[test]
    fn test_foreign_epoch_is_stale() {
        let reg = FilehandleRegistry::with_epoch(FilehandlePolicy::AlwaysId, FHSIZE, 7);
        let other = FilehandleRegistry::with_epoch(FilehandlePolicy::AlwaysId, FHSIZE, 8);
        let (_, fh) = other.issue_for_path(&ObjectPath::parse("/f"));
        assert!(matches!(reg.resolve(&fh), Err(CommonError::StaleHandle(_))));
    }
}
