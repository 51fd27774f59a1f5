//! In-memory filesystem backend
//!
//! A small inode filesystem held behind a single lock. It honours POSIX
//! rename/remove/link rules closely enough to exercise the dispatcher and is
//! handy for embedding and tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nfs4_common::ObjectPath;
use parking_lot::RwLock;
use tracing::trace;

use super::{
    BackendError, BackendResult, CreateHow, CreateKind, CreatedFile, DirEntry, FileAttr,
    OperationsBackend, ReadData, SetAttrs, StableHow, WriteOutcome,
};
use crate::nfs4::{Nfs4FileType, SetTime};

const ROOT_INO: u64 = 1;

/// Largest file the backend accepts
pub const MAX_FILE_SIZE: u64 = 1 << 40;

#[derive(Debug, Clone)]
enum Content {
    File {
        data: Vec<u8>,
        verifier: Option<[u8; 8]>,
    },
    Directory {
        entries: BTreeMap<String, u64>,
        parent: u64,
    },
    Symlink(String),
    Special {
        file_type: Nfs4FileType,
        rdev: (u32, u32),
    },
}

#[derive(Debug, Clone)]
struct Inode {
    content: Content,
    mode: u32,
    nlink: u32,
    uid: u32,
    gid: u32,
    atime: DateTime<Utc>,
    mtime: DateTime<Utc>,
    ctime: DateTime<Utc>,
    change: u64,
}

impl Inode {
    fn new(content: Content, mode: u32, change: u64) -> Self {
        let now = Utc::now();
        let nlink = if matches!(content, Content::Directory { .. }) {
            2
        } else {
            1
        };
        Self {
            content,
            mode,
            nlink,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            change,
        }
    }

    fn file_type(&self) -> Nfs4FileType {
        match &self.content {
            Content::File { .. } => Nfs4FileType::Regular,
            Content::Directory { .. } => Nfs4FileType::Directory,
            Content::Symlink(_) => Nfs4FileType::SymLink,
            Content::Special { file_type, .. } => *file_type,
        }
    }

    fn size(&self) -> u64 {
        match &self.content {
            Content::File { data, .. } => data.len() as u64,
            Content::Directory { entries, .. } => 4096 + 32 * entries.len() as u64,
            Content::Symlink(target) => target.len() as u64,
            Content::Special { .. } => 0,
        }
    }

    fn attr(&self, ino: u64) -> FileAttr {
        let rdev = match &self.content {
            Content::Special { rdev, .. } => *rdev,
            _ => (0, 0),
        };
        let size = self.size();
        FileAttr {
            file_type: self.file_type(),
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            size,
            used: size.div_ceil(4096) * 4096,
            fileid: ino,
            rdev,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            change: self.change,
        }
    }
}

#[derive(Debug)]
struct Tree {
    inodes: HashMap<u64, Inode>,
    next_ino: u64,
    tick: u64,
}

impl Tree {
    fn new() -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_INO,
            Inode::new(
                Content::Directory {
                    entries: BTreeMap::new(),
                    parent: ROOT_INO,
                },
                0o777,
                1,
            ),
        );
        Self {
            inodes,
            next_ino: ROOT_INO + 1,
            tick: 1,
        }
    }

    fn next_change(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn inode(&self, ino: u64) -> BackendResult<&Inode> {
        self.inodes.get(&ino).ok_or(BackendError::NotFound)
    }

    fn inode_mut(&mut self, ino: u64) -> BackendResult<&mut Inode> {
        self.inodes.get_mut(&ino).ok_or(BackendError::NotFound)
    }

    fn entries(&self, dir: u64) -> BackendResult<&BTreeMap<String, u64>> {
        match &self.inode(dir)?.content {
            Content::Directory { entries, .. } => Ok(entries),
            _ => Err(BackendError::NotDirectory),
        }
    }

    fn entries_mut(&mut self, dir: u64) -> BackendResult<&mut BTreeMap<String, u64>> {
        match &mut self.inode_mut(dir)?.content {
            Content::Directory { entries, .. } => Ok(entries),
            _ => Err(BackendError::NotDirectory),
        }
    }

    fn resolve(&self, path: &ObjectPath) -> BackendResult<u64> {
        let mut ino = ROOT_INO;
        for name in path.components() {
            ino = *self
                .entries(ino)?
                .get(name)
                .ok_or(BackendError::NotFound)?;
        }
        Ok(ino)
    }

    fn child(&self, dir: u64, name: &str) -> BackendResult<Option<u64>> {
        Ok(self.entries(dir)?.get(name).copied())
    }

    fn touch_dir(&mut self, dir: u64) -> BackendResult<()> {
        let change = self.next_change();
        let inode = self.inode_mut(dir)?;
        let now = Utc::now();
        inode.mtime = now;
        inode.ctime = now;
        inode.change = change;
        Ok(())
    }

    fn insert(&mut self, dir: u64, name: &str, inode: Inode) -> BackendResult<u64> {
        if self.child(dir, name)?.is_some() {
            return Err(BackendError::Exists);
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        let is_dir = matches!(inode.content, Content::Directory { .. });
        self.inodes.insert(ino, inode);
        self.entries_mut(dir)?.insert(name.to_string(), ino);
        if is_dir {
            self.inode_mut(dir)?.nlink += 1;
        }
        self.touch_dir(dir)?;
        Ok(ino)
    }

    /// Drop one name of `ino`; frees the inode with its last link
    fn unlink(&mut self, dir: u64, name: &str, ino: u64) -> BackendResult<()> {
        self.entries_mut(dir)?.remove(name);
        let is_dir = matches!(self.inode(ino)?.content, Content::Directory { .. });
        if is_dir {
            self.inode_mut(dir)?.nlink -= 1;
            self.inodes.remove(&ino);
        } else {
            let change = self.next_change();
            let inode = self.inode_mut(ino)?;
            inode.nlink = inode.nlink.saturating_sub(1);
            inode.ctime = Utc::now();
            inode.change = change;
            if inode.nlink == 0 {
                self.inodes.remove(&ino);
            }
        }
        self.touch_dir(dir)
    }

    fn is_within(&self, mut ino: u64, ancestor: u64) -> bool {
        loop {
            if ino == ancestor {
                return true;
            }
            match self.inodes.get(&ino).map(|i| &i.content) {
                Some(Content::Directory { parent, .. }) if *parent != ino => ino = *parent,
                _ => return false,
            }
        }
    }

    fn apply(&mut self, ino: u64, attrs: &SetAttrs) -> BackendResult<()> {
        let change = self.next_change();
        let inode = self.inode_mut(ino)?;
        if let Some(size) = attrs.size {
            match &mut inode.content {
                Content::File { data, .. } => {
                    if size > MAX_FILE_SIZE {
                        return Err(BackendError::TooLarge);
                    }
                    data.resize(size as usize, 0);
                    inode.mtime = Utc::now();
                }
                Content::Directory { .. } => return Err(BackendError::IsDirectory),
                _ => return Err(BackendError::WrongType),
            }
        }
        if let Some(mode) = attrs.mode {
            inode.mode = mode & 0o7777;
        }
        if let Some(uid) = attrs.uid {
            inode.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            inode.gid = gid;
        }
        if let Some(atime) = attrs.atime {
            inode.atime = resolve_time(atime)?;
        }
        if let Some(mtime) = attrs.mtime {
            inode.mtime = resolve_time(mtime)?;
        }
        inode.ctime = Utc::now();
        inode.change = change;
        Ok(())
    }
}

fn resolve_time(time: SetTime) -> BackendResult<DateTime<Utc>> {
    match time {
        SetTime::ServerTime => Ok(Utc::now()),
        SetTime::ClientTime(t) => t
            .to_datetime()
            .ok_or_else(|| BackendError::Invalid("time out of range".into())),
    }
}

/// In-memory filesystem
#[derive(Debug)]
pub struct MemoryBackend {
    tree: RwLock<Tree>,
}

impl MemoryBackend {
    /// Create an empty filesystem with a world-writable root
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(Tree::new()),
        }
    }

    /// Create a regular file (and any missing parent directories)
    pub fn insert_file(&self, path: &str, data: &[u8]) -> BackendResult<()> {
        let path = ObjectPath::parse(path);
        let (parent, name) = split(&path)?;
        let dir = self.ensure_dir(&parent)?;
        let mut tree = self.tree.write();
        let change = tree.next_change();
        tree.insert(
            dir,
            name,
            Inode::new(
                Content::File {
                    data: data.to_vec(),
                    verifier: None,
                },
                0o644,
                change,
            ),
        )?;
        Ok(())
    }

    /// Create a directory path, like `mkdir -p`
    pub fn insert_dir(&self, path: &str) -> BackendResult<()> {
        self.ensure_dir(&ObjectPath::parse(path)).map(|_| ())
    }

    fn ensure_dir(&self, path: &ObjectPath) -> BackendResult<u64> {
        let mut tree = self.tree.write();
        let mut ino = ROOT_INO;
        for name in path.components() {
            ino = match tree.child(ino, name)? {
                Some(child) => child,
                None => {
                    let change = tree.next_change();
                    let parent = ino;
                    tree.insert(
                        parent,
                        name,
                        Inode::new(
                            Content::Directory {
                                entries: BTreeMap::new(),
                                parent,
                            },
                            0o755,
                            change,
                        ),
                    )?
                }
            };
        }
        Ok(ino)
    }

    /// Whole contents of a regular file
    pub fn contents(&self, path: &str) -> BackendResult<Vec<u8>> {
        let tree = self.tree.read();
        let ino = tree.resolve(&ObjectPath::parse(path))?;
        match &tree.inode(ino)?.content {
            Content::File { data, .. } => Ok(data.clone()),
            _ => Err(BackendError::WrongType),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn split(path: &ObjectPath) -> BackendResult<(ObjectPath, &str)> {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(BackendError::Invalid("path has no final component".into())),
    }
}

#[async_trait]
impl OperationsBackend for MemoryBackend {
    async fn getattr(&self, path: &ObjectPath) -> BackendResult<FileAttr> {
        let tree = self.tree.read();
        let ino = tree.resolve(path)?;
        Ok(tree.inode(ino)?.attr(ino))
    }

    async fn setattr(&self, path: &ObjectPath, attrs: &SetAttrs) -> BackendResult<FileAttr> {
        let mut tree = self.tree.write();
        let ino = tree.resolve(path)?;
        tree.apply(ino, attrs)?;
        Ok(tree.inode(ino)?.attr(ino))
    }

    async fn lookup(&self, dir: &ObjectPath, name: &str) -> BackendResult<FileAttr> {
        let tree = self.tree.read();
        let dir = tree.resolve(dir)?;
        let ino = tree.child(dir, name)?.ok_or(BackendError::NotFound)?;
        Ok(tree.inode(ino)?.attr(ino))
    }

    async fn read(&self, path: &ObjectPath, offset: u64, count: u32) -> BackendResult<ReadData> {
        let tree = self.tree.read();
        let ino = tree.resolve(path)?;
        match &tree.inode(ino)?.content {
            Content::File { data, .. } => {
                let len = data.len() as u64;
                let start = offset.min(len) as usize;
                let end = offset.saturating_add(count as u64).min(len) as usize;
                Ok(ReadData {
                    data: Bytes::copy_from_slice(&data[start..end]),
                    eof: end as u64 >= len,
                })
            }
            Content::Directory { .. } => Err(BackendError::IsDirectory),
            _ => Err(BackendError::WrongType),
        }
    }

    async fn write(
        &self,
        path: &ObjectPath,
        offset: u64,
        data: Bytes,
        _stable: StableHow,
    ) -> BackendResult<WriteOutcome> {
        let mut tree = self.tree.write();
        let ino = tree.resolve(path)?;
        let change = tree.next_change();
        let inode = tree.inode_mut(ino)?;
        match &mut inode.content {
            Content::File { data: contents, .. } => {
                let end = offset
                    .checked_add(data.len() as u64)
                    .filter(|end| *end <= MAX_FILE_SIZE)
                    .ok_or(BackendError::TooLarge)?;
                if end as usize > contents.len() {
                    contents.resize(end as usize, 0);
                }
                contents[offset as usize..end as usize].copy_from_slice(&data);
            }
            Content::Directory { .. } => return Err(BackendError::IsDirectory),
            _ => return Err(BackendError::WrongType),
        }
        let now = Utc::now();
        inode.mtime = now;
        inode.ctime = now;
        inode.change = change;
        trace!(%path, offset, len = data.len(), "memory write");
        // Everything lives in memory; report the strongest level
        Ok(WriteOutcome {
            count: data.len() as u32,
            committed: StableHow::FileSync,
        })
    }

    async fn commit(&self, path: &ObjectPath, _offset: u64, _count: u32) -> BackendResult<()> {
        let tree = self.tree.read();
        let ino = tree.resolve(path)?;
        match tree.inode(ino)?.content {
            Content::File { .. } => Ok(()),
            Content::Directory { .. } => Err(BackendError::IsDirectory),
            _ => Err(BackendError::WrongType),
        }
    }

    async fn create(
        &self,
        dir: &ObjectPath,
        name: &str,
        kind: &CreateKind,
        attrs: &SetAttrs,
    ) -> BackendResult<FileAttr> {
        let mut tree = self.tree.write();
        let parent = tree.resolve(dir)?;
        let change = tree.next_change();
        let (content, mode) = match kind {
            CreateKind::Directory => (
                Content::Directory {
                    entries: BTreeMap::new(),
                    parent,
                },
                0o755,
            ),
            CreateKind::Symlink(target) => (Content::Symlink(target.clone()), 0o777),
            CreateKind::BlockDevice(major, minor) | CreateKind::CharDevice(major, minor) => (
                Content::Special {
                    file_type: kind.file_type(),
                    rdev: (*major, *minor),
                },
                0o644,
            ),
            CreateKind::Socket | CreateKind::Fifo => (
                Content::Special {
                    file_type: kind.file_type(),
                    rdev: (0, 0),
                },
                0o644,
            ),
        };
        let ino = tree.insert(parent, name, Inode::new(content, mode, change))?;
        if !attrs.is_empty() {
            tree.apply(ino, attrs)?;
        }
        Ok(tree.inode(ino)?.attr(ino))
    }

    async fn create_file(
        &self,
        dir: &ObjectPath,
        name: &str,
        how: &CreateHow,
    ) -> BackendResult<CreatedFile> {
        let mut tree = self.tree.write();
        let parent = tree.resolve(dir)?;

        if let Some(ino) = tree.child(parent, name)? {
            let held_verifier = match &tree.inode(ino)?.content {
                Content::Directory { .. } => return Err(BackendError::IsDirectory),
                Content::File { verifier, .. } => *verifier,
                _ => None,
            };
            match how {
                CreateHow::Guarded(_) => return Err(BackendError::Exists),
                CreateHow::Exclusive(verifier) => {
                    if held_verifier.as_ref() != Some(verifier) {
                        return Err(BackendError::Exists);
                    }
                }
                CreateHow::Unchecked(attrs) => {
                    if !attrs.is_empty() {
                        tree.apply(ino, attrs)?;
                    }
                }
            }
            return Ok(CreatedFile {
                attr: tree.inode(ino)?.attr(ino),
                created: false,
            });
        }

        let change = tree.next_change();
        let verifier = match how {
            CreateHow::Exclusive(verifier) => Some(*verifier),
            _ => None,
        };
        let ino = tree.insert(
            parent,
            name,
            Inode::new(
                Content::File {
                    data: Vec::new(),
                    verifier,
                },
                0o644,
                change,
            ),
        )?;
        match how {
            CreateHow::Unchecked(attrs) | CreateHow::Guarded(attrs) if !attrs.is_empty() => {
                tree.apply(ino, attrs)?;
            }
            _ => {}
        }
        Ok(CreatedFile {
            attr: tree.inode(ino)?.attr(ino),
            created: true,
        })
    }

    async fn remove(&self, dir: &ObjectPath, name: &str) -> BackendResult<()> {
        let mut tree = self.tree.write();
        let parent = tree.resolve(dir)?;
        let ino = tree.child(parent, name)?.ok_or(BackendError::NotFound)?;
        if let Content::Directory { entries, .. } = &tree.inode(ino)?.content {
            if !entries.is_empty() {
                return Err(BackendError::NotEmpty);
            }
        }
        tree.unlink(parent, name, ino)
    }

    async fn rename(
        &self,
        from_dir: &ObjectPath,
        from_name: &str,
        to_dir: &ObjectPath,
        to_name: &str,
    ) -> BackendResult<()> {
        let mut tree = self.tree.write();
        let src_dir = tree.resolve(from_dir)?;
        let dst_dir = tree.resolve(to_dir)?;
        let ino = tree
            .child(src_dir, from_name)?
            .ok_or(BackendError::NotFound)?;
        let moving_dir = matches!(tree.inode(ino)?.content, Content::Directory { .. });

        if moving_dir && tree.is_within(dst_dir, ino) {
            return Err(BackendError::Invalid(
                "cannot move a directory below itself".into(),
            ));
        }

        if let Some(target) = tree.child(dst_dir, to_name)? {
            if target == ino {
                return Ok(());
            }
            match (&tree.inode(target)?.content, moving_dir) {
                (Content::Directory { entries, .. }, true) => {
                    if !entries.is_empty() {
                        return Err(BackendError::NotEmpty);
                    }
                }
                (Content::Directory { .. }, false) => return Err(BackendError::IsDirectory),
                (_, true) => return Err(BackendError::NotDirectory),
                (_, false) => {}
            }
            tree.unlink(dst_dir, to_name, target)?;
        }

        tree.entries_mut(src_dir)?.remove(from_name);
        tree.entries_mut(dst_dir)?.insert(to_name.to_string(), ino);
        if moving_dir && src_dir != dst_dir {
            tree.inode_mut(src_dir)?.nlink -= 1;
            tree.inode_mut(dst_dir)?.nlink += 1;
            if let Content::Directory { parent, .. } = &mut tree.inode_mut(ino)?.content {
                *parent = dst_dir;
            }
        }
        let change = tree.next_change();
        let inode = tree.inode_mut(ino)?;
        inode.ctime = Utc::now();
        inode.change = change;
        tree.touch_dir(src_dir)?;
        tree.touch_dir(dst_dir)
    }

    async fn link(&self, source: &ObjectPath, dir: &ObjectPath, name: &str) -> BackendResult<()> {
        let mut tree = self.tree.write();
        let ino = tree.resolve(source)?;
        if matches!(tree.inode(ino)?.content, Content::Directory { .. }) {
            return Err(BackendError::IsDirectory);
        }
        let parent = tree.resolve(dir)?;
        if tree.child(parent, name)?.is_some() {
            return Err(BackendError::Exists);
        }
        tree.entries_mut(parent)?.insert(name.to_string(), ino);
        let change = tree.next_change();
        let inode = tree.inode_mut(ino)?;
        inode.nlink += 1;
        inode.ctime = Utc::now();
        inode.change = change;
        tree.touch_dir(parent)
    }

    async fn readdir(&self, dir: &ObjectPath) -> BackendResult<Vec<DirEntry>> {
        let tree = self.tree.read();
        let ino = tree.resolve(dir)?;
        tree.entries(ino)?
            .iter()
            .map(|(name, child)| {
                Ok(DirEntry {
                    name: name.clone(),
                    attr: tree.inode(*child)?.attr(*child),
                })
            })
            .collect()
    }

    async fn readlink(&self, path: &ObjectPath) -> BackendResult<String> {
        let tree = self.tree.read();
        let ino = tree.resolve(path)?;
        match &tree.inode(ino)?.content {
            Content::Symlink(target) => Ok(target.clone()),
            _ => Err(BackendError::WrongType),
        }
    }
}
