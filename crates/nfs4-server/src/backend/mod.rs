//! Storage backend interface
//!
//! The dispatcher reaches the filesystem only through
//! [`OperationsBackend`]. Objects are addressed by their current path; the
//! filehandle registry keeps the mapping from stable ids to paths.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nfs4_common::ObjectPath;
use thiserror::Error;

use crate::nfs4::{Nfs4FileType, SetTime};

pub use memory::MemoryBackend;

/// Backend error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Object does not exist
    #[error("no such file or directory")]
    NotFound,
    /// Object already exists
    #[error("object exists")]
    Exists,
    /// Path component is not a directory
    #[error("not a directory")]
    NotDirectory,
    /// Operation needs a non-directory
    #[error("is a directory")]
    IsDirectory,
    /// Directory still has entries
    #[error("directory not empty")]
    NotEmpty,
    /// Caller lacks permission
    #[error("permission denied")]
    PermissionDenied,
    /// Operation is not permitted for anyone
    #[error("operation not permitted")]
    NotPermitted,
    /// Filesystem is read-only
    #[error("read-only filesystem")]
    ReadOnly,
    /// Out of space
    #[error("no space left")]
    NoSpace,
    /// File would exceed the maximum size
    #[error("file too large")]
    TooLarge,
    /// Link count limit reached
    #[error("too many links")]
    TooManyLinks,
    /// Rename or link across filesystems
    #[error("cross-device link")]
    CrossDevice,
    /// Name exceeds the backend limit
    #[error("name too long")]
    NameTooLong,
    /// Object type does not support the operation
    #[error("wrong object type")]
    WrongType,
    /// Object is a symbolic link
    #[error("object is a symbolic link")]
    Symlink,
    /// Invalid argument
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// Operation not supported by this backend
    #[error("not supported")]
    NotSupported,
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Object attributes as the backend reports them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    /// Object type
    pub file_type: Nfs4FileType,
    /// Permission bits
    pub mode: u32,
    /// Hard link count
    pub nlink: u32,
    /// Owner uid
    pub uid: u32,
    /// Owner gid
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Space used in bytes
    pub used: u64,
    /// Backend object number
    pub fileid: u64,
    /// Device numbers for block/character devices
    pub rdev: (u32, u32),
    /// Last access time
    pub atime: DateTime<Utc>,
    /// Last data modification time
    pub mtime: DateTime<Utc>,
    /// Last metadata change time
    pub ctime: DateTime<Utc>,
    /// Backend change counter of the object itself
    pub change: u64,
}

impl FileAttr {
    /// Check for a directory
    pub fn is_dir(&self) -> bool {
        self.file_type == Nfs4FileType::Directory
    }
}

/// Attribute changes requested by SETATTR, CREATE or OPEN
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrs {
    /// New permission bits
    pub mode: Option<u32>,
    /// New owner uid
    pub uid: Option<u32>,
    /// New owner gid
    pub gid: Option<u32>,
    /// New size (truncate or extend)
    pub size: Option<u64>,
    /// New access time
    pub atime: Option<SetTime>,
    /// New modification time
    pub mtime: Option<SetTime>,
}

impl SetAttrs {
    /// Check if nothing is requested
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Non-regular object kinds made by CREATE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateKind {
    /// Symbolic link with its target
    Symlink(String),
    /// Block device
    BlockDevice(u32, u32),
    /// Character device
    CharDevice(u32, u32),
    /// Socket
    Socket,
    /// FIFO
    Fifo,
    /// Directory
    Directory,
}

impl CreateKind {
    /// Resulting object type
    pub fn file_type(&self) -> Nfs4FileType {
        match self {
            CreateKind::Symlink(_) => Nfs4FileType::SymLink,
            CreateKind::BlockDevice(..) => Nfs4FileType::BlockDevice,
            CreateKind::CharDevice(..) => Nfs4FileType::CharDevice,
            CreateKind::Socket => Nfs4FileType::Socket,
            CreateKind::Fifo => Nfs4FileType::Fifo,
            CreateKind::Directory => Nfs4FileType::Directory,
        }
    }
}

/// How OPEN creates a regular file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateHow {
    /// Create or open an existing file, applying attributes
    Unchecked(SetAttrs),
    /// Fail with `Exists` if the file exists
    Guarded(SetAttrs),
    /// Exclusive create keyed by a client verifier; a retry with the same
    /// verifier succeeds
    Exclusive([u8; 8]),
}

/// Outcome of an OPEN-with-create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedFile {
    /// Attributes after the call
    pub attr: FileAttr,
    /// False when an existing file was opened
    pub created: bool,
}

/// Data returned by READ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadData {
    /// Bytes read
    pub data: Bytes,
    /// Read reached end of file
    pub eof: bool,
}

/// Stability level of a WRITE (`stable_how4`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum StableHow {
    /// May be cached
    Unstable = 0,
    /// Data committed, metadata may be cached
    DataSync = 1,
    /// Data and metadata committed
    FileSync = 2,
}

/// Result of a backend write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes written
    pub count: u32,
    /// Level the data reached
    pub committed: StableHow,
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Entry attributes
    pub attr: FileAttr,
}

/// Filesystem capability interface
#[async_trait]
pub trait OperationsBackend: Send + Sync {
    /// Attributes of an object
    async fn getattr(&self, path: &ObjectPath) -> BackendResult<FileAttr>;

    /// Apply attribute changes; returns the new attributes
    async fn setattr(&self, path: &ObjectPath, attrs: &SetAttrs) -> BackendResult<FileAttr>;

    /// Look up `name` in directory `dir`
    async fn lookup(&self, dir: &ObjectPath, name: &str) -> BackendResult<FileAttr>;

    /// Read up to `count` bytes at `offset`
    async fn read(&self, path: &ObjectPath, offset: u64, count: u32) -> BackendResult<ReadData>;

    /// Write `data` at `offset`
    async fn write(
        &self,
        path: &ObjectPath,
        offset: u64,
        data: Bytes,
        stable: StableHow,
    ) -> BackendResult<WriteOutcome>;

    /// Flush cached writes for a range
    async fn commit(&self, path: &ObjectPath, offset: u64, count: u32) -> BackendResult<()>;

    /// Create a non-regular object
    async fn create(
        &self,
        dir: &ObjectPath,
        name: &str,
        kind: &CreateKind,
        attrs: &SetAttrs,
    ) -> BackendResult<FileAttr>;

    /// Create (or open) a regular file for OPEN
    async fn create_file(
        &self,
        dir: &ObjectPath,
        name: &str,
        how: &CreateHow,
    ) -> BackendResult<CreatedFile>;

    /// Remove a directory entry
    async fn remove(&self, dir: &ObjectPath, name: &str) -> BackendResult<()>;

    /// Rename an entry, replacing a compatible target
    async fn rename(
        &self,
        from_dir: &ObjectPath,
        from_name: &str,
        to_dir: &ObjectPath,
        to_name: &str,
    ) -> BackendResult<()>;

    /// Create a hard link to `source` named `name` in `dir`
    async fn link(&self, source: &ObjectPath, dir: &ObjectPath, name: &str) -> BackendResult<()>;

    /// Entries of a directory, sorted by name
    async fn readdir(&self, dir: &ObjectPath) -> BackendResult<Vec<DirEntry>>;

    /// Target of a symbolic link
    async fn readlink(&self, path: &ObjectPath) -> BackendResult<String>;
}
