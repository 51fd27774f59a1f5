//! NFS error types

use nfs4_common::{CommonError, LockError};
use thiserror::Error;

use crate::backend::BackendError;

/// NFS error types
#[derive(Debug, Error)]
pub enum NfsError {
    /// NFS protocol error
    #[error("NFS error: {0}")]
    Protocol(NfsStatus),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Shared state error (handles, clients)
    #[error("state error: {0}")]
    Common(#[from] CommonError),

    /// Byte-range lock error
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NfsError {
    /// Status code reported to the client for this error
    pub fn status(&self) -> NfsStatus {
        match self {
            NfsError::Protocol(status) => *status,
            NfsError::Backend(err) => err.into(),
            NfsError::Common(err) => err.into(),
            NfsError::Lock(err) => err.into(),
            NfsError::Config(_) => NfsStatus::Serverfault,
        }
    }
}

impl From<NfsStatus> for NfsError {
    fn from(status: NfsStatus) -> Self {
        NfsError::Protocol(status)
    }
}

/// NFS status codes (RFC 7530)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NfsStatus {
    /// Success
    Ok = 0,
    /// Permission denied
    Perm = 1,
    /// No such file or directory
    Noent = 2,
    /// I/O error
    Io = 5,
    /// No such device or address
    Nxio = 6,
    /// Access denied
    Access = 13,
    /// File exists
    Exist = 17,
    /// Cross-device link
    Xdev = 18,
    /// Not a directory
    Notdir = 20,
    /// Is a directory
    Isdir = 21,
    /// Invalid argument
    Inval = 22,
    /// File too large
    Fbig = 27,
    /// No space left on device
    Nospc = 28,
    /// Read-only file system
    Rofs = 30,
    /// Too many links
    Mlink = 31,
    /// File name too long
    Nametoolong = 63,
    /// Directory not empty
    Notempty = 66,
    /// Disk quota exceeded
    Dquot = 69,
    /// Stale file handle
    Stale = 70,
    /// Bad file handle
    Badhandle = 10001,
    /// Bad READDIR cookie
    BadCookie = 10003,
    /// Not supported
    Notsupp = 10004,
    /// Buffer too small
    Toosmall = 10005,
    /// Server fault
    Serverfault = 10006,
    /// Bad object type
    BadType = 10007,
    /// Retry later
    Delay = 10008,
    /// NVERIFY attributes matched
    Same = 10009,
    /// Lock range conflict
    Denied = 10010,
    /// Lease expired
    Expired = 10011,
    /// I/O blocked by a lock
    Locked = 10012,
    /// Grace period in effect
    Grace = 10013,
    /// Volatile filehandle expired
    FhExpired = 10014,
    /// Share reservation conflict
    ShareDenied = 10015,
    /// Wrong security flavor
    WrongSec = 10016,
    /// Client name in use by another principal
    ClidInuse = 10017,
    /// Request too large
    Resource = 10018,
    /// Filesystem moved
    Moved = 10019,
    /// No current filehandle
    NoFileHandle = 10020,
    /// Unsupported minor version
    MinorVersMismatch = 10021,
    /// Client id from a previous server instance
    StaleClientid = 10022,
    /// Stateid from a previous server instance
    StaleStateid = 10023,
    /// Stateid seqid is behind the current state
    OldStateid = 10024,
    /// Bad stateid
    BadStateid = 10025,
    /// Bad sequence id
    BadSeqid = 10026,
    /// VERIFY attributes did not match
    NotSame = 10027,
    /// Unlock range does not match a held lock
    LockRange = 10028,
    /// Object is a symbolic link
    Symlink = 10029,
    /// No saved filehandle
    RestoreFh = 10030,
    /// Lease moved
    LeaseMoved = 10031,
    /// Attribute not supported
    AttrNotsupp = 10032,
    /// No grace period for reclaim
    NoGrace = 10033,
    /// Reclaim rejected
    ReclaimBad = 10034,
    /// Reclaim conflicts with other state
    ReclaimConflict = 10035,
    /// Undecodable arguments
    BadXdr = 10036,
    /// Locks still held
    LocksHeld = 10037,
    /// Open mode does not permit the operation
    OpenMode = 10038,
    /// Owner string not mappable
    BadOwner = 10039,
    /// Invalid UTF-8 character
    BadChar = 10040,
    /// Invalid file name
    BadName = 10041,
    /// Byte range outside the lock range supported
    BadRange = 10042,
    /// Lock type not supported
    LockNotsupp = 10043,
    /// Illegal operation
    OpIllegal = 10044,
    /// Deadlock detected
    Deadlock = 10045,
    /// File is open
    FileOpen = 10046,
    /// State revoked by the administrator
    AdminRevoked = 10047,
    /// Callback path down
    CbPathDown = 10048,
}

impl NfsStatus {
    /// Check for success
    pub fn is_ok(&self) -> bool {
        *self == NfsStatus::Ok
    }

    /// Errors that neither advance an owner's seqid nor enter its replay
    /// cache (RFC 7530 section 9.1.7)
    pub fn is_seqid_neutral(&self) -> bool {
        matches!(
            self,
            NfsStatus::StaleClientid
                | NfsStatus::StaleStateid
                | NfsStatus::BadStateid
                | NfsStatus::OldStateid
                | NfsStatus::BadSeqid
                | NfsStatus::BadXdr
                | NfsStatus::Resource
                | NfsStatus::NoFileHandle
                | NfsStatus::Badhandle
                | NfsStatus::Delay
                | NfsStatus::Moved
        )
    }
}

impl std::fmt::Display for NfsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NfsStatus::Ok => "NFS4_OK",
            NfsStatus::Perm => "NFS4ERR_PERM",
            NfsStatus::Noent => "NFS4ERR_NOENT",
            NfsStatus::Io => "NFS4ERR_IO",
            NfsStatus::Nxio => "NFS4ERR_NXIO",
            NfsStatus::Access => "NFS4ERR_ACCESS",
            NfsStatus::Exist => "NFS4ERR_EXIST",
            NfsStatus::Xdev => "NFS4ERR_XDEV",
            NfsStatus::Notdir => "NFS4ERR_NOTDIR",
            NfsStatus::Isdir => "NFS4ERR_ISDIR",
            NfsStatus::Inval => "NFS4ERR_INVAL",
            NfsStatus::Fbig => "NFS4ERR_FBIG",
            NfsStatus::Nospc => "NFS4ERR_NOSPC",
            NfsStatus::Rofs => "NFS4ERR_ROFS",
            NfsStatus::Mlink => "NFS4ERR_MLINK",
            NfsStatus::Nametoolong => "NFS4ERR_NAMETOOLONG",
            NfsStatus::Notempty => "NFS4ERR_NOTEMPTY",
            NfsStatus::Dquot => "NFS4ERR_DQUOT",
            NfsStatus::Stale => "NFS4ERR_STALE",
            NfsStatus::Badhandle => "NFS4ERR_BADHANDLE",
            NfsStatus::BadCookie => "NFS4ERR_BAD_COOKIE",
            NfsStatus::Notsupp => "NFS4ERR_NOTSUPP",
            NfsStatus::Toosmall => "NFS4ERR_TOOSMALL",
            NfsStatus::Serverfault => "NFS4ERR_SERVERFAULT",
            NfsStatus::BadType => "NFS4ERR_BADTYPE",
            NfsStatus::Delay => "NFS4ERR_DELAY",
            NfsStatus::Same => "NFS4ERR_SAME",
            NfsStatus::Denied => "NFS4ERR_DENIED",
            NfsStatus::Expired => "NFS4ERR_EXPIRED",
            NfsStatus::Locked => "NFS4ERR_LOCKED",
            NfsStatus::Grace => "NFS4ERR_GRACE",
            NfsStatus::FhExpired => "NFS4ERR_FHEXPIRED",
            NfsStatus::ShareDenied => "NFS4ERR_SHARE_DENIED",
            NfsStatus::WrongSec => "NFS4ERR_WRONGSEC",
            NfsStatus::ClidInuse => "NFS4ERR_CLID_INUSE",
            NfsStatus::Resource => "NFS4ERR_RESOURCE",
            NfsStatus::Moved => "NFS4ERR_MOVED",
            NfsStatus::NoFileHandle => "NFS4ERR_NOFILEHANDLE",
            NfsStatus::MinorVersMismatch => "NFS4ERR_MINOR_VERS_MISMATCH",
            NfsStatus::StaleClientid => "NFS4ERR_STALE_CLIENTID",
            NfsStatus::StaleStateid => "NFS4ERR_STALE_STATEID",
            NfsStatus::OldStateid => "NFS4ERR_OLD_STATEID",
            NfsStatus::BadStateid => "NFS4ERR_BAD_STATEID",
            NfsStatus::BadSeqid => "NFS4ERR_BAD_SEQID",
            NfsStatus::NotSame => "NFS4ERR_NOT_SAME",
            NfsStatus::LockRange => "NFS4ERR_LOCK_RANGE",
            NfsStatus::Symlink => "NFS4ERR_SYMLINK",
            NfsStatus::RestoreFh => "NFS4ERR_RESTOREFH",
            NfsStatus::LeaseMoved => "NFS4ERR_LEASE_MOVED",
            NfsStatus::AttrNotsupp => "NFS4ERR_ATTRNOTSUPP",
            NfsStatus::NoGrace => "NFS4ERR_NO_GRACE",
            NfsStatus::ReclaimBad => "NFS4ERR_RECLAIM_BAD",
            NfsStatus::ReclaimConflict => "NFS4ERR_RECLAIM_CONFLICT",
            NfsStatus::BadXdr => "NFS4ERR_BADXDR",
            NfsStatus::LocksHeld => "NFS4ERR_LOCKS_HELD",
            NfsStatus::OpenMode => "NFS4ERR_OPENMODE",
            NfsStatus::BadOwner => "NFS4ERR_BADOWNER",
            NfsStatus::BadChar => "NFS4ERR_BADCHAR",
            NfsStatus::BadName => "NFS4ERR_BADNAME",
            NfsStatus::BadRange => "NFS4ERR_BAD_RANGE",
            NfsStatus::LockNotsupp => "NFS4ERR_LOCK_NOTSUPP",
            NfsStatus::OpIllegal => "NFS4ERR_OP_ILLEGAL",
            NfsStatus::Deadlock => "NFS4ERR_DEADLOCK",
            NfsStatus::FileOpen => "NFS4ERR_FILE_OPEN",
            NfsStatus::AdminRevoked => "NFS4ERR_ADMIN_REVOKED",
            NfsStatus::CbPathDown => "NFS4ERR_CB_PATH_DOWN",
        };
        write!(f, "{}", name)
    }
}

impl From<&CommonError> for NfsStatus {
    fn from(err: &CommonError) -> Self {
        match err {
            CommonError::InvalidHandle(_) => NfsStatus::Badhandle,
            CommonError::StaleHandle(_) => NfsStatus::Stale,
            CommonError::StaleClient(_) => NfsStatus::StaleClientid,
            CommonError::ClientInUse(_) => NfsStatus::ClidInuse,
        }
    }
}

impl From<CommonError> for NfsStatus {
    fn from(err: CommonError) -> Self {
        (&err).into()
    }
}

impl From<&LockError> for NfsStatus {
    fn from(err: &LockError) -> Self {
        match err {
            LockError::Denied(_) => NfsStatus::Denied,
            LockError::InvalidRange { .. } => NfsStatus::Inval,
            LockError::PartialRange { .. } => NfsStatus::LockRange,
        }
    }
}

impl From<&BackendError> for NfsStatus {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::NotFound => NfsStatus::Noent,
            BackendError::Exists => NfsStatus::Exist,
            BackendError::NotDirectory => NfsStatus::Notdir,
            BackendError::IsDirectory => NfsStatus::Isdir,
            BackendError::NotEmpty => NfsStatus::Notempty,
            BackendError::PermissionDenied => NfsStatus::Access,
            BackendError::NotPermitted => NfsStatus::Perm,
            BackendError::ReadOnly => NfsStatus::Rofs,
            BackendError::NoSpace => NfsStatus::Nospc,
            BackendError::TooLarge => NfsStatus::Fbig,
            BackendError::TooManyLinks => NfsStatus::Mlink,
            BackendError::CrossDevice => NfsStatus::Xdev,
            BackendError::NameTooLong => NfsStatus::Nametoolong,
            BackendError::WrongType => NfsStatus::Inval,
            BackendError::Symlink => NfsStatus::Symlink,
            BackendError::Invalid(_) => NfsStatus::Inval,
            BackendError::NotSupported => NfsStatus::Notsupp,
            BackendError::Io(_) => NfsStatus::Io,
        }
    }
}

impl From<BackendError> for NfsStatus {
    fn from(err: BackendError) -> Self {
        (&err).into()
    }
}

/// Result type for NFS operations
pub type NfsResult<T> = Result<T, NfsError>;
