//! NFSv4.0 operation arguments and results
//!
//! Handlers live in [`fs`] (filehandle, namespace, attribute and I/O
//! operations) and [`state`] (client, open and lock operations). Each takes
//! the shared server state plus the per-call [`CompoundContext`] and
//! returns an [`OpResult`].

pub mod fs;
pub mod state;

use bytes::Bytes;
use nfs4_common::{
    ChangeInfo, ClientGrant, Filehandle, LockDenied, LockKind, ObjectIdentity, OwnerKey, Verifier,
};

use super::attr::{Bitmap, Fattr};
use super::compound::CompoundContext;
use super::Stateid;
use crate::backend::{CreateKind, StableHow};
use crate::error::NfsStatus;
use crate::server::ServerState;

// ============================================================================
// Filehandle operations
// ============================================================================

/// PUTFH arguments
#[derive(Debug, Clone)]
pub struct PutFhArgs {
    /// Filehandle to set as current
    pub object: Filehandle,
}

/// LOOKUP arguments
#[derive(Debug, Clone)]
pub struct LookupArgs {
    /// Component to look up in the current directory
    pub name: String,
}

// ============================================================================
// Attribute operations
// ============================================================================

/// ACCESS arguments
#[derive(Debug, Clone, Copy)]
pub struct AccessArgs {
    /// Requested `ACCESS4_*` bits
    pub access: u32,
}

/// GETATTR arguments
#[derive(Debug, Clone)]
pub struct GetAttrArgs {
    /// Requested attributes
    pub request: Bitmap,
}

/// SETATTR arguments
#[derive(Debug, Clone)]
pub struct SetAttrArgs {
    /// Stateid authorizing a size change
    pub stateid: Stateid,
    /// Attributes to set
    pub attrs: Fattr,
}

/// VERIFY / NVERIFY arguments
#[derive(Debug, Clone)]
pub struct VerifyArgs {
    /// Values to compare against the current object
    pub attrs: Fattr,
}

// ============================================================================
// Namespace operations
// ============================================================================

/// CREATE arguments
#[derive(Debug, Clone)]
pub struct CreateArgs {
    /// Object type (regular files are made by OPEN)
    pub kind: CreateKind,
    /// Name in the current directory
    pub name: String,
    /// Initial attributes
    pub attrs: Fattr,
}

/// REMOVE arguments
#[derive(Debug, Clone)]
pub struct RemoveArgs {
    /// Entry to remove from the current directory
    pub target: String,
}

/// RENAME arguments (saved = source directory, current = target directory)
#[derive(Debug, Clone)]
pub struct RenameArgs {
    /// Name in the source directory
    pub old_name: String,
    /// Name in the target directory
    pub new_name: String,
}

/// LINK arguments (saved = source object, current = target directory)
#[derive(Debug, Clone)]
pub struct LinkArgs {
    /// New name in the target directory
    pub new_name: String,
}

/// READDIR arguments
#[derive(Debug, Clone)]
pub struct ReadDirArgs {
    /// Resume after this cookie; 0 starts at the beginning
    pub cookie: u64,
    /// Verifier returned with the cookie
    pub cookieverf: [u8; 8],
    /// Hint for the directory information size
    pub dircount: u32,
    /// Upper bound on the reply size
    pub maxcount: u32,
    /// Attributes wanted for each entry
    pub request: Bitmap,
}

/// SECINFO arguments
#[derive(Debug, Clone)]
pub struct SecInfoArgs {
    /// Name in the current directory
    pub name: String,
}

// ============================================================================
// I/O operations
// ============================================================================

/// READ arguments
#[derive(Debug, Clone)]
pub struct ReadArgs {
    /// Open, lock or special stateid
    pub stateid: Stateid,
    /// Byte offset
    pub offset: u64,
    /// Requested byte count
    pub count: u32,
}

/// WRITE arguments
#[derive(Debug, Clone)]
pub struct WriteArgs {
    /// Open, lock or special stateid
    pub stateid: Stateid,
    /// Byte offset
    pub offset: u64,
    /// Requested stability
    pub stable: StableHow,
    /// Data to write
    pub data: Bytes,
}

/// COMMIT arguments
#[derive(Debug, Clone, Copy)]
pub struct CommitArgs {
    /// Start of the range
    pub offset: u64,
    /// Length of the range; 0 means to end of file
    pub count: u32,
}

// ============================================================================
// Client operations
// ============================================================================

/// Client callback information (recorded, never used: no delegations)
#[derive(Debug, Clone, Default)]
pub struct ClientCallback {
    /// Callback RPC program
    pub program: u32,
    /// Network id (`tcp`, `tcp6`)
    pub netid: String,
    /// Universal address
    pub addr: String,
}

/// SETCLIENTID arguments
#[derive(Debug, Clone)]
pub struct SetClientIdArgs {
    /// Client boot verifier
    pub verifier: Verifier,
    /// Client-chosen identity string
    pub id: Bytes,
    /// Callback location
    pub callback: ClientCallback,
    /// Callback identifier
    pub callback_ident: u32,
}

/// SETCLIENTID_CONFIRM arguments
#[derive(Debug, Clone, Copy)]
pub struct SetClientIdConfirmArgs {
    /// Client id from SETCLIENTID
    pub client_id: u64,
    /// Confirm verifier from SETCLIENTID
    pub confirm: Verifier,
}

/// RENEW arguments
#[derive(Debug, Clone, Copy)]
pub struct RenewArgs {
    /// Client whose lease to renew
    pub client_id: u64,
}

// ============================================================================
// Open operations
// ============================================================================

/// How OPEN creates a file
#[derive(Debug, Clone)]
pub enum OpenCreate {
    /// UNCHECKED4
    Unchecked(Fattr),
    /// GUARDED4
    Guarded(Fattr),
    /// EXCLUSIVE4 with the client's verifier
    Exclusive(Verifier),
}

/// `openflag4`
#[derive(Debug, Clone)]
pub enum OpenHow {
    /// Open an existing file
    NoCreate,
    /// Create the file if needed
    Create(OpenCreate),
}

/// `open_claim4`
#[derive(Debug, Clone)]
pub enum OpenClaim {
    /// CLAIM_NULL: open `name` in the current directory
    Null(String),
    /// CLAIM_PREVIOUS: reclaim after a server restart
    Previous(u32),
    /// CLAIM_DELEGATE_CUR
    DelegateCur {
        /// Delegation stateid
        stateid: Stateid,
        /// File name
        name: String,
    },
    /// CLAIM_DELEGATE_PREV
    DelegatePrev(String),
}

/// OPEN arguments
#[derive(Debug, Clone)]
pub struct OpenArgs {
    /// Open-owner seqid
    pub seqid: u32,
    /// `OPEN4_SHARE_ACCESS_*`
    pub share_access: u32,
    /// `OPEN4_SHARE_DENY_*`
    pub share_deny: u32,
    /// Open-owner
    pub owner: OwnerKey,
    /// Create mode
    pub how: OpenHow,
    /// What to open
    pub claim: OpenClaim,
}

/// OPEN_CONFIRM arguments
#[derive(Debug, Clone, Copy)]
pub struct OpenConfirmArgs {
    /// Open stateid returned by OPEN
    pub stateid: Stateid,
    /// Open-owner seqid
    pub seqid: u32,
}

/// OPEN_DOWNGRADE arguments
#[derive(Debug, Clone, Copy)]
pub struct OpenDowngradeArgs {
    /// Open stateid
    pub stateid: Stateid,
    /// Open-owner seqid
    pub seqid: u32,
    /// New share access (subset of the current one)
    pub share_access: u32,
    /// New share deny (subset of the current one)
    pub share_deny: u32,
}

/// CLOSE arguments
#[derive(Debug, Clone, Copy)]
pub struct CloseArgs {
    /// Open-owner seqid
    pub seqid: u32,
    /// Open stateid
    pub stateid: Stateid,
}

/// OPEN result flag: client must OPEN_CONFIRM
pub const OPEN4_RESULT_CONFIRM: u32 = 0x02;
/// OPEN result flag: POSIX byte-range lock semantics
pub const OPEN4_RESULT_LOCKTYPE_POSIX: u32 = 0x04;

// ============================================================================
// Lock operations
// ============================================================================

/// `nfs_lock_type4`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockType {
    /// READ_LT
    Read = 1,
    /// WRITE_LT
    Write = 2,
    /// READW_LT (blocking read; never queued here)
    ReadW = 3,
    /// WRITEW_LT (blocking write; never queued here)
    WriteW = 4,
}

impl LockType {
    /// Lock kind used for conflict checks
    pub fn kind(self) -> LockKind {
        match self {
            LockType::Read | LockType::ReadW => LockKind::Read,
            LockType::Write | LockType::WriteW => LockKind::Write,
        }
    }

    /// Check if the lock excludes other owners' reads
    pub fn is_write(self) -> bool {
        self.kind() == LockKind::Write
    }
}

impl TryFrom<u32> for LockType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            3 => Ok(Self::ReadW),
            4 => Ok(Self::WriteW),
            _ => Err(NfsStatus::Inval),
        }
    }
}

/// `locker4`
#[derive(Debug, Clone)]
pub enum Locker {
    /// First lock of a lock-owner, sequenced by the open-owner
    NewOwner {
        /// Open-owner seqid
        open_seqid: u32,
        /// Open stateid
        open_stateid: Stateid,
        /// Initial lock-owner seqid
        lock_seqid: u32,
        /// New lock-owner
        lock_owner: OwnerKey,
    },
    /// Further locks of a known lock-owner
    ExistingOwner {
        /// Lock stateid
        lock_stateid: Stateid,
        /// Lock-owner seqid
        lock_seqid: u32,
    },
}

/// LOCK arguments
#[derive(Debug, Clone)]
pub struct LockArgs {
    /// Lock type
    pub lock_type: LockType,
    /// Reclaim after restart
    pub reclaim: bool,
    /// Start of the range
    pub offset: u64,
    /// Length; `u64::MAX` means to end of file
    pub length: u64,
    /// Owner and sequencing
    pub locker: Locker,
}

/// LOCKT arguments
#[derive(Debug, Clone)]
pub struct LockTArgs {
    /// Lock type to test
    pub lock_type: LockType,
    /// Start of the range
    pub offset: u64,
    /// Length; `u64::MAX` means to end of file
    pub length: u64,
    /// Owner whose own locks are ignored
    pub owner: OwnerKey,
}

/// LOCKU arguments
#[derive(Debug, Clone, Copy)]
pub struct LockUArgs {
    /// Lock type (ignored on release)
    pub lock_type: LockType,
    /// Lock-owner seqid
    pub seqid: u32,
    /// Lock stateid
    pub lock_stateid: Stateid,
    /// Start of the range
    pub offset: u64,
    /// Length; `u64::MAX` means to end of file
    pub length: u64,
}

/// RELEASE_LOCKOWNER arguments
#[derive(Debug, Clone)]
pub struct ReleaseLockOwnerArgs {
    /// Lock-owner to forget
    pub owner: OwnerKey,
}

// ============================================================================
// Results
// ============================================================================

/// OPEN result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRes {
    /// Open stateid
    pub stateid: Stateid,
    /// Change of the parent directory
    pub cinfo: ChangeInfo,
    /// `OPEN4_RESULT_*` flags
    pub rflags: u32,
    /// Attributes applied on create
    pub attrset: Bitmap,
}

/// READ result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRes {
    /// Reached end of file
    pub eof: bool,
    /// Data read
    pub data: Bytes,
}

/// WRITE result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRes {
    /// Bytes written
    pub count: u32,
    /// Stability reached
    pub committed: StableHow,
    /// Server write verifier
    pub verifier: [u8; 8],
}

/// One READDIR entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDirEntry {
    /// Cookie to resume after this entry
    pub cookie: u64,
    /// Entry name
    pub name: String,
    /// Requested attributes
    pub attrs: Fattr,
}

/// READDIR result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDirRes {
    /// Cookie verifier
    pub cookieverf: [u8; 8],
    /// Entries in cookie order
    pub entries: Vec<ReadDirEntry>,
    /// No entries follow
    pub eof: bool,
}

/// Operation-specific result payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultBody {
    /// No payload
    #[default]
    None,
    /// ACCESS
    Access {
        /// Bits the server could evaluate
        supported: u32,
        /// Bits granted
        access: u32,
    },
    /// CLOSE
    Close(Stateid),
    /// COMMIT
    Commit {
        /// Server write verifier
        verifier: [u8; 8],
    },
    /// CREATE
    Create {
        /// Change of the parent directory
        cinfo: ChangeInfo,
        /// Attributes applied
        attrset: Bitmap,
    },
    /// GETATTR
    GetAttr(Fattr),
    /// GETFH
    GetFh(Filehandle),
    /// LINK
    Link(ChangeInfo),
    /// LOCK
    Lock(Stateid),
    /// LOCK / LOCKT conflict
    Denied(LockDenied),
    /// LOCKU
    LockU(Stateid),
    /// OPEN
    Open(OpenRes),
    /// OPEN_CONFIRM
    OpenConfirm(Stateid),
    /// OPEN_DOWNGRADE
    OpenDowngrade(Stateid),
    /// READ
    Read(ReadRes),
    /// READDIR
    ReadDir(ReadDirRes),
    /// READLINK
    ReadLink(String),
    /// REMOVE
    Remove(ChangeInfo),
    /// RENAME
    Rename {
        /// Change of the source directory
        source: ChangeInfo,
        /// Change of the target directory
        target: ChangeInfo,
    },
    /// SECINFO flavors
    SecInfo(Vec<u32>),
    /// SETATTR (attributes set; empty on failure)
    SetAttr(Bitmap),
    /// SETCLIENTID
    SetClientId(ClientGrant),
    /// WRITE
    Write(WriteRes),
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Validate a component name for LOOKUP, CREATE, OPEN, REMOVE, RENAME, LINK
pub fn validate_name(name: &str, max_len: usize) -> Result<(), NfsStatus> {
    if name.is_empty() {
        return Err(NfsStatus::Inval);
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(NfsStatus::BadName);
    }
    if name.len() > max_len {
        return Err(NfsStatus::Nametoolong);
    }
    Ok(())
}

/// Resolve the current filehandle to the object it names
pub(crate) fn current_object(
    server: &ServerState,
    ctx: &CompoundContext,
) -> Result<ObjectIdentity, NfsStatus> {
    let fh = ctx.require_current_fh()?;
    server.registry.resolve(fh).map_err(NfsStatus::from)
}

/// Resolve the saved filehandle to the object it names
pub(crate) fn saved_object(
    server: &ServerState,
    ctx: &CompoundContext,
) -> Result<ObjectIdentity, NfsStatus> {
    let fh = ctx.require_saved_fh()?;
    server.registry.resolve(fh).map_err(NfsStatus::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("", 255), Err(NfsStatus::Inval));
        assert_eq!(validate_name(".", 255), Err(NfsStatus::BadName));
        assert_eq!(validate_name("..", 255), Err(NfsStatus::BadName));
        assert_eq!(validate_name("a/b", 255), Err(NfsStatus::BadName));
        assert_eq!(validate_name("abcd", 3), Err(NfsStatus::Nametoolong));
        assert_eq!(validate_name("...", 255), Ok(()));
        assert_eq!(validate_name("file.txt", 255), Ok(()));
    }

    #[test]
    fn test_lock_type_kinds() {
        assert_eq!(LockType::ReadW.kind(), LockKind::Read);
        assert_eq!(LockType::WriteW.kind(), LockKind::Write);
        assert_eq!(LockType::try_from(2), Ok(LockType::Write));
        assert_eq!(LockType::try_from(5), Err(NfsStatus::Inval));
    }
}
