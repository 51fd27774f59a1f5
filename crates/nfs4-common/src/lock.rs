//! Byte-range lock table
//!
//! Holds the active byte-range locks of every file and answers conflict
//! queries for LOCK, LOCKT, LOCKU and for READ/WRITE against mandatory
//! ranges. Ranges use NFSv4 conventions: a length of `u64::MAX` extends the
//! lock to end of file, and all range arithmetic is done in `u128` so that
//! `offset + length` can never overflow.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

use crate::filehandle::ObjectId;

/// Files are keyed by their stable registry id
pub type FileId = ObjectId;

/// Length value meaning "to end of file"
pub const LENGTH_TO_EOF: u64 = u64::MAX;

const RANGE_LIMIT: u128 = 1 << 64;

/// State owner identity: client id plus the client's opaque owner bytes
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    /// Client id the owner belongs to
    pub client_id: u64,
    /// Opaque owner bytes chosen by the client
    pub owner: Bytes,
}

impl OwnerKey {
    /// Create a new owner key
    pub fn new(client_id: u64, owner: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            owner: owner.into(),
        }
    }
}

impl fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerKey({:#x}:", self.client_id)?;
        for b in self.owner.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Lock kind; the blocking variants of the protocol map onto these
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Shared lock
    Read,
    /// Exclusive lock
    Write,
}

/// Active byte-range lock
#[derive(Debug, Clone)]
pub struct ByteRangeLock {
    /// Lock owner
    pub owner: OwnerKey,
    /// Locked file
    pub file: FileId,
    /// Start offset
    pub offset: u64,
    /// Length (`LENGTH_TO_EOF` = to end of file)
    pub length: u64,
    /// Lock kind
    pub kind: LockKind,
    /// When the lock was acquired
    pub acquired_at: Instant,
}

impl ByteRangeLock {
    /// Exclusive end of the locked range
    fn end(&self) -> u128 {
        range_end(self.offset, self.length)
    }

    /// Check if this lock overlaps with a range
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        (self.offset as u128) < range_end(offset, length) && (offset as u128) < self.end()
    }

    /// Check if this lock conflicts with a request of `kind` over a range
    pub fn conflicts_with(&self, offset: u64, length: u64, kind: LockKind) -> bool {
        if !self.overlaps(offset, length) {
            return false;
        }
        // Read locks don't conflict with each other
        !(self.kind == LockKind::Read && kind == LockKind::Read)
    }

    fn same_range(&self, offset: u64, length: u64) -> bool {
        self.offset == offset && self.end() == range_end(offset, length)
    }
}

/// Description of the lock that blocked a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDenied {
    /// Offset of the conflicting lock
    pub offset: u64,
    /// Length of the conflicting lock
    pub length: u64,
    /// Kind of the conflicting lock
    pub kind: LockKind,
    /// Owner of the conflicting lock
    pub owner: OwnerKey,
}

impl From<&ByteRangeLock> for LockDenied {
    fn from(lock: &ByteRangeLock) -> Self {
        Self {
            offset: lock.offset,
            length: lock.length,
            kind: lock.kind,
            owner: lock.owner.clone(),
        }
    }
}

/// Lock error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Lock conflicts with a lock held by another owner
    #[error("lock denied: {0}")]
    Denied(LockDenied),

    /// Range is empty or runs past 2^64
    #[error("invalid byte range: offset {offset}, length {length}")]
    InvalidRange {
        /// Requested offset
        offset: u64,
        /// Requested length
        length: u64,
    },

    /// Unlock range overlaps a held lock without matching it exactly
    #[error("unlock range {offset}+{length} does not match a held lock")]
    PartialRange {
        /// Requested offset
        offset: u64,
        /// Requested length
        length: u64,
    },
}

impl fmt::Display for LockDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} lock at {}+{} held by {:?}",
            self.kind, self.offset, self.length, self.owner
        )
    }
}

fn range_end(offset: u64, length: u64) -> u128 {
    if length == LENGTH_TO_EOF {
        RANGE_LIMIT
    } else {
        offset as u128 + length as u128
    }
}

/// Reject empty ranges and ranges that extend past 2^64
pub fn validate_range(offset: u64, length: u64) -> Result<(), LockError> {
    if length == 0 || range_end(offset, length) > RANGE_LIMIT {
        return Err(LockError::InvalidRange { offset, length });
    }
    Ok(())
}

/// Locks held on a single file
#[derive(Debug, Default)]
struct FileLocks {
    locks: Vec<ByteRangeLock>,
}

impl FileLocks {
    fn find_conflict(
        &self,
        offset: u64,
        length: u64,
        kind: LockKind,
        exclude_owner: Option<&OwnerKey>,
    ) -> Option<&ByteRangeLock> {
        self.locks.iter().find(|lock| {
            if exclude_owner.is_some_and(|owner| &lock.owner == owner) {
                return false;
            }
            lock.conflicts_with(offset, length, kind)
        })
    }
}

/// Per-file byte-range lock sets shared by every connection.
///
/// A file's entry exists only while it holds at least one lock; every
/// mutation runs under the entry's shard lock so an emptied entry can be
/// dropped without racing a concurrent acquire.
#[derive(Default)]
pub struct LockTable {
    files: DashMap<FileId, FileLocks>,
}

impl LockTable {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&self, file: FileId) {
        self.files.remove_if(&file, |_, state| state.locks.is_empty());
    }

    /// Test for a conflicting lock held by another owner and, when
    /// `acquire` is set and none exists, record the lock.
    ///
    /// A request matching one of the owner's own ranges exactly replaces
    /// that lock's kind in place; other ranges of the same owner are added
    /// alongside.
    pub fn test_or_acquire(
        &self,
        file: FileId,
        owner: &OwnerKey,
        kind: LockKind,
        offset: u64,
        length: u64,
        acquire: bool,
    ) -> Result<(), LockError> {
        validate_range(offset, length)?;

        if !acquire {
            let Some(state) = self.files.get(&file) else {
                return Ok(());
            };
            return match state.find_conflict(offset, length, kind, Some(owner)) {
                Some(conflict) => Err(LockError::Denied(conflict.into())),
                None => Ok(()),
            };
        }

        let mut state = self.files.entry(file).or_default();
        if let Some(conflict) = state.find_conflict(offset, length, kind, Some(owner)) {
            trace!(file, ?owner, offset, length, "lock denied");
            return Err(LockError::Denied(conflict.into()));
        }

        if let Some(held) = state
            .locks
            .iter_mut()
            .find(|lock| &lock.owner == owner && lock.same_range(offset, length))
        {
            held.kind = kind;
            return Ok(());
        }

        state.locks.push(ByteRangeLock {
            owner: owner.clone(),
            file,
            offset,
            length,
            kind,
            acquired_at: Instant::now(),
        });
        trace!(file, ?owner, offset, length, ?kind, "lock acquired");
        Ok(())
    }

    /// Release the owner's lock on exactly `[offset, offset + length)`.
    ///
    /// Returns `true` when a lock was removed. A range overlapping one of
    /// the owner's locks without matching it is `PartialRange`; a range
    /// touching none of them is a no-op.
    pub fn unlock(
        &self,
        file: FileId,
        owner: &OwnerKey,
        offset: u64,
        length: u64,
    ) -> Result<bool, LockError> {
        validate_range(offset, length)?;
        let Some(mut state) = self.files.get_mut(&file) else {
            return Ok(false);
        };

        let before = state.locks.len();
        state
            .locks
            .retain(|lock| !(&lock.owner == owner && lock.same_range(offset, length)));
        if state.locks.len() != before {
            drop(state);
            self.prune(file);
            trace!(file, ?owner, offset, length, "lock released");
            return Ok(true);
        }

        if state
            .locks
            .iter()
            .any(|lock| &lock.owner == owner && lock.overlaps(offset, length))
        {
            return Err(LockError::PartialRange { offset, length });
        }
        Ok(false)
    }

    /// Find a lock that blocks I/O. `owner` is the I/O's lock-owner, if
    /// any; `None` (special stateids, open stateids) conflicts with every
    /// lock of the opposing kind.
    pub fn io_conflict(
        &self,
        file: FileId,
        owner: Option<&OwnerKey>,
        offset: u64,
        length: u64,
        write: bool,
    ) -> Option<LockDenied> {
        if length == 0 {
            return None;
        }
        let state = self.files.get(&file)?;
        let kind = if write { LockKind::Write } else { LockKind::Read };
        state
            .find_conflict(offset, length, kind, owner)
            .map(LockDenied::from)
    }

    /// Check if `owner` holds any lock on `file`
    pub fn holds_locks_on(&self, file: FileId, owner: &OwnerKey) -> bool {
        self.files
            .get(&file)
            .is_some_and(|state| state.locks.iter().any(|lock| &lock.owner == owner))
    }

    /// Check if `owner` holds any lock on any file
    pub fn holds_any(&self, owner: &OwnerKey) -> bool {
        self.files
            .iter()
            .any(|state| state.locks.iter().any(|lock| &lock.owner == owner))
    }

    /// Snapshot of the locks held on a file
    pub fn locks_for(&self, file: FileId) -> Vec<ByteRangeLock> {
        self.files
            .get(&file)
            .map(|state| state.locks.clone())
            .unwrap_or_default()
    }

    /// Drop every lock `owner` holds on `file`; returns how many were
    /// released
    pub fn release_owner_on(&self, file: FileId, owner: &OwnerKey) -> usize {
        let Some(mut state) = self.files.get_mut(&file) else {
            return 0;
        };
        let before = state.locks.len();
        state.locks.retain(|lock| &lock.owner != owner);
        let released = before - state.locks.len();
        drop(state);
        self.prune(file);
        released
    }

    /// Drop every lock held by `owner`; returns how many were released
    pub fn release_owner(&self, owner: &OwnerKey) -> usize {
        let files: Vec<FileId> = self.files.iter().map(|entry| *entry.key()).collect();
        files
            .into_iter()
            .map(|file| self.release_owner_on(file, owner))
            .sum()
    }

    /// Number of files with at least one lock
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("files", &self.files.len())
            .finish()
    }
}
