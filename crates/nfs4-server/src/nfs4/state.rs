//! NFSv4.0 state management
//!
//! Manages open state, lock state and the stateids that name them.
//! A stateid's `other` field is the server boot id followed by a state
//! counter, so stateids minted before a restart are recognizably stale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use nfs4_common::{FileId, LockTable, OwnerKey};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::{next_stateid_seqid, seqid_after, ShareAccess, ShareDeny, Stateid};
use crate::error::NfsStatus;

/// Open state for a file
#[derive(Debug, Clone)]
pub struct OpenState {
    /// Open-owner
    pub owner: OwnerKey,
    /// Opened file
    pub file: FileId,
    /// Share access mode
    pub access: ShareAccess,
    /// Share deny mode
    pub deny: ShareDeny,
    /// Current stateid seqid
    pub seqid: u32,
    /// OPEN_CONFIRM seen
    pub confirmed: bool,
    /// Creation time
    pub created: Instant,
}

impl OpenState {
    /// Check if read access is allowed
    pub fn can_read(&self) -> bool {
        self.access.contains(ShareAccess::READ)
    }

    /// Check if write access is allowed
    pub fn can_write(&self) -> bool {
        self.access.contains(ShareAccess::WRITE)
    }
}

/// Lock state of one lock-owner on one file
#[derive(Debug, Clone)]
pub struct LockState {
    /// Lock-owner
    pub owner: OwnerKey,
    /// Locked file
    pub file: FileId,
    /// Open state the lock-owner was created from
    pub open: u64,
    /// Current stateid seqid
    pub seqid: u32,
}

/// State named by a stateid
#[derive(Debug, Clone)]
pub enum StateRecord {
    /// Open state
    Open(OpenState),
    /// Lock state
    Lock(LockState),
}

impl StateRecord {
    /// Owner of the state
    pub fn owner(&self) -> &OwnerKey {
        match self {
            StateRecord::Open(open) => &open.owner,
            StateRecord::Lock(lock) => &lock.owner,
        }
    }

    /// File the state belongs to
    pub fn file(&self) -> FileId {
        match self {
            StateRecord::Open(open) => open.file,
            StateRecord::Lock(lock) => lock.file,
        }
    }

    fn seqid(&self) -> u32 {
        match self {
            StateRecord::Open(open) => open.seqid,
            StateRecord::Lock(lock) => lock.seqid,
        }
    }

    fn seqid_mut(&mut self) -> &mut u32 {
        match self {
            StateRecord::Open(open) => &mut open.seqid,
            StateRecord::Lock(lock) => &mut lock.seqid,
        }
    }
}

/// Result of a successful OPEN at the state level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenGrant {
    /// Open stateid
    pub stateid: Stateid,
    /// The owner already had the file open; modes were upgraded
    pub upgraded: bool,
}

const FILE_STRIPES: usize = 64;

/// Stateid table for one server instance
#[derive(Debug)]
pub struct StateEngine {
    boot: u32,
    next: AtomicU64,
    states: DashMap<u64, StateRecord>,
    /// Open states per file, locked to serialize share reservation checks
    opens_by_file: DashMap<FileId, Vec<u64>>,
    open_by_owner: DashMap<(OwnerKey, FileId), u64>,
    lock_by_owner: DashMap<(OwnerKey, FileId), u64>,
    /// Closed open states still named by a cached CLOSE reply
    closed: DashMap<u64, OwnerKey>,
    /// Striped per-file guards; lock state and the file's byte-range locks
    /// only change together under the file's guard
    file_guards: Box<[Mutex<()>]>,
}

impl StateEngine {
    /// Create an engine for a server instance booted at `boot`
    pub fn new(boot: u32) -> Self {
        Self {
            boot,
            next: AtomicU64::new(1),
            states: DashMap::new(),
            opens_by_file: DashMap::new(),
            open_by_owner: DashMap::new(),
            lock_by_owner: DashMap::new(),
            closed: DashMap::new(),
            file_guards: (0..FILE_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(file: FileId) -> usize {
        (file % FILE_STRIPES as u64) as usize
    }

    /// Serialize lock state changes on `file`.
    ///
    /// LOCK, LOCKU, CLOSE, RELEASE_LOCKOWNER and client purges validate
    /// state and touch the lock table under this guard, so a lock is never
    /// recorded for state that is concurrently going away. Not reentrant.
    pub fn guard(&self, file: FileId) -> MutexGuard<'_, ()> {
        self.file_guards[Self::stripe(file)].lock()
    }

    fn mint(&self) -> (u64, [u8; 12]) {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        (id, self.other_for(id))
    }

    fn other_for(&self, id: u64) -> [u8; 12] {
        let mut other = [0u8; 12];
        other[..4].copy_from_slice(&self.boot.to_be_bytes());
        other[4..].copy_from_slice(&id.to_be_bytes());
        other
    }

    fn stateid_for(&self, id: u64, seqid: u32) -> Stateid {
        Stateid::new(seqid, self.other_for(id))
    }

    /// State number carried by a stateid; stateids of another boot are stale
    pub fn state_number(&self, stateid: &Stateid) -> Result<u64, NfsStatus> {
        let (boot, id) = stateid.other.split_at(4);
        if boot != &self.boot.to_be_bytes()[..] {
            return Err(NfsStatus::StaleStateid);
        }
        let mut counter = [0u8; 8];
        counter.copy_from_slice(id);
        Ok(u64::from_be_bytes(counter))
    }

    /// Look up the state a stateid names and check its seqid
    pub fn resolve(&self, stateid: &Stateid) -> Result<StateRecord, NfsStatus> {
        if stateid.is_special() {
            return Err(NfsStatus::BadStateid);
        }
        let id = self.state_number(stateid)?;
        let record = self
            .states
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or(NfsStatus::BadStateid)?;

        let current = record.seqid();
        if stateid.seqid == current {
            Ok(record)
        } else if seqid_after(current, stateid.seqid) {
            trace!(?stateid, current, "old stateid");
            Err(NfsStatus::OldStateid)
        } else {
            Err(NfsStatus::BadStateid)
        }
    }

    /// Owner named by a stateid, also for open states whose CLOSE reply is
    /// still cached. Used to sequence requests before executing them.
    pub fn owner_of(&self, stateid: &Stateid) -> Result<OwnerKey, NfsStatus> {
        if stateid.is_special() {
            return Err(NfsStatus::BadStateid);
        }
        let id = self.state_number(stateid)?;
        if let Some(record) = self.states.get(&id) {
            return Ok(record.owner().clone());
        }
        self.closed
            .get(&id)
            .map(|owner| owner.clone())
            .ok_or(NfsStatus::BadStateid)
    }

    /// Open `file` for `owner`, or upgrade the owner's existing open.
    ///
    /// Fails with `SHARE_DENIED` when another owner's deny mode covers the
    /// requested access or the requested deny mode covers another owner's
    /// access.
    pub fn open(
        &self,
        owner: &OwnerKey,
        file: FileId,
        access: ShareAccess,
        deny: ShareDeny,
    ) -> Result<OpenGrant, NfsStatus> {
        let mut opens = self.opens_by_file.entry(file).or_default();
        let existing = self
            .open_by_owner
            .get(&(owner.clone(), file))
            .map(|entry| *entry);

        for id in opens.iter().filter(|id| Some(**id) != existing) {
            let Some(entry) = self.states.get(id) else {
                continue;
            };
            if let StateRecord::Open(other) = entry.value() {
                if other.deny.denies(access) || deny.denies(other.access) {
                    debug!(file, ?owner, "share reservation conflict");
                    return Err(NfsStatus::ShareDenied);
                }
            }
        }

        if let Some(id) = existing {
            let mut entry = self.states.get_mut(&id).ok_or(NfsStatus::Serverfault)?;
            let StateRecord::Open(open) = entry.value_mut() else {
                return Err(NfsStatus::Serverfault);
            };
            open.access = open.access.union(access);
            open.deny = open.deny.union(deny);
            open.seqid = next_stateid_seqid(open.seqid);
            let stateid = self.stateid_for(id, open.seqid);
            trace!(?stateid, "open upgraded");
            return Ok(OpenGrant {
                stateid,
                upgraded: true,
            });
        }

        let (id, other) = self.mint();
        self.states.insert(
            id,
            StateRecord::Open(OpenState {
                owner: owner.clone(),
                file,
                access,
                deny,
                seqid: 1,
                confirmed: false,
                created: Instant::now(),
            }),
        );
        opens.push(id);
        self.open_by_owner.insert((owner.clone(), file), id);

        let stateid = Stateid::new(1, other);
        debug!(?stateid, file, ?owner, "open state created");
        Ok(OpenGrant {
            stateid,
            upgraded: false,
        })
    }

    fn open_state(&self, stateid: &Stateid) -> Result<(u64, OpenState), NfsStatus> {
        match self.resolve(stateid)? {
            StateRecord::Open(open) => Ok((self.state_number(stateid)?, open)),
            StateRecord::Lock(_) => Err(NfsStatus::BadStateid),
        }
    }

    /// Validated open state named by an open stateid
    pub fn open_for(&self, stateid: &Stateid) -> Result<OpenState, NfsStatus> {
        self.open_state(stateid).map(|(_, open)| open)
    }

    /// Validated lock state named by a lock stateid
    pub fn lock_for(&self, stateid: &Stateid) -> Result<LockState, NfsStatus> {
        match self.resolve(stateid)? {
            StateRecord::Lock(lock) => Ok(lock),
            StateRecord::Open(_) => Err(NfsStatus::BadStateid),
        }
    }

    /// Advance a state's seqid and return its new stateid
    pub fn bump(&self, stateid: &Stateid) -> Result<Stateid, NfsStatus> {
        let id = self.state_number(stateid)?;
        let mut entry = self.states.get_mut(&id).ok_or(NfsStatus::BadStateid)?;
        let seqid = entry.seqid_mut();
        *seqid = next_stateid_seqid(*seqid);
        Ok(self.stateid_for(id, *seqid))
    }

    /// Mark an open confirmed without changing its stateid, for owners
    /// that need no OPEN_CONFIRM
    pub fn mark_confirmed(&self, stateid: &Stateid) -> Result<(), NfsStatus> {
        let (id, _) = self.open_state(stateid)?;
        if let Some(mut entry) = self.states.get_mut(&id) {
            if let StateRecord::Open(open) = entry.value_mut() {
                open.confirmed = true;
            }
        }
        Ok(())
    }

    /// OPEN_CONFIRM
    pub fn confirm(&self, stateid: &Stateid) -> Result<Stateid, NfsStatus> {
        self.mark_confirmed(stateid)?;
        self.bump(stateid)
    }

    /// OPEN_DOWNGRADE: the new modes must be subsets of the current ones
    pub fn downgrade(
        &self,
        stateid: &Stateid,
        access: ShareAccess,
        deny: ShareDeny,
    ) -> Result<Stateid, NfsStatus> {
        let (id, open) = self.open_state(stateid)?;
        if !access.is_subset_of(open.access) || !deny.is_subset_of(open.deny) {
            return Err(NfsStatus::Inval);
        }
        if let Some(mut entry) = self.states.get_mut(&id) {
            if let StateRecord::Open(open) = entry.value_mut() {
                open.access = access;
                open.deny = deny;
            }
        }
        self.bump(stateid)
    }

    /// CLOSE. Fails with `LOCKS_HELD` while a lock-owner created from this
    /// open still holds locks on the file. Returns the final stateid and
    /// the retired state number.
    pub fn close(&self, stateid: &Stateid, locks: &LockTable) -> Result<(Stateid, u64), NfsStatus> {
        let file = self.open_state(stateid)?.1.file;
        let _guard = self.guard(file);
        let (id, open) = self.open_state(stateid)?;

        let lock_states: Vec<(u64, OwnerKey)> = self
            .states
            .iter()
            .filter_map(|entry| match entry.value() {
                StateRecord::Lock(lock) if lock.open == id => Some((*entry.key(), lock.owner.clone())),
                _ => None,
            })
            .collect();
        if lock_states
            .iter()
            .any(|(_, owner)| locks.holds_locks_on(open.file, owner))
        {
            return Err(NfsStatus::LocksHeld);
        }

        for (lock_id, owner) in &lock_states {
            self.states.remove(lock_id);
            self.lock_by_owner.remove(&(owner.clone(), open.file));
        }
        if let Some(mut opens) = self.opens_by_file.get_mut(&open.file) {
            opens.retain(|other| *other != id);
        }
        self.opens_by_file.remove_if(&open.file, |_, opens| opens.is_empty());
        self.open_by_owner.remove(&(open.owner.clone(), open.file));
        self.states.remove(&id);
        self.closed.insert(id, open.owner.clone());

        let stateid = self.stateid_for(id, next_stateid_seqid(open.seqid));
        debug!(?stateid, file = open.file, "open state closed");
        Ok((stateid, id))
    }

    /// Drop the record of a closed open state
    pub fn forget_closed(&self, id: u64) {
        self.closed.remove(&id);
    }

    /// Lock state of a lock-owner on a file, if any
    pub fn lock_state_of(&self, owner: &OwnerKey, file: FileId) -> Option<Stateid> {
        let id = *self.lock_by_owner.get(&(owner.clone(), file))?;
        let seqid = self.states.get(&id)?.seqid();
        Some(self.stateid_for(id, seqid))
    }

    /// Create the lock state for a new lock-owner; its stateid starts at
    /// seqid 1
    pub fn create_lock_state(
        &self,
        open_stateid: &Stateid,
        owner: &OwnerKey,
        file: FileId,
    ) -> Result<Stateid, NfsStatus> {
        let (open, _) = self.open_state(open_stateid)?;
        let (id, other) = self.mint();
        self.states.insert(
            id,
            StateRecord::Lock(LockState {
                owner: owner.clone(),
                file,
                open,
                seqid: 1,
            }),
        );
        self.lock_by_owner.insert((owner.clone(), file), id);

        let stateid = Stateid::new(1, other);
        debug!(?stateid, file, ?owner, "lock state created");
        Ok(stateid)
    }

    /// RELEASE_LOCKOWNER: forget a lock-owner's lock states
    pub fn release_lock_owner(&self, owner: &OwnerKey, locks: &LockTable) -> Result<(), NfsStatus> {
        let held: Vec<(u64, FileId)> = self
            .states
            .iter()
            .filter_map(|entry| match entry.value() {
                StateRecord::Lock(lock) if &lock.owner == owner => Some((*entry.key(), lock.file)),
                _ => None,
            })
            .collect();

        // Guards are taken in stripe order
        let mut stripes: Vec<usize> = held.iter().map(|(_, file)| Self::stripe(*file)).collect();
        stripes.sort_unstable();
        stripes.dedup();
        let _guards: Vec<_> = stripes
            .into_iter()
            .map(|stripe| self.file_guards[stripe].lock())
            .collect();

        if locks.holds_any(owner) {
            return Err(NfsStatus::LocksHeld);
        }
        for (id, file) in &held {
            self.states.remove(id);
            self.lock_by_owner.remove(&(owner.clone(), *file));
        }
        Ok(())
    }

    /// Authorize READ/WRITE on `file` with `stateid`.
    ///
    /// Returns the lock-owner to exclude from byte-range conflict checks:
    /// `Some` for lock stateids, `None` for open and special stateids.
    pub fn check_io(
        &self,
        stateid: &Stateid,
        file: FileId,
        write: bool,
    ) -> Result<Option<OwnerKey>, NfsStatus> {
        if stateid.is_special() {
            self.check_anonymous(file, write)?;
            return Ok(None);
        }

        let record = self.resolve(stateid)?;
        if record.file() != file {
            return Err(NfsStatus::BadStateid);
        }
        match record {
            StateRecord::Open(open) => {
                if write && !open.can_write() {
                    return Err(NfsStatus::OpenMode);
                }
                Ok(None)
            }
            StateRecord::Lock(lock) => {
                if write {
                    let can_write = self.states.get(&lock.open).is_some_and(|entry| {
                        matches!(entry.value(), StateRecord::Open(open) if open.can_write())
                    });
                    if !can_write {
                        return Err(NfsStatus::OpenMode);
                    }
                }
                Ok(Some(lock.owner))
            }
        }
    }

    /// Special stateids are refused while a share reservation denies the
    /// access
    fn check_anonymous(&self, file: FileId, write: bool) -> Result<(), NfsStatus> {
        let access = if write {
            ShareAccess::WRITE
        } else {
            ShareAccess::READ
        };
        let Some(opens) = self.opens_by_file.get(&file) else {
            return Ok(());
        };
        for id in opens.iter() {
            if let Some(entry) = self.states.get(id) {
                if let StateRecord::Open(open) = entry.value() {
                    if open.deny.denies(access) {
                        return Err(NfsStatus::Locked);
                    }
                }
            }
        }
        Ok(())
    }

    /// Discard all state of a client superseded by a new incarnation
    pub fn purge_client(&self, client_id: u64, locks: &LockTable) -> usize {
        let doomed: Vec<(u64, StateRecord)> = self
            .states
            .iter()
            .filter(|entry| entry.value().owner().client_id == client_id)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, record) in &doomed {
            let _guard = self.guard(record.file());
            self.states.remove(id);
            match record {
                StateRecord::Open(open) => {
                    self.open_by_owner.remove(&(open.owner.clone(), open.file));
                    if let Some(mut opens) = self.opens_by_file.get_mut(&open.file) {
                        opens.retain(|other| other != id);
                    }
                }
                StateRecord::Lock(lock) => {
                    locks.release_owner_on(lock.file, &lock.owner);
                    self.lock_by_owner.remove(&(lock.owner.clone(), lock.file));
                }
            }
        }
        self.closed.retain(|_, owner| owner.client_id != client_id);

        if !doomed.is_empty() {
            debug!(client_id, states = doomed.len(), "purged client state");
        }
        doomed.len()
    }

    /// Number of live open and lock states
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if no state is live
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfs4_common::LockKind;

    fn owner(n: u8) -> OwnerKey {
        OwnerKey::new(1, vec![n])
    }

    #[test]
    fn test_open_stateid_layout() {
        let engine = StateEngine::new(0xABCD);
        let grant = engine
            .open(&owner(1), 10, ShareAccess::READ, ShareDeny::NONE)
            .unwrap();
        assert!(!grant.upgraded);
        assert_eq!(grant.stateid.seqid, 1);
        assert_eq!(&grant.stateid.other[..4], &0xABCDu32.to_be_bytes());
        assert!(matches!(
            engine.resolve(&grant.stateid),
            Ok(StateRecord::Open(_))
        ));
    }

    #[test]
    fn test_stale_and_old_stateids() {
        let engine = StateEngine::new(1);
        let grant = engine
            .open(&owner(1), 10, ShareAccess::BOTH, ShareDeny::NONE)
            .unwrap();

        let other_boot = StateEngine::new(2);
        assert_eq!(
            other_boot.resolve(&grant.stateid).unwrap_err(),
            NfsStatus::StaleStateid
        );

        let bumped = engine.bump(&grant.stateid).unwrap();
        assert_eq!(bumped.seqid, 2);
        assert_eq!(
            engine.resolve(&grant.stateid).unwrap_err(),
            NfsStatus::OldStateid
        );
        let future = Stateid::new(9, grant.stateid.other);
        assert_eq!(engine.resolve(&future).unwrap_err(), NfsStatus::BadStateid);
        assert_eq!(
            engine.resolve(&Stateid::new(1, [0; 12])).unwrap_err(),
            NfsStatus::StaleStateid
        );
    }

    #[test]
    fn test_share_reservations() {
        let engine = StateEngine::new(1);
        engine
            .open(&owner(1), 10, ShareAccess::READ, ShareDeny::WRITE)
            .unwrap();
        assert_eq!(
            engine
                .open(&owner(2), 10, ShareAccess::WRITE, ShareDeny::NONE)
                .unwrap_err(),
            NfsStatus::ShareDenied
        );
        assert!(engine
            .open(&owner(2), 10, ShareAccess::READ, ShareDeny::NONE)
            .is_ok());
        // Owner 3 may not deny the read access already granted
        assert_eq!(
            engine
                .open(&owner(3), 10, ShareAccess::READ, ShareDeny::READ)
                .unwrap_err(),
            NfsStatus::ShareDenied
        );
    }

    #[test]
    fn test_open_upgrade_and_downgrade() {
        let engine = StateEngine::new(1);
        let first = engine
            .open(&owner(1), 10, ShareAccess::READ, ShareDeny::NONE)
            .unwrap();
        let second = engine
            .open(&owner(1), 10, ShareAccess::WRITE, ShareDeny::NONE)
            .unwrap();
        assert!(second.upgraded);
        assert_eq!(second.stateid.other, first.stateid.other);
        assert_eq!(second.stateid.seqid, 2);

        let open = engine.open_for(&second.stateid).unwrap();
        assert_eq!(open.access, ShareAccess::BOTH);

        assert_eq!(
            engine
                .downgrade(&second.stateid, ShareAccess::READ, ShareDeny::WRITE)
                .unwrap_err(),
            NfsStatus::Inval
        );
        let downgraded = engine
            .downgrade(&second.stateid, ShareAccess::READ, ShareDeny::NONE)
            .unwrap();
        assert_eq!(downgraded.seqid, 3);
        assert!(!engine.open_for(&downgraded).unwrap().can_write());
    }

    #[test]
    fn test_close_with_locks_held() {
        let engine = StateEngine::new(1);
        let locks = LockTable::new();
        let open = engine
            .open(&owner(1), 10, ShareAccess::BOTH, ShareDeny::NONE)
            .unwrap()
            .stateid;
        let lock_owner = owner(9);
        let lock = engine.create_lock_state(&open, &lock_owner, 10).unwrap();
        assert_eq!(lock.seqid, 1);
        locks
            .test_or_acquire(10, &lock_owner, LockKind::Write, 0, 10, true)
            .unwrap();

        assert_eq!(
            engine.close(&open, &locks).unwrap_err(),
            NfsStatus::LocksHeld
        );

        locks.unlock(10, &lock_owner, 0, 10).unwrap();
        let (closed, id) = engine.close(&open, &locks).unwrap();
        assert_eq!(closed.seqid, 2);
        assert!(engine.is_empty());
        assert_eq!(engine.resolve(&open).unwrap_err(), NfsStatus::BadStateid);
        // The owner stays known for CLOSE replays until the tombstone goes
        assert_eq!(engine.owner_of(&open).unwrap(), owner(1));
        engine.forget_closed(id);
        assert_eq!(engine.owner_of(&open).unwrap_err(), NfsStatus::BadStateid);
    }

    #[test]
    fn test_lock_state_needs_live_open() {
        let engine = StateEngine::new(1);
        let locks = LockTable::new();
        let open = engine
            .open(&owner(1), 10, ShareAccess::BOTH, ShareDeny::NONE)
            .unwrap()
            .stateid;
        engine.close(&open, &locks).unwrap();
        assert_eq!(
            engine.create_lock_state(&open, &owner(2), 10).unwrap_err(),
            NfsStatus::BadStateid
        );
        assert!(engine.is_empty());
    }

    #[test]
    fn test_io_authorization() {
        let engine = StateEngine::new(1);
        let read_only = engine
            .open(&owner(1), 10, ShareAccess::READ, ShareDeny::WRITE)
            .unwrap()
            .stateid;
        assert_eq!(engine.check_io(&read_only, 10, false), Ok(None));
        assert_eq!(
            engine.check_io(&read_only, 10, true),
            Err(NfsStatus::OpenMode)
        );
        assert_eq!(
            engine.check_io(&read_only, 11, false),
            Err(NfsStatus::BadStateid)
        );
        // Deny-write share blocks anonymous writers
        assert_eq!(
            engine.check_io(&Stateid::ANONYMOUS, 10, true),
            Err(NfsStatus::Locked)
        );
        assert_eq!(engine.check_io(&Stateid::READ_BYPASS, 10, false), Ok(None));

        let lock = engine.create_lock_state(&read_only, &owner(2), 10).unwrap();
        assert_eq!(engine.check_io(&lock, 10, false), Ok(Some(owner(2))));
        assert_eq!(engine.check_io(&lock, 10, true), Err(NfsStatus::OpenMode));
    }

    #[test]
    fn test_release_and_purge() {
        let engine = StateEngine::new(1);
        let locks = LockTable::new();
        let open = engine
            .open(&owner(1), 10, ShareAccess::BOTH, ShareDeny::NONE)
            .unwrap()
            .stateid;
        engine.create_lock_state(&open, &owner(2), 10).unwrap();
        locks
            .test_or_acquire(10, &owner(2), LockKind::Read, 0, 1, true)
            .unwrap();
        assert_eq!(
            engine.release_lock_owner(&owner(2), &locks),
            Err(NfsStatus::LocksHeld)
        );
        assert_eq!(engine.len(), 2);

        assert_eq!(engine.purge_client(1, &locks), 2);
        assert!(engine.is_empty());
        assert!(!locks.holds_any(&owner(2)));
        assert!(engine
            .open(&owner(3), 10, ShareAccess::BOTH, ShareDeny::BOTH)
            .is_ok());
    }
}
