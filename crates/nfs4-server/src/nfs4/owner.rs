//! Open-owner and lock-owner sequencing
//!
//! Every state-mutating request names an owner and carries that owner's
//! next seqid. The table enforces strict in-order execution per owner and
//! keeps the last reply so a retransmission gets the original answer
//! without executing twice (RFC 7530 section 9.1.7).

use std::sync::Arc;

use dashmap::DashMap;
use nfs4_common::{Filehandle, OwnerKey};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::compound::{Nfs4Op, OpResult};
use super::Stateid;
use crate::error::NfsStatus;

/// Digest of a request's arguments and current filehandle
pub type Fingerprint = [u8; 32];

/// Builds a [`Fingerprint`] field by field
pub struct FingerprintBuilder(blake3::Hasher);

impl FingerprintBuilder {
    /// Start a fingerprint for an operation
    pub fn new(op: Nfs4Op, current: Option<&Filehandle>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(op as u32).to_be_bytes());
        match current {
            Some(fh) => {
                hasher.update(&[1]);
                hasher.update(&(fh.len() as u32).to_be_bytes());
                hasher.update(fh.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        Self(hasher)
    }

    /// Add a 32-bit field
    pub fn u32(mut self, value: u32) -> Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    /// Add a 64-bit field
    pub fn u64(mut self, value: u64) -> Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    /// Add a length-prefixed byte field
    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.0.update(&(value.len() as u32).to_be_bytes());
        self.0.update(value);
        self
    }

    /// Add a stateid
    pub fn stateid(self, stateid: &Stateid) -> Self {
        self.u32(stateid.seqid).bytes(&stateid.other)
    }

    /// Finish the digest
    pub fn finish(self) -> Fingerprint {
        *self.0.finalize().as_bytes()
    }
}

/// Which namespace an owner lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// Open-owner (OPEN, OPEN_CONFIRM, OPEN_DOWNGRADE, CLOSE)
    Open,
    /// Lock-owner (LOCK, LOCKU)
    Lock,
}

/// Last reply of an owner
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    /// Seqid of the cached request
    pub seqid: u32,
    /// Fingerprint of the cached request
    pub fingerprint: Fingerprint,
    /// Reply sent
    pub outcome: OpResult,
    /// Current filehandle after the request (OPEN changes it)
    pub current: Option<Filehandle>,
    /// Open state retired by the request (CLOSE), kept resolvable for replays
    pub retired: Option<u64>,
}

#[derive(Debug, Default)]
struct OwnerSlot {
    last: Option<u32>,
    replay: Option<ReplayEntry>,
    in_flight: bool,
    confirmed: bool,
}

/// Outcome of the seqid check
#[derive(Debug)]
pub enum SeqidCheck {
    /// In-order request: execute it, then commit through the ticket
    Execute(SeqidTicket),
    /// Retransmission of the last request: answer with the cached reply
    Replay(ReplayEntry),
}

/// Reservation of an owner for one in-flight request.
///
/// Dropping the ticket without committing releases the owner without
/// advancing it.
#[derive(Debug)]
pub struct SeqidTicket {
    slot: Arc<Mutex<OwnerSlot>>,
    seqid: u32,
    fingerprint: Fingerprint,
    new_owner: bool,
}

impl SeqidTicket {
    /// Check if the owner had never completed a request
    pub fn is_new_owner(&self) -> bool {
        self.new_owner
    }

    /// Seqid being executed
    pub fn seqid(&self) -> u32 {
        self.seqid
    }

    /// Record the outcome. Sequencing errors leave the owner untouched;
    /// everything else advances it and becomes the cached reply.
    ///
    /// Returns the open state retired by the previously cached reply, which
    /// no longer needs to stay resolvable.
    pub fn commit(
        self,
        outcome: &OpResult,
        current: Option<&Filehandle>,
        retired: Option<u64>,
    ) -> Option<u64> {
        let status = match outcome {
            Ok(_) => NfsStatus::Ok,
            Err(err) => err.status,
        };
        if status.is_seqid_neutral() {
            return None;
        }

        let mut slot = self.slot.lock();
        slot.last = Some(self.seqid);
        let previous = slot.replay.replace(ReplayEntry {
            seqid: self.seqid,
            fingerprint: self.fingerprint,
            outcome: outcome.clone(),
            current: current.cloned(),
            retired,
        });
        previous.and_then(|entry| entry.retired)
    }
}

impl Drop for SeqidTicket {
    fn drop(&mut self) {
        self.slot.lock().in_flight = false;
    }
}

/// Open-owners and lock-owners of every client
#[derive(Debug, Default)]
pub struct StateOwnerTable {
    open_owners: DashMap<OwnerKey, Arc<Mutex<OwnerSlot>>>,
    lock_owners: DashMap<OwnerKey, Arc<Mutex<OwnerSlot>>>,
}

impl StateOwnerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn owners(&self, kind: OwnerKind) -> &DashMap<OwnerKey, Arc<Mutex<OwnerSlot>>> {
        match kind {
            OwnerKind::Open => &self.open_owners,
            OwnerKind::Lock => &self.lock_owners,
        }
    }

    fn slot(&self, kind: OwnerKind, key: &OwnerKey) -> Option<Arc<Mutex<OwnerSlot>>> {
        self.owners(kind).get(key).map(|entry| entry.clone())
    }

    /// Check `seqid` for `key` and reserve the owner.
    ///
    /// With `create`, an unknown owner is registered and accepts any seqid.
    /// Without it, an unknown owner is `BAD_STATEID`. A request for an owner
    /// that is already executing one is `DELAY`.
    pub fn begin(
        &self,
        kind: OwnerKind,
        key: &OwnerKey,
        seqid: u32,
        fingerprint: Fingerprint,
        create: bool,
    ) -> Result<SeqidCheck, NfsStatus> {
        let slot = if create {
            self.owners(kind).entry(key.clone()).or_default().clone()
        } else {
            self.slot(kind, key).ok_or(NfsStatus::BadStateid)?
        };

        let mut guard = slot.lock();
        if guard.in_flight {
            trace!(?key, seqid, "owner busy");
            return Err(NfsStatus::Delay);
        }

        let new_owner = match guard.last {
            None => true,
            Some(current) if seqid == current.wrapping_add(1) => false,
            Some(current) if seqid == current => {
                return match &guard.replay {
                    Some(entry) if entry.seqid == seqid && entry.fingerprint == fingerprint => {
                        debug!(?key, seqid, "replaying cached reply");
                        Ok(SeqidCheck::Replay(entry.clone()))
                    }
                    _ => {
                        debug!(?key, seqid, "seqid reused for a different request");
                        Err(NfsStatus::BadSeqid)
                    }
                };
            }
            Some(current) => {
                debug!(?key, seqid, expected = current.wrapping_add(1), "bad seqid");
                return Err(NfsStatus::BadSeqid);
            }
        };

        guard.in_flight = true;
        drop(guard);
        Ok(SeqidCheck::Execute(SeqidTicket {
            slot,
            seqid,
            fingerprint,
            new_owner,
        }))
    }

    /// Register a lock-owner created by LOCK's `open_to_lock_owner`, whose
    /// next request must carry `lock_seqid + 1`. An existing owner keeps
    /// its sequence.
    pub fn register_lock_owner(&self, key: &OwnerKey, lock_seqid: u32) {
        let slot = self.lock_owners.entry(key.clone()).or_default().clone();
        let mut slot = slot.lock();
        if slot.last.is_none() {
            slot.last = Some(lock_seqid);
        }
    }

    /// Check if a lock-owner is known
    pub fn has_lock_owner(&self, key: &OwnerKey) -> bool {
        self.lock_owners.contains_key(key)
    }

    /// Check if an open-owner has been confirmed
    pub fn is_confirmed(&self, key: &OwnerKey) -> bool {
        self.slot(OwnerKind::Open, key)
            .is_some_and(|slot| slot.lock().confirmed)
    }

    /// Mark an open-owner confirmed
    pub fn confirm(&self, key: &OwnerKey) {
        if let Some(slot) = self.slot(OwnerKind::Open, key) {
            slot.lock().confirmed = true;
        }
    }

    /// Forget a lock-owner (RELEASE_LOCKOWNER)
    pub fn forget_lock_owner(&self, key: &OwnerKey) -> bool {
        self.lock_owners.remove(key).is_some()
    }

    /// Forget every owner of a client
    pub fn purge_client(&self, client_id: u64) -> usize {
        let before = self.open_owners.len() + self.lock_owners.len();
        self.open_owners.retain(|key, _| key.client_id != client_id);
        self.lock_owners.retain(|key, _| key.client_id != client_id);
        before - (self.open_owners.len() + self.lock_owners.len())
    }

    /// Current seqid of an owner, if it completed any request
    pub fn last_seqid(&self, kind: OwnerKind, key: &OwnerKey) -> Option<u32> {
        self.slot(kind, key).and_then(|slot| slot.lock().last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::ops::ResultBody;

    fn owner() -> OwnerKey {
        OwnerKey::new(7, b"owner".to_vec())
    }

    fn fp(n: u32) -> Fingerprint {
        FingerprintBuilder::new(Nfs4Op::Open, None).u32(n).finish()
    }

    fn execute(check: SeqidCheck) -> SeqidTicket {
        match check {
            SeqidCheck::Execute(ticket) => ticket,
            SeqidCheck::Replay(_) => panic!("unexpected replay"),
        }
    }

    #[test]
    fn test_new_owner_accepts_any_seqid() {
        let table = StateOwnerTable::new();
        let ticket = execute(table.begin(OwnerKind::Open, &owner(), 42, fp(1), true).unwrap());
        assert!(ticket.is_new_owner());
        ticket.commit(&Ok(ResultBody::None), None, None);
        assert_eq!(table.last_seqid(OwnerKind::Open, &owner()), Some(42));
    }

    #[test]
    fn test_unknown_owner_without_create() {
        let table = StateOwnerTable::new();
        let err = table
            .begin(OwnerKind::Lock, &owner(), 1, fp(1), false)
            .unwrap_err();
        assert_eq!(err, NfsStatus::BadStateid);
    }

    #[test]
    fn test_in_order_and_replay() {
        let table = StateOwnerTable::new();
        execute(table.begin(OwnerKind::Open, &owner(), 0, fp(1), true).unwrap())
            .commit(&Ok(ResultBody::None), None, None);

        let ticket = execute(table.begin(OwnerKind::Open, &owner(), 1, fp(2), true).unwrap());
        assert!(!ticket.is_new_owner());
        let reply: OpResult = Ok(ResultBody::ReadLink("cached".into()));
        ticket.commit(&reply, None, None);

        match table.begin(OwnerKind::Open, &owner(), 1, fp(2), true).unwrap() {
            SeqidCheck::Replay(entry) => assert_eq!(entry.outcome, reply),
            SeqidCheck::Execute(_) => panic!("expected replay"),
        }

        // Same seqid, different request
        let err = table
            .begin(OwnerKind::Open, &owner(), 1, fp(3), true)
            .unwrap_err();
        assert_eq!(err, NfsStatus::BadSeqid);
    }

    #[test]
    fn test_bad_seqid_does_not_advance() {
        let table = StateOwnerTable::new();
        execute(table.begin(OwnerKind::Open, &owner(), 5, fp(1), true).unwrap())
            .commit(&Ok(ResultBody::None), None, None);

        assert_eq!(
            table.begin(OwnerKind::Open, &owner(), 7, fp(2), true).unwrap_err(),
            NfsStatus::BadSeqid
        );
        assert_eq!(
            table.begin(OwnerKind::Open, &owner(), 4, fp(2), true).unwrap_err(),
            NfsStatus::BadSeqid
        );
        assert_eq!(table.last_seqid(OwnerKind::Open, &owner()), Some(5));
        assert!(table.begin(OwnerKind::Open, &owner(), 6, fp(2), true).is_ok());
    }

    #[test]
    fn test_neutral_errors_are_not_cached() {
        let table = StateOwnerTable::new();
        execute(table.begin(OwnerKind::Open, &owner(), 1, fp(1), true).unwrap())
            .commit(&Ok(ResultBody::None), None, None);

        execute(table.begin(OwnerKind::Open, &owner(), 2, fp(2), true).unwrap()).commit(
            &Err(NfsStatus::BadStateid.into()),
            None,
            None,
        );
        assert_eq!(table.last_seqid(OwnerKind::Open, &owner()), Some(1));

        // Ordinary failures advance and are cached
        execute(table.begin(OwnerKind::Open, &owner(), 2, fp(2), true).unwrap()).commit(
            &Err(NfsStatus::Noent.into()),
            None,
            None,
        );
        assert_eq!(table.last_seqid(OwnerKind::Open, &owner()), Some(2));
    }

    #[test]
    fn test_concurrent_request_is_delayed() {
        let table = StateOwnerTable::new();
        let ticket = execute(table.begin(OwnerKind::Open, &owner(), 1, fp(1), true).unwrap());
        assert_eq!(
            table.begin(OwnerKind::Open, &owner(), 2, fp(2), true).unwrap_err(),
            NfsStatus::Delay
        );
        drop(ticket);
        // Dropped without commit: owner is free and unadvanced
        assert!(table.begin(OwnerKind::Open, &owner(), 1, fp(1), true).is_ok());
    }

    #[test]
    fn test_seqid_wraps() {
        let table = StateOwnerTable::new();
        execute(table.begin(OwnerKind::Lock, &owner(), u32::MAX, fp(1), true).unwrap())
            .commit(&Ok(ResultBody::None), None, None);
        assert!(table.begin(OwnerKind::Lock, &owner(), 0, fp(2), true).is_ok());
    }

    #[test]
    fn test_retired_state_is_handed_back() {
        let table = StateOwnerTable::new();
        execute(table.begin(OwnerKind::Open, &owner(), 1, fp(1), true).unwrap())
            .commit(&Ok(ResultBody::None), None, Some(99));
        let retired = execute(table.begin(OwnerKind::Open, &owner(), 2, fp(2), true).unwrap())
            .commit(&Ok(ResultBody::None), None, None);
        assert_eq!(retired, Some(99));
    }

    #[test]
    fn test_lock_owner_registration() {
        let table = StateOwnerTable::new();
        table.register_lock_owner(&owner(), 10);
        assert!(table.has_lock_owner(&owner()));
        assert_eq!(table.last_seqid(OwnerKind::Lock, &owner()), Some(10));
        assert!(table.begin(OwnerKind::Lock, &owner(), 11, fp(1), false).is_ok());
        assert!(table.forget_lock_owner(&owner()));
        assert_eq!(table.purge_client(7), 0);
    }
}
