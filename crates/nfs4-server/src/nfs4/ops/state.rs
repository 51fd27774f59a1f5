//! Client, open and byte-range lock operations
//!
//! Every operation that changes open or lock state is sequenced through
//! [`StateOwnerTable`](crate::nfs4::owner::StateOwnerTable): the owner's
//! seqid is checked first, a retransmission is answered from the replay
//! cache, and the outcome is committed before the owner is released.

use nfs4_common::{ChangeInfo, FileId, LockError, ObjectIdentity, OwnerKey};
use tracing::{debug, info};

use super::{
    current_object, validate_name, CloseArgs, LockArgs, LockTArgs, LockUArgs, Locker, OpenArgs,
    OpenClaim, OpenConfirmArgs, OpenCreate, OpenDowngradeArgs, OpenHow, OpenRes,
    ReleaseLockOwnerArgs, RenewArgs, ResultBody, SetClientIdArgs, SetClientIdConfirmArgs,
    OPEN4_RESULT_CONFIRM, OPEN4_RESULT_LOCKTYPE_POSIX,
};
use crate::backend::{CreateHow, FileAttr};
use crate::error::NfsStatus;
use crate::nfs4::attr::{self, Bitmap};
use crate::nfs4::compound::{CompoundContext, Nfs4Op, OpError, OpResult};
use crate::nfs4::ops::fs::{granted_access, require_dir};
use crate::nfs4::owner::{Fingerprint, FingerprintBuilder, OwnerKind, SeqidCheck};
use crate::nfs4::{AccessBits, Nfs4FileType, ShareAccess, ShareDeny, Stateid};
use crate::server::ServerState;

fn lock_failure(err: LockError) -> OpError {
    match err {
        LockError::Denied(denied) => OpError::with_body(NfsStatus::Denied, ResultBody::Denied(denied)),
        other => NfsStatus::from(&other).into(),
    }
}

fn renew_client(server: &ServerState, client_id: u64) -> Result<(), NfsStatus> {
    server.clients.renew(client_id).map_err(NfsStatus::from)
}

/// Run a request sequenced by an existing owner.
///
/// `execute` returns the outcome and, for CLOSE, the open state it
/// retired so replays can still resolve it.
fn run_sequenced(
    server: &ServerState,
    kind: OwnerKind,
    owner: &OwnerKey,
    seqid: u32,
    fingerprint: Fingerprint,
    execute: impl FnOnce() -> (OpResult, Option<u64>),
) -> OpResult {
    let ticket = match server.owners.begin(kind, owner, seqid, fingerprint, false)? {
        SeqidCheck::Replay(entry) => return entry.outcome,
        SeqidCheck::Execute(ticket) => ticket,
    };
    let (outcome, retired) = execute();
    if let Some(previous) = ticket.commit(&outcome, None, retired) {
        server.engine.forget_closed(previous);
    }
    outcome
}

// ============================================================================
// SETCLIENTID / SETCLIENTID_CONFIRM / RENEW
// ============================================================================

/// Process SETCLIENTID operation
pub fn process_setclientid(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &SetClientIdArgs,
) -> OpResult {
    let grant = server
        .clients
        .set_client_id(args.id.clone(), args.verifier, ctx.creds.uid)
        .map_err(NfsStatus::from)?;
    debug!(client_id = grant.client_id, "setclientid");
    Ok(ResultBody::SetClientId(grant))
}

/// Process SETCLIENTID_CONFIRM operation.
///
/// Confirming a new incarnation of a client discards the state held by
/// the one it replaces.
pub fn process_setclientid_confirm(
    server: &ServerState,
    args: &SetClientIdConfirmArgs,
) -> OpResult {
    let superseded = server
        .clients
        .confirm(args.client_id, args.confirm)
        .map_err(NfsStatus::from)?;
    if let Some(old) = superseded {
        let owners = server.owners.purge_client(old);
        let states = server.engine.purge_client(old, &server.locks);
        info!(old, new = args.client_id, owners, states, "client rebooted, state discarded");
    }
    Ok(ResultBody::None)
}

/// Process RENEW operation
pub fn process_renew(server: &ServerState, args: &RenewArgs) -> OpResult {
    renew_client(server, args.client_id)?;
    Ok(ResultBody::None)
}

// ============================================================================
// OPEN / OPEN_CONFIRM / OPEN_DOWNGRADE / CLOSE
// ============================================================================

fn open_fingerprint(ctx: &CompoundContext, args: &OpenArgs) -> Fingerprint {
    let mut fp = FingerprintBuilder::new(Nfs4Op::Open, ctx.current_fh.as_ref())
        .u32(args.seqid)
        .u32(args.share_access)
        .u32(args.share_deny);
    fp = match &args.how {
        OpenHow::NoCreate => fp.u32(0),
        OpenHow::Create(OpenCreate::Unchecked(attrs)) => {
            fp.u32(1).bytes(format!("{attrs:?}").as_bytes())
        }
        OpenHow::Create(OpenCreate::Guarded(attrs)) => {
            fp.u32(2).bytes(format!("{attrs:?}").as_bytes())
        }
        OpenHow::Create(OpenCreate::Exclusive(verifier)) => fp.u32(3).bytes(verifier),
    };
    match &args.claim {
        OpenClaim::Null(name) => fp.u32(0).bytes(name.as_bytes()),
        OpenClaim::Previous(delegation) => fp.u32(1).u32(*delegation),
        OpenClaim::DelegateCur { stateid, name } => fp.u32(2).stateid(stateid).bytes(name.as_bytes()),
        OpenClaim::DelegatePrev(name) => fp.u32(3).bytes(name.as_bytes()),
    }
    .finish()
}

/// Process OPEN operation
pub async fn process_open(
    server: &ServerState,
    ctx: &mut CompoundContext,
    args: &OpenArgs,
) -> OpResult {
    let dir = current_object(server, ctx)?;
    renew_client(server, args.owner.client_id)?;

    let fingerprint = open_fingerprint(ctx, args);
    let ticket = match server
        .owners
        .begin(OwnerKind::Open, &args.owner, args.seqid, fingerprint, true)?
    {
        SeqidCheck::Replay(entry) => {
            if entry.outcome.is_ok() {
                ctx.current_fh = entry.current;
            }
            return entry.outcome;
        }
        SeqidCheck::Execute(ticket) => ticket,
    };

    let outcome = execute_open(server, ctx, &dir, args).await;
    let current = if outcome.is_ok() {
        ctx.current_fh.clone()
    } else {
        None
    };
    ticket.commit(&outcome, current.as_ref(), None);
    outcome
}

async fn execute_open(
    server: &ServerState,
    ctx: &mut CompoundContext,
    dir: &ObjectIdentity,
    args: &OpenArgs,
) -> OpResult {
    let name = match &args.claim {
        OpenClaim::Null(name) => name.as_str(),
        OpenClaim::Previous(_) => return Err(NfsStatus::NoGrace.into()),
        OpenClaim::DelegateCur { .. } | OpenClaim::DelegatePrev(_) => {
            return Err(NfsStatus::Notsupp.into())
        }
    };
    let access = ShareAccess::from_bits(args.share_access)?;
    let deny = ShareDeny::from_bits(args.share_deny)?;
    require_dir(server, dir).await?;
    validate_name(name, server.config.max_name_len)?;

    let (attr, cinfo, attrset, created) = match &args.how {
        OpenHow::NoCreate => {
            let attr = server
                .backend
                .lookup(&dir.path, name)
                .await
                .map_err(NfsStatus::from)?;
            let now = server.changes.current(dir.id);
            let cinfo = ChangeInfo {
                atomic: true,
                before: now,
                after: now,
            };
            (attr, cinfo, Bitmap::new(), false)
        }
        OpenHow::Create(mode) => {
            let (how, attrset) = match mode {
                OpenCreate::Unchecked(attrs) => {
                    (CreateHow::Unchecked(attr::to_set_attrs(attrs)?), attrs.bitmap())
                }
                OpenCreate::Guarded(attrs) => {
                    (CreateHow::Guarded(attr::to_set_attrs(attrs)?), attrs.bitmap())
                }
                OpenCreate::Exclusive(verifier) => (CreateHow::Exclusive(*verifier), Bitmap::new()),
            };
            let backend = server.backend.as_ref();
            let (dir_path, how) = (&dir.path, &how);
            let (file, cinfo) = server
                .changes
                .mutate(dir.id, move || async move {
                    backend.create_file(dir_path, name, how).await
                })
                .await
                .map_err(NfsStatus::from)?;
            let attrset = if file.created { attrset } else { Bitmap::new() };
            (file.attr, cinfo, attrset, file.created)
        }
    };

    match attr.file_type {
        Nfs4FileType::Regular => {}
        Nfs4FileType::Directory => return Err(NfsStatus::Isdir.into()),
        Nfs4FileType::SymLink => return Err(NfsStatus::Symlink.into()),
        _ => return Err(NfsStatus::Inval.into()),
    }
    if !created {
        check_open_access(&attr, ctx, access)?;
    }

    let (identity, fh) = server.registry.issue_for_path(&dir.path.join(name));
    let grant = server.engine.open(&args.owner, identity.id, access, deny)?;

    let mut rflags = OPEN4_RESULT_LOCKTYPE_POSIX;
    if !server.owners.is_confirmed(&args.owner) {
        if server.config.require_open_confirm {
            rflags |= OPEN4_RESULT_CONFIRM;
        } else {
            server.engine.mark_confirmed(&grant.stateid)?;
            server.owners.confirm(&args.owner);
        }
    }

    debug!(
        file = identity.id,
        path = %identity.path,
        upgraded = grant.upgraded,
        created,
        "opened"
    );
    ctx.current_fh = Some(fh);
    Ok(ResultBody::Open(OpenRes {
        stateid: grant.stateid,
        cinfo,
        rflags,
        attrset,
    }))
}

/// The opener needs read permission for read access and modify
/// permission for write access
fn check_open_access(
    attr: &FileAttr,
    ctx: &CompoundContext,
    access: ShareAccess,
) -> Result<(), NfsStatus> {
    let granted = granted_access(attr, &ctx.creds);
    if access.contains(ShareAccess::READ) && granted & AccessBits::READ == 0 {
        return Err(NfsStatus::Access);
    }
    if access.contains(ShareAccess::WRITE) && granted & AccessBits::MODIFY == 0 {
        return Err(NfsStatus::Access);
    }
    Ok(())
}

/// Open state named by `stateid`, which must belong to `file`
fn open_on(server: &ServerState, stateid: &Stateid, file: FileId) -> Result<(), NfsStatus> {
    let open = server.engine.open_for(stateid)?;
    if open.file != file {
        return Err(NfsStatus::BadStateid);
    }
    Ok(())
}

/// Process OPEN_CONFIRM operation
pub fn process_open_confirm(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &OpenConfirmArgs,
) -> OpResult {
    let file = current_object(server, ctx)?;
    let owner = server.engine.owner_of(&args.stateid)?;
    let fingerprint = FingerprintBuilder::new(Nfs4Op::OpenConfirm, ctx.current_fh.as_ref())
        .u32(args.seqid)
        .stateid(&args.stateid)
        .finish();

    run_sequenced(server, OwnerKind::Open, &owner, args.seqid, fingerprint, || {
        let outcome = open_on(server, &args.stateid, file.id)
            .and_then(|()| server.engine.confirm(&args.stateid))
            .map(|stateid| {
                server.owners.confirm(&owner);
                ResultBody::OpenConfirm(stateid)
            })
            .map_err(OpError::from);
        (outcome, None)
    })
}

/// Process OPEN_DOWNGRADE operation
pub fn process_open_downgrade(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &OpenDowngradeArgs,
) -> OpResult {
    let file = current_object(server, ctx)?;
    let owner = server.engine.owner_of(&args.stateid)?;
    let fingerprint = FingerprintBuilder::new(Nfs4Op::OpenDowngrade, ctx.current_fh.as_ref())
        .u32(args.seqid)
        .stateid(&args.stateid)
        .u32(args.share_access)
        .u32(args.share_deny)
        .finish();

    run_sequenced(server, OwnerKind::Open, &owner, args.seqid, fingerprint, || {
        let outcome = downgrade(server, file.id, args)
            .map(ResultBody::OpenDowngrade)
            .map_err(OpError::from);
        (outcome, None)
    })
}

fn downgrade(
    server: &ServerState,
    file: FileId,
    args: &OpenDowngradeArgs,
) -> Result<Stateid, NfsStatus> {
    open_on(server, &args.stateid, file)?;
    let access = ShareAccess::from_bits(args.share_access)?;
    let deny = ShareDeny::from_bits(args.share_deny)?;
    server.engine.downgrade(&args.stateid, access, deny)
}

/// Process CLOSE operation
pub fn process_close(server: &ServerState, ctx: &CompoundContext, args: &CloseArgs) -> OpResult {
    let file = current_object(server, ctx)?;
    let owner = server.engine.owner_of(&args.stateid)?;
    let fingerprint = FingerprintBuilder::new(Nfs4Op::Close, ctx.current_fh.as_ref())
        .u32(args.seqid)
        .stateid(&args.stateid)
        .finish();

    run_sequenced(server, OwnerKind::Open, &owner, args.seqid, fingerprint, || {
        let closed = open_on(server, &args.stateid, file.id)
            .and_then(|()| server.engine.close(&args.stateid, &server.locks));
        match closed {
            Ok((stateid, id)) => {
                debug!(file = file.id, ?owner, "closed");
                (Ok(ResultBody::Close(stateid)), Some(id))
            }
            Err(status) => (Err(status.into()), None),
        }
    })
}

// ============================================================================
// LOCK / LOCKT / LOCKU / RELEASE_LOCKOWNER
// ============================================================================

fn require_locking(server: &ServerState) -> Result<(), NfsStatus> {
    if server.config.locking_enabled {
        Ok(())
    } else {
        Err(NfsStatus::LockNotsupp)
    }
}

/// Process LOCK operation.
///
/// A lock-owner's first LOCK is sequenced by the open-owner that holds
/// the open; later ones by the lock-owner itself.
pub fn process_lock(server: &ServerState, ctx: &CompoundContext, args: &LockArgs) -> OpResult {
    require_locking(server)?;
    let file = current_object(server, ctx)?;
    let base = FingerprintBuilder::new(Nfs4Op::Lock, ctx.current_fh.as_ref())
        .u32(args.lock_type as u32)
        .u32(args.reclaim as u32)
        .u64(args.offset)
        .u64(args.length);

    match &args.locker {
        Locker::NewOwner {
            open_seqid,
            open_stateid,
            lock_seqid,
            lock_owner,
        } => {
            let open_owner = server.engine.owner_of(open_stateid)?;
            renew_client(server, lock_owner.client_id)?;
            let fingerprint = base
                .u32(*open_seqid)
                .stateid(open_stateid)
                .u32(*lock_seqid)
                .u64(lock_owner.client_id)
                .bytes(&lock_owner.owner)
                .finish();
            run_sequenced(server, OwnerKind::Open, &open_owner, *open_seqid, fingerprint, || {
                let outcome =
                    lock_new_owner(server, file.id, args, open_stateid, *lock_seqid, lock_owner);
                (outcome, None)
            })
        }
        Locker::ExistingOwner {
            lock_stateid,
            lock_seqid,
        } => {
            let lock_owner = server.engine.owner_of(lock_stateid)?;
            let fingerprint = base.u32(*lock_seqid).stateid(lock_stateid).finish();
            run_sequenced(server, OwnerKind::Lock, &lock_owner, *lock_seqid, fingerprint, || {
                (lock_existing_owner(server, file.id, args, lock_stateid), None)
            })
        }
    }
}

fn lock_new_owner(
    server: &ServerState,
    file: FileId,
    args: &LockArgs,
    open_stateid: &Stateid,
    lock_seqid: u32,
    lock_owner: &OwnerKey,
) -> OpResult {
    if args.reclaim {
        return Err(NfsStatus::NoGrace.into());
    }
    let _guard = server.engine.guard(file);
    let open = server.engine.open_for(open_stateid)?;
    if open.file != file {
        return Err(NfsStatus::BadStateid.into());
    }
    if lock_owner.client_id != open.owner.client_id {
        return Err(NfsStatus::Inval.into());
    }
    if server.engine.lock_state_of(lock_owner, file).is_some() {
        debug!(file, ?lock_owner, "lock-owner already has state on file");
        return Err(NfsStatus::BadSeqid.into());
    }
    if args.lock_type.is_write() && !open.can_write() {
        return Err(NfsStatus::OpenMode.into());
    }

    server
        .locks
        .test_or_acquire(file, lock_owner, args.lock_type.kind(), args.offset, args.length, true)
        .map_err(lock_failure)?;
    let stateid = match server.engine.create_lock_state(open_stateid, lock_owner, file) {
        Ok(stateid) => stateid,
        Err(status) => {
            // The owner had no state here, so every lock it holds on the
            // file is the one just taken
            server.locks.release_owner_on(file, lock_owner);
            return Err(status.into());
        }
    };
    server.owners.register_lock_owner(lock_owner, lock_seqid);
    Ok(ResultBody::Lock(stateid))
}

fn lock_existing_owner(
    server: &ServerState,
    file: FileId,
    args: &LockArgs,
    lock_stateid: &Stateid,
) -> OpResult {
    if args.reclaim {
        return Err(NfsStatus::NoGrace.into());
    }
    let _guard = server.engine.guard(file);
    let lock = server.engine.lock_for(lock_stateid)?;
    server
        .engine
        .check_io(lock_stateid, file, args.lock_type.is_write())?;

    server
        .locks
        .test_or_acquire(file, &lock.owner, args.lock_type.kind(), args.offset, args.length, true)
        .map_err(lock_failure)?;
    let stateid = server.engine.bump(lock_stateid)?;
    Ok(ResultBody::Lock(stateid))
}

/// Process LOCKT operation
pub fn process_lockt(server: &ServerState, ctx: &CompoundContext, args: &LockTArgs) -> OpResult {
    require_locking(server)?;
    let file = current_object(server, ctx)?;
    renew_client(server, args.owner.client_id)?;
    server
        .locks
        .test_or_acquire(
            file.id,
            &args.owner,
            args.lock_type.kind(),
            args.offset,
            args.length,
            false,
        )
        .map_err(lock_failure)?;
    Ok(ResultBody::None)
}

/// Process LOCKU operation
pub fn process_locku(server: &ServerState, ctx: &CompoundContext, args: &LockUArgs) -> OpResult {
    require_locking(server)?;
    let file = current_object(server, ctx)?;
    let lock_owner = server.engine.owner_of(&args.lock_stateid)?;
    let fingerprint = FingerprintBuilder::new(Nfs4Op::LockU, ctx.current_fh.as_ref())
        .u32(args.lock_type as u32)
        .u32(args.seqid)
        .stateid(&args.lock_stateid)
        .u64(args.offset)
        .u64(args.length)
        .finish();

    run_sequenced(server, OwnerKind::Lock, &lock_owner, args.seqid, fingerprint, || {
        (unlock(server, file.id, args), None)
    })
}

fn unlock(server: &ServerState, file: FileId, args: &LockUArgs) -> OpResult {
    let _guard = server.engine.guard(file);
    let lock = server.engine.lock_for(&args.lock_stateid)?;
    if lock.file != file {
        return Err(NfsStatus::BadStateid.into());
    }
    server
        .locks
        .unlock(file, &lock.owner, args.offset, args.length)
        .map_err(lock_failure)?;
    let stateid = server.engine.bump(&args.lock_stateid)?;
    Ok(ResultBody::LockU(stateid))
}

/// Process RELEASE_LOCKOWNER operation
pub fn process_release_lockowner(server: &ServerState, args: &ReleaseLockOwnerArgs) -> OpResult {
    renew_client(server, args.owner.client_id)?;
    server.engine.release_lock_owner(&args.owner, &server.locks)?;
    if server.owners.forget_lock_owner(&args.owner) {
        debug!(owner = ?args.owner, "lock-owner released");
    }
    Ok(ResultBody::None)
}
