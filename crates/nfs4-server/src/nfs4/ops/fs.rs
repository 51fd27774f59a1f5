//! Filehandle, namespace, attribute and I/O operations

use nfs4_common::{CommonError, Filehandle, HandleTarget, ObjectIdentity, ObjectPath};
use tracing::{debug, trace};

use super::{
    current_object, saved_object, validate_name, AccessArgs, CommitArgs, CreateArgs,
    GetAttrArgs, LinkArgs, LookupArgs, PutFhArgs, ReadArgs, ReadDirArgs, ReadDirEntry,
    ReadDirRes, ReadRes, RemoveArgs, RenameArgs, ResultBody, SecInfoArgs, SetAttrArgs,
    VerifyArgs, WriteArgs, WriteRes,
};
use crate::backend::{BackendError, FileAttr};
use crate::error::NfsStatus;
use crate::nfs4::attr::{self, AttrSource, Bitmap};
use crate::nfs4::compound::{CompoundContext, OpError, OpResult};
use crate::nfs4::{AccessBits, Credentials, Nfs4FileType, AUTH_SYS};
use crate::server::ServerState;

/// First cookie handed out for a directory entry; 0-2 are reserved
const FIRST_COOKIE: u64 = 3;

/// Cookie verifier; cookies are positions in the sorted entry list
const COOKIE_VERIFIER: [u8; 8] = [0; 8];

async fn getattr(server: &ServerState, path: &ObjectPath) -> Result<FileAttr, NfsStatus> {
    server.backend.getattr(path).await.map_err(NfsStatus::from)
}

/// Change value reported for an object: directories use the server's
/// change counter, everything else the backend's own value
fn change_of(server: &ServerState, id: u64, attr: &FileAttr) -> u64 {
    if attr.is_dir() {
        server.changes.current(id)
    } else {
        attr.change
    }
}

pub(crate) async fn require_dir(server: &ServerState, obj: &ObjectIdentity) -> Result<FileAttr, NfsStatus> {
    let attr = getattr(server, &obj.path).await?;
    match attr.file_type {
        Nfs4FileType::Directory => Ok(attr),
        Nfs4FileType::SymLink => Err(NfsStatus::Symlink),
        _ => Err(NfsStatus::Notdir),
    }
}

// ============================================================================
// PUTFH / PUTROOTFH / GETFH / SAVEFH / RESTOREFH
// ============================================================================

/// Process PUTFH operation
pub async fn process_putfh(
    server: &ServerState,
    ctx: &mut CompoundContext,
    args: &PutFhArgs,
) -> OpResult {
    // Path handles outlive the registry; an unknown path is adopted only
    // after the backend confirms it
    let (path, adopt) = match server.registry.resolve(&args.object) {
        Ok(obj) => (obj.path, false),
        Err(CommonError::StaleHandle(_)) => match args.object.decode() {
            Ok(HandleTarget::Path(path)) => (path, true),
            _ => return Err(NfsStatus::Stale.into()),
        },
        Err(err) => return Err(NfsStatus::from(err).into()),
    };
    match server.backend.getattr(&path).await {
        Ok(_) => {}
        Err(BackendError::NotFound) => return Err(NfsStatus::Stale.into()),
        Err(err) => return Err(NfsStatus::from(err).into()),
    }
    if adopt {
        let obj = server.registry.identify(&path);
        trace!(id = obj.id, %path, "adopted path handle");
    }
    ctx.current_fh = Some(args.object.clone());
    Ok(ResultBody::None)
}

/// Process PUTROOTFH (and PUTPUBFH: the public handle is the root)
pub fn process_putrootfh(ctx: &mut CompoundContext) -> OpResult {
    ctx.current_fh = Some(Filehandle::root());
    Ok(ResultBody::None)
}

/// Process GETFH operation
pub fn process_getfh(ctx: &CompoundContext) -> OpResult {
    let fh = ctx.require_current_fh()?;
    Ok(ResultBody::GetFh(fh.clone()))
}

/// Process SAVEFH operation
pub fn process_savefh(ctx: &mut CompoundContext) -> OpResult {
    let fh = ctx.require_current_fh()?.clone();
    ctx.saved_fh = Some(fh);
    Ok(ResultBody::None)
}

/// Process RESTOREFH operation
pub fn process_restorefh(ctx: &mut CompoundContext) -> OpResult {
    let fh = ctx.require_saved_fh()?.clone();
    ctx.current_fh = Some(fh);
    Ok(ResultBody::None)
}

// ============================================================================
// LOOKUP / LOOKUPP
// ============================================================================

/// Process LOOKUP operation
pub async fn process_lookup(
    server: &ServerState,
    ctx: &mut CompoundContext,
    args: &LookupArgs,
) -> OpResult {
    let dir = current_object(server, ctx)?;
    require_dir(server, &dir).await?;
    validate_name(&args.name, server.config.max_name_len)?;

    server
        .backend
        .lookup(&dir.path, &args.name)
        .await
        .map_err(NfsStatus::from)?;

    let (_, fh) = server.registry.issue_for_path(&dir.path.join(&args.name));
    ctx.current_fh = Some(fh);
    Ok(ResultBody::None)
}

/// Process LOOKUPP operation
pub async fn process_lookupp(server: &ServerState, ctx: &mut CompoundContext) -> OpResult {
    let dir = current_object(server, ctx)?;
    require_dir(server, &dir).await?;
    let parent = dir.path.parent().ok_or(NfsStatus::Noent)?;
    let (_, fh) = server.registry.issue_for_path(&parent);
    ctx.current_fh = Some(fh);
    Ok(ResultBody::None)
}

// ============================================================================
// ACCESS / GETATTR / SETATTR / VERIFY / NVERIFY
// ============================================================================

/// Access bits granted to `creds` on an object
pub fn granted_access(attr: &FileAttr, creds: &Credentials) -> u32 {
    let is_dir = attr.is_dir();
    let applicable = if is_dir {
        AccessBits::READ
            | AccessBits::LOOKUP
            | AccessBits::MODIFY
            | AccessBits::EXTEND
            | AccessBits::DELETE
    } else {
        AccessBits::READ | AccessBits::MODIFY | AccessBits::EXTEND | AccessBits::EXECUTE
    };
    if creds.uid == 0 {
        return applicable;
    }

    let class = if creds.uid == attr.uid {
        (attr.mode >> 6) & 0o7
    } else if creds.in_group(attr.gid) {
        (attr.mode >> 3) & 0o7
    } else {
        attr.mode & 0o7
    };

    let mut granted = 0;
    if class & 0o4 != 0 {
        granted |= AccessBits::READ;
    }
    if class & 0o2 != 0 {
        granted |= AccessBits::MODIFY | AccessBits::EXTEND | AccessBits::DELETE;
    }
    if class & 0o1 != 0 {
        granted |= AccessBits::LOOKUP | AccessBits::EXECUTE;
    }
    granted & applicable
}

/// Process ACCESS operation
pub async fn process_access(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &AccessArgs,
) -> OpResult {
    let obj = current_object(server, ctx)?;
    let attr = getattr(server, &obj.path).await?;
    let supported = args.access & AccessBits::ALL;
    let access = supported & granted_access(&attr, &ctx.creds);
    Ok(ResultBody::Access { supported, access })
}

/// Process GETATTR operation
pub async fn process_getattr(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &GetAttrArgs,
) -> OpResult {
    let obj = current_object(server, ctx)?;
    let fh = ctx.require_current_fh()?;
    let attr = getattr(server, &obj.path).await?;
    let src = AttrSource {
        attr: &attr,
        handle: fh,
        change: change_of(server, obj.id, &attr),
        fileid: obj.id,
        config: &server.config,
    };
    Ok(ResultBody::GetAttr(attr::collect(&args.request, &src)))
}

/// Process SETATTR operation
pub async fn process_setattr(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &SetAttrArgs,
) -> OpResult {
    let setattr_error = |status: NfsStatus| OpError::with_body(status, ResultBody::SetAttr(Bitmap::new()));

    let obj = current_object(server, ctx).map_err(setattr_error)?;
    let set = attr::to_set_attrs(&args.attrs).map_err(setattr_error)?;

    if let Some(size) = set.size {
        let attr = getattr(server, &obj.path).await.map_err(setattr_error)?;
        match attr.file_type {
            Nfs4FileType::Regular => {}
            Nfs4FileType::Directory => return Err(setattr_error(NfsStatus::Isdir)),
            _ => return Err(setattr_error(NfsStatus::Inval)),
        }
        let owner = server
            .engine
            .check_io(&args.stateid, obj.id, true)
            .map_err(setattr_error)?;
        // Truncation and extension both touch everything past the shorter size
        let start = size.min(attr.size);
        if server
            .locks
            .io_conflict(obj.id, owner.as_ref(), start, u64::MAX, true)
            .is_some()
        {
            return Err(setattr_error(NfsStatus::Locked));
        }
    }

    server
        .backend
        .setattr(&obj.path, &set)
        .await
        .map_err(|err| setattr_error(err.into()))?;
    Ok(ResultBody::SetAttr(args.attrs.bitmap()))
}

/// Process VERIFY (`expect_same`) or NVERIFY
pub async fn process_verify(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &VerifyArgs,
    expect_same: bool,
) -> OpResult {
    let obj = current_object(server, ctx)?;
    let fh = ctx.require_current_fh()?;
    let attr = getattr(server, &obj.path).await?;
    let src = AttrSource {
        attr: &attr,
        handle: fh,
        change: change_of(server, obj.id, &attr),
        fileid: obj.id,
        config: &server.config,
    };
    let same = attr::matches(&args.attrs, &src)?;
    match (expect_same, same) {
        (true, true) | (false, false) => Ok(ResultBody::None),
        (true, false) => Err(NfsStatus::NotSame.into()),
        (false, true) => Err(NfsStatus::Same.into()),
    }
}

// ============================================================================
// CREATE / REMOVE / RENAME / LINK
// ============================================================================

/// Process CREATE operation
pub async fn process_create(
    server: &ServerState,
    ctx: &mut CompoundContext,
    args: &CreateArgs,
) -> OpResult {
    let dir = current_object(server, ctx)?;
    require_dir(server, &dir).await?;
    validate_name(&args.name, server.config.max_name_len)?;
    let set = attr::to_set_attrs(&args.attrs)?;

    let backend = server.backend.as_ref();
    let (dir_path, name, kind, set) = (&dir.path, args.name.as_str(), &args.kind, &set);
    let (_, cinfo) = server
        .changes
        .mutate(dir.id, move || async move {
            backend.create(dir_path, name, kind, set).await
        })
        .await
        .map_err(NfsStatus::from)?;

    let (identity, fh) = server.registry.issue_for_path(&dir.path.join(&args.name));
    debug!(id = identity.id, path = %identity.path, kind = ?args.kind.file_type(), "created");
    ctx.current_fh = Some(fh);
    Ok(ResultBody::Create {
        cinfo,
        attrset: args.attrs.bitmap(),
    })
}

/// Process REMOVE operation
pub async fn process_remove(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &RemoveArgs,
) -> OpResult {
    let dir = current_object(server, ctx)?;
    require_dir(server, &dir).await?;
    validate_name(&args.target, server.config.max_name_len)?;

    let target = dir.path.join(&args.target);
    let backend = server.backend.as_ref();
    let registry = &server.registry;
    let (dir_path, name, target_ref) = (&dir.path, args.target.as_str(), &target);
    let (orphans, cinfo) = server
        .changes
        .mutate(dir.id, move || async move {
            backend.remove(dir_path, name).await?;
            Ok::<_, BackendError>(registry.removed(target_ref))
        })
        .await
        .map_err(NfsStatus::from)?;

    for id in orphans {
        server.changes.forget(id);
    }
    trace!(path = %target, "removed");
    Ok(ResultBody::Remove(cinfo))
}

/// Process RENAME operation
pub async fn process_rename(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &RenameArgs,
) -> OpResult {
    let source_dir = saved_object(server, ctx).map_err(|status| match status {
        NfsStatus::RestoreFh => NfsStatus::NoFileHandle,
        other => other,
    })?;
    let target_dir = current_object(server, ctx)?;
    require_dir(server, &source_dir).await?;
    require_dir(server, &target_dir).await?;
    validate_name(&args.old_name, server.config.max_name_len)?;
    validate_name(&args.new_name, server.config.max_name_len)?;

    let from = source_dir.path.join(&args.old_name);
    let to = target_dir.path.join(&args.new_name);
    let backend = server.backend.as_ref();
    let registry = &server.registry;
    let (src_path, src_name, dst_path, dst_name) = (
        &source_dir.path,
        args.old_name.as_str(),
        &target_dir.path,
        args.new_name.as_str(),
    );
    let (from_ref, to_ref) = (&from, &to);
    let ((), source, target) = server
        .changes
        .mutate_pair(source_dir.id, target_dir.id, move || async move {
            backend.rename(src_path, src_name, dst_path, dst_name).await?;
            registry.renamed(from_ref, to_ref);
            Ok::<_, BackendError>(())
        })
        .await
        .map_err(NfsStatus::from)?;

    debug!(%from, %to, "renamed");
    Ok(ResultBody::Rename { source, target })
}

/// Process LINK operation
pub async fn process_link(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &LinkArgs,
) -> OpResult {
    let source = saved_object(server, ctx).map_err(|status| match status {
        NfsStatus::RestoreFh => NfsStatus::NoFileHandle,
        other => other,
    })?;
    let dir = current_object(server, ctx)?;
    require_dir(server, &dir).await?;
    validate_name(&args.new_name, server.config.max_name_len)?;

    let link = dir.path.join(&args.new_name);
    let backend = server.backend.as_ref();
    let registry = &server.registry;
    let (source_path, dir_path, name, source_id, link_ref) = (
        &source.path,
        &dir.path,
        args.new_name.as_str(),
        source.id,
        &link,
    );
    let ((), cinfo) = server
        .changes
        .mutate(dir.id, move || async move {
            backend.link(source_path, dir_path, name).await?;
            registry.linked(source_id, link_ref);
            Ok::<_, BackendError>(())
        })
        .await
        .map_err(NfsStatus::from)?;

    trace!(id = source.id, path = %link, "linked");
    Ok(ResultBody::Link(cinfo))
}

// ============================================================================
// READDIR / READLINK / SECINFO
// ============================================================================

fn xdr_string_len(s: &str) -> usize {
    4 + s.len().div_ceil(4) * 4
}

/// Process READDIR operation
pub async fn process_readdir(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &ReadDirArgs,
) -> OpResult {
    let dir = current_object(server, ctx)?;
    require_dir(server, &dir).await?;

    if args.cookie == 1 || args.cookie == 2 {
        return Err(NfsStatus::BadCookie.into());
    }
    if args.cookie != 0 && args.cookieverf != COOKIE_VERIFIER {
        return Err(NfsStatus::NotSame.into());
    }

    let listing = server
        .backend
        .readdir(&dir.path)
        .await
        .map_err(NfsStatus::from)?;

    let start = if args.cookie == 0 {
        0
    } else {
        let index = (args.cookie - FIRST_COOKIE) as usize;
        if index >= listing.len() {
            return Err(NfsStatus::BadCookie.into());
        }
        index + 1
    };

    // verifier, value-follows terminator and eof flag
    let mut size = 8 + 4 + 4;
    let mut entries = Vec::new();
    let mut eof = true;
    for (index, entry) in listing.iter().enumerate().skip(start) {
        let (identity, fh) = server.registry.issue_for_path(&dir.path.join(&entry.name));
        let src = AttrSource {
            attr: &entry.attr,
            handle: &fh,
            change: change_of(server, identity.id, &entry.attr),
            fileid: identity.id,
            config: &server.config,
        };
        let attrs = attr::collect(&args.request, &src);
        let entry_size = 4 + 8 + xdr_string_len(&entry.name) + attrs.encoded_len();
        if size + entry_size > args.maxcount as usize {
            if entries.is_empty() {
                return Err(NfsStatus::Toosmall.into());
            }
            eof = false;
            break;
        }
        size += entry_size;
        entries.push(ReadDirEntry {
            cookie: FIRST_COOKIE + index as u64,
            name: entry.name.clone(),
            attrs,
        });
    }

    Ok(ResultBody::ReadDir(ReadDirRes {
        cookieverf: COOKIE_VERIFIER,
        entries,
        eof,
    }))
}

/// Process READLINK operation
pub async fn process_readlink(server: &ServerState, ctx: &CompoundContext) -> OpResult {
    let obj = current_object(server, ctx)?;
    let attr = getattr(server, &obj.path).await?;
    if attr.file_type != Nfs4FileType::SymLink {
        return Err(NfsStatus::Inval.into());
    }
    let target = server
        .backend
        .readlink(&obj.path)
        .await
        .map_err(NfsStatus::from)?;
    Ok(ResultBody::ReadLink(target))
}

/// Process SECINFO operation; consumes the current filehandle
pub async fn process_secinfo(
    server: &ServerState,
    ctx: &mut CompoundContext,
    args: &SecInfoArgs,
) -> OpResult {
    let dir = current_object(server, ctx)?;
    require_dir(server, &dir).await?;
    validate_name(&args.name, server.config.max_name_len)?;
    server
        .backend
        .lookup(&dir.path, &args.name)
        .await
        .map_err(NfsStatus::from)?;
    ctx.current_fh = None;
    Ok(ResultBody::SecInfo(vec![AUTH_SYS]))
}

// ============================================================================
// READ / WRITE / COMMIT
// ============================================================================

async fn require_regular(server: &ServerState, obj: &ObjectIdentity) -> Result<(), NfsStatus> {
    match getattr(server, &obj.path).await?.file_type {
        Nfs4FileType::Regular => Ok(()),
        Nfs4FileType::Directory => Err(NfsStatus::Isdir),
        Nfs4FileType::SymLink => Err(NfsStatus::Symlink),
        _ => Err(NfsStatus::Inval),
    }
}

/// Process READ operation
pub async fn process_read(server: &ServerState, ctx: &CompoundContext, args: &ReadArgs) -> OpResult {
    let obj = current_object(server, ctx)?;
    require_regular(server, &obj).await?;
    let owner = server.engine.check_io(&args.stateid, obj.id, false)?;

    let count = args.count.min(server.config.max_read_size);
    if let Some(conflict) =
        server
            .locks
            .io_conflict(obj.id, owner.as_ref(), args.offset, count as u64, false)
    {
        debug!(file = obj.id, %conflict, "read blocked by lock");
        return Err(NfsStatus::Locked.into());
    }

    let read = server
        .backend
        .read(&obj.path, args.offset, count)
        .await
        .map_err(NfsStatus::from)?;
    Ok(ResultBody::Read(ReadRes {
        eof: read.eof,
        data: read.data,
    }))
}

/// Process WRITE operation
pub async fn process_write(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &WriteArgs,
) -> OpResult {
    let obj = current_object(server, ctx)?;
    require_regular(server, &obj).await?;
    let owner = server.engine.check_io(&args.stateid, obj.id, true)?;

    let max = server.config.max_write_size as usize;
    let data = if args.data.len() > max {
        args.data.slice(..max)
    } else {
        args.data.clone()
    };
    if let Some(conflict) =
        server
            .locks
            .io_conflict(obj.id, owner.as_ref(), args.offset, data.len() as u64, true)
    {
        debug!(file = obj.id, %conflict, "write blocked by lock");
        return Err(NfsStatus::Locked.into());
    }

    let outcome = server
        .backend
        .write(&obj.path, args.offset, data, args.stable)
        .await
        .map_err(NfsStatus::from)?;
    Ok(ResultBody::Write(WriteRes {
        count: outcome.count,
        committed: outcome.committed,
        verifier: server.write_verifier,
    }))
}

/// Process COMMIT operation
pub async fn process_commit(
    server: &ServerState,
    ctx: &CompoundContext,
    args: &CommitArgs,
) -> OpResult {
    let obj = current_object(server, ctx)?;
    require_regular(server, &obj).await?;
    server
        .backend
        .commit(&obj.path, args.offset, args.count)
        .await
        .map_err(NfsStatus::from)?;
    Ok(ResultBody::Commit {
        verifier: server.write_verifier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn attr(file_type: Nfs4FileType, mode: u32) -> FileAttr {
        let now = Utc::now();
        FileAttr {
            file_type,
            mode,
            nlink: 1,
            uid: 1000,
            gid: 100,
            size: 0,
            used: 0,
            fileid: 2,
            rdev: (0, 0),
            atime: now,
            mtime: now,
            ctime: now,
            change: 1,
        }
    }

    #[test]
    fn test_access_mode_classes() {
        let file = attr(Nfs4FileType::Regular, 0o640);
        let owner = Credentials::new(1000, 100);
        let group = Credentials::new(2000, 100);
        let other = Credentials::new(3000, 300);

        assert_eq!(
            granted_access(&file, &owner),
            AccessBits::READ | AccessBits::MODIFY | AccessBits::EXTEND
        );
        assert_eq!(granted_access(&file, &group), AccessBits::READ);
        assert_eq!(granted_access(&file, &other), 0);
    }

    #[test]
    fn test_access_type_restrictions() {
        let dir = attr(Nfs4FileType::Directory, 0o755);
        let file = attr(Nfs4FileType::Regular, 0o755);
        let owner = Credentials::new(1000, 100);

        let on_dir = granted_access(&dir, &owner);
        assert!(on_dir & AccessBits::LOOKUP != 0);
        assert!(on_dir & AccessBits::DELETE != 0);
        assert_eq!(on_dir & AccessBits::EXECUTE, 0);

        let on_file = granted_access(&file, &owner);
        assert!(on_file & AccessBits::EXECUTE != 0);
        assert_eq!(on_file & (AccessBits::LOOKUP | AccessBits::DELETE), 0);

        assert_eq!(
            granted_access(&file, &Credentials::root()),
            AccessBits::READ | AccessBits::MODIFY | AccessBits::EXTEND | AccessBits::EXECUTE
        );
    }
}
