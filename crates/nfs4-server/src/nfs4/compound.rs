//! NFSv4.0 COMPOUND operation handling
//!
//! COMPOUND is the only non-null procedure of NFSv4.0. It carries an
//! ordered list of operations that run against a per-call cursor: the
//! current and saved filehandles. Execution stops at the first operation
//! that does not return `NFS4_OK`.

use std::sync::Arc;

use nfs4_common::Filehandle;
use tracing::{debug, trace, warn};

use super::ops::{self, fs, state, ResultBody};
use super::{Credentials, NFS4_MINOR_VERSION};
use crate::error::NfsStatus;
use crate::server::ServerState;

/// NFSv4.0 operation codes (RFC 7530)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Nfs4Op {
    Access = 3,
    Close = 4,
    Commit = 5,
    Create = 6,
    DelegPurge = 7,
    DelegReturn = 8,
    GetAttr = 9,
    GetFh = 10,
    Link = 11,
    Lock = 12,
    LockT = 13,
    LockU = 14,
    Lookup = 15,
    LookupP = 16,
    NVerify = 17,
    Open = 18,
    OpenAttr = 19,
    OpenConfirm = 20,
    OpenDowngrade = 21,
    PutFh = 22,
    PutPubFh = 23,
    PutRootFh = 24,
    Read = 25,
    ReadDir = 26,
    ReadLink = 27,
    Remove = 28,
    Rename = 29,
    Renew = 30,
    RestoreFh = 31,
    SaveFh = 32,
    SecInfo = 33,
    SetAttr = 34,
    SetClientId = 35,
    SetClientIdConfirm = 36,
    Verify = 37,
    Write = 38,
    ReleaseLockOwner = 39,
    // Illegal operation marker
    Illegal = 10044,
}

impl TryFrom<u32> for Nfs4Op {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Access),
            4 => Ok(Self::Close),
            5 => Ok(Self::Commit),
            6 => Ok(Self::Create),
            7 => Ok(Self::DelegPurge),
            8 => Ok(Self::DelegReturn),
            9 => Ok(Self::GetAttr),
            10 => Ok(Self::GetFh),
            11 => Ok(Self::Link),
            12 => Ok(Self::Lock),
            13 => Ok(Self::LockT),
            14 => Ok(Self::LockU),
            15 => Ok(Self::Lookup),
            16 => Ok(Self::LookupP),
            17 => Ok(Self::NVerify),
            18 => Ok(Self::Open),
            19 => Ok(Self::OpenAttr),
            20 => Ok(Self::OpenConfirm),
            21 => Ok(Self::OpenDowngrade),
            22 => Ok(Self::PutFh),
            23 => Ok(Self::PutPubFh),
            24 => Ok(Self::PutRootFh),
            25 => Ok(Self::Read),
            26 => Ok(Self::ReadDir),
            27 => Ok(Self::ReadLink),
            28 => Ok(Self::Remove),
            29 => Ok(Self::Rename),
            30 => Ok(Self::Renew),
            31 => Ok(Self::RestoreFh),
            32 => Ok(Self::SaveFh),
            33 => Ok(Self::SecInfo),
            34 => Ok(Self::SetAttr),
            35 => Ok(Self::SetClientId),
            36 => Ok(Self::SetClientIdConfirm),
            37 => Ok(Self::Verify),
            38 => Ok(Self::Write),
            39 => Ok(Self::ReleaseLockOwner),
            10044 => Ok(Self::Illegal),
            _ => Err(NfsStatus::OpIllegal),
        }
    }
}

/// A decoded operation with its arguments
#[derive(Debug, Clone)]
pub enum Operation {
    Access(ops::AccessArgs),
    Close(ops::CloseArgs),
    Commit(ops::CommitArgs),
    Create(ops::CreateArgs),
    DelegPurge(u64),
    DelegReturn(super::Stateid),
    GetAttr(ops::GetAttrArgs),
    GetFh,
    Link(ops::LinkArgs),
    Lock(ops::LockArgs),
    LockT(ops::LockTArgs),
    LockU(ops::LockUArgs),
    Lookup(ops::LookupArgs),
    LookupP,
    NVerify(ops::VerifyArgs),
    Open(ops::OpenArgs),
    OpenAttr {
        /// Create the named attribute directory
        create_dir: bool,
    },
    OpenConfirm(ops::OpenConfirmArgs),
    OpenDowngrade(ops::OpenDowngradeArgs),
    PutFh(ops::PutFhArgs),
    PutPubFh,
    PutRootFh,
    Read(ops::ReadArgs),
    ReadDir(ops::ReadDirArgs),
    ReadLink,
    Remove(ops::RemoveArgs),
    Rename(ops::RenameArgs),
    Renew(ops::RenewArgs),
    RestoreFh,
    SaveFh,
    SecInfo(ops::SecInfoArgs),
    SetAttr(ops::SetAttrArgs),
    SetClientId(ops::SetClientIdArgs),
    SetClientIdConfirm(ops::SetClientIdConfirmArgs),
    Verify(ops::VerifyArgs),
    Write(ops::WriteArgs),
    ReleaseLockOwner(ops::ReleaseLockOwnerArgs),
    /// Opcode the decoder did not recognize
    Illegal,
}

impl Operation {
    /// Operation code
    pub fn op(&self) -> Nfs4Op {
        match self {
            Operation::Access(_) => Nfs4Op::Access,
            Operation::Close(_) => Nfs4Op::Close,
            Operation::Commit(_) => Nfs4Op::Commit,
            Operation::Create(_) => Nfs4Op::Create,
            Operation::DelegPurge(_) => Nfs4Op::DelegPurge,
            Operation::DelegReturn(_) => Nfs4Op::DelegReturn,
            Operation::GetAttr(_) => Nfs4Op::GetAttr,
            Operation::GetFh => Nfs4Op::GetFh,
            Operation::Link(_) => Nfs4Op::Link,
            Operation::Lock(_) => Nfs4Op::Lock,
            Operation::LockT(_) => Nfs4Op::LockT,
            Operation::LockU(_) => Nfs4Op::LockU,
            Operation::Lookup(_) => Nfs4Op::Lookup,
            Operation::LookupP => Nfs4Op::LookupP,
            Operation::NVerify(_) => Nfs4Op::NVerify,
            Operation::Open(_) => Nfs4Op::Open,
            Operation::OpenAttr { .. } => Nfs4Op::OpenAttr,
            Operation::OpenConfirm(_) => Nfs4Op::OpenConfirm,
            Operation::OpenDowngrade(_) => Nfs4Op::OpenDowngrade,
            Operation::PutFh(_) => Nfs4Op::PutFh,
            Operation::PutPubFh => Nfs4Op::PutPubFh,
            Operation::PutRootFh => Nfs4Op::PutRootFh,
            Operation::Read(_) => Nfs4Op::Read,
            Operation::ReadDir(_) => Nfs4Op::ReadDir,
            Operation::ReadLink => Nfs4Op::ReadLink,
            Operation::Remove(_) => Nfs4Op::Remove,
            Operation::Rename(_) => Nfs4Op::Rename,
            Operation::Renew(_) => Nfs4Op::Renew,
            Operation::RestoreFh => Nfs4Op::RestoreFh,
            Operation::SaveFh => Nfs4Op::SaveFh,
            Operation::SecInfo(_) => Nfs4Op::SecInfo,
            Operation::SetAttr(_) => Nfs4Op::SetAttr,
            Operation::SetClientId(_) => Nfs4Op::SetClientId,
            Operation::SetClientIdConfirm(_) => Nfs4Op::SetClientIdConfirm,
            Operation::Verify(_) => Nfs4Op::Verify,
            Operation::Write(_) => Nfs4Op::Write,
            Operation::ReleaseLockOwner(_) => Nfs4Op::ReleaseLockOwner,
            Operation::Illegal => Nfs4Op::Illegal,
        }
    }

    /// Check if the operation works on the current filehandle
    pub fn needs_current_fh(&self) -> bool {
        !matches!(
            self,
            Operation::PutFh(_)
                | Operation::PutPubFh
                | Operation::PutRootFh
                | Operation::RestoreFh
                | Operation::Renew(_)
                | Operation::SetClientId(_)
                | Operation::SetClientIdConfirm(_)
                | Operation::ReleaseLockOwner(_)
                | Operation::DelegPurge(_)
                | Operation::Illegal
        )
    }
}

/// COMPOUND request
#[derive(Debug, Clone)]
pub struct CompoundArgs {
    /// Tag (echoed in the reply)
    pub tag: String,
    /// Minor version; only 0 is served
    pub minor_version: u32,
    /// Operations in execution order
    pub ops: Vec<Operation>,
}

impl CompoundArgs {
    /// NFSv4.0 request
    pub fn new(tag: impl Into<String>, ops: Vec<Operation>) -> Self {
        Self {
            tag: tag.into(),
            minor_version: NFS4_MINOR_VERSION,
            ops,
        }
    }
}

/// COMPOUND response
#[derive(Debug, Clone)]
pub struct CompoundRes {
    /// Status of last operation
    pub status: NfsStatus,
    /// Tag (echoed from request)
    pub tag: String,
    /// Operation results
    pub results: Vec<OperationResult>,
}

impl CompoundRes {
    /// Create a new response
    pub fn new(tag: String) -> Self {
        Self {
            status: NfsStatus::Ok,
            tag,
            results: Vec::new(),
        }
    }

    /// Add an operation result
    pub fn add_result(&mut self, result: OperationResult) {
        self.status = result.status;
        self.results.push(result);
    }

    /// Result of the last executed operation
    pub fn last(&self) -> Option<&OperationResult> {
        self.results.last()
    }
}

/// Individual operation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// Operation code
    pub op: Nfs4Op,
    /// Status
    pub status: NfsStatus,
    /// Operation-specific result
    pub body: ResultBody,
}

impl OperationResult {
    /// Create a successful result
    pub fn ok(op: Nfs4Op, body: ResultBody) -> Self {
        Self {
            op,
            status: NfsStatus::Ok,
            body,
        }
    }

    /// Create an error result
    pub fn error(op: Nfs4Op, status: NfsStatus) -> Self {
        Self {
            op,
            status,
            body: ResultBody::None,
        }
    }

    fn from_outcome(op: Nfs4Op, outcome: OpResult) -> Self {
        match outcome {
            Ok(body) => Self::ok(op, body),
            Err(err) => Self {
                op,
                status: err.status,
                body: err.body,
            },
        }
    }
}

/// Failed operation: status plus any payload the error carries
/// (LOCK denial details, SETATTR's empty bitmap)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    /// Failure status
    pub status: NfsStatus,
    /// Error payload
    pub body: ResultBody,
}

impl OpError {
    /// Failure with a payload
    pub fn with_body(status: NfsStatus, body: ResultBody) -> Self {
        Self { status, body }
    }
}

impl From<NfsStatus> for OpError {
    fn from(status: NfsStatus) -> Self {
        Self {
            status,
            body: ResultBody::None,
        }
    }
}

/// Result of an operation
pub type OpResult = Result<ResultBody, OpError>;

/// COMPOUND execution context
#[derive(Debug)]
pub struct CompoundContext {
    /// Current filehandle
    pub current_fh: Option<Filehandle>,
    /// Saved filehandle
    pub saved_fh: Option<Filehandle>,
    /// Caller's credentials
    pub creds: Credentials,
}

impl CompoundContext {
    /// Create a new context
    pub fn new(creds: Credentials) -> Self {
        Self {
            current_fh: None,
            saved_fh: None,
            creds,
        }
    }

    /// Check if current filehandle is set
    pub fn has_current_fh(&self) -> bool {
        self.current_fh.is_some()
    }

    /// Get current filehandle or return error
    pub fn require_current_fh(&self) -> Result<&Filehandle, NfsStatus> {
        self.current_fh.as_ref().ok_or(NfsStatus::NoFileHandle)
    }

    /// Get saved filehandle or return error
    pub fn require_saved_fh(&self) -> Result<&Filehandle, NfsStatus> {
        self.saved_fh.as_ref().ok_or(NfsStatus::RestoreFh)
    }
}

/// Executes COMPOUND requests for one connection
///
/// The dispatcher holds no cursor state between calls; every
/// [`process`](Self::process) starts with empty current and saved
/// filehandles.
#[derive(Clone)]
pub struct CompoundDispatcher {
    server: Arc<ServerState>,
    creds: Credentials,
}

impl CompoundDispatcher {
    /// Dispatcher acting with `creds`
    pub fn new(server: Arc<ServerState>, creds: Credentials) -> Self {
        Self { server, creds }
    }

    /// Credentials of this connection
    pub fn credentials(&self) -> &Credentials {
        &self.creds
    }

    /// Server state this dispatcher works on
    pub fn server(&self) -> &ServerState {
        &self.server
    }

    /// Execute a COMPOUND request
    pub async fn process(&self, args: CompoundArgs) -> CompoundRes {
        let mut res = CompoundRes::new(args.tag);

        if args.minor_version != NFS4_MINOR_VERSION {
            debug!(minor_version = args.minor_version, "unsupported minor version");
            res.status = NfsStatus::MinorVersMismatch;
            return res;
        }

        trace!(tag = %res.tag, ops = args.ops.len(), "COMPOUND");
        let mut ctx = CompoundContext::new(self.creds.clone());
        let limit = self.server.config.max_compound_ops;

        for (index, op) in args.ops.iter().enumerate() {
            let result = if index >= limit {
                OperationResult::error(op.op(), NfsStatus::Resource)
            } else if op.needs_current_fh() && !ctx.has_current_fh() {
                OperationResult::error(op.op(), NfsStatus::NoFileHandle)
            } else {
                let outcome = self.dispatch(&mut ctx, op).await;
                OperationResult::from_outcome(op.op(), outcome)
            };

            let status = result.status;
            res.add_result(result);
            if status != NfsStatus::Ok {
                log_failure(op.op(), status);
                break;
            }
        }

        res
    }

    async fn dispatch(&self, ctx: &mut CompoundContext, op: &Operation) -> OpResult {
        let server = self.server.as_ref();
        match op {
            Operation::PutFh(args) => fs::process_putfh(server, ctx, args).await,
            Operation::PutRootFh | Operation::PutPubFh => fs::process_putrootfh(ctx),
            Operation::GetFh => fs::process_getfh(ctx),
            Operation::SaveFh => fs::process_savefh(ctx),
            Operation::RestoreFh => fs::process_restorefh(ctx),
            Operation::Lookup(args) => fs::process_lookup(server, ctx, args).await,
            Operation::LookupP => fs::process_lookupp(server, ctx).await,
            Operation::Access(args) => fs::process_access(server, ctx, args).await,
            Operation::GetAttr(args) => fs::process_getattr(server, ctx, args).await,
            Operation::SetAttr(args) => fs::process_setattr(server, ctx, args).await,
            Operation::Verify(args) => fs::process_verify(server, ctx, args, true).await,
            Operation::NVerify(args) => fs::process_verify(server, ctx, args, false).await,
            Operation::Create(args) => fs::process_create(server, ctx, args).await,
            Operation::Remove(args) => fs::process_remove(server, ctx, args).await,
            Operation::Rename(args) => fs::process_rename(server, ctx, args).await,
            Operation::Link(args) => fs::process_link(server, ctx, args).await,
            Operation::ReadDir(args) => fs::process_readdir(server, ctx, args).await,
            Operation::ReadLink => fs::process_readlink(server, ctx).await,
            Operation::SecInfo(args) => fs::process_secinfo(server, ctx, args).await,
            Operation::Read(args) => fs::process_read(server, ctx, args).await,
            Operation::Write(args) => fs::process_write(server, ctx, args).await,
            Operation::Commit(args) => fs::process_commit(server, ctx, args).await,
            Operation::SetClientId(args) => state::process_setclientid(server, ctx, args),
            Operation::SetClientIdConfirm(args) => state::process_setclientid_confirm(server, args),
            Operation::Renew(args) => state::process_renew(server, args),
            Operation::Open(args) => state::process_open(server, ctx, args).await,
            Operation::OpenConfirm(args) => state::process_open_confirm(server, ctx, args),
            Operation::OpenDowngrade(args) => state::process_open_downgrade(server, ctx, args),
            Operation::Close(args) => state::process_close(server, ctx, args),
            Operation::Lock(args) => state::process_lock(server, ctx, args),
            Operation::LockT(args) => state::process_lockt(server, ctx, args),
            Operation::LockU(args) => state::process_locku(server, ctx, args),
            Operation::ReleaseLockOwner(args) => state::process_release_lockowner(server, args),
            Operation::OpenAttr { .. } | Operation::DelegPurge(_) | Operation::DelegReturn(_) => {
                Err(NfsStatus::Notsupp.into())
            }
            Operation::Illegal => Err(NfsStatus::OpIllegal.into()),
        }
    }
}

fn log_failure(op: Nfs4Op, status: NfsStatus) {
    match status {
        NfsStatus::BadSeqid
        | NfsStatus::BadStateid
        | NfsStatus::StaleStateid
        | NfsStatus::OldStateid
        | NfsStatus::StaleClientid => warn!(?op, %status, "sequencing failure"),
        _ => debug!(?op, %status, "operation failed"),
    }
}
