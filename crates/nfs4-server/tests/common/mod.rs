//! Shared harness for the integration tests: a server over an in-memory
//! filesystem and helpers that build the usual COMPOUND sequences.

#![allow(dead_code)]

use std::sync::Arc;

use nfs4_common::{ClientGrant, Filehandle, OwnerKey};
use nfs4_server::nfs4::compound::OperationResult;
use nfs4_server::nfs4::ops::{
    LockArgs, LockType, Locker, LookupArgs, OpenArgs, OpenClaim, OpenCreate, OpenHow, PutFhArgs,
    ResultBody, SetClientIdArgs, SetClientIdConfirmArgs,
};
use nfs4_server::nfs4::attr::Fattr;
use nfs4_server::nfs4::Stateid;
use nfs4_server::{
    CompoundArgs, CompoundDispatcher, CompoundRes, Credentials, MemoryBackend, NfsConfig,
    NfsServer, NfsStatus, Operation,
};

pub const SHARE_READ: u32 = 1;
pub const SHARE_WRITE: u32 = 2;
pub const SHARE_BOTH: u32 = 3;
pub const DENY_NONE: u32 = 0;
pub const DENY_WRITE: u32 = 2;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Config used by most tests: OPEN needs no OPEN_CONFIRM round trip
pub fn test_config() -> NfsConfig {
    NfsConfig::default().skip_open_confirm()
}

pub struct TestServer {
    pub server: NfsServer,
    pub backend: Arc<MemoryBackend>,
    pub nfs: CompoundDispatcher,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: NfsConfig) -> Self {
        init_tracing();
        let backend = Arc::new(MemoryBackend::new());
        let server = NfsServer::new(config, backend.clone()).expect("valid config");
        let nfs = server.dispatcher(Credentials::root());
        Self {
            server,
            backend,
            nfs,
        }
    }

    pub async fn run(&self, ops: Vec<Operation>) -> CompoundRes {
        self.nfs.process(CompoundArgs::new("test", ops)).await
    }

    /// SETCLIENTID + SETCLIENTID_CONFIRM
    pub async fn client(&self, name: &str) -> u64 {
        let res = self
            .run(vec![Operation::SetClientId(SetClientIdArgs {
                verifier: [7; 8],
                id: name.as_bytes().to_vec().into(),
                callback: Default::default(),
                callback_ident: 1,
            })])
            .await;
        assert_eq!(res.status, NfsStatus::Ok);
        let ClientGrant { client_id, confirm } = match &res.results[0].body {
            ResultBody::SetClientId(grant) => *grant,
            other => panic!("unexpected body {other:?}"),
        };

        let res = self
            .run(vec![Operation::SetClientIdConfirm(SetClientIdConfirmArgs {
                client_id,
                confirm,
            })])
            .await;
        assert_eq!(res.status, NfsStatus::Ok);
        client_id
    }

    /// PUTROOTFH, OPEN (create unchecked), GETFH
    pub async fn open(&self, owner: &OwnerKey, seqid: u32, name: &str) -> CompoundRes {
        self.open_with(owner, seqid, name, SHARE_BOTH, DENY_NONE).await
    }

    pub async fn open_with(
        &self,
        owner: &OwnerKey,
        seqid: u32,
        name: &str,
        access: u32,
        deny: u32,
    ) -> CompoundRes {
        self.run(vec![
            Operation::PutRootFh,
            open_op(owner, seqid, name, access, deny),
            Operation::GetFh,
        ])
        .await
    }

    /// Open `name` and return its open stateid and filehandle
    pub async fn open_file(&self, owner: &OwnerKey, seqid: u32, name: &str) -> (Stateid, Filehandle) {
        let res = self.open(owner, seqid, name).await;
        assert_eq!(res.status, NfsStatus::Ok, "open {name}: {res:?}");
        (open_stateid(&res.results[1]), filehandle(&res.results[2]))
    }

    /// PUTFH, LOCK for a lock-owner's first lock
    pub async fn lock_new(
        &self,
        fh: &Filehandle,
        open_stateid: Stateid,
        open_seqid: u32,
        lock_owner: &OwnerKey,
        lock_type: LockType,
        offset: u64,
        length: u64,
    ) -> CompoundRes {
        self.run(vec![
            putfh(fh),
            Operation::Lock(LockArgs {
                lock_type,
                reclaim: false,
                offset,
                length,
                locker: Locker::NewOwner {
                    open_seqid,
                    open_stateid,
                    lock_seqid: 0,
                    lock_owner: lock_owner.clone(),
                },
            }),
        ])
        .await
    }
}

pub fn open_op(owner: &OwnerKey, seqid: u32, name: &str, access: u32, deny: u32) -> Operation {
    Operation::Open(OpenArgs {
        seqid,
        share_access: access,
        share_deny: deny,
        owner: owner.clone(),
        how: OpenHow::Create(OpenCreate::Unchecked(Fattr::new(Vec::new()))),
        claim: OpenClaim::Null(name.to_string()),
    })
}

pub fn putfh(fh: &Filehandle) -> Operation {
    Operation::PutFh(PutFhArgs { object: fh.clone() })
}

pub fn lookup(name: &str) -> Operation {
    Operation::Lookup(LookupArgs {
        name: name.to_string(),
    })
}

pub fn owner(client_id: u64, name: &str) -> OwnerKey {
    OwnerKey::new(client_id, name.as_bytes().to_vec())
}

pub fn open_stateid(result: &OperationResult) -> Stateid {
    match &result.body {
        ResultBody::Open(open) => open.stateid,
        other => panic!("expected OPEN result, got {other:?}"),
    }
}

pub fn lock_stateid(result: &OperationResult) -> Stateid {
    match &result.body {
        ResultBody::Lock(stateid) | ResultBody::LockU(stateid) => *stateid,
        other => panic!("expected LOCK result, got {other:?}"),
    }
}

pub fn filehandle(result: &OperationResult) -> Filehandle {
    match &result.body {
        ResultBody::GetFh(fh) => fh.clone(),
        other => panic!("expected GETFH result, got {other:?}"),
    }
}
