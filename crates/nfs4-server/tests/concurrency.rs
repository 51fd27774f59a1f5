//! Concurrent dispatchers sharing one server

mod common;

use std::sync::Arc;

use common::{lock_stateid, owner, putfh, TestServer};
use nfs4_server::backend::CreateKind;
use nfs4_server::nfs4::attr::Fattr;
use nfs4_server::nfs4::ops::{
    CloseArgs, CreateArgs, LockArgs, LockType, LockUArgs, Locker, ResultBody,
};
use nfs4_server::{NfsStatus, Operation};

const TASKS: usize = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_owners_in_parallel() {
    let t = Arc::new(TestServer::new());

    let mut handles = Vec::new();
    for i in 0..TASKS {
        let t = t.clone();
        handles.push(tokio::spawn(async move {
            let client = t.client(&format!("client-{i}")).await;
            let name = format!("file-{i}");
            let (open, fh) = t.open_file(&owner(client, "open"), 0, &name).await;
            let res = t
                .lock_new(&fh, open, 1, &owner(client, "lock"), LockType::Write, 0, 100)
                .await;
            assert_eq!(res.status, NfsStatus::Ok);
            lock_stateid(&res.results[1])
        }));
    }

    for handle in handles {
        let stateid = handle.await.unwrap();
        assert_eq!(stateid.seqid, 1);
    }
    assert_eq!(t.server.state().clients.len(), TASKS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_winner_for_contended_range() {
    let t = Arc::new(TestServer::new());
    let client = t.client("contended").await;

    let mut opens = Vec::new();
    for i in 0..TASKS {
        opens.push(t.open_file(&owner(client, &format!("open-{i}")), 0, "shared").await);
    }

    let mut handles = Vec::new();
    for (i, (open, fh)) in opens.into_iter().enumerate() {
        let t = t.clone();
        handles.push(tokio::spawn(async move {
            let lock_owner = owner(client, &format!("lock-{i}"));
            t.lock_new(&fh, open, 1, &lock_owner, LockType::Write, 0, 4096)
                .await
                .status
        }));
    }

    let mut granted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            NfsStatus::Ok => granted += 1,
            status => assert_eq!(status, NfsStatus::Denied),
        }
    }
    assert_eq!(granted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_get_disjoint_change_info() {
    let t = Arc::new(TestServer::new());

    let mut handles = Vec::new();
    for i in 0..TASKS {
        let t = t.clone();
        handles.push(tokio::spawn(async move {
            let res = t
                .run(vec![
                    Operation::PutRootFh,
                    Operation::Create(CreateArgs {
                        kind: CreateKind::Directory,
                        name: format!("dir-{i}"),
                        attrs: Fattr::new(Vec::new()),
                    }),
                ])
                .await;
            assert_eq!(res.status, NfsStatus::Ok);
            match &res.results[1].body {
                ResultBody::Create { cinfo, .. } => *cinfo,
                other => panic!("expected CREATE result, got {other:?}"),
            }
        }));
    }

    let mut infos = Vec::new();
    for handle in handles {
        infos.push(handle.await.unwrap());
    }
    infos.sort_by_key(|info| info.before);
    for pair in infos.windows(2) {
        assert!(pair[0].after <= pair[1].before, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
    for info in &infos {
        assert!(info.atomic && info.after > info.before);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatchers_have_private_cursors() {
    let t = Arc::new(TestServer::new());
    t.backend.insert_dir("/a").unwrap();

    let mut handles = Vec::new();
    for i in 0..TASKS {
        let nfs = t.server.dispatcher(nfs4_server::Credentials::root());
        handles.push(tokio::spawn(async move {
            let ops = if i % 2 == 0 {
                vec![Operation::PutRootFh, common::lookup("a"), Operation::GetFh]
            } else {
                vec![Operation::GetFh]
            };
            (i, nfs.process(nfs4_server::CompoundArgs::new("c", ops)).await.status)
        }));
    }

    for handle in handles {
        let (i, status) = handle.await.unwrap();
        let expected = if i % 2 == 0 {
            NfsStatus::Ok
        } else {
            NfsStatus::NoFileHandle
        };
        assert_eq!(status, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_lock_never_strands_a_lock() {
    let t = Arc::new(TestServer::new());
    let client = t.client("racer").await;

    for i in 0..200 {
        let (open, fh) = t
            .open_file(&owner(client, &format!("open-{i}")), 0, &format!("race-{i}"))
            .await;
        let res = t
            .lock_new(&fh, open, 1, &owner(client, &format!("lock-{i}")), LockType::Write, 0, 10)
            .await;
        assert_eq!(res.status, NfsStatus::Ok);
        let lock = lock_stateid(&res.results[1]);

        let unlock = Operation::LockU(LockUArgs {
            lock_type: LockType::Write,
            seqid: 1,
            lock_stateid: lock,
            offset: 0,
            length: 10,
        });
        let res = t.run(vec![putfh(&fh), unlock]).await;
        assert_eq!(res.status, NfsStatus::Ok);
        let lock = lock_stateid(&res.results[1]);

        let relock = Operation::Lock(LockArgs {
            lock_type: LockType::Write,
            reclaim: false,
            offset: 100,
            length: 10,
            locker: Locker::ExistingOwner {
                lock_stateid: lock,
                lock_seqid: 2,
            },
        });
        let close = Operation::Close(CloseArgs {
            seqid: 2,
            stateid: open,
        });
        let locking = {
            let (t, ops) = (t.clone(), vec![putfh(&fh), relock]);
            tokio::spawn(async move { t.run(ops).await.status })
        };
        let closing = {
            let (t, ops) = (t.clone(), vec![putfh(&fh), close]);
            tokio::spawn(async move { t.run(ops).await.status })
        };
        let lock_status = locking.await.unwrap();
        let close_status = closing.await.unwrap();

        let state = t.server.state();
        let file = state.registry.resolve(&fh).unwrap();
        let held = state.locks.locks_for(file.id).len();
        match close_status {
            NfsStatus::Ok => {
                assert_ne!(lock_status, NfsStatus::Ok, "iteration {i}");
                assert_eq!(held, 0, "iteration {i}: lock={lock_status}");
            }
            NfsStatus::LocksHeld => {
                assert_eq!(lock_status, NfsStatus::Ok, "iteration {i}");
                assert_eq!(held, 1, "iteration {i}");
            }
            other => panic!("iteration {i}: unexpected CLOSE status {other}"),
        }
    }
}
