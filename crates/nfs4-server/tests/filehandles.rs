//! Path and id filehandles across RENAME, REMOVE and reboots of the
//! registry

mod common;

use common::{filehandle, lookup, owner, putfh, test_config, TestServer};
use nfs4_common::{Filehandle, FilehandleKind, FilehandlePolicy};
use nfs4_server::backend::StableHow;
use nfs4_server::nfs4::attr::{ids, AttrValue, Bitmap};
use nfs4_server::nfs4::ops::{
    GetAttrArgs, ReadArgs, RemoveArgs, RenameArgs, ResultBody, WriteArgs,
};
use nfs4_server::{NfsStatus, Operation};

fn id_server() -> TestServer {
    TestServer::with_config(test_config().with_filehandles(FilehandlePolicy::AlwaysId, 0))
}

fn rename(old_name: &str, new_name: &str) -> Vec<Operation> {
    vec![
        Operation::PutRootFh,
        Operation::SaveFh,
        Operation::Rename(RenameArgs {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        }),
    ]
}

async fn handle_of(t: &TestServer, names: &[&str]) -> Filehandle {
    let mut ops = vec![Operation::PutRootFh];
    ops.extend(names.iter().map(|name| lookup(name)));
    ops.push(Operation::GetFh);
    let res = t.run(ops).await;
    assert_eq!(res.status, NfsStatus::Ok, "{names:?}");
    filehandle(res.last().unwrap())
}

fn getattr_fileid() -> Operation {
    Operation::GetAttr(GetAttrArgs {
        request: Bitmap::from_ids(&[ids::FILEID]),
    })
}

#[tokio::test]
async fn test_id_handle_survives_rename_and_rename_back() {
    let t = id_server();
    t.backend.insert_file("/a.txt", b"contents").unwrap();

    let fh = handle_of(&t, &["a.txt"]).await;
    assert_eq!(fh.kind(), Some(FilehandleKind::Id));

    assert_eq!(t.run(rename("a.txt", "b.txt")).await.status, NfsStatus::Ok);
    let res = t.run(vec![putfh(&fh), getattr_fileid()]).await;
    assert_eq!(res.status, NfsStatus::Ok);
    assert_eq!(handle_of(&t, &["b.txt"]).await, fh);

    assert_eq!(t.run(rename("b.txt", "a.txt")).await.status, NfsStatus::Ok);
    let res = t.run(vec![putfh(&fh), getattr_fileid()]).await;
    assert_eq!(res.status, NfsStatus::Ok);
    assert_eq!(handle_of(&t, &["a.txt"]).await, fh);
}

#[tokio::test]
async fn test_id_handle_below_renamed_directory() {
    let t = id_server();
    t.backend.insert_file("/dir/x.txt", b"x").unwrap();
    let fh = handle_of(&t, &["dir", "x.txt"]).await;

    assert_eq!(t.run(rename("dir", "moved")).await.status, NfsStatus::Ok);
    assert_eq!(handle_of(&t, &["moved", "x.txt"]).await, fh);
    let res = t.run(vec![putfh(&fh), getattr_fileid()]).await;
    assert_eq!(res.status, NfsStatus::Ok);
}

#[tokio::test]
async fn test_fileid_is_stable() {
    let t = id_server();
    t.backend.insert_file("/a", b"").unwrap();
    let fh = handle_of(&t, &["a"]).await;

    let fileid = |res: &nfs4_server::CompoundRes| match &res.results[1].body {
        ResultBody::GetAttr(fattr) => fattr.get(ids::FILEID).cloned(),
        _ => None,
    };
    let before = fileid(&t.run(vec![putfh(&fh), getattr_fileid()]).await);
    t.run(rename("a", "b")).await;
    let after = fileid(&t.run(vec![putfh(&fh), getattr_fileid()]).await);
    assert!(matches!(before, Some(AttrValue::FileId(_))));
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_path_handle_goes_stale_on_rename() {
    let t = TestServer::new();
    t.backend.insert_file("/a.txt", b"").unwrap();

    let fh = handle_of(&t, &["a.txt"]).await;
    assert_eq!(fh.kind(), Some(FilehandleKind::Path));

    t.run(rename("a.txt", "b.txt")).await;
    let res = t.run(vec![putfh(&fh)]).await;
    assert_eq!(res.status, NfsStatus::Stale);
}

#[tokio::test]
async fn test_long_paths_get_id_handles() {
    let t = TestServer::with_config(
        test_config().with_filehandles(FilehandlePolicy::PreferPath, 16),
    );
    t.backend.insert_file("/short", b"").unwrap();
    t.backend
        .insert_file("/a-rather-long-file-name.txt", b"")
        .unwrap();

    assert_eq!(
        handle_of(&t, &["short"]).await.kind(),
        Some(FilehandleKind::Path)
    );
    assert_eq!(
        handle_of(&t, &["a-rather-long-file-name.txt"]).await.kind(),
        Some(FilehandleKind::Id)
    );
}

#[tokio::test]
async fn test_removed_object_is_stale() {
    let t = id_server();
    t.backend.insert_file("/gone", b"").unwrap();
    let fh = handle_of(&t, &["gone"]).await;

    let res = t
        .run(vec![
            Operation::PutRootFh,
            Operation::Remove(RemoveArgs {
                target: "gone".to_string(),
            }),
        ])
        .await;
    assert_eq!(res.status, NfsStatus::Ok);

    let res = t.run(vec![putfh(&fh)]).await;
    assert_eq!(res.status, NfsStatus::Stale);
}

#[tokio::test]
async fn test_path_handles_from_another_instance() {
    let issuer = TestServer::new();
    let mut handles = Vec::new();
    for n in 0..20 {
        let name = format!("ghost-{n}");
        issuer.backend.insert_file(&format!("/{name}"), b"").unwrap();
        handles.push(handle_of(&issuer, &[name.as_str()]).await);
    }

    let t = TestServer::new();
    let registered = t.server.state().registry.object_count();
    for fh in &handles {
        assert_eq!(fh.kind(), Some(FilehandleKind::Path));
        let res = t.run(vec![putfh(fh)]).await;
        assert_eq!(res.status, NfsStatus::Stale);
    }
    assert_eq!(t.server.state().registry.object_count(), registered);

    // Once the object exists here too, the handle is adopted
    t.backend.insert_file("/ghost-0", b"boo").unwrap();
    let res = t.run(vec![putfh(&handles[0]), getattr_fileid()]).await;
    assert_eq!(res.status, NfsStatus::Ok);
    assert_eq!(t.server.state().registry.object_count(), registered + 1);
    assert_eq!(handle_of(&t, &["ghost-0"]).await, handles[0]);
}

#[tokio::test]
async fn test_garbage_handle() {
    let t = TestServer::new();
    let res = t
        .run(vec![putfh(&Filehandle::from_bytes(vec![9, 1, 2, 3]))])
        .await;
    assert_eq!(res.status, NfsStatus::Badhandle);
}

#[tokio::test]
async fn test_open_state_follows_renamed_file() {
    let t = id_server();
    let c1 = t.client("client-1").await;
    let (open, fh) = t.open_file(&owner(c1, "owner"), 0, "data").await;

    assert_eq!(t.run(rename("data", "renamed")).await.status, NfsStatus::Ok);

    let res = t
        .run(vec![
            putfh(&fh),
            Operation::Write(WriteArgs {
                stateid: open,
                offset: 0,
                stable: StableHow::FileSync,
                data: "hello".into(),
            }),
            Operation::Read(ReadArgs {
                stateid: open,
                offset: 0,
                count: 100,
            }),
        ])
        .await;
    assert_eq!(res.status, NfsStatus::Ok);
    let ResultBody::Read(read) = &res.results[2].body else {
        panic!("expected READ result");
    };
    assert_eq!(&read.data[..], b"hello");
    assert!(read.eof);
    assert_eq!(t.backend.contents("/renamed").unwrap(), b"hello");
}
