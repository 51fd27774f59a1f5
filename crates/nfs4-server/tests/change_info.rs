//! Directory change_info around CREATE, REMOVE, RENAME, LINK and OPEN

mod common;

use common::{lookup, owner, TestServer};
use nfs4_common::ChangeInfo;
use nfs4_server::backend::CreateKind;
use nfs4_server::nfs4::attr::{ids, AttrValue, Bitmap, Fattr};
use nfs4_server::nfs4::ops::{
    CreateArgs, GetAttrArgs, LinkArgs, RemoveArgs, RenameArgs, ResultBody,
};
use nfs4_server::{NfsStatus, Operation};

fn assert_advanced(cinfo: &ChangeInfo) {
    assert!(cinfo.atomic);
    assert!(cinfo.after > cinfo.before, "{cinfo:?}");
}

fn mkdir(name: &str) -> Operation {
    Operation::Create(CreateArgs {
        kind: CreateKind::Directory,
        name: name.to_string(),
        attrs: Fattr::new(Vec::new()),
    })
}

#[tokio::test]
async fn test_create_and_remove() {
    let t = TestServer::new();

    let res = t.run(vec![Operation::PutRootFh, mkdir("sub")]).await;
    assert_eq!(res.status, NfsStatus::Ok);
    let ResultBody::Create { cinfo, .. } = &res.results[1].body else {
        panic!("expected CREATE result");
    };
    assert_advanced(cinfo);
    let created = *cinfo;

    let res = t
        .run(vec![
            Operation::PutRootFh,
            Operation::Remove(RemoveArgs {
                target: "sub".to_string(),
            }),
        ])
        .await;
    assert_eq!(res.status, NfsStatus::Ok);
    let ResultBody::Remove(cinfo) = &res.results[1].body else {
        panic!("expected REMOVE result");
    };
    assert_advanced(cinfo);
    assert_eq!(cinfo.before, created.after);
}

#[tokio::test]
async fn test_create_existing_fails_without_change() {
    let t = TestServer::new();
    t.backend.insert_dir("/sub").unwrap();

    let res = t.run(vec![Operation::PutRootFh, mkdir("sub")]).await;
    assert_eq!(res.status, NfsStatus::Exist);
}

#[tokio::test]
async fn test_rename_between_directories() {
    let t = TestServer::new();
    t.backend.insert_file("/src/a.txt", b"a").unwrap();
    t.backend.insert_dir("/dst").unwrap();

    let res = t
        .run(vec![
            Operation::PutRootFh,
            lookup("src"),
            Operation::SaveFh,
            Operation::PutRootFh,
            lookup("dst"),
            Operation::Rename(RenameArgs {
                old_name: "a.txt".to_string(),
                new_name: "b.txt".to_string(),
            }),
        ])
        .await;
    assert_eq!(res.status, NfsStatus::Ok);
    let ResultBody::Rename { source, target } = &res.results[5].body else {
        panic!("expected RENAME result");
    };
    assert_advanced(source);
    assert_advanced(target);
    assert_eq!(t.backend.contents("/dst/b.txt").unwrap(), b"a");
}

#[tokio::test]
async fn test_rename_within_directory() {
    let t = TestServer::new();
    t.backend.insert_file("/a", b"").unwrap();

    let res = t
        .run(vec![
            Operation::PutRootFh,
            Operation::SaveFh,
            Operation::Rename(RenameArgs {
                old_name: "a".to_string(),
                new_name: "b".to_string(),
            }),
        ])
        .await;
    let ResultBody::Rename { source, target } = &res.results[2].body else {
        panic!("expected RENAME result");
    };
    assert_advanced(source);
    assert_eq!(source, target);
}

#[tokio::test]
async fn test_link() {
    let t = TestServer::new();
    t.backend.insert_file("/a", b"data").unwrap();

    let res = t
        .run(vec![
            Operation::PutRootFh,
            lookup("a"),
            Operation::SaveFh,
            Operation::PutRootFh,
            Operation::Link(LinkArgs {
                new_name: "b".to_string(),
            }),
        ])
        .await;
    assert_eq!(res.status, NfsStatus::Ok);
    let ResultBody::Link(cinfo) = &res.results[4].body else {
        panic!("expected LINK result");
    };
    assert_advanced(cinfo);
    assert_eq!(t.backend.contents("/b").unwrap(), b"data");
}

#[tokio::test]
async fn test_open_create_advances_directory() {
    let t = TestServer::new();
    let c1 = t.client("client-1").await;

    let res = t.open(&owner(c1, "owner"), 0, "new.txt").await;
    let ResultBody::Open(open) = &res.results[1].body else {
        panic!("expected OPEN result");
    };
    assert_advanced(&open.cinfo);
}

#[tokio::test]
async fn test_directory_change_attribute_follows_counter() {
    let t = TestServer::new();
    let getattr = || {
        Operation::GetAttr(GetAttrArgs {
            request: Bitmap::from_ids(&[ids::CHANGE]),
        })
    };
    let change_of = |body: &ResultBody| match body {
        ResultBody::GetAttr(fattr) => match fattr.get(ids::CHANGE) {
            Some(AttrValue::Change(change)) => *change,
            other => panic!("unexpected change attribute {other:?}"),
        },
        other => panic!("expected GETATTR result, got {other:?}"),
    };

    let res = t
        .run(vec![Operation::PutRootFh, getattr(), mkdir("d"), Operation::PutRootFh, getattr()])
        .await;
    assert_eq!(res.status, NfsStatus::Ok);
    let before = change_of(&res.results[1].body);
    let after = change_of(&res.results[4].body);
    let ResultBody::Create { cinfo, .. } = &res.results[2].body else {
        panic!("expected CREATE result");
    };
    assert_eq!(cinfo.before, before);
    assert_eq!(cinfo.after, after);
}
