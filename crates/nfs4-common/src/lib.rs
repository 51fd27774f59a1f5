//! Shared state for the NFSv4 server
//!
//! This crate holds the server-wide tables every connection shares:
//! - Filehandle registry (Path and Id handles, rename tracking)
//! - Byte-range lock table (conflict detection)
//! - Directory change counters (`change_info4`)
//! - Client records (SETCLIENTID / confirm / renew)

#![warn(missing_docs)]

pub mod change;
pub mod client;
pub mod error;
pub mod filehandle;
pub mod lock;
pub mod path;

pub use change::{ChangeCounter, ChangeInfo};
pub use client::{ClientGrant, ClientRecord, ClientTable, Verifier};
pub use error::{CommonError, CommonResult};
pub use filehandle::{
    Filehandle, FilehandleKind, FilehandlePolicy, FilehandleRegistry, HandleTarget,
    ObjectId, ObjectIdentity, FHSIZE, ROOT_ID,
};
pub use lock::{
    validate_range, ByteRangeLock, FileId, LockDenied, LockError, LockKind, LockTable, OwnerKey,
    LENGTH_TO_EOF,
};
pub use path::ObjectPath;
