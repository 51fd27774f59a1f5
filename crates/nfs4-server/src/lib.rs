//! NFSv4.0 server core
//!
//! This crate implements the stateful heart of an NFSv4.0 server: the
//! COMPOUND dispatcher, open-owner and lock-owner sequencing with replay
//! protection, share reservations, byte-range locking and directory change
//! tracking. Storage is reached through the [`OperationsBackend`] trait.
//!
//! # Features
//!
//! - COMPOUND processing with current/saved filehandles
//! - Seqid-ordered OPEN, CLOSE and LOCK with a per-owner replay cache
//! - Share reservations and POSIX byte-range locks
//! - Path and id filehandles; id handles survive RENAME
//! - Atomic `change_info4` for directory mutations
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ RPC / XDR (external) │
//! └──────────┬───────────┘
//!            │ CompoundArgs
//! ┌──────────▼───────────┐
//! │  CompoundDispatcher  │
//! │   - owners (seqid)   │
//! │   - state engine     │
//! │   - lock table       │
//! │   - fh registry      │
//! └──────────┬───────────┘
//!            │
//! ┌──────────▼───────────┐
//! │  OperationsBackend   │
//! └──────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod error;
pub mod nfs4;
pub mod server;

pub use backend::{MemoryBackend, OperationsBackend};
pub use config::NfsConfig;
pub use error::{NfsError, NfsResult, NfsStatus};
pub use nfs4::compound::{CompoundArgs, CompoundDispatcher, CompoundRes, Operation};
pub use nfs4::Credentials;
pub use server::{NfsServer, ServerState};
