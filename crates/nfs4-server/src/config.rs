//! NFS server configuration

use std::time::Duration;

use nfs4_common::{FilehandlePolicy, FHSIZE};
use serde::{Deserialize, Serialize};

use crate::error::{NfsError, NfsResult};

/// Filesystem id reported in the `fsid` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fsid {
    /// Major number
    pub major: u64,
    /// Minor number
    pub minor: u64,
}

impl Default for Fsid {
    fn default() -> Self {
        Self { major: 1, minor: 0 }
    }
}

/// NFS server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsConfig {
    /// Lease time advertised to clients
    pub lease_time: Duration,
    /// Maximum COMPOUND operations per request
    pub max_compound_ops: usize,
    /// Maximum read size
    pub max_read_size: u32,
    /// Maximum write size
    pub max_write_size: u32,
    /// Maximum length of a single name component
    pub max_name_len: usize,
    /// Largest encoded Path handle; longer paths get Id handles
    pub short_handle_budget: usize,
    /// Which handle encoding to issue
    pub filehandle_policy: FilehandlePolicy,
    /// Serve LOCK/LOCKT/LOCKU
    pub locking_enabled: bool,
    /// New open-owners must confirm their first OPEN
    pub require_open_confirm: bool,
    /// Filesystem id
    pub fsid: Fsid,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            lease_time: Duration::from_secs(90),
            max_compound_ops: 64,
            max_read_size: 1024 * 1024,  // 1 MB
            max_write_size: 1024 * 1024, // 1 MB
            max_name_len: 255,
            short_handle_budget: 64,
            filehandle_policy: FilehandlePolicy::PreferPath,
            locking_enabled: true,
            require_open_confirm: true,
            fsid: Fsid::default(),
        }
    }
}

impl NfsConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised lease time
    pub fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = lease_time;
        self
    }

    /// Set the COMPOUND operation limit
    pub fn with_max_compound_ops(mut self, max: usize) -> Self {
        self.max_compound_ops = max;
        self
    }

    /// Set the read and write size limits
    pub fn with_io_size(mut self, read: u32, write: u32) -> Self {
        self.max_read_size = read;
        self.max_write_size = write;
        self
    }

    /// Set the name length limit
    pub fn with_max_name_len(mut self, max: usize) -> Self {
        self.max_name_len = max;
        self
    }

    /// Set the handle policy and short handle budget
    pub fn with_filehandles(mut self, policy: FilehandlePolicy, short_budget: usize) -> Self {
        self.filehandle_policy = policy;
        self.short_handle_budget = short_budget;
        self
    }

    /// Disable byte-range locking
    pub fn disable_locking(mut self) -> Self {
        self.locking_enabled = false;
        self
    }

    /// Treat first OPENs as confirmed
    pub fn skip_open_confirm(mut self) -> Self {
        self.require_open_confirm = false;
        self
    }

    /// Set the filesystem id
    pub fn with_fsid(mut self, major: u64, minor: u64) -> Self {
        self.fsid = Fsid { major, minor };
        self
    }

    /// Check the configuration for values the server cannot honour
    pub fn validate(&self) -> NfsResult<()> {
        if self.max_compound_ops == 0 {
            return Err(NfsError::Config("max_compound_ops must be positive".into()));
        }
        if self.max_read_size == 0 || self.max_write_size == 0 {
            return Err(NfsError::Config("I/O sizes must be positive".into()));
        }
        if self.max_name_len == 0 {
            return Err(NfsError::Config("max_name_len must be positive".into()));
        }
        if self.short_handle_budget > FHSIZE {
            return Err(NfsError::Config(format!(
                "short_handle_budget {} exceeds {} bytes",
                self.short_handle_budget, FHSIZE
            )));
        }
        if self.lease_time.as_secs() == 0 || self.lease_time.as_secs() > u32::MAX as u64 {
            return Err(NfsError::Config("lease_time out of range".into()));
        }
        Ok(())
    }
}
