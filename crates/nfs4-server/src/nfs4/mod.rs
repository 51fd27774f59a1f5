//! NFSv4.0 protocol implementation
//!
//! This module implements the stateful core of NFSv4.0 as defined in
//! RFC 7530: the COMPOUND dispatcher, the open/lock state engine and the
//! attribute model.

pub mod attr;
pub mod compound;
pub mod ops;
pub mod owner;
pub mod state;

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::NfsStatus;

/// NFSv4.0 minor version
pub const NFS4_MINOR_VERSION: u32 = 0;

/// AUTH_SYS security flavor number
pub const AUTH_SYS: u32 = 1;

/// NFSv4 stateid (identifies open or lock state at the server)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stateid {
    /// Sequence number
    pub seqid: u32,
    /// Other (12 bytes, opaque)
    pub other: [u8; 12],
}

impl Stateid {
    /// Anonymous stateid (all zeros)
    pub const ANONYMOUS: Self = Self {
        seqid: 0,
        other: [0; 12],
    };

    /// Read bypass stateid (all ones)
    pub const READ_BYPASS: Self = Self {
        seqid: u32::MAX,
        other: [0xFF; 12],
    };

    /// Create a new stateid
    pub fn new(seqid: u32, other: [u8; 12]) -> Self {
        Self { seqid, other }
    }

    /// Check if this is the anonymous stateid
    pub fn is_anonymous(&self) -> bool {
        *self == Self::ANONYMOUS
    }

    /// Check if this is the read bypass stateid
    pub fn is_read_bypass(&self) -> bool {
        *self == Self::READ_BYPASS
    }

    /// Special stateids are not bound to any owner
    pub fn is_special(&self) -> bool {
        self.is_anonymous() || self.is_read_bypass()
    }
}

impl fmt::Debug for Stateid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stateid({}:", self.seqid)?;
        for b in &self.other {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Next stateid seqid; wraps from `u32::MAX` to 1, never to 0
pub fn next_stateid_seqid(seqid: u32) -> u32 {
    if seqid == u32::MAX {
        1
    } else {
        seqid + 1
    }
}

/// Serial-number comparison modulo 2^32: is `a` strictly after `b`?
pub fn seqid_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Nfs4FileType {
    /// Regular file
    Regular = 1,
    /// Directory
    Directory = 2,
    /// Block device
    BlockDevice = 3,
    /// Character device
    CharDevice = 4,
    /// Symbolic link
    SymLink = 5,
    /// Socket
    Socket = 6,
    /// FIFO (named pipe)
    Fifo = 7,
    /// Attribute directory
    AttrDir = 8,
    /// Named attribute
    NamedAttr = 9,
}

impl TryFrom<u32> for Nfs4FileType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Regular),
            2 => Ok(Self::Directory),
            3 => Ok(Self::BlockDevice),
            4 => Ok(Self::CharDevice),
            5 => Ok(Self::SymLink),
            6 => Ok(Self::Socket),
            7 => Ok(Self::Fifo),
            8 => Ok(Self::AttrDir),
            9 => Ok(Self::NamedAttr),
            _ => Err(NfsStatus::BadType),
        }
    }
}

/// Access permission bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessBits(pub u32);

impl AccessBits {
    /// Read data
    pub const READ: u32 = 0x00000001;
    /// Lookup in directory
    pub const LOOKUP: u32 = 0x00000002;
    /// Modify file
    pub const MODIFY: u32 = 0x00000004;
    /// Extend file
    pub const EXTEND: u32 = 0x00000008;
    /// Delete entry
    pub const DELETE: u32 = 0x00000010;
    /// Execute file
    pub const EXECUTE: u32 = 0x00000020;
    /// Every bit this server understands
    pub const ALL: u32 = 0x0000003F;

    /// Check if every bit of `bits` is set
    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// Share access mode (OPEN4_SHARE_ACCESS_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareAccess(u32);

impl ShareAccess {
    /// Read access
    pub const READ: Self = Self(0x00000001);
    /// Write access
    pub const WRITE: Self = Self(0x00000002);
    /// Both read and write
    pub const BOTH: Self = Self(0x00000003);

    /// Check if contains a flag
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Check that every bit of `self` is also in `other`
    pub fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Union of two modes
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Create from raw value; access must be READ, WRITE or BOTH
    pub fn from_bits(bits: u32) -> Result<Self, NfsStatus> {
        match bits {
            1..=3 => Ok(Self(bits)),
            _ => Err(NfsStatus::Inval),
        }
    }
}

/// Share deny mode (OPEN4_SHARE_DENY_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareDeny(u32);

impl ShareDeny {
    /// No deny
    pub const NONE: Self = Self(0x00000000);
    /// Deny read
    pub const READ: Self = Self(0x00000001);
    /// Deny write
    pub const WRITE: Self = Self(0x00000002);
    /// Deny both
    pub const BOTH: Self = Self(0x00000003);

    /// Check if any deny bit overlaps an access mode
    pub fn denies(&self, access: ShareAccess) -> bool {
        self.0 & access.bits() != 0
    }

    /// Check that every bit of `self` is also in `other`
    pub fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Union of two modes
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Create from raw value
    pub fn from_bits(bits: u32) -> Result<Self, NfsStatus> {
        match bits {
            0..=3 => Ok(Self(bits)),
            _ => Err(NfsStatus::Inval),
        }
    }
}

/// AUTH_SYS credentials of the connection's principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User id
    pub uid: u32,
    /// Primary group id
    pub gid: u32,
    /// Supplementary group ids
    pub gids: Vec<u32>,
}

impl Credentials {
    /// Superuser credentials
    pub fn root() -> Self {
        Self::new(0, 0)
    }

    /// Credentials for a uid/gid pair
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            gids: Vec::new(),
        }
    }

    /// Check membership in a group
    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.gids.contains(&gid)
    }
}

/// `nfstime4`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NfsTime {
    /// Seconds since the epoch
    pub seconds: i64,
    /// Nanoseconds within the second
    pub nseconds: u32,
}

impl NfsTime {
    /// Convert to a UTC timestamp
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.seconds, self.nseconds).single()
    }
}

impl From<DateTime<Utc>> for NfsTime {
    fn from(time: DateTime<Utc>) -> Self {
        Self {
            seconds: time.timestamp(),
            nseconds: time.timestamp_subsec_nanos(),
        }
    }
}

/// `settime4`: either the server's clock or a client-supplied time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    /// SET_TO_SERVER_TIME4
    ServerTime,
    /// SET_TO_CLIENT_TIME4
    ClientTime(NfsTime),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stateid_special_values() {
        assert!(Stateid::ANONYMOUS.is_anonymous());
        assert!(Stateid::READ_BYPASS.is_read_bypass());
        assert!(!Stateid::READ_BYPASS.is_anonymous());
        assert!(!Stateid::new(1, [0; 12]).is_special());
    }

    #[test]
    fn test_stateid_seqid_wraps_to_one() {
        assert_eq!(next_stateid_seqid(1), 2);
        assert_eq!(next_stateid_seqid(u32::MAX), 1);
    }

    #[test]
    fn test_seqid_serial_comparison() {
        assert!(seqid_after(2, 1));
        assert!(!seqid_after(1, 2));
        assert!(!seqid_after(5, 5));
        assert!(seqid_after(1, u32::MAX));
        assert!(!seqid_after(u32::MAX, 1));
    }

    #[test]
    fn test_share_modes() {
        assert!(ShareAccess::from_bits(0).is_err());
        assert!(ShareAccess::from_bits(4).is_err());
        assert!(ShareAccess::READ.is_subset_of(ShareAccess::BOTH));
        assert!(!ShareAccess::BOTH.is_subset_of(ShareAccess::READ));
        assert!(ShareDeny::WRITE.denies(ShareAccess::BOTH));
        assert!(!ShareDeny::WRITE.denies(ShareAccess::READ));
    }

    #[test]
    fn test_nfstime_conversion() {
        let time = Utc.timestamp_opt(1_700_000_000, 42).single().unwrap();
        let nfs = NfsTime::from(time);
        assert_eq!(nfs.seconds, 1_700_000_000);
        assert_eq!(nfs.nseconds, 42);
        assert_eq!(nfs.to_datetime(), Some(time));
    }
}
