//! File attributes
//!
//! Attribute bitmaps, typed attribute values and the conversions behind
//! GETATTR, SETATTR, VERIFY/NVERIFY and READDIR.

use bytes::Bytes;
use nfs4_common::Filehandle;

use super::{Nfs4FileType, NfsTime, SetTime};
use crate::backend::{FileAttr, SetAttrs};
use crate::config::NfsConfig;
use crate::error::NfsStatus;

/// Attribute numbers (RFC 7530 section 5)
pub mod ids {
    #![allow(missing_docs)]
    pub const SUPPORTED_ATTRS: u32 = 0;
    pub const TYPE: u32 = 1;
    pub const FH_EXPIRE_TYPE: u32 = 2;
    pub const CHANGE: u32 = 3;
    pub const SIZE: u32 = 4;
    pub const LINK_SUPPORT: u32 = 5;
    pub const SYMLINK_SUPPORT: u32 = 6;
    pub const NAMED_ATTR: u32 = 7;
    pub const FSID: u32 = 8;
    pub const UNIQUE_HANDLES: u32 = 9;
    pub const LEASE_TIME: u32 = 10;
    pub const RDATTR_ERROR: u32 = 11;
    pub const ACL: u32 = 12;
    pub const CANSETTIME: u32 = 15;
    pub const CASE_INSENSITIVE: u32 = 16;
    pub const CASE_PRESERVING: u32 = 17;
    pub const FILEHANDLE: u32 = 19;
    pub const FILEID: u32 = 20;
    pub const MAXFILESIZE: u32 = 27;
    pub const MAXNAME: u32 = 29;
    pub const MAXREAD: u32 = 30;
    pub const MAXWRITE: u32 = 31;
    pub const MODE: u32 = 33;
    pub const NO_TRUNC: u32 = 34;
    pub const NUMLINKS: u32 = 35;
    pub const OWNER: u32 = 36;
    pub const OWNER_GROUP: u32 = 37;
    pub const RAWDEV: u32 = 41;
    pub const SPACE_USED: u32 = 45;
    pub const TIME_ACCESS: u32 = 47;
    pub const TIME_ACCESS_SET: u32 = 48;
    pub const TIME_METADATA: u32 = 52;
    pub const TIME_MODIFY: u32 = 53;
    pub const TIME_MODIFY_SET: u32 = 54;
    pub const MOUNTED_ON_FILEID: u32 = 55;
}

/// Attributes this server understands, in ascending order
pub const SUPPORTED: &[u32] = &[
    ids::SUPPORTED_ATTRS,
    ids::TYPE,
    ids::FH_EXPIRE_TYPE,
    ids::CHANGE,
    ids::SIZE,
    ids::LINK_SUPPORT,
    ids::SYMLINK_SUPPORT,
    ids::NAMED_ATTR,
    ids::FSID,
    ids::UNIQUE_HANDLES,
    ids::LEASE_TIME,
    ids::RDATTR_ERROR,
    ids::CANSETTIME,
    ids::CASE_INSENSITIVE,
    ids::CASE_PRESERVING,
    ids::FILEHANDLE,
    ids::FILEID,
    ids::MAXFILESIZE,
    ids::MAXNAME,
    ids::MAXREAD,
    ids::MAXWRITE,
    ids::MODE,
    ids::NO_TRUNC,
    ids::NUMLINKS,
    ids::OWNER,
    ids::OWNER_GROUP,
    ids::RAWDEV,
    ids::SPACE_USED,
    ids::TIME_ACCESS,
    ids::TIME_ACCESS_SET,
    ids::TIME_METADATA,
    ids::TIME_MODIFY,
    ids::TIME_MODIFY_SET,
    ids::MOUNTED_ON_FILEID,
];

/// Attributes SETATTR may change
const WRITABLE: &[u32] = &[
    ids::SIZE,
    ids::MODE,
    ids::OWNER,
    ids::OWNER_GROUP,
    ids::TIME_ACCESS_SET,
    ids::TIME_MODIFY_SET,
];

/// `fh_expire_type` values
pub mod fh_expire {
    /// Handles never expire
    pub const PERSISTENT: u32 = 0x00;
    /// Handles may expire on rename
    pub const VOL_RENAME: u32 = 0x08;
}

/// Attribute bitmap: bit `n` of word `i` stands for attribute `32 * i + n`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Bitmap(Vec<u32>);

impl Bitmap {
    /// Empty bitmap
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmap from raw words
    pub fn from_words(words: Vec<u32>) -> Self {
        Self(words)
    }

    /// Bitmap with the given attributes set
    pub fn from_ids(ids: &[u32]) -> Self {
        let mut bitmap = Self::new();
        for id in ids {
            bitmap.set(*id);
        }
        bitmap
    }

    /// Set an attribute bit
    pub fn set(&mut self, id: u32) {
        let word = (id / 32) as usize;
        if self.0.len() <= word {
            self.0.resize(word + 1, 0);
        }
        self.0[word] |= 1 << (id % 32);
    }

    /// Check an attribute bit
    pub fn contains(&self, id: u32) -> bool {
        self.0
            .get((id / 32) as usize)
            .is_some_and(|word| word & (1 << (id % 32)) != 0)
    }

    /// Raw words
    pub fn words(&self) -> &[u32] {
        &self.0
    }

    /// Check if no bit is set
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Set attribute numbers in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().enumerate().flat_map(|(i, word)| {
            (0..32)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i as u32 * 32 + bit)
        })
    }
}

/// Every supported attribute
pub fn supported_bitmap() -> Bitmap {
    Bitmap::from_ids(SUPPORTED)
}

/// Typed attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// supported_attrs
    SupportedAttrs(Bitmap),
    /// type
    Type(Nfs4FileType),
    /// fh_expire_type
    FhExpireType(u32),
    /// change
    Change(u64),
    /// size
    Size(u64),
    /// link_support
    LinkSupport(bool),
    /// symlink_support
    SymlinkSupport(bool),
    /// named_attr
    NamedAttr(bool),
    /// fsid
    Fsid {
        /// Major number
        major: u64,
        /// Minor number
        minor: u64,
    },
    /// unique_handles
    UniqueHandles(bool),
    /// lease_time in seconds
    LeaseTime(u32),
    /// rdattr_error
    RdattrError(NfsStatus),
    /// cansettime
    CanSetTime(bool),
    /// case_insensitive
    CaseInsensitive(bool),
    /// case_preserving
    CasePreserving(bool),
    /// filehandle
    Filehandle(Filehandle),
    /// fileid
    FileId(u64),
    /// maxfilesize
    MaxFileSize(u64),
    /// maxname
    MaxName(u32),
    /// maxread
    MaxRead(u64),
    /// maxwrite
    MaxWrite(u64),
    /// mode
    Mode(u32),
    /// no_trunc
    NoTrunc(bool),
    /// numlinks
    NumLinks(u32),
    /// owner
    Owner(String),
    /// owner_group
    OwnerGroup(String),
    /// rawdev
    RawDev {
        /// Major number
        major: u32,
        /// Minor number
        minor: u32,
    },
    /// space_used
    SpaceUsed(u64),
    /// time_access
    TimeAccess(NfsTime),
    /// time_access_set
    TimeAccessSet(SetTime),
    /// time_metadata
    TimeMetadata(NfsTime),
    /// time_modify
    TimeModify(NfsTime),
    /// time_modify_set
    TimeModifySet(SetTime),
    /// mounted_on_fileid
    MountedOnFileId(u64),
    /// Attribute this server does not interpret, kept as raw XDR
    Other {
        /// Attribute number
        id: u32,
        /// Encoded value
        raw: Bytes,
    },
}

impl AttrValue {
    /// Attribute number
    pub fn id(&self) -> u32 {
        match self {
            AttrValue::SupportedAttrs(_) => ids::SUPPORTED_ATTRS,
            AttrValue::Type(_) => ids::TYPE,
            AttrValue::FhExpireType(_) => ids::FH_EXPIRE_TYPE,
            AttrValue::Change(_) => ids::CHANGE,
            AttrValue::Size(_) => ids::SIZE,
            AttrValue::LinkSupport(_) => ids::LINK_SUPPORT,
            AttrValue::SymlinkSupport(_) => ids::SYMLINK_SUPPORT,
            AttrValue::NamedAttr(_) => ids::NAMED_ATTR,
            AttrValue::Fsid { .. } => ids::FSID,
            AttrValue::UniqueHandles(_) => ids::UNIQUE_HANDLES,
            AttrValue::LeaseTime(_) => ids::LEASE_TIME,
            AttrValue::RdattrError(_) => ids::RDATTR_ERROR,
            AttrValue::CanSetTime(_) => ids::CANSETTIME,
            AttrValue::CaseInsensitive(_) => ids::CASE_INSENSITIVE,
            AttrValue::CasePreserving(_) => ids::CASE_PRESERVING,
            AttrValue::Filehandle(_) => ids::FILEHANDLE,
            AttrValue::FileId(_) => ids::FILEID,
            AttrValue::MaxFileSize(_) => ids::MAXFILESIZE,
            AttrValue::MaxName(_) => ids::MAXNAME,
            AttrValue::MaxRead(_) => ids::MAXREAD,
            AttrValue::MaxWrite(_) => ids::MAXWRITE,
            AttrValue::Mode(_) => ids::MODE,
            AttrValue::NoTrunc(_) => ids::NO_TRUNC,
            AttrValue::NumLinks(_) => ids::NUMLINKS,
            AttrValue::Owner(_) => ids::OWNER,
            AttrValue::OwnerGroup(_) => ids::OWNER_GROUP,
            AttrValue::RawDev { .. } => ids::RAWDEV,
            AttrValue::SpaceUsed(_) => ids::SPACE_USED,
            AttrValue::TimeAccess(_) => ids::TIME_ACCESS,
            AttrValue::TimeAccessSet(_) => ids::TIME_ACCESS_SET,
            AttrValue::TimeMetadata(_) => ids::TIME_METADATA,
            AttrValue::TimeModify(_) => ids::TIME_MODIFY,
            AttrValue::TimeModifySet(_) => ids::TIME_MODIFY_SET,
            AttrValue::MountedOnFileId(_) => ids::MOUNTED_ON_FILEID,
            AttrValue::Other { id, .. } => *id,
        }
    }

    /// Approximate XDR size, used to bound READDIR replies
    pub fn encoded_len(&self) -> usize {
        fn opaque(len: usize) -> usize {
            4 + len.div_ceil(4) * 4
        }
        match self {
            AttrValue::SupportedAttrs(bitmap) => 4 + 4 * bitmap.words().len(),
            AttrValue::Fsid { .. } => 16,
            AttrValue::RawDev { .. } => 8,
            AttrValue::Filehandle(fh) => opaque(fh.len()),
            AttrValue::Owner(s) | AttrValue::OwnerGroup(s) => opaque(s.len()),
            AttrValue::TimeAccess(_) | AttrValue::TimeMetadata(_) | AttrValue::TimeModify(_) => 12,
            AttrValue::TimeAccessSet(_) | AttrValue::TimeModifySet(_) => 16,
            AttrValue::Change(_)
            | AttrValue::Size(_)
            | AttrValue::FileId(_)
            | AttrValue::MaxFileSize(_)
            | AttrValue::MaxRead(_)
            | AttrValue::MaxWrite(_)
            | AttrValue::SpaceUsed(_)
            | AttrValue::MountedOnFileId(_) => 8,
            AttrValue::Other { raw, .. } => raw.len(),
            _ => 4,
        }
    }
}

/// `fattr4`: attribute values ordered by attribute number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fattr(Vec<AttrValue>);

impl Fattr {
    /// Build from values in any order
    pub fn new(mut values: Vec<AttrValue>) -> Self {
        values.sort_by_key(AttrValue::id);
        Self(values)
    }

    /// Bitmap of the attributes present
    pub fn bitmap(&self) -> Bitmap {
        let mut bitmap = Bitmap::new();
        for value in &self.0 {
            bitmap.set(value.id());
        }
        bitmap
    }

    /// Value of an attribute
    pub fn get(&self, id: u32) -> Option<&AttrValue> {
        self.0.iter().find(|v| v.id() == id)
    }

    /// All values
    pub fn values(&self) -> &[AttrValue] {
        &self.0
    }

    /// Check if no attribute is present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Approximate XDR size (bitmap, length word and values)
    pub fn encoded_len(&self) -> usize {
        let bitmap = self.bitmap();
        4 + 4 * bitmap.words().len() + 4 + self.0.iter().map(AttrValue::encoded_len).sum::<usize>()
    }
}

/// Everything needed to report an object's attributes
#[derive(Debug)]
pub struct AttrSource<'a> {
    /// Backend attributes
    pub attr: &'a FileAttr,
    /// Handle issued for the object
    pub handle: &'a Filehandle,
    /// Change value (directory counter or backend change)
    pub change: u64,
    /// Stable id, reported as fileid
    pub fileid: u64,
    /// Server configuration
    pub config: &'a NfsConfig,
}

/// GETATTR: values of the requested attributes this server supports.
/// Unsupported and write-only attributes are omitted.
pub fn collect(request: &Bitmap, src: &AttrSource<'_>) -> Fattr {
    Fattr::new(request.iter().filter_map(|id| value_of(id, src)).collect())
}

fn value_of(id: u32, src: &AttrSource<'_>) -> Option<AttrValue> {
    let attr = src.attr;
    let value = match id {
        ids::SUPPORTED_ATTRS => AttrValue::SupportedAttrs(supported_bitmap()),
        ids::TYPE => AttrValue::Type(attr.file_type),
        ids::FH_EXPIRE_TYPE => AttrValue::FhExpireType(match src.config.filehandle_policy {
            nfs4_common::FilehandlePolicy::PreferPath => fh_expire::VOL_RENAME,
            nfs4_common::FilehandlePolicy::AlwaysId => fh_expire::PERSISTENT,
        }),
        ids::CHANGE => AttrValue::Change(src.change),
        ids::SIZE => AttrValue::Size(attr.size),
        ids::LINK_SUPPORT => AttrValue::LinkSupport(true),
        ids::SYMLINK_SUPPORT => AttrValue::SymlinkSupport(true),
        ids::NAMED_ATTR => AttrValue::NamedAttr(false),
        ids::FSID => AttrValue::Fsid {
            major: src.config.fsid.major,
            minor: src.config.fsid.minor,
        },
        ids::UNIQUE_HANDLES => AttrValue::UniqueHandles(false),
        ids::LEASE_TIME => AttrValue::LeaseTime(src.config.lease_time.as_secs() as u32),
        ids::RDATTR_ERROR => AttrValue::RdattrError(NfsStatus::Ok),
        ids::CANSETTIME => AttrValue::CanSetTime(true),
        ids::CASE_INSENSITIVE => AttrValue::CaseInsensitive(false),
        ids::CASE_PRESERVING => AttrValue::CasePreserving(true),
        ids::FILEHANDLE => AttrValue::Filehandle(src.handle.clone()),
        ids::FILEID => AttrValue::FileId(src.fileid),
        ids::MAXFILESIZE => AttrValue::MaxFileSize(crate::backend::memory::MAX_FILE_SIZE),
        ids::MAXNAME => AttrValue::MaxName(src.config.max_name_len as u32),
        ids::MAXREAD => AttrValue::MaxRead(src.config.max_read_size as u64),
        ids::MAXWRITE => AttrValue::MaxWrite(src.config.max_write_size as u64),
        ids::MODE => AttrValue::Mode(attr.mode),
        ids::NO_TRUNC => AttrValue::NoTrunc(true),
        ids::NUMLINKS => AttrValue::NumLinks(attr.nlink),
        ids::OWNER => AttrValue::Owner(attr.uid.to_string()),
        ids::OWNER_GROUP => AttrValue::OwnerGroup(attr.gid.to_string()),
        ids::RAWDEV => AttrValue::RawDev {
            major: attr.rdev.0,
            minor: attr.rdev.1,
        },
        ids::SPACE_USED => AttrValue::SpaceUsed(attr.used),
        ids::TIME_ACCESS => AttrValue::TimeAccess(attr.atime.into()),
        ids::TIME_METADATA => AttrValue::TimeMetadata(attr.ctime.into()),
        ids::TIME_MODIFY => AttrValue::TimeModify(attr.mtime.into()),
        ids::MOUNTED_ON_FILEID => AttrValue::MountedOnFileId(src.fileid),
        _ => return None,
    };
    Some(value)
}

fn parse_id(name: &str) -> Result<u32, NfsStatus> {
    // Numeric ids, optionally qualified with a domain
    let local = name.split('@').next().unwrap_or(name);
    local.parse().map_err(|_| NfsStatus::BadOwner)
}

/// SETATTR / CREATE / OPEN attributes: translate into backend changes.
/// Unknown attributes are `ATTRNOTSUPP`; read-only ones are `INVAL`.
pub fn to_set_attrs(fattr: &Fattr) -> Result<SetAttrs, NfsStatus> {
    let mut set = SetAttrs::default();
    for value in fattr.values() {
        if !SUPPORTED.contains(&value.id()) {
            return Err(NfsStatus::AttrNotsupp);
        }
        if !WRITABLE.contains(&value.id()) {
            return Err(NfsStatus::Inval);
        }
        match value {
            AttrValue::Size(size) => set.size = Some(*size),
            AttrValue::Mode(mode) => set.mode = Some(*mode),
            AttrValue::Owner(owner) => set.uid = Some(parse_id(owner)?),
            AttrValue::OwnerGroup(group) => set.gid = Some(parse_id(group)?),
            AttrValue::TimeAccessSet(time) => set.atime = Some(*time),
            AttrValue::TimeModifySet(time) => set.mtime = Some(*time),
            _ => return Err(NfsStatus::Inval),
        }
    }
    Ok(set)
}

/// VERIFY/NVERIFY: compare client-supplied values with the object.
/// Returns whether every value matched.
pub fn matches(expected: &Fattr, src: &AttrSource<'_>) -> Result<bool, NfsStatus> {
    let mut all_match = true;
    for value in expected.values() {
        let id = value.id();
        if !SUPPORTED.contains(&id) {
            return Err(NfsStatus::AttrNotsupp);
        }
        if matches!(
            id,
            ids::RDATTR_ERROR | ids::TIME_ACCESS_SET | ids::TIME_MODIFY_SET
        ) {
            return Err(NfsStatus::Inval);
        }
        if value_of(id, src).as_ref() != Some(value) {
            all_match = false;
        }
    }
    Ok(all_match)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn file_attr() -> FileAttr {
        let now = Utc::now();
        FileAttr {
            file_type: Nfs4FileType::Regular,
            mode: 0o644,
            nlink: 1,
            uid: 1000,
            gid: 100,
            size: 42,
            used: 4096,
            fileid: 9,
            rdev: (0, 0),
            atime: now,
            mtime: now,
            ctime: now,
            change: 5,
        }
    }

    #[test]
    fn test_bitmap_words() {
        let bitmap = Bitmap::from_ids(&[ids::TYPE, ids::MODE, ids::MOUNTED_ON_FILEID]);
        assert_eq!(bitmap.words(), &[1 << 1, (1 << 1) | (1 << 23)]);
        assert!(bitmap.contains(ids::MODE));
        assert!(!bitmap.contains(ids::SIZE));
        assert!(!bitmap.contains(200));
        assert_eq!(
            bitmap.iter().collect::<Vec<_>>(),
            vec![ids::TYPE, ids::MODE, ids::MOUNTED_ON_FILEID]
        );
    }

    #[test]
    fn test_collect_omits_unsupported() {
        let attr = file_attr();
        let config = NfsConfig::default();
        let handle = Filehandle::root();
        let src = AttrSource {
            attr: &attr,
            handle: &handle,
            change: 77,
            fileid: 3,
            config: &config,
        };
        let request = Bitmap::from_ids(&[ids::ACL, ids::SIZE, ids::CHANGE, ids::TIME_MODIFY_SET]);
        let fattr = collect(&request, &src);
        assert_eq!(fattr.bitmap(), Bitmap::from_ids(&[ids::CHANGE, ids::SIZE]));
        assert_eq!(fattr.get(ids::CHANGE), Some(&AttrValue::Change(77)));
    }

    #[test]
    fn test_set_attrs_validation() {
        let ok = Fattr::new(vec![
            AttrValue::Owner("1000@example.com".into()),
            AttrValue::Size(0),
        ]);
        let set = to_set_attrs(&ok).unwrap();
        assert_eq!(set.uid, Some(1000));
        assert_eq!(set.size, Some(0));

        let read_only = Fattr::new(vec![AttrValue::Type(Nfs4FileType::Regular)]);
        assert_eq!(to_set_attrs(&read_only), Err(NfsStatus::Inval));

        let unknown = Fattr::new(vec![AttrValue::Other {
            id: ids::ACL,
            raw: Bytes::new(),
        }]);
        assert_eq!(to_set_attrs(&unknown), Err(NfsStatus::AttrNotsupp));

        let bad_owner = Fattr::new(vec![AttrValue::Owner("alice".into())]);
        assert_eq!(to_set_attrs(&bad_owner), Err(NfsStatus::BadOwner));
    }

    #[test]
    fn test_verify_matching() {
        let attr = file_attr();
        let config = NfsConfig::default();
        let handle = Filehandle::root();
        let src = AttrSource {
            attr: &attr,
            handle: &handle,
            change: 5,
            fileid: 9,
            config: &config,
        };
        let same = Fattr::new(vec![AttrValue::Size(42), AttrValue::Mode(0o644)]);
        assert_eq!(matches(&same, &src), Ok(true));

        let different = Fattr::new(vec![AttrValue::Size(43)]);
        assert_eq!(matches(&different, &src), Ok(false));

        let write_only = Fattr::new(vec![AttrValue::TimeModifySet(SetTime::ServerTime)]);
        assert_eq!(matches(&write_only, &src), Err(NfsStatus::Inval));
    }
}
