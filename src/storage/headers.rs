//! # On-Disk Header and Record Layout
//!
//! The index file is a fixed header followed by a tightly packed array of
//! fixed-size records. Both structs are zerocopy views taken directly from
//! the mapping; there is no serialization step.
//!
//! ## Index Header (80 bytes)
//!
//! ```text
//! Offset  Size  Description
//! 0       4     compat_data: {layout flags, sizeof(c_uint), sizeof(time_t), sizeof(off_t)}
//! 4       4     version (must equal INDEX_VERSION exactly)
//! 8       4     indexid: creation stamp; changes when the index is rebuilt
//! 12      4     flags: REBUILD / FSCK / COMPRESS / REBUILD_HASH / CACHE_FIELDS / COMPRESS_DATA
//! 16      4     cache_fields: field kinds cached for new records
//! 20      4     uid_validity
//! 24      4     next_uid
//! 28      4     last_nonrecent_uid
//! 32      4     messages_count
//! 36      4     seen_messages_count
//! 40      4     deleted_messages_count
//! 44      4     first_unseen_uid_lowwater
//! 48      4     first_deleted_uid_lowwater
//! 52      8     first_hole_position (byte offset, 0 = no holes)
//! 60      4     first_hole_records (length of the first hole run)
//! 64      16    reserved
//! ```
//!
//! ## Index Record (24 bytes)
//!
//! ```text
//! Offset  Size  Description
//! 0       4     uid (0 = expunged hole)
//! 4       4     msg_flags
//! 8       4     cached_fields: field kinds actually present for this record
//! 12      4     data_size: length of the data-file record
//! 16      8     data_position: offset of the data-file record
//! ```
//!
//! ## Compatibility
//!
//! There is no magic string. A file is compatible when its compat tuple and
//! version match this build exactly; the tuple embeds the sizes of the native
//! integer types the original format was defined against, so indexes are
//! deliberately not portable across ABIs. Incompatible files are left alone
//! and a sibling (or fresh) index is used instead.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{INDEX_HEADER_SIZE, INDEX_RECORD_SIZE};

pub const INDEX_VERSION: u32 = 1;

/// Record-layout variant marker, the first byte of the compat tuple.
pub const COMPAT_LAYOUT_FLAGS: u8 = 0x01;

/// Compat tuple for this build: layout flags plus native integer widths.
pub const COMPAT_DATA: [u8; 4] = [
    COMPAT_LAYOUT_FLAGS,
    size_of::<libc::c_uint>() as u8,
    size_of::<libc::time_t>() as u8,
    size_of::<libc::off_t>() as u8,
];

/// Index header flag bits. The bit order is public ABI.
pub mod index_flags {
    /// The index is known corrupt; the next open runs a full rebuild.
    pub const REBUILD: u32 = 0x01;
    /// An exclusive writer is (or was) in progress; cleared on clean release.
    pub const FSCK: u32 = 0x02;
    /// Holes should be compacted out of the record array.
    pub const COMPRESS: u32 = 0x04;
    /// The UID hash sidecar is stale and must be rebuilt.
    pub const REBUILD_HASH: u32 = 0x08;
    /// Newly requested cache fields should be materialized for old records.
    pub const CACHE_FIELDS: u32 = 0x10;
    /// Unused space should be compacted out of the data file.
    pub const COMPRESS_DATA: u32 = 0x20;
}

/// Message flag bits stored in `IndexRecord::msg_flags`.
pub mod mail_flags {
    pub const ANSWERED: u32 = 0x01;
    pub const FLAGGED: u32 = 0x02;
    pub const DELETED: u32 = 0x04;
    pub const SEEN: u32 = 0x08;
    pub const DRAFT: u32 = 0x10;
}

/// Cached-field kind bits, used in `cache_fields` bitsets and as data-file
/// entry tags.
pub mod field {
    pub const LOCATION: u32 = 0x01;
    pub const ENVELOPE: u32 = 0x02;
    pub const BODY: u32 = 0x04;
    pub const BODYSTRUCTURE: u32 = 0x08;
    pub const MD5: u32 = 0x10;
    pub const MESSAGEPART: u32 = 0x20;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexHeader {
    compat_data: [u8; 4],
    version: U32,
    indexid: U32,
    flags: U32,
    cache_fields: U32,
    uid_validity: U32,
    next_uid: U32,
    last_nonrecent_uid: U32,
    messages_count: U32,
    seen_messages_count: U32,
    deleted_messages_count: U32,
    first_unseen_uid_lowwater: U32,
    first_deleted_uid_lowwater: U32,
    first_hole_position: U64,
    first_hole_records: U32,
    reserved: [u8; 16],
}

const _: () = assert!(size_of::<IndexHeader>() == INDEX_HEADER_SIZE);

impl IndexHeader {
    /// Header for a freshly created index. REBUILD is set; the backend's
    /// rebuild clears it once the record array is populated.
    pub fn fresh(now: u32) -> Self {
        Self {
            compat_data: COMPAT_DATA,
            version: U32::new(INDEX_VERSION),
            indexid: U32::new(now),
            flags: U32::new(index_flags::REBUILD),
            cache_fields: U32::new(field::LOCATION),
            uid_validity: U32::new(now),
            next_uid: U32::new(1),
            last_nonrecent_uid: U32::new(0),
            messages_count: U32::new(0),
            seen_messages_count: U32::new(0),
            deleted_messages_count: U32::new(0),
            first_unseen_uid_lowwater: U32::new(0),
            first_deleted_uid_lowwater: U32::new(0),
            first_hole_position: U64::new(0),
            first_hole_records: U32::new(0),
            reserved: [0u8; 16],
        }
    }

    /// Whether this header's compat tuple and version match the current build.
    pub fn is_compatible(&self) -> bool {
        self.compat_data == COMPAT_DATA && self.version.get() == INDEX_VERSION
    }

    pub fn compat_data(&self) -> [u8; 4] {
        self.compat_data
    }

    #[inline]
    pub fn has_flags(&self, bits: u32) -> bool {
        self.flags.get() & bits != 0
    }

    #[inline]
    pub fn set_flag_bits(&mut self, bits: u32) {
        self.flags = U32::new(self.flags.get() | bits);
    }

    #[inline]
    pub fn clear_flag_bits(&mut self, bits: u32) {
        self.flags = U32::new(self.flags.get() & !bits);
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn indexid(&self) -> u32 {
        self.indexid.get()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn cache_fields(&self) -> u32 {
        self.cache_fields.get()
    }

    pub fn set_cache_fields(&mut self, fields: u32) {
        self.cache_fields = U32::new(fields);
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity.get()
    }

    pub fn next_uid(&self) -> u32 {
        self.next_uid.get()
    }

    pub fn set_next_uid(&mut self, uid: u32) {
        self.next_uid = U32::new(uid);
    }

    pub fn last_nonrecent_uid(&self) -> u32 {
        self.last_nonrecent_uid.get()
    }

    pub fn set_last_nonrecent_uid(&mut self, uid: u32) {
        self.last_nonrecent_uid = U32::new(uid);
    }

    pub fn messages_count(&self) -> u32 {
        self.messages_count.get()
    }

    pub fn set_messages_count(&mut self, count: u32) {
        self.messages_count = U32::new(count);
    }

    pub fn seen_messages_count(&self) -> u32 {
        self.seen_messages_count.get()
    }

    pub fn set_seen_messages_count(&mut self, count: u32) {
        self.seen_messages_count = U32::new(count);
    }

    pub fn deleted_messages_count(&self) -> u32 {
        self.deleted_messages_count.get()
    }

    pub fn set_deleted_messages_count(&mut self, count: u32) {
        self.deleted_messages_count = U32::new(count);
    }

    pub fn first_unseen_uid_lowwater(&self) -> u32 {
        self.first_unseen_uid_lowwater.get()
    }

    pub fn set_first_unseen_uid_lowwater(&mut self, uid: u32) {
        self.first_unseen_uid_lowwater = U32::new(uid);
    }

    pub fn first_deleted_uid_lowwater(&self) -> u32 {
        self.first_deleted_uid_lowwater.get()
    }

    pub fn set_first_deleted_uid_lowwater(&mut self, uid: u32) {
        self.first_deleted_uid_lowwater = U32::new(uid);
    }

    pub fn first_hole_position(&self) -> u64 {
        self.first_hole_position.get()
    }

    pub fn set_first_hole_position(&mut self, position: u64) {
        self.first_hole_position = U64::new(position);
    }

    pub fn first_hole_records(&self) -> u32 {
        self.first_hole_records.get()
    }

    pub fn set_first_hole_records(&mut self, count: u32) {
        self.first_hole_records = U32::new(count);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexRecord {
    uid: U32,
    msg_flags: U32,
    cached_fields: U32,
    data_size: U32,
    data_position: U64,
}

const _: () = assert!(size_of::<IndexRecord>() == INDEX_RECORD_SIZE);

impl IndexRecord {
    pub fn new(uid: u32, msg_flags: u32, cached_fields: u32, data_position: u64, data_size: u32) -> Self {
        Self {
            uid: U32::new(uid),
            msg_flags: U32::new(msg_flags),
            cached_fields: U32::new(cached_fields),
            data_size: U32::new(data_size),
            data_position: U64::new(data_position),
        }
    }

    /// A record with `uid == 0` is a hole left behind by an expunge.
    #[inline]
    pub fn is_hole(&self) -> bool {
        self.uid.get() == 0
    }

    pub fn uid(&self) -> u32 {
        self.uid.get()
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.uid = U32::new(uid);
    }

    pub fn msg_flags(&self) -> u32 {
        self.msg_flags.get()
    }

    pub fn set_msg_flags(&mut self, flags: u32) {
        self.msg_flags = U32::new(flags);
    }

    pub fn cached_fields(&self) -> u32 {
        self.cached_fields.get()
    }

    pub fn set_cached_fields(&mut self, fields: u32) {
        self.cached_fields = U32::new(fields);
    }

    pub fn data_size(&self) -> u32 {
        self.data_size.get()
    }

    pub fn set_data_size(&mut self, size: u32) {
        self.data_size = U32::new(size);
    }

    pub fn data_position(&self) -> u64 {
        self.data_position.get()
    }

    pub fn set_data_position(&mut self, position: u64) {
        self.data_position = U64::new(position);
    }
}
