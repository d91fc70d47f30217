use super::{
    Cluster, FatError, FatResult, FatType,
    date::{DateTime, DosDate, DosTime},
};
use alloc::string::String;
use flint_core::static_assert;

/// Size of a directory entry in bytes (always 32 bytes)
pub const DIR_ENTRY_SIZE: usize = 32;

/// Longest accepted name, matching the usual LFN limit.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Directory entry attributes
pub struct Attributes(u8);

impl Attributes {
    /// Read-only attribute
    pub const READ_ONLY: u8 = 0x01;
    /// Hidden attribute
    pub const HIDDEN: u8 = 0x02;
    /// System attribute
    pub const SYSTEM: u8 = 0x04;
    /// Volume ID attribute
    pub const VOLUME_ID: u8 = 0x08;
    /// Directory attribute
    pub const DIRECTORY: u8 = 0x10;
    /// Archive attribute
    pub const ARCHIVE: u8 = 0x20;
    /// Long file name attribute
    pub const LONG_NAME: u8 = Self::READ_ONLY | Self::HIDDEN | Self::SYSTEM | Self::VOLUME_ID;
    /// Long file name mask
    pub const LONG_NAME_MASK: u8 = Self::READ_ONLY
        | Self::HIDDEN
        | Self::SYSTEM
        | Self::VOLUME_ID
        | Self::DIRECTORY
        | Self::ARCHIVE;

    #[must_use]
    #[inline]
    /// Creates a new attribute set
    pub const fn new(attributes: u8) -> Self {
        Self(attributes)
    }

    #[must_use]
    #[inline]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is read-only
    pub const fn is_read_only(&self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is hidden
    pub const fn is_hidden(&self) -> bool {
        self.0 & Self::HIDDEN != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a volume ID
    pub const fn is_volume_id(&self) -> bool {
        self.0 & Self::VOLUME_ID != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a directory
    pub const fn is_directory(&self) -> bool {
        self.0 & Self::DIRECTORY != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a long file name
    pub const fn is_long_name(&self) -> bool {
        (self.0 & Self::LONG_NAME_MASK) == Self::LONG_NAME
    }
}

/// FAT directory entry
#[derive(Default, Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DirEntry {
    /// Filename (8 bytes)
    name: [u8; 8],
    /// Extension (3 bytes)
    ext: [u8; 3],
    /// File attributes
    attr: u8,
    /// Reserved for Windows NT
    nt_res: u8,
    /// Creation time, tenths of a second part
    creation_time_tenths: u8,
    /// Creation time
    creation_time: u16,
    /// Creation date
    creation_date: u16,
    /// Last access date
    last_access_date: u16,
    /// High word of first cluster number for FAT32
    first_cluster_high: u16,
    /// Last modification time
    write_time: u16,
    /// Last modification date
    write_date: u16,
    /// Low word of first cluster number
    first_cluster_low: u16,
    /// File size in bytes
    file_size: u32,
}
static_assert!(size_of::<DirEntry>() == DIR_ENTRY_SIZE);

impl DirEntry {
    /// Deleted entry marker (first byte)
    pub const DELETED_ENTRY: u8 = 0xE5;
    /// End of directory marker (first byte)
    pub const END_OF_ENTRIES: u8 = 0x00;
    /// Dot entry (current directory)
    pub const DOT_ENTRY: &'static [u8; 11] = b".          ";
    /// Dotdot entry (parent directory)
    pub const DOTDOT_ENTRY: &'static [u8; 11] = b"..         ";

    #[must_use]
    #[inline]
    /// Creates a new, free directory entry
    pub const fn new() -> Self {
        Self {
            name: [0; 8],
            ext: [0; 3],
            attr: 0,
            nt_res: 0,
            creation_time_tenths: 0,
            creation_time: 0,
            creation_date: 0,
            last_access_date: 0,
            first_cluster_high: 0,
            write_time: 0,
            write_date: 0,
            first_cluster_low: 0,
            file_size: 0,
        }
    }

    #[must_use]
    /// Creates an entry with the given 8.3 name and attributes, timestamps
    /// set to `now`.
    pub fn init(short_name: &[u8; 11], attributes: Attributes, now: DateTime) -> Self {
        let mut entry = Self::new();
        entry.name.copy_from_slice(&short_name[..8]);
        entry.ext.copy_from_slice(&short_name[8..]);
        entry.attr = attributes.0;
        entry.set_creation_datetime(now);
        entry.set_last_write_datetime(now);
        entry
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is free (unused)
    pub const fn is_free(&self) -> bool {
        self.name[0] == Self::END_OF_ENTRIES
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is deleted
    pub const fn is_deleted(&self) -> bool {
        self.name[0] == Self::DELETED_ENTRY
    }

    #[inline]
    /// Marks the entry as deleted
    pub const fn mark_deleted(&mut self) {
        self.name[0] = Self::DELETED_ENTRY;
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is valid
    pub const fn is_valid(&self) -> bool {
        !self.is_free() && !self.is_deleted()
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a directory
    pub const fn is_directory(&self) -> bool {
        Attributes::new(self.attr).is_directory()
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a file
    pub const fn is_file(&self) -> bool {
        self.is_valid() && !self.is_directory() && !self.is_volume_id()
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a volume ID
    pub const fn is_volume_id(&self) -> bool {
        Attributes::new(self.attr).is_volume_id()
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a long filename
    pub const fn is_long_name(&self) -> bool {
        Attributes::new(self.attr).is_long_name()
    }

    #[must_use]
    #[inline]
    /// Returns the file attributes
    pub const fn attributes(&self) -> Attributes {
        Attributes::new(self.attr)
    }

    #[inline]
    /// Sets the file attributes
    pub const fn set_attributes(&mut self, attributes: Attributes) {
        self.attr = attributes.0;
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: The struct is `repr(C, packed)`, so any byte pattern is valid.
        unsafe { core::slice::from_raw_parts((&raw const *self).cast::<u8>(), size_of::<Self>()) }
    }

    /// Replaces the stored 8.3 name
    pub fn set_short_name(&mut self, short_name: &[u8; 11]) {
        self.name.copy_from_slice(&short_name[..8]);
        self.ext.copy_from_slice(&short_name[8..]);
    }

    #[must_use]
    /// Returns the full 8.3 filename as stored on disk
    pub fn filename_raw(&self) -> [u8; 11] {
        let mut result = [0u8; 11];
        result[..8].copy_from_slice(&self.name);
        result[8..].copy_from_slice(&self.ext);
        result
    }

    #[must_use]
    /// Returns the 8.3 name in `NAME.EXT` form
    pub fn short_name(&self) -> String {
        let mut out = String::new();
        for &b in self.name.iter().take_while(|&&b| b != b' ') {
            out.push(char::from(b));
        }
        if self.ext[0] != b' ' {
            out.push('.');
            for &b in self.ext.iter().take_while(|&&b| b != b' ') {
                out.push(char::from(b));
            }
        }
        out
    }

    #[must_use]
    /// Returns the first cluster number
    pub fn first_cluster(&self, fat_type: FatType) -> Cluster {
        let low = u32::from(self.first_cluster_low);
        let high = match fat_type {
            FatType::Fat32 => u32::from(self.first_cluster_high) << 16,
            _ => 0,
        };
        Cluster::new(low | high)
    }

    /// Sets the first cluster number
    pub fn set_first_cluster(&mut self, cluster: Cluster, fat_type: FatType) {
        self.first_cluster_low = u16::try_from(cluster.value() & 0xFFFF).unwrap();
        if fat_type == FatType::Fat32 {
            self.first_cluster_high = u16::try_from((cluster.value() >> 16) & 0xFFFF).unwrap();
        }
    }

    #[must_use]
    #[inline]
    /// Returns the file size
    pub const fn file_size(&self) -> u32 {
        self.file_size
    }

    #[inline]
    /// Sets the file size
    pub const fn set_file_size(&mut self, size: u32) {
        self.file_size = size;
    }

    #[must_use]
    #[inline]
    /// Returns the creation date and time
    pub fn creation_datetime(&self) -> DateTime {
        DateTime::decode(
            DosDate::new(self.creation_date),
            DosTime::new(self.creation_time),
        )
    }

    #[inline]
    /// Sets the creation date and time
    pub fn set_creation_datetime(&mut self, datetime: DateTime) {
        let (date, time) = datetime.encode();
        self.creation_date = date.dos_date();
        self.creation_time = time.dos_time();
    }

    #[must_use]
    #[inline]
    /// Returns the last access date (at midnight, FAT stores no time)
    pub fn last_access_datetime(&self) -> DateTime {
        DateTime::decode(DosDate::new(self.last_access_date), DosTime::new(0))
    }

    #[must_use]
    #[inline]
    /// Returns the last write date and time
    pub fn last_write_datetime(&self) -> DateTime {
        DateTime::decode(DosDate::new(self.write_date), DosTime::new(self.write_time))
    }

    #[inline]
    /// Sets the last write date and time, also refreshing the access date
    pub fn set_last_write_datetime(&mut self, datetime: DateTime) {
        let (date, time) = datetime.encode();
        self.write_date = date.dos_date();
        self.write_time = time.dos_time();
        self.last_access_date = date.dos_date();
    }
}

/// Entry for long file name
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct LongNameEntry {
    /// Sequence number (1-based, bit 6 set for last entry)
    seq_num: u8,
    /// First 5 characters of long name (UCS-2)
    name1: [u8; 10],
    /// Attributes (always 0x0F for LFN)
    attr: u8,
    /// Entry type (always 0 for LFN)
    entry_type: u8,
    /// Checksum of short name
    checksum: u8,
    /// Next 6 characters of long name
    name2: [u8; 12],
    /// First cluster (always 0 for LFN)
    first_cluster: u16,
    /// Last 2 characters of long name
    name3: [u8; 4],
}
static_assert!(size_of::<LongNameEntry>() == DIR_ENTRY_SIZE);

impl LongNameEntry {
    /// Last entry marker in sequence number
    pub const LAST_ENTRY: u8 = 0x40;
    /// Character count per LFN entry
    pub const CHARS_PER_ENTRY: usize = 13;
    /// Padding value past the name terminator
    pub const PADDING: u16 = 0xFFFF;

    #[must_use]
    #[inline]
    /// Creates a new long name entry
    pub const fn new(seq_num: u8, checksum: u8, is_last: bool) -> Self {
        let mut seq = seq_num;
        if is_last {
            seq |= Self::LAST_ENTRY;
        }

        Self {
            seq_num: seq,
            name1: [0; 10],
            attr: Attributes::LONG_NAME,
            entry_type: 0,
            checksum,
            name2: [0; 12],
            first_cluster: 0,
            name3: [0; 4],
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: The struct is `repr(C, packed)`, so any byte pattern is valid.
        unsafe { core::slice::from_raw_parts((&raw const *self).cast::<u8>(), size_of::<Self>()) }
    }

    #[must_use]
    #[inline]
    /// Returns true if this is the last entry in the long name sequence
    pub const fn is_last(&self) -> bool {
        self.seq_num & Self::LAST_ENTRY != 0
    }

    #[must_use]
    #[inline]
    /// Returns the sequence number
    pub const fn seq_num(&self) -> u8 {
        self.seq_num & !Self::LAST_ENTRY
    }

    #[must_use]
    #[inline]
    /// Returns the checksum
    pub const fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Sets the name part at the given index (0-12)
    pub const fn set_name(&mut self, idx: usize, ch: u16) -> FatResult<()> {
        if idx >= Self::CHARS_PER_ENTRY {
            return Err(FatError::InvalidParameter);
        }

        let bytes = ch.to_le_bytes();

        if idx < 5 {
            self.name1[idx * 2] = bytes[0];
            self.name1[idx * 2 + 1] = bytes[1];
        } else if idx < 11 {
            let idx = idx - 5;
            self.name2[idx * 2] = bytes[0];
            self.name2[idx * 2 + 1] = bytes[1];
        } else {
            let idx = idx - 11;
            self.name3[idx * 2] = bytes[0];
            self.name3[idx * 2 + 1] = bytes[1];
        }

        Ok(())
    }

    /// Gets the name part at the given index (0-12)
    pub const fn get_name(&self, idx: usize) -> FatResult<u16> {
        if idx >= Self::CHARS_PER_ENTRY {
            return Err(FatError::InvalidParameter);
        }

        let bytes = if idx < 5 {
            [self.name1[idx * 2], self.name1[idx * 2 + 1]]
        } else if idx < 11 {
            let idx = idx - 5;
            [self.name2[idx * 2], self.name2[idx * 2 + 1]]
        } else {
            let idx = idx - 11;
            [self.name3[idx * 2], self.name3[idx * 2 + 1]]
        };

        Ok(u16::from_le_bytes(bytes))
    }

    /// Fills the 13 name slots from `chars`, terminating and padding per
    /// the VFAT rules.
    pub fn fill_name(&mut self, chars: &[u16]) {
        for idx in 0..Self::CHARS_PER_ENTRY {
            let ch = match idx.cmp(&chars.len()) {
                core::cmp::Ordering::Less => chars[idx],
                core::cmp::Ordering::Equal => 0,
                core::cmp::Ordering::Greater => Self::PADDING,
            };
            // Index is in range by construction.
            let _ = self.set_name(idx, ch);
        }
    }
}

/// Calculate the checksum for a 8.3 filename
pub(crate) fn calc_short_name_checksum(name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in name {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
    }
    sum
}

/// Characters rejected in any name component.
const INVALID_CHARS: &[char] = &['"', '*', ':', '<', '>', '?', '\\', '|', '/'];

/// Checks a single path component for storability.
///
/// Names must fit the LFN length limit, contain no separator or reserved
/// character and stay within the UCS-2 plane.
#[must_use]
pub fn validate_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name == "." || name == ".." {
        return false;
    }
    name.chars().all(|c| {
        !INVALID_CHARS.contains(&c) && u32::from(c) >= 0x20 && u16::try_from(u32::from(c)).is_ok()
    })
}

/// Returns true if `name` is directly storable as an 8.3 entry, in which
/// case no long-name sequence is needed.
#[must_use]
pub fn fits_short_name(name: &str) -> bool {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => (base, ext),
        _ => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return false;
    }
    let ok = |s: &str| {
        s.chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || "_-~!#$%&'()@^`{}".contains(c))
    };
    ok(base) && ok(ext)
}

/// Largest numeric tail a generated 8.3 alias can carry.
///
/// Six digits leave at least one byte of the stem in front of the `~`
/// inside the 8-byte base field.
pub const MAX_SHORT_NAME_TAIL: u32 = 999_999;

/// Derives an 8.3 name from a long name.
///
/// `tail` > 0 appends a `~n` suffix for collision avoidance, the way
/// numeric-tail generation usually works. Tails beyond
/// [`MAX_SHORT_NAME_TAIL`] are clamped to it.
#[must_use]
pub fn short_name_from(name: &str, tail: u32) -> [u8; 11] {
    let mut out = [b' '; 11];
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) if !b.is_empty() => (b, e),
        _ => (name, ""),
    };

    let sanitize = |c: char| -> Option<u8> {
        if c == ' ' || c == '.' {
            None
        } else if c.is_ascii_alphanumeric() || "_-~!#$%&'()@^`{}".contains(c) {
            Some(c.to_ascii_uppercase() as u8)
        } else {
            Some(b'_')
        }
    };

    let mut base_len = 0;
    for c in base.chars() {
        if base_len == 8 {
            break;
        }
        if let Some(b) = sanitize(c) {
            out[base_len] = b;
            base_len += 1;
        }
    }
    if base_len == 0 {
        out[0] = b'_';
        base_len = 1;
    }

    if tail > 0 {
        // Reserve room for "~n" at the end of the base part.
        let mut digits = [0u8; 10];
        let mut n = tail.min(MAX_SHORT_NAME_TAIL);
        let mut count = 0;
        while n > 0 {
            digits[count] = b'0' + u8::try_from(n % 10).unwrap();
            n /= 10;
            count += 1;
        }
        let keep = base_len.min(8 - count - 1);
        out[keep] = b'~';
        for i in 0..count {
            out[keep + 1 + i] = digits[count - 1 - i];
        }
        for slot in out.iter_mut().take(8).skip(keep + 1 + count) {
            *slot = b' ';
        }
    }

    let mut ext_len = 0;
    for c in ext.chars() {
        if ext_len == 3 {
            break;
        }
        if let Some(b) = sanitize(c) {
            out[8 + ext_len] = b;
            ext_len += 1;
        }
    }

    out
}
