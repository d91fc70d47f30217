//! Directory entry scanning and long-name assembly.
//!
//! Directories are presented to this module as a flat sequence of 32-byte
//! slots. The caller provides a [`SlotReader`] that resolves a slot index
//! to its on-disk bytes, which keeps the cluster-chain and fixed-root
//! translation out of the scanning logic.

use super::{
    FatResult,
    dirent::{DIR_ENTRY_SIZE, DirEntry, LongNameEntry, MAX_NAME_LEN, calc_short_name_checksum},
};
use alloc::{string::String, vec::Vec};

/// Resolves a slot index to its raw bytes, `None` past the directory end.
pub type SlotReader<'a> = &'a mut dyn FnMut(u32) -> FatResult<Option<[u8; DIR_ENTRY_SIZE]>>;

/// Classification of a raw directory slot
#[derive(Debug, Clone, Copy)]
pub enum SlotKind {
    /// Terminator, no entries follow
    End,
    /// Deleted entry
    Deleted,
    /// Part of a long name sequence
    LongName(LongNameEntry),
    /// A short (8.3) entry
    Short(DirEntry),
}

#[must_use]
/// Classifies the raw bytes of a directory slot
pub fn classify(raw: &[u8; DIR_ENTRY_SIZE]) -> SlotKind {
    match raw[0] {
        DirEntry::END_OF_ENTRIES => SlotKind::End,
        DirEntry::DELETED_ENTRY => SlotKind::Deleted,
        _ => {
            // SAFETY: Both layouts are `repr(C, packed)` with size 32, so any
            // byte pattern is valid and alignment is 1.
            let entry = unsafe { raw.as_ptr().cast::<DirEntry>().read() };
            if entry.is_long_name() {
                SlotKind::LongName(unsafe { raw.as_ptr().cast::<LongNameEntry>().read() })
            } else {
                SlotKind::Short(entry)
            }
        }
    }
}

/// A short entry together with its resolved name and slot span
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    /// Slot holding the short entry
    pub slot: u32,
    /// First slot of the record (start of the long name sequence, or
    /// `slot` when the entry has none)
    pub first_slot: u32,
    /// The short entry itself
    pub entry: DirEntry,
    /// Display name, taken from the long name when one is present and
    /// consistent
    pub name: String,
}

impl ScannedEntry {
    #[must_use]
    /// Returns true for the `.` and `..` entries
    pub fn is_dot(&self) -> bool {
        let raw = self.entry.filename_raw();
        &raw == DirEntry::DOT_ENTRY || &raw == DirEntry::DOTDOT_ENTRY
    }

    #[must_use]
    /// Case-insensitive match against the long or the short name
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.entry.short_name().eq_ignore_ascii_case(name)
    }
}

/// Restartable forward scan over the slots of one directory.
///
/// The scan state is a single slot index, so a caller can persist it
/// across calls and resume listing where it left off.
#[derive(Debug, Clone, Copy)]
pub struct DirScan {
    next_slot: u32,
}

impl DirScan {
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self { next_slot: 0 }
    }

    #[must_use]
    #[inline]
    /// Resumes a scan at the given slot index
    pub const fn from_slot(slot: u32) -> Self {
        Self { next_slot: slot }
    }

    #[must_use]
    #[inline]
    pub const fn next_slot(&self) -> u32 {
        self.next_slot
    }

    /// Advances to the next live short entry, assembling its long name
    /// on the way.
    ///
    /// Orphaned long name fragments (wrong order, checksum mismatch or a
    /// missing piece) are dropped and the short name is reported instead.
    /// Volume label entries are skipped. Returns `None` at the directory
    /// end.
    pub fn next_entry(&mut self, read_slot: SlotReader<'_>) -> FatResult<Option<ScannedEntry>> {
        let mut pending: Option<(u32, LfnAssembler)> = None;

        loop {
            let slot = self.next_slot;
            let Some(raw) = read_slot(slot)? else {
                return Ok(None);
            };
            self.next_slot += 1;

            match classify(&raw) {
                SlotKind::End => {
                    // Leave the cursor on the terminator so a later append
                    // resumes the scan correctly.
                    self.next_slot = slot;
                    return Ok(None);
                }
                SlotKind::Deleted => pending = None,
                SlotKind::LongName(lfn) => {
                    // A push failure means the previous sequence was broken
                    // mid-way, in which case this slot may start a new one.
                    pending = pending
                        .take()
                        .and_then(|(first, mut assembler)| {
                            assembler.push(&lfn).then_some((first, assembler))
                        })
                        .or_else(|| LfnAssembler::start(&lfn).map(|assembler| (slot, assembler)));
                }
                SlotKind::Short(entry) => {
                    if entry.is_volume_id() {
                        pending = None;
                        continue;
                    }

                    let (first_slot, name) = match pending.take() {
                        Some((first, assembler)) => match assembler.finish(&entry) {
                            Some(name) => (first, name),
                            None => (slot, entry.short_name()),
                        },
                        None => (slot, entry.short_name()),
                    };

                    return Ok(Some(ScannedEntry {
                        slot,
                        first_slot,
                        entry,
                        name,
                    }));
                }
            }
        }
    }
}

impl Default for DirScan {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental long-name reconstruction from on-disk entry order.
///
/// On disk the sequence starts with the highest ordinal (flagged last)
/// and counts down to 1, immediately followed by the short entry.
struct LfnAssembler {
    /// Ordinal the next entry must carry, 0 once the sequence is complete
    next_seq: u8,
    /// Short name checksum every entry must agree on
    checksum: u8,
    /// Collected UCS-2 units, kept in name order
    chars: Vec<u16>,
}

impl LfnAssembler {
    /// Starts a sequence from its flagged last entry
    fn start(entry: &LongNameEntry) -> Option<Self> {
        if !entry.is_last() {
            return None;
        }
        let seq = entry.seq_num();
        let max_seq = MAX_NAME_LEN.div_ceil(LongNameEntry::CHARS_PER_ENTRY);
        if seq == 0 || usize::from(seq) > max_seq {
            return None;
        }

        // The last entry is the only one allowed to hold a terminator and
        // padding.
        let mut chars = Vec::new();
        for i in 0..LongNameEntry::CHARS_PER_ENTRY {
            match entry.get_name(i).ok()? {
                0 | LongNameEntry::PADDING => break,
                ch => chars.push(ch),
            }
        }

        Some(Self {
            next_seq: seq - 1,
            checksum: entry.checksum(),
            chars,
        })
    }

    /// Feeds the next entry in on-disk order, false if it breaks the
    /// sequence
    fn push(&mut self, entry: &LongNameEntry) -> bool {
        if self.next_seq == 0
            || entry.is_last()
            || entry.seq_num() != self.next_seq
            || entry.checksum() != self.checksum
        {
            return false;
        }

        let mut part = [0u16; LongNameEntry::CHARS_PER_ENTRY];
        for (i, slot) in part.iter_mut().enumerate() {
            match entry.get_name(i) {
                Ok(ch) => *slot = ch,
                Err(_) => return false,
            }
        }
        self.chars.splice(0..0, part);
        self.next_seq -= 1;
        true
    }

    /// Validates the completed sequence against its short entry
    fn finish(self, short: &DirEntry) -> Option<String> {
        if self.next_seq != 0 {
            return None;
        }
        if calc_short_name_checksum(&short.filename_raw()) != self.checksum {
            return None;
        }

        let mut name = String::with_capacity(self.chars.len());
        for ch in char::decode_utf16(self.chars.iter().copied()) {
            name.push(ch.ok()?);
        }
        (!name.is_empty()).then_some(name)
    }
}

/// Builds the long name slots for `name` in on-disk order, checksummed
/// against the short name they will precede.
#[must_use]
pub fn build_lfn_slots(name: &str, short_name: &[u8; 11]) -> Vec<LongNameEntry> {
    let chars: Vec<u16> = name.encode_utf16().collect();
    let count = chars.len().div_ceil(LongNameEntry::CHARS_PER_ENTRY);
    let checksum = calc_short_name_checksum(short_name);

    let mut slots = Vec::with_capacity(count);
    for idx in (0..count).rev() {
        let seq = u8::try_from(idx + 1).unwrap();
        let mut entry = LongNameEntry::new(seq, checksum, idx == count - 1);

        let start = idx * LongNameEntry::CHARS_PER_ENTRY;
        let end = (start + LongNameEntry::CHARS_PER_ENTRY).min(chars.len());
        entry.fill_name(&chars[start..end]);

        slots.push(entry);
    }
    slots
}
