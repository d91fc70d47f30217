//! Journaled wear leveling.
//!
//! NOR flash erases in whole sectors and each sector survives a limited
//! number of erase cycles, so a filesystem that rewrites the same sector in
//! place would wear a hole through the device. [`WearLevel`] breaks that
//! coupling: logical sectors are copy-on-write over a pool of physical
//! sectors, every write lands in the least-erased free sector, and the
//! logical-to-physical map is reconstructed at mount from an append-only
//! journal at the front of the device.
//!
//! The journal is two ping-pong groups of sectors. Records are 16 bytes,
//! CRC-protected and appended one NOR program at a time. When the active
//! group fills up, the live state is snapshotted into the other group under
//! a bumped epoch and the old group is erased. A mount picks the group with
//! the highest valid epoch and replays it in order, so a write torn by
//! power loss is simply absent from the replay and the logical sector keeps
//! its previous contents.

use alloc::{vec, vec::Vec};

use crc::{CRC_32_ISO_HDLC, Crc};
use flint_core::static_assert;
use flint_core::storage::{BlockDevice, DeviceError, FlashDevice, with_retry};

/// Size of one journal slot in bytes.
const RECORD_SIZE: usize = 16;

/// Identifies a journal group header, `b` holds [`JOURNAL_MAGIC`].
const KIND_HEADER: u8 = 0x01;
/// Maps logical sector `a` to pool sector `b`.
const KIND_MAP: u8 = 0x02;
/// Pool sector `a` has been erased `b` times.
const KIND_ERASE: u8 = 0x03;
/// Pool sector `a` failed to erase and is out of rotation.
const KIND_BAD: u8 = 0x04;

/// `"FLWL"`, stored in every group header.
const JOURNAL_MAGIC: u32 = 0x464C_574C;

/// Marker for a logical sector that has never been written.
const UNMAPPED: u32 = u32::MAX;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One 16-byte journal record.
///
/// The CRC covers the first twelve bytes. A slot whose bytes are all `0xFF`
/// has never been programmed, which is why `0xFF` is not a valid kind.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct JournalRecord {
    kind: u8,
    reserved: [u8; 3],
    a: u32,
    b: u32,
    crc: u32,
}

static_assert!(size_of::<JournalRecord>() == RECORD_SIZE);

impl JournalRecord {
    fn new(kind: u8, a: u32, b: u32) -> Self {
        let mut record = Self {
            kind,
            reserved: [0; 3],
            a,
            b,
            crc: 0,
        };
        record.crc = record.checksum();
        record
    }

    fn checksum(&self) -> u32 {
        CRC32.checksum(&self.as_bytes()[..RECORD_SIZE - 4])
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: The struct is `repr(C, packed)`, so any byte pattern is valid.
        unsafe { core::slice::from_raw_parts((&raw const *self).cast::<u8>(), size_of::<Self>()) }
    }
}

/// Interpretation of one journal slot during replay.
enum SlotState {
    /// Never programmed, the log ends here.
    Blank,
    /// Programmed but failing its CRC, a torn append.
    Torn,
    Valid(JournalRecord),
}

fn classify(raw: &[u8; RECORD_SIZE]) -> SlotState {
    if raw.iter().all(|&byte| byte == 0xFF) {
        return SlotState::Blank;
    }
    // SAFETY: The buffer is exactly one record long and the packed layout
    // has an alignment of 1.
    let record = unsafe { raw.as_ptr().cast::<JournalRecord>().read() };
    if record.crc == record.checksum() {
        SlotState::Valid(record)
    } else {
        SlotState::Torn
    }
}

/// Life cycle of one pool sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectorState {
    /// Erased and ready to program.
    Clean,
    /// Holds stale data, erased before reuse.
    Dirty,
    /// Currently mapped to a logical sector.
    Live,
    /// Retired after a failed erase.
    Bad,
}

/// Spare pool sectors kept out of the logical space so that a write always
/// has a free sector to rotate into.
const fn pool_reserve(pool: usize) -> usize {
    let scaled = pool / 32;
    if scaled < 2 { 2 } else { scaled }
}

/// Computes the per-group journal size for a device geometry.
///
/// A group must hold a full snapshot (one header, one map record per
/// logical sector, one erase and one bad record per pool sector) with at
/// least one slot of append headroom left over. Returns `None` when the
/// device is too small to leave a usable pool behind the journal.
fn journal_group_sectors(sector_size: usize, sector_count: usize) -> Option<usize> {
    if sector_size < RECORD_SIZE {
        return None;
    }
    let per_sector = sector_size / RECORD_SIZE;
    let mut group = 1;
    loop {
        if 2 * group >= sector_count {
            return None;
        }
        let pool = sector_count - 2 * group;
        let logical = pool.saturating_sub(pool_reserve(pool));
        if logical == 0 {
            return None;
        }
        if 1 + logical + 2 * pool < group * per_sector {
            return Some(group);
        }
        group += 1;
    }
}

/// Wear-leveling translation layer over raw flash.
///
/// Implements [`BlockDevice`]: block `n` always reads back the most recent
/// successful write to block `n`, while the physical location of that data
/// rotates across the pool so no single flash sector absorbs all the erase
/// cycles. The publish point of a write is the append of its map record,
/// which makes every logical write atomic under power loss.
pub struct WearLevel<D: FlashDevice> {
    device: D,
    sector_size: usize,
    /// Sectors in one journal group.
    group_sectors: usize,
    /// First pool sector.
    pool_start: usize,
    /// Pool size in sectors.
    pool_len: usize,
    /// Logical sectors exposed as blocks.
    logical: usize,
    /// Journal group currently accepting appends, 0 or 1.
    active_group: u8,
    /// Epoch of the active group, bumped by every compaction.
    epoch: u32,
    /// Next free record slot in the active group.
    next_slot: usize,
    /// Whether a group header exists on flash.
    journal_ready: bool,
    /// Logical to pool-relative physical mapping.
    map: Vec<u32>,
    states: Vec<SectorState>,
    /// Erase cycles per pool sector, as recorded in the journal.
    erase_counts: Vec<u32>,
}

impl<D: FlashDevice> WearLevel<D> {
    /// Opens the wear-leveled view of `device`, replaying the journal.
    ///
    /// Mounting never writes. A device with no valid journal group comes up
    /// with an empty mapping, every block reading as erased flash, and the
    /// journal itself is initialized lazily by the first write.
    pub fn mount(device: D) -> Result<Self, DeviceError> {
        // Leveling trades sectors individually, coarser erase units would
        // tear sectors that are still live.
        if device.erase_unit() != 1 {
            return Err(DeviceError::Unaligned);
        }
        let sector_size = device.sector_size();
        let sector_count = device.sector_count();
        let Some(group_sectors) = journal_group_sectors(sector_size, sector_count) else {
            return Err(DeviceError::OutOfBounds);
        };
        let pool_start = 2 * group_sectors;
        let pool_len = sector_count - pool_start;
        let logical = pool_len - pool_reserve(pool_len);

        let mut level = Self {
            device,
            sector_size,
            group_sectors,
            pool_start,
            pool_len,
            logical,
            active_group: 0,
            epoch: 0,
            next_slot: 0,
            journal_ready: false,
            map: vec![UNMAPPED; logical],
            // Pool contents are unknown until the journal says otherwise,
            // so every sector gets erased before its first use.
            states: vec![SectorState::Dirty; pool_len],
            erase_counts: vec![0; pool_len],
        };

        let first = level.read_group_epoch(0)?;
        let second = level.read_group_epoch(1)?;
        let chosen = match (first, second) {
            (Some(left), Some(right)) if right > left => Some((1, right)),
            (Some(left), _) => Some((0, left)),
            (None, Some(right)) => Some((1, right)),
            (None, None) => None,
        };

        if let Some((group, epoch)) = chosen {
            level.active_group = group;
            level.epoch = epoch;
            level.replay_group(group)?;
            level.journal_ready = true;
            let mapped = level
                .map
                .iter()
                .filter(|&&target| target != UNMAPPED)
                .count();
            log::info!(
                "mounted wear level: {} logical sectors, {mapped} mapped, group {group} at epoch {epoch}",
                level.logical
            );
        } else {
            log::info!(
                "no valid wear journal, mounting {} logical sectors fresh",
                level.logical
            );
        }
        Ok(level)
    }

    /// Erases the journal and writes a fresh group 0 header.
    ///
    /// Any previous mapping is forgotten: pool sectors keep their raw
    /// contents but every logical sector reads as erased afterwards.
    pub fn format(device: &mut D) -> Result<(), DeviceError> {
        if device.erase_unit() != 1 {
            return Err(DeviceError::Unaligned);
        }
        let sector_size = device.sector_size();
        let Some(group_sectors) = journal_group_sectors(sector_size, device.sector_count()) else {
            return Err(DeviceError::OutOfBounds);
        };
        with_retry(|| device.erase_range(0, 2 * group_sectors))?;
        let header = JournalRecord::new(KIND_HEADER, 1, JOURNAL_MAGIC);
        let mut image = vec![0xFF; sector_size];
        image[..RECORD_SIZE].copy_from_slice(header.as_bytes());
        with_retry(|| device.program_sector(0, &image))?;
        log::info!("formatted wear journal: 2 groups of {group_sectors} sectors");
        Ok(())
    }

    /// Releases the underlying flash device.
    ///
    /// The journal is append-only and written through, so there is nothing
    /// to flush first.
    pub fn into_inner(self) -> D {
        self.device
    }

    fn read_group_epoch(&mut self, group: u8) -> Result<Option<u32>, DeviceError> {
        let sector = self.group_start(group);
        let mut buf = vec![0u8; self.sector_size];
        with_retry(|| self.device.read_sector(sector, &mut buf))?;
        let mut raw = [0u8; RECORD_SIZE];
        raw.copy_from_slice(&buf[..RECORD_SIZE]);
        match classify(&raw) {
            SlotState::Valid(record) if record.kind == KIND_HEADER && record.b == JOURNAL_MAGIC => {
                Ok(Some(record.a))
            }
            _ => Ok(None),
        }
    }

    /// Replays one journal group in append order, stopping at the first
    /// blank or torn slot.
    fn replay_group(&mut self, group: u8) -> Result<(), DeviceError> {
        let per_sector = self.sector_size / RECORD_SIZE;
        let mut buf = vec![0u8; self.sector_size];
        let mut next = self.group_capacity();
        'scan: for sector_index in 0..self.group_sectors {
            let sector = self.group_start(group) + sector_index;
            with_retry(|| self.device.read_sector(sector, &mut buf))?;
            for record_index in 0..per_sector {
                let slot = sector_index * per_sector + record_index;
                let at = record_index * RECORD_SIZE;
                let mut raw = [0u8; RECORD_SIZE];
                raw.copy_from_slice(&buf[at..at + RECORD_SIZE]);
                match classify(&raw) {
                    SlotState::Blank => {
                        next = slot;
                        break 'scan;
                    }
                    SlotState::Torn => {
                        // A reset mid-append leaves a half-programmed slot.
                        // Its bits cannot be reused, appends resume after it.
                        log::debug!("discarding torn journal record at slot {slot}");
                        next = slot + 1;
                        break 'scan;
                    }
                    SlotState::Valid(record) => self.apply(record)?,
                }
            }
        }
        self.next_slot = next;
        Ok(())
    }

    fn apply(&mut self, record: JournalRecord) -> Result<(), DeviceError> {
        match record.kind {
            KIND_HEADER => {}
            KIND_MAP => {
                let lba = usize::try_from(record.a).unwrap();
                let target = usize::try_from(record.b).unwrap();
                if lba >= self.logical || target >= self.pool_len {
                    return Err(DeviceError::Corrupted);
                }
                let previous = self.map[lba];
                if previous != UNMAPPED {
                    self.states[usize::try_from(previous).unwrap()] = SectorState::Dirty;
                }
                self.map[lba] = record.b;
                self.states[target] = SectorState::Live;
            }
            KIND_ERASE => {
                let index = usize::try_from(record.a).unwrap();
                if index >= self.pool_len {
                    return Err(DeviceError::Corrupted);
                }
                // Only the counter is trusted across mounts, the sector is
                // re-erased before its next use.
                self.erase_counts[index] = record.b;
            }
            KIND_BAD => {
                let index = usize::try_from(record.a).unwrap();
                if index >= self.pool_len {
                    return Err(DeviceError::Corrupted);
                }
                self.states[index] = SectorState::Bad;
            }
            kind => {
                log::debug!("ignoring journal record with unknown kind {kind:#04x}");
            }
        }
        Ok(())
    }

    /// Initializes group 0 on the first mutation of an unformatted device.
    fn ensure_journal(&mut self) -> Result<(), DeviceError> {
        if self.journal_ready {
            return Ok(());
        }
        let span = 2 * self.group_sectors;
        with_retry(|| self.device.erase_range(0, span))?;
        self.write_slot(0, 0, &JournalRecord::new(KIND_HEADER, 1, JOURNAL_MAGIC))?;
        self.active_group = 0;
        self.epoch = 1;
        self.next_slot = 1;
        self.journal_ready = true;
        log::info!(
            "initialized wear journal: 2 groups of {} sectors",
            self.group_sectors
        );
        Ok(())
    }

    /// Picks the reusable pool sector with the fewest recorded erases.
    fn pick_free(&self) -> Result<usize, DeviceError> {
        let mut best = None;
        for (index, state) in self.states.iter().enumerate() {
            if !matches!(state, SectorState::Clean | SectorState::Dirty) {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => self.erase_counts[index] < self.erase_counts[current],
            };
            if better {
                best = Some(index);
            }
        }
        best.ok_or(DeviceError::Full)
    }

    fn erase_pool_sector(&mut self, index: usize) -> Result<(), DeviceError> {
        let sector = self.pool_start + index;
        with_retry(|| self.device.erase_range(sector, 1))?;
        self.erase_counts[index] += 1;
        self.states[index] = SectorState::Clean;
        let count = self.erase_counts[index];
        self.append_record(JournalRecord::new(
            KIND_ERASE,
            u32::try_from(index).unwrap(),
            count,
        ))
    }

    /// Takes a pool sector out of rotation after a failed erase.
    fn retire(&mut self, index: usize) -> Result<(), DeviceError> {
        log::warn!("retiring pool sector {index} after an erase fault");
        self.states[index] = SectorState::Bad;
        self.append_record(JournalRecord::new(KIND_BAD, u32::try_from(index).unwrap(), 0))
    }

    fn append_record(&mut self, record: JournalRecord) -> Result<(), DeviceError> {
        if self.next_slot >= self.group_capacity() {
            self.compact()?;
        }
        let slot = self.next_slot;
        self.write_slot(self.active_group, slot, &record)?;
        self.next_slot = slot + 1;
        Ok(())
    }

    /// Snapshots the live state into the standby group and retires the
    /// full one.
    fn compact(&mut self) -> Result<(), DeviceError> {
        let standby = 1 - self.active_group;
        let standby_start = self.group_start(standby);
        let group_sectors = self.group_sectors;
        with_retry(|| self.device.erase_range(standby_start, group_sectors))?;

        let mut records = Vec::new();
        for (lba, &target) in self.map.iter().enumerate() {
            if target != UNMAPPED {
                records.push(JournalRecord::new(
                    KIND_MAP,
                    u32::try_from(lba).unwrap(),
                    target,
                ));
            }
        }
        for (index, &count) in self.erase_counts.iter().enumerate() {
            if count != 0 {
                records.push(JournalRecord::new(
                    KIND_ERASE,
                    u32::try_from(index).unwrap(),
                    count,
                ));
            }
        }
        for (index, &state) in self.states.iter().enumerate() {
            if state == SectorState::Bad {
                records.push(JournalRecord::new(KIND_BAD, u32::try_from(index).unwrap(), 0));
            }
        }
        debug_assert!(1 + records.len() < self.group_capacity());

        for (position, record) in records.iter().enumerate() {
            self.write_slot(standby, 1 + position, record)?;
        }
        // The header goes in last. An interrupted snapshot leaves the
        // standby group headerless and the current group stays
        // authoritative.
        let epoch = self.epoch + 1;
        self.write_slot(standby, 0, &JournalRecord::new(KIND_HEADER, epoch, JOURNAL_MAGIC))?;

        let retired_start = self.group_start(self.active_group);
        with_retry(|| self.device.erase_range(retired_start, group_sectors))?;

        self.active_group = standby;
        self.epoch = epoch;
        self.next_slot = 1 + records.len();
        log::debug!("compacted wear journal into group {standby} at epoch {epoch}");
        Ok(())
    }

    /// Programs one record into a journal slot.
    ///
    /// The rest of the sector image is `0xFF`, which NOR programming leaves
    /// untouched, so earlier slots in the same sector survive.
    fn write_slot(
        &mut self,
        group: u8,
        slot: usize,
        record: &JournalRecord,
    ) -> Result<(), DeviceError> {
        let per_sector = self.sector_size / RECORD_SIZE;
        let sector = self.group_start(group) + slot / per_sector;
        let offset = (slot % per_sector) * RECORD_SIZE;
        let mut image = vec![0xFF; self.sector_size];
        image[offset..offset + RECORD_SIZE].copy_from_slice(record.as_bytes());
        with_retry(|| self.device.program_sector(sector, &image))
    }

    const fn group_start(&self, group: u8) -> usize {
        if group == 0 { 0 } else { self.group_sectors }
    }

    const fn group_capacity(&self) -> usize {
        self.group_sectors * (self.sector_size / RECORD_SIZE)
    }
}

impl<D: FlashDevice> BlockDevice for WearLevel<D> {
    fn block_size(&self) -> usize {
        self.sector_size
    }

    fn block_count(&self) -> usize {
        self.logical
    }

    fn read_block(&mut self, block: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        if block >= self.logical {
            return Err(DeviceError::OutOfBounds);
        }
        if buf.len() != self.sector_size {
            return Err(DeviceError::Unaligned);
        }
        let target = self.map[block];
        if target == UNMAPPED {
            buf.fill(0xFF);
            return Ok(());
        }
        let sector = self.pool_start + usize::try_from(target).unwrap();
        with_retry(|| self.device.read_sector(sector, &mut *buf))
    }

    fn write_block(&mut self, block: usize, data: &[u8]) -> Result<(), DeviceError> {
        if block >= self.logical {
            return Err(DeviceError::OutOfBounds);
        }
        if data.len() != self.sector_size {
            return Err(DeviceError::Unaligned);
        }
        self.ensure_journal()?;

        let target = loop {
            let candidate = self.pick_free()?;
            if self.states[candidate] == SectorState::Clean {
                break candidate;
            }
            match self.erase_pool_sector(candidate) {
                Ok(()) => break candidate,
                Err(DeviceError::Fault) => self.retire(candidate)?,
                Err(error) => return Err(error),
            }
        };

        let sector = self.pool_start + target;
        if let Err(error) = with_retry(|| self.device.program_sector(sector, data)) {
            // The sector may be half programmed, make sure it gets erased
            // before any reuse.
            self.states[target] = SectorState::Dirty;
            return Err(error);
        }

        let previous = self.map[block];
        let mapped = u32::try_from(target).unwrap();
        let publish = self.append_record(JournalRecord::new(
            KIND_MAP,
            u32::try_from(block).unwrap(),
            mapped,
        ));
        if let Err(error) = publish {
            // The data landed but was never published. The sector holds
            // residue now and must be erased before any reuse.
            self.states[target] = SectorState::Dirty;
            return Err(error);
        }
        self.map[block] = mapped;
        self.states[target] = SectorState::Live;

        if previous != UNMAPPED {
            // Retire the superseded copy right away so the pool stays
            // mostly clean and wear spreads now instead of on a later
            // write. The new copy is already published, so a failure in
            // here never fails the write: the stale sector stays dirty
            // and is erased before any reuse.
            let stale = usize::try_from(previous).unwrap();
            self.states[stale] = SectorState::Dirty;
            let retired = match self.erase_pool_sector(stale) {
                Err(DeviceError::Fault) => self.retire(stale),
                outcome => outcome,
            };
            if let Err(error) = retired {
                log::warn!("deferring retirement of pool sector {stale}: {error}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint_core::storage::ram::RamFlash;

    const SECTOR: usize = 512;
    /// Geometry of `RamFlash::new(SECTOR, 32)`: 2 journal groups of 3
    /// sectors, then a 26-sector pool exposing 24 logical blocks.
    const POOL_START: usize = 6;

    fn wear_on(flash: RamFlash) -> WearLevel<RamFlash> {
        WearLevel::mount(flash).unwrap()
    }

    fn filled(byte: u8) -> Vec<u8> {
        vec![byte; SECTOR]
    }

    #[test]
    fn journal_records_encode_and_validate() {
        let record = JournalRecord::new(KIND_MAP, 7, 42);
        let mut raw = [0u8; RECORD_SIZE];
        raw.copy_from_slice(record.as_bytes());
        assert!(matches!(
            classify(&raw),
            SlotState::Valid(parsed) if parsed.kind == KIND_MAP && parsed.a == 7 && parsed.b == 42
        ));

        raw[4] ^= 0x01;
        assert!(matches!(classify(&raw), SlotState::Torn));

        let blank = [0xFF; RECORD_SIZE];
        assert!(matches!(classify(&blank), SlotState::Blank));
    }

    #[test]
    fn geometry_leaves_room_for_the_journal() {
        assert_eq!(journal_group_sectors(512, 32), Some(3));
        assert_eq!(journal_group_sectors(8, 64), None);
        assert_eq!(journal_group_sectors(512, 4), None);

        let level = wear_on(RamFlash::new(SECTOR, 32));
        assert_eq!(level.block_size(), SECTOR);
        assert_eq!(level.block_count(), 24);

        // Mounting is read-only.
        let flash = level.into_inner();
        assert!(flash.erase_counts().iter().all(|&count| count == 0));

        assert!(matches!(
            WearLevel::mount(RamFlash::new(SECTOR, 4)),
            Err(DeviceError::OutOfBounds)
        ));
        assert!(matches!(
            WearLevel::mount(RamFlash::new(SECTOR, 32).with_erase_unit(4)),
            Err(DeviceError::Unaligned)
        ));
    }

    #[test]
    fn unwritten_blocks_read_as_erased_flash() {
        let mut level = wear_on(RamFlash::new(SECTOR, 32));
        let mut buf = filled(0);
        level.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, filled(0xFF));
        level.read_block(23, &mut buf).unwrap();
        assert_eq!(buf, filled(0xFF));
    }

    #[test]
    fn addressing_is_validated() {
        let mut level = wear_on(RamFlash::new(SECTOR, 32));
        let mut buf = filled(0);
        assert_eq!(level.read_block(24, &mut buf), Err(DeviceError::OutOfBounds));
        assert_eq!(level.write_block(24, &buf), Err(DeviceError::OutOfBounds));
        assert_eq!(level.read_block(0, &mut [0u8; 100]), Err(DeviceError::Unaligned));
        assert_eq!(level.write_block(0, &[0u8; 100]), Err(DeviceError::Unaligned));
    }

    #[test]
    fn writes_read_back_after_rewrites() {
        let mut level = wear_on(RamFlash::new(SECTOR, 32));
        level.write_block(3, &filled(0xAB)).unwrap();
        level.write_block(4, &filled(0xCD)).unwrap();
        level.write_block(3, &filled(0x12)).unwrap();

        let mut buf = filled(0);
        level.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, filled(0x12));
        level.read_block(4, &mut buf).unwrap();
        assert_eq!(buf, filled(0xCD));
        level.read_block(5, &mut buf).unwrap();
        assert_eq!(buf, filled(0xFF));
    }

    #[test]
    fn the_mapping_survives_a_remount() {
        let mut level = wear_on(RamFlash::new(SECTOR, 32));
        for block in 0..24 {
            level.write_block(block, &filled(u8::try_from(block).unwrap())).unwrap();
        }
        level.write_block(0, &filled(0xEE)).unwrap();

        let mut level = wear_on(level.into_inner());
        assert_eq!(level.block_count(), 24);
        let mut buf = filled(0);
        level.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, filled(0xEE));
        for block in 1..24 {
            level.read_block(block, &mut buf).unwrap();
            assert_eq!(buf, filled(u8::try_from(block).unwrap()));
        }
    }

    #[test]
    fn power_loss_never_tears_a_block() {
        let old = filled(0xAA);
        let new = filled(0x55);
        for surviving in 0..8 {
            let mut level = wear_on(RamFlash::new(SECTOR, 32));
            level.write_block(5, &old).unwrap();

            let mut flash = level.into_inner();
            flash.fail_after(surviving);
            let mut level = wear_on(flash);
            let _ = level.write_block(5, &new);

            let mut flash = level.into_inner();
            flash.power_cycle();
            let mut level = wear_on(flash);
            let mut buf = filled(0);
            level.read_block(5, &mut buf).unwrap();
            assert!(
                buf == old || buf == new,
                "lost write must fall back to the previous contents (surviving {surviving})"
            );
        }
    }

    #[test]
    fn hammering_one_block_spreads_erases() {
        let mut level = wear_on(RamFlash::new(SECTOR, 32));
        for round in 0..256u32 {
            level.write_block(7, &filled(u8::try_from(round % 251).unwrap())).unwrap();
        }
        let mut buf = filled(0);
        level.read_block(7, &mut buf).unwrap();
        assert_eq!(buf, filled(u8::try_from(255 % 251).unwrap()));

        let flash = level.into_inner();
        let pool = &flash.erase_counts()[POOL_START..];
        let highest = pool.iter().max().unwrap();
        let lowest = pool.iter().min().unwrap();
        assert!(
            highest - lowest <= 3,
            "erases must spread evenly, got {lowest}..{highest}"
        );

        // Compaction alternates groups, so both journal halves cycled.
        assert!(flash.erase_counts()[..3].iter().all(|&count| count > 0));
        assert!(flash.erase_counts()[3..6].iter().all(|&count| count > 0));
    }

    #[test]
    fn compaction_preserves_every_mapping() {
        let mut level = wear_on(RamFlash::new(SECTOR, 32));
        for block in 0..24 {
            level.write_block(block, &filled(u8::try_from(block).unwrap())).unwrap();
        }
        for round in 0..100 {
            level.write_block(0, &filled(u8::try_from(round).unwrap())).unwrap();
        }

        let mut level = wear_on(level.into_inner());
        let mut buf = filled(0);
        level.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, filled(99));
        for block in 1..24 {
            level.read_block(block, &mut buf).unwrap();
            assert_eq!(buf, filled(u8::try_from(block).unwrap()));
        }
    }

    #[test]
    fn transient_io_errors_are_retried() {
        let mut level = wear_on(RamFlash::new(SECTOR, 32));
        level.write_block(3, &filled(0x5A)).unwrap();

        let mut flash = level.into_inner();
        flash.inject_io_errors(2);
        let mut level = wear_on(flash);
        let mut buf = filled(0);
        level.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, filled(0x5A));

        let mut flash = level.into_inner();
        flash.inject_io_errors(3);
        assert!(matches!(WearLevel::mount(flash), Err(DeviceError::Io)));
    }

    #[test]
    fn formatting_forgets_the_mapping() {
        let mut level = wear_on(RamFlash::new(SECTOR, 32));
        level.write_block(2, &filled(0x77)).unwrap();

        let mut flash = level.into_inner();
        WearLevel::format(&mut flash).unwrap();
        let mut level = wear_on(flash);
        let mut buf = filled(0);
        level.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, filled(0xFF));
    }

    /// Delegates to [`RamFlash`] but refuses to erase sectors at or past
    /// `bad_from`, simulating worn-out flash.
    struct FailingErases {
        inner: RamFlash,
        bad_from: usize,
    }

    impl FlashDevice for FailingErases {
        fn sector_size(&self) -> usize {
            self.inner.sector_size()
        }

        fn sector_count(&self) -> usize {
            self.inner.sector_count()
        }

        fn read_sector(&mut self, sector: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
            self.inner.read_sector(sector, buf)
        }

        fn program_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), DeviceError> {
            self.inner.program_sector(sector, data)
        }

        fn erase_range(&mut self, sector: usize, count: usize) -> Result<(), DeviceError> {
            if sector >= self.bad_from {
                return Err(DeviceError::Fault);
            }
            self.inner.erase_range(sector, count)
        }
    }

    #[test]
    fn erase_faults_retire_sectors_without_losing_writes() {
        let flash = FailingErases {
            inner: RamFlash::new(SECTOR, 32),
            bad_from: POOL_START + 23,
        };
        let mut level = WearLevel::mount(flash).unwrap();
        for round in 0..60u32 {
            level.write_block(7, &filled(u8::try_from(round % 251).unwrap())).unwrap();
        }
        let mut buf = filled(0);
        level.read_block(7, &mut buf).unwrap();
        assert_eq!(buf, filled(59));

        // The retired tail never got a successful erase.
        let flash = level.into_inner();
        assert!(flash.inner.erase_counts()[POOL_START + 23..].iter().all(|&count| count == 0));
    }

    #[test]
    fn a_worn_out_pool_reports_full() {
        let flash = FailingErases {
            inner: RamFlash::new(SECTOR, 32),
            bad_from: POOL_START,
        };
        let mut level = WearLevel::mount(flash).unwrap();
        assert_eq!(level.write_block(0, &filled(0x1F)), Err(DeviceError::Full));
        assert_eq!(level.write_block(1, &filled(0x2F)), Err(DeviceError::Full));
    }

    /// Delegates to [`RamFlash`] but faults journal-region programs on a
    /// schedule: the first `skip` pass through, the next `failures` fail.
    struct FlakyJournalPrograms {
        inner: RamFlash,
        skip: usize,
        failures: usize,
    }

    impl FlashDevice for FlakyJournalPrograms {
        fn sector_size(&self) -> usize {
            self.inner.sector_size()
        }

        fn sector_count(&self) -> usize {
            self.inner.sector_count()
        }

        fn read_sector(&mut self, sector: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
            self.inner.read_sector(sector, buf)
        }

        fn program_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), DeviceError> {
            if sector < POOL_START {
                if self.skip > 0 {
                    self.skip -= 1;
                } else if self.failures > 0 {
                    self.failures -= 1;
                    return Err(DeviceError::Fault);
                }
            }
            self.inner.program_sector(sector, data)
        }

        fn erase_range(&mut self, sector: usize, count: usize) -> Result<(), DeviceError> {
            self.inner.erase_range(sector, count)
        }
    }

    #[test]
    fn a_failed_publish_leaves_no_residue_behind() {
        // Let the header, two erase records and the first map record
        // through, then fault the map append of the second write.
        let mut level = WearLevel::mount(FlakyJournalPrograms {
            inner: RamFlash::new(SECTOR, 32),
            skip: 4,
            failures: 1,
        })
        .unwrap();
        level.write_block(0, &filled(0x0F)).unwrap();

        // The data sector programs fine, publishing its map record fails.
        assert!(level.write_block(2, &filled(0x55)).is_err());
        let mut buf = filled(0);
        level.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, filled(0xFF));

        // The unpublished sector holds residue. Cycle the pool so it gets
        // picked again, programming over it would AND the old bits in.
        for round in 0..3usize {
            for block in 0..24 {
                let byte = u8::try_from((round * 24 + block) % 251).unwrap();
                level.write_block(block, &filled(byte)).unwrap();
                level.read_block(block, &mut buf).unwrap();
                assert_eq!(buf, filled(byte), "block {block} in round {round}");
            }
        }
    }

    /// Delegates to [`RamFlash`] but reports transient erase failures:
    /// the first `skip` erases pass, the next `failures` fail.
    struct FlakyErases {
        inner: RamFlash,
        skip: usize,
        failures: usize,
    }

    impl FlashDevice for FlakyErases {
        fn sector_size(&self) -> usize {
            self.inner.sector_size()
        }

        fn sector_count(&self) -> usize {
            self.inner.sector_count()
        }

        fn read_sector(&mut self, sector: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
            self.inner.read_sector(sector, buf)
        }

        fn program_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), DeviceError> {
            self.inner.program_sector(sector, data)
        }

        fn erase_range(&mut self, sector: usize, count: usize) -> Result<(), DeviceError> {
            if self.skip > 0 {
                self.skip -= 1;
            } else if self.failures > 0 {
                self.failures -= 1;
                return Err(DeviceError::Io);
            }
            self.inner.erase_range(sector, count)
        }
    }

    #[test]
    fn retirement_failures_never_fail_a_published_write() {
        let mut level = WearLevel::mount(FlakyErases {
            inner: RamFlash::new(SECTOR, 32),
            skip: 0,
            failures: 0,
        })
        .unwrap();
        level.write_block(6, &filled(0xA1)).unwrap();

        // Rewrite the block, letting the lazy erase of the fresh sector
        // pass and exhausting the retries of the eager erase behind it.
        let mut flash = level.into_inner();
        flash.skip = 1;
        flash.failures = 3;
        let mut level = WearLevel::mount(flash).unwrap();
        level.write_block(6, &filled(0xB2)).unwrap();
        let mut buf = filled(0);
        level.read_block(6, &mut buf).unwrap();
        assert_eq!(buf, filled(0xB2));

        // The stale copy stays dirty and is erased before its reuse.
        for block in 0..24 {
            level.write_block(block, &filled(0x33)).unwrap();
        }
        level.write_block(9, &filled(0x66)).unwrap();
        level.read_block(9, &mut buf).unwrap();
        assert_eq!(buf, filled(0x66));
    }
}
