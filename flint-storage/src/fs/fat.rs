//! FAT12/16 file system engine.
//!
//! The engine implements the [`FileSystem`] operations on top of any
//! [`BlockDevice`] whose block size matches the volume's sector size.
//! Volumes use the classic super-floppy layout: boot sector, FAT copies,
//! fixed root directory, then the data area. Long file names are stored
//! alongside their 8.3 records, case is preserved on creation and ignored
//! on lookup.
//!
//! Mutations order their device writes so that an interrupted operation
//! leaves the volume consistent. Cluster allocations reach the FAT before
//! any directory entry references them, and names are unlinked before
//! their clusters are released. The worst outcome of a poorly timed reset
//! is leaked clusters, never a dangling reference.

use alloc::{vec, vec::Vec};

use thiserror::Error;

use flint_core::storage::{BlockDevice, DeviceError};

use super::{DirEntryInfo, FileSystem, FileType, FsError, FsResult, Metadata, Path, VolumeStats};

use bs::{BootSector, MEDIA_DESCRIPTOR, VolumeLayout};
use date::{DefaultTimeProvider, EPOCH_2000, TimeProvider};
use dir::{DirScan, ScannedEntry, SlotKind, build_lfn_slots, classify};
use dirent::{
    Attributes, DIR_ENTRY_SIZE, DirEntry, MAX_NAME_LEN, MAX_SHORT_NAME_TAIL, fits_short_name,
    short_name_from, validate_name,
};
use fat::{FatEntries, FatEntry, FatTable};
use file::FatFile;

pub mod bs;
pub mod date;
pub mod dir;
pub mod dirent;
#[expect(clippy::module_inception, reason = "FS is named after this table")]
pub mod fat;
pub mod file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// An allocation unit of the data area.
///
/// Values 0 and 1 are reserved by the format, data clusters start at 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cluster(u32);

impl Cluster {
    #[must_use]
    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    #[inline]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns true if the cluster can address data for the given FAT type.
    #[must_use]
    pub const fn is_valid(&self, fat_type: FatType) -> bool {
        let max = match fat_type {
            FatType::Fat12 => 0xFF6,
            FatType::Fat16 => 0xFFF6,
            FatType::Fat32 => 0x0FFF_FFF6,
        };
        self.0 >= 2 && self.0 <= max
    }

    /// Returns true for the null cluster used by empty files.
    #[must_use]
    #[inline]
    pub const fn is_free(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatError {
    /// Device-level failure, kind preserved from the layer below.
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid cluster")]
    InvalidCluster,
    #[error("out of bounds access")]
    OutOfBounds,
    #[error("corrupted cluster chain")]
    CorruptedChain,
    #[error("no free cluster left")]
    NoSpace,
}

pub type FatResult<T> = Result<T, FatError>;

impl From<FatError> for FsError {
    fn from(value: FatError) -> Self {
        match value {
            FatError::Device(e) => Self::Device(e),
            FatError::NoSpace => Self::Full,
            FatError::InvalidParameter => Self::Unsupported,
            FatError::InvalidCluster | FatError::OutOfBounds | FatError::CorruptedChain => {
                Self::Corrupted
            }
        }
    }
}

/// Callback reading a byte span out of one cluster.
type RefDataReader<'a> = &'a mut dyn FnMut(Cluster, u32, &mut [u8]) -> FatResult<()>;
/// Callback writing a byte span into one cluster.
type RefDataWriter<'a> = &'a mut dyn FnMut(Cluster, u32, &[u8]) -> FatResult<()>;

/// Where a directory's records live.
///
/// The FAT12/16 root directory is a fixed region outside the data area and
/// cannot grow. Every other directory is an ordinary cluster chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirStorage {
    Root,
    Chain(Cluster),
}

/// Outcome of resolving an absolute path within the volume.
enum Location {
    Root,
    Entry { parent: DirStorage, entry: ScannedEntry },
}

/// A mounted FAT12/16 volume.
///
/// The FAT is cached in memory and written back sector by sector as it gets
/// dirtied, to every copy the volume carries. Directory records are always
/// read from and written to the device directly.
pub struct FatFs<D: BlockDevice, T: TimeProvider = DefaultTimeProvider> {
    device: D,
    layout: VolumeLayout,
    fat: FatTable,
    clock: T,
}

impl<D: BlockDevice> FatFs<D> {
    /// Inspects the first sector of the device and derives the volume layout.
    ///
    /// Fails with [`FsError::NoFilesystem`] when no plausible FAT boot sector
    /// is present, which callers use to decide whether to format first, and
    /// with [`FsError::Unsupported`] for FAT32 volumes.
    pub fn probe(device: &mut D) -> FsResult<VolumeLayout> {
        let mut sector = vec![0u8; device.block_size()];
        device.read_block(0, &mut sector)?;

        let Some(boot) = BootSector::read_from(&sector) else {
            return Err(FsError::NoFilesystem);
        };
        let bpb = boot.bpb();
        // FAT32 comes first: its BPB fails FAT12/16 validation, but it must
        // not look like a formattable blank device to callers.
        if bpb.is_fat32() {
            return Err(FsError::Unsupported);
        }
        if !bpb.validate() || usize::from(bpb.bytes_per_sector()) != device.block_size() {
            return Err(FsError::NoFilesystem);
        }
        let Some(layout) = VolumeLayout::from_bpb(bpb) else {
            return Err(FsError::NoFilesystem);
        };
        if usize::try_from(layout.total_sectors).unwrap() > device.block_count() {
            return Err(FsError::NoFilesystem);
        }
        Ok(layout)
    }

    /// Writes a fresh, empty FAT12/16 file system onto the device.
    ///
    /// The data area is not wiped, only the boot sector, the FAT copies and
    /// the root directory are initialized.
    pub fn mkfs(device: &mut D) -> FsResult<()> {
        Self::mkfs_with(device, None)
    }

    /// Like [`mkfs`](Self::mkfs) with an explicit volume serial number.
    pub fn mkfs_with(device: &mut D, volume_id: Option<u32>) -> FsResult<()> {
        let bytes_per_sector =
            u16::try_from(device.block_size()).map_err(|_| FsError::Unsupported)?;
        let total_sectors =
            u32::try_from(device.block_count()).map_err(|_| FsError::Unsupported)?;
        let layout = VolumeLayout::compute(total_sectors, bytes_per_sector)
            .ok_or(FsError::Unsupported)?;
        let boot = BootSector::build(&layout, volume_id.unwrap_or(total_sectors ^ 0x464C_4E54));

        let block_len = usize::from(bytes_per_sector);
        let mut scratch = vec![0u8; block_len];
        scratch[..size_of::<BootSector>()].copy_from_slice(boot.as_bytes());
        device.write_block(0, &scratch)?;

        // Zero the FAT copies and the root directory region.
        let zeros = vec![0u8; block_len];
        for sector in layout.fat_start()..layout.data_start() {
            device.write_block(usize::try_from(sector).unwrap(), &zeros)?;
        }

        // Seed the two reserved FAT entries of each copy with the media
        // descriptor and an end marker.
        let mut head = vec![0u8; block_len];
        head[0] = MEDIA_DESCRIPTOR;
        head[1] = 0xFF;
        head[2] = 0xFF;
        if layout.fat_type == FatType::Fat16 {
            head[3] = 0xFF;
        }
        for copy in 0..u32::from(layout.fat_count) {
            let sector = layout.fat_start() + copy * u32::from(layout.sectors_per_fat);
            device.write_block(usize::try_from(sector).unwrap(), &head)?;
        }
        device.sync()?;

        log::info!(
            "formatted {:?} volume: {} clusters of {} bytes",
            layout.fat_type,
            layout.cluster_count,
            layout.bytes_per_cluster()
        );
        Ok(())
    }

    /// Mounts the volume found on the device.
    pub fn mount(device: D) -> FsResult<Self> {
        Self::mount_with_clock(device, DefaultTimeProvider::new())
    }
}

impl<D: BlockDevice, T: TimeProvider> FatFs<D, T> {
    /// Mounts the volume with a caller-provided timestamp source.
    pub fn mount_with_clock(mut device: D, clock: T) -> FsResult<Self> {
        let layout = FatFs::probe(&mut device)?;

        let bytes_per_sector = usize::from(layout.bytes_per_sector);
        let mut data = vec![0u8; usize::from(layout.sectors_per_fat) * bytes_per_sector];
        let fat_start = usize::try_from(layout.fat_start()).unwrap();
        for (index, sector) in data.chunks_exact_mut(bytes_per_sector).enumerate() {
            device.read_block(fat_start + index, sector)?;
        }
        let fat = FatTable::new(layout.fat_type, data, layout.cluster_count + 2, bytes_per_sector);

        log::debug!(
            "mounted {:?} volume: {} clusters of {} bytes, {} free",
            layout.fat_type,
            layout.cluster_count,
            layout.bytes_per_cluster(),
            fat.free_count()
        );

        Ok(Self { device, layout, fat, clock })
    }

    /// Releases the underlying device.
    ///
    /// Pending FAT updates are not written back, call
    /// [`FileSystem::sync`] first.
    pub fn into_inner(self) -> D {
        self.device
    }

    /// Resolves an absolute path to its directory entry.
    fn locate(&mut self, path: Path) -> FsResult<Location> {
        let mut dir = DirStorage::Root;
        let mut found: Option<(DirStorage, ScannedEntry)> = None;

        for component in path.components() {
            if let Some((_, entry)) = &found {
                if !entry.entry.is_directory() {
                    return Err(FsError::NotADirectory);
                }
                dir = DirStorage::Chain(entry.entry.first_cluster(self.layout.fat_type));
            }
            let Some(entry) = self.find_in_dir(dir, component)? else {
                return Err(FsError::NotFound);
            };
            found = Some((dir, entry));
        }

        Ok(match found {
            None => Location::Root,
            Some((parent, entry)) => Location::Entry { parent, entry },
        })
    }

    /// Splits a path into its parent directory's storage and the leaf name.
    fn resolve_parent<'p>(&mut self, path: Path<'p>) -> FsResult<(DirStorage, &'p str)> {
        let Some((parent, leaf)) = path.split_last() else {
            return Err(FsError::InvalidPath);
        };
        let storage = match self.locate(parent)? {
            Location::Root => DirStorage::Root,
            Location::Entry { entry, .. } => {
                if !entry.entry.is_directory() {
                    return Err(FsError::NotADirectory);
                }
                DirStorage::Chain(entry.entry.first_cluster(self.layout.fat_type))
            }
        };
        Ok((storage, leaf))
    }

    /// Looks a name up in one directory, ignoring ASCII case.
    fn find_in_dir(&mut self, dir: DirStorage, name: &str) -> FsResult<Option<ScannedEntry>> {
        let Self { device, fat, layout, .. } = self;
        let mut read = |slot: u32| read_dir_slot(device, fat, layout, dir, slot);
        let mut scan = DirScan::new();
        while let Some(entry) = scan.next_entry(&mut read)? {
            if !entry.is_dot() && entry.matches(name) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn short_name_taken(&mut self, dir: DirStorage, candidate: &[u8; 11]) -> FsResult<bool> {
        let Self { device, fat, layout, .. } = self;
        let mut read = |slot: u32| read_dir_slot(device, fat, layout, dir, slot);
        let mut scan = DirScan::new();
        while let Some(entry) = scan.next_entry(&mut read)? {
            if &entry.entry.filename_raw() == candidate {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Picks an 8.3 alias that is unique within the directory.
    fn unique_short_name(&mut self, dir: DirStorage, name: &str) -> FsResult<[u8; 11]> {
        if fits_short_name(name) {
            // A plain 8.3 name cannot take a numeric tail, it may still
            // clash with the alias of an existing long name.
            let candidate = short_name_from(name, 0);
            if self.short_name_taken(dir, &candidate)? {
                return Err(FsError::AlreadyExists);
            }
            return Ok(candidate);
        }
        // Names that only lose case take the plain form, lossy ones start
        // at the `~1` tail.
        let mut tail = u32::from(!fits_short_name(&name.to_ascii_uppercase()));
        while tail <= MAX_SHORT_NAME_TAIL {
            let candidate = short_name_from(name, tail);
            if !self.short_name_taken(dir, &candidate)? {
                return Ok(candidate);
            }
            tail += 1;
        }
        // Every alias of this stem is taken.
        Err(FsError::AlreadyExists)
    }

    /// Writes a new directory record, long name slots included.
    ///
    /// The short entry goes in last. It is what makes the name visible, so
    /// an interrupted insert leaves only ignorable orphan slots behind.
    fn insert_record(&mut self, dir: DirStorage, name: &str, mut entry: DirEntry) -> FsResult<()> {
        if !validate_name(name) {
            return Err(FsError::InvalidPath);
        }
        let short = self.unique_short_name(dir, name)?;
        entry.set_short_name(&short);
        let lfn = if fits_short_name(name) { Vec::new() } else { build_lfn_slots(name, &short) };
        let count = u32::try_from(lfn.len()).unwrap() + 1;

        let Self { device, fat, layout, .. } = self;
        let start = find_free_slots(device, fat, layout, dir, count)?;
        // Any directory growth reaches the FAT before the slots are used.
        flush_fat(device, fat, layout)?;
        for (index, slot) in lfn.iter().enumerate() {
            let at = start + u32::try_from(index).unwrap();
            write_dir_slot(device, fat, layout, dir, at, slot.as_bytes())?;
        }
        write_dir_slot(device, fat, layout, dir, start + count - 1, entry.as_bytes())?;
        Ok(())
    }

    fn insert_entry(
        &mut self,
        dir: DirStorage,
        name: &str,
        attributes: Attributes,
        first_cluster: Cluster,
        size: u32,
    ) -> FsResult<()> {
        let now = self.clock.get_current_date_time();
        let fat_type = self.layout.fat_type;
        let mut entry = DirEntry::init(&[b' '; 11], attributes, now);
        entry.set_first_cluster(first_cluster, fat_type);
        entry.set_file_size(size);
        self.insert_record(dir, name, entry)
    }

    /// Marks a record and its long name slots as deleted.
    ///
    /// Slots are cleared in on-disk order, so the short entry goes away
    /// last and the name stays reachable until the very end.
    fn delete_record(&mut self, dir: DirStorage, entry: &ScannedEntry) -> FsResult<()> {
        let Self { device, fat, layout, .. } = self;
        for slot in entry.first_slot..=entry.slot {
            let Some(mut raw) = read_dir_slot(device, fat, layout, dir, slot)? else {
                return Err(FatError::OutOfBounds.into());
            };
            raw[0] = DirEntry::DELETED_ENTRY;
            write_dir_slot(device, fat, layout, dir, slot, &raw)?;
        }
        Ok(())
    }

    fn dir_is_empty(&mut self, dir: DirStorage) -> FsResult<bool> {
        let Self { device, fat, layout, .. } = self;
        let mut read = |slot: u32| read_dir_slot(device, fat, layout, dir, slot);
        let mut scan = DirScan::new();
        while let Some(entry) = scan.next_entry(&mut read)? {
            if !entry.is_dot() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rewrites the `..` entry of a moved directory.
    fn repoint_dotdot(&mut self, child: DirStorage, parent_first: Cluster) -> FsResult<()> {
        let Self { device, fat, layout, .. } = self;
        let Some(raw) = read_dir_slot(device, fat, layout, child, 1)? else {
            return Err(FsError::Corrupted);
        };
        if let SlotKind::Short(mut entry) = classify(&raw) {
            if &entry.filename_raw() == DirEntry::DOTDOT_ENTRY {
                entry.set_first_cluster(parent_first, layout.fat_type);
                write_dir_slot(device, fat, layout, child, 1, entry.as_bytes())?;
            }
        }
        Ok(())
    }
}

/// First device sector of the given data cluster.
fn cluster_sector(layout: &VolumeLayout, cluster: Cluster) -> u32 {
    layout.data_start() + (cluster.value() - 2) * u32::from(layout.sectors_per_cluster)
}

/// Reads a byte span out of one cluster, split across sectors as needed.
fn read_cluster_bytes<D: BlockDevice>(
    device: &mut D,
    layout: &VolumeLayout,
    cluster: Cluster,
    offset: u32,
    buffer: &mut [u8],
) -> FatResult<()> {
    if !cluster.is_valid(layout.fat_type) {
        return Err(FatError::InvalidCluster);
    }
    let len = u32::try_from(buffer.len()).map_err(|_| FatError::InvalidParameter)?;
    if offset + len > layout.bytes_per_cluster() {
        return Err(FatError::OutOfBounds);
    }

    let bytes_per_sector = u32::from(layout.bytes_per_sector);
    let mut scratch = vec![0u8; usize::from(layout.bytes_per_sector)];
    let mut position = offset;
    let mut filled = 0usize;
    while filled < buffer.len() {
        let sector = cluster_sector(layout, cluster) + position / bytes_per_sector;
        let in_sector = usize::try_from(position % bytes_per_sector).unwrap();
        let chunk = (buffer.len() - filled).min(scratch.len() - in_sector);
        device.read_block(usize::try_from(sector).unwrap(), &mut scratch)?;
        buffer[filled..filled + chunk].copy_from_slice(&scratch[in_sector..in_sector + chunk]);
        position += u32::try_from(chunk).unwrap();
        filled += chunk;
    }
    Ok(())
}

/// Writes a byte span into one cluster, read-modify-write on partial sectors.
fn write_cluster_bytes<D: BlockDevice>(
    device: &mut D,
    layout: &VolumeLayout,
    cluster: Cluster,
    offset: u32,
    data: &[u8],
) -> FatResult<()> {
    if !cluster.is_valid(layout.fat_type) {
        return Err(FatError::InvalidCluster);
    }
    let len = u32::try_from(data.len()).map_err(|_| FatError::InvalidParameter)?;
    if offset + len > layout.bytes_per_cluster() {
        return Err(FatError::OutOfBounds);
    }

    let bytes_per_sector = u32::from(layout.bytes_per_sector);
    let mut scratch = vec![0u8; usize::from(layout.bytes_per_sector)];
    let mut position = offset;
    let mut written = 0usize;
    while written < data.len() {
        let sector =
            usize::try_from(cluster_sector(layout, cluster) + position / bytes_per_sector)
                .unwrap();
        let in_sector = usize::try_from(position % bytes_per_sector).unwrap();
        let chunk = (data.len() - written).min(scratch.len() - in_sector);
        if chunk == scratch.len() {
            scratch.copy_from_slice(&data[written..written + chunk]);
        } else {
            device.read_block(sector, &mut scratch)?;
            scratch[in_sector..in_sector + chunk].copy_from_slice(&data[written..written + chunk]);
        }
        device.write_block(sector, &scratch)?;
        position += u32::try_from(chunk).unwrap();
        written += chunk;
    }
    Ok(())
}

/// Zeroes every sector of a cluster before it joins a directory chain.
fn zero_cluster<D: BlockDevice>(
    device: &mut D,
    layout: &VolumeLayout,
    cluster: Cluster,
) -> FatResult<()> {
    let zeros = vec![0u8; usize::from(layout.bytes_per_sector)];
    let first = cluster_sector(layout, cluster);
    for sector in first..first + u32::from(layout.sectors_per_cluster) {
        device.write_block(usize::try_from(sector).unwrap(), &zeros)?;
    }
    Ok(())
}

/// Locates the device sector and byte offset of a directory slot.
///
/// Returns `None` past the end of the directory's storage.
fn dir_slot_location(
    fat: &FatTable,
    layout: &VolumeLayout,
    dir: DirStorage,
    slot: u32,
) -> FatResult<Option<(u32, usize)>> {
    let entry_size = u32::try_from(DIR_ENTRY_SIZE).unwrap();
    let bytes_per_sector = u32::from(layout.bytes_per_sector);
    let byte = slot * entry_size;
    match dir {
        DirStorage::Root => {
            if slot >= u32::from(layout.root_entries) {
                return Ok(None);
            }
            let sector = layout.root_dir_start() + byte / bytes_per_sector;
            Ok(Some((sector, usize::try_from(byte % bytes_per_sector).unwrap())))
        }
        DirStorage::Chain(first) => {
            if first.is_free() {
                return Ok(None);
            }
            let hop = byte / layout.bytes_per_cluster();
            let Some(cluster) = fat.nth_cluster(first, usize::try_from(hop).unwrap())? else {
                return Ok(None);
            };
            let within = byte % layout.bytes_per_cluster();
            let sector = cluster_sector(layout, cluster) + within / bytes_per_sector;
            Ok(Some((sector, usize::try_from(within % bytes_per_sector).unwrap())))
        }
    }
}

/// Reads one raw directory record.
fn read_dir_slot<D: BlockDevice>(
    device: &mut D,
    fat: &FatTable,
    layout: &VolumeLayout,
    dir: DirStorage,
    slot: u32,
) -> FatResult<Option<[u8; DIR_ENTRY_SIZE]>> {
    let Some((sector, offset)) = dir_slot_location(fat, layout, dir, slot)? else {
        return Ok(None);
    };
    let mut scratch = vec![0u8; usize::from(layout.bytes_per_sector)];
    device.read_block(usize::try_from(sector).unwrap(), &mut scratch)?;
    let mut raw = [0u8; DIR_ENTRY_SIZE];
    raw.copy_from_slice(&scratch[offset..offset + DIR_ENTRY_SIZE]);
    Ok(Some(raw))
}

/// Writes one raw directory record in place.
fn write_dir_slot<D: BlockDevice>(
    device: &mut D,
    fat: &FatTable,
    layout: &VolumeLayout,
    dir: DirStorage,
    slot: u32,
    raw: &[u8],
) -> FatResult<()> {
    let Some((sector, offset)) = dir_slot_location(fat, layout, dir, slot)? else {
        return Err(FatError::OutOfBounds);
    };
    let sector = usize::try_from(sector).unwrap();
    let mut scratch = vec![0u8; usize::from(layout.bytes_per_sector)];
    device.read_block(sector, &mut scratch)?;
    scratch[offset..offset + raw.len()].copy_from_slice(raw);
    device.write_block(sector, &scratch)?;
    Ok(())
}

/// Appends one zeroed cluster to a directory chain.
fn grow_dir<D: BlockDevice>(
    device: &mut D,
    fat: &mut FatTable,
    layout: &VolumeLayout,
    first: Cluster,
) -> FatResult<()> {
    let fresh = fat.alloc_cluster()?;
    if let Err(e) = zero_cluster(device, layout, fresh) {
        fat.free_cluster(fresh)?;
        return Err(e);
    }
    let mut last = first;
    for cluster in fat.chain_iter(first) {
        last = cluster?;
    }
    fat.set(last, FatEntry::Next(fresh))
}

/// Finds `count` consecutive reusable slots, growing chain directories on
/// demand, and returns the first slot of the run.
fn find_free_slots<D: BlockDevice>(
    device: &mut D,
    fat: &mut FatTable,
    layout: &VolumeLayout,
    dir: DirStorage,
    count: u32,
) -> FatResult<u32> {
    let mut run_start = 0u32;
    let mut run_len = 0u32;
    let mut slot = 0u32;
    loop {
        let Some(raw) = read_dir_slot(device, fat, layout, dir, slot)? else {
            match dir {
                // The fixed root region cannot grow.
                DirStorage::Root => return Err(FatError::NoSpace),
                DirStorage::Chain(first) => {
                    grow_dir(device, fat, layout, first)?;
                    continue;
                }
            }
        };
        match classify(&raw) {
            SlotKind::End | SlotKind::Deleted => {
                if run_len == 0 {
                    run_start = slot;
                }
                run_len += 1;
                if run_len == count {
                    return Ok(run_start);
                }
            }
            SlotKind::LongName(_) | SlotKind::Short(_) => run_len = 0,
        }
        slot += 1;
    }
}

/// Writes dirty FAT sectors back to every FAT copy on the device.
fn flush_fat<D: BlockDevice>(
    device: &mut D,
    fat: &mut FatTable,
    layout: &VolumeLayout,
) -> FatResult<()> {
    let bytes_per_sector = usize::from(layout.bytes_per_sector);
    let dirty = fat.take_dirty_sectors();
    for index in dirty {
        let chunk = &fat.data()[index * bytes_per_sector..(index + 1) * bytes_per_sector];
        for copy in 0..u32::from(layout.fat_count) {
            let sector = layout.fat_start()
                + copy * u32::from(layout.sectors_per_fat)
                + u32::try_from(index).unwrap();
            device.write_block(usize::try_from(sector).unwrap(), chunk)?;
        }
    }
    Ok(())
}

/// Number of clusters needed to hold `size` bytes.
fn clusters_spanned(size: u64, bytes_per_cluster: u32) -> u64 {
    size.div_ceil(u64::from(bytes_per_cluster))
}

/// Length of an allocated cluster chain, 0 for the null cluster.
fn chain_len(fat: &FatTable, first: Cluster) -> FatResult<u64> {
    if first.is_free() {
        return Ok(0);
    }
    let mut count = 0;
    for cluster in fat.chain_iter(first) {
        cluster?;
        count += 1;
    }
    Ok(count)
}

/// Appends zeroes to a file until it reaches `target` bytes.
fn zero_extend<T: FatEntries>(
    file: &mut FatFile<'_, T>,
    target: u64,
    write_data: RefDataWriter<'_>,
) -> FatResult<()> {
    file.seek(file.size())?;
    let zeros = [0u8; 512];
    while file.size() < target {
        let gap = target - file.size();
        let chunk = usize::try_from(gap.min(512)).unwrap();
        file.write(&zeros[..chunk], &mut *write_data)?;
    }
    Ok(())
}

impl<D: BlockDevice, T: TimeProvider> FileSystem for FatFs<D, T> {
    fn create(&mut self, path: Path) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::AlreadyExists);
        }
        let (dir, leaf) = self.resolve_parent(path)?;
        if self.find_in_dir(dir, leaf)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        self.insert_entry(dir, leaf, Attributes::new(Attributes::ARCHIVE), Cluster::new(0), 0)
    }

    fn remove(&mut self, path: Path) -> FsResult<()> {
        let (dir, entry) = match self.locate(path)? {
            Location::Root => return Err(FsError::IsADirectory),
            Location::Entry { parent, entry } => (parent, entry),
        };
        if entry.entry.is_directory() {
            return Err(FsError::IsADirectory);
        }
        let first = entry.entry.first_cluster(self.layout.fat_type);
        // Unlink the name first so a crash cannot expose freed clusters.
        self.delete_record(dir, &entry)?;
        if !first.is_free() {
            self.fat.free_cluster_chain(first)?;
        }
        let Self { device, fat, layout, .. } = self;
        flush_fat(device, fat, layout)?;
        Ok(())
    }

    fn exists(&mut self, path: Path) -> FsResult<bool> {
        match self.locate(path) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn mkdir(&mut self, path: Path) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::AlreadyExists);
        }
        let (dir, leaf) = self.resolve_parent(path)?;
        if self.find_in_dir(dir, leaf)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let now = self.clock.get_current_date_time();
        let fat_type = self.layout.fat_type;
        let parent_first = match dir {
            DirStorage::Root => Cluster::new(0),
            DirStorage::Chain(cluster) => cluster,
        };

        let Self { device, fat, layout, .. } = self;
        let fresh = fat.alloc_cluster()?;
        if let Err(e) = zero_cluster(device, layout, fresh) {
            fat.free_cluster(fresh)?;
            return Err(e.into());
        }

        // Seed the fixed dot entries before the directory becomes reachable.
        let mut dot =
            DirEntry::init(DirEntry::DOT_ENTRY, Attributes::new(Attributes::DIRECTORY), now);
        dot.set_first_cluster(fresh, fat_type);
        write_dir_slot(device, fat, layout, DirStorage::Chain(fresh), 0, dot.as_bytes())?;

        let mut dotdot =
            DirEntry::init(DirEntry::DOTDOT_ENTRY, Attributes::new(Attributes::DIRECTORY), now);
        dotdot.set_first_cluster(parent_first, fat_type);
        write_dir_slot(device, fat, layout, DirStorage::Chain(fresh), 1, dotdot.as_bytes())?;

        self.insert_entry(dir, leaf, Attributes::new(Attributes::DIRECTORY), fresh, 0)
    }

    fn rmdir(&mut self, path: Path) -> FsResult<()> {
        let (dir, entry) = match self.locate(path)? {
            Location::Root => return Err(FsError::InvalidPath),
            Location::Entry { parent, entry } => (parent, entry),
        };
        if !entry.entry.is_directory() {
            return Err(FsError::NotADirectory);
        }
        let first = entry.entry.first_cluster(self.layout.fat_type);
        if !self.dir_is_empty(DirStorage::Chain(first))? {
            return Err(FsError::DirectoryNotEmpty);
        }
        self.delete_record(dir, &entry)?;
        if !first.is_free() {
            self.fat.free_cluster_chain(first)?;
        }
        let Self { device, fat, layout, .. } = self;
        flush_fat(device, fat, layout)?;
        Ok(())
    }

    fn rename(&mut self, from: Path, to: Path, overwrite: bool) -> FsResult<()> {
        if from.as_str() == to.as_str() {
            return Ok(());
        }
        // A directory cannot move into its own subtree.
        if to.as_str().starts_with(from.as_str())
            && to.as_str().as_bytes().get(from.len()) == Some(&b'/')
        {
            return Err(FsError::InvalidPath);
        }

        let (from_dir, src) = match self.locate(from)? {
            Location::Root => return Err(FsError::InvalidPath),
            Location::Entry { parent, entry } => (parent, entry),
        };
        let (to_dir, to_leaf) = self.resolve_parent(to)?;
        let fat_type = self.layout.fat_type;
        let src_first = src.entry.first_cluster(fat_type);

        let mut removed_src = false;
        if let Some(target) = self.find_in_dir(to_dir, to_leaf)? {
            if !overwrite {
                return Err(FsError::AlreadyExists);
            }
            if to_dir == from_dir && target.slot == src.slot {
                // Case-only rename. The re-cased insert would collide with
                // the record's own alias, so the usual insert-before-delete
                // order is inverted: a reset in the window leaves the name
                // absent and its clusters leaked, nothing dangles.
                self.delete_record(from_dir, &src)?;
                removed_src = true;
            } else {
                let target_first = target.entry.first_cluster(fat_type);
                if target.entry.is_directory() {
                    if !src.entry.is_directory() {
                        return Err(FsError::IsADirectory);
                    }
                    if !self.dir_is_empty(DirStorage::Chain(target_first))? {
                        return Err(FsError::DirectoryNotEmpty);
                    }
                } else if src.entry.is_directory() {
                    return Err(FsError::NotADirectory);
                }
                self.delete_record(to_dir, &target)?;
                if !target_first.is_free() {
                    self.fat.free_cluster_chain(target_first)?;
                }
            }
        }

        // The new record is written before the old one is removed, so a
        // reset in between leaves the entry reachable under some name.
        self.insert_record(to_dir, to_leaf, src.entry)?;
        if !removed_src {
            self.delete_record(from_dir, &src)?;
        }

        if src.entry.is_directory() && to_dir != from_dir && !src_first.is_free() {
            let parent_first = match to_dir {
                DirStorage::Root => Cluster::new(0),
                DirStorage::Chain(cluster) => cluster,
            };
            self.repoint_dotdot(DirStorage::Chain(src_first), parent_first)?;
        }

        let Self { device, fat, layout, .. } = self;
        flush_fat(device, fat, layout)?;
        Ok(())
    }

    fn metadata(&mut self, path: Path) -> FsResult<Metadata> {
        match self.locate(path)? {
            Location::Root => Ok(Metadata::new(
                0,
                FileType::Directory,
                false,
                EPOCH_2000,
                EPOCH_2000,
                EPOCH_2000,
            )),
            Location::Entry { entry, .. } => {
                let entry = &entry.entry;
                let file_type =
                    if entry.is_directory() { FileType::Directory } else { FileType::File };
                Ok(Metadata::new(
                    usize::try_from(entry.file_size()).unwrap(),
                    file_type,
                    entry.attributes().is_read_only(),
                    entry.last_access_datetime().to_unix(),
                    entry.last_write_datetime().to_unix(),
                    entry.creation_datetime().to_unix(),
                ))
            }
        }
    }

    fn read_dir(&mut self, path: Path, index: usize) -> FsResult<Option<DirEntryInfo>> {
        let dir = match self.locate(path)? {
            Location::Root => DirStorage::Root,
            Location::Entry { entry, .. } => {
                if !entry.entry.is_directory() {
                    return Err(FsError::NotADirectory);
                }
                DirStorage::Chain(entry.entry.first_cluster(self.layout.fat_type))
            }
        };

        let Self { device, fat, layout, .. } = self;
        let mut read = |slot: u32| read_dir_slot(device, fat, layout, dir, slot);
        let mut scan = DirScan::new();
        let mut ordinal = 0usize;
        while let Some(entry) = scan.next_entry(&mut read)? {
            if entry.is_dot() {
                continue;
            }
            if ordinal == index {
                let file_type =
                    if entry.entry.is_directory() { FileType::Directory } else { FileType::File };
                let size = usize::try_from(entry.entry.file_size()).unwrap();
                return Ok(Some(DirEntryInfo::new(entry.name, file_type, size)));
            }
            ordinal += 1;
        }
        Ok(None)
    }

    fn read(&mut self, path: Path, buffer: &mut [u8], offset: usize) -> FsResult<usize> {
        let entry = match self.locate(path)? {
            Location::Root => return Err(FsError::IsADirectory),
            Location::Entry { entry, .. } => entry,
        };
        if entry.entry.is_directory() {
            return Err(FsError::IsADirectory);
        }
        let first = entry.entry.first_cluster(self.layout.fat_type);
        let size = u64::from(entry.entry.file_size());

        let Self { device, fat, layout, .. } = self;
        let mut read_data = |cluster: Cluster, within: u32, buf: &mut [u8]| {
            read_cluster_bytes(device, layout, cluster, within, buf)
        };
        let mut file = FatFile::new(fat, first, size, layout.bytes_per_cluster())?;
        file.seek(u64::try_from(offset).unwrap())?;
        Ok(file.read(buffer, &mut read_data)?)
    }

    fn write(&mut self, path: Path, buffer: &[u8], offset: usize) -> FsResult<usize> {
        let (dir, entry) = match self.locate(path)? {
            Location::Root => return Err(FsError::IsADirectory),
            Location::Entry { parent, entry } => (parent, entry),
        };
        if entry.entry.is_directory() {
            return Err(FsError::IsADirectory);
        }
        if buffer.is_empty() {
            return Ok(0);
        }
        let end = offset.checked_add(buffer.len()).ok_or(FsError::Full)?;
        if u64::try_from(end).unwrap() > u64::from(u32::MAX) {
            return Err(FsError::Full);
        }

        let fat_type = self.layout.fat_type;
        let first = entry.entry.first_cluster(fat_type);
        let size = u64::from(entry.entry.file_size());
        let now = self.clock.get_current_date_time();
        let offset = u64::try_from(offset).unwrap();

        let Self { device, fat, layout, .. } = self;

        // Refuse writes that cannot fully fit, so a failed call leaves no
        // half-grown chain behind.
        let end_size = size.max(u64::try_from(end).unwrap());
        let need = clusters_spanned(end_size, layout.bytes_per_cluster());
        if need > chain_len(fat, first)? + u64::from(fat.free_count()) {
            return Err(FsError::Full);
        }

        let mut write_data = |cluster: Cluster, within: u32, data: &[u8]| {
            write_cluster_bytes(device, layout, cluster, within, data)
        };
        let mut file = FatFile::new(fat, first, size, layout.bytes_per_cluster())?;
        if offset > file.size() {
            zero_extend(&mut file, offset, &mut write_data)?;
        } else {
            file.seek(offset)?;
        }
        file.write(buffer, &mut write_data)?;
        let new_first = file.first_cluster();
        let new_size = file.size();

        // New clusters reach the FAT before the entry references them.
        flush_fat(device, fat, layout)?;

        let mut updated = entry.entry;
        updated.set_first_cluster(new_first, fat_type);
        updated.set_file_size(u32::try_from(new_size).unwrap());
        updated.set_last_write_datetime(now);
        write_dir_slot(device, fat, layout, dir, entry.slot, updated.as_bytes())?;
        Ok(buffer.len())
    }

    fn truncate(&mut self, path: Path, size: usize) -> FsResult<()> {
        let (dir, entry) = match self.locate(path)? {
            Location::Root => return Err(FsError::IsADirectory),
            Location::Entry { parent, entry } => (parent, entry),
        };
        if entry.entry.is_directory() {
            return Err(FsError::IsADirectory);
        }
        let target = u64::try_from(size).unwrap();
        if target > u64::from(u32::MAX) {
            return Err(FsError::Full);
        }
        let fat_type = self.layout.fat_type;
        let first = entry.entry.first_cluster(fat_type);
        let current = u64::from(entry.entry.file_size());
        if target == current {
            return Ok(());
        }
        let now = self.clock.get_current_date_time();

        let Self { device, fat, layout, .. } = self;
        let growing = target > current;
        if growing {
            let need = clusters_spanned(target, layout.bytes_per_cluster());
            if need > chain_len(fat, first)? + u64::from(fat.free_count()) {
                return Err(FsError::Full);
            }
        }

        let mut file = FatFile::new(fat, first, current, layout.bytes_per_cluster())?;
        if growing {
            let mut write_data = |cluster: Cluster, within: u32, data: &[u8]| {
                write_cluster_bytes(device, layout, cluster, within, data)
            };
            zero_extend(&mut file, target, &mut write_data)?;
        } else {
            file.truncate(target)?;
        }
        let new_first = file.first_cluster();

        let mut updated = entry.entry;
        updated.set_first_cluster(new_first, fat_type);
        updated.set_file_size(u32::try_from(target).unwrap());
        updated.set_last_write_datetime(now);

        if growing {
            // New clusters reach the FAT before the entry references them.
            flush_fat(device, fat, layout)?;
            write_dir_slot(device, fat, layout, dir, entry.slot, updated.as_bytes())?;
        } else {
            // The shrunken size is visible before the clusters are reusable.
            write_dir_slot(device, fat, layout, dir, entry.slot, updated.as_bytes())?;
            flush_fat(device, fat, layout)?;
        }
        Ok(())
    }

    fn volume_stats(&mut self) -> FsResult<VolumeStats> {
        Ok(VolumeStats::new(
            usize::try_from(self.layout.bytes_per_cluster()).unwrap(),
            usize::try_from(self.layout.cluster_count).unwrap(),
            usize::try_from(self.fat.free_count()).unwrap(),
            MAX_NAME_LEN,
        ))
    }

    fn sync(&mut self) -> FsResult<()> {
        let Self { device, fat, layout, .. } = self;
        flush_fat(device, fat, layout)?;
        self.device.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::date::{Date, DateTime, Time};

    struct MemDisk {
        data: Vec<u8>,
        block_size: usize,
    }

    impl MemDisk {
        fn new(blocks: usize) -> Self {
            Self { data: vec![0u8; blocks * 512], block_size: 512 }
        }
    }

    impl BlockDevice for MemDisk {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn block_count(&self) -> usize {
            self.data.len() / self.block_size
        }

        fn read_block(&mut self, block: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
            if buf.len() != self.block_size {
                return Err(DeviceError::Unaligned);
            }
            let start = block * self.block_size;
            let Some(src) = self.data.get(start..start + self.block_size) else {
                return Err(DeviceError::OutOfBounds);
            };
            buf.copy_from_slice(src);
            Ok(())
        }

        fn write_block(&mut self, block: usize, data: &[u8]) -> Result<(), DeviceError> {
            if data.len() != self.block_size {
                return Err(DeviceError::Unaligned);
            }
            let start = block * self.block_size;
            let Some(dst) = self.data.get_mut(start..start + self.block_size) else {
                return Err(DeviceError::OutOfBounds);
            };
            dst.copy_from_slice(data);
            Ok(())
        }
    }

    fn fresh_fs(blocks: usize) -> FatFs<MemDisk> {
        let mut disk = MemDisk::new(blocks);
        FatFs::mkfs(&mut disk).unwrap();
        FatFs::mount(disk).unwrap()
    }

    #[test]
    fn mount_requires_a_boot_sector() {
        assert!(matches!(FatFs::mount(MemDisk::new(64)), Err(FsError::NoFilesystem)));
    }

    #[test]
    fn fat32_volumes_are_unsupported_not_absent() {
        let mut disk = MemDisk::new(256);
        FatFs::mkfs(&mut disk).unwrap();
        // Zero the 16-bit sectors-per-FAT field, the FAT32 marker.
        disk.data[22] = 0;
        disk.data[23] = 0;

        assert_eq!(FatFs::probe(&mut disk).unwrap_err(), FsError::Unsupported);
        assert!(matches!(FatFs::mount(disk), Err(FsError::Unsupported)));
    }

    #[test]
    fn mkfs_then_probe_roundtrips_the_layout() {
        let mut disk = MemDisk::new(256);
        FatFs::mkfs(&mut disk).unwrap();

        let layout = FatFs::probe(&mut disk).unwrap();
        assert_eq!(layout.fat_type, FatType::Fat12);
        assert_eq!(layout.total_sectors, 256);
        assert_eq!(layout.cluster_count, 245);
        assert_eq!(layout.data_start(), 11);

        // Boot sector signature lands at the end of the 512-byte record.
        assert_eq!(&disk.data[510..512], &BootSector::SIGNATURE);
    }

    #[test]
    fn larger_volumes_format_as_fat16() {
        let mut disk = MemDisk::new(20_000);
        FatFs::mkfs(&mut disk).unwrap();
        let layout = FatFs::probe(&mut disk).unwrap();
        assert_eq!(layout.fat_type, FatType::Fat16);

        let mut fs = FatFs::mount(disk).unwrap();
        fs.create("/a.bin".into()).unwrap();
        assert_eq!(fs.write("/a.bin".into(), &[7u8; 1000], 0).unwrap(), 1000);
        let mut buf = [0u8; 1000];
        assert_eq!(fs.read("/a.bin".into(), &mut buf, 0).unwrap(), 1000);
        assert_eq!(buf, [7u8; 1000]);
    }

    #[test]
    fn create_write_read_roundtrip() {
        let mut fs = fresh_fs(256);
        fs.create("/hello.txt".into()).unwrap();
        assert!(fs.exists("/hello.txt".into()).unwrap());

        let payload = b"hello fat volume";
        assert_eq!(fs.write("/hello.txt".into(), payload, 0).unwrap(), payload.len());

        let mut buf = [0u8; 32];
        let read = fs.read("/hello.txt".into(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..read], payload);

        let meta = fs.metadata("/hello.txt".into()).unwrap();
        assert_eq!(meta.size(), payload.len());
        assert!(!meta.is_dir());
    }

    #[test]
    fn missing_entries_report_not_found() {
        let mut fs = fresh_fs(256);
        let mut buf = [0u8; 8];
        assert_eq!(fs.read("/ghost.txt".into(), &mut buf, 0), Err(FsError::NotFound));
        assert!(!fs.exists("/ghost.txt".into()).unwrap());
        assert_eq!(fs.create("/nope/child.txt".into()), Err(FsError::NotFound));
    }

    #[test]
    fn the_root_is_a_directory() {
        let mut fs = fresh_fs(256);
        assert_eq!(fs.create("/".into()), Err(FsError::AlreadyExists));
        assert_eq!(fs.write("/".into(), b"x", 0), Err(FsError::IsADirectory));
        assert_eq!(fs.remove("/".into()), Err(FsError::IsADirectory));
        assert_eq!(fs.rmdir("/".into()), Err(FsError::InvalidPath));

        let meta = fs.metadata("/".into()).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.size(), 0);
        assert_eq!(meta.created(), EPOCH_2000);
    }

    #[test]
    fn nested_directories_and_listing() {
        let mut fs = fresh_fs(256);
        fs.mkdir("/docs".into()).unwrap();
        fs.mkdir("/docs/old".into()).unwrap();
        fs.create("/docs/a.txt".into()).unwrap();
        fs.create("/docs/b.txt".into()).unwrap();

        let mut names = Vec::new();
        let mut index = 0;
        while let Some(info) = fs.read_dir("/docs".into(), index).unwrap() {
            names.push(info.name().to_owned());
            index += 1;
        }
        // Dot entries are never reported.
        assert_eq!(names, ["old", "a.txt", "b.txt"]);
        assert!(fs.read_dir("/docs".into(), 3).unwrap().is_none());

        assert_eq!(fs.mkdir("/docs".into()), Err(FsError::AlreadyExists));
        assert_eq!(fs.read_dir("/docs/a.txt".into(), 0), Err(FsError::NotADirectory));
        assert_eq!(fs.metadata("/docs/a.txt/x".into()), Err(FsError::NotADirectory));
    }

    #[test]
    fn long_names_are_preserved_and_case_insensitive() {
        let mut fs = fresh_fs(256);
        fs.create("/Long Name With Spaces.document".into()).unwrap();

        let info = fs.read_dir("/".into(), 0).unwrap().unwrap();
        assert_eq!(info.name(), "Long Name With Spaces.document");

        assert!(fs.exists("/long name with spaces.DOCUMENT".into()).unwrap());
        assert_eq!(fs.create("/LONG NAME WITH SPACES.document".into()), Err(FsError::AlreadyExists));
    }

    #[test]
    fn colliding_short_aliases_stay_distinct() {
        let mut fs = fresh_fs(256);
        fs.create("/longfilename one.txt".into()).unwrap();
        fs.create("/longfilename two.txt".into()).unwrap();

        fs.write("/longfilename one.txt".into(), b"first", 0).unwrap();
        fs.write("/longfilename two.txt".into(), b"second", 0).unwrap();

        let mut buf = [0u8; 8];
        let n = fs.read("/longfilename one.txt".into(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = fs.read("/longfilename two.txt".into(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn remove_and_rmdir_enforce_types() {
        let mut fs = fresh_fs(256);
        fs.mkdir("/dir".into()).unwrap();
        fs.create("/dir/f.txt".into()).unwrap();

        assert_eq!(fs.remove("/dir".into()), Err(FsError::IsADirectory));
        assert_eq!(fs.rmdir("/dir/f.txt".into()), Err(FsError::NotADirectory));
        assert_eq!(fs.rmdir("/dir".into()), Err(FsError::DirectoryNotEmpty));

        fs.remove("/dir/f.txt".into()).unwrap();
        assert!(!fs.exists("/dir/f.txt".into()).unwrap());
        fs.rmdir("/dir".into()).unwrap();
        assert!(!fs.exists("/dir".into()).unwrap());

        // Everything the pair allocated is free again.
        let stats = fs.volume_stats().unwrap();
        assert_eq!(stats.free_blocks(), stats.total_blocks());
    }

    #[test]
    fn rename_moves_files_between_directories() {
        let mut fs = fresh_fs(256);
        fs.create("/a.txt".into()).unwrap();
        fs.write("/a.txt".into(), b"payload", 0).unwrap();

        fs.rename("/a.txt".into(), "/b.txt".into(), false).unwrap();
        assert!(!fs.exists("/a.txt".into()).unwrap());
        let mut buf = [0u8; 16];
        let n = fs.read("/b.txt".into(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"payload");

        fs.mkdir("/d".into()).unwrap();
        fs.rename("/b.txt".into(), "/d/c.txt".into(), false).unwrap();
        let n = fs.read("/d/c.txt".into(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn rename_overwrite_replaces_the_target() {
        let mut fs = fresh_fs(256);
        fs.create("/src.txt".into()).unwrap();
        fs.write("/src.txt".into(), b"new", 0).unwrap();
        fs.create("/dst.txt".into()).unwrap();
        fs.write("/dst.txt".into(), &[0xAA; 1500], 0).unwrap();

        assert_eq!(
            fs.rename("/src.txt".into(), "/dst.txt".into(), false),
            Err(FsError::AlreadyExists)
        );
        fs.rename("/src.txt".into(), "/dst.txt".into(), true).unwrap();

        let mut buf = [0u8; 8];
        let n = fs.read("/dst.txt".into(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"new");
        assert!(!fs.exists("/src.txt".into()).unwrap());

        // The replaced file's clusters were released, only one cluster of
        // payload remains in use.
        let stats = fs.volume_stats().unwrap();
        assert_eq!(stats.free_blocks(), stats.total_blocks() - 1);
    }

    #[test]
    fn rename_can_change_only_the_case() {
        let mut fs = fresh_fs(256);
        fs.create("/readme.txt".into()).unwrap();
        fs.write("/readme.txt".into(), b"body", 0).unwrap();

        // Lookups are case-insensitive, so this resolves to the same record
        // and needs the overwrite flag.
        assert_eq!(
            fs.rename("/readme.txt".into(), "/README.txt".into(), false),
            Err(FsError::AlreadyExists)
        );
        fs.rename("/readme.txt".into(), "/README.txt".into(), true).unwrap();

        let info = fs.read_dir("/".into(), 0).unwrap().unwrap();
        assert_eq!(info.name(), "README.txt");
        let mut buf = [0u8; 8];
        let n = fs.read("/readme.txt".into(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"body");
    }

    #[test]
    fn rename_rejects_moving_a_directory_into_itself() {
        let mut fs = fresh_fs(256);
        fs.mkdir("/x".into()).unwrap();
        fs.mkdir("/x/sub".into()).unwrap();
        assert_eq!(fs.rename("/x".into(), "/x/sub2".into(), false), Err(FsError::InvalidPath));
        // A sibling whose name shares the prefix is fine.
        fs.mkdir("/xy".into()).unwrap();
        fs.rename("/xy".into(), "/x/xy".into(), false).unwrap();
    }

    #[test]
    fn renaming_a_directory_rewrites_its_parent_link() {
        let mut fs = fresh_fs(256);
        fs.mkdir("/y".into()).unwrap();
        fs.mkdir("/y/sub".into()).unwrap();
        fs.rename("/y/sub".into(), "/sub".into(), false).unwrap();
        fs.sync().unwrap();

        // `/y` took cluster 2 and `/y/sub` cluster 3, one sector each.
        let mut disk = fs.into_inner();
        let layout = FatFs::probe(&mut disk).unwrap();
        let sector = usize::try_from(layout.data_start()).unwrap() + 1;
        let mut buf = vec![0u8; 512];
        disk.read_block(sector, &mut buf).unwrap();
        assert_eq!(&buf[32..34], b"..");
        // The `..` entry now points at the root.
        assert_eq!(&buf[58..60], &0u16.to_le_bytes());
    }

    #[test]
    fn sparse_writes_zero_fill_the_gap() {
        let mut fs = fresh_fs(256);
        fs.create("/gap.bin".into()).unwrap();
        fs.write("/gap.bin".into(), b"tail", 2000).unwrap();

        assert_eq!(fs.metadata("/gap.bin".into()).unwrap().size(), 2004);
        let mut buf = vec![0xFFu8; 2004];
        assert_eq!(fs.read("/gap.bin".into(), &mut buf, 0).unwrap(), 2004);
        assert!(buf[..2000].iter().all(|&b| b == 0));
        assert_eq!(&buf[2000..], b"tail");
    }

    #[test]
    fn reads_stop_at_the_end_of_file() {
        let mut fs = fresh_fs(256);
        fs.create("/small.txt".into()).unwrap();
        fs.write("/small.txt".into(), b"abc", 0).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(fs.read("/small.txt".into(), &mut buf, 2).unwrap(), 1);
        assert_eq!(buf[0], b'c');
        assert_eq!(fs.read("/small.txt".into(), &mut buf, 3).unwrap(), 0);
        assert_eq!(fs.read("/small.txt".into(), &mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn truncate_shrinks_and_extends() {
        let mut fs = fresh_fs(256);
        fs.create("/t.bin".into()).unwrap();
        fs.write("/t.bin".into(), &[0x5A; 3000], 0).unwrap();
        let full = fs.volume_stats().unwrap().free_blocks();

        fs.truncate("/t.bin".into(), 100).unwrap();
        assert_eq!(fs.metadata("/t.bin".into()).unwrap().size(), 100);
        // Shrinking released five of the six clusters.
        assert_eq!(fs.volume_stats().unwrap().free_blocks(), full + 5);

        fs.truncate("/t.bin".into(), 600).unwrap();
        let mut buf = [0u8; 600];
        assert_eq!(fs.read("/t.bin".into(), &mut buf, 0).unwrap(), 600);
        assert!(buf[..100].iter().all(|&b| b == 0x5A));
        assert!(buf[100..].iter().all(|&b| b == 0));

        fs.truncate("/t.bin".into(), 0).unwrap();
        assert_eq!(fs.metadata("/t.bin".into()).unwrap().size(), 0);
    }

    #[test]
    fn full_volumes_reject_writes_without_leaking() {
        let mut fs = fresh_fs(64);
        fs.create("/big.bin".into()).unwrap();
        let capacity = fs.volume_stats().unwrap().free_bytes();

        let too_big = vec![0xA5u8; capacity + 512];
        assert_eq!(fs.write("/big.bin".into(), &too_big, 0), Err(FsError::Full));
        // The failed write must not consume any cluster.
        assert_eq!(fs.volume_stats().unwrap().free_bytes(), capacity);

        let fits = vec![0x5Au8; capacity];
        assert_eq!(fs.write("/big.bin".into(), &fits, 0).unwrap(), capacity);
        assert_eq!(fs.volume_stats().unwrap().free_bytes(), 0);

        fs.remove("/big.bin".into()).unwrap();
        assert_eq!(fs.volume_stats().unwrap().free_bytes(), capacity);
    }

    #[test]
    fn state_survives_a_remount() {
        let mut fs = fresh_fs(256);
        fs.mkdir("/persist".into()).unwrap();
        fs.create("/persist/data.bin".into()).unwrap();
        fs.write("/persist/data.bin".into(), &[0xC3; 1200], 0).unwrap();
        fs.sync().unwrap();
        let free = fs.volume_stats().unwrap().free_blocks();

        let mut fs = FatFs::mount(fs.into_inner()).unwrap();
        assert_eq!(fs.volume_stats().unwrap().free_blocks(), free);
        let mut buf = vec![0u8; 1200];
        assert_eq!(fs.read("/persist/data.bin".into(), &mut buf, 0).unwrap(), 1200);
        assert!(buf.iter().all(|&b| b == 0xC3));

        let info = fs.read_dir("/".into(), 0).unwrap().unwrap();
        assert_eq!(info.name(), "persist");
    }

    struct FixedClock;

    impl TimeProvider for FixedClock {
        fn get_current_date(&self) -> Date {
            Date::new(2024, 6, 1)
        }

        fn get_current_time(&self) -> Time {
            Time::new(12, 30, 0)
        }
    }

    #[test]
    fn timestamps_come_from_the_clock() {
        let mut disk = MemDisk::new(256);
        FatFs::mkfs(&mut disk).unwrap();
        let mut fs = FatFs::mount_with_clock(disk, FixedClock).unwrap();

        fs.create("/stamped.txt".into()).unwrap();
        fs.write("/stamped.txt".into(), b"x", 0).unwrap();

        let expected = DateTime::new(Date::new(2024, 6, 1), Time::new(12, 30, 0)).to_unix();
        let meta = fs.metadata("/stamped.txt".into()).unwrap();
        assert_eq!(meta.created(), expected);
        assert_eq!(meta.modified(), expected);
    }

    #[test]
    fn files_spanning_many_clusters_read_back() {
        let mut fs = fresh_fs(256);
        fs.create("/span.bin".into()).unwrap();

        let mut payload = vec![0u8; 5000];
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte = u8::try_from(index % 251).unwrap();
        }
        assert_eq!(fs.write("/span.bin".into(), &payload, 0).unwrap(), 5000);

        // Unaligned read crossing several cluster boundaries.
        let mut buf = vec![0u8; 3000];
        assert_eq!(fs.read("/span.bin".into(), &mut buf, 700).unwrap(), 3000);
        assert_eq!(buf, payload[700..3700]);

        // Overwrite in the middle without changing the size.
        fs.write("/span.bin".into(), &[0u8; 100], 1000).unwrap();
        assert_eq!(fs.metadata("/span.bin".into()).unwrap().size(), 5000);
    }
}
