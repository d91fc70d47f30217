use super::FatType;
use flint_core::static_assert;

/// Size of one directory entry on disk.
const DIR_ENTRY_SIZE: usize = super::dirent::DIR_ENTRY_SIZE;

/// BIOS Parameter Block (BPB) start.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct BootParamBlockStart {
    /// Bytes per sector.
    ///
    /// This field is either 512, 1024, 2048, or 4096.
    bytes_per_sector: u16,
    /// Sectors per cluster.
    sectors_per_cluster: u8,
    /// Reserved sectors.
    reserved_sectors: u16,
    /// Number of FATs.
    fat_count: u8,
    root_entries: u16,
    /// Total sectors in the file system.
    ///
    /// If the total number of sectors exceeds `u16::MAX`, this field is set to 0
    /// and one should use `total_sectors_large` instead.
    total_sectors: u16,
    /// Media descriptor.
    ///
    /// Example: 0xF8 for fixed disk and 0xF0 for removable disk.
    media_descriptor: u8,
    /// Sectors per FAT.
    ///
    /// Zero on FAT32 file systems.
    sectors_per_fat: u16,
    /// Sectors per track.
    sectors_per_track: u16,
    /// Number of heads.
    heads: u16,
    /// Hidden sectors.
    hidden_sectors: u32,
    /// Total sectors in the file system.
    ///
    /// This field is used when `total_sectors` is set to 0.
    total_sectors_large: u32,
}

/// BIOS Parameter Block (BPB) end.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct BootParamBlockEnd {
    /// Logical drive number.
    drive_number: u8,
    /// Reserved.
    _reserved: u8,
    /// Extended boot signature, 0x29 when the fields below are present.
    boot_flag: u8,
    /// Volume serial number.
    volume_id: u32,
    /// Volume label.
    volume_label: [u8; 11],
    /// File system type.
    fs_type: [u8; 8],
}

/// BIOS Parameter Block (BPB) for FAT12/16 file systems.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct BootParamBlock {
    bpb_start: BootParamBlockStart,
    bpb_end: BootParamBlockEnd,
}
static_assert!(size_of::<BootParamBlock>() == 51);

impl BootParamBlock {
    #[must_use]
    #[inline]
    /// Returns the number of bytes per sector.
    pub const fn bytes_per_sector(&self) -> u16 {
        self.bpb_start.bytes_per_sector
    }

    #[must_use]
    #[inline]
    /// Returns the number of sectors per cluster.
    pub const fn sectors_per_cluster(&self) -> u8 {
        self.bpb_start.sectors_per_cluster
    }

    #[must_use]
    #[inline]
    /// Returns the number of reserved sectors.
    pub const fn reserved_sectors(&self) -> u16 {
        self.bpb_start.reserved_sectors
    }

    #[must_use]
    #[inline]
    /// Returns the number of FATs.
    pub const fn fat_count(&self) -> u8 {
        self.bpb_start.fat_count
    }

    #[must_use]
    #[inline]
    /// Returns the number of root directory entries.
    pub const fn root_entries(&self) -> u16 {
        self.bpb_start.root_entries
    }

    #[must_use]
    #[inline]
    /// Returns the number of sectors in the file system.
    pub fn total_sectors(&self) -> u32 {
        if self.bpb_start.total_sectors != 0 {
            u32::from(self.bpb_start.total_sectors)
        } else {
            self.bpb_start.total_sectors_large
        }
    }

    #[must_use]
    #[inline]
    /// Returns the media descriptor.
    pub const fn media_descriptor(&self) -> u8 {
        self.bpb_start.media_descriptor
    }

    #[must_use]
    #[inline]
    /// Returns the number of sectors per FAT.
    ///
    /// This value is only valid for FAT12 and FAT16 file systems.
    pub const fn sectors_per_fat(&self) -> u16 {
        self.bpb_start.sectors_per_fat
    }

    #[must_use]
    #[inline]
    pub const fn is_fat32(&self) -> bool {
        // This field must be zero on FAT32 file systems
        // and non-zero on FAT12 and FAT16 file systems.
        self.sectors_per_fat() == 0
    }

    #[must_use]
    #[inline]
    /// Returns the number of bytes per cluster.
    pub fn bytes_per_cluster(&self) -> u32 {
        u32::from(self.bytes_per_sector()) * u32::from(self.sectors_per_cluster())
    }

    #[must_use]
    pub fn validate(&self) -> bool {
        /// Maximum bytes per cluster for maximum compatibility.
        const MAX_BYTES_PER_CLUSTER: u32 = 32 * 1024; // 32 KiB
        /// Maximum number of supported FAT
        const MAX_FAT_COUNT: u8 = 2;

        // Check bytes per sector
        if !self.bytes_per_sector().is_power_of_two()
            || self.bytes_per_sector() < 512
            || self.bytes_per_sector() > 4096
        {
            return false;
        }

        // Check sectors per cluster
        if !self.sectors_per_cluster().is_power_of_two()
            || self.bytes_per_cluster() > MAX_BYTES_PER_CLUSTER
        {
            return false;
        }

        // Check reserved sectors
        if self.reserved_sectors() == 0 {
            return false;
        }

        // Check FAT count
        if self.fat_count() == 0 || self.fat_count() > MAX_FAT_COUNT {
            return false;
        }

        // Check root entries (zero means FAT32, not supported here)
        if self.root_entries() == 0
            || (usize::from(self.root_entries()) * DIR_ENTRY_SIZE
                % usize::from(self.bytes_per_sector())
                != 0)
        {
            return false;
        }

        // Check total sectors
        if self.total_sectors() == 0 {
            return false;
        }

        // Check sectors per FAT
        if self.sectors_per_fat() == 0 {
            return false;
        }

        true
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct BootSector {
    /// Jump instruction.
    boot_jump: [u8; 3],
    /// OEM name.
    oem_name: [u8; 8],
    /// Boot Parameter Block (BPB).
    bpb: BootParamBlock,
    boot_code: [u8; 448],
    /// Boot signature.
    boot_signature: [u8; 2],
}
static_assert!(
    size_of::<BootSector>() == 512,
    "BootSector size is not 512 bytes"
);

impl BootSector {
    /// Two-byte marker closing every valid boot sector.
    pub const SIGNATURE: [u8; 2] = [0x55, 0xAA];

    /// Reads a boot sector from the first 512 bytes of `bytes`.
    ///
    /// Returns `None` if the buffer is too short or the 0x55AA signature
    /// is missing.
    #[must_use]
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<Self>() {
            return None;
        }
        // SAFETY: The buffer is large enough and the packed layout has an
        // alignment of 1.
        let sector = unsafe { bytes.as_ptr().cast::<Self>().read() };
        (sector.boot_signature == Self::SIGNATURE).then_some(sector)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: The struct is `repr(C, packed)`, so any byte pattern is valid.
        unsafe { core::slice::from_raw_parts((&raw const *self).cast::<u8>(), size_of::<Self>()) }
    }

    #[must_use]
    #[inline]
    pub const fn bpb(&self) -> &BootParamBlock {
        &self.bpb
    }

    /// Assembles a boot sector for a freshly formatted volume.
    #[must_use]
    pub fn build(layout: &VolumeLayout, volume_id: u32) -> Self {
        let fs_type = match layout.fat_type {
            FatType::Fat12 => *b"FAT12   ",
            FatType::Fat16 => *b"FAT16   ",
            FatType::Fat32 => *b"FAT32   ",
        };
        let (total_small, total_large) = if layout.total_sectors <= u32::from(u16::MAX) {
            (u16::try_from(layout.total_sectors).unwrap_or(0), 0)
        } else {
            (0, layout.total_sectors)
        };
        Self {
            boot_jump: [0xEB, 0x3C, 0x90],
            oem_name: *b"FLINTFS ",
            bpb: BootParamBlock {
                bpb_start: BootParamBlockStart {
                    bytes_per_sector: layout.bytes_per_sector,
                    sectors_per_cluster: layout.sectors_per_cluster,
                    reserved_sectors: layout.reserved_sectors,
                    fat_count: layout.fat_count,
                    root_entries: layout.root_entries,
                    total_sectors: total_small,
                    media_descriptor: MEDIA_DESCRIPTOR,
                    sectors_per_fat: layout.sectors_per_fat,
                    sectors_per_track: 63,
                    heads: 255,
                    hidden_sectors: 0,
                    total_sectors_large: total_large,
                },
                bpb_end: BootParamBlockEnd {
                    drive_number: 0x80,
                    _reserved: 0,
                    boot_flag: 0x29,
                    volume_id,
                    volume_label: *b"NO NAME    ",
                    fs_type,
                },
            },
            boot_code: [0; 448],
            boot_signature: Self::SIGNATURE,
        }
    }
}

/// Media descriptor written by mkfs (fixed disk).
pub const MEDIA_DESCRIPTOR: u8 = 0xF8;

/// Geometry of a FAT12/16 volume, either computed for a fresh format or
/// derived from an existing boot sector.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VolumeLayout {
    pub fat_type: FatType,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub sectors_per_fat: u16,
    pub root_entries: u16,
    pub total_sectors: u32,
    /// Number of data clusters (cluster numbers 2..2 + count).
    pub cluster_count: u32,
}

impl VolumeLayout {
    /// First sector of the first FAT copy.
    #[must_use]
    pub fn fat_start(&self) -> u32 {
        u32::from(self.reserved_sectors)
    }

    /// First sector of the root directory region.
    #[must_use]
    pub fn root_dir_start(&self) -> u32 {
        self.fat_start() + u32::from(self.fat_count) * u32::from(self.sectors_per_fat)
    }

    /// Number of sectors occupied by the root directory.
    #[must_use]
    pub fn root_dir_sectors(&self) -> u32 {
        u32::from(self.root_entries) * DIR_ENTRY_SIZE as u32 / u32::from(self.bytes_per_sector)
    }

    /// First sector of the data region (cluster 2).
    #[must_use]
    pub fn data_start(&self) -> u32 {
        self.root_dir_start() + self.root_dir_sectors()
    }

    /// Size of one allocation unit in bytes.
    #[must_use]
    pub fn bytes_per_cluster(&self) -> u32 {
        u32::from(self.bytes_per_sector) * u32::from(self.sectors_per_cluster)
    }

    /// Bytes required by one FAT copy.
    fn fat_bytes(fat_type: FatType, entries: u32) -> u32 {
        match fat_type {
            FatType::Fat12 => (entries * 3).div_ceil(2),
            FatType::Fat16 => entries * 2,
            FatType::Fat32 => entries * 4,
        }
    }

    const fn type_for_clusters(clusters: u32) -> Option<FatType> {
        if clusters < 4085 {
            Some(FatType::Fat12)
        } else if clusters < 65_525 {
            Some(FatType::Fat16)
        } else {
            None
        }
    }

    /// Computes the layout mkfs will write for a device of `total_sectors`
    /// sectors of `bytes_per_sector` bytes.
    ///
    /// Cluster size starts at one sector and doubles until the cluster
    /// count fits FAT16. Returns `None` for devices too small to hold any
    /// data cluster or too large for FAT16.
    #[must_use]
    pub fn compute(total_sectors: u32, bytes_per_sector: u16) -> Option<Self> {
        const RESERVED: u16 = 1;
        const FAT_COUNT: u8 = 2;

        if !bytes_per_sector.is_power_of_two()
            || !(512..=4096).contains(&bytes_per_sector)
            || total_sectors == 0
        {
            return None;
        }

        let root_entries: u16 = if total_sectors >= 1024 { 512 } else { 128 };
        let root_dir_sectors =
            u32::from(root_entries) * DIR_ENTRY_SIZE as u32 / u32::from(bytes_per_sector);

        let mut sectors_per_cluster: u32 = 1;
        while sectors_per_cluster * u32::from(bytes_per_sector) <= 32 * 1024
            && sectors_per_cluster <= 128
        {
            // Sectors per FAT and cluster count depend on each other; a
            // couple of fixpoint rounds settle both.
            let mut sectors_per_fat: u32 = 1;
            for _ in 0..16 {
                let overhead =
                    u32::from(RESERVED) + u32::from(FAT_COUNT) * sectors_per_fat + root_dir_sectors;
                if overhead >= total_sectors {
                    return None;
                }
                let clusters = (total_sectors - overhead) / sectors_per_cluster;
                if clusters == 0 {
                    return None;
                }
                let Some(fat_type) = Self::type_for_clusters(clusters) else {
                    // Too many clusters for FAT16, grow the cluster size.
                    break;
                };
                let needed = Self::fat_bytes(fat_type, clusters + 2)
                    .div_ceil(u32::from(bytes_per_sector));
                if needed == sectors_per_fat {
                    #[allow(clippy::cast_possible_truncation)]
                    return Some(Self {
                        fat_type,
                        bytes_per_sector,
                        sectors_per_cluster: sectors_per_cluster as u8,
                        reserved_sectors: RESERVED,
                        fat_count: FAT_COUNT,
                        sectors_per_fat: sectors_per_fat as u16,
                        root_entries,
                        total_sectors,
                        cluster_count: clusters,
                    });
                }
                sectors_per_fat = needed;
            }
            sectors_per_cluster *= 2;
        }
        None
    }

    /// Derives the layout of an existing volume from its BPB.
    ///
    /// Returns `None` if the BPB fails validation or describes a FAT32
    /// volume.
    #[must_use]
    pub fn from_bpb(bpb: &BootParamBlock) -> Option<Self> {
        if !bpb.validate() || bpb.is_fat32() {
            return None;
        }
        let root_dir_sectors = u32::from(bpb.root_entries()) * DIR_ENTRY_SIZE as u32
            / u32::from(bpb.bytes_per_sector());
        let overhead = u32::from(bpb.reserved_sectors())
            + u32::from(bpb.fat_count()) * u32::from(bpb.sectors_per_fat())
            + root_dir_sectors;
        if overhead >= bpb.total_sectors() {
            return None;
        }
        let clusters =
            (bpb.total_sectors() - overhead) / u32::from(bpb.sectors_per_cluster());
        let fat_type = Self::type_for_clusters(clusters)?;
        // The FAT must be large enough for every data cluster it claims.
        let fat_capacity = u32::from(bpb.sectors_per_fat()) * u32::from(bpb.bytes_per_sector());
        if Self::fat_bytes(fat_type, clusters + 2) > fat_capacity {
            return None;
        }
        Some(Self {
            fat_type,
            bytes_per_sector: bpb.bytes_per_sector(),
            sectors_per_cluster: bpb.sectors_per_cluster(),
            reserved_sectors: bpb.reserved_sectors(),
            fat_count: bpb.fat_count(),
            sectors_per_fat: bpb.sectors_per_fat(),
            root_entries: bpb.root_entries(),
            total_sectors: bpb.total_sectors(),
            cluster_count: clusters,
        })
    }
}
