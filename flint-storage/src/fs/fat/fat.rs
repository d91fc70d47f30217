use crate::fs::fat::{Cluster, FatError, FatResult, FatType};
use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// FAT12/16/32 table entry
pub enum FatEntry {
    /// Free cluster
    Free,
    /// Used cluster, pointing to the next cluster in the chain
    Next(Cluster),
    /// Last cluster in the chain
    EndOfChain,
    /// Bad cluster
    Bad,
    /// Reserved cluster
    Reserved,
}

/// Collection of FAT entries
pub trait FatEntries {
    #[must_use]
    /// Returns the type of FAT (FAT12, FAT16, FAT32)
    fn fat_type(&self) -> FatType;

    /// Returns the entry value for the given cluster
    fn get(&self, cluster: Cluster) -> FatResult<FatEntry>;

    /// Sets the entry value for the given cluster
    fn set(&mut self, cluster: Cluster, entry: FatEntry) -> FatResult<()>;

    /// Returns the number of entries, including the two reserved ones.
    fn entry_count(&self) -> u32;

    #[must_use]
    /// Returns an iterator over all clusters in a chain starting from the given cluster.
    ///
    /// The iterator is step-bounded by the entry count, so a cyclic or
    /// cross-linked chain yields [`FatError::CorruptedChain`] instead of
    /// looping forever.
    fn chain_iter(&self, start: Cluster) -> FatChainIter<'_, Self>
    where
        Self: Sized,
    {
        FatChainIter {
            fat: self,
            next: Some(start),
            remaining: self.entry_count(),
        }
    }

    /// Returns the `n`-th cluster of the chain starting at `start`.
    fn nth_cluster(&self, start: Cluster, n: usize) -> FatResult<Option<Cluster>>
    where
        Self: Sized,
    {
        for (i, cluster) in self.chain_iter(start).enumerate() {
            let cluster = cluster?;
            if i == n {
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    /// Allocates a new cluster and returns its number
    fn alloc_cluster(&mut self) -> FatResult<Cluster>;

    /// Allocates a chain of clusters and returns the first cluster number
    fn alloc_cluster_chain(&mut self, count: usize) -> FatResult<Cluster>;

    /// Frees a cluster
    fn free_cluster(&mut self, cluster: Cluster) -> FatResult<()>;

    /// Frees a chain of clusters starting from the given cluster
    fn free_cluster_chain(&mut self, start: Cluster) -> FatResult<()>;

    /// Counts the number of free clusters
    fn count_free(&self) -> FatResult<u32>;
}

/// Iterator over a chain of clusters
pub struct FatChainIter<'a, T: FatEntries> {
    fat: &'a T,
    next: Option<Cluster>,
    remaining: u32,
}

impl<T: FatEntries> Iterator for FatChainIter<'_, T> {
    type Item = FatResult<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;

        if self.remaining == 0 {
            // More steps than the table has entries: the chain loops.
            self.next = None;
            return Some(Err(FatError::CorruptedChain));
        }
        self.remaining -= 1;

        // Get the next cluster in the chain
        match self.fat.get(current) {
            Ok(FatEntry::Next(next)) => self.next = Some(next),
            Ok(FatEntry::EndOfChain) => self.next = None,
            Ok(FatEntry::Free | FatEntry::Bad | FatEntry::Reserved) => {
                // A live chain must not run into an unallocated entry.
                self.next = None;
                return Some(Err(FatError::CorruptedChain));
            }
            Err(err) => {
                self.next = None;
                return Some(Err(err));
            }
        }

        Some(Ok(current))
    }
}

/// FAT12 entry handling
pub(crate) mod fat12 {
    use super::{Cluster, FatEntry, FatError, FatResult};

    pub fn read_fat_entry(fat: &[u8], cluster: Cluster) -> FatResult<FatEntry> {
        let cluster_val = usize::try_from(cluster.value()).map_err(|_| FatError::OutOfBounds)?;
        let offset = cluster_val + (cluster_val / 2); // 3 bytes per 2 entries

        if offset + 1 >= fat.len() {
            return Err(FatError::OutOfBounds);
        }

        let mut value = u16::from(fat[offset]);
        value |= u16::from(fat[offset + 1]) << 8;

        // For odd cluster numbers, take the high 12 bits
        if cluster_val & 1 != 0 {
            value >>= 4;
        } else {
            // For even cluster numbers, take the low 12 bits
            value &= 0x0FFF;
        }

        match value {
            0 => Ok(FatEntry::Free),
            0x0FF7 => Ok(FatEntry::Bad),
            0x0FF0..=0x0FF6 => Ok(FatEntry::Reserved),
            0x0FF8..=0x0FFF => Ok(FatEntry::EndOfChain),
            val => Ok(FatEntry::Next(Cluster::new(u32::from(val)))),
        }
    }

    pub fn write_fat_entry(fat: &mut [u8], cluster: Cluster, entry: FatEntry) -> FatResult<()> {
        let cluster_val = usize::try_from(cluster.value()).map_err(|_| FatError::OutOfBounds)?;
        let offset = cluster_val + (cluster_val / 2); // 3 bytes per 2 entries

        if offset + 1 >= fat.len() {
            return Err(FatError::OutOfBounds);
        }

        // Convert the entry to a raw value
        let value = match entry {
            FatEntry::Free => 0,
            FatEntry::Next(next) => u16::try_from(next.value() & 0x0FFF).unwrap(),
            FatEntry::EndOfChain => 0x0FFF,
            FatEntry::Bad => 0x0FF7,
            FatEntry::Reserved => 0x0FF6,
        };

        // Read the original bytes
        let bytes = [fat[offset], fat[offset + 1]];
        let word = u16::from_le_bytes(bytes);

        let new_word = if cluster_val & 1 != 0 {
            // Odd cluster: modify the high 12 bits
            (word & 0x000F) | (value << 4)
        } else {
            // Even cluster: modify the low 12 bits
            (word & 0xF000) | value
        };

        // Write the modified bytes back
        let new_bytes = new_word.to_le_bytes();
        fat[offset] = new_bytes[0];
        fat[offset + 1] = new_bytes[1];

        Ok(())
    }
}

/// FAT16 entry handling
pub(crate) mod fat16 {
    use super::{Cluster, FatEntry, FatError, FatResult};

    pub fn read_fat_entry(fat: &[u8], cluster: Cluster) -> FatResult<FatEntry> {
        let offset = cluster.value() as usize * 2;

        if offset + 1 >= fat.len() {
            return Err(FatError::OutOfBounds);
        }

        let value = u16::from_le_bytes([fat[offset], fat[offset + 1]]);

        match value {
            0 => Ok(FatEntry::Free),
            0xFFF7 => Ok(FatEntry::Bad),
            0xFFF0..=0xFFF6 => Ok(FatEntry::Reserved),
            0xFFF8..=0xFFFF => Ok(FatEntry::EndOfChain),
            val => Ok(FatEntry::Next(Cluster::new(u32::from(val)))),
        }
    }

    pub fn write_fat_entry(fat: &mut [u8], cluster: Cluster, entry: FatEntry) -> FatResult<()> {
        let offset = cluster.value() as usize * 2;

        if offset + 1 >= fat.len() {
            return Err(FatError::OutOfBounds);
        }

        // Convert the entry to a raw value
        let value = match entry {
            FatEntry::Free => 0,
            FatEntry::Next(next) => u16::try_from(next.value() & 0xFFFF).unwrap(),
            FatEntry::EndOfChain => 0xFFFF,
            FatEntry::Bad => 0xFFF7,
            FatEntry::Reserved => 0xFFF6,
        };

        // Write the bytes
        let bytes = value.to_le_bytes();
        fat[offset] = bytes[0];
        fat[offset + 1] = bytes[1];

        Ok(())
    }
}

/// FAT32 entry handling
pub(crate) mod fat32 {
    use super::{Cluster, FatEntry, FatError, FatResult};

    pub fn read_fat_entry(fat: &[u8], cluster: Cluster) -> FatResult<FatEntry> {
        let offset = cluster.value() as usize * 4;

        if offset + 3 >= fat.len() {
            return Err(FatError::OutOfBounds);
        }

        // Read 4 bytes but only use the lower 28 bits
        let value = u32::from_le_bytes([
            fat[offset],
            fat[offset + 1],
            fat[offset + 2],
            fat[offset + 3] & 0x0F,
        ]);

        match value {
            0 => Ok(FatEntry::Free),
            0x0FFF_FFF7 => Ok(FatEntry::Bad),
            0x0FFF_FFF0..=0x0FFF_FFF6 => Ok(FatEntry::Reserved),
            0x0FFF_FFF8..=0x0FFF_FFFF => Ok(FatEntry::EndOfChain),
            val => Ok(FatEntry::Next(Cluster::new(val))),
        }
    }

    pub fn write_fat_entry(fat: &mut [u8], cluster: Cluster, entry: FatEntry) -> FatResult<()> {
        let offset = cluster.value() as usize * 4;

        if offset + 3 >= fat.len() {
            return Err(FatError::OutOfBounds);
        }

        // Convert the entry to a raw value (only the lower 28 bits are used)
        let value = match entry {
            FatEntry::Free => 0,
            FatEntry::Next(next) => next.value() & 0x0FFF_FFFF,
            FatEntry::EndOfChain => 0x0FFF_FFFF,
            FatEntry::Bad => 0x0FFF_FFF7,
            FatEntry::Reserved => 0x0FFF_FFF6,
        };

        // Preserve the high 4 bits of the last byte
        let last_byte = fat[offset + 3] & 0xF0 | ((value >> 24) & 0x0F) as u8;

        // Write the bytes
        fat[offset] = (value & 0xFF) as u8;
        fat[offset + 1] = ((value >> 8) & 0xFF) as u8;
        fat[offset + 2] = ((value >> 16) & 0xFF) as u8;
        fat[offset + 3] = last_byte;

        Ok(())
    }
}

/// In-memory FAT table, loaded from one FAT copy at mount time.
///
/// Mutations are tracked per FAT sector so the owner can flush only the
/// sectors that changed (to every FAT copy).
pub struct FatTable {
    fat_type: FatType,
    data: Vec<u8>,
    /// Number of entries, including the two reserved ones.
    entries: u32,
    free_count: u32,
    bytes_per_sector: usize,
    dirty: Vec<bool>,
}

impl FatTable {
    /// Wraps a loaded FAT copy.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not a whole number of sectors or cannot hold
    /// `entries` entries.
    #[must_use]
    pub fn new(fat_type: FatType, data: Vec<u8>, entries: u32, bytes_per_sector: usize) -> Self {
        assert_eq!(data.len() % bytes_per_sector, 0);
        let sectors = data.len() / bytes_per_sector;
        let mut table = Self {
            fat_type,
            data,
            entries,
            free_count: 0,
            bytes_per_sector,
            dirty: vec![false; sectors],
        };
        assert!(entries < 3 || table.get(Cluster::new(entries - 1)).is_ok());

        // Count free clusters once; set() keeps the cache up to date.
        table.free_count = table.count_free().unwrap_or(0);

        table
    }

    #[must_use]
    #[inline]
    /// Cached number of free clusters.
    pub const fn free_count(&self) -> u32 {
        self.free_count
    }

    #[must_use]
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Drains the indices of FAT sectors modified since the last call.
    pub fn take_dirty_sectors(&mut self) -> Vec<usize> {
        let mut out = Vec::new();
        for (i, dirty) in self.dirty.iter_mut().enumerate() {
            if *dirty {
                out.push(i);
                *dirty = false;
            }
        }
        out
    }

    /// Byte range of an entry inside the table.
    fn entry_span(&self, cluster: Cluster) -> (usize, usize) {
        let val = cluster.value() as usize;
        match self.fat_type {
            FatType::Fat12 => (val + val / 2, 2),
            FatType::Fat16 => (val * 2, 2),
            FatType::Fat32 => (val * 4, 4),
        }
    }

    fn mark_dirty(&mut self, cluster: Cluster) {
        let (offset, len) = self.entry_span(cluster);
        let first = offset / self.bytes_per_sector;
        let last = (offset + len - 1) / self.bytes_per_sector;
        for sector in first..=last {
            if let Some(flag) = self.dirty.get_mut(sector) {
                *flag = true;
            }
        }
    }

    fn check_cluster(&self, cluster: Cluster) -> FatResult<()> {
        if cluster.value() < 2 {
            return Err(FatError::InvalidCluster);
        }
        if cluster.value() >= self.entries {
            return Err(FatError::OutOfBounds);
        }
        Ok(())
    }
}

impl FatEntries for FatTable {
    #[inline]
    fn fat_type(&self) -> FatType {
        self.fat_type
    }

    #[inline]
    fn entry_count(&self) -> u32 {
        self.entries
    }

    fn get(&self, cluster: Cluster) -> FatResult<FatEntry> {
        self.check_cluster(cluster)?;

        match self.fat_type {
            FatType::Fat12 => fat12::read_fat_entry(&self.data, cluster),
            FatType::Fat16 => fat16::read_fat_entry(&self.data, cluster),
            FatType::Fat32 => fat32::read_fat_entry(&self.data, cluster),
        }
    }

    fn set(&mut self, cluster: Cluster, entry: FatEntry) -> FatResult<()> {
        self.check_cluster(cluster)?;

        // Update the free count if changing from/to free
        let old_entry = self.get(cluster)?;
        if old_entry == FatEntry::Free && entry != FatEntry::Free {
            self.free_count = self.free_count.saturating_sub(1);
        } else if old_entry != FatEntry::Free && entry == FatEntry::Free {
            self.free_count = self.free_count.saturating_add(1);
        }

        match self.fat_type {
            FatType::Fat12 => fat12::write_fat_entry(&mut self.data, cluster, entry)?,
            FatType::Fat16 => fat16::write_fat_entry(&mut self.data, cluster, entry)?,
            FatType::Fat32 => fat32::write_fat_entry(&mut self.data, cluster, entry)?,
        }
        self.mark_dirty(cluster);
        Ok(())
    }

    fn alloc_cluster(&mut self) -> FatResult<Cluster> {
        if self.free_count == 0 {
            return Err(FatError::NoSpace);
        }

        // First-fit scan from cluster 2 (the first valid data cluster)
        for i in 2..self.entries {
            let cluster = Cluster::new(i);
            match self.get(cluster) {
                Ok(FatEntry::Free) => {
                    // Mark as end of chain and return it
                    self.set(cluster, FatEntry::EndOfChain)?;
                    return Ok(cluster);
                }
                Err(e) => return Err(e),
                _ => {}
            }
        }

        Err(FatError::NoSpace)
    }

    fn alloc_cluster_chain(&mut self, count: usize) -> FatResult<Cluster> {
        if count == 0 {
            return Err(FatError::InvalidParameter);
        }

        if usize::try_from(self.free_count).unwrap() < count {
            return Err(FatError::NoSpace);
        }

        // Allocate the first cluster
        let first = self.alloc_cluster()?;
        let mut prev = first;

        // Allocate additional clusters
        for _ in 1..count {
            let next = self.alloc_cluster()?;
            // Link the previous cluster to this one
            self.set(prev, FatEntry::Next(next))?;
            prev = next;
        }

        Ok(first)
    }

    fn free_cluster(&mut self, cluster: Cluster) -> FatResult<()> {
        self.check_cluster(cluster)?;

        // Mark the cluster as free
        self.set(cluster, FatEntry::Free)
    }

    fn free_cluster_chain(&mut self, start: Cluster) -> FatResult<()> {
        self.check_cluster(start)?;

        let mut current = start;
        // A valid chain cannot be longer than the table.
        let mut remaining = self.entries;

        loop {
            if remaining == 0 {
                return Err(FatError::CorruptedChain);
            }
            remaining -= 1;

            match self.get(current)? {
                FatEntry::Next(next) => {
                    // Mark the current cluster as free
                    self.set(current, FatEntry::Free)?;
                    current = next;
                }
                FatEntry::EndOfChain => {
                    // Mark the last cluster as free and exit
                    self.set(current, FatEntry::Free)?;
                    break;
                }
                _ => return Err(FatError::CorruptedChain),
            }
        }

        Ok(())
    }

    fn count_free(&self) -> FatResult<u32> {
        // Start counting from cluster 2 (the first valid data cluster)
        let mut count = 0;
        for i in 2..self.entries {
            if self.get(Cluster::new(i))? == FatEntry::Free {
                count += 1;
            }
        }

        Ok(count)
    }
}
