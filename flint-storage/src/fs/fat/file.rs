use alloc::vec;

use super::{
    Cluster, FatError, FatResult, RefDataReader, RefDataWriter,
    fat::{FatEntries, FatEntry},
};

/// File abstraction.
///
/// Holds a cursor over the cluster chain of one file. `cluster_offset`
/// may equal `bytes_per_cluster`, meaning the cursor sits at the end of
/// `current_cluster` and advances (or allocates) lazily on the next
/// access. This keeps appends at exact cluster boundaries correct.
pub struct FatFile<'a, T: FatEntries> {
    /// The FAT entries.
    fat: &'a mut T,
    /// First cluster of the file.
    first_cluster: Cluster,
    /// Current position within the file.
    position: u64,
    /// Size of the file in bytes.
    size: u64,
    /// Bytes per cluster.
    bytes_per_cluster: u32,
    /// Current cluster.
    current_cluster: Cluster,
    /// Offset within current cluster.
    cluster_offset: u32,
}

impl<'a, T: FatEntries> FatFile<'a, T> {
    pub fn new(
        fat: &'a mut T,
        first_cluster: Cluster,
        size: u64,
        bytes_per_cluster: u32,
    ) -> FatResult<Self> {
        if !first_cluster.is_valid(fat.fat_type()) && first_cluster.value() != 0 {
            return Err(FatError::InvalidCluster);
        }

        Ok(Self {
            fat,
            first_cluster,
            position: 0,
            size,
            bytes_per_cluster,
            current_cluster: first_cluster,
            cluster_offset: 0,
        })
    }

    #[must_use]
    #[inline]
    /// Returns the current position within the file
    pub const fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    #[inline]
    /// Returns the size of the file in bytes
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    #[inline]
    /// Returns the first cluster, 0 while the file has no data
    pub const fn first_cluster(&self) -> Cluster {
        self.first_cluster
    }

    /// Seeks to a position in the file, clamped to the file size
    pub fn seek(&mut self, position: u64) -> FatResult<u64> {
        let position = position.min(self.size);

        // If moving backwards, start from beginning
        if position < self.position {
            self.current_cluster = self.first_cluster;
            self.cluster_offset = 0;
            self.position = 0;
        }

        while self.position < position {
            let remaining_in_cluster = u64::from(self.bytes_per_cluster - self.cluster_offset);
            let delta = (position - self.position).min(remaining_in_cluster);

            if delta > 0 {
                self.cluster_offset += u32::try_from(delta).unwrap();
                self.position += delta;
                continue;
            }

            // The cursor sits at the end of the current cluster.
            match self.fat.get(self.current_cluster)? {
                FatEntry::Next(next) => {
                    self.current_cluster = next;
                    self.cluster_offset = 0;
                }
                // The size field claims more data than the chain holds.
                FatEntry::EndOfChain => return Err(FatError::CorruptedChain),
                _ => return Err(FatError::CorruptedChain),
            }
        }

        Ok(self.position)
    }

    /// Reads data from the file into the provided buffer
    pub fn read(&mut self, buffer: &mut [u8], read_data: RefDataReader) -> FatResult<usize> {
        if self.position >= self.size {
            return Ok(0);
        }

        let bytes_to_read = buffer
            .len()
            .min((self.size - self.position).try_into().unwrap());
        let mut bytes_read = 0;

        while bytes_read < bytes_to_read {
            // Move to the next cluster if the cursor sits at the end of one
            if self.cluster_offset >= self.bytes_per_cluster {
                match self.fat.get(self.current_cluster)? {
                    FatEntry::Next(next) => {
                        self.current_cluster = next;
                        self.cluster_offset = 0;
                    }
                    FatEntry::EndOfChain => {
                        // Chain shorter than the size field, stop short
                        break;
                    }
                    _ => return Err(FatError::CorruptedChain),
                }
            }

            // Calculate how many bytes we can read from the current cluster
            let cluster_remaining = self.bytes_per_cluster - self.cluster_offset;
            let chunk_size =
                (bytes_to_read - bytes_read).min(cluster_remaining.try_into().unwrap());

            read_data(
                self.current_cluster,
                self.cluster_offset,
                &mut buffer[bytes_read..bytes_read + chunk_size],
            )?;

            bytes_read += chunk_size;
            self.position += u64::try_from(chunk_size).unwrap();
            self.cluster_offset += u32::try_from(chunk_size).unwrap();
        }

        Ok(bytes_read)
    }

    /// Writes data to the file from the provided buffer
    pub fn write(&mut self, buffer: &[u8], write_data: RefDataWriter) -> FatResult<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        // Ensure we have a valid starting cluster
        let mut fresh_cluster = false;
        if self.first_cluster.value() == 0 {
            self.first_cluster = self.fat.alloc_cluster()?;
            self.current_cluster = self.first_cluster;
            self.cluster_offset = 0;
            fresh_cluster = true;
        }

        let mut bytes_written = 0;
        let write_size = buffer.len();

        while bytes_written < write_size {
            // Advance past a completed cluster, extending the chain at its
            // end
            if self.cluster_offset >= self.bytes_per_cluster {
                match self.fat.get(self.current_cluster)? {
                    FatEntry::Next(next) => {
                        self.current_cluster = next;
                        fresh_cluster = false;
                    }
                    FatEntry::EndOfChain => {
                        let new_cluster = self.fat.alloc_cluster()?;
                        self.fat
                            .set(self.current_cluster, FatEntry::Next(new_cluster))?;
                        self.current_cluster = new_cluster;
                        fresh_cluster = true;
                    }
                    _ => return Err(FatError::CorruptedChain),
                }
                self.cluster_offset = 0;
            }

            // Calculate how many bytes we can write to the current cluster
            let cluster_remaining = self.bytes_per_cluster - self.cluster_offset;
            let chunk_size =
                (write_size - bytes_written).min(cluster_remaining.try_into().unwrap());

            write_data(
                self.current_cluster,
                self.cluster_offset,
                &buffer[bytes_written..bytes_written + chunk_size],
            )?;

            bytes_written += chunk_size;
            self.position += u64::try_from(chunk_size).unwrap();
            self.cluster_offset += u32::try_from(chunk_size).unwrap();

            // A newly linked cluster must never expose whatever its sectors
            // held before. The caller's data covers it up to `cluster_offset`;
            // blank the rest.
            if fresh_cluster && self.cluster_offset < self.bytes_per_cluster {
                let tail = vec![0u8; (self.bytes_per_cluster - self.cluster_offset) as usize];
                write_data(self.current_cluster, self.cluster_offset, &tail)?;
            }

            if self.position > self.size {
                self.size = self.position;
            }
        }

        Ok(bytes_written)
    }

    /// Truncates the file to the specified size
    pub fn truncate(&mut self, new_size: u64) -> FatResult<()> {
        if new_size >= self.size {
            // Nothing to do if new size is larger than current size
            return Ok(());
        }

        // If truncating to 0, just free all clusters
        if new_size == 0 {
            if self.first_cluster.value() != 0 {
                self.fat.free_cluster_chain(self.first_cluster)?;
                self.first_cluster = Cluster::new(0);
                self.current_cluster = Cluster::new(0);
                self.cluster_offset = 0;
            }
            self.size = 0;
            self.position = 0;
            return Ok(());
        }

        // Position the cursor on the last kept cluster
        self.seek(new_size)?;

        // Free any clusters after this position
        if let FatEntry::Next(next) = self.fat.get(self.current_cluster)? {
            self.fat.set(self.current_cluster, FatEntry::EndOfChain)?;
            self.fat.free_cluster_chain(next)?;
        }

        self.size = new_size;
        if self.position > new_size {
            self.position = new_size;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::{FatType, fat::FatTable};
    use alloc::vec;

    fn table() -> FatTable {
        FatTable::new(FatType::Fat16, vec![0u8; 512], 100, 512)
    }

    #[test]
    fn test_file_creation() {
        let mut fat = table();
        let first_cluster = fat.alloc_cluster_chain(3).expect("Failed to allocate");

        let file =
            FatFile::new(&mut fat, first_cluster, 1024, 512).expect("Failed to create file");
        assert_eq!(file.size(), 1024);
        assert_eq!(file.position(), 0);
        assert_eq!(file.first_cluster(), first_cluster);
    }

    #[test]
    fn test_file_seek() {
        let mut fat = table();
        let first_cluster = fat.alloc_cluster_chain(3).expect("Failed to allocate");

        let mut file =
            FatFile::new(&mut fat, first_cluster, 1500, 512).expect("Failed to create file");

        // Test seeking within file
        let pos = file.seek(600).expect("Failed to seek");
        assert_eq!(pos, 600);
        assert_eq!(file.position(), 600);

        // Test seeking past first cluster
        let pos = file.seek(700).expect("Failed to seek");
        assert_eq!(pos, 700);

        // Test seeking backward
        let pos = file.seek(100).expect("Failed to seek backward");
        assert_eq!(pos, 100);

        // Test seeking to end of file
        let pos = file.seek(1500).expect("Failed to seek to EOF");
        assert_eq!(pos, 1500);

        // Test seeking beyond end of file (should clamp to file size)
        let pos = file.seek(2000).expect("Failed to seek beyond EOF");
        assert_eq!(pos, 1500);
    }

    #[test]
    fn test_file_read_write() {
        let mut fat = table();
        let first_cluster = fat.alloc_cluster_chain(3).expect("Failed to allocate");

        let mut file = FatFile::new(&mut fat, first_cluster, 0, 512).expect("Failed to create");

        let data = b"Hello, FAT filesystem!";
        let mut mock_data = vec![0u8; 3 * 512];

        let bytes_written = file
            .write(data, &mut |cluster, offset, data_slice| {
                let start = (cluster.value() - 2) as usize * 512 + offset as usize;
                let end = start + data_slice.len();
                mock_data[start..end].copy_from_slice(data_slice);
                Ok(())
            })
            .expect("Failed to write data");

        assert_eq!(bytes_written, data.len());
        assert_eq!(file.size(), data.len() as u64);

        file.seek(0).expect("Failed to seek to beginning");

        let mut read_buffer = [0u8; 32];
        let bytes_read = file
            .read(&mut read_buffer, &mut |cluster, offset, data_slice| {
                let start = (cluster.value() - 2) as usize * 512 + offset as usize;
                let end = start + data_slice.len();
                data_slice.copy_from_slice(&mock_data[start..end]);
                Ok(())
            })
            .expect("Failed to read data");

        assert_eq!(bytes_read, data.len());
        assert_eq!(&read_buffer[..bytes_read], data);
    }

    #[test]
    fn test_file_truncate() {
        let mut fat = table();
        let first_cluster = fat.alloc_cluster_chain(3).expect("Failed to allocate");

        let mut file =
            FatFile::new(&mut fat, first_cluster, 1500, 512).expect("Failed to create file");

        // Truncate to smaller size
        file.truncate(700).expect("Failed to truncate");
        assert_eq!(file.size(), 700);

        // Verify position is clamped
        file.seek(1000).expect("Failed to seek");
        assert_eq!(file.position(), 700);

        // Truncate to 0
        file.truncate(0).expect("Failed to truncate to zero");
        assert_eq!(file.size(), 0);
        assert_eq!(file.position(), 0);

        // All three clusters went back to the free pool
        assert_eq!(fat.count_free().unwrap(), 98);
    }

    #[test]
    fn test_file_cluster_allocation() {
        let mut fat = table();
        let mut file =
            FatFile::new(&mut fat, Cluster::new(0), 0, 512).expect("Failed to create file");

        let mut mock_data = vec![0u8; 3 * 512];
        let write_fn = &mut |cluster: Cluster, offset: u32, data_slice: &[u8]| {
            let start = (cluster.value() - 2) as usize * 512 + offset as usize;
            let end = start + data_slice.len();
            mock_data[start..end].copy_from_slice(data_slice);
            Ok(())
        };

        // Write data that spans multiple clusters
        let data = vec![1u8; 1000];
        let bytes_written = file.write(&data, write_fn).expect("Failed to write data");

        assert_eq!(bytes_written, data.len());
        assert_eq!(file.size(), data.len() as u64);
        assert_ne!(file.first_cluster(), Cluster::new(0));

        // Two clusters were claimed for 1000 bytes
        assert_eq!(fat.count_free().unwrap(), 96);
    }

    #[test]
    fn append_at_exact_cluster_boundary() {
        let mut fat = table();
        let first_cluster = fat.alloc_cluster().expect("Failed to allocate");

        let mut file =
            FatFile::new(&mut fat, first_cluster, 512, 512).expect("Failed to create file");

        let mut mock_data = vec![0xAAu8; 3 * 512];
        file.seek(512).expect("Failed to seek to boundary");

        let written = file
            .write(b"ZZZZ", &mut |cluster, offset, data_slice| {
                let start = (cluster.value() - 2) as usize * 512 + offset as usize;
                let end = start + data_slice.len();
                mock_data[start..end].copy_from_slice(data_slice);
                Ok(())
            })
            .expect("Failed to append");

        assert_eq!(written, 4);
        assert_eq!(file.size(), 516);
        // The append landed at the start of a fresh cluster, leaving the
        // old last cluster untouched.
        assert_eq!(&mock_data[512..516], b"ZZZZ");
        assert!(mock_data[..512].iter().all(|&b| b == 0xAA));
        // The rest of the fresh cluster was blanked, not left stale.
        assert!(mock_data[516..1024].iter().all(|&b| b == 0));

        assert_eq!(
            fat.get(first_cluster).unwrap(),
            FatEntry::Next(Cluster::new(3))
        );
        assert_eq!(fat.get(Cluster::new(3)).unwrap(), FatEntry::EndOfChain);
    }

    #[test]
    fn short_chain_stops_read_and_fails_seek() {
        let mut fat = table();
        // Two clusters backing a size field that claims 2000 bytes.
        let first_cluster = fat.alloc_cluster_chain(2).expect("Failed to allocate");

        let mut file =
            FatFile::new(&mut fat, first_cluster, 2000, 512).expect("Failed to create file");

        file.seek(1000).expect("Failed to seek");
        let mut buffer = [0u8; 100];
        let read = file
            .read(&mut buffer, &mut |_, _, data_slice| {
                data_slice.fill(7);
                Ok(())
            })
            .expect("Failed to read");
        // Only the 24 bytes left in the chain are returned.
        assert_eq!(read, 24);

        assert_eq!(file.seek(1500), Err(FatError::CorruptedChain));
    }
}
