//! RAM-backed flash simulator.
//!
//! [`RamFlash`] behaves like SPI NOR flash: programming ANDs bytes into the
//! stored data (bits only go from 1 to 0) and erasing resets whole erase
//! units to `0xFF`. Per-sector erase counters make wear observable, and
//! scripted fault injection simulates transient bus errors and abrupt
//! power loss with a torn operation.

use super::{DeviceError, FlashDevice};
use alloc::vec;
use alloc::vec::Vec;

pub struct RamFlash {
    sector_size: usize,
    erase_unit: usize,
    data: Vec<u8>,
    erase_counts: Vec<u32>,
    /// Next `io_failures` operations fail with `DeviceError::Io`.
    io_failures: u32,
    /// Countdown of surviving mutations. `Some(0)` means the next mutation
    /// is torn: it applies a prefix of its effect and kills the device.
    fail_after: Option<u32>,
    dead: bool,
}

impl RamFlash {
    /// Creates a fresh (fully erased) flash device.
    ///
    /// # Panics
    ///
    /// Panics if `sector_size` is not a power of two or `sector_count` is 0.
    #[must_use]
    pub fn new(sector_size: usize, sector_count: usize) -> Self {
        assert!(sector_size.is_power_of_two(), "sector size must be a power of two");
        assert!(sector_count > 0, "device must have at least one sector");
        Self {
            sector_size,
            erase_unit: 1,
            data: vec![0xFF; sector_size * sector_count],
            erase_counts: vec![0; sector_count],
            io_failures: 0,
            fail_after: None,
            dead: false,
        }
    }

    /// Sets the erase-unit granularity in sectors.
    ///
    /// # Panics
    ///
    /// Panics if `unit` is 0 or does not divide the sector count.
    #[must_use]
    pub fn with_erase_unit(mut self, unit: usize) -> Self {
        assert!(unit > 0 && self.erase_counts.len() % unit == 0);
        self.erase_unit = unit;
        self
    }

    /// Erase count of a single sector.
    #[must_use]
    pub fn erase_count(&self, sector: usize) -> u32 {
        self.erase_counts[sector]
    }

    /// Erase counts of all sectors, indexed by physical sector number.
    #[must_use]
    pub fn erase_counts(&self) -> &[u32] {
        &self.erase_counts
    }

    /// Makes the next `count` operations fail with [`DeviceError::Io`].
    pub fn inject_io_errors(&mut self, count: u32) {
        self.io_failures = count;
    }

    /// Schedules a power loss: `surviving` further mutations (programs and
    /// erases) complete normally, then the next one is torn and the device
    /// reports [`DeviceError::Fault`] until [`power_cycle`](Self::power_cycle).
    pub fn fail_after(&mut self, surviving: u32) {
        self.fail_after = Some(surviving);
    }

    /// Restores a dead device, keeping whatever data the torn operation
    /// left behind. Pending fault scripts are cleared.
    pub fn power_cycle(&mut self) {
        self.dead = false;
        self.fail_after = None;
        self.io_failures = 0;
    }

    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.dead
    }

    /// Common fault-script bookkeeping. `Ok(true)` means the current
    /// mutation must tear.
    fn mutation_guard(&mut self) -> Result<bool, DeviceError> {
        if self.dead {
            return Err(DeviceError::Fault);
        }
        if self.io_failures > 0 {
            self.io_failures -= 1;
            return Err(DeviceError::Io);
        }
        match self.fail_after {
            Some(0) => {
                self.dead = true;
                Ok(true)
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn check_sector(&self, sector: usize, buf_len: usize) -> Result<(), DeviceError> {
        if sector >= self.erase_counts.len() {
            return Err(DeviceError::OutOfBounds);
        }
        if buf_len != self.sector_size {
            return Err(DeviceError::Unaligned);
        }
        Ok(())
    }
}

impl FlashDevice for RamFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> usize {
        self.erase_counts.len()
    }

    fn erase_unit(&self) -> usize {
        self.erase_unit
    }

    fn read_sector(&mut self, sector: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        if self.dead {
            return Err(DeviceError::Fault);
        }
        if self.io_failures > 0 {
            self.io_failures -= 1;
            return Err(DeviceError::Io);
        }
        self.check_sector(sector, buf.len())?;
        let start = sector * self.sector_size;
        buf.copy_from_slice(&self.data[start..start + self.sector_size]);
        Ok(())
    }

    fn program_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), DeviceError> {
        let torn = self.mutation_guard()?;
        self.check_sector(sector, data.len())?;
        let start = sector * self.sector_size;
        let len = if torn { data.len() / 2 } else { data.len() };
        for (cell, byte) in self.data[start..start + len].iter_mut().zip(data) {
            *cell &= byte;
        }
        if torn { Err(DeviceError::Fault) } else { Ok(()) }
    }

    fn erase_range(&mut self, sector: usize, count: usize) -> Result<(), DeviceError> {
        let torn = self.mutation_guard()?;
        if sector % self.erase_unit != 0 || count % self.erase_unit != 0 || count == 0 {
            return Err(DeviceError::Unaligned);
        }
        if sector + count > self.erase_counts.len() {
            return Err(DeviceError::OutOfBounds);
        }
        let whole = if torn { count / 2 } else { count };
        for s in sector..sector + whole {
            let start = s * self.sector_size;
            self.data[start..start + self.sector_size].fill(0xFF);
            self.erase_counts[s] += 1;
        }
        if torn {
            // Power died mid-erase: the next sector is only half blanked.
            let start = (sector + whole) * self.sector_size;
            self.data[start..start + self.sector_size / 2].fill(0xFF);
            return Err(DeviceError::Fault);
        }
        Ok(())
    }
}
