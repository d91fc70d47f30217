//! Device-level storage contract.
//!
//! Two layers of device are distinguished. A [`FlashDevice`] is raw
//! NOR-style flash: programming can only clear bits (1 to 0) and data is
//! reset to all-ones by erasing whole erase units. A [`BlockDevice`] is the
//! logical, freely rewritable sector space that wear leveling builds on top
//! of a `FlashDevice`.

use thiserror::Error;

pub mod ram;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
/// An error that can occur when performing device operations.
pub enum DeviceError {
    /// Transient I/O failure (timeout, bus glitch). Eligible for a bounded
    /// retry at the device boundary only.
    #[error("transient I/O error")]
    Io,
    /// Permanent hardware fault. Never retried.
    #[error("device fault")]
    Fault,
    #[error("address out of bounds")]
    OutOfBounds,
    #[error("unaligned access")]
    Unaligned,
    /// No free capacity left (physical reserve pool or logical space).
    #[error("device full")]
    Full,
    /// On-device metadata failed validation.
    #[error("corrupted device metadata")]
    Corrupted,
}

/// Number of attempts granted to a transient-failing operation.
pub const IO_RETRY_LIMIT: u32 = 3;

/// Runs `op`, retrying on [`DeviceError::Io`] up to [`IO_RETRY_LIMIT`]
/// attempts in total. Any other outcome is returned immediately.
pub fn with_retry<T>(mut op: impl FnMut() -> Result<T, DeviceError>) -> Result<T, DeviceError> {
    let mut attempts = 0;
    loop {
        match op() {
            Err(DeviceError::Io) => {
                attempts += 1;
                if attempts >= IO_RETRY_LIMIT {
                    return Err(DeviceError::Io);
                }
                log::debug!("transient I/O error, retry {attempts}/{IO_RETRY_LIMIT}");
            }
            other => return other,
        }
    }
}

/// A trait for raw flash devices.
///
/// The device is addressed in sectors of [`sector_size`](Self::sector_size)
/// bytes. Erasing operates on erase units of
/// [`erase_unit`](Self::erase_unit) consecutive sectors.
pub trait FlashDevice {
    /// Size of one sector in bytes. Always a power of two.
    fn sector_size(&self) -> usize;

    /// Total number of sectors on the device.
    fn sector_count(&self) -> usize;

    /// Number of consecutive sectors forming one erase unit.
    ///
    /// [`erase_range`](Self::erase_range) only accepts ranges aligned to
    /// this granularity.
    fn erase_unit(&self) -> usize {
        1
    }

    /// Read one sector into `buf`.
    ///
    /// ## Errors
    ///
    /// Fails with [`DeviceError::OutOfBounds`] if `sector` is past the end
    /// of the device and [`DeviceError::Unaligned`] if `buf` is not exactly
    /// one sector long.
    fn read_sector(&mut self, sector: usize, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Program one sector with `data`.
    ///
    /// Programming can only clear bits relative to the sector's last erase:
    /// the stored value becomes `old & data`. Callers that need a full
    /// rewrite must erase first.
    ///
    /// ## Errors
    ///
    /// Same addressing errors as [`read_sector`](Self::read_sector).
    fn program_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), DeviceError>;

    /// Erase `count` sectors starting at `sector`, resetting them to all
    /// `0xFF` bytes.
    ///
    /// ## Errors
    ///
    /// Fails with [`DeviceError::Unaligned`] if the range is not aligned to
    /// [`erase_unit`](Self::erase_unit) boundaries.
    fn erase_range(&mut self, sector: usize, count: usize) -> Result<(), DeviceError>;
}

/// A trait for logical block devices.
///
/// Blocks are stable and freely rewritable: a read of block `n` returns the
/// data of the most recent successful write to block `n`. This is the
/// address space a filesystem engine operates on.
pub trait BlockDevice {
    /// Size of one block in bytes. Always a power of two.
    fn block_size(&self) -> usize;

    /// Total number of blocks.
    fn block_count(&self) -> usize;

    /// Read one block into `buf`.
    ///
    /// ## Errors
    ///
    /// Fails with [`DeviceError::OutOfBounds`] if `block` is past the end
    /// and [`DeviceError::Unaligned`] if `buf` is not exactly one block.
    fn read_block(&mut self, block: usize, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Write one block.
    ///
    /// ## Errors
    ///
    /// Same addressing errors as [`read_block`](Self::read_block), plus
    /// [`DeviceError::Full`] if the backing store cannot accept the write.
    fn write_block(&mut self, block: usize, data: &[u8]) -> Result<(), DeviceError>;

    /// Flush any buffered state to the backing store.
    fn sync(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}
