/// Block device contracts: disk drivers and the devices they open.
///
/// A driver recognises raw disk names (`hd0`, `mem1`, ...) and opens them.
/// The disk layer talks to an opened device in native sectors only; the
/// in-memory `MemDisk` and real firmware disks both implement these traits.
use alloc::boxed::Box;

use crate::error::Result;

/// log2 of the canonical 512-byte sector.
pub const SECTOR_BITS: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_BITS;

/// An opened disk.
pub trait BlockDevice {
    /// Device id within the driver's class, part of the cache key.
    fn disk_id(&self) -> u32;

    /// log2 of the native sector size in bytes.
    fn log_block_size(&self) -> u32 {
        SECTOR_BITS
    }

    /// Size in native sectors, `None` when the device can't tell.
    fn total_blocks(&self) -> Option<u64>;

    /// Read `count` native sectors starting at `lba` into `buf`.
    fn read_blocks(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `count` native sectors starting at `lba` from `buf`.
    fn write_blocks(&mut self, lba: u64, count: usize, buf: &[u8]) -> Result<()>;

    fn close(&mut self) {}
}

/// A registered disk driver.
pub trait DiskDriver {
    fn name(&self) -> &'static str;

    /// Device class id, part of the cache key.
    fn id(&self) -> u32;

    /// Open a raw disk name. `UnknownDevice` means "not mine".
    fn open(&self, name: &str) -> Result<Box<dyn BlockDevice>>;

    /// Report every disk this driver can open; stops and returns true as
    /// soon as `hook` does.
    fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool) -> bool;
}
