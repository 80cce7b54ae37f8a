pub mod block_device;
pub mod cache;
pub mod disk;
pub mod memdisk;
pub mod msdos;
pub mod partition;

pub use block_device::{BlockDevice, DiskDriver, SECTOR_BITS, SECTOR_SIZE};
pub use cache::{CacheStats, DiskCache};
pub use disk::Disk;
pub use memdisk::{MemDisk, MemImage};
pub use msdos::MsdosPartitionMap;
pub use partition::{Partition, PartitionMap};
