mod heap;
pub mod region;

pub use heap::LockedHeap;
#[cfg(target_os = "none")]
pub use heap::HEAP;
pub use region::{HeapStats, RegionHeap, MAX_REGIONS, MM_ALIGN};
