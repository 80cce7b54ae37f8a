//! Emberboot platform hand-off.
//!
//! Turns the firmware memory map into heap regions, builds the initial
//! [`Kernel`] and names the device the image was booted from.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use emberboot_kernel::config::BootConfig;
use emberboot_kernel::mem::LockedHeap;
use emberboot_kernel::storage::{MemDisk, MemImage, MsdosPartitionMap, SECTOR_BITS};
use emberboot_kernel::Kernel;

/// Memory below this is left to the firmware and real-mode loaders.
pub const LOW_MEMORY_END: u64 = 0x10_0000;
/// Regions are clipped to 32-bit addresses.
pub const ADDR_LIMIT: u64 = 0xFFFF_FFFF;
/// Entries past this many are ignored.
pub const MAX_REGIONS: usize = 32;

/// Drive number the firmware reports for a network boot.
pub const PXE_DRIVE: u8 = 0x7f;

// ---- Memory map ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub addr: u64,
    pub len: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    pub const fn new(addr: u64, len: u64, kind: MemoryKind) -> Self {
        Self { addr, len, kind }
    }
}

/// A heap region, `[addr, addr + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub addr: u64,
    pub size: u64,
}

/// Usable heap regions for `map`, sorted and with overlaps merged.
pub fn plan_regions(map: &[MemoryMapEntry]) -> Vec<Region> {
    let mut regions: Vec<Region> = Vec::with_capacity(MAX_REGIONS);

    for entry in map {
        let (mut addr, mut len) = (entry.addr, entry.len);
        if addr < LOW_MEMORY_END {
            if len <= LOW_MEMORY_END - addr {
                continue;
            }
            len -= LOW_MEMORY_END - addr;
            addr = LOW_MEMORY_END;
        }
        if addr > ADDR_LIMIT || entry.kind != MemoryKind::Available {
            continue;
        }
        let size = if addr.saturating_add(len) > ADDR_LIMIT { ADDR_LIMIT - addr } else { len };
        if regions.len() == MAX_REGIONS {
            log::warn!(target: "mm", "too many memory regions, ignoring {:#x}+{:#x}", addr, size);
            continue;
        }
        regions.push(Region { addr, size });
    }

    regions.sort_by_key(|r| r.addr);
    let mut merged: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(last) if last.addr + last.size >= region.addr => {
                let end = (last.addr + last.size).max(region.addr + region.size);
                last.size = end - last.addr;
            }
            _ => merged.push(region),
        }
    }
    merged
}

// ---- Kernel bring-up ----

/// Hand `regions` to `heap` and build the kernel context on it, with the
/// msdos partition map registered.
///
/// # Safety
/// Every region must be memory nobody else uses, for the rest of the
/// program's life.
pub unsafe fn init_with_regions(heap: &'static LockedHeap, config: BootConfig, regions: &[Region]) -> Kernel {
    for region in regions {
        unsafe { heap.init_region(region.addr as usize, region.size as usize) };
    }
    let mut k = Kernel::new(heap, config);
    k.register_partition_map(Rc::new(MsdosPartitionMap));
    k
}

/// Console log level on the freestanding target.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// Plan heap regions from the firmware map and build the kernel context.
///
/// On the freestanding target this first brings up the serial console and
/// logger, then installs the calibrated TSC clock.
///
/// # Safety
/// Every available entry of `map` must really be free memory.
pub unsafe fn init(heap: &'static LockedHeap, config: BootConfig, map: &[MemoryMapEntry]) -> Kernel {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    let clock = emberboot_kernel::arch::x86_64::init_platform(LOG_LEVEL);

    let regions = plan_regions(map);
    #[allow(unused_mut)]
    let mut k = unsafe { init_with_regions(heap, config, &regions) };

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    k.install_clock(clock);

    let stats = k.heap.stats();
    log::info!(
        target: "mm",
        "{} heap regions, {} KiB free",
        stats.regions,
        stats.free_bytes >> 10
    );
    k
}

/// Expose an image bundled with the core as the disk `memdisk`.
pub fn attach_memdisk(k: &mut Kernel, image: Vec<u8>) -> MemImage {
    let driver = Rc::new(MemDisk::new());
    let disk = driver.add_disk("memdisk", image, SECTOR_BITS);
    k.register_disk_driver(driver);
    disk
}

// ---- Boot location ----

/// Device name for a firmware boot location: drive number plus 0-based
/// dos and bsd partition indices, `0xff` where absent.
///
/// `None` for a network boot.
pub fn boot_device_name(drive: u8, dos_part: u8, bsd_part: u8) -> Option<String> {
    if drive == PXE_DRIVE {
        return None;
    }
    let class = if drive & 0x80 != 0 { 'h' } else { 'f' };
    let mut name = format!("{}d{}", class, drive & 0x7f);
    if dos_part != 0xff {
        name.push_str(&format!(",{}", dos_part as u32 + 1));
    }
    if bsd_part != 0xff {
        name.push_str(&format!(",{}", bsd_part as u32 + 1));
    }
    Some(name)
}

/// `boot_device_name` for the packed `drive << 24 | dos << 16 | bsd << 8`
/// form a real-mode stage hands over.
pub fn boot_device_from_packed(packed: u32) -> Option<String> {
    boot_device_name((packed >> 24) as u8, (packed >> 16) as u8, (packed >> 8) as u8)
}
