/// Sector cache: direct-mapped, one block group per slot.
///
/// Each slot holds `CACHE_SECTORS` canonical sectors of one device. Buffers
/// come from the region heap, which is why the allocator can ask the cache
/// to give memory back when it runs dry. A slot is locked only while the
/// caller copies out of it.
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use super::block_device::SECTOR_SIZE;
use crate::error::Result;
use crate::mem::LockedHeap;

/// log2 of the sectors per cache group.
pub const CACHE_BITS: u32 = 3;
pub const CACHE_SECTORS: u64 = 1 << CACHE_BITS;
pub const CACHE_GROUP_BYTES: usize = SECTOR_SIZE << CACHE_BITS;
pub const CACHE_SLOTS: usize = 1021;

const CLASS_MULTIPLIER: u64 = 524_287;
const ID_MULTIPLIER: u64 = 2_606_459;

fn group_start(sector: u64) -> u64 {
    sector & !(CACHE_SECTORS - 1)
}

#[derive(Clone, Copy)]
struct CacheEntry {
    dev_class: u32,
    dev_id: u32,
    sector: u64,
    data: Option<NonNull<u8>>,
    locked: bool,
}

impl CacheEntry {
    const EMPTY: CacheEntry = CacheEntry {
        dev_class: 0,
        dev_id: 0,
        sector: 0,
        data: None,
        locked: false,
    };

    fn tagged(&self, dev_class: u32, dev_id: u32, sector: u64) -> bool {
        self.dev_class == dev_class && self.dev_id == dev_id && self.sector == sector
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
}

pub struct DiskCache {
    entries: Vec<CacheEntry>,
    hits: u64,
    misses: u64,
}

impl Default for DiskCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskCache {
    pub fn new() -> Self {
        Self {
            entries: vec![CacheEntry::EMPTY; CACHE_SLOTS],
            hits: 0,
            misses: 0,
        }
    }

    /// Slot for a group; `sector` may be any sector inside it.
    pub fn index(dev_class: u32, dev_id: u32, sector: u64) -> usize {
        let hash = (dev_class as u64)
            .wrapping_mul(CLASS_MULTIPLIER)
            .wrapping_add((dev_id as u64).wrapping_mul(ID_MULTIPLIER))
            .wrapping_add(sector >> CACHE_BITS);
        (hash % CACHE_SLOTS as u64) as usize
    }

    /// Look up the group holding `sector` and lock it on a hit.
    pub fn fetch(&mut self, dev_class: u32, dev_id: u32, sector: u64) -> Option<&[u8]> {
        let sector = group_start(sector);
        let entry = &mut self.entries[Self::index(dev_class, dev_id, sector)];
        match entry.data {
            Some(data) if entry.tagged(dev_class, dev_id, sector) => {
                entry.locked = true;
                self.hits += 1;
                Some(unsafe { core::slice::from_raw_parts(data.as_ptr(), CACHE_GROUP_BYTES) })
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn unlock(&mut self, dev_class: u32, dev_id: u32, sector: u64) {
        let sector = group_start(sector);
        let entry = &mut self.entries[Self::index(dev_class, dev_id, sector)];
        if entry.tagged(dev_class, dev_id, sector) {
            entry.locked = false;
        }
    }

    /// Put the group holding `sector` into its slot, evicting whatever was
    /// there.
    ///
    /// `data` must hold at least `CACHE_GROUP_BYTES` bytes. The buffer comes
    /// straight from `heap`, so a fill never flushes other slots to make
    /// room; when memory is short the slot is simply left empty.
    pub fn store(
        &mut self,
        heap: &LockedHeap,
        dev_class: u32,
        dev_id: u32,
        sector: u64,
        data: &[u8],
    ) -> Result<()> {
        let sector = group_start(sector);
        let entry = &mut self.entries[Self::index(dev_class, dev_id, sector)];
        if let Some(old) = entry.data.take() {
            unsafe { heap.free(old.as_ptr()) };
        }
        entry.locked = false;

        let buf = heap.memalign(0, CACHE_GROUP_BYTES)?;
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), buf.as_ptr(), CACHE_GROUP_BYTES);
        }
        entry.data = Some(buf);
        entry.dev_class = dev_class;
        entry.dev_id = dev_id;
        entry.sector = sector;
        Ok(())
    }

    /// Drop the group holding `sector`, if it is resident.
    pub fn invalidate(&mut self, heap: &LockedHeap, dev_class: u32, dev_id: u32, sector: u64) {
        let sector = group_start(sector);
        let entry = &mut self.entries[Self::index(dev_class, dev_id, sector)];
        if entry.tagged(dev_class, dev_id, sector) {
            if let Some(data) = entry.data.take() {
                unsafe { heap.free(data.as_ptr()) };
            }
            entry.locked = false;
        }
    }

    /// Drop every unlocked group.
    pub fn invalidate_all(&mut self, heap: &LockedHeap) {
        let mut dropped = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.locked) {
            if let Some(data) = entry.data.take() {
                unsafe { heap.free(data.as_ptr()) };
                dropped += 1;
            }
        }
        log::debug!(target: "cache", "invalidated {} groups", dropped);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            resident: self.entries.iter().filter(|e| e.data.is_some()).count(),
        }
    }
}
