/// Region allocator: first-fit over per-region free rings.
///
/// Every region registered at boot starts as one free block. Blocks carry an
/// in-band header one cell (`MM_ALIGN` bytes) long; sizes are counted in
/// cells and include the header. The free blocks of a region form a circular
/// list ordered by descending address, with a single wrap-around point from
/// the lowest block back to the highest. `first` is a search cursor into
/// that ring; when it points at an allocated block the region is full.
///
/// Region records live in a fixed table outside the managed memory, sorted
/// by ascending size so small regions are packed first.
use core::mem::size_of;
use core::ptr::{self, NonNull};

use crate::error::{Error, ErrorKind, Result};

const FREE_MAGIC: usize = 0x4652_4545;
const ALLOC_MAGIC: usize = 0x414C_4C4F;

/// Maximum number of regions the heap tracks.
pub const MAX_REGIONS: usize = 32;

#[repr(C)]
struct BlockHeader {
    next: *mut BlockHeader,
    /// Block size in cells, header included.
    size: usize,
    magic: usize,
    _pad: usize,
}

/// Allocation unit: one block header.
pub const MM_ALIGN: usize = size_of::<BlockHeader>();
const MM_ALIGN_LOG2: u32 = MM_ALIGN.trailing_zeros();

static_assertions::const_assert!(MM_ALIGN.is_power_of_two());
static_assertions::const_assert_eq!(MM_ALIGN, 4 * size_of::<usize>());

#[derive(Clone, Copy)]
struct Region {
    /// Address of the first cell.
    start: usize,
    /// Usable bytes, a multiple of `MM_ALIGN`.
    size: usize,
    first: *mut BlockHeader,
}

impl Region {
    const EMPTY: Region = Region { start: 0, size: 0, first: ptr::null_mut() };

    fn contains_user_ptr(&self, addr: usize) -> bool {
        addr > self.start && addr <= self.start + self.size
    }
}

/// Free/used totals across all regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub regions: usize,
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
}

impl HeapStats {
    pub fn used_bytes(&self) -> usize {
        self.total_bytes - self.free_bytes
    }
}

pub struct RegionHeap {
    regions: [Region; MAX_REGIONS],
    count: usize,
}

// Raw pointers only ever reference memory handed over in `init_region`.
unsafe impl Send for RegionHeap {}

impl Default for RegionHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionHeap {
    pub const fn new() -> Self {
        Self {
            regions: [Region::EMPTY; MAX_REGIONS],
            count: 0,
        }
    }

    /// Hand `[addr, addr + size)` to the allocator.
    ///
    /// # Safety
    /// The memory must be valid for reads and writes, unused by anything
    /// else, and stay that way for the lifetime of the heap.
    pub unsafe fn init_region(&mut self, addr: usize, size: usize) {
        log::debug!(target: "mm", "adding region {:#x} +{:#x}", addr, size);

        let start = match addr.checked_add(MM_ALIGN - 1) {
            Some(a) => a & !(MM_ALIGN - 1),
            None => return,
        };
        let end = addr.saturating_add(size) & !(MM_ALIGN - 1);
        if end <= start || end - start < MM_ALIGN {
            log::debug!(target: "mm", "region {:#x} too small, ignored", addr);
            return;
        }
        if self.count == MAX_REGIONS {
            log::warn!(target: "mm", "region table full, {:#x} ignored", addr);
            return;
        }

        let size = end - start;
        let head = start as *mut BlockHeader;
        unsafe {
            head.write(BlockHeader {
                next: head,
                size: size >> MM_ALIGN_LOG2,
                magic: FREE_MAGIC,
                _pad: 0,
            });
        }

        let pos = self.regions[..self.count]
            .iter()
            .position(|r| r.size > size)
            .unwrap_or(self.count);
        self.regions.copy_within(pos..self.count, pos + 1);
        self.regions[pos] = Region { start, size, first: head };
        self.count += 1;
    }

    pub fn region_count(&self) -> usize {
        self.count
    }

    /// `(start, size)` of every region in search order.
    pub fn regions(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.regions[..self.count].iter().map(|r| (r.start, r.size))
    }

    /// Allocate `size` bytes aligned to `align` bytes.
    pub fn memalign(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
        let oom = || Error::new(ErrorKind::OutOfMemory, "out of memory");

        let cells = size.checked_add(MM_ALIGN - 1).ok_or_else(oom)? >> MM_ALIGN_LOG2;
        let n = cells + 1;
        let align = (align >> MM_ALIGN_LOG2).max(1);
        if !align.is_power_of_two() {
            return Err(Error::new(ErrorKind::BadArgument, "alignment must be a power of two"));
        }
        if n.checked_add(align).is_none() {
            return Err(oom());
        }

        for region in self.regions[..self.count].iter_mut() {
            if let Some(p) = unsafe { alloc_from_ring(&mut region.first, n, align) } {
                return Ok(p);
            }
        }
        Err(oom())
    }

    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.memalign(0, size)
    }

    pub fn zalloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let p = self.malloc(size)?;
        unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    /// Usable bytes behind an allocated pointer.
    ///
    /// # Safety
    /// `ptr` must have come from this heap and still be allocated.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let (_, header) = unsafe { self.header_of(ptr) };
        unsafe { ((*header).size - 1) << MM_ALIGN_LOG2 }
    }

    /// Return a block to its region. Null is ignored.
    ///
    /// Corrupted metadata, foreign pointers and double frees abort.
    ///
    /// # Safety
    /// Nothing may use the allocation afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let (index, mut p) = unsafe { self.header_of(ptr) };
        let region = &mut self.regions[index];

        unsafe {
            if (*region.first).magic == ALLOC_MAGIC {
                (*p).magic = FREE_MAGIC;
                (*p).next = p;
                region.first = p;
                return;
            }

            let mut s = region.first;
            let mut q = (*s).next;
            while q <= p || (*q).next >= p {
                if (*q).magic != FREE_MAGIC {
                    panic!("free magic is broken at {:p}: {:#x}", q, (*q).magic);
                }
                if q <= (*q).next && (q > p || (*q).next < p) {
                    break;
                }
                s = q;
                q = (*s).next;
            }

            (*p).magic = FREE_MAGIC;
            (*p).next = (*q).next;
            (*q).next = p;

            let below = (*p).next;
            if below.wrapping_add((*below).size) == p {
                (*p).magic = 0;
                (*below).size += (*p).size;
                (*q).next = below;
                p = below;
            }

            if q == p.wrapping_add((*p).size) {
                (*q).magic = 0;
                (*p).size += (*q).size;
                if q == s {
                    s = p;
                }
                (*s).next = p;
                q = s;
            }

            region.first = q;
        }
    }

    /// Resize an allocation. Null behaves like `malloc`; a zero size frees
    /// and returns null.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this heap.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> Result<*mut u8> {
        if ptr.is_null() {
            return self.malloc(size).map(|p| p.as_ptr());
        }
        if size == 0 {
            unsafe { self.free(ptr) };
            return Ok(ptr::null_mut());
        }

        let cells = (size + MM_ALIGN - 1) >> MM_ALIGN_LOG2;
        let (_, header) = unsafe { self.header_of(ptr) };
        let have = unsafe { (*header).size };
        if have > cells {
            return Ok(ptr);
        }

        let fresh = self.malloc(size)?;
        let old = (have - 1) << MM_ALIGN_LOG2;
        unsafe {
            ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), old.min(size));
            self.free(ptr);
        }
        Ok(fresh.as_ptr())
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats { regions: self.count, ..HeapStats::default() };
        for region in &self.regions[..self.count] {
            stats.total_bytes += region.size;
            let first = region.first;
            unsafe {
                if (*first).magic == ALLOC_MAGIC {
                    continue;
                }
                let mut p = first;
                loop {
                    let bytes = (*p).size << MM_ALIGN_LOG2;
                    stats.free_bytes += bytes;
                    stats.free_blocks += 1;
                    stats.largest_free = stats.largest_free.max(bytes);
                    p = (*p).next;
                    if p == first {
                        break;
                    }
                }
            }
        }
        stats
    }

    /// Locate the region and header behind a user pointer.
    unsafe fn header_of(&self, ptr: *mut u8) -> (usize, *mut BlockHeader) {
        let addr = ptr as usize;
        if addr & (MM_ALIGN - 1) != 0 {
            panic!("unaligned pointer {:p}", ptr);
        }
        let index = match self.regions[..self.count]
            .iter()
            .position(|r| r.contains_user_ptr(addr))
        {
            Some(i) => i,
            None => panic!("out of range pointer {:p}", ptr),
        };

        let header = (addr - MM_ALIGN) as *mut BlockHeader;
        let magic = unsafe { (*header).magic };
        if magic == FREE_MAGIC {
            panic!("double free at {:p}", ptr);
        }
        if magic != ALLOC_MAGIC {
            panic!("alloc magic is broken at {:p}: {:#x}", header, magic);
        }
        (index, header)
    }
}

/// Carve `n` cells aligned to `align` cells out of one region's free ring.
///
/// On success the cursor is left on the predecessor of the consumed block.
unsafe fn alloc_from_ring(
    first: &mut *mut BlockHeader,
    n: usize,
    align: usize,
) -> Option<NonNull<u8>> {
    unsafe {
        if (**first).magic == ALLOC_MAGIC {
            return None;
        }

        let mut q = *first;
        let mut p = (*q).next;
        loop {
            let mut extra = ((p.wrapping_add(1) as usize) >> MM_ALIGN_LOG2) & (align - 1);
            if extra != 0 {
                extra = align - extra;
            }

            if p.is_null() {
                panic!("null in the ring");
            }
            if (*p).magic != FREE_MAGIC {
                panic!("free magic is broken at {:p}: {:#x}", p, (*p).magic);
            }

            if (*p).size >= n + extra {
                extra += ((*p).size - extra - n) & !(align - 1);

                if extra == 0 && (*p).size == n {
                    // Exact fit: unlink.
                    (*q).next = (*p).next;
                } else if align == 1 || (*p).size == n + extra {
                    // Take the tail.
                    (*p).size -= n;
                    p = p.add((*p).size);
                } else if extra == 0 {
                    // Take the head, the rest stays free.
                    let r = p.add(n);
                    r.write(BlockHeader {
                        next: (*p).next,
                        size: (*p).size - n,
                        magic: FREE_MAGIC,
                        _pad: 0,
                    });
                    (*q).next = r;
                    if q == p {
                        q = r;
                        (*r).next = r;
                    }
                } else {
                    // Padding in front, remainder behind.
                    let r = p.add(extra + n);
                    r.write(BlockHeader {
                        next: p,
                        size: (*p).size - extra - n,
                        magic: FREE_MAGIC,
                        _pad: 0,
                    });
                    (*p).size = extra;
                    (*q).next = r;
                    p = p.add(extra);
                }

                (*p).magic = ALLOC_MAGIC;
                (*p).size = n;
                *first = q;
                return NonNull::new(p.add(1) as *mut u8);
            }

            if p == *first {
                break;
            }
            q = p;
            p = (*p).next;
        }
        None
    }
}
