/// Shared fixtures for the unit tests.
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;

use crate::config::BootConfig;
use crate::device::Device;
use crate::error::Result;
use crate::fs::{DirEntryInfo, DirHook, File, FileSystem};
use crate::kernel::Kernel;
use crate::mem::LockedHeap;
use crate::storage::{MemDisk, MsdosPartitionMap};

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Chunk([u8; 64]);

/// A heap over a leaked buffer of `size` bytes.
pub fn leak_heap(size: usize) -> &'static LockedHeap {
    let chunks = vec![Chunk([0; 64]); size / 64];
    let base = chunks.leak().as_mut_ptr() as usize;
    let heap = Box::leak(Box::new(LockedHeap::new()));
    unsafe { heap.init_region(base, size) };
    heap
}

/// Kernel with a memdisk driver, the msdos map and a hand-driven clock.
pub struct TestBed {
    pub k: Kernel,
    pub mem: Rc<MemDisk>,
    pub clock: Rc<Cell<u64>>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_heap(4 << 20)
    }

    pub fn with_heap(size: usize) -> Self {
        let mut k = Kernel::new(leak_heap(size), BootConfig::default());
        let clock = Rc::new(Cell::new(0u64));
        let source = clock.clone();
        k.install_clock(Box::new(move || source.get()));

        let mem = Rc::new(MemDisk::new());
        k.register_disk_driver(mem.clone());
        k.register_partition_map(Rc::new(MsdosPartitionMap));
        Self { k, mem, clock }
    }
}

/// Bytes that differ from sector to sector and within a sector.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 512) as u8).collect()
}

/// One 16-byte msdos table entry.
pub fn mbr_entry(kind: u8, start: u32, len: u32) -> [u8; 16] {
    let mut e = [0u8; 16];
    e[4] = kind;
    e[8..12].copy_from_slice(&start.to_le_bytes());
    e[12..16].copy_from_slice(&len.to_le_bytes());
    e
}

/// Write a partition table with up to four entries into `sector`.
pub fn write_table(image: &mut [u8], sector: u64, entries: &[(u8, u32, u32)]) {
    let base = sector as usize * 512;
    for (i, &(kind, start, len)) in entries.iter().enumerate() {
        let at = base + 0x1BE + i * 16;
        image[at..at + 16].copy_from_slice(&mbr_entry(kind, start, len));
    }
    image[base + 510] = 0x55;
    image[base + 511] = 0xAA;
}

// ---- Flat test filesystem ----
//
// Sector 0: "FLATFS01", entry count (u32 LE) at 8, then 64-byte entries
// from 16: name (48 bytes, NUL padded), start sector, size in bytes.

const FLAT_MAGIC: &[u8; 8] = b"FLATFS01";
const FLAT_ENTRY: usize = 64;
const FLAT_NAME: usize = 48;

/// A single-directory filesystem whose names may contain `/`.
pub struct FlatFs;

struct FlatEntry {
    name: String,
    start: u64,
    size: u64,
}

fn le32(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

impl FlatFs {
    fn entries(k: &mut Kernel, device: &mut Device) -> Result<Vec<FlatEntry>> {
        let mut sector = [0u8; 512];
        device.disk_mut().read(k, 0, 0, &mut sector)?;
        if &sector[..8] != FLAT_MAGIC {
            return Err(crate::error!(BadFs, "not a flatfs filesystem"));
        }
        let count = le32(&sector[8..]) as usize;
        Ok(sector[16..]
            .chunks(FLAT_ENTRY)
            .take(count)
            .map(|raw| {
                let end = raw[..FLAT_NAME].iter().position(|&b| b == 0).unwrap_or(FLAT_NAME);
                FlatEntry {
                    name: String::from_utf8_lossy(&raw[..end]).to_string(),
                    start: le32(&raw[FLAT_NAME..]) as u64,
                    size: le32(&raw[FLAT_NAME + 4..]) as u64,
                }
            })
            .collect())
    }
}

impl FileSystem for FlatFs {
    fn name(&self) -> &'static str {
        "flatfs"
    }

    fn dir(&self, k: &mut Kernel, device: &mut Device, path: &str, hook: &mut DirHook<'_>) -> Result<()> {
        let entries = Self::entries(k, device)?;
        if path != "/" {
            return Err(crate::error!(FileNotFound, "file `{}' not found", path));
        }
        for e in &entries {
            if hook(&e.name, &DirEntryInfo::default()) {
                break;
            }
        }
        Ok(())
    }

    fn open(&self, k: &mut Kernel, file: &mut File, path: &str) -> Result<()> {
        let name = path.trim_start_matches('/');
        let entry = Self::entries(k, &mut file.device)?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| crate::error!(FileNotFound, "file `{}' not found", path))?;
        file.size = entry.size;
        file.data = Some(Box::new(entry.start));
        Ok(())
    }

    fn read(&self, k: &mut Kernel, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        let start = file
            .data
            .as_ref()
            .and_then(|d| d.downcast_ref::<u64>())
            .copied()
            .ok_or_else(|| crate::error!(BadFs, "no start sector"))?;
        let offset = file.offset() as usize;
        file.device.disk_mut().read(k, start, offset, buf)?;
        Ok(buf.len())
    }
}

/// A flatfs image holding `files`, each starting on its own sector.
pub fn flatfs_image(files: &[(&str, &[u8])]) -> Vec<u8> {
    let sectors: usize = 1 + files.iter().map(|(_, d)| d.len().div_ceil(512)).sum::<usize>();
    let mut image = vec![0u8; sectors.max(8) * 512];
    image[..8].copy_from_slice(FLAT_MAGIC);
    image[8..12].copy_from_slice(&(files.len() as u32).to_le_bytes());

    let mut next = 1usize;
    for (i, (name, data)) in files.iter().enumerate() {
        let at = 16 + i * FLAT_ENTRY;
        image[at..at + name.len()].copy_from_slice(name.as_bytes());
        image[at + FLAT_NAME..at + FLAT_NAME + 4].copy_from_slice(&(next as u32).to_le_bytes());
        image[at + FLAT_NAME + 4..at + FLAT_NAME + 8].copy_from_slice(&(data.len() as u32).to_le_bytes());
        image[next * 512..next * 512 + data.len()].copy_from_slice(data);
        next += data.len().div_ceil(512);
    }
    image
}
