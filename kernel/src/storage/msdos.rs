/// PC (msdos) partition tables.
///
/// Primary entries keep their slot number (0..3); logical partitions found
/// by following the extended-partition links are numbered from 4.
use super::block_device::SECTOR_SIZE;
use super::disk::Disk;
use super::partition::{Partition, PartitionHook, PartitionMap};
use crate::error::Result;
use crate::kernel::Kernel;

const SIGNATURE: u16 = 0xAA55;
const TABLE_OFFSET: usize = 0x1BE;
const ENTRY_SIZE: usize = 16;
/// Give up on extended chains longer than this.
const MAX_TABLES: usize = 64;

pub const TYPE_EMPTY: u8 = 0x00;
pub const TYPE_EXTENDED: u8 = 0x05;
pub const TYPE_WIN95_EXTENDED: u8 = 0x0F;
pub const TYPE_LINUX_EXTENDED: u8 = 0x85;

static_assertions::const_assert_eq!(TABLE_OFFSET + 4 * ENTRY_SIZE + 2, SECTOR_SIZE);

#[derive(Debug, Clone, Copy)]
struct Entry {
    flag: u8,
    kind: u8,
    start: u32,
    length: u32,
}

impl Entry {
    fn parse(raw: &[u8]) -> Self {
        Self {
            flag: raw[0],
            kind: raw[4],
            start: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            length: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    fn is_empty(&self) -> bool {
        self.kind == TYPE_EMPTY
    }
}

pub fn is_extended(kind: u8) -> bool {
    matches!(kind, TYPE_EXTENDED | TYPE_WIN95_EXTENDED | TYPE_LINUX_EXTENDED)
}

fn read_table(k: &mut Kernel, disk: &mut Disk, sector: u64) -> Result<[Entry; 4]> {
    let mut mbr = [0u8; SECTOR_SIZE];
    disk.read(k, sector, 0, &mut mbr)?;

    if u16::from_le_bytes([mbr[510], mbr[511]]) != SIGNATURE {
        return Err(crate::error!(BadPartTable, "no signature"));
    }
    let mut entries = [Entry { flag: 0, kind: 0, start: 0, length: 0 }; 4];
    for (i, entry) in entries.iter_mut().enumerate() {
        let at = TABLE_OFFSET + i * ENTRY_SIZE;
        *entry = Entry::parse(&mbr[at..at + ENTRY_SIZE]);
        if entry.flag & 0x7F != 0 {
            return Err(crate::error!(BadPartTable, "bad boot flag"));
        }
    }
    Ok(entries)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MsdosPartitionMap;

impl PartitionMap for MsdosPartitionMap {
    fn name(&self) -> &'static str {
        "msdos"
    }

    fn iterate(&self, k: &mut Kernel, disk: &mut Disk, hook: &mut PartitionHook<'_>) -> Result<()> {
        let mut p = Partition::new(self.name());
        let mut ext_offset = 0u64;
        // Number of the last partition seen; the first one gets 0.
        let mut number: i64 = -1;

        for _ in 0..MAX_TABLES {
            let entries = read_table(k, disk, p.offset)?;

            for (i, e) in entries.iter().enumerate() {
                p.start = p.offset + e.start as u64;
                p.len = e.length as u64;
                p.msdos_type = e.kind;
                p.index = i as u32;

                if !e.is_empty() && !is_extended(e.kind) {
                    number += 1;
                    p.number = number as u32;
                    log::trace!(
                        target: "partition",
                        "msdos{}: type {:#04x} start {:#x} len {:#x}",
                        number + 1,
                        e.kind,
                        p.start,
                        p.len
                    );
                    if hook(k, disk, &p) {
                        return Ok(());
                    }
                } else if number < 3 {
                    // Primary slots keep their numbers even when unused.
                    number += 1;
                }
            }

            match entries.iter().find(|e| is_extended(e.kind)) {
                Some(e) => {
                    p.offset = ext_offset + e.start as u64;
                    if ext_offset == 0 {
                        ext_offset = p.offset;
                    }
                }
                None => return Ok(()),
            }
        }

        log::debug!(target: "partition", "extended partition chain on `{}' too long", disk.name());
        Ok(())
    }
}
