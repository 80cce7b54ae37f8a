/// Disk handles: open by name, cached reads, write-through writes.
///
/// Callers address a disk in canonical 512-byte sectors relative to the
/// handle's partition. Every transfer is first turned into an absolute
/// canonical range (`adjust_range`), then served from the sector cache or
/// the device, which works in its own native sector size.
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec;

use super::block_device::{BlockDevice, SECTOR_BITS, SECTOR_SIZE};
use super::cache::{CACHE_BITS, CACHE_GROUP_BYTES, CACHE_SECTORS};
use super::partition::{self, Partition};
use crate::error::{Error, ErrorKind, Result};
use crate::kernel::Kernel;

/// Called after a read for every canonical sector touched:
/// `(sector, offset, length)`.
pub type ReadHook = Box<dyn FnMut(u64, usize, usize)>;

pub struct Disk {
    name: String,
    dev_class: u32,
    device: Box<dyn BlockDevice>,
    log_sector_size: u32,
    /// Native sectors.
    total_sectors: Option<u64>,
    pub(crate) partition: Option<Box<Partition>>,
    read_hook: Option<ReadHook>,
}

impl core::fmt::Debug for Disk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Disk")
            .field("name", &self.name)
            .field("dev_class", &self.dev_class)
            .field("log_sector_size", &self.log_sector_size)
            .field("total_sectors", &self.total_sectors)
            .field("partition", &self.partition.as_deref().map(Partition::name))
            .finish()
    }
}

/// Split `hd0,msdos1` at the first comma not escaped with a backslash.
pub fn split_partition(name: &str) -> (&str, Option<&str>) {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if bytes.get(i + 1) == Some(&b',') => i += 2,
            b',' => return (&name[..i], Some(&name[i + 1..])),
            _ => i += 1,
        }
    }
    (name, None)
}

impl Disk {
    /// Open `name` (`hd0`, `hd0,msdos1`, ...); empty means the root device.
    pub fn open(k: &mut Kernel, name: &str) -> Result<Disk> {
        let name = if name.is_empty() {
            k.config
                .root
                .clone()
                .ok_or_else(|| crate::error!(BadDevice, "variable `root' isn't set"))?
        } else {
            name.to_string()
        };
        log::debug!(target: "disk", "opening `{}'...", name);

        let (raw, part_names) = split_partition(&name);
        let mark = k.errors.depth();
        let mut found = None;
        for driver in k.disk_drivers.clone() {
            match driver.open(raw) {
                Ok(device) => {
                    found = Some((driver.id(), device));
                    break;
                }
                Err(err) if err.kind() == ErrorKind::UnknownDevice => k.errors.save(err),
                Err(err) => {
                    log::debug!(target: "disk", "opening `{}' failed: {}", name, err);
                    k.errors.unwind_to(mark);
                    return Err(err);
                }
            }
        }
        k.errors.unwind_to(mark);
        let (dev_class, mut device) = match found {
            Some(found) => found,
            None => return Err(crate::error!(UnknownDevice, "disk `{}' not found", name)),
        };

        let log_sector_size = device.log_block_size();
        if !(SECTOR_BITS..=SECTOR_BITS + CACHE_BITS).contains(&log_sector_size) {
            device.close();
            return Err(crate::error!(
                NotImplementedYet,
                "sector sizes of {} bytes aren't supported yet",
                1u64 << log_sector_size
            ));
        }

        let mut disk = Disk {
            name: raw.to_string(),
            dev_class,
            total_sectors: device.total_blocks(),
            device,
            log_sector_size,
            partition: None,
            read_hook: None,
        };

        if let Some(names) = part_names {
            match partition::probe(k, &mut disk, names) {
                Ok(part) => disk.partition = Some(part),
                Err(err) => {
                    disk.close(k);
                    return Err(err);
                }
            }
        }

        let now = k.clock.now_ms();
        if now > k.last_disk_activity + k.config.cache_timeout_ms {
            k.invalidate_disk_cache();
        }
        k.last_disk_activity = now;

        log::debug!(target: "disk", "opening `{}' succeeded", name);
        Ok(disk)
    }

    pub fn close(mut self, k: &mut Kernel) {
        log::debug!(target: "disk", "closing `{}'", self.name);
        self.device.close();
        k.last_disk_activity = k.clock.now_ms();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dev_class(&self) -> u32 {
        self.dev_class
    }

    pub fn dev_id(&self) -> u32 {
        self.device.disk_id()
    }

    pub fn log_sector_size(&self) -> u32 {
        self.log_sector_size
    }

    /// Total size in native sectors, if the device knows it.
    pub fn total_sectors(&self) -> Option<u64> {
        self.total_sectors
    }

    pub fn partition(&self) -> Option<&Partition> {
        self.partition.as_deref()
    }

    /// Absolute canonical sector where this handle's view starts.
    pub fn partition_start(&self) -> u64 {
        self.partition.as_deref().map_or(0, Partition::absolute_start)
    }

    pub fn set_read_hook(&mut self, hook: Option<ReadHook>) {
        self.read_hook = hook;
    }

    /// Size in canonical sectors: the partition length, else the whole disk.
    pub fn get_size(&self) -> Option<u64> {
        match &self.partition {
            Some(part) => Some(part.len),
            None => self
                .total_sectors
                .map(|total| total << (self.log_sector_size - SECTOR_BITS)),
        }
    }

    // ---- Addressing ----

    /// Turn a handle-relative `(sector, offset)` into an absolute canonical
    /// position, checking every partition level and the disk end.
    pub fn adjust_range(&self, sector: u64, offset: usize, size: usize) -> Result<(u64, usize)> {
        let outside_partition = || crate::error!(OutOfRange, "attempt to read or write outside of partition");
        let outside_disk = || crate::error!(OutOfRange, "attempt to read or write outside of disk `{}'", self.name);
        let mut sector = sector
            .checked_add((offset >> SECTOR_BITS) as u64)
            .ok_or_else(outside_disk)?;
        let offset = offset & (SECTOR_SIZE - 1);
        let span = offset
            .checked_add(size)
            .and_then(|end| end.checked_add(SECTOR_SIZE - 1))
            .map(|end| (end >> SECTOR_BITS) as u64)
            .ok_or_else(outside_disk)?;

        let mut part = self.partition.as_deref();
        while let Some(p) = part {
            if sector >= p.len || p.len - sector < span {
                return Err(outside_partition());
            }
            sector = sector.checked_add(p.start).ok_or_else(outside_partition)?;
            part = p.parent.as_deref();
        }

        if let Some(total) = self.total_sectors {
            let total = total << (self.log_sector_size - SECTOR_BITS);
            if total <= sector || span > total - sector {
                return Err(outside_disk());
            }
        }
        Ok((sector, offset))
    }

    /// Canonical sector to native sector.
    fn native(&self, sector: u64) -> u64 {
        sector >> (self.log_sector_size - SECTOR_BITS)
    }

    // ---- Reading ----

    /// Read `buf.len()` bytes starting `offset` bytes into `sector`.
    pub fn read(&mut self, k: &mut Kernel, sector: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        let (mut sector, mut offset) = self.adjust_range(sector, offset, buf.len()).map_err(|err| {
            log::debug!(target: "disk", "read out of range: sector {:#x}+{:#x}", sector, buf.len());
            err
        })?;
        let (real_sector, real_offset) = (sector, offset);
        let mut pos = 0;

        // Leading partial group.
        if offset != 0 || sector & (CACHE_SECTORS - 1) != 0 {
            let start = sector & !(CACHE_SECTORS - 1);
            let in_group = ((sector - start) << SECTOR_BITS) as usize + offset;
            let len = (CACHE_GROUP_BYTES - in_group).min(buf.len());
            self.read_small(k, start, in_group, &mut buf[..len])?;
            pos = len;
            offset += len;
            sector += (offset >> SECTOR_BITS) as u64;
            offset &= SECTOR_SIZE - 1;
        }

        // Whole groups.
        while buf.len() - pos >= CACHE_GROUP_BYTES {
            let groups = (buf.len() - pos) / CACHE_GROUP_BYTES;
            let mut run = 0;
            let mut cached = false;
            while run < groups {
                let group = sector + ((run as u64) << CACHE_BITS);
                if let Some(data) = k.cache.fetch(self.dev_class, self.dev_id(), group) {
                    let at = pos + run * CACHE_GROUP_BYTES;
                    buf[at..at + CACHE_GROUP_BYTES].copy_from_slice(data);
                    k.cache.unlock(self.dev_class, self.dev_id(), group);
                    cached = true;
                    break;
                }
                run += 1;
            }

            if run > 0 {
                let bytes = run * CACHE_GROUP_BYTES;
                let native = self.native(sector);
                let count = bytes >> self.log_sector_size;
                self.device.read_blocks(native, count, &mut buf[pos..pos + bytes])?;
                for i in 0..run {
                    let chunk = &buf[pos + i * CACHE_GROUP_BYTES..pos + (i + 1) * CACHE_GROUP_BYTES];
                    let group = sector + ((i as u64) << CACHE_BITS);
                    let _ = k.cache.store(k.heap, self.dev_class, self.dev_id(), group, chunk);
                }
                sector += (run as u64) << CACHE_BITS;
                pos += bytes;
            }

            if cached {
                sector += CACHE_SECTORS;
                pos += CACHE_GROUP_BYTES;
            }
        }

        // Trailing partial group.
        if pos < buf.len() {
            self.read_small(k, sector, offset, &mut buf[pos..])?;
        }

        if let Some(hook) = self.read_hook.as_mut() {
            let (mut s, mut o, mut left) = (real_sector, real_offset, buf.len());
            while left > 0 {
                let len = (SECTOR_SIZE - o).min(left);
                hook(s, o, len);
                s += 1;
                left -= len;
                o = 0;
            }
        }
        Ok(())
    }

    /// Serve a read that stays inside the group starting at `sector`.
    fn read_small(&mut self, k: &mut Kernel, sector: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        let (dev_class, dev_id) = (self.dev_class, self.dev_id());
        if let Some(data) = k.cache.fetch(dev_class, dev_id, sector) {
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
            k.cache.unlock(dev_class, dev_id, sector);
            return Ok(());
        }

        let total = self
            .total_sectors
            .map(|total| total << (self.log_sector_size - SECTOR_BITS));
        if total.map_or(true, |total| sector + CACHE_SECTORS <= total) {
            let mut group = vec![0u8; CACHE_GROUP_BYTES];
            let count = CACHE_GROUP_BYTES >> self.log_sector_size;
            match self.device.read_blocks(self.native(sector), count, &mut group) {
                Ok(()) => {
                    buf.copy_from_slice(&group[offset..offset + buf.len()]);
                    let _ = k.cache.store(k.heap, dev_class, dev_id, sector, &group);
                    return Ok(());
                }
                Err(err) => {
                    log::debug!(target: "disk", "group read at {:#x} failed ({}), reading exact range", sector, err);
                }
            }
        }

        // Exact range, uncached.
        let sector = sector + (offset >> SECTOR_BITS) as u64;
        let offset = offset & (SECTOR_SIZE - 1);
        let ratio = (1u64 << (self.log_sector_size - SECTOR_BITS)) - 1;
        let aligned = sector & !ratio;
        let offset = offset + ((sector - aligned) << SECTOR_BITS) as usize;
        let native_size = 1usize << self.log_sector_size;
        let count = (offset + buf.len()).div_ceil(native_size);

        let mut tmp = vec![0u8; count * native_size];
        self.device.read_blocks(self.native(aligned), count, &mut tmp)?;
        buf.copy_from_slice(&tmp[offset..offset + buf.len()]);
        Ok(())
    }

    // ---- Writing ----

    /// Write `buf` starting `offset` bytes into `sector`. Nothing is cached
    /// on the way out; every touched group is invalidated.
    pub fn write(&mut self, k: &mut Kernel, sector: u64, offset: usize, buf: &[u8]) -> Result<()> {
        log::debug!(target: "disk", "writing `{}' at {:#x}+{:#x}", self.name, sector, buf.len());
        let (sector, offset) = self.adjust_range(sector, offset, buf.len())?;

        let shift = self.log_sector_size - SECTOR_BITS;
        let native_size = 1usize << self.log_sector_size;
        let aligned = sector & !((1u64 << shift) - 1);
        let mut offset = offset + ((sector - aligned) << SECTOR_BITS) as usize;
        let mut sector = aligned;
        let mut rest = buf;
        let (dev_class, dev_id) = (self.dev_class, self.dev_id());

        while !rest.is_empty() {
            if offset != 0 || rest.len() < native_size {
                // Partial native sector: read it back absolutely and patch it.
                let mut tmp = vec![0u8; native_size];
                let part = self.partition.take();
                let hook = self.read_hook.take();
                let res = self.read(k, sector, 0, &mut tmp);
                self.partition = part;
                self.read_hook = hook;
                res?;

                let len = (native_size - offset).min(rest.len());
                tmp[offset..offset + len].copy_from_slice(&rest[..len]);
                k.cache.invalidate(k.heap, dev_class, dev_id, sector);
                self.device
                    .write_blocks(self.native(sector), 1, &tmp)
                    .map_err(|err| write_error(sector, err))?;

                sector += 1 << shift;
                rest = &rest[len..];
                offset = 0;
            } else {
                let len = rest.len() & !(native_size - 1);
                let count = len >> self.log_sector_size;
                self.device
                    .write_blocks(self.native(sector), count, &rest[..len])
                    .map_err(|err| write_error(sector, err))?;
                for i in 0..count as u64 {
                    k.cache.invalidate(k.heap, dev_class, dev_id, sector + (i << shift));
                }
                sector += (count as u64) << shift;
                rest = &rest[len..];
            }
        }
        Ok(())
    }
}

fn write_error(sector: u64, err: Error) -> Error {
    if err.kind() == ErrorKind::WriteError {
        err
    } else {
        crate::error!(WriteError, "failure writing sector {:#x}: {}", sector, err)
    }
}
