/// Partitions: chains, probing by name and enumeration.
///
/// A partition name such as `msdos1,bsd2` is resolved one token at a time:
/// each token is looked up inside the partition resolved by the previous
/// one, so the result is a chain from the innermost partition up to the
/// raw disk. User-facing numbers are 1-based, stored numbers 0-based.
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::disk::Disk;
use crate::error::{ErrorKind, Result};
use crate::kernel::Kernel;

/// Visitor passed to `PartitionMap::iterate`; returning true stops.
pub type PartitionHook<'a> = dyn FnMut(&mut Kernel, &mut Disk, &Partition) -> bool + 'a;

/// A partition table format.
pub trait PartitionMap {
    fn name(&self) -> &'static str;

    /// Report every partition of the table found in `disk`'s current view.
    ///
    /// A missing or foreign table is `BadPartTable`.
    fn iterate(&self, k: &mut Kernel, disk: &mut Disk, hook: &mut PartitionHook<'_>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// 0-based number within its table.
    pub number: u32,
    /// Canonical sectors, relative to the parent.
    pub start: u64,
    pub len: u64,
    /// Sector of the table that describes this partition.
    pub offset: u64,
    /// Slot within that table.
    pub index: u32,
    pub partmap: &'static str,
    pub msdos_type: u8,
    pub parent: Option<Box<Partition>>,
}

impl Partition {
    pub fn new(partmap: &'static str) -> Self {
        Self {
            number: 0,
            start: 0,
            len: 0,
            offset: 0,
            index: 0,
            partmap,
            msdos_type: 0,
            parent: None,
        }
    }

    /// Start on the raw disk, in canonical sectors.
    pub fn absolute_start(&self) -> u64 {
        let mut start = self.start;
        let mut part = self.parent.as_deref();
        while let Some(p) = part {
            start += p.start;
            part = p.parent.as_deref();
        }
        start
    }

    /// Chain name, outermost first: `msdos1,bsd2`.
    pub fn name(&self) -> String {
        let mut names = Vec::new();
        let mut part = Some(self);
        while let Some(p) = part {
            names.push(format!("{}{}", p.partmap, p.number + 1));
            part = p.parent.as_deref();
        }
        names.reverse();
        names.join(",")
    }
}

/// Whether `part` fits inside the view `disk` currently has.
pub fn check_containment(disk: &Disk, part: &Partition) -> bool {
    let end = part.start.saturating_add(part.len);
    match disk.partition.as_deref() {
        Some(parent) if end > parent.len => {
            log::debug!(
                target: "partition",
                "{} is outside of its parent {} ({:#x} > {:#x})",
                part.name(),
                parent.name(),
                end,
                parent.len
            );
            false
        }
        Some(_) => true,
        None => match disk.get_size() {
            Some(total) if end > total => {
                log::debug!(
                    target: "partition",
                    "{} is outside of disk `{}' ({:#x} > {:#x})",
                    part.name(),
                    disk.name(),
                    end,
                    total
                );
                false
            }
            _ => true,
        },
    }
}

/// Split a token like `msdos1` into map name and 0-based number.
fn parse_token(token: &str) -> Option<(&str, u32)> {
    let split = token
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(token.len());
    let (name, digits) = token.split_at(split);
    let number = match digits.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u32>().ok()?,
    };
    Some((name, number.checked_sub(1)?))
}

/// Find partition `number` of one map inside the disk's current view.
fn map_probe(
    k: &mut Kernel,
    disk: &mut Disk,
    map: &dyn PartitionMap,
    number: u32,
) -> Result<Option<Partition>> {
    let mut found = None;
    map.iterate(k, disk, &mut |_, disk, part| {
        if part.number == number && check_containment(disk, part) {
            found = Some(part.clone());
            true
        } else {
            false
        }
    })?;
    Ok(found)
}

/// Resolve a partition chain such as `msdos1` or `msdos5,bsd1` on `disk`.
///
/// The chain is built on top of whatever partition the disk already has.
pub fn probe(k: &mut Kernel, disk: &mut Disk, names: &str) -> Result<Box<Partition>> {
    let tail = disk.partition.take();
    let mark = k.errors.depth();

    let result = resolve_chain(k, disk, names, tail.clone());

    disk.partition = tail;
    k.errors.unwind_to(mark);
    result
}

fn resolve_chain(
    k: &mut Kernel,
    disk: &mut Disk,
    names: &str,
    mut chain: Option<Box<Partition>>,
) -> Result<Box<Partition>> {
    let no_such = || crate::error!(UnknownDevice, "no such partition");

    for token in names.split(',') {
        let (map_name, number) = parse_token(token).ok_or_else(no_such)?;
        let mut resolved = None;

        for map in k.partition_maps.clone() {
            if !map_name.is_empty() && map.name() != map_name {
                continue;
            }
            disk.partition = chain.take();
            let res = map_probe(k, disk, map.as_ref(), number);
            chain = disk.partition.take();
            match res {
                Ok(Some(part)) => {
                    resolved = Some(part);
                    break;
                }
                Ok(None) => break,
                Err(err) if err.kind() == ErrorKind::BadPartTable => k.errors.save(err),
                Err(err) => return Err(err),
            }
        }

        let mut part = resolved.ok_or_else(no_such)?;
        part.parent = chain.take();
        chain = Some(Box::new(part));
    }
    chain.ok_or_else(no_such)
}

/// Visit every partition on `disk`, descending into nested tables.
///
/// The hook sees each partition with its full parent chain while the
/// disk's own view is detached. Returns true if the hook stopped the walk.
pub fn iterate(k: &mut Kernel, disk: &mut Disk, hook: &mut PartitionHook<'_>) -> bool {
    let mut stop = false;
    for map in k.partition_maps.clone() {
        let res = map.iterate(k, disk, &mut |k, disk, part| visit(k, disk, part, &mut *hook, &mut stop));
        if let Err(err) = res {
            log::trace!(target: "partition", "{} on `{}': {}", map.name(), disk.name(), err);
        }
        if stop {
            break;
        }
    }
    stop
}

fn visit(
    k: &mut Kernel,
    disk: &mut Disk,
    part: &Partition,
    hook: &mut PartitionHook<'_>,
    stop: &mut bool,
) -> bool {
    if !check_containment(disk, part) {
        return false;
    }
    let mut current = part.clone();
    current.parent = disk.partition.take();

    if hook(k, disk, &current) {
        *stop = true;
    } else if current.start != 0 {
        disk.partition = Some(Box::new(current));
        for map in k.partition_maps.clone() {
            let res = map.iterate(k, disk, &mut |k, disk, part| visit(k, disk, part, &mut *hook, &mut *stop));
            if let Err(err) = res {
                log::trace!(target: "partition", "nested {}: {}", map.name(), err);
            }
            if *stop {
                break;
            }
        }
        current = match disk.partition.take() {
            Some(boxed) => *boxed,
            None => return *stop,
        };
    }

    disk.partition = current.parent.take();
    *stop
}
