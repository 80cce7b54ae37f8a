/// Blocklist files: `0+4,8+2` names four sectors at 0 followed by two at 8.
///
/// A run is `[offset]+length` in 512-byte sectors relative to the device's
/// partition; a missing offset means 0. Offsets and lengths take decimal
/// or `0x` hex.
use alloc::boxed::Box;
use alloc::vec::Vec;

use super::{DirHook, File, FileSystem};
use crate::device::Device;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::storage::block_device::SECTOR_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    pub offset: u64,
    pub length: u64,
}

/// Parse a leading number; returns it with the rest of the input.
fn number(s: &str) -> Option<(u64, &str)> {
    let (radix, body) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (16, hex),
        None => (10, s),
    };
    let end = body
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(body.len());
    let value = u64::from_str_radix(&body[..end], radix).ok()?;
    Some((value, &body[end..]))
}

/// Parse a blocklist, checking every run against `total` sectors if known.
pub fn parse(name: &str, total: Option<u64>) -> Result<Vec<BlockRun>> {
    let invalid = || crate::error!(BadFilename, "invalid file name `{}'", name);
    let mut runs = Vec::new();

    for item in name.split(',') {
        let item = item.trim_end();
        let (offset, rest) = if item.starts_with('+') {
            (0, item)
        } else {
            number(item).ok_or_else(invalid)?
        };
        let rest = rest.strip_prefix('+').ok_or_else(invalid)?;
        let (length, rest) = number(rest).ok_or_else(invalid)?;
        if length == 0 || !rest.is_empty() {
            return Err(invalid());
        }

        let end = offset.checked_add(length).ok_or_else(invalid)?;
        if total.is_some_and(|total| end > total) {
            return Err(crate::error!(BadFilename, "beyond the total sectors"));
        }
        runs.push(BlockRun { offset, length });
    }
    Ok(runs)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Blocklist;

impl FileSystem for Blocklist {
    fn name(&self) -> &'static str {
        "blocklist"
    }

    fn dir(&self, _k: &mut Kernel, _device: &mut Device, _path: &str, _hook: &mut DirHook<'_>) -> Result<()> {
        Err(crate::error!(BadFs, "blocklists have no directories"))
    }

    fn open(&self, _k: &mut Kernel, file: &mut File, path: &str) -> Result<()> {
        let runs = parse(path, file.device.disk().get_size())?;
        file.size = runs.iter().map(|r| r.length << SECTOR_BITS).sum();
        file.data = Some(Box::new(runs));
        Ok(())
    }

    fn read(&self, k: &mut Kernel, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        let mut pos = file.offset();
        let runs = file
            .data
            .as_ref()
            .and_then(|d| d.downcast_ref::<Vec<BlockRun>>())
            .ok_or_else(|| crate::error!(BadArgument, "file is not a blocklist"))?;
        let disk = file.device.disk_mut();

        let mut done = 0;
        for run in runs {
            if done == buf.len() {
                break;
            }
            let run_bytes = run.length << SECTOR_BITS;
            if pos >= run_bytes {
                pos -= run_bytes;
                continue;
            }
            let n = ((run_bytes - pos) as usize).min(buf.len() - done);
            disk.read(k, run.offset, pos as usize, &mut buf[done..done + n])?;
            done += n;
            pos = 0;
        }
        Ok(done)
    }
}
