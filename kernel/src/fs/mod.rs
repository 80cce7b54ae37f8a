/// Filesystem dispatch.
///
/// Filesystem drivers register with the `Kernel`; `probe` finds the one
/// that understands a device by asking each to list `/`. Files opened
/// through `file::File` are served by the driver `probe` picked, or by the
/// built-in blocklist driver for names that are sector runs.
pub mod blocklist;
pub mod file;

use alloc::rc::Rc;
use alloc::string::String;

use crate::device::Device;
use crate::error::{ErrorKind, Result};
use crate::kernel::Kernel;

pub use blocklist::Blocklist;
pub use file::File;

bitflags::bitflags! {
    /// What a directory listing knows about an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirFlags: u32 {
        const DIRECTORY        = 1 << 0;
        const CASE_INSENSITIVE = 1 << 1;
        const MTIME_SET        = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub flags: DirFlags,
    /// Seconds since the epoch, valid with `MTIME_SET`.
    pub mtime: i64,
}

impl DirEntryInfo {
    pub fn is_dir(&self) -> bool {
        self.flags.contains(DirFlags::DIRECTORY)
    }
}

/// Called per directory entry; returning true stops the listing.
pub type DirHook<'a> = dyn FnMut(&str, &DirEntryInfo) -> bool + 'a;

/// A filesystem driver.
///
/// A driver that does not recognise a device answers `dir` with `BadFs`
/// (or `OutOfRange` when the device is too small to hold it).
pub trait FileSystem {
    fn name(&self) -> &'static str;

    fn dir(&self, k: &mut Kernel, device: &mut Device, path: &str, hook: &mut DirHook<'_>) -> Result<()>;

    /// Prepare `file` for reading `path`: set `file.size` and any private
    /// state in `file.data`.
    fn open(&self, k: &mut Kernel, file: &mut File, path: &str) -> Result<()>;

    /// Read at `file.offset()`; `buf` never reaches past the end of file.
    fn read(&self, k: &mut Kernel, file: &mut File, buf: &mut [u8]) -> Result<usize>;

    fn close(&self, _file: &mut File) {}

    fn label(&self, _k: &mut Kernel, _device: &mut Device) -> Result<Option<String>> {
        Ok(None)
    }
}

impl core::fmt::Debug for dyn FileSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FileSystem({})", self.name())
    }
}

/// Whether a failed `dir("/")` just means "not this filesystem".
fn is_mismatch(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::BadFs | ErrorKind::OutOfRange)
}

/// Result of asking one driver about a device.
enum Detect {
    Found,
    Mismatch,
}

fn detect(k: &mut Kernel, fs: &dyn FileSystem, device: &mut Device) -> Result<Detect> {
    log::debug!(target: "fs", "detecting {}...", fs.name());
    match fs.dir(k, device, "/", &mut |_, _| true) {
        Ok(()) => Ok(Detect::Found),
        Err(err) if is_mismatch(err.kind()) => {
            log::debug!(target: "fs", "{} detection failed", fs.name());
            k.errors.save(err);
            Ok(Detect::Mismatch)
        }
        Err(err) => Err(err),
    }
}

/// Find the filesystem driver for `device`.
pub fn probe(k: &mut Kernel, device: &mut Device) -> Result<Rc<dyn FileSystem>> {
    let mark = k.errors.depth();
    let result = probe_registered(k, device);
    k.errors.unwind_to(mark);
    result
}

fn probe_registered(k: &mut Kernel, device: &mut Device) -> Result<Rc<dyn FileSystem>> {
    for fs in k.filesystems.clone() {
        if let Detect::Found = detect(k, fs.as_ref(), device)? {
            return Ok(fs);
        }
    }

    // The hook is out of the kernel while it runs, so a probe it triggers
    // does not autoload again.
    if let Some(mut autoload) = k.fs_autoload.take() {
        let found = autoload_probe(k, &mut autoload, device);
        if k.fs_autoload.is_none() {
            k.fs_autoload = Some(autoload);
        }
        if let Some(fs) = found? {
            return Ok(fs);
        }
    }

    Err(crate::error!(UnknownFs, "unknown filesystem"))
}

fn autoload_probe(
    k: &mut Kernel,
    autoload: &mut crate::kernel::FsAutoload,
    device: &mut Device,
) -> Result<Option<Rc<dyn FileSystem>>> {
    while autoload(k) {
        let fs = match k.filesystems.last() {
            Some(fs) => fs.clone(),
            None => break,
        };
        if let Detect::Found = detect(k, fs.as_ref(), device)? {
            return Ok(Some(fs));
        }
    }
    Ok(None)
}
