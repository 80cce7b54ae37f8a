/// Files: `(device)path` names, sequential reads, seeking.
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;

use super::{Blocklist, FileSystem};
use crate::device::Device;
use crate::error::Result;
use crate::kernel::Kernel;

pub struct File {
    name: String,
    pub device: Device,
    fs: Rc<dyn FileSystem>,
    offset: u64,
    pub size: u64,
    /// Driver-private state, set by `FileSystem::open`.
    pub data: Option<Box<dyn Any>>,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("fs", &self.fs.name())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Split `(hd0,msdos1)/boot/x` into device and path.
fn split_name(name: &str) -> Result<(Option<&str>, &str)> {
    match name.strip_prefix('(') {
        Some(rest) => {
            let close = rest
                .find(')')
                .ok_or_else(|| crate::error!(BadFilename, "missing `)' symbol"))?;
            Ok((Some(&rest[..close]), &rest[close + 1..]))
        }
        None => Ok((None, name)),
    }
}

impl File {
    /// Open `name`. Without a `(device)` prefix the root device is used; a
    /// path that does not start with `/` is a blocklist.
    pub fn open(k: &mut Kernel, name: &str) -> Result<File> {
        let (device_name, path) = split_name(name)?;
        let mut device = Device::open(k, device_name)?;

        let fs: Rc<dyn FileSystem> = if path.starts_with('/') {
            match super::probe(k, &mut device) {
                Ok(fs) => fs,
                Err(err) => {
                    device.close(k);
                    return Err(err);
                }
            }
        } else {
            Rc::new(Blocklist)
        };

        let mut file = File {
            name: name.to_string(),
            device,
            fs: fs.clone(),
            offset: 0,
            size: 0,
            data: None,
        };
        if let Err(err) = fs.open(k, &mut file, path) {
            file.device.close(k);
            return Err(err);
        }
        log::debug!(target: "file", "opened `{}' ({} bytes, {})", file.name, file.size, fs.name());
        Ok(file)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs_name(&self) -> &'static str {
        self.fs.name()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read up to `buf.len()` bytes at the current offset. Returns the
    /// number read; 0 at end of file.
    pub fn read(&mut self, k: &mut Kernel, buf: &mut [u8]) -> Result<usize> {
        if self.offset > self.size {
            return Err(crate::error!(OutOfRange, "attempt to read past the end of file"));
        }
        let len = (buf.len() as u64).min(self.size - self.offset) as usize;
        if len == 0 {
            return Ok(0);
        }
        let fs = self.fs.clone();
        let n = fs.read(k, self, &mut buf[..len])?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Everything from the current offset to the end.
    pub fn read_to_end(&mut self, k: &mut Kernel) -> Result<Vec<u8>> {
        let remaining = self.size.saturating_sub(self.offset) as usize;
        let mut buf = vec![0u8; remaining];
        let mut filled = 0;
        while filled < remaining {
            match self.read(k, &mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Move to `offset`; returns the previous offset.
    pub fn seek(&mut self, offset: u64) -> Result<u64> {
        if offset > self.size {
            return Err(crate::error!(OutOfRange, "attempt to seek outside of the file"));
        }
        Ok(core::mem::replace(&mut self.offset, offset))
    }

    pub fn close(mut self, k: &mut Kernel) {
        let fs = self.fs.clone();
        fs.close(&mut self);
        self.device.close(k);
    }
}
