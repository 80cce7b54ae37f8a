/// Devices: what files are opened on.
///
/// Only disks are devices here; a `Device` owns the open `Disk` handle and
/// gives it back when closed.
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::Result;
use crate::kernel::Kernel;
use crate::storage::disk::Disk;
use crate::storage::partition;

#[derive(Debug)]
pub struct Device {
    disk: Disk,
}

impl Device {
    /// Open `name`; `None` or an empty name means the root device.
    pub fn open(k: &mut Kernel, name: Option<&str>) -> Result<Device> {
        let name = match name.filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => k
                .config
                .root
                .clone()
                .filter(|r| !r.is_empty())
                .ok_or_else(|| crate::error!(BadDevice, "variable `root' isn't set"))?,
        };
        Ok(Device { disk: Disk::open(k, &name)? })
    }

    pub fn close(self, k: &mut Kernel) {
        self.disk.close(k);
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    pub fn disk_mut(&mut self) -> &mut Disk {
        &mut self.disk
    }
}

/// Call `hook` with every device name: each disk the drivers know about,
/// followed by `disk,partition` for each partition on it. Returns true if
/// the hook stopped the walk.
pub fn iterate(k: &mut Kernel, hook: &mut dyn FnMut(&str) -> bool) -> bool {
    let mut disks = Vec::new();
    for driver in k.disk_drivers.clone() {
        driver.iterate(&mut |name| {
            disks.push(name.to_string());
            false
        });
    }

    for disk_name in disks {
        if hook(&disk_name) {
            return true;
        }
        let mut disk = match Disk::open(k, &disk_name) {
            Ok(disk) => disk,
            Err(err) => {
                log::debug!(target: "disk", "skipping `{}': {}", disk_name, err);
                continue;
            }
        };

        let mut names: Vec<String> = Vec::new();
        partition::iterate(k, &mut disk, &mut |_, disk, part| {
            names.push(format!("{},{}", disk.name(), part.name()));
            false
        });
        disk.close(k);

        for name in &names {
            if hook(name) {
                return true;
            }
        }
    }
    false
}
