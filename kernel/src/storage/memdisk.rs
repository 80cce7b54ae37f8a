/// RAM-backed disk driver.
///
/// Serves named in-memory images (`memdisk`, `mem0`, ...). Used for an
/// image embedded in the boot payload and as the disk backend of the unit
/// tests, which is why images count their I/O and can be told to fail.
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;

use super::block_device::{BlockDevice, DiskDriver};
use crate::error::Result;

/// Device class id of the memory disk driver.
pub const MEMDISK_CLASS: u32 = 9;

struct ImageState {
    name: String,
    data: Vec<u8>,
    log_block_size: u32,
    size_known: bool,
    /// Reads of more blocks than this fail.
    max_read_blocks: Option<usize>,
    reads: u64,
    writes: u64,
    blocks_read: u64,
}

/// Shared handle to one image, kept by whoever created it.
#[derive(Clone)]
pub struct MemImage {
    state: Rc<RefCell<ImageState>>,
}

impl MemImage {
    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    /// Number of `read_blocks` calls served.
    pub fn reads(&self) -> u64 {
        self.state.borrow().reads
    }

    pub fn writes(&self) -> u64 {
        self.state.borrow().writes
    }

    /// Native sectors transferred by reads.
    pub fn blocks_read(&self) -> u64 {
        self.state.borrow().blocks_read
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.borrow_mut();
        state.reads = 0;
        state.writes = 0;
        state.blocks_read = 0;
    }

    /// Copy raw bytes out of the image.
    pub fn read_raw(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.borrow().data[offset..offset + len].to_vec()
    }

    /// Patch the image behind the driver's back.
    pub fn write_raw(&self, offset: usize, bytes: &[u8]) {
        self.state.borrow_mut().data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Make the device report an unknown size.
    pub fn hide_size(&self) {
        self.state.borrow_mut().size_known = false;
    }

    pub fn limit_reads(&self, max_blocks: Option<usize>) {
        self.state.borrow_mut().max_read_blocks = max_blocks;
    }
}

/// The driver: a list of images addressed by name.
#[derive(Default)]
pub struct MemDisk {
    images: RefCell<Vec<MemImage>>,
}

impl MemDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image. `data` is padded to whole native sectors.
    pub fn add_disk(&self, name: &str, mut data: Vec<u8>, log_block_size: u32) -> MemImage {
        let block = 1usize << log_block_size;
        let padded = data.len().div_ceil(block) * block;
        data.resize(padded, 0);

        let image = MemImage {
            state: Rc::new(RefCell::new(ImageState {
                name: name.to_string(),
                data,
                log_block_size,
                size_known: true,
                max_read_blocks: None,
                reads: 0,
                writes: 0,
                blocks_read: 0,
            })),
        };
        self.images.borrow_mut().push(image.clone());
        image
    }
}

impl DiskDriver for MemDisk {
    fn name(&self) -> &'static str {
        "memdisk"
    }

    fn id(&self) -> u32 {
        MEMDISK_CLASS
    }

    fn open(&self, name: &str) -> Result<Box<dyn BlockDevice>> {
        let images = self.images.borrow();
        let (index, image) = images
            .iter()
            .enumerate()
            .find(|(_, image)| image.state.borrow().name == name)
            .ok_or_else(|| crate::error!(UnknownDevice, "not a memdisk"))?;
        Ok(Box::new(MemDiskDevice {
            id: index as u32,
            image: image.clone(),
        }))
    }

    fn iterate(&self, hook: &mut dyn FnMut(&str) -> bool) -> bool {
        let names: Vec<String> = self.images.borrow().iter().map(|i| i.name()).collect();
        names.iter().any(|name| hook(name))
    }
}

struct MemDiskDevice {
    id: u32,
    image: MemImage,
}

impl MemDiskDevice {
    fn span(state: &ImageState, lba: u64, count: usize) -> Option<(usize, usize)> {
        let start = (lba as usize).checked_mul(1 << state.log_block_size)?;
        let len = count << state.log_block_size;
        (start.checked_add(len)? <= state.data.len()).then_some((start, len))
    }
}

impl BlockDevice for MemDiskDevice {
    fn disk_id(&self) -> u32 {
        self.id
    }

    fn log_block_size(&self) -> u32 {
        self.image.state.borrow().log_block_size
    }

    fn total_blocks(&self) -> Option<u64> {
        let state = self.image.state.borrow();
        state
            .size_known
            .then(|| (state.data.len() >> state.log_block_size) as u64)
    }

    fn read_blocks(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let mut state = self.image.state.borrow_mut();
        if state.max_read_blocks.is_some_and(|max| count > max) {
            return Err(crate::error!(ReadError, "failure reading sector {:#x} from `{}'", lba, state.name));
        }
        let (start, len) = Self::span(&state, lba, count).ok_or_else(|| {
            crate::error!(OutOfRange, "attempt to read outside of `{}'", state.name)
        })?;
        buf[..len].copy_from_slice(&state.data[start..start + len]);
        state.reads += 1;
        state.blocks_read += count as u64;
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, count: usize, buf: &[u8]) -> Result<()> {
        let mut state = self.image.state.borrow_mut();
        let (start, len) = Self::span(&state, lba, count).ok_or_else(|| {
            crate::error!(OutOfRange, "attempt to write outside of `{}'", state.name)
        })?;
        state.data[start..start + len].copy_from_slice(&buf[..len]);
        state.writes += 1;
        Ok(())
    }
}
