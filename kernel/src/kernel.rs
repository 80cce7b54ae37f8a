/// Kernel context: the single owner of process-wide state.
///
/// Heap, sector cache, clock, last error, configuration, the driver
/// registries and the module registry all hang off one `Kernel`. Platform
/// init builds it once; tests build a fresh one per case.
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::config::BootConfig;
use crate::dl::ModuleRegistry;
use crate::error::{ErrorKind, ErrorState, Result};
use crate::fs::FileSystem;
use crate::mem::LockedHeap;
use crate::storage::block_device::DiskDriver;
use crate::storage::cache::DiskCache;
use crate::storage::partition::PartitionMap;
use crate::time::{Clock, TimeSource};

/// Asks the environment to load one more filesystem driver; returns false
/// when there is nothing left to try.
pub type FsAutoload = Box<dyn FnMut(&mut Kernel) -> bool>;

pub struct Kernel {
    pub heap: &'static LockedHeap,
    pub cache: DiskCache,
    pub clock: Clock,
    pub errors: ErrorState,
    pub config: BootConfig,
    pub modules: ModuleRegistry,
    pub(crate) disk_drivers: Vec<Rc<dyn DiskDriver>>,
    pub(crate) partition_maps: Vec<Rc<dyn PartitionMap>>,
    pub(crate) filesystems: Vec<Rc<dyn FileSystem>>,
    pub(crate) fs_autoload: Option<FsAutoload>,
    /// Last time a disk was opened or closed.
    pub(crate) last_disk_activity: u64,
}

impl Kernel {
    pub fn new(heap: &'static LockedHeap, config: BootConfig) -> Self {
        Self {
            heap,
            cache: DiskCache::new(),
            clock: Clock::new(),
            errors: ErrorState::new(),
            config,
            modules: ModuleRegistry::new(),
            disk_drivers: Vec::new(),
            partition_maps: Vec::new(),
            filesystems: Vec::new(),
            fs_autoload: None,
            last_disk_activity: 0,
        }
    }

    pub fn install_clock(&mut self, source: Box<dyn TimeSource>) {
        self.clock.install(source);
    }

    // ---- Registries ----

    pub fn register_disk_driver(&mut self, driver: Rc<dyn DiskDriver>) {
        log::debug!(target: "disk", "registered driver `{}'", driver.name());
        self.disk_drivers.push(driver);
    }

    pub fn unregister_disk_driver(&mut self, name: &str) {
        self.disk_drivers.retain(|d| d.name() != name);
    }

    pub fn register_partition_map(&mut self, map: Rc<dyn PartitionMap>) {
        self.partition_maps.push(map);
    }

    pub fn register_filesystem(&mut self, fs: Rc<dyn FileSystem>) {
        log::debug!(target: "fs", "registered filesystem `{}'", fs.name());
        self.filesystems.push(fs);
    }

    pub fn unregister_filesystem(&mut self, name: &str) {
        self.filesystems.retain(|f| f.name() != name);
    }

    pub fn set_fs_autoload(&mut self, hook: Option<FsAutoload>) {
        self.fs_autoload = hook;
    }

    // ---- Memory ----

    /// Allocate from the region heap, flushing the disk cache once if the
    /// heap is exhausted.
    pub fn memalign(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
        match self.heap.memalign(align, size) {
            Err(err) if err.kind() == ErrorKind::OutOfMemory => {}
            done => return done,
        }
        log::debug!(target: "mm", "out of memory for {:#x} bytes, flushing disk cache", size);
        self.cache.invalidate_all(self.heap);
        self.heap.memalign(align, size)
    }

    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.memalign(0, size)
    }

    pub fn zalloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let p = self.malloc(size)?;
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    /// # Safety
    /// `ptr` must be null or a live allocation from `self.heap`.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        unsafe { self.heap.free(ptr) }
    }

    /// # Safety
    /// `ptr` must be null or a live allocation from `self.heap`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> Result<*mut u8> {
        match unsafe { self.heap.lock().realloc(ptr, size) } {
            Err(err) if err.kind() == ErrorKind::OutOfMemory => {}
            done => return done,
        }
        self.cache.invalidate_all(self.heap);
        unsafe { self.heap.lock().realloc(ptr, size) }
    }

    pub fn invalidate_disk_cache(&mut self) {
        self.cache.invalidate_all(self.heap);
    }

    // ---- Errors ----

    /// Record a failed top-level operation in the last-error slot.
    pub fn report<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.errors.raise(err);
                None
            }
        }
    }
}
