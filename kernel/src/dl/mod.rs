/// Loadable modules: relocatable ELF objects linked into the running core.
///
/// Loading walks a fixed sequence: check the header, read the license and
/// name, load dependencies by name, lay the allocatable sections out in one
/// block, resolve symbols against the global table, relocate, run
/// `mod_init`, register. A failure at any step tears the half-built module
/// down again, including the references it took on its dependencies.
///
/// Modules live in a generation-checked arena inside `ModuleRegistry`; a
/// `ModuleId` goes stale once its module is unloaded.
pub mod arch;
pub mod symbol;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::ptr::NonNull;

use goblin::elf::header::{header64, Header, EI_VERSION, ELFMAG, ET_REL, EV_CURRENT};
use goblin::elf::section_header::{SectionHeader, SHF_ALLOC, SHT_NOBITS, SHT_SYMTAB};
use goblin::elf::sym::{STB_LOCAL, STT_FILE, STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_SECTION};
use goblin::elf::Elf;

use crate::error::Result;
use crate::fs::File;
use crate::kernel::Kernel;

pub use symbol::{Symbol, SymbolTable};

const INIT_SYMBOL: &str = "mod_init";
const FINI_SYMBOL: &str = "mod_fini";

// ---- Modules ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId {
    index: u32,
    generation: u32,
}

impl ModuleId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Where one allocatable section ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub section: usize,
    pub addr: usize,
    pub size: usize,
}

#[derive(Debug, Default)]
pub struct Module {
    name: String,
    ref_count: u32,
    deps: Vec<ModuleId>,
    base: Option<NonNull<u8>>,
    size: usize,
    segments: Vec<Segment>,
    init: Option<usize>,
    fini: Option<usize>,
}

impl Module {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn deps(&self) -> &[ModuleId] {
        &self.deps
    }

    /// Start of the block holding every loaded section, 0 if none.
    pub fn base(&self) -> usize {
        self.base.map_or(0, |b| b.as_ptr() as usize)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, section: usize) -> Option<&Segment> {
        self.segments.iter().find(|s| s.section == section)
    }

    /// Load address of `section`, 0 for sections that were not loaded.
    pub fn section_addr(&self, section: usize) -> usize {
        self.segment(section).map_or(0, |s| s.addr)
    }

    pub fn init(&self) -> Option<usize> {
        self.init
    }

    pub fn fini(&self) -> Option<usize> {
        self.fini
    }
}

// ---- Entry points ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Init,
    Fini,
}

/// Runs a module's init or fini function.
pub trait EntryCaller {
    /// # Safety
    /// `addr` is a relocated entry point of the loaded module `module`.
    unsafe fn call(&mut self, module: &str, entry: Entry, addr: usize);
}

/// Calls entry points as `extern "C" fn()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEntry;

impl EntryCaller for NativeEntry {
    unsafe fn call(&mut self, _module: &str, _entry: Entry, addr: usize) {
        let f: extern "C" fn() = unsafe { core::mem::transmute(addr) };
        f();
    }
}

// ---- Registry ----

struct Slot {
    generation: u32,
    module: Option<Module>,
}

pub struct ModuleRegistry {
    slots: Vec<Slot>,
    /// Registered modules, oldest first.
    order: Vec<ModuleId>,
    pub symbols: SymbolTable,
    caller: Box<dyn EntryCaller>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            order: Vec::new(),
            symbols: SymbolTable::new(),
            caller: Box::new(NativeEntry),
        }
    }

    pub fn set_entry_caller(&mut self, caller: Box<dyn EntryCaller>) {
        self.caller = caller;
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.module.as_ref())
    }

    fn get_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.module.as_mut())
    }

    pub fn find_by_name(&self, name: &str) -> Option<ModuleId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|m| m.name == name))
    }

    /// Registered modules, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &Module)> + '_ {
        self.order.iter().filter_map(|&id| self.get(id).map(|m| (id, m)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// A module by this name is being loaded but is not registered yet.
    fn is_loading(&self, name: &str) -> bool {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.module.as_ref().map(|m| (i, slot.generation, m)))
            .any(|(i, generation, m)| {
                m.name == name && !self.order.contains(&ModuleId::new(i as u32, generation))
            })
    }

    fn insert(&mut self, module: Module) -> ModuleId {
        if let Some(index) = self.slots.iter().position(|s| s.module.is_none()) {
            let slot = &mut self.slots[index];
            slot.module = Some(module);
            return ModuleId::new(index as u32, slot.generation);
        }
        self.slots.push(Slot { generation: 0, module: Some(module) });
        ModuleId::new(self.slots.len() as u32 - 1, 0)
    }

    fn remove(&mut self, id: ModuleId) -> Option<Module> {
        self.order.retain(|&o| o != id);
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let module = slot.module.take();
        slot.generation = slot.generation.wrapping_add(1);
        module
    }

    /// Take a reference on `id` and, recursively, on everything it
    /// depends on. Returns the new count of `id`.
    pub fn ref_module(&mut self, id: ModuleId) -> u32 {
        let deps = match self.get(id) {
            Some(m) => m.deps.clone(),
            None => return 0,
        };
        for dep in deps {
            self.ref_module(dep);
        }
        self.get_mut(id).map_or(0, |m| {
            m.ref_count += 1;
            m.ref_count
        })
    }

    /// Inverse of `ref_module`.
    pub fn unref_module(&mut self, id: ModuleId) -> u32 {
        let deps = match self.get(id) {
            Some(m) => m.deps.clone(),
            None => return 0,
        };
        for dep in deps {
            self.unref_module(dep);
        }
        self.get_mut(id).map_or(0, |m| {
            m.ref_count = m.ref_count.saturating_sub(1);
            m.ref_count
        })
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---- Image inspection ----

fn check_header(image: &[u8]) -> Result<Header> {
    if image.len() < header64::SIZEOF_EHDR {
        return Err(crate::error!(BadOs, "ELF header smaller than expected"));
    }
    let bad_magic = || crate::error!(BadOs, "invalid arch-independent ELF magic");
    if &image[..4] != ELFMAG || image[EI_VERSION] != EV_CURRENT {
        return Err(bad_magic());
    }
    let header = Elf::parse_header(image).map_err(|_| bad_magic())?;
    if header.e_version != EV_CURRENT as u32 {
        return Err(bad_magic());
    }
    arch::check_header(&header)?;
    Ok(header)
}

fn section_name<'a>(elf: &'a Elf<'_>, sh: &SectionHeader) -> &'a str {
    elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("")
}

fn section_data<'a>(image: &'a [u8], sh: &SectionHeader) -> Result<&'a [u8]> {
    if sh.sh_type == SHT_NOBITS {
        return Ok(&[]);
    }
    let start = sh.sh_offset as usize;
    start
        .checked_add(sh.sh_size as usize)
        .and_then(|end| image.get(start..end))
        .ok_or_else(|| crate::error!(BadOs, "ELF sections outside core"))
}

/// Contents of the first section called `name`.
fn find_section<'a>(elf: &Elf<'_>, image: &'a [u8], name: &str) -> Result<Option<&'a [u8]>> {
    match elf.section_headers.iter().find(|sh| section_name(elf, sh) == name) {
        Some(sh) => section_data(image, sh).map(Some),
        None => Ok(None),
    }
}

/// The NUL-terminated string at the start of `bytes`.
fn c_str(bytes: &[u8]) -> Result<&str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).map_err(|_| crate::error!(BadModule, "invalid string in module"))
}

fn check_license(k: &Kernel, elf: &Elf<'_>, image: &[u8]) -> Result<()> {
    for sh in elf.section_headers.iter().filter(|sh| section_name(elf, sh) == ".module_license") {
        let license = c_str(section_data(image, sh)?)?;
        if k.config.accepted_licenses.iter().any(|l| l == license) {
            return Ok(());
        }
    }
    Err(crate::error!(BadModule, "incompatible license"))
}

fn resolve_name(elf: &Elf<'_>, image: &[u8]) -> Result<String> {
    match find_section(elf, image, ".modname")? {
        Some(data) => Ok(c_str(data)?.to_string()),
        None => Err(crate::error!(BadModule, "no module name found")),
    }
}

fn resolve_dependencies(k: &mut Kernel, id: ModuleId, elf: &Elf<'_>, image: &[u8]) -> Result<()> {
    let list = match find_section(elf, image, ".moddeps")? {
        Some(list) => list,
        None => return Ok(()),
    };
    for raw in list.split(|&b| b == 0).take_while(|n| !n.is_empty()) {
        let name = c_str(raw)?;
        let dep = load_by_name(k, name)?;
        k.modules.ref_module(dep);
        if let Some(m) = k.modules.get_mut(id) {
            m.deps.push(dep);
        }
    }
    Ok(())
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    let align = align.max(1);
    value.div_ceil(align).checked_mul(align)
}

/// Lay every allocatable section out in one block.
fn load_segments(k: &mut Kernel, id: ModuleId, elf: &Elf<'_>, image: &[u8]) -> Result<()> {
    let allocatable = || {
        elf.section_headers
            .iter()
            .enumerate()
            .filter(|(_, sh)| sh.sh_flags & SHF_ALLOC as u64 != 0)
    };

    let too_large = || crate::error!(BadModule, "module sections are too large");

    let mut total = 0usize;
    let mut max_align = 1usize;
    for (_, sh) in allocatable() {
        let align = usize::try_from(sh.sh_addralign).map_err(|_| too_large())?;
        let size = usize::try_from(sh.sh_size).map_err(|_| too_large())?;
        total = align_up(total, align)
            .and_then(|start| start.checked_add(size))
            .ok_or_else(too_large)?;
        max_align = max_align.max(align);
    }
    if total == 0 {
        return Ok(());
    }

    let base = k.memalign(max_align, total)?;
    if let Some(m) = k.modules.get_mut(id) {
        m.base = Some(base);
        m.size = total;
    }

    let mut offset = 0usize;
    let mut segments = Vec::new();
    for (index, sh) in allocatable() {
        let size = sh.sh_size as usize;
        let mut addr = 0;
        if size != 0 {
            offset = align_up(offset, sh.sh_addralign as usize).ok_or_else(too_large)?;
            addr = base.as_ptr() as usize + offset;
            let dst = addr as *mut u8;
            if sh.sh_type == SHT_NOBITS {
                unsafe { core::ptr::write_bytes(dst, 0, size) };
            } else {
                let src = section_data(image, sh)?;
                unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, size) };
            }
            offset = offset.checked_add(size).ok_or_else(too_large)?;
        }
        segments.push(Segment { section: index, addr, size });
    }

    if let Some(m) = k.modules.get_mut(id) {
        m.segments = segments;
    }
    Ok(())
}

/// Give every symbol its final value; publish the module's globals.
fn resolve_symbols(k: &mut Kernel, id: ModuleId, elf: &Elf<'_>) -> Result<Vec<u64>> {
    if !elf.section_headers.iter().any(|sh| sh.sh_type == SHT_SYMTAB) {
        return Err(crate::error!(BadModule, "no symbol table"));
    }

    let mut values = Vec::with_capacity(elf.syms.len());
    let mut init = None;
    let mut fini = None;

    for sym in elf.syms.iter() {
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
        let local = sym.st_bind() == STB_LOCAL;
        let section_addr = k.modules.get(id).map_or(0, |m| m.section_addr(sym.st_shndx)) as u64;

        let value = match sym.st_type() {
            STT_NOTYPE | STT_OBJECT if sym.st_name != 0 && sym.st_shndx == 0 => {
                let found = k
                    .modules
                    .symbols
                    .resolve(name)
                    .ok_or_else(|| crate::error!(BadModule, "symbol `{}' not found", name))?;
                found.addr as u64
            }
            STT_NOTYPE | STT_OBJECT => {
                let value = sym.st_value.wrapping_add(section_addr);
                if !local {
                    k.modules.symbols.register(name, value as usize, false, Some(id));
                }
                value
            }
            STT_FUNC => {
                let value = sym.st_value.wrapping_add(section_addr);
                if !local {
                    k.modules.symbols.register(name, value as usize, true, Some(id));
                }
                match name {
                    INIT_SYMBOL => init = Some(value as usize),
                    FINI_SYMBOL => fini = Some(value as usize),
                    _ => {}
                }
                value
            }
            STT_SECTION => section_addr,
            STT_FILE => 0,
            other => return Err(crate::error!(BadModule, "unknown symbol type `{}'", other)),
        };
        values.push(value);
    }

    if let Some(m) = k.modules.get_mut(id) {
        m.init = init;
        m.fini = fini;
    }
    Ok(values)
}

// ---- Loading ----

/// Every step after the header check, up to and including init.
fn link(k: &mut Kernel, id: ModuleId, elf: &Elf<'_>, image: &[u8]) -> Result<()> {
    check_license(k, elf, image)?;

    let name = resolve_name(elf, image)?;
    if k.modules.find_by_name(&name).is_some() {
        return Err(crate::error!(BadModule, "`{}' is already loaded", name));
    }
    if let Some(m) = k.modules.get_mut(id) {
        m.name = name;
    }

    resolve_dependencies(k, id, elf, image)?;
    load_segments(k, id, elf, image)?;
    let values = resolve_symbols(k, id, elf)?;
    if let Some(m) = k.modules.get(id) {
        arch::relocate(m, elf, &values)?;
    }
    Ok(())
}

fn call_entry(k: &mut Kernel, id: ModuleId, entry: Entry) {
    let (name, addr) = match k.modules.get(id) {
        Some(m) => (
            m.name.clone(),
            match entry {
                Entry::Init => m.init,
                Entry::Fini => m.fini,
            },
        ),
        None => return,
    };
    if let Some(addr) = addr {
        log::debug!(target: "modules", "calling {:?} of `{}' at {:#x}", entry, name, addr);
        unsafe { k.modules.caller.call(&name, entry, addr) };
    }
}

/// Load a module image already in memory. The new module holds one
/// reference on itself.
pub fn load_from_bytes(k: &mut Kernel, image: &[u8]) -> Result<ModuleId> {
    log::debug!(target: "modules", "module image of {:#x} bytes", image.len());

    let header = check_header(image)?;
    if header.e_type != ET_REL {
        return Err(crate::error!(BadModule, "this ELF file is not of the right type"));
    }
    let table_end = (header.e_shoff as u128)
        + (header.e_shentsize as u128) * (header.e_shnum as u128);
    if table_end > image.len() as u128 {
        return Err(crate::error!(BadOs, "ELF sections outside core"));
    }
    let elf = Elf::parse(image).map_err(|e| crate::error!(BadModule, "malformed module: {}", e))?;

    let id = k.modules.insert(Module {
        ref_count: 1,
        ..Module::default()
    });

    if let Err(err) = link(k, id, &elf, image) {
        log::debug!(target: "modules", "load failed: {}", err);
        if let Some(m) = k.modules.get_mut(id) {
            m.fini = None;
        }
        teardown(k, id);
        return Err(err);
    }

    if let Some(m) = k.modules.get(id) {
        arch::sync_caches(m.base(), m.size);
        log::debug!(
            target: "modules",
            "module `{}' at {:#x}, init {:?}",
            m.name,
            m.base(),
            m.init
        );
    }
    call_entry(k, id, Entry::Init);

    let name = k.modules.get(id).map(|m| m.name.clone()).unwrap_or_default();
    if k.modules.find_by_name(&name).is_some() {
        teardown(k, id);
        return Err(crate::error!(BadModule, "`{}' is already loaded", name));
    }
    k.modules.order.push(id);
    Ok(id)
}

/// Load the module file at `path`. The loader keeps no reference of its
/// own, so the module starts with a count of 0.
pub fn load_file(k: &mut Kernel, path: &str) -> Result<ModuleId> {
    let mut file = File::open(k, path)?;
    let size = file.size();
    let image = file.read_to_end(k);
    // Closed before dependencies are opened.
    file.close(k);
    let image = image?;
    if image.len() as u64 != size {
        return Err(crate::error!(ReadError, "premature end of file {}", path));
    }

    let id = load_from_bytes(k, &image)?;
    if let Some(m) = k.modules.get_mut(id) {
        m.ref_count -= 1;
    }
    Ok(id)
}

/// Load `name` from the module directory unless it is already loaded.
pub fn load_by_name(k: &mut Kernel, name: &str) -> Result<ModuleId> {
    if let Some(id) = k.modules.find_by_name(name) {
        return Ok(id);
    }
    if k.modules.is_loading(name) {
        return Err(crate::error!(BadModule, "circular dependency on `{}'", name));
    }
    let dir = k
        .config
        .module_dir()
        .ok_or_else(|| crate::error!(FileNotFound, "variable `prefix' isn't set"))?;

    let id = load_file(k, &format!("{}/{}.mod", dir, name))?;
    if k.modules.get(id).is_some_and(|m| m.name != name) {
        unload(k, id);
        return Err(crate::error!(BadModule, "mismatched names"));
    }
    Ok(id)
}

// ---- Unloading ----

/// Unload `id` and drop its hold on its dependencies, regardless of its
/// reference count.
fn teardown(k: &mut Kernel, id: ModuleId) {
    call_entry(k, id, Entry::Fini);

    k.modules.order.retain(|&o| o != id);
    k.modules.symbols.unregister(Some(id));

    let deps = k.modules.get(id).map(|m| m.deps.clone()).unwrap_or_default();
    for dep in deps {
        k.modules.unref_module(dep);
        unload(k, dep);
    }

    if let Some(m) = k.modules.remove(id) {
        log::debug!(target: "modules", "unloaded `{}'", m.name);
        if let Some(base) = m.base {
            unsafe { k.free(base.as_ptr()) };
        }
    }
}

/// Unload `id` if nothing references it. Returns whether it was unloaded.
pub fn unload(k: &mut Kernel, id: ModuleId) -> bool {
    match k.modules.get(id) {
        Some(m) if m.ref_count == 0 => {
            teardown(k, id);
            true
        }
        _ => false,
    }
}

/// Unload every unreferenced module, repeating until nothing changes.
pub fn unload_unneeded(k: &mut Kernel) -> usize {
    let mut unloaded = 0;
    loop {
        let candidate = k
            .modules
            .iter()
            .find(|(_, m)| m.ref_count == 0)
            .map(|(id, _)| id);
        match candidate {
            Some(id) if unload(k, id) => unloaded += 1,
            _ => return unloaded,
        }
    }
}

#[cfg(test)]
mod tests;
