/// Module loader tests over hand-assembled ELF64 relocatable images.
use super::*;
use crate::error::ErrorKind;
use crate::testutil::{flatfs_image, FlatFs, TestBed};
use alloc::rc::Rc;
use alloc::vec;
use core::cell::RefCell;

use goblin::elf::header::{EM_386, EM_X86_64, ET_EXEC};
use goblin::elf::reloc::{
    R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_GOTPCREL, R_X86_64_NONE, R_X86_64_PC32,
    R_X86_64_PC64,
};
use goblin::elf::section_header::{SHF_EXECINSTR, SHF_WRITE, SHT_PROGBITS, SHT_RELA, SHT_STRTAB};
use goblin::elf::sym::{STB_GLOBAL, STT_TLS};

// ---- Image builder ----

const TEXT: u16 = 1;
const DATA: u16 = 2;
const BSS: u16 = 3;
const SHN_ABS: u16 = 0xfff1;

struct Sym {
    name: &'static str,
    kind: u8,
    bind: u8,
    shndx: u16,
    value: u64,
}

struct Rela {
    target: u16,
    offset: u64,
    sym: &'static str,
    kind: u32,
    addend: i64,
}

struct Sec {
    name: &'static str,
    kind: u32,
    flags: u64,
    data: Vec<u8>,
    size: u64,
    align: u64,
    link: u32,
    info: u32,
    entsize: u64,
}

impl Sec {
    fn new(name: &'static str, kind: u32, flags: u64, data: Vec<u8>, align: u64) -> Self {
        Self {
            name,
            kind,
            flags,
            size: data.len() as u64,
            data,
            align,
            link: 0,
            info: 0,
            entsize: 0,
        }
    }
}

/// `.text` (64 bytes), `.data` (32 bytes) and `.bss` (16 bytes) are always
/// sections 1, 2 and 3.
struct ModuleImage {
    name: Option<&'static str>,
    deps: Vec<&'static str>,
    license: Option<&'static str>,
    text: Vec<u8>,
    data: Vec<u8>,
    syms: Vec<Sym>,
    relas: Vec<Rela>,
    symtab: bool,
    machine: u16,
    e_type: u16,
}

impl ModuleImage {
    fn new(name: &'static str) -> Self {
        Self {
            name: Some(name),
            deps: Vec::new(),
            license: Some("LICENSE=GPLv3+"),
            text: vec![0x90; 64],
            data: (0..32).collect(),
            syms: Vec::new(),
            relas: Vec::new(),
            symtab: true,
            machine: EM_X86_64,
            e_type: ET_REL,
        }
    }

    fn dep(mut self, name: &'static str) -> Self {
        self.deps.push(name);
        self
    }

    fn sym(mut self, name: &'static str, kind: u8, bind: u8, shndx: u16, value: u64) -> Self {
        self.syms.push(Sym { name, kind, bind, shndx, value });
        self
    }

    fn rela(mut self, target: u16, offset: u64, sym: &'static str, kind: u32, addend: i64) -> Self {
        self.relas.push(Rela { target, offset, sym, kind, addend });
        self
    }

    fn sym_index(&self, name: &str) -> u64 {
        self.syms.iter().position(|s| s.name == name).map_or(0, |i| i as u64 + 1)
    }

    fn build(&self) -> Vec<u8> {
        let mut secs = vec![
            Sec::new("", 0, 0, Vec::new(), 0),
            Sec::new(".text", SHT_PROGBITS, (SHF_ALLOC | SHF_EXECINSTR) as u64, self.text.clone(), 16),
            Sec::new(".data", SHT_PROGBITS, (SHF_ALLOC | SHF_WRITE) as u64, self.data.clone(), 8),
        ];
        let mut bss = Sec::new(".bss", SHT_NOBITS, (SHF_ALLOC | SHF_WRITE) as u64, Vec::new(), 8);
        bss.size = 16;
        secs.push(bss);

        if let Some(name) = self.name {
            secs.push(Sec::new(".modname", SHT_PROGBITS, 0, c_bytes(name), 1));
        }
        if !self.deps.is_empty() {
            let mut list: Vec<u8> = self.deps.iter().flat_map(|d| c_bytes(d)).collect();
            list.push(0);
            secs.push(Sec::new(".moddeps", SHT_PROGBITS, 0, list, 1));
        }
        if let Some(license) = self.license {
            secs.push(Sec::new(".module_license", SHT_PROGBITS, 0, c_bytes(license), 1));
        }

        if self.symtab {
            let symtab_index = secs.len() as u32;
            let mut strtab = vec![0u8];
            let mut table = vec![0u8; 24];
            for s in &self.syms {
                let name_off = if s.name.is_empty() || s.kind == STT_SECTION {
                    0
                } else {
                    let off = strtab.len() as u32;
                    strtab.extend_from_slice(&c_bytes(s.name));
                    off
                };
                table.extend_from_slice(&name_off.to_le_bytes());
                table.push((s.bind << 4) | s.kind);
                table.push(0);
                table.extend_from_slice(&s.shndx.to_le_bytes());
                table.extend_from_slice(&s.value.to_le_bytes());
                table.extend_from_slice(&0u64.to_le_bytes());
            }
            let mut symtab = Sec::new(".symtab", SHT_SYMTAB, 0, table, 8);
            symtab.link = symtab_index + 1;
            symtab.info = 1;
            symtab.entsize = 24;
            secs.push(symtab);
            secs.push(Sec::new(".strtab", SHT_STRTAB, 0, strtab, 1));

            for (target, name) in [(TEXT, ".rela.text"), (DATA, ".rela.data")] {
                let mut entries = Vec::new();
                for r in self.relas.iter().filter(|r| r.target == target) {
                    entries.extend_from_slice(&r.offset.to_le_bytes());
                    let info = (self.sym_index(r.sym) << 32) | r.kind as u64;
                    entries.extend_from_slice(&info.to_le_bytes());
                    entries.extend_from_slice(&r.addend.to_le_bytes());
                }
                if !entries.is_empty() {
                    let mut rela = Sec::new(name, SHT_RELA, 0, entries, 8);
                    rela.link = symtab_index;
                    rela.info = target as u32;
                    rela.entsize = 24;
                    secs.push(rela);
                }
            }
        }

        secs.push(Sec::new(".shstrtab", SHT_STRTAB, 0, Vec::new(), 1));
        let mut shstrtab = vec![0u8];
        let mut name_offsets = vec![0u32];
        for sec in &secs[1..] {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(&c_bytes(sec.name));
        }
        if let Some(last) = secs.last_mut() {
            last.size = shstrtab.len() as u64;
            last.data = shstrtab;
        }

        let mut out = vec![0u8; 64];
        let mut offsets = Vec::new();
        for sec in &secs {
            while out.len() % 16 != 0 {
                out.push(0);
            }
            offsets.push(out.len() as u64);
            out.extend_from_slice(&sec.data);
        }
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;
        for (i, sec) in secs.iter().enumerate() {
            out.extend_from_slice(&name_offsets[i].to_le_bytes());
            out.extend_from_slice(&sec.kind.to_le_bytes());
            out.extend_from_slice(&sec.flags.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&offsets[i].to_le_bytes());
            out.extend_from_slice(&sec.size.to_le_bytes());
            out.extend_from_slice(&sec.link.to_le_bytes());
            out.extend_from_slice(&sec.info.to_le_bytes());
            out.extend_from_slice(&sec.align.to_le_bytes());
            out.extend_from_slice(&sec.entsize.to_le_bytes());
        }

        let mut header = Vec::with_capacity(64);
        header.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        header.extend_from_slice(&[0; 8]);
        header.extend_from_slice(&self.e_type.to_le_bytes());
        header.extend_from_slice(&self.machine.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&shoff.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&64u16.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&64u16.to_le_bytes());
        header.extend_from_slice(&(secs.len() as u16).to_le_bytes());
        header.extend_from_slice(&(secs.len() as u16 - 1).to_le_bytes());
        out[..64].copy_from_slice(&header);
        out
    }
}

fn c_bytes(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

// ---- Fixtures ----

type CallLog = Rc<RefCell<Vec<(String, Entry, usize)>>>;

struct Recorder(CallLog);

impl EntryCaller for Recorder {
    unsafe fn call(&mut self, module: &str, entry: Entry, addr: usize) {
        self.0.borrow_mut().push((module.to_string(), entry, addr));
    }
}

/// A kernel whose entry caller only records calls: the test images'
/// `.text` is not runnable.
fn bed() -> (TestBed, CallLog) {
    let mut tb = TestBed::new();
    let log: CallLog = Rc::new(RefCell::new(Vec::new()));
    tb.k.modules.set_entry_caller(Box::new(Recorder(log.clone())));
    (tb, log)
}

fn calls(log: &CallLog) -> Vec<(String, Entry)> {
    log.borrow().iter().map(|(n, e, _)| (n.clone(), *e)).collect()
}

fn peek_u64(addr: usize) -> u64 {
    unsafe { (addr as *const u64).read_unaligned() }
}

fn peek_i32(addr: usize) -> i32 {
    unsafe { (addr as *const i32).read_unaligned() }
}

fn hello() -> ModuleImage {
    ModuleImage::new("hello")
        .sym("hello.c", STT_FILE, STB_LOCAL, SHN_ABS, 0)
        .sym("[data]", STT_SECTION, STB_LOCAL, DATA, 0)
        .sym("helper", STT_FUNC, STB_LOCAL, TEXT, 32)
        .sym("mod_init", STT_FUNC, STB_GLOBAL, TEXT, 0)
        .sym("mod_fini", STT_FUNC, STB_GLOBAL, TEXT, 16)
        .sym("hello_counter", STT_OBJECT, STB_GLOBAL, DATA, 8)
}

fn free_bytes(tb: &mut TestBed) -> usize {
    tb.k.invalidate_disk_cache();
    tb.k.heap.stats().free_bytes
}

// ---- Loading from memory ----

#[test]
fn load_lays_out_sections_and_runs_init() {
    let (mut tb, log) = bed();

    let id = load_from_bytes(&mut tb.k, &hello().build()).unwrap();
    let m = tb.k.modules.get(id).unwrap();
    assert_eq!(m.name(), "hello");
    assert_eq!(m.ref_count(), 1);
    assert_eq!(tb.k.modules.find_by_name("hello"), Some(id));

    let text = m.section_addr(TEXT as usize);
    let data = m.section_addr(DATA as usize);
    let bss = m.section_addr(BSS as usize);
    assert_eq!(text % 16, 0);
    assert_eq!(data % 8, 0);
    assert_eq!(m.segments().len(), 3);
    assert!(m.size() >= 64 + 32 + 16);

    let data_bytes = unsafe { core::slice::from_raw_parts(data as *const u8, 32) };
    assert_eq!(data_bytes, &(0..32).collect::<Vec<u8>>()[..]);
    let bss_bytes = unsafe { core::slice::from_raw_parts(bss as *const u8, 16) };
    assert!(bss_bytes.iter().all(|&b| b == 0));

    assert_eq!(m.init(), Some(text));
    assert_eq!(m.fini(), Some(text + 16));
    assert_eq!(*log.borrow(), vec![("hello".to_string(), Entry::Init, text)]);

    let counter = tb.k.modules.symbols.resolve("hello_counter").unwrap();
    assert_eq!(counter.addr, data + 8);
    assert!(!counter.is_func);
    assert!(tb.k.modules.symbols.resolve("mod_init").unwrap().is_func);
    assert!(tb.k.modules.symbols.resolve("helper").is_none());
}

#[test]
fn relocations_patch_loaded_sections() {
    let (mut tb, log) = bed();
    tb.k.modules.symbols.register("core_puts", 0x1234_5678_9abc, true, None);

    let mut image = ModuleImage::new("reloc")
        .sym("[data]", STT_SECTION, STB_LOCAL, DATA, 0)
        .sym("core_puts", STT_NOTYPE, STB_GLOBAL, 0, 0)
        .sym("table", STT_OBJECT, STB_GLOBAL, DATA, 16)
        .rela(DATA, 0, "core_puts", R_X86_64_64, 8)
        .rela(TEXT, 4, "table", R_X86_64_PC32, -4)
        .rela(TEXT, 8, "[data]", R_X86_64_PC64, 0)
        .rela(TEXT, 16, "table", R_X86_64_NONE, 0);
    image.data = vec![0; 32];
    image.data[..8].copy_from_slice(&5u64.to_le_bytes());
    image.text = vec![0; 64];

    let id = load_from_bytes(&mut tb.k, &image.build()).unwrap();
    let m = tb.k.modules.get(id).unwrap();
    let text = m.section_addr(TEXT as usize);
    let data = m.section_addr(DATA as usize);

    assert_eq!(peek_u64(data), 5 + 0x1234_5678_9abc + 8);
    assert_eq!(peek_i32(text + 4) as i64, (data + 16) as i64 - 4 - (text + 4) as i64);
    assert_eq!(peek_u64(text + 8), (data as u64).wrapping_sub(text as u64 + 8));
    assert_eq!(peek_u64(text + 16), 0);
}

#[test]
fn absolute_32_bit_relocations() {
    let (mut tb, _) = bed();
    tb.k.modules.symbols.register("low", 0x1234, false, None);
    tb.k.modules.symbols.register("signed", 0x7fff_0000, false, None);

    let mut image = ModuleImage::new("abs32")
        .sym("low", STT_NOTYPE, STB_GLOBAL, 0, 0)
        .sym("signed", STT_NOTYPE, STB_GLOBAL, 0, 0)
        .rela(DATA, 0, "low", R_X86_64_32, 2)
        .rela(DATA, 4, "signed", R_X86_64_32S, 0);
    image.data = vec![0; 32];

    let id = load_from_bytes(&mut tb.k, &image.build()).unwrap();
    let data = tb.k.modules.get(id).unwrap().section_addr(DATA as usize);
    assert_eq!(peek_i32(data), 0x1236);
    assert_eq!(peek_i32(data + 4), 0x7fff_0000);
}

#[test]
fn relocation_overflow_is_rejected() {
    let (mut tb, _) = bed();
    tb.k.modules.symbols.register("far", 0x1_0000_0000, false, None);
    let image = ModuleImage::new("far")
        .sym("far", STT_NOTYPE, STB_GLOBAL, 0, 0)
        .rela(DATA, 0, "far", R_X86_64_32, 0);

    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadModule);
    assert!(tb.k.modules.is_empty());
}

#[test]
fn unsupported_relocation_type() {
    let (mut tb, _) = bed();
    let image = ModuleImage::new("got")
        .sym("x", STT_OBJECT, STB_GLOBAL, DATA, 0)
        .rela(TEXT, 0, "x", R_X86_64_GOTPCREL, 0);
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotImplementedYet);
}

#[test]
fn relocation_outside_its_section() {
    let (mut tb, _) = bed();
    let image = ModuleImage::new("edge")
        .sym("x", STT_OBJECT, STB_GLOBAL, DATA, 0)
        .rela(DATA, 30, "x", R_X86_64_64, 0);
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!(err.message(), "reloc offset is out of the segment");
}

/// `image` with the `.bss` header's size replaced.
fn with_bss_size(mut image: Vec<u8>, size: u64) -> Vec<u8> {
    let shoff = u64::from_le_bytes(image[40..48].try_into().unwrap()) as usize;
    let at = shoff + 3 * 64 + 32;
    image[at..at + 8].copy_from_slice(&size.to_le_bytes());
    image
}

#[test]
fn oversized_sections_are_refused() {
    let (mut tb, log) = bed();
    let before = free_bytes(&mut tb);

    let image = with_bss_size(hello().build(), u64::MAX - 8);
    let err = load_from_bytes(&mut tb.k, &image).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadModule);
    assert_eq!(err.message(), "module sections are too large");

    let image = with_bss_size(hello().build(), 1 << 40);
    let err = load_from_bytes(&mut tb.k, &image).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);

    assert!(tb.k.modules.is_empty());
    assert!(tb.k.modules.symbols.is_empty());
    assert!(log.borrow().is_empty());
    assert_eq!(free_bytes(&mut tb), before);
}

#[test]
fn header_checks() {
    let (mut tb, _) = bed();
    let good = hello().build();

    let err = load_from_bytes(&mut tb.k, &good[..40]).unwrap_err();
    assert_eq!((err.kind(), err.message()), (ErrorKind::BadOs, "ELF header smaller than expected"));

    let mut bad = good.clone();
    bad[1] = b'X';
    let err = load_from_bytes(&mut tb.k, &bad).unwrap_err();
    assert_eq!(err.message(), "invalid arch-independent ELF magic");

    let mut bad = good.clone();
    bad[6] = 2;
    let err = load_from_bytes(&mut tb.k, &bad).unwrap_err();
    assert_eq!(err.message(), "invalid arch-independent ELF magic");

    let mut image = hello();
    image.machine = EM_386;
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!((err.kind(), err.message()), (ErrorKind::BadOs, "invalid arch-dependent ELF magic"));

    let mut image = hello();
    image.e_type = ET_EXEC;
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!((err.kind(), err.message()), (ErrorKind::BadModule, "this ELF file is not of the right type"));

    let err = load_from_bytes(&mut tb.k, &good[..good.len() - 1]).unwrap_err();
    assert_eq!((err.kind(), err.message()), (ErrorKind::BadOs, "ELF sections outside core"));

    assert!(tb.k.modules.is_empty());
}

#[test]
fn license_must_be_accepted() {
    let (mut tb, log) = bed();

    let mut image = hello();
    image.license = None;
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!(err.message(), "incompatible license");

    image.license = Some("LICENSE=MIT");
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!(err.message(), "incompatible license");

    tb.k.config.accepted_licenses.push("LICENSE=MIT".into());
    assert!(load_from_bytes(&mut tb.k, &image.build()).is_ok());
    assert_eq!(calls(&log), vec![("hello".to_string(), Entry::Init)]);
}

#[test]
fn name_and_symbol_table_are_required() {
    let (mut tb, _) = bed();

    let mut image = hello();
    image.name = None;
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!(err.message(), "no module name found");

    let mut image = ModuleImage::new("bare");
    image.symtab = false;
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!(err.message(), "no symbol table");
}

#[test]
fn unresolved_symbol_rolls_everything_back() {
    let (mut tb, log) = bed();
    let before = tb.k.heap.stats().free_bytes;

    let image = ModuleImage::new("broken")
        .sym("mod_fini", STT_FUNC, STB_GLOBAL, TEXT, 0)
        .sym("early_global", STT_OBJECT, STB_GLOBAL, DATA, 0)
        .sym("missing_fn", STT_NOTYPE, STB_GLOBAL, 0, 0);
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!((err.kind(), err.message()), (ErrorKind::BadModule, "symbol `missing_fn' not found"));

    assert!(tb.k.modules.symbols.resolve("early_global").is_none());
    assert!(tb.k.modules.symbols.is_empty());
    assert!(tb.k.modules.is_empty());
    assert!(log.borrow().is_empty());
    assert_eq!(tb.k.heap.stats().free_bytes, before);
}

#[test]
fn unknown_symbol_type_is_fatal_to_the_load() {
    let (mut tb, _) = bed();
    let image = ModuleImage::new("tls").sym("tls_var", STT_TLS, STB_GLOBAL, DATA, 0);
    let err = load_from_bytes(&mut tb.k, &image.build()).unwrap_err();
    assert_eq!(err.message(), "unknown symbol type `6'");
}

#[test]
fn duplicate_names_are_refused() {
    let (mut tb, log) = bed();

    load_from_bytes(&mut tb.k, &hello().build()).unwrap();
    let err = load_from_bytes(&mut tb.k, &hello().build()).unwrap_err();
    assert_eq!(err.message(), "`hello' is already loaded");
    assert_eq!(tb.k.modules.len(), 1);
    assert_eq!(calls(&log), vec![("hello".to_string(), Entry::Init)]);
}

#[test]
fn unload_respects_references_and_invalidates_ids() {
    let (mut tb, log) = bed();
    let before = tb.k.heap.stats().free_bytes;

    let id = load_from_bytes(&mut tb.k, &hello().build()).unwrap();
    assert!(!unload(&mut tb.k, id));
    assert_eq!(tb.k.modules.unref_module(id), 0);
    assert!(unload(&mut tb.k, id));

    assert!(tb.k.modules.get(id).is_none());
    assert!(tb.k.modules.symbols.is_empty());
    assert_eq!(tb.k.heap.stats().free_bytes, before);
    assert_eq!(
        calls(&log),
        vec![("hello".to_string(), Entry::Init), ("hello".to_string(), Entry::Fini)]
    );

    let again = load_from_bytes(&mut tb.k, &hello().build()).unwrap();
    assert_ne!(again, id);
    assert!(tb.k.modules.get(id).is_none());
    assert!(!unload(&mut tb.k, id));
}

// ---- Loading from files ----

fn base() -> ModuleImage {
    ModuleImage::new("base")
        .sym("mod_init", STT_FUNC, STB_GLOBAL, TEXT, 0)
        .sym("mod_fini", STT_FUNC, STB_GLOBAL, TEXT, 8)
        .sym("base_hello", STT_FUNC, STB_GLOBAL, TEXT, 32)
}

fn user(name: &'static str) -> ModuleImage {
    let mut image = ModuleImage::new(name)
        .sym("mod_init", STT_FUNC, STB_GLOBAL, TEXT, 0)
        .sym("mod_fini", STT_FUNC, STB_GLOBAL, TEXT, 8)
        .sym("base_hello", STT_NOTYPE, STB_GLOBAL, 0, 0)
        .rela(DATA, 0, "base_hello", R_X86_64_64, 0);
    image.data = vec![0; 32];
    image
}

/// Module files under `(hd0)/m/x86_64-efi/`, prefix set, flatfs registered.
fn module_bed(files: &[(&'static str, Vec<u8>)]) -> (TestBed, CallLog) {
    let (mut tb, log) = bed();
    let paths: Vec<String> = files.iter().map(|(n, _)| format!("m/x86_64-efi/{}.mod", n)).collect();
    let entries: Vec<(&str, &[u8])> = paths
        .iter()
        .zip(files)
        .map(|(p, (_, image))| (p.as_str(), image.as_slice()))
        .collect();
    tb.mem.add_disk("hd0", flatfs_image(&entries), 9);
    tb.k.register_filesystem(Rc::new(FlatFs));
    tb.k.config.prefix = Some("(hd0)/m".into());
    (tb, log)
}

fn standard_modules() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("base", base().build()),
        ("mid", user("mid").dep("base").build()),
        ("top", user("top").dep("mid").dep("base").build()),
    ]
}

fn count(tb: &TestBed, name: &str) -> u32 {
    let id = tb.k.modules.find_by_name(name).unwrap();
    tb.k.modules.get(id).unwrap().ref_count()
}

#[test]
fn load_file_leaves_no_loader_reference() {
    let (mut tb, _) = module_bed(&standard_modules());
    let id = load_file(&mut tb.k, "(hd0)/m/x86_64-efi/base.mod").unwrap();
    assert_eq!(tb.k.modules.get(id).unwrap().ref_count(), 0);
}

#[test]
fn dependencies_load_first_and_link() {
    let (mut tb, log) = module_bed(&standard_modules());
    let top = load_by_name(&mut tb.k, "top").unwrap();

    assert_eq!(count(&tb, "top"), 0);
    assert_eq!(count(&tb, "mid"), 1);
    // One reference per dependency path: top->base, top->mid->base, mid->base.
    assert_eq!(count(&tb, "base"), 3);

    let names: Vec<&str> = tb.k.modules.iter().map(|(_, m)| m.name()).collect();
    assert_eq!(names, vec!["base", "mid", "top"]);
    assert_eq!(
        calls(&log).into_iter().map(|(n, _)| n).collect::<Vec<_>>(),
        vec!["base", "mid", "top"]
    );

    let hello = tb.k.modules.symbols.resolve("base_hello").unwrap().addr;
    let base_id = tb.k.modules.find_by_name("base").unwrap();
    assert_eq!(hello, tb.k.modules.get(base_id).unwrap().section_addr(TEXT as usize) + 32);
    for id in [top, tb.k.modules.find_by_name("mid").unwrap()] {
        let data = tb.k.modules.get(id).unwrap().section_addr(DATA as usize);
        assert_eq!(peek_u64(data), hello as u64);
    }
}

#[test]
fn ref_and_unref_follow_every_path() {
    let (mut tb, _) = module_bed(&standard_modules());
    let top = load_by_name(&mut tb.k, "top").unwrap();

    assert_eq!(tb.k.modules.ref_module(top), 1);
    assert_eq!((count(&tb, "mid"), count(&tb, "base")), (2, 5));
    assert_eq!(tb.k.modules.unref_module(top), 0);
    assert_eq!((count(&tb, "mid"), count(&tb, "base")), (1, 3));
}

#[test]
fn unloading_top_cascades_to_dependencies() {
    let (mut tb, log) = module_bed(&standard_modules());
    let before = free_bytes(&mut tb);

    let top = load_by_name(&mut tb.k, "top").unwrap();
    log.borrow_mut().clear();
    assert!(unload(&mut tb.k, top));

    assert!(tb.k.modules.is_empty());
    assert!(tb.k.modules.symbols.is_empty());
    assert_eq!(
        calls(&log),
        vec![
            ("top".to_string(), Entry::Fini),
            ("mid".to_string(), Entry::Fini),
            ("base".to_string(), Entry::Fini),
        ]
    );
    assert_eq!(free_bytes(&mut tb), before);
}

#[test]
fn unload_unneeded_sweeps_unreferenced_modules() {
    let (mut tb, _) = module_bed(&standard_modules());
    let base = load_by_name(&mut tb.k, "base").unwrap();
    tb.k.modules.ref_module(base);
    load_by_name(&mut tb.k, "mid").unwrap();
    assert_eq!(count(&tb, "base"), 2);

    assert_eq!(unload_unneeded(&mut tb.k), 1);
    assert_eq!(tb.k.modules.len(), 1);
    assert_eq!(count(&tb, "base"), 1);

    tb.k.modules.unref_module(base);
    assert_eq!(unload_unneeded(&mut tb.k), 1);
    assert!(tb.k.modules.is_empty());
}

#[test]
fn load_by_name_reuses_loaded_modules() {
    let (mut tb, _) = module_bed(&standard_modules());
    let first = load_by_name(&mut tb.k, "base").unwrap();
    tb.k.config.prefix = None;
    assert_eq!(load_by_name(&mut tb.k, "base").unwrap(), first);
}

#[test]
fn load_by_name_needs_prefix() {
    let (mut tb, _) = module_bed(&standard_modules());
    tb.k.config.prefix = None;
    let err = load_by_name(&mut tb.k, "base").unwrap_err();
    assert_eq!((err.kind(), err.message()), (ErrorKind::FileNotFound, "variable `prefix' isn't set"));
}

#[test]
fn embedded_name_must_match_file_name() {
    let (mut tb, _) = module_bed(&[("alias", base().build())]);
    let err = load_by_name(&mut tb.k, "alias").unwrap_err();
    assert_eq!(err.message(), "mismatched names");
    assert!(tb.k.modules.is_empty());
}

#[test]
fn missing_dependency_unwinds_the_chain() {
    let (mut tb, log) = module_bed(&[
        ("base", base().build()),
        ("lonely", user("lonely").dep("base").dep("ghost").build()),
    ]);
    let before = free_bytes(&mut tb);

    let err = load_by_name(&mut tb.k, "lonely").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
    assert!(tb.k.modules.is_empty());
    assert!(tb.k.modules.symbols.is_empty());
    assert_eq!(
        calls(&log),
        vec![("base".to_string(), Entry::Init), ("base".to_string(), Entry::Fini)]
    );
    assert_eq!(free_bytes(&mut tb), before);
}

#[test]
fn circular_dependencies_are_refused() {
    let (mut tb, _) = module_bed(&[
        ("ping", ModuleImage::new("ping").dep("pong").build()),
        ("pong", ModuleImage::new("pong").dep("ping").build()),
    ]);
    let err = load_by_name(&mut tb.k, "ping").unwrap_err();
    assert_eq!(err.message(), "circular dependency on `ping'");
    assert!(tb.k.modules.is_empty());
}
