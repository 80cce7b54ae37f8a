/// x86_64 specifics of module linking: header check and RELA relocations.
use goblin::elf::header::{Header, EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, EM_X86_64};
use goblin::elf::reloc::{
    R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_NONE, R_X86_64_PC32, R_X86_64_PC64,
    R_X86_64_PLT32,
};
use goblin::elf::Elf;

use super::Module;
use crate::error::Result;

pub fn check_header(header: &Header) -> Result<()> {
    if header.e_ident[EI_CLASS] != ELFCLASS64
        || header.e_ident[EI_DATA] != ELFDATA2LSB
        || header.e_machine != EM_X86_64
    {
        return Err(crate::error!(BadOs, "invalid arch-dependent ELF magic"));
    }
    Ok(())
}

/// Make freshly written code visible to instruction fetch. x86 keeps its
/// caches coherent.
pub fn sync_caches(_base: usize, _size: usize) {}

/// Apply every relocation section that targets a loaded segment.
///
/// `values` holds the resolved value of each symbol by index. Addends are
/// added to what the section already contains.
pub fn relocate(module: &Module, elf: &Elf<'_>, values: &[u64]) -> Result<()> {
    for (index, relocs) in &elf.shdr_relocs {
        let target = match elf.section_headers.get(*index) {
            Some(sh) => sh.sh_info as usize,
            None => continue,
        };
        let seg = match module.segment(target) {
            Some(seg) => seg,
            None => continue,
        };

        for rel in relocs.iter() {
            let sym = *values
                .get(rel.r_sym)
                .ok_or_else(|| crate::error!(BadModule, "relocation against unknown symbol {}", rel.r_sym))?;
            let addend = rel.r_addend.unwrap_or(0);
            let width = match rel.r_type {
                R_X86_64_NONE => continue,
                R_X86_64_64 | R_X86_64_PC64 => 8,
                R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_32 | R_X86_64_32S => 4,
                other => {
                    return Err(crate::error!(
                        NotImplementedYet,
                        "relocation {:#x} is not implemented yet",
                        other
                    ))
                }
            };
            if rel.r_offset.checked_add(width).map_or(true, |end| end > seg.size as u64) {
                return Err(crate::error!(BadModule, "reloc offset is out of the segment"));
            }

            let place = seg.addr + rel.r_offset as usize;
            let value = (sym as i128) + (addend as i128);
            unsafe { apply(rel.r_type, place, value)? };
        }
    }
    Ok(())
}

/// Patch `place` in place.
///
/// # Safety
/// `place` must point into a loaded segment with room for the patched word.
unsafe fn apply(kind: u32, place: usize, value: i128) -> Result<()> {
    let overflow = || crate::error!(BadModule, "relocation {:#x} overflows at {:#x}", kind, place);
    let p = place as i128;

    match kind {
        R_X86_64_64 | R_X86_64_PC64 => {
            let ptr = place as *mut u64;
            let delta = if kind == R_X86_64_PC64 { value - p } else { value };
            let old = unsafe { ptr.read_unaligned() };
            unsafe { ptr.write_unaligned(old.wrapping_add(delta as u64)) };
        }
        R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_32S => {
            let ptr = place as *mut i32;
            let delta = if kind == R_X86_64_32S { value } else { value - p };
            let new = (unsafe { ptr.read_unaligned() } as i128) + delta;
            let new = i32::try_from(new).map_err(|_| overflow())?;
            unsafe { ptr.write_unaligned(new) };
        }
        R_X86_64_32 => {
            let ptr = place as *mut u32;
            let new = (unsafe { ptr.read_unaligned() } as i128) + value;
            let new = u32::try_from(new).map_err(|_| overflow())?;
            unsafe { ptr.write_unaligned(new) };
        }
        _ => {}
    }
    Ok(())
}
