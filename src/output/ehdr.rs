//! The output ELF file header chunk.

use crate::arch::riscv::EF_RISCV_RVC;
use crate::context::Context;
use crate::elf::{
    self, Ehdr, Phdr, SectionFlags, Shdr, EI_ABIVERSION, EI_CLASS, EI_DATA, EI_OSABI, EI_VERSION,
};
use crate::error::Result;
use crate::output::Chunk;

#[derive(Debug)]
pub struct OutputEhdr {
    pub chunk: Chunk,
}

impl OutputEhdr {
    pub fn new() -> Self {
        let mut chunk = Chunk::new();
        chunk.shdr.flags = SectionFlags::ALLOC;
        chunk.shdr.size = Ehdr::SIZE as u64;
        chunk.shdr.addr_align = 8;
        Self { chunk }
    }
}

impl Default for OutputEhdr {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point of the image: the address of `.text`, or zero without one.
pub fn get_entry_addr(ctx: &Context) -> u64 {
    for osec in &ctx.output_sections {
        if osec.chunk.name == ".text" {
            return osec.chunk.shdr.addr;
        }
    }
    0
}

/// The output `e_flags`: the first real input's flags, with `EF_RISCV_RVC`
/// OR'd in if any input carries it.
pub fn get_flags(ctx: &Context) -> u32 {
    let mut objs = ctx
        .objs
        .iter()
        .enumerate()
        .filter(|&(i, obj)| obj.input.is_alive && Some(i) != ctx.internal_obj)
        .map(|(_, obj)| obj);

    let Some(first) = objs.next() else {
        return 0;
    };

    let mut ret = first.input.ehdr.flags;
    for obj in objs {
        if obj.input.ehdr.flags & EF_RISCV_RVC != 0 {
            ret |= EF_RISCV_RVC;
        }
    }
    ret
}

pub fn copy_buf(ctx: &Context, buf: &mut [u8]) -> Result<()> {
    let mut ehdr = Ehdr {
        r#type: elf::ET_EXEC,
        machine: elf::EM_RISCV,
        version: elf::EV_CURRENT as u32,
        entry: get_entry_addr(ctx),
        ph_off: ctx.phdr.chunk.shdr.offset,
        sh_off: ctx.shdr.chunk.shdr.offset,
        flags: get_flags(ctx),
        eh_size: Ehdr::SIZE as u16,
        ph_ent_size: Phdr::SIZE as u16,
        ph_num: (ctx.phdr.chunk.shdr.size / Phdr::SIZE as u64) as u16,
        sh_ent_size: Shdr::SIZE as u16,
        sh_num: (ctx.shdr.chunk.shdr.size / Shdr::SIZE as u64) as u16,
        ..Default::default()
    };
    elf::write_magic(&mut ehdr.ident);
    ehdr.ident[EI_CLASS] = elf::ELFCLASS64;
    ehdr.ident[EI_DATA] = elf::ELFDATA2LSB;
    ehdr.ident[EI_VERSION] = elf::EV_CURRENT;
    ehdr.ident[EI_OSABI] = 0;
    ehdr.ident[EI_ABIVERSION] = 0;

    let at = ctx.ehdr.chunk.shdr.offset as usize;
    ehdr.write_to(&mut buf[at..]);
    Ok(())
}
