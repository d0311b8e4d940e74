//! The output program-header table chunk and segment synthesis.
//!
//! Segment synthesis runs inside the layout fixed point: the number of
//! program headers changes the header chunk's size, which moves every file
//! offset, which can change which chunks stay virtually contiguous.

use crate::context::Context;
use crate::elf::{
    self, Phdr, SectionFlags, PAGE_SIZE, PF_R, PF_W, PF_X, PT_GNU_RELRO, PT_GNU_STACK, PT_LOAD,
    PT_NOTE, PT_PHDR, PT_TLS, SHT_NOBITS,
};
use crate::output::{Chunk, ChunkRef};
use crate::util;

#[derive(Debug)]
pub struct OutputPhdr {
    pub chunk: Chunk,
    pub phdrs: Vec<Phdr>,
}

impl OutputPhdr {
    pub fn new() -> Self {
        let mut chunk = Chunk::new();
        chunk.shdr.flags = SectionFlags::ALLOC;
        chunk.shdr.addr_align = 8;
        Self {
            chunk,
            phdrs: Vec::new(),
        }
    }

    pub fn copy_buf(&self, buf: &mut [u8]) {
        let base = self.chunk.shdr.offset as usize;
        for (i, phdr) in self.phdrs.iter().enumerate() {
            phdr.write_to(&mut buf[base + i * Phdr::SIZE..]);
        }
    }
}

impl Default for OutputPhdr {
    fn default() -> Self {
        Self::new()
    }
}

/// Segment permission flags for a chunk.
pub fn to_phdr_flags(ctx: &Context, chunk: ChunkRef) -> u32 {
    let flags = ctx.chunk(chunk).shdr.flags;
    let mut ret = PF_R;
    if flags.contains(SectionFlags::WRITE) {
        ret |= PF_W;
    }
    if flags.contains(SectionFlags::EXECINSTR) {
        ret |= PF_X;
    }
    ret
}

/// Writable ALLOC chunks the loader remaps read-only after startup.
pub fn is_relro(ctx: &Context, chunk: ChunkRef) -> bool {
    let shdr = &ctx.chunk(chunk).shdr;
    if !shdr.flags.contains(SectionFlags::WRITE) {
        return false;
    }
    shdr.flags.contains(SectionFlags::TLS)
        || shdr.r#type == elf::SHT_INIT_ARRAY
        || shdr.r#type == elf::SHT_FINI_ARRAY
        || shdr.r#type == elf::SHT_PREINIT_ARRAY
        || chunk == ChunkRef::Got
        || ctx.chunk(chunk).name == ".toc"
        || ctx.chunk(chunk).name.ends_with("rel.ro")
}

/// Thread-local NOBITS chunks overlay the address cursor instead of
/// advancing it.
pub fn is_tbss(ctx: &Context, chunk: ChunkRef) -> bool {
    let shdr = &ctx.chunk(chunk).shdr;
    shdr.r#type == SHT_NOBITS && shdr.flags.contains(SectionFlags::TLS)
}

fn is_bss(ctx: &Context, chunk: ChunkRef) -> bool {
    let shdr = &ctx.chunk(chunk).shdr;
    shdr.r#type == SHT_NOBITS && !shdr.flags.contains(SectionFlags::TLS)
}

fn is_note(ctx: &Context, chunk: ChunkRef) -> bool {
    let shdr = &ctx.chunk(chunk).shdr;
    shdr.r#type == elf::SHT_NOTE && shdr.flags.contains(SectionFlags::ALLOC)
}

fn define(ctx: &Context, vec: &mut Vec<Phdr>, r#type: u32, flags: u32, min_align: u64, chunk: ChunkRef) {
    let shdr = &ctx.chunk(chunk).shdr;
    vec.push(Phdr {
        r#type,
        flags,
        align: min_align.max(shdr.addr_align),
        offset: shdr.offset,
        vaddr: shdr.addr,
        paddr: shdr.addr,
        file_size: if shdr.r#type == SHT_NOBITS { 0 } else { shdr.size },
        mem_size: shdr.size,
    });
}

fn append(ctx: &Context, vec: &mut [Phdr], chunk: ChunkRef) {
    let shdr = &ctx.chunk(chunk).shdr;
    if let Some(phdr) = vec.last_mut() {
        phdr.align = phdr.align.max(shdr.addr_align);
        if shdr.r#type != SHT_NOBITS {
            phdr.file_size = shdr.addr + shdr.size - phdr.vaddr;
        }
        phdr.mem_size = shdr.addr + shdr.size - phdr.vaddr;
    }
}

fn create_phdrs(ctx: &mut Context) -> Vec<Phdr> {
    let mut vec = Vec::new();
    let refs: Vec<ChunkRef> = ctx.chunks.clone();

    for &chunk in &refs {
        ctx.chunk_mut(chunk).extra_addr_align = 1;
    }

    define(ctx, &mut vec, PT_PHDR, PF_R, 8, ChunkRef::Phdr);

    // One PT_NOTE per run of consecutive note chunks with identical flags.
    let mut i = 0;
    while i < refs.len() {
        let first = refs[i];
        i += 1;
        if !is_note(ctx, first) {
            continue;
        }
        let flags = to_phdr_flags(ctx, first);
        let alignment = ctx.chunk(first).shdr.addr_align;
        define(ctx, &mut vec, PT_NOTE, flags, alignment, first);
        while i < refs.len() && is_note(ctx, refs[i]) && to_phdr_flags(ctx, refs[i]) == flags {
            append(ctx, &mut vec, refs[i]);
            i += 1;
        }
    }

    // PT_LOAD groups, with TBSS chunks transparent to grouping.
    {
        let chunks: Vec<ChunkRef> = refs
            .iter()
            .copied()
            .filter(|&c| !is_tbss(ctx, c))
            .collect();
        let end = chunks.len();
        let mut i = 0;
        while i < end {
            let first = chunks[i];
            i += 1;
            if !ctx.chunk(first).shdr.flags.contains(SectionFlags::ALLOC) {
                break;
            }

            let flags = to_phdr_flags(ctx, first);
            define(ctx, &mut vec, PT_LOAD, flags, PAGE_SIZE, first);

            if !is_bss(ctx, first) {
                while i < end
                    && !is_bss(ctx, chunks[i])
                    && to_phdr_flags(ctx, chunks[i]) == flags
                    && ctx
                        .chunk(chunks[i])
                        .shdr
                        .offset
                        .wrapping_sub(ctx.chunk(first).shdr.offset)
                        == ctx
                            .chunk(chunks[i])
                            .shdr
                            .addr
                            .wrapping_sub(ctx.chunk(first).shdr.addr)
                {
                    append(ctx, &mut vec, chunks[i]);
                    i += 1;
                }
            }

            while i < end && is_bss(ctx, chunks[i]) && to_phdr_flags(ctx, chunks[i]) == flags {
                append(ctx, &mut vec, chunks[i]);
                i += 1;
            }

            let align = vec.last().map(|p| p.align).unwrap_or(1);
            ctx.chunk_mut(first).extra_addr_align = align;
        }
    }

    // PT_TLS over the run of TLS chunks; its start is the thread pointer.
    let mut i = 0;
    while i < refs.len() {
        if !ctx.chunk(refs[i]).shdr.flags.contains(SectionFlags::TLS) {
            i += 1;
            continue;
        }

        let flags = to_phdr_flags(ctx, refs[i]);
        define(ctx, &mut vec, PT_TLS, flags, 1, refs[i]);
        i += 1;
        while i < refs.len() && ctx.chunk(refs[i]).shdr.flags.contains(SectionFlags::TLS) {
            append(ctx, &mut vec, refs[i]);
            i += 1;
        }

        if let Some(phdr) = vec.last() {
            ctx.tp_addr = phdr.vaddr;
        }

        // The sort must have left TLS chunks in one contiguous run.
        debug_assert!(!refs[i..]
            .iter()
            .any(|&c| ctx.chunk(c).shdr.flags.contains(SectionFlags::TLS)));
    }

    vec.push(Phdr {
        r#type: PT_GNU_STACK,
        flags: PF_R | PF_W,
        ..Default::default()
    });

    // PT_GNU_RELRO runs, page-aligning both ends of each region.
    let mut i = 0;
    while i < refs.len() {
        if !is_relro(ctx, refs[i]) {
            i += 1;
            continue;
        }

        define(ctx, &mut vec, PT_GNU_RELRO, PF_R, 1, refs[i]);
        ctx.chunk_mut(refs[i]).extra_addr_align = PAGE_SIZE;
        i += 1;
        while i < refs.len() && is_relro(ctx, refs[i]) {
            append(ctx, &mut vec, refs[i]);
            i += 1;
        }

        if let Some(phdr) = vec.last_mut() {
            phdr.mem_size = util::align_to(phdr.mem_size, PAGE_SIZE);
        }
        if i < refs.len() {
            ctx.chunk_mut(refs[i]).extra_addr_align = PAGE_SIZE;
        }
    }

    vec
}

pub fn update_shdr(ctx: &mut Context) {
    let phdrs = create_phdrs(ctx);
    ctx.phdr.chunk.shdr.size = (phdrs.len() * Phdr::SIZE) as u64;
    ctx.phdr.phdrs = phdrs;
}
