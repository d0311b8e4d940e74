//! Output chunks: everything that occupies bytes in the final image.
//!
//! Chunks live in arenas on the context and are addressed by `ChunkRef`, a
//! small copyable handle. The common per-chunk state (section header, name,
//! output index, extra alignment) is the embedded `Chunk`; the variant
//! behavior (`update_shdr`, `copy_buf`) dispatches on the handle.

pub mod ehdr;
pub mod got;
pub mod phdr;
pub mod shdr;

use crate::context::Context;
use crate::elf::{self, SectionFlags, Shdr};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Handle to a chunk in the context's arenas.
pub enum ChunkRef {
    Ehdr,
    Phdr,
    Shdr,
    Got,
    Osec(usize),
    Merged(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Header,
    OutputSection,
    Synthetic,
}

impl ChunkRef {
    pub fn kind(self) -> ChunkKind {
        match self {
            ChunkRef::Ehdr | ChunkRef::Phdr | ChunkRef::Shdr => ChunkKind::Header,
            ChunkRef::Got | ChunkRef::Merged(_) => ChunkKind::Synthetic,
            ChunkRef::Osec(_) => ChunkKind::OutputSection,
        }
    }
}

#[derive(Debug, Clone, Default)]
/// State common to every chunk.
pub struct Chunk {
    pub name: String,
    pub shdr: Shdr,
    /// Index in the output section-header table; zero for header chunks.
    pub shndx: usize,
    /// Additional alignment the segment planner imposes on top of
    /// `shdr.addr_align`.
    pub extra_addr_align: u64,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            shdr: Shdr {
                addr_align: 1,
                ..Default::default()
            },
            extra_addr_align: 1,
            ..Default::default()
        }
    }
}

/// Recompute a chunk's size-dependent header fields.
pub fn update_shdr(ctx: &mut Context, chunk: ChunkRef) {
    match chunk {
        ChunkRef::Phdr => phdr::update_shdr(ctx),
        ChunkRef::Shdr => shdr::update_shdr(ctx),
        ChunkRef::Got => got::update_shdr(ctx),
        ChunkRef::Ehdr | ChunkRef::Osec(_) | ChunkRef::Merged(_) => {}
    }
}

/// Write a chunk's bytes into its assigned range of the output buffer.
pub fn copy_buf(ctx: &Context, chunk: ChunkRef, buf: &mut [u8]) -> Result<()> {
    match chunk {
        ChunkRef::Ehdr => ehdr::copy_buf(ctx, buf),
        ChunkRef::Phdr => {
            ctx.phdr.copy_buf(buf);
            Ok(())
        }
        ChunkRef::Shdr => {
            shdr::copy_buf(ctx, buf);
            Ok(())
        }
        ChunkRef::Got => {
            got::copy_buf(ctx, buf);
            Ok(())
        }
        ChunkRef::Osec(idx) => OutputSection::copy_buf(ctx, idx, buf),
        ChunkRef::Merged(idx) => {
            ctx.merged_sections[idx].copy_buf(buf);
            Ok(())
        }
    }
}

#[derive(Debug)]
/// A named concatenation of input sections in the final image.
pub struct OutputSection {
    pub chunk: Chunk,
    /// Member input sections as `(object index, section index)` pairs.
    pub members: Vec<(usize, usize)>,
    pub idx: usize,
}

impl OutputSection {
    pub fn new(name: String, r#type: u32, flags: SectionFlags, idx: usize) -> Self {
        let mut chunk = Chunk::new();
        chunk.name = name;
        chunk.shdr.r#type = r#type;
        chunk.shdr.flags = flags;
        Self {
            chunk,
            members: Vec::new(),
            idx,
        }
    }

    fn copy_buf(ctx: &Context, idx: usize, buf: &mut [u8]) -> Result<()> {
        let osec = &ctx.output_sections[idx];
        if osec.chunk.shdr.r#type == elf::SHT_NOBITS {
            return Ok(());
        }

        let base = osec.chunk.shdr.offset as usize;
        for &(obj, shndx) in &osec.members {
            if let Some(isec) = &ctx.objs[obj].sections[shndx] {
                let at = base + isec.offset as usize;
                isec.write_to(ctx, obj, &mut buf[at..])?;
            }
        }
        Ok(())
    }
}

const OUTPUT_NAME_PREFIXES: &[&str] = &[
    ".text.",
    ".data.rel.ro.",
    ".data.",
    ".rodata.",
    ".bss.rel.ro.",
    ".bss.",
    ".init_array.",
    ".fini_array.",
    ".tbss.",
    ".tdata.",
    ".gcc_except_table.",
    ".ctors.",
    ".dtors.",
];

/// Collapse an input section name to the output section it lands in.
pub fn get_output_name(name: &str, flags: SectionFlags) -> String {
    if (name == ".rodata" || name.starts_with(".rodata.")) && flags.contains(SectionFlags::MERGE) {
        return if flags.contains(SectionFlags::STRINGS) {
            ".rodata.str".to_string()
        } else {
            ".rodata.cst".to_string()
        };
    }

    for prefix in OUTPUT_NAME_PREFIXES {
        let stem = &prefix[..prefix.len() - 1];
        if name == stem || name.starts_with(prefix) {
            return stem.to_string();
        }
    }
    name.to_string()
}

/// Init/fini arrays are emitted as their dedicated section types even when
/// the compiler produced them as PROGBITS.
pub fn canonicalize_type(name: &str, r#type: u32) -> u32 {
    if r#type == elf::SHT_PROGBITS {
        if name == ".init_array" || name.starts_with(".init_array.") {
            return elf::SHT_INIT_ARRAY;
        }
        if name == ".fini_array" || name.starts_with(".fini_array.") {
            return elf::SHT_FINI_ARRAY;
        }
    }
    r#type
}

/// Find or create the output section for `(name, type, flags)`.
pub fn get_output_section_instance(
    ctx: &mut Context,
    name: &str,
    r#type: u32,
    flags: SectionFlags,
) -> usize {
    let name = get_output_name(name, flags);
    let r#type = canonicalize_type(&name, r#type);
    let mut flags = flags
        .difference(SectionFlags::GROUP)
        .difference(SectionFlags::COMPRESSED)
        .difference(SectionFlags::LINK_ORDER);

    if r#type == elf::SHT_INIT_ARRAY || r#type == elf::SHT_FINI_ARRAY {
        flags |= SectionFlags::WRITE;
    }

    let found = ctx.output_sections.iter().find(|osec| {
        name == osec.chunk.name
            && r#type == osec.chunk.shdr.r#type
            && flags == osec.chunk.shdr.flags
    });
    if let Some(osec) = found {
        return osec.idx;
    }

    let idx = ctx.output_sections.len();
    ctx.output_sections
        .push(OutputSection::new(name, r#type, flags, idx));
    idx
}
