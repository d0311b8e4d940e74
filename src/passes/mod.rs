//! The linker's pass pipeline. Control flow is a fixed linear sequence over
//! the shared context: read inputs, resolve, register pieces, size, sort,
//! assign addresses and offsets, relax, fix up, and copy chunks out.

use std::path::Path;

use num_traits::FromPrimitive as _;
use tracing::debug;

use crate::arch::riscv::RelType;
use crate::context::{Context, SyntheticSymbols};
use crate::elf::{
    self, sym_info, Sym, SectionFlags, IMAGE_BASE, PAGE_SIZE, SHN_ABS, SHT_NOBITS, SHT_NOTE,
    STB_GLOBAL, STT_NOTYPE, STV_HIDDEN,
};
use crate::error::{Error, Result};
use crate::file::archive::read_archive_members;
use crate::file::{file_type, find_library, File, FileType};
use crate::input::object::{self, ObjectFile};
use crate::input::InputFile;
use crate::output::{self, got, ChunkKind, ChunkRef};
use crate::symbol::{self, get_symbol_by_name, Symbol, NEEDS_GOT, NEEDS_GOTTP};
use crate::util;

/// One command-line input, in order: a path or a `-l` library reference.
#[derive(Debug, Clone)]
pub enum InputArg {
    Path(String),
    Library(String),
}

/// Read every command-line input into the context.
pub fn read_input_files(ctx: &mut Context, args: &[InputArg]) -> Result<()> {
    for arg in args {
        match arg {
            InputArg::Library(name) => {
                let file = find_library(&ctx.opts, name)?;
                read_file(ctx, file)?;
            }
            InputArg::Path(path) => {
                read_file(ctx, File::open(Path::new(path))?)?;
            }
        }
    }

    if ctx.objs.is_empty() {
        return Err(Error::NoInputFiles);
    }
    Ok(())
}

/// Read one file: an object directly, or every member of an archive.
pub fn read_file(ctx: &mut Context, file: File) -> Result<()> {
    if ctx.visited.contains(&file.name) {
        return Ok(());
    }

    match file_type(file.contents()) {
        FileType::Object => {
            object::create_object_file(ctx, file, false)?;
        }
        FileType::Archive | FileType::ThinArchive => {
            let name = file.name.clone();
            for child in read_archive_members(&file)? {
                match file_type(child.contents()) {
                    FileType::Object => {
                        object::create_object_file(ctx, child, true)?;
                    }
                    _ => {
                        return Err(Error::UnknownFileType { path: child.name });
                    }
                }
            }
            ctx.visited.insert(name);
        }
        _ => {
            return Err(Error::UnknownFileType { path: file.name });
        }
    }
    Ok(())
}

fn alive_objs(ctx: &Context) -> Vec<usize> {
    (0..ctx.objs.len())
        .filter(|&o| ctx.objs[o].input.is_alive)
        .collect()
}

/// The empty object the linker's own symbols live in. Priority 1 places it
/// ahead of every real input.
pub fn create_internal_file(ctx: &mut Context) {
    let mut input = InputFile::internal();
    input.first_global = 1;
    input.elf_syms.push(Sym::default());
    input.symbols.push(ctx.symbols.len());
    ctx.symbols.push(Symbol::new(""));

    ctx.internal_obj = Some(ctx.objs.len());
    ctx.objs.push(ObjectFile {
        input,
        sections: Vec::new(),
        mergeable_sections: Vec::new(),
        symtab_shndx: Vec::new(),
    });
}

/// Multi-pass symbol resolution: propose, mark live files, drop dead files'
/// proposals, and re-propose from the survivors.
pub fn resolve_symbols(ctx: &mut Context) -> Result<()> {
    for o in 0..ctx.objs.len() {
        object::resolve_symbols(ctx, o);
    }

    mark_live_objects(ctx)?;

    for o in 0..ctx.objs.len() {
        if !ctx.objs[o].input.is_alive {
            object::clear_symbols(ctx, o);
        }
    }
    for o in 0..ctx.objs.len() {
        if ctx.objs[o].input.is_alive {
            object::resolve_symbols(ctx, o);
        }
    }

    debug!(
        alive = alive_objs(ctx).len(),
        total = ctx.objs.len(),
        "resolved symbols"
    );
    Ok(())
}

/// BFS from the command-line inputs; strong references activate archive
/// members, which may reference further members in turn.
fn mark_live_objects(ctx: &mut Context) -> Result<()> {
    let mut roots = alive_objs(ctx);
    if roots.is_empty() {
        return Err(Error::NoInputFiles);
    }

    let mut next = 0;
    while next < roots.len() {
        let obj_idx = roots[next];
        next += 1;
        object::mark_live_objects(ctx, obj_idx, &mut roots)?;
    }
    Ok(())
}

pub fn register_section_pieces(ctx: &mut Context) -> Result<()> {
    for o in alive_objs(ctx) {
        object::register_section_pieces(ctx, o)?;
    }
    Ok(())
}

pub fn compute_import_export(ctx: &mut Context) {
    for o in alive_objs(ctx) {
        object::compute_import_export(ctx, o);
    }
}

/// Mark surviving fragments live and lay out every pool.
pub fn compute_merged_section_sizes(ctx: &mut Context) {
    for o in alive_objs(ctx) {
        for mi in 0..ctx.objs[o].mergeable_sections.len() {
            let Some(m) = &ctx.objs[o].mergeable_sections[mi] else {
                continue;
            };
            let parent = m.parent;
            let fragments = m.fragments.clone();
            for frag in fragments {
                ctx.merged_sections[parent].frags[frag].is_alive = true;
            }
        }
    }

    for sec in &mut ctx.merged_sections {
        sec.assign_offsets();
    }
}

/// The headers and the GOT exist regardless of the inputs.
pub fn create_synthetic_sections(ctx: &mut Context) {
    ctx.chunks.push(ChunkRef::Ehdr);
    ctx.chunks.push(ChunkRef::Phdr);
    ctx.chunks.push(ChunkRef::Shdr);
    ctx.chunks.push(ChunkRef::Got);
}

/// Distribute every live input section into its output section.
pub fn bin_sections(ctx: &mut Context) {
    let mut groups: Vec<Vec<(usize, usize)>> = vec![Vec::new(); ctx.output_sections.len()];
    for o in alive_objs(ctx) {
        for si in 0..ctx.objs[o].sections.len() {
            if let Some(isec) = &ctx.objs[o].sections[si] {
                if isec.is_alive {
                    groups[isec.osec].push((o, si));
                }
            }
        }
    }

    for (idx, group) in groups.into_iter().enumerate() {
        ctx.output_sections[idx].members = group;
    }
}

/// Append the non-empty output and merged sections to the chunk list,
/// name-sorted for determinism.
pub fn collect_output_sections(ctx: &mut Context) {
    let mut osecs: Vec<ChunkRef> = Vec::new();
    for osec in &ctx.output_sections {
        if !osec.members.is_empty() {
            osecs.push(ChunkRef::Osec(osec.idx));
        }
    }
    for (idx, merged) in ctx.merged_sections.iter().enumerate() {
        if merged.chunk.shdr.size > 0 {
            osecs.push(ChunkRef::Merged(idx));
        }
    }

    osecs.sort_by(|&x, &y| ctx.chunk(x).name.cmp(&ctx.chunk(y).name));
    debug!(count = osecs.len(), "collected output sections");
    ctx.chunks.extend(osecs);
}

/// Inject the array-bounds symbols and `__global_pointer$` into the
/// internal object and let it propose them.
pub fn add_synthetic_symbols(ctx: &mut Context) -> Result<()> {
    let obj_idx = ctx.internal_obj.ok_or(Error::Internal {
        what: "synthetic symbols before the internal file",
    })?;

    let add = |ctx: &mut Context, name: &str| -> usize {
        let esym = Sym {
            info: sym_info(STB_GLOBAL, STT_NOTYPE),
            other: STV_HIDDEN,
            shndx: SHN_ABS,
            ..Default::default()
        };
        ctx.objs[obj_idx].input.elf_syms.push(esym);
        let sid = get_symbol_by_name(ctx, name);
        ctx.objs[obj_idx].input.symbols.push(sid);
        sid
    };

    ctx.synthetic = Some(SyntheticSymbols {
        init_array_start: add(ctx, "__init_array_start"),
        init_array_end: add(ctx, "__init_array_end"),
        fini_array_start: add(ctx, "__fini_array_start"),
        fini_array_end: add(ctx, "__fini_array_end"),
        preinit_array_start: add(ctx, "__preinit_array_start"),
        preinit_array_end: add(ctx, "__preinit_array_end"),
        global_pointer: add(ctx, "__global_pointer$"),
    });

    object::resolve_symbols(ctx, obj_idx);
    Ok(())
}

pub fn claim_unresolved_symbols(ctx: &mut Context) {
    for o in alive_objs(ctx) {
        object::claim_unresolved_symbols(ctx, o);
    }
}

/// Scan relocations, then allocate aux slots and GOT entries for every
/// symbol the scan flagged.
pub fn scan_rels(ctx: &mut Context) -> Result<()> {
    for o in alive_objs(ctx) {
        object::scan_relocations(ctx, o)?;
    }

    let mut syms = Vec::new();
    for o in alive_objs(ctx) {
        for k in 0..ctx.objs[o].input.symbols.len() {
            let sid = ctx.objs[o].input.symbols[k];
            let sym = &ctx.symbols[sid];
            if sym.file == Some(o) && (sym.flags != 0 || sym.is_exported) {
                syms.push(sid);
            }
        }
    }

    for sid in syms {
        got::ensure_aux(ctx, sid);

        let flags = ctx.symbols[sid].flags;
        if flags & NEEDS_GOT != 0 {
            got::add_got_symbol(ctx, sid);
        }
        if flags & NEEDS_GOTTP != 0 {
            got::add_got_tp_symbol(ctx, sid);
        }
        ctx.symbols[sid].flags = 0;
    }

    debug!(
        got_slots = ctx.got.chunk.shdr.size / 8,
        "scanned relocations"
    );
    Ok(())
}

/// Place each output section's members and size the section.
pub fn compute_section_sizes(ctx: &mut Context) {
    for idx in 0..ctx.output_sections.len() {
        let members = ctx.output_sections[idx].members.clone();
        let mut offset = 0u64;
        let mut p2align = 0u8;

        for (o, si) in members {
            let Some(isec) = &mut ctx.objs[o].sections[si] else {
                continue;
            };
            offset = util::align_to(offset, 1 << isec.p2align);
            isec.offset = offset as u32;
            offset += isec.sh_size as u64;
            p2align = p2align.max(isec.p2align);
        }

        let osec = &mut ctx.output_sections[idx];
        osec.chunk.shdr.size = offset;
        osec.chunk.shdr.addr_align = 1 << p2align;
    }
}

fn sort_rank1(ctx: &Context, chunk: ChunkRef) -> i32 {
    let shdr = &ctx.chunk(chunk).shdr;

    // The section-header table trails everything, including the non-ALLOC
    // payload it describes.
    if chunk == ChunkRef::Shdr {
        return i32::MAX;
    }
    if !shdr.flags.contains(SectionFlags::ALLOC) {
        return i32::MAX - 1;
    }
    if chunk == ChunkRef::Ehdr {
        return 0;
    }
    if chunk == ChunkRef::Phdr {
        return 1;
    }
    if shdr.r#type == SHT_NOTE {
        return 3;
    }

    let b2i = |b: bool| i32::from(b);
    let writable = b2i(shdr.flags.contains(SectionFlags::WRITE));
    let not_exec = b2i(!shdr.flags.contains(SectionFlags::EXECINSTR));
    let not_tls = b2i(!shdr.flags.contains(SectionFlags::TLS));
    let not_relro = b2i(!output::phdr::is_relro(ctx, chunk));
    let is_bss = b2i(shdr.r#type == SHT_NOBITS);

    (1 << 10) | writable << 9 | not_exec << 8 | not_tls << 7 | not_relro << 6 | is_bss << 5
}

fn sort_rank2(ctx: &Context, chunk: ChunkRef) -> i32 {
    let shdr = &ctx.chunk(chunk).shdr;
    if shdr.r#type == SHT_NOTE {
        return -(shdr.addr_align as i32);
    }
    if ctx.chunk(chunk).name == ".toc" {
        return 2;
    }
    if chunk == ChunkRef::Got {
        return 1;
    }
    0
}

pub fn sort_output_sections(ctx: &mut Context) {
    let mut chunks = std::mem::take(&mut ctx.chunks);
    chunks.sort_by(|&x, &y| {
        (sort_rank1(ctx, x), sort_rank2(ctx, x)).cmp(&(sort_rank1(ctx, y), sort_rank2(ctx, y)))
    });
    ctx.chunks = chunks;
}

fn chunk_alignment(ctx: &Context, chunk: ChunkRef) -> u64 {
    let chunk = ctx.chunk(chunk);
    chunk.extra_addr_align.max(chunk.shdr.addr_align)
}

/// One sweep of address and file-offset assignment.
fn do_set_osec_offsets(ctx: &mut Context) -> u64 {
    let chunks = ctx.chunks.clone();

    // Virtual addresses: TBSS chunks overlay the cursor, everything else
    // advances it.
    let mut addr = IMAGE_BASE;
    for &chunk in &chunks {
        if !ctx.chunk(chunk).shdr.flags.contains(SectionFlags::ALLOC) {
            continue;
        }
        if output::phdr::is_tbss(ctx, chunk) {
            ctx.chunk_mut(chunk).shdr.addr = addr;
            continue;
        }

        addr = util::align_to(addr, chunk_alignment(ctx, chunk));
        ctx.chunk_mut(chunk).shdr.addr = addr;
        addr += ctx.chunk(chunk).shdr.size;
    }

    // Each TBSS run is laid out relative to its own start.
    let mut i = 0;
    while i < chunks.len() {
        if !output::phdr::is_tbss(ctx, chunks[i]) {
            i += 1;
            continue;
        }
        let mut addr = ctx.chunk(chunks[i]).shdr.addr;
        while i < chunks.len() && output::phdr::is_tbss(ctx, chunks[i]) {
            addr = util::align_to(addr, chunk_alignment(ctx, chunks[i]));
            ctx.chunk_mut(chunks[i]).shdr.addr = addr;
            addr += ctx.chunk(chunks[i]).shdr.size;
            i += 1;
        }
    }

    // File offsets: within the ALLOC region, pack `offset = first.offset +
    // (addr - first.addr)` while flags stay contiguous and virtual gaps
    // stay under a page. NOBITS chunks take no file space.
    let mut fileoff = 0u64;
    let mut i = 0;
    while i < chunks.len()
        && ctx
            .chunk(chunks[i])
            .shdr
            .flags
            .contains(SectionFlags::ALLOC)
    {
        let first = chunks[i];
        debug_assert!(ctx.chunk(first).shdr.r#type != SHT_NOBITS);
        fileoff = util::align_to(fileoff, chunk_alignment(ctx, first));

        loop {
            let off =
                fileoff + ctx.chunk(chunks[i]).shdr.addr - ctx.chunk(first).shdr.addr;
            ctx.chunk_mut(chunks[i]).shdr.offset = off;
            i += 1;

            if i >= chunks.len()
                || !ctx
                    .chunk(chunks[i])
                    .shdr
                    .flags
                    .contains(SectionFlags::ALLOC)
                || ctx.chunk(chunks[i]).shdr.r#type == SHT_NOBITS
            {
                break;
            }
            if ctx.chunk(chunks[i]).shdr.addr < ctx.chunk(first).shdr.addr {
                break;
            }

            let prev = ctx.chunk(chunks[i - 1]);
            let gap = ctx.chunk(chunks[i]).shdr.addr - prev.shdr.addr - prev.shdr.size;
            if gap >= PAGE_SIZE {
                break;
            }
        }

        let prev = ctx.chunk(chunks[i - 1]);
        fileoff = prev.shdr.offset + prev.shdr.size;

        while i < chunks.len()
            && ctx
                .chunk(chunks[i])
                .shdr
                .flags
                .contains(SectionFlags::ALLOC)
            && ctx.chunk(chunks[i]).shdr.r#type == SHT_NOBITS
        {
            i += 1;
        }
    }

    // Non-ALLOC chunks pack sequentially.
    while i < chunks.len() {
        fileoff = util::align_to(fileoff, ctx.chunk(chunks[i]).shdr.addr_align);
        ctx.chunk_mut(chunks[i]).shdr.offset = fileoff;
        fileoff += ctx.chunk(chunks[i]).shdr.size;
        i += 1;
    }

    fileoff
}

/// Assign offsets, iterating to a fixed point on the program-header size:
/// more headers move every offset, which can regroup the LOAD segments.
pub fn set_osec_offsets(ctx: &mut Context) -> u64 {
    loop {
        let fileoff = do_set_osec_offsets(ctx);

        let size = ctx.phdr.chunk.shdr.size;
        output::phdr::update_shdr(ctx);
        if size == ctx.phdr.chunk.shdr.size {
            return fileoff;
        }
    }
}

/// Relaxation: collapse `R_RISCV_ALIGN` pads in executable sections, shift
/// affected symbol values, and redo the layout.
pub fn resize_sections(ctx: &mut Context) -> u64 {
    for o in alive_objs(ctx) {
        for si in 0..ctx.objs[o].sections.len() {
            let resizable = match &ctx.objs[o].sections[si] {
                Some(isec) => {
                    let shdr = isec.shdr(&ctx.objs[o].input);
                    isec.is_alive
                        && shdr.flags.contains(SectionFlags::ALLOC)
                        && shdr.flags.contains(SectionFlags::EXECINSTR)
                }
                None => false,
            };
            if resizable {
                shrink_section(ctx, o, si);
            }
        }
    }

    // Every symbol inside a shrunk section moves back by the shrinkage
    // accumulated before it.
    for o in alive_objs(ctx) {
        for k in 0..ctx.objs[o].input.symbols.len() {
            let sid = ctx.objs[o].input.symbols[k];
            if ctx.symbols[sid].file != Some(o) {
                continue;
            }
            let symbol::SymbolTarget::Section { shndx } = ctx.symbols[sid].target else {
                continue;
            };
            let Some(isec) = &ctx.objs[o].sections[shndx] else {
                continue;
            };
            if isec.deltas.is_empty() {
                continue;
            }

            let value = ctx.symbols[sid].value;
            let idx = isec.rels.partition_point(|rel| rel.offset < value);
            let delta = isec.deltas[idx] as u64;
            ctx.symbols[sid].value = value.wrapping_sub(delta);
        }
    }

    compute_section_sizes(ctx);
    set_osec_offsets(ctx)
}

/// Record, per relocation, how many bytes relaxation removes before it, and
/// shrink the section by the total.
fn shrink_section(ctx: &mut Context, o: usize, si: usize) {
    let isec_addr = match &ctx.objs[o].sections[si] {
        Some(isec) => isec.addr(ctx),
        None => return,
    };
    let rels = match &ctx.objs[o].sections[si] {
        Some(isec) => isec.rels.clone(),
        None => return,
    };

    let mut deltas = Vec::with_capacity(rels.len() + 1);
    let mut delta: i32 = 0;
    for rel in &rels {
        deltas.push(delta);

        if RelType::from_u32(rel.r#type) == Some(RelType::Align) {
            let loc = isec_addr + rel.offset - delta as u64;
            let next_loc = loc + rel.addend as u64;
            let alignment = util::bit_ceil(rel.addend as u64 + 1);
            delta += (next_loc - util::align_to(loc, alignment)) as i32;
        }
    }
    deltas.push(delta);

    if let Some(isec) = &mut ctx.objs[o].sections[si] {
        isec.deltas = deltas;
        isec.sh_size -= delta as u32;
    }
}

/// Bind the array-bounds symbols to their sections and the global pointer
/// to the first loadable chunk.
pub fn fix_synthetic_symbols(ctx: &mut Context) {
    let Some(synthetic) = ctx.synthetic else {
        return;
    };

    let output_chunks: Vec<ChunkRef> = ctx
        .chunks
        .iter()
        .copied()
        .filter(|chunk| chunk.kind() != ChunkKind::Header)
        .collect();

    for &chunk in &output_chunks {
        let (start, stop) = match ctx.chunk(chunk).shdr.r#type {
            elf::SHT_INIT_ARRAY => (synthetic.init_array_start, synthetic.init_array_end),
            elf::SHT_PREINIT_ARRAY => {
                (synthetic.preinit_array_start, synthetic.preinit_array_end)
            }
            elf::SHT_FINI_ARRAY => (synthetic.fini_array_start, synthetic.fini_array_end),
            _ => continue,
        };

        let size = ctx.chunk(chunk).shdr.size;
        ctx.symbols[start].target = symbol::SymbolTarget::Chunk(chunk);
        ctx.symbols[start].value = 0;
        ctx.symbols[stop].target = symbol::SymbolTarget::Chunk(chunk);
        ctx.symbols[stop].value = size;
    }

    if let Some(&first) = output_chunks.first() {
        let gp = synthetic.global_pointer;
        ctx.symbols[gp].target = symbol::SymbolTarget::Chunk(first);
        ctx.symbols[gp].value = 0;
    }
}

/// Run the whole pipeline over the already-read inputs and return the
/// output image.
pub fn link(ctx: &mut Context) -> Result<Vec<u8>> {
    create_internal_file(ctx);
    resolve_symbols(ctx)?;
    register_section_pieces(ctx)?;
    compute_import_export(ctx);
    compute_merged_section_sizes(ctx);
    create_synthetic_sections(ctx);
    bin_sections(ctx);
    collect_output_sections(ctx);
    add_synthetic_symbols(ctx)?;
    claim_unresolved_symbols(ctx);
    scan_rels(ctx)?;
    compute_section_sizes(ctx);
    sort_output_sections(ctx);

    for chunk in ctx.chunks.clone() {
        output::update_shdr(ctx, chunk);
    }

    // Empty synthetic chunks are dropped; output sections stay.
    let chunks = std::mem::take(&mut ctx.chunks);
    let kept: Vec<ChunkRef> = chunks
        .into_iter()
        .filter(|&chunk| {
            chunk.kind() == ChunkKind::OutputSection || ctx.chunk(chunk).shdr.size != 0
        })
        .collect();
    ctx.chunks = kept;

    let mut shndx = 1;
    for chunk in ctx.chunks.clone() {
        if chunk.kind() != ChunkKind::Header {
            ctx.chunk_mut(chunk).shndx = shndx;
            shndx += 1;
        }
    }
    for chunk in ctx.chunks.clone() {
        output::update_shdr(ctx, chunk);
    }

    set_osec_offsets(ctx);
    let file_size = resize_sections(ctx);
    fix_synthetic_symbols(ctx);

    debug!(file_size, chunks = ctx.chunks.len(), "layout complete");

    let mut buf = vec![0u8; file_size as usize];
    for chunk in ctx.chunks.clone() {
        output::copy_buf(ctx, chunk, &mut buf)?;
    }
    Ok(buf)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::elf::{Ehdr, Phdr, Rela, Shdr};
    use crate::file::MachineType;
    use crate::testobj::{build_archive, build_object, TestSection, TestSym};

    fn link_files(files: Vec<File>) -> (Context, Vec<u8>) {
        let opts = crate::context::Options::builder()
            .emulation(MachineType::Riscv64)
            .build();
        let mut ctx = Context::new(opts);
        for file in files {
            read_file(&mut ctx, file).unwrap();
        }
        let buf = link(&mut ctx).unwrap();
        (ctx, buf)
    }

    fn sid(ctx: &Context, name: &str) -> usize {
        ctx.symbol_map[name]
    }

    fn find_osec<'a>(ctx: &'a Context, name: &str) -> &'a crate::output::OutputSection {
        ctx.output_sections
            .iter()
            .find(|osec| osec.chunk.name == name)
            .unwrap()
    }

    #[test]
    fn test_links_single_object_to_executable() {
        let obj = build_object(
            &[TestSection::text(&[0x13, 0, 0, 0, 0x13, 0, 0, 0])],
            &[],
            &[TestSym::global("main", 1, 0)],
        );
        let (mut ctx, buf) = link_files(vec![File::from_bytes("a.o", obj)]);

        assert!(elf::check_magic(&buf));
        let ehdr = Ehdr::parse(&buf);
        assert_eq!(ehdr.r#type, elf::ET_EXEC);
        assert_eq!(ehdr.machine, elf::EM_RISCV);
        assert_eq!(ehdr.ident[elf::EI_CLASS], elf::ELFCLASS64);
        assert_eq!(ehdr.ident[elf::EI_DATA], elf::ELFDATA2LSB);

        // the entry point is .text, which is where main sits
        assert_ne!(ehdr.entry, 0);
        assert_eq!(ehdr.entry, symbol::symbol_addr(&ctx, sid(&ctx, "main")));

        // the program-header table matches its chunk
        assert_eq!(
            ehdr.ph_num as u64 * Phdr::SIZE as u64,
            ctx.phdr.chunk.shdr.size
        );
        assert_eq!(ehdr.ph_off, ctx.phdr.chunk.shdr.offset);

        // every emitted section header reads back equal to its chunk
        for &chunk in &ctx.chunks {
            let c = ctx.chunk(chunk);
            if c.shndx == 0 {
                continue;
            }
            let at = ehdr.sh_off as usize + c.shndx * Shdr::SIZE;
            let back = Shdr::parse(&buf[at..]);
            assert_eq!(back.addr, c.shdr.addr);
            assert_eq!(back.offset, c.shdr.offset);
            assert_eq!(back.size, c.shdr.size);
            assert_eq!(back.flags, c.shdr.flags);
        }

        // ALLOC chunks respect their effective alignment
        for &chunk in &ctx.chunks {
            let c = ctx.chunk(chunk);
            if c.shdr.flags.contains(SectionFlags::ALLOC) {
                let align = c.shdr.addr_align.max(c.extra_addr_align);
                assert_eq!(c.shdr.addr % align, 0);
            }
        }

        // segment laws
        let phdrs: Vec<Phdr> = (0..ehdr.ph_num as usize)
            .map(|i| Phdr::parse(&buf[ehdr.ph_off as usize + i * Phdr::SIZE..]))
            .collect();
        assert!(phdrs.iter().any(|p| p.r#type == elf::PT_LOAD));
        assert!(phdrs.iter().any(|p| p.r#type == elf::PT_GNU_STACK));
        for phdr in &phdrs {
            if phdr.r#type == elf::PT_LOAD {
                assert!(phdr.file_size <= phdr.mem_size);
                assert_eq!(phdr.vaddr, phdr.paddr);
            }
        }

        // the text bytes made it into the image
        let text = find_osec(&ctx, ".text");
        let at = text.chunk.shdr.offset as usize;
        assert_eq!(&buf[at..at + 8], &[0x13, 0, 0, 0, 0x13, 0, 0, 0]);

        // layout is at a fixed point: re-running assignment changes nothing
        assert_eq!(set_osec_offsets(&mut ctx), buf.len() as u64);
    }

    #[test]
    fn test_linking_twice_is_deterministic() {
        let make = || {
            vec![
                File::from_bytes(
                    "a.o",
                    build_object(
                        &[
                            TestSection::text(&[0x13, 0, 0, 0]),
                            TestSection::merge_strings(".rodata.str1.1", b"hi\0there\0"),
                        ],
                        &[],
                        &[TestSym::global("main", 1, 0), TestSym::global("greet", 2, 3)],
                    ),
                ),
                File::from_bytes(
                    "b.o",
                    build_object(
                        &[TestSection::merge_strings(".rodata.str1.1", b"there\0")],
                        &[],
                        &[TestSym::global("other", 1, 0)],
                    ),
                ),
            ]
        };
        let (_, first) = link_files(make());
        let (_, second) = link_files(make());
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_dedup_across_objects() {
        let make = |sym: &str| {
            build_object(
                &[TestSection::merge_strings(".rodata.str1.1", b"hello\0")],
                &[],
                &[TestSym::global(sym, 1, 0)],
            )
        };
        let (ctx, buf) = link_files(vec![
            File::from_bytes("a.o", make("s1")),
            File::from_bytes("b.o", make("s2")),
        ]);

        let pool = ctx
            .merged_sections
            .iter()
            .find(|m| m.chunk.name == ".rodata.str")
            .unwrap();
        assert_eq!(pool.frags.len(), 1);
        assert_eq!(pool.chunk.shdr.size, 6);

        let a1 = symbol::symbol_addr(&ctx, sid(&ctx, "s1"));
        let a2 = symbol::symbol_addr(&ctx, sid(&ctx, "s2"));
        assert_ne!(a1, 0);
        assert_eq!(a1, a2);

        let at = pool.chunk.shdr.offset as usize;
        assert_eq!(&buf[at..at + 6], b"hello\0");
    }

    #[test]
    fn test_archive_member_liveness() {
        let main_obj = build_object(
            &[TestSection::text(&[0x13, 0, 0, 0])],
            &[],
            &[TestSym::global("main", 1, 0), TestSym::undef("foo")],
        );
        let foo_obj = build_object(
            &[TestSection::text(&[0x67, 0x80, 0, 0])],
            &[],
            &[TestSym::global("foo", 1, 0)],
        );
        let bar_obj = build_object(
            &[TestSection::text(&[0x67, 0x80, 0, 0])],
            &[],
            &[TestSym::global("bar", 1, 0)],
        );
        let archive = build_archive(&[("foo.o", &foo_obj), ("bar.o", &bar_obj)]);

        let (ctx, _) = link_files(vec![
            File::from_bytes("main.o", main_obj),
            File::from_bytes("liba.a", archive),
        ]);

        let find = |name: &str| {
            ctx.objs
                .iter()
                .position(|o| o.input.file.name == name)
                .unwrap()
        };
        assert!(ctx.objs[find("foo.o")].input.is_alive);
        assert!(!ctx.objs[find("bar.o")].input.is_alive);

        assert!(ctx.symbols[sid(&ctx, "foo")].file.is_some());
        assert_ne!(symbol::symbol_addr(&ctx, sid(&ctx, "foo")), 0);
        // bar's definition died with its member
        assert!(ctx.symbols[sid(&ctx, "bar")].file.is_none());
    }

    #[test]
    fn test_strong_definition_beats_weak() {
        let weak_obj = build_object(
            &[TestSection::text(&[0x13, 0, 0, 0])],
            &[],
            &[
                TestSym::global("main", 1, 0),
                TestSym::weak("w", elf::SHN_ABS, 0x1),
            ],
        );
        let strong_obj = build_object(&[], &[], &[TestSym::global("w", elf::SHN_ABS, 0x2)]);

        let (ctx, _) = link_files(vec![
            File::from_bytes("weak.o", weak_obj),
            File::from_bytes("strong.o", strong_obj),
        ]);

        let strong_idx = ctx
            .objs
            .iter()
            .position(|o| o.input.file.name == "strong.o")
            .unwrap();
        assert_eq!(ctx.symbols[sid(&ctx, "w")].file, Some(strong_idx));
        assert_eq!(symbol::symbol_addr(&ctx, sid(&ctx, "w")), 0x2);
    }

    #[test]
    fn test_undefined_weak_call_encodes_zero() {
        // auipc ra, 0 ; jalr ra, 0(ra)
        let text = TestSection::text(&[0x97, 0, 0, 0, 0xe7, 0x80, 0, 0]).with_rels(vec![Rela {
            offset: 0,
            r#type: RelType::CallPlt as u32,
            sym: 1,
            addend: 0,
        }]);
        let obj = build_object(&[text], &[], &[TestSym::undef_weak("w")]);
        let (ctx, buf) = link_files(vec![File::from_bytes("a.o", obj)]);

        let at = find_osec(&ctx, ".text").chunk.shdr.offset as usize;
        assert_eq!(util::read_u32(&buf, at), 0x0000_0097);
        assert_eq!(util::read_u32(&buf, at + 4), 0x0000_80e7);
    }

    #[test]
    fn test_undefined_strong_reference_is_fatal() {
        let text = TestSection::text(&[0x97, 0, 0, 0, 0xe7, 0x80, 0, 0]).with_rels(vec![Rela {
            offset: 0,
            r#type: RelType::CallPlt as u32,
            sym: 1,
            addend: 0,
        }]);
        let obj = build_object(&[text], &[], &[TestSym::undef("missing")]);

        let opts = crate::context::Options::builder()
            .emulation(MachineType::Riscv64)
            .build();
        let mut ctx = Context::new(opts);
        read_file(&mut ctx, File::from_bytes("a.o", obj)).unwrap();
        assert!(matches!(
            link(&mut ctx),
            Err(Error::UndefinedSymbol { name }) if name == "missing"
        ));
    }

    #[test]
    fn test_align_relaxation_shrinks_text() {
        // one instruction, six bytes of pad, one compressed instruction
        let contents = [
            0x93, 0x00, 0x10, 0x00, // addi x1, x0, 1
            0x01, 0x00, 0x01, 0x00, 0x01, 0x00, // pad
            0x01, 0x00, // c.nop
        ];
        let text = TestSection::progbits(
            ".text",
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
            &contents,
            8,
        )
        .with_rels(vec![Rela {
            offset: 4,
            r#type: RelType::Align as u32,
            sym: 0,
            addend: 6,
        }]);
        let obj = build_object(
            &[text],
            &[],
            &[TestSym::global("main", 1, 0), TestSym::global("after", 1, 10)],
        );
        let (ctx, buf) = link_files(vec![File::from_bytes("a.o", obj)]);

        let obj_idx = ctx
            .objs
            .iter()
            .position(|o| o.input.file.name == "a.o")
            .unwrap();
        let isec = ctx.objs[obj_idx].sections[1].as_ref().unwrap();
        assert_eq!(isec.deltas, vec![0, 2]);
        assert_eq!(isec.sh_size, 10);

        // symbols after the pad moved back with it
        assert_eq!(ctx.symbols[sid(&ctx, "after")].value, 8);
        let text_addr = find_osec(&ctx, ".text").chunk.shdr.addr;
        assert_eq!(symbol::symbol_addr(&ctx, sid(&ctx, "after")), text_addr + 8);
        assert_eq!(symbol::symbol_addr(&ctx, sid(&ctx, "main")), text_addr);

        // the surviving pad is one plain nop, then the trailing insn
        let at = find_osec(&ctx, ".text").chunk.shdr.offset as usize;
        assert_eq!(
            &buf[at..at + 10],
            &[0x93, 0x00, 0x10, 0x00, 0x13, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_got_call_resolves_through_slot() {
        // auipc t1, 0 ; ld t1, 0(t1), with the HI20 against puts' GOT slot
        // and the LO12 against the local label marking the auipc.
        let text = TestSection::text(&[0x17, 0x03, 0, 0, 0x03, 0x33, 0x03, 0x00]).with_rels(vec![
            Rela {
                offset: 0,
                r#type: RelType::GotHi20 as u32,
                sym: 2,
                addend: 0,
            },
            Rela {
                offset: 4,
                r#type: RelType::PcrelLo12I as u32,
                sym: 1,
                addend: 0,
            },
        ]);
        let main_obj = build_object(
            &[text],
            &[TestSym::local("L0", 1, 0)],
            &[TestSym::undef("puts"), TestSym::global("main", 1, 0)],
        );
        let puts_obj = build_object(
            &[TestSection::text(&[0x67, 0x80, 0, 0])],
            &[],
            &[TestSym::global("puts", 1, 0)],
        );
        let archive = build_archive(&[("puts.o", &puts_obj)]);

        let (ctx, buf) = link_files(vec![
            File::from_bytes("main.o", main_obj),
            File::from_bytes("libputs.a", archive),
        ]);

        // exactly one GOT slot, holding puts' address
        assert_eq!(ctx.got.got_syms.len(), 1);
        assert_eq!(ctx.got.chunk.shdr.size, 8);
        let puts_addr = symbol::symbol_addr(&ctx, sid(&ctx, "puts"));
        assert_ne!(puts_addr, 0);
        let got = &ctx.got.chunk.shdr;
        assert_eq!(util::read_u64(&buf, got.offset as usize), puts_addr);

        // the auipc/ld pair computes &GOT[puts] relative to pc
        let text_addr = find_osec(&ctx, ".text").chunk.shdr.addr;
        let at = find_osec(&ctx, ".text").chunk.shdr.offset as usize;
        let word0 = util::read_u32(&buf, at);
        let word1 = util::read_u32(&buf, at + 4);
        assert_eq!((word0 >> 7) & 0x1f, 6, "auipc destination clobbered");
        let hi = (word0 & 0xffff_f000) as i32 as i64;
        let lo = ((word1 as i32) >> 20) as i64;
        assert_eq!((text_addr as i64 + hi + lo) as u64, got.addr);

        // entry lands on main
        let ehdr = Ehdr::parse(&buf);
        assert_eq!(ehdr.entry, symbol::symbol_addr(&ctx, sid(&ctx, "main")));
    }
}
