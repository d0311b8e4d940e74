//! The relocatable-object model: parsing an `ET_REL` input into sections and
//! symbols, and the per-object legs of symbol resolution, liveness marking,
//! mergeable-piece registration, and the unresolved-weak claim.

use tracing::debug;

use crate::context::Context;
use crate::elf::{
    self, Shdr, Sym, SectionFlags, SHN_XINDEX, SHT_GROUP, SHT_LLVM_ADDRSIG, SHT_NULL, SHT_REL,
    SHT_RELA, SHT_STRTAB, SHT_SYMTAB, SHT_SYMTAB_SHNDX, STT_SECTION, STV_DEFAULT, STV_HIDDEN,
    STV_INTERNAL, STV_PROTECTED, VER_NDX_LOCAL,
};
use crate::error::{Error, Result};
use crate::file::{check_compatibility, File};
use crate::input::section::{self, new_input_section, InputSection};
use crate::input::InputFile;
use crate::merge::{get_merged_section_instance, split_contents, MergeableSection};
use crate::symbol::{self, get_rank, get_symbol_by_name, Symbol, SymbolTarget};

#[derive(Debug)]
pub struct ObjectFile {
    pub input: InputFile,
    /// One optional `InputSection` per ELF section index.
    pub sections: Vec<Option<InputSection>>,
    /// The split form of each mergeable section, same indexing.
    pub mergeable_sections: Vec<Option<MergeableSection>>,
    /// Extended section indices from `SHT_SYMTAB_SHNDX`, if present.
    pub symtab_shndx: Vec<u32>,
}

impl ObjectFile {
    /// The real section index behind a symbol, following the
    /// extended-numbering escape.
    pub fn get_shndx(&self, esym: &Sym, idx: usize) -> usize {
        debug_assert!(idx < self.input.elf_syms.len());
        if esym.shndx == SHN_XINDEX {
            self.symtab_shndx[idx] as usize
        } else {
            esym.shndx as usize
        }
    }
}

/// Parse `file` into a fresh object and register it with the context.
pub fn create_object_file(ctx: &mut Context, file: File, in_lib: bool) -> Result<usize> {
    check_compatibility(&ctx.opts, &file)?;
    debug!(name = %file.name, in_lib, "reading object");

    let mut obj = ObjectFile {
        input: InputFile::new(file)?,
        sections: Vec::new(),
        mergeable_sections: Vec::new(),
        symtab_shndx: Vec::new(),
    };
    obj.input.is_alive = !in_lib;
    obj.input.priority = ctx.next_priority();

    let obj_idx = ctx.objs.len();
    parse(&mut obj, ctx, obj_idx)?;
    ctx.objs.push(obj);
    Ok(obj_idx)
}

fn parse(obj: &mut ObjectFile, ctx: &mut Context, obj_idx: usize) -> Result<()> {
    if let Some(symtab_idx) = obj.input.find_section(SHT_SYMTAB) {
        let symtab = obj.input.elf_sections[symtab_idx];
        obj.input.fill_elf_syms(symtab)?;
    }

    initialize_sections(obj, ctx)?;
    initialize_symbols(obj, ctx, obj_idx)?;
    sort_relocations(obj)?;
    initialize_mergeable_sections(obj, ctx)?;
    skip_eh_frame_sections(obj);
    Ok(())
}

fn initialize_sections(obj: &mut ObjectFile, ctx: &mut Context) -> Result<()> {
    let num = obj.input.elf_sections.len();
    obj.sections = (0..num).map(|_| None).collect();
    obj.mergeable_sections = (0..num).map(|_| None).collect();

    for i in 0..num {
        let shdr = obj.input.elf_sections[i];
        if shdr.flags.contains(SectionFlags::EXCLUDE)
            && !shdr.flags.contains(SectionFlags::ALLOC)
            && shdr.r#type != SHT_LLVM_ADDRSIG
        {
            continue;
        }

        match shdr.r#type {
            SHT_GROUP | SHT_SYMTAB | SHT_STRTAB | SHT_REL | SHT_RELA | SHT_NULL => {}
            SHT_SYMTAB_SHNDX => fill_symtab_shndx(obj, &shdr)?,
            _ => {
                let name = obj.input.section_name(&shdr)?;
                if name == ".note.GNU-stack" || name.starts_with(".gnu.warning.") {
                    continue;
                }
                obj.sections[i] = Some(new_input_section(ctx, &obj.input, name, i)?);
            }
        }
    }

    // Bind each SHT_RELA section to the section it relocates. The binding
    // is one-to-one.
    for i in 0..num {
        let shdr = obj.input.elf_sections[i];
        if shdr.r#type != SHT_RELA {
            continue;
        }

        if shdr.info as usize >= obj.sections.len() {
            return Err(Error::InvalidRelocatedSection { index: shdr.info });
        }
        if let Some(target) = &mut obj.sections[shdr.info as usize] {
            if target.relsec_idx.is_some() {
                return Err(Error::Internal {
                    what: "two relocation sections target one section",
                });
            }
            target.relsec_idx = Some(i);
        }
    }

    Ok(())
}

fn fill_symtab_shndx(obj: &mut ObjectFile, shdr: &Shdr) -> Result<()> {
    let bytes = obj.input.shdr_bytes(shdr)?;
    obj.symtab_shndx = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(())
}

fn initialize_symbols(obj: &mut ObjectFile, ctx: &mut Context, obj_idx: usize) -> Result<()> {
    if obj.input.elf_syms.is_empty() {
        return Ok(());
    }

    // Locals are owned by this object: element zero is the sentinel, the
    // rest bind to their sections unless absolute.
    let mut sentinel = Symbol::new("");
    sentinel.file = Some(obj_idx);
    sentinel.sym_idx = Some(0);
    obj.input.symbols.push(ctx.symbols.len());
    ctx.symbols.push(sentinel);

    for i in 1..obj.input.first_global {
        let esym = obj.input.elf_syms[i];
        if esym.is_common() {
            return Err(Error::CommonLocal {
                name: obj.input.sym_name(&esym).unwrap_or_default(),
            });
        }

        let mut name = obj.input.sym_name(&esym)?;
        let shndx = obj.get_shndx(&esym, i);
        if name.is_empty() && esym.r#type() == STT_SECTION {
            if let Some(isec) = &obj.sections[shndx] {
                name = isec.name.clone();
            }
        }

        let mut sym = Symbol::new(name);
        sym.file = Some(obj_idx);
        sym.value = esym.val;
        sym.sym_idx = Some(i);
        if !esym.is_abs() && obj.sections[shndx].is_some() {
            sym.target = SymbolTarget::Section { shndx };
        }

        obj.input.symbols.push(ctx.symbols.len());
        ctx.symbols.push(sym);
    }

    // Globals are interned process-wide by name.
    for i in obj.input.first_global..obj.input.elf_syms.len() {
        let esym = obj.input.elf_syms[i];
        let name = obj.input.sym_name(&esym)?;
        obj.input.symbols.push(get_symbol_by_name(ctx, &name));
    }

    Ok(())
}

/// Parse and offset-sort the relocations of every live alloc section.
fn sort_relocations(obj: &mut ObjectFile) -> Result<()> {
    for i in 1..obj.sections.len() {
        let Some(isec) = &obj.sections[i] else {
            continue;
        };
        if !isec.is_alive || !isec.shdr(&obj.input).flags.contains(SectionFlags::ALLOC) {
            continue;
        }
        let Some(relsec_idx) = isec.relsec_idx else {
            continue;
        };

        let shdr = obj.input.elf_sections[relsec_idx];
        let bytes = obj.input.shdr_bytes(&shdr)?;
        let mut rels: Vec<elf::Rela> = bytes
            .chunks_exact(elf::Rela::SIZE)
            .map(elf::Rela::parse)
            .collect();
        rels.sort_by_key(|rel| rel.offset);

        if let Some(isec) = &mut obj.sections[i] {
            isec.rels = rels;
        }
    }
    Ok(())
}

fn initialize_mergeable_sections(obj: &mut ObjectFile, ctx: &mut Context) -> Result<()> {
    for i in 0..obj.sections.len() {
        let Some(isec) = &obj.sections[i] else {
            continue;
        };
        let shdr = *isec.shdr(&obj.input);
        if !isec.is_alive
            || !shdr.flags.contains(SectionFlags::MERGE)
            || isec.sh_size == 0
            || shdr.ent_size == 0
            || isec.relsec_idx.is_some()
        {
            continue;
        }

        let parent = get_merged_section_instance(ctx, &isec.name, shdr.r#type, shdr.flags);
        let data = &obj.input.file.contents()[isec.contents.clone()];
        let (strs, frag_offsets) = split_contents(&isec.name, data, shdr.flags, shdr.ent_size)?;
        let p2align = isec.p2align;

        obj.mergeable_sections[i] = Some(MergeableSection {
            parent,
            p2align,
            strs,
            frag_offsets,
            fragments: Vec::new(),
        });
        if let Some(isec) = &mut obj.sections[i] {
            isec.is_alive = false;
        }
    }
    Ok(())
}

/// `.eh_frame` is not consumed; unwinding is out of the picture.
fn skip_eh_frame_sections(obj: &mut ObjectFile) {
    for isec in obj.sections.iter_mut().flatten() {
        if isec.is_alive && isec.name == ".eh_frame" {
            isec.is_alive = false;
        }
    }
}

/// Propose this object's definitions; each symbol keeps the lowest-ranked
/// proposer.
pub fn resolve_symbols(ctx: &mut Context, obj_idx: usize) {
    let first_global = ctx.objs[obj_idx].input.first_global;
    let num_syms = ctx.objs[obj_idx].input.elf_syms.len();

    for i in first_global..num_syms {
        let esym = ctx.objs[obj_idx].input.elf_syms[i];
        let sid = ctx.objs[obj_idx].input.symbols[i];
        if esym.is_undef() {
            continue;
        }

        let mut target = SymbolTarget::None;
        if !esym.is_abs() && !esym.is_common() {
            let shndx = ctx.objs[obj_idx].get_shndx(&esym, i);
            if ctx.objs[obj_idx].sections[shndx].is_none() {
                continue;
            }
            target = SymbolTarget::Section { shndx };
        }

        let input = &ctx.objs[obj_idx].input;
        let rank = get_rank(input.priority, &esym, !input.is_alive);
        if rank < symbol::symbol_rank(ctx, sid) {
            let sym = &mut ctx.symbols[sid];
            sym.file = Some(obj_idx);
            sym.target = target;
            sym.value = esym.val;
            sym.sym_idx = Some(i);
            sym.ver_idx = ctx.default_version;
            sym.is_weak = esym.is_weak();
            sym.is_exported = false;
        }
    }
}

fn visibility_priority(visibility: u8) -> Result<u32> {
    match visibility {
        STV_HIDDEN => Ok(1),
        STV_PROTECTED => Ok(2),
        STV_DEFAULT => Ok(3),
        value => Err(Error::UnknownVisibility { value }),
    }
}

fn merge_visibility(ctx: &mut Context, sid: usize, mut visibility: u8) -> Result<()> {
    if visibility == STV_INTERNAL {
        visibility = STV_HIDDEN;
    }
    if visibility_priority(ctx.symbols[sid].visibility)? > visibility_priority(visibility)? {
        ctx.symbols[sid].visibility = visibility;
    }
    Ok(())
}

/// Walk this live object's references: merge visibilities, and activate the
/// owner of every strong reference (weak ones never pull archive members).
pub fn mark_live_objects(
    ctx: &mut Context,
    obj_idx: usize,
    roots: &mut Vec<usize>,
) -> Result<()> {
    debug_assert!(ctx.objs[obj_idx].input.is_alive);

    let first_global = ctx.objs[obj_idx].input.first_global;
    let num_syms = ctx.objs[obj_idx].input.elf_syms.len();

    for i in first_global..num_syms {
        let esym = ctx.objs[obj_idx].input.elf_syms[i];
        let sid = ctx.objs[obj_idx].input.symbols[i];

        merge_visibility(ctx, sid, esym.visibility())?;

        if esym.is_weak() {
            continue;
        }
        let Some(file) = ctx.symbols[sid].file else {
            continue;
        };

        let resolved_common = symbol::elf_sym(ctx, sid)
            .map(|resolved| resolved.is_common())
            .unwrap_or(false);
        let keep = esym.is_undef() || (esym.is_common() && !resolved_common);
        if keep && !ctx.objs[file].input.is_alive {
            ctx.objs[file].input.is_alive = true;
            roots.push(file);
        }
    }
    Ok(())
}

/// Forget every resolution a dead file proposed.
pub fn clear_symbols(ctx: &mut Context, obj_idx: usize) {
    let globals: Vec<usize> = ctx.objs[obj_idx].input.globals().to_vec();
    for sid in globals {
        if ctx.symbols[sid].file == Some(obj_idx) {
            ctx.symbols[sid].clear();
        }
    }
}

/// Insert this object's merge records into their pools, rebind symbols that
/// point into mergeable sections, and synthesize fragment symbols for
/// `STT_SECTION` relocations against them.
pub fn register_section_pieces(ctx: &mut Context, obj_idx: usize) -> Result<()> {
    // Deduplicate every record into its pool.
    for i in 0..ctx.objs[obj_idx].mergeable_sections.len() {
        let Some(m) = &ctx.objs[obj_idx].mergeable_sections[i] else {
            continue;
        };
        let parent = m.parent;
        let p2align = m.p2align as u32;
        let strs = m.strs.clone();

        let mut fragments = Vec::with_capacity(strs.len());
        for key in &strs {
            fragments.push(ctx.merged_sections[parent].insert(key, p2align));
        }
        if let Some(m) = &mut ctx.objs[obj_idx].mergeable_sections[i] {
            m.fragments = fragments;
        }
    }

    // Rebind defined symbols whose section was absorbed into a pool.
    for i in 1..ctx.objs[obj_idx].input.elf_syms.len() {
        let esym = ctx.objs[obj_idx].input.elf_syms[i];
        if esym.is_abs() || esym.is_common() || esym.is_undef() {
            continue;
        }

        let shndx = ctx.objs[obj_idx].get_shndx(&esym, i);
        let Some(m) = &ctx.objs[obj_idx].mergeable_sections[shndx] else {
            continue;
        };
        let parent = m.parent;
        let (frag, frag_offset) = m.get_fragment(esym.val as u32).ok_or_else(|| {
            Error::BadFragmentSymbol {
                name: ctx.symbols[ctx.objs[obj_idx].input.symbols[i]].name.clone(),
            }
        })?;

        let sid = ctx.objs[obj_idx].input.symbols[i];
        let sym = &mut ctx.symbols[sid];
        sym.target = SymbolTarget::Fragment {
            merged: parent,
            frag,
        };
        sym.value = frag_offset as u64;
    }

    // Relocations referencing a mergeable section through its STT_SECTION
    // symbol are retargeted to a fresh fragment symbol placed so that
    // frag.addr + value + addend lands on the original target.
    let num_elf_syms = ctx.objs[obj_idx].input.elf_syms.len();
    let mut n_frag_syms = 0;

    for si in 0..ctx.objs[obj_idx].sections.len() {
        let alive_alloc = match &ctx.objs[obj_idx].sections[si] {
            Some(isec) => {
                isec.is_alive
                    && isec
                        .shdr(&ctx.objs[obj_idx].input)
                        .flags
                        .contains(SectionFlags::ALLOC)
            }
            None => false,
        };
        if !alive_alloc {
            continue;
        }

        let n_rels = ctx.objs[obj_idx].sections[si]
            .as_ref()
            .map(|isec| isec.rels.len())
            .unwrap_or(0);

        for ri in 0..n_rels {
            let rel = match &ctx.objs[obj_idx].sections[si] {
                Some(isec) => isec.rels[ri],
                None => continue,
            };
            let esym = ctx.objs[obj_idx].input.elf_syms[rel.sym as usize];
            if esym.r#type() != STT_SECTION {
                continue;
            }

            let shndx = ctx.objs[obj_idx].get_shndx(&esym, rel.sym as usize);
            let Some(m) = &ctx.objs[obj_idx].mergeable_sections[shndx] else {
                continue;
            };
            let parent = m.parent;
            let (frag, frag_offset) = m
                .get_fragment((esym.val as u32).wrapping_add(rel.addend as u32))
                .ok_or(Error::BadFragmentRelocation)?;

            let mut sym = Symbol::new("<fragment>");
            sym.file = Some(obj_idx);
            sym.sym_idx = Some(rel.sym as usize);
            sym.visibility = STV_HIDDEN;
            sym.target = SymbolTarget::Fragment {
                merged: parent,
                frag,
            };
            sym.value = (frag_offset as u64).wrapping_sub(rel.addend as u64);

            let sid = ctx.symbols.len();
            ctx.symbols.push(sym);
            ctx.objs[obj_idx].input.symbols.push(sid);
            if let Some(isec) = &mut ctx.objs[obj_idx].sections[si] {
                isec.rels[ri].sym = (num_elf_syms + n_frag_syms) as u32;
            }
            n_frag_syms += 1;
        }
    }

    Ok(())
}

/// Mark the definitions other files may import. With the fixed local
/// default version nothing qualifies, which matches a fully static link.
pub fn compute_import_export(ctx: &mut Context, obj_idx: usize) {
    let globals: Vec<usize> = ctx.objs[obj_idx].input.globals().to_vec();
    for sid in globals {
        let sym = &ctx.symbols[sid];
        if sym.file.is_none() || sym.visibility == STV_HIDDEN || sym.ver_idx == VER_NDX_LOCAL {
            continue;
        }
        if sym.file == Some(obj_idx) {
            ctx.symbols[sid].is_exported = true;
        }
    }
}

/// Bind every still-undefined weak reference this object observes to the
/// object itself, with value zero.
pub fn claim_unresolved_symbols(ctx: &mut Context, obj_idx: usize) {
    if !ctx.objs[obj_idx].input.is_alive {
        return;
    }

    let first_global = ctx.objs[obj_idx].input.first_global;
    let num_syms = ctx.objs[obj_idx].input.elf_syms.len();

    for i in first_global..num_syms {
        let esym = ctx.objs[obj_idx].input.elf_syms[i];
        if !esym.is_undef() {
            continue;
        }

        let sid = ctx.objs[obj_idx].input.symbols[i];
        if let Some(file) = ctx.symbols[sid].file {
            let resolved_undef = symbol::elf_sym(ctx, sid)
                .map(|resolved| resolved.is_undef())
                .unwrap_or(true);
            if !resolved_undef
                || ctx.objs[file].input.priority <= ctx.objs[obj_idx].input.priority
            {
                continue;
            }
        }

        if esym.is_undef_weak() {
            let default_version = ctx.default_version;
            let sym = &mut ctx.symbols[sid];
            sym.file = Some(obj_idx);
            sym.target = SymbolTarget::None;
            sym.value = 0;
            sym.sym_idx = Some(i);
            sym.is_weak = false;
            sym.is_exported = false;
            sym.ver_idx = default_version;
        }
    }
}

/// Scan every live alloc section's relocations for GOT requirements.
pub fn scan_relocations(ctx: &mut Context, obj_idx: usize) -> Result<()> {
    for si in 0..ctx.objs[obj_idx].sections.len() {
        let alive_alloc = match &ctx.objs[obj_idx].sections[si] {
            Some(isec) => {
                isec.is_alive
                    && isec
                        .shdr(&ctx.objs[obj_idx].input)
                        .flags
                        .contains(SectionFlags::ALLOC)
            }
            None => false,
        };
        if alive_alloc {
            section::scan_relocations(ctx, obj_idx, si)?;
        }
    }
    Ok(())
}
