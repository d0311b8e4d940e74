//! One contributing section of one input file, and the relocation machinery
//! that runs over it.

use std::ops::Range;

use num_traits::FromPrimitive as _;

use crate::arch::riscv::{
    self, write_btype, write_cbtype, write_cjtype, write_itype, write_jtype, write_stype,
    write_utype, RelType,
};
use crate::context::Context;
use crate::elf::{Chdr, Rela, SectionFlags, Shdr, SHT_NOBITS};
use crate::error::{Error, Result};
use crate::input::InputFile;
use crate::output::get_output_section_instance;
use crate::symbol::{self, SymbolTarget, NEEDS_GOT, NEEDS_GOTTP};
use crate::util;

pub const SECTION_OFFSET_UNSET: u32 = u32::MAX;

#[derive(Debug)]
/// A contiguous piece of input destined for some output section.
pub struct InputSection {
    pub shndx: usize,
    pub name: String,
    /// Index of the output section this piece lands in.
    pub osec: usize,
    /// Byte range of the contents within the owning file's buffer.
    pub contents: Range<usize>,
    /// Offset within the output section, assigned at layout.
    pub offset: u32,
    /// Section index of the `SHT_RELA` section targeting this one.
    pub relsec_idx: Option<usize>,
    pub sh_size: u32,
    pub is_alive: bool,
    pub p2align: u8,
    pub rels: Vec<Rela>,
    /// Cumulative bytes removed before each relocation (plus a sentinel),
    /// populated by relaxation.
    pub deltas: Vec<i32>,
}

fn to_p2align(alignment: u64) -> u8 {
    if alignment == 0 {
        return 0;
    }
    alignment.trailing_zeros() as u8
}

/// Build the input-section view of section `shndx` of `input`.
pub fn new_input_section(
    ctx: &mut Context,
    input: &InputFile,
    name: String,
    shndx: usize,
) -> Result<InputSection> {
    let shdr = input.elf_sections[shndx];

    // NOBITS contents have no file extent; everything else must be in
    // bounds.
    let contents = if shdr.r#type == SHT_NOBITS {
        0..0
    } else {
        input.shdr_range(&shdr)?
    };

    // A compression header overrides the size and alignment; the payload is
    // carried as-is.
    let (sh_size, p2align) = if shdr.flags.contains(SectionFlags::COMPRESSED) {
        let chdr = Chdr::parse(&input.file.contents()[contents.clone()]);
        (chdr.size as u32, to_p2align(chdr.addr_align))
    } else {
        (shdr.size as u32, to_p2align(shdr.addr_align))
    };

    let osec = get_output_section_instance(ctx, &name, shdr.r#type, shdr.flags);

    Ok(InputSection {
        shndx,
        name,
        osec,
        contents,
        offset: SECTION_OFFSET_UNSET,
        relsec_idx: None,
        sh_size,
        is_alive: true,
        p2align,
        rels: Vec::new(),
        deltas: Vec::new(),
    })
}

impl InputSection {
    pub fn shdr<'a>(&self, input: &'a InputFile) -> &'a Shdr {
        &input.elf_sections[self.shndx]
    }

    /// The section's address in the laid-out image.
    pub fn addr(&self, ctx: &Context) -> u64 {
        ctx.output_sections[self.osec].chunk.shdr.addr + self.offset as u64
    }

    fn source_bytes<'a>(&self, input: &'a InputFile) -> &'a [u8] {
        &input.file.contents()[self.contents.clone()]
    }

    fn delta(&self, idx: usize) -> u64 {
        if self.deltas.is_empty() {
            0
        } else {
            self.deltas[idx] as u64
        }
    }

    /// Copy this section into `buf`, dropping the byte runs relaxation
    /// removed.
    fn copy_contents(&self, input: &InputFile, buf: &mut [u8]) {
        let contents = self.source_bytes(input);
        if self.deltas.is_empty() {
            buf[..contents.len()].copy_from_slice(contents);
            return;
        }

        let mut pos = 0usize;
        let mut out = 0usize;
        for (i, rel) in self.rels.iter().enumerate() {
            let delta = self.deltas[i + 1] - self.deltas[i];
            if delta == 0 {
                continue;
            }
            debug_assert!(delta > 0);

            let len = rel.offset as usize - pos;
            buf[out..out + len].copy_from_slice(&contents[pos..rel.offset as usize]);
            out += len;
            pos = rel.offset as usize + delta as usize;
        }
        buf[out..out + contents.len() - pos].copy_from_slice(&contents[pos..]);
    }

    /// Write the section into its slot of the output buffer and relocate it.
    pub fn write_to(&self, ctx: &Context, obj_idx: usize, buf: &mut [u8]) -> Result<()> {
        let input = &ctx.objs[obj_idx].input;
        if self.shdr(input).r#type == SHT_NOBITS || self.sh_size == 0 {
            return Ok(());
        }

        self.copy_contents(input, buf);

        if self.shdr(input).flags.contains(SectionFlags::ALLOC) {
            self.apply_reloc_alloc(ctx, obj_idx, buf)?;
        }
        Ok(())
    }

    /// Apply the section's relocations. Three sweeps: direct relocations,
    /// then `PCREL_LO12` pairing against the words sweep one stashed, then
    /// restoring the HI20 instruction words around their U-immediates.
    fn apply_reloc_alloc(&self, ctx: &Context, obj_idx: usize, base: &mut [u8]) -> Result<()> {
        let obj = &ctx.objs[obj_idx];
        let got_addr = ctx.got.chunk.shdr.addr;

        for (i, rel) in self.rels.iter().enumerate() {
            let r#type = RelType::from_u32(rel.r#type)
                .ok_or(Error::UnknownRelocation { value: rel.r#type })?;
            if matches!(r#type, RelType::None | RelType::Relax) {
                continue;
            }

            let sid = obj.input.symbols[rel.sym as usize];
            let sym = &ctx.symbols[sid];
            if sym.file.is_none() {
                return Err(Error::UndefinedSymbol {
                    name: sym.name.clone(),
                });
            }

            let offset = (rel.offset - self.delta(i)) as usize;
            let s = symbol::symbol_addr(ctx, sid);
            let a = rel.addend as u64;
            let p = self.addr(ctx) + offset as u64;
            let g = symbol::got_idx(ctx, sid).unwrap_or_default() as u64 * 8;
            let loc = &mut base[offset..];

            match r#type {
                RelType::Abs32 => util::write_u32(loc, 0, s.wrapping_add(a) as u32),
                RelType::Abs64 => util::write_u64(loc, 0, s.wrapping_add(a)),
                RelType::Branch => {
                    write_btype(loc, s.wrapping_add(a).wrapping_sub(p) as u32);
                }
                RelType::Jal => {
                    write_jtype(loc, s.wrapping_add(a).wrapping_sub(p) as u32);
                }
                RelType::Call | RelType::CallPlt => {
                    // A call to an undefined weak lands on address zero.
                    let undef_weak = symbol::elf_sym(ctx, sid)
                        .map(|esym| esym.is_undef_weak())
                        .unwrap_or(false);
                    let val = if undef_weak {
                        0
                    } else {
                        s.wrapping_add(a).wrapping_sub(p) as u32
                    };
                    write_utype(loc, val);
                    write_itype(&mut loc[4..], val);
                }
                RelType::GotHi20 => {
                    let val = g.wrapping_add(got_addr).wrapping_add(a).wrapping_sub(p);
                    util::write_u32(loc, 0, val as u32);
                }
                RelType::TlsGotHi20 => {
                    let val = symbol::got_tp_addr(ctx, sid)
                        .wrapping_add(a)
                        .wrapping_sub(p);
                    util::write_u32(loc, 0, val as u32);
                }
                RelType::PcrelHi20 => {
                    util::write_u32(loc, 0, s.wrapping_add(a).wrapping_sub(p) as u32);
                }
                RelType::Hi20 => write_utype(loc, s.wrapping_add(a) as u32),
                RelType::Lo12I | RelType::Lo12S => {
                    let val = s.wrapping_add(a);
                    if r#type == RelType::Lo12I {
                        write_itype(loc, val as u32);
                    } else {
                        write_stype(loc, val as u32);
                    }
                    // The full value fits the immediate: no base register
                    // needed.
                    if util::sign_extend(val, 11) == val {
                        riscv::set_rs1(loc, 0);
                    }
                }
                RelType::TprelHi20 => {
                    write_utype(loc, s.wrapping_add(a).wrapping_sub(ctx.tp_addr) as u32);
                }
                RelType::TprelAdd => {}
                RelType::TprelLo12I | RelType::TprelLo12S => {
                    let val = s.wrapping_add(a).wrapping_sub(ctx.tp_addr);
                    if r#type == RelType::TprelLo12I {
                        write_itype(loc, val as u32);
                    } else {
                        write_stype(loc, val as u32);
                    }
                    // In range of tp directly: address off x4.
                    if util::sign_extend(val, 11) == val {
                        riscv::set_rs1(loc, 4);
                    }
                }
                RelType::Add8 => {
                    let val = util::read_u8(loc, 0).wrapping_add(s.wrapping_add(a) as u8);
                    util::write_u8(loc, 0, val);
                }
                RelType::Add16 => {
                    let val = util::read_u16(loc, 0).wrapping_add(s.wrapping_add(a) as u16);
                    util::write_u16(loc, 0, val);
                }
                RelType::Add32 => {
                    let val = util::read_u32(loc, 0).wrapping_add(s.wrapping_add(a) as u32);
                    util::write_u32(loc, 0, val);
                }
                RelType::Add64 => {
                    let val = util::read_u64(loc, 0).wrapping_add(s.wrapping_add(a));
                    util::write_u64(loc, 0, val);
                }
                RelType::Sub8 => {
                    let val = util::read_u8(loc, 0).wrapping_sub(s.wrapping_add(a) as u8);
                    util::write_u8(loc, 0, val);
                }
                RelType::Sub16 => {
                    let val = util::read_u16(loc, 0).wrapping_sub(s.wrapping_add(a) as u16);
                    util::write_u16(loc, 0, val);
                }
                RelType::Sub32 => {
                    let val = util::read_u32(loc, 0).wrapping_sub(s.wrapping_add(a) as u32);
                    util::write_u32(loc, 0, val);
                }
                RelType::Sub64 => {
                    let val = util::read_u64(loc, 0).wrapping_sub(s.wrapping_add(a));
                    util::write_u64(loc, 0, val);
                }
                RelType::Align => {
                    // Fill the surviving pad with nops: 4-byte nops while
                    // they fit, one c.nop for a 2-byte remainder.
                    let padding =
                        (util::align_to(p, util::bit_ceil(a.wrapping_add(1))) - p) as usize;
                    let mut idx = 0;
                    while idx + 4 <= padding {
                        util::write_u32(loc, idx, 0x0000_0013);
                        idx += 4;
                    }
                    if idx < padding {
                        util::write_u16(loc, idx, 0x0001);
                    }
                }
                RelType::RvcBranch => {
                    write_cbtype(loc, s.wrapping_add(a).wrapping_sub(p) as u16);
                }
                RelType::RvcJump => {
                    write_cjtype(loc, s.wrapping_add(a).wrapping_sub(p) as u16);
                }
                RelType::PcrelLo12I | RelType::PcrelLo12S => {}
                RelType::None | RelType::Relax => {}
                RelType::TlsGdHi20
                | RelType::Pcrel32
                | RelType::Sub6
                | RelType::Set6
                | RelType::Set8
                | RelType::Set16
                | RelType::Set32 => {
                    return Err(Error::UnsupportedRelocation { value: rel.r#type });
                }
            }
        }

        // The symbol of a PCREL_LO12 names the local label that marked the
        // paired HI20 in this same section; sweep one left the full value
        // at that spot.
        for (i, rel) in self.rels.iter().enumerate() {
            let r#type = RelType::from_u32(rel.r#type);
            if !matches!(r#type, Some(RelType::PcrelLo12I) | Some(RelType::PcrelLo12S)) {
                continue;
            }

            let sid = obj.input.symbols[rel.sym as usize];
            let sym = &ctx.symbols[sid];
            let here = SymbolTarget::Section { shndx: self.shndx };
            debug_assert!(sym.file == Some(obj_idx) && sym.target == here);

            let offset = (rel.offset - self.delta(i)) as usize;
            let val = util::read_u32(base, sym.value as usize);
            if r#type == Some(RelType::PcrelLo12I) {
                write_itype(&mut base[offset..], val);
            } else {
                write_stype(&mut base[offset..], val);
            }
        }

        // Re-install each HI20 instruction word (sweep two may have smashed
        // it) and encode the stashed value as its U-immediate.
        let contents = self.source_bytes(&obj.input);
        for (i, rel) in self.rels.iter().enumerate() {
            if !matches!(
                RelType::from_u32(rel.r#type),
                Some(RelType::GotHi20)
                    | Some(RelType::PcrelHi20)
                    | Some(RelType::TlsGotHi20)
                    | Some(RelType::TlsGdHi20)
            ) {
                continue;
            }

            let offset = (rel.offset - self.delta(i)) as usize;
            let val = util::read_u32(base, offset);
            util::write_u32(base, offset, util::read_u32(contents, rel.offset as usize));
            write_utype(&mut base[offset..], val);
        }

        Ok(())
    }
}

/// Classify this section's relocations and record GOT needs on the
/// referenced symbols.
pub fn scan_relocations(ctx: &mut Context, obj_idx: usize, shndx: usize) -> Result<()> {
    let n_rels = match &ctx.objs[obj_idx].sections[shndx] {
        Some(isec) => isec.rels.len(),
        None => 0,
    };

    for i in 0..n_rels {
        let rel = match &ctx.objs[obj_idx].sections[shndx] {
            Some(isec) => isec.rels[i],
            None => continue,
        };
        let r#type =
            RelType::from_u32(rel.r#type).ok_or(Error::UnknownRelocation { value: rel.r#type })?;
        if r#type == RelType::None {
            continue;
        }

        let sid = ctx.objs[obj_idx].input.symbols[rel.sym as usize];
        if ctx.symbols[sid].file.is_none() {
            return Err(Error::UndefinedSymbol {
                name: ctx.symbols[sid].name.clone(),
            });
        }

        match r#type {
            RelType::Pcrel32 | RelType::TlsGdHi20 => {
                return Err(Error::UnsupportedRelocation { value: rel.r#type });
            }
            RelType::GotHi20 => ctx.symbols[sid].flags |= NEEDS_GOT,
            RelType::TlsGotHi20 => ctx.symbols[sid].flags |= NEEDS_GOTTP,
            _ => {}
        }
    }

    Ok(())
}
