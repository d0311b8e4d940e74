//! Test-only helpers that synthesize minimal relocatable objects and
//! archives in memory, so the pass pipeline can be driven end to end
//! without fixture files.

use crate::elf::{
    self, Ehdr, Rela, SectionFlags, Shdr, Sym, ELFCLASS64, ELFDATA2LSB, EM_RISCV, ET_REL,
    EV_CURRENT, SHT_NULL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB,
};
use crate::util;

pub(crate) struct TestSection {
    pub name: String,
    pub r#type: u32,
    pub flags: SectionFlags,
    pub contents: Vec<u8>,
    pub ent_size: u64,
    pub addr_align: u64,
    pub rels: Vec<Rela>,
}

impl TestSection {
    pub fn progbits(name: &str, flags: SectionFlags, contents: &[u8], addr_align: u64) -> Self {
        Self {
            name: name.to_string(),
            r#type: elf::SHT_PROGBITS,
            flags,
            contents: contents.to_vec(),
            ent_size: 0,
            addr_align,
            rels: Vec::new(),
        }
    }

    pub fn text(contents: &[u8]) -> Self {
        Self::progbits(
            ".text",
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
            contents,
            4,
        )
    }

    pub fn merge_strings(name: &str, contents: &[u8]) -> Self {
        let mut section = Self::progbits(
            name,
            SectionFlags::ALLOC | SectionFlags::MERGE | SectionFlags::STRINGS,
            contents,
            1,
        );
        section.ent_size = 1;
        section
    }

    pub fn with_rels(mut self, rels: Vec<Rela>) -> Self {
        self.rels = rels;
        self
    }
}

pub(crate) struct TestSym {
    pub name: String,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
}

impl TestSym {
    pub fn global(name: &str, shndx: u16, value: u64) -> Self {
        Self {
            name: name.to_string(),
            info: elf::sym_info(elf::STB_GLOBAL, elf::STT_NOTYPE),
            other: 0,
            shndx,
            value,
        }
    }

    pub fn weak(name: &str, shndx: u16, value: u64) -> Self {
        Self {
            name: name.to_string(),
            info: elf::sym_info(elf::STB_WEAK, elf::STT_NOTYPE),
            other: 0,
            shndx,
            value,
        }
    }

    pub fn undef(name: &str) -> Self {
        Self::global(name, elf::SHN_UNDEF, 0)
    }

    pub fn undef_weak(name: &str) -> Self {
        Self::weak(name, elf::SHN_UNDEF, 0)
    }

    pub fn local(name: &str, shndx: u16, value: u64) -> Self {
        Self {
            name: name.to_string(),
            info: elf::sym_info(elf::STB_LOCAL, elf::STT_NOTYPE),
            other: 0,
            shndx,
            value,
        }
    }
}

fn intern(strtab: &mut Vec<u8>, name: &str) -> u32 {
    if name.is_empty() {
        return 0;
    }
    let offset = strtab.len() as u32;
    strtab.extend_from_slice(name.as_bytes());
    strtab.push(0);
    offset
}

/// Assemble an ET_REL image: the user sections (at indices 1..=N, so a
/// `TestSym::shndx` of `i + 1` names user section `i`), their `.rela`
/// sections, and the symbol/string tables.
pub(crate) fn build_object(
    sections: &[TestSection],
    locals: &[TestSym],
    globals: &[TestSym],
) -> Vec<u8> {
    let mut strtab = vec![0u8];
    let mut syms = vec![Sym::default()];
    for sym in locals.iter().chain(globals) {
        let name = intern(&mut strtab, &sym.name);
        syms.push(Sym {
            name,
            info: sym.info,
            other: sym.other,
            shndx: sym.shndx,
            val: sym.value,
            size: 0,
        });
    }
    let first_global = 1 + locals.len();

    let mut shstrtab = vec![0u8];
    let mut shdrs = vec![Shdr {
        r#type: SHT_NULL,
        ..Default::default()
    }];
    let mut payloads: Vec<Vec<u8>> = vec![Vec::new()];

    for section in sections {
        shdrs.push(Shdr {
            name: intern(&mut shstrtab, &section.name),
            r#type: section.r#type,
            flags: section.flags,
            size: section.contents.len() as u64,
            addr_align: section.addr_align,
            ent_size: section.ent_size,
            ..Default::default()
        });
        payloads.push(section.contents.clone());
    }

    // One .rela per user section that carries relocations. Its link field
    // is patched once the symtab index is known.
    let mut rela_shndx = Vec::new();
    for (i, section) in sections.iter().enumerate() {
        if section.rels.is_empty() {
            continue;
        }
        let mut bytes = vec![0u8; section.rels.len() * Rela::SIZE];
        for (j, rel) in section.rels.iter().enumerate() {
            rel.write_to(&mut bytes[j * Rela::SIZE..]);
        }
        rela_shndx.push(shdrs.len());
        shdrs.push(Shdr {
            name: intern(&mut shstrtab, &format!(".rela{}", section.name)),
            r#type: SHT_RELA,
            info: (i + 1) as u32,
            size: bytes.len() as u64,
            addr_align: 8,
            ent_size: Rela::SIZE as u64,
            ..Default::default()
        });
        payloads.push(bytes);
    }

    let symtab_idx = shdrs.len();
    for &idx in &rela_shndx {
        shdrs[idx].link = symtab_idx as u32;
    }
    let mut symtab_bytes = vec![0u8; syms.len() * Sym::SIZE];
    for (i, sym) in syms.iter().enumerate() {
        sym.write_to(&mut symtab_bytes[i * Sym::SIZE..]);
    }
    shdrs.push(Shdr {
        name: intern(&mut shstrtab, ".symtab"),
        r#type: SHT_SYMTAB,
        link: (symtab_idx + 1) as u32,
        info: first_global as u32,
        size: symtab_bytes.len() as u64,
        addr_align: 8,
        ent_size: Sym::SIZE as u64,
        ..Default::default()
    });
    payloads.push(symtab_bytes);

    shdrs.push(Shdr {
        name: intern(&mut shstrtab, ".strtab"),
        r#type: SHT_STRTAB,
        size: strtab.len() as u64,
        addr_align: 1,
        ..Default::default()
    });
    payloads.push(strtab);

    let shstrndx = shdrs.len();
    let name = intern(&mut shstrtab, ".shstrtab");
    shdrs.push(Shdr {
        name,
        r#type: SHT_STRTAB,
        size: shstrtab.len() as u64,
        addr_align: 1,
        ..Default::default()
    });
    payloads.push(shstrtab);

    // Lay the payloads out after the ELF header, then the section table.
    let mut offset = Ehdr::SIZE as u64;
    for (shdr, payload) in shdrs.iter_mut().zip(&payloads).skip(1) {
        offset = util::align_to(offset, shdr.addr_align.max(1));
        shdr.offset = offset;
        offset += payload.len() as u64;
    }
    let sh_off = util::align_to(offset, 8);

    let mut ehdr = Ehdr {
        r#type: ET_REL,
        machine: EM_RISCV,
        version: EV_CURRENT as u32,
        sh_off,
        eh_size: Ehdr::SIZE as u16,
        sh_ent_size: Shdr::SIZE as u16,
        sh_num: shdrs.len() as u16,
        sh_strndx: shstrndx as u16,
        ..Default::default()
    };
    elf::write_magic(&mut ehdr.ident);
    ehdr.ident[elf::EI_CLASS] = ELFCLASS64;
    ehdr.ident[elf::EI_DATA] = ELFDATA2LSB;
    ehdr.ident[elf::EI_VERSION] = EV_CURRENT;

    let mut out = vec![0u8; sh_off as usize + shdrs.len() * Shdr::SIZE];
    ehdr.write_to(&mut out);
    for (shdr, payload) in shdrs.iter().zip(&payloads).skip(1) {
        let at = shdr.offset as usize;
        out[at..at + payload.len()].copy_from_slice(payload);
    }
    for (i, shdr) in shdrs.iter().enumerate() {
        shdr.write_to(&mut out[sh_off as usize + i * Shdr::SIZE..]);
    }
    out
}

/// Assemble a sysV archive from named members (short names only).
pub(crate) fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, body) in members {
        if out.len() % 2 == 1 {
            out.push(b'\n');
        }
        let mut hdr = Vec::new();
        hdr.extend_from_slice(format!("{:<16}", format!("{name}/")).as_bytes());
        hdr.extend_from_slice(format!("{:<12}", 0).as_bytes());
        hdr.extend_from_slice(format!("{:<6}", 0).as_bytes());
        hdr.extend_from_slice(format!("{:<6}", 0).as_bytes());
        hdr.extend_from_slice(format!("{:<8}", 644).as_bytes());
        hdr.extend_from_slice(format!("{:<10}", body.len()).as_bytes());
        hdr.extend_from_slice(b"`\n");
        out.extend_from_slice(&hdr);
        out.extend_from_slice(body);
    }
    out
}
