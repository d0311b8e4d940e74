//! Parsed input files. `InputFile` is the generic ELF container view;
//! `object` builds the relocatable-object model on top of it.

pub mod object;
pub mod section;

use std::ops::Range;

use crate::elf::{self, Ehdr, Shdr, Sym, SHN_XINDEX};
use crate::error::{Error, Result};
use crate::file::File;

#[derive(Debug)]
/// The ELF container of one input: header, section table, string tables,
/// raw symbols, and the linker's bookkeeping for the file.
pub struct InputFile {
    pub file: File,
    pub ehdr: Ehdr,
    pub elf_sections: Vec<Shdr>,
    shstrtab: Range<usize>,
    symbol_strtab: Range<usize>,
    pub elf_syms: Vec<Sym>,
    /// Index of the first non-local symbol; locals are `[0, first_global)`.
    pub first_global: usize,
    pub is_alive: bool,
    pub priority: u32,
    /// Arena handles, parallel to `elf_syms` (fragment symbols follow).
    pub symbols: Vec<usize>,
}

impl InputFile {
    pub fn new(file: File) -> Result<Self> {
        let contents = file.contents();
        if contents.len() < Ehdr::SIZE {
            return Err(Error::FileTooSmall {
                path: file.name.clone(),
            });
        }
        if !elf::check_magic(contents) {
            return Err(Error::NotElf {
                path: file.name.clone(),
            });
        }

        let ehdr = Ehdr::parse(contents);
        if contents.len() < ehdr.sh_off as usize + Shdr::SIZE {
            return Err(Error::SectionOutOfRange {
                offset: ehdr.sh_off,
            });
        }
        let first = Shdr::parse(&contents[ehdr.sh_off as usize..]);

        // With too many sections the real count moves into the first
        // header's size field, and the string-table index into its link.
        let num_sections = if ehdr.sh_num == 0 {
            first.size as usize
        } else {
            ehdr.sh_num as usize
        };
        if contents.len() < ehdr.sh_off as usize + num_sections * Shdr::SIZE {
            return Err(Error::SectionOutOfRange {
                offset: ehdr.sh_off,
            });
        }

        let mut elf_sections = Vec::with_capacity(num_sections);
        for i in 0..num_sections {
            let at = ehdr.sh_off as usize + i * Shdr::SIZE;
            elf_sections.push(Shdr::parse(&contents[at..]));
        }

        let shstrtab_idx = if ehdr.sh_strndx == SHN_XINDEX {
            first.link as usize
        } else {
            ehdr.sh_strndx as usize
        };

        let mut input = Self {
            file,
            ehdr,
            elf_sections,
            shstrtab: 0..0,
            symbol_strtab: 0..0,
            elf_syms: Vec::new(),
            first_global: 0,
            is_alive: false,
            priority: 0,
            symbols: Vec::new(),
        };
        input.shstrtab = input.section_range(shstrtab_idx)?;
        Ok(input)
    }

    /// The empty container behind the linker's internal object.
    pub fn internal() -> Self {
        Self {
            file: File::from_bytes("<internal>", Vec::new()),
            ehdr: Ehdr::default(),
            elf_sections: Vec::new(),
            shstrtab: 0..0,
            symbol_strtab: 0..0,
            elf_syms: Vec::new(),
            first_global: 0,
            is_alive: true,
            priority: 1,
            symbols: Vec::new(),
        }
    }

    /// Byte range of a section's contents, bounds-checked against the file.
    pub fn shdr_range(&self, shdr: &Shdr) -> Result<Range<usize>> {
        let end = shdr.offset + shdr.size;
        if (self.file.contents().len() as u64) < end {
            return Err(Error::SectionOutOfRange {
                offset: shdr.offset,
            });
        }
        Ok(shdr.offset as usize..end as usize)
    }

    pub fn section_range(&self, idx: usize) -> Result<Range<usize>> {
        let shdr = self
            .elf_sections
            .get(idx)
            .ok_or(Error::SectionOutOfRange { offset: idx as u64 })?;
        self.shdr_range(shdr)
    }

    pub fn shdr_bytes(&self, shdr: &Shdr) -> Result<&[u8]> {
        Ok(&self.file.contents()[self.shdr_range(shdr)?])
    }

    pub fn find_section(&self, r#type: u32) -> Option<usize> {
        self.elf_sections
            .iter()
            .position(|shdr| shdr.r#type == r#type)
    }

    /// Read the symbol table pointed at by `symtab` and remember its string
    /// table.
    pub fn fill_elf_syms(&mut self, symtab: Shdr) -> Result<()> {
        let bytes = self.shdr_bytes(&symtab)?;
        let count = bytes.len() / Sym::SIZE;
        let mut syms = Vec::with_capacity(count);
        for i in 0..count {
            syms.push(Sym::parse(&bytes[i * Sym::SIZE..]));
        }
        self.elf_syms = syms;
        self.first_global = symtab.info as usize;
        self.symbol_strtab = self.section_range(symtab.link as usize)?;
        Ok(())
    }

    pub fn shstrtab_bytes(&self) -> &[u8] {
        &self.file.contents()[self.shstrtab.clone()]
    }

    pub fn symbol_strtab_bytes(&self) -> &[u8] {
        &self.file.contents()[self.symbol_strtab.clone()]
    }

    /// Name of the section behind `shdr`.
    pub fn section_name(&self, shdr: &Shdr) -> Result<String> {
        elf::read_name(self.shstrtab_bytes(), shdr.name)
    }

    pub fn sym_name(&self, esym: &Sym) -> Result<String> {
        elf::read_name(self.symbol_strtab_bytes(), esym.name)
    }

    /// Arena handles of this file's global symbols. Fragment symbols
    /// appended past the ELF symbol count are included by design.
    pub fn globals(&self) -> &[usize] {
        &self.symbols[self.first_global.min(self.symbols.len())..]
    }
}
