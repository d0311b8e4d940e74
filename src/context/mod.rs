//! The process-wide ledger threaded through every pass: linker options,
//! the symbol arena and intern map, input objects, output chunks, and the
//! handful of addresses the passes agree on.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use typed_builder::TypedBuilder;

use crate::file::MachineType;
use crate::input::object::ObjectFile;
use crate::merge::MergedSection;
use crate::output::ehdr::OutputEhdr;
use crate::output::got::GotSection;
use crate::output::phdr::OutputPhdr;
use crate::output::shdr::OutputShdr;
use crate::output::{Chunk, ChunkRef, OutputSection};
use crate::symbol::{Symbol, SymbolAux};

/// Everything the command line decides.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Options {
    #[builder(default = String::from("a.out"))]
    pub output: String,
    #[builder(default)]
    pub emulation: MachineType,
    #[builder(default)]
    pub library_paths: Vec<PathBuf>,
}

/// Handles to the symbols the linker itself injects.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticSymbols {
    pub init_array_start: usize,
    pub init_array_end: usize,
    pub fini_array_start: usize,
    pub fini_array_end: usize,
    pub preinit_array_start: usize,
    pub preinit_array_end: usize,
    pub global_pointer: usize,
}

pub struct Context {
    pub opts: Options,

    /// All symbols in the process: interned globals plus per-object locals
    /// and fragment symbols.
    pub symbols: Vec<Symbol>,
    pub symbol_map: HashMap<String, usize>,
    pub symbols_aux: Vec<SymbolAux>,

    pub objs: Vec<ObjectFile>,
    pub internal_obj: Option<usize>,

    /// The chunks of the output image, in layout order.
    pub chunks: Vec<ChunkRef>,
    pub ehdr: OutputEhdr,
    pub phdr: OutputPhdr,
    pub shdr: OutputShdr,
    pub got: GotSection,
    pub output_sections: Vec<OutputSection>,
    pub merged_sections: Vec<MergedSection>,

    /// Paths already pulled in, so an archive named twice is read once.
    pub visited: HashSet<String>,
    pub file_priority: u32,
    pub default_version: u16,
    /// Base of the PT_TLS segment, once known.
    pub tp_addr: u64,

    pub synthetic: Option<SyntheticSymbols>,
}

impl Context {
    pub fn new(opts: Options) -> Self {
        Self {
            opts,
            symbols: Vec::new(),
            symbol_map: HashMap::new(),
            symbols_aux: Vec::new(),
            objs: Vec::new(),
            internal_obj: None,
            chunks: Vec::new(),
            ehdr: OutputEhdr::new(),
            phdr: OutputPhdr::new(),
            shdr: OutputShdr::new(),
            got: GotSection::new(),
            output_sections: Vec::new(),
            merged_sections: Vec::new(),
            visited: HashSet::new(),
            file_priority: 10000,
            default_version: crate::elf::VER_NDX_LOCAL,
            tp_addr: 0,
            synthetic: None,
        }
    }

    /// The common state of any chunk.
    pub fn chunk(&self, chunk: ChunkRef) -> &Chunk {
        match chunk {
            ChunkRef::Ehdr => &self.ehdr.chunk,
            ChunkRef::Phdr => &self.phdr.chunk,
            ChunkRef::Shdr => &self.shdr.chunk,
            ChunkRef::Got => &self.got.chunk,
            ChunkRef::Osec(idx) => &self.output_sections[idx].chunk,
            ChunkRef::Merged(idx) => &self.merged_sections[idx].chunk,
        }
    }

    pub fn chunk_mut(&mut self, chunk: ChunkRef) -> &mut Chunk {
        match chunk {
            ChunkRef::Ehdr => &mut self.ehdr.chunk,
            ChunkRef::Phdr => &mut self.phdr.chunk,
            ChunkRef::Shdr => &mut self.shdr.chunk,
            ChunkRef::Got => &mut self.got.chunk,
            ChunkRef::Osec(idx) => &mut self.output_sections[idx].chunk,
            ChunkRef::Merged(idx) => &mut self.merged_sections[idx].chunk,
        }
    }

    /// Hand out the next input-file priority.
    pub fn next_priority(&mut self) -> u32 {
        let priority = self.file_priority;
        self.file_priority += 1;
        priority
    }
}
