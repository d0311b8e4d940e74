//! The process-wide symbol model: one `Symbol` per unique global name plus
//! per-object locals and fragment symbols, all living in the context's arena
//! and addressed by index.

use crate::context::Context;
use crate::elf::{Sym, STV_DEFAULT};
use crate::output::ChunkRef;

/// The symbol needs a GOT slot holding its absolute address.
pub const NEEDS_GOT: u32 = 1 << 0;
/// The symbol needs a GOT slot holding its TP-relative address.
pub const NEEDS_GOTTP: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What a symbol's value is relative to. At most one target at a time; a
/// symbol with no target denotes an absolute (or still unresolved) value.
pub enum SymbolTarget {
    #[default]
    None,
    /// An input section of the owning object, by section index.
    Section { shndx: usize },
    /// An output chunk.
    Chunk(ChunkRef),
    /// A deduplicated fragment of a merged pool.
    Fragment { merged: usize, frag: usize },
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Index of the owning object file, if any.
    pub file: Option<usize>,
    pub target: SymbolTarget,
    /// Offset relative to `target`, or the absolute value without one.
    pub value: u64,
    /// Index into the owning file's ELF symbol table.
    pub sym_idx: Option<usize>,
    /// Index into the context's aux-slot array (GOT indices).
    pub aux_idx: Option<usize>,
    pub ver_idx: u16,
    pub flags: u32,
    pub visibility: u8,
    pub is_weak: bool,
    pub is_exported: bool,
}

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: None,
            target: SymbolTarget::None,
            value: 0,
            sym_idx: None,
            aux_idx: None,
            ver_idx: 0,
            flags: 0,
            visibility: STV_DEFAULT,
            is_weak: false,
            is_exported: false,
        }
    }

    /// Forget a resolution from a file that turned out to be dead.
    pub fn clear(&mut self) {
        self.file = None;
        self.target = SymbolTarget::None;
        self.sym_idx = None;
        self.ver_idx = 0;
        self.is_weak = false;
        self.is_exported = false;
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Side-table slot carrying a symbol's GOT indices.
pub struct SymbolAux {
    pub got_idx: Option<u32>,
    pub got_tp_idx: Option<u32>,
}

/// Intern `name` in the context's global map.
pub fn get_symbol_by_name(ctx: &mut Context, name: &str) -> usize {
    if let Some(&sid) = ctx.symbol_map.get(name) {
        return sid;
    }
    let sid = ctx.symbols.len();
    ctx.symbols.push(Symbol::new(name));
    ctx.symbol_map.insert(name.to_string(), sid);
    sid
}

/// Rank a candidate definition; lower wins. The file's priority is the
/// tiebreaker within a band.
pub fn get_rank(priority: u32, esym: &Sym, is_lazy: bool) -> u64 {
    let band = if esym.is_common() {
        if is_lazy {
            6
        } else {
            5
        }
    } else {
        match (is_lazy, esym.is_weak()) {
            (true, true) => 4,
            (true, false) => 3,
            (false, true) => 2,
            (false, false) => 1,
        }
    };
    (band << 24) + priority as u64
}

/// The rank of a symbol's current resolution, or the worst band when it has
/// none.
pub fn symbol_rank(ctx: &Context, sid: usize) -> u64 {
    let sym = &ctx.symbols[sid];
    let Some(file) = sym.file else {
        return 7 << 24;
    };
    let obj = &ctx.objs[file];
    match elf_sym(ctx, sid) {
        Some(esym) => get_rank(obj.input.priority, esym, !obj.input.is_alive),
        None => 7 << 24,
    }
}

/// The ELF symbol backing a resolved symbol.
pub fn elf_sym(ctx: &Context, sid: usize) -> Option<&Sym> {
    let sym = &ctx.symbols[sid];
    let file = sym.file?;
    let idx = sym.sym_idx?;
    ctx.objs[file].input.elf_syms.get(idx)
}

/// The symbol's address in the laid-out image. Symbols bound to dead
/// sections or fragments resolve to zero.
pub fn symbol_addr(ctx: &Context, sid: usize) -> u64 {
    let sym = &ctx.symbols[sid];
    match sym.target {
        SymbolTarget::Fragment { merged, frag } => {
            let pool = &ctx.merged_sections[merged];
            if !pool.frags[frag].is_alive {
                return 0;
            }
            pool.fragment_addr(frag).wrapping_add(sym.value)
        }
        SymbolTarget::Section { shndx } => {
            let Some(file) = sym.file else {
                return sym.value;
            };
            match &ctx.objs[file].sections[shndx] {
                Some(isec) if isec.is_alive => isec.addr(ctx).wrapping_add(sym.value),
                _ => 0,
            }
        }
        SymbolTarget::Chunk(chunk) => ctx.chunk(chunk).shdr.addr.wrapping_add(sym.value),
        SymbolTarget::None => sym.value,
    }
}

pub fn got_idx(ctx: &Context, sid: usize) -> Option<u32> {
    let aux = ctx.symbols[sid].aux_idx?;
    ctx.symbols_aux[aux].got_idx
}

pub fn got_tp_idx(ctx: &Context, sid: usize) -> Option<u32> {
    let aux = ctx.symbols[sid].aux_idx?;
    ctx.symbols_aux[aux].got_tp_idx
}

/// Address of the symbol's TP-relative GOT slot.
pub fn got_tp_addr(ctx: &Context, sid: usize) -> u64 {
    let idx = got_tp_idx(ctx, sid).unwrap_or_default();
    ctx.got.chunk.shdr.addr + idx as u64 * 8
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::elf::{sym_info, SHN_COMMON, STB_GLOBAL, STB_WEAK, STT_NOTYPE};

    fn defined(bind: u8) -> Sym {
        Sym {
            info: sym_info(bind, STT_NOTYPE),
            shndx: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_rank_bands() {
        let strong = defined(STB_GLOBAL);
        let weak = defined(STB_WEAK);
        let common = Sym {
            info: sym_info(STB_GLOBAL, STT_NOTYPE),
            shndx: SHN_COMMON,
            ..Default::default()
        };

        // strong < weak < lazy strong < lazy weak < common < lazy common
        assert!(get_rank(10000, &strong, false) < get_rank(10000, &weak, false));
        assert!(get_rank(10000, &weak, false) < get_rank(10000, &strong, true));
        assert!(get_rank(10000, &strong, true) < get_rank(10000, &weak, true));
        assert!(get_rank(10000, &weak, true) < get_rank(10000, &common, false));
        assert!(get_rank(10000, &common, false) < get_rank(10000, &common, true));
    }

    #[test]
    fn test_rank_priority_tiebreak() {
        let strong = defined(STB_GLOBAL);
        // earlier file wins within a band, but never across bands
        assert!(get_rank(10000, &strong, false) < get_rank(10001, &strong, false));
        let weak = defined(STB_WEAK);
        assert!(get_rank(1, &weak, false) > get_rank(20000, &strong, false));
    }

    #[test]
    fn test_clear_forgets_resolution() {
        let mut sym = Symbol::new("w");
        sym.file = Some(3);
        sym.target = SymbolTarget::Section { shndx: 1 };
        sym.value = 0x10;
        sym.is_weak = true;
        sym.clear();
        assert_eq!(sym.file, None);
        assert_eq!(sym.target, SymbolTarget::None);
        assert!(!sym.is_weak);
    }
}
