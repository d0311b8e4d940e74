//! The global offset table chunk. Slots are allocated in scan order at an
//! 8-byte stride; TP-relative slots hold the symbol's offset from the
//! thread pointer.

use crate::context::Context;
use crate::elf::{SectionFlags, SHT_PROGBITS};
use crate::output::Chunk;
use crate::symbol::{self, SymbolAux};
use crate::util;

#[derive(Debug)]
pub struct GotSection {
    pub chunk: Chunk,
    pub got_syms: Vec<usize>,
    pub got_tp_syms: Vec<usize>,
}

impl GotSection {
    pub fn new() -> Self {
        let mut chunk = Chunk::new();
        chunk.name = ".got".to_string();
        chunk.shdr.r#type = SHT_PROGBITS;
        chunk.shdr.flags = SectionFlags::ALLOC | SectionFlags::WRITE;
        chunk.shdr.addr_align = 8;
        Self {
            chunk,
            got_syms: Vec::new(),
            got_tp_syms: Vec::new(),
        }
    }
}

impl Default for GotSection {
    fn default() -> Self {
        Self::new()
    }
}

/// Make sure `sid` has an aux slot, returning its index.
pub fn ensure_aux(ctx: &mut Context, sid: usize) -> usize {
    if let Some(aux) = ctx.symbols[sid].aux_idx {
        return aux;
    }
    let aux = ctx.symbols_aux.len();
    ctx.symbols_aux.push(SymbolAux::default());
    ctx.symbols[sid].aux_idx = Some(aux);
    aux
}

pub fn add_got_symbol(ctx: &mut Context, sid: usize) {
    let aux = ensure_aux(ctx, sid);
    let idx = (ctx.got.chunk.shdr.size / 8) as u32;
    ctx.symbols_aux[aux].got_idx = Some(idx);
    ctx.got.chunk.shdr.size += 8;
    ctx.got.got_syms.push(sid);
}

pub fn add_got_tp_symbol(ctx: &mut Context, sid: usize) {
    let aux = ensure_aux(ctx, sid);
    let idx = (ctx.got.chunk.shdr.size / 8) as u32;
    ctx.symbols_aux[aux].got_tp_idx = Some(idx);
    ctx.got.chunk.shdr.size += 8;
    ctx.got.got_tp_syms.push(sid);
}

#[derive(Debug, Clone, Copy)]
struct GotEntry {
    idx: u64,
    val: u64,
}

fn get_entries(ctx: &Context) -> Vec<GotEntry> {
    let mut entries = Vec::new();
    for &sid in &ctx.got.got_syms {
        let idx = symbol::got_idx(ctx, sid).unwrap_or_default() as u64;
        entries.push(GotEntry {
            idx,
            val: symbol::symbol_addr(ctx, sid),
        });
    }
    for &sid in &ctx.got.got_tp_syms {
        let idx = symbol::got_tp_idx(ctx, sid).unwrap_or_default() as u64;
        entries.push(GotEntry {
            idx,
            val: symbol::symbol_addr(ctx, sid).wrapping_sub(ctx.tp_addr),
        });
    }
    entries
}

/// A GOT is always emitted, even when empty.
pub fn update_shdr(ctx: &mut Context) {
    if ctx.got.chunk.shdr.size == 0 {
        ctx.got.chunk.shdr.size = 8;
    }
}

pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
    let base = ctx.got.chunk.shdr.offset as usize;
    let size = ctx.got.chunk.shdr.size as usize;
    buf[base..base + size].fill(0);

    for ent in get_entries(ctx) {
        util::write_u64(buf, base + ent.idx as usize * 8, ent.val);
    }
}
