//! The output section-header table chunk.

use crate::context::Context;
use crate::elf::Shdr;
use crate::output::Chunk;

#[derive(Debug)]
pub struct OutputShdr {
    pub chunk: Chunk,
}

impl OutputShdr {
    pub fn new() -> Self {
        let mut chunk = Chunk::new();
        chunk.shdr.addr_align = 8;
        Self { chunk }
    }
}

impl Default for OutputShdr {
    fn default() -> Self {
        Self::new()
    }
}

pub fn update_shdr(ctx: &mut Context) {
    let mut n = 0;
    for &chunk in &ctx.chunks {
        n = n.max(ctx.chunk(chunk).shndx);
    }
    ctx.shdr.chunk.shdr.size = ((n + 1) * Shdr::SIZE) as u64;
}

pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
    let base = ctx.shdr.chunk.shdr.offset as usize;
    Shdr::default().write_to(&mut buf[base..]);

    for &chunk in &ctx.chunks {
        let shndx = ctx.chunk(chunk).shndx;
        if shndx > 0 {
            let at = base + shndx * Shdr::SIZE;
            ctx.chunk(chunk).shdr.write_to(&mut buf[at..]);
        }
    }
}
