// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! DMA-facing types: scatter lists, per-channel DMA blocks, and the
//! platform integration trait.
//!
//! The engine never allocates or maps memory itself. Callers present
//! requests as scatter lists of already known device addresses, and the
//! [`Platform`] implementation owns cache maintenance, delays, resets and
//! clocks. On cache-coherent systems most of the trait collapses to
//! no-ops.

use core::sync::atomic::{fence, Ordering};

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::InMemoryRegister;

use crate::descriptor::{Descriptor, RING_ENTRIES};
use crate::error::ErrorCode;
use crate::registers::IV_SIZE;

/// One segment of a scatter list: a CPU pointer and the device address the
/// hardware reads or writes.
#[derive(Clone, Copy, Debug)]
pub struct SgEntry {
    ptr: *mut u8,
    dma_addr: u32,
    len: usize,
}

// SgEntry is a plain (pointer, address, length) triple. The memory behind
// `ptr` is owned by the request for the request's whole lifetime, and the
// engine serializes all access to it per channel.
unsafe impl Send for SgEntry {}
unsafe impl Sync for SgEntry {}

impl SgEntry {
    /// ## Safety
    ///
    /// `ptr` must stay valid for reads and writes of `len` bytes, and
    /// `dma_addr` must be the device address of the same memory, until the
    /// request completes.
    pub const unsafe fn from_raw(ptr: *mut u8, dma_addr: u32, len: usize) -> SgEntry {
        SgEntry { ptr, dma_addr, len }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn dma_addr(&self) -> u32 {
        self.dma_addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Total byte length of a scatter list.
pub fn sg_total_len(sg: &[SgEntry]) -> usize {
    sg.iter().map(|e| e.len).sum()
}

/// A resumable position inside a scatter list.
///
/// `offset` is the cumulative byte position across the whole list; `seg`
/// and `seg_offset` locate it. Ring rounds park the cursor between
/// interrupts and pick it up where the previous round stopped.
#[derive(Clone, Copy, Debug, Default)]
pub struct SgCursor {
    seg: usize,
    seg_offset: usize,
    /// Cumulative bytes consumed from the start of the list.
    pub offset: usize,
}

impl SgCursor {
    pub const fn new() -> SgCursor {
        SgCursor {
            seg: 0,
            seg_offset: 0,
            offset: 0,
        }
    }

    /// True while the cursor points inside a segment.
    pub fn valid(&self, sg: &[SgEntry]) -> bool {
        self.seg < sg.len() && self.seg_offset < sg[self.seg].len
    }

    pub fn dma_address(&self, sg: &[SgEntry]) -> u32 {
        sg[self.seg].dma_addr + self.seg_offset as u32
    }

    pub fn remaining_in_segment(&self, sg: &[SgEntry]) -> usize {
        sg[self.seg].len - self.seg_offset
    }

    /// Move forward `len` bytes, skipping exhausted (and empty) segments.
    /// Returns whether the cursor still points inside the list.
    pub fn advance(&mut self, sg: &[SgEntry], len: usize) -> bool {
        self.seg_offset += len;
        self.offset += len;
        while self.seg < sg.len() && self.seg_offset >= sg[self.seg].len {
            self.seg_offset -= sg[self.seg].len;
            self.seg += 1;
        }
        self.seg < sg.len()
    }
}

/// Copy out of a scatter list into `dst`, starting at cumulative byte
/// `offset`. Returns the number of bytes copied (short if the list runs
/// out).
pub fn copy_from_sg(sg: &[SgEntry], offset: usize, dst: &mut [u8]) -> usize {
    let mut cursor = SgCursor::new();
    if !cursor.advance(sg, offset) && !dst.is_empty() {
        return 0;
    }
    let mut copied = 0;
    while copied < dst.len() && cursor.valid(sg) {
        let n = core::cmp::min(dst.len() - copied, cursor.remaining_in_segment(sg));
        unsafe {
            core::ptr::copy_nonoverlapping(
                sg[cursor.seg].ptr.add(cursor.seg_offset),
                dst.as_mut_ptr().add(copied),
                n,
            );
        }
        copied += n;
        cursor.advance(sg, n);
    }
    copied
}

/// Copy `src` into a scatter list starting at cumulative byte `offset`.
/// Returns the number of bytes copied.
pub fn copy_to_sg(sg: &[SgEntry], offset: usize, src: &[u8]) -> usize {
    let mut cursor = SgCursor::new();
    if !cursor.advance(sg, offset) && !src.is_empty() {
        return 0;
    }
    let mut copied = 0;
    while copied < src.len() && cursor.valid(sg) {
        let n = core::cmp::min(src.len() - copied, cursor.remaining_in_segment(sg));
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                sg[cursor.seg].ptr.add(cursor.seg_offset),
                n,
            );
        }
        copied += n;
        cursor.advance(sg, n);
    }
    copied
}

/// Overwrite a buffer with zeros through volatile writes so the wipe of
/// key material is not elided.
pub(crate) fn zeroize(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(b, 0) };
    }
    fence(Ordering::SeqCst);
}

pub const DMA_BLOCK_SIZE: usize = 512;
/// Byte offset of the destination ring inside a [`ChannelDmaBlock`].
pub const DST_RING_OFFSET: usize = RING_ENTRIES * 16;
/// Byte offset of the IV scratch words.
pub const IV_SCRATCH_OFFSET: usize = 2 * RING_ENTRIES * 16;
/// Byte offset of the pad buffer read for stream-mode tail padding.
pub const PAD_OFFSET: usize = IV_SCRATCH_OFFSET + IV_SIZE;

/// Per-channel DMA-visible working memory: both descriptor rings, the IV
/// scratch the hardware latches from, and a zero pad buffer, packed into
/// one 512-byte block.
///
/// The block must live in DMA-coherent memory; the embedder allocates it
/// and hands the engine its device address alongside.
#[repr(C, align(16))]
pub struct ChannelDmaBlock {
    pub src: [Descriptor; RING_ENTRIES],
    pub dst: [Descriptor; RING_ENTRIES],
    iv: [InMemoryRegister<u32>; 4],
    pad: [InMemoryRegister<u32>; 4],
}

const _BLOCK_IS_512_BYTES: [u8; 1] =
    [0; (core::mem::size_of::<ChannelDmaBlock>() == DMA_BLOCK_SIZE) as usize];

impl ChannelDmaBlock {
    pub fn new() -> ChannelDmaBlock {
        ChannelDmaBlock {
            src: core::array::from_fn(|_| Descriptor::default()),
            dst: core::array::from_fn(|_| Descriptor::default()),
            iv: core::array::from_fn(|_| InMemoryRegister::new(0)),
            pad: core::array::from_fn(|_| InMemoryRegister::new(0)),
        }
    }

    /// Stage the IV where a set-iv descriptor tells the hardware to fetch
    /// it from.
    pub fn set_iv(&self, iv: &[u8; IV_SIZE]) {
        for (i, word) in self.iv.iter().enumerate() {
            let bytes = [iv[4 * i], iv[4 * i + 1], iv[4 * i + 2], iv[4 * i + 3]];
            word.set(u32::from_le_bytes(bytes).to_le());
        }
    }

    pub fn clear_iv(&self) {
        for word in self.iv.iter() {
            word.set(0);
        }
    }

    pub fn iv_word(&self, i: usize) -> u32 {
        u32::from_le(self.iv[i].get())
    }
}

impl Default for ChannelDmaBlock {
    fn default() -> ChannelDmaBlock {
        ChannelDmaBlock::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// Services the embedding environment provides to the engine.
///
/// Cache maintenance hooks default to no-ops, fitting coherent systems.
/// Reset and clock control default to no-ops for platforms where firmware
/// already brought the block up.
pub trait Platform: Sync {
    /// Make a scatter list visible to the device. May fail when the
    /// platform's IOMMU or bounce-buffer resources run out.
    fn dma_map(&self, sg: &[SgEntry], dir: DmaDirection) -> Result<(), ErrorCode>;

    fn dma_unmap(&self, sg: &[SgEntry], dir: DmaDirection);

    fn dma_sync_for_cpu(&self, _dma_addr: u32, _len: usize) {}

    fn dma_sync_for_device(&self, _dma_addr: u32, _len: usize) {}

    /// Busy-wait or sleep for at least `us` microseconds.
    fn delay_us(&self, us: u32);

    /// Nudge whatever context calls [`crate::MutiCipher::sweep`].
    fn wake_sweeper(&self);

    fn assert_reset(&self) {}

    fn deassert_reset(&self) {}

    fn enable_clocks(&self) {}

    fn disable_clocks(&self) {}
}
