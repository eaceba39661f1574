// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Hardware buffer descriptors and the ring builder.
//!
//! Each ring-buffer channel is fed from two circular arrays of 16-byte
//! descriptors, walked by hardware. The wire format is little-endian and
//! interpreted by fixed logic, so descriptors are written field by field
//! with explicit endian conversion:
//!
//! ```text
//! offset 0x0: device address (u32)
//! offset 0x4: flags (u32; bits 20/21/22 = dummy / set-iv / end-of-list)
//! offset 0x8: length (u32)
//! offset 0xc: IV scratch address (u32; meaningful with set-iv)
//! ```
//!
//! Observed hardware rules, learned the hard way:
//!  - a request is delimited by the end-of-list flag;
//!  - request length must be a multiple of the cipher's chunk size;
//!  - a descriptor that sets the IV must end its request exactly at the
//!    first chunk boundary, even though more data follows logically.

use core::cmp::min;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::InMemoryRegister;

use crate::dma::{SgCursor, SgEntry};

/// Descriptors per ring. Two rings, the IV scratch, and the pad buffer
/// together fill one 512-byte channel DMA block.
pub const RING_ENTRIES: usize = 15;

/// Hardware maximum is 20 bits; kept to a multiple of the block size.
pub const BUF_LEN_MAX: usize = 0xffff0;

register_bitfields![u32,
    pub BufFlags [
        DUMMY OFFSET(20) NUMBITS(1) [],
        SET_IV OFFSET(21) NUMBITS(1) [],
        END_OF_LIST OFFSET(22) NUMBITS(1) []
    ],
];

pub const FLAG_DUMMY: u32 = 1 << 20;
pub const FLAG_SET_IV: u32 = 1 << 21;
pub const FLAG_END_OF_LIST: u32 = 1 << 22;

/// One hardware buffer descriptor, resident in DMA-visible ring memory.
#[repr(C)]
pub struct Descriptor {
    addr: InMemoryRegister<u32>,
    flags: InMemoryRegister<u32, BufFlags::Register>,
    len: InMemoryRegister<u32>,
    iv_addr: InMemoryRegister<u32>,
}

impl Default for Descriptor {
    fn default() -> Descriptor {
        Descriptor {
            addr: InMemoryRegister::new(0),
            flags: InMemoryRegister::new(0),
            len: InMemoryRegister::new(0),
            iv_addr: InMemoryRegister::new(0),
        }
    }
}

impl Descriptor {
    /// Write all four fields in wire order.
    pub fn write_entry(&self, addr: u32, len: u32, flags: u32, iv_addr: u32) {
        self.addr.set(addr.to_le());
        self.flags.set(flags.to_le());
        self.len.set(len.to_le());
        self.iv_addr.set(iv_addr.to_le());
    }

    pub fn addr(&self) -> u32 {
        u32::from_le(self.addr.get())
    }

    pub fn flags(&self) -> u32 {
        u32::from_le(self.flags.get())
    }

    pub fn len(&self) -> u32 {
        u32::from_le(self.len.get())
    }

    pub fn iv_addr(&self) -> u32 {
        u32::from_le(self.iv_addr.get())
    }
}

const _DESCRIPTOR_IS_16_BYTES: [u8; 1] = [0; (core::mem::size_of::<Descriptor>() == 16) as usize];

/// The caller handed over a cursor pointing outside its scatter list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidCursor;

/// Parameters that stay fixed across one request's ring rounds.
#[derive(Clone, Copy)]
pub struct BuildParams {
    /// Request length padded up to a chunk multiple.
    pub runlen: usize,
    /// Real request length; the tail up to `runlen` reads the pad buffer.
    pub cryptlen: usize,
    pub chunksize: usize,
    /// ECB never latches an IV mid-stream.
    pub ecb: bool,
    pub iv_dma: u32,
    pub pad_dma: u32,
}

/// Append descriptors for one ring round.
///
/// Starting at ring index `start`, fill up to one ring's worth of
/// descriptors from `cursor` over `sg`, advancing the cursor. Returns the
/// number of descriptors written; the round is complete when a descriptor
/// ends exactly at `runlen` (it carries the end-of-list flag).
///
/// On the source side of a non-ECB request, a descriptor that would cross
/// the first chunk boundary is split at the boundary and flagged to latch
/// the IV; the hardware requires the IV-latching request to be exactly one
/// chunk long.
pub fn append_descriptors(
    ring: &[Descriptor],
    start: usize,
    cursor: &mut SgCursor,
    sg: &[SgEntry],
    params: &BuildParams,
    is_dst: bool,
) -> Result<usize, InvalidCursor> {
    let mut i = start;
    let mut n = 0;

    while cursor.offset < params.runlen && n < ring.len() {
        let req_remain = params.runlen - cursor.offset;

        let (addr, mut len, mut flags);
        if cursor.offset >= params.cryptlen {
            // Pad for stream cipher modes (CFB/OFB/...).
            addr = params.pad_dma;
            len = req_remain;
            flags = FLAG_END_OF_LIST;
        } else {
            if !cursor.valid(sg) {
                log::warn!("descriptor build: scatter cursor ran out at {}", cursor.offset);
                return Err(InvalidCursor);
            }
            addr = cursor.dma_address(sg);
            len = min(min(cursor.remaining_in_segment(sg), req_remain), BUF_LEN_MAX);
            flags = if len == req_remain { FLAG_END_OF_LIST } else { 0 };
        }

        // If the IV is still to be latched, end the request at the chunk
        // border.
        let mut iv_addr = 0;
        if !is_dst
            && !params.ecb
            && cursor.offset < params.chunksize
            && cursor.offset + len >= params.chunksize
        {
            len = params.chunksize - cursor.offset;
            flags = FLAG_SET_IV | FLAG_END_OF_LIST;
            iv_addr = params.iv_dma;
        }

        ring[i].write_entry(addr, len as u32, flags, iv_addr);

        log::debug!(
            "add {} {:4} +{:4} {:x}",
            if is_dst { "dst" } else { "src" },
            req_remain,
            len,
            flags >> 20
        );

        i += 1;
        if i >= ring.len() {
            i = 0;
        }
        n += 1;

        cursor.advance(sg, len);
    }

    Ok(n)
}
