// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Shared test harness: a software model of the MutiCipher block.
//!
//! The model backs the engine's register file with plain memory and walks
//! the descriptor rings the way the hardware does, piping bytes through a
//! toy keyed XOR cipher with real chaining-mode state. XOR keeps the
//! arithmetic trivial while still making every data-routing or chaining
//! bug visible: bytes land in the wrong place or chain from the wrong IV
//! and the round trip falls apart.
//!
//! Register writes are plain stores, so the model recovers the hardware's
//! add/subtract count semantics by convention: the `int_*_cnt_cfg`
//! doorbells (written right before the matching count on every emit) carry
//! the delta, and any other count write is folded in as a 16-bit delta,
//! which covers the stale-count flush at prepare.

#![allow(dead_code)]

use std::boxed::Box;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use histb_muc::descriptor::{FLAG_END_OF_LIST, FLAG_SET_IV};
use histb_muc::dma::DMA_BLOCK_SIZE;
use histb_muc::registers::{MucRegisters, IV_SIZE};
use histb_muc::utilities::StaticRef;
use histb_muc::{
    Alg, ChannelDmaBlock, CipherSession, Client, Config, DmaDirection, ErrorCode, Mode,
    MucResources, MutiCipher, Platform, Request, RingResources,
};

/******** register offsets (byte) ********/

const REGS_SIZE: usize = 0x1420;

pub const R_CHAN0_DATA_OUT: usize = 0x000;
pub const R_IV_OUT: usize = 0x010;
pub const R_KEY: usize = 0x090;
pub const R_INT_STATUS: usize = 0x1400;
pub const R_INT_CFG: usize = 0x1404;
pub const R_INT_RAW: usize = 0x1408;
pub const R_RST_STATUS: usize = 0x140c;
pub const R_CHAN0_CFG: usize = 0x1410;

pub const B_IN_BUF_NUM: usize = 0x00;
pub const B_IN_BUF_CNT: usize = 0x04;
pub const B_IN_EMPTY_CNT: usize = 0x08;
pub const B_INT_IN_CNT_CFG: usize = 0x0c;
pub const B_CTRL: usize = 0x10;
pub const B_SRC_LST_ADDR: usize = 0x14;
pub const B_SRC_LST_PTR: usize = 0x20;
pub const B_IN_LEFT: usize = 0x2c;
pub const B_OUT_BUF_NUM: usize = 0x3c;
pub const B_OUT_BUF_CNT: usize = 0x40;
pub const B_OUT_FULL_CNT: usize = 0x44;
pub const B_INT_OUT_CNT_CFG: usize = 0x48;
pub const B_DST_LST_ADDR: usize = 0x4c;
pub const B_DST_LST_PTR: usize = 0x58;
pub const B_OUT_LEFT: usize = 0x64;

const R_CHAN0_CTRL: usize = 0x1000;
const R_CHAN0_IV_IN: usize = 0x1004;
const R_CHAN0_DATA_IN: usize = 0x1014;

pub const fn bank_off(id: usize) -> usize {
    0x1000 + 0x80 * id
}

fn rd(base: *mut u32, off: usize) -> u32 {
    unsafe { core::ptr::read_volatile(base.add(off / 4)) }
}

fn wr(base: *mut u32, off: usize, v: u32) {
    unsafe { core::ptr::write_volatile(base.add(off / 4), v) }
}

/******** toy cipher ********/

/// What the machine key ladder would feed the engine; fixed so encrypt
/// and decrypt agree.
pub const LADDER_KEY: [u8; 16] = [0x49; 16];

pub fn pad_for_key(key: &[u8]) -> [u8; 16] {
    let mut pad = [0u8; 16];
    for (i, p) in pad.iter_mut().enumerate() {
        *p = key[i % key.len()] ^ (i as u8).wrapping_mul(0x1d) ^ key.len() as u8;
    }
    pad
}

/// One pass of the toy cipher: `E(block) = block ^ pad`, wrapped in the
/// mode's real chaining rules. `mode` uses the control-word encoding
/// (0 ECB, 1 CBC, 2 CFB, 3 OFB, 4 CTR); `iv` carries the chain state.
pub fn crypt(
    mode: u32,
    decrypt: bool,
    pad: &[u8; 16],
    bs: usize,
    iv: &mut [u8; 16],
    data: &[u8],
) -> Vec<u8> {
    assert_eq!(data.len() % bs, 0, "partial block reached the cipher");
    let mut out = Vec::with_capacity(data.len());
    for block in data.chunks(bs) {
        let mut o = [0u8; 16];
        match mode {
            0 => {
                for i in 0..bs {
                    o[i] = block[i] ^ pad[i];
                }
            }
            1 => {
                if !decrypt {
                    for i in 0..bs {
                        o[i] = block[i] ^ iv[i] ^ pad[i];
                    }
                    iv[..bs].copy_from_slice(&o[..bs]);
                } else {
                    for i in 0..bs {
                        o[i] = block[i] ^ pad[i] ^ iv[i];
                    }
                    iv[..bs].copy_from_slice(block);
                }
            }
            2 => {
                for i in 0..bs {
                    o[i] = block[i] ^ iv[i] ^ pad[i];
                }
                if decrypt {
                    iv[..bs].copy_from_slice(block);
                } else {
                    let (head, _) = o.split_at(bs);
                    iv[..bs].copy_from_slice(head);
                }
            }
            3 => {
                let mut s = [0u8; 16];
                for i in 0..bs {
                    s[i] = iv[i] ^ pad[i];
                    o[i] = block[i] ^ s[i];
                }
                iv[..bs].copy_from_slice(&s[..bs]);
            }
            4 => {
                for i in 0..bs {
                    o[i] = block[i] ^ iv[i] ^ pad[i];
                }
                for i in (0..bs).rev() {
                    iv[i] = iv[i].wrapping_add(1);
                    if iv[i] != 0 {
                        break;
                    }
                }
            }
            _ => panic!("bad mode {}", mode),
        }
        out.extend_from_slice(&o[..bs]);
    }
    out
}

fn mode_code(mode: Mode) -> u32 {
    match mode {
        Mode::Ecb => 0,
        Mode::Cbc => 1,
        Mode::Cfb => 2,
        Mode::Ofb => 3,
        Mode::Ctr => 4,
    }
}

/// Reference result for a whole request, computed outside the engine.
/// Stream-mode tails are padded with zeros and truncated back, matching
/// what the hardware produces on a fresh channel.
pub fn reference_crypt(
    alg: Alg,
    mode: Mode,
    key: &[u8],
    iv: [u8; IV_SIZE],
    decrypt: bool,
    data: &[u8],
) -> Vec<u8> {
    let bs = alg.block_size();
    let mut padded = data.to_vec();
    while padded.len() % bs != 0 {
        padded.push(0);
    }
    let mut iv = iv;
    let mut out = crypt(
        mode_code(mode),
        decrypt,
        &pad_for_key(key),
        bs,
        &mut iv,
        &padded,
    );
    out.truncate(data.len());
    out
}

/******** the device model ********/

#[derive(Default)]
struct RingSim {
    in_cnt: u32,
    out_cnt: u32,
    src_ptr: u32,
    dst_ptr: u32,
    /// Bytes consumed from source descriptors, not yet request-complete.
    input: Vec<u8>,
    latch: Option<[u8; IV_SIZE]>,
    in_reqs: VecDeque<(Vec<u8>, Option<[u8; IV_SIZE]>)>,
    /// Processed output waiting for destination descriptors.
    out_pending: Vec<u8>,
    /// Output held inside the engine (stall fault injection).
    held: Vec<u8>,
    iv: [u8; IV_SIZE],
}

struct Desc {
    addr: u32,
    flags: u32,
    len: u32,
    iv_addr: u32,
}

fn read_desc(ring: *mut u8, idx: usize) -> Desc {
    let p = ring.wrapping_add(16 * idx) as *const u32;
    unsafe {
        Desc {
            addr: u32::from_le(core::ptr::read_volatile(p)),
            flags: u32::from_le(core::ptr::read_volatile(p.add(1))),
            len: u32::from_le(core::ptr::read_volatile(p.add(2))),
            iv_addr: u32::from_le(core::ptr::read_volatile(p.add(3))),
        }
    }
}

fn translate(regions: &[(u32, *mut u8, usize)], dma: u32, len: usize) -> *mut u8 {
    for &(start, host, rlen) in regions {
        if dma >= start && dma as u64 + len as u64 <= start as u64 + rlen as u64 {
            return unsafe { host.add((dma - start) as usize) };
        }
    }
    panic!("no DMA region covers {:#x}+{}", dma, len);
}

/// Key and block size decoded from a channel control word.
fn cipher_setup(base: *mut u32, ctrl: u32) -> ([u8; 16], usize) {
    let alg = (ctrl >> 4) & 3;
    let bs = if alg == 2 { 16 } else { 8 };
    let key: Vec<u8> = if ctrl & (1 << 13) != 0 {
        LADDER_KEY.to_vec()
    } else {
        let id = ((ctrl >> 14) & 7) as usize;
        let code = (ctrl >> 9) & 3;
        let len = match (alg, code) {
            (2, 0) => 16,
            (2, 1) => 24,
            (2, _) => 32,
            (0, _) => 8,
            (1, 3) => 16,
            _ => 24,
        };
        let mut k = Vec::new();
        for w in 0..8 {
            k.extend_from_slice(&rd(base, R_KEY + id * 0x20 + 4 * w).to_le_bytes());
        }
        k.truncate(len);
        k
    };
    (pad_for_key(&key), bs)
}

pub struct Sim {
    base: *mut u32,
    present_mask: u8,
    pub fail_reset: bool,
    regions: Vec<(u32, *mut u8, usize)>,
    next_dma: u32,
    ring: [RingSim; 8],
    chan0_iv: [u8; IV_SIZE],
    /// Hold back the output of the last request processed on this channel
    /// in the next step, like the short-trailing-buffer hardware stall.
    pub stall_next: [bool; 8],
    /// Teleport the source read pointer once, as an external reset would.
    pub force_src_ptr: [Option<u32>; 8],
    /// Bytes pushed through the cipher, per channel.
    pub processed: [usize; 8],
}

// Raw pointers into leaked test memory; the platform mutex serializes all
// access.
unsafe impl Send for Sim {}

impl Sim {
    fn new(base: *mut u32, present_mask: u8, fail_reset: bool) -> Sim {
        Sim {
            base,
            present_mask,
            fail_reset,
            regions: Vec::new(),
            next_dma: 0x4000_0000,
            ring: Default::default(),
            chan0_iv: [0; IV_SIZE],
            stall_next: [false; 8],
            force_src_ptr: [None; 8],
            processed: [0; 8],
        }
    }

    pub fn register_region(&mut self, dma: u32, host: *mut u8, len: usize) {
        self.regions.push((dma, host, len));
    }

    pub fn alloc_dma(&mut self, len: usize) -> u32 {
        let dma = self.next_dma;
        self.next_dma += ((len as u32 + 15) & !15).max(16);
        dma
    }

    pub fn reg_read(&self, off: usize) -> u32 {
        rd(self.base, off)
    }

    pub fn reg_write(&mut self, off: usize, v: u32) {
        wr(self.base, off, v);
    }

    /// Ring internal channel state along with the visible registers, for
    /// tests that stage leftover hardware state.
    pub fn set_out_count(&mut self, id: usize, n: u32) {
        self.ring[id].out_cnt = n;
        wr(self.base, bank_off(id) + B_OUT_BUF_CNT, n);
    }

    pub fn set_src_ptr(&mut self, id: usize, p: u32) {
        self.ring[id].src_ptr = p;
        wr(self.base, bank_off(id) + B_SRC_LST_PTR, p);
    }

    /// One hardware tick: apply count writes, walk armed rings, run the
    /// cipher, fill destinations, and raise interrupt status. Returns
    /// whether any enabled interrupt fired.
    pub fn step(&mut self) -> bool {
        let base = self.base;
        wr(base, R_INT_STATUS, 0);
        wr(base, R_INT_RAW, 0);
        if !self.fail_reset {
            wr(base, R_RST_STATUS, rd(base, R_RST_STATUS) | 1);
        }

        // Fused-off channels never latch their interrupt enables.
        let mut cfg = rd(base, R_INT_CFG);
        for id in 0..8 {
            if self.present_mask & (1 << id) == 0 {
                cfg &= !((1 << id) | (1 << (8 + id)));
            }
        }
        wr(base, R_INT_CFG, cfg);

        let mut events: u32 = 0;
        if self.present_mask & 1 != 0 {
            events |= self.step_chan0();
        }
        for id in 1..8 {
            if self.present_mask & (1 << id) != 0 {
                events |= self.step_ring(id);
            }
        }

        let visible = events & cfg;
        wr(base, R_INT_STATUS, visible);
        wr(base, R_INT_RAW, visible);
        visible != 0
    }

    fn step_chan0(&mut self) -> u32 {
        let base = self.base;
        if rd(base, R_CHAN0_CFG) & 1 == 0 {
            return 0;
        }
        let ctrl = rd(base, R_CHAN0_CTRL);
        let (pad, bs) = cipher_setup(base, ctrl);

        if ctrl & (1 << 8) != 0 {
            for i in 0..4 {
                self.chan0_iv[4 * i..4 * i + 4]
                    .copy_from_slice(&rd(base, R_CHAN0_IV_IN + 4 * i).to_le_bytes());
            }
        }

        let mut data = vec![0u8; bs];
        for i in 0..bs / 4 {
            data[4 * i..4 * i + 4]
                .copy_from_slice(&rd(base, R_CHAN0_DATA_IN + 4 * i).to_le_bytes());
        }

        let mode = (ctrl >> 1) & 7;
        let out = crypt(mode, ctrl & 1 != 0, &pad, bs, &mut self.chan0_iv, &data);
        for i in 0..bs / 4 {
            wr(
                base,
                R_CHAN0_DATA_OUT + 4 * i,
                u32::from_le_bytes(out[4 * i..4 * i + 4].try_into().unwrap()),
            );
        }
        if mode != 0 {
            for i in 0..4 {
                wr(
                    base,
                    R_IV_OUT + 4 * i,
                    u32::from_le_bytes(self.chan0_iv[4 * i..4 * i + 4].try_into().unwrap()),
                );
            }
        }

        self.processed[0] += bs;
        wr(base, R_CHAN0_CFG, 0);
        1 << 8
    }

    fn step_ring(&mut self, id: usize) -> u32 {
        let base = self.base;
        let b = bank_off(id);

        if rd(base, b + B_SRC_LST_ADDR) == 0 || rd(base, b + B_IN_BUF_NUM) == 0 {
            return 0;
        }

        let regions = &self.regions;
        let st = &mut self.ring[id];
        let mut events: u32 = 0;

        // Fold in count writes since the last tick.
        let in_db = rd(base, b + B_INT_IN_CNT_CFG);
        if in_db != 0 {
            wr(base, b + B_INT_IN_CNT_CFG, 0);
            st.in_cnt = (st.in_cnt + in_db) & 0xffff;
        } else {
            let cell = rd(base, b + B_IN_BUF_CNT);
            if cell != st.in_cnt {
                st.in_cnt = (st.in_cnt + cell) & 0xffff;
            }
        }
        let out_db = rd(base, b + B_INT_OUT_CNT_CFG);
        if out_db != 0 {
            wr(base, b + B_INT_OUT_CNT_CFG, 0);
            st.out_cnt = (st.out_cnt + out_db) & 0xffff;
        } else {
            let cell = rd(base, b + B_OUT_BUF_CNT);
            if cell != st.out_cnt {
                st.out_cnt = (st.out_cnt + cell) & 0xffff;
            }
        }

        let in_num = rd(base, b + B_IN_BUF_NUM) & 0xffff;
        let out_num = (rd(base, b + B_OUT_BUF_NUM) & 0xffff).max(1);

        // Consume every posted source descriptor.
        let consumed = st.in_cnt;
        if consumed != 0 {
            let ring_ptr = translate(regions, rd(base, b + B_SRC_LST_ADDR), 16 * in_num as usize);
            for _ in 0..consumed {
                let d = read_desc(ring_ptr, st.src_ptr as usize);
                if d.flags & FLAG_SET_IV != 0 {
                    let iv = translate(regions, d.iv_addr, IV_SIZE);
                    let mut latched = [0u8; IV_SIZE];
                    unsafe {
                        core::ptr::copy_nonoverlapping(iv, latched.as_mut_ptr(), IV_SIZE)
                    };
                    st.latch = Some(latched);
                }
                let src = translate(regions, d.addr, d.len as usize);
                let old = st.input.len();
                st.input.resize(old + d.len as usize, 0);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src,
                        st.input.as_mut_ptr().add(old),
                        d.len as usize,
                    )
                };
                if d.flags & FLAG_END_OF_LIST != 0 {
                    st.in_reqs
                        .push_back((core::mem::take(&mut st.input), st.latch.take()));
                }
                st.src_ptr = (st.src_ptr + 1) % in_num;
            }
            st.in_cnt = 0;
            wr(
                base,
                b + B_IN_EMPTY_CNT,
                (rd(base, b + B_IN_EMPTY_CNT) + consumed) & 0xffff,
            );
            events |= 1 << id;
        }

        // Run complete requests through the cipher.
        let ctrl = rd(base, b + B_CTRL);
        let mode = (ctrl >> 1) & 7;
        let mut ran = false;
        let mut last_len = 0;
        while let Some((bytes, latch)) = st.in_reqs.pop_front() {
            // A fresh request flushes anything held inside.
            if !st.held.is_empty() {
                let held = core::mem::take(&mut st.held);
                st.out_pending.extend_from_slice(&held);
            }
            if let Some(iv) = latch {
                st.iv = iv;
            }
            let (pad, bs) = cipher_setup(base, ctrl);
            let out = crypt(mode, ctrl & 1 != 0, &pad, bs, &mut st.iv, &bytes);
            self.processed[id] += bytes.len();
            last_len = out.len();
            st.out_pending.extend_from_slice(&out);
            ran = true;
        }
        if ran && self.stall_next[id] && last_len > 0 {
            let cut = st.out_pending.len() - last_len;
            st.held = st.out_pending.split_off(cut);
            self.stall_next[id] = false;
        }
        if ran && mode != 0 {
            for i in 0..4 {
                wr(
                    base,
                    R_IV_OUT + id * 16 + 4 * i,
                    u32::from_le_bytes(st.iv[4 * i..4 * i + 4].try_into().unwrap()),
                );
            }
        }

        // Fill destination descriptors; a descriptor is only written once
        // its whole length is available.
        let mut drained = false;
        while st.out_cnt > 0 {
            let ring_ptr = translate(regions, rd(base, b + B_DST_LST_ADDR), 16 * out_num as usize);
            let d = read_desc(ring_ptr, st.dst_ptr as usize);
            let n = d.len as usize;
            if n > st.out_pending.len() {
                break;
            }
            let dst = translate(regions, d.addr, n);
            unsafe { core::ptr::copy_nonoverlapping(st.out_pending.as_ptr(), dst, n) };
            st.out_pending.drain(..n);
            st.out_cnt -= 1;
            wr(
                base,
                b + B_OUT_FULL_CNT,
                (rd(base, b + B_OUT_FULL_CNT) + 1) & 0xffff,
            );
            st.dst_ptr = (st.dst_ptr + 1) % out_num;
            drained = true;
        }
        if drained && st.out_cnt == 0 {
            events |= 1 << (8 + id);
        }

        if let Some(p) = self.force_src_ptr[id].take() {
            st.src_ptr = p;
        }

        wr(base, b + B_IN_BUF_CNT, st.in_cnt);
        wr(base, b + B_OUT_BUF_CNT, st.out_cnt);
        wr(base, b + B_SRC_LST_PTR, st.src_ptr);
        wr(base, b + B_DST_LST_PTR, st.dst_ptr);
        wr(base, b + B_IN_LEFT, (st.input.len() as u32 / 4) << 24);
        wr(
            base,
            b + B_OUT_LEFT,
            ((st.held.len() + st.out_pending.len()) as u32 / 4) << 24,
        );
        events
    }
}

/******** platform ********/

pub struct SimPlatform {
    sim: Mutex<Sim>,
    fail_dma_map: AtomicBool,
    woke: AtomicBool,
}

impl Platform for SimPlatform {
    fn dma_map(&self, _sg: &[histb_muc::SgEntry], _dir: DmaDirection) -> Result<(), ErrorCode> {
        if self.fail_dma_map.load(Ordering::Relaxed) {
            return Err(ErrorCode::Nomem);
        }
        Ok(())
    }

    fn dma_unmap(&self, _sg: &[histb_muc::SgEntry], _dir: DmaDirection) {}

    fn delay_us(&self, _us: u32) {
        self.sim.lock().unwrap().step();
    }

    fn wake_sweeper(&self) {
        self.woke.store(true, Ordering::Relaxed);
    }
}

impl SimPlatform {
    fn new(sim: Sim) -> SimPlatform {
        SimPlatform {
            sim: Mutex::new(sim),
            fail_dma_map: AtomicBool::new(false),
            woke: AtomicBool::new(false),
        }
    }

    pub fn step(&self) -> bool {
        self.sim.lock().unwrap().step()
    }

    pub fn with_sim<R>(&self, f: impl FnOnce(&mut Sim) -> R) -> R {
        f(&mut self.sim.lock().unwrap())
    }

    pub fn set_fail_dma_map(&self, on: bool) {
        self.fail_dma_map.store(on, Ordering::Relaxed);
    }

    pub fn took_wake(&self) -> bool {
        self.woke.swap(false, Ordering::Relaxed)
    }

    pub fn reg_read(&self, off: usize) -> u32 {
        self.with_sim(|sim| sim.reg_read(off))
    }

    pub fn reg_write(&self, off: usize, v: u32) {
        self.with_sim(|sim| sim.reg_write(off, v))
    }

    /// Copy `data` into a fresh DMA-visible buffer and describe it as a
    /// scatter list; `segs` splits it into segments (empty means one).
    pub fn sg_from(&self, data: &[u8], segs: &[usize]) -> &'static [histb_muc::SgEntry] {
        if data.is_empty() {
            return &[];
        }
        let buf: &'static mut [u8] = Box::leak(data.to_vec().into_boxed_slice());
        let len = buf.len();
        let ptr = buf.as_mut_ptr();
        let dma = self.with_sim(|sim| {
            let dma = sim.alloc_dma(len);
            sim.register_region(dma, ptr, len);
            dma
        });

        let split: Vec<usize> = if segs.is_empty() {
            vec![len]
        } else {
            segs.to_vec()
        };
        assert_eq!(split.iter().sum::<usize>(), len, "segments must cover the buffer");

        let mut entries = Vec::new();
        let mut off = 0usize;
        for &s in &split {
            entries.push(unsafe {
                histb_muc::SgEntry::from_raw(ptr.add(off), dma + off as u32, s)
            });
            off += s;
        }
        Box::leak(entries.into_boxed_slice())
    }
}

/// Read a scatter list's current contents back out.
pub fn sg_contents(sg: &[histb_muc::SgEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in sg {
        out.extend_from_slice(unsafe { core::slice::from_raw_parts(e.ptr(), e.len()) });
    }
    out
}

/******** harness ********/

pub struct Harness {
    pub engine: &'static MutiCipher,
    pub platform: &'static SimPlatform,
    pub blocks: [&'static ChannelDmaBlock; 7],
    pub ring_dma: [u32; 7],
}

pub struct SetupOpts {
    pub present_mask: u8,
    pub config: Config,
    pub slow_len: usize,
    pub fail_reset: bool,
}

impl Default for SetupOpts {
    fn default() -> SetupOpts {
        SetupOpts {
            present_mask: 0xff,
            config: Config::default(),
            slow_len: 256,
            fail_reset: false,
        }
    }
}

/// Build an engine over a fresh device model. Does not probe.
pub fn setup_raw(opts: SetupOpts) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let words: &'static mut [u32] = Box::leak(vec![0u32; REGS_SIZE / 4].into_boxed_slice());
    let base = words.as_mut_ptr();
    let regs = unsafe { StaticRef::new(base as *const MucRegisters) };

    let mut sim = Sim::new(base, opts.present_mask, opts.fail_reset);

    let mut blocks: Vec<&'static ChannelDmaBlock> = Vec::new();
    let mut ring_dma = [0u32; 7];
    let rings: [RingResources; 7] = core::array::from_fn(|i| {
        let block: &'static ChannelDmaBlock = Box::leak(Box::new(ChannelDmaBlock::new()));
        let dma = 0x1000_0000 + 0x1000 * (i as u32 + 1);
        sim.register_region(dma, block as *const ChannelDmaBlock as *mut u8, DMA_BLOCK_SIZE);
        blocks.push(block);
        ring_dma[i] = dma;
        RingResources {
            block,
            dma_addr: dma,
        }
    });

    let slow_buffer: &'static mut [u8] = Box::leak(vec![0u8; opts.slow_len].into_boxed_slice());
    let platform: &'static SimPlatform = Box::leak(Box::new(SimPlatform::new(sim)));
    let engine: &'static MutiCipher = Box::leak(Box::new(
        MutiCipher::new(
            MucResources {
                regs,
                slow_buffer,
                rings,
            },
            platform,
            opts.config,
        )
        .unwrap(),
    ));

    Harness {
        engine,
        platform,
        blocks: blocks.try_into().ok().unwrap(),
        ring_dma,
    }
}

/// Probe and release the self-test hold, leaving every present channel
/// usable.
pub fn setup_opts(opts: SetupOpts) -> Harness {
    let h = setup_raw(opts);
    h.engine.probe().unwrap();
    h.engine.release_held_channels();
    h
}

pub fn setup() -> Harness {
    setup_opts(SetupOpts::default())
}

pub struct TestClient {
    completed: Mutex<Vec<(&'static mut Request, Result<(), ErrorCode>)>>,
}

impl Client for TestClient {
    fn request_done(&self, request: &'static mut Request, result: Result<(), ErrorCode>) {
        self.completed.lock().unwrap().push((request, result));
    }
}

impl TestClient {
    pub fn new() -> &'static TestClient {
        Box::leak(Box::new(TestClient {
            completed: Mutex::new(Vec::new()),
        }))
    }

    pub fn count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn take(&self) -> Option<(&'static mut Request, Result<(), ErrorCode>)> {
        let mut done = self.completed.lock().unwrap();
        if done.is_empty() {
            None
        } else {
            Some(done.remove(0))
        }
    }
}

pub const MAX_ROUNDS: usize = 10_000;

/// Drive sweeper, device and interrupt handler until `want` completions
/// land (or the round budget runs out).
pub fn run_until(h: &Harness, client: &TestClient, want: usize, max_rounds: usize) -> bool {
    for _ in 0..max_rounds {
        if client.count() >= want {
            return true;
        }
        h.engine.sweep(false);
        if h.platform.step() {
            h.engine.handle_interrupt();
        }
    }
    h.engine.sweep(false);
    client.count() >= want
}

pub fn leak_session(alg: Alg, mode: Mode, key: &[u8]) -> &'static CipherSession {
    let mut session = CipherSession::new(alg, mode).unwrap();
    if !key.is_empty() {
        session.set_key(key).unwrap();
    }
    Box::leak(Box::new(session))
}

pub fn leak_request(
    session: &'static CipherSession,
    src: &'static [histb_muc::SgEntry],
    dst: &'static [histb_muc::SgEntry],
    cryptlen: usize,
    iv: [u8; IV_SIZE],
    decrypting: bool,
    client: &'static TestClient,
) -> &'static mut Request {
    Box::leak(Box::new(Request::new(
        session, src, dst, cryptlen, iv, decrypting, client,
    )))
}

/// Submit one request over fresh buffers and run it to completion.
/// Returns the output bytes and the chained IV handed back in the request.
pub fn one_shot(
    h: &Harness,
    session: &'static CipherSession,
    data: &[u8],
    iv: [u8; IV_SIZE],
    decrypting: bool,
) -> Result<(Vec<u8>, [u8; IV_SIZE]), ErrorCode> {
    let client = TestClient::new();
    let src = h.platform.sg_from(data, &[]);
    let dst = h.platform.sg_from(&vec![0u8; data.len()], &[]);
    let req = leak_request(session, src, dst, data.len(), iv, decrypting, client);
    h.engine.submit(req).map_err(|(e, _)| e)?;
    assert!(run_until(h, client, 1, MAX_ROUNDS), "request never completed");
    let (req, result) = client.take().unwrap();
    result?;
    Ok((sg_contents(dst), req.iv))
}

/// Pseudo-random but deterministic payload bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add((i >> 8) as u8 ^ 0x5c))
        .collect()
}
