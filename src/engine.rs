// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! The MutiCipher engine: channel allocation, the interrupt top half, and
//! the sweeper pass.
//!
//! Execution model: `submit` claims an idle channel and parks the
//! prepared request on it; every round after that is driven by
//! [`MutiCipher::sweep`], which the embedder calls from a worker context
//! whenever [`Platform::wake_sweeper`] fires (and periodically on a
//! timeout, to recover from lost interrupts). The interrupt handler only
//! clears hardware status and dirty flags, with one exception: slow
//! channel rounds are short enough that feeding the next chunk straight
//! from the handler roughly doubles throughput.

use core::sync::atomic::{fence, AtomicBool, AtomicU8, Ordering};

use tock_registers::interfaces::{Readable, Writeable};

use crate::channel::{Channel, PushOutcome};
use crate::config::Config;
use crate::control::Request;
use crate::dma::{ChannelDmaBlock, Platform};
use crate::error::ErrorCode;
use crate::registers::{
    MucRegisters, CHAN_COUNT, INT_CHAN0_DATA_DISPOSE, RING_CHAN_MIN, SLOW_CHAN,
};
use crate::utilities::StaticRef;

/// DMA-visible working memory for one ring channel.
pub struct RingResources {
    pub block: &'static ChannelDmaBlock,
    /// Device address of `block`.
    pub dma_addr: u32,
}

/// Everything the embedder allocates for the engine.
pub struct MucResources {
    pub regs: StaticRef<MucRegisters>,
    /// Flat ping-pong buffer for the slow channel; power-of-two length,
    /// at least one cipher block.
    pub slow_buffer: &'static mut [u8],
    /// Ring memory for channels 1..7.
    pub rings: [RingResources; CHAN_COUNT - 1],
}

pub struct MutiCipher {
    pub(crate) regs: StaticRef<MucRegisters>,
    pub(crate) platform: &'static dyn Platform,
    pub(crate) config: Config,
    pub(crate) chans: [Channel; CHAN_COUNT],
    /// Set by `probe`, cleared by `remove`.
    pub(crate) accepting: AtomicBool,
    /// No usable ring channels; everything goes through the slow channel.
    pub(crate) no_dma: AtomicBool,
    /// Channels held busy for the external self-test window.
    pub(crate) held_mask: AtomicU8,
}

// The register file is only touched through volatile accesses and every
// mutable engine state is atomic or guarded by the channel slot protocol.
unsafe impl Sync for MutiCipher {}
unsafe impl Send for MutiCipher {}

impl MutiCipher {
    pub fn new(
        resources: MucResources,
        platform: &'static dyn Platform,
        config: Config,
    ) -> Result<MutiCipher, ErrorCode> {
        let MucResources {
            regs,
            slow_buffer,
            rings,
        } = resources;
        let [r1, r2, r3, r4, r5, r6, r7] = rings;

        let chans = [
            Channel::new_slow(0, regs, slow_buffer)?,
            Channel::new_ring(1, regs, r1.block, r1.dma_addr),
            Channel::new_ring(2, regs, r2.block, r2.dma_addr),
            Channel::new_ring(3, regs, r3.block, r3.dma_addr),
            Channel::new_ring(4, regs, r4.block, r4.dma_addr),
            Channel::new_ring(5, regs, r5.block, r5.dma_addr),
            Channel::new_ring(6, regs, r6.block, r6.dma_addr),
            Channel::new_ring(7, regs, r7.block, r7.dma_addr),
        ];

        Ok(MutiCipher {
            regs,
            platform,
            config,
            chans,
            accepting: AtomicBool::new(false),
            no_dma: AtomicBool::new(false),
            held_mask: AtomicU8::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Queue a request. On success the request is owned by the engine
    /// until it comes back through [`crate::Client::request_done`] from a
    /// `sweep` call; on failure it is handed straight back.
    ///
    /// A zero-length request completes synchronously: the completion
    /// callback runs before `submit` returns.
    pub fn submit(
        &self,
        req: &'static mut Request,
    ) -> Result<(), (ErrorCode, &'static mut Request)> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err((ErrorCode::Nodevice, req));
        }

        let session = req.session();
        if !session.mode().is_stream() && req.cryptlen() % session.chunk_size() != 0 {
            return Err((ErrorCode::Inval, req));
        }

        if req.cryptlen() == 0 {
            let client = req.client;
            client.request_done(req, Ok(()));
            return Ok(());
        }

        // Short requests are cheaper on the register-driven channel than
        // on a DMA ring.
        let start = if self.no_dma.load(Ordering::Relaxed)
            || req.cryptlen() <= self.config.small_request()
        {
            SLOW_CHAN
        } else {
            RING_CHAN_MIN
        };

        for chan in self.chans[start..].iter() {
            if !chan.try_claim() {
                continue;
            }

            if let Err(e) = chan.prepare(req, self.platform) {
                chan.release_idle();
                log::debug!("{}: returned {:?}", chan.id(), e);
                return Err((e, req));
            }

            // Let the sweeper make the first push so submit never races
            // the hardware.
            let id = chan.id();
            chan.park_ready(req);
            log::debug!("{}: prepared", id);
            self.platform.wake_sweeper();
            return Ok(());
        }

        Err((ErrorCode::Busy, req))
    }

    /// Interrupt top half. Returns whether the device raised the
    /// interrupt (shared-line style).
    pub fn handle_interrupt(&self) -> bool {
        let status = self.regs.int_status.get();
        if status == 0 {
            return false;
        }
        self.regs.int_raw.set(status);

        let mask = (status | (status >> CHAN_COUNT)) & 0xff;
        for (id, chan) in self.chans.iter().enumerate() {
            if mask & (1 << id) != 0 {
                chan.clear_dirty();
            }
        }
        fence(Ordering::SeqCst);

        // Feed the slow channel without a trip through the sweeper.
        if status == INT_CHAN0_DATA_DISPOSE {
            let chan = &self.chans[SLOW_CHAN];
            if let Some(req) = chan.take_for_processing() {
                let outcome = chan.push(req, self.platform, &self.config);
                // Be ready for the next interrupt.
                chan.park_ready(req);
                if outcome == PushOutcome::InProgress {
                    chan.emit();
                    return true;
                }
            }
        }

        self.platform.wake_sweeper();
        true
    }

    /// One sweeper pass over all channels: push every parked request
    /// forward and complete finished ones. Returns the mask of channels
    /// that made progress; with `timed_out` set, progress found without a
    /// preceding wake is reported as a lost interrupt.
    pub fn sweep(&self, timed_out: bool) -> u8 {
        let mut mask: u8 = 0;

        for (id, chan) in self.chans.iter().enumerate() {
            let req = match chan.take_for_processing() {
                Some(req) => req,
                None => continue,
            };

            match chan.push(req, self.platform, &self.config) {
                PushOutcome::Busy => {
                    chan.park_ready(req);
                }
                PushOutcome::InProgress => {
                    mask |= 1 << id;
                    chan.park_ready(req);
                    chan.emit();
                    log::debug!("{}: pushed", id);
                }
                PushOutcome::Done => {
                    mask |= 1 << id;
                    log::debug!("{}: done", id);
                    chan.unprepare(req, self.platform, false);
                    let client = req.client;
                    chan.release_idle();
                    client.request_done(req, Ok(()));
                }
                PushOutcome::Fault(e) => {
                    mask |= 1 << id;
                    log::error!("channel {} failed with {:?}", id, e);
                    chan.unprepare(req, self.platform, true);
                    let client = req.client;
                    chan.release_idle();
                    client.request_done(req, Err(e));
                }
            }
        }

        if mask != 0 && timed_out {
            log::info!("interrupt gone on channel mask {:x}", mask);
        }
        mask
    }
}
