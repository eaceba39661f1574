// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Device bring-up and teardown.
//!
//! Channel availability is probed indirectly: the interrupt-enable bits
//! of fused-off channels do not latch, so writing all enables and reading
//! the register back reveals which channels exist on this part.

use core::sync::atomic::{fence, Ordering};

use tock_registers::interfaces::{Readable, Writeable};

use crate::engine::MutiCipher;
use crate::error::ErrorCode;
use crate::registers::{
    int_in_buf, int_out_buf, Int, RstStatus, CHAN_COUNT, INT_CHAN0_DATA_DISPOSE, RING_CHAN_MIN,
    SLOW_CHAN,
};
use crate::utilities::poll::PollTimeout;

/// State-valid poll: every 20ms, up to one second.
const RESET_POLL: PollTimeout = PollTimeout::new(20_000, 1_000_000);

impl MutiCipher {
    /// Bring the device up and decide which channels to use.
    ///
    /// On success the engine starts accepting requests, with every usable
    /// channel except the highest-numbered one held busy so that external
    /// self-tests all land on a single channel; call
    /// [`MutiCipher::release_held_channels`] once those tests pass.
    pub fn probe(&self) -> Result<(), ErrorCode> {
        let regs = self.regs;
        let platform = self.platform;

        platform.assert_reset();
        platform.enable_clocks();
        platform.deassert_reset();

        let up = RESET_POLL.wait_for(
            |us| platform.delay_us(us),
            || regs.rst_status.is_set(RstStatus::STATE_VALID).then_some(()),
        );
        if up.is_err() {
            log::error!("cannot bring up device");
            self.power_down();
            return Err(ErrorCode::Nodevice);
        }

        regs.int_raw.set(!0);

        // Route all channels; must precede enabling interrupts.
        let mut sec = regs.sec_chan_cfg.get();
        for id in 0..CHAN_COUNT {
            sec |= 1 << id;
        }
        regs.sec_chan_cfg.set(sec);

        let mut cfg = regs.int_cfg.get();
        for id in RING_CHAN_MIN..CHAN_COUNT {
            cfg |= int_in_buf(id) | int_out_buf(id);
        }
        cfg |= INT_CHAN0_DATA_DISPOSE;
        cfg |= (Int::SEC_EN::SET + Int::NSEC_EN::SET).value;
        regs.int_cfg.set(cfg);

        // Read the enables back; fused-off channels did not latch theirs.
        // Give the latches a moment to settle first.
        platform.delay_us(10);
        let disable_mask = self.config.disabled_mask();
        let cfg = regs.int_cfg.get();
        let mut status = [0u8; CHAN_COUNT];
        let mut chan_mask: u8 = 0;
        for id in 0..CHAN_COUNT {
            let int_ok = cfg & int_out_buf(id) != 0;
            let enabled = disable_mask & (1 << id) == 0;
            status[id] = if int_ok && enabled {
                chan_mask |= 1 << id;
                b'y'
            } else if int_ok {
                b'#'
            } else if enabled {
                b'n'
            } else {
                b'!'
            };
        }

        log::info!(
            "channel status: {}",
            core::str::from_utf8(&status).unwrap_or("?")
        );
        if chan_mask == 0 {
            log::error!("cannot enable any channels");
            self.power_down();
            return Err(ErrorCode::Nodevice);
        }

        let no_dma = chan_mask == 1 << SLOW_CHAN;
        if no_dma && disable_mask == 0 {
            log::error!("only slow channel available, refuse to start");
            self.power_down();
            return Err(ErrorCode::Inval);
        }
        self.no_dma.store(no_dma, Ordering::Relaxed);

        regs.src_smmu_bypass.set(regs.src_smmu_bypass.get() & !0xff);
        regs.dst_smmu_bypass.set(regs.dst_smmu_bypass.get() & !0xff);

        for chan in self.chans.iter() {
            if chan_mask & (1 << chan.id()) == 0 {
                chan.disable();
            } else if let Err(e) = chan.check_ring_reset() {
                self.power_down();
                return Err(e);
            }
        }

        // Funnel external self-tests onto one channel so ring bugs show
        // up under pressure instead of hiding behind channel spread.
        let mut hold_mask = chan_mask;
        if hold_mask & (hold_mask - 1) == 0 || self.config.extra_check() {
            hold_mask = 0;
        } else {
            hold_mask &= !(1u8 << (7 - hold_mask.leading_zeros()));
            for chan in self.chans.iter() {
                if hold_mask & (1 << chan.id()) != 0 {
                    chan.hold();
                }
            }
        }
        self.held_mask.store(hold_mask, Ordering::Relaxed);

        fence(Ordering::SeqCst);
        self.accepting.store(true, Ordering::Release);
        Ok(())
    }

    /// Release the channels [`MutiCipher::probe`] held busy.
    pub fn release_held_channels(&self) {
        let mask = self.held_mask.swap(0, Ordering::Relaxed);
        for chan in self.chans.iter() {
            if mask & (1 << chan.id()) != 0 {
                chan.release_held();
            }
        }
    }

    /// Stop accepting requests and power the block down.
    ///
    /// The embedder must stop calling `sweep` and `handle_interrupt`
    /// (and drain in-flight requests) before calling this.
    pub fn remove(&self) {
        self.accepting.store(false, Ordering::Release);
        self.power_down();
    }

    fn power_down(&self) {
        self.platform.disable_clocks();
        self.platform.assert_reset();
    }
}
