// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! MutiCipher register map.
//!
//! The engine exposes one global bank plus eight per-channel banks at a
//! 0x80 stride starting at offset 0x1000. Channel 0 is the register-only
//! ("slow") channel and overlays its bank with IV-input and data-input
//! word registers instead of the ring-buffer bookkeeping the other seven
//! channels carry; [`MucRegisters::chan0_bank`] exposes that overlay.
//!
//! Counter registers (`*_BUF_NUM`, `*_BUF_CNT`, `*_EMPTY_CNT`,
//! `*_FULL_CNT`, `*_LST_PTR`) are 16 bits wide in hardware; they are
//! declared as `u32` here and masked with [`BUF_NUM_MAX`] by users.

use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

/// Total number of hardware channels, including the slow channel.
pub const CHAN_COUNT: usize = 8;
/// The register-only channel without DMA support.
pub const SLOW_CHAN: usize = 0;
/// First channel with DMA ring-buffer support.
pub const RING_CHAN_MIN: usize = 1;

pub const IV_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

/// Maximum value of the 16-bit ring counters.
pub const BUF_NUM_MAX: u32 = 0xffff;

register_structs! {
    pub MucRegisters {
        /// Slow-channel output data words.
        (0x000 => pub chan0_data_out: [ReadOnly<u32>; 4]),
        /// Per-channel IV readback banks, 4 words each.
        (0x010 => pub iv_out: [ReadWrite<u32>; 32]),
        /// Per-channel key banks, 8 words each.
        (0x090 => pub key: [ReadWrite<u32>; 64]),
        (0x190 => _reserved0),
        /// Secure-channel routing; one bit per channel.
        (0x824 => pub sec_chan_cfg: ReadWrite<u32>),
        (0x828 => _reserved1),
        (0x1000 => pub chan: [ChannelBank; 8]),
        (0x1400 => pub int_status: ReadOnly<u32, Int::Register>),
        (0x1404 => pub int_cfg: ReadWrite<u32, Int::Register>),
        (0x1408 => pub int_raw: ReadWrite<u32, Int::Register>),
        (0x140c => pub rst_status: ReadOnly<u32, RstStatus::Register>),
        (0x1410 => pub chan0_cfg: ReadWrite<u32, Chan0Cfg::Register>),
        (0x1414 => _reserved2),
        (0x1418 => pub src_smmu_bypass: ReadWrite<u32>),
        (0x141c => pub dst_smmu_bypass: ReadWrite<u32>),
        (0x1420 => @END),
    },

    /// Ring-buffer channel bank (channels 1..7).
    pub ChannelBank {
        /// Source ring slot count.
        (0x00 => pub in_buf_num: ReadWrite<u32>),
        /// Available source descriptors; write to increase.
        (0x04 => pub in_buf_cnt: ReadWrite<u32>),
        /// Consumed source descriptors; write to decrease.
        (0x08 => pub in_empty_cnt: ReadWrite<u32>),
        /// Source interrupt threshold.
        (0x0c => pub int_in_cnt_cfg: ReadWrite<u32>),
        (0x10 => pub ctrl: ReadWrite<u32, Ctrl::Register>),
        (0x14 => pub src_lst_addr: ReadWrite<u32>),
        (0x18 => pub in_age_timer: ReadWrite<u32>),
        (0x1c => pub in_age_cnt: ReadWrite<u32>),
        /// Hardware read pointer into the source ring.
        (0x20 => pub src_lst_ptr: ReadOnly<u32>),
        (0x24 => pub src_addr: ReadOnly<u32>),
        (0x28 => pub src_length: ReadOnly<u32>),
        /// Pending input words; top byte is the word count.
        (0x2c => pub in_left: ReadWrite<u32>),
        (0x30 => pub in_left_word: [ReadOnly<u32>; 3]),
        /// Destination ring slot count.
        (0x3c => pub out_buf_num: ReadWrite<u32>),
        /// Available destination descriptors; write to increase.
        (0x40 => pub out_buf_cnt: ReadWrite<u32>),
        /// Filled destination descriptors; write to decrease.
        (0x44 => pub out_full_cnt: ReadWrite<u32>),
        /// Destination interrupt threshold.
        (0x48 => pub int_out_cnt_cfg: ReadWrite<u32>),
        (0x4c => pub dst_lst_addr: ReadWrite<u32>),
        (0x50 => pub out_age_timer: ReadWrite<u32>),
        (0x54 => pub out_age_cnt: ReadWrite<u32>),
        /// Hardware read pointer into the destination ring.
        (0x58 => pub dst_lst_ptr: ReadOnly<u32>),
        (0x5c => pub dst_addr: ReadOnly<u32>),
        (0x60 => pub dst_length: ReadOnly<u32>),
        /// Pending output words; top byte is the word count.
        (0x64 => pub out_left: ReadWrite<u32>),
        (0x68 => pub out_left_word: [ReadOnly<u32>; 3]),
        (0x74 => _reserved0),
        (0x80 => @END),
    },

    /// Channel-0 overlay of the bank at offset 0x1000.
    pub Chan0Bank {
        (0x00 => pub ctrl: ReadWrite<u32, Ctrl::Register>),
        (0x04 => pub iv_in: [ReadWrite<u32>; 4]),
        (0x14 => pub data_in: [ReadWrite<u32>; 4]),
        (0x24 => _reserved0),
        (0x80 => @END),
    }
}

impl MucRegisters {
    /// The channel-0 view of the first channel bank.
    ///
    /// The overlay aliases `chan[0]`; both views go through volatile
    /// accesses only.
    pub fn chan0_bank(&self) -> &Chan0Bank {
        unsafe { &*(&self.chan[0] as *const ChannelBank as *const Chan0Bank) }
    }

    /// IV readback words for channel `id`.
    pub fn iv_out_bank(&self, id: usize) -> &[ReadWrite<u32>] {
        &self.iv_out[id * 4..id * 4 + 4]
    }

    /// Key bank words for channel `id`.
    pub fn key_bank(&self, id: usize) -> &[ReadWrite<u32>] {
        &self.key[id * 8..id * 8 + 8]
    }
}

register_bitfields![u32,
    pub Ctrl [
        DECRYPT OFFSET(0) NUMBITS(1) [],
        MODE OFFSET(1) NUMBITS(3) [
            Ecb = 0,
            Cbc = 1,
            Cfb = 2,
            Ofb = 3,
            Ctr = 4
        ],
        ALG OFFSET(4) NUMBITS(2) [
            Des = 0,
            Des3Ede = 1,
            Aes = 2
        ],
        WIDTH OFFSET(6) NUMBITS(2) [
            Block = 0,
            EightBit = 1,
            OneBit = 2
        ],
        /// Latch the IV-input registers on the next slow-channel block.
        CHAN0_IV_SET OFFSET(8) NUMBITS(1) [],
        KEY OFFSET(9) NUMBITS(2) [],
        /// Key comes from the machine key ladder, not the key bank.
        KEY_FROM_MKL OFFSET(13) NUMBITS(1) [],
        /// Which key bank to use; ignored with KEY_FROM_MKL.
        KEY_ID OFFSET(14) NUMBITS(3) [],
        WEIGHT OFFSET(22) NUMBITS(10) []
    ],

    pub Int [
        IN_BUF OFFSET(0) NUMBITS(8) [],
        /// Bit 8 doubles as the channel-0 "data disposed" signal.
        OUT_BUF OFFSET(8) NUMBITS(8) [],
        SEC_EN OFFSET(30) NUMBITS(1) [],
        NSEC_EN OFFSET(31) NUMBITS(1) []
    ],

    pub RstStatus [
        STATE_VALID OFFSET(0) NUMBITS(1) []
    ],

    pub Chan0Cfg [
        START OFFSET(0) NUMBITS(1) [],
        BUSY OFFSET(1) NUMBITS(1) []
    ],
];

/// Raw interrupt-status bit for channel `id`'s source ring.
pub const fn int_in_buf(id: usize) -> u32 {
    1 << id
}

/// Raw interrupt-status bit for channel `id`'s destination ring, or the
/// channel-0 disposal signal for `id == 0`.
pub const fn int_out_buf(id: usize) -> u32 {
    1 << (CHAN_COUNT + id)
}

pub const INT_CHAN0_DATA_DISPOSE: u32 = int_out_buf(SLOW_CHAN);
