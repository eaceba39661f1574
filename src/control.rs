// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Cipher sessions, requests, and control-word encoding.
//!
//! A [`CipherSession`] captures everything that outlives a single request:
//! algorithm, chaining mode, and key material. A [`Request`] borrows a
//! session and adds the per-operation scatter lists, length, IV and
//! direction. Completion is reported through the request's [`Client`].

use tock_registers::fields::FieldValue;

use crate::dma::{zeroize, SgCursor, SgEntry};
use crate::error::ErrorCode;
use crate::registers::{Ctrl, IV_SIZE, KEY_SIZE, SLOW_CHAN};

/// Block ciphers the engine implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alg {
    Des,
    Des3Ede,
    Aes,
}

impl Alg {
    pub const fn block_size(self) -> usize {
        match self {
            Alg::Des | Alg::Des3Ede => 8,
            Alg::Aes => 16,
        }
    }

    const fn encode(self) -> FieldValue<u32, Ctrl::Register> {
        match self {
            Alg::Des => Ctrl::ALG::Des,
            Alg::Des3Ede => Ctrl::ALG::Des3Ede,
            Alg::Aes => Ctrl::ALG::Aes,
        }
    }
}

/// Chaining modes. CTR is AES-only; the engine would silently run
/// DES/3DES counter mode as ECB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Ecb,
    Cbc,
    Cfb,
    Ofb,
    Ctr,
}

impl Mode {
    /// Stream modes accept any request length; the tail is padded out to
    /// a chunk multiple and the excess output discarded.
    pub const fn is_stream(self) -> bool {
        matches!(self, Mode::Cfb | Mode::Ofb | Mode::Ctr)
    }

    pub const fn uses_iv(self) -> bool {
        !matches!(self, Mode::Ecb)
    }

    const fn encode(self) -> FieldValue<u32, Ctrl::Register> {
        match self {
            Mode::Ecb => Ctrl::MODE::Ecb,
            Mode::Cbc => Ctrl::MODE::Cbc,
            Mode::Cfb => Ctrl::MODE::Cfb,
            Mode::Ofb => Ctrl::MODE::Ofb,
            Mode::Ctr => Ctrl::MODE::Ctr,
        }
    }
}

/// KEY field codes per (algorithm, key length). The code disambiguates
/// key width inside one algorithm.
fn key_code(alg: Alg, keylen: usize) -> Option<u32> {
    match (alg, keylen) {
        (Alg::Aes, 16) => Some(0),
        (Alg::Aes, 24) => Some(1),
        (Alg::Aes, 32) => Some(2),
        (Alg::Des, 8) => Some(0),
        (Alg::Des3Ede, 24) => Some(0),
        (Alg::Des3Ede, 16) => Some(3),
        _ => None,
    }
}

// A half is degenerate when all four bytes agree once parity bits are
// dropped.
fn des_half_is_weak(half: &[u8]) -> bool {
    for i in 1..4 {
        if (half[i] ^ half[0]) >> 1 != 0 {
            return false;
        }
    }
    true
}

fn des_key_is_weak(key: &[u8]) -> bool {
    des_half_is_weak(&key[..4]) || des_half_is_weak(&key[4..8])
}

/// Long-lived cipher configuration plus key material.
///
/// A session without a key set takes its key from the machine key ladder
/// instead of the per-channel key bank.
pub struct CipherSession {
    alg: Alg,
    mode: Mode,
    key: [u8; KEY_SIZE],
    keysize: usize,
    key_field: u32,
}

impl CipherSession {
    pub fn new(alg: Alg, mode: Mode) -> Result<CipherSession, ErrorCode> {
        if mode == Mode::Ctr && alg != Alg::Aes {
            return Err(ErrorCode::Nosupport);
        }
        Ok(CipherSession {
            alg,
            mode,
            key: [0; KEY_SIZE],
            keysize: 0,
            key_field: 0,
        })
    }

    /// Install key material. Validates length per algorithm and rejects
    /// DES keys whose halves degenerate.
    pub fn set_key(&mut self, key: &[u8]) -> Result<(), ErrorCode> {
        if key.len() > KEY_SIZE {
            return Err(ErrorCode::Size);
        }
        let code = key_code(self.alg, key.len()).ok_or(ErrorCode::Inval)?;
        if self.alg == Alg::Des && des_key_is_weak(key) {
            return Err(ErrorCode::Inval);
        }

        zeroize(&mut self.key);
        self.key[..key.len()].copy_from_slice(key);
        self.keysize = key.len();
        self.key_field = code;
        Ok(())
    }

    /// Drop any installed key and source the key from the machine key
    /// ladder.
    pub fn use_key_ladder(&mut self) {
        zeroize(&mut self.key);
        self.keysize = 0;
        self.key_field = 0;
    }

    pub fn alg(&self) -> Alg {
        self.alg
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// One hardware pass processes this many bytes at a time.
    pub fn chunk_size(&self) -> usize {
        self.alg.block_size()
    }

    pub fn iv_size(&self) -> usize {
        if self.mode.uses_iv() {
            self.alg.block_size()
        } else {
            0
        }
    }

    pub(crate) fn key_from_ladder(&self) -> bool {
        self.keysize == 0
    }

    /// Key words for the channel key bank, little-endian packed.
    pub(crate) fn key_words(&self) -> impl Iterator<Item = u32> + '_ {
        self.key[..self.keysize].chunks(4).map(|c| {
            let mut bytes = [0u8; 4];
            bytes[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(bytes)
        })
    }

    /// Control-word fields for channel `id`. Every field the session owns
    /// is asserted or cleared explicitly so a read-modify-write leaves
    /// only the weight (and other unowned bits) as the hardware had them.
    pub(crate) fn ctrl_fields(
        &self,
        id: usize,
        decrypting: bool,
    ) -> FieldValue<u32, Ctrl::Register> {
        let mut fields = self.mode.encode()
            + self.alg.encode()
            + Ctrl::WIDTH::Block
            + if decrypting {
                Ctrl::DECRYPT::SET
            } else {
                Ctrl::DECRYPT::CLEAR
            };

        // The slow channel latches its IV from the IV-input registers;
        // the flag is dropped again after the first chunk.
        if id == SLOW_CHAN && self.mode.uses_iv() {
            fields += Ctrl::CHAN0_IV_SET::SET;
        } else {
            fields += Ctrl::CHAN0_IV_SET::CLEAR;
        }

        fields += Ctrl::KEY.val(self.key_field);
        if self.key_from_ladder() {
            fields += Ctrl::KEY_FROM_MKL::SET;
        } else {
            fields += Ctrl::KEY_FROM_MKL::CLEAR + Ctrl::KEY_ID.val(id as u32);
        }
        fields
    }
}

impl Drop for CipherSession {
    fn drop(&mut self) {
        zeroize(&mut self.key);
    }
}

/// Completion callback for submitted requests.
///
/// Called from the sweeper context with the request handed back; the
/// request may be reused or freed from inside the callback.
pub trait Client: Sync {
    fn request_done(&self, request: &'static mut Request, result: Result<(), ErrorCode>);
}

/// Per-channel progress of an active request.
#[derive(Clone, Copy)]
pub(crate) enum ReqState {
    Inactive,
    /// Slow channel: bytes fed to the data-input registers so far.
    Slow { offset: usize },
    /// Ring channel: resumable cursors over both scatter lists.
    Ring {
        /// Request length padded up to a chunk multiple.
        runlen: usize,
        /// All source descriptors emitted; only output drain remains.
        eof: bool,
        src: SgCursor,
        dst: SgCursor,
    },
}

/// One cipher operation over scatter lists.
///
/// The engine takes the request by `&'static mut` and owns it until it
/// comes back through [`Client::request_done`].
pub struct Request {
    pub(crate) session: &'static CipherSession,
    pub(crate) src: &'static [SgEntry],
    pub(crate) dst: &'static [SgEntry],
    pub(crate) cryptlen: usize,
    /// Chaining IV; updated in place on completion so back-to-back
    /// requests chain like one long stream.
    pub iv: [u8; IV_SIZE],
    pub(crate) decrypting: bool,
    pub(crate) client: &'static dyn Client,
    pub(crate) state: ReqState,
}

impl Request {
    pub fn new(
        session: &'static CipherSession,
        src: &'static [SgEntry],
        dst: &'static [SgEntry],
        cryptlen: usize,
        iv: [u8; IV_SIZE],
        decrypting: bool,
        client: &'static dyn Client,
    ) -> Request {
        Request {
            session,
            src,
            dst,
            cryptlen,
            iv,
            decrypting,
            client,
            state: ReqState::Inactive,
        }
    }

    pub fn session(&self) -> &'static CipherSession {
        self.session
    }

    pub fn cryptlen(&self) -> usize {
        self.cryptlen
    }

    /// Source and destination share memory; skip the separate output map.
    pub(crate) fn in_place(&self) -> bool {
        !self.src.is_empty()
            && !self.dst.is_empty()
            && core::ptr::eq(self.src[0].ptr(), self.dst[0].ptr())
    }

    /// Request length padded up to the session's chunk size.
    pub(crate) fn runlen(&self) -> usize {
        let chunk = self.session.chunk_size();
        (self.cryptlen + chunk - 1) / chunk * chunk
    }
}
