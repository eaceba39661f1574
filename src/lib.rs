// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Driver for the HiSilicon STB AdvCA MutiCipher engine.
//!
//! The MutiCipher block implements AES/DES/3DES in the common chaining
//! modes across eight hardware channels: channel 0 is driven chunk by
//! chunk through data registers, channels 1..7 through paired DMA
//! descriptor rings. This crate owns the register-level state machines
//! and channel arbitration; the embedder provides memory, DMA mapping,
//! delays and power control through the [`Platform`] trait and drives
//! execution by calling [`MutiCipher::handle_interrupt`] from its
//! interrupt context and [`MutiCipher::sweep`] from a worker context.
//!
//! Typical setup:
//!
//! ```ignore
//! let engine = MutiCipher::new(resources, platform, Config::default())?;
//! engine.probe()?;
//! // run cipher self-tests here
//! engine.release_held_channels();
//!
//! let mut session = CipherSession::new(Alg::Aes, Mode::Cbc)?;
//! session.set_key(&key)?;
//! engine.submit(request)?;
//! // Client::request_done fires from a later sweep()
//! ```

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod config;
pub mod control;
pub mod descriptor;
pub mod dma;
pub mod error;
pub mod registers;
pub mod utilities;

mod channel;
mod device;
mod engine;

pub use crate::config::Config;
pub use crate::control::{Alg, CipherSession, Client, Mode, Request};
pub use crate::dma::{ChannelDmaBlock, DmaDirection, Platform, SgEntry};
pub use crate::engine::{MucResources, MutiCipher, RingResources};
pub use crate::error::ErrorCode;
