// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Engine tuning knobs.
//!
//! The knobs stay runtime-tunable but are owned by the engine instance
//! rather than living in ambient global state.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Default boundary between "short" requests (slow-channel candidates) and
/// ring-channel requests, in bytes.
pub const DEFAULT_SMALL_REQUEST: usize = 256;

pub struct Config {
    /// Add register-readback assertions on the ring push path.
    extra_check: AtomicBool,
    /// Requests of at most this many bytes prefer the slow channel.
    small_request: AtomicUsize,
    /// Channels excluded by the administrator regardless of hardware
    /// capability; bit per channel index.
    disabled_mask: AtomicU8,
}

impl Config {
    pub const fn new(extra_check: bool, small_request: usize, disabled_mask: u8) -> Config {
        Config {
            extra_check: AtomicBool::new(extra_check),
            small_request: AtomicUsize::new(small_request),
            disabled_mask: AtomicU8::new(disabled_mask),
        }
    }

    pub const fn default() -> Config {
        Config::new(false, DEFAULT_SMALL_REQUEST, 0)
    }

    pub fn extra_check(&self) -> bool {
        self.extra_check.load(Ordering::Relaxed)
    }

    pub fn set_extra_check(&self, on: bool) {
        self.extra_check.store(on, Ordering::Relaxed);
    }

    pub fn small_request(&self) -> usize {
        self.small_request.load(Ordering::Relaxed)
    }

    pub fn set_small_request(&self, bytes: usize) {
        self.small_request.store(bytes, Ordering::Relaxed);
    }

    pub fn disabled_mask(&self) -> u8 {
        self.disabled_mask.load(Ordering::Relaxed)
    }
}
