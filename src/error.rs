// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Standard error enum for engine operations.

/// Errors surfaced by the engine, either synchronously from submission or
/// through a request's completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorCode {
    /// Generic failure condition; also covers detected hardware/software
    /// disagreement (ring desync), which fails the request loudly rather
    /// than returning partially-processed output.
    Fail = 0,
    /// No channel currently free; retry later.
    Busy = 1,
    /// An invalid parameter was passed.
    Inval = 2,
    /// Parameter passed was too large.
    Size = 3,
    /// Memory required not available (DMA mapping failure).
    Nomem = 4,
    /// Operation or combination is unsupported.
    Nosupport = 5,
    /// Device absent or not brought up.
    Nodevice = 6,
}

impl From<ErrorCode> for usize {
    fn from(err: ErrorCode) -> usize {
        err as usize
    }
}
