// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Bounded register polling.
//!
//! Hardware bring-up needs "poll this status bit until it rises, give up
//! after a deadline" in several places. [`PollTimeout`] packages the poll
//! interval and deadline so callers pass a condition closure and a sleep
//! primitive and get a typed timeout back.

/// The polled condition did not hold before the deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutError;

/// A poll interval / deadline pair, both in microseconds.
#[derive(Clone, Copy, Debug)]
pub struct PollTimeout {
    pub interval_us: u32,
    pub max_wait_us: u32,
}

impl PollTimeout {
    pub const fn new(interval_us: u32, max_wait_us: u32) -> PollTimeout {
        PollTimeout {
            interval_us,
            max_wait_us,
        }
    }

    /// Poll `condition` until it returns `Some`, sleeping `interval_us`
    /// between attempts via `sleep`. The condition is always evaluated at
    /// least once, and once more after the deadline elapses.
    pub fn wait_for<T>(
        &self,
        mut sleep: impl FnMut(u32),
        mut condition: impl FnMut() -> Option<T>,
    ) -> Result<T, TimeoutError> {
        let mut waited: u32 = 0;
        loop {
            if let Some(v) = condition() {
                return Ok(v);
            }
            if waited >= self.max_wait_us {
                return Err(TimeoutError);
            }
            sleep(self.interval_us);
            waited = waited.saturating_add(self.interval_us.max(1));
        }
    }
}
