// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Utility types shared across the driver.

pub mod poll;

mod static_ref;
pub use self::static_ref::StaticRef;
