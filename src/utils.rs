// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::ops::Add;
use std::ops::Div;
use std::ops::Mul;
use std::ops::Sub;

/// Divides `value` by `divisor`, rounding up.
pub fn div_round_up<T>(value: T, divisor: T) -> T
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Div<Output = T> + From<u8>,
{
    (value + divisor - T::from(1)) / divisor
}

/// Rounds `value` up to the next multiple of `alignment`.
pub fn align_up<T>(value: T, alignment: T) -> T
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Div<Output = T> + Mul<Output = T> + From<u8>,
{
    div_round_up(value, alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(div_round_up(1920u32, 64), 30);
        assert_eq!(div_round_up(1080u32, 64), 17);
        assert_eq!(div_round_up(0u32, 64), 0);
        assert_eq!(align_up(2048usize, 4096), 4096);
        assert_eq!(align_up(4096usize, 4096), 4096);
        assert_eq!(align_up(1081u32, 8), 1088);
    }
}
