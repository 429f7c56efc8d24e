//! Half-precision arithmetic in the accelerator's accumulation order.
//!
//! The compute units round after every multiply and after every add, and the
//! reduction kernels consume taps strictly left to right. Checkpoint values
//! injected into the data stream are produced here, so this module is both
//! the test oracle and part of the emission path.

use crate::common::LaneGroup;

use half::f16;
use itertools::izip;

/// Fold multiply-accumulate pairs into `init`, rounding at every step.
pub fn accumulate(init: f16, pairs: impl IntoIterator<Item = (f16, f16)>) -> f16 {
    pairs.into_iter().fold(init, |acc, (a, b)| acc + a * b)
}

/// The running reduction over the first `upto` element pairs.
pub fn dot_prefix(lhs: &[f16], rhs: &[f16], upto: usize) -> f16 {
    accumulate(
        f16::ZERO,
        lhs[..upto].iter().copied().zip(rhs[..upto].iter().copied()),
    )
}

/// Lane-by-lane sum of two groups.
pub fn add_groups(lhs: &LaneGroup, rhs: &LaneGroup) -> LaneGroup {
    debug_assert_eq!(lhs.len(), rhs.len());
    izip!(lhs, rhs).map(|(&a, &b)| a + b).collect()
}
