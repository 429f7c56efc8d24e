use serde::{Deserialize, Serialize};

/// Fixed description of the accelerator's on-chip resources.
///
/// Built once per invocation and passed by reference everywhere; nothing in
/// the mapper mutates it. `lane_width` is the SIMD width, `vec_slots` the
/// vector-register count per one bank of the even/odd pair (so a pair holds
/// `2 * vec_slots` lane-groups), `scalar_slots` the broadcast register count,
/// and `control_store` the number of micro-ops a resident program segment may
/// occupy. The remaining fields describe the banked memory's address geometry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HardwareProfile {
    pub lane_width: u32,
    pub vec_slots: u32,
    pub scalar_slots: u32,
    pub control_store: u32,
    pub cols_per_row: u32,
    pub bank_bits: u32,
    pub row_bits: u32,
    pub col_bits: u32,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        HardwareProfile {
            lane_width: 16,
            vec_slots: 8,
            scalar_slots: 8,
            control_store: 32,
            cols_per_row: 32,
            bank_bits: 1,
            row_bits: 14,
            col_bits: 5,
        }
    }
}

impl HardwareProfile {
    /// Rows addressable before the reserved compute-mode bit is hit.
    pub fn usable_rows(&self) -> u64 {
        1 << (self.row_bits - 1)
    }

    pub fn lane_width(&self) -> usize {
        self.lane_width as usize
    }

    /// Sanity bounds the mappers rely on. Debug-only; the profile is
    /// caller-supplied configuration, not untrusted input.
    pub(crate) fn debug_check(&self) {
        debug_assert!(self.lane_width >= 1);
        debug_assert!(self.vec_slots >= 1);
        debug_assert!(self.scalar_slots >= 1);
        debug_assert!(self.scalar_slots <= self.lane_width);
        debug_assert!(self.cols_per_row >= 1);
        debug_assert!(u64::from(self.cols_per_row) <= 1 << self.col_bits);
        debug_assert!(self.row_bits >= 2);
        debug_assert!(self.bank_bits >= 1);
    }
}
