//! Packed-address encoding for the banked memory.
//!
//! Addresses pack column, bank and row fields above six reserved low-order
//! bits. The row field's own most-significant bit is the hardware's
//! compute-mode flag and must stay clear in every emitted address; setting it
//! is a reportable condition, not a panic.

use crate::common::Bank;
use crate::profile::HardwareProfile;

use serde::{Deserialize, Serialize};

pub const RESERVED_LOW_BITS: u32 = 6;

/// A structured, collectible address diagnostic.
///
/// Emission continues with the offending field masked to its declared width;
/// callers decide whether the collected violations abort the run.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressViolation {
    #[error("column {value} exceeds the {width}-bit column field")]
    ColumnOverflow { value: u64, width: u32 },
    #[error("row {value} exceeds the {width}-bit row field")]
    RowOverflow { value: u64, width: u32 },
    #[error("row {value} sets the reserved compute-mode bit")]
    RowModeBit { value: u64 },
}

impl HardwareProfile {
    fn col_shift(&self) -> u32 {
        RESERVED_LOW_BITS
    }

    fn bank_shift(&self) -> u32 {
        RESERVED_LOW_BITS + self.col_bits
    }

    fn row_shift(&self) -> u32 {
        RESERVED_LOW_BITS + self.col_bits + self.bank_bits
    }

    fn check(&self, row: u64, col: u64) -> Option<AddressViolation> {
        if col >= 1 << self.col_bits {
            return Some(AddressViolation::ColumnOverflow {
                value: col,
                width: self.col_bits,
            });
        }
        if row >= 1 << self.row_bits {
            return Some(AddressViolation::RowOverflow {
                value: row,
                width: self.row_bits,
            });
        }
        if row & (1 << (self.row_bits - 1)) != 0 {
            return Some(AddressViolation::RowModeBit { value: row });
        }
        None
    }

    fn pack(&self, bank: Bank, row: u64, col: u64) -> u64 {
        (col << self.col_shift()) | (bank.selector() << self.bank_shift()) | (row << self.row_shift())
    }

    /// Pack (bank, row, column) into a 64-bit address.
    pub fn encode(&self, bank: Bank, row: u64, col: u64) -> Result<u64, AddressViolation> {
        match self.check(row, col) {
            Some(violation) => Err(violation),
            None => Ok(self.pack(bank, row, col)),
        }
    }

    /// Like [HardwareProfile::encode], but masks out-of-range fields and
    /// records the violation instead of failing.
    pub fn encode_lossy(
        &self,
        bank: Bank,
        row: u64,
        col: u64,
        violations: &mut Vec<AddressViolation>,
    ) -> u64 {
        if let Some(violation) = self.check(row, col) {
            violations.push(violation);
        }
        let col = col & ((1 << self.col_bits) - 1);
        // Masking the row also clears the compute-mode bit.
        let row = row & ((1 << (self.row_bits - 1)) - 1);
        self.pack(bank, row, col)
    }

    pub fn decode_bank(&self, addr: u64) -> Bank {
        Bank::from_selector((addr >> self.bank_shift()) & ((1 << self.bank_bits) - 1))
    }

    pub fn decode_row(&self, addr: u64) -> u64 {
        (addr >> self.row_shift()) & ((1 << self.row_bits) - 1)
    }

    pub fn decode_col(&self, addr: u64) -> u64 {
        (addr >> self.col_shift()) & ((1 << self.col_bits) - 1)
    }
}

/// Position inside one bank's region layout.
///
/// Advanced only through the pure functions below; mappers thread cursors
/// explicitly rather than sharing mutable position state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Cursor {
    pub row: u64,
    pub col: u64,
}

impl Cursor {
    pub fn from_linear(index: u64, cols_per_row: u32) -> Cursor {
        let cols = u64::from(cols_per_row);
        Cursor {
            row: index / cols,
            col: index % cols,
        }
    }

    pub fn linear(&self, cols_per_row: u32) -> u64 {
        self.row * u64::from(cols_per_row) + self.col
    }

    /// One column forward, wrapping into the next row.
    pub fn advance(self, cols_per_row: u32) -> Cursor {
        if self.col + 1 < u64::from(cols_per_row) {
            Cursor {
                row: self.row,
                col: self.col + 1,
            }
        } else {
            Cursor {
                row: self.row + 1,
                col: 0,
            }
        }
    }

    pub fn offset(self, delta: u64, cols_per_row: u32) -> Cursor {
        Cursor::from_linear(self.linear(cols_per_row) + delta, cols_per_row)
    }
}
