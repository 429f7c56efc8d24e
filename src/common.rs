use half::f16;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Display;
use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;

/// The values moved by one register-file load or store.
///
/// Always padded to the profile's lane width before it reaches a stream.
pub type LaneGroup = SmallVec<[f16; 16]>;

/// One half of the even/odd bank pair the compute units sit between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Bank {
    Even,
    Odd,
}

impl Bank {
    /// The bank a lane-group lands in under the alternating split.
    pub fn of_group(group: u64) -> Bank {
        if group % 2 == 0 {
            Bank::Even
        } else {
            Bank::Odd
        }
    }

    pub fn selector(self) -> u64 {
        match self {
            Bank::Even => 0,
            Bank::Odd => 1,
        }
    }

    pub fn from_selector(bit: u64) -> Bank {
        if bit == 0 {
            Bank::Even
        } else {
            Bank::Odd
        }
    }
}

impl Display for Bank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bank::Even => write!(f, "EVEN_BANK"),
            Bank::Odd => write!(f, "ODD_BANK"),
        }
    }
}

#[macro_export]
macro_rules! dimsize {
    ($n:expr) => {{
        let d: $crate::common::DimSize = core::num::NonZeroU32::new($n).unwrap();
        d
    }};
}
