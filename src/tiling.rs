//! Loop and peeling arithmetic shared by every kernel mapper.
//!
//! Each mapper supplies a [CapacityModel] describing its control-store cost
//! and register caps; the engine picks the tiling strategy and the segment
//! size. Keeping this in one place is deliberate: the mappers themselves
//! contain no division or remainder over work units.

use crate::profile::HardwareProfile;

use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Strategy {
    /// Control store is ample; the register files bound the segment.
    RowLimited,
    /// Control store binds; the segment is derived from its capacity.
    ColumnLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub loop_count: u64,
    pub peeling: u64,
}

/// Full tiles plus remainder. `loop_count * cap + peeling == work` always.
pub fn tile(work: u64, cap: u64) -> TilePlan {
    debug_assert!(cap > 0);
    TilePlan {
        loop_count: work / cap,
        peeling: work % cap,
    }
}

/// Per-kernel capacity inputs to strategy selection.
///
/// `row_entries` is the control-store footprint of one full row-limited tile
/// including its loop and terminator entries. `column_segment` is the largest
/// segment the control store admits, before clipping to `column_clip` (the
/// register-file bound). `min_entries` is the footprint of a single-unit
/// segment and drives the infeasibility report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityModel {
    pub row_entries: u64,
    pub row_cap: u64,
    pub column_segment: u64,
    pub column_clip: u64,
    pub min_entries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub strategy: Strategy,
    pub cap: u64,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("kernel needs at least {required} control-store entries but the profile provides {capacity}")]
pub struct InfeasibleError {
    pub required: u64,
    pub capacity: u64,
}

/// Choose between the two tiling strategies for one kernel invocation.
pub fn select_strategy(
    profile: &HardwareProfile,
    model: &CapacityModel,
) -> Result<Selection, InfeasibleError> {
    let capacity = u64::from(profile.control_store);
    let selection = if capacity >= model.row_entries {
        Selection {
            strategy: Strategy::RowLimited,
            cap: model.row_cap,
        }
    } else {
        let cap = model.column_segment.min(model.column_clip);
        if cap == 0 {
            return Err(InfeasibleError {
                required: model.min_entries,
                capacity,
            });
        }
        Selection {
            strategy: Strategy::ColumnLimited,
            cap,
        }
    };
    debug!(
        "strategy {:?} with segment {} (control store {}, row tile needs {})",
        selection.strategy, selection.cap, capacity, model.row_entries
    );
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use super::Strategy;

    fn model(row_entries: u64) -> CapacityModel {
        CapacityModel {
            row_entries,
            row_cap: 4,
            column_segment: 3,
            column_clip: 4,
            min_entries: 5,
        }
    }

    #[test]
    fn test_tile_exact_fit() {
        assert_eq!(
            tile(8, 4),
            TilePlan {
                loop_count: 2,
                peeling: 0
            }
        );
    }

    #[test]
    fn test_tile_with_remainder() {
        assert_eq!(
            tile(5, 3),
            TilePlan {
                loop_count: 1,
                peeling: 2
            }
        );
    }

    #[test]
    fn test_tile_smaller_than_cap_is_peel_only() {
        assert_eq!(
            tile(3, 8),
            TilePlan {
                loop_count: 0,
                peeling: 3
            }
        );
    }

    #[test]
    fn test_strategy_flips_on_one_unit_of_control_store() {
        let mut profile = HardwareProfile::default();
        profile.control_store = 10;
        let row = select_strategy(&profile, &model(10)).unwrap();
        assert_eq!(row.strategy, Strategy::RowLimited);
        assert_eq!(row.cap, 4);

        profile.control_store = 9;
        let col = select_strategy(&profile, &model(10)).unwrap();
        assert_eq!(col.strategy, Strategy::ColumnLimited);
        assert_eq!(col.cap, 3);
    }

    #[test]
    fn test_column_segment_is_clipped_to_register_bound() {
        let mut profile = HardwareProfile::default();
        profile.control_store = 9;
        let m = CapacityModel {
            column_segment: 9,
            column_clip: 4,
            ..model(100)
        };
        assert_eq!(select_strategy(&profile, &m).unwrap().cap, 4);
    }

    #[test]
    fn test_zero_column_segment_is_infeasible() {
        let mut profile = HardwareProfile::default();
        profile.control_store = 4;
        let m = CapacityModel {
            column_segment: 0,
            ..model(100)
        };
        assert_eq!(
            select_strategy(&profile, &m),
            Err(InfeasibleError {
                required: 5,
                capacity: 4
            })
        );
    }

    proptest! {
        #[test]
        fn test_tiling_completeness(work in 0u64..10_000, cap in 1u64..64) {
            let plan = tile(work, cap);
            prop_assert_eq!(plan.loop_count * cap + plan.peeling, work);
            prop_assert!(plan.peeling < cap);
        }

        #[test]
        fn test_strategy_is_a_pure_threshold(c in 1u32..64, row_entries in 1u64..64) {
            let mut profile = HardwareProfile::default();
            profile.control_store = c;
            let m = model(row_entries);
            let got = select_strategy(&profile, &m).unwrap();
            if u64::from(c) >= row_entries {
                prop_assert_eq!(got.strategy, Strategy::RowLimited);
            } else {
                prop_assert_eq!(got.strategy, Strategy::ColumnLimited);
            }
        }
    }
}
