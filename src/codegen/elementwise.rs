//! Element-wise addition across the even/odd bank pair.
//!
//! Lane-groups alternate banks by global index; a full tile loads one
//! segment of operand A into each bank's register file, adds operand B
//! straight from the banks, and stores both sums past the operand regions.

use crate::addressing::Cursor;
use crate::arith::add_groups;
use crate::codegen::{Emitter, MappingPlan};
use crate::common::{Bank, LaneGroup};
use crate::inst::{Inst, Reg};
use crate::spec::Traversal;
use crate::tiling::{select_strategy, tile, CapacityModel, InfeasibleError};

use half::f16;
use ndarray::Array2;

pub(super) fn lower(
    em: &mut Emitter,
    sets: u64,
    len: u64,
    traversal: Traversal,
    lhs: &Array2<f16>,
    rhs: &Array2<f16>,
) -> Result<MappingPlan, InfeasibleError> {
    let profile = em.profile();
    let lanes = u64::from(profile.lane_width);
    let pair_slots = 2 * u64::from(profile.vec_slots);
    let cols = profile.cols_per_row;

    let work = match traversal {
        Traversal::RowWise => divrem::DivCeil::div_ceil(sets * len, lanes),
        Traversal::ColumnWise => divrem::DivCeil::div_ceil(sets, lanes) * len,
    };

    // Three micro-ops per lane-group plus the loop and terminator entries.
    // The control-store segment is rounded down to even so a repeated block
    // sees the same bank interleave on every iteration.
    let column_segment = {
        let seg = profile.control_store.saturating_sub(2) as u64 / 3;
        if seg >= 2 {
            seg - seg % 2
        } else {
            seg
        }
    };
    let selection = select_strategy(
        profile,
        &CapacityModel {
            row_entries: 3 * pair_slots + 2,
            row_cap: pair_slots,
            column_segment,
            column_clip: pair_slots,
            min_entries: 5,
        },
    )?;
    let cap = selection.cap;
    let tiles = tile(work, cap);

    // Per-bank region spans; the odd bank's halves may be one group short.
    let half_span = divrem::DivCeil::div_ceil(work, 2);
    let plan = MappingPlan {
        strategy: selection.strategy,
        segment: cap,
        loop_count: tiles.loop_count,
        peeling: tiles.peeling,
        operand_a: Cursor::from_linear(0, cols),
        operand_b: Cursor::from_linear(half_span, cols),
        result: Cursor::from_linear(2 * half_span, cols),
        zero_fill: None,
        bias: None,
    };

    let group_cursor = |base: Cursor, group: u64| base.offset(group / 2, cols);
    let values = |src: &Array2<f16>, group: u64| group_values(src, group, sets, len, lanes, traversal);

    let emit_block = |em: &mut Emitter, base: u64, count: u64, materialize: bool| {
        let evens: Vec<u64> = (base..base + count)
            .filter(|&g| Bank::of_group(g) == Bank::Even)
            .collect();
        let odds: Vec<u64> = (base..base + count)
            .filter(|&g| Bank::of_group(g) == Bank::Odd)
            .collect();
        for (slot, &g) in evens.iter().enumerate() {
            em.mem(
                materialize,
                Bank::Even,
                group_cursor(plan.operand_a, g),
                values(lhs, g),
                |src| Inst::Load {
                    dst: Reg::VecA(slot as u32),
                    src,
                },
            );
        }
        for (slot, &g) in odds.iter().enumerate() {
            em.mem(
                materialize,
                Bank::Odd,
                group_cursor(plan.operand_a, g),
                values(lhs, g),
                |src| Inst::Load {
                    dst: Reg::VecB(slot as u32),
                    src,
                },
            );
        }
        for (slot, &g) in evens.iter().enumerate() {
            em.mem(
                materialize,
                Bank::Even,
                group_cursor(plan.operand_b, g),
                values(rhs, g),
                |rhs_ref| Inst::Add {
                    dst: Reg::VecA(slot as u32),
                    lhs: Reg::VecA(slot as u32),
                    rhs: rhs_ref,
                },
            );
        }
        for (slot, &g) in odds.iter().enumerate() {
            em.mem(
                materialize,
                Bank::Odd,
                group_cursor(plan.operand_b, g),
                values(rhs, g),
                |rhs_ref| Inst::Add {
                    dst: Reg::VecB(slot as u32),
                    lhs: Reg::VecB(slot as u32),
                    rhs: rhs_ref,
                },
            );
        }
        for (slot, &g) in evens.iter().enumerate() {
            em.mem(
                materialize,
                Bank::Even,
                group_cursor(plan.result, g),
                add_groups(&values(lhs, g), &values(rhs, g)),
                |dst| Inst::Store {
                    dst,
                    src: Reg::VecA(slot as u32),
                },
            );
        }
        for (slot, &g) in odds.iter().enumerate() {
            em.mem(
                materialize,
                Bank::Odd,
                group_cursor(plan.result, g),
                add_groups(&values(lhs, g), &values(rhs, g)),
                |dst| Inst::Store {
                    dst,
                    src: Reg::VecB(slot as u32),
                },
            );
        }
    };

    // A single-group segment alternates banks from tile to tile, so it
    // cannot share a template block.
    let compressible = cap % 2 == 0;
    for k in 0..tiles.loop_count {
        emit_block(em, k * cap, cap, !compressible || k == 0);
    }
    if compressible && tiles.loop_count > 1 {
        em.push(Inst::Jump {
            block_len: (3 * cap) as u32,
            repeats: tiles.loop_count - 1,
        });
    }
    if tiles.peeling > 0 {
        if tiles.loop_count > 0 {
            em.push(Inst::Exec);
        }
        emit_block(em, tiles.loop_count * cap, tiles.peeling, true);
    }
    em.push(Inst::Exit);

    Ok(plan)
}

fn group_values(
    src: &Array2<f16>,
    group: u64,
    sets: u64,
    len: u64,
    lanes: u64,
    traversal: Traversal,
) -> LaneGroup {
    match traversal {
        Traversal::RowWise => (0..lanes)
            .map(|lane| {
                let flat = group * lanes + lane;
                let v = flat / len;
                let j = flat % len;
                if v < sets {
                    src[[v as usize, j as usize]]
                } else {
                    f16::ZERO
                }
            })
            .collect(),
        Traversal::ColumnWise => {
            let per_position = divrem::DivCeil::div_ceil(sets, lanes);
            let j = group / per_position;
            let vg = group % per_position;
            (0..lanes)
                .map(|lane| {
                    let v = vg * lanes + lane;
                    if v < sets {
                        src[[v as usize, j as usize]]
                    } else {
                        f16::ZERO
                    }
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::tests_support::{lowered, seq_array};
    use crate::common::DimSize;
    use crate::profile::HardwareProfile;
    use crate::spec::{Kernel, KernelOperands};
    use crate::tiling::Strategy;
    use proptest::prelude::*;

    fn profile() -> HardwareProfile {
        HardwareProfile {
            lane_width: 4,
            vec_slots: 2,
            scalar_slots: 4,
            control_store: 32,
            cols_per_row: 32,
            bank_bits: 1,
            row_bits: 14,
            col_bits: 5,
        }
    }

    fn run(
        sets: u32,
        len: u32,
        traversal: Traversal,
        profile: &HardwareProfile,
    ) -> crate::codegen::Lowering {
        let kernel = Kernel::ElementwiseAdd {
            sets: DimSize::new(sets).unwrap(),
            len: DimSize::new(len).unwrap(),
            traversal,
        };
        let operands = KernelOperands::Elementwise {
            lhs: seq_array(sets as usize, len as usize, 0.0),
            rhs: seq_array(sets as usize, len as usize, 1.0),
        };
        lowered(kernel, operands, profile)
    }

    #[test]
    fn test_row_limited_exact_fit() {
        // 32 elements in lane-groups of 4 tile as two full register pairs.
        let lowering = run(4, 8, Traversal::RowWise, &profile());
        let plan = &lowering.plan;
        assert_eq!(plan.strategy, Strategy::RowLimited);
        assert_eq!(plan.segment, 4);
        assert_eq!(plan.loop_count, 2);
        assert_eq!(plan.peeling, 0);

        // Template block of 12 micro-ops, one repeat directive, exit.
        let program = &lowering.streams.program;
        assert_eq!(program.len(), 14);
        assert_eq!(
            program[12],
            Inst::Jump {
                block_len: 12,
                repeats: 1
            }
        );
        assert_eq!(program[13], Inst::Exit);

        // Both iterations appear in the trace.
        assert_eq!(lowering.streams.addresses.len(), 24);
    }

    #[test]
    fn test_even_bank_sees_four_reads_before_its_first_store() {
        let p = profile();
        let lowering = run(4, 8, Traversal::RowWise, &p);
        let tags = lowering.streams.bank_tags(&p);
        let first_store = 8; // two loads and two adds per bank precede it
        let even_reads = tags[..first_store]
            .iter()
            .filter(|&&b| b == Bank::Even)
            .count();
        assert_eq!(even_reads, 4);
        assert!(matches!(
            lowering.streams.program[first_store],
            Inst::Store { .. }
        ));
    }

    #[test]
    fn test_result_region_is_clear_of_operands() {
        let p = profile();
        let lowering = run(4, 8, Traversal::RowWise, &p);
        // 8 groups split 4/4; operand B begins at column 4, results at 8.
        assert_eq!(lowering.plan.operand_b.linear(p.cols_per_row), 4);
        assert_eq!(lowering.plan.result.linear(p.cols_per_row), 8);
        let result_base = lowering.plan.result.linear(p.cols_per_row);
        let linear =
            |addr: u64| p.decode_row(addr) * u64::from(p.cols_per_row) + p.decode_col(addr);
        // Each 12-op tile trace ends with four stores.
        for tile in 0..2 {
            for op in 0..12 {
                let position = linear(lowering.streams.addresses[tile * 12 + op]);
                if op < 8 {
                    assert!(position < result_base);
                } else {
                    assert!(position >= result_base);
                }
            }
        }
    }

    #[test]
    fn test_data_stream_carries_operands_then_sums() {
        let p = profile();
        let lowering = run(1, 4, Traversal::RowWise, &p);
        // Single group: load, add, store.
        let data = &lowering.streams.data;
        assert_eq!(data.len(), 3);
        let lhs: Vec<f32> = data[0].iter().map(|v| v.to_f32()).collect();
        let rhs: Vec<f32> = data[1].iter().map(|v| v.to_f32()).collect();
        let sum: Vec<f32> = data[2].iter().map(|v| v.to_f32()).collect();
        assert_eq!(lhs, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(rhs, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(sum, vec![1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_column_wise_traversal_groups_vectors_per_position() {
        let p = profile();
        let lowering = run(2, 3, Traversal::ColumnWise, &p);
        // One vector group per shared position: three work units.
        assert_eq!(lowering.plan.loop_count * lowering.plan.segment + lowering.plan.peeling, 3);
        let first: Vec<f32> = lowering.streams.data[0]
            .iter()
            .map(|v| v.to_f32())
            .collect();
        // Lanes carry the two vectors' position-zero values, zero padded.
        assert_eq!(first, vec![0.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_column_limited_strategy_rounds_segment_even() {
        let p = HardwareProfile {
            control_store: 13,
            ..profile()
        };
        // A row tile needs 14 entries; 13 forces the column path, and
        // (13-2)/3 = 3 rounds down to 2.
        let lowering = run(4, 8, Traversal::RowWise, &p);
        assert_eq!(lowering.plan.strategy, Strategy::ColumnLimited);
        assert_eq!(lowering.plan.segment, 2);
        assert_eq!(lowering.plan.loop_count, 4);
        assert_eq!(lowering.plan.peeling, 0);
    }

    #[test]
    fn test_single_group_segment_disables_compression() {
        let p = HardwareProfile {
            control_store: 5,
            ..profile()
        };
        let lowering = run(2, 4, Traversal::RowWise, &p);
        assert_eq!(lowering.plan.segment, 1);
        assert!(!lowering
            .streams
            .program
            .iter()
            .any(|i| matches!(i, Inst::Jump { .. })));
        // Two lane-groups, three ops each, one exit.
        assert_eq!(lowering.streams.program.len(), 7);
    }

    #[test]
    fn test_odd_peel_leaves_final_group_single_bank() {
        let p = profile();
        // 20 elements over lanes of 4 give 5 groups: one full tile of 4
        // plus a lone remainder group.
        let lowering = run(5, 4, Traversal::RowWise, &p);
        assert_eq!(lowering.plan.loop_count, 1);
        assert_eq!(lowering.plan.peeling, 1);
        let tags = lowering.streams.bank_tags(&p);
        let peel_tags = &tags[tags.len() - 3..];
        assert!(peel_tags.iter().all(|&b| b == Bank::Even));
    }

    proptest! {
        // The acknowledged asymmetry: an odd remainder never splits evenly,
        // and the unpaired final lane-group always lands in the even bank.
        #[test]
        fn test_odd_peeling_asymmetry_is_even_bank_biased(
            sets in 1u32..8,
            len in 1u32..16,
        ) {
            let p = profile();
            let lowering = run(sets, len, Traversal::RowWise, &p);
            let plan = &lowering.plan;
            if plan.peeling % 2 == 1 {
                let tags = lowering.streams.bank_tags(&p);
                let peel_ops = (plan.peeling * 3) as usize;
                let peel = &tags[tags.len() - peel_ops..];
                let evens = peel.iter().filter(|&&b| b == Bank::Even).count();
                let odds = peel.len() - evens;
                prop_assert_eq!(evens, odds + 3);
            }
        }

        #[test]
        fn test_tiling_accounts_for_every_group(
            sets in 1u32..8,
            len in 1u32..16,
            control_store in 5u32..40,
        ) {
            let p = HardwareProfile { control_store, ..profile() };
            let lowering = run(sets, len, Traversal::RowWise, &p);
            let plan = &lowering.plan;
            let work = divrem::DivCeil::div_ceil(u64::from(sets) * u64::from(len), 4);
            prop_assert_eq!(plan.loop_count * plan.segment + plan.peeling, work);
            // Every group is loaded, added and stored exactly once.
            prop_assert_eq!(lowering.streams.addresses.len() as u64, 3 * work);
        }
    }
}
