//! Dot-product reduction with a live accumulator slot.
//!
//! Operand A streams through the even bank into vector slots; operand B is
//! consumed directly by `MAC` from the odd bank. One slot of the odd-bank
//! register file holds the running sum for the whole row, so a full tile
//! covers one element fewer than the register pair.

use crate::addressing::Cursor;
use crate::arith::dot_prefix;
use crate::codegen::{Emitter, MappingPlan};
use crate::common::{Bank, LaneGroup};
use crate::inst::{Inst, Reg};
use crate::tiling::{select_strategy, tile, CapacityModel, InfeasibleError};

use half::f16;
use ndarray::Array2;
use smallvec::smallvec;

pub(super) fn lower(
    em: &mut Emitter,
    sets: u64,
    len: u64,
    lhs: &Array2<f16>,
    rhs: &Array2<f16>,
) -> Result<MappingPlan, InfeasibleError> {
    let profile = em.profile();
    let lanes = u64::from(profile.lane_width);
    let r = u64::from(profile.vec_slots);
    let cols = profile.cols_per_row;

    // Two micro-ops per element; accumulator init, writeback, loop and
    // terminator are the fixed overhead.
    let selection = select_strategy(
        profile,
        &CapacityModel {
            row_entries: 2 * (2 * r - 1) + 4,
            row_cap: 2 * r - 1,
            column_segment: u64::from(profile.control_store.saturating_sub(4)) / 2,
            column_clip: 2 * r,
            min_entries: 6,
        },
    )?;
    let cap = selection.cap;
    debug_assert!(cap <= 2 * r - 1);
    let tiles = tile(len, cap);

    let groups = divrem::DivCeil::div_ceil(sets, lanes);
    let zero = Cursor::from_linear(groups * len + groups, cols);
    let plan = MappingPlan {
        strategy: selection.strategy,
        segment: cap,
        loop_count: tiles.loop_count,
        peeling: tiles.peeling,
        operand_a: Cursor::from_linear(0, cols),
        operand_b: Cursor::from_linear(0, cols),
        result: Cursor::from_linear(groups * len, cols),
        zero_fill: Some(zero),
        bias: None,
    };

    let acc = Reg::VecB(profile.vec_slots - 1);
    let slot = |i: u64| {
        if i < r {
            Reg::VecA(i as u32)
        } else {
            Reg::VecB((i - r) as u32)
        }
    };
    let lane_group = |src: &Array2<f16>, vg: u64, element: u64| -> LaneGroup {
        (0..lanes)
            .map(|lane| {
                let v = vg * lanes + lane;
                if v < sets {
                    src[[v as usize, element as usize]]
                } else {
                    f16::ZERO
                }
            })
            .collect()
    };
    let prefix_group = |vg: u64, upto: u64| -> LaneGroup {
        (0..lanes)
            .map(|lane| {
                let v = vg * lanes + lane;
                if v < sets {
                    let v = v as usize;
                    dot_prefix(&lhs.row(v).to_vec(), &rhs.row(v).to_vec(), upto as usize)
                } else {
                    f16::ZERO
                }
            })
            .collect()
    };

    for vg in 0..groups {
        if vg > 0 {
            em.push(Inst::Exec);
        }
        em.mem(true, Bank::Even, zero, smallvec![], |src| Inst::Load {
            dst: acc,
            src,
        });

        let emit_element = |em: &mut Emitter, element: u64, within: u64, materialize: bool| {
            em.mem(
                materialize,
                Bank::Even,
                plan.operand_a.offset(vg * len + element, cols),
                lane_group(lhs, vg, element),
                |src| Inst::Load {
                    dst: slot(within),
                    src,
                },
            );
            em.mem(
                materialize,
                Bank::Odd,
                plan.operand_b.offset(vg * len + element, cols),
                lane_group(rhs, vg, element),
                |rhs_ref| Inst::Mac {
                    acc,
                    lhs: slot(within),
                    rhs: rhs_ref,
                },
            );
        };

        for k in 0..tiles.loop_count {
            for i in 0..cap {
                emit_element(em, k * cap + i, i, k == 0);
            }
        }
        if tiles.loop_count > 1 {
            em.push(Inst::Jump {
                block_len: (2 * cap) as u32,
                repeats: tiles.loop_count - 1,
            });
        }

        let result_cursor = plan.result.offset(vg, cols);
        if tiles.peeling > 0 && tiles.loop_count > 0 {
            // The partial sum crosses the segment boundary through memory;
            // its value is the half-precision checkpoint the next segment
            // consumes.
            let checkpoint = prefix_group(vg, tiles.loop_count * cap);
            em.mem(true, Bank::Even, result_cursor, checkpoint.clone(), |dst| {
                Inst::Store { dst, src: acc }
            });
            em.push(Inst::Exec);
            em.mem(true, Bank::Even, result_cursor, checkpoint, |src| Inst::Load {
                dst: acc,
                src,
            });
        }
        for i in 0..tiles.peeling {
            emit_element(em, tiles.loop_count * cap + i, i, true);
        }

        em.mem(true, Bank::Even, result_cursor, prefix_group(vg, len), |dst| {
            Inst::Store { dst, src: acc }
        });
    }
    em.push(Inst::Exit);

    Ok(plan)
}
