//! Matrix multiply with broadcast reuse of operand A.
//!
//! Each output row's slice of A sits in the scalar register file while B
//! streams through the odd bank in output-column batches. Partial sums live
//! in the result region and are read back, extended and stored once per
//! shared-dimension tile.

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
    m: u64,
    n: u64,
    q: u64,
    lhs: &Array2<f16>,
    rhs: &Array2<f16>,
) -> Result<MappingPlan, InfeasibleError> {
    let profile = em.profile();
    let lanes = u64::from(profile.lane_width);
    let cols = profile.cols_per_row;

    // Partial read, one multiply-accumulate per scalar slot, partial write,
    // then the loop and terminator entries.
    let selection = select_strategy(
        profile,
        &CapacityModel {
            row_entries: u64::from(profile.scalar_slots) + 4,
            row_cap: u64::from(profile.scalar_slots),
            column_segment: u64::from(profile.control_store.saturating_sub(4)),
            column_clip: u64::from(profile.scalar_slots),
            min_entries: 5,
        },
    )?;
    let cap = selection.cap;
    let tiles = tile(n, cap);
    let tiles_total = tiles.loop_count + u64::from(tiles.peeling > 0);
    let batches = divrem::DivCeil::div_ceil(q, lanes);

    let zero = Cursor::from_linear(m * tiles_total + m * batches, cols);
    let plan = MappingPlan {
        strategy: selection.strategy,
        segment: cap,
        loop_count: tiles.loop_count,
        peeling: tiles.peeling,
        operand_a: Cursor::from_linear(0, cols),
        operand_b: Cursor::from_linear(0, cols),
        result: Cursor::from_linear(m * tiles_total, cols),
        zero_fill: Some(zero),
        bias: None,
    };

    let a_slice = |i: u64, k0: u64, seg: u64| -> LaneGroup {
        (0..seg).map(|x| lhs[[i as usize, (k0 + x) as usize]]).collect()
    };
    let b_group = |k: u64, batch: u64| -> LaneGroup {
        (0..lanes)
            .map(|lane| {
                let j = batch * lanes + lane;
                if j < q {
                    rhs[[k as usize, j as usize]]
                } else {
                    f16::ZERO
                }
            })
            .collect()
    };
    let partial = |i: u64, batch: u64, upto: u64| -> LaneGroup {
        (0..lanes)
            .map(|lane| {
                let j = batch * lanes + lane;
                if j < q {
                    dot_prefix(
                        &lhs.row(i as usize).to_vec(),
                        &rhs.column(j as usize).to_vec(),
                        upto as usize,
                    )
                } else {
                    f16::ZERO
                }
            })
            .collect()
    };

    let mut first_segment = true;
    for i in 0..m {
        for t in 0..tiles_total {
            if !first_segment {
                em.push(Inst::Exec);
            }
            first_segment = false;

            let seg = if t < tiles.loop_count {
                cap
            } else {
                tiles.peeling
            };
            let k0 = t * cap;
            em.mem(
                true,
                Bank::Even,
                plan.operand_a.offset(i * tiles_total + t, cols),
                a_slice(i, k0, seg),
                |src| Inst::Wrf { src },
            );

            for batch in 0..batches {
                let materialize = batch == 0;
                let result_cursor = plan.result.offset(i * batches + batch, cols);
                if t == 0 {
                    em.mem(materialize, Bank::Even, zero, smallvec![], |src| Inst::Load {
                        dst: Reg::VecA(0),
                        src,
                    });
                } else {
                    em.mem(
                        materialize,
                        Bank::Even,
                        result_cursor,
                        partial(i, batch, k0),
                        |src| Inst::Load {
                            dst: Reg::VecA(0),
                            src,
                        },
                    );
                }
                for x in 0..seg {
                    em.mem(
                        materialize,
                        Bank::Odd,
                        plan.operand_b.offset((k0 + x) * batches + batch, cols),
                        b_group(k0 + x, batch),
                        |rhs_ref| Inst::Mad {
                            acc: Reg::VecA(0),
                            scalar: Reg::Scalar(x as u32),
                            rhs: rhs_ref,
                        },
                    );
                }
                em.mem(
                    materialize,
                    Bank::Even,
                    result_cursor,
                    partial(i, batch, k0 + seg),
                    |dst| Inst::Store {
                        dst,
                        src: Reg::VecA(0),
                    },
                );
            }
            if batches > 1 {
                em.push(Inst::Jump {
                    block_len: (seg + 2) as u32,
                    repeats: batches - 1,
                });
            }
        }
    }
    em.push(Inst::Exit);

    Ok(plan)
}
