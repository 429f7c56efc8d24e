//! Convolution as a tap reduction with channel-wise weight reuse.
//!
//! Filter taps are flattened in (channel, row, col) order and tiled through
//! the scalar register file exactly like the matmul's shared dimension.
//! Output pixels stream in lane-width batches against gathered activation
//! columns; windows whose base falls outside the clipped input extent read
//! device-side zero. Bias enters once, as the first tap batch's incoming
//! partial.

use crate::addressing::Cursor;
use crate::arith::accumulate;
use crate::codegen::{Emitter, MappingPlan};
use crate::common::{Bank, LaneGroup};
use crate::inst::{Inst, Reg};
use crate::spec::ConvShape;
use crate::tiling::{select_strategy, tile, CapacityModel, InfeasibleError};

use half::f16;
use ndarray::{Array1, Array3, Array4};
use smallvec::smallvec;

/// A tap's position within one filter, in reduction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tap {
    channel: u64,
    row: u64,
    col: u64,
}

fn tap_at(shape: &ConvShape, index: u64) -> Tap {
    let k = u64::from(shape.kernel.get());
    Tap {
        channel: index / (k * k),
        row: (index / k) % k,
        col: index % k,
    }
}

pub(super) fn lower(
    em: &mut Emitter,
    shape: &ConvShape,
    activations: &Array3<f16>,
    weights: &Array4<f16>,
    bias: &Array1<f16>,
) -> Result<MappingPlan, InfeasibleError> {
    let profile = em.profile();
    let lanes = u64::from(profile.lane_width);
    let cols = profile.cols_per_row;

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
    let taps = shape.taps();
    let tiles = tile(taps, cap);
    let tiles_total = tiles.loop_count + u64::from(tiles.peeling > 0);
    let batches = divrem::DivCeil::div_ceil(shape.out_pixels(), lanes);
    let out_channels = u64::from(shape.out_channels.get());

    let bias_base = Cursor::from_linear(out_channels * tiles_total, cols);
    let plan = MappingPlan {
        strategy: selection.strategy,
        segment: cap,
        loop_count: tiles.loop_count,
        peeling: tiles.peeling,
        operand_a: Cursor::from_linear(0, cols),
        operand_b: Cursor::from_linear(0, cols),
        result: Cursor::from_linear(out_channels * tiles_total + out_channels, cols),
        zero_fill: None,
        bias: Some(bias_base),
    };

    let stride = u64::from(shape.stride.get());
    let k = u64::from(shape.kernel.get());
    let (hi, wi) = (
        u64::from(shape.height.get()),
        u64::from(shape.width.get()),
    );
    let (ho, wo) = (
        u64::from(shape.out_height.get()),
        u64::from(shape.out_width.get()),
    );

    // The window base must keep the whole filter inside the input; beyond
    // that the hardware would read garbage, so those lanes carry zero.
    let act_value = |tap: Tap, pixel: u64| -> f16 {
        if pixel >= ho * wo {
            return f16::ZERO;
        }
        let iy = (pixel / wo) * stride + tap.row;
        let ix = (pixel % wo) * stride + tap.col;
        if iy + (k - 1 - tap.row) < hi && ix + (k - 1 - tap.col) < wi {
            activations[[tap.channel as usize, iy as usize, ix as usize]]
        } else {
            f16::ZERO
        }
    };
    let act_group = |tap_index: u64, batch: u64| -> LaneGroup {
        let tap = tap_at(shape, tap_index);
        (0..lanes)
            .map(|lane| act_value(tap, batch * lanes + lane))
            .collect()
    };
    let weight_at = |f: u64, tap_index: u64| -> f16 {
        let tap = tap_at(shape, tap_index);
        weights[[
            f as usize,
            tap.channel as usize,
            tap.row as usize,
            tap.col as usize,
        ]]
    };
    let weight_slice = |f: u64, t0: u64, seg: u64| -> LaneGroup {
        (0..seg).map(|x| weight_at(f, t0 + x)).collect()
    };
    let partial = |f: u64, batch: u64, upto: u64| -> LaneGroup {
        (0..lanes)
            .map(|lane| {
                let pixel = batch * lanes + lane;
                accumulate(
                    bias[f as usize],
                    (0..upto).map(|tt| (weight_at(f, tt), act_value(tap_at(shape, tt), pixel))),
                )
            })
            .collect()
    };

    let mut first_segment = true;
    for f in 0..out_channels {
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
            let t0 = t * cap;
            em.mem(
                true,
                Bank::Even,
                plan.operand_a.offset(f * tiles_total + t, cols),
                weight_slice(f, t0, seg),
                |src| Inst::Wrf { src },
            );

            for batch in 0..batches {
                let materialize = batch == 0;
                let result_cursor = plan.result.offset(f * batches + batch, cols);
                if t == 0 {
                    em.mem(
                        materialize,
                        Bank::Even,
                        bias_base.offset(f, cols),
                        smallvec![bias[f as usize]; profile.lane_width()],
                        |src| Inst::Load {
                            dst: Reg::VecA(0),
                            src,
                        },
                    );
                } else {
                    em.mem(
                        materialize,
                        Bank::Even,
                        result_cursor,
                        partial(f, batch, t0),
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
                        plan.operand_b.offset((t0 + x) * batches + batch, cols),
                        act_group(t0 + x, batch),
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
                    partial(f, batch, t0 + seg),
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
