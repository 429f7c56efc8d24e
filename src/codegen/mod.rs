//! Lockstep emission of the instruction, address and data streams.
//!
//! Mappers drive an [Emitter], which keeps the three streams synchronized by
//! construction: every memory-touching micro-op contributes one address and
//! one lane-group of data, and micro-ops repeated under `JUMP` contribute
//! trace entries without re-materializing instructions.

mod conv;
mod dot;
mod elementwise;
mod matmul;

use crate::addressing::{AddressViolation, Cursor};
use crate::common::{Bank, LaneGroup};
use crate::inst::{replay_banks, Inst, MemRef};
use crate::profile::HardwareProfile;
use crate::spec::{Kernel, KernelOperands};
use crate::tiling::{InfeasibleError, Strategy};

use half::f16;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Three independent sinks for the emitted artifacts.
///
/// Tests hand in string buffers; the binary persists them as files.
pub trait StreamSink {
    fn instructions(&mut self) -> &mut dyn fmt::Write;
    fn addresses(&mut self) -> &mut dyn fmt::Write;
    fn data(&mut self) -> &mut dyn fmt::Write;
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub instructions: String,
    pub addresses: String,
    pub data: String,
}

impl StreamSink for MemorySink {
    fn instructions(&mut self) -> &mut dyn fmt::Write {
        &mut self.instructions
    }

    fn addresses(&mut self) -> &mut dyn fmt::Write {
        &mut self.addresses
    }

    fn data(&mut self) -> &mut dyn fmt::Write {
        &mut self.data
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoweringError {
    #[error(transparent)]
    Infeasible(#[from] InfeasibleError),
    #[error("operand shapes do not match the kernel descriptor: {0}")]
    ShapeMismatch(String),
    #[error("failed to write a stream to its sink")]
    Sink(#[from] fmt::Error),
}

/// The tiling decision and region layout for one kernel invocation.
///
/// Computed before any stream output and consumed read-only by the emitters.
/// Region cursors are per-bank positions; `segment` counts lane-groups for
/// the element-wise kernel and reduction elements for the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MappingPlan {
    pub strategy: Strategy,
    pub segment: u64,
    pub loop_count: u64,
    pub peeling: u64,
    pub operand_a: Cursor,
    pub operand_b: Cursor,
    pub result: Cursor,
    pub zero_fill: Option<Cursor>,
    pub bias: Option<Cursor>,
}

/// The synchronized output triple.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTriple {
    pub program: Vec<Inst>,
    pub addresses: Vec<u64>,
    pub data: Vec<LaneGroup>,
}

impl StreamTriple {
    /// The bank each address entry is tagged with.
    pub fn bank_tags(&self, profile: &HardwareProfile) -> Vec<Bank> {
        self.addresses
            .iter()
            .map(|&addr| profile.decode_bank(addr))
            .collect()
    }

    /// Whether replaying the program's memory operations reproduces the
    /// address stream's bank sequence, and the data stream tracks it
    /// position for position.
    pub fn is_synchronized(&self, profile: &HardwareProfile) -> bool {
        self.data.len() == self.addresses.len()
            && replay_banks(&self.program) == self.bank_tags(profile)
    }
}

/// Result of one lowering: the plan, the streams as written, and any
/// collected address diagnostics.
#[derive(Debug)]
pub struct Lowering {
    pub plan: MappingPlan,
    pub streams: StreamTriple,
    pub diagnostics: Vec<AddressViolation>,
}

pub(crate) struct Emitter<'a> {
    profile: &'a HardwareProfile,
    program: Vec<Inst>,
    addresses: Vec<u64>,
    data: Vec<LaneGroup>,
    diagnostics: Vec<AddressViolation>,
}

impl<'a> Emitter<'a> {
    fn new(profile: &'a HardwareProfile) -> Self {
        Emitter {
            profile,
            program: Vec::new(),
            addresses: Vec::new(),
            data: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub(crate) fn profile(&self) -> &'a HardwareProfile {
        self.profile
    }

    /// Append a control micro-op. Memory-touching ops go through
    /// [Emitter::mem] so the streams cannot drift.
    pub(crate) fn push(&mut self, inst: Inst) {
        debug_assert!(inst.mem_ref().is_none());
        self.program.push(inst);
    }

    /// Append one memory operation. The address and data entries are always
    /// recorded; the instruction itself only when `materialize` is set
    /// (repeat executions under `JUMP` keep the template instruction).
    pub(crate) fn mem(
        &mut self,
        materialize: bool,
        bank: Bank,
        cursor: Cursor,
        values: LaneGroup,
        build: impl FnOnce(MemRef) -> Inst,
    ) {
        let addr = self
            .profile
            .encode_lossy(bank, cursor.row, cursor.col, &mut self.diagnostics);
        if materialize {
            let inst = build(MemRef { bank, addr });
            debug_assert_eq!(inst.mem_ref().map(|m| m.bank), Some(bank));
            self.program.push(inst);
        }
        self.addresses.push(addr);
        self.data.push(self.pad(values));
    }

    fn pad(&self, mut values: LaneGroup) -> LaneGroup {
        debug_assert!(values.len() <= self.profile.lane_width());
        values.resize(self.profile.lane_width(), f16::ZERO);
        values
    }

    fn finish(self) -> (StreamTriple, Vec<AddressViolation>) {
        (
            StreamTriple {
                program: self.program,
                addresses: self.addresses,
                data: self.data,
            },
            self.diagnostics,
        )
    }
}

/// Render the stream triple into its three text sinks.
///
/// One micro-op per instruction line; one 16-digit hex address per address
/// line; lane-width data values as 4-digit hex bit patterns, blank-line
/// separated per register-file transfer.
pub fn write_streams(streams: &StreamTriple, sink: &mut dyn StreamSink) -> fmt::Result {
    for inst in &streams.program {
        writeln!(sink.instructions(), "{inst}")?;
    }
    for addr in &streams.addresses {
        writeln!(sink.addresses(), "{addr:016x}")?;
    }
    for group in &streams.data {
        for value in group {
            writeln!(sink.data(), "{:04x}", value.to_bits())?;
        }
        writeln!(sink.data())?;
    }
    Ok(())
}

/// Map one kernel invocation onto the accelerator.
///
/// Feasibility and operand validation happen before anything reaches the
/// sink; address overflow is collected, not fatal.
pub fn lower(
    kernel: &Kernel,
    operands: &KernelOperands,
    profile: &HardwareProfile,
    sink: &mut dyn StreamSink,
) -> Result<Lowering, LoweringError> {
    profile.debug_check();
    operands
        .matches(kernel)
        .map_err(LoweringError::ShapeMismatch)?;

    let mut emitter = Emitter::new(profile);
    let plan = match (kernel, operands) {
        (
            Kernel::ElementwiseAdd {
                sets,
                len,
                traversal,
            },
            KernelOperands::Elementwise { lhs, rhs },
        ) => elementwise::lower(
            &mut emitter,
            u64::from(sets.get()),
            u64::from(len.get()),
            *traversal,
            lhs,
            rhs,
        )?,
        (Kernel::DotProduct { sets, len }, KernelOperands::DotProduct { lhs, rhs }) => dot::lower(
            &mut emitter,
            u64::from(sets.get()),
            u64::from(len.get()),
            lhs,
            rhs,
        )?,
        (Kernel::Matmul { m, n, q }, KernelOperands::Matmul { lhs, rhs }) => matmul::lower(
            &mut emitter,
            u64::from(m.get()),
            u64::from(n.get()),
            u64::from(q.get()),
            lhs,
            rhs,
        )?,
        (
            Kernel::Conv(shape),
            KernelOperands::Conv {
                activations,
                weights,
                bias,
            },
        ) => conv::lower(&mut emitter, shape, activations, weights, bias)?,
        _ => unreachable!("operand/kernel agreement checked above"),
    };

    let (streams, diagnostics) = emitter.finish();
    debug_assert!(streams.is_synchronized(profile));
    write_streams(&streams, sink)?;
    debug!(
        "lowered {kernel}: {} micro-ops, {} memory touches, {} diagnostics",
        streams.program.len(),
        streams.addresses.len(),
        diagnostics.len()
    );
    Ok(Lowering {
        plan,
        streams,
        diagnostics,
    })
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use half::f16;
    use ndarray::Array2;

    /// Row-major sequential values, offset so lhs and rhs differ.
    pub(crate) fn seq_array(rows: usize, cols: usize, offset: f32) -> Array2<f16> {
        Array2::from_shape_fn((rows, cols), |(i, j)| {
            f16::from_f32((i * cols + j) as f32 + offset)
        })
    }

    /// Lower into a throwaway sink, asserting stream synchrony.
    pub(crate) fn lowered(
        kernel: Kernel,
        operands: KernelOperands,
        profile: &HardwareProfile,
    ) -> Lowering {
        let mut sink = MemorySink::default();
        let lowering = lower(&kernel, &operands, profile, &mut sink).unwrap();
        assert!(lowering.streams.is_synchronized(profile));
        lowering
    }
}
