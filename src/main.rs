use anyhow::{bail, Context, Result};
use clap::Parser;
use half::f16;
use log::{info, warn};
use ndarray::{Array1, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use std::fs;
use std::path::{Path, PathBuf};

use pimgen::codegen::{lower, Lowering, MemorySink};
use pimgen::common::DimSize;
use pimgen::profile::HardwareProfile;
use pimgen::spec::{ConvShape, Kernel, KernelOperands, Traversal};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path prefix for the emitted .inst/.addr/.data triple
    #[arg(long, short, default_value = "kernel")]
    out: PathBuf,

    /// Seed for the synthetic operand values
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// SIMD lane width
    #[arg(long)]
    lane_width: Option<u32>,

    /// Vector register slots per bank
    #[arg(long)]
    vec_slots: Option<u32>,

    /// Scalar register slots
    #[arg(long)]
    scalar_slots: Option<u32>,

    /// Control store capacity in micro-ops
    #[arg(long)]
    control_store: Option<u32>,

    #[command(subcommand)]
    kernel: KernelCmd,
}

#[derive(clap::Subcommand)]
enum KernelCmd {
    /// Element-wise vector addition, row-major traversal
    ElementwiseAddRow { sets: DimSize, len: DimSize },

    /// Element-wise vector addition, column-major traversal
    ElementwiseAddCol { sets: DimSize, len: DimSize },

    /// Per-vector dot products over a shared dimension
    DotProduct { sets: DimSize, len: DimSize },

    /// Matrix multiplication with broadcast row reuse
    Matmul {
        m: DimSize,
        n: DimSize,
        q: DimSize,
    },

    /// 2D convolution with channel-wise weight reuse
    Conv {
        channels: DimSize,
        height: DimSize,
        width: DimSize,
        kernel: DimSize,
        stride: DimSize,
        out_channels: DimSize,

        /// Defaults to the exact extent for the given stride
        #[arg(long)]
        out_height: Option<DimSize>,

        /// Defaults to the exact extent for the given stride
        #[arg(long)]
        out_width: Option<DimSize>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut profile = HardwareProfile::default();
    if let Some(v) = args.lane_width {
        profile.lane_width = v;
    }
    if let Some(v) = args.vec_slots {
        profile.vec_slots = v;
    }
    if let Some(v) = args.scalar_slots {
        profile.scalar_slots = v;
    }
    if let Some(v) = args.control_store {
        profile.control_store = v;
    }

    let kernel = build_kernel(&args.kernel)?;
    let operands = synth_operands(&kernel, args.seed);

    let mut sink = MemorySink::default();
    let lowering = lower(&kernel, &operands, &profile, &mut sink)?;
    for violation in &lowering.diagnostics {
        warn!("address diagnostic: {violation}");
    }
    persist(&args.out, &sink)?;
    report(&kernel, &lowering);
    Ok(())
}

fn build_kernel(cmd: &KernelCmd) -> Result<Kernel> {
    Ok(match cmd {
        KernelCmd::ElementwiseAddRow { sets, len } => Kernel::ElementwiseAdd {
            sets: *sets,
            len: *len,
            traversal: Traversal::RowWise,
        },
        KernelCmd::ElementwiseAddCol { sets, len } => Kernel::ElementwiseAdd {
            sets: *sets,
            len: *len,
            traversal: Traversal::ColumnWise,
        },
        KernelCmd::DotProduct { sets, len } => Kernel::DotProduct {
            sets: *sets,
            len: *len,
        },
        KernelCmd::Matmul { m, n, q } => Kernel::Matmul {
            m: *m,
            n: *n,
            q: *q,
        },
        KernelCmd::Conv {
            channels,
            height,
            width,
            kernel,
            stride,
            out_channels,
            out_height,
            out_width,
        } => {
            let exact = |input: DimSize| -> Result<DimSize> {
                let span = input
                    .get()
                    .checked_sub(kernel.get())
                    .with_context(|| format!("filter size {kernel} exceeds input extent {input}"))?;
                match DimSize::new(span / stride.get() + 1) {
                    Some(extent) => Ok(extent),
                    None => bail!("degenerate output extent"),
                }
            };
            Kernel::Conv(ConvShape {
                channels: *channels,
                height: *height,
                width: *width,
                kernel: *kernel,
                stride: *stride,
                out_channels: *out_channels,
                out_height: match out_height {
                    Some(extent) => *extent,
                    None => exact(*height)?,
                },
                out_width: match out_width {
                    Some(extent) => *extent,
                    None => exact(*width)?,
                },
            })
        }
    })
}

/// Random operand values in a narrow range that keeps half-precision sums
/// well conditioned.
fn synth_operands(kernel: &Kernel, seed: u64) -> KernelOperands {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut value = move || f16::from_f32(rng.gen_range(-2.0..2.0));
    let dims = |d: DimSize| d.get() as usize;

    match kernel {
        Kernel::ElementwiseAdd { sets, len, .. } => KernelOperands::Elementwise {
            lhs: Array2::from_shape_simple_fn((dims(*sets), dims(*len)), &mut value),
            rhs: Array2::from_shape_simple_fn((dims(*sets), dims(*len)), &mut value),
        },
        Kernel::DotProduct { sets, len } => KernelOperands::DotProduct {
            lhs: Array2::from_shape_simple_fn((dims(*sets), dims(*len)), &mut value),
            rhs: Array2::from_shape_simple_fn((dims(*sets), dims(*len)), &mut value),
        },
        Kernel::Matmul { m, n, q } => KernelOperands::Matmul {
            lhs: Array2::from_shape_simple_fn((dims(*m), dims(*n)), &mut value),
            rhs: Array2::from_shape_simple_fn((dims(*n), dims(*q)), &mut value),
        },
        Kernel::Conv(shape) => KernelOperands::Conv {
            activations: Array3::from_shape_simple_fn(
                (dims(shape.channels), dims(shape.height), dims(shape.width)),
                &mut value,
            ),
            weights: Array4::from_shape_simple_fn(
                (
                    dims(shape.out_channels),
                    dims(shape.channels),
                    dims(shape.kernel),
                    dims(shape.kernel),
                ),
                &mut value,
            ),
            bias: Array1::from_shape_simple_fn(dims(shape.out_channels), &mut value),
        },
    }
}

/// Persist the finished streams. Nothing is written until lowering has
/// succeeded, so a failed invocation leaves no partial artifacts behind.
fn persist(prefix: &Path, sink: &MemorySink) -> Result<()> {
    let write = |extension: &str, contents: &str| -> Result<()> {
        let path = prefix.with_extension(extension);
        fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))
    };
    write("inst", &sink.instructions)?;
    write("addr", &sink.addresses)?;
    write("data", &sink.data)
}

fn report(kernel: &Kernel, lowering: &Lowering) {
    info!(
        "{kernel}: {:?} strategy, segment {}, {} full tiles, {} peeled",
        lowering.plan.strategy, lowering.plan.segment, lowering.plan.loop_count, lowering.plan.peeling
    );
    info!(
        "{} micro-ops, {} memory touches",
        lowering.streams.program.len(),
        lowering.streams.addresses.len()
    );
}
