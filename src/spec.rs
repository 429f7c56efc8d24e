//! Kernel descriptors and operand containers.

use crate::common::DimSize;
use crate::profile::HardwareProfile;

use half::f16;
use ndarray::{Array1, Array2, Array3, Array4};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Traversal {
    /// Flatten every vector end to end, then chunk into lane-groups.
    RowWise,
    /// Walk shared positions outermost, grouping vectors across lanes.
    ColumnWise,
}

/// Shape metadata for one convolution invocation.
///
/// Output extents are caller-supplied rather than derived; the mapper clips
/// activation windows whose base falls outside the input and reads
/// device-side zero there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ConvShape {
    pub channels: DimSize,
    pub height: DimSize,
    pub width: DimSize,
    pub kernel: DimSize,
    pub stride: DimSize,
    pub out_channels: DimSize,
    pub out_height: DimSize,
    pub out_width: DimSize,
}

impl ConvShape {
    /// Reduction length per output channel.
    pub fn taps(&self) -> u64 {
        u64::from(self.channels.get())
            * u64::from(self.kernel.get())
            * u64::from(self.kernel.get())
    }

    pub fn out_pixels(&self) -> u64 {
        u64::from(self.out_height.get()) * u64::from(self.out_width.get())
    }
}

/// A kernel invocation's descriptor. Matched exhaustively at the strategy
/// and dispatch boundaries; adding a variant is a compile error everywhere
/// it matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Kernel {
    ElementwiseAdd {
        sets: DimSize,
        len: DimSize,
        traversal: Traversal,
    },
    DotProduct {
        sets: DimSize,
        len: DimSize,
    },
    Matmul {
        m: DimSize,
        n: DimSize,
        q: DimSize,
    },
    Conv(ConvShape),
}

impl Kernel {
    /// Total work units for the tiling engine. Lane-groups for the
    /// element-wise kernel, reduction elements for the others.
    pub fn work_units(&self, profile: &HardwareProfile) -> u64 {
        let lanes = u64::from(profile.lane_width);
        match self {
            Kernel::ElementwiseAdd {
                sets,
                len,
                traversal: Traversal::RowWise,
            } => divrem::DivCeil::div_ceil(
                u64::from(sets.get()) * u64::from(len.get()),
                lanes,
            ),
            Kernel::ElementwiseAdd {
                sets,
                len,
                traversal: Traversal::ColumnWise,
            } => divrem::DivCeil::div_ceil(u64::from(sets.get()), lanes) * u64::from(len.get()),
            Kernel::DotProduct { len, .. } => u64::from(len.get()),
            Kernel::Matmul { n, .. } => u64::from(n.get()),
            Kernel::Conv(shape) => shape.taps(),
        }
    }
}

impl Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kernel::ElementwiseAdd {
                traversal: Traversal::RowWise,
                ..
            } => write!(f, "elementwise-add-row"),
            Kernel::ElementwiseAdd {
                traversal: Traversal::ColumnWise,
                ..
            } => write!(f, "elementwise-add-col"),
            Kernel::DotProduct { .. } => write!(f, "dot-product"),
            Kernel::Matmul { .. } => write!(f, "matmul"),
            Kernel::Conv(_) => write!(f, "conv"),
        }
    }
}

/// Raw operand values for one invocation. Supplied by the caller; the mapper
/// only reads them.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelOperands {
    /// `sets x len` pairs for the element-wise kernel.
    Elementwise { lhs: Array2<f16>, rhs: Array2<f16> },
    /// `sets x len` pairs reduced along `len`.
    DotProduct { lhs: Array2<f16>, rhs: Array2<f16> },
    /// `m x n` by `n x q`.
    Matmul { lhs: Array2<f16>, rhs: Array2<f16> },
    Conv {
        /// `channels x height x width`.
        activations: Array3<f16>,
        /// `out_channels x channels x kernel x kernel`.
        weights: Array4<f16>,
        /// One value per output channel.
        bias: Array1<f16>,
    },
}

impl KernelOperands {
    /// Checks that the containers agree with the descriptor's shapes.
    pub fn matches(&self, kernel: &Kernel) -> Result<(), String> {
        fn expect(name: &str, got: &[usize], want: &[usize]) -> Result<(), String> {
            if got == want {
                Ok(())
            } else {
                Err(format!("{name} has shape {got:?}, expected {want:?}"))
            }
        }

        let dims = |d: DimSize| d.get() as usize;
        match (kernel, self) {
            (
                Kernel::ElementwiseAdd { sets, len, .. },
                KernelOperands::Elementwise { lhs, rhs },
            )
            | (Kernel::DotProduct { sets, len }, KernelOperands::DotProduct { lhs, rhs }) => {
                expect("lhs", lhs.shape(), &[dims(*sets), dims(*len)])?;
                expect("rhs", rhs.shape(), &[dims(*sets), dims(*len)])
            }
            (Kernel::Matmul { m, n, q }, KernelOperands::Matmul { lhs, rhs }) => {
                expect("lhs", lhs.shape(), &[dims(*m), dims(*n)])?;
                expect("rhs", rhs.shape(), &[dims(*n), dims(*q)])
            }
            (
                Kernel::Conv(shape),
                KernelOperands::Conv {
                    activations,
                    weights,
                    bias,
                },
            ) => {
                expect(
                    "activations",
                    activations.shape(),
                    &[dims(shape.channels), dims(shape.height), dims(shape.width)],
                )?;
                expect(
                    "weights",
                    weights.shape(),
                    &[
                        dims(shape.out_channels),
                        dims(shape.channels),
                        dims(shape.kernel),
                        dims(shape.kernel),
                    ],
                )?;
                expect("bias", bias.shape(), &[dims(shape.out_channels)])
            }
            (kernel, _) => Err(format!("operands do not belong to kernel {kernel}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimsize;

    #[test]
    fn test_elementwise_work_units_by_traversal() {
        let profile = HardwareProfile {
            lane_width: 4,
            ..HardwareProfile::default()
        };
        let row = Kernel::ElementwiseAdd {
            sets: dimsize!(3),
            len: dimsize!(5),
            traversal: Traversal::RowWise,
        };
        // 15 elements in lane-groups of 4.
        assert_eq!(row.work_units(&profile), 4);

        let col = Kernel::ElementwiseAdd {
            sets: dimsize!(3),
            len: dimsize!(5),
            traversal: Traversal::ColumnWise,
        };
        // One group of vectors per shared position.
        assert_eq!(col.work_units(&profile), 5);
    }

    #[test]
    fn test_reduction_work_units() {
        let profile = HardwareProfile::default();
        assert_eq!(
            Kernel::DotProduct {
                sets: dimsize!(2),
                len: dimsize!(9)
            }
            .work_units(&profile),
            9
        );
        assert_eq!(
            Kernel::Matmul {
                m: dimsize!(4),
                n: dimsize!(6),
                q: dimsize!(2)
            }
            .work_units(&profile),
            6
        );
        let shape = ConvShape {
            channels: dimsize!(2),
            height: dimsize!(8),
            width: dimsize!(8),
            kernel: dimsize!(3),
            stride: dimsize!(1),
            out_channels: dimsize!(4),
            out_height: dimsize!(6),
            out_width: dimsize!(6),
        };
        assert_eq!(Kernel::Conv(shape).work_units(&profile), 18);
    }

    #[test]
    fn test_operand_shape_mismatch_is_reported() {
        let kernel = Kernel::Matmul {
            m: dimsize!(2),
            n: dimsize!(3),
            q: dimsize!(4),
        };
        let operands = KernelOperands::Matmul {
            lhs: Array2::zeros((2, 3)),
            rhs: Array2::zeros((4, 4)),
        };
        assert!(operands.matches(&kernel).is_err());

        let good = KernelOperands::Matmul {
            lhs: Array2::zeros((2, 3)),
            rhs: Array2::zeros((3, 4)),
        };
        assert!(good.matches(&kernel).is_ok());
    }
}
