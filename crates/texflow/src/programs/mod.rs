//! Kernel catalogue.
//!
//! Each supported op has a constructor that validates operand shapes and
//! yields a [`KernelDescriptor`]: the op kind with its baked constants, the
//! logical output shape and the kind of per-run parameters the kernel expects.
//! The device specialises a descriptor for concrete operand layouts when the
//! kernel is compiled.

pub mod binary;
pub mod conv;
pub mod nn;
pub mod reduce;
pub mod shape_ops;
pub mod unary;

use std::fmt;

use serde::Serialize;

use crate::dtype::DType;
use crate::error::{BackendError, BackendResult};
use crate::layout::{PackingKind, TextureShape};

pub use binary::BinaryOp;
pub use conv::{Conv2DInfo, ConvParams, Padding, PoolKind};
pub use reduce::{ArgReduceOp, ReduceInfo, ReduceOp};
pub use unary::UnaryOp;

/// An `f32` constant baked into a kernel, compared and hashed by bit pattern.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Scalar(u32);

impl Scalar {
    pub fn new(value: f32) -> Self {
        Scalar(value.to_bits())
    }

    pub fn get(self) -> f32 {
        f32::from_bits(self.0)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar::new(value)
    }
}

impl fmt::Debug for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Operation a compiled kernel performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum OpKind {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Select,
    Reduce {
        op: ReduceOp,
        window: usize,
    },
    ArgReduce {
        op: ArgReduceOp,
        window: usize,
        first_pass: bool,
    },
    Slice,
    Reverse {
        axes: Vec<usize>,
    },
    Concat2D,
    Tile {
        reps: Vec<usize>,
    },
    Pad {
        paddings: Vec<(usize, usize)>,
        value: Scalar,
    },
    Transpose {
        perm: Vec<usize>,
    },
    Gather {
        axis: usize,
    },
    Copy,
    Cast {
        to: DType,
    },
    MatMul {
        transpose_a: bool,
        transpose_b: bool,
    },
    BatchNorm {
        epsilon: Scalar,
        has_offset: bool,
        has_scale: bool,
    },
    Lrn {
        radius: usize,
        bias: Scalar,
        alpha: Scalar,
        beta: Scalar,
    },
    Conv2D(Conv2DInfo),
    DepthwiseConv2D(Conv2DInfo),
    Pool {
        kind: PoolKind,
        info: Conv2DInfo,
    },
    Conv2DDerInput(Conv2DInfo),
    Conv2DDerFilter(Conv2DInfo),
    /// Window-relative index of each max-pool winner.
    MaxPoolPositions(Conv2DInfo),
    MaxPoolBackprop(Conv2DInfo),
    AvgPoolBackprop(Conv2DInfo),
    ResizeBilinear {
        align_corners: bool,
    },
    ResizeNearestNeighbor {
        align_corners: bool,
    },
    ResizeBilinearBackprop {
        align_corners: bool,
    },
    OneHot {
        depth: usize,
        on_value: Scalar,
        off_value: Scalar,
    },
    Multinomial {
        num_samples: usize,
    },
}

impl OpKind {
    /// Short label used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Unary(op) => op.name(),
            OpKind::Binary(op) => op.name(),
            OpKind::Select => "select",
            OpKind::Reduce { op, .. } => op.name(),
            OpKind::ArgReduce { op, .. } => op.name(),
            OpKind::Slice => "slice",
            OpKind::Reverse { .. } => "reverse",
            OpKind::Concat2D => "concat2d",
            OpKind::Tile { .. } => "tile",
            OpKind::Pad { .. } => "pad",
            OpKind::Transpose { .. } => "transpose",
            OpKind::Gather { .. } => "gather",
            OpKind::Copy => "copy",
            OpKind::Cast { .. } => "cast",
            OpKind::MatMul { .. } => "mat_mul",
            OpKind::BatchNorm { .. } => "batch_normalization",
            OpKind::Lrn { .. } => "local_response_normalization",
            OpKind::Conv2D(_) => "conv2d",
            OpKind::DepthwiseConv2D(_) => "depthwise_conv2d",
            OpKind::Pool { kind, .. } => kind.name(),
            OpKind::Conv2DDerInput(_) => "conv2d_der_input",
            OpKind::Conv2DDerFilter(_) => "conv2d_der_filter",
            OpKind::MaxPoolPositions(_) => "max_pool_positions",
            OpKind::MaxPoolBackprop(_) => "max_pool_backprop",
            OpKind::AvgPoolBackprop(_) => "avg_pool_backprop",
            OpKind::ResizeBilinear { .. } => "resize_bilinear",
            OpKind::ResizeNearestNeighbor { .. } => "resize_nearest_neighbor",
            OpKind::ResizeBilinearBackprop { .. } => "resize_bilinear_backprop",
            OpKind::OneHot { .. } => "one_hot",
            OpKind::Multinomial { .. } => "multinomial",
        }
    }

    /// Number of input operands the kernel binds, when fixed by the op.
    pub fn arity(&self) -> Option<usize> {
        match self {
            OpKind::Unary(_)
            | OpKind::Reduce { .. }
            | OpKind::Slice
            | OpKind::Reverse { .. }
            | OpKind::Tile { .. }
            | OpKind::Pad { .. }
            | OpKind::Transpose { .. }
            | OpKind::Copy
            | OpKind::Cast { .. }
            | OpKind::Lrn { .. }
            | OpKind::Pool { .. }
            | OpKind::MaxPoolPositions(_)
            | OpKind::AvgPoolBackprop(_)
            | OpKind::ResizeBilinear { .. }
            | OpKind::ResizeNearestNeighbor { .. }
            | OpKind::ResizeBilinearBackprop { .. }
            | OpKind::OneHot { .. }
            | OpKind::Multinomial { .. } => Some(1),
            OpKind::Binary(_)
            | OpKind::Concat2D
            | OpKind::Gather { .. }
            | OpKind::MatMul { .. }
            | OpKind::Conv2D(_)
            | OpKind::DepthwiseConv2D(_)
            | OpKind::Conv2DDerInput(_)
            | OpKind::Conv2DDerFilter(_)
            | OpKind::MaxPoolBackprop(_) => Some(2),
            OpKind::Select => Some(3),
            OpKind::ArgReduce { first_pass, .. } => Some(if *first_pass { 1 } else { 2 }),
            OpKind::BatchNorm {
                has_offset,
                has_scale,
                ..
            } => Some(3 + usize::from(*has_offset) + usize::from(*has_scale)),
        }
    }
}

/// Kind of per-run parameters a kernel reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ParamKind {
    None,
    /// One offset per output axis.
    Offsets { rank: usize },
    /// Seed for the kernel's pseudo-random stream.
    Seed,
}

/// Concrete per-run parameter values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamBinding {
    None,
    Offsets(Vec<usize>),
    Seed(u64),
}

impl ParamKind {
    pub fn check(&self, binding: &ParamBinding) -> BackendResult<()> {
        match (self, binding) {
            (ParamKind::None, ParamBinding::None) | (ParamKind::Seed, ParamBinding::Seed(_)) => {
                Ok(())
            }
            (ParamKind::Offsets { rank }, ParamBinding::Offsets(offsets))
                if offsets.len() == *rank =>
            {
                Ok(())
            }
            (expected, found) => Err(BackendError::ParamMismatch(format!(
                "kernel expects {expected:?}, run was bound with {found:?}"
            ))),
        }
    }
}

/// What an op asks the dispatch engine to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub op: OpKind,
    pub output_shape: Vec<usize>,
    /// Output dtype; `None` inherits the first input's dtype.
    pub output_dtype: Option<DType>,
    pub params: ParamKind,
}

impl KernelDescriptor {
    pub fn new(op: OpKind, output_shape: Vec<usize>) -> Self {
        Self {
            op,
            output_shape,
            output_dtype: None,
            params: ParamKind::None,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.output_dtype = Some(dtype);
        self
    }

    pub fn with_params(mut self, params: ParamKind) -> Self {
        self.params = params;
        self
    }
}

/// Physical description of one kernel operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OperandLayout {
    pub shape: Vec<usize>,
    pub texture_shape: TextureShape,
    pub dtype: DType,
    pub packing: PackingKind,
}

/// Structural cache key of a compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct KernelSignature {
    pub op: OpKind,
    pub inputs: Vec<OperandLayout>,
    pub output: OperandLayout,
}

/// Everything a device needs to build a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub signature: KernelSignature,
    pub params: ParamKind,
}

pub(crate) fn ensure_rank(op: &'static str, shape: &[usize], rank: usize) -> BackendResult<()> {
    if shape.len() == rank {
        Ok(())
    } else {
        Err(BackendError::invalid(
            op,
            format!("expected rank {rank}, got shape {shape:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_keys_by_bits() {
        assert_eq!(Scalar::new(1.5), Scalar::from(1.5));
        assert_ne!(Scalar::new(0.0), Scalar::new(-0.0));
        assert_eq!(Scalar::new(2.25).get(), 2.25);
    }

    #[test]
    fn param_binding_must_match_kind() {
        assert!(ParamKind::None.check(&ParamBinding::None).is_ok());
        assert!(ParamKind::Offsets { rank: 2 }
            .check(&ParamBinding::Offsets(vec![0, 1]))
            .is_ok());
        assert!(matches!(
            ParamKind::Offsets { rank: 2 }.check(&ParamBinding::Offsets(vec![0])),
            Err(BackendError::ParamMismatch(_))
        ));
        assert!(matches!(
            ParamKind::Seed.check(&ParamBinding::None),
            Err(BackendError::ParamMismatch(_))
        ));
    }
}
