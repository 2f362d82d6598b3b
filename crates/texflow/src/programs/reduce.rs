//! Windowed reductions over the innermost axis of a `[batch, in_size]` view.
//!
//! One pass shrinks each row by the window size; the backend repeats passes
//! until a single column remains.

use serde::Serialize;

use crate::dtype::DType;
use crate::error::{BackendError, BackendResult};
use crate::programs::{ensure_rank, KernelDescriptor, OpKind};

/// Rows at or below this length are reduced in a single pass.
pub const SINGLE_PASS_MAX: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
        }
    }

    pub fn identity(self) -> f32 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Min => f32::INFINITY,
            ReduceOp::Max => f32::NEG_INFINITY,
        }
    }

    pub fn combine(self, acc: f32, value: f32) -> f32 {
        if value.is_nan() || acc.is_nan() {
            return f32::NAN;
        }
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Min => acc.min(value),
            ReduceOp::Max => acc.max(value),
        }
    }

    pub fn output_dtype(self, input: DType) -> DType {
        match self {
            ReduceOp::Sum => input.sum_output(),
            ReduceOp::Min | ReduceOp::Max => input,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArgReduceOp {
    Min,
    Max,
}

impl ArgReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ArgReduceOp::Min => "arg_min",
            ArgReduceOp::Max => "arg_max",
        }
    }

    /// Whether `candidate` strictly beats `best`; ties keep the earlier index.
    pub fn better(self, candidate: f32, best: f32) -> bool {
        match self {
            ArgReduceOp::Min => candidate < best,
            ArgReduceOp::Max => candidate > best,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceInfo {
    pub batch_size: usize,
    pub in_size: usize,
    pub window_size: usize,
}

impl ReduceInfo {
    pub fn new(batch_size: usize, in_size: usize) -> Self {
        Self {
            batch_size,
            in_size,
            window_size: optimal_window_size(in_size),
        }
    }

    pub fn out_size(&self) -> usize {
        self.in_size.div_ceil(self.window_size.max(1))
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.batch_size, self.out_size()]
    }
}

pub fn optimal_window_size(in_size: usize) -> usize {
    if in_size <= SINGLE_PASS_MAX {
        return in_size.max(1);
    }
    let start = (in_size as f64).sqrt().floor() as usize;
    nearest_divisor(in_size, start)
}

/// Smallest divisor of `size` that is at least `start`.
pub fn nearest_divisor(size: usize, start: usize) -> usize {
    (start.max(1)..=size)
        .find(|candidate| size % candidate == 0)
        .unwrap_or(size)
}

/// Splits `shape` into the kept outer shape and the reduced inner size.
///
/// Only trailing axes may be reduced.
pub fn split_innermost(
    op: &'static str,
    shape: &[usize],
    axes: &[usize],
) -> BackendResult<(Vec<usize>, usize)> {
    let rank = shape.len();
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    for (offset, axis) in sorted.iter().enumerate() {
        if *axis >= rank {
            return Err(BackendError::invalid(
                op,
                format!("axis {axis} out of range for rank {rank}"),
            ));
        }
        if *axis != rank - sorted.len() + offset {
            return Err(BackendError::invalid(
                op,
                format!("axes {axes:?} must be the innermost dimensions of rank {rank}"),
            ));
        }
    }
    let keep = rank - sorted.len();
    let outer = shape[..keep].to_vec();
    let inner = shape[keep..].iter().product();
    Ok((outer, inner))
}

pub fn reduce_descriptor(
    op: ReduceOp,
    input: &[usize],
    dtype: DType,
) -> BackendResult<KernelDescriptor> {
    ensure_rank(op.name(), input, 2)?;
    let info = ReduceInfo::new(input[0], input[1]);
    Ok(KernelDescriptor::new(
        OpKind::Reduce {
            op,
            window: info.window_size,
        },
        info.output_shape(),
    )
    .with_dtype(dtype))
}

/// One arg-reduce pass. `best_indices` is the previous pass's output shape.
pub fn arg_reduce_descriptor(
    op: ArgReduceOp,
    input: &[usize],
    best_indices: Option<&[usize]>,
) -> BackendResult<KernelDescriptor> {
    ensure_rank(op.name(), input, 2)?;
    let view = match best_indices {
        Some(shape) => {
            ensure_rank(op.name(), shape, 2)?;
            shape
        }
        None => input,
    };
    let info = ReduceInfo::new(view[0], view[1]);
    Ok(KernelDescriptor::new(
        OpKind::ArgReduce {
            op,
            window: info.window_size,
            first_pass: best_indices.is_none(),
        },
        info.output_shape(),
    )
    .with_dtype(DType::I32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_rows_use_one_window() {
        assert_eq!(optimal_window_size(5), 5);
        assert_eq!(optimal_window_size(30), 30);
        assert_eq!(optimal_window_size(0), 1);
    }

    #[test]
    fn large_rows_use_divisor_near_sqrt() {
        assert_eq!(optimal_window_size(100), 10);
        assert_eq!(optimal_window_size(1000), 40);
        // Primes have no divisor above the root other than themselves.
        assert_eq!(optimal_window_size(31), 31);
    }

    #[test]
    fn only_innermost_axes_reduce() {
        assert_eq!(
            split_innermost("sum", &[2, 3, 4], &[1, 2]).unwrap(),
            (vec![2], 12)
        );
        assert!(split_innermost("sum", &[2, 3, 4], &[0]).is_err());
        assert!(split_innermost("sum", &[2, 3], &[5]).is_err());
    }
}
