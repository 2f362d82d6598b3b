use crate::dtype::DType;
use crate::error::{BackendError, BackendResult};
use crate::layout::size_from_shape;
use crate::programs::{ensure_rank, KernelDescriptor, OpKind, ParamKind, Scalar};

/// Slice with a fixed output size; the start offsets are bound per run so one
/// kernel serves every window of the same size.
pub fn slice(input: &[usize], begin: &[usize], size: &[usize]) -> BackendResult<KernelDescriptor> {
    if begin.len() != input.len() || size.len() != input.len() {
        return Err(BackendError::invalid(
            "slice",
            format!(
                "begin {begin:?} and size {size:?} must match the rank of {input:?}"
            ),
        ));
    }
    for axis in 0..input.len() {
        if begin[axis] + size[axis] > input[axis] {
            return Err(BackendError::invalid(
                "slice",
                format!(
                    "axis {axis}: begin {} + size {} exceeds dimension {}",
                    begin[axis], size[axis], input[axis]
                ),
            ));
        }
    }
    Ok(KernelDescriptor::new(OpKind::Slice, size.to_vec())
        .with_params(ParamKind::Offsets { rank: size.len() }))
}

pub fn reverse(input: &[usize], axes: &[usize]) -> BackendResult<KernelDescriptor> {
    let mut axes = axes.to_vec();
    axes.sort_unstable();
    axes.dedup();
    if let Some(axis) = axes.iter().find(|axis| **axis >= input.len()) {
        return Err(BackendError::invalid(
            "reverse",
            format!("axis {axis} out of range for shape {input:?}"),
        ));
    }
    Ok(KernelDescriptor::new(OpKind::Reverse { axes }, input.to_vec()))
}

/// Concatenates two matrices along axis 1.
pub fn concat2d(a: &[usize], b: &[usize]) -> BackendResult<KernelDescriptor> {
    ensure_rank("concat2d", a, 2)?;
    ensure_rank("concat2d", b, 2)?;
    if a[0] != b[0] {
        return Err(BackendError::invalid(
            "concat2d",
            format!("row counts differ: {a:?} vs {b:?}"),
        ));
    }
    Ok(KernelDescriptor::new(OpKind::Concat2D, vec![a[0], a[1] + b[1]]))
}

pub fn tile(input: &[usize], reps: &[usize]) -> BackendResult<KernelDescriptor> {
    if reps.len() != input.len() {
        return Err(BackendError::invalid(
            "tile",
            format!("reps {reps:?} must match the rank of {input:?}"),
        ));
    }
    let output = input.iter().zip(reps).map(|(dim, rep)| dim * rep).collect();
    Ok(KernelDescriptor::new(
        OpKind::Tile {
            reps: reps.to_vec(),
        },
        output,
    ))
}

pub fn pad(
    input: &[usize],
    paddings: &[(usize, usize)],
    value: f32,
) -> BackendResult<KernelDescriptor> {
    if paddings.len() != input.len() {
        return Err(BackendError::invalid(
            "pad",
            format!("paddings {paddings:?} must match the rank of {input:?}"),
        ));
    }
    let output = input
        .iter()
        .zip(paddings)
        .map(|(dim, (before, after))| before + dim + after)
        .collect();
    Ok(KernelDescriptor::new(
        OpKind::Pad {
            paddings: paddings.to_vec(),
            value: Scalar::new(value),
        },
        output,
    ))
}

pub fn transpose(input: &[usize], perm: &[usize]) -> BackendResult<KernelDescriptor> {
    let mut seen = vec![false; input.len()];
    let valid = perm.len() == input.len()
        && perm.iter().all(|&axis| {
            axis < seen.len() && !std::mem::replace(&mut seen[axis], true)
        });
    if !valid {
        return Err(BackendError::invalid(
            "transpose",
            format!("{perm:?} is not a permutation of the axes of {input:?}"),
        ));
    }
    let output = perm.iter().map(|&axis| input[axis]).collect();
    Ok(KernelDescriptor::new(
        OpKind::Transpose {
            perm: perm.to_vec(),
        },
        output,
    ))
}

/// Gathers slices of `input` along `axis` using a 1-D index tensor.
pub fn gather(input: &[usize], indices: &[usize], axis: usize) -> BackendResult<KernelDescriptor> {
    ensure_rank("gather", indices, 1)?;
    if axis >= input.len() {
        return Err(BackendError::invalid(
            "gather",
            format!("axis {axis} out of range for shape {input:?}"),
        ));
    }
    let mut output = input.to_vec();
    output[axis] = indices[0];
    Ok(KernelDescriptor::new(OpKind::Gather { axis }, output))
}

pub fn reshape(input: &[usize], shape: &[usize]) -> BackendResult<KernelDescriptor> {
    let (from, to) = (size_from_shape(input), size_from_shape(shape));
    if from != to {
        return Err(BackendError::ShapeMismatch {
            context: format!("reshape {input:?} -> {shape:?}"),
            expected: from,
            found: to,
        });
    }
    Ok(KernelDescriptor::new(OpKind::Copy, shape.to_vec()))
}

pub fn cast(input: &[usize], to: DType) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::Cast { to }, input.to_vec()).with_dtype(to)
}

/// `condition` is either the same shape as `a` or a vector over `a`'s first
/// axis.
pub fn select(
    condition: &[usize],
    a: &[usize],
    b: &[usize],
    dtype: DType,
) -> BackendResult<KernelDescriptor> {
    if a != b {
        return Err(BackendError::invalid(
            "select",
            format!("branches must share a shape, got {a:?} and {b:?}"),
        ));
    }
    let per_row = condition.len() == 1 && a.len() > 1 && condition[0] == a[0];
    if condition != a && !per_row {
        return Err(BackendError::invalid(
            "select",
            format!("condition {condition:?} does not fit branches of shape {a:?}"),
        ));
    }
    Ok(KernelDescriptor::new(OpKind::Select, a.to_vec()).with_dtype(dtype))
}
