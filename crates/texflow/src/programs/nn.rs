use crate::dtype::DType;
use crate::error::{BackendError, BackendResult};
use crate::programs::{ensure_rank, KernelDescriptor, OpKind, ParamKind, Scalar};

pub fn mat_mul(
    a: &[usize],
    b: &[usize],
    transpose_a: bool,
    transpose_b: bool,
) -> BackendResult<KernelDescriptor> {
    ensure_rank("mat_mul", a, 2)?;
    ensure_rank("mat_mul", b, 2)?;
    let (m, k_a) = if transpose_a { (a[1], a[0]) } else { (a[0], a[1]) };
    let (k_b, n) = if transpose_b { (b[1], b[0]) } else { (b[0], b[1]) };
    if k_a != k_b {
        return Err(BackendError::invalid(
            "mat_mul",
            format!(
                "inner dimensions differ: {a:?} x {b:?} (transpose {transpose_a}, {transpose_b})"
            ),
        ));
    }
    Ok(KernelDescriptor::new(
        OpKind::MatMul {
            transpose_a,
            transpose_b,
        },
        vec![m, n],
    ))
}

/// Statistics are a vector over channels or a tensor of the input's shape.
pub fn batch_normalization(
    x: &[usize],
    stats: &[&[usize]],
    epsilon: f32,
    has_offset: bool,
    has_scale: bool,
) -> BackendResult<KernelDescriptor> {
    let channels = x.last().copied().unwrap_or(1);
    for shape in stats {
        let fits = *shape == x || (shape.len() == 1 && shape[0] == channels);
        if !fits {
            return Err(BackendError::invalid(
                "batch_normalization",
                format!("statistic shape {shape:?} does not fit input {x:?}"),
            ));
        }
    }
    Ok(KernelDescriptor::new(
        OpKind::BatchNorm {
            epsilon: Scalar::new(epsilon),
            has_offset,
            has_scale,
        },
        x.to_vec(),
    ))
}

pub fn local_response_normalization(
    x: &[usize],
    radius: usize,
    bias: f32,
    alpha: f32,
    beta: f32,
) -> BackendResult<KernelDescriptor> {
    ensure_rank("local_response_normalization", x, 4)?;
    Ok(KernelDescriptor::new(
        OpKind::Lrn {
            radius,
            bias: Scalar::new(bias),
            alpha: Scalar::new(alpha),
            beta: Scalar::new(beta),
        },
        x.to_vec(),
    ))
}

pub fn resize(
    x: &[usize],
    new_height: usize,
    new_width: usize,
    align_corners: bool,
    nearest: bool,
) -> BackendResult<KernelDescriptor> {
    let op_name = if nearest {
        "resize_nearest_neighbor"
    } else {
        "resize_bilinear"
    };
    ensure_rank(op_name, x, 4)?;
    if new_height == 0 || new_width == 0 {
        return Err(BackendError::invalid(op_name, "target size must be positive"));
    }
    let op = if nearest {
        OpKind::ResizeNearestNeighbor { align_corners }
    } else {
        OpKind::ResizeBilinear { align_corners }
    };
    Ok(KernelDescriptor::new(
        op,
        vec![x[0], new_height, new_width, x[3]],
    ))
}

/// Gradient of `resize_bilinear` with respect to `x`, computed from `dy`.
pub fn resize_bilinear_backprop(
    dy: &[usize],
    x: &[usize],
    align_corners: bool,
) -> BackendResult<KernelDescriptor> {
    let op = "resize_bilinear_backprop";
    ensure_rank(op, dy, 4)?;
    ensure_rank(op, x, 4)?;
    if dy[0] != x[0] || dy[3] != x[3] {
        return Err(BackendError::invalid(
            op,
            format!("gradient {dy:?} and input {x:?} differ in batch or channels"),
        ));
    }
    Ok(KernelDescriptor::new(
        OpKind::ResizeBilinearBackprop { align_corners },
        x.to_vec(),
    ))
}

pub fn one_hot(
    indices: &[usize],
    depth: usize,
    on_value: f32,
    off_value: f32,
) -> BackendResult<KernelDescriptor> {
    ensure_rank("one_hot", indices, 1)?;
    Ok(KernelDescriptor::new(
        OpKind::OneHot {
            depth,
            on_value: Scalar::new(on_value),
            off_value: Scalar::new(off_value),
        },
        vec![indices[0], depth],
    ))
}

/// Draws `num_samples` outcome indices per row of a `[batch, outcomes]`
/// probability matrix.
pub fn multinomial(probs: &[usize], num_samples: usize) -> BackendResult<KernelDescriptor> {
    ensure_rank("multinomial", probs, 2)?;
    if probs[1] == 0 {
        return Err(BackendError::invalid("multinomial", "need at least one outcome"));
    }
    Ok(
        KernelDescriptor::new(OpKind::Multinomial { num_samples }, vec![probs[0], num_samples])
            .with_dtype(DType::I32)
            .with_params(ParamKind::Seed),
    )
}
