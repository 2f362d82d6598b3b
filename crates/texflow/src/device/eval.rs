//! Interpreter for compiled kernels on the reference device.
//!
//! Operands arrive as logical row-major `f32` buffers, the same values a
//! plain-float texture holds in channel 0. Integral and boolean operands are
//! already widened to floats.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dtype::DType;
use crate::error::{BackendError, BackendResult};
use crate::layout::{ravel_index, size_from_shape, strides, unravel_index};
use crate::programs::{
    ArgReduceOp, BinaryOp, Conv2DInfo, KernelSignature, OpKind, ParamBinding, PoolKind, ReduceOp,
    Scalar, UnaryOp,
};

pub(super) fn execute_kernel(
    signature: &KernelSignature,
    inputs: &[Vec<f32>],
    params: &ParamBinding,
) -> BackendResult<Vec<f32>> {
    let shapes: Vec<&[usize]> = signature
        .inputs
        .iter()
        .map(|layout| layout.shape.as_slice())
        .collect();
    let out_shape = signature.output.shape.as_slice();
    let result = match &signature.op {
        OpKind::Unary(op) => op_unary(*op, &inputs[0]),
        OpKind::Binary(op) => op_binary(*op, inputs, &shapes, out_shape),
        OpKind::Select => op_select(inputs, &shapes, out_shape),
        OpKind::Reduce { op, window } => op_reduce(*op, *window, &inputs[0], shapes[0], out_shape),
        OpKind::ArgReduce {
            op,
            window,
            first_pass,
        } => op_arg_reduce(*op, *window, *first_pass, inputs, &shapes, out_shape),
        OpKind::Slice => op_slice(&inputs[0], shapes[0], out_shape, params)?,
        OpKind::Reverse { axes } => op_reverse(&inputs[0], shapes[0], axes),
        OpKind::Concat2D => op_concat2d(inputs, &shapes),
        OpKind::Tile { .. } => op_tile(&inputs[0], shapes[0], out_shape),
        OpKind::Pad { paddings, value } => {
            op_pad(&inputs[0], shapes[0], out_shape, paddings, *value)
        }
        OpKind::Transpose { perm } => op_transpose(&inputs[0], shapes[0], out_shape, perm),
        OpKind::Gather { axis } => op_gather(inputs, &shapes, out_shape, *axis)?,
        OpKind::Copy => inputs[0].clone(),
        OpKind::Cast { to } => op_cast(&inputs[0], *to),
        OpKind::MatMul {
            transpose_a,
            transpose_b,
        } => op_mat_mul(inputs, &shapes, out_shape, *transpose_a, *transpose_b),
        OpKind::BatchNorm {
            epsilon,
            has_offset,
            has_scale,
        } => op_batch_norm(inputs, &shapes, *epsilon, *has_offset, *has_scale),
        OpKind::Lrn {
            radius,
            bias,
            alpha,
            beta,
        } => op_lrn(&inputs[0], shapes[0], *radius, *bias, *alpha, *beta),
        OpKind::Conv2D(info) => op_conv2d(inputs, info),
        OpKind::DepthwiseConv2D(info) => op_depthwise_conv2d(inputs, info),
        OpKind::Pool { kind, info } => op_pool(*kind, &inputs[0], info),
        OpKind::Conv2DDerInput(info) => op_conv2d_der_input(inputs, info),
        OpKind::Conv2DDerFilter(info) => op_conv2d_der_filter(inputs, info),
        OpKind::MaxPoolPositions(info) => op_max_pool_positions(&inputs[0], info),
        OpKind::MaxPoolBackprop(info) => op_max_pool_backprop(inputs, info),
        OpKind::AvgPoolBackprop(info) => op_avg_pool_backprop(&inputs[0], info),
        OpKind::ResizeBilinear { align_corners } => {
            op_resize(&inputs[0], shapes[0], out_shape, *align_corners, false)
        }
        OpKind::ResizeNearestNeighbor { align_corners } => {
            op_resize(&inputs[0], shapes[0], out_shape, *align_corners, true)
        }
        OpKind::ResizeBilinearBackprop { align_corners } => {
            op_resize_bilinear_backprop(&inputs[0], shapes[0], out_shape, *align_corners)
        }
        OpKind::OneHot {
            depth,
            on_value,
            off_value,
        } => op_one_hot(&inputs[0], *depth, *on_value, *off_value),
        OpKind::Multinomial { num_samples } => {
            op_multinomial(&inputs[0], shapes[0], *num_samples, params)?
        }
    };
    Ok(result)
}

fn op_unary(op: UnaryOp, input: &[f32]) -> Vec<f32> {
    input.iter().map(|&x| op.apply(x)).collect()
}

/// Flat input index for an output coordinate under trailing-axis broadcast.
fn broadcast_source(out_coords: &[usize], in_shape: &[usize], in_strides: &[usize]) -> usize {
    let offset = out_coords.len() - in_shape.len();
    in_shape
        .iter()
        .enumerate()
        .map(|(axis, &dim)| {
            let coord = if dim == 1 { 0 } else { out_coords[offset + axis] };
            coord * in_strides[axis]
        })
        .sum()
}

fn op_binary(
    op: BinaryOp,
    inputs: &[Vec<f32>],
    shapes: &[&[usize]],
    out_shape: &[usize],
) -> Vec<f32> {
    let (a_strides, b_strides) = (strides(shapes[0]), strides(shapes[1]));
    (0..size_from_shape(out_shape))
        .map(|index| {
            let coords = unravel_index(index, out_shape);
            let a = inputs[0][broadcast_source(&coords, shapes[0], &a_strides)];
            let b = inputs[1][broadcast_source(&coords, shapes[1], &b_strides)];
            op.apply(a, b)
        })
        .collect()
}

fn op_select(inputs: &[Vec<f32>], shapes: &[&[usize]], out_shape: &[usize]) -> Vec<f32> {
    let per_row = shapes[0].len() == 1 && out_shape.len() > 1;
    let row_len = out_shape.iter().skip(1).product::<usize>().max(1);
    (0..size_from_shape(out_shape))
        .map(|index| {
            let cond = if per_row {
                inputs[0][index / row_len]
            } else {
                inputs[0][index]
            };
            if cond >= 1.0 {
                inputs[1][index]
            } else {
                inputs[2][index]
            }
        })
        .collect()
}

fn op_reduce(
    op: ReduceOp,
    window: usize,
    input: &[f32],
    in_shape: &[usize],
    out_shape: &[usize],
) -> Vec<f32> {
    let (batch, in_size) = (in_shape[0], in_shape[1]);
    let out_size = out_shape[1];
    let mut out = Vec::with_capacity(batch * out_size);
    for row in 0..batch {
        let values = &input[row * in_size..(row + 1) * in_size];
        for column in 0..out_size {
            let start = column * window;
            let end = (start + window).min(in_size);
            out.push(
                values[start..end]
                    .iter()
                    .fold(op.identity(), |acc, &value| op.combine(acc, value)),
            );
        }
    }
    out
}

fn op_arg_reduce(
    op: ArgReduceOp,
    window: usize,
    first_pass: bool,
    inputs: &[Vec<f32>],
    shapes: &[&[usize]],
    out_shape: &[usize],
) -> Vec<f32> {
    let x = &inputs[0];
    let x_cols = shapes[0][1];
    let in_size = if first_pass { x_cols } else { shapes[1][1] };
    let (batch, out_size) = (out_shape[0], out_shape[1]);
    let mut out = Vec::with_capacity(batch * out_size);
    for row in 0..batch {
        for column in 0..out_size {
            let start = column * window;
            let end = (start + window).min(in_size);
            let mut best_index = 0usize;
            let mut best_value = None;
            for k in start..end {
                let candidate_index = if first_pass {
                    k
                } else {
                    inputs[1][row * in_size + k].round() as usize
                };
                let candidate = x[row * x_cols + candidate_index];
                let wins = match best_value {
                    None => true,
                    Some(best) => op.better(candidate, best),
                };
                if wins {
                    best_index = candidate_index;
                    best_value = Some(candidate);
                }
            }
            out.push(best_index as f32);
        }
    }
    out
}

fn op_slice(
    input: &[f32],
    in_shape: &[usize],
    out_shape: &[usize],
    params: &ParamBinding,
) -> BackendResult<Vec<f32>> {
    let ParamBinding::Offsets(begin) = params else {
        return Err(BackendError::ParamMismatch(format!(
            "slice expects offsets, got {params:?}"
        )));
    };
    let in_strides = strides(in_shape);
    let mut coords_in = vec![0usize; in_shape.len()];
    let mut out = Vec::with_capacity(size_from_shape(out_shape));
    for index in 0..size_from_shape(out_shape) {
        let coords = unravel_index(index, out_shape);
        for axis in 0..coords.len() {
            coords_in[axis] = coords[axis] + begin[axis];
            if coords_in[axis] >= in_shape[axis] {
                return Err(BackendError::invalid(
                    "slice",
                    format!("offsets {begin:?} read past input shape {in_shape:?}"),
                ));
            }
        }
        out.push(input[ravel_index(&coords_in, &in_strides)]);
    }
    Ok(out)
}

fn op_reverse(input: &[f32], shape: &[usize], axes: &[usize]) -> Vec<f32> {
    let in_strides = strides(shape);
    (0..input.len())
        .map(|index| {
            let mut coords = unravel_index(index, shape);
            for &axis in axes {
                coords[axis] = shape[axis] - 1 - coords[axis];
            }
            input[ravel_index(&coords, &in_strides)]
        })
        .collect()
}

fn op_concat2d(inputs: &[Vec<f32>], shapes: &[&[usize]]) -> Vec<f32> {
    let rows = shapes[0][0];
    let (a_cols, b_cols) = (shapes[0][1], shapes[1][1]);
    let mut out = Vec::with_capacity(rows * (a_cols + b_cols));
    for row in 0..rows {
        out.extend_from_slice(&inputs[0][row * a_cols..(row + 1) * a_cols]);
        out.extend_from_slice(&inputs[1][row * b_cols..(row + 1) * b_cols]);
    }
    out
}

fn op_tile(input: &[f32], in_shape: &[usize], out_shape: &[usize]) -> Vec<f32> {
    let in_strides = strides(in_shape);
    (0..size_from_shape(out_shape))
        .map(|index| {
            let mut coords = unravel_index(index, out_shape);
            for (coord, dim) in coords.iter_mut().zip(in_shape) {
                *coord %= *dim;
            }
            input[ravel_index(&coords, &in_strides)]
        })
        .collect()
}

fn op_pad(
    input: &[f32],
    in_shape: &[usize],
    out_shape: &[usize],
    paddings: &[(usize, usize)],
    value: Scalar,
) -> Vec<f32> {
    let in_strides = strides(in_shape);
    (0..size_from_shape(out_shape))
        .map(|index| {
            let mut coords = unravel_index(index, out_shape);
            for (axis, coord) in coords.iter_mut().enumerate() {
                let before = paddings[axis].0;
                if *coord < before || *coord >= before + in_shape[axis] {
                    return value.get();
                }
                *coord -= before;
            }
            input[ravel_index(&coords, &in_strides)]
        })
        .collect()
}

fn op_transpose(
    input: &[f32],
    in_shape: &[usize],
    out_shape: &[usize],
    perm: &[usize],
) -> Vec<f32> {
    let in_strides = strides(in_shape);
    (0..size_from_shape(out_shape))
        .map(|index| {
            let coords = unravel_index(index, out_shape);
            let source: usize = coords
                .iter()
                .enumerate()
                .map(|(out_axis, &c)| c * in_strides[perm[out_axis]])
                .sum();
            input[source]
        })
        .collect()
}

fn op_gather(
    inputs: &[Vec<f32>],
    shapes: &[&[usize]],
    out_shape: &[usize],
    axis: usize,
) -> BackendResult<Vec<f32>> {
    let in_shape = shapes[0];
    let in_strides = strides(in_shape);
    let mut out = Vec::with_capacity(size_from_shape(out_shape));
    for index in 0..size_from_shape(out_shape) {
        let mut coords = unravel_index(index, out_shape);
        let raw = inputs[1][coords[axis]];
        let source = raw.round();
        if source < 0.0 || source as usize >= in_shape[axis] {
            return Err(BackendError::invalid(
                "gather",
                format!("index {raw} out of range for axis {axis} of {in_shape:?}"),
            ));
        }
        coords[axis] = source as usize;
        out.push(inputs[0][ravel_index(&coords, &in_strides)]);
    }
    Ok(out)
}

fn op_cast(input: &[f32], to: DType) -> Vec<f32> {
    match to {
        DType::F32 => input.to_vec(),
        DType::I32 => input.iter().map(|x| x.trunc()).collect(),
        DType::Bool => input.iter().map(|&x| f32::from(u8::from(x != 0.0))).collect(),
    }
}

fn op_mat_mul(
    inputs: &[Vec<f32>],
    shapes: &[&[usize]],
    out_shape: &[usize],
    transpose_a: bool,
    transpose_b: bool,
) -> Vec<f32> {
    let (a, b) = (&inputs[0], &inputs[1]);
    let (a_cols, b_cols) = (shapes[0][1], shapes[1][1]);
    let (m, n) = (out_shape[0], out_shape[1]);
    let k = if transpose_a { shapes[0][0] } else { a_cols };
    let at = |i: usize, p: usize| if transpose_a { a[p * a_cols + i] } else { a[i * a_cols + p] };
    let bt = |p: usize, j: usize| if transpose_b { b[j * b_cols + p] } else { b[p * b_cols + j] };
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).map(|p| at(i, p) * bt(p, j)).sum();
        }
    }
    out
}

fn op_batch_norm(
    inputs: &[Vec<f32>],
    shapes: &[&[usize]],
    epsilon: Scalar,
    has_offset: bool,
    has_scale: bool,
) -> Vec<f32> {
    let x = &inputs[0];
    let x_shape = shapes[0];
    let channels = x_shape.last().copied().unwrap_or(1).max(1);
    let stat = |slot: usize, index: usize| {
        let values = &inputs[slot];
        if shapes[slot] == x_shape {
            values[index]
        } else {
            values[index % channels]
        }
    };
    let offset_slot = has_offset.then_some(3);
    let scale_slot = has_scale.then_some(3 + usize::from(has_offset));
    (0..x.len())
        .map(|index| {
            let mean = stat(1, index);
            let variance = stat(2, index);
            let offset = offset_slot.map_or(0.0, |slot| stat(slot, index));
            let scale = scale_slot.map_or(1.0, |slot| stat(slot, index));
            (x[index] - mean) * scale / (variance + epsilon.get()).sqrt() + offset
        })
        .collect()
}

fn op_lrn(
    input: &[f32],
    shape: &[usize],
    radius: usize,
    bias: Scalar,
    alpha: Scalar,
    beta: Scalar,
) -> Vec<f32> {
    let depth = shape[3];
    (0..input.len())
        .map(|index| {
            let d = index % depth;
            let base = index - d;
            let lo = d.saturating_sub(radius);
            let hi = (d + radius).min(depth - 1);
            let sum: f32 = input[base + lo..=base + hi].iter().map(|v| v * v).sum();
            input[index] * (bias.get() + alpha.get() * sum).powf(-beta.get())
        })
        .collect()
}

/// Input row read by output row `out` through filter row `tap`, if in bounds.
fn tap_row(info: &Conv2DInfo, out: usize, tap: usize) -> Option<usize> {
    (out * info.stride_height + tap * info.dilation_height)
        .checked_sub(info.pad_top)
        .filter(|row| *row < info.in_height)
}

fn tap_col(info: &Conv2DInfo, out: usize, tap: usize) -> Option<usize> {
    (out * info.stride_width + tap * info.dilation_width)
        .checked_sub(info.pad_left)
        .filter(|col| *col < info.in_width)
}

fn op_conv2d(inputs: &[Vec<f32>], info: &Conv2DInfo) -> Vec<f32> {
    let (x, w) = (&inputs[0], &inputs[1]);
    let (in_h, in_w, in_c, out_c) = (
        info.in_height,
        info.in_width,
        info.in_channels,
        info.out_channels,
    );
    let mut out = Vec::with_capacity(size_from_shape(&info.output_shape()));
    for b in 0..info.batch_size {
        for yr in 0..info.out_height {
            for yc in 0..info.out_width {
                for d2 in 0..out_c {
                    let mut acc = 0.0f32;
                    for wr in 0..info.filter_height {
                        let Some(xr) = tap_row(info, yr, wr) else {
                            continue;
                        };
                        for wc in 0..info.filter_width {
                            let Some(xc) = tap_col(info, yc, wc) else {
                                continue;
                            };
                            let x_base = ((b * in_h + xr) * in_w + xc) * in_c;
                            let w_base = (wr * info.filter_width + wc) * in_c * out_c;
                            for d1 in 0..in_c {
                                acc += x[x_base + d1] * w[w_base + d1 * out_c + d2];
                            }
                        }
                    }
                    out.push(acc);
                }
            }
        }
    }
    out
}

fn op_depthwise_conv2d(inputs: &[Vec<f32>], info: &Conv2DInfo) -> Vec<f32> {
    let (x, w) = (&inputs[0], &inputs[1]);
    let (in_h, in_w, in_c) = (info.in_height, info.in_width, info.in_channels);
    let multiplier = info.channel_multiplier().max(1);
    let mut out = Vec::with_capacity(size_from_shape(&info.output_shape()));
    for b in 0..info.batch_size {
        for yr in 0..info.out_height {
            for yc in 0..info.out_width {
                for d2 in 0..info.out_channels {
                    let (d1, q) = (d2 / multiplier, d2 % multiplier);
                    let mut acc = 0.0f32;
                    for wr in 0..info.filter_height {
                        let Some(xr) = tap_row(info, yr, wr) else {
                            continue;
                        };
                        for wc in 0..info.filter_width {
                            let Some(xc) = tap_col(info, yc, wc) else {
                                continue;
                            };
                            let xv = x[((b * in_h + xr) * in_w + xc) * in_c + d1];
                            let w_index = (wr * info.filter_width + wc) * in_c + d1;
                            let wv = w[w_index * multiplier + q];
                            acc += xv * wv;
                        }
                    }
                    out.push(acc);
                }
            }
        }
    }
    out
}

fn op_pool(kind: PoolKind, x: &[f32], info: &Conv2DInfo) -> Vec<f32> {
    let (in_h, in_w, channels) = (info.in_height, info.in_width, info.in_channels);
    let mut out = Vec::with_capacity(size_from_shape(&info.output_shape()));
    for b in 0..info.batch_size {
        for yr in 0..info.out_height {
            for yc in 0..info.out_width {
                for d in 0..channels {
                    let mut max = f32::NEG_INFINITY;
                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for wr in 0..info.filter_height {
                        let Some(xr) = tap_row(info, yr, wr) else {
                            continue;
                        };
                        for wc in 0..info.filter_width {
                            let Some(xc) = tap_col(info, yc, wc) else {
                                continue;
                            };
                            let value = x[((b * in_h + xr) * in_w + xc) * channels + d];
                            if value > max || value.is_nan() {
                                max = value;
                            }
                            sum += value;
                            count += 1;
                        }
                    }
                    out.push(match kind {
                        PoolKind::Max => max,
                        PoolKind::Avg => sum / count.max(1) as f32,
                    });
                }
            }
        }
    }
    out
}

/// Scatters each `dy` pixel onto every input pixel its output read.
fn op_conv2d_der_input(inputs: &[Vec<f32>], info: &Conv2DInfo) -> Vec<f32> {
    let (dy, w) = (&inputs[0], &inputs[1]);
    let (in_h, in_w, in_c, out_c) = (
        info.in_height,
        info.in_width,
        info.in_channels,
        info.out_channels,
    );
    let mut dx = vec![0.0f32; size_from_shape(&info.input_shape())];
    for b in 0..info.batch_size {
        for yr in 0..info.out_height {
            for yc in 0..info.out_width {
                let dy_base = ((b * info.out_height + yr) * info.out_width + yc) * out_c;
                for wr in 0..info.filter_height {
                    let Some(xr) = tap_row(info, yr, wr) else {
                        continue;
                    };
                    for wc in 0..info.filter_width {
                        let Some(xc) = tap_col(info, yc, wc) else {
                            continue;
                        };
                        let x_base = ((b * in_h + xr) * in_w + xc) * in_c;
                        let w_base = (wr * info.filter_width + wc) * in_c * out_c;
                        for d1 in 0..in_c {
                            let mut acc = 0.0f32;
                            for d2 in 0..out_c {
                                acc += dy[dy_base + d2] * w[w_base + d1 * out_c + d2];
                            }
                            dx[x_base + d1] += acc;
                        }
                    }
                }
            }
        }
    }
    dx
}

fn op_conv2d_der_filter(inputs: &[Vec<f32>], info: &Conv2DInfo) -> Vec<f32> {
    let (x, dy) = (&inputs[0], &inputs[1]);
    let (in_h, in_w, in_c, out_c) = (
        info.in_height,
        info.in_width,
        info.in_channels,
        info.out_channels,
    );
    let mut dw = vec![0.0f32; size_from_shape(&info.filter_shape())];
    for b in 0..info.batch_size {
        for yr in 0..info.out_height {
            for yc in 0..info.out_width {
                let dy_base = ((b * info.out_height + yr) * info.out_width + yc) * out_c;
                for wr in 0..info.filter_height {
                    let Some(xr) = tap_row(info, yr, wr) else {
                        continue;
                    };
                    for wc in 0..info.filter_width {
                        let Some(xc) = tap_col(info, yc, wc) else {
                            continue;
                        };
                        let x_base = ((b * in_h + xr) * in_w + xc) * in_c;
                        let w_base = (wr * info.filter_width + wc) * in_c * out_c;
                        for d1 in 0..in_c {
                            for d2 in 0..out_c {
                                dw[w_base + d1 * out_c + d2] += x[x_base + d1] * dy[dy_base + d2];
                            }
                        }
                    }
                }
            }
        }
    }
    dw
}

/// Flat `wr * filter_width + wc` of the first maximum in each window, or
/// -1 when the window lies entirely in padding.
fn op_max_pool_positions(x: &[f32], info: &Conv2DInfo) -> Vec<f32> {
    let (in_h, in_w, channels) = (info.in_height, info.in_width, info.in_channels);
    let mut out = Vec::with_capacity(size_from_shape(&info.output_shape()));
    for b in 0..info.batch_size {
        for yr in 0..info.out_height {
            for yc in 0..info.out_width {
                for d in 0..channels {
                    let mut max = f32::NEG_INFINITY;
                    let mut position = -1.0f32;
                    for wr in 0..info.filter_height {
                        let Some(xr) = tap_row(info, yr, wr) else {
                            continue;
                        };
                        for wc in 0..info.filter_width {
                            let Some(xc) = tap_col(info, yc, wc) else {
                                continue;
                            };
                            let value = x[((b * in_h + xr) * in_w + xc) * channels + d];
                            if position < 0.0 || value > max || (value.is_nan() && !max.is_nan()) {
                                max = value;
                                position = (wr * info.filter_width + wc) as f32;
                            }
                        }
                    }
                    out.push(position);
                }
            }
        }
    }
    out
}

fn op_max_pool_backprop(inputs: &[Vec<f32>], info: &Conv2DInfo) -> Vec<f32> {
    let (dy, positions) = (&inputs[0], &inputs[1]);
    let (in_h, in_w, channels) = (info.in_height, info.in_width, info.in_channels);
    let mut dx = vec![0.0f32; size_from_shape(&info.input_shape())];
    let mut index = 0;
    for b in 0..info.batch_size {
        for yr in 0..info.out_height {
            for yc in 0..info.out_width {
                for d in 0..channels {
                    let position = positions[index].round();
                    let grad = dy[index];
                    index += 1;
                    if position < 0.0 {
                        continue;
                    }
                    let position = position as usize;
                    let (wr, wc) = (position / info.filter_width, position % info.filter_width);
                    if let (Some(xr), Some(xc)) = (tap_row(info, yr, wr), tap_col(info, yc, wc)) {
                        dx[((b * in_h + xr) * in_w + xc) * channels + d] += grad;
                    }
                }
            }
        }
    }
    dx
}

/// Spreads each `dy` pixel evenly over the in-bounds taps of its window.
fn op_avg_pool_backprop(dy: &[f32], info: &Conv2DInfo) -> Vec<f32> {
    let (in_h, in_w, channels) = (info.in_height, info.in_width, info.in_channels);
    let mut dx = vec![0.0f32; size_from_shape(&info.input_shape())];
    let mut taps = Vec::with_capacity(info.filter_height * info.filter_width);
    for b in 0..info.batch_size {
        for yr in 0..info.out_height {
            for yc in 0..info.out_width {
                taps.clear();
                for wr in 0..info.filter_height {
                    let Some(xr) = tap_row(info, yr, wr) else {
                        continue;
                    };
                    for wc in 0..info.filter_width {
                        if let Some(xc) = tap_col(info, yc, wc) {
                            taps.push((b * in_h + xr) * in_w + xc);
                        }
                    }
                }
                if taps.is_empty() {
                    continue;
                }
                let dy_base = ((b * info.out_height + yr) * info.out_width + yc) * channels;
                for d in 0..channels {
                    let share = dy[dy_base + d] / taps.len() as f32;
                    for &pixel in &taps {
                        dx[pixel * channels + d] += share;
                    }
                }
            }
        }
    }
    dx
}

/// Source step per output pixel along one axis.
fn resize_ratio(input: usize, output: usize, align_corners: bool) -> f32 {
    let (eff_in, eff_out) = if align_corners && output > 1 {
        (input - 1, output - 1)
    } else {
        (input, output)
    };
    eff_in as f32 / eff_out as f32
}

fn op_resize(
    x: &[f32],
    in_shape: &[usize],
    out_shape: &[usize],
    align_corners: bool,
    nearest: bool,
) -> Vec<f32> {
    let (batch, in_h, in_w, channels) = (in_shape[0], in_shape[1], in_shape[2], in_shape[3]);
    let (out_h, out_w) = (out_shape[1], out_shape[2]);
    let h_ratio = resize_ratio(in_h, out_h, align_corners);
    let w_ratio = resize_ratio(in_w, out_w, align_corners);
    let at = |b: usize, r: usize, c: usize, d: usize| x[((b * in_h + r) * in_w + c) * channels + d];
    let mut out = Vec::with_capacity(batch * out_h * out_w * channels);
    for b in 0..batch {
        for yr in 0..out_h {
            let src_r = yr as f32 * h_ratio;
            for yc in 0..out_w {
                let src_c = yc as f32 * w_ratio;
                for d in 0..channels {
                    if nearest {
                        let pick = |src: f32, limit: usize| {
                            let index = if align_corners { src.round() } else { src.floor() };
                            (index as usize).min(limit - 1)
                        };
                        out.push(at(b, pick(src_r, in_h), pick(src_c, in_w), d));
                        continue;
                    }
                    let r0 = (src_r.floor() as usize).min(in_h - 1);
                    let c0 = (src_c.floor() as usize).min(in_w - 1);
                    let r1 = (src_r.ceil() as usize).min(in_h - 1);
                    let c1 = (src_c.ceil() as usize).min(in_w - 1);
                    let (fr, fc) = (src_r - r0 as f32, src_c - c0 as f32);
                    let top = at(b, r0, c0, d) + (at(b, r0, c1, d) - at(b, r0, c0, d)) * fc;
                    let bottom = at(b, r1, c0, d) + (at(b, r1, c1, d) - at(b, r1, c0, d)) * fc;
                    out.push(top + (bottom - top) * fr);
                }
            }
        }
    }
    out
}

/// Adjoint of bilinear resize: each `dy` pixel is split over the four
/// source pixels it was blended from.
fn op_resize_bilinear_backprop(
    dy: &[f32],
    dy_shape: &[usize],
    x_shape: &[usize],
    align_corners: bool,
) -> Vec<f32> {
    let (batch, in_h, in_w, channels) = (x_shape[0], x_shape[1], x_shape[2], x_shape[3]);
    let (out_h, out_w) = (dy_shape[1], dy_shape[2]);
    let h_ratio = resize_ratio(in_h, out_h, align_corners);
    let w_ratio = resize_ratio(in_w, out_w, align_corners);
    let mut dx = vec![0.0f32; size_from_shape(x_shape)];
    let at = |b: usize, r: usize, c: usize, d: usize| ((b * in_h + r) * in_w + c) * channels + d;
    for b in 0..batch {
        for yr in 0..out_h {
            let src_r = yr as f32 * h_ratio;
            let r0 = (src_r.floor() as usize).min(in_h - 1);
            let r1 = (src_r.ceil() as usize).min(in_h - 1);
            let fr = src_r - r0 as f32;
            for yc in 0..out_w {
                let src_c = yc as f32 * w_ratio;
                let c0 = (src_c.floor() as usize).min(in_w - 1);
                let c1 = (src_c.ceil() as usize).min(in_w - 1);
                let fc = src_c - c0 as f32;
                for d in 0..channels {
                    let grad = dy[((b * out_h + yr) * out_w + yc) * channels + d];
                    dx[at(b, r0, c0, d)] += grad * (1.0 - fr) * (1.0 - fc);
                    dx[at(b, r0, c1, d)] += grad * (1.0 - fr) * fc;
                    dx[at(b, r1, c0, d)] += grad * fr * (1.0 - fc);
                    dx[at(b, r1, c1, d)] += grad * fr * fc;
                }
            }
        }
    }
    dx
}

fn op_one_hot(indices: &[f32], depth: usize, on_value: Scalar, off_value: Scalar) -> Vec<f32> {
    let mut out = Vec::with_capacity(indices.len() * depth);
    for &index in indices {
        let hot = index.round();
        for column in 0..depth {
            out.push(if hot == column as f32 {
                on_value.get()
            } else {
                off_value.get()
            });
        }
    }
    out
}

fn op_multinomial(
    probs: &[f32],
    shape: &[usize],
    num_samples: usize,
    params: &ParamBinding,
) -> BackendResult<Vec<f32>> {
    let ParamBinding::Seed(seed) = params else {
        return Err(BackendError::ParamMismatch(format!(
            "multinomial expects a seed, got {params:?}"
        )));
    };
    let (batch, outcomes) = (shape[0], shape[1]);
    let mut rng = StdRng::seed_from_u64(*seed);
    let mut out = Vec::with_capacity(batch * num_samples);
    let mut cdf = vec![0.0f32; outcomes];
    for row in 0..batch {
        let mut total = 0.0f32;
        for (slot, p) in cdf.iter_mut().zip(&probs[row * outcomes..(row + 1) * outcomes]) {
            total += p.max(0.0);
            *slot = total;
        }
        for _ in 0..num_samples {
            let draw = rng.gen::<f32>() * total;
            let pick = cdf
                .iter()
                .position(|&bound| draw < bound)
                .unwrap_or(outcomes - 1);
            out.push(pick as f32);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{PackingKind, TextureShape};
    use crate::programs::OperandLayout;

    fn layout(shape: &[usize]) -> OperandLayout {
        OperandLayout {
            shape: shape.to_vec(),
            texture_shape: TextureShape::new(1, 1),
            dtype: DType::F32,
            packing: PackingKind::Float,
        }
    }

    fn signature(op: OpKind, inputs: &[&[usize]], output: &[usize]) -> KernelSignature {
        KernelSignature {
            op,
            inputs: inputs.iter().map(|shape| layout(shape)).collect(),
            output: layout(output),
        }
    }

    #[test]
    fn arg_max_second_pass_follows_best_indices() {
        // Row of 6 values reduced with window 3 then 2.
        let x = vec![1.0, 9.0, 2.0, 3.0, 4.0, 8.0];
        let first = execute_kernel(
            &signature(
                OpKind::ArgReduce {
                    op: ArgReduceOp::Max,
                    window: 3,
                    first_pass: true,
                },
                &[&[1, 6]],
                &[1, 2],
            ),
            &[x.clone()],
            &ParamBinding::None,
        )
        .unwrap();
        assert_eq!(first, vec![1.0, 5.0]);
        let second = execute_kernel(
            &signature(
                OpKind::ArgReduce {
                    op: ArgReduceOp::Max,
                    window: 2,
                    first_pass: false,
                },
                &[&[1, 6], &[1, 2]],
                &[1, 1],
            ),
            &[x, first],
            &ParamBinding::None,
        )
        .unwrap();
        assert_eq!(second, vec![1.0]);
    }

    #[test]
    fn conv2d_same_padding_sums_neighbourhood() {
        let info = crate::programs::conv::compute_conv2d_info(
            "conv2d",
            &[1, 3, 3, 1],
            &[3, 3, 1, 1],
            crate::programs::ConvParams::new((1, 1), crate::programs::Padding::Same),
            false,
        )
        .unwrap();
        let out = execute_kernel(
            &signature(OpKind::Conv2D(info), &[&[1, 3, 3, 1], &[3, 3, 1, 1]], &[1, 3, 3, 1]),
            &[vec![1.0; 9], vec![1.0; 9]],
            &ParamBinding::None,
        )
        .unwrap();
        assert_eq!(out, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn multinomial_is_deterministic_per_seed() {
        let sig = signature(OpKind::Multinomial { num_samples: 8 }, &[&[1, 3]], &[1, 8]);
        let probs = vec![0.0, 1.0, 0.0];
        let a = execute_kernel(&sig, &[probs.clone()], &ParamBinding::Seed(7)).unwrap();
        let b = execute_kernel(&sig, &[probs], &ParamBinding::Seed(7)).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|&v| v == 1.0));
    }
}
