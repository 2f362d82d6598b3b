//! Tensor operations exposed by the backend.
//!
//! Each op validates its operands, builds a descriptor from the kernel
//! catalogue and hands it to the dispatch engine.

use super::{DataId, GpgpuBackend};
use crate::dtype::{ensure_dtype, DType};
use crate::error::{BackendError, BackendResult};
use crate::programs::{
    binary, conv, ensure_rank, nn, shape_ops, unary, BinaryOp, ConvParams, ParamBinding, PoolKind,
    Scalar, UnaryOp,
};

macro_rules! unary_ops {
    ($($(#[$meta:meta])* $name:ident => $op:ident),* $(,)?) => {
        impl GpgpuBackend {
            $(
                $(#[$meta])*
                pub fn $name(&mut self, x: DataId) -> BackendResult<DataId> {
                    self.unary(UnaryOp::$op, x)
                }
            )*
        }
    };
}

macro_rules! binary_ops {
    ($($(#[$meta:meta])* $name:ident => $op:ident),* $(,)?) => {
        impl GpgpuBackend {
            $(
                $(#[$meta])*
                pub fn $name(&mut self, a: DataId, b: DataId) -> BackendResult<DataId> {
                    self.binary(BinaryOp::$op, a, b)
                }
            )*
        }
    };
}

unary_ops! {
    neg => Neg,
    ceil => Ceil,
    floor => Floor,
    sign => Sign,
    /// Rounds half to even.
    round => Round,
    exp => Exp,
    expm1 => Expm1,
    log => Log,
    log1p => Log1p,
    sqrt => Sqrt,
    rsqrt => Rsqrt,
    square => Square,
    reciprocal => Reciprocal,
    relu => Relu,
    elu => Elu,
    selu => Selu,
    abs => Abs,
    sigmoid => Sigmoid,
    softplus => Softplus,
    sin => Sin,
    cos => Cos,
    tan => Tan,
    asin => Asin,
    acos => Acos,
    atan => Atan,
    sinh => Sinh,
    cosh => Cosh,
    tanh => Tanh,
    asinh => Asinh,
    acosh => Acosh,
    atanh => Atanh,
    erf => Erf,
    /// Truncates towards zero into an `i32` tensor.
    to_int => ToInt,
}

binary_ops! {
    add => Add,
    subtract => Sub,
    multiply => Mul,
    pow => Pow,
    minimum => Minimum,
    maximum => Maximum,
    modulo => Mod,
    squared_difference => SquaredDifference,
    atan2 => Atan2,
    /// Gradient of `elu` from the upstream gradient `a` and the forward output `b`.
    elu_der => EluDer,
    equal => Equal,
    not_equal => NotEqual,
    less => Less,
    less_equal => LessEqual,
    greater => Greater,
    greater_equal => GreaterEqual,
}

impl GpgpuBackend {
    pub fn unary(&mut self, op: UnaryOp, x: DataId) -> BackendResult<DataId> {
        let shape = self.shape(x)?;
        self.run(unary::descriptor(op, &shape), &[x], None, &ParamBinding::None)
    }

    /// `1` where `x > 0`, otherwise `alpha`.
    pub fn step(&mut self, x: DataId, alpha: f32) -> BackendResult<DataId> {
        self.unary(
            UnaryOp::Step {
                alpha: Scalar::new(alpha),
            },
            x,
        )
    }

    pub fn clip(&mut self, x: DataId, min: f32, max: f32) -> BackendResult<DataId> {
        if min > max {
            return Err(BackendError::invalid(
                "clip",
                format!("min {min} exceeds max {max}"),
            ));
        }
        self.unary(
            UnaryOp::Clip {
                min: Scalar::new(min),
                max: Scalar::new(max),
            },
            x,
        )
    }

    pub fn logical_not(&mut self, x: DataId) -> BackendResult<DataId> {
        ensure_dtype("logical_not", self.dtype(x)?, &[DType::Bool])?;
        self.unary(UnaryOp::LogicalNot, x)
    }

    pub fn binary(&mut self, op: BinaryOp, a: DataId, b: DataId) -> BackendResult<DataId> {
        let (a_shape, a_dtype) = (self.shape(a)?, self.dtype(a)?);
        let (b_shape, b_dtype) = (self.shape(b)?, self.dtype(b)?);
        let descriptor = binary::descriptor(op, (&a_shape, a_dtype), (&b_shape, b_dtype))?;
        self.run(descriptor, &[a, b], None, &ParamBinding::None)
    }

    /// Floor division when both operands are `i32`, float division otherwise.
    pub fn divide(&mut self, a: DataId, b: DataId) -> BackendResult<DataId> {
        let op = binary::divide_op(self.dtype(a)?, self.dtype(b)?);
        self.binary(op, a, b)
    }

    pub fn logical_and(&mut self, a: DataId, b: DataId) -> BackendResult<DataId> {
        self.ensure_bool_operands("logical_and", a, b)?;
        self.binary(BinaryOp::LogicalAnd, a, b)
    }

    pub fn logical_or(&mut self, a: DataId, b: DataId) -> BackendResult<DataId> {
        self.ensure_bool_operands("logical_or", a, b)?;
        self.binary(BinaryOp::LogicalOr, a, b)
    }

    fn ensure_bool_operands(&self, op: &'static str, a: DataId, b: DataId) -> BackendResult<()> {
        ensure_dtype(op, self.dtype(a)?, &[DType::Bool])?;
        ensure_dtype(op, self.dtype(b)?, &[DType::Bool])
    }

    /// Elementwise `condition ? a : b`.
    pub fn select(&mut self, condition: DataId, a: DataId, b: DataId) -> BackendResult<DataId> {
        ensure_dtype("select", self.dtype(condition)?, &[DType::Bool])?;
        let (a_dtype, b_dtype) = (self.dtype(a)?, self.dtype(b)?);
        if a_dtype != b_dtype {
            return Err(BackendError::DTypeMismatch {
                handle: b,
                expected: a_dtype,
                found: b_dtype,
            });
        }
        let descriptor = shape_ops::select(
            &self.shape(condition)?,
            &self.shape(a)?,
            &self.shape(b)?,
            a_dtype,
        )?;
        self.run(descriptor, &[condition, a, b], None, &ParamBinding::None)
    }

    pub fn slice(&mut self, x: DataId, begin: &[usize], size: &[usize]) -> BackendResult<DataId> {
        let descriptor = shape_ops::slice(&self.shape(x)?, begin, size)?;
        self.run(descriptor, &[x], None, &ParamBinding::Offsets(begin.to_vec()))
    }

    pub fn reverse(&mut self, x: DataId, axes: &[usize]) -> BackendResult<DataId> {
        let descriptor = shape_ops::reverse(&self.shape(x)?, axes)?;
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    /// Concatenates two matrices along their columns.
    pub fn concat2d(&mut self, a: DataId, b: DataId) -> BackendResult<DataId> {
        let (a_dtype, b_dtype) = (self.dtype(a)?, self.dtype(b)?);
        if a_dtype != b_dtype {
            return Err(BackendError::DTypeMismatch {
                handle: b,
                expected: a_dtype,
                found: b_dtype,
            });
        }
        let descriptor = shape_ops::concat2d(&self.shape(a)?, &self.shape(b)?)?;
        self.run(descriptor, &[a, b], None, &ParamBinding::None)
    }

    pub fn tile(&mut self, x: DataId, reps: &[usize]) -> BackendResult<DataId> {
        let descriptor = shape_ops::tile(&self.shape(x)?, reps)?;
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    pub fn pad(
        &mut self,
        x: DataId,
        paddings: &[(usize, usize)],
        value: f32,
    ) -> BackendResult<DataId> {
        let descriptor = shape_ops::pad(&self.shape(x)?, paddings, value)?;
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    pub fn transpose(&mut self, x: DataId, perm: &[usize]) -> BackendResult<DataId> {
        let descriptor = shape_ops::transpose(&self.shape(x)?, perm)?;
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    /// Picks slices of `x` along `axis` using the `i32` vector `indices`.
    pub fn gather(&mut self, x: DataId, indices: DataId, axis: usize) -> BackendResult<DataId> {
        ensure_dtype("gather", self.dtype(indices)?, &[DType::I32])?;
        let descriptor = shape_ops::gather(&self.shape(x)?, &self.shape(indices)?, axis)?;
        self.run(descriptor, &[x, indices], None, &ParamBinding::None)
    }

    /// Reinterprets `x` with a new shape of the same size.
    ///
    /// Host-resident values are copied directly; device-resident tensors go
    /// through a copy kernel.
    pub fn reshape(&mut self, x: DataId, shape: &[usize]) -> BackendResult<DataId> {
        let record = self.table.get(x)?;
        let descriptor = shape_ops::reshape(&record.shape, shape)?;
        if let Some(values) = record.values.clone() {
            return self.make_tensor_with(shape, values);
        }
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    pub fn cast(&mut self, x: DataId, dtype: DType) -> BackendResult<DataId> {
        let descriptor = shape_ops::cast(&self.shape(x)?, dtype);
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    pub fn mat_mul(
        &mut self,
        a: DataId,
        b: DataId,
        transpose_a: bool,
        transpose_b: bool,
    ) -> BackendResult<DataId> {
        ensure_dtype("mat_mul", self.dtype(a)?, &[DType::F32])?;
        ensure_dtype("mat_mul", self.dtype(b)?, &[DType::F32])?;
        let descriptor = nn::mat_mul(&self.shape(a)?, &self.shape(b)?, transpose_a, transpose_b)?;
        self.run(descriptor, &[a, b], None, &ParamBinding::None)
    }

    /// Normalises `x` over its last axis with precomputed statistics.
    ///
    /// Each statistic is either a per-channel vector or a tensor of `x`'s
    /// shape.
    pub fn batch_normalization(
        &mut self,
        x: DataId,
        mean: DataId,
        variance: DataId,
        offset: Option<DataId>,
        scale: Option<DataId>,
        epsilon: f32,
    ) -> BackendResult<DataId> {
        let mut inputs = vec![x, mean, variance];
        inputs.extend(offset);
        inputs.extend(scale);
        for &input in &inputs {
            ensure_dtype("batch_normalization", self.dtype(input)?, &[DType::F32])?;
        }
        let shapes = inputs[1..]
            .iter()
            .map(|&id| self.shape(id))
            .collect::<BackendResult<Vec<_>>>()?;
        let stats: Vec<&[usize]> = shapes.iter().map(Vec::as_slice).collect();
        let descriptor = nn::batch_normalization(
            &self.shape(x)?,
            &stats,
            epsilon,
            offset.is_some(),
            scale.is_some(),
        )?;
        self.run(descriptor, &inputs, None, &ParamBinding::None)
    }

    /// Normalises each NHWC element by the activity of its `radius`
    /// neighbouring channels.
    pub fn local_response_normalization(
        &mut self,
        x: DataId,
        radius: usize,
        bias: f32,
        alpha: f32,
        beta: f32,
    ) -> BackendResult<DataId> {
        let descriptor =
            nn::local_response_normalization(&self.shape(x)?, radius, bias, alpha, beta)?;
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    /// NHWC convolution with an `[fh, fw, in, out]` filter.
    pub fn conv2d(
        &mut self,
        x: DataId,
        filter: DataId,
        params: ConvParams,
    ) -> BackendResult<DataId> {
        let (x_shape, filter_shape) = (self.shape(x)?, self.shape(filter)?);
        let info = conv::compute_conv2d_info("conv2d", &x_shape, &filter_shape, params, false)?;
        self.run(conv::conv2d_descriptor(info), &[x, filter], None, &ParamBinding::None)
    }

    /// NHWC depthwise convolution with an `[fh, fw, in, multiplier]` filter.
    pub fn depthwise_conv2d(
        &mut self,
        x: DataId,
        filter: DataId,
        params: ConvParams,
    ) -> BackendResult<DataId> {
        let info = conv::compute_conv2d_info(
            "depthwise_conv2d",
            &self.shape(x)?,
            &self.shape(filter)?,
            params,
            true,
        )?;
        self.run(
            conv::depthwise_descriptor(info),
            &[x, filter],
            None,
            &ParamBinding::None,
        )
    }

    pub fn max_pool(
        &mut self,
        x: DataId,
        filter_size: (usize, usize),
        params: ConvParams,
    ) -> BackendResult<DataId> {
        self.pool2d(PoolKind::Max, x, filter_size, params)
    }

    /// Average over the in-bounds positions of each window.
    pub fn avg_pool(
        &mut self,
        x: DataId,
        filter_size: (usize, usize),
        params: ConvParams,
    ) -> BackendResult<DataId> {
        self.pool2d(PoolKind::Avg, x, filter_size, params)
    }

    fn pool2d(
        &mut self,
        kind: PoolKind,
        x: DataId,
        filter_size: (usize, usize),
        params: ConvParams,
    ) -> BackendResult<DataId> {
        let info = conv::compute_pool_info(kind.name(), &self.shape(x)?, filter_size, params)?;
        self.run(conv::pool_descriptor(kind, info), &[x], None, &ParamBinding::None)
    }

    /// Gradient of [`conv2d`](Self::conv2d) with respect to an input of
    /// `input_shape`, given the upstream gradient `dy` and the forward filter.
    pub fn conv2d_der_input(
        &mut self,
        dy: DataId,
        filter: DataId,
        input_shape: &[usize],
        params: ConvParams,
    ) -> BackendResult<DataId> {
        let op = "conv2d_der_input";
        ensure_dtype(op, self.dtype(dy)?, &[DType::F32])?;
        let info = conv::compute_conv2d_info(op, input_shape, &self.shape(filter)?, params, false)?;
        conv::ensure_gradient_shape(op, &self.shape(dy)?, &info)?;
        self.run(
            conv::conv2d_der_input_descriptor(info),
            &[dy, filter],
            None,
            &ParamBinding::None,
        )
    }

    /// Gradient of [`conv2d`](Self::conv2d) with respect to a filter of
    /// `filter_shape`, given the forward input `x` and the upstream gradient.
    pub fn conv2d_der_filter(
        &mut self,
        x: DataId,
        dy: DataId,
        filter_shape: &[usize],
        params: ConvParams,
    ) -> BackendResult<DataId> {
        let op = "conv2d_der_filter";
        ensure_dtype(op, self.dtype(dy)?, &[DType::F32])?;
        let info = conv::compute_conv2d_info(op, &self.shape(x)?, filter_shape, params, false)?;
        conv::ensure_gradient_shape(op, &self.shape(dy)?, &info)?;
        self.run(
            conv::conv2d_der_filter_descriptor(info),
            &[x, dy],
            None,
            &ParamBinding::None,
        )
    }

    /// Routes `dy` to the element that won each window of the forward
    /// [`max_pool`](Self::max_pool) over `x`. Ties go to the first winner.
    pub fn max_pool_backprop(
        &mut self,
        dy: DataId,
        x: DataId,
        filter_size: (usize, usize),
        params: ConvParams,
    ) -> BackendResult<DataId> {
        let op = "max_pool_backprop";
        ensure_dtype(op, self.dtype(dy)?, &[DType::F32])?;
        let info = conv::compute_pool_info(op, &self.shape(x)?, filter_size, params)?;
        conv::ensure_gradient_shape(op, &self.shape(dy)?, &info)?;
        let positions = self.run(
            conv::max_pool_positions_descriptor(info),
            &[x],
            None,
            &ParamBinding::None,
        )?;
        let result = self.run(
            conv::max_pool_backprop_descriptor(info),
            &[dy, positions],
            None,
            &ParamBinding::None,
        );
        self.dispose_data(positions)?;
        result
    }

    /// Spreads `dy` evenly over the in-bounds taps of each forward
    /// [`avg_pool`](Self::avg_pool) window over `x`.
    pub fn avg_pool_backprop(
        &mut self,
        dy: DataId,
        x: DataId,
        filter_size: (usize, usize),
        params: ConvParams,
    ) -> BackendResult<DataId> {
        let op = "avg_pool_backprop";
        ensure_dtype(op, self.dtype(dy)?, &[DType::F32])?;
        let info = conv::compute_pool_info(op, &self.shape(x)?, filter_size, params)?;
        conv::ensure_gradient_shape(op, &self.shape(dy)?, &info)?;
        self.run(conv::avg_pool_backprop_descriptor(info), &[dy], None, &ParamBinding::None)
    }

    pub fn resize_bilinear(
        &mut self,
        x: DataId,
        new_height: usize,
        new_width: usize,
        align_corners: bool,
    ) -> BackendResult<DataId> {
        let descriptor = nn::resize(&self.shape(x)?, new_height, new_width, align_corners, false)?;
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    pub fn resize_nearest_neighbor(
        &mut self,
        x: DataId,
        new_height: usize,
        new_width: usize,
        align_corners: bool,
    ) -> BackendResult<DataId> {
        let descriptor = nn::resize(&self.shape(x)?, new_height, new_width, align_corners, true)?;
        self.run(descriptor, &[x], None, &ParamBinding::None)
    }

    /// Gradient of [`resize_bilinear`](Self::resize_bilinear) with respect
    /// to its input `x`.
    pub fn resize_bilinear_backprop(
        &mut self,
        dy: DataId,
        x: DataId,
        align_corners: bool,
    ) -> BackendResult<DataId> {
        ensure_dtype("resize_bilinear_backprop", self.dtype(dy)?, &[DType::F32])?;
        let descriptor =
            nn::resize_bilinear_backprop(&self.shape(dy)?, &self.shape(x)?, align_corners)?;
        self.run(descriptor, &[dy], None, &ParamBinding::None)
    }

    /// Expands an `i32` index vector into `[len, depth]` rows; the output
    /// takes `dtype`.
    pub fn one_hot(
        &mut self,
        indices: DataId,
        depth: usize,
        on_value: f32,
        off_value: f32,
        dtype: DType,
    ) -> BackendResult<DataId> {
        ensure_dtype("one_hot", self.dtype(indices)?, &[DType::I32])?;
        let descriptor =
            nn::one_hot(&self.shape(indices)?, depth, on_value, off_value)?.with_dtype(dtype);
        self.run(descriptor, &[indices], None, &ParamBinding::None)
    }

    /// Draws `num_samples` outcome indices per row of a `[batch, outcomes]`
    /// tensor.
    ///
    /// Unless `normalized` is set the rows are treated as logits and passed
    /// through a softmax first. The same seed yields the same draws.
    pub fn multinomial(
        &mut self,
        logits: DataId,
        num_samples: usize,
        seed: u64,
        normalized: bool,
    ) -> BackendResult<DataId> {
        ensure_dtype("multinomial", self.dtype(logits)?, &[DType::F32])?;
        let shape = self.shape(logits)?;
        let descriptor = nn::multinomial(&shape, num_samples)?;
        if normalized {
            return self.run(descriptor, &[logits], None, &ParamBinding::Seed(seed));
        }
        let probs = self.softmax(logits)?;
        let result = self.run(descriptor, &[probs], None, &ParamBinding::Seed(seed));
        self.dispose_data(probs)?;
        result
    }

    /// Softmax over the last axis of a matrix.
    pub fn softmax(&mut self, logits: DataId) -> BackendResult<DataId> {
        let shape = self.shape(logits)?;
        ensure_rank("softmax", &shape, 2)?;
        let mut scratch = Vec::new();
        let result = self.softmax_into(logits, &shape, &mut scratch);
        for id in scratch {
            self.dispose_data(id)?;
        }
        result
    }

    fn softmax_into(
        &mut self,
        logits: DataId,
        shape: &[usize],
        scratch: &mut Vec<DataId>,
    ) -> BackendResult<DataId> {
        let column = [shape[0], 1];
        let max = self.max(logits, &[1])?;
        scratch.push(max);
        let max = self.reshape(max, &column)?;
        scratch.push(max);
        let shifted = self.subtract(logits, max)?;
        scratch.push(shifted);
        let exps = self.exp(shifted)?;
        scratch.push(exps);
        let total = self.sum(exps, &[1])?;
        scratch.push(total);
        let total = self.reshape(total, &column)?;
        scratch.push(total);
        self.divide(exps, total)
    }

    pub fn top_k_values(&mut self, _x: DataId, _k: usize) -> BackendResult<DataId> {
        Err(BackendError::not_implemented("top_k_values"))
    }

    pub fn top_k_indices(&mut self, _x: DataId, _k: usize) -> BackendResult<DataId> {
        Err(BackendError::not_implemented("top_k_indices"))
    }
}
