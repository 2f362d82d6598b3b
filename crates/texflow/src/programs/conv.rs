//! 2-D convolution and pooling geometry over NHWC tensors.

use serde::Serialize;

use crate::dtype::DType;
use crate::error::{BackendError, BackendResult};
use crate::programs::{ensure_rank, KernelDescriptor, OpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Padding {
    /// Output covers `ceil(in / stride)` positions, padding split evenly.
    Same,
    /// Only positions where the filter fits entirely.
    Valid,
    /// The same amount of zero padding on every border.
    Explicit(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PoolKind {
    Max,
    Avg,
}

impl PoolKind {
    pub fn name(self) -> &'static str {
        match self {
            PoolKind::Max => "max_pool",
            PoolKind::Avg => "avg_pool",
        }
    }
}

/// Resolved geometry shared by convolution and pooling kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Conv2DInfo {
    pub batch_size: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub in_channels: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub out_channels: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub dilation_height: usize,
    pub dilation_width: usize,
    pub filter_height: usize,
    pub filter_width: usize,
    pub pad_top: usize,
    pub pad_left: usize,
}

impl Conv2DInfo {
    pub fn output_shape(&self) -> Vec<usize> {
        vec![
            self.batch_size,
            self.out_height,
            self.out_width,
            self.out_channels,
        ]
    }

    pub fn input_shape(&self) -> Vec<usize> {
        vec![
            self.batch_size,
            self.in_height,
            self.in_width,
            self.in_channels,
        ]
    }

    /// `[fh, fw, in, out]` filter of a regular convolution.
    pub fn filter_shape(&self) -> Vec<usize> {
        vec![
            self.filter_height,
            self.filter_width,
            self.in_channels,
            self.out_channels,
        ]
    }

    /// Depthwise channel multiplier.
    pub fn channel_multiplier(&self) -> usize {
        self.out_channels / self.in_channels.max(1)
    }

    pub fn effective_filter_height(&self) -> usize {
        effective_filter(self.filter_height, self.dilation_height)
    }

    pub fn effective_filter_width(&self) -> usize {
        effective_filter(self.filter_width, self.dilation_width)
    }
}

fn effective_filter(size: usize, dilation: usize) -> usize {
    (size - 1) * dilation + 1
}

/// Output extent and leading pad along one spatial axis.
fn resolve_axis(
    op: &'static str,
    input: usize,
    filter: usize,
    stride: usize,
    padding: Padding,
) -> BackendResult<(usize, usize)> {
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let total = ((out.saturating_sub(1)) * stride + filter).saturating_sub(input);
            Ok((out, total / 2))
        }
        Padding::Valid => {
            if filter > input {
                return Err(BackendError::invalid(
                    op,
                    format!("filter extent {filter} exceeds input extent {input}"),
                ));
            }
            Ok(((input - filter + 1).div_ceil(stride), 0))
        }
        Padding::Explicit(pad) => {
            let padded = input + 2 * pad;
            if filter > padded {
                return Err(BackendError::invalid(
                    op,
                    format!("filter extent {filter} exceeds padded input extent {padded}"),
                ));
            }
            Ok(((padded - filter) / stride + 1, pad))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConvParams {
    pub strides: (usize, usize),
    pub dilations: (usize, usize),
    pub padding: Padding,
}

impl ConvParams {
    pub fn new(strides: (usize, usize), padding: Padding) -> Self {
        Self {
            strides,
            dilations: (1, 1),
            padding,
        }
    }

    pub fn with_dilations(mut self, dilations: (usize, usize)) -> Self {
        self.dilations = dilations;
        self
    }
}

/// Geometry for an NHWC input and an `[fh, fw, in, out]` (or `[fh, fw, in,
/// multiplier]` when `depthwise`) filter.
pub fn compute_conv2d_info(
    op: &'static str,
    input: &[usize],
    filter: &[usize],
    params: ConvParams,
    depthwise: bool,
) -> BackendResult<Conv2DInfo> {
    ensure_rank(op, input, 4)?;
    ensure_rank(op, filter, 4)?;
    let (stride_height, stride_width) = params.strides;
    let (dilation_height, dilation_width) = params.dilations;
    if stride_height == 0 || stride_width == 0 || dilation_height == 0 || dilation_width == 0 {
        return Err(BackendError::invalid(op, "strides and dilations must be positive"));
    }
    if filter[0] == 0 || filter[1] == 0 {
        return Err(BackendError::invalid(op, "filter must be non-empty"));
    }
    if filter[2] != input[3] {
        return Err(BackendError::invalid(
            op,
            format!(
                "filter input depth {} does not match input channels {}",
                filter[2], input[3]
            ),
        ));
    }
    let eff_h = effective_filter(filter[0], dilation_height);
    let eff_w = effective_filter(filter[1], dilation_width);
    let (out_height, pad_top) = resolve_axis(op, input[1], eff_h, stride_height, params.padding)?;
    let (out_width, pad_left) = resolve_axis(op, input[2], eff_w, stride_width, params.padding)?;
    let out_channels = if depthwise {
        input[3] * filter[3]
    } else {
        filter[3]
    };
    Ok(Conv2DInfo {
        batch_size: input[0],
        in_height: input[1],
        in_width: input[2],
        in_channels: input[3],
        out_height,
        out_width,
        out_channels,
        stride_height,
        stride_width,
        dilation_height,
        dilation_width,
        filter_height: filter[0],
        filter_width: filter[1],
        pad_top,
        pad_left,
    })
}

/// Pooling geometry; channels pass through unchanged.
pub fn compute_pool_info(
    op: &'static str,
    input: &[usize],
    filter_size: (usize, usize),
    params: ConvParams,
) -> BackendResult<Conv2DInfo> {
    ensure_rank(op, input, 4)?;
    let filter = [filter_size.0, filter_size.1, input[3], 1];
    compute_conv2d_info(op, input, &filter, params, true)
}

pub fn conv2d_descriptor(info: Conv2DInfo) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::Conv2D(info), info.output_shape())
}

pub fn depthwise_descriptor(info: Conv2DInfo) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::DepthwiseConv2D(info), info.output_shape())
}

pub fn pool_descriptor(kind: PoolKind, info: Conv2DInfo) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::Pool { kind, info }, info.output_shape())
}

/// Checks that an upstream gradient has the forward output's shape.
pub fn ensure_gradient_shape(
    op: &'static str,
    dy: &[usize],
    info: &Conv2DInfo,
) -> BackendResult<()> {
    let expected = info.output_shape();
    if dy == expected.as_slice() {
        Ok(())
    } else {
        Err(BackendError::invalid(
            op,
            format!("gradient shape {dy:?} does not match forward output {expected:?}"),
        ))
    }
}

/// Gradient of `conv2d` with respect to its input, from `[dy, filter]`.
pub fn conv2d_der_input_descriptor(info: Conv2DInfo) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::Conv2DDerInput(info), info.input_shape())
}

/// Gradient of `conv2d` with respect to its filter, from `[x, dy]`.
pub fn conv2d_der_filter_descriptor(info: Conv2DInfo) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::Conv2DDerFilter(info), info.filter_shape())
}

pub fn max_pool_positions_descriptor(info: Conv2DInfo) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::MaxPoolPositions(info), info.output_shape())
        .with_dtype(DType::I32)
}

/// Routes `dy` back to the winners recorded by `max_pool_positions`, from
/// `[dy, positions]`.
pub fn max_pool_backprop_descriptor(info: Conv2DInfo) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::MaxPoolBackprop(info), info.input_shape())
}

pub fn avg_pool_backprop_descriptor(info: Conv2DInfo) -> KernelDescriptor {
    KernelDescriptor::new(OpKind::AvgPoolBackprop(info), info.input_shape())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_covers_input() {
        let info = compute_conv2d_info(
            "conv2d",
            &[1, 5, 5, 2],
            &[3, 3, 2, 4],
            ConvParams::new((2, 2), Padding::Same),
            false,
        )
        .unwrap();
        assert_eq!(info.output_shape(), vec![1, 3, 3, 4]);
        assert_eq!(info.pad_top, 1);
        assert_eq!(info.pad_left, 1);
    }

    #[test]
    fn valid_padding_shrinks() {
        let info = compute_conv2d_info(
            "conv2d",
            &[2, 4, 6, 1],
            &[2, 3, 1, 1],
            ConvParams::new((1, 1), Padding::Valid),
            false,
        )
        .unwrap();
        assert_eq!(info.output_shape(), vec![2, 3, 4, 1]);
    }

    #[test]
    fn depthwise_multiplies_channels() {
        let info = compute_conv2d_info(
            "depthwise_conv2d",
            &[1, 4, 4, 3],
            &[2, 2, 3, 2],
            ConvParams::new((1, 1), Padding::Valid),
            true,
        )
        .unwrap();
        assert_eq!(info.out_channels, 6);
        assert_eq!(info.channel_multiplier(), 2);
    }

    #[test]
    fn pool_keeps_channels() {
        let params = ConvParams::new((2, 2), Padding::Valid);
        let info = compute_pool_info("max_pool", &[1, 4, 4, 3], (2, 2), params).unwrap();
        assert_eq!(info.output_shape(), vec![1, 2, 2, 3]);
    }

    #[test]
    fn gradient_descriptors_mirror_forward_shapes() {
        let info = compute_conv2d_info(
            "conv2d",
            &[2, 5, 5, 3],
            &[3, 3, 3, 4],
            ConvParams::new((2, 2), Padding::Same),
            false,
        )
        .unwrap();
        assert_eq!(conv2d_der_input_descriptor(info).output_shape, vec![2, 5, 5, 3]);
        assert_eq!(conv2d_der_filter_descriptor(info).output_shape, vec![3, 3, 3, 4]);
        assert!(ensure_gradient_shape("conv2d_der_input", &[2, 3, 3, 4], &info).is_ok());
        assert!(ensure_gradient_shape("conv2d_der_input", &[2, 5, 5, 4], &info).is_err());
        assert_eq!(
            max_pool_positions_descriptor(info).output_dtype,
            Some(DType::I32)
        );
    }

    #[test]
    fn mismatched_depth_is_rejected() {
        let err = compute_conv2d_info(
            "conv2d",
            &[1, 4, 4, 3],
            &[2, 2, 2, 1],
            ConvParams::new((1, 1), Padding::Same),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::InvalidArgument { .. }));
    }
}
