mod common;

use anyhow::Result;
use texflow::{BackendError, ConvParams, DType, Padding};

use common::{
    assert_close, backend, bool_tensor, f32_tensor, i32_tensor, read_bool, read_f32, read_i32,
};

#[test]
fn unary_ops_apply_elementwise() -> Result<()> {
    let (_device, mut backend) = backend();
    let x = f32_tensor(&mut backend, &[4], &[0.5, 1.5, 2.5, -1.5])?;
    let rounded = backend.round(x)?;
    assert_eq!(read_f32(&mut backend, rounded)?, vec![0.0, 2.0, 2.0, -2.0]);

    let y = f32_tensor(&mut backend, &[3], &[-2.0, 0.0, 3.0])?;
    let stepped = backend.step(y, 0.1)?;
    assert_close(&read_f32(&mut backend, stepped)?, &[0.1, 0.1, 1.0], 1e-6);
    let clipped = backend.clip(y, 0.0, 1.0)?;
    assert_eq!(read_f32(&mut backend, clipped)?, vec![0.0, 0.0, 1.0]);
    let activated = backend.relu(y)?;
    assert_eq!(read_f32(&mut backend, activated)?, vec![0.0, 0.0, 3.0]);
    let squashed = backend.sigmoid(y)?;
    assert_close(&read_f32(&mut backend, squashed)?, &[0.119_203, 0.5, 0.952_574], 1e-5);
    assert!(matches!(
        backend.clip(y, 1.0, 0.0),
        Err(BackendError::InvalidArgument { .. })
    ));
    Ok(())
}

#[test]
fn dtype_changing_unary_ops() -> Result<()> {
    let (_device, mut backend) = backend();
    let x = f32_tensor(&mut backend, &[2], &[1.7, -1.7])?;
    let truncated = backend.to_int(x)?;
    assert_eq!(backend.dtype(truncated)?, DType::I32);
    assert_eq!(read_i32(&mut backend, truncated)?, vec![1, -1]);

    let flags = bool_tensor(&mut backend, &[2], &[true, false])?;
    let flipped = backend.logical_not(flags)?;
    assert_eq!(read_bool(&mut backend, flipped)?, vec![false, true]);
    assert!(matches!(
        backend.logical_not(x),
        Err(BackendError::UnsupportedDType { .. })
    ));
    Ok(())
}

#[test]
fn binary_ops_broadcast_trailing_axes() -> Result<()> {
    let (_device, mut backend) = backend();
    let a = f32_tensor(&mut backend, &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    let b = f32_tensor(&mut backend, &[3], &[10.0, 20.0, 30.0])?;
    let sum = backend.add(a, b)?;
    assert_eq!(backend.shape(sum)?, vec![2, 3]);
    assert_eq!(read_f32(&mut backend, sum)?, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

    let c = f32_tensor(&mut backend, &[2], &[1.0, 2.0])?;
    assert!(matches!(
        backend.multiply(a, c),
        Err(BackendError::InvalidArgument { .. })
    ));
    Ok(())
}

#[test]
fn divide_floors_integer_operands() -> Result<()> {
    let (_device, mut backend) = backend();
    let a = i32_tensor(&mut backend, &[2], &[7, -7])?;
    let b = i32_tensor(&mut backend, &[2], &[2, 2])?;
    let quotient = backend.divide(a, b)?;
    assert_eq!(backend.dtype(quotient)?, DType::I32);
    assert_eq!(read_i32(&mut backend, quotient)?, vec![3, -4]);

    let f = f32_tensor(&mut backend, &[2], &[2.0, 2.0])?;
    let ratio = backend.divide(a, f)?;
    assert_eq!(backend.dtype(ratio)?, DType::F32);
    assert_eq!(read_f32(&mut backend, ratio)?, vec![3.5, -3.5]);
    Ok(())
}

#[test]
fn arithmetic_upcasts_and_comparisons_yield_bool() -> Result<()> {
    let (_device, mut backend) = backend();
    let a = i32_tensor(&mut backend, &[2], &[2, 3])?;
    let b = i32_tensor(&mut backend, &[2], &[3, 2])?;
    let powered = backend.pow(a, b)?;
    assert_eq!(backend.dtype(powered)?, DType::I32);
    assert_eq!(read_i32(&mut backend, powered)?, vec![8, 9]);

    let f = f32_tensor(&mut backend, &[2], &[0.5, 0.5])?;
    let mixed = backend.add(a, f)?;
    assert_eq!(backend.dtype(mixed)?, DType::F32);

    let less = backend.less(a, b)?;
    assert_eq!(backend.dtype(less)?, DType::Bool);
    assert_eq!(read_bool(&mut backend, less)?, vec![true, false]);
    let equal = backend.equal(a, a)?;
    assert_eq!(read_bool(&mut backend, equal)?, vec![true, true]);
    Ok(())
}

#[test]
fn logical_ops_require_bool_operands() -> Result<()> {
    let (_device, mut backend) = backend();
    let p = bool_tensor(&mut backend, &[4], &[true, true, false, false])?;
    let q = bool_tensor(&mut backend, &[4], &[true, false, true, false])?;
    let and = backend.logical_and(p, q)?;
    assert_eq!(read_bool(&mut backend, and)?, vec![true, false, false, false]);
    let or = backend.logical_or(p, q)?;
    assert_eq!(read_bool(&mut backend, or)?, vec![true, true, true, false]);

    let x = f32_tensor(&mut backend, &[4], &[1.0; 4])?;
    assert!(matches!(
        backend.logical_and(p, x),
        Err(BackendError::UnsupportedDType { .. })
    ));
    Ok(())
}

#[test]
fn select_picks_per_element_and_per_row() -> Result<()> {
    let (_device, mut backend) = backend();
    let cond = bool_tensor(&mut backend, &[3], &[true, false, true])?;
    let a = f32_tensor(&mut backend, &[3], &[1.0, 2.0, 3.0])?;
    let b = f32_tensor(&mut backend, &[3], &[10.0, 20.0, 30.0])?;
    let picked = backend.select(cond, a, b)?;
    assert_eq!(read_f32(&mut backend, picked)?, vec![1.0, 20.0, 3.0]);

    let rows = bool_tensor(&mut backend, &[2], &[false, true])?;
    let m = f32_tensor(&mut backend, &[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
    let n = f32_tensor(&mut backend, &[2, 2], &[5.0, 6.0, 7.0, 8.0])?;
    let picked = backend.select(rows, m, n)?;
    assert_eq!(read_f32(&mut backend, picked)?, vec![5.0, 6.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn shape_ops_rearrange_elements() -> Result<()> {
    let (_device, mut backend) = backend();
    let grid: Vec<f32> = (0..9).map(|v| v as f32).collect();
    let x = f32_tensor(&mut backend, &[3, 3], &grid)?;
    let window = backend.slice(x, &[1, 1], &[2, 2])?;
    assert_eq!(read_f32(&mut backend, window)?, vec![4.0, 5.0, 7.0, 8.0]);
    let corner = backend.slice(x, &[0, 0], &[2, 2])?;
    assert_eq!(read_f32(&mut backend, corner)?, vec![0.0, 1.0, 3.0, 4.0]);
    assert_eq!(backend.kernel_cache_stats().entries, 1, "offsets are bound per run");

    let m = f32_tensor(&mut backend, &[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])?;
    let reversed = backend.reverse(m, &[1])?;
    assert_eq!(read_f32(&mut backend, reversed)?, vec![2.0, 1.0, 0.0, 5.0, 4.0, 3.0]);
    let transposed = backend.transpose(m, &[1, 0])?;
    assert_eq!(backend.shape(transposed)?, vec![3, 2]);
    assert_eq!(read_f32(&mut backend, transposed)?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);

    let left = f32_tensor(&mut backend, &[2, 1], &[1.0, 2.0])?;
    let right = f32_tensor(&mut backend, &[2, 2], &[3.0, 4.0, 5.0, 6.0])?;
    let joined = backend.concat2d(left, right)?;
    assert_eq!(read_f32(&mut backend, joined)?, vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);

    let v = f32_tensor(&mut backend, &[2], &[1.0, 2.0])?;
    let tiled = backend.tile(v, &[3])?;
    assert_eq!(read_f32(&mut backend, tiled)?, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    let padded = backend.pad(v, &[(1, 2)], -1.0)?;
    assert_eq!(read_f32(&mut backend, padded)?, vec![-1.0, 1.0, 2.0, -1.0, -1.0]);
    Ok(())
}

#[test]
fn gather_checks_index_range() -> Result<()> {
    let (_device, mut backend) = backend();
    let x = f32_tensor(&mut backend, &[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    let indices = i32_tensor(&mut backend, &[2], &[2, 0])?;
    let rows = backend.gather(x, indices, 0)?;
    assert_eq!(read_f32(&mut backend, rows)?, vec![5.0, 6.0, 1.0, 2.0]);

    let bad = i32_tensor(&mut backend, &[1], &[3])?;
    let before = backend.num_data_ids();
    assert!(matches!(
        backend.gather(x, bad, 0),
        Err(BackendError::InvalidArgument { .. })
    ));
    assert_eq!(backend.num_data_ids(), before);
    Ok(())
}

#[test]
fn reshape_and_cast() -> Result<()> {
    let (device, mut backend) = backend();
    let x = f32_tensor(&mut backend, &[2, 3], &[1.9, -1.9, 0.0, 2.0, 0.5, -0.5])?;
    let flat = backend.reshape(x, &[6])?;
    assert_eq!(device.stats()?.program_runs, 0, "host values are copied");
    assert_eq!(backend.shape(flat)?, vec![6]);

    let doubled = backend.add(x, x)?;
    let runs = device.stats()?.program_runs;
    let cube = backend.reshape(doubled, &[3, 2, 1])?;
    assert_eq!(device.stats()?.program_runs, runs + 1);
    assert_eq!(
        read_f32(&mut backend, cube)?,
        vec![3.8, -3.8, 0.0, 4.0, 1.0, -1.0]
    );
    assert!(matches!(
        backend.reshape(x, &[4]),
        Err(BackendError::ShapeMismatch { .. })
    ));

    let ints = backend.cast(x, DType::I32)?;
    assert_eq!(read_i32(&mut backend, ints)?, vec![1, -1, 0, 2, 0, 0]);
    let flags = backend.cast(x, DType::Bool)?;
    assert_eq!(
        read_bool(&mut backend, flags)?,
        vec![true, true, false, true, true, true]
    );
    Ok(())
}

#[test]
fn mat_mul_with_and_without_transposes() -> Result<()> {
    let (_device, mut backend) = backend();
    let a = f32_tensor(&mut backend, &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    let b = f32_tensor(&mut backend, &[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0])?;
    let product = backend.mat_mul(a, b, false, false)?;
    assert_eq!(read_f32(&mut backend, product)?, vec![58.0, 64.0, 139.0, 154.0]);

    let gram = backend.mat_mul(a, a, false, true)?;
    assert_eq!(backend.shape(gram)?, vec![2, 2]);
    assert_eq!(read_f32(&mut backend, gram)?, vec![14.0, 32.0, 32.0, 77.0]);
    assert!(matches!(
        backend.mat_mul(a, a, false, false),
        Err(BackendError::InvalidArgument { .. })
    ));
    Ok(())
}

#[test]
fn normalization_ops() -> Result<()> {
    let (_device, mut backend) = backend();
    let x = f32_tensor(&mut backend, &[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
    let mean = f32_tensor(&mut backend, &[2], &[2.0, 3.0])?;
    let variance = f32_tensor(&mut backend, &[2], &[1.0, 4.0])?;
    let offset = f32_tensor(&mut backend, &[2], &[0.5, 0.5])?;
    let scale = f32_tensor(&mut backend, &[2], &[2.0, 2.0])?;
    let normed =
        backend.batch_normalization(x, mean, variance, Some(offset), Some(scale), 0.0)?;
    assert_close(&read_f32(&mut backend, normed)?, &[-1.5, -0.5, 2.5, 1.5], 1e-6);

    let plain = backend.batch_normalization(x, mean, variance, None, None, 0.0)?;
    assert_close(&read_f32(&mut backend, plain)?, &[-1.0, -0.5, 1.0, 0.5], 1e-6);

    let channels = f32_tensor(&mut backend, &[1, 1, 1, 2], &[1.0, 2.0])?;
    let lrn = backend.local_response_normalization(channels, 1, 1.0, 1.0, 1.0)?;
    assert_close(&read_f32(&mut backend, lrn)?, &[1.0 / 6.0, 2.0 / 6.0], 1e-6);
    Ok(())
}

#[test]
fn convolutions_and_pooling() -> Result<()> {
    let (_device, mut backend) = backend();
    let image = f32_tensor(&mut backend, &[1, 3, 3, 1], &[1.0; 9])?;
    let ones = f32_tensor(&mut backend, &[3, 3, 1, 1], &[1.0; 9])?;
    let same = backend.conv2d(image, ones, ConvParams::new((1, 1), Padding::Same))?;
    assert_eq!(backend.shape(same)?, vec![1, 3, 3, 1]);
    assert_eq!(
        read_f32(&mut backend, same)?,
        vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]
    );
    let valid = backend.conv2d(image, ones, ConvParams::new((1, 1), Padding::Valid))?;
    assert_eq!(read_f32(&mut backend, valid)?, vec![9.0]);

    let pixels = f32_tensor(&mut backend, &[1, 1, 2, 2], &[1.0, 2.0, 3.0, 4.0])?;
    let gains = f32_tensor(&mut backend, &[1, 1, 2, 1], &[2.0, 3.0])?;
    let scaled =
        backend.depthwise_conv2d(pixels, gains, ConvParams::new((1, 1), Padding::Valid))?;
    assert_eq!(read_f32(&mut backend, scaled)?, vec![2.0, 6.0, 6.0, 12.0]);

    let patch = f32_tensor(&mut backend, &[1, 2, 2, 1], &[1.0, 2.0, 3.0, 4.0])?;
    let params = ConvParams::new((2, 2), Padding::Valid);
    let max = backend.max_pool(patch, (2, 2), params)?;
    assert_eq!(read_f32(&mut backend, max)?, vec![4.0]);
    let avg = backend.avg_pool(patch, (2, 2), params)?;
    assert_eq!(read_f32(&mut backend, avg)?, vec![2.5]);
    Ok(())
}

#[test]
fn convolution_gradients() -> Result<()> {
    let (_device, mut backend) = backend();
    let same = ConvParams::new((1, 1), Padding::Same);
    let dy = f32_tensor(&mut backend, &[1, 3, 3, 1], &[1.0; 9])?;
    let ones = f32_tensor(&mut backend, &[3, 3, 1, 1], &[1.0; 9])?;
    let dx = backend.conv2d_der_input(dy, ones, &[1, 3, 3, 1], same)?;
    assert_eq!(backend.shape(dx)?, vec![1, 3, 3, 1]);
    assert_eq!(
        read_f32(&mut backend, dx)?,
        vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]
    );

    let x = f32_tensor(&mut backend, &[1, 2, 2, 1], &[1.0, 2.0, 3.0, 4.0])?;
    let scalar_dy = f32_tensor(&mut backend, &[1, 1, 1, 1], &[2.0])?;
    let valid = ConvParams::new((1, 1), Padding::Valid);
    let dw = backend.conv2d_der_filter(x, scalar_dy, &[2, 2, 1, 1], valid)?;
    assert_eq!(backend.shape(dw)?, vec![2, 2, 1, 1]);
    assert_eq!(read_f32(&mut backend, dw)?, vec![2.0, 4.0, 6.0, 8.0]);

    let short_dy = f32_tensor(&mut backend, &[1, 2, 2, 1], &[1.0; 4])?;
    let err = backend.conv2d_der_input(short_dy, ones, &[1, 3, 3, 1], same).unwrap_err();
    assert!(matches!(err, BackendError::InvalidArgument { .. }));
    Ok(())
}

#[test]
fn pooling_gradients() -> Result<()> {
    let (_device, mut backend) = backend();
    let params = ConvParams::new((2, 2), Padding::Valid);
    let x = f32_tensor(&mut backend, &[1, 2, 2, 1], &[1.0, 4.0, 3.0, 2.0])?;
    let dy = f32_tensor(&mut backend, &[1, 1, 1, 1], &[5.0])?;

    let before = backend.num_data_ids();
    let routed = backend.max_pool_backprop(dy, x, (2, 2), params)?;
    assert_eq!(backend.num_data_ids(), before + 1);
    assert_eq!(read_f32(&mut backend, routed)?, vec![0.0, 5.0, 0.0, 0.0]);

    let tied = f32_tensor(&mut backend, &[1, 2, 2, 1], &[7.0, 7.0, 1.0, 1.0])?;
    let first = backend.max_pool_backprop(dy, tied, (2, 2), params)?;
    assert_eq!(read_f32(&mut backend, first)?, vec![5.0, 0.0, 0.0, 0.0]);

    let four = f32_tensor(&mut backend, &[1, 1, 1, 1], &[4.0])?;
    let spread = backend.avg_pool_backprop(four, x, (2, 2), params)?;
    assert_eq!(read_f32(&mut backend, spread)?, vec![1.0, 1.0, 1.0, 1.0]);

    let err = backend.avg_pool_backprop(x, x, (2, 2), params).unwrap_err();
    assert!(matches!(err, BackendError::InvalidArgument { .. }));
    Ok(())
}

#[test]
fn resize_bilinear_gradient_sums_blend_weights() -> Result<()> {
    let (_device, mut backend) = backend();
    let x = f32_tensor(&mut backend, &[1, 1, 2, 1], &[0.0, 1.0])?;
    let dy = f32_tensor(&mut backend, &[1, 1, 3, 1], &[1.0; 3])?;
    let dx = backend.resize_bilinear_backprop(dy, x, true)?;
    assert_eq!(backend.shape(dx)?, vec![1, 1, 2, 1]);
    assert_close(&read_f32(&mut backend, dx)?, &[1.5, 1.5], 1e-6);

    let wide = f32_tensor(&mut backend, &[1, 1, 2, 3], &[0.0; 6])?;
    let err = backend.resize_bilinear_backprop(dy, wide, true).unwrap_err();
    assert!(matches!(err, BackendError::InvalidArgument { .. }));
    Ok(())
}

#[test]
fn resizing() -> Result<()> {
    let (_device, mut backend) = backend();
    let row = f32_tensor(&mut backend, &[1, 1, 2, 1], &[0.0, 1.0])?;
    let smooth = backend.resize_bilinear(row, 1, 3, true)?;
    assert_close(&read_f32(&mut backend, smooth)?, &[0.0, 0.5, 1.0], 1e-6);

    let block = f32_tensor(&mut backend, &[1, 2, 2, 1], &[1.0, 2.0, 3.0, 4.0])?;
    let nearest = backend.resize_nearest_neighbor(block, 4, 4, false)?;
    assert_eq!(backend.shape(nearest)?, vec![1, 4, 4, 1]);
    assert_eq!(
        read_f32(&mut backend, nearest)?,
        vec![
            1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0,
        ]
    );
    Ok(())
}

#[test]
fn one_hot_rows() -> Result<()> {
    let (_device, mut backend) = backend();
    let indices = i32_tensor(&mut backend, &[2], &[0, 2])?;
    let encoded = backend.one_hot(indices, 3, 1.0, 0.0, DType::F32)?;
    assert_eq!(backend.shape(encoded)?, vec![2, 3]);
    assert_eq!(read_f32(&mut backend, encoded)?, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    Ok(())
}

#[test]
fn multinomial_sampling_is_seeded() -> Result<()> {
    let (_device, mut backend) = backend();
    let probs = f32_tensor(&mut backend, &[1, 3], &[0.0, 1.0, 0.0])?;
    let draws = backend.multinomial(probs, 5, 11, true)?;
    assert_eq!(backend.dtype(draws)?, DType::I32);
    assert_eq!(read_i32(&mut backend, draws)?, vec![1; 5]);

    let logits = f32_tensor(&mut backend, &[2, 3], &[-100.0, 100.0, -100.0, 50.0, -50.0, -50.0])?;
    let before = backend.num_data_ids();
    let draws = backend.multinomial(logits, 4, 11, false)?;
    assert_eq!(backend.num_data_ids(), before + 1, "softmax scratch is released");
    assert_eq!(read_i32(&mut backend, draws)?, vec![1, 1, 1, 1, 0, 0, 0, 0]);

    let spread = f32_tensor(&mut backend, &[1, 4], &[0.25; 4])?;
    let first = backend.multinomial(spread, 16, 42, true)?;
    let second = backend.multinomial(spread, 16, 42, true)?;
    assert_eq!(read_i32(&mut backend, first)?, read_i32(&mut backend, second)?);
    Ok(())
}

#[test]
fn softmax_rows_sum_to_one() -> Result<()> {
    let (_device, mut backend) = backend();
    let logits = f32_tensor(&mut backend, &[2, 3], &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0])?;
    let probs = backend.softmax(logits)?;
    let values = read_f32(&mut backend, probs)?;
    assert_close(&values[3..], &[1.0 / 3.0; 3], 1e-6);
    assert_close(&[values[..3].iter().sum::<f32>()], &[1.0], 1e-5);
    assert!(values[2] > values[1] && values[1] > values[0]);
    Ok(())
}

#[test]
fn top_k_is_not_available() -> Result<()> {
    let (_device, mut backend) = backend();
    let x = f32_tensor(&mut backend, &[4], &[1.0, 3.0, 2.0, 0.0])?;
    assert_eq!(
        backend.top_k_values(x, 2),
        Err(BackendError::NotImplemented { op: "top_k_values" })
    );
    assert!(matches!(
        backend.top_k_indices(x, 2),
        Err(BackendError::NotImplemented { .. })
    ));
    Ok(())
}
