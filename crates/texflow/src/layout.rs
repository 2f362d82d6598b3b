//! Logical to physical layout helpers.
//!
//! Tensors live on the device as 2-D grids of RGBA texels. A plain-float
//! texture stores one logical element per texel (channel 0), row-major.

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};

/// Element encoding of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackingKind {
    Float,
    /// Unsigned 8-bit channels, as filled by `GpgpuBackend::from_pixels`.
    /// Uploads round and clamp each value to `0..=255`.
    PixelByte,
}

/// Texel grid dimensions of a device texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureShape {
    pub rows: usize,
    pub cols: usize,
}

impl TextureShape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn texel_count(self) -> usize {
        self.rows * self.cols
    }
}

pub fn size_from_shape(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major contiguous strides.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut out = vec![0usize; shape.len()];
    let mut stride = 1usize;
    for axis in (0..shape.len()).rev() {
        out[axis] = stride;
        stride *= shape[axis];
    }
    out
}

pub fn unravel_index(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut coords = vec![0usize; shape.len()];
    for axis in (0..shape.len()).rev() {
        let dim = shape[axis].max(1);
        coords[axis] = index % dim;
        index /= dim;
    }
    coords
}

pub fn ravel_index(coords: &[usize], strides: &[usize]) -> usize {
    coords.iter().zip(strides).map(|(c, s)| c * s).sum()
}

/// Near-square texel grid able to hold `size` elements.
pub fn squarish_shape(size: usize) -> TextureShape {
    let width = (size as f64).sqrt().ceil() as usize;
    let width = width.max(1);
    TextureShape::new(width, size.div_ceil(width).max(1))
}

/// Maps a logical shape onto a texel grid no larger than `max_texture_size`
/// in either dimension.
pub fn texture_shape_from_logical(
    shape: &[usize],
    max_texture_size: usize,
) -> BackendResult<TextureShape> {
    let size = size_from_shape(shape);
    if size == 0 {
        return Ok(TextureShape::new(1, 1));
    }
    let fits = |value: usize| value <= max_texture_size;
    let candidate = match shape {
        [] | [_] if fits(size) => Some(TextureShape::new(size, 1)),
        [rows, cols] if fits(*rows) && fits(*cols) => Some(TextureShape::new(*rows, *cols)),
        [d0, d1, d2] if fits(d0 * d1) && fits(*d2) => Some(TextureShape::new(d0 * d1, *d2)),
        [d0, d1, d2, d3] if fits(d0 * d1 * d2) && fits(*d3) => {
            Some(TextureShape::new(d0 * d1 * d2, *d3))
        }
        _ => None,
    };
    if let Some(found) = candidate {
        return Ok(found);
    }
    let squarish = squarish_shape(size);
    if !fits(squarish.rows) || !fits(squarish.cols) {
        return Err(BackendError::invalid(
            "texture_shape_from_logical",
            format!(
                "shape {shape:?} ({size} elements) does not fit a \
                 {max_texture_size}x{max_texture_size} texture"
            ),
        ));
    }
    Ok(squarish)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_become_single_column() {
        let shape = texture_shape_from_logical(&[7], 16).unwrap();
        assert_eq!(shape, TextureShape::new(7, 1));
        let scalar = texture_shape_from_logical(&[], 16).unwrap();
        assert_eq!(scalar, TextureShape::new(1, 1));
    }

    #[test]
    fn higher_ranks_fold_leading_dims() {
        assert_eq!(
            texture_shape_from_logical(&[2, 3, 4], 16).unwrap(),
            TextureShape::new(6, 4)
        );
        assert_eq!(
            texture_shape_from_logical(&[2, 2, 3, 5], 16).unwrap(),
            TextureShape::new(12, 5)
        );
    }

    #[test]
    fn oversized_vectors_fall_back_to_squarish() {
        let shape = texture_shape_from_logical(&[20], 8).unwrap();
        assert_eq!(shape, TextureShape::new(5, 4));
        assert!(shape.texel_count() >= 20);
    }

    #[test]
    fn too_large_tensors_are_rejected() {
        let err = texture_shape_from_logical(&[100], 4).unwrap_err();
        assert!(matches!(err, BackendError::InvalidArgument { .. }));
    }

    #[test]
    fn unravel_and_ravel_agree() {
        let shape = [2, 3, 4];
        let st = strides(&shape);
        for index in 0..size_from_shape(&shape) {
            assert_eq!(ravel_index(&unravel_index(index, &shape), &st), index);
        }
    }
}
