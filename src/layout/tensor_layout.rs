use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Number of elements packed into one image texel (RGBA).
pub const TEXEL_CHANNELS: usize = 4;

/// A tensor layout describes the shape and strides of a tensor in memory.
/// It maps logical indices of a tensor to element offsets in its buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct TensorLayout {
    /// The shape of the tensor (dimensions)
    shape: Vec<usize>,
    /// The strides of the tensor (number of elements to skip in each dimension)
    strides: Vec<usize>,
}

impl TensorLayout {
    /// Create a standard contiguous (row-major) layout for the given shape.
    pub fn contiguous_layout(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: Self::compute_contiguous_strides(shape),
        }
    }

    /// Calculate contiguous strides for a given shape in row-major (C-style) order.
    /// e.g., for shape [2, 3, 4], strides would be [12, 4, 1]
    pub fn compute_contiguous_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Calculate the element offset for the given multi-dimensional indices.
    pub fn index_of(&self, indices: &[usize]) -> Result<usize> {
        if indices.len() != self.shape.len() {
            return Err(Error::ShapeMismatch(format!(
                "Got {} indices for tensor of rank {}",
                indices.len(),
                self.shape.len()
            )));
        }

        let mut index = 0;
        for (i, &idx) in indices.iter().enumerate() {
            if idx >= self.shape[i] {
                return Err(Error::ShapeMismatch(format!(
                    "Index {} out of bounds for dimension {} of size {}",
                    idx, i, self.shape[i]
                )));
            }
            index += idx * self.strides[i];
        }
        Ok(index)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Debug for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorLayout {{ shape: {:?}, strides: {:?} }}", self.shape, self.strides)
    }
}

/// How a tensor is packed into a 2D device image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum ImageBufferType {
    /// Activations in NCHW order: channels packed by four along the width
    InOutChannel,
    /// Filters in OIHW order: input channels packed by four along the width
    Conv2dFilter,
    /// One-dimensional arguments such as bias
    Argument,
}

/// Image extent in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub width: usize,
    pub height: usize,
}

impl ImageShape {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Texel count, or `None` if it does not fit in `usize`
    pub fn texels(&self) -> Option<usize> {
        self.width.checked_mul(self.height)
    }

    /// Number of elements the image can hold
    pub fn element_capacity(&self) -> Option<usize> {
        self.texels()?.checked_mul(TEXEL_CHANNELS)
    }

    pub fn size_in_bytes(&self, element_size: usize) -> Result<usize> {
        self.element_capacity()
            .and_then(|elements| elements.checked_mul(element_size))
            .ok_or_else(|| {
                Error::Allocation(format!(
                    "Image {}x{} of {}-byte elements exceeds the addressable size",
                    self.width, self.height, element_size
                ))
            })
    }

    /// Compute the texel extent needed to store a tensor of `shape` as an
    /// image of the given buffer type.
    pub fn for_tensor(shape: &[usize], buffer_type: ImageBufferType) -> Result<Self> {
        match buffer_type {
            ImageBufferType::InOutChannel => {
                let [n, c, h, w] = pad_to_rank4(shape)?;
                let extent = round_up_div4(c).checked_mul(w).zip(n.checked_mul(h));
                extent
                    .map(|(width, height)| Self::new(width, height))
                    .ok_or_else(|| image_too_large(shape))
            }
            ImageBufferType::Conv2dFilter => {
                if shape.len() != 4 {
                    return Err(Error::ShapeMismatch(format!(
                        "Filter image requires an OIHW shape, got {:?}",
                        shape
                    )));
                }
                let (o, i, h, w) = (shape[0], shape[1], shape[2], shape[3]);
                round_up_div4(i)
                    .checked_mul(h)
                    .and_then(|width| width.checked_mul(w))
                    .map(|width| Self::new(width, o))
                    .ok_or_else(|| image_too_large(shape))
            }
            ImageBufferType::Argument => {
                if shape.len() != 1 {
                    return Err(Error::ShapeMismatch(format!(
                        "Argument image requires a 1-D shape, got {:?}",
                        shape
                    )));
                }
                Ok(Self::new(round_up_div4(shape[0]), 1))
            }
        }
    }
}

pub(crate) fn round_up_div4(value: usize) -> usize {
    value / TEXEL_CHANNELS + usize::from(value % TEXEL_CHANNELS != 0)
}

fn image_too_large(shape: &[usize]) -> Error {
    Error::Allocation(format!("Image extent of shape {:?} overflows", shape))
}

/// Element count of `shape`, or `None` if the product overflows `usize`
pub fn checked_element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim))
}

/// Bytes needed for `shape` elements of `element_size` bytes each
pub fn checked_byte_size(shape: &[usize], element_size: usize) -> Option<usize> {
    checked_element_count(shape)?.checked_mul(element_size)
}

/// Trailing dims default to 1, so `[N, C]` is treated as `[N, C, 1, 1]`.
fn pad_to_rank4(shape: &[usize]) -> Result<[usize; 4]> {
    if shape.is_empty() || shape.len() > 4 {
        return Err(Error::ShapeMismatch(format!(
            "Image layout supports ranks 1 to 4, got {:?}",
            shape
        )));
    }
    let mut dims = [1; 4];
    dims[..shape.len()].copy_from_slice(shape);
    Ok(dims)
}
