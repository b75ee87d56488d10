use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Implicit padding scheme of a convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum PaddingMode {
    Valid = 0,
    Same = 1,
    Full = 2,
}

impl PaddingMode {
    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(PaddingMode::Valid),
            1 => Ok(PaddingMode::Same),
            2 => Ok(PaddingMode::Full),
            _ => Err(Error::InvalidOperator(format!("Unknown padding mode {}", value))),
        }
    }
}

/// Framework a model was converted from; decides how deconv padding is given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum FrameworkType {
    /// The desired output shape is an operator input
    Tensorflow = 0,
    /// Explicit paddings are operator arguments
    Caffe = 1,
    /// Same convention as Caffe
    Onnx = 2,
}

impl FrameworkType {
    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(FrameworkType::Tensorflow),
            1 => Ok(FrameworkType::Caffe),
            2 => Ok(FrameworkType::Onnx),
            _ => Err(Error::InvalidOperator(format!("Unknown framework type {}", value))),
        }
    }

    /// Whether the output shape comes in as a tensor
    pub fn takes_output_shape(&self) -> bool {
        matches!(self, FrameworkType::Tensorflow)
    }
}

/// Spatial sizes of one transposed convolution, as `[height, width]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeconvGeometry {
    /// Extent before any cropping
    pub padded: [usize; 2],
    /// Final output extent
    pub output: [usize; 2],
    /// Total rows/columns cropped from the padded extent
    pub out_pad: [usize; 2],
}

/// Full output extent of a transposed convolution along one axis
pub fn deconv_padded_extent(input: usize, kernel: usize, stride: usize) -> Result<usize> {
    input
        .saturating_sub(1)
        .checked_mul(stride)
        .and_then(|extent| extent.checked_add(kernel))
        .ok_or_else(|| {
            Error::ShapeMismatch(format!(
                "Deconv extent overflows for input {}, kernel {} and stride {}",
                input, kernel, stride
            ))
        })
}

fn padded_extents(input: [usize; 2], kernel: [usize; 2], strides: [usize; 2]) -> Result<[usize; 2]> {
    Ok([
        deconv_padded_extent(input[0], kernel[0], strides[0])?,
        deconv_padded_extent(input[1], kernel[1], strides[1])?,
    ])
}

/// Output size when the crop is given explicitly (Caffe and ONNX models)
pub fn deconv_output_from_paddings(
    input: [usize; 2],
    kernel: [usize; 2],
    strides: [usize; 2],
    padding_values: [usize; 2],
) -> Result<DeconvGeometry> {
    let padded = padded_extents(input, kernel, strides)?;
    let mut output = [0; 2];
    for axis in 0..2 {
        output[axis] = padded[axis].checked_sub(padding_values[axis]).ok_or_else(|| {
            Error::ShapeMismatch(format!(
                "Padding {} exceeds deconv extent {} on axis {}",
                padding_values[axis], padded[axis], axis
            ))
        })?;
    }
    Ok(DeconvGeometry {
        padded,
        output,
        out_pad: padding_values,
    })
}

/// Output size implied by a padding mode when no explicit crop is given
pub fn deconv_output_from_mode(
    input: [usize; 2],
    kernel: [usize; 2],
    strides: [usize; 2],
    mode: PaddingMode,
) -> Result<DeconvGeometry> {
    let padded = padded_extents(input, kernel, strides)?;
    let output = match mode {
        PaddingMode::Valid => padded,
        PaddingMode::Same => [
            input[0].saturating_mul(strides[0]).min(padded[0]),
            input[1].saturating_mul(strides[1]).min(padded[1]),
        ],
        PaddingMode::Full => {
            return Err(Error::UnsupportedFeature("FULL padding is not supported for deconv".to_string()))
        }
    };
    Ok(DeconvGeometry {
        padded,
        output,
        out_pad: [padded[0] - output[0], padded[1] - output[1]],
    })
}

/// Crop implied by a requested output size (TensorFlow models). The input
/// size must be the one the padding mode would produce for that output.
pub fn deconv_paddings_from_output(
    input: [usize; 2],
    kernel: [usize; 2],
    strides: [usize; 2],
    output: [usize; 2],
    mode: PaddingMode,
) -> Result<DeconvGeometry> {
    let padded = padded_extents(input, kernel, strides)?;
    let mut out_pad = [0; 2];
    for axis in 0..2 {
        let (inp, k, s, out) = (input[axis], kernel[axis], strides[axis], output[axis]);
        let expected_input = match mode {
            PaddingMode::Valid => out.checked_add(s).and_then(|v| v.checked_sub(k)).map(|v| v / s),
            PaddingMode::Same => Some(out / s + usize::from(out % s != 0)),
            PaddingMode::Full => {
                return Err(Error::UnsupportedFeature(
                    "FULL padding is not supported for deconv".to_string(),
                ))
            }
        };
        if expected_input != Some(inp) {
            return Err(Error::ShapeMismatch(format!(
                "Deconv output {} with {} padding, kernel {} and stride {} needs input {:?}, got {}",
                out, mode, k, s, expected_input, inp
            )));
        }
        out_pad[axis] = padded[axis].checked_sub(out).ok_or_else(|| {
            Error::ShapeMismatch(format!(
                "Deconv output {} exceeds full extent {} on axis {}",
                out, padded[axis], axis
            ))
        })?;
    }
    Ok(DeconvGeometry {
        padded,
        output,
        out_pad,
    })
}
