//! # Transposed Convolution (Deconv2D)
//!
//! Grouped, strided 2D transposed convolution over NCHW tensors.
//!
//! The filter is stored as `[out_channels / group, in_channels, kH, kW]`. Group
//! `g` reads input channels `[g * Cin_g, (g + 1) * Cin_g)` and writes output
//! channels `[g * Cout_g, (g + 1) * Cout_g)`, so the groups' outputs are
//! concatenated in order along the channel axis.
//!
//! The kernel first computes the full (uncropped) output, of extent
//! `(in - 1) * stride + k` per spatial axis. When the model asks for a smaller
//! output the full result goes to a scratch tensor owned by the call and the
//! central region is then copied out.
//!
//! Padding is expressed two ways depending on the source framework:
//! - Caffe / ONNX: explicit `padding_values` (total rows and columns cropped)
//! - TensorFlow: the desired output shape arrives as an int32 input tensor, and
//!   the crop is whatever separates it from the full extent

use log::trace;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::model::{keywords, OperatorDef};
use crate::ops::nn::padding::{
    deconv_output_from_mode, deconv_output_from_paddings, deconv_paddings_from_output,
    DeconvGeometry, FrameworkType, PaddingMode,
};
use crate::ops::registry::{OpContext, Operator};
use crate::ops::tensor::Tensor;
use crate::types::DataType;

/// Result of output sizing: how much to crop, and the scratch tensor to
/// compute into when cropping is needed.
#[derive(Debug)]
pub struct PaddedOutput {
    /// Total rows and columns cropped, as `[height, width]`
    pub out_pad: [usize; 2],
    /// Uncropped result buffer, present only when `out_pad` is non-zero
    pub padded: Option<Tensor>,
}

/// Deconv2D operator
#[derive(Debug, Clone, PartialEq)]
pub struct Deconv2d {
    /// Strides as `[height, width]`
    pub strides: [usize; 2],
    /// Padding scheme used when no explicit paddings are given
    pub padding_mode: PaddingMode,
    /// Explicit total paddings as `[height, width]`
    pub padding_values: Option<[usize; 2]>,
    /// Number of channel groups
    pub group: usize,
    pub framework: FrameworkType,
}

impl Default for Deconv2d {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            padding_mode: PaddingMode::Valid,
            padding_values: None,
            group: 1,
            framework: FrameworkType::Caffe,
        }
    }
}

struct DeconvDims {
    batch: usize,
    in_channels: usize,
    in_h: usize,
    in_w: usize,
    out_channels: usize,
    kernel_h: usize,
    kernel_w: usize,
    out_h: usize,
    out_w: usize,
    stride_h: usize,
    stride_w: usize,
    group: usize,
}

impl Deconv2d {
    pub const OP_TYPE: &'static str = "Deconv2D";

    /// Registry entry point
    pub fn create(op_def: &OperatorDef) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::from_op_def(op_def)?))
    }

    /// Read the operator's arguments
    pub fn from_op_def(op_def: &OperatorDef) -> Result<Self> {
        let strides = pair_arg(op_def, keywords::STRIDES, &[1, 1])?;
        let padding_mode = PaddingMode::from_i64(op_def.arg_int(keywords::PADDING, PaddingMode::Valid as i64)?)?;
        let padding_values = match op_def.get_arg(keywords::PADDING_VALUES) {
            Some(_) => Some(pair_arg(op_def, keywords::PADDING_VALUES, &[0, 0])?),
            None => None,
        };
        let group = op_def.arg_int(keywords::GROUP, 1)?;
        if group < 1 {
            return Err(Error::InvalidOperator(format!(
                "Operator '{}' has group {}, must be at least 1",
                op_def.name, group
            )));
        }
        let framework = FrameworkType::from_i64(
            op_def.arg_int(keywords::FRAMEWORK_TYPE, FrameworkType::Caffe as i64)?,
        )?;

        Ok(Self {
            strides,
            padding_mode,
            padding_values,
            group: group as usize,
            framework,
        })
    }

    fn check_shapes(&self, input: &Tensor, filter: &Tensor) -> Result<()> {
        if input.ndim() != 4 || filter.ndim() != 4 {
            return Err(Error::ShapeMismatch(format!(
                "Deconv2D needs rank-4 input and filter, got {:?} and {:?}",
                input.shape(),
                filter.shape()
            )));
        }
        if self.group == 0 || self.strides.iter().any(|&s| s == 0) {
            return Err(Error::ShapeMismatch(format!(
                "Deconv2D needs group and strides of at least 1, got group {} and strides {:?}",
                self.group, self.strides
            )));
        }
        let in_channels = input.dim(1);
        if in_channels % self.group != 0 {
            return Err(Error::ShapeMismatch(format!(
                "Input channels {} are not divisible by group {}",
                in_channels, self.group
            )));
        }
        if filter.dim(1) != in_channels {
            return Err(Error::ShapeMismatch(format!(
                "Filter {:?} does not match {} input channels",
                filter.shape(),
                in_channels
            )));
        }
        if filter.shape().iter().any(|&d| d == 0) {
            return Err(Error::ShapeMismatch(format!("Empty filter {:?}", filter.shape())));
        }
        Ok(())
    }

    /// Size `output` and work out the crop from the full deconv extent.
    ///
    /// `output_shape` is the requested NCHW output for TensorFlow models;
    /// otherwise the explicit paddings (or the padding mode) decide.
    pub fn resize_output_and_compute_padding(
        &self,
        context: &OpContext,
        input: &Tensor,
        filter: &Tensor,
        output_shape: Option<&[usize]>,
        output: &mut Tensor,
    ) -> Result<PaddedOutput> {
        self.check_shapes(input, filter)?;

        let batch = input.dim(0);
        let out_channels = filter.dim(0) * self.group;
        let in_hw = [input.dim(2), input.dim(3)];
        let kernel_hw = [filter.dim(2), filter.dim(3)];

        let geometry: DeconvGeometry = match output_shape {
            Some(shape) => {
                if shape.len() != 4 || shape[0] != batch || shape[1] != out_channels {
                    return Err(Error::ShapeMismatch(format!(
                        "Requested output shape {:?} does not match batch {} and {} output channels",
                        shape, batch, out_channels
                    )));
                }
                deconv_paddings_from_output(in_hw, kernel_hw, self.strides, [shape[2], shape[3]], self.padding_mode)?
            }
            None => match self.padding_values {
                Some(values) => deconv_output_from_paddings(in_hw, kernel_hw, self.strides, values)?,
                None => deconv_output_from_mode(in_hw, kernel_hw, self.strides, self.padding_mode)?,
            },
        };

        output.resize(&[batch, out_channels, geometry.output[0], geometry.output[1]])?;

        let padded = if geometry.out_pad != [0, 0] {
            let mut scratch = Tensor::new_plain(
                format!("{}_padded", output.name()),
                context.allocator().clone(),
                DataType::Float32,
            );
            scratch.resize(&[batch, out_channels, geometry.padded[0], geometry.padded[1]])?;
            Some(scratch)
        } else {
            None
        };

        trace!(
            "Deconv2D output {:?}, full extent {:?}, crop {:?}",
            output.shape(),
            geometry.padded,
            geometry.out_pad
        );

        Ok(PaddedOutput {
            out_pad: geometry.out_pad,
            padded,
        })
    }

    /// Copy the central region of `src` into `dst`, dropping `out_pad[0] / 2`
    /// leading rows and `out_pad[1] / 2` leading columns.
    pub fn unpad_output(src: &Tensor, out_pad: [usize; 2], dst: &mut Tensor) -> Result<()> {
        if src.data_type() != dst.data_type() {
            return Err(Error::DataTypeMismatch {
                actual: src.data_type(),
                requested: dst.data_type(),
            });
        }
        let (s, d) = (src.shape(), dst.shape());
        if s.len() != 4
            || d.len() != 4
            || s[0] != d[0]
            || s[1] != d[1]
            || s[2] != d[2] + out_pad[0]
            || s[3] != d[3] + out_pad[1]
        {
            return Err(Error::ShapeMismatch(format!(
                "Cannot unpad {:?} by {:?} into {:?}",
                s, out_pad, d
            )));
        }

        let element_size = src.data_type().size_in_bytes();
        let (src_h, src_w) = (s[2], s[3]);
        let (dst_h, dst_w) = (d[2], d[3]);
        let (top, left) = (out_pad[0] / 2, out_pad[1] / 2);
        let src_plane = src_h * src_w * element_size;
        let dst_plane = dst_h * dst_w * element_size;
        let row_bytes = dst_w * element_size;
        if dst_plane == 0 {
            return Ok(());
        }

        let src_bytes = src.as_bytes()?;
        dst.as_bytes_mut()?
            .par_chunks_mut(dst_plane)
            .zip(src_bytes.par_chunks(src_plane))
            .for_each(|(dst_plane, src_plane)| {
                for y in 0..dst_h {
                    let from = ((y + top) * src_w + left) * element_size;
                    dst_plane[y * row_bytes..(y + 1) * row_bytes]
                        .copy_from_slice(&src_plane[from..from + row_bytes]);
                }
            });
        Ok(())
    }

    /// Accumulate the full transposed convolution into `target`
    fn compute_full(&self, context: &OpContext, input: &Tensor, filter: &Tensor, target: &mut Tensor) -> Result<()> {
        let dims = DeconvDims {
            batch: input.dim(0),
            in_channels: input.dim(1),
            in_h: input.dim(2),
            in_w: input.dim(3),
            out_channels: target.dim(1),
            kernel_h: filter.dim(2),
            kernel_w: filter.dim(3),
            out_h: target.dim(2),
            out_w: target.dim(3),
            stride_h: self.strides[0],
            stride_w: self.strides[1],
            group: self.group,
        };
        let input = input.data::<f32>()?;
        let filter = filter.data::<f32>()?;
        let target = target.data_mut::<f32>()?;
        context.install(|| deconv2d_full(input, filter, &dims, target));
        Ok(())
    }

    fn add_bias(output: &mut Tensor, bias: &Tensor) -> Result<()> {
        let channels = output.dim(1);
        if bias.size() != channels {
            return Err(Error::ShapeMismatch(format!(
                "Bias of {} elements for {} output channels",
                bias.size(),
                channels
            )));
        }
        let plane = output.dim(2) * output.dim(3);
        if plane == 0 {
            return Ok(());
        }
        let bias = bias.data::<f32>()?;
        output
            .data_mut::<f32>()?
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(index, values)| {
                let b = bias[index % channels];
                values.iter_mut().for_each(|v| *v += b);
            });
        Ok(())
    }
}

/// Scatter every input pixel through its filter window into the output planes.
/// Each output plane is owned by one task.
fn deconv2d_full(input: &[f32], filter: &[f32], dims: &DeconvDims, output: &mut [f32]) {
    let out_plane = dims.out_h * dims.out_w;
    let in_plane = dims.in_h * dims.in_w;
    let in_per_group = dims.in_channels / dims.group;
    let out_per_group = dims.out_channels / dims.group;
    let kernel_plane = dims.kernel_h * dims.kernel_w;

    output
        .par_chunks_mut(out_plane)
        .enumerate()
        .for_each(|(plane_index, plane)| {
            let b = plane_index / dims.out_channels;
            let oc = plane_index % dims.out_channels;
            let g = oc / out_per_group;
            let oc_in_group = oc % out_per_group;
            plane.fill(0.0);

            for ic in g * in_per_group..(g + 1) * in_per_group {
                let src = &input[(b * dims.in_channels + ic) * in_plane..][..in_plane];
                let weights = &filter[(oc_in_group * dims.in_channels + ic) * kernel_plane..][..kernel_plane];

                for kh in 0..dims.kernel_h {
                    for kw in 0..dims.kernel_w {
                        let w = weights[kh * dims.kernel_w + kw];
                        for ih in 0..dims.in_h {
                            let row = (ih * dims.stride_h + kh) * dims.out_w + kw;
                            let src_row = &src[ih * dims.in_w..(ih + 1) * dims.in_w];
                            for (iw, &x) in src_row.iter().enumerate() {
                                plane[row + iw * dims.stride_w] += x * w;
                            }
                        }
                    }
                }
            }
        });

    debug_assert_eq!(output.len(), dims.batch * dims.out_channels * out_plane);
}

fn pair_arg(op_def: &OperatorDef, name: &str, default: &[i64]) -> Result<[usize; 2]> {
    let values = op_def.arg_ints(name, default)?;
    match values.as_slice() {
        [h, w] if *h >= 0 && *w >= 0 => Ok([*h as usize, *w as usize]),
        _ => Err(Error::InvalidOperator(format!(
            "Argument '{}' of operator '{}' must be two non-negative integers, got {:?}",
            name, op_def.name, values
        ))),
    }
}

impl Operator for Deconv2d {
    fn op_type(&self) -> &str {
        Self::OP_TYPE
    }

    fn run(&self, context: &OpContext, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()> {
        let min_inputs = if self.framework.takes_output_shape() { 3 } else { 2 };
        if inputs.len() < min_inputs || inputs.len() > min_inputs + 1 || outputs.len() != 1 {
            return Err(Error::InvalidOperator(format!(
                "Deconv2D ({}) expects {} or {} inputs and 1 output, got {} and {}",
                self.framework,
                min_inputs,
                min_inputs + 1,
                inputs.len(),
                outputs.len()
            )));
        }

        let (input, filter) = (inputs[0], inputs[1]);
        let bias = inputs.get(min_inputs).copied();
        let output_shape = if self.framework.takes_output_shape() {
            let shape = inputs[2].data::<i32>()?;
            let shape = shape
                .iter()
                .map(|&d| {
                    usize::try_from(d).map_err(|_| {
                        Error::ShapeMismatch(format!("Negative dimension {} in output shape", d))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Some(shape)
        } else {
            None
        };

        let output = &mut *outputs[0];
        let PaddedOutput { out_pad, padded } =
            self.resize_output_and_compute_padding(context, input, filter, output_shape.as_deref(), output)?;

        match padded {
            Some(mut scratch) => {
                self.compute_full(context, input, filter, &mut scratch)?;
                Self::unpad_output(&scratch, out_pad, output)?;
            }
            None => self.compute_full(context, input, filter, output)?,
        }

        if let Some(bias) = bias {
            Self::add_bias(output, bias)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArgValue;

    fn tensor(ctx: &OpContext, name: &str, shape: &[usize], values: &[f32]) -> Tensor {
        let mut t = Tensor::new_plain(name, ctx.allocator().clone(), DataType::Float32);
        t.resize(shape).unwrap();
        t.copy_from_slice(values).unwrap();
        t
    }

    #[test]
    fn test_from_op_def() {
        let op = OperatorDef::new("d", "Deconv2D")
            .with_arg(keywords::STRIDES, ArgValue::Ints(vec![2, 3]))
            .with_arg(keywords::PADDING_VALUES, ArgValue::Ints(vec![1, 0]))
            .with_arg(keywords::GROUP, ArgValue::Int(2))
            .with_arg(keywords::FRAMEWORK_TYPE, ArgValue::Int(0));
        let deconv = Deconv2d::from_op_def(&op).unwrap();
        assert_eq!(deconv.strides, [2, 3]);
        assert_eq!(deconv.padding_values, Some([1, 0]));
        assert_eq!(deconv.group, 2);
        assert_eq!(deconv.framework, FrameworkType::Tensorflow);

        let bad = OperatorDef::new("d", "Deconv2D").with_arg(keywords::GROUP, ArgValue::Int(0));
        assert!(matches!(Deconv2d::from_op_def(&bad), Err(Error::InvalidOperator(_))));
    }

    #[test]
    fn test_single_pixel_stride_two() {
        let ctx = OpContext::cpu();
        let deconv = Deconv2d {
            strides: [2, 2],
            ..Default::default()
        };
        let input = tensor(&ctx, "x", &[1, 1, 2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let filter = tensor(&ctx, "w", &[1, 1, 1, 1], &[10.0]);
        let mut output = Tensor::new_plain("y", ctx.allocator().clone(), DataType::Float32);

        deconv.run(&ctx, &[&input, &filter], &mut [&mut output]).unwrap();
        assert_eq!(output.shape(), &[1, 1, 3, 3]);
        assert_eq!(
            output.data::<f32>().unwrap(),
            &[10.0, 0.0, 20.0, 0.0, 0.0, 0.0, 30.0, 0.0, 40.0]
        );
    }

    #[test]
    fn test_padding_crops_center_and_adds_bias() {
        let ctx = OpContext::cpu();
        let deconv = Deconv2d {
            padding_values: Some([2, 2]),
            ..Default::default()
        };
        let input = tensor(&ctx, "x", &[1, 1, 1, 1], &[1.0]);
        let filter = tensor(&ctx, "w", &[1, 1, 3, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let bias = tensor(&ctx, "b", &[1], &[0.5]);
        let mut output = Tensor::new_plain("y", ctx.allocator().clone(), DataType::Float32);

        deconv.run(&ctx, &[&input, &filter, &bias], &mut [&mut output]).unwrap();
        assert_eq!(output.shape(), &[1, 1, 1, 1]);
        assert_eq!(output.data::<f32>().unwrap(), &[5.5]);
    }

    #[test]
    fn test_scratch_only_when_cropping() {
        let ctx = OpContext::cpu();
        let input = tensor(&ctx, "x", &[1, 2, 4, 4], &[0.0; 32]);
        let filter = tensor(&ctx, "w", &[3, 2, 3, 3], &[0.0; 54]);
        let mut output = Tensor::new_plain("y", ctx.allocator().clone(), DataType::Float32);

        let plain = Deconv2d::default()
            .resize_output_and_compute_padding(&ctx, &input, &filter, None, &mut output)
            .unwrap();
        assert!(plain.padded.is_none());
        assert_eq!(output.shape(), &[1, 3, 6, 6]);

        let tf = Deconv2d {
            strides: [2, 2],
            padding_mode: PaddingMode::Same,
            framework: FrameworkType::Tensorflow,
            ..Default::default()
        };
        let padded = tf
            .resize_output_and_compute_padding(&ctx, &input, &filter, Some(&[1usize, 3, 8, 8][..]), &mut output)
            .unwrap();
        assert_eq!(padded.out_pad, [1, 1]);
        assert_eq!(padded.padded.as_ref().map(|t| t.shape().to_vec()), Some(vec![1, 3, 9, 9]));
        assert_eq!(output.shape(), &[1, 3, 8, 8]);
    }

    #[test]
    fn test_shape_checks() {
        let ctx = OpContext::cpu();
        let input = tensor(&ctx, "x", &[1, 3, 2, 2], &[0.0; 12]);
        let filter = tensor(&ctx, "w", &[1, 3, 1, 1], &[0.0; 3]);
        let mut output = Tensor::new_plain("y", ctx.allocator().clone(), DataType::Float32);

        let grouped = Deconv2d {
            group: 2,
            ..Default::default()
        };
        let err = grouped
            .resize_output_and_compute_padding(&ctx, &input, &filter, None, &mut output)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));

        let wrong_filter = tensor(&ctx, "w2", &[1, 2, 1, 1], &[0.0; 2]);
        let err = Deconv2d::default()
            .resize_output_and_compute_padding(&ctx, &input, &wrong_filter, None, &mut output)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
        assert!(!output.is_bound());
    }
}
