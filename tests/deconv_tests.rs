use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tensor_workspace::{
    ArgValue, ConstTensor, DataType, Deconv2d, DeviceType, Error, FrameworkType, NetDef, OpContext, Operator,
    OperatorDef, OperatorRegistry, PaddingMode, SerialNet, Tensor, TensorAllocator, Workspace,
};

fn random_values(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn f32_tensor(name: &str, shape: &[usize], values: &[f32]) -> Tensor {
    let mut tensor = Tensor::new_plain(name, OpContext::cpu().allocator().clone(), DataType::Float32);
    tensor.resize(shape).unwrap();
    tensor.copy_from_slice(values).unwrap();
    tensor
}

fn empty_output() -> Tensor {
    Tensor::new_plain("y", OpContext::cpu().allocator().clone(), DataType::Float32)
}

/// Gather-form transposed convolution, cropped by `out_pad` around the center
fn reference_deconv(
    input: &[f32],
    in_shape: [usize; 4],
    filter: &[f32],
    filter_shape: [usize; 4],
    group: usize,
    strides: [usize; 2],
    out_pad: [usize; 2],
) -> (Vec<f32>, [usize; 4]) {
    let [batch, in_c, in_h, in_w] = in_shape;
    let [out_per_group, _, k_h, k_w] = filter_shape;
    let out_c = out_per_group * group;
    let in_per_group = in_c / group;
    let full_h = (in_h - 1) * strides[0] + k_h;
    let full_w = (in_w - 1) * strides[1] + k_w;
    let (out_h, out_w) = (full_h - out_pad[0], full_w - out_pad[1]);
    let (top, left) = (out_pad[0] / 2, out_pad[1] / 2);

    let mut output = vec![0.0f32; batch * out_c * out_h * out_w];
    for b in 0..batch {
        for oc in 0..out_c {
            let g = oc / out_per_group;
            let oc_in_group = oc % out_per_group;
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let (fy, fx) = (oy + top, ox + left);
                    let mut sum = 0.0f32;
                    for ic in g * in_per_group..(g + 1) * in_per_group {
                        for kh in 0..k_h.min(fy + 1) {
                            let dy = fy - kh;
                            if dy % strides[0] != 0 || dy / strides[0] >= in_h {
                                continue;
                            }
                            for kw in 0..k_w.min(fx + 1) {
                                let dx = fx - kw;
                                if dx % strides[1] != 0 || dx / strides[1] >= in_w {
                                    continue;
                                }
                                let x = input[((b * in_c + ic) * in_h + dy / strides[0]) * in_w + dx / strides[1]];
                                let w = filter[((oc_in_group * in_c + ic) * k_h + kh) * k_w + kw];
                                sum += x * w;
                            }
                        }
                    }
                    output[((b * out_c + oc) * out_h + oy) * out_w + ox] = sum;
                }
            }
        }
    }
    (output, [batch, out_c, out_h, out_w])
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-4, "element {}: {} vs {}", index, a, e);
    }
}

#[test]
fn test_grouped_deconv_through_serial_net() {
    let mut rng = StdRng::seed_from_u64(42);
    let weights = random_values(&mut rng, 8 * 4 * 3 * 3);
    let input = random_values(&mut rng, 4 * 16 * 16);

    let net = NetDef {
        name: "grouped".to_string(),
        ops: vec![OperatorDef::new("up", Deconv2d::OP_TYPE)
            .with_inputs(["x", "w"])
            .with_outputs(["y"])
            .with_arg("group", ArgValue::Int(2))],
        tensors: vec![ConstTensor::from_f32("w", vec![8, 4, 3, 3], &weights)],
        ..Default::default()
    };

    let mut ws = Workspace::new();
    ws.load_model_tensor(&net, DeviceType::Cpu).unwrap();
    let cpu = TensorAllocator::Plain(ws.allocator(DeviceType::Cpu).unwrap());
    let x = ws.create_tensor("x", cpu, DataType::Float32).unwrap();
    x.resize(&[1, 4, 16, 16]).unwrap();
    x.copy_from_slice(&input).unwrap();

    let registry = OperatorRegistry::initialize_standard_operators();
    let context = OpContext::cpu().set_thread_count(2).unwrap();
    SerialNet::new(&net, &registry, context).unwrap().run(&mut ws).unwrap();

    let y = ws.get_tensor("y").unwrap();
    assert_eq!(y.shape(), &[1, 16, 18, 18]);
    let (expected, shape) = reference_deconv(&input, [1, 4, 16, 16], &weights, [8, 4, 3, 3], 2, [1, 1], [0, 0]);
    assert_eq!(shape, [1, 16, 18, 18]);
    assert_close(y.data::<f32>().unwrap(), &expected);
}

#[test]
fn test_strided_deconv_matches_reference() {
    let mut rng = StdRng::seed_from_u64(7);
    let cases = [
        // (input shape, filter shape, group, strides, paddings)
        ([2, 3, 5, 4], [2, 3, 3, 3], 1, [2, 2], [1, 1]),
        ([1, 6, 3, 3], [1, 6, 4, 2], 3, [3, 1], [2, 0]),
        ([1, 4, 7, 2], [3, 4, 1, 5], 2, [1, 2], [0, 3]),
    ];

    for (in_shape, filter_shape, group, strides, paddings) in cases {
        let input = random_values(&mut rng, in_shape.iter().product());
        let weights = random_values(&mut rng, filter_shape.iter().product());
        let x = f32_tensor("x", &in_shape, &input);
        let w = f32_tensor("w", &filter_shape, &weights);

        let op = Deconv2d {
            strides,
            padding_values: Some(paddings),
            group,
            ..Default::default()
        };
        let mut y = empty_output();
        op.run(&OpContext::cpu(), &[&x, &w], &mut [&mut y]).unwrap();

        let (expected, shape) = reference_deconv(&input, in_shape, &weights, filter_shape, group, strides, paddings);
        assert_eq!(y.shape(), &shape);
        assert_close(y.data::<f32>().unwrap(), &expected);
    }
}

#[test]
fn test_cropped_output_is_exact_crop_of_full_output() {
    let mut rng = StdRng::seed_from_u64(3);
    let input = random_values(&mut rng, 2 * 5 * 5);
    let weights = random_values(&mut rng, 3 * 2 * 4 * 4);
    let x = f32_tensor("x", &[1, 2, 5, 5], &input);
    let w = f32_tensor("w", &[3, 2, 4, 4], &weights);
    let context = OpContext::cpu();

    let full_op = Deconv2d {
        strides: [2, 2],
        ..Default::default()
    };
    let mut full = empty_output();
    full_op.run(&context, &[&x, &w], &mut [&mut full]).unwrap();
    assert_eq!(full.shape(), &[1, 3, 12, 12]);

    let cropped_op = Deconv2d {
        padding_values: Some([3, 2]),
        ..full_op.clone()
    };
    let mut cropped = empty_output();
    cropped_op.run(&context, &[&x, &w], &mut [&mut cropped]).unwrap();
    assert_eq!(cropped.shape(), &[1, 3, 9, 10]);

    let full = full.view::<f32>().unwrap();
    let cropped = cropped.view::<f32>().unwrap();
    for c in 0..3 {
        for y in 0..9 {
            for x in 0..10 {
                // bit-identical: the crop only moves values
                assert_eq!(cropped[&[0, c, y, x][..]].to_bits(), full[&[0, c, y + 1, x + 1][..]].to_bits());
            }
        }
    }
}

#[test]
fn test_tensorflow_output_shape_input() {
    let mut rng = StdRng::seed_from_u64(11);
    let input = random_values(&mut rng, 3 * 4 * 4);
    let weights = random_values(&mut rng, 2 * 3 * 3 * 3);
    let x = f32_tensor("x", &[1, 3, 4, 4], &input);
    let w = f32_tensor("w", &[2, 3, 3, 3], &weights);
    let bias = f32_tensor("b", &[2], &[0.25, -1.0]);
    let mut shape = Tensor::new_plain("shape", OpContext::cpu().allocator().clone(), DataType::Int32);
    shape.resize(&[4]).unwrap();
    shape.copy_from_slice(&[1i32, 2, 8, 8]).unwrap();

    let op_def = OperatorDef::new("up", Deconv2d::OP_TYPE)
        .with_arg("strides", ArgValue::Ints(vec![2, 2]))
        .with_arg("padding", ArgValue::Int(PaddingMode::Same as i64))
        .with_arg("framework_type", ArgValue::Int(FrameworkType::Tensorflow as i64));
    let op = Deconv2d::from_op_def(&op_def).unwrap();

    let mut y = empty_output();
    op.run(&OpContext::cpu(), &[&x, &w, &shape, &bias], &mut [&mut y]).unwrap();
    assert_eq!(y.shape(), &[1, 2, 8, 8]);

    let (mut expected, _) = reference_deconv(&input, [1, 3, 4, 4], &weights, [2, 3, 3, 3], 1, [2, 2], [1, 1]);
    for (index, value) in expected.iter_mut().enumerate() {
        *value += if index < 64 { 0.25 } else { -1.0 };
    }
    assert_close(y.data::<f32>().unwrap(), &expected);

    // the input size must be what SAME padding gives for the requested output
    shape.copy_from_slice(&[1i32, 2, 12, 8]).unwrap();
    let err = op.run(&OpContext::cpu(), &[&x, &w, &shape], &mut [&mut y]).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch(_)));

    shape.copy_from_slice(&[1i32, 2, -8, 8]).unwrap();
    let err = op.run(&OpContext::cpu(), &[&x, &w, &shape], &mut [&mut y]).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch(_)));
}

#[test]
fn test_invalid_inputs_are_rejected() {
    let x = f32_tensor("x", &[1, 3, 2, 2], &[0.0; 12]);
    let w = f32_tensor("w", &[2, 4, 3, 3], &[0.0; 72]);
    let op = Deconv2d::default();

    let mut y = empty_output();
    let err = op.run(&OpContext::cpu(), &[&x, &w], &mut [&mut y]).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch(_)));

    let err = op.run(&OpContext::cpu(), &[&x], &mut [&mut y]).unwrap_err();
    assert!(matches!(err, Error::InvalidOperator(_)));

    let grouped = Deconv2d {
        group: 2,
        ..Default::default()
    };
    let w = f32_tensor("w", &[2, 3, 3, 3], &[0.0; 54]);
    let err = grouped.run(&OpContext::cpu(), &[&x, &w], &mut [&mut y]).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch(_)));

    let op_def = OperatorDef::new("up", Deconv2d::OP_TYPE).with_arg("strides", ArgValue::Ints(vec![2]));
    assert!(matches!(Deconv2d::from_op_def(&op_def), Err(Error::InvalidOperator(_))));
}
