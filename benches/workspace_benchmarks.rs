use std::hint::black_box;

use anyhow::Result;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use tensor_workspace::{
    ArgValue, ConstTensor, DataType, Deconv2d, DeviceType, NetDef, OpContext, Operator, OperatorDef, PoolPlan,
    Tensor, TensorAllocator, Workspace, WorkspaceOptions,
};

// =====================================================================
// Setup helpers
// =====================================================================

fn random_tensor(rng: &mut StdRng, name: &str, shape: &[usize]) -> Result<Tensor> {
    let values: Vec<f32> = (0..shape.iter().product::<usize>())
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    let mut tensor = Tensor::new_plain(name, OpContext::cpu().allocator().clone(), DataType::Float32);
    tensor.resize(shape)?;
    tensor.copy_from_slice(&values)?;
    Ok(tensor)
}

/// Workspace whose pool holds `tensors` names cycling through two blocks
fn pooled_workspace(tensors: usize) -> Result<Workspace> {
    let mut plan = PoolPlan::new().with_block(0, 1 << 20).with_block(1, 1 << 20);
    for index in 0..tensors {
        plan = plan.assign(format!("t{}", index), index % 2);
    }
    let mut ws = Workspace::with_options(WorkspaceOptions::new().set_validate_pool_lifetimes(false));
    ws.init_pool(plan, DeviceType::Cpu)?;
    Ok(ws)
}

/// Create, size and drop a chain of tensors the way a serial net does
fn run_tensor_chain(ws: &mut Workspace, allocator: &TensorAllocator, tensors: usize) -> Result<()> {
    for index in 0..tensors {
        let name = format!("t{}", index);
        ws.create_tensor(&name, allocator.clone(), DataType::Float32)?
            .resize(&[1, 32, 64, 64])?;
        if index > 0 {
            ws.remove_tensor(&format!("t{}", index - 1));
        }
    }
    ws.remove_tensor(&format!("t{}", tensors - 1));
    Ok(())
}

// =====================================================================
// Criterion Benchmark Functions
// =====================================================================

fn workspace_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("workspace");
    let tensors = 16;

    let mut pooled = pooled_workspace(tensors).expect("pooled workspace");
    group.bench_function(BenchmarkId::new("tensor_chain", "pooled"), |b| {
        b.iter(|| run_tensor_chain(&mut pooled, &TensorAllocator::Pooled, tensors))
    });

    let mut plain = Workspace::new();
    let cpu = TensorAllocator::Plain(plain.allocator(DeviceType::Cpu).expect("cpu allocator"));
    group.bench_function(BenchmarkId::new("tensor_chain", "plain"), |b| {
        b.iter(|| run_tensor_chain(&mut plain, &cpu, tensors))
    });

    let net = NetDef {
        name: "weights".to_string(),
        tensors: (0..8)
            .map(|i| ConstTensor::from_f32(format!("w{}", i), vec![64, 64, 3, 3], &vec![0.5; 64 * 64 * 9]))
            .collect(),
        ..Default::default()
    };
    group.bench_function("load_model_tensor", |b| {
        b.iter(|| {
            let mut ws = Workspace::new();
            ws.load_model_tensor(black_box(&net), DeviceType::Cpu)
        })
    });

    group.finish();
}

fn deconv_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("deconv");
    let mut rng = StdRng::seed_from_u64(0);

    // (input shape, filter shape, group, strides, paddings)
    let cases = [
        ("upsample_x2", [1, 32, 32, 32], [16, 32, 4, 4], 1, [2, 2], [2, 2]),
        ("grouped", [1, 64, 32, 32], [32, 64, 3, 3], 2, [1, 1], [0, 0]),
    ];

    for (label, in_shape, filter_shape, groups, strides, paddings) in cases {
        let input = random_tensor(&mut rng, "x", &in_shape).expect("input");
        let filter = random_tensor(&mut rng, "w", &filter_shape).expect("filter");
        let op_def = OperatorDef::new(label, Deconv2d::OP_TYPE)
            .with_arg("strides", ArgValue::Ints(strides.to_vec()))
            .with_arg("padding_values", ArgValue::Ints(paddings.to_vec()))
            .with_arg("group", ArgValue::Int(groups));
        let op = Deconv2d::from_op_def(&op_def).expect("deconv");
        let context = OpContext::cpu();
        let mut output = Tensor::new_plain("y", context.allocator().clone(), DataType::Float32);

        group.bench_function(BenchmarkId::new("Deconv2D", label), |b| {
            b.iter(|| op.run(&context, &[&input, &filter], &mut [&mut output]))
        });
    }

    group.finish();
}

criterion_group!(benches, workspace_benchmark, deconv_benchmark);
criterion_main!(benches);
