//! Compositing and blur throughput.
//!
//! Run with: cargo bench --bench composite_bench

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use paintcore::filters::{self, ComputeCtx};
use paintcore::{BlendMode, CompositeEngine, LayerStack, PixelBuffer};

fn noise_buffer(w: u32, h: u32, salt: u32) -> PixelBuffer {
    let mut buf = PixelBuffer::new(w, h).expect("alloc");
    for y in 0..h {
        for x in 0..w {
            let v = x.wrapping_mul(31) ^ y.wrapping_mul(17) ^ salt;
            buf.put_pixel(x, y, [v as u8, (v >> 3) as u8, (v >> 5) as u8, 200]);
        }
    }
    buf
}

fn stack_of(n: usize, w: u32, h: u32) -> LayerStack {
    let modes = BlendMode::all();
    let mut stack = LayerStack::new(w, h).expect("stack");
    for i in 0..n {
        let layer = stack
            .layer_from_pixels(format!("L{}", i), noise_buffer(w, h, i as u32))
            .expect("layer")
            .with_opacity(0.8)
            .with_blend_mode(modes[i % modes.len()]);
        let at = stack.len();
        stack.add_layer(at, layer).expect("add");
    }
    stack
}

fn bench_composite(c: &mut Criterion) {
    let mut group = c.benchmark_group("composite");
    for &layers in &[2usize, 8] {
        let stack = stack_of(layers, 1024, 768);
        group.throughput(Throughput::Elements(1024 * 768 * layers as u64));
        group.bench_with_input(BenchmarkId::new("uncached", layers), &stack, |b, stack| {
            b.iter(|| {
                let mut engine = CompositeEngine::new();
                black_box(engine.composite(stack).expect("composite"));
            })
        });
        group.bench_with_input(BenchmarkId::new("cached", layers), &stack, |b, stack| {
            let mut engine = CompositeEngine::new();
            b.iter(|| black_box(engine.composite(stack).expect("composite")))
        });
    }
    group.finish();
}

fn bench_blur(c: &mut Criterion) {
    let mut group = c.benchmark_group("gaussian_blur");
    let src = noise_buffer(1024, 768, 7);
    let ctx = ComputeCtx::default();
    for &sigma in &[1.0f32, 5.0, 20.0] {
        group.bench_with_input(BenchmarkId::from_parameter(sigma), &sigma, |b, &sigma| {
            b.iter(|| black_box(filters::gaussian_blur(&src, sigma, &ctx).expect("blur")))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_composite, bench_blur);
criterion_main!(benches);
