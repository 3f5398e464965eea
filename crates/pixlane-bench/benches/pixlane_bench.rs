//! Benchmarks for pixlane conversions.
//!
//! Run with: `cargo bench -p pixlane-bench` (add `--features wgpu` for GPU paths)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pixlane_core::{pixel, OutputFormat};
use pixlane_gpu::convert::reference;
use pixlane_gpu::{Backend, ComputeContext, SourceImage, StorageMode, TextureFormat};

const SIZES: [(u32, u32); 3] = [(256, 256), (1280, 720), (1920, 1080)];

fn frame(width: u32, height: u32) -> Vec<f32> {
    (0..width as usize * height as usize * 4)
        .map(|i| (i % 997) as f32 / 997.0)
        .collect()
}

/// Benchmark per-pixel quantisation helpers.
fn bench_pixel(c: &mut Criterion) {
    let mut group = c.benchmark_group("pixel");

    let pixels: Vec<[f32; 4]> = (0..10000)
        .map(|i| {
            let t = i as f32 / 10000.0;
            [t, t * 0.8, t * 0.6, 1.0]
        })
        .collect();
    group.throughput(Throughput::Elements(10000));

    group.bench_function("rgba_to_bgra8", |b| {
        b.iter(|| {
            pixels.iter().map(|&p| pixel::rgba_to_bgra8_word(black_box(p))).collect::<Vec<_>>()
        })
    });

    group.bench_function("rgba_pair_to_p216", |b| {
        b.iter(|| {
            pixels
                .chunks_exact(2)
                .map(|p| pixel::rgba_pair_to_p216(black_box(p[0]), black_box(p[1])))
                .collect::<Vec<_>>()
        })
    });

    group.finish();
}

/// Benchmark the rayon reference conversions.
fn bench_reference(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference");

    for (w, h) in SIZES {
        let src = frame(w, h);
        group.throughput(Throughput::Elements(w as u64 * h as u64));
        let id = format!("{w}x{h}");

        group.bench_with_input(BenchmarkId::new("bgra8", &id), &src, |b, s| {
            b.iter(|| reference::rgba_to_bgra8(black_box(s), w, h))
        });

        group.bench_with_input(BenchmarkId::new("p216", &id), &src, |b, s| {
            b.iter(|| reference::rgba_to_p216(black_box(s), w, h))
        });

        group.bench_with_input(BenchmarkId::new("invert", &id), &src, |b, s| {
            b.iter(|| reference::invert_rgba(black_box(s), w, h))
        });
    }

    group.finish();
}

/// Benchmark the command path per source residency on one backend.
fn bench_backend(c: &mut Criterion, backend: Backend) {
    if !backend.is_available() {
        return;
    }
    let Ok(ctx) = ComputeContext::with_backend(backend) else {
        return;
    };
    let mut group = c.benchmark_group(format!("convert_{}", backend.name()));
    group.sample_size(20);

    for (w, h) in SIZES {
        let src = frame(w, h);
        group.throughput(Throughput::Elements(w as u64 * h as u64));
        let id = format!("{w}x{h}");

        let Ok(device_src) = ctx.device().new_buffer_with_data(bytemuck::cast_slice(&src), StorageMode::Private) else {
            continue;
        };
        let Ok(texture) = ctx.device().new_texture(w, h, TextureFormat::Rgba32Float, false) else {
            continue;
        };
        if texture.upload(bytemuck::cast_slice(&src), texture.row_bytes()).is_err() {
            continue;
        }

        for format in [OutputFormat::Bgra8, OutputFormat::P216] {
            let Ok(len) = format.required_bytes(w, h) else { continue };
            let Ok(output) = ctx.device().new_buffer(len, StorageMode::Shared) else {
                continue;
            };

            group.bench_function(BenchmarkId::new(format!("{format}_host"), &id), |b| {
                b.iter(|| ctx.convert_for_output(SourceImage::Host(black_box(&src)), &output, w, h, format))
            });

            group.bench_function(BenchmarkId::new(format!("{format}_buffer"), &id), |b| {
                b.iter(|| ctx.convert_for_output(SourceImage::Buffer(&device_src), &output, w, h, format))
            });

            group.bench_function(BenchmarkId::new(format!("{format}_texture"), &id), |b| {
                b.iter(|| ctx.convert_for_output(SourceImage::Texture(&texture), &output, w, h, format))
            });
        }
    }

    group.finish();
}

fn bench_cpu(c: &mut Criterion) {
    bench_backend(c, Backend::Cpu);
}

fn bench_gpu(c: &mut Criterion) {
    bench_backend(c, Backend::NativeGpu);
    bench_backend(c, Backend::AlternateGpu);
}

criterion_group!(benches, bench_pixel, bench_reference, bench_cpu, bench_gpu);
criterion_main!(benches);
