//! GPU backend tests. Compared against the CPU backend, which is exact.
//!
//! Skipped when no compute-capable adapter is present.

#![cfg(feature = "wgpu")]

use pixlane_gpu::convert::reference;
use pixlane_gpu::{
    Backend, ComputeContext, LoadAction, OutputFormat, RenderTarget, SourceImage, StorageMode, TextureFormat,
};

fn gpu() -> Option<ComputeContext> {
    let _ = tracing_subscriber::fmt().with_env_filter("pixlane_gpu=debug").with_test_writer().try_init();
    for backend in [Backend::NativeGpu, Backend::AlternateGpu] {
        if backend.is_available() {
            match ComputeContext::with_backend(backend) {
                Ok(ctx) => return Some(ctx),
                Err(e) => eprintln!("{backend} available but failed to open: {e}"),
            }
        }
    }
    eprintln!("Skipping test: no GPU adapter");
    None
}

fn pattern(width: u32, height: u32) -> Vec<f32> {
    (0..width * height * 4)
        .map(|i| ((i * 7919) % 1201) as f32 / 1000.0 - 0.1)
        .collect()
}

/// GPU rounding may differ from the host by one code.
fn assert_close_u8(gpu: &[u8], cpu: &[u8]) {
    assert_eq!(gpu.len(), cpu.len());
    for (i, (g, c)) in gpu.iter().zip(cpu).enumerate() {
        assert!(g.abs_diff(*c) <= 1, "byte {i}: gpu {g} vs cpu {c}");
    }
}

fn assert_close_u16(gpu: &[u8], cpu: &[u8]) {
    let g: Vec<u16> = bytemuck::pod_collect_to_vec(gpu);
    let c: Vec<u16> = bytemuck::pod_collect_to_vec(cpu);
    assert_eq!(g.len(), c.len());
    for (i, (g, c)) in g.iter().zip(&c).enumerate() {
        assert!((g >> 6).abs_diff(c >> 6) <= 1, "sample {i}: gpu {g} vs cpu {c}");
        assert_eq!(g & 0x3f, 0);
    }
}

#[test]
fn test_gpu_device_info() {
    let Some(ctx) = gpu() else { return };
    let info = ctx.device().info();
    println!("{info:?}");
    assert!(info.max_buffer_size > 0);
    assert!(info.max_texture_dimension >= 2048);
    assert!(info.memory_bytes > 0);
}

#[test]
fn test_gpu_invert() {
    let Some(ctx) = gpu() else { return };
    let cpu = ComputeContext::with_backend(Backend::Cpu).unwrap();
    for (w, h) in [(1, 1), (17, 13), (1920, 1080)] {
        let src = pattern(w, h);
        let out = ctx.invert(&src, w, h).unwrap();
        let expected = cpu.invert(&src, w, h).unwrap();
        for (a, b) in out.iter().zip(&expected) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }
}

#[test]
fn test_gpu_conversion_matches_cpu() {
    let Some(ctx) = gpu() else { return };
    for (w, h) in [(1, 1), (2, 1), (17, 13), (18, 13), (1920, 1080)] {
        let src = pattern(w, h);
        for format in [OutputFormat::Bgra8, OutputFormat::P216] {
            let output = ctx.device().new_buffer(format.required_bytes(w, h).unwrap(), StorageMode::Shared).unwrap();
            ctx.convert_for_output(SourceImage::Host(&src), &output, w, h, format).unwrap();
            let expected = reference::convert(format, &src, w, h).unwrap();
            match format {
                OutputFormat::Bgra8 => assert_close_u8(&output.download().unwrap(), &expected),
                OutputFormat::P216 => assert_close_u16(&output.download().unwrap(), &expected),
            }
        }
    }
}

#[test]
fn test_gpu_texture_conversion() {
    let Some(ctx) = gpu() else { return };
    for (w, h) in [(64, 32), (33, 5)] {
        let src = pattern(w, h);
        let texture = ctx.device().new_texture(w, h, TextureFormat::Rgba32Float, false).unwrap();
        texture.upload(bytemuck::cast_slice(&src), texture.row_bytes()).unwrap();

        let output = ctx.device().new_buffer(w as usize * h as usize * 4, StorageMode::Private).unwrap();
        ctx.convert_for_output(SourceImage::Texture(&texture), &output, w, h, OutputFormat::Bgra8).unwrap();
        assert_close_u8(&output.download().unwrap(), &reference::rgba_to_bgra8(&src, w, h).unwrap());

        ctx.convert_for_output(SourceImage::Texture(&texture), &output, w, h, OutputFormat::P216).unwrap();
        assert_close_u16(&output.download().unwrap(), &reference::rgba_to_p216(&src, w, h).unwrap());
    }
}

#[test]
fn test_gpu_managed_buffer_synchronize() {
    let Some(ctx) = gpu() else { return };
    let src = ctx.device().new_buffer_with_data(bytemuck::cast_slice(&[5u32; 64]), StorageMode::Private).unwrap();
    let managed = ctx.device().new_buffer(256, StorageMode::Managed).unwrap();

    let mut cmd = ctx.queue().new_command_buffer().unwrap();
    let mut blit = cmd.blit_encoder();
    blit.copy_buffer(&src, 0, &managed, 0, 256);
    blit.synchronize(&managed);
    blit.end();
    cmd.commit().wait_until_completed().unwrap();

    assert!(managed.contents().unwrap().to_vec_of::<u32>().iter().all(|v| *v == 5));
}

#[test]
fn test_gpu_clear_render_target() {
    let Some(ctx) = gpu() else { return };
    let texture = ctx.device().new_texture(8, 8, TextureFormat::Rgba8Unorm, false).unwrap();
    if !texture.is_renderable() {
        return;
    }
    let mut cmd = ctx.queue().new_command_buffer().unwrap();
    let enc = cmd
        .render_encoder(RenderTarget::new(&texture, LoadAction::Clear([0.0, 1.0, 0.0, 1.0])))
        .unwrap();
    enc.end();
    cmd.commit().wait_until_completed().unwrap();

    let texels = texture.download(texture.row_bytes()).unwrap();
    assert!(texels.chunks_exact(4).all(|px| px == [0, 255, 0, 255]));
}
