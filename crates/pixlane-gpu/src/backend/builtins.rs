//! Host kernels for the shipped WGSL entry points.
//!
//! Registered on every device, so the built-in shaders run unchanged on the
//! CPU backend. Each kernel only touches the elements its launched threads
//! would cover on a GPU.

use std::sync::Arc;

use super::{HostKernel, KernelArgs};
use crate::ComputeResult;
use crate::convert::reference::{bgra8_region, invert_region, load_packed, p216_region};

/// `(name, kernel)` pairs for every built-in entry point.
pub(crate) fn builtin_kernels() -> Vec<(&'static str, HostKernel)> {
    vec![
        ("invert_rgba", Arc::new(invert_rgba) as HostKernel),
        ("rgba_to_bgra8", Arc::new(rgba_to_bgra8) as HostKernel),
        ("texture_to_bgra8", Arc::new(texture_to_bgra8) as HostKernel),
        ("rgba_to_p216", Arc::new(rgba_to_p216) as HostKernel),
        ("texture_to_p216", Arc::new(texture_to_p216) as HostKernel),
    ]
}

fn invert_rgba(args: &mut KernelArgs<'_>) -> ComputeResult<()> {
    let [width, height, ..] = args.buffers.uniform::<[u32; 4]>(1)?;
    let (tx, ty) = args.thread_extent();
    let data = args.buffers.write::<f32>(0)?;
    invert_region(data, width, tx, ty.min(height))
}

fn rgba_to_bgra8(args: &mut KernelArgs<'_>) -> ComputeResult<()> {
    let [width, height, ..] = args.buffers.uniform::<[u32; 4]>(2)?;
    let (tx, ty) = args.thread_extent();
    let (src, dst) = args.buffers.split::<f32, u8>(0, 1)?;
    bgra8_region(dst, width, tx, ty.min(height), |x, y| load_packed(src, width, x, y))
}

fn texture_to_bgra8(args: &mut KernelArgs<'_>) -> ComputeResult<()> {
    let [width, height, ..] = args.buffers.uniform::<[u32; 4]>(2)?;
    let (tx, ty) = args.thread_extent();
    let image = args.textures.read(0)?;
    let dst = args.buffers.write::<u8>(1)?;
    bgra8_region(dst, width, tx, ty.min(height), |x, y| image.load(x, y))
}

fn rgba_to_p216(args: &mut KernelArgs<'_>) -> ComputeResult<()> {
    let [width, height, ..] = args.buffers.uniform::<[u32; 4]>(2)?;
    let (tx, ty) = args.thread_extent();
    let (src, dst) = args.buffers.split::<f32, u8>(0, 1)?;
    p216_region(dst, width, height, tx, ty.min(height), |x, y| load_packed(src, width, x, y))
}

fn texture_to_p216(args: &mut KernelArgs<'_>) -> ComputeResult<()> {
    let [width, height, ..] = args.buffers.uniform::<[u32; 4]>(2)?;
    let (tx, ty) = args.thread_extent();
    let image = args.textures.read(0)?;
    let dst = args.buffers.write::<u8>(1)?;
    p216_region(dst, width, height, tx, ty.min(height), |x, y| image.load(x, y))
}
