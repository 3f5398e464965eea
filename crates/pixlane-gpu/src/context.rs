//! Backend selection and the high-level operations.
//!
//! A [`ComputeContext`] picks one backend at construction (the first in the
//! configured priority list that is available and opens successfully) and
//! keeps it for its lifetime. There is no per-call fallback.

use std::sync::{Mutex, PoisonError};

use pixlane_core::{DispatchSize, OutputFormat, ThreadgroupSize};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::command::CommandQueue;
use crate::config::ContextConfig;
use crate::convert::{FrameConverter, SOURCE_BYTES_PER_PIXEL, SourceImage};
use crate::device::Device;
use crate::library::ComputePipeline;
use crate::shaders::INVERT_KERNEL;
use crate::{Buffer, ComputeError, ComputeResult, StorageMode};

/// Threadgroup of the invert kernel.
const INVERT_GROUP: ThreadgroupSize = ThreadgroupSize::new(16, 16);

/// A device, a queue and the built-in kernels on the selected backend.
pub struct ComputeContext {
    device: Device,
    queue: CommandQueue,
    invert: ComputePipeline,
    converter: Mutex<FrameConverter>,
}

impl ComputeContext {
    /// Default priority list with environment overrides.
    pub fn new() -> ComputeResult<Self> {
        Self::with_config(ContextConfig::from_env())
    }

    /// Uses exactly `backend` (or the `Auto` priority list).
    pub fn with_backend(backend: Backend) -> ComputeResult<Self> {
        Self::with_config(ContextConfig::from_env().backend(backend))
    }

    /// Tries `config.backends` in order.
    ///
    /// Unavailable backends are skipped; a backend that is available but
    /// fails to initialise is logged and the next one is tried. Fails with
    /// [`ComputeError::DeviceNotFound`] only when every candidate fails.
    pub fn with_config(config: ContextConfig) -> ComputeResult<Self> {
        for &backend in &config.backends {
            if !backend.is_available() {
                debug!(%backend, "backend not available, skipping");
                continue;
            }
            match Self::open(backend, &config) {
                Ok(ctx) => {
                    info!(%backend, device = ctx.device.name(), "compute context ready");
                    return Ok(ctx);
                }
                Err(e) => warn!(%backend, error = %e, "backend failed to initialise, trying next"),
            }
        }
        Err(ComputeError::DeviceNotFound)
    }

    fn open(backend: Backend, config: &ContextConfig) -> ComputeResult<Self> {
        let device = Device::with_config(backend, config)?;
        let queue = device.new_command_queue()?;
        let library = device.compile_library(INVERT_KERNEL)?;
        let invert = device.make_compute_pipeline(&library.function("invert_rgba")?)?;
        let converter = FrameConverter::new(&queue)?;
        Ok(Self { device, queue, invert, converter: Mutex::new(converter) })
    }

    pub fn backend(&self) -> Backend {
        self.device.backend()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Inverts the colour channels of a host RGBA `f32` image (alpha kept).
    pub fn invert(&self, src: &[f32], width: u32, height: u32) -> ComputeResult<Vec<f32>> {
        if width == 0 || height == 0 {
            return Err(ComputeError::InvalidDimensions(width, height));
        }
        let expected = width as usize * height as usize * 4;
        if src.len() != expected {
            return Err(ComputeError::BufferSizeMismatch { expected, actual: src.len() });
        }
        let buffer = self.device.new_buffer_with_data(bytemuck::cast_slice(src), StorageMode::Shared)?;
        self.invert_buffer(&buffer, width, height)?;
        let out = buffer.download()?.to_vec_of::<f32>();
        Ok(out)
    }

    /// Inverts a device buffer of packed RGBA `f32` in place.
    pub fn invert_buffer(&self, buffer: &Buffer, width: u32, height: u32) -> ComputeResult<()> {
        if width == 0 || height == 0 {
            return Err(ComputeError::InvalidDimensions(width, height));
        }
        let expected = width as usize * height as usize * SOURCE_BYTES_PER_PIXEL;
        if buffer.len() < expected {
            return Err(ComputeError::BufferSizeMismatch { expected, actual: buffer.len() });
        }
        let dims = [width, height, 0, 0];

        let mut cmd = self.queue.new_command_buffer()?;
        let mut enc = cmd.compute_encoder();
        enc.set_pipeline(&self.invert);
        enc.set_buffer(0, buffer, 0);
        enc.set_bytes(1, bytemuck::cast_slice(&dims));
        enc.dispatch(DispatchSize::covering(width, height, INVERT_GROUP), INVERT_GROUP);
        enc.end();
        cmd.commit().wait_until_completed()
    }

    /// Converts `source` into `output`. See [`FrameConverter`] for the
    /// residency-specific paths.
    pub fn convert_for_output(
        &self,
        source: SourceImage<'_>,
        output: &Buffer,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> ComputeResult<()> {
        let mut converter = self.converter.lock().unwrap_or_else(PoisonError::into_inner);
        converter.convert(source, output, width, height, format)
    }

    /// Copies the first `size` bytes of `src` into `dst` on the device.
    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer, size: usize) -> ComputeResult<()> {
        for buffer in [src, dst] {
            if size > buffer.len() || size % 4 != 0 {
                return Err(ComputeError::InvalidRange { offset: 0, end: size, len: buffer.len() });
            }
        }
        if src.ptr_eq(dst) {
            return Err(ComputeError::InvalidRange { offset: 0, end: size, len: dst.len() });
        }
        if size == 0 {
            return Ok(());
        }
        let mut cmd = self.queue.new_command_buffer()?;
        let mut blit = cmd.blit_encoder();
        blit.copy_buffer(src, 0, dst, 0, size);
        blit.end();
        cmd.commit().wait_until_completed()
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("backend", &self.backend())
            .field("device", &self.device.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_context() {
        let ctx = ComputeContext::with_config(ContextConfig::default().backend(Backend::Cpu)).unwrap();
        assert_eq!(ctx.backend(), Backend::Cpu);
        let out = ctx.invert(&[0.0, 0.25, 1.0, 0.5], 1, 1).unwrap();
        assert_eq!(out, vec![1.0, 0.75, 0.0, 0.5]);
    }

    #[test]
    fn test_skips_unavailable_backends() {
        let config = ContextConfig::default().backends([Backend::AlternateGpu, Backend::NativeGpu, Backend::Cpu]);
        let ctx = ComputeContext::with_config(config).unwrap();
        assert!(ctx.backend().is_available());
    }

    #[test]
    fn test_empty_priority_list() {
        let config = ContextConfig { backends: Vec::new(), ..ContextConfig::default() };
        assert!(matches!(ComputeContext::with_config(config), Err(ComputeError::DeviceNotFound)));
    }

    #[test]
    fn test_copy_buffer_range_checked() {
        let ctx = ComputeContext::with_backend(Backend::Cpu).unwrap();
        let a = ctx.device().new_buffer(8, StorageMode::Shared).unwrap();
        let b = ctx.device().new_buffer(4, StorageMode::Shared).unwrap();
        assert!(matches!(ctx.copy_buffer(&a, &b, 8), Err(ComputeError::InvalidRange { .. })));
    }
}
